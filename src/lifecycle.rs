//! Instance lifecycle: construction, passivation, activation and destruction.
//!
//! The [`LifecycleManager`] of a component is the only code that moves an
//! instance between states. Every user callback runs through a panic guard,
//! so a misbehaving bean can fail its own instance but never the container.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::InvocationContext;
use crate::descriptor::{Callback, ComponentDescriptor, LifecycleCallbacks, LifecycleTrigger, PassivationCodec};
use crate::error::{ContainerError, ContainerResult};
use crate::instance::{ComponentInstance, DestroyReason, InstanceId, InstanceState, SessionKey};
use crate::interceptor::{Interceptor, InvocationResult, Next};
use crate::internal::run_guarded;
use crate::metrics::{LifecycleCounters, LifecycleStats};
use crate::observer::{CallbackKind, Observers};

/// Serialized state of a passivated session instance.
pub struct PassivatedState {
    bytes: Vec<u8>,
    created_at: Instant,
    last_used: Instant,
    passivated_at: Instant,
}

impl PassivatedState {
    /// Serialized size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the serialized form is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Time spent out of memory.
    pub fn passivated_for(&self) -> Duration {
        self.passivated_at.elapsed()
    }

    /// Time since the session was last used, in or out of memory.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

impl fmt::Debug for PassivatedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassivatedState")
            .field("bytes", &self.bytes.len())
            .field("passivated_for", &self.passivated_for())
            .finish()
    }
}

/// Creates, passivates, activates and destroys instances of one component.
pub struct LifecycleManager {
    component: Arc<str>,
    callbacks: LifecycleCallbacks,
    codec: Option<PassivationCodec>,
    next_slot: AtomicU64,
    generation: AtomicU64,
    counters: LifecycleCounters,
    observers: Observers,
}

impl LifecycleManager {
    pub(crate) fn new(descriptor: &ComponentDescriptor, observers: Observers) -> Self {
        Self {
            component: descriptor.name.clone(),
            callbacks: descriptor.callbacks.clone(),
            codec: descriptor.passivation.clone(),
            next_slot: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            counters: LifecycleCounters::default(),
            observers,
        }
    }

    /// Component name.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Whether instances can be passivated.
    pub fn can_passivate(&self) -> bool {
        self.codec.is_some()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LifecycleStats {
        self.counters.snapshot()
    }

    pub(crate) fn next_pool_id(&self) -> InstanceId {
        InstanceId::Pooled(self.next_slot.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Invalidates every instance created so far; returns the new generation.
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Runs the factory and post-construct.
    ///
    /// # Errors
    ///
    /// [`ContainerError::ConstructionFailed`] when either step fails or panics.
    pub fn create(&self, id: InstanceId) -> ContainerResult<Arc<ComponentInstance>> {
        let factory = &self.callbacks.factory;
        let bean = run_guarded(|| factory())
            .map_err(|reason| self.construction_failed(CallbackKind::Factory, reason))?;

        if let Some(post_construct) = &self.callbacks.post_construct {
            run_guarded(|| post_construct(&*bean))
                .map_err(|reason| self.construction_failed(CallbackKind::PostConstruct, reason))?;
        }

        let instance = Arc::new(ComponentInstance::new(id, self.component.clone(), self.generation(), bean));
        LifecycleCounters::bump(&self.counters.created);
        self.observers.instance_created(&self.component, instance.id());
        tracing::debug!(component = %self.component, instance = %instance.id(), "instance created");
        Ok(instance)
    }

    fn construction_failed(&self, callback: CallbackKind, reason: String) -> ContainerError {
        LifecycleCounters::bump(&self.counters.construction_failures);
        self.observers.callback_failed(&self.component, callback, &reason);
        tracing::warn!(component = %self.component, ?callback, %reason, "construction failed");
        ContainerError::ConstructionFailed {
            component: self.component.to_string(),
            reason,
        }
    }

    /// Runs pre-destroy and marks the instance destroyed.
    ///
    /// Idempotent. Pre-destroy failures are logged and otherwise ignored.
    pub fn destroy(&self, instance: &ComponentInstance, reason: DestroyReason) {
        if instance.transition(InstanceState::Destroyed) == InstanceState::Destroyed {
            return;
        }
        if let Some(pre_destroy) = &self.callbacks.pre_destroy {
            self.run_best_effort(CallbackKind::PreDestroy, pre_destroy, instance);
        }
        self.record_destroyed(instance.id(), reason);
    }

    fn record_destroyed(&self, id: &InstanceId, reason: DestroyReason) {
        LifecycleCounters::bump(&self.counters.destroyed);
        if reason == DestroyReason::Discarded {
            LifecycleCounters::bump(&self.counters.discarded);
        }
        self.observers.instance_destroyed(&self.component, id, reason);
        tracing::debug!(component = %self.component, instance = %id, ?reason, "instance destroyed");
    }

    fn run_best_effort(&self, kind: CallbackKind, callback: &Callback, instance: &ComponentInstance) {
        if let Err(message) = run_guarded(|| callback(instance.bean())) {
            LifecycleCounters::bump(&self.counters.callback_failures);
            self.observers.callback_failed(&self.component, kind, &message);
            tracing::warn!(
                component = %self.component,
                instance = %instance.id(),
                callback = ?kind,
                %message,
                "lifecycle callback failed"
            );
        }
    }

    /// Runs pre-passivate and serializes the instance.
    ///
    /// On success the instance is marked `Passivated` and must be dropped by
    /// the caller. On failure the instance is destroyed.
    ///
    /// # Errors
    ///
    /// [`ContainerError::System`] describing the failed step.
    pub fn passivate(&self, instance: &ComponentInstance) -> ContainerResult<PassivatedState> {
        let Some(codec) = &self.codec else {
            return Err(ContainerError::system(&self.component, "passivate", "component is not passivation-capable"));
        };

        let frozen = run_guarded(|| {
            if let Some(pre_passivate) = &self.callbacks.pre_passivate {
                pre_passivate(instance.bean())?;
            }
            (codec.freeze)(instance.bean())
        });

        match frozen {
            Ok(bytes) => {
                instance.transition(InstanceState::Passivated);
                LifecycleCounters::bump(&self.counters.passivated);
                self.observers.instance_passivated(&self.component, instance.id());
                tracing::debug!(component = %self.component, instance = %instance.id(), bytes = bytes.len(), "instance passivated");
                let now = Instant::now();
                Ok(PassivatedState {
                    bytes,
                    created_at: instance.created_at(),
                    last_used: now.checked_sub(instance.idle_for()).unwrap_or(now),
                    passivated_at: now,
                })
            }
            Err(reason) => {
                LifecycleCounters::bump(&self.counters.callback_failures);
                self.observers.callback_failed(&self.component, CallbackKind::PrePassivate, &reason);
                tracing::warn!(component = %self.component, instance = %instance.id(), %reason, "passivation failed");
                self.destroy(instance, DestroyReason::PassivationFailed);
                Err(ContainerError::system(&self.component, "passivate", reason))
            }
        }
    }

    /// Restores a passivated instance and runs post-activate.
    ///
    /// # Errors
    ///
    /// [`ContainerError::ActivationFailed`]; the state is consumed and the
    /// session is gone.
    pub fn activate(&self, key: &SessionKey, state: PassivatedState) -> ContainerResult<Arc<ComponentInstance>> {
        let failed = |reason: String| ContainerError::ActivationFailed {
            component: self.component.to_string(),
            key: key.to_string(),
            reason,
        };
        let Some(codec) = &self.codec else {
            return Err(failed("component is not passivation-capable".to_string()));
        };

        let bean = match run_guarded(|| (codec.thaw)(&state.bytes)) {
            Ok(bean) => bean,
            Err(reason) => {
                self.activation_failed(key, &reason);
                return Err(failed(reason));
            }
        };

        let instance = Arc::new(ComponentInstance::restored(
            InstanceId::Session(key.clone()),
            self.component.clone(),
            self.generation(),
            bean,
            state.created_at,
        ));

        if let Some(post_activate) = &self.callbacks.post_activate {
            if let Err(reason) = run_guarded(|| post_activate(instance.bean())) {
                self.activation_failed(key, &reason);
                self.destroy(&instance, DestroyReason::Discarded);
                return Err(failed(reason));
            }
        }

        LifecycleCounters::bump(&self.counters.activated);
        self.observers.instance_activated(&self.component, instance.id());
        tracing::debug!(component = %self.component, instance = %instance.id(), "instance activated");
        Ok(instance)
    }

    fn activation_failed(&self, key: &SessionKey, reason: &str) {
        LifecycleCounters::bump(&self.counters.callback_failures);
        self.observers.callback_failed(&self.component, CallbackKind::PostActivate, reason);
        tracing::warn!(component = %self.component, session = %key, %reason, "activation failed");
    }

    /// Drops a passivated session without running any callback.
    pub fn discard_passivated(&self, key: &SessionKey, state: PassivatedState, reason: DestroyReason) {
        drop(state);
        self.record_destroyed(&InstanceId::Session(key.clone()), reason);
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("component", &self.component)
            .field("passivation", &self.codec.is_some())
            .field("generation", &self.generation())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Innermost layer of remove methods: asks for the session to be destroyed
/// once the call completes.
#[derive(Debug)]
pub(crate) struct LifecycleTriggerInterceptor {
    trigger: LifecycleTrigger,
}

impl LifecycleTriggerInterceptor {
    pub(crate) fn new(trigger: LifecycleTrigger) -> Self {
        Self { trigger }
    }
}

impl Interceptor for LifecycleTriggerInterceptor {
    fn name(&self) -> &str {
        "lifecycle-trigger"
    }

    fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let result = next.proceed(ctx);
        let LifecycleTrigger::Remove { retain_if_exception } = self.trigger;
        let remove = match &result {
            Ok(_) => true,
            Err(ContainerError::Business(_)) => !retain_if_exception,
            // Other failures discard the instance on their own.
            Err(_) => false,
        };
        if remove {
            ctx.request_remove();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusinessError;
    use crate::interceptor::InterceptorChain;
    use crate::context::Payload;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct Cart {
        items: u32,
    }

    fn manager(descriptor: ComponentDescriptor) -> LifecycleManager {
        LifecycleManager::new(&descriptor, Observers::new())
    }

    #[test]
    fn create_runs_post_construct() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let seen = constructed.clone();
        let lm = manager(
            ComponentDescriptor::pooled("Cart", || Cart { items: 0 })
                .post_construct(move |_: &Cart| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .build(),
        );

        let instance = lm.create(lm.next_pool_id()).unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        assert_eq!(instance.id(), &InstanceId::Pooled(1));
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert_eq!(lm.stats().created, 1);
    }

    #[test]
    fn construction_failures_are_classified() {
        let lm = manager(
            ComponentDescriptor::pooled("Cart", || Cart { items: 0 })
                .post_construct(|_: &Cart| Err("no database".to_string()))
                .build(),
        );
        let err = lm.create(lm.next_pool_id()).unwrap_err();
        assert!(matches!(err, ContainerError::ConstructionFailed { ref reason, .. } if reason == "no database"));

        let panicking = manager(
            ComponentDescriptor::pooled("Boom", || -> Cart { panic!("factory exploded") }).build(),
        );
        let err = panicking.create(panicking.next_pool_id()).unwrap_err();
        assert!(err.to_string().contains("factory exploded"));
        assert_eq!(panicking.stats().construction_failures, 1);
    }

    #[test]
    fn destroy_is_idempotent_and_tolerates_failing_callbacks() {
        let lm = manager(
            ComponentDescriptor::pooled("Cart", || Cart { items: 0 })
                .pre_destroy(|_: &Cart| Err("close failed".to_string()))
                .build(),
        );
        let instance = lm.create(lm.next_pool_id()).unwrap();
        lm.destroy(&instance, DestroyReason::Shutdown);
        lm.destroy(&instance, DestroyReason::Shutdown);

        assert_eq!(instance.state(), InstanceState::Destroyed);
        let stats = lm.stats();
        assert_eq!(stats.destroyed, 1);
        assert_eq!(stats.callback_failures, 1);
    }

    fn passivating(descriptor: crate::descriptor::DescriptorBuilder<Cart>) -> LifecycleManager {
        manager(
            descriptor
                .passivation(
                    |cart: &Cart| Ok(cart.items.to_le_bytes().to_vec()),
                    |bytes: &[u8]| {
                        let raw: [u8; 4] = bytes.try_into().map_err(|_| "truncated state".to_string())?;
                        Ok(Cart { items: u32::from_le_bytes(raw) })
                    },
                )
                .build(),
        )
    }

    #[test]
    fn passivate_then_activate_restores_state() {
        let lm = passivating(ComponentDescriptor::session("Cart", || Cart { items: 3 }));
        let key = SessionKey::new("s-1");
        let instance = lm.create(InstanceId::Session(key.clone())).unwrap();

        let state = lm.passivate(&instance).unwrap();
        assert_eq!(instance.state(), InstanceState::Passivated);
        assert_eq!(state.len(), 4);

        let restored = lm.activate(&key, state).unwrap();
        assert_eq!(restored.bean_as::<Cart>(), Some(&Cart { items: 3 }));
        assert_eq!(restored.id(), &InstanceId::Session(key));
        assert_eq!(lm.stats().activated, 1);
    }

    #[test]
    fn passivation_failure_destroys_instance() {
        let lm = passivating(
            ComponentDescriptor::session("Cart", || Cart { items: 1 })
                .pre_passivate(|_: &Cart| Err("socket still open".to_string())),
        );
        let instance = lm.create(InstanceId::Session(SessionKey::new("s"))).unwrap();

        assert!(lm.passivate(&instance).is_err());
        assert_eq!(instance.state(), InstanceState::Destroyed);
        assert_eq!(lm.stats().destroyed, 1);
    }

    #[test]
    fn activation_failure_surfaces() {
        let lm = passivating(
            ComponentDescriptor::session("Cart", || Cart { items: 1 })
                .post_activate(|_: &Cart| Err("stale".to_string())),
        );
        let key = SessionKey::new("s");
        let instance = lm.create(InstanceId::Session(key.clone())).unwrap();
        let state = lm.passivate(&instance).unwrap();

        let err = lm.activate(&key, state).unwrap_err();
        assert!(matches!(err, ContainerError::ActivationFailed { ref reason, .. } if reason == "stale"));
    }

    #[test]
    fn remove_trigger_respects_retain_if_exception() {
        let run = |retain: bool, fail: bool| {
            let chain = InterceptorChain::new(move |_ctx| {
                if fail {
                    Err(BusinessError::new("E", "nope").into())
                } else {
                    Ok(Payload::empty())
                }
            })
            .layer(Arc::new(LifecycleTriggerInterceptor::new(LifecycleTrigger::Remove {
                retain_if_exception: retain,
            })));
            let mut ctx = InvocationContext::detached("Cart", "checkout");
            let _ = chain.invoke(&mut ctx);
            ctx.remove_requested()
        };

        assert!(run(false, false));
        assert!(run(true, false));
        assert!(run(false, true));
        assert!(!run(true, true));
    }
}
