//! Where a component's instances live between calls.
//!
//! The store variant follows the component kind: a bounded pool, a map of
//! session-affine instances keyed by [`SessionKey`], or a single shared slot.

mod pool;
mod session;
mod singleton;

use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::ContainerConfig;
use crate::descriptor::{ComponentDescriptor, ComponentKind};
use crate::error::{ContainerError, ContainerResult};
use crate::instance::{ComponentInstance, SessionKey};
use crate::lifecycle::LifecycleManager;
use crate::metrics::{EvictionReport, StoreStats};
use crate::timeout::Deadline;

use pool::InstancePool;
use session::SessionMap;
use singleton::SingletonSlot;

/// How an invocation ended, as far as its instance is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    /// Return the instance for reuse
    Success,
    /// System failure: the instance must never be used again
    Discard,
    /// A remove method completed: destroy the session
    RemoveSession,
}

pub(crate) enum InstanceStore {
    Pool(InstancePool),
    Sessions(SessionMap),
    Singleton(SingletonSlot),
}

impl InstanceStore {
    pub(crate) fn new(descriptor: &ComponentDescriptor, lifecycle: Arc<LifecycleManager>, defaults: &ContainerConfig) -> Self {
        let component = descriptor.name.clone();
        match descriptor.kind {
            ComponentKind::Pooled => {
                let config = descriptor.pool.clone().unwrap_or_else(|| defaults.pool.clone());
                InstanceStore::Pool(InstancePool::new(component, config, lifecycle))
            }
            ComponentKind::SessionAffine => {
                let config = descriptor.session.clone().unwrap_or_else(|| defaults.session.clone());
                InstanceStore::Sessions(SessionMap::new(component, config, lifecycle))
            }
            ComponentKind::Singleton => InstanceStore::Singleton(SingletonSlot::new(component, lifecycle)),
        }
    }

    /// Deploy-time work: pool prefill and eager singleton creation.
    pub(crate) fn initialize(&self, eager: bool) -> ContainerResult<()> {
        match self {
            InstanceStore::Pool(pool) => pool.prefill().map(|_| ()),
            InstanceStore::Singleton(slot) if eager => slot.initialize(),
            _ => Ok(()),
        }
    }

    /// Obtains an instance for one invocation. Pools and singletons ignore the
    /// session key; session-affine components require one.
    pub(crate) fn acquire(
        &self,
        component: &str,
        session: Option<&SessionKey>,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<Arc<ComponentInstance>> {
        match self {
            InstanceStore::Pool(pool) => pool.acquire(deadline, cancel),
            InstanceStore::Singleton(slot) => slot.acquire(deadline, cancel),
            InstanceStore::Sessions(map) => {
                let key = session.ok_or_else(|| ContainerError::MissingSessionKey(component.to_string()))?;
                map.acquire(key, deadline, cancel)
            }
        }
    }

    pub(crate) fn release(&self, instance: Arc<ComponentInstance>, outcome: ReleaseOutcome) {
        match self {
            InstanceStore::Pool(pool) => pool.release(instance, outcome),
            InstanceStore::Sessions(map) => map.release(instance, outcome),
            InstanceStore::Singleton(slot) => slot.release(instance, outcome),
        }
    }

    pub(crate) fn create_session(&self, component: &str, deadline: &Deadline) -> ContainerResult<SessionKey> {
        match self {
            InstanceStore::Sessions(map) => map.create(deadline),
            _ => Err(ContainerError::InvalidDescriptor {
                component: component.to_string(),
                reason: "sessions exist only for session-affine components".to_string(),
            }),
        }
    }

    pub(crate) fn remove_session(&self, component: &str, key: &SessionKey, deadline: &Deadline) -> ContainerResult<()> {
        match self {
            InstanceStore::Sessions(map) => map.remove(key, deadline),
            _ => Err(ContainerError::NoSuchSession {
                component: component.to_string(),
                key: key.to_string(),
            }),
        }
    }

    pub(crate) fn evict_idle(&self, older_than: Duration) -> EvictionReport {
        match self {
            InstanceStore::Pool(pool) => pool.evict_idle(older_than),
            InstanceStore::Sessions(map) => map.evict_idle(older_than),
            InstanceStore::Singleton(_) => EvictionReport::default(),
        }
    }

    /// Retires every pooled instance; other stores have nothing to flush.
    pub(crate) fn flush(&self) -> usize {
        match self {
            InstanceStore::Pool(pool) => pool.flush(),
            _ => 0,
        }
    }

    pub(crate) fn shutdown(&self) {
        match self {
            InstanceStore::Pool(pool) => pool.shutdown(),
            InstanceStore::Sessions(map) => map.shutdown(),
            InstanceStore::Singleton(slot) => slot.shutdown(),
        }
    }

    pub(crate) fn stats(&self) -> StoreStats {
        match self {
            InstanceStore::Pool(pool) => pool.stats(),
            InstanceStore::Sessions(map) => map.stats(),
            InstanceStore::Singleton(slot) => slot.stats(),
        }
    }
}
