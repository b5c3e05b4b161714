//! The container: deployment and invocation dispatch.
//!
//! Every call follows the same path: resolve the component and method,
//! acquire an instance from the store, run the method's interceptor chain
//! (whose outermost layer takes the instance lock), then hand the instance
//! back with the call's outcome. The instance is always acquired before the
//! lock, never the other way around.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::ContainerConfig;
use crate::context::{Invocation, InvocationContext};
use crate::descriptor::{BusinessMethod, ComponentDescriptor, ComponentKind, MethodSpec};
use crate::error::{ContainerError, ContainerResult, MethodError};
use crate::guard::ConcurrencyGuard;
use crate::instance::SessionKey;
use crate::interceptor::{ConcurrencyInterceptor, InterceptorChain, InvocationResult, Target};
use crate::lifecycle::{LifecycleManager, LifecycleTriggerInterceptor};
use crate::metrics::{ComponentStats, ContainerStats, EvictionReport, InvocationMetrics, ShutdownReport};
use crate::observer::{ContainerObserver, Observers, TracingObserver};
use crate::store::{InstanceStore, ReleaseOutcome};
use crate::timeout::{AccessTimeout, Deadline};
use crate::transaction::{LocalTransactionPolicy, TransactionInterceptor, TransactionPolicy};

/// Builder for a [`Container`].
///
/// ```
/// use ferrous_container::{ComponentDescriptor, Container, ContainerConfig};
///
/// let container = Container::builder()
///     .config(ContainerConfig::default())
///     .with_tracing()
///     .deploy(ComponentDescriptor::singleton("Clock", || 42u64)
///         .method("now", |bean: &u64, _ctx| Ok(*bean))
///         .build())
///     .build()
///     .unwrap();
///
/// let now = container.dispatch("Clock", "now", None, ()).unwrap();
/// assert_eq!(now.downcast_ref::<u64>(), Some(&42));
/// ```
#[derive(Default)]
pub struct ContainerBuilder {
    config: ContainerConfig,
    policy: Option<Arc<dyn TransactionPolicy>>,
    observers: Observers,
    descriptors: Vec<ComponentDescriptor>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Container-wide defaults.
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    /// Transaction manager used by every transaction layer.
    pub fn transaction_policy(mut self, policy: Arc<dyn TransactionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Registers an observer.
    pub fn observer(mut self, observer: Arc<dyn ContainerObserver>) -> Self {
        self.observers.add(observer);
        self
    }

    /// Registers a [`TracingObserver`].
    pub fn with_tracing(self) -> Self {
        self.observer(Arc::new(TracingObserver::new()))
    }

    /// Queues a component for deployment at build time.
    pub fn deploy(mut self, descriptor: ComponentDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Builds the container and deploys the queued components in order.
    ///
    /// # Errors
    ///
    /// The first deployment failure; components deployed before it are shut down.
    pub fn build(self) -> ContainerResult<Container> {
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(LocalTransactionPolicy::new()));
        let container = Container {
            inner: Arc::new(ContainerInner {
                config: self.config,
                policy,
                observers: self.observers,
                components: RwLock::new(AHashMap::new()),
                closed: AtomicBool::new(false),
                in_flight: Mutex::new(0),
                drained: Condvar::new(),
            }),
        };
        for descriptor in self.descriptors {
            if let Err(err) = container.deploy(descriptor) {
                container.shutdown();
                return Err(err);
            }
        }
        Ok(container)
    }
}

/// Hosts deployed components and dispatches calls to them.
///
/// Cheap to clone; clones share the same deployments.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    config: ContainerConfig,
    policy: Arc<dyn TransactionPolicy>,
    observers: Observers,
    components: RwLock<AHashMap<Arc<str>, Arc<Deployment>>>,
    closed: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

/// A deployed component: its store, lifecycle manager and method chains.
struct Deployment {
    name: Arc<str>,
    kind: ComponentKind,
    access_timeout: Option<AccessTimeout>,
    methods: AHashMap<Arc<str>, MethodEntry>,
    lifecycle: Arc<LifecycleManager>,
    store: InstanceStore,
    metrics: InvocationMetrics,
}

struct MethodEntry {
    name: Arc<str>,
    access_timeout: Option<AccessTimeout>,
    chain: InterceptorChain,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a> {
    inner: &'a ContainerInner,
}

impl<'a> InFlight<'a> {
    fn enter(inner: &'a ContainerInner) -> ContainerResult<Self> {
        let mut count = inner.in_flight.lock();
        if inner.closed.load(Ordering::Acquire) {
            return Err(ContainerError::ShutDown);
        }
        *count += 1;
        Ok(Self { inner })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.inner.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.inner.drained.notify_all();
        }
    }
}

fn target_for(method: BusinessMethod) -> Target {
    Arc::new(move |ctx: &mut InvocationContext| {
        let Some(instance) = ctx.instance().cloned() else {
            return Err(ContainerError::system(ctx.component(), ctx.method(), "no instance bound to the call"));
        };
        method(instance.bean(), ctx).map_err(|err| match err {
            MethodError::Business(business) => ContainerError::Business(business),
            MethodError::System(reason) => ContainerError::system(ctx.component(), ctx.method(), reason),
        })
    })
}

impl Deployment {
    fn new(descriptor: &ComponentDescriptor, inner: &ContainerInner) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(descriptor, inner.observers.clone()));
        let guard = ConcurrencyGuard::new(descriptor.name.clone(), descriptor.kind, descriptor.concurrency);

        let methods = descriptor
            .methods
            .iter()
            .map(|(spec, method)| {
                let entry = MethodEntry {
                    name: spec.name.clone(),
                    access_timeout: spec.access_timeout,
                    chain: Self::chain(descriptor, spec, method.clone(), &guard, &inner.policy),
                };
                (spec.name.clone(), entry)
            })
            .collect();

        Self {
            name: descriptor.name.clone(),
            kind: descriptor.kind,
            access_timeout: descriptor.access_timeout,
            methods,
            store: InstanceStore::new(descriptor, Arc::clone(&lifecycle), &inner.config),
            lifecycle,
            metrics: InvocationMetrics::default(),
        }
    }

    /// Outer to inner: concurrency, transaction, class interceptors, method
    /// interceptors, lifecycle trigger, target.
    fn chain(
        descriptor: &ComponentDescriptor,
        spec: &MethodSpec,
        method: BusinessMethod,
        guard: &ConcurrencyGuard,
        policy: &Arc<dyn TransactionPolicy>,
    ) -> InterceptorChain {
        let mut chain = InterceptorChain::with_target(target_for(method))
            .layer(Arc::new(ConcurrencyInterceptor::new(guard.clone(), spec.lock)))
            .layer(Arc::new(TransactionInterceptor::new(spec.transaction, Arc::clone(policy))));
        if !spec.exclude_class_interceptors {
            for interceptor in &descriptor.class_interceptors {
                chain = chain.layer(Arc::clone(interceptor));
            }
        }
        for interceptor in &spec.interceptors {
            chain = chain.layer(Arc::clone(interceptor));
        }
        if let Some(trigger) = spec.trigger {
            chain = chain.layer(Arc::new(LifecycleTriggerInterceptor::new(trigger)));
        }
        chain
    }

    fn execute(&self, entry: &MethodEntry, invocation: Invocation, deadline: Deadline) -> InvocationResult {
        let instance = self.store.acquire(
            &self.name,
            invocation.session.as_ref(),
            &deadline,
            invocation.cancellation.as_ref(),
        )?;

        let mut ctx = InvocationContext::new(
            self.name.clone(),
            entry.name.clone(),
            invocation,
            Arc::clone(&instance),
            deadline,
        );
        let result = entry.chain.invoke(&mut ctx);

        let outcome = match &result {
            Err(err) if err.discards_instance() => {
                tracing::warn!(component = %self.name, instance = %instance.id(), error = %err, "discarding instance");
                ReleaseOutcome::Discard
            }
            _ if ctx.remove_requested() => ReleaseOutcome::RemoveSession,
            _ => ReleaseOutcome::Success,
        };
        drop(ctx);
        self.store.release(instance, outcome);
        result
    }

    fn stats(&self) -> ComponentStats {
        let (invocations, methods) = self.metrics.snapshot();
        ComponentStats {
            name: self.name.to_string(),
            kind: self.kind,
            invocations,
            lifecycle: self.lifecycle.stats(),
            store: self.store.stats(),
            methods,
        }
    }
}

impl Container {
    /// Starts a [`ContainerBuilder`].
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// An empty container with the given configuration and no observers.
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                config,
                policy: Arc::new(LocalTransactionPolicy::new()),
                observers: Observers::new(),
                components: RwLock::new(AHashMap::new()),
                closed: AtomicBool::new(false),
                in_flight: Mutex::new(0),
                drained: Condvar::new(),
            }),
        }
    }

    /// Container-wide defaults in effect.
    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    fn deployment(&self, component: &str) -> ContainerResult<Arc<Deployment>> {
        self.inner
            .components
            .read()
            .get(component)
            .cloned()
            .ok_or_else(|| ContainerError::NotDeployed(component.to_string()))
    }

    fn default_deadline(&self, deployment: &Deployment) -> Deadline {
        deployment
            .access_timeout
            .unwrap_or(self.inner.config.default_access_timeout)
            .deadline()
    }

    /// Validates and deploys a component.
    ///
    /// Pools are prefilled to their minimum and eager singletons are created
    /// before the component becomes callable.
    ///
    /// # Errors
    ///
    /// [`ContainerError::InvalidDescriptor`], [`ContainerError::AlreadyDeployed`],
    /// or the construction failure of a prefilled instance.
    pub fn deploy(&self, descriptor: ComponentDescriptor) -> ContainerResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ContainerError::ShutDown);
        }
        descriptor.validate()?;
        self.inner
            .config
            .validate()
            .map_err(|err| ContainerError::InvalidDescriptor {
                component: descriptor.name().to_string(),
                reason: err.to_string(),
            })?;
        if self.inner.components.read().contains_key(descriptor.name()) {
            return Err(ContainerError::AlreadyDeployed(descriptor.name().to_string()));
        }

        let deployment = Arc::new(Deployment::new(&descriptor, &self.inner));
        if let Err(err) = deployment.store.initialize(descriptor.eager) {
            deployment.store.shutdown();
            return Err(err);
        }

        let mut components = self.inner.components.write();
        if components.contains_key(descriptor.name()) {
            drop(components);
            deployment.store.shutdown();
            return Err(ContainerError::AlreadyDeployed(descriptor.name().to_string()));
        }
        components.insert(descriptor.name.clone(), deployment);
        tracing::info!(
            component = descriptor.name(),
            kind = ?descriptor.kind(),
            methods = descriptor.methods.len(),
            "component deployed"
        );
        Ok(())
    }

    /// Removes a component and destroys its instances. Calls already running
    /// finish; their instances are destroyed when handed back.
    pub fn undeploy(&self, component: &str) -> ContainerResult<()> {
        let deployment = self
            .inner
            .components
            .write()
            .remove(component)
            .ok_or_else(|| ContainerError::NotDeployed(component.to_string()))?;
        deployment.store.shutdown();
        tracing::info!(component, "component undeployed");
        Ok(())
    }

    /// Whether a component with this name is deployed.
    pub fn is_deployed(&self, component: &str) -> bool {
        self.inner.components.read().contains_key(component)
    }

    /// Deployed component names, sorted.
    pub fn component_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.components.read().keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    /// Calls `component.method` with `args`.
    ///
    /// Session-affine components need a `session` key; others ignore it.
    pub fn dispatch<A>(&self, component: &str, method: &str, session: Option<&SessionKey>, args: A) -> InvocationResult
    where
        A: Any + Send,
    {
        let mut invocation = Invocation::new(component, method).with_args(args);
        if let Some(key) = session {
            invocation = invocation.with_session(key.clone());
        }
        self.invoke(invocation)
    }

    /// Runs a fully specified invocation.
    ///
    /// The access timeout is taken from the invocation, else the method, else
    /// the component, else the container default. One deadline covers both the
    /// instance wait and the lock wait.
    pub fn invoke(&self, invocation: Invocation) -> InvocationResult {
        let _flight = InFlight::enter(&self.inner)?;
        let deployment = self.deployment(invocation.component())?;
        let Some(entry) = deployment.methods.get(invocation.method()) else {
            return Err(ContainerError::NoSuchMethod {
                component: invocation.component().to_string(),
                method: invocation.method().to_string(),
            });
        };

        let span = tracing::debug_span!("dispatch", component = %deployment.name, method = %entry.name);
        let _enter = span.enter();

        let timeout = invocation
            .timeout
            .or(entry.access_timeout)
            .or(deployment.access_timeout)
            .unwrap_or(self.inner.config.default_access_timeout);

        deployment.metrics.started();
        self.inner.observers.invocation_started(&deployment.name, &entry.name);
        let started = Instant::now();

        let result = deployment.execute(entry, invocation, timeout.deadline());

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => {
                deployment.metrics.succeeded(&entry.name, elapsed);
                self.inner.observers.invocation_completed(&deployment.name, &entry.name, elapsed);
            }
            Err(err) => {
                deployment.metrics.failed(&entry.name, err.kind(), elapsed);
                self.inner
                    .observers
                    .invocation_failed(&deployment.name, &entry.name, err.kind(), elapsed);
                tracing::debug!(error = %err, ?elapsed, "invocation failed");
            }
        }
        result
    }

    /// Runs an invocation on tokio's blocking pool.
    #[cfg(feature = "async")]
    pub async fn dispatch_async(&self, invocation: Invocation) -> InvocationResult {
        let container = self.clone();
        let component = invocation.component().to_string();
        let method = invocation.method().to_string();
        match tokio::task::spawn_blocking(move || container.invoke(invocation)).await {
            Ok(result) => result,
            Err(join) => Err(ContainerError::system(&component, &method, join.to_string())),
        }
    }

    /// Creates a session of a session-affine component under a fresh key.
    pub fn create_session(&self, component: &str) -> ContainerResult<SessionKey> {
        let _flight = InFlight::enter(&self.inner)?;
        let deployment = self.deployment(component)?;
        let key = deployment
            .store
            .create_session(&deployment.name, &self.default_deadline(&deployment))?;
        tracing::debug!(component, session = %key, "session created");
        Ok(key)
    }

    /// Destroys a session, running pre-destroy even if it was passivated.
    pub fn remove_session(&self, component: &str, key: &SessionKey) -> ContainerResult<()> {
        let _flight = InFlight::enter(&self.inner)?;
        let deployment = self.deployment(component)?;
        deployment
            .store
            .remove_session(&deployment.name, key, &self.default_deadline(&deployment))
    }

    /// Sweeps every component: destroys idle and aged pooled instances,
    /// expires sessions past their timeout and passivates sessions idle for
    /// at least `older_than`.
    pub fn evict_idle(&self, older_than: Duration) -> EvictionReport {
        let Ok(_flight) = InFlight::enter(&self.inner) else {
            return EvictionReport::default();
        };
        let deployments: Vec<Arc<Deployment>> = self.inner.components.read().values().cloned().collect();
        let mut report = EvictionReport::default();
        for deployment in deployments {
            report.merge(deployment.store.evict_idle(older_than));
        }
        if report.total() > 0 {
            tracing::debug!(?report, "idle sweep");
        }
        report
    }

    /// Retires every instance of a pooled component; returns the idle ones destroyed.
    pub fn flush(&self, component: &str) -> ContainerResult<usize> {
        let _flight = InFlight::enter(&self.inner)?;
        Ok(self.deployment(component)?.store.flush())
    }

    /// Snapshot of one component.
    pub fn component_stats(&self, component: &str) -> ContainerResult<ComponentStats> {
        Ok(self.deployment(component)?.stats())
    }

    /// Snapshot of every component, sorted by name.
    pub fn stats(&self) -> ContainerStats {
        let deployments: Vec<Arc<Deployment>> = self.inner.components.read().values().cloned().collect();
        let mut components: Vec<ComponentStats> = deployments.iter().map(|d| d.stats()).collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        ContainerStats { components }
    }

    /// Whether [`Container::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Refuses new calls, waits up to the drain timeout for running calls,
    /// then destroys every instance of every component.
    ///
    /// Calls still running after the drain timeout keep their instances until
    /// they return; those instances are destroyed on release.
    pub fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let abandoned_calls = {
            let mut count = self.inner.in_flight.lock();
            self.inner.closed.store(true, Ordering::Release);
            let drain_until = started + self.inner.config.drain_timeout;
            while *count > 0 {
                if self.inner.drained.wait_until(&mut count, drain_until).timed_out() {
                    break;
                }
            }
            *count
        };
        let drained_in = started.elapsed();

        let deployments: Vec<Arc<Deployment>> = self.inner.components.write().drain().map(|(_, d)| d).collect();
        let mut report = ShutdownReport {
            components: deployments.len(),
            abandoned_calls,
            drained_in,
            ..ShutdownReport::default()
        };
        for deployment in deployments {
            let passivated = deployment.store.stats().passivated;
            let before = deployment.lifecycle.stats().destroyed;
            deployment.store.shutdown();
            let destroyed = (deployment.lifecycle.stats().destroyed - before) as usize;
            report.passivated_dropped += passivated;
            report.destroyed += destroyed.saturating_sub(passivated);
        }

        if abandoned_calls > 0 {
            tracing::warn!(abandoned_calls, "shutdown drain timed out with calls still running");
        }
        tracing::info!(?report, "container shut down");
        report
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("components", &self.component_names())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
