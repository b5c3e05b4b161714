//! Component descriptors: the immutable deployment-time description of a
//! component, including its typed callback and method table.
//!
//! Callbacks and business methods are registered once, as typed closures,
//! and erased into function references. Dispatch never looks anything up
//! by reflection; it only calls through these references.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{InvocationContext, Payload};
use crate::error::{ContainerError, ContainerResult, MethodError};
use crate::guard::LockType;
use crate::instance::{Bean, BeanBox};
use crate::interceptor::{FnInterceptor, Interceptor, Next, InvocationResult};
use crate::timeout::AccessTimeout;
use crate::transaction::TransactionAttribute;

/// How instances of a component are stored and handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// No client-visible identity; any free instance serves any call
    Pooled,
    /// A client-visible session key always routes to the same instance
    SessionAffine,
    /// One instance for the whole container lifetime
    Singleton,
}

/// Declared concurrency mode of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyMode {
    /// Calls take the write lock unless a method is hinted `Read`
    #[default]
    Exclusive,
    /// Calls take the read lock unless a method is hinted `Write`
    Concurrent,
}

/// Pool sizing and retirement policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Instances kept alive even when idle
    pub min: usize,
    /// Upper bound on live instances
    pub max: usize,
    /// Block at `max` (true) or create surplus instances that are destroyed on release
    pub strict: bool,
    /// Instances older than this are retired on release or sweep
    pub max_age: Option<Duration>,
    /// Idle threshold used by sweeps instead of the sweep argument
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            strict: true,
            max_age: None,
            idle_timeout: None,
        }
    }
}

impl PoolConfig {
    /// A strict pool with the given bounds.
    pub fn bounded(min: usize, max: usize) -> Self {
        Self { min, max, ..Self::default() }
    }
}

/// Session map capacity and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of in-memory (non-passivated) sessions
    pub max_active: usize,
    /// Sessions idle for longer are destroyed by sweeps
    pub timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active: 1_000,
            timeout: None,
        }
    }
}

/// Marks a business method as triggering an instance lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTrigger {
    /// Destroys the session after the call completes
    Remove {
        /// Keep the session when the call ends in a business failure
        retain_if_exception: bool,
    },
}

/// Per-method declarations.
#[derive(Clone)]
pub struct MethodSpec {
    pub(crate) name: Arc<str>,
    pub(crate) lock: Option<LockType>,
    pub(crate) access_timeout: Option<AccessTimeout>,
    pub(crate) transaction: TransactionAttribute,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) exclude_class_interceptors: bool,
    pub(crate) trigger: Option<LifecycleTrigger>,
}

impl MethodSpec {
    /// A method with default declarations.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            lock: None,
            access_timeout: None,
            transaction: TransactionAttribute::default(),
            interceptors: Vec::new(),
            exclude_class_interceptors: false,
            trigger: None,
        }
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock hint.
    pub fn lock(mut self, lock: LockType) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Shorthand for a `Read` lock hint.
    pub fn read_locked(self) -> Self {
        self.lock(LockType::Read)
    }

    /// Shorthand for a `Write` lock hint.
    pub fn write_locked(self) -> Self {
        self.lock(LockType::Write)
    }

    /// Overrides the component's access timeout for this method.
    pub fn access_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.access_timeout = Some(timeout);
        self
    }

    /// Transaction attribute.
    pub fn transaction(mut self, attribute: TransactionAttribute) -> Self {
        self.transaction = attribute;
        self
    }

    /// Appends a method-level interceptor.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Skips the component's class-level interceptors for this method.
    pub fn exclude_class_interceptors(mut self) -> Self {
        self.exclude_class_interceptors = true;
        self
    }

    /// Marks the method as a remove method of a session-affine component.
    pub fn removes_session(mut self, retain_if_exception: bool) -> Self {
        self.trigger = Some(LifecycleTrigger::Remove { retain_if_exception });
        self
    }
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("name", &self.name)
            .field("lock", &self.lock)
            .field("access_timeout", &self.access_timeout)
            .field("transaction", &self.transaction)
            .field("interceptors", &self.interceptors.len())
            .field("exclude_class_interceptors", &self.exclude_class_interceptors)
            .field("trigger", &self.trigger)
            .finish()
    }
}

pub(crate) type Factory = Arc<dyn Fn() -> Result<BeanBox, String> + Send + Sync>;
pub(crate) type Callback = Arc<dyn Fn(&Bean) -> Result<(), String> + Send + Sync>;
pub(crate) type BusinessMethod =
    Arc<dyn Fn(&Bean, &mut InvocationContext) -> Result<Payload, MethodError> + Send + Sync>;
pub(crate) type Freeze = Arc<dyn Fn(&Bean) -> Result<Vec<u8>, String> + Send + Sync>;
pub(crate) type Thaw = Arc<dyn Fn(&[u8]) -> Result<BeanBox, String> + Send + Sync>;

/// Lifecycle callback function table of a component.
#[derive(Clone)]
pub struct LifecycleCallbacks {
    pub(crate) factory: Factory,
    pub(crate) post_construct: Option<Callback>,
    pub(crate) pre_destroy: Option<Callback>,
    pub(crate) pre_passivate: Option<Callback>,
    pub(crate) post_activate: Option<Callback>,
}

/// Serializes a bean out of memory and back.
#[derive(Clone)]
pub struct PassivationCodec {
    pub(crate) freeze: Freeze,
    pub(crate) thaw: Thaw,
}

/// Immutable description of a deployed component.
///
/// Built with [`ComponentDescriptor::pooled`], [`ComponentDescriptor::session`]
/// or [`ComponentDescriptor::singleton`]:
///
/// ```
/// use ferrous_container::{ComponentDescriptor, MethodSpec, PoolConfig};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// #[derive(Default)]
/// struct Counter { hits: AtomicU64 }
///
/// let descriptor = ComponentDescriptor::pooled("Counter", Counter::default)
///     .pool(PoolConfig::bounded(1, 4))
///     .method("hit", |bean: &Counter, _ctx| Ok(bean.hits.fetch_add(1, Ordering::SeqCst) + 1))
///     .method_spec(MethodSpec::new("peek").read_locked(), |bean: &Counter, _ctx| {
///         Ok(bean.hits.load(Ordering::SeqCst))
///     })
///     .build();
///
/// assert_eq!(descriptor.name(), "Counter");
/// assert!(descriptor.method("hit").is_some());
/// ```
#[derive(Clone)]
pub struct ComponentDescriptor {
    pub(crate) name: Arc<str>,
    pub(crate) kind: ComponentKind,
    pub(crate) concurrency: ConcurrencyMode,
    pub(crate) access_timeout: Option<AccessTimeout>,
    pub(crate) pool: Option<PoolConfig>,
    pub(crate) session: Option<SessionConfig>,
    pub(crate) eager: bool,
    pub(crate) class_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) methods: Vec<(MethodSpec, BusinessMethod)>,
    pub(crate) callbacks: LifecycleCallbacks,
    pub(crate) passivation: Option<PassivationCodec>,
}

impl ComponentDescriptor {
    /// Starts a pooled component.
    pub fn pooled<T, F>(name: impl AsRef<str>, factory: F) -> DescriptorBuilder<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        DescriptorBuilder::new(name, ComponentKind::Pooled, move || Ok(factory()))
    }

    /// Starts a session-affine component.
    pub fn session<T, F>(name: impl AsRef<str>, factory: F) -> DescriptorBuilder<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        DescriptorBuilder::new(name, ComponentKind::SessionAffine, move || Ok(factory()))
    }

    /// Starts a singleton component.
    pub fn singleton<T, F>(name: impl AsRef<str>, factory: F) -> DescriptorBuilder<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        DescriptorBuilder::new(name, ComponentKind::Singleton, move || Ok(factory()))
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Component kind.
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Declared concurrency mode.
    pub fn concurrency(&self) -> ConcurrencyMode {
        self.concurrency
    }

    /// Declared default access timeout, if any.
    pub fn access_timeout(&self) -> Option<AccessTimeout> {
        self.access_timeout
    }

    /// Declared method spec by name.
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().map(|(spec, _)| spec).find(|spec| &*spec.name == name)
    }

    /// Declared method names in registration order.
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(spec, _)| &*spec.name)
    }

    /// Whether instances can be passivated.
    pub fn supports_passivation(&self) -> bool {
        self.passivation.is_some()
    }

    /// Checks the descriptor for contradictions.
    ///
    /// # Errors
    ///
    /// [`ContainerError::InvalidDescriptor`] naming the first problem found.
    pub fn validate(&self) -> ContainerResult<()> {
        let invalid = |reason: String| ContainerError::InvalidDescriptor {
            component: self.name.to_string(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("empty component name".to_string()));
        }
        if let Some(pool) = &self.pool {
            if pool.max == 0 {
                return Err(invalid("pool max must be at least 1".to_string()));
            }
            if pool.min > pool.max {
                return Err(invalid(format!("pool min {} exceeds max {}", pool.min, pool.max)));
            }
            if let (Some(age), Some(idle)) = (pool.max_age, pool.idle_timeout) {
                if idle > age {
                    return Err(invalid(format!("idle timeout {:?} exceeds max age {:?}", idle, age)));
                }
            }
        }
        if let Some(session) = &self.session {
            if session.max_active == 0 {
                return Err(invalid("session max must be at least 1".to_string()));
            }
        }
        if self.passivation.is_some() && self.kind != ComponentKind::SessionAffine {
            return Err(invalid("only session-affine components can be passivated".to_string()));
        }

        for (index, (spec, _)) in self.methods.iter().enumerate() {
            if self.methods[..index].iter().any(|(earlier, _)| earlier.name == spec.name) {
                return Err(invalid(format!("method {} declared twice", spec.name)));
            }
            if spec.trigger.is_some() && self.kind != ComponentKind::SessionAffine {
                return Err(invalid(format!(
                    "remove method {} on a component without sessions",
                    spec.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("concurrency", &self.concurrency)
            .field("access_timeout", &self.access_timeout)
            .field("pool", &self.pool)
            .field("session", &self.session)
            .field("eager", &self.eager)
            .field("class_interceptors", &self.class_interceptors)
            .field("methods", &self.methods.iter().map(|(spec, _)| spec).collect::<Vec<_>>())
            .field("passivation", &self.passivation.is_some())
            .finish()
    }
}

/// Typed builder for [`ComponentDescriptor`].
///
/// Every closure registered here receives the concrete bean type `T`; the
/// builder erases it once, at build time.
pub struct DescriptorBuilder<T> {
    descriptor: ComponentDescriptor,
    _bean: PhantomData<fn() -> T>,
}

fn typed<T: Any>(bean: &Bean) -> Result<&T, String> {
    bean.downcast_ref::<T>()
        .ok_or_else(|| format!("bean is not a {}", std::any::type_name::<T>()))
}

fn erase_callback<T, F>(f: F) -> Callback
where
    T: Any + Send + Sync,
    F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(move |bean: &Bean| f(typed::<T>(bean)?))
}

impl<T> DescriptorBuilder<T>
where
    T: Any + Send + Sync,
{
    /// Starts a descriptor with a fallible factory.
    pub fn new<F>(name: impl AsRef<str>, kind: ComponentKind, factory: F) -> Self
    where
        F: Fn() -> Result<T, String> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || factory().map(|bean| Box::new(bean) as BeanBox));
        Self {
            descriptor: ComponentDescriptor {
                name: Arc::from(name.as_ref()),
                kind,
                concurrency: ConcurrencyMode::default(),
                access_timeout: None,
                pool: None,
                session: None,
                eager: false,
                class_interceptors: Vec::new(),
                methods: Vec::new(),
                callbacks: LifecycleCallbacks {
                    factory,
                    post_construct: None,
                    pre_destroy: None,
                    pre_passivate: None,
                    post_activate: None,
                },
                passivation: None,
            },
            _bean: PhantomData,
        }
    }

    /// Declared concurrency mode.
    pub fn concurrency(mut self, mode: ConcurrencyMode) -> Self {
        self.descriptor.concurrency = mode;
        self
    }

    /// Default access timeout for all methods.
    pub fn access_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.descriptor.access_timeout = Some(timeout);
        self
    }

    /// Pool bounds (pooled components).
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.descriptor.pool = Some(config);
        self
    }

    /// Session capacity and expiry (session-affine components).
    pub fn sessions(mut self, config: SessionConfig) -> Self {
        self.descriptor.session = Some(config);
        self
    }

    /// Creates the singleton at deployment instead of on first call.
    pub fn eager(mut self) -> Self {
        self.descriptor.eager = true;
        self
    }

    /// Appends a class-level interceptor.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.descriptor.class_interceptors.push(interceptor);
        self
    }

    /// Appends a class-level interceptor from a closure.
    pub fn around<F>(self, name: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(&mut InvocationContext, Next<'_>) -> InvocationResult + Send + Sync + 'static,
    {
        self.interceptor(Arc::new(FnInterceptor::new(name, f)))
    }

    /// Registers a business method with default declarations.
    pub fn method<R, F>(self, name: impl AsRef<str>, f: F) -> Self
    where
        R: Any + Send,
        F: Fn(&T, &mut InvocationContext) -> Result<R, MethodError> + Send + Sync + 'static,
    {
        self.method_spec(MethodSpec::new(name), f)
    }

    /// Registers a business method with explicit declarations.
    pub fn method_spec<R, F>(mut self, spec: MethodSpec, f: F) -> Self
    where
        R: Any + Send,
        F: Fn(&T, &mut InvocationContext) -> Result<R, MethodError> + Send + Sync + 'static,
    {
        let call: BusinessMethod = Arc::new(move |bean: &Bean, ctx: &mut InvocationContext| {
            let bean = typed::<T>(bean).map_err(MethodError::System)?;
            f(bean, ctx).map(Payload::new)
        });
        self.descriptor.methods.push((spec, call));
        self
    }

    /// Post-construct callback.
    pub fn post_construct<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.post_construct = Some(erase_callback(f));
        self
    }

    /// Pre-destroy callback.
    pub fn pre_destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.pre_destroy = Some(erase_callback(f));
        self
    }

    /// Pre-passivate callback.
    pub fn pre_passivate<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.pre_passivate = Some(erase_callback(f));
        self
    }

    /// Post-activate callback.
    pub fn post_activate<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.descriptor.callbacks.post_activate = Some(erase_callback(f));
        self
    }

    /// Enables passivation with explicit serialize/deserialize functions.
    pub fn passivation<S, D>(mut self, freeze: S, thaw: D) -> Self
    where
        S: Fn(&T) -> Result<Vec<u8>, String> + Send + Sync + 'static,
        D: Fn(&[u8]) -> Result<T, String> + Send + Sync + 'static,
    {
        self.descriptor.passivation = Some(PassivationCodec {
            freeze: Arc::new(move |bean: &Bean| freeze(typed::<T>(bean)?)),
            thaw: Arc::new(move |bytes: &[u8]| thaw(bytes).map(|bean| Box::new(bean) as BeanBox)),
        });
        self
    }

    /// Finishes the descriptor.
    pub fn build(self) -> ComponentDescriptor {
        self.descriptor
    }
}

#[cfg(feature = "config")]
impl<T> DescriptorBuilder<T>
where
    T: Any + Send + Sync + serde::Serialize + serde::de::DeserializeOwned,
{
    /// Enables passivation through `serde_json`.
    pub fn json_passivation(self) -> Self {
        self.passivation(
            |bean: &T| serde_json::to_vec(bean).map_err(|e| e.to_string()),
            |bytes: &[u8]| serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        )
    }
}
