//! Component instances and their identifiers.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::guard::FairLock;

/// A type-erased bean object.
pub type Bean = dyn Any + Send + Sync;

/// An owned, type-erased bean object.
pub type BeanBox = Box<Bean>;

/// Client-visible key of a session-affine instance.
///
/// ```
/// use ferrous_container::SessionKey;
///
/// let key = SessionKey::new("cart-42");
/// assert_eq!(key.as_str(), "cart-42");
/// assert_ne!(SessionKey::generate(), SessionKey::generate());
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    /// Wraps a caller-chosen key.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    /// The key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Identifier of a component instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceId {
    /// Internal pool slot id
    Pooled(u64),
    /// Session key of a session-affine instance
    Session(SessionKey),
    /// The one instance of a singleton
    Singleton,
}

impl InstanceId {
    /// The session key, for session-affine instances.
    pub fn session_key(&self) -> Option<&SessionKey> {
        match self {
            InstanceId::Session(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::Pooled(slot) => write!(f, "pool#{}", slot),
            InstanceId::Session(key) => write!(f, "session:{}", key),
            InstanceId::Singleton => write!(f, "singleton"),
        }
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    /// Idle and eligible for a call
    Ready,
    /// Checked out by at least one invocation
    InUse,
    /// State serialized out of memory
    Passivated,
    /// Pre-destroy has run; never used again
    Destroyed,
}

/// Why an instance was destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// A call failed with a system failure
    Discarded,
    /// Pool was flushed
    Flushed,
    /// Older than the pool's max age
    Aged,
    /// Idle longer than the eviction threshold
    Idle,
    /// Surplus instance of a non-strict pool
    Overflow,
    /// Session idle past its timeout
    SessionExpired,
    /// Session removed by the client or a remove method
    SessionRemoved,
    /// Passivation failed
    PassivationFailed,
    /// Container or component shut down
    Shutdown,
}

/// A concrete allocated bean plus its container-side state.
///
/// Instances are shared as `Arc<ComponentInstance>`. State transitions are
/// performed by the [`LifecycleManager`](crate::LifecycleManager); callers
/// only observe them.
pub struct ComponentInstance {
    id: InstanceId,
    component: Arc<str>,
    generation: u64,
    bean: BeanBox,
    lock: FairLock,
    meta: Mutex<InstanceMeta>,
}

#[derive(Debug)]
struct InstanceMeta {
    state: InstanceState,
    in_use: usize,
    retired: Option<DestroyReason>,
    created_at: Instant,
    last_used: Instant,
}

/// What happened when an invocation handed an instance back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkin {
    /// Other invocations still hold the instance
    StillInUse,
    /// Back to `Ready`
    Idle,
    /// Retired and now unused; the caller must destroy it
    Destroy(DestroyReason),
}

impl ComponentInstance {
    pub(crate) fn new(id: InstanceId, component: Arc<str>, generation: u64, bean: BeanBox) -> Self {
        let now = Instant::now();
        Self {
            id,
            component,
            generation,
            bean,
            lock: FairLock::new(),
            meta: Mutex::new(InstanceMeta {
                state: InstanceState::Ready,
                in_use: 0,
                retired: None,
                created_at: now,
                last_used: now,
            }),
        }
    }

    /// Rebuilds a passivated instance, keeping its original creation time.
    pub(crate) fn restored(
        id: InstanceId,
        component: Arc<str>,
        generation: u64,
        bean: BeanBox,
        created_at: Instant,
    ) -> Self {
        let instance = Self::new(id, component, generation, bean);
        instance.meta.lock().created_at = created_at;
        instance
    }

    /// Instance identifier.
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Name of the owning component.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The bean object.
    pub fn bean(&self) -> &Bean {
        self.bean.as_ref()
    }

    /// Downcasts the bean object.
    pub fn bean_as<T: Any>(&self) -> Option<&T> {
        self.bean.downcast_ref::<T>()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InstanceState {
        self.meta.lock().state
    }

    /// Whether the instance has been taken out of circulation.
    pub fn is_retired(&self) -> bool {
        self.meta.lock().retired.is_some()
    }

    /// Creation time.
    pub fn created_at(&self) -> Instant {
        self.meta.lock().created_at
    }

    /// Age since creation.
    pub fn age(&self) -> Duration {
        self.created_at().elapsed()
    }

    /// Time since the instance was last handed back.
    pub fn idle_for(&self) -> Duration {
        self.meta.lock().last_used.elapsed()
    }

    /// Number of invocations currently holding the instance.
    pub fn in_use(&self) -> usize {
        self.meta.lock().in_use
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn lock(&self) -> &FairLock {
        &self.lock
    }

    pub(crate) fn checkout(&self) {
        let mut meta = self.meta.lock();
        meta.in_use += 1;
        if meta.state == InstanceState::Ready {
            meta.state = InstanceState::InUse;
        }
    }

    pub(crate) fn checkin(&self) -> Checkin {
        let mut meta = self.meta.lock();
        meta.in_use = meta.in_use.saturating_sub(1);
        meta.last_used = Instant::now();
        if meta.in_use > 0 {
            return Checkin::StillInUse;
        }
        match meta.retired {
            Some(reason) => Checkin::Destroy(reason),
            None => {
                if meta.state == InstanceState::InUse {
                    meta.state = InstanceState::Ready;
                }
                Checkin::Idle
            }
        }
    }

    /// Marks the instance retired; returns true if nobody holds it.
    pub(crate) fn retire(&self, reason: DestroyReason) -> bool {
        let mut meta = self.meta.lock();
        if meta.retired.is_none() {
            meta.retired = Some(reason);
        }
        meta.in_use == 0
    }

    pub(crate) fn retired_reason(&self) -> Option<DestroyReason> {
        self.meta.lock().retired
    }

    /// Moves to `to` unless already destroyed; returns the previous state.
    pub(crate) fn transition(&self, to: InstanceState) -> InstanceState {
        let mut meta = self.meta.lock();
        let previous = meta.state;
        if previous != InstanceState::Destroyed {
            meta.state = to;
        }
        previous
    }
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("ComponentInstance")
            .field("component", &self.component)
            .field("id", &self.id)
            .field("state", &meta.state)
            .field("in_use", &meta.in_use)
            .field("retired", &meta.retired)
            .finish()
    }
}
