//! Invocation requests and the per-call context threaded through the chain.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancellation::CancellationToken;
use crate::instance::{ComponentInstance, SessionKey};
use crate::timeout::{AccessTimeout, Deadline};
use crate::transaction::TransactionId;

/// Type-erased argument or return value of a business call.
///
/// ```
/// use ferrous_container::Payload;
///
/// let payload = Payload::new(41u32 + 1);
/// assert_eq!(payload.downcast_ref::<u32>(), Some(&42));
/// assert_eq!(payload.downcast::<u32>().unwrap(), 42);
/// ```
#[derive(Default)]
pub struct Payload(Option<Box<dyn Any + Send>>);

impl Payload {
    /// Wraps a value.
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    /// A payload carrying nothing.
    pub fn empty() -> Self {
        Self(None)
    }

    /// Whether the payload carries nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Borrows the value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref::<T>()
    }

    /// Takes the value out if it has type `T`; otherwise hands the payload back.
    pub fn downcast<T: Any>(self) -> Result<T, Payload> {
        match self.0 {
            Some(boxed) => boxed.downcast::<T>().map(|value| *value).map_err(|other| Payload(Some(other))),
            None => Err(Payload(None)),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_some() {
            f.write_str("Payload(..)")
        } else {
            f.write_str("Payload(empty)")
        }
    }
}

/// A business call request.
///
/// ```
/// use ferrous_container::{AccessTimeout, Invocation, SessionKey};
///
/// let invocation = Invocation::new("Cart", "add")
///     .with_session(SessionKey::new("c-1"))
///     .with_args(("apple", 3u32))
///     .with_timeout(AccessTimeout::from_millis(250));
///
/// assert_eq!(invocation.component(), "Cart");
/// assert_eq!(invocation.method(), "add");
/// ```
#[derive(Debug)]
pub struct Invocation {
    pub(crate) component: String,
    pub(crate) method: String,
    pub(crate) session: Option<SessionKey>,
    pub(crate) args: Payload,
    pub(crate) transaction: Option<TransactionId>,
    pub(crate) timeout: Option<AccessTimeout>,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl Invocation {
    /// Starts a request for `component.method`.
    pub fn new(component: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            method: method.into(),
            session: None,
            args: Payload::empty(),
            transaction: None,
            timeout: None,
            cancellation: None,
        }
    }

    /// Routes the call to a session-affine instance.
    pub fn with_session(mut self, key: impl Into<SessionKey>) -> Self {
        self.session = Some(key.into());
        self
    }

    /// Call arguments.
    pub fn with_args<T: Any + Send>(mut self, args: T) -> Self {
        self.args = Payload::new(args);
        self
    }

    /// Joins an existing caller transaction.
    pub fn with_transaction(mut self, id: TransactionId) -> Self {
        self.transaction = Some(id);
        self
    }

    /// Overrides every configured access timeout for this call.
    pub fn with_timeout(mut self, timeout: AccessTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Makes the call abandon its waits when the token is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Target component.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Target method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Session key, if any.
    pub fn session(&self) -> Option<&SessionKey> {
        self.session.as_ref()
    }
}

/// Mutable state of one call as it passes through the interceptor chain.
pub struct InvocationContext {
    component: Arc<str>,
    method: Arc<str>,
    session: Option<SessionKey>,
    args: Payload,
    instance: Option<Arc<ComponentInstance>>,
    transaction: Option<TransactionId>,
    rollback_only: bool,
    cancellation: Option<CancellationToken>,
    deadline: Deadline,
    started: Instant,
    data: HashMap<String, Box<dyn Any + Send + Sync>>,
    remove_requested: bool,
}

impl InvocationContext {
    pub(crate) fn new(
        component: Arc<str>,
        method: Arc<str>,
        invocation: Invocation,
        instance: Arc<ComponentInstance>,
        deadline: Deadline,
    ) -> Self {
        Self {
            component,
            method,
            session: invocation.session,
            args: invocation.args,
            instance: Some(instance),
            transaction: invocation.transaction,
            rollback_only: false,
            cancellation: invocation.cancellation,
            deadline,
            started: Instant::now(),
            data: HashMap::new(),
            remove_requested: false,
        }
    }

    /// A context that is not bound to any instance.
    ///
    /// Useful for exercising interceptors in isolation.
    pub fn detached(component: &str, method: &str) -> Self {
        Self {
            component: Arc::from(component),
            method: Arc::from(method),
            session: None,
            args: Payload::empty(),
            instance: None,
            transaction: None,
            rollback_only: false,
            cancellation: None,
            deadline: AccessTimeout::Unbounded.deadline(),
            started: Instant::now(),
            data: HashMap::new(),
            remove_requested: false,
        }
    }

    /// Component name.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Session key, for session-affine calls.
    pub fn session(&self) -> Option<&SessionKey> {
        self.session.as_ref()
    }

    /// The instance serving the call.
    pub fn instance(&self) -> Option<&Arc<ComponentInstance>> {
        self.instance.as_ref()
    }

    /// Borrows the arguments as `T`.
    pub fn args<T: Any>(&self) -> Option<&T> {
        self.args.downcast_ref::<T>()
    }

    /// Takes the arguments out as `T`, leaving nothing behind.
    pub fn take_args<T: Any>(&mut self) -> Option<T> {
        match std::mem::take(&mut self.args).downcast::<T>() {
            Ok(value) => Some(value),
            Err(original) => {
                self.args = original;
                None
            }
        }
    }

    /// Replaces the arguments.
    pub fn set_args<T: Any + Send>(&mut self, args: T) {
        self.args = Payload::new(args);
    }

    /// Transaction the call currently runs in.
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    pub(crate) fn set_transaction(&mut self, id: Option<TransactionId>) -> Option<TransactionId> {
        std::mem::replace(&mut self.transaction, id)
    }

    /// Marks the current transaction for rollback.
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Whether the current transaction is marked for rollback.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub(crate) fn take_rollback_only(&mut self) -> bool {
        std::mem::take(&mut self.rollback_only)
    }

    /// Cancellation token of the caller, if any.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Whether the caller has given up.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// The acquisition deadline shared by every wait of this call.
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    /// Time since the call entered the chain.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn request_remove(&mut self) {
        self.remove_requested = true;
    }

    pub(crate) fn remove_requested(&self) -> bool {
        self.remove_requested
    }

    /// Stores interceptor data for later layers.
    pub fn set_data<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.data.insert(key.into(), Box::new(value));
    }

    /// Reads interceptor data stored by an earlier layer.
    pub fn get_data<T>(&self, key: &str) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.data.get(key)?.downcast_ref::<T>()
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("component", &self.component)
            .field("method", &self.method)
            .field("session", &self.session)
            .field("instance", &self.instance.as_ref().map(|i| i.id().clone()))
            .field("transaction", &self.transaction)
            .field("rollback_only", &self.rollback_only)
            .field("elapsed", &self.elapsed())
            .finish()
    }
}
