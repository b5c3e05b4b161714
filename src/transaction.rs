//! Container-managed transaction demarcation.
//!
//! The container never implements a transaction manager. It drives a
//! [`TransactionPolicy`] according to each method's [`TransactionAttribute`].
//! [`LocalTransactionPolicy`] is an in-memory policy that is enough for tests
//! and for components without external resources.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::InvocationContext;
use crate::error::{ContainerError, TransactionError};
use crate::interceptor::{Interceptor, InvocationResult, Next};

/// Identifier of a transaction known to a [`TransactionPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// How a method relates to the caller's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionAttribute {
    /// Join the caller's transaction or start a new one
    #[default]
    Required,
    /// Always run in a new transaction, suspending the caller's
    RequiresNew,
    /// Join the caller's transaction; fail without one
    Mandatory,
    /// Join the caller's transaction if there is one
    Supports,
    /// Run outside any transaction, suspending the caller's
    NotSupported,
    /// Fail if called inside a transaction
    Never,
}

/// Transaction manager contract driven by the container.
pub trait TransactionPolicy: Send + Sync + fmt::Debug {
    /// Starts a transaction.
    fn begin(&self) -> Result<TransactionId, TransactionError>;

    /// Detaches a transaction from the current call.
    fn suspend(&self, id: TransactionId) -> Result<(), TransactionError> {
        let _ = id;
        Ok(())
    }

    /// Re-attaches a suspended transaction.
    fn resume(&self, id: TransactionId) -> Result<(), TransactionError> {
        let _ = id;
        Ok(())
    }

    /// Commits; a transaction marked rollback-only is rolled back instead and
    /// reported as [`TransactionError::RolledBack`].
    fn commit(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Rolls back.
    fn rollback(&self, id: TransactionId) -> Result<(), TransactionError>;

    /// Dooms the transaction so that it can only roll back.
    fn set_rollback_only(&self, id: TransactionId) -> Result<(), TransactionError>;
}

/// Counters of a [`LocalTransactionPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    /// Transactions started
    pub begun: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions rolled back
    pub rolled_back: u64,
    /// Transactions still open
    pub active: usize,
}

/// In-memory transaction policy.
///
/// ```
/// use ferrous_container::{LocalTransactionPolicy, TransactionPolicy};
///
/// let policy = LocalTransactionPolicy::new();
/// let tx = policy.begin().unwrap();
/// policy.set_rollback_only(tx).unwrap();
/// assert!(policy.commit(tx).is_err());
/// assert_eq!(policy.stats().rolled_back, 1);
/// ```
#[derive(Debug, Default)]
pub struct LocalTransactionPolicy {
    next_id: AtomicU64,
    open: Mutex<HashMap<TransactionId, bool>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl LocalTransactionPolicy {
    /// Creates an empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is still open.
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.open.lock().contains_key(&id)
    }

    /// Whether `id` is open and marked rollback-only.
    pub fn is_rollback_only(&self, id: TransactionId) -> bool {
        self.open.lock().get(&id).copied().unwrap_or(false)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            active: self.open.lock().len(),
        }
    }
}

impl TransactionPolicy for LocalTransactionPolicy {
    fn begin(&self) -> Result<TransactionId, TransactionError> {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.open.lock().insert(id, false);
        self.begun.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    fn commit(&self, id: TransactionId) -> Result<(), TransactionError> {
        let doomed = self
            .open
            .lock()
            .remove(&id)
            .ok_or(TransactionError::Unknown(id.0))?;
        if doomed {
            self.rolled_back.fetch_add(1, Ordering::Relaxed);
            return Err(TransactionError::RolledBack(id.0));
        }
        self.committed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self, id: TransactionId) -> Result<(), TransactionError> {
        self.open
            .lock()
            .remove(&id)
            .ok_or(TransactionError::Unknown(id.0))?;
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_rollback_only(&self, id: TransactionId) -> Result<(), TransactionError> {
        match self.open.lock().get_mut(&id) {
            Some(doomed) => {
                *doomed = true;
                Ok(())
            }
            None => Err(TransactionError::Unknown(id.0)),
        }
    }
}

/// Chain layer applying a method's transaction attribute.
#[derive(Debug)]
pub(crate) struct TransactionInterceptor {
    attribute: TransactionAttribute,
    policy: Arc<dyn TransactionPolicy>,
}

impl TransactionInterceptor {
    pub(crate) fn new(attribute: TransactionAttribute, policy: Arc<dyn TransactionPolicy>) -> Self {
        Self { attribute, policy }
    }

    /// Runs the rest of the chain inside the caller's transaction.
    fn join(&self, id: TransactionId, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let result = next.proceed(ctx);
        let doomed = ctx.take_rollback_only() || result.as_ref().is_err_and(ContainerError::forces_rollback);
        if !doomed {
            return result;
        }
        match self.policy.set_rollback_only(id) {
            Ok(()) => result,
            // The caller would otherwise commit work this call required undone.
            Err(err) => match result {
                Ok(_) => Err(err.into()),
                Err(original) => {
                    tracing::warn!(component = ctx.component(), transaction = %id, error = %err, "could not mark transaction rollback-only");
                    Err(original)
                }
            },
        }
    }

    /// Runs the rest of the chain in a new transaction and always completes it.
    fn run_new(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let id = self.policy.begin()?;
        let outer = ctx.set_transaction(Some(id));
        let result = next.proceed(ctx);
        ctx.set_transaction(outer);

        let doomed = ctx.take_rollback_only() || result.as_ref().is_err_and(ContainerError::forces_rollback);
        if doomed {
            return match self.policy.rollback(id) {
                Ok(()) => result,
                Err(err) => match result {
                    Ok(_) => Err(err.into()),
                    Err(original) => {
                        tracing::warn!(component = ctx.component(), transaction = %id, error = %err, "rollback failed");
                        Err(original)
                    }
                },
            };
        }

        match self.policy.commit(id) {
            Ok(()) => result,
            // A business failure keeps precedence over the commit outcome.
            Err(err) => match result {
                Ok(_) => Err(err.into()),
                Err(original) => {
                    tracing::warn!(component = ctx.component(), transaction = %id, error = %err, "commit failed after business failure");
                    Err(original)
                }
            },
        }
    }

    /// Runs the rest of the chain with the caller's transaction detached.
    fn run_without(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let Some(outer) = ctx.set_transaction(None) else {
            return next.proceed(ctx);
        };
        self.policy.suspend(outer)?;
        let result = next.proceed(ctx);
        ctx.set_transaction(Some(outer));
        ctx.take_rollback_only();
        match self.policy.resume(outer) {
            Ok(()) => result,
            Err(err) => result.and(Err(err.into())),
        }
    }

    /// Suspends the caller's transaction around a new one.
    fn run_new_suspending(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let Some(outer) = ctx.transaction() else {
            return self.run_new(ctx, next);
        };
        self.policy.suspend(outer)?;
        let result = self.run_new(ctx, next);
        match self.policy.resume(outer) {
            Ok(()) => result,
            Err(err) => result.and(Err(err.into())),
        }
    }
}

impl Interceptor for TransactionInterceptor {
    fn name(&self) -> &str {
        "transaction"
    }

    fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let caller = ctx.transaction();
        match (self.attribute, caller) {
            (TransactionAttribute::Required, Some(id))
            | (TransactionAttribute::Mandatory, Some(id))
            | (TransactionAttribute::Supports, Some(id)) => self.join(id, ctx, next),
            (TransactionAttribute::Required, None) => self.run_new(ctx, next),
            (TransactionAttribute::RequiresNew, _) => self.run_new_suspending(ctx, next),
            (TransactionAttribute::Mandatory, None) => {
                Err(TransactionError::Required(format!("{}.{}", ctx.component(), ctx.method())).into())
            }
            (TransactionAttribute::Supports, None) => next.proceed(ctx),
            (TransactionAttribute::NotSupported, _) => self.run_without(ctx, next),
            (TransactionAttribute::Never, Some(_)) => {
                Err(TransactionError::NotAllowed(format!("{}.{}", ctx.component(), ctx.method())).into())
            }
            (TransactionAttribute::Never, None) => next.proceed(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Payload;
    use crate::error::{BusinessError, MethodError};
    use crate::interceptor::InterceptorChain;

    fn chain<F>(attribute: TransactionAttribute, policy: &Arc<LocalTransactionPolicy>, target: F) -> InterceptorChain
    where
        F: Fn(&mut InvocationContext) -> InvocationResult + Send + Sync + 'static,
    {
        InterceptorChain::new(target).layer(Arc::new(TransactionInterceptor::new(attribute, policy.clone())))
    }

    fn observed_tx(ctx: &mut InvocationContext) -> InvocationResult {
        Ok(Payload::new(ctx.transaction()))
    }

    #[test]
    fn required_starts_and_commits() {
        let policy = Arc::new(LocalTransactionPolicy::new());
        let chain = chain(TransactionAttribute::Required, &policy, observed_tx);

        let mut ctx = InvocationContext::detached("Bank", "deposit");
        let seen = chain.invoke(&mut ctx).unwrap().downcast::<Option<TransactionId>>().unwrap();
        assert!(seen.is_some());
        assert_eq!(ctx.transaction(), None);
        assert_eq!(policy.stats(), TransactionStats { begun: 1, committed: 1, rolled_back: 0, active: 0 });
    }

    #[test]
    fn required_joins_caller_transaction() {
        let policy = Arc::new(LocalTransactionPolicy::new());
        let caller = policy.begin().unwrap();
        let chain = chain(TransactionAttribute::Required, &policy, observed_tx);

        let mut ctx = InvocationContext::detached("Bank", "deposit");
        ctx.set_transaction(Some(caller));
        let seen = chain.invoke(&mut ctx).unwrap().downcast::<Option<TransactionId>>().unwrap();
        assert_eq!(seen, Some(caller));
        assert!(policy.is_active(caller));
        assert_eq!(policy.stats().begun, 1);
    }

    #[test]
    fn requires_new_suspends_caller() {
        let policy = Arc::new(LocalTransactionPolicy::new());
        let caller = policy.begin().unwrap();
        let chain = chain(TransactionAttribute::RequiresNew, &policy, observed_tx);

        let mut ctx = InvocationContext::detached("Audit", "log");
        ctx.set_transaction(Some(caller));
        let seen = chain.invoke(&mut ctx).unwrap().downcast::<Option<TransactionId>>().unwrap();
        assert_ne!(seen, Some(caller));
        assert_eq!(ctx.transaction(), Some(caller));
        assert_eq!(policy.stats().committed, 1);
        assert!(policy.is_active(caller));
    }

    #[test]
    fn mandatory_and_never_are_enforced() {
        let policy = Arc::new(LocalTransactionPolicy::new());

        let mandatory = chain(TransactionAttribute::Mandatory, &policy, observed_tx);
        let err = mandatory.invoke(&mut InvocationContext::detached("A", "m")).unwrap_err();
        assert!(matches!(err, ContainerError::Transaction(TransactionError::Required(_))));

        let never = chain(TransactionAttribute::Never, &policy, observed_tx);
        let mut ctx = InvocationContext::detached("A", "m");
        ctx.set_transaction(Some(policy.begin().unwrap()));
        let err = never.invoke(&mut ctx).unwrap_err();
        assert!(matches!(err, ContainerError::Transaction(TransactionError::NotAllowed(_))));
    }

    #[test]
    fn not_supported_hides_caller_transaction() {
        let policy = Arc::new(LocalTransactionPolicy::new());
        let caller = policy.begin().unwrap();
        let chain = chain(TransactionAttribute::NotSupported, &policy, observed_tx);

        let mut ctx = InvocationContext::detached("A", "m");
        ctx.set_transaction(Some(caller));
        let seen = chain.invoke(&mut ctx).unwrap().downcast::<Option<TransactionId>>().unwrap();
        assert_eq!(seen, None);
        assert_eq!(ctx.transaction(), Some(caller));
    }

    #[test]
    fn failures_decide_rollback() {
        let policy = Arc::new(LocalTransactionPolicy::new());

        let plain = chain(TransactionAttribute::Required, &policy, |_ctx| {
            Err(BusinessError::new("E1", "declined").into())
        });
        assert!(plain.invoke(&mut InvocationContext::detached("A", "m")).is_err());
        assert_eq!(policy.stats().committed, 1);

        let marked = chain(TransactionAttribute::Required, &policy, |_ctx| {
            Err(BusinessError::new("E2", "corrupt").with_rollback().into())
        });
        assert!(marked.invoke(&mut InvocationContext::detached("A", "m")).is_err());
        assert_eq!(policy.stats().rolled_back, 1);

        let crashed = chain(TransactionAttribute::Required, &policy, |ctx| {
            Err(ContainerError::system(ctx.component(), ctx.method(), MethodError::system("io").to_string()))
        });
        assert!(crashed.invoke(&mut InvocationContext::detached("A", "m")).is_err());
        assert_eq!(policy.stats().rolled_back, 2);

        let doomed = chain(TransactionAttribute::Required, &policy, |ctx| {
            ctx.set_rollback_only();
            Ok(Payload::empty())
        });
        assert!(doomed.invoke(&mut InvocationContext::detached("A", "m")).is_ok());
        assert_eq!(policy.stats().rolled_back, 3);
        assert_eq!(policy.stats().active, 0);
    }

    #[test]
    fn joined_failure_dooms_caller_transaction() {
        let policy = Arc::new(LocalTransactionPolicy::new());
        let caller = policy.begin().unwrap();
        let chain = chain(TransactionAttribute::Supports, &policy, |_ctx| panic!("bad"));

        let mut ctx = InvocationContext::detached("A", "m");
        ctx.set_transaction(Some(caller));
        assert!(chain.invoke(&mut ctx).is_err());
        assert!(policy.is_rollback_only(caller));
        assert_eq!(policy.commit(caller), Err(TransactionError::RolledBack(caller.0)));
    }
}
