//! Interceptor chains.
//!
//! A chain is assembled once per business method at deployment time and
//! reused for every call. Layers run outer to inner; each receives a [`Next`]
//! continuation that it may consume at most once. Panics raised by a layer or
//! by the target are caught at the layer boundary and reported as
//! [`ContainerError::System`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::context::{InvocationContext, Payload};
use crate::error::{ContainerError, ContainerResult};
use crate::guard::{ConcurrencyGuard, LockType};
use crate::internal::panic_message;

/// What a chain layer returns.
pub type InvocationResult = ContainerResult<Payload>;

/// Around-advice applied to business calls.
///
/// # Examples
///
/// ```
/// use ferrous_container::{Interceptor, InvocationContext, InvocationResult, Next};
///
/// #[derive(Debug)]
/// struct Audit;
///
/// impl Interceptor for Audit {
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
///         ctx.set_data("audited", true);
///         next.proceed(ctx)
///     }
/// }
/// ```
pub trait Interceptor: Send + Sync + fmt::Debug {
    /// Name used in logs and chain listings.
    fn name(&self) -> &str;

    /// Runs around the rest of the chain.
    ///
    /// Call `next.proceed(ctx)` to continue, or return without calling it to
    /// short-circuit.
    fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult;
}

/// Interceptor built from a closure.
pub struct FnInterceptor<F> {
    name: String,
    f: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(&mut InvocationContext, Next<'_>) -> InvocationResult + Send + Sync,
{
    /// Wraps a closure.
    pub fn new(name: impl AsRef<str>, f: F) -> Self {
        Self {
            name: name.as_ref().to_string(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnInterceptor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnInterceptor").field("name", &self.name).finish()
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(&mut InvocationContext, Next<'_>) -> InvocationResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        (self.f)(ctx, next)
    }
}

pub(crate) type Target = Arc<dyn Fn(&mut InvocationContext) -> InvocationResult + Send + Sync>;

/// Continuation handed to a layer. Consumed by [`Next::proceed`].
pub struct Next<'a> {
    layers: &'a [Arc<dyn Interceptor>],
    target: &'a Target,
}

impl<'a> Next<'a> {
    /// Runs the remaining layers and the target.
    pub fn proceed(self, ctx: &mut InvocationContext) -> InvocationResult {
        let Next { layers, target } = self;
        match layers.split_first() {
            Some((layer, rest)) => {
                let next = Next { layers: rest, target };
                contained(ctx, |ctx| layer.around(ctx, next))
            }
            None => contained(ctx, |ctx| (**target)(ctx)),
        }
    }

    /// Number of layers still ahead, not counting the target.
    pub fn remaining(&self) -> usize {
        self.layers.len()
    }
}

fn contained<F>(ctx: &mut InvocationContext, f: F) -> InvocationResult
where
    F: FnOnce(&mut InvocationContext) -> InvocationResult,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(
                component = ctx.component(),
                method = ctx.method(),
                %message,
                "business call panicked"
            );
            Err(ContainerError::system(ctx.component(), ctx.method(), message))
        }
    }
}

/// Immutable ordered pipeline for one business method.
///
/// ```
/// use ferrous_container::{FnInterceptor, InterceptorChain, InvocationContext, Payload};
/// use std::sync::Arc;
///
/// let chain = InterceptorChain::new(|_ctx: &mut InvocationContext| Ok(Payload::new("target")))
///     .layer(Arc::new(FnInterceptor::new("outer", |ctx, next| next.proceed(ctx))));
///
/// let mut ctx = InvocationContext::detached("Echo", "say");
/// let result = chain.invoke(&mut ctx).unwrap();
/// assert_eq!(result.downcast_ref::<&str>(), Some(&"target"));
/// assert_eq!(chain.layer_names(), vec!["outer"]);
/// ```
#[derive(Clone)]
pub struct InterceptorChain {
    layers: SmallVec<[Arc<dyn Interceptor>; 6]>,
    target: Target,
}

impl InterceptorChain {
    /// Starts a chain around `target`; layers are added outer to inner.
    pub fn new<F>(target: F) -> Self
    where
        F: Fn(&mut InvocationContext) -> InvocationResult + Send + Sync + 'static,
    {
        Self::with_target(Arc::new(target))
    }

    pub(crate) fn with_target(target: Target) -> Self {
        Self {
            layers: SmallVec::new(),
            target,
        }
    }

    /// Appends a layer inside every layer added so far.
    pub fn layer(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.layers.push(interceptor);
        self
    }

    /// Layer names, outer to inner.
    pub fn layer_names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Runs the chain.
    pub fn invoke(&self, ctx: &mut InvocationContext) -> InvocationResult {
        Next {
            layers: &self.layers,
            target: &self.target,
        }
        .proceed(ctx)
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("layers", &self.layer_names())
            .finish()
    }
}

/// Outermost layer: takes the instance lock for the rest of the call.
#[derive(Debug)]
pub(crate) struct ConcurrencyInterceptor {
    guard: ConcurrencyGuard,
    lock: LockType,
}

impl ConcurrencyInterceptor {
    pub(crate) fn new(guard: ConcurrencyGuard, hint: Option<LockType>) -> Self {
        let lock = guard.resolve(hint);
        Self { guard, lock }
    }
}

impl Interceptor for ConcurrencyInterceptor {
    fn name(&self) -> &str {
        "concurrency"
    }

    fn around(&self, ctx: &mut InvocationContext, next: Next<'_>) -> InvocationResult {
        let Some(instance) = ctx.instance().cloned() else {
            return next.proceed(ctx);
        };

        let deadline = *ctx.deadline();
        let permit = self
            .guard
            .acquire(&instance, self.lock, &deadline, ctx.cancellation())?;

        // The session may have been removed while this call queued behind its holder.
        if let Some(key) = instance.id().session_key() {
            if instance.is_retired() {
                drop(permit);
                return Err(ContainerError::NoSuchSession {
                    component: ctx.component().to_string(),
                    key: key.to_string(),
                });
            }
        }

        let result = next.proceed(ctx);
        drop(permit);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusinessError;
    use parking_lot::Mutex;

    fn recording(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        Arc::new(FnInterceptor::new(name, move |ctx, next| {
            log.lock().push(format!("enter {}", name));
            let result = next.proceed(ctx);
            log.lock().push(format!("exit {}", name));
            result
        }))
    }

    #[test]
    fn layers_run_outer_to_inner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let target_log = log.clone();
        let chain = InterceptorChain::new(move |_ctx| {
            target_log.lock().push("target".to_string());
            Ok(Payload::empty())
        })
        .layer(recording("a", log.clone()))
        .layer(recording("b", log.clone()));

        chain.invoke(&mut InvocationContext::detached("C", "m")).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["enter a", "enter b", "target", "exit b", "exit a"]
        );
    }

    #[test]
    fn layer_can_short_circuit() {
        let chain = InterceptorChain::new(|_ctx| panic!("target must not run"))
            .layer(Arc::new(FnInterceptor::new("deny", |_ctx, _next| {
                Err(BusinessError::new("DENIED", "not allowed").into())
            })));

        let err = chain.invoke(&mut InvocationContext::detached("C", "m")).unwrap_err();
        assert!(matches!(err, ContainerError::Business(ref b) if b.code == "DENIED"));
    }

    #[test]
    fn panics_become_system_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = InterceptorChain::new(|_ctx| panic!("kaboom"))
            .layer(recording("outer", log.clone()));

        let err = chain.invoke(&mut InvocationContext::detached("C", "m")).unwrap_err();
        assert!(matches!(err, ContainerError::System { ref reason, .. } if reason.contains("kaboom")));
        assert_eq!(*log.lock(), vec!["enter outer", "exit outer"]);
    }

    #[test]
    fn business_failures_pass_through_unchanged() {
        let chain = InterceptorChain::new(|_ctx| {
            Err(BusinessError::new("E42", "no stock").with_rollback().into())
        })
        .layer(Arc::new(FnInterceptor::new("noop", |ctx, next| next.proceed(ctx))));

        match chain.invoke(&mut InvocationContext::detached("C", "m")) {
            Err(ContainerError::Business(err)) => {
                assert_eq!(err, BusinessError::new("E42", "no stock").with_rollback());
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
