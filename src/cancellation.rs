//! Cancellation tokens observed at every suspension point of a dispatch.
//!
//! A transport that loses its client, or a caller that gives up, cancels the
//! token carried by the [`Invocation`](crate::Invocation). Pool waits, the
//! singleton creation lock and guard waits notice the cancellation and unwind
//! exactly like a timeout: no instance stays checked out and no lock stays held.
//!
//! Waits poll the token every [`CANCELLATION_POLL`] instead of registering a
//! wake-up, so a cancelled caller leaves its queue within a few milliseconds.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{ContainerError, ContainerResult};

/// Upper bound on a single condition-variable wait while a token is attached.
pub(crate) const CANCELLATION_POLL: Duration = Duration::from_millis(5);

/// Cancellation signal for one invocation, or for a family of them.
///
/// Clones share the signal. A child token is cancelled with its parent but
/// can also be cancelled alone, which suits a connection token with one child
/// per request.
///
/// # Examples
///
/// ```
/// use ferrous_container::CancellationToken;
///
/// let connection = CancellationToken::new();
/// let request = connection.child_token();
///
/// assert!(!request.is_cancelled());
/// connection.cancel();
/// assert!(request.is_cancelled());
/// assert!(request.check("Ledger").is_err());
/// ```
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

#[derive(Default)]
struct TokenState {
    cancelled_at: OnceLock<Instant>,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token cancelled together with this one, or on its own.
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(TokenState {
                cancelled_at: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Signals cancellation. Later calls keep the first timestamp.
    pub fn cancel(&self) {
        self.inner.cancelled_at.get_or_init(Instant::now);
    }

    /// Whether this token or an ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at().is_some()
    }

    /// How long ago the token, or the nearest cancelled ancestor, was cancelled.
    pub fn cancelled_for(&self) -> Option<Duration> {
        self.cancelled_at().map(|at| at.elapsed())
    }

    fn cancelled_at(&self) -> Option<Instant> {
        let mut token = self;
        loop {
            if let Some(at) = token.inner.cancelled_at.get() {
                return Some(*at);
            }
            token = token.inner.parent.as_ref()?;
        }
    }

    /// Fails with [`ContainerError::Cancelled`] for `component` once cancelled.
    pub fn check(&self, component: &str) -> ContainerResult<()> {
        if self.is_cancelled() {
            Err(ContainerError::Cancelled {
                component: component.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Returns a guard that cancels the token when dropped, unless disarmed.
    ///
    /// ```
    /// use ferrous_container::CancellationToken;
    ///
    /// let token = CancellationToken::new();
    /// {
    ///     let _guard = token.cancel_on_drop();
    /// }
    /// assert!(token.is_cancelled());
    ///
    /// let kept = CancellationToken::new();
    /// kept.cancel_on_drop().disarm();
    /// assert!(!kept.is_cancelled());
    /// ```
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: Some(self.clone()),
        }
    }

    /// Completes once the token is cancelled.
    #[cfg(feature = "async")]
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(CANCELLATION_POLL).await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled_for", &self.cancelled_for())
            .field("child", &self.inner.parent.is_some())
            .finish()
    }
}

/// Cancels its token on drop; see [`CancellationToken::cancel_on_drop`].
#[derive(Debug)]
#[must_use = "dropping the guard cancels the token immediately"]
pub struct CancelOnDrop {
    token: Option<CancellationToken>,
}

impl CancelOnDrop {
    /// Keeps the token alive past the guard.
    pub fn disarm(mut self) -> CancellationToken {
        self.token.take().unwrap_or_default()
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}
