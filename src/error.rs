//! Error types for the component container.

use std::time::Duration;

use thiserror::Error;

/// Container errors.
///
/// Every failure a dispatch can produce is one of these variants. Use
/// [`ContainerError::kind`] to branch on the classification and
/// [`ContainerError::discards_instance`] to learn whether the instance that
/// served the call was taken out of circulation.
///
/// # Examples
///
/// ```rust
/// use ferrous_container::{ContainerError, ErrorKind};
/// use std::time::Duration;
///
/// let timeout = ContainerError::Timeout {
///     component: "Ledger".to_string(),
///     waited: Duration::from_millis(50),
/// };
/// assert_eq!(timeout.kind(), ErrorKind::Timeout);
/// assert!(!timeout.discards_instance());
///
/// let crash = ContainerError::System {
///     component: "Ledger".to_string(),
///     method: "post".to_string(),
///     reason: "index out of bounds".to_string(),
/// };
/// assert!(crash.discards_instance());
/// ```
#[derive(Debug, Clone, Error)]
pub enum ContainerError {
    /// No component with this name is deployed
    #[error("Component not deployed: {0}")]
    NotDeployed(String),
    /// A component with this name is already deployed
    #[error("Component already deployed: {0}")]
    AlreadyDeployed(String),
    /// The descriptor was rejected at deployment time
    #[error("Invalid descriptor for {component}: {reason}")]
    InvalidDescriptor {
        /// Component name
        component: String,
        /// What is wrong with it
        reason: String,
    },
    /// The component has no business method with this name
    #[error("No method {method} on component {component}")]
    NoSuchMethod {
        /// Component name
        component: String,
        /// Requested method
        method: String,
    },
    /// A session-affine component was called without a session key
    #[error("Component {0} requires a session key")]
    MissingSessionKey(String),
    /// The session was removed while the call was waiting for it
    #[error("Session {key} of {component} no longer exists")]
    NoSuchSession {
        /// Component name
        component: String,
        /// Session key
        key: String,
    },
    /// Pool or session capacity reached and the caller asked not to wait
    #[error("No instance of {component} available (capacity {capacity})")]
    Exhausted {
        /// Component name
        component: String,
        /// Configured capacity
        capacity: usize,
    },
    /// A bounded wait for an instance or a lock elapsed
    #[error("Access timeout for {component} after {waited:?}")]
    Timeout {
        /// Component name
        component: String,
        /// How long the caller waited
        waited: Duration,
    },
    /// The invocation's cancellation token fired while it was waiting
    #[error("Invocation of {component} cancelled")]
    Cancelled {
        /// Component name
        component: String,
    },
    /// Factory or post-construct callback failed
    #[error("Construction of {component} failed: {reason}")]
    ConstructionFailed {
        /// Component name
        component: String,
        /// Failure message
        reason: String,
    },
    /// Reactivating a passivated session failed
    #[error("Activation of session {key} of {component} failed: {reason}")]
    ActivationFailed {
        /// Component name
        component: String,
        /// Session key
        key: String,
        /// Failure message
        reason: String,
    },
    /// The target method's own declared failure, passed through unchanged
    #[error(transparent)]
    Business(#[from] BusinessError),
    /// Unexpected fault inside the call
    #[error("System failure in {component}.{method}: {reason}")]
    System {
        /// Component name
        component: String,
        /// Method name
        method: String,
        /// Failure message
        reason: String,
    },
    /// Transaction demarcation failed or the attribute was violated
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// The container no longer accepts calls
    #[error("Container is shut down")]
    ShutDown,
}

/// Coarse classification of a [`ContainerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown component, method, or session
    Resolution,
    /// Capacity reached without waiting
    Exhausted,
    /// Bounded wait elapsed
    Timeout,
    /// Cancellation token fired
    Cancelled,
    /// Instance could not be created
    ConstructionFailed,
    /// Passivated instance could not be restored
    ActivationFailed,
    /// Declared application failure
    BusinessFailure,
    /// Unexpected runtime fault
    SystemFailure,
    /// Transaction demarcation or attribute failure
    Transaction,
    /// Deployment-time configuration problem
    Configuration,
    /// Container stopped
    ShutDown,
}

impl ContainerError {
    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::NotDeployed(_)
            | ContainerError::NoSuchMethod { .. }
            | ContainerError::MissingSessionKey(_)
            | ContainerError::NoSuchSession { .. } => ErrorKind::Resolution,
            ContainerError::AlreadyDeployed(_) | ContainerError::InvalidDescriptor { .. } => {
                ErrorKind::Configuration
            }
            ContainerError::Exhausted { .. } => ErrorKind::Exhausted,
            ContainerError::Timeout { .. } => ErrorKind::Timeout,
            ContainerError::Cancelled { .. } => ErrorKind::Cancelled,
            ContainerError::ConstructionFailed { .. } => ErrorKind::ConstructionFailed,
            ContainerError::ActivationFailed { .. } => ErrorKind::ActivationFailed,
            ContainerError::Business(_) => ErrorKind::BusinessFailure,
            ContainerError::System { .. } => ErrorKind::SystemFailure,
            ContainerError::Transaction(_) => ErrorKind::Transaction,
            ContainerError::ShutDown => ErrorKind::ShutDown,
        }
    }

    /// Whether an instance that produced this error must leave circulation.
    pub fn discards_instance(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SystemFailure | ErrorKind::ConstructionFailed | ErrorKind::ActivationFailed
        )
    }

    /// Whether an enclosing container-managed transaction must roll back.
    pub fn forces_rollback(&self) -> bool {
        match self {
            ContainerError::Business(business) => business.rollback,
            other => other.discards_instance(),
        }
    }

    pub(crate) fn system(component: &str, method: &str, reason: impl Into<String>) -> Self {
        ContainerError::System {
            component: component.to_string(),
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Application-level failure declared by a business method.
///
/// Passed to the caller unchanged. The instance stays usable, and an
/// enclosing transaction only rolls back when `rollback` is set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct BusinessError {
    /// Application error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Roll back the enclosing container transaction
    pub rollback: bool,
}

impl BusinessError {
    /// Creates a business error that does not force rollback.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            rollback: false,
        }
    }

    /// Marks the error as forcing rollback of the enclosing transaction.
    pub fn with_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }
}

/// What a business method or interceptor returns on failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    /// Declared application failure
    #[error(transparent)]
    Business(#[from] BusinessError),
    /// Unexpected failure, treated like a crash of the instance
    #[error("{0}")]
    System(String),
}

impl MethodError {
    /// Shorthand for a system failure.
    pub fn system(reason: impl Into<String>) -> Self {
        MethodError::System(reason.into())
    }
}

/// Transaction demarcation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// `Mandatory` method called without a caller transaction
    #[error("Transaction required for {0}")]
    Required(String),
    /// `Never` method called inside a caller transaction
    #[error("Transaction not allowed for {0}")]
    NotAllowed(String),
    /// Commit did not succeed; the transaction was rolled back
    #[error("Transaction {0} rolled back")]
    RolledBack(u64),
    /// The transaction id is not known to the policy
    #[error("Unknown transaction {0}")]
    Unknown(u64),
    /// The transaction manager call itself failed
    #[error("Transaction manager failure: {0}")]
    Manager(String),
}

/// Result type for container operations.
///
/// ```rust
/// use ferrous_container::{ContainerResult, ContainerError};
///
/// fn lookup(name: &str) -> ContainerResult<()> {
///     Err(ContainerError::NotDeployed(name.to_string()))
/// }
///
/// assert!(lookup("Missing").is_err());
/// ```
pub type ContainerResult<T> = Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_keep_the_instance() {
        let err = ContainerError::from(BusinessError::new("E1", "insufficient funds"));
        assert_eq!(err.kind(), ErrorKind::BusinessFailure);
        assert!(!err.discards_instance());
        assert!(!err.forces_rollback());

        let marked = ContainerError::from(BusinessError::new("E2", "bad state").with_rollback());
        assert!(!marked.discards_instance());
        assert!(marked.forces_rollback());
    }

    #[test]
    fn waits_never_discard() {
        let exhausted = ContainerError::Exhausted { component: "A".into(), capacity: 2 };
        let timeout = ContainerError::Timeout { component: "A".into(), waited: Duration::ZERO };
        assert!(!exhausted.discards_instance());
        assert!(!timeout.discards_instance());
        assert_ne!(exhausted.kind(), timeout.kind());
    }

    #[test]
    fn construction_and_activation_discard() {
        let construct = ContainerError::ConstructionFailed { component: "A".into(), reason: "boom".into() };
        let activate = ContainerError::ActivationFailed {
            component: "A".into(),
            key: "k".into(),
            reason: "corrupt".into(),
        };
        assert!(construct.discards_instance());
        assert!(activate.discards_instance());
        assert!(activate.forces_rollback());
    }
}
