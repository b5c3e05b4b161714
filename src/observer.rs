//! Diagnostic observers for container events.
//!
//! Observers are notified synchronously from the dispatching thread, so keep
//! implementations lightweight. The built-in [`TracingObserver`] forwards
//! every event to `tracing`; [`MetricsObserver`] only counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::instance::{DestroyReason, InstanceId};

/// Lifecycle callback that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// Bean factory
    Factory,
    /// Post-construct
    PostConstruct,
    /// Pre-destroy
    PreDestroy,
    /// Pre-passivate or serialization
    PrePassivate,
    /// Post-activate or deserialization
    PostActivate,
}

/// Observer of dispatch and lifecycle events.
///
/// Every method has an empty default, so an implementation only overrides
/// what it cares about.
///
/// # Examples
///
/// ```
/// use ferrous_container::{ContainerObserver, ErrorKind};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
///
/// #[derive(Default)]
/// struct FailureCounter(AtomicUsize);
///
/// impl ContainerObserver for FailureCounter {
///     fn invocation_failed(&self, _component: &str, _method: &str, _kind: ErrorKind, _elapsed: Duration) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let counter = FailureCounter::default();
/// counter.invocation_failed("Ledger", "post", ErrorKind::Timeout, Duration::ZERO);
/// assert_eq!(counter.0.load(Ordering::Relaxed), 1);
/// ```
pub trait ContainerObserver: Send + Sync {
    /// A call entered the dispatcher.
    fn invocation_started(&self, component: &str, method: &str) {
        let _ = (component, method);
    }

    /// A call returned normally.
    fn invocation_completed(&self, component: &str, method: &str, elapsed: Duration) {
        let _ = (component, method, elapsed);
    }

    /// A call failed.
    fn invocation_failed(&self, component: &str, method: &str, kind: ErrorKind, elapsed: Duration) {
        let _ = (component, method, kind, elapsed);
    }

    /// A new instance finished construction.
    fn instance_created(&self, component: &str, id: &InstanceId) {
        let _ = (component, id);
    }

    /// An instance left circulation for good.
    fn instance_destroyed(&self, component: &str, id: &InstanceId, reason: DestroyReason) {
        let _ = (component, id, reason);
    }

    /// A session instance was serialized out of memory.
    fn instance_passivated(&self, component: &str, id: &InstanceId) {
        let _ = (component, id);
    }

    /// A passivated session instance was restored.
    fn instance_activated(&self, component: &str, id: &InstanceId) {
        let _ = (component, id);
    }

    /// A lifecycle callback failed or panicked.
    fn callback_failed(&self, component: &str, callback: CallbackKind, message: &str) {
        let _ = (component, callback, message);
    }
}

/// Registered observers.
#[derive(Default, Clone)]
pub(crate) struct Observers {
    observers: Vec<Arc<dyn ContainerObserver>>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        Self { observers: Vec::new() }
    }

    pub(crate) fn add(&mut self, observer: Arc<dyn ContainerObserver>) {
        self.observers.push(observer);
    }

    #[inline]
    pub(crate) fn invocation_started(&self, component: &str, method: &str) {
        for observer in &self.observers {
            observer.invocation_started(component, method);
        }
    }

    #[inline]
    pub(crate) fn invocation_completed(&self, component: &str, method: &str, elapsed: Duration) {
        for observer in &self.observers {
            observer.invocation_completed(component, method, elapsed);
        }
    }

    #[inline]
    pub(crate) fn invocation_failed(&self, component: &str, method: &str, kind: ErrorKind, elapsed: Duration) {
        for observer in &self.observers {
            observer.invocation_failed(component, method, kind, elapsed);
        }
    }

    pub(crate) fn instance_created(&self, component: &str, id: &InstanceId) {
        for observer in &self.observers {
            observer.instance_created(component, id);
        }
    }

    pub(crate) fn instance_destroyed(&self, component: &str, id: &InstanceId, reason: DestroyReason) {
        for observer in &self.observers {
            observer.instance_destroyed(component, id, reason);
        }
    }

    pub(crate) fn instance_passivated(&self, component: &str, id: &InstanceId) {
        for observer in &self.observers {
            observer.instance_passivated(component, id);
        }
    }

    pub(crate) fn instance_activated(&self, component: &str, id: &InstanceId) {
        for observer in &self.observers {
            observer.instance_activated(component, id);
        }
    }

    pub(crate) fn callback_failed(&self, component: &str, callback: CallbackKind, message: &str) {
        for observer in &self.observers {
            observer.callback_failed(component, callback, message);
        }
    }
}

/// Observer that emits `tracing` events.
///
/// Call events are logged at `trace`, instance lifecycle at `debug` and
/// failures at `warn`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    target: &'static str,
}

impl TracingObserver {
    /// Creates an observer with the default prefix.
    pub fn new() -> Self {
        Self { target: "ferrous-container" }
    }

    /// Creates an observer that tags every event with `prefix`.
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self { target: prefix }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerObserver for TracingObserver {
    fn invocation_started(&self, component: &str, method: &str) {
        tracing::trace!(prefix = self.target, component, method, "dispatching");
    }

    fn invocation_completed(&self, component: &str, method: &str, elapsed: Duration) {
        tracing::trace!(prefix = self.target, component, method, ?elapsed, "completed");
    }

    fn invocation_failed(&self, component: &str, method: &str, kind: ErrorKind, elapsed: Duration) {
        tracing::warn!(prefix = self.target, component, method, ?kind, ?elapsed, "invocation failed");
    }

    fn instance_created(&self, component: &str, id: &InstanceId) {
        tracing::debug!(prefix = self.target, component, instance = %id, "instance created");
    }

    fn instance_destroyed(&self, component: &str, id: &InstanceId, reason: DestroyReason) {
        tracing::debug!(prefix = self.target, component, instance = %id, ?reason, "instance destroyed");
    }

    fn instance_passivated(&self, component: &str, id: &InstanceId) {
        tracing::debug!(prefix = self.target, component, instance = %id, "instance passivated");
    }

    fn instance_activated(&self, component: &str, id: &InstanceId) {
        tracing::debug!(prefix = self.target, component, instance = %id, "instance activated");
    }

    fn callback_failed(&self, component: &str, callback: CallbackKind, message: &str) {
        tracing::warn!(prefix = self.target, component, ?callback, message, "lifecycle callback failed");
    }
}

/// Observer that counts events across all components.
#[derive(Debug, Default)]
pub struct MetricsObserver {
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    callback_failures: AtomicU64,
}

impl MetricsObserver {
    /// Creates a zeroed observer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls that returned normally.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Calls that failed, for any reason.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Calls that failed with [`ErrorKind::Timeout`].
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Instances constructed.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Instances destroyed.
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// Lifecycle callbacks that failed.
    pub fn callback_failures(&self) -> u64 {
        self.callback_failures.load(Ordering::Relaxed)
    }

    /// Resets all counters.
    pub fn reset(&self) {
        for counter in [
            &self.completed,
            &self.failed,
            &self.timeouts,
            &self.created,
            &self.destroyed,
            &self.callback_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl ContainerObserver for MetricsObserver {
    fn invocation_completed(&self, _component: &str, _method: &str, _elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn invocation_failed(&self, _component: &str, _method: &str, kind: ErrorKind, _elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if kind == ErrorKind::Timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn instance_created(&self, _component: &str, _id: &InstanceId) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn instance_destroyed(&self, _component: &str, _id: &InstanceId, _reason: DestroyReason) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn callback_failed(&self, _component: &str, _callback: CallbackKind, _message: &str) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }
}
