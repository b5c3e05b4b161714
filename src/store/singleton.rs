//! The single shared instance of a singleton component.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::cancellation::{CancellationToken, CANCELLATION_POLL};
use crate::error::{ContainerError, ContainerResult};
use crate::instance::{Checkin, ComponentInstance, DestroyReason, InstanceId};
use crate::lifecycle::LifecycleManager;
use crate::metrics::StoreStats;
use crate::timeout::Deadline;

use super::ReleaseOutcome;

pub(crate) struct SingletonSlot {
    component: Arc<str>,
    lifecycle: Arc<LifecycleManager>,
    instance: RwLock<Option<Arc<ComponentInstance>>>,
    /// Serializes construction so the factory runs once per generation
    creating: Mutex<()>,
    closed: RwLock<bool>,
}

impl SingletonSlot {
    pub(crate) fn new(component: Arc<str>, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            component,
            lifecycle,
            instance: RwLock::new(None),
            creating: Mutex::new(()),
            closed: RwLock::new(false),
        }
    }

    fn current(&self) -> Option<Arc<ComponentInstance>> {
        self.instance.read().as_ref().map(Arc::clone)
    }

    /// Creates the instance eagerly.
    pub(crate) fn initialize(&self) -> ContainerResult<()> {
        let instance = self.acquire(&Deadline::start(crate::timeout::AccessTimeout::Unbounded), None)?;
        self.release(instance, ReleaseOutcome::Success);
        Ok(())
    }

    /// Returns the shared instance, creating it on first use.
    ///
    /// Concurrent first callers wait on the creation lock within their
    /// deadline; the instance lock itself is taken later by the guard.
    pub(crate) fn acquire(
        &self,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<Arc<ComponentInstance>> {
        if *self.closed.read() {
            return Err(ContainerError::ShutDown);
        }
        if let Some(instance) = self.current() {
            instance.checkout();
            return Ok(instance);
        }

        let _creating = self.lock_creation(deadline, cancel)?;
        if *self.closed.read() {
            return Err(ContainerError::ShutDown);
        }
        if let Some(instance) = self.current() {
            instance.checkout();
            return Ok(instance);
        }

        let instance = self.lifecycle.create(InstanceId::Singleton)?;
        // Shutdown may have swept the slot while the factory ran.
        let closed = self.closed.read();
        if *closed {
            drop(closed);
            self.lifecycle.destroy(&instance, DestroyReason::Shutdown);
            return Err(ContainerError::ShutDown);
        }
        instance.checkout();
        *self.instance.write() = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn lock_creation(
        &self,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<parking_lot::MutexGuard<'_, ()>> {
        if let Some(guard) = self.creating.try_lock() {
            return Ok(guard);
        }
        loop {
            if let Some(token) = cancel {
                token.check(&self.component)?;
            }
            let slice = match deadline.remaining() {
                _ if deadline.is_immediate() => Duration::ZERO,
                Some(remaining) if cancel.is_some() => remaining.min(CANCELLATION_POLL),
                Some(remaining) => remaining,
                None => CANCELLATION_POLL,
            };
            if let Some(guard) = self.creating.try_lock_for(slice) {
                return Ok(guard);
            }
            if deadline.is_immediate() || deadline.expired() {
                return Err(ContainerError::Timeout {
                    component: self.component.to_string(),
                    waited: deadline.waited(),
                });
            }
        }
    }

    /// Hands the instance back. A discard retires the instance so the next
    /// call builds a fresh one; callers already holding it finish on it.
    pub(crate) fn release(&self, instance: Arc<ComponentInstance>, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::Discard {
            {
                let mut slot = self.instance.write();
                if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &instance)) {
                    *slot = None;
                }
            }
            instance.retire(DestroyReason::Discarded);
            tracing::warn!(component = %self.component, "singleton instance discarded");
        }
        if let Checkin::Destroy(reason) = instance.checkin() {
            self.lifecycle.destroy(&instance, reason);
        }
    }

    pub(crate) fn shutdown(&self) {
        *self.closed.write() = true;
        let instance = self.instance.write().take();
        if let Some(instance) = instance {
            if instance.retire(DestroyReason::Shutdown) {
                self.lifecycle.destroy(&instance, DestroyReason::Shutdown);
            }
        }
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let (idle, busy) = match self.current() {
            Some(instance) if instance.in_use() > 0 => (0, 1),
            Some(_) => (1, 0),
            None => (0, 0),
        };
        StoreStats {
            live: idle + busy,
            idle,
            busy,
            passivated: 0,
            waiting: 0,
            capacity: 1,
        }
    }
}
