//! Session map for session-affine components.
//!
//! Each key maps to one slot. A slot is `Pending` while its instance is
//! being created, activated or passivated outside the map lock; callers
//! that reference a pending key wait (bounded) for it to settle.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cancellation::CancellationToken;
use crate::descriptor::SessionConfig;
use crate::error::{ContainerError, ContainerResult};
use crate::instance::{Checkin, ComponentInstance, DestroyReason, InstanceId, SessionKey};
use crate::internal::{wait, WaitStep};
use crate::lifecycle::{LifecycleManager, PassivatedState};
use crate::metrics::{EvictionReport, StoreStats};
use crate::timeout::Deadline;

use super::ReleaseOutcome;

enum Slot {
    Active(Arc<ComponentInstance>),
    Passivated(PassivatedState),
    Pending,
}

enum Lookup {
    Active(Arc<ComponentInstance>),
    Pending,
    Passivated,
    Missing,
}

#[derive(Default)]
struct SessionState {
    slots: AHashMap<SessionKey, Slot>,
    waiting: usize,
    closed: bool,
}

impl SessionState {
    /// Sessions occupying memory: active plus in-transition.
    fn resident(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| !matches!(slot, Slot::Passivated(_)))
            .count()
    }

    fn passivated(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Passivated(_)))
            .count()
    }

    /// Least recently used idle session.
    fn lru_idle(&self) -> Option<SessionKey> {
        self.slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Active(instance) if instance.in_use() == 0 => Some((key, instance.idle_for())),
                _ => None,
            })
            .max_by_key(|(_, idle)| *idle)
            .map(|(key, _)| key.clone())
    }
}

pub(crate) struct SessionMap {
    component: Arc<str>,
    config: SessionConfig,
    lifecycle: Arc<LifecycleManager>,
    state: Mutex<SessionState>,
    settled: Condvar,
}

impl SessionMap {
    pub(crate) fn new(component: Arc<str>, config: SessionConfig, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            component,
            config,
            lifecycle,
            state: Mutex::new(SessionState::default()),
            settled: Condvar::new(),
        }
    }

    fn no_such_session(&self, key: &SessionKey) -> ContainerError {
        ContainerError::NoSuchSession {
            component: self.component.to_string(),
            key: key.to_string(),
        }
    }

    /// Returns the instance for `key`, creating or activating it as needed.
    ///
    /// A busy session is returned as is; the guard serializes the caller
    /// behind the current holder.
    pub(crate) fn acquire(
        &self,
        key: &SessionKey,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<Arc<ComponentInstance>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(ContainerError::ShutDown);
            }

            let found = match state.slots.get(key) {
                Some(Slot::Active(instance)) => Lookup::Active(Arc::clone(instance)),
                Some(Slot::Pending) => Lookup::Pending,
                Some(Slot::Passivated(_)) => Lookup::Passivated,
                None => Lookup::Missing,
            };

            match found {
                Lookup::Active(instance) => {
                    instance.checkout();
                    return Ok(instance);
                }
                Lookup::Pending => self.wait_settled(&mut state, deadline, cancel)?,
                Lookup::Passivated => {
                    if !self.make_room(&mut state)? {
                        continue;
                    }
                    let Some(Slot::Passivated(passivated)) = state.slots.insert(key.clone(), Slot::Pending) else {
                        continue;
                    };
                    let activated = MutexGuard::unlocked(&mut state, || self.lifecycle.activate(key, passivated));
                    return self.settle(&mut state, key, activated);
                }
                Lookup::Missing => {
                    if !self.make_room(&mut state)? {
                        continue;
                    }
                    state.slots.insert(key.clone(), Slot::Pending);
                    let created = MutexGuard::unlocked(&mut state, || {
                        self.lifecycle.create(InstanceId::Session(key.clone()))
                    });
                    return self.settle(&mut state, key, created);
                }
            }
        }
    }

    /// Publishes the result of a create or activate on a pending slot.
    fn settle(
        &self,
        state: &mut MutexGuard<'_, SessionState>,
        key: &SessionKey,
        outcome: ContainerResult<Arc<ComponentInstance>>,
    ) -> ContainerResult<Arc<ComponentInstance>> {
        self.settled.notify_all();
        match outcome {
            Ok(instance) if state.closed => {
                state.slots.remove(key);
                MutexGuard::unlocked(state, || self.lifecycle.destroy(&instance, DestroyReason::Shutdown));
                Err(ContainerError::ShutDown)
            }
            Ok(instance) => {
                instance.checkout();
                state.slots.insert(key.clone(), Slot::Active(Arc::clone(&instance)));
                Ok(instance)
            }
            Err(err) => {
                state.slots.remove(key);
                Err(err)
            }
        }
    }

    fn wait_settled(
        &self,
        state: &mut MutexGuard<'_, SessionState>,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<()> {
        if deadline.is_immediate() {
            return Err(ContainerError::Timeout {
                component: self.component.to_string(),
                waited: deadline.waited(),
            });
        }
        state.waiting += 1;
        let step = wait(&self.settled, state, deadline, cancel);
        state.waiting -= 1;
        match step {
            WaitStep::Woken => Ok(()),
            WaitStep::TimedOut => Err(ContainerError::Timeout {
                component: self.component.to_string(),
                waited: deadline.waited(),
            }),
            WaitStep::Cancelled => Err(ContainerError::Cancelled {
                component: self.component.to_string(),
            }),
        }
    }

    /// Ensures one more session fits in memory, passivating the least
    /// recently used idle session if needed.
    ///
    /// Returns `Ok(false)` when the map changed while unlocked and the caller
    /// must look again.
    fn make_room(&self, state: &mut MutexGuard<'_, SessionState>) -> ContainerResult<bool> {
        if state.resident() < self.config.max_active {
            return Ok(true);
        }

        let victim = if self.lifecycle.can_passivate() { state.lru_idle() } else { None };
        let Some(victim) = victim else {
            return Err(ContainerError::Exhausted {
                component: self.component.to_string(),
                capacity: self.config.max_active,
            });
        };

        self.passivate_slot(state, &victim);
        Ok(false)
    }

    /// Passivates an idle active slot outside the lock. Returns true when it moved out of memory.
    fn passivate_slot(&self, state: &mut MutexGuard<'_, SessionState>, key: &SessionKey) -> bool {
        let Some(Slot::Active(instance)) = state.slots.insert(key.clone(), Slot::Pending) else {
            return false;
        };
        let frozen = MutexGuard::unlocked(state, || self.lifecycle.passivate(&instance));
        self.settled.notify_all();
        match frozen {
            Ok(passivated) => {
                state.slots.insert(key.clone(), Slot::Passivated(passivated));
                true
            }
            Err(err) => {
                // Already destroyed by the lifecycle manager.
                state.slots.remove(key);
                tracing::warn!(component = %self.component, session = %key, error = %err, "session lost during passivation");
                false
            }
        }
    }

    /// Hands a session instance back after a call.
    pub(crate) fn release(&self, instance: Arc<ComponentInstance>, outcome: ReleaseOutcome) {
        let retire_as = match outcome {
            ReleaseOutcome::Success => None,
            ReleaseOutcome::Discard => Some(DestroyReason::Discarded),
            ReleaseOutcome::RemoveSession => Some(DestroyReason::SessionRemoved),
        };

        if let Some(reason) = retire_as {
            if let Some(key) = instance.id().session_key() {
                let mut state = self.state.lock();
                if matches!(state.slots.get(key), Some(Slot::Active(current)) if Arc::ptr_eq(current, &instance)) {
                    state.slots.remove(key);
                }
                self.settled.notify_all();
            }
            instance.retire(reason);
        }

        if let Checkin::Destroy(reason) = instance.checkin() {
            self.lifecycle.destroy(&instance, reason);
        }
    }

    /// Creates a session under a generated key.
    pub(crate) fn create(&self, deadline: &Deadline) -> ContainerResult<SessionKey> {
        let key = SessionKey::generate();
        let instance = self.acquire(&key, deadline, None)?;
        self.release(instance, ReleaseOutcome::Success);
        Ok(key)
    }

    /// Destroys a session with pre-destroy, activating it first if it is passivated.
    pub(crate) fn remove(&self, key: &SessionKey, deadline: &Deadline) -> ContainerResult<()> {
        let mut state = self.state.lock();
        loop {
            match state.slots.get(key) {
                None => return Err(self.no_such_session(key)),
                Some(Slot::Pending) => {
                    self.wait_settled(&mut state, deadline, None)?;
                }
                Some(Slot::Active(_)) => {
                    let Some(Slot::Active(instance)) = state.slots.remove(key) else {
                        continue;
                    };
                    self.settled.notify_all();
                    drop(state);
                    if instance.retire(DestroyReason::SessionRemoved) {
                        self.lifecycle.destroy(&instance, DestroyReason::SessionRemoved);
                    }
                    return Ok(());
                }
                Some(Slot::Passivated(_)) => {
                    let Some(Slot::Passivated(passivated)) = state.slots.remove(key) else {
                        continue;
                    };
                    self.settled.notify_all();
                    drop(state);
                    match self.lifecycle.activate(key, passivated) {
                        Ok(instance) => self.lifecycle.destroy(&instance, DestroyReason::SessionRemoved),
                        Err(err) => {
                            tracing::warn!(component = %self.component, session = %key, error = %err, "removed session could not be activated for pre-destroy");
                        }
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Expires timed-out sessions and passivates sessions idle for `older_than`.
    pub(crate) fn evict_idle(&self, older_than: Duration) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut expired_active = Vec::new();
        let mut expired_passivated = Vec::new();

        let mut state = self.state.lock();
        if let Some(timeout) = self.config.timeout {
            let keys: Vec<SessionKey> = state
                .slots
                .iter()
                .filter(|(_, slot)| match slot {
                    Slot::Active(instance) => instance.in_use() == 0 && instance.idle_for() >= timeout,
                    Slot::Passivated(passivated) => passivated.idle_for() >= timeout,
                    Slot::Pending => false,
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                match state.slots.remove(&key) {
                    Some(Slot::Active(instance)) => expired_active.push(instance),
                    Some(Slot::Passivated(passivated)) => expired_passivated.push((key, passivated)),
                    Some(Slot::Pending) | None => {}
                }
            }
        }

        if self.lifecycle.can_passivate() {
            let idle: Vec<SessionKey> = state
                .slots
                .iter()
                .filter(|(_, slot)| {
                    matches!(slot, Slot::Active(instance) if instance.in_use() == 0 && instance.idle_for() >= older_than)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in idle {
                if self.passivate_slot(&mut state, &key) {
                    report.sessions_passivated += 1;
                }
            }
        }
        self.settled.notify_all();
        drop(state);

        for instance in expired_active {
            if instance.retire(DestroyReason::SessionExpired) {
                self.lifecycle.destroy(&instance, DestroyReason::SessionExpired);
            }
            report.sessions_expired += 1;
        }
        for (key, passivated) in expired_passivated {
            // Timed out while out of memory: no pre-destroy.
            self.lifecycle.discard_passivated(&key, passivated, DestroyReason::SessionExpired);
            report.sessions_expired += 1;
        }
        report
    }

    /// Stops accepting calls and destroys every session.
    pub(crate) fn shutdown(&self) {
        let slots: Vec<(SessionKey, Slot)> = {
            let mut state = self.state.lock();
            state.closed = true;
            self.settled.notify_all();
            state.slots.drain().collect()
        };
        for (key, slot) in slots {
            match slot {
                Slot::Active(instance) => {
                    if instance.retire(DestroyReason::Shutdown) {
                        self.lifecycle.destroy(&instance, DestroyReason::Shutdown);
                    }
                }
                Slot::Passivated(passivated) => {
                    self.lifecycle.discard_passivated(&key, passivated, DestroyReason::Shutdown);
                }
                Slot::Pending => {}
            }
        }
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        let (mut idle, mut busy) = (0, 0);
        for slot in state.slots.values() {
            if let Slot::Active(instance) = slot {
                if instance.in_use() == 0 {
                    idle += 1;
                } else {
                    busy += 1;
                }
            }
        }
        StoreStats {
            live: idle + busy,
            idle,
            busy,
            passivated: state.passivated(),
            waiting: state.waiting,
            capacity: self.config.max_active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ComponentDescriptor;
    use crate::instance::InstanceState;
    use crate::observer::Observers;
    use crate::timeout::AccessTimeout;

    #[derive(Debug, PartialEq)]
    struct Cart(u8);

    fn sessions(max_active: usize, timeout: Option<Duration>, passivation: bool) -> SessionMap {
        let mut builder = ComponentDescriptor::session("Cart", || Cart(7));
        if passivation {
            builder = builder.passivation(|cart: &Cart| Ok(vec![cart.0]), |bytes: &[u8]| Ok(Cart(bytes[0])));
        }
        let descriptor = builder.build();
        let lifecycle = Arc::new(LifecycleManager::new(&descriptor, Observers::new()));
        SessionMap::new(Arc::from("Cart"), SessionConfig { max_active, timeout }, lifecycle)
    }

    fn deadline() -> Deadline {
        AccessTimeout::Bounded(Duration::from_millis(100)).deadline()
    }

    #[test]
    fn same_key_same_instance() {
        let map = sessions(4, None, false);
        let key = SessionKey::new("a");
        let first = map.acquire(&key, &deadline(), None).unwrap();
        let second = map.acquire(&key, &deadline(), None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.in_use(), 2);
        map.release(first, ReleaseOutcome::Success);
        map.release(second, ReleaseOutcome::Success);
        assert_eq!(map.stats().idle, 1);
    }

    #[test]
    fn full_map_without_passivation_is_exhausted() {
        let map = sessions(1, None, false);
        let a = map.acquire(&SessionKey::new("a"), &deadline(), None).unwrap();
        map.release(a, ReleaseOutcome::Success);

        let err = map.acquire(&SessionKey::new("b"), &deadline(), None).unwrap_err();
        assert!(matches!(err, ContainerError::Exhausted { capacity: 1, .. }));
    }

    #[test]
    fn capacity_pressure_passivates_lru_session() {
        let map = sessions(1, None, true);
        let a = map.acquire(&SessionKey::new("a"), &deadline(), None).unwrap();
        map.release(a, ReleaseOutcome::Success);

        let b = map.acquire(&SessionKey::new("b"), &deadline(), None).unwrap();
        map.release(b, ReleaseOutcome::Success);
        assert_eq!(map.stats().passivated, 1);

        // Reactivating "a" pushes "b" out in turn.
        let a = map.acquire(&SessionKey::new("a"), &deadline(), None).unwrap();
        assert_eq!(a.bean_as::<Cart>(), Some(&Cart(7)));
        map.release(a, ReleaseOutcome::Success);
        let stats = map.stats();
        assert_eq!((stats.live, stats.passivated), (1, 1));
    }

    #[test]
    fn remove_destroys_and_forgets() {
        let map = sessions(4, None, false);
        let key = SessionKey::new("gone");
        let instance = map.acquire(&key, &deadline(), None).unwrap();
        map.release(instance.clone(), ReleaseOutcome::Success);

        map.remove(&key, &deadline()).unwrap();
        assert_eq!(instance.state(), InstanceState::Destroyed);
        assert!(matches!(map.remove(&key, &deadline()), Err(ContainerError::NoSuchSession { .. })));
    }

    #[test]
    fn remove_of_busy_session_destroys_on_last_release() {
        let map = sessions(4, None, false);
        let key = SessionKey::new("busy");
        let instance = map.acquire(&key, &deadline(), None).unwrap();

        map.remove(&key, &deadline()).unwrap();
        assert!(instance.is_retired());
        assert_ne!(instance.state(), InstanceState::Destroyed);

        map.release(instance.clone(), ReleaseOutcome::Success);
        assert_eq!(instance.state(), InstanceState::Destroyed);
    }

    #[test]
    fn expired_passivated_sessions_skip_pre_destroy() {
        let map = sessions(4, Some(Duration::from_millis(30)), true);
        let key = SessionKey::new("sleepy");
        let instance = map.acquire(&key, &deadline(), None).unwrap();
        map.release(instance, ReleaseOutcome::Success);

        let report = map.evict_idle(Duration::ZERO);
        assert_eq!(report.sessions_passivated, 1);

        std::thread::sleep(Duration::from_millis(40));
        let report = map.evict_idle(Duration::from_secs(60));
        assert_eq!(report.sessions_expired, 1);
        assert_eq!(map.stats(), StoreStats { capacity: 4, ..StoreStats::default() });
        assert_eq!(map.lifecycle.stats().destroyed, 1);
    }
}
