//! Concurrency guard: fair read/write locking with bounded waits.
//!
//! Every [`ComponentInstance`] carries one [`FairLock`]. A singleton has a
//! single instance, so its lock is the component-wide lock; a session-affine
//! component gets one lock per session key; pooled instances are never shared,
//! so their locks are uncontended. The [`ConcurrencyGuard`] of a component
//! decides which lock class a call takes and performs the bounded acquisition.
//!
//! Waiters are served strictly in arrival order. A reader may only overtake
//! nobody: it proceeds when no writer holds the lock and every waiter queued
//! ahead of it is also a reader.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancellation::CancellationToken;
use crate::descriptor::{ComponentKind, ConcurrencyMode};
use crate::error::{ContainerError, ContainerResult};
use crate::instance::ComponentInstance;
use crate::internal::{wait, WaitStep};
use crate::timeout::Deadline;

/// Lock class of a business call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared with other readers, excluded by writers
    Read,
    /// Exclusive
    Write,
}

/// Why a lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockFailure {
    TimedOut,
    Cancelled,
}

/// FIFO read/write lock with deadline- and cancellation-aware waits.
pub(crate) struct FairLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
    queue: VecDeque<(u64, LockType)>,
    next_ticket: u64,
}

impl LockState {
    fn compatible(&self, lock: LockType) -> bool {
        match lock {
            LockType::Read => !self.writer,
            LockType::Write => !self.writer && self.readers == 0,
        }
    }

    fn is_turn(&self, ticket: u64, lock: LockType) -> bool {
        match lock {
            LockType::Write => self.queue.front().map(|(t, _)| *t) == Some(ticket),
            LockType::Read => self
                .queue
                .iter()
                .take_while(|(t, _)| *t != ticket)
                .all(|(_, kind)| *kind == LockType::Read),
        }
    }

    fn grant(&mut self, lock: LockType) {
        match lock {
            LockType::Read => self.readers += 1,
            LockType::Write => self.writer = true,
        }
    }

    fn dequeue(&mut self, ticket: u64) {
        self.queue.retain(|(t, _)| *t != ticket);
    }
}

impl FairLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn acquire(
        &self,
        lock: LockType,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), LockFailure> {
        let mut state = self.state.lock();

        if state.queue.is_empty() && state.compatible(lock) {
            state.grant(lock);
            return Ok(());
        }
        if deadline.is_immediate() {
            return Err(LockFailure::TimedOut);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back((ticket, lock));

        loop {
            if state.compatible(lock) && state.is_turn(ticket, lock) {
                state.dequeue(ticket);
                state.grant(lock);
                if lock == LockType::Read {
                    // Readers queued right behind may now follow.
                    self.cond.notify_all();
                }
                return Ok(());
            }

            let failure = match wait(&self.cond, &mut state, deadline, cancel) {
                WaitStep::Woken => continue,
                WaitStep::TimedOut => LockFailure::TimedOut,
                WaitStep::Cancelled => LockFailure::Cancelled,
            };
            state.dequeue(ticket);
            self.cond.notify_all();
            return Err(failure);
        }
    }

    pub(crate) fn release(&self, lock: LockType) {
        let mut state = self.state.lock();
        match lock {
            LockType::Read => state.readers = state.readers.saturating_sub(1),
            LockType::Write => state.writer = false,
        }
        self.cond.notify_all();
    }

    #[cfg(test)]
    fn holders(&self) -> (usize, bool, usize) {
        let state = self.state.lock();
        (state.readers, state.writer, state.queue.len())
    }
}

/// Proof that a call holds an instance lock; releases it on drop.
#[must_use = "the lock is released as soon as the permit is dropped"]
pub struct LockPermit {
    instance: Arc<ComponentInstance>,
    lock: LockType,
}

impl LockPermit {
    /// The lock class held.
    pub fn lock_type(&self) -> LockType {
        self.lock
    }
}

impl Drop for LockPermit {
    fn drop(&mut self) {
        self.instance.lock().release(self.lock);
    }
}

impl std::fmt::Debug for LockPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockPermit")
            .field("instance", self.instance.id())
            .field("lock", &self.lock)
            .finish()
    }
}

/// Per-component access policy.
///
/// # Examples
///
/// ```
/// use ferrous_container::{ConcurrencyGuard, ConcurrencyMode, ComponentKind, LockType};
///
/// let guard = ConcurrencyGuard::new("Catalog", ComponentKind::Singleton, ConcurrencyMode::Exclusive);
/// assert_eq!(guard.resolve(None), LockType::Write);
/// assert_eq!(guard.resolve(Some(LockType::Read)), LockType::Read);
///
/// let sessions = ConcurrencyGuard::new("Cart", ComponentKind::SessionAffine, ConcurrencyMode::Concurrent);
/// assert_eq!(sessions.resolve(Some(LockType::Read)), LockType::Write);
/// ```
#[derive(Debug, Clone)]
pub struct ConcurrencyGuard {
    component: Arc<str>,
    kind: ComponentKind,
    mode: ConcurrencyMode,
}

impl ConcurrencyGuard {
    /// Creates the guard for a component.
    pub fn new(component: impl Into<Arc<str>>, kind: ComponentKind, mode: ConcurrencyMode) -> Self {
        Self {
            component: component.into(),
            kind,
            mode,
        }
    }

    /// Declared concurrency mode.
    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }

    /// Resolves the lock class for a method with an optional hint.
    ///
    /// Session-affine instances are always serialized per key.
    pub fn resolve(&self, hint: Option<LockType>) -> LockType {
        if self.kind == ComponentKind::SessionAffine {
            return LockType::Write;
        }
        match self.mode {
            ConcurrencyMode::Exclusive => hint.unwrap_or(LockType::Write),
            ConcurrencyMode::Concurrent => hint.unwrap_or(LockType::Read),
        }
    }

    /// Acquires `lock` on the instance, waiting no longer than the deadline.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Timeout`] when the deadline passes (immediately for a
    /// zero timeout), [`ContainerError::Cancelled`] when the token fires.
    pub fn acquire(
        &self,
        instance: &Arc<ComponentInstance>,
        lock: LockType,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<LockPermit> {
        match instance.lock().acquire(lock, deadline, cancel) {
            Ok(()) => Ok(LockPermit {
                instance: Arc::clone(instance),
                lock,
            }),
            Err(LockFailure::TimedOut) => {
                tracing::debug!(
                    component = %self.component,
                    instance = %instance.id(),
                    ?lock,
                    waited = ?deadline.waited(),
                    "lock acquisition timed out"
                );
                Err(ContainerError::Timeout {
                    component: self.component.to_string(),
                    waited: deadline.waited(),
                })
            }
            Err(LockFailure::Cancelled) => Err(ContainerError::Cancelled {
                component: self.component.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::AccessTimeout;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn unbounded() -> Deadline {
        AccessTimeout::Unbounded.deadline()
    }

    #[test]
    fn readers_share_writers_exclude() {
        let lock = FairLock::new();
        lock.acquire(LockType::Read, &unbounded(), None).unwrap();
        lock.acquire(LockType::Read, &unbounded(), None).unwrap();
        assert_eq!(lock.holders(), (2, false, 0));

        let immediate = AccessTimeout::Immediate.deadline();
        assert_eq!(lock.acquire(LockType::Write, &immediate, None), Err(LockFailure::TimedOut));

        lock.release(LockType::Read);
        lock.release(LockType::Read);
        lock.acquire(LockType::Write, &immediate, None).unwrap();
        assert_eq!(lock.holders(), (0, true, 0));
    }

    #[test]
    fn bounded_wait_times_out_after_deadline() {
        let lock = FairLock::new();
        lock.acquire(LockType::Write, &unbounded(), None).unwrap();

        let started = Instant::now();
        let deadline = AccessTimeout::Bounded(Duration::from_millis(40)).deadline();
        assert_eq!(lock.acquire(LockType::Read, &deadline, None), Err(LockFailure::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(lock.holders(), (0, true, 0));
    }

    #[test]
    fn cancelled_waiter_leaves_queue() {
        let lock = Arc::new(FairLock::new());
        lock.acquire(LockType::Write, &unbounded(), None).unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let lock = Arc::clone(&lock);
            let token = token.clone();
            thread::spawn(move || lock.acquire(LockType::Write, &unbounded(), Some(&token)))
        };
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert_eq!(waiter.join().unwrap(), Err(LockFailure::Cancelled));
        assert_eq!(lock.holders(), (0, true, 0));
    }

    #[test]
    fn queued_writer_blocks_later_readers() {
        let lock = Arc::new(FairLock::new());
        lock.acquire(LockType::Read, &unbounded(), None).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let writer = {
            let (lock, order) = (Arc::clone(&lock), Arc::clone(&order));
            thread::spawn(move || {
                lock.acquire(LockType::Write, &unbounded(), None).unwrap();
                order.lock().push("writer");
                lock.release(LockType::Write);
            })
        };
        thread::sleep(Duration::from_millis(20));

        let reader = {
            let (lock, order) = (Arc::clone(&lock), Arc::clone(&order));
            thread::spawn(move || {
                lock.acquire(LockType::Read, &unbounded(), None).unwrap();
                order.lock().push("reader");
                lock.release(LockType::Read);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(order.lock().is_empty());

        lock.release(LockType::Read);
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(*order.lock(), vec!["writer", "reader"]);
    }

    #[test]
    fn writers_are_mutually_exclusive() {
        let lock = Arc::new(FairLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        crossbeam_utils::thread::scope(|s| {
            for _ in 0..8 {
                let (lock, active, peak) = (&lock, &active, &peak);
                s.spawn(move |_| {
                    for _ in 0..20 {
                        lock.acquire(LockType::Write, &unbounded(), None).unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        active.fetch_sub(1, Ordering::SeqCst);
                        lock.release(LockType::Write);
                    }
                });
            }
        })
        .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
