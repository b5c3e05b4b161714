//! Bounded instance pool for pooled components.
//!
//! Idle instances sit in a stack so the most recently used (warmest) one is
//! handed out first, while sweeps retire from the cold end. Waiters are
//! served in arrival order through a ticket queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancellation::CancellationToken;
use crate::descriptor::PoolConfig;
use crate::error::{ContainerError, ContainerResult};
use crate::instance::{Checkin, ComponentInstance, DestroyReason};
use crate::internal::{wait, WaitStep};
use crate::lifecycle::LifecycleManager;
use crate::metrics::{EvictionReport, StoreStats};
use crate::timeout::Deadline;

use super::ReleaseOutcome;

pub(crate) struct InstancePool {
    component: Arc<str>,
    config: PoolConfig,
    lifecycle: Arc<LifecycleManager>,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Arc<ComponentInstance>>,
    /// Counted instances: idle, busy and reserved for creation
    live: usize,
    /// Surplus instances of a non-strict pool
    overflow: usize,
    waiters: VecDeque<u64>,
    next_ticket: u64,
    closed: bool,
}

impl PoolState {
    fn is_turn(&self, ticket: Option<u64>) -> bool {
        match (self.waiters.front(), ticket) {
            (None, _) => true,
            (Some(front), Some(mine)) => *front == mine,
            (Some(_), None) => false,
        }
    }

    fn leave(&mut self, ticket: Option<u64>) {
        if let Some(ticket) = ticket {
            self.waiters.retain(|t| *t != ticket);
        }
    }
}

enum Grab {
    Ready(Arc<ComponentInstance>),
    Create,
    Overflow,
}

impl InstancePool {
    pub(crate) fn new(component: Arc<str>, config: PoolConfig, lifecycle: Arc<LifecycleManager>) -> Self {
        Self {
            component,
            config,
            lifecycle,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    fn is_stale(&self, instance: &ComponentInstance) -> Option<DestroyReason> {
        if instance.generation() < self.lifecycle.generation() {
            return Some(DestroyReason::Flushed);
        }
        match self.config.max_age {
            Some(max_age) if instance.age() >= max_age => Some(DestroyReason::Aged),
            _ => None,
        }
    }

    /// Checks out an idle instance, creates one below max, or waits.
    pub(crate) fn acquire(
        &self,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
    ) -> ContainerResult<Arc<ComponentInstance>> {
        let mut stale = Vec::new();
        let grab = self.grab(deadline, cancel, &mut stale);
        for (instance, reason) in stale {
            self.lifecycle.destroy(&instance, reason);
        }

        match grab? {
            Grab::Ready(instance) => Ok(instance),
            Grab::Create => match self.lifecycle.create(self.lifecycle.next_pool_id()) {
                Ok(instance) => {
                    instance.checkout();
                    Ok(instance)
                }
                Err(err) => {
                    let mut state = self.state.lock();
                    state.live -= 1;
                    self.available.notify_all();
                    Err(err)
                }
            },
            Grab::Overflow => match self.lifecycle.create(self.lifecycle.next_pool_id()) {
                Ok(instance) => {
                    instance.retire(DestroyReason::Overflow);
                    instance.checkout();
                    Ok(instance)
                }
                Err(err) => {
                    self.state.lock().overflow -= 1;
                    Err(err)
                }
            },
        }
    }

    fn grab(
        &self,
        deadline: &Deadline,
        cancel: Option<&CancellationToken>,
        stale: &mut Vec<(Arc<ComponentInstance>, DestroyReason)>,
    ) -> ContainerResult<Grab> {
        let mut state = self.state.lock();
        let mut ticket = None;

        loop {
            if state.closed {
                state.leave(ticket);
                return Err(ContainerError::ShutDown);
            }

            if state.is_turn(ticket) {
                while let Some(instance) = state.idle.pop_back() {
                    match self.is_stale(&instance) {
                        Some(reason) => {
                            state.live -= 1;
                            stale.push((instance, reason));
                        }
                        None => {
                            instance.checkout();
                            state.leave(ticket);
                            self.available.notify_all();
                            return Ok(Grab::Ready(instance));
                        }
                    }
                }

                if state.live < self.config.max {
                    state.live += 1;
                    state.leave(ticket);
                    self.available.notify_all();
                    return Ok(Grab::Create);
                }

                if !self.config.strict {
                    state.overflow += 1;
                    state.leave(ticket);
                    return Ok(Grab::Overflow);
                }
            }

            if deadline.is_immediate() {
                state.leave(ticket);
                return Err(ContainerError::Exhausted {
                    component: self.component.to_string(),
                    capacity: self.config.max,
                });
            }

            if ticket.is_none() {
                let mine = state.next_ticket;
                state.next_ticket += 1;
                state.waiters.push_back(mine);
                ticket = Some(mine);
            }

            let failure = match wait(&self.available, &mut state, deadline, cancel) {
                WaitStep::Woken => continue,
                WaitStep::TimedOut => ContainerError::Timeout {
                    component: self.component.to_string(),
                    waited: deadline.waited(),
                },
                WaitStep::Cancelled => ContainerError::Cancelled {
                    component: self.component.to_string(),
                },
            };
            state.leave(ticket);
            self.available.notify_all();
            tracing::debug!(component = %self.component, error = %failure, "pool wait abandoned");
            return Err(failure);
        }
    }

    /// Hands an instance back after a call.
    pub(crate) fn release(&self, instance: Arc<ComponentInstance>, outcome: ReleaseOutcome) {
        let overflow = instance.retired_reason() == Some(DestroyReason::Overflow);
        let discard = outcome == ReleaseOutcome::Discard;
        if discard {
            instance.retire(DestroyReason::Discarded);
        }
        let checkin = instance.checkin();

        let mut state = self.state.lock();
        let destroy = match checkin {
            Checkin::StillInUse => return,
            Checkin::Destroy(_) if discard => Some(DestroyReason::Discarded),
            Checkin::Destroy(reason) => Some(reason),
            Checkin::Idle if state.closed => Some(DestroyReason::Shutdown),
            Checkin::Idle => self.is_stale(&instance),
        };

        match destroy {
            Some(reason) => {
                if overflow {
                    state.overflow -= 1;
                } else {
                    state.live -= 1;
                }
                self.available.notify_all();
                drop(state);
                self.lifecycle.destroy(&instance, reason);
            }
            None => {
                state.idle.push_back(instance);
                self.available.notify_all();
            }
        }
    }

    /// Creates instances until `min` are live.
    pub(crate) fn prefill(&self) -> ContainerResult<usize> {
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.closed || state.live >= self.config.min {
                    return Ok(created);
                }
                state.live += 1;
            }

            match self.lifecycle.create(self.lifecycle.next_pool_id()) {
                Ok(instance) => {
                    let mut state = self.state.lock();
                    state.idle.push_front(instance);
                    self.available.notify_all();
                    created += 1;
                }
                Err(err) => {
                    let mut state = self.state.lock();
                    state.live -= 1;
                    self.available.notify_all();
                    return Err(err);
                }
            }
        }
    }

    /// Destroys aged instances and idle ones above `min`, then refills to `min`.
    pub(crate) fn evict_idle(&self, older_than: std::time::Duration) -> EvictionReport {
        let threshold = self.config.idle_timeout.unwrap_or(older_than);
        let mut report = EvictionReport::default();
        let mut victims = Vec::new();

        {
            let mut state = self.state.lock();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            // Coldest first.
            while let Some(instance) = state.idle.pop_front() {
                if let Some(reason) = self.is_stale(&instance) {
                    state.live -= 1;
                    report.aged_destroyed += 1;
                    victims.push((instance, reason));
                } else if state.live > self.config.min && instance.idle_for() >= threshold {
                    state.live -= 1;
                    report.idle_destroyed += 1;
                    victims.push((instance, DestroyReason::Idle));
                } else {
                    kept.push_back(instance);
                }
            }
            state.idle = kept;
            if !victims.is_empty() {
                self.available.notify_all();
            }
        }

        for (instance, reason) in victims {
            self.lifecycle.destroy(&instance, reason);
        }
        if let Err(err) = self.prefill() {
            tracing::warn!(component = %self.component, error = %err, "could not refill pool to its minimum");
        }
        report
    }

    /// Retires every current instance: idle ones now, busy ones on release.
    pub(crate) fn flush(&self) -> usize {
        self.lifecycle.bump_generation();
        let idle: Vec<_> = {
            let mut state = self.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            self.available.notify_all();
            drained
        };
        let flushed = idle.len();
        for instance in idle {
            self.lifecycle.destroy(&instance, DestroyReason::Flushed);
        }
        tracing::info!(component = %self.component, flushed, "pool flushed");
        flushed
    }

    /// Stops handing out instances and destroys the idle ones.
    pub(crate) fn shutdown(&self) {
        let idle: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            self.available.notify_all();
            drained
        };
        for instance in idle {
            self.lifecycle.destroy(&instance, DestroyReason::Shutdown);
        }
    }

    pub(crate) fn stats(&self) -> StoreStats {
        let state = self.state.lock();
        StoreStats {
            live: state.live + state.overflow,
            idle: state.idle.len(),
            busy: state.live + state.overflow - state.idle.len(),
            passivated: 0,
            waiting: state.waiters.len(),
            capacity: self.config.max,
        }
    }
}
