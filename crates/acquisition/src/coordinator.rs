//! Admission control and per-(site, account) mutual exclusion
//!
//! A request is admitted when the global, per-site and per-account ceilings
//! all have room and no earlier request for the same (site, account) is still
//! queued. Otherwise it waits in a bounded FIFO queue for at most
//! `queue_timeout`. Once admitted it takes the slot mutex for its
//! (site, account), waiting at most `lock_timeout`.
//!
//! Counters, queue and slot table live behind one `std::sync::Mutex` that is
//! never held across an `.await` and never taken while waiting on a slot
//! mutex. Everything acquired is released by guards, so a caller dropped at
//! any await point cannot leak a counter, a queue entry or a slot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedMutexGuard, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::error::{Error, Result, TimeoutStage};
use crate::metrics;

type SlotKey = (String, String);

struct Waiter {
    ticket: u64,
    key: SlotKey,
    admit: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    active_global: usize,
    active_per_site: HashMap<String, usize>,
    active_per_account: HashMap<SlotKey, usize>,
    queue: VecDeque<Waiter>,
    slots: HashMap<SlotKey, Arc<tokio::sync::Mutex<()>>>,
    next_ticket: u64,
}

impl State {
    fn has_capacity(&self, limits: &LimitsConfig, key: &SlotKey) -> bool {
        self.active_global < limits.max_global
            && self.active_per_site.get(&key.0).copied().unwrap_or(0) < limits.max_per_site
            && self.active_per_account.get(key).copied().unwrap_or(0) < limits.max_per_account
    }

    fn occupy(&mut self, key: &SlotKey) {
        self.active_global += 1;
        *self.active_per_site.entry(key.0.clone()).or_default() += 1;
        *self.active_per_account.entry(key.clone()).or_default() += 1;
    }

    fn vacate(&mut self, key: &SlotKey) {
        self.active_global = self.active_global.saturating_sub(1);
        if let Some(n) = self.active_per_site.get_mut(&key.0) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.active_per_site.remove(&key.0);
            }
        }
        if let Some(n) = self.active_per_account.get_mut(key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.active_per_account.remove(key);
            }
        }
    }

    /// Admit queued waiters in FIFO order. A waiter that cannot be admitted
    /// blocks later waiters for the same key but not for other keys.
    fn admit_waiters(&mut self, limits: &LimitsConfig) {
        let mut blocked: HashSet<SlotKey> = HashSet::new();
        let mut i = 0;
        while i < self.queue.len() && self.active_global < limits.max_global {
            let key = &self.queue[i].key;
            if blocked.contains(key) || !self.has_capacity(limits, key) {
                blocked.insert(key.clone());
                i += 1;
                continue;
            }
            let Some(waiter) = self.queue.remove(i) else {
                break;
            };
            // Occupy even if the receiver is gone: a cancelled waiter finds
            // its ticket missing and vacates in `WaitTicket::drop`
            self.occupy(&waiter.key);
            let _ = waiter.admit.send(());
        }
    }

    fn dequeue(&mut self, ticket: u64) -> bool {
        match self.queue.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn slot(&mut self, key: &SlotKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.slots.entry(key.clone()).or_default())
    }
}

struct Inner {
    limits: LimitsConfig,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &SlotKey) {
        let mut state = self.state();
        state.vacate(key);
        state.admit_waiters(&self.limits);
    }
}

/// Point-in-time view of coordinator load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub active_global: usize,
    pub active_per_site: HashMap<String, usize>,
    pub queue_length: usize,
    pub slots: usize,
}

/// Owns the admission counters, wait queue and slot table.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResourceCoordinator {
    inner: Arc<Inner>,
}

impl ResourceCoordinator {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Wait for admission and then for the (site, account) slot.
    ///
    /// Fails with `Timeout { stage: Queue }` when the queue is full or the
    /// admission wait runs out, and `Timeout { stage: Lock }` when the slot
    /// stays held past `lock_timeout`.
    pub async fn acquire(&self, request_id: &str, site: &str, account: &str) -> Result<Permit> {
        let key: SlotKey = (site.to_string(), account.to_string());
        let started = Instant::now();

        let admission = self.admit(request_id, key, started).await?;
        let slot = self.inner.state().slot(&admission.key);

        match tokio::time::timeout(self.inner.limits.lock_timeout, slot.lock_owned()).await {
            Ok(guard) => {
                debug!(request_id, site, account, waited_ms = started.elapsed().as_millis() as u64, "permit granted");
                Ok(Permit {
                    _guard: guard,
                    admission,
                })
            }
            Err(_) => {
                warn!(request_id, site, account, "timed out waiting for account lock");
                metrics::record_timeout(TimeoutStage::Lock);
                Err(Error::Timeout {
                    stage: TimeoutStage::Lock,
                    elapsed: started.elapsed(),
                    attempts: Vec::new(),
                })
            }
        }
    }

    async fn admit(&self, request_id: &str, key: SlotKey, started: Instant) -> Result<Admission> {
        let limits = &self.inner.limits;
        let (rx, ticket) = {
            let mut state = self.inner.state();
            let same_key_queued = state.queue.iter().any(|w| w.key == key);
            if !same_key_queued && state.has_capacity(limits, &key) {
                state.occupy(&key);
                return Ok(Admission::new(&self.inner, key, request_id));
            }
            if state.queue.len() >= limits.max_queue_length {
                drop(state);
                warn!(request_id, site = %key.0, account = %key.1, "wait queue full");
                metrics::record_timeout(TimeoutStage::Queue);
                return Err(Error::Timeout {
                    stage: TimeoutStage::Queue,
                    elapsed: started.elapsed(),
                    attempts: Vec::new(),
                });
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                key: key.clone(),
                admit: tx,
            });
            debug!(request_id, site = %key.0, account = %key.1, queue_length = state.queue.len(), "request queued");
            (rx, ticket)
        };

        let mut ticket = WaitTicket {
            inner: &self.inner,
            ticket,
            key: &key,
            armed: true,
        };
        let _ = tokio::time::timeout(limits.queue_timeout, rx).await;

        // Still queued means not admitted, whether the wait timed out or not
        let still_queued = self.inner.state().dequeue(ticket.ticket);
        ticket.armed = false;
        drop(ticket);

        if still_queued {
            warn!(request_id, site = %key.0, account = %key.1, "timed out waiting in queue");
            metrics::record_timeout(TimeoutStage::Queue);
            return Err(Error::Timeout {
                stage: TimeoutStage::Queue,
                elapsed: started.elapsed(),
                attempts: Vec::new(),
            });
        }
        Ok(Admission::new(&self.inner, key, request_id))
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.inner.state();
        CoordinatorSnapshot {
            active_global: state.active_global,
            active_per_site: state.active_per_site.clone(),
            queue_length: state.queue.len(),
            slots: state.slots.len(),
        }
    }
}

/// Cleans up a queue entry if the waiting future is dropped mid-wait.
struct WaitTicket<'a> {
    inner: &'a Arc<Inner>,
    ticket: u64,
    key: &'a SlotKey,
    armed: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state();
        if !state.dequeue(self.ticket) {
            // admitted just before cancellation; hand the capacity back
            state.vacate(self.key);
            state.admit_waiters(&self.inner.limits);
        }
    }
}

/// Admitted capacity, returned to the coordinator on drop.
struct Admission {
    inner: Arc<Inner>,
    key: SlotKey,
    request_id: String,
}

impl Admission {
    fn new(inner: &Arc<Inner>, key: SlotKey, request_id: &str) -> Self {
        Self {
            inner: Arc::clone(inner),
            key,
            request_id: request_id.to_string(),
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.inner.release(&self.key);
        debug!(request_id = %self.request_id, site = %self.key.0, account = %self.key.1, "permit released");
    }
}

/// Exclusive right to log in for one (site, account).
///
/// Dropping the permit releases the slot mutex and then the admitted
/// capacity, admitting the next queued request.
pub struct Permit {
    _guard: OwnedMutexGuard<()>,
    admission: Admission,
}

impl Permit {
    pub fn site(&self) -> &str {
        &self.admission.key.0
    }

    pub fn account(&self) -> &str {
        &self.admission.key.1
    }

    pub fn request_id(&self) -> &str {
        &self.admission.request_id
    }

    /// Release explicitly; equivalent to dropping.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("request_id", &self.admission.request_id)
            .field("site", &self.admission.key.0)
            .field("account", &self.admission.key.1)
            .finish()
    }
}
