//! Generic keyed object pool with bounded sizing, validation, idle eviction
//! and arrival-order fairness.
//!
//! One entry per key, each with its own lock. A returned object is handed
//! directly to the earliest waiter instead of re-entering the idle queue.
//! When `disposable` is enabled, a borrow that outwaits its deadline
//! fabricates an untracked single-use object instead of failing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// How often the background sweep looks for overdue idle objects.
const EVICTION_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Creates, destroys and validates pooled objects for one key.
#[async_trait]
pub trait PoolableObjectFactory<K, V>: Send + Sync {
    async fn create(&self, key: &K) -> anyhow::Result<V>;
    async fn destroy(&self, key: &K, value: V);
    async fn validate(&self, key: &K, value: &V) -> bool;
}

/// Pool construction parameters.
pub struct Builder<K, V> {
    factory: Arc<dyn PoolableObjectFactory<K, V>>,
    name: String,
    min: usize,
    max: usize,
    keep_alive: Option<Duration>,
    disposable: bool,
    borrow_validation: bool,
    return_validation: bool,
}

impl<K, V> Builder<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(factory: Arc<dyn PoolableObjectFactory<K, V>>) -> Self {
        Self {
            factory,
            name: "object-pool".to_string(),
            min: 5,
            max: usize::MAX,
            keep_alive: Some(Duration::from_secs(30 * 60)),
            disposable: false,
            borrow_validation: false,
            return_validation: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Floor per key; `create_all_min_objects` fills up to this count.
    pub fn min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    /// Ceiling of managed objects per key.
    pub fn max(mut self, max: usize) -> Self {
        self.max = max.max(1);
        self
    }

    /// Idle lifetime before eviction; `None` disables eviction.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Allow over-cap single-use objects when a borrow times out.
    pub fn disposable(mut self, disposable: bool) -> Self {
        self.disposable = disposable;
        self
    }

    pub fn borrow_validation(mut self, on: bool) -> Self {
        self.borrow_validation = on;
        self
    }

    pub fn return_validation(mut self, on: bool) -> Self {
        self.return_validation = on;
        self
    }

    pub fn build(self) -> BaseObjectPool<K, V> {
        let min = self.min.min(self.max);
        let shared = Arc::new(PoolShared {
            factory: self.factory,
            name: self.name,
            min,
            max: self.max,
            keep_alive: self.keep_alive,
            disposable: self.disposable,
            borrow_validation: self.borrow_validation,
            return_validation: self.return_validation,
            entries: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        let sweeper = self.keep_alive.map(|_| spawn_sweeper(Arc::downgrade(&shared)));
        BaseObjectPool { shared, sweeper: Mutex::new(sweeper) }
    }
}

/// Multi-keyed object pool. See the module documentation.
pub struct BaseObjectPool<K, V> {
    shared: Arc<PoolShared<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct PoolShared<K, V> {
    factory: Arc<dyn PoolableObjectFactory<K, V>>,
    name: String,
    min: usize,
    max: usize,
    keep_alive: Option<Duration>,
    disposable: bool,
    borrow_validation: bool,
    return_validation: bool,
    entries: Mutex<HashMap<K, Arc<EntryHandle<V>>>>,
    destroyed: AtomicBool,
}

struct EntryHandle<V> {
    state: Mutex<EntryState<V>>,
}

impl<V> EntryHandle<V> {
    /// Reserve a creation slot toward `min` if one is still needed. Returns
    /// `true` when a slot was reserved and the caller must create an object.
    fn reserve_min_slot(&self, min: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.destroyed || state.managed() >= min {
            false
        } else {
            state.creating += 1;
            true
        }
    }

    /// Complete a reserved creation. Returns the value back to the caller
    /// for disposal when the entry was destroyed while the factory ran.
    fn complete_min_slot(&self, value: V) -> Option<V> {
        let mut state = self.state.lock().unwrap();
        state.creating -= 1;
        if state.destroyed {
            Some(value)
        } else {
            state.idle.push_back(IdleObject { value, returned_at: Instant::now() });
            state.record_peak();
            None
        }
    }

    /// Release a reserved creation slot after the factory failed.
    fn cancel_min_slot(&self) {
        self.state.lock().unwrap().creating -= 1;
    }
}

struct EntryState<V> {
    idle: VecDeque<IdleObject<V>>,
    /// Borrowed managed objects.
    active: usize,
    /// Reserved creation slots counted against `max` while the factory runs.
    creating: usize,
    peak: usize,
    /// Outstanding untracked objects handed out beyond `max`.
    disposables: HashSet<V>,
    waiters: VecDeque<oneshot::Sender<V>>,
    destroyed: bool,
}

struct IdleObject<V> {
    value: V,
    returned_at: Instant,
}

impl<V> EntryState<V> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            active: 0,
            creating: 0,
            peak: 0,
            disposables: HashSet::new(),
            waiters: VecDeque::new(),
            destroyed: false,
        }
    }

    /// Objects whose lifetime this entry currently tracks.
    fn managed(&self) -> usize {
        self.idle.len() + self.active + self.creating
    }

    fn record_peak(&mut self) {
        let managed = self.idle.len() + self.active;
        if managed > self.peak {
            self.peak = managed;
        }
    }
}

enum BorrowPlan<V> {
    Idle(V),
    Create,
    Wait(oneshot::Receiver<V>),
}

impl<K, V> BaseObjectPool<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lookup(&self, key: &K) -> Option<Arc<EntryHandle<V>>> {
        self.shared.entries.lock().unwrap().get(key).cloned()
    }

    fn entry(&self, key: &K) -> Arc<EntryHandle<V>> {
        let mut entries = self.shared.entries.lock().unwrap();
        entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(EntryHandle { state: Mutex::new(EntryState::new()) }))
            .clone()
    }

    /// Borrow an object for `key`, waiting up to `timeout` (`None` waits
    /// forever) for capacity. Invalid candidates are destroyed and replaced
    /// until the deadline is reached.
    pub async fn borrow_object(&self, key: &K, timeout: Option<Duration>) -> Result<V> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed);
        }
        let deadline = timeout.map(|limit| Instant::now() + limit);
        loop {
            let entry = self.entry(key);
            self.reap_overdue(key, &entry).await;
            let plan = {
                let mut state = entry.state.lock().unwrap();
                if state.destroyed {
                    drop(state);
                    // Entry torn down under us; retry against a fresh one.
                    continue;
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.active += 1;
                    BorrowPlan::Idle(idle.value)
                } else if state.managed() < self.shared.max {
                    state.creating += 1;
                    BorrowPlan::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    BorrowPlan::Wait(rx)
                }
            };

            match plan {
                BorrowPlan::Idle(value) => {
                    match self.vet_candidate(key, &entry, value).await? {
                        Some(valid) => return Ok(valid),
                        None => {
                            if deadline_passed(deadline) {
                                return Err(Error::NoValidObject { key: format!("{key:?}") });
                            }
                        }
                    }
                }
                BorrowPlan::Create => match self.shared.factory.create(key).await {
                    Ok(value) => {
                        let destroyed_entry = {
                            let mut state = entry.state.lock().unwrap();
                            state.creating -= 1;
                            if state.destroyed {
                                true
                            } else {
                                state.active += 1;
                                state.record_peak();
                                false
                            }
                        };
                        if destroyed_entry {
                            self.shared.factory.destroy(key, value).await;
                            continue;
                        }
                        match self.vet_candidate(key, &entry, value).await? {
                            Some(valid) => return Ok(valid),
                            None => {
                                if deadline_passed(deadline) {
                                    return Err(Error::NoValidObject { key: format!("{key:?}") });
                                }
                            }
                        }
                    }
                    Err(err) => {
                        entry.state.lock().unwrap().creating -= 1;
                        return Err(Error::CreateFailed { key: format!("{key:?}"), reason: err });
                    }
                },
                BorrowPlan::Wait(mut rx) => {
                    let received = match deadline {
                        None => rx.await.ok(),
                        Some(at) => {
                            match tokio::time::timeout_at(at.into(), &mut rx).await {
                                Ok(result) => result.ok(),
                                // A hand-off may have landed just as the
                                // deadline fired; salvage it.
                                Err(_) => rx.try_recv().ok(),
                            }
                        }
                    };
                    match received {
                        Some(value) => match self.vet_candidate(key, &entry, value).await? {
                            Some(valid) => return Ok(valid),
                            None => {
                                if deadline_passed(deadline) {
                                    return Err(Error::NoValidObject { key: format!("{key:?}") });
                                }
                            }
                        },
                        None if deadline.is_some() && deadline_passed(deadline) => {
                            if self.shared.disposable {
                                return self.create_disposable(key, &entry).await;
                            }
                            return Err(Error::PoolExhausted { key: format!("{key:?}"), timeout });
                        }
                        // Sender dropped (entry destroyed); retry.
                        None => {}
                    }
                }
            }
        }
    }

    /// Validate a candidate already counted as active. Returns `Ok(None)`
    /// when the candidate was invalid and has been destroyed.
    async fn vet_candidate(&self, key: &K, entry: &Arc<EntryHandle<V>>, value: V) -> Result<Option<V>> {
        if !self.shared.borrow_validation {
            return Ok(Some(value));
        }
        if self.shared.factory.validate(key, &value).await {
            return Ok(Some(value));
        }
        tracing::debug!(pool = %self.shared.name, key = ?key, "borrow validation failed, destroying candidate");
        entry.state.lock().unwrap().active -= 1;
        self.shared.factory.destroy(key, value).await;
        Ok(None)
    }

    async fn create_disposable(&self, key: &K, entry: &Arc<EntryHandle<V>>) -> Result<V> {
        let value = self
            .shared
            .factory
            .create(key)
            .await
            .map_err(|err| Error::CreateFailed { key: format!("{key:?}"), reason: err })?;
        if self.shared.borrow_validation && !self.shared.factory.validate(key, &value).await {
            self.shared.factory.destroy(key, value).await;
            return Err(Error::NoValidObject { key: format!("{key:?}") });
        }
        entry.state.lock().unwrap().disposables.insert(value.clone());
        tracing::debug!(pool = %self.shared.name, key = ?key, "handing out disposable object beyond max");
        Ok(value)
    }

    /// Return a borrowed object. Disposables and objects returned to a
    /// destroyed entry are destroyed instead of pooled.
    pub async fn return_object(&self, key: &K, value: V) {
        let Some(entry) = self.lookup(key) else {
            self.shared.factory.destroy(key, value).await;
            return;
        };

        let was_disposable = entry.state.lock().unwrap().disposables.remove(&value);
        if was_disposable {
            self.shared.factory.destroy(key, value).await;
            return;
        }

        if self.shared.return_validation && !self.shared.factory.validate(key, &value).await {
            tracing::debug!(pool = %self.shared.name, key = ?key, "return validation failed, destroying object");
            entry.state.lock().unwrap().active -= 1;
            self.shared.factory.destroy(key, value).await;
            return;
        }

        let leftover = {
            let mut state = entry.state.lock().unwrap();
            if state.destroyed {
                state.active -= 1;
                Some(value)
            } else {
                let mut pending = value;
                loop {
                    match state.waiters.pop_front() {
                        // Hand off directly; the waiter inherits the active slot.
                        Some(waiter) => match waiter.send(pending) {
                            Ok(()) => break None,
                            Err(back) => pending = back,
                        },
                        None => {
                            state.active -= 1;
                            state.idle.push_back(IdleObject {
                                value: pending,
                                returned_at: Instant::now(),
                            });
                            break None;
                        }
                    }
                }
            }
        };
        if let Some(value) = leftover {
            self.shared.factory.destroy(key, value).await;
        }
        if let Some(entry) = self.lookup(key) {
            self.reap_overdue(key, &entry).await;
        }
    }

    /// Destroy a borrowed object and release its managed slot. Used when the
    /// holder knows the object can no longer be trusted.
    pub async fn remove_object(&self, key: &K, value: V) {
        if let Some(entry) = self.lookup(key) {
            let mut state = entry.state.lock().unwrap();
            if !state.disposables.remove(&value) && !state.destroyed {
                state.active = state.active.saturating_sub(1);
            }
        }
        self.shared.factory.destroy(key, value).await;
    }

    /// Eagerly create objects until the entry holds `min` managed objects.
    pub async fn create_all_min_objects(&self, key: &K) -> Result<()> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(Error::Destroyed);
        }
        loop {
            let entry = self.entry(key);
            if !entry.reserve_min_slot(self.shared.min) {
                return Ok(());
            }
            match self.shared.factory.create(key).await {
                Ok(value) => {
                    if let Some(value) = entry.complete_min_slot(value) {
                        self.shared.factory.destroy(key, value).await;
                        return Err(Error::Destroyed);
                    }
                }
                Err(err) => {
                    entry.cancel_min_slot();
                    return Err(Error::CreateFailed { key: format!("{key:?}"), reason: err });
                }
            }
        }
    }

    /// Destroy all idle objects for `key` while keeping the entry alive.
    pub async fn remove_all_objects(&self, key: &K) {
        let Some(entry) = self.lookup(key) else { return };
        let drained: Vec<V> = {
            let mut state = entry.state.lock().unwrap();
            state.idle.drain(..).map(|idle| idle.value).collect()
        };
        for value in drained {
            self.shared.factory.destroy(key, value).await;
        }
    }

    /// Destroy the entry for `key`: close all idle objects, fail queued
    /// waiters and arrange for in-flight returns to destroy on arrival.
    /// Observers see the −1 sentinel afterwards.
    pub async fn destroy(&self, key: &K) {
        let entry = { self.shared.entries.lock().unwrap().remove(key) };
        let Some(entry) = entry else { return };
        let drained: Vec<V> = {
            let mut state = entry.state.lock().unwrap();
            state.destroyed = true;
            state.waiters.clear();
            state.idle.drain(..).map(|idle| idle.value).collect()
        };
        for value in drained {
            self.shared.factory.destroy(key, value).await;
        }
        tracing::debug!(pool = %self.shared.name, key = ?key, "pool entry destroyed");
    }

    /// Destroy every entry and stop the eviction sweep. The pool rejects
    /// further borrows.
    pub async fn destroy_all(&self) {
        self.shared.destroyed.store(true, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        let keys: Vec<K> = { self.shared.entries.lock().unwrap().keys().cloned().collect() };
        for key in keys {
            self.destroy(&key).await;
        }
    }

    async fn reap_overdue(&self, key: &K, entry: &Arc<EntryHandle<V>>) {
        let Some(keep_alive) = self.shared.keep_alive else { return };
        let evicted: Vec<V> = {
            let mut state = entry.state.lock().unwrap();
            let mut out = Vec::new();
            while state.managed() > self.shared.min {
                match state.idle.front() {
                    Some(oldest) if oldest.returned_at.elapsed() >= keep_alive => {
                        out.push(state.idle.pop_front().unwrap().value);
                    }
                    _ => break,
                }
            }
            out
        };
        for value in evicted {
            tracing::debug!(pool = %self.shared.name, key = ?key, "evicting idle object past keep-alive");
            self.shared.factory.destroy(key, value).await;
        }
    }

    pub fn pool_size(&self, key: &K) -> i64 {
        self.with_state(key, |state| (state.idle.len() + state.active) as i64)
    }

    pub fn active_count(&self, key: &K) -> i64 {
        self.with_state(key, |state| state.active as i64)
    }

    pub fn idle_count(&self, key: &K) -> i64 {
        self.with_state(key, |state| state.idle.len() as i64)
    }

    /// Highest managed count observed since the entry was (re)created.
    pub fn peak_count(&self, key: &K) -> i64 {
        self.with_state(key, |state| state.peak as i64)
    }

    /// Observers on a missing entry receive the −1 sentinel.
    fn with_state(&self, key: &K, read: impl FnOnce(&EntryState<V>) -> i64) -> i64 {
        match self.lookup(key) {
            Some(entry) => read(&entry.state.lock().unwrap()),
            None => -1,
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.entries.lock().unwrap().keys().cloned().collect()
    }
}

impl<K, V> Drop for BaseObjectPool<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(at) if Instant::now() >= at)
}

fn spawn_sweeper<K, V>(shared: std::sync::Weak<PoolShared<K, V>>) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Eq + Hash + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = shared.upgrade() else { return };
            if shared.destroyed.load(Ordering::Acquire) {
                return;
            }
            let Some(keep_alive) = shared.keep_alive else { return };
            let snapshot: Vec<(K, Arc<EntryHandle<V>>)> = {
                shared
                    .entries
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(key, entry)| (key.clone(), entry.clone()))
                    .collect()
            };
            for (key, entry) in snapshot {
                let evicted: Vec<V> = {
                    let mut state = entry.state.lock().unwrap();
                    let mut out = Vec::new();
                    while state.managed() > shared.min {
                        match state.idle.front() {
                            Some(oldest) if oldest.returned_at.elapsed() >= keep_alive => {
                                out.push(state.idle.pop_front().unwrap().value);
                            }
                            _ => break,
                        }
                    }
                    out
                };
                for value in evicted {
                    shared.factory.destroy(&key, value).await;
                }
            }
        }
    })
}
