//! Bounded pool of browser instances with page-level leasing.
//!
//! The pool owns every live instance. Jobs borrow one isolated page at a
//! time through a [`PageLease`]; capacity is accounted per instance and the
//! total number of instances never exceeds [`PoolConfig::max_instances`].
//! Callers at the ceiling wait for a release until `acquire_timeout`
//! elapses and then fail with [`AppError::PoolExhausted`]. Every release
//! wakes all waiters and they race for the freed slot, so waiters are not
//! served in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{EngineKind, PageOptions};
use crate::traits::{BrowserEngine, BrowserInstance, PageRef};

const PAGE_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const INSTANCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Ceiling on live (and launching) browser instances across all engines.
    pub max_instances: usize,
    /// Concurrent pages allowed on one instance.
    pub max_pages_per_instance: usize,
    /// Idle instances older than this are closed by the reaper.
    pub instance_idle_ttl: Duration,
    /// How long `acquire_page` may wait for capacity.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            max_pages_per_instance: 4,
            instance_idle_ttl: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

struct InstanceSlot {
    engine: EngineKind,
    instance: Arc<dyn BrowserInstance>,
    load: usize,
    last_used: Instant,
    /// No new pages are placed here; closed once the last lease returns.
    draining: bool,
}

#[derive(Default)]
struct PoolState {
    instances: HashMap<String, InstanceSlot>,
    /// Launches in progress; they count against the ceiling.
    launching: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    pages_opened: AtomicU64,
    pages_released: AtomicU64,
    instances_launched: AtomicU64,
    instances_evicted: AtomicU64,
}

struct PoolInner {
    config: PoolConfig,
    engines: HashMap<EngineKind, Arc<dyn BrowserEngine>>,
    state: Mutex<PoolState>,
    capacity: Notify,
    counters: PoolCounters,
}

/// Per-instance view for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub id: String,
    pub engine: EngineKind,
    pub load: usize,
    pub idle_ms: u64,
    pub draining: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_instances: usize,
    pub max_pages_per_instance: usize,
    pub instance_count: usize,
    pub launching: usize,
    pub pages_in_use: usize,
    pub pages_opened_total: u64,
    pub pages_released_total: u64,
    pub instances_launched_total: u64,
    pub instances_evicted_total: u64,
    pub instances: Vec<InstanceStats>,
}

/// Shared handle to the browser pool.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

/// One unit of load held on an instance. Returned on release or drop.
struct LoadGuard {
    inner: Arc<PoolInner>,
    instance_id: String,
    armed: bool,
}

impl LoadGuard {
    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.inner.return_load(&self.instance_id);
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A reserved launch slot. Given back if the launch fails or is cancelled.
struct LaunchGuard {
    inner: Arc<PoolInner>,
    armed: bool,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.inner.lock_state();
                state.launching = state.launching.saturating_sub(1);
            }
            self.inner.capacity.notify_waiters();
        }
    }
}

enum Reserved {
    Existing {
        guard: LoadGuard,
        instance: Arc<dyn BrowserInstance>,
    },
    Launch(LaunchGuard),
}

/// An isolated page borrowed from the pool.
///
/// Give it back with [`BrowserPool::release_page`]. A lease that is dropped
/// without being released still frees its slot and closes the page in the
/// background.
pub struct PageLease {
    page: PageRef,
    engine: EngineKind,
    load: LoadGuard,
    released: bool,
}

impl PageLease {
    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn instance_id(&self) -> &str {
        &self.load.instance_id
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("instance_id", &self.load.instance_id)
            .field("context_id", &self.page.context_id())
            .field("engine", &self.engine)
            .finish()
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        tracing::warn!(
            instance_id = %self.load.instance_id,
            "Page lease dropped without release"
        );
        self.load
            .inner
            .counters
            .pages_released
            .fetch_add(1, Ordering::Relaxed);
        self.load.release();

        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = tokio::time::timeout(PAGE_CLOSE_TIMEOUT, page.close()).await;
                });
            }
            Err(_) => tracing::debug!("No runtime available to close dropped page"),
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pool mutex");
            poisoned.into_inner()
        })
    }

    fn engine(&self, kind: EngineKind) -> Result<Arc<dyn BrowserEngine>, AppError> {
        self.engines.get(&kind).cloned().ok_or_else(|| {
            AppError::ConfigError(format!("No browser engine registered for '{kind}'"))
        })
    }

    fn return_load(&self, instance_id: &str) {
        let drained = {
            let mut state = self.lock_state();
            match state.instances.get_mut(instance_id) {
                Some(slot) => {
                    slot.load = slot.load.saturating_sub(1);
                    slot.last_used = Instant::now();
                    slot.draining && slot.load == 0
                }
                None => false,
            }
        };
        if drained {
            self.evict(instance_id);
        } else {
            self.capacity.notify_waiters();
        }
    }

    /// Give back one unit of load after a failed page creation and stop
    /// placing pages on the instance. Other leases on it keep working; the
    /// instance is closed when the last of them is released.
    fn retire(&self, instance_id: &str) {
        let idle = {
            let mut state = self.lock_state();
            match state.instances.get_mut(instance_id) {
                Some(slot) => {
                    slot.load = slot.load.saturating_sub(1);
                    slot.draining = true;
                    slot.load == 0
                }
                None => false,
            }
        };
        if idle {
            self.evict(instance_id);
        } else {
            tracing::warn!(%instance_id, "Draining browser instance with live leases");
            self.capacity.notify_waiters();
        }
    }

    /// Remove an instance from the table and close it in the background.
    fn evict(&self, instance_id: &str) {
        let removed = self.lock_state().instances.remove(instance_id);
        if let Some(slot) = removed {
            self.counters
                .instances_evicted
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(%instance_id, engine = %slot.engine, "Evicting browser instance");
            close_in_background(instance_id.to_string(), slot.instance);
        }
        self.capacity.notify_waiters();
    }

    /// Wait until a page slot or a launch slot for `kind` is available.
    ///
    /// Waiters register with `capacity` before inspecting the state so a
    /// release between the check and the wait is not lost. No ordering is
    /// kept between waiters.
    async fn reserve(
        self: &Arc<Self>,
        kind: EngineKind,
        deadline: tokio::time::Instant,
        started: Instant,
    ) -> Result<Reserved, AppError> {
        loop {
            let notified = self.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut to_close = Vec::new();
            let reserved = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(AppError::PoolClosed);
                }
                self.try_reserve(&mut state, kind, &mut to_close)
            };

            for (id, instance) in to_close {
                close_in_background(id, instance);
            }
            if let Some(reserved) = reserved {
                return Ok(reserved);
            }

            tracing::debug!(engine = %kind, "Browser pool at capacity, waiting");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(engine = %kind, waited_ms, "Browser pool exhausted");
                return Err(AppError::PoolExhausted { waited_ms });
            }
        }
    }

    fn try_reserve(
        self: &Arc<Self>,
        state: &mut PoolState,
        kind: EngineKind,
        to_close: &mut Vec<(String, Arc<dyn BrowserInstance>)>,
    ) -> Option<Reserved> {
        // Dead idle instances are dropped before they can be handed out.
        let dead: Vec<String> = state
            .instances
            .iter()
            .filter(|(_, s)| s.load == 0 && !s.instance.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        for id in dead {
            if let Some(slot) = state.instances.remove(&id) {
                self.counters
                    .instances_evicted
                    .fetch_add(1, Ordering::Relaxed);
                to_close.push((id, slot.instance));
            }
        }

        let cap = self.config.max_pages_per_instance.max(1);
        let candidate = state
            .instances
            .iter_mut()
            .filter(|(_, s)| {
                s.engine == kind && !s.draining && s.load < cap && s.instance.is_alive()
            })
            .min_by_key(|(_, s)| s.load);
        if let Some((id, slot)) = candidate {
            slot.load += 1;
            slot.last_used = Instant::now();
            return Some(Reserved::Existing {
                guard: LoadGuard {
                    inner: Arc::clone(self),
                    instance_id: id.clone(),
                    armed: true,
                },
                instance: Arc::clone(&slot.instance),
            });
        }

        let ceiling = self.config.max_instances.max(1);
        if state.instances.len() + state.launching < ceiling {
            state.launching += 1;
            return Some(Reserved::Launch(LaunchGuard {
                inner: Arc::clone(self),
                armed: true,
            }));
        }

        // At the ceiling: make room by evicting the least recently used idle
        // instance (necessarily of another engine, or it would have been picked).
        let lru = state
            .instances
            .iter()
            .filter(|(_, s)| s.load == 0)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(id, _)| id.clone())?;
        let slot = state.instances.remove(&lru)?;
        self.counters
            .instances_evicted
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(instance_id = %lru, engine = %slot.engine, "Evicting idle instance to make room");
        to_close.push((lru, slot.instance));
        state.launching += 1;
        Some(Reserved::Launch(LaunchGuard {
            inner: Arc::clone(self),
            armed: true,
        }))
    }

    /// Launch an instance into a reserved slot and register it with `initial_load`.
    async fn launch_instance(
        &self,
        engine: &Arc<dyn BrowserEngine>,
        mut reservation: LaunchGuard,
        initial_load: usize,
    ) -> Result<(String, Arc<dyn BrowserInstance>), AppError> {
        let kind = engine.kind();
        let instance = engine.launch().await?;
        let id = format!("{}-{}", kind, &Uuid::new_v4().to_string()[..8]);

        {
            let mut state = self.lock_state();
            state.launching = state.launching.saturating_sub(1);
            reservation.armed = false;
            if state.closed {
                drop(state);
                close_in_background(id, instance);
                return Err(AppError::PoolClosed);
            }
            state.instances.insert(
                id.clone(),
                InstanceSlot {
                    engine: kind,
                    instance: Arc::clone(&instance),
                    load: initial_load,
                    last_used: Instant::now(),
                    draining: false,
                },
            );
        }

        self.counters
            .instances_launched
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(instance_id = %id, engine = %kind, "Launched browser instance");
        Ok((id, instance))
    }
}

fn close_in_background(instance_id: String, instance: Arc<dyn BrowserInstance>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!(%instance_id, "No runtime available to close instance");
        return;
    };
    handle.spawn(async move {
        match tokio::time::timeout(INSTANCE_CLOSE_TIMEOUT, instance.close()).await {
            Ok(Ok(())) => tracing::debug!(%instance_id, "Closed browser instance"),
            Ok(Err(e)) => tracing::warn!(%instance_id, error = %e, "Failed to close instance"),
            Err(_) => tracing::warn!(%instance_id, "Timed out closing instance"),
        }
    });
}

impl BrowserPool {
    pub fn new(
        config: PoolConfig,
        engines: impl IntoIterator<Item = Arc<dyn BrowserEngine>>,
    ) -> Self {
        let engines = engines.into_iter().map(|e| (e.kind(), e)).collect();
        Self {
            inner: Arc::new(PoolInner {
                config,
                engines,
                state: Mutex::new(PoolState::default()),
                capacity: Notify::new(),
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Engines this pool can carve pages from.
    pub fn engines(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<_> = self.inner.engines.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Borrow an isolated page on the requested engine.
    ///
    /// Picks the least loaded instance with spare capacity, launches a new
    /// one while under the ceiling, or waits for a release. If page creation
    /// fails the instance is retired (closed now if idle, otherwise drained)
    /// and the acquisition retried once.
    pub async fn acquire_page(&self, options: &PageOptions) -> Result<PageLease, AppError> {
        let engine = self.inner.engine(options.engine)?;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.inner.config.acquire_timeout;
        let mut last_error = None;

        for attempt in 1..=2 {
            let (mut guard, instance) = match self
                .inner
                .reserve(options.engine, deadline, started)
                .await?
            {
                Reserved::Existing { guard, instance } => (guard, instance),
                Reserved::Launch(reservation) => {
                    match self.inner.launch_instance(&engine, reservation, 1).await {
                        Ok((instance_id, instance)) => (
                            LoadGuard {
                                inner: Arc::clone(&self.inner),
                                instance_id,
                                armed: true,
                            },
                            instance,
                        ),
                        Err(e) => {
                            tracing::warn!(engine = %options.engine, attempt, error = %e, "Instance launch failed");
                            last_error = Some(e);
                            continue;
                        }
                    }
                }
            };

            match instance.new_isolated_page(options).await {
                Ok(page) => {
                    self.inner
                        .counters
                        .pages_opened
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        instance_id = %guard.instance_id,
                        context_id = %page.context_id(),
                        engine = %options.engine,
                        "Page acquired"
                    );
                    return Ok(PageLease {
                        page,
                        engine: options.engine,
                        load: guard,
                        released: false,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        instance_id = %guard.instance_id,
                        attempt,
                        error = %e,
                        "Page creation failed"
                    );
                    guard.armed = false;
                    self.inner.retire(&guard.instance_id);
                    last_error = Some(e);
                }
            }
        }

        Err(AppError::InstanceCrashed(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "instance unavailable".into()),
        ))
    }

    /// Close the page's isolated context and free its capacity slot.
    ///
    /// Never fails; close errors are logged.
    pub async fn release_page(&self, mut lease: PageLease) {
        let instance_id = lease.instance_id().to_string();
        match tokio::time::timeout(PAGE_CLOSE_TIMEOUT, lease.page.close()).await {
            Ok(Ok(())) => tracing::debug!(%instance_id, "Page released"),
            Ok(Err(e)) => tracing::warn!(%instance_id, error = %e, "Failed to close page"),
            Err(_) => tracing::warn!(%instance_id, "Timed out closing page"),
        }

        lease.released = true;
        lease
            .load
            .inner
            .counters
            .pages_released
            .fetch_add(1, Ordering::Relaxed);
        lease.load.release();
    }

    /// Close idle instances past their TTL and dead idle instances.
    pub fn reap_idle(&self) -> usize {
        let ttl = self.inner.config.instance_idle_ttl;
        let reaped: Vec<(String, InstanceSlot)> = {
            let mut state = self.inner.lock_state();
            let ids: Vec<String> = state
                .instances
                .iter()
                .filter(|(_, s)| {
                    s.load == 0 && (s.last_used.elapsed() >= ttl || !s.instance.is_alive())
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.instances.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        let count = reaped.len();
        for (id, slot) in reaped {
            tracing::info!(instance_id = %id, engine = %slot.engine, "Reaping idle browser instance");
            self.inner
                .counters
                .instances_evicted
                .fetch_add(1, Ordering::Relaxed);
            close_in_background(id, slot.instance);
        }
        if count > 0 {
            self.inner.capacity.notify_waiters();
        }
        count
    }

    /// Run [`reap_idle`](Self::reap_idle) periodically until cancelled.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = (self.inner.config.instance_idle_ttl / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.reap_idle();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Pool reaper stopped");
        })
    }

    /// Pre-launch up to `count` idle instances of `engine`, within the ceiling.
    pub async fn warm_up(&self, engine: EngineKind, count: usize) -> Result<usize, AppError> {
        let engine_ref = self.inner.engine(engine)?;
        let mut launched = 0;

        for _ in 0..count {
            let reservation = {
                let mut state = self.inner.lock_state();
                if state.closed
                    || state.instances.len() + state.launching
                        >= self.inner.config.max_instances.max(1)
                {
                    break;
                }
                state.launching += 1;
                LaunchGuard {
                    inner: Arc::clone(&self.inner),
                    armed: true,
                }
            };
            self.inner
                .launch_instance(&engine_ref, reservation, 0)
                .await?;
            launched += 1;
        }

        if launched > 0 {
            self.inner.capacity.notify_waiters();
            tracing::info!(%engine, launched, "Browser pool warmed up");
        }
        Ok(launched)
    }

    /// Close every instance and reject further acquisitions.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, InstanceSlot)> = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            state.instances.drain().collect()
        };
        self.inner.capacity.notify_waiters();

        tracing::info!(instances = drained.len(), "Draining browser pool");
        futures::future::join_all(drained.into_iter().map(|(id, slot)| async move {
            match tokio::time::timeout(INSTANCE_CLOSE_TIMEOUT, slot.instance.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(instance_id = %id, error = %e, "Failed to close instance"),
                Err(_) => tracing::warn!(instance_id = %id, "Timed out closing instance"),
            }
        }))
        .await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        let state = self.inner.lock_state();
        let mut instances: Vec<InstanceStats> = state
            .instances
            .iter()
            .map(|(id, s)| InstanceStats {
                id: id.clone(),
                engine: s.engine,
                load: s.load,
                idle_ms: if s.load == 0 {
                    s.last_used.elapsed().as_millis() as u64
                } else {
                    0
                },
                draining: s.draining,
            })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));

        PoolStats {
            max_instances: self.inner.config.max_instances,
            max_pages_per_instance: self.inner.config.max_pages_per_instance,
            instance_count: state.instances.len(),
            launching: state.launching,
            pages_in_use: instances.iter().map(|i| i.load).sum(),
            pages_opened_total: counters.pages_opened.load(Ordering::Relaxed),
            pages_released_total: counters.pages_released.load(Ordering::Relaxed),
            instances_launched_total: counters.instances_launched.load(Ordering::Relaxed),
            instances_evicted_total: counters.instances_evicted.load(Ordering::Relaxed),
            instances,
        }
    }
}
