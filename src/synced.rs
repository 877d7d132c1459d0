//! Synced-data engine: owns the canonical client-side menu state.
//!
//! State is refreshed on start, on a fixed polling interval, on debounced
//! external triggers and after writes. A refresh that fails after retries
//! keeps the last known-good data (in memory, else the local cache) and
//! reports a degraded phase. Optimistic patches overlay state immediately;
//! callers own rollback by re-applying their snapshot.
//!
//! Push-based invalidation is deliberately absent: it raced with in-flight
//! writes. Polling plus an explicit post-write refresh is the only driver of
//! cross-device consistency.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::api::RemoteStore;
use crate::broadcast::{CrossTabChannel, MenuBroadcast};
use crate::bus::Subscription;
use crate::cache::LocalCache;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{
    assemble_push_set, category_label, partition_products, public_categories, sort_categories,
    Category, Logo, MenuSnapshot, Product, SiteConfig,
};
use crate::notifications::Notifier;
use crate::retry::RetryPolicy;

/// Scheduled refreshes that find another cycle in flight try again this
/// many times before giving up to the next poll.
const SCHEDULED_REFRESH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub post_write_delay: Duration,
    pub refresh_retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            debounce: config.debounce,
            post_write_delay: config.post_write_delay,
            refresh_retry: config.refresh_retry,
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    CacheHydrated,
    Loading,
    Synced,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedState {
    /// Sorted by order; includes system categories.
    pub categories: Vec<Category>,
    /// Visible menu items.
    pub products: Vec<Product>,
    pub hidden_products: Vec<Product>,
    pub logo: Option<Logo>,
    pub site_config: SiteConfig,
    pub loading: bool,
    pub error: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    /// Always false: there is no push channel.
    pub realtime_connected: bool,
    pub phase: SyncPhase,
}

impl Default for SyncedState {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            products: Vec::new(),
            hidden_products: Vec::new(),
            logo: None,
            site_config: SiteConfig::new(),
            loading: true,
            error: None,
            last_sync: None,
            realtime_connected: false,
            phase: SyncPhase::Uninitialized,
        }
    }
}

/// One public category with its available products, in menu order.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSection<'a> {
    pub category: &'a Category,
    pub products: Vec<&'a Product>,
}

impl SyncedState {
    pub fn has_data(&self) -> bool {
        !self.categories.is_empty() || !self.products.is_empty()
    }

    pub fn public_categories(&self) -> Vec<&Category> {
        public_categories(&self.categories).collect()
    }

    pub fn category_label(&self, product: &Product) -> &str {
        category_label(&self.categories, &product.category)
    }

    pub fn catalog(&self) -> Vec<CatalogSection<'_>> {
        public_categories(&self.categories)
            .map(|category| CatalogSection {
                category,
                products: self
                    .products
                    .iter()
                    .filter(|p| p.available && p.category == category.id)
                    .collect(),
            })
            .collect()
    }

    /// Full product set for a replace-by-diff push of `visible`.
    pub fn push_set(&self, visible: &[Product]) -> Vec<Product> {
        assemble_push_set(
            visible,
            &self.hidden_products,
            self.logo.as_ref(),
            &self.site_config,
        )
    }

    /// Products mirrored to the cache and other tabs: visible plus hidden.
    fn mirrored_products(&self) -> Vec<Product> {
        let mut out = self.products.clone();
        out.extend(self.hidden_products.iter().cloned());
        out
    }

    fn replace_menu(&mut self, mut categories: Vec<Category>, products: Vec<Product>) {
        sort_categories(&mut categories);
        let parts = partition_products(products);
        self.categories = categories;
        self.products = parts.visible;
        self.hidden_products = parts.hidden;
        self.logo = parts.logo;
        self.site_config = parts.site_config;
    }
}

/// Fields to overlay on state. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimisticPatch {
    pub categories: Option<Vec<Category>>,
    pub products: Option<Vec<Product>>,
    pub logo: Option<Option<Logo>>,
    pub site_config: Option<SiteConfig>,
}

impl OptimisticPatch {
    pub fn categories(categories: Vec<Category>) -> Self {
        Self {
            categories: Some(categories),
            ..Self::default()
        }
    }

    pub fn products(products: Vec<Product>) -> Self {
        Self {
            products: Some(products),
            ..Self::default()
        }
    }

    pub fn logo(logo: Option<Logo>) -> Self {
        Self {
            logo: Some(logo),
            ..Self::default()
        }
    }

    pub fn site_config(site_config: SiteConfig) -> Self {
        Self {
            site_config: Some(site_config),
            ..Self::default()
        }
    }

    /// Patch that puts every mutable field back to `state`.
    pub fn restore(state: &SyncedState) -> Self {
        Self {
            categories: Some(state.categories.clone()),
            products: Some(state.products.clone()),
            logo: Some(state.logo.clone()),
            site_config: Some(state.site_config.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Synced,
    /// Fetch failed; last known-good data kept.
    Degraded,
    /// Another refresh was already in flight.
    Skipped,
    /// A local write landed while fetching; the response was discarded.
    Superseded,
    /// The engine was shut down before the response arrived.
    Dropped,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Inner<S> {
    store: Arc<S>,
    cache: LocalCache,
    channel: CrossTabChannel,
    notifier: Notifier,
    settings: EngineSettings,
    origin: Uuid,
    state: watch::Sender<SyncedState>,
    in_flight: AtomicBool,
    /// Bumped by every optimistic patch and every settled write; a fetch that
    /// straddles a bump is stale.
    write_epoch: AtomicU64,
    /// Writes applied locally whose push has not settled yet.
    pending_writes: AtomicUsize,
    trigger: Notify,
    cancel: CancellationToken,
}

pub struct SyncedData<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SyncedData<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Releases the in-flight flag on every exit path.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Marks a local write as in progress until dropped. While any write is
/// pending, and for fetches that overlap its settlement, refresh results are
/// discarded so a read of pre-write server state cannot undo it.
#[must_use = "the write counts as settled as soon as this is dropped"]
pub struct PendingWrite<'a> {
    epoch: &'a AtomicU64,
    pending: &'a AtomicUsize,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: RemoteStore> SyncedData<S> {
    pub fn new(
        store: Arc<S>,
        cache: LocalCache,
        channel: CrossTabChannel,
        notifier: Notifier,
        settings: EngineSettings,
    ) -> Self {
        let (state, _) = watch::channel(SyncedState::default());
        Self {
            inner: Arc::new(Inner {
                store,
                cache,
                channel,
                notifier,
                settings,
                origin: Uuid::new_v4(),
                state,
                in_flight: AtomicBool::new(false),
                write_epoch: AtomicU64::new(0),
                pending_writes: AtomicUsize::new(0),
                trigger: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn is_mounted(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> SyncedState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<SyncedState> {
        self.inner.state.subscribe()
    }

    /// Start polling, debouncing and cross-tab listening. The first refresh
    /// runs immediately. Everything stops when the handle is dropped.
    pub fn start(&self) -> SyncHandle {
        self.hydrate_from_cache();

        let cancel = self.inner.cancel.clone();
        let mut tasks = Vec::with_capacity(2);

        let engine = self.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.inner.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = engine.inner.settings.poll_interval.as_secs(),
                "menu polling started"
            );
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.refresh().await;
                    }
                }
            }
            debug!("menu polling stopped");
        }));

        let engine = self.clone();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let quiet = engine.inner.settings.debounce;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = engine.inner.trigger.notified() => {}
                }
                // wait for a quiet period; each new trigger restarts it
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = engine.inner.trigger.notified() => continue,
                        _ = tokio::time::sleep(quiet) => break,
                    }
                }
                engine.refresh().await;
            }
        }));

        let engine = self.clone();
        let subscription = self
            .inner
            .channel
            .on_message(self.inner.origin, move |message| {
                engine.merge_broadcast(message)
            });

        SyncHandle {
            cancel,
            tasks,
            subscription: Some(subscription),
        }
    }

    /// Populate state from the local cache without blocking on the network.
    /// Returns true when cached data was applied.
    pub fn hydrate_from_cache(&self) -> bool {
        if self.inner.state.borrow().has_data() {
            return false;
        }
        let cached = self.inner.cache.load();
        if cached.is_empty() {
            return false;
        }
        self.inner.state.send_modify(|s| {
            s.replace_menu(cached.categories, cached.products);
            s.logo = cached.logo;
            s.phase = SyncPhase::CacheHydrated;
        });
        debug!("menu state hydrated from local cache");
        true
    }

    /// Debounced refresh request; bursts collapse into one refresh after the
    /// quiet period. Only effective while started.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Run one refresh cycle now.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight) else {
            trace!("menu refresh already in flight, skipping");
            return RefreshOutcome::Skipped;
        };
        if !self.is_mounted() {
            return RefreshOutcome::Dropped;
        }

        let mut prior_phase = SyncPhase::Loading;
        self.inner.state.send_modify(|s| {
            prior_phase = s.phase;
            s.loading = true;
            s.phase = SyncPhase::Loading;
        });
        let epoch = self.inner.write_epoch.load(Ordering::SeqCst);

        let store = &self.inner.store;
        let result = self
            .inner
            .settings
            .refresh_retry
            .run_until_cancelled("menu refresh", &self.inner.cancel, || {
                store.invalidate();
                store.fetch_all()
            })
            .await;

        if !self.is_mounted() {
            return RefreshOutcome::Dropped;
        }
        match result {
            Ok(_) if self.write_overlapped(epoch) => {
                debug!("local write overlapped menu fetch, discarding response");
                // nothing was synced: error and last_sync stay as they were
                self.inner.state.send_modify(|s| {
                    s.loading = !matches!(prior_phase, SyncPhase::Synced | SyncPhase::Degraded);
                    s.phase = prior_phase;
                });
                RefreshOutcome::Superseded
            }
            Ok(snapshot) => {
                self.apply_remote(snapshot);
                RefreshOutcome::Synced
            }
            Err(SyncError::ShutDown) => RefreshOutcome::Dropped,
            Err(err) => {
                self.degrade(&err);
                RefreshOutcome::Degraded
            }
        }
    }

    fn write_overlapped(&self, fetch_epoch: u64) -> bool {
        self.inner.pending_writes.load(Ordering::SeqCst) > 0
            || self.inner.write_epoch.load(Ordering::SeqCst) != fetch_epoch
    }

    /// Register a local write whose push is about to start. Hold the guard
    /// until the push has settled (succeeded or rolled back).
    pub fn begin_write(&self) -> PendingWrite<'_> {
        self.inner.pending_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_epoch.fetch_add(1, Ordering::SeqCst);
        PendingWrite {
            epoch: &self.inner.write_epoch,
            pending: &self.inner.pending_writes,
        }
    }

    /// Refresh after `delay`, giving the backend time to settle after a write.
    pub fn schedule_refresh(&self, delay: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        let token = self.inner.cancel.clone();
        tokio::spawn(async move {
            for _ in 0..SCHEDULED_REFRESH_ATTEMPTS {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if engine.refresh().await != RefreshOutcome::Skipped {
                    return;
                }
            }
            debug!("scheduled menu refresh kept colliding, leaving it to the next poll");
        })
    }

    /// Overlay `patch` on state immediately.
    pub fn apply_optimistic(&self, patch: OptimisticPatch) {
        self.inner.write_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.state.send_modify(|s| {
            if let Some(mut categories) = patch.categories {
                sort_categories(&mut categories);
                s.categories = categories;
            }
            if let Some(products) = patch.products {
                s.products = products;
            }
            if let Some(logo) = patch.logo {
                s.logo = logo;
            }
            if let Some(site_config) = patch.site_config {
                s.site_config = site_config;
            }
        });
    }

    fn apply_remote(&self, snapshot: MenuSnapshot) {
        let MenuSnapshot {
            categories,
            products,
        } = snapshot;
        self.inner.state.send_modify(|s| {
            s.replace_menu(categories, products);
            s.loading = false;
            s.error = None;
            s.last_sync = Some(Utc::now());
            s.phase = SyncPhase::Synced;
        });

        let state = self.snapshot();
        let mirrored = state.mirrored_products();
        self.inner
            .cache
            .save(&state.categories, &mirrored, state.logo.as_ref());
        self.inner.channel.publish(
            self.inner.origin,
            &state.categories,
            &mirrored,
            state.logo.as_ref(),
        );
        info!(
            categories = state.categories.len(),
            products = state.products.len(),
            has_logo = state.logo.is_some(),
            "menu synced"
        );
    }

    fn degrade(&self, err: &SyncError) {
        let cached = if self.inner.state.borrow().has_data() {
            None
        } else {
            Some(self.inner.cache.load())
        };
        let message = if err.is_auth_failure() {
            format!("Could not load the latest menu: {err}")
        } else {
            format!("Could not load the latest menu, showing saved data: {err}")
        };

        self.inner.state.send_modify(|s| {
            if let Some(cached) = cached.filter(|c| !c.is_empty()) {
                s.replace_menu(cached.categories, cached.products);
                s.logo = cached.logo;
            }
            s.loading = false;
            s.error = Some(message.clone());
            s.last_sync = Some(Utc::now());
            s.phase = SyncPhase::Degraded;
        });
        warn!(error = %err, "menu refresh failed, serving last known data");
        self.inner.notifier.warning(message);
    }

    /// Apply a message from another tab: only fields present are merged.
    fn merge_broadcast(&self, message: MenuBroadcast) {
        if !self.is_mounted() {
            return;
        }
        self.inner.state.send_modify(|s| {
            if let Some(mut categories) = message.categories {
                sort_categories(&mut categories);
                s.categories = categories;
            }
            if let Some(products) = message.products {
                let parts = partition_products(products);
                s.products = parts.visible;
                s.hidden_products = parts.hidden;
            }
            if let Some(logo) = message.logo {
                s.logo = logo;
            }
        });
        debug!(from = %message.origin, "menu state merged from another tab");
    }
}

/// Owns the engine's background work. Dropping it (or calling
/// [`SyncHandle::shutdown`]) cancels timers, aborts tasks and unsubscribes.
pub struct SyncHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

impl SyncHandle {
    pub fn shutdown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.release();
    }
}
