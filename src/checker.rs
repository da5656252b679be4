use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::stats::CycleStats;
use crate::config::{Config, NOTIFY_TOP_LISTINGS, WARMUP_DELAY_SECS};
use crate::error::Result;
use crate::market::MarketQuery;
use crate::notify::Notifier;
use crate::store::AlertStore;
use crate::strategy::QueryStrategy;
use crate::types::{
    Alert, AlertNotification, Listing, NotificationKind, QueryGroup, SkipReason,
};

// ---------------------------------------------------------------------------
// Settings / outcomes
// ---------------------------------------------------------------------------

/// Mutable runtime knobs, re-read from configuration on start/restart —
/// never mid-cycle.
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    pub poll_interval: Duration,
    pub cooldown_ms: u64,
    pub inter_request_delay: Duration,
}

impl CheckerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(cfg.poll_interval_minutes * 60),
            cooldown_ms: cfg.cooldown_minutes * 60 * 1000,
            inter_request_delay: Duration::from_millis(cfg.inter_request_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle holds the single-flight guard; nothing was done.
    AlreadyRunning,
    NoAlerts,
    Completed(CycleSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub groups: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub queries: usize,
    pub query_failures: usize,
    pub notified: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum AlertOutcome {
    NoMatch,
    Cooldown,
    Notified(NotificationKind),
    DeliveryFailed,
}

/// Releases the single-flight guard no matter how the cycle exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A spawned poll loop plus the stop signal wired to it. The signal is
/// per-spawn, so a stop can only ever reach the loop it was issued for —
/// never one spawned later.
struct LoopHandle {
    task: JoinHandle<()>,
    stop: watch::Sender<()>,
}

// ---------------------------------------------------------------------------
// AlertChecker
// ---------------------------------------------------------------------------

/// Runs one end-to-end poll cycle on a timer. Groups are visited strictly
/// sequentially in the priority order computed at cycle start; a boolean
/// single-flight guard keeps cycles from ever overlapping.
pub struct AlertChecker {
    store: AlertStore,
    market: Arc<dyn MarketQuery>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<CycleStats>,
    strategy: Mutex<QueryStrategy>,
    settings: Mutex<CheckerSettings>,
    running: AtomicBool,
    task: Mutex<Option<LoopHandle>>,
}

impl AlertChecker {
    pub fn new(
        store: AlertStore,
        market: Arc<dyn MarketQuery>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<CycleStats>,
        settings: CheckerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            market,
            notifier,
            stats,
            strategy: Mutex::new(QueryStrategy::new()),
            settings: Mutex::new(settings),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Recover from a poisoned lock instead of propagating the panic —
    /// the strategy degrades to whatever state it had.
    fn strategy(&self) -> MutexGuard<'_, QueryStrategy> {
        self.strategy.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settings(&self) -> CheckerSettings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Idempotent: a second `start` while the loop task is alive is a
    /// no-op. The first cycle fires after a short warm-up delay.
    pub fn start(self: &Arc<Self>, cfg: &Config) {
        self.spawn_loop(cfg, true);
    }

    /// Stop the timer. An in-flight cycle is not interrupted; the loop
    /// exits at its next suspension point.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            let _ = handle.stop.send(());
            info!("alert checker stopped");
        }
    }

    /// Re-read configuration and resume without the warm-up delay.
    pub fn restart(self: &Arc<Self>) -> Result<()> {
        let cfg = Config::from_env()?;
        self.stop();
        self.spawn_loop(&cfg, false);
        Ok(())
    }

    /// Run one cycle immediately, subject to the single-flight guard.
    pub async fn force_check(&self) -> Result<CycleOutcome> {
        self.run_check().await
    }

    fn spawn_loop(self: &Arc<Self>, cfg: &Config, warmup: bool) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().map_or(false, |t| !t.task.is_finished()) {
            debug!("alert checker already started");
            return;
        }

        let settings = CheckerSettings::from_config(cfg);
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings.clone();

        let (stop_tx, stop_rx) = watch::channel(());
        let checker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            checker.run_loop(settings.poll_interval, warmup, stop_rx).await;
        });
        *task = Some(LoopHandle { task: handle, stop: stop_tx });
        info!(
            poll_interval_secs = settings.poll_interval.as_secs(),
            warmup, "alert checker started"
        );
    }

    async fn run_loop(
        self: Arc<Self>,
        poll_interval: Duration,
        warmup: bool,
        mut stop: watch::Receiver<()>,
    ) {
        if warmup && wait_or_stop(&mut stop, Duration::from_secs(WARMUP_DELAY_SECS)).await {
            return;
        }

        loop {
            match self.run_check().await {
                Ok(CycleOutcome::AlreadyRunning) => debug!("cycle still in flight, not stacking"),
                Ok(_) => {}
                Err(e) => error!("alert check cycle failed: {e}"),
            }
            if wait_or_stop(&mut stop, poll_interval).await {
                return;
            }
        }
    }

    // -- cycle --------------------------------------------------------------

    /// One full poll cycle. Per-group failures are logged and isolated;
    /// the single-flight guard is released on every exit path.
    pub async fn run_check(&self) -> Result<CycleOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(CycleOutcome::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);
        let started = Instant::now();

        let groups = self.store.grouped_by_key().await?;
        if groups.is_empty() {
            debug!("no alerts to check");
            return Ok(CycleOutcome::NoAlerts);
        }

        let groups = self.strategy().prioritize(groups, now_ms());
        let settings = self.settings();
        let mut summary = CycleSummary {
            groups: groups.len(),
            ..CycleSummary::default()
        };

        for (i, group) in groups.iter().enumerate() {
            self.check_group(group, &settings, &mut summary).await;

            // Politeness delay toward the market endpoint.
            if i + 1 < groups.len() && !settings.inter_request_delay.is_zero() {
                tokio::time::sleep(settings.inter_request_delay).await;
            }
        }

        self.store.update_last_global_check(now_ms() as i64).await?;
        self.stats.record_cycle(started.elapsed());
        info!(
            groups = summary.groups,
            skipped = summary.skipped,
            cache_hits = summary.cache_hits,
            queries = summary.queries,
            query_failures = summary.query_failures,
            notified = summary.notified,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "alert check cycle complete"
        );
        Ok(CycleOutcome::Completed(summary))
    }

    async fn check_group(
        &self,
        group: &QueryGroup,
        settings: &CheckerSettings,
        summary: &mut CycleSummary,
    ) {
        let key = &group.key;

        // Hard skips bypass the group entirely: no query, no cache
        // update, no per-alert evaluation, no last-check stamp. A
        // "cached" verdict falls through to the cache read below.
        match self.strategy().should_skip(key, now_ms()) {
            Some(SkipReason::Cached) | None => {}
            Some(reason) => {
                debug!(group = %key, reason = %reason, "group skipped");
                summary.skipped += 1;
                self.stats.group_skipped();
                return;
            }
        }

        // Bind the probe so the strategy guard drops here and is not held
        // across the live query await below.
        let cached = self.strategy().cached_result(key, now_ms());
        let result = match cached {
            Some(hit) => {
                summary.cache_hits += 1;
                self.stats.cache_hit();
                hit
            }
            None => {
                let t0 = Instant::now();
                match self
                    .market
                    .search(&group.search_term, key.server, key.store_type)
                    .await
                {
                    Ok(res) => {
                        self.stats.record_query(t0.elapsed());
                        summary.queries += 1;
                        self.strategy().cache_result(key, &res, now_ms());
                        res
                    }
                    Err(e) => {
                        // Abandoned for this cycle; the next one retries.
                        warn!(group = %key, "market query failed: {e}");
                        summary.query_failures += 1;
                        self.stats.query_failed();
                        return;
                    }
                }
            }
        };

        self.strategy().record_check(key, now_ms());
        self.stats.group_checked();

        if result.is_empty() {
            return;
        }

        for alert in &group.alerts {
            // Re-fetch: the user may have changed or removed the alert
            // since the cycle grouped it.
            let fresh = match self.store.get(alert.id).await {
                Ok(Some(a)) => a,
                Ok(None) => continue,
                Err(e) => {
                    warn!(alert_id = alert.id, "alert reload failed: {e}");
                    continue;
                }
            };
            match self.process_alert(&fresh, &result.listings, settings).await {
                Ok(AlertOutcome::Notified(kind)) => {
                    summary.notified += 1;
                    info!(alert_id = fresh.id, user_id = %fresh.user_id, kind = %kind, "notification sent");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(alert_id = fresh.id, group = %key, "alert evaluation failed: {e}");
                }
            }
        }
    }

    // -- per-alert evaluation -----------------------------------------------

    /// Evaluate one alert against the group's listing set, independently
    /// of every other alert. Price tracking and notification gating are
    /// deliberately decoupled: a new low is persisted even when the
    /// cooldown suppresses the message.
    async fn process_alert(
        &self,
        alert: &Alert,
        listings: &[Listing],
        settings: &CheckerSettings,
    ) -> Result<AlertOutcome> {
        let mut matches: Vec<Listing> = listings
            .iter()
            .filter(|l| {
                alert.max_price.map_or(true, |mp| l.price <= mp)
                    && alert.min_quantity.map_or(true, |mq| l.quantity >= mq)
            })
            .cloned()
            .collect();
        if matches.is_empty() {
            return Ok(AlertOutcome::NoMatch);
        }
        matches.sort_by_key(|l| l.price);
        let current_lowest = matches[0].price;

        let previous_lowest = alert.lowest_price_seen;
        let is_first_check = previous_lowest.is_none();
        let is_lower_price = previous_lowest.map_or(false, |p| current_lowest < p);

        if is_first_check || is_lower_price {
            self.store
                .update_lowest_price(alert.id, current_lowest)
                .await?;
        }

        let now = now_ms() as i64;
        if !is_lower_price && !is_first_check {
            if let Some(last_notified) = alert.last_notified_at {
                let elapsed = now.saturating_sub(last_notified);
                if elapsed < settings.cooldown_ms as i64 {
                    debug!(alert_id = alert.id, elapsed_ms = elapsed, "cooldown active, suppressed");
                    return Ok(AlertOutcome::Cooldown);
                }
            }
        }

        let kind = if is_first_check {
            NotificationKind::FirstMatch
        } else if is_lower_price {
            // A drop always bypasses cooldown: users want it immediately.
            NotificationKind::PriceDrop
        } else {
            NotificationKind::Routine
        };

        let payload = AlertNotification {
            alert_id: alert.id,
            search_term: alert.search_term.clone(),
            server: alert.server,
            store_type: alert.store_type,
            kind,
            previous_lowest,
            current_lowest,
            listings: matches.into_iter().take(NOTIFY_TOP_LISTINGS).collect(),
        };

        match self.notifier.notify(&alert.user_id, &payload).await {
            Ok(true) => {
                self.store.mark_notified(alert.id, now).await?;
                self.stats.notification_sent();
                Ok(AlertOutcome::Notified(kind))
            }
            Ok(false) => {
                // Closed DMs — expected, so quieter than a real error. The
                // alert stays eligible for the next cycle.
                debug!(alert_id = alert.id, user_id = %alert.user_id, "recipient unreachable");
                self.stats.delivery_failed();
                Ok(AlertOutcome::DeliveryFailed)
            }
            Err(e) => {
                warn!(alert_id = alert.id, "notification dispatch failed: {e}");
                self.stats.delivery_failed();
                Ok(AlertOutcome::DeliveryFailed)
            }
        }
    }

    /// Drop all cached query results and group statistics.
    pub fn clear_cache(&self) {
        self.strategy().clear();
        info!("query cache and group statistics cleared");
    }

    pub fn stats(&self) -> &Arc<CycleStats> {
        &self.stats
    }

    /// (tracked groups, cached entries) for the status endpoint.
    pub fn strategy_snapshot(&self) -> (usize, usize) {
        let s = self.strategy();
        (s.tracked_groups(), s.cached_entries())
    }
}

/// Sleeps for `duration`; returns true if this loop's stop signal fired
/// (or its sender is gone, which means the loop was replaced).
async fn wait_or_stop(stop: &mut watch::Receiver<()>, duration: Duration) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::types::{NewAlert, SearchResult, Server, StoreType};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    // -- mocks --------------------------------------------------------------

    /// Programmable market: term → listing prices. Unknown terms error,
    /// which doubles as the transient-failure case.
    struct MockMarket {
        results: Mutex<HashMap<String, Vec<i64>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl MockMarket {
        fn new() -> Self {
            Self {
                results: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self { delay, ..Self::new() }
        }

        fn set(&self, term: &str, prices: &[i64]) {
            self.results
                .lock()
                .unwrap()
                .insert(term.to_lowercase(), prices.to_vec());
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketQuery for MockMarket {
        async fn search(
            &self,
            term: &str,
            _server: Server,
            _store_type: StoreType,
        ) -> Result<SearchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let prices = self
                .results
                .lock()
                .unwrap()
                .get(&term.to_lowercase())
                .cloned()
                .ok_or_else(|| AppError::MarketResponse(format!("no data for {term}")))?;
            Ok(SearchResult {
                listings: prices
                    .iter()
                    .map(|&price| Listing {
                        price,
                        quantity: 10,
                        seller_name: "Vendor".to_string(),
                        store_name: "shop".to_string(),
                        item_id: 985,
                        item_name: term.to_string(),
                    })
                    .collect(),
                total_count: prices.len(),
            })
        }
    }

    /// Records every delivered payload; can be told to refuse delivery.
    struct MockNotifier {
        sent: Mutex<Vec<(String, AlertNotification)>>,
        deliverable: AtomicBool,
    }

    impl MockNotifier {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                deliverable: AtomicBool::new(true),
            }
        }

        fn sent(&self) -> Vec<(String, AlertNotification)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, user_id: &str, n: &AlertNotification) -> Result<bool> {
            if !self.deliverable.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.sent
                .lock()
                .unwrap()
                .push((user_id.to_string(), n.clone()));
            Ok(true)
        }
    }

    // -- fixture ------------------------------------------------------------

    struct Fixture {
        checker: Arc<AlertChecker>,
        store: AlertStore,
        market: Arc<MockMarket>,
        notifier: Arc<MockNotifier>,
    }

    async fn fixture_with(market: MockMarket) -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
        let store = AlertStore::new(pool);
        let market = Arc::new(market);
        let notifier = Arc::new(MockNotifier::new());

        let settings = CheckerSettings {
            poll_interval: Duration::from_secs(900),
            cooldown_ms: 60 * 60 * 1000,
            inter_request_delay: Duration::ZERO,
        };
        let checker = AlertChecker::new(
            store.clone(),
            Arc::clone(&market) as Arc<dyn MarketQuery>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::new(CycleStats::new()),
            settings,
        );
        Fixture { checker, store, market, notifier }
    }

    async fn fixture() -> Fixture {
        fixture_with(MockMarket::new()).await
    }

    fn new_alert(user: &str, term: &str, max_price: Option<i64>) -> NewAlert {
        NewAlert {
            user_id: user.to_string(),
            search_term: term.to_string(),
            server: Server::Nidhogg,
            store_type: StoreType::Sell,
            max_price,
            min_quantity: None,
        }
    }

    fn summary(outcome: CycleOutcome) -> CycleSummary {
        match outcome {
            CycleOutcome::Completed(s) => s,
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }

    fn test_config(poll_minutes: u64) -> Config {
        Config {
            market_api_url: "http://localhost".to_string(),
            discord_token: String::new(),
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            poll_interval_minutes: poll_minutes,
            cooldown_minutes: 60,
            inter_request_delay_ms: 0,
        }
    }

    /// Under paused time the cycle's database work still runs on a real
    /// thread; spin on short virtual sleeps until the counter catches up.
    async fn wait_for_cycles(checker: &AlertChecker, n: u64) {
        for _ in 0..2000 {
            if checker.stats().snapshot().cycles_run >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("cycle counter did not reach {n}");
    }

    // -- tests --------------------------------------------------------------

    #[tokio::test]
    async fn empty_store_means_no_work() {
        let f = fixture().await;
        assert_eq!(f.checker.run_check().await.unwrap(), CycleOutcome::NoAlerts);
        assert_eq!(f.market.calls(), 0);
    }

    #[tokio::test]
    async fn first_check_notifies_and_stores_lowest() {
        let f = fixture().await;
        f.market.set("Elunium", &[1000, 1500]);
        let alert = f
            .store
            .create(new_alert("u1", "Elunium", Some(1200)), 0)
            .await
            .unwrap();

        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.queries, 1);
        assert_eq!(s.notified, 1);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u1");
        assert_eq!(sent[0].1.kind, NotificationKind::FirstMatch);
        // The 1500z listing is over the cap and filtered out.
        assert_eq!(sent[0].1.listings.len(), 1);
        assert_eq!(sent[0].1.current_lowest, 1000);

        let stored = f.store.get(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.lowest_price_seen, Some(1000));
        assert_eq!(stored.notification_count, 1);
        assert!(stored.last_notified_at.is_some());
        assert!(f.store.last_global_check().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cooldown_suppresses_routine_but_not_price_drop() {
        let f = fixture().await;
        f.market.set("Oridecon", &[1000]);
        let alert = f
            .store
            .create(new_alert("u1", "Oridecon", None), 0)
            .await
            .unwrap();

        // Simulate a notification 10 minutes ago at a lowest of 1000.
        f.store.update_lowest_price(alert.id, 1000).await.unwrap();
        let ten_min_ago = now_ms() as i64 - 10 * 60 * 1000;
        f.store.mark_notified(alert.id, ten_min_ago).await.unwrap();

        // Same price again: inside the 60-minute cooldown, suppressed.
        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.notified, 0);
        assert!(f.notifier.sent().is_empty());

        // Lowest-seen must not have moved.
        let stored = f.store.get(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.lowest_price_seen, Some(1000));

        // Price falls to 900: the drop bypasses the cooldown entirely.
        f.market.set("Oridecon", &[900]);
        f.checker.strategy().clear();
        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.notified, 1);

        let sent = f.notifier.sent();
        assert_eq!(sent[0].1.kind, NotificationKind::PriceDrop);
        assert_eq!(sent[0].1.previous_lowest, Some(1000));
        assert_eq!(sent[0].1.current_lowest, 900);

        let stored = f.store.get(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.lowest_price_seen, Some(900));
        assert_eq!(stored.notification_count, 2);
    }

    #[tokio::test]
    async fn alerts_in_one_group_are_evaluated_independently() {
        let f = fixture().await;
        f.market.set("Emperium", &[1500]);
        let tight = f
            .store
            .create(new_alert("u1", "Emperium", Some(1000)), 0)
            .await
            .unwrap();
        let loose = f
            .store
            .create(new_alert("u2", "emperium", Some(2000)), 1)
            .await
            .unwrap();

        let s = summary(f.checker.run_check().await.unwrap());
        // One group, one query, one match.
        assert_eq!(s.groups, 1);
        assert_eq!(s.queries, 1);
        assert_eq!(s.notified, 1);

        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u2");

        assert_eq!(
            f.store.get(tight.id).await.unwrap().unwrap().lowest_price_seen,
            None
        );
        assert_eq!(
            f.store.get(loose.id).await.unwrap().unwrap().lowest_price_seen,
            Some(1500)
        );
    }

    #[tokio::test]
    async fn second_cycle_within_ttl_serves_the_cache() {
        let f = fixture().await;
        f.market.set("Elunium", &[1000]);
        f.store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();

        let s1 = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s1.queries, 1);
        assert_eq!(s1.cache_hits, 0);

        let s2 = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s2.queries, 0);
        assert_eq!(s2.cache_hits, 1);
        assert_eq!(f.market.calls(), 1);
    }

    #[tokio::test]
    async fn query_failure_is_isolated_to_its_group() {
        let f = fixture().await;
        // "Jellopy" has no mock data and will error.
        f.market.set("Elunium", &[800]);
        f.store
            .create(new_alert("u1", "Jellopy", None), 0)
            .await
            .unwrap();
        f.store
            .create(new_alert("u1", "Elunium", None), 1)
            .await
            .unwrap();

        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.groups, 2);
        assert_eq!(s.query_failures, 1);
        assert_eq!(s.notified, 1);
        assert_eq!(f.notifier.sent()[0].1.search_term, "Elunium");
    }

    #[tokio::test]
    async fn failed_delivery_leaves_alert_eligible() {
        let f = fixture().await;
        f.market.set("Elunium", &[1000]);
        let alert = f
            .store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();
        f.notifier.deliverable.store(false, Ordering::SeqCst);

        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.notified, 0);

        let stored = f.store.get(alert.id).await.unwrap().unwrap();
        // Price tracking advanced, notification state did not.
        assert_eq!(stored.lowest_price_seen, Some(1000));
        assert_eq!(stored.last_notified_at, None);
        assert_eq!(stored.notification_count, 0);
    }

    #[tokio::test]
    async fn concurrent_run_check_is_a_no_op() {
        let f = fixture_with(MockMarket::with_delay(Duration::from_millis(200))).await;
        f.market.set("Elunium", &[1000]);
        f.store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();

        let slow = {
            let checker = Arc::clone(&f.checker);
            tokio::spawn(async move { checker.run_check().await })
        };
        // Let the slow cycle take the guard and park in the market call.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            f.checker.run_check().await.unwrap(),
            CycleOutcome::AlreadyRunning
        );

        let s = summary(slow.await.unwrap().unwrap());
        assert_eq!(s.queries, 1);
        assert_eq!(f.market.calls(), 1);

        // Guard released: a later cycle runs normally (cache hit, no query).
        let s = summary(f.checker.run_check().await.unwrap());
        assert_eq!(s.cache_hits, 1);
    }

    #[tokio::test]
    async fn cycle_task_completes_and_caches_the_live_result() {
        let f = fixture().await;
        f.market.set("Elunium", &[1000]);
        f.store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();

        // The whole cycle future crosses a task boundary; the live-query
        // arm must not wedge on the strategy lock after the await.
        let cycle = {
            let checker = Arc::clone(&f.checker);
            tokio::spawn(async move { checker.run_check().await })
        };
        let outcome = tokio::time::timeout(Duration::from_secs(5), cycle)
            .await
            .expect("cycle must finish")
            .unwrap()
            .unwrap();

        let s = summary(outcome);
        assert_eq!(s.queries, 1);
        let (_, cached_entries) = f.checker.strategy_snapshot();
        assert_eq!(cached_entries, 1);
    }

    #[tokio::test]
    async fn restart_mid_cycle_replaces_the_old_loop() {
        std::env::set_var("WATCHER_POLL_INTERVAL_MINUTES", "15");
        let f = fixture_with(MockMarket::with_delay(Duration::from_millis(100))).await;
        f.market.set("Elunium", &[1000]);
        f.store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();

        // Pause only after the sqlite fixture is up: connection setup runs on
        // a real thread, and a paused clock auto-advances past the pool's
        // acquire timeout before that thread can complete.
        tokio::time::pause();
        f.checker.start(&test_config(1));
        // A second start while the loop is alive is a no-op.
        f.checker.start(&test_config(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            f.checker.stats().snapshot().cycles_run,
            0,
            "warm-up delay holds the first cycle"
        );

        // Land inside the first cycle (it starts after the warm-up and
        // spends 100ms in the market call), then restart mid-flight.
        tokio::time::sleep(Duration::from_secs(WARMUP_DELAY_SECS - 10) + Duration::from_millis(50))
            .await;
        f.checker.restart().unwrap();
        wait_for_cycles(&f.checker, 1).await;

        // The old loop polled every minute; two minutes later it must be
        // gone, and the restarted loop is still inside its 15-minute wait.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.checker.stats().snapshot().cycles_run, 1);

        // The restarted loop fires at its own interval.
        tokio::time::sleep(Duration::from_secs(16 * 60)).await;
        wait_for_cycles(&f.checker, 2).await;
        assert_eq!(f.checker.stats().snapshot().cycles_run, 2);

        // Stopping reaches the live loop, not a ghost.
        f.checker.stop();
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(f.checker.stats().snapshot().cycles_run, 2);
    }

    #[tokio::test]
    async fn alert_removed_mid_cycle_is_dropped_on_refetch() {
        let f = fixture_with(MockMarket::with_delay(Duration::from_millis(100))).await;
        f.market.set("Elunium", &[1000]);
        let alert = f
            .store
            .create(new_alert("u1", "Elunium", None), 0)
            .await
            .unwrap();

        let cycle = {
            let checker = Arc::clone(&f.checker);
            tokio::spawn(async move { checker.run_check().await })
        };
        // Cancel the alert while the cycle is parked in the market call;
        // the pre-evaluation re-fetch must see it gone.
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.store.remove(alert.id).await.unwrap();

        let s = summary(cycle.await.unwrap().unwrap());
        assert_eq!(s.queries, 1);
        assert_eq!(s.notified, 0);
        assert!(f.notifier.sent().is_empty());
    }
}
