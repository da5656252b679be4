use std::collections::HashMap;

use tracing::debug;

use crate::config::{
    BASE_CACHE_TTL_MS, DORMANT_AFTER_MS, EMPTY_SKIP_WINDOW_MS, EMPTY_STREAK_SKIP,
    EMPTY_STREAK_TTL_BOOST, HIGH_VOLATILITY, LOW_VOLATILITY, MAX_CACHE_TTL_MS,
    MIN_CACHE_TTL_MS, MIN_CHECK_INTERVAL_MS, PRICE_DROP_RATIO, PRICE_WINDOW_CAP,
    PRIORITY_EMPTY_PENALTY, PRIORITY_HAS_RESULTS, PRIORITY_PRICE_DROP, PRIORITY_RECENT_RESULT,
    PRIORITY_STARVED, RECENT_RESULT_MS, STABLE_MIN_SAMPLES, STABLE_VARIATION, STARVED_AFTER_MS,
};
use crate::strategy::window::{mean, PriceWindow};
use crate::types::{GroupKey, QueryGroup, SearchResult, SkipReason};

// ---------------------------------------------------------------------------
// Per-group statistics
// ---------------------------------------------------------------------------

/// Observed query history for one group. Process-lifetime only — reset by
/// restart or an explicit cache clear, never persisted.
#[derive(Debug)]
pub struct GroupStats {
    pub query_count: u64,
    pub result_count: u64,
    pub consecutive_empty: u64,
    pub consecutive_with_results: u64,
    /// Lowest observed price per successful query, newest last.
    pub price_window: PriceWindow,
    pub last_result_at: Option<u64>,
    pub last_empty_at: Option<u64>,
    pub last_check_at: Option<u64>,
}

impl GroupStats {
    fn new() -> Self {
        Self {
            query_count: 0,
            result_count: 0,
            consecutive_empty: 0,
            consecutive_with_results: 0,
            price_window: PriceWindow::new(PRICE_WINDOW_CAP),
            last_result_at: None,
            last_empty_at: None,
            last_check_at: None,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: SearchResult,
    cached_at: u64,
    ttl_ms: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.cached_at) < self.ttl_ms
    }
}

// ---------------------------------------------------------------------------
// QueryStrategy
// ---------------------------------------------------------------------------

/// Decides, per query group, whether a live query is worth the cost, how
/// long to trust a cached result, and which groups to poll first.
///
/// Owned by the checker and only ever touched from its sequential cycle,
/// so plain HashMaps suffice. Every method takes `now_ms` explicitly —
/// the checker stamps time once per step and tests control it directly.
pub struct QueryStrategy {
    stats: HashMap<GroupKey, GroupStats>,
    cache: HashMap<GroupKey, CacheEntry>,
}

impl QueryStrategy {
    pub fn new() -> Self {
        Self {
            stats: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    // -- volatility ---------------------------------------------------------

    /// Coefficient of variation of the group's price window, doubled and
    /// clamped to [0, 1]. CoV alone under-signals for this market, so the
    /// 2x scaling spreads typical noise across the usable range.
    /// Fewer than 2 samples (or a zero mean) reads as unknown: 0.5.
    pub fn volatility(&self, key: &GroupKey) -> f64 {
        let Some(stats) = self.stats.get(key) else {
            return 0.5;
        };
        if stats.price_window.len() < 2 {
            return 0.5;
        }
        let mean = stats.price_window.mean();
        if mean <= 0.0 {
            return 0.5;
        }
        let cov = stats.price_window.std_dev() / mean;
        (cov * 2.0).min(1.0)
    }

    /// TTL for a fresh cache entry, from the *post-update* statistics.
    fn adaptive_ttl(&self, key: &GroupKey, has_results: bool, now_ms: u64) -> u64 {
        let volatility = self.volatility(key);

        let mut multiplier = 1.0_f64;
        if volatility > HIGH_VOLATILITY {
            multiplier = 0.5;
        } else if volatility < LOW_VOLATILITY {
            multiplier = 2.0;
        }

        if let Some(stats) = self.stats.get(key) {
            // Rare item: repeated emptiness means absence can be trusted longer.
            if !has_results && stats.consecutive_empty > EMPTY_STREAK_TTL_BOOST {
                multiplier *= 1.5;
            }
            // Dormant item: nothing listed for half a day, relax further.
            if let Some(last_result) = stats.last_result_at {
                if now_ms.saturating_sub(last_result) > DORMANT_AFTER_MS {
                    multiplier *= 1.3;
                }
            }
        }

        let ttl = (BASE_CACHE_TTL_MS as f64 * multiplier) as u64;
        ttl.clamp(MIN_CACHE_TTL_MS, MAX_CACHE_TTL_MS)
    }

    // -- cache --------------------------------------------------------------

    /// Fresh hit returns the payload; an expired entry is evicted and
    /// reads as a miss. No stats are touched on this path.
    pub fn cached_result(&mut self, key: &GroupKey, now_ms: u64) -> Option<SearchResult> {
        match self.cache.get(key) {
            Some(entry) if entry.is_fresh(now_ms) => Some(entry.data.clone()),
            Some(_) => {
                self.cache.remove(key);
                None
            }
            None => None,
        }
    }

    /// Record a live query result: update the group's statistics, then
    /// cache the payload under a TTL computed from the updated stats.
    pub fn cache_result(&mut self, key: &GroupKey, result: &SearchResult, now_ms: u64) {
        let stats = self.stats.entry(key.clone()).or_insert_with(GroupStats::new);
        stats.query_count += 1;

        if let Some(min_price) = result.listings.iter().map(|l| l.price).min() {
            stats.result_count += 1;
            stats.consecutive_empty = 0;
            stats.consecutive_with_results += 1;
            stats.last_result_at = Some(now_ms);
            stats.price_window.push(min_price);
        } else {
            stats.consecutive_empty += 1;
            stats.consecutive_with_results = 0;
            stats.last_empty_at = Some(now_ms);
        }

        let ttl_ms = self.adaptive_ttl(key, !result.is_empty(), now_ms);
        debug!(group = %key, ttl_ms, "cached query result");
        self.cache.insert(
            key.clone(),
            CacheEntry {
                data: result.clone(),
                cached_at: now_ms,
                ttl_ms,
            },
        );
    }

    // -- skip decision ------------------------------------------------------

    /// Advisory skip decision, evaluated before querying. `Cached` means
    /// the checker should serve the cache read path; the other reasons
    /// mean "do not even attempt, and do not stamp last-check".
    pub fn should_skip(&self, key: &GroupKey, now_ms: u64) -> Option<SkipReason> {
        let stats = self.stats.get(key)?;

        if let Some(entry) = self.cache.get(key) {
            if entry.is_fresh(now_ms) {
                return Some(SkipReason::Cached);
            }
        }

        if stats.consecutive_empty >= EMPTY_STREAK_SKIP {
            if let Some(last_empty) = stats.last_empty_at {
                if now_ms.saturating_sub(last_empty) < EMPTY_SKIP_WINDOW_MS {
                    return Some(SkipReason::ManyEmptyResults);
                }
            }
        }

        if stats.price_window.len() >= STABLE_MIN_SAMPLES {
            let recent = mean(&stats.price_window.last_n(5));
            let prior = mean(&stats.price_window.prior_n(5));
            if prior > 0.0 {
                let variation = (recent - prior).abs() / prior;
                if variation < STABLE_VARIATION {
                    if let Some(last_check) = stats.last_check_at {
                        // Skips only when the last check was *recent* —
                        // preserved as observed, see the constant's doc.
                        if now_ms.saturating_sub(last_check) < MIN_CHECK_INTERVAL_MS {
                            return Some(SkipReason::StablePrice);
                        }
                    }
                }
            }
        }

        None
    }

    // -- priority -----------------------------------------------------------

    /// Poll-order score for one group. No statistics yet means base only.
    pub fn priority(&self, group: &QueryGroup, now_ms: u64) -> i64 {
        let mut score = group.alerts.len() as i64;

        let Some(stats) = self.stats.get(&group.key) else {
            return score;
        };

        if stats.result_count > 0 {
            score += PRIORITY_HAS_RESULTS;
        }

        if let Some(last_result) = stats.last_result_at {
            if now_ms.saturating_sub(last_result) < RECENT_RESULT_MS {
                score += PRIORITY_RECENT_RESULT;
            }
        }

        // Active price-drop tracking: someone holds a lowest-price-seen and
        // the recent mean sits 5%+ below everything that came before it.
        // Slices differ from the stable-price check by design.
        let tracking = group.alerts.iter().any(|a| a.lowest_price_seen.is_some());
        if tracking && stats.price_window.len() >= 2 {
            let recent = stats.price_window.last_n(5);
            let earlier = stats.price_window.before_last_n(5);
            if !earlier.is_empty() && mean(&recent) <= mean(&earlier) * PRICE_DROP_RATIO {
                score += PRIORITY_PRICE_DROP;
            }
        }

        if stats.consecutive_empty > EMPTY_STREAK_SKIP {
            score -= PRIORITY_EMPTY_PENALTY;
        }

        if let Some(last_check) = stats.last_check_at {
            if now_ms.saturating_sub(last_check) > STARVED_AFTER_MS {
                score += PRIORITY_STARVED;
            }
        }

        score
    }

    /// Order groups for one cycle, highest score first. The sort is stable,
    /// so tied groups keep their input order.
    pub fn prioritize(&self, mut groups: Vec<QueryGroup>, now_ms: u64) -> Vec<QueryGroup> {
        let mut scored: Vec<(i64, QueryGroup)> = groups
            .drain(..)
            .map(|g| (self.priority(&g, now_ms), g))
            .collect();
        scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));
        scored.into_iter().map(|(_, g)| g).collect()
    }

    // -- bookkeeping --------------------------------------------------------

    /// Stamp the group's last-check time. Called once per non-skipped
    /// group per cycle, cache hit or miss alike.
    pub fn record_check(&mut self, key: &GroupKey, now_ms: u64) {
        self.stats
            .entry(key.clone())
            .or_insert_with(GroupStats::new)
            .last_check_at = Some(now_ms);
    }

    /// Drop all cached payloads and statistics.
    pub fn clear(&mut self) {
        self.stats.clear();
        self.cache.clear();
    }

    pub fn tracked_groups(&self) -> usize {
        self.stats.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }
}

impl Default for QueryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
