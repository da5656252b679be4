use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server / store type enums
// ---------------------------------------------------------------------------

/// Game worlds of the LATAM cluster. Stored lowercase in the DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Server {
    Nidhogg,
    Yggdrasil,
    Vali,
}

impl Server {
    pub fn as_str(&self) -> &'static str {
        match self {
            Server::Nidhogg => "nidhogg",
            Server::Yggdrasil => "yggdrasil",
            Server::Vali => "vali",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nidhogg" => Some(Server::Nidhogg),
            "yggdrasil" => Some(Server::Yggdrasil),
            "vali" => Some(Server::Vali),
            _ => None,
        }
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vending shops sell to players; buying shops buy from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Buy,
    Sell,
}

impl StoreType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreType::Buy => "buy",
            StoreType::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(StoreType::Buy),
            "sell" => Some(StoreType::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// A user's standing watch request, as persisted in the alerts table.
/// All timestamps are Unix milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub user_id: String,
    pub search_term: String,
    pub server: Server,
    pub store_type: StoreType,
    /// Maximum acceptable price in zeny, inclusive.
    pub max_price: Option<i64>,
    /// Minimum acceptable stack quantity, inclusive.
    pub min_quantity: Option<i64>,
    pub created_at: i64,
    pub last_notified_at: Option<i64>,
    pub notification_count: i64,
    /// Smallest matching price ever observed. Only ever decreases once set.
    pub lowest_price_seen: Option<i64>,
}

impl Alert {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.search_term, self.server, self.store_type)
    }
}

/// Fields supplied at creation time; the store fills in the rest.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub user_id: String,
    pub search_term: String,
    pub server: Server,
    pub store_type: StoreType,
    pub max_price: Option<i64>,
    pub min_quantity: Option<i64>,
}

// ---------------------------------------------------------------------------
// Query groups
// ---------------------------------------------------------------------------

/// Aggregation key shared by every alert that maps to the same market query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// Search term lowercased — matching is case-insensitive.
    pub term: String,
    pub server: Server,
    pub store_type: StoreType,
}

impl GroupKey {
    pub fn new(term: &str, server: Server, store_type: StoreType) -> Self {
        Self {
            term: term.to_lowercase(),
            server,
            store_type,
        }
    }
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.term, self.server, self.store_type)
    }
}

/// One query group for a single cycle: the key plus every alert sharing it.
/// Recomputed fresh from the store each cycle, never persisted.
#[derive(Debug, Clone)]
pub struct QueryGroup {
    pub key: GroupKey,
    /// Original-cased term of the first member, used for the live query.
    pub search_term: String,
    pub alerts: Vec<Alert>,
}

// ---------------------------------------------------------------------------
// Market listings
// ---------------------------------------------------------------------------

/// A single shop entry returned by the market search. Read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub price: i64,
    pub quantity: i64,
    pub seller_name: String,
    pub store_name: String,
    pub item_id: i64,
    pub item_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub listings: Vec<Listing>,
    pub total_count: usize,
}

impl SearchResult {
    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Strategy decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A fresh cache entry exists — the checker serves it instead of querying.
    Cached,
    /// 5+ consecutive empty results and the last one was recent.
    ManyEmptyResults,
    /// Price window is stable and the group was checked minutes ago.
    StablePrice,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::Cached => "cached",
            SkipReason::ManyEmptyResults => "many_empty_results",
            SkipReason::StablePrice => "stable_price",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// First time this alert ever matched anything.
    FirstMatch,
    /// Current lowest is strictly below the stored lowest-price-seen.
    PriceDrop,
    /// Repeat hit at an equal-or-higher price, past cooldown.
    Routine,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationKind::FirstMatch => "first_match",
            NotificationKind::PriceDrop => "price_drop",
            NotificationKind::Routine => "routine",
        };
        write!(f, "{s}")
    }
}

/// Everything the dispatcher needs to build one direct message.
#[derive(Debug, Clone)]
pub struct AlertNotification {
    pub alert_id: i64,
    pub search_term: String,
    pub server: Server,
    pub store_type: StoreType,
    pub kind: NotificationKind,
    pub previous_lowest: Option<i64>,
    pub current_lowest: i64,
    /// Matching listings sorted ascending by price, truncated to a few.
    pub listings: Vec<Listing>,
}
