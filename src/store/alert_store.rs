use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{AppError, Result};
use crate::types::{Alert, GroupKey, NewAlert, QueryGroup, Server, StoreType};

const LAST_GLOBAL_CHECK_KEY: &str = "last_global_check";

/// Durable keyed storage of alert definitions, backed by SQLite.
///
/// The checker re-fetches an alert's row before mutating it, so a user
/// cancelling an alert mid-cycle simply makes it disappear from the
/// cycle rather than racing a write.
#[derive(Clone)]
pub struct AlertStore {
    pool: sqlx::SqlitePool,
}

impl AlertStore {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new alert. Rejects a second alert by the same user for the
    /// same (lowercased term, server, store type); the unique index
    /// backstops the explicit check.
    pub async fn create(&self, new: NewAlert, now_ms: i64) -> Result<Alert> {
        let term_lower = new.search_term.to_lowercase();

        let existing = sqlx::query(
            "SELECT 1 FROM alerts
             WHERE user_id = ? AND term_lower = ? AND server = ? AND store_type = ?",
        )
        .bind(&new.user_id)
        .bind(&term_lower)
        .bind(new.server.as_str())
        .bind(new.store_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_some() {
            return Err(AppError::DuplicateAlert {
                user_id: new.user_id,
                term: term_lower,
                server: new.server.to_string(),
                store_type: new.store_type.to_string(),
            });
        }

        let res = sqlx::query(
            "INSERT INTO alerts (
                user_id, search_term, term_lower, server, store_type,
                max_price, min_quantity, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.user_id)
        .bind(&new.search_term)
        .bind(&term_lower)
        .bind(new.server.as_str())
        .bind(new.store_type.as_str())
        .bind(new.max_price)
        .bind(new.min_quantity)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(Alert {
            id: res.last_insert_rowid(),
            user_id: new.user_id,
            search_term: new.search_term,
            server: new.server,
            store_type: new.store_type,
            max_price: new.max_price,
            min_quantity: new.min_quantity,
            created_at: now_ms,
            last_notified_at: None,
            notification_count: 0,
            lowest_price_seen: None,
        })
    }

    pub async fn list_all(&self) -> Result<Vec<Alert>> {
        let rows = sqlx::query("SELECT * FROM alerts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_alert).transpose()
    }

    /// All alerts bucketed by (lowercased term, server, store type).
    /// Groups come back in first-seen id order; members in id order.
    pub async fn grouped_by_key(&self) -> Result<Vec<QueryGroup>> {
        let alerts = self.list_all().await?;

        let mut order: Vec<GroupKey> = Vec::new();
        let mut by_key: HashMap<GroupKey, QueryGroup> = HashMap::new();
        for alert in alerts {
            let key = alert.group_key();
            match by_key.get_mut(&key) {
                Some(group) => group.alerts.push(alert),
                None => {
                    order.push(key.clone());
                    by_key.insert(
                        key.clone(),
                        QueryGroup {
                            key,
                            search_term: alert.search_term.clone(),
                            alerts: vec![alert],
                        },
                    );
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|k| by_key.remove(&k))
            .collect())
    }

    pub async fn update_lowest_price(&self, id: i64, price: i64) -> Result<()> {
        sqlx::query("UPDATE alerts SET lowest_price_seen = ? WHERE id = ?")
            .bind(price)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp last-notified and bump the notification counter.
    pub async fn mark_notified(&self, id: i64, now_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE alerts
             SET last_notified_at = ?, notification_count = notification_count + 1
             WHERE id = ?",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns true if a row was actually deleted.
    pub async fn remove(&self, id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM alerts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Delete alerts with no activity (notification or creation) since
    /// `cutoff_ms`. Returns the number removed.
    pub async fn remove_inactive(&self, cutoff_ms: i64) -> Result<u64> {
        let res = sqlx::query(
            "DELETE FROM alerts WHERE COALESCE(last_notified_at, created_at) < ?",
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    pub async fn update_last_global_check(&self, now_ms: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_GLOBAL_CHECK_KEY)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_global_check(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?")
            .bind(LAST_GLOBAL_CHECK_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("value")))
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

fn row_to_alert(row: &SqliteRow) -> Result<Alert> {
    let server_s: String = row.get("server");
    let store_type_s: String = row.get("store_type");

    let server = Server::parse(&server_s).ok_or_else(|| {
        AppError::Database(sqlx::Error::ColumnDecode {
            index: "server".to_string(),
            source: format!("unknown server '{server_s}'").into(),
        })
    })?;
    let store_type = StoreType::parse(&store_type_s).ok_or_else(|| {
        AppError::Database(sqlx::Error::ColumnDecode {
            index: "store_type".to_string(),
            source: format!("unknown store type '{store_type_s}'").into(),
        })
    })?;

    Ok(Alert {
        id: row.get("id"),
        user_id: row.get("user_id"),
        search_term: row.get("search_term"),
        server,
        store_type,
        max_price: row.get("max_price"),
        min_quantity: row.get("min_quantity"),
        created_at: row.get("created_at"),
        last_notified_at: row.get("last_notified_at"),
        notification_count: row.get("notification_count"),
        lowest_price_seen: row.get("lowest_price_seen"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
