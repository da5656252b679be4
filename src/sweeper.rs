use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{error, info};

use crate::config::{ALERT_EXPIRY_DAYS, SWEEP_INTERVAL_SECS};
use crate::error::Result;
use crate::store::AlertStore;

/// Background task that removes alerts with no activity for 30 days.
/// An alert counts as active on creation and on every sent notification.
pub struct ExpirySweeper {
    store: AlertStore,
}

impl ExpirySweeper {
    pub fn new(store: AlertStore) -> Self {
        Self { store }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.tick().await; // consume immediate first tick

        loop {
            interval.tick().await;
            if let Err(e) = self.sweep().await {
                error!("expiry sweep failed: {e}");
            }
        }
    }

    async fn sweep(&self) -> Result<()> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let cutoff = now_ms - (ALERT_EXPIRY_DAYS as i64) * 24 * 3_600 * 1_000;

        let removed = self.store.remove_inactive(cutoff).await?;
        if removed > 0 {
            info!(removed, "expired inactive alerts");
        }
        Ok(())
    }
}
