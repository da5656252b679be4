use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::DISCORD_API_URL;
use crate::error::{AppError, Result};
use crate::types::{AlertNotification, NotificationKind};

/// Delivery seam. `Ok(false)` means the recipient is unreachable (closed
/// DMs) — an expected condition, never an error.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: &str, notification: &AlertNotification) -> Result<bool>;
}

/// Sends per-user direct messages over the Discord REST API: open (or
/// reuse) the DM channel, then post the message.
pub struct DiscordNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
    /// user_id → DM channel id. Channels are permanent, so cache forever.
    dm_channels: DashMap<String, String>,
}

impl DiscordNotifier {
    pub fn new(token: String) -> Result<Self> {
        Self::with_api_url(token, DISCORD_API_URL.to_string())
    }

    pub fn with_api_url(token: String, api_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_url,
            token,
            dm_channels: DashMap::new(),
        })
    }

    async fn dm_channel(&self, user_id: &str) -> Result<String> {
        if let Some(cached) = self.dm_channels.get(user_id) {
            return Ok(cached.clone());
        }

        let resp = self
            .client
            .post(format!("{}/users/@me/channels", self.api_url))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "recipient_id": user_id }))
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = resp.json().await?;
        let channel_id = body
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| AppError::Notify("DM channel response missing 'id'".to_string()))?
            .to_string();

        self.dm_channels.insert(user_id.to_string(), channel_id.clone());
        Ok(channel_id)
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, user_id: &str, notification: &AlertNotification) -> Result<bool> {
        let channel_id = self.dm_channel(user_id).await?;

        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_url, channel_id))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "content": build_message(notification) }))
            .send()
            .await?;

        // 403 = the user closed their DMs. Common and expected.
        if resp.status() == StatusCode::FORBIDDEN {
            debug!(user_id, alert_id = notification.alert_id, "DMs closed, delivery skipped");
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Message formatting
// ---------------------------------------------------------------------------

/// Plain-text DM body for one notification.
pub fn build_message(n: &AlertNotification) -> String {
    let verb = match n.store_type {
        crate::types::StoreType::Sell => "for sale",
        crate::types::StoreType::Buy => "wanted",
    };

    let headline = match n.kind {
        NotificationKind::FirstMatch => format!(
            "\u{1F514} First match for \"{}\" {verb} on {}!",
            n.search_term, n.server
        ),
        NotificationKind::PriceDrop => {
            let prev = n.previous_lowest.map(format_zeny).unwrap_or_default();
            format!(
                "\u{1F4C9} Price drop for \"{}\" on {}: {} → {}",
                n.search_term,
                n.server,
                prev,
                format_zeny(n.current_lowest)
            )
        }
        NotificationKind::Routine => format!(
            "\u{1F514} \"{}\" is {verb} on {} from {}",
            n.search_term,
            n.server,
            format_zeny(n.current_lowest)
        ),
    };

    let mut lines = vec![headline];
    for l in &n.listings {
        lines.push(format!(
            "• {} x{} — {} ({})",
            format_zeny(l.price),
            l.quantity,
            l.store_name,
            l.seller_name
        ));
    }
    lines.join("\n")
}

/// 1234567 → "1.234.567z" (LATAM-style grouping).
pub fn format_zeny(amount: i64) -> String {
    let digits = amount.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 2);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    if amount < 0 {
        format!("-{grouped}z")
    } else {
        format!("{grouped}z")
    }
}
