use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::types::{Listing, SearchResult, Server, StoreType};

/// Seam between the checker and the live market endpoint. The checker only
/// ever talks to this trait, which is what the tests mock.
#[async_trait]
pub trait MarketQuery: Send + Sync {
    async fn search(
        &self,
        term: &str,
        server: Server,
        store_type: StoreType,
    ) -> Result<SearchResult>;
}

/// HTTP client for the ROLA market search endpoint.
pub struct HttpMarketClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMarketClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl MarketQuery for HttpMarketClient {
    async fn search(
        &self,
        term: &str,
        server: Server,
        store_type: StoreType,
    ) -> Result<SearchResult> {
        let url = format!("{}/market/search", self.base_url);
        let resp: serde_json::Value = self
            .client
            .get(&url)
            .query(&[
                ("name", term),
                ("server", server.as_str()),
                ("type", store_type.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let result = parse_search_response(&resp)?;
        debug!(
            term,
            server = %server,
            store_type = %store_type,
            listings = result.listings.len(),
            "market search complete"
        );
        Ok(result)
    }
}

/// Parse the search payload. Structurally broken items are dropped rather
/// than failing the whole response; a non-object root is a hard error.
pub fn parse_search_response(v: &serde_json::Value) -> Result<SearchResult> {
    let items = v
        .get("items")
        .and_then(|i| i.as_array())
        .ok_or_else(|| AppError::MarketResponse("missing 'items' array".to_string()))?;

    let listings: Vec<Listing> = items.iter().filter_map(parse_listing).collect();
    let total_count = v
        .get("total")
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .unwrap_or(listings.len());

    Ok(SearchResult { listings, total_count })
}

fn parse_listing(v: &serde_json::Value) -> Option<Listing> {
    let price = v.get("price")?.as_i64()?;
    if price <= 0 {
        return None;
    }
    // Older payloads say "amount", newer ones "quantity".
    let quantity = v
        .get("quantity")
        .or_else(|| v.get("amount"))
        .and_then(|q| q.as_i64())
        .unwrap_or(1);

    Some(Listing {
        price,
        quantity,
        seller_name: str_field(v, "sellerName"),
        store_name: str_field(v, "shopName"),
        item_id: v.get("itemId").and_then(|i| i.as_i64()).unwrap_or(0),
        item_name: str_field(v, "itemName"),
    })
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key).and_then(|s| s.as_str()).unwrap_or("").to_string()
}
