pub mod client;

pub use client::{HttpMarketClient, MarketQuery};
