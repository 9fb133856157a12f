/// In-process channels between the ingest side and position tasks

pub mod price_feed;

pub use price_feed::{PriceFeed, PriceQuote};
