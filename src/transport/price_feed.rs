use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

use crate::core::types::{PriceSample, TokenId};
use crate::ingest::websocket::StopSignal;

/// Latest price view of a token plus its first positive price
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub latest: PriceSample,
    /// Set once, by the first sample with a positive price
    pub open_price: Option<f64>,
}

/// Latest-value price channels keyed by token.
///
/// Each token gets a `watch` channel: writers overwrite, readers see only the
/// most recent quote. Intermediate samples may be skipped by a slow reader.
#[derive(Debug, Clone, Default)]
pub struct PriceFeed {
    channels: Arc<DashMap<TokenId, watch::Sender<Option<PriceQuote>>>>,
}

impl PriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for a token's quotes, creating the channel on first use.
    pub fn subscribe(&self, token: TokenId) -> watch::Receiver<Option<PriceQuote>> {
        self.channels
            .entry(token)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Updates a tracked token's quote. Samples for tokens without a channel
    /// (never subscribed, or already removed) are dropped.
    pub fn publish(&self, sample: PriceSample) -> bool {
        let Some(sender) = self.channels.get(&sample.token) else {
            return false;
        };

        sender.send_modify(|slot| {
            let open_price = match slot.as_ref().and_then(|quote| quote.open_price) {
                Some(open) => Some(open),
                None if sample.price > 0.0 => Some(sample.price),
                None => None,
            };
            *slot = Some(PriceQuote {
                latest: sample,
                open_price,
            });
        });
        true
    }

    pub fn latest(&self, token: &TokenId) -> Option<PriceQuote> {
        self.channels.get(token).and_then(|sender| sender.borrow().clone())
    }

    pub fn remove(&self, token: &TokenId) {
        self.channels.remove(token);
    }

    pub fn is_tracked(&self, token: &TokenId) -> bool {
        self.channels.contains_key(token)
    }

    pub fn tracked(&self) -> usize {
        self.channels.len()
    }

    /// Applies decoded samples to the feed until `stop` fires.
    #[instrument(skip_all)]
    pub async fn run_consumer(
        self,
        mut samples: mpsc::Receiver<PriceSample>,
        verbose: bool,
        stop: StopSignal,
    ) {
        info!("Price consumer started");
        loop {
            let sample = tokio::select! {
                _ = stop.stopped() => break,
                next = samples.recv() => match next {
                    Some(sample) => sample,
                    None => break,
                },
            };

            if verbose {
                info!(token = %sample.token, price = %format!("{:.10}", sample.price), "Price update");
            } else {
                debug!(token = %sample.token, price = sample.price, "Price update");
            }
            let token = sample.token;
            if !self.publish(sample) {
                debug!(token = %token, "Dropping price update for untracked token");
            }
        }
        info!("Price consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(token: TokenId, price: f64) -> PriceSample {
        PriceSample {
            token,
            price,
            raw_sqrt_price: 0,
            pool_migrated: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_open_price_set_once() {
        let feed = PriceFeed::new();
        let token = TokenId::from_bytes([1u8; 32]);
        let _rx = feed.subscribe(token);

        feed.publish(sample(token, 0.0));
        assert_eq!(feed.latest(&token).unwrap().open_price, None);

        feed.publish(sample(token, 2.0));
        feed.publish(sample(token, 3.0));
        let quote = feed.latest(&token).unwrap();
        assert_eq!(quote.open_price, Some(2.0));
        assert_eq!(quote.latest.price, 3.0);
    }

    #[test]
    fn test_tokens_are_independent() {
        let feed = PriceFeed::new();
        let a = TokenId::from_bytes([1u8; 32]);
        let b = TokenId::from_bytes([2u8; 32]);
        let (_ra, _rb) = (feed.subscribe(a), feed.subscribe(b));
        feed.publish(sample(a, 1.0));
        feed.publish(sample(b, 5.0));

        assert_eq!(feed.latest(&a).unwrap().latest.price, 1.0);
        assert_eq!(feed.latest(&b).unwrap().open_price, Some(5.0));

        feed.remove(&a);
        assert!(feed.latest(&a).is_none());
        assert_eq!(feed.tracked(), 1);
    }

    #[tokio::test]
    async fn test_receiver_sees_latest_only() {
        let feed = PriceFeed::new();
        let token = TokenId::from_bytes([3u8; 32]);
        let mut rx = feed.subscribe(token);
        assert!(rx.borrow().is_none());

        for price in [1.0, 2.0, 4.0] {
            feed.publish(sample(token, price));
        }
        rx.changed().await.unwrap();
        let quote = rx.borrow_and_update().clone().unwrap();
        assert_eq!(quote.latest.price, 4.0);
        assert_eq!(quote.open_price, Some(1.0));
    }

    #[tokio::test]
    async fn test_consumer_applies_samples() {
        let feed = PriceFeed::new();
        let token = TokenId::from_bytes([4u8; 32]);
        let _quotes = feed.subscribe(token);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(feed.clone().run_consumer(rx, false, StopSignal::new()));

        tx.send(sample(token, 7.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(feed.latest(&token).unwrap().latest.price, 7.0);
    }

    #[test]
    fn test_publish_after_remove_is_dropped() {
        let feed = PriceFeed::new();
        let token = TokenId::from_bytes([5u8; 32]);

        assert!(!feed.publish(sample(token, 1.0)));
        assert_eq!(feed.tracked(), 0);

        let _quotes = feed.subscribe(token);
        assert!(feed.publish(sample(token, 1.0)));
        feed.remove(&token);

        assert!(!feed.publish(sample(token, 2.0)));
        assert!(!feed.is_tracked(&token));
        assert_eq!(feed.tracked(), 0);
    }

    #[tokio::test]
    async fn test_consumer_drops_late_samples() {
        let feed = PriceFeed::new();
        let token = TokenId::from_bytes([6u8; 32]);
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(feed.clone().run_consumer(rx, true, StopSignal::new()));

        tx.send(sample(token, 3.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(feed.latest(&token).is_none());
        assert_eq!(feed.tracked(), 0);
    }
}
