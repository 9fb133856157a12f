/// Chain-facing side: subscriptions, payload decoding, listing discovery and RPC lookups

pub mod decoder;
pub mod discovery;
pub mod rpc;
pub mod websocket;

pub use decoder::{decode_pool, price_from_sqrt, DecodeError, DecodedPool};
pub use discovery::MintDiscovery;
pub use rpc::{await_confirmation, resolve_pool, ChainLookup, Confirmation, RpcLookup};
pub use websocket::{AccountSubscriptions, EventSource, ReconnectPolicy, StopSignal, SubscribeOutcome};
