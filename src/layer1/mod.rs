// Layer 1 - Data Connectors for Binance Futures
// Shared stream connection and REST depth snapshots

pub mod websocket;
pub mod rest_client;

// Re-export commonly used items for convenience
pub use websocket::{
    ReconnectPolicy, StreamControl, TransportError, TransportEvent, WebSocketClient, WebSocketStats,
};
pub use rest_client::{BinanceRestClient, RestClientStats, SnapshotError, SnapshotSource};
