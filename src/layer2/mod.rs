// Layer 2 - Data Processing & Synchronization
// Pure Rust - parses depth frames, keeps books synchronized and projects them for display

pub mod parser;
pub mod orderbook;
pub mod synchronizer;
pub mod service;
pub mod depth_view;
pub mod metrics;

// Re-export commonly used items
pub use parser::{
    MessageParser, ParseError, ParserStats, PriceLevel, StreamFrame, DepthUpdateEvent,
    parse_frame, parse_depth_snapshot,
};
pub use orderbook::{OrderBookSnapshot, PriceLevels, ApplyResult, SequenceCheck};
pub use synchronizer::{
    SymbolSynchronizer, SyncState, BookFeed, UpdateOutcome, SnapshotOutcome, SynchronizerStats,
};
pub use service::{OrderBookService, BookSubscription, ServiceConfig, ServiceError};
pub use depth_view::{
    DisplayDepth, DepthLevel, OrderBookView, ViewError, project, format_price, format_quantity,
};
pub use metrics::UnifiedMetrics;
