// Depth Sync - Binance order book synchronization
// Snapshot + diff-stream reconciliation with a render-ready depth projection

pub mod core;
pub mod layer1;
pub mod layer2;
