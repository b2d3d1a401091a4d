// Layer 3: pattern analyzers reading the shared buffers

pub mod events;
pub mod order_flow;
pub mod stop_hunt;

pub use events::EventPatternDetector;
pub use order_flow::{OrderFlowAnalyzer, OrderFlowSummary};
pub use stop_hunt::StopHuntDetector;
