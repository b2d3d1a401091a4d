// Signal Hunt - real-time market intelligence for crypto derivatives
//
// Data flows leaves-first: the feed layer normalises vendor frames into
// canonical records, the buffer layer holds per-symbol rolling windows,
// three analyzers emit candidates, and the signal pipeline merges,
// validates, scores and context-filters them before delivery to the
// messaging sink and the dashboard. Outcomes feed back into scoring.

pub mod alerts;
pub mod core;
pub mod dashboard;
pub mod engine;
pub mod layer1;
pub mod layer2;
pub mod layer3;
pub mod signals;
pub mod storage;

pub use engine::{Engine, OutboundSignal, SignalPipeline};
