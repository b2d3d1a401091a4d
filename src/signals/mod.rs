// Signal pipeline: merge, validate, score, filter, track

pub mod context_filter;
pub mod merger;
pub mod scorer;
pub mod tracker;
pub mod validator;

pub use context_filter::{FilterDecision, MarketContextFilter};
pub use merger::SignalMerger;
pub use scorer::{ConfidenceScorer, ConfidenceState, WinLoss};
pub use tracker::{DecidedOutcome, OutcomeTracker};
pub use validator::{DropReason, SignalValidator};
