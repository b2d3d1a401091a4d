// Layer 1: upstream connectivity (streaming feed + REST poller)

pub mod feed;
pub mod poller;

pub use feed::{FeedClient, FeedStats, LIQUIDATION_CHANNEL, trade_channel};
pub use poller::{ContextPoller, PollerError, PollerStats};
