// Dashboard surface: HTTP API and WebSocket push channel

pub mod api;
pub mod push;
pub mod state;

pub use api::DashboardServer;
pub use state::{CoinCommand, DashboardEvent, DashboardState};
