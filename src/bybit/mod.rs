pub mod auth;
pub mod client;
pub mod types;
pub mod websocket;

pub use auth::BybitAuth;
pub use client::BybitClient;
pub use types::*;
pub use websocket::KlineFeed;
