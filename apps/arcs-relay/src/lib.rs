pub mod audit;
pub mod cli;
pub mod config;
pub mod jwt;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod sessions;
pub mod stream;
pub mod websocket;
