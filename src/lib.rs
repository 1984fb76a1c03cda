mod auth;
pub mod config;
pub mod connection;
mod entrypoint;
pub mod error;
pub mod gateway;
mod session;
mod ssh;
mod tunnel;
pub mod wire;

pub use entrypoint::entrypoint;
