pub mod bridge;
pub mod client;
pub mod delivery;
pub mod gateway;
pub mod handlers;
pub mod server;
pub mod wire;

pub use server::{Server, ServerConfig};
