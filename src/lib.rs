pub mod config;
pub mod database;
pub mod network;
pub mod bridge;
pub mod util;
pub mod matrix;
pub mod error;

pub const NAME: &str = "matrix-bridge-core";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
