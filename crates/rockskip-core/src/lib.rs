pub mod cli;
pub mod config;
pub mod error;
pub mod evictor;
pub mod pool;
pub mod search;
pub mod server;
pub mod service;
pub mod status;
pub mod telemetry;
pub mod tools;

pub use config::RockskipConfig;
pub use error::SearchError;
pub use search::{SearchParams, SymbolMatch};
pub use server::{Server, ServerOptions};
