pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod security;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, OraError};
pub use event::EventBus;
pub use types::*;
