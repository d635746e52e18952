pub mod app;
pub mod config;
pub mod error;

pub use app::{App, SwitchDirection};
pub use config::{AppConfig, ProviderConfig};
pub use error::{Result, VolshiftError};

// Re-export key types from workspace crates
pub use diagnostics;
pub use migration;
pub use provider;
pub use switchover;
