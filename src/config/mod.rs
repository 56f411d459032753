//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetloomConfig (validated, immutable)
//!     → TcpManagerConfig / UdpManagerConfig handed to the managers
//! ```
//!
//! # Design Decisions
//! - Config is immutable once a manager is initialized
//! - All fields have defaults to allow minimal configs
//! - Managers validate again in `init`, so configs built in code are checked too

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    NetloomConfig, ObservabilityConfig, PortPolicy, ProxyConfig, TcpManagerConfig,
    UdpManagerConfig,
};
pub use validation::ValidationError;
