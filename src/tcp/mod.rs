//! TCP transport (plain and TLS).
//!
//! # Data Flow
//! ```text
//! TcpManager::init
//!     → listener.rs (bind, accept on its loop, permit per connection)
//!     → next loop in rotation: optional TLS accept → on_accept
//!
//! TcpManager::create_connection
//!     → resolve → connect each candidate in turn → optional TLS connect
//!     → on_connect(Some) on success, on_connect(None) once all candidates fail
//!
//! Running connection (connection.rs driver)
//!     read → RecvBuffer → on_recv when watermark reached
//!     send_buffer_fill → SendQueue → write → on_send when drained
//!     close → on_close, exactly once
//! ```

pub mod connection;
mod listener;
pub mod manager;
pub mod service;

pub use connection::{TcpConnection, TcpContext};
pub use manager::TcpManager;
pub use service::TcpService;
