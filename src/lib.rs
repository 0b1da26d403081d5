//! evalbridge library
//!
//! Sends editor text to a long-running evaluation server and routes its
//! replies back to a display surface:
//!
//! - `session` - connection state machine, handshake, send queue, framing
//! - `response` - classification of inbound replies
//! - `server` - lifecycle of the backend process
//! - `config` - file and environment configuration
//! - `sinks` - output/status capabilities injected by the host
//!
//! ```ignore
//! use std::sync::Arc;
//! use evalbridge::config::Config;
//! use evalbridge::server::{CommandLauncher, ServerLifecycle};
//! use evalbridge::session::SessionConnection;
//! use evalbridge::sinks::TracingSink;
//!
//! let config = Config::load()?;
//! let mut server = ServerLifecycle::new(
//!     Box::new(CommandLauncher),
//!     config.server_command(),
//!     Arc::new(TracingSink),
//! );
//! server.start();
//!
//! let mut session = SessionConnection::new(config.connector());
//! session.on_response(|_, response| println!("{}", response.display_text()));
//! session.connect().await;
//! session.send("1+1");
//! ```

pub mod config;
pub mod response;
pub mod server;
pub mod session;
pub mod sinks;
