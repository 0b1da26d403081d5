//! Session connection to the evaluation server.
//!
//! This module is the protocol layer between the editor and a long-running
//! evaluation server:
//!
//! ```text
//! ┌─────────────────┐        TCP / Unix socket       ┌─────────────────────┐
//! │     Editor      │  ◄───────────────────────────► │  evaluation server  │
//! │ (SessionConn.)  │   text lines out, chunks in    │                     │
//! └─────────────────┘                                └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! After every connect the client announces its session, then sends one
//! line per payload:
//!
//! ```text
//! @session 0b6c1a4e-8a3f-4d55-9b8e-2f6d1c7a9e10\n
//! 1+1\n
//! ```
//!
//! Replies are JSON documents such as `{"status":"success"}` or
//! `{"result":2}`; anything that is not JSON is shown as raw text.
//!
//! # Usage
//!
//! ```ignore
//! use evalbridge::session::{SessionConnection, TcpConnector};
//!
//! let mut session = SessionConnection::new(Box::new(TcpConnector::new("127.0.0.1", 7878)));
//! session.on_state_change(|_, state| println!("{}", state));
//! session.connect().await;
//! session.send("print('hi')");
//! ```

mod connection;
mod framing;
mod transport;

pub use connection::{
    ConnectError, ConnectionState, ResponseHandler, SessionConnection, StateObserver,
    CONNECT_TIMEOUT, DRAIN_TIMEOUT,
};
pub use framing::{handshake_line, write_line, InboundFraming, LineAssembler};
#[cfg(unix)]
pub use transport::UnixConnector;
pub use transport::{BoxedStream, Connector, Stream, TcpConnector};
