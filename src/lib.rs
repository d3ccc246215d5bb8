//! Push a file or a directory tree to a peer over one reliable byte stream.
//!
//! The sender writes FILE and DIRECTORY frames in depth-first order and waits
//! for a FILE_ACK after every file; a control listener drains the inbound half.
//! See [`connection::Connection`] for the session lifecycle and
//! [`streaming::protocol`] for the wire format.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod server;
pub mod streaming;
pub mod transport;

pub use config::{Config, PushConfig};
pub use connection::{Connection, LifecycleState};
pub use error::{PushError, Result};
