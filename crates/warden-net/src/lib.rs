//! Warden Net - listeners for the panel port.
//!
//! - [`SniffingStream`] peeks the first bytes of a connection once: plaintext
//!   HTTP is redirected to HTTPS, anything else is replayed unchanged
//! - [`SniffingListener`] and [`TlsListener`] plug into `axum::serve`

pub mod error;
pub mod listener;
pub mod sniff;

pub use error::{NetError, Result};
pub use listener::{bind, load_tls_config, SniffingListener, TlsListener, HANDSHAKE_TIMEOUT};
pub use sniff::{SniffingStream, SNIFF_WINDOW};
