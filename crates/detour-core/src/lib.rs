//! # Detour Core
//!
//! Races a direct connection against a detoured (proxied) one and exposes the
//! winner as a single byte stream.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Whitelist** - Addresses known to need the detour path
//! - **Interference detection** - DNS hijack, tampering and fake-page checks
//! - **Paths** - Direct and detour connections classified by those checks
//! - **Conn** - The dual-path connection and its coordination task
//! - **Configuration** - TOML-backed dial, detector and whitelist settings
//!
//! ## Example
//!
//! ```rust,no_run
//! use detour_core::{Dialer, Network, TcpDial};
//!
//! # async fn run() -> detour_core::Result<()> {
//! // Any `Dial` works as the detour transport; a real application plugs in
//! // its tunnel here.
//! let dialer = Dialer::builder(TcpDial::new()).build();
//!
//! let conn = dialer.dial(Network::Tcp, "example.com:80").await?;
//! conn.write(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n").await?;
//!
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf).await?;
//! conn.close().await?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conn;
pub mod detector;
pub mod error;
pub mod path;
pub mod stream;
pub mod whitelist;

// Re-exports for convenience
pub use config::{Config, DialSettings};
pub use conn::{is_nonidempotent_request, Conn, ConnStream, Dialer, DialerBuilder};
pub use detector::{CountryDetector, Detector, DetectorHandle, FailureKind};
pub use error::{Error, Result};
pub use path::PathKind;
pub use stream::{Dial, Network, RawStream, TcpDial, TcpRawStream};
pub use whitelist::Whitelist;
