//! quiclet - a managed QUIC (RFC 9000/9001) endpoint engine.
//!
//! The crate drives QUIC connections over one UDP datagram socket:
//! packet number spaces with loss detection, AEAD packet protection
//! with header masking, stream flow-control buffers, the TLS-driven
//! key schedule, and a single-threaded event loop servicing receive,
//! timer, and application events.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use quiclet::transport::{Endpoint, EndpointConfig, ConnectionConfig};
//!
//! # fn tls_config() -> Box<dyn quiclet::transport::TlsConfig> { unimplemented!() }
//! let config = EndpointConfig {
//!     connection: ConnectionConfig::default(),
//!     tls: tls_config(),
//!     accept_connections: false,
//! };
//! let mut endpoint = Endpoint::bind("0.0.0.0:0".parse().unwrap(), config).unwrap();
//! let handle = endpoint.handle();
//! let conn = endpoint.connect("192.0.2.1:4433".parse().unwrap(), "example.com").unwrap();
//! std::thread::spawn(move || endpoint.run());
//! # let _ = (handle, conn);
//! ```
//!
//! The TLS handshake itself is delegated to an opaque provider behind
//! the [`transport::TlsSession`] contract; AEAD, HKDF, and header
//! protection come from `ring`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod transport;
pub mod wire;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
