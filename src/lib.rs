//! Persistent upstream connections for DNS forwarding proxies.
//!
//! A forwarding proxy answers queries by asking upstream servers. This
//! crate provides the part that keeps connections to those upstreams open
//! between queries so that the cost of dialing, and for DNS-over-TLS the
//! handshake, is paid only once. Idle connections are closed again after a
//! while so they don’t pile up.
//!
//! # Modules
//!
//! * [net] contains the networking code, currently the
//!   [net::proxy] module with the persistent connection cache, and
//! * [utils] contains helpers for configuration values.
//!
//! # Reference of Feature Flags
//!
//! The following is the complete list of the feature flags available.
//!
//! * `tls`: support for keeping DNS-over-TLS connections via the
//!   [tokio-rustls](https://github.com/rustls/tokio-rustls) crate and for
//!   storing the TLS configuration used to dial them. This feature is
//!   enabled by default.
//!
//! The crate logs through [tracing](https://github.com/tokio-rs/tracing).
//! The sweep task runs on a [Tokio](https://tokio.rs/) runtime. Connections
//! may be handed back from any thread.

#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod net;
pub mod utils;
