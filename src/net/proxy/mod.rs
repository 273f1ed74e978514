//! Plumbing for forwarding DNS queries to upstream servers.
//!
//! A forwarding proxy sends the queries it receives to one or more
//! upstream servers over UDP, TCP, or TLS. Setting up a new connection for
//! every query is expensive, especially with TLS, so the [`persistent`]
//! module keeps connections that are no longer needed by a query around
//! for reuse by the next one.
//!
//! The connections themselves are described by the [`conn`] module. The
//! code that dials new connections, decides which upstream to ask, and
//! retries failed queries lives elsewhere. It asks the
//! [`Transport`][persistent::Transport] for an idle connection via
//! [`take`][persistent::Transport::take], dials a new one if there is none,
//! and hands it back via
//! [`yield_conn`][persistent::Transport::yield_conn] when done.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use domain_persist::net::proxy::conn::{
//! #     PersistConn, TransportType, UpstreamStream,
//! # };
//! # use domain_persist::net::proxy::persistent::Transport;
//! # async fn _test() -> std::io::Result<()> {
//! let transport = Arc::new(Transport::new("forward", "192.0.2.1:53"));
//! let sweep = transport.start();
//!
//! let pc = match transport.take(TransportType::Tcp) {
//!     Some(pc) => pc,
//!     None => {
//!         let stream =
//!             tokio::net::TcpStream::connect(transport.addr()).await?;
//!         PersistConn::new(UpstreamStream::from(stream))
//!     }
//! };
//! // ... send the query and read the response ...
//! transport.yield_conn(pc);
//!
//! transport.stop();
//! let _ = sweep.await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

pub mod conn;
pub mod error;
pub mod persistent;
