//! Sending and receiving DNS messages.
//!
//! Currently, the module only provides the [`proxy`] sub-module with the
//! upstream side of a forwarding proxy.

pub mod proxy;
