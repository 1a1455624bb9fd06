//! XMPP File Transfer Library
//!
//! Negotiation core for XMPP file transfers: stream initiation offers and
//! answers, SOCKS5 bytestream candidate exchange (direct, UPnP mapped and
//! proxied), in-band bytestreams, and the per-account controller that ties
//! them to a registry of live transfers.
//!
//! All state machines are sans-IO. They emit stanzas and UI events through
//! the sinks owned by [`session::AccountSession`] and drive sockets through
//! the [`pool::SocketPool`] trait. [`service::TransferService`] runs them on
//! a single tokio task.

pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod ibb;
pub mod negotiator;
pub mod pool;
pub mod record;
pub mod registry;
pub mod relay;
pub mod service;
pub mod session;
pub mod upnp;

#[cfg(test)]
mod testing;
