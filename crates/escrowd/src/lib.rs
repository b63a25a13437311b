//! `escrowd`: a file-descriptor escrow daemon and client library.
//!
//! A long-lived daemon process holds open file descriptors (and small
//! opaque payloads) on behalf of one short-lived client process at a time,
//! keyed by `(tag, index)`, and returns them to the next client on demand.
//! The motivating use case is zero-downtime service upgrade: a server hands
//! off its live listener and connection sockets to the escrow, exits, and
//! the new binary reclaims those same kernel descriptors.
//!
//! - [`sparse`] — the two-level sparse index backing each tag.
//! - [`wire`] — the on-the-wire request/reply message schema.
//! - [`transport`] — framing and descriptor passing over the session socket.
//! - [`domain`] — `Slot`/`Tag`/`Domain`, the in-memory data model.
//! - [`daemon`] — the daemon's accept/session loop.
//! - [`client`] — the client stub, including bootstrap-on-demand.
//! - [`error`] — the shared error taxonomy.

pub mod client;
pub mod daemon;
pub mod domain;
pub mod error;
pub mod sparse;
pub mod transport;
pub mod wire;

pub use client::Handle;
pub use domain::Domain;
pub use error::EscrowError;
