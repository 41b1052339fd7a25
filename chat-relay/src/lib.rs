//! WebSocket chat relay.
//!
//! Clients connect, announce a display name, and exchange chat messages and
//! typing notices. The relay never answers a client; it forwards what one
//! client sends to every other live client on a best-effort basis.
//!
//! - [`registry`] tracks live connections and hands out process-unique ids.
//! - [`connection`] holds per-client state and the bounded outbound queue
//!   that keeps a slow client from stalling anyone else.
//! - [`event`] classifies every inbound payload into exactly one [`event::Event`].
//! - [`broadcast`] routes classified events to their recipients.
//! - [`relay`] owns the HTTP surface and each connection's lifecycle, from
//!   upgrade through deregistration.
//! - [`message`] defines the JSON shapes clients exchange.
//! - [`cli`] and [`client`] back the `chat_relay` binary.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod connection;
pub mod event;
pub mod message;
pub mod registry;
pub mod relay;
