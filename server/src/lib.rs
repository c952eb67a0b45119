//! # Relay Server Library
//!
//! This library provides a real-time message relay. Clients hold a WebSocket
//! open, send messages, and every message is rebroadcast to every client that
//! is connected at the time it reaches the hub.
//!
//! ## Architecture Design
//!
//! ### Single Owner of Membership
//! The set of live connections belongs to one task, the hub control loop.
//! Joins, leaves and broadcasts arrive as events over channels and are
//! applied one at a time, so the set is never touched concurrently and no
//! lock is needed. A whole fan-out is one event, which means no join or
//! leave can land in the middle of it.
//!
//! ### Backpressure
//! Each connection has a bounded outbound queue. The hub never waits on it:
//! if a queue is full when a broadcast arrives, that connection is evicted
//! and the fan-out carries on. One slow or dead client therefore cannot stall
//! delivery to anyone else.
//!
//! ### Connection Duties
//! Every connection runs a reader that forwards incoming frames to the hub
//! and a writer that drains its outbound queue onto the socket. Either one
//! failing closes the connection, and the reader always asks the hub to
//! remove it on exit. Removal is idempotent, so a reader exit racing a
//! backpressure eviction is harmless.
//!
//! ## Module Organization
//!
//! ### Hub Module (`hub`)
//! - Membership bookkeeping and fan-out with eviction
//! - The control loop and the cloneable handle used to reach it
//! - Statistics snapshots
//!
//! ### Connection Module (`connection`)
//! - Outbound queue ownership
//! - Reader and writer duties over any WebSocket stream/sink pair
//!
//! ### Network Module (`network`)
//! - axum router with the WebSocket upgrade endpoint
//! - `/stats` JSON endpoint
//! - Static file serving for the browser client
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::hub::{Hub, HubConfig};
//! use server::network::{serve, ServerConfig};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let (hub, handle) = Hub::new(HubConfig::default());
//!     tokio::spawn(hub.run());
//!
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!     serve(listener, ServerConfig::default(), handle).await
//! }
//! ```

pub mod connection;
pub mod hub;
pub mod network;
