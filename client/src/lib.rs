//! # Relay Terminal Client
//!
//! A line-oriented chat client for the relay server. Each line typed on
//! stdin is sent as one text frame, and every frame the relay delivers is
//! printed as one line on stdout.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - WebSocket connection setup
//! - Interleaving of local input and relayed messages
//! - Rendering of received frames as lines
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tokio::io::{stdin, stdout, BufReader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let url = shared::ws_url("127.0.0.1", 3000, "/ws");
//!     client::network::run(&url, BufReader::new(stdin()), stdout()).await
//! }
//! ```

pub mod network;
