//! # meshlink - serial link layer for Meshtastic radios
//!
//! meshlink speaks the Meshtastic serial protocol over a USB/UART port: it finds the
//! radio, frames and unframes protobuf messages, runs the configuration handshake,
//! paces outbound traffic through a flow-controlled queue and keeps the link alive with
//! retries, reconnects and heartbeats.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "serial", feature = "meshtastic-proto"))]
//! # async fn demo() -> anyhow::Result<()> {
//! use meshlink::config::Config;
//! use meshlink::meshtastic::RobustClient;
//!
//! let config = Config::load("meshlink.toml").await?;
//! let client = RobustClient::open(&config.client_settings()).await?;
//! client.connect(&Default::default()).await?;
//! client.send_text("hello", meshlink::protobuf::BROADCAST_ADDR, 0).await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`meshtastic`] - framing, discovery, queueing, connection and supervision
//! - [`config`] - `meshlink.toml` loading and validation
//! - [`metrics`] - per-link counters
//! - [`logutil`] - helpers for logging device output safely
//! - [`protobuf`] - generated Meshtastic protobuf types
//!
//! ```text
//! ┌─────────────────┐
//! │  RobustClient   │ ← retries, reconnects, heartbeats
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ StreamConnection│ ← handshake, dispatch, admin requests
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Framer + Queue  │ ← 0x94 0xC3 frames, paced writes
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial port or in-memory pipe
//! └─────────────────┘
//! ```

pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
