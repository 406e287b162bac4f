//! # Meshtastic serial link
//!
//! Everything needed to talk to a Meshtastic radio over a USB/UART serial port:
//!
//! - [`framer`] / [`robust`]: the `0x94 0xC3 <len>` frame codec, including the
//!   interleaved firmware log text.
//! - [`discovery`]: find and rank candidate serial ports.
//! - [`queue`]: bounded outbound queue with a priority lane and an ack window.
//! - [`transport`]: the byte-stream seam (serial port, in-memory pipe).
//! - [`stream`]: one live connection; handshake, dispatch, admin requests.
//! - [`manager`]: retries, reconnects, heartbeats and the combined client.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "serial", feature = "meshtastic-proto"))]
//! # async fn demo() -> meshlink::meshtastic::Result<()> {
//! use meshlink::meshtastic::{RobustClient, ClientSettings};
//! use meshlink::meshtastic::discovery::DiscoveryConfig;
//!
//! let client = RobustClient::auto_discover_and_connect(
//!     DiscoveryConfig::default(),
//!     ClientSettings::default(),
//! )
//! .await?;
//! client.send_text("hello mesh", meshlink::protobuf::BROADCAST_ADDR, 0).await?;
//! # Ok(())
//! # }
//! ```
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub mod discovery;
pub mod error;
pub mod framer;
pub mod queue;
pub mod robust;
pub mod state;
pub mod transport;

#[cfg(feature = "meshtastic-proto")]
pub mod manager;
#[cfg(feature = "meshtastic-proto")]
pub mod stream;

pub use discovery::{DiscoveredPort, Discovery, DiscoveryConfig, DiscoveryResult};
pub use error::{MeshError, Result};
pub use framer::{Frame, FrameBuilder, FrameParser, FrameSink};
pub use queue::{FlowControlledQueue, MessageQueue};
pub use robust::{RobustFrameBuilder, RobustFrameParser};
pub use state::{DeviceState, StateTransition};
pub use transport::{PipeRemote, PipeTransport, SerialSettings, Transport};

#[cfg(feature = "serial")]
pub use transport::SerialTransport;

#[cfg(feature = "meshtastic-proto")]
pub use manager::{ClientSettings, ConnectionManager, HeartbeatManager, MeshLink, RobustClient};
#[cfg(feature = "meshtastic-proto")]
pub use stream::{StreamConnection, StreamSettings, TextMessage};

// A panicking callback must not wedge the link, so poisoned locks are recovered.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
