use thiserror::Error;

/// Errors surfaced by the transport, codec, queue and connection layers.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("queue is full")]
    QueueFull,

    #[error("queue is empty")]
    QueueEmpty,

    #[error("queue is closed")]
    QueueClosed,

    #[error("operation cancelled")]
    Cancelled,

    /// Outbound payload would not fit in a single wire frame.
    #[error("payload too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The hardened parser hit its consecutive error cap; the link should be torn down.
    #[error("too many consecutive parse errors ({0})")]
    TooManyParseErrors(u32),

    #[cfg(feature = "meshtastic-proto")]
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serial")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("device not connected")]
    NotConnected,

    #[error("timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("no Meshtastic devices found")]
    NoDeviceFound,

    #[error("port {0} not found")]
    PortNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The radio answered an admin request with a different message type.
    #[error("unexpected admin response, expected {0}")]
    UnexpectedResponse(&'static str),

    /// Wraps a lower-level failure with the step that was being attempted.
    #[error("{context}: {source}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<MeshError>,
    },

    /// Every attempt of a retried operation failed. `errors` keeps the failure of
    /// each attempt in order, oldest first.
    #[error("failed to {operation} after {attempts} attempts{}", last_cause(.errors))]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        errors: Vec<String>,
    },
}

fn last_cause(errors: &[String]) -> String {
    match errors.last() {
        Some(e) => format!(": {e}"),
        None => String::new(),
    }
}

impl MeshError {
    pub fn context(self, context: &'static str) -> Self {
        MeshError::Context {
            context,
            source: Box::new(self),
        }
    }

    /// True for failures caused by the link going away rather than by bad input.
    pub fn is_link_failure(&self) -> bool {
        match self {
            MeshError::Io(_) | MeshError::NotConnected | MeshError::TooManyParseErrors(_) => true,
            #[cfg(feature = "serial")]
            MeshError::Serial(_) => true,
            MeshError::Context { source, .. } => source.is_link_failure(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_reports_last_cause() {
        let err = MeshError::RetriesExhausted {
            operation: "connect",
            attempts: 3,
            errors: vec!["first".into(), "second".into(), "timeout waiting for configuration".into()],
        };
        assert_eq!(
            err.to_string(),
            "failed to connect after 3 attempts: timeout waiting for configuration"
        );
    }

    #[test]
    fn context_keeps_source_and_classification() {
        let err = MeshError::NotConnected.context("failed to send wake-up sequence");
        assert_eq!(err.to_string(), "failed to send wake-up sequence: device not connected");
        assert!(err.is_link_failure());
        assert!(!MeshError::QueueFull.is_link_failure());
    }
}
