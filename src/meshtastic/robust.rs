//! Hardened frame codec used by the live connection.
//!
//! Byte semantics are identical to [`FrameParser`]; on top of that this parser counts
//! corruption, bounds its buffer independently of the payload limit, and gives up once
//! too many consecutive errors are seen so the connection can be torn down instead of
//! spinning on a garbage stream.
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use super::error::{MeshError, Result};
use super::framer::{
    FrameBuilder, FrameError, FrameParser, FrameSink, ParserState, Step, MAX_PAYLOAD_SIZE,
};

pub const DEFAULT_MAX_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct ParserStats {
    pub bytes_processed: u64,
    pub frames_processed: u64,
    pub parse_errors: u64,
    pub state_resets: u64,
    pub consecutive_errors: u32,
    pub last_frame_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub state: ParserState,
}

#[derive(Debug)]
pub struct RobustFrameParser {
    inner: FrameParser,
    max_buffer_size: usize,
    max_consecutive_errors: u32,
    bytes_processed: u64,
    parse_errors: u64,
    consecutive_errors: u32,
    last_frame_time: Option<DateTime<Utc>>,
    last_error_time: Option<DateTime<Utc>>,
}

impl Default for RobustFrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RobustFrameParser {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_CONSECUTIVE_ERRORS)
    }

    pub fn with_limits(max_buffer_size: usize, max_consecutive_errors: u32) -> Self {
        Self {
            inner: FrameParser::new(),
            max_buffer_size,
            max_consecutive_errors: max_consecutive_errors.max(1),
            bytes_processed: 0,
            parse_errors: 0,
            consecutive_errors: 0,
            last_frame_time: None,
            last_error_time: None,
        }
    }

    /// Feed a chunk of stream bytes.
    ///
    /// Returns [`MeshError::TooManyParseErrors`] once the consecutive error cap is
    /// reached; bytes after the failing one are not processed.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn FrameSink) -> Result<()> {
        for &b in data {
            self.bytes_processed += 1;
            match self.inner.step(b, sink) {
                Step::Continue => {
                    if self.inner.state() == ParserState::WaitPayload
                        && self.inner.buffered() > self.max_buffer_size
                    {
                        let size = self.inner.buffered();
                        self.inner.reset();
                        self.record_error(FrameError::BufferOverflow(size), sink)?;
                    }
                }
                Step::Frame => {
                    self.consecutive_errors = 0;
                    self.last_frame_time = Some(Utc::now());
                }
                Step::InvalidLength(len) => {
                    self.record_error(FrameError::InvalidLength(len), sink)?;
                }
            }
        }
        Ok(())
    }

    fn record_error(&mut self, err: FrameError, sink: &mut dyn FrameSink) -> Result<()> {
        self.parse_errors += 1;
        self.consecutive_errors += 1;
        self.last_error_time = Some(Utc::now());
        debug!(
            "Parse error ({} consecutive): {}",
            self.consecutive_errors, err
        );
        sink.on_error(&err);
        if self.consecutive_errors >= self.max_consecutive_errors {
            warn!(
                "Giving up after {} consecutive parse errors",
                self.consecutive_errors
            );
            return Err(MeshError::TooManyParseErrors(self.consecutive_errors));
        }
        Ok(())
    }

    pub fn state(&self) -> ParserState {
        self.inner.state()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn stats(&self) -> ParserStats {
        ParserStats {
            bytes_processed: self.bytes_processed,
            frames_processed: self.inner.frames_processed(),
            parse_errors: self.parse_errors,
            state_resets: self.inner.state_resets(),
            consecutive_errors: self.consecutive_errors,
            last_frame_time: self.last_frame_time,
            last_error_time: self.last_error_time,
            state: self.inner.state(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuilderStats {
    pub frames_built: u64,
    pub bytes_built: u64,
    pub build_errors: u64,
}

/// [`FrameBuilder`] that keeps counters.
#[derive(Debug, Default)]
pub struct RobustFrameBuilder {
    inner: FrameBuilder,
    stats: BuilderStats,
}

impl RobustFrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build_frame(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.inner.build_frame(payload) {
            Ok(frame) => {
                self.stats.frames_built += 1;
                self.stats.bytes_built += frame.len() as u64;
                Ok(frame)
            }
            Err(e) => {
                self.stats.build_errors += 1;
                warn!(
                    "Refusing to frame {} byte payload (max {})",
                    payload.len(),
                    MAX_PAYLOAD_SIZE
                );
                Err(e)
            }
        }
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn build_to_radio(
        &mut self,
        msg: &crate::protobuf::meshtastic_generated::ToRadio,
    ) -> Result<Vec<u8>> {
        self.build_frame(&crate::protobuf::encode_to_radio(msg))
    }

    pub fn stats(&self) -> BuilderStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::framer::tests::Collect;

    #[test]
    fn counts_invalid_lengths_and_recovers() {
        let mut p = RobustFrameParser::new();
        let mut c = Collect::default();
        p.feed(&[0x94, 0xC3, 0xFF, 0xFF], &mut c).unwrap();
        assert_eq!(c.errors, vec![FrameError::InvalidLength(0xFFFF)]);
        assert_eq!(p.consecutive_errors(), 1);
        p.feed(&[0x94, 0xC3, 0x00, 0x01, 0x55], &mut c).unwrap();
        assert_eq!(c.frames.len(), 1);
        let stats = p.stats();
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.frames_processed, 1);
        assert_eq!(stats.bytes_processed, 9);
        assert!(stats.last_frame_time.is_some());
        assert!(stats.last_error_time.is_some());
    }

    #[test]
    fn aborts_after_consecutive_error_cap() {
        let mut p = RobustFrameParser::with_limits(DEFAULT_MAX_BUFFER_SIZE, 3);
        let mut c = Collect::default();
        let bad = [0x94, 0xC3, 0x7F, 0xFF];
        p.feed(&bad, &mut c).unwrap();
        p.feed(&bad, &mut c).unwrap();
        let err = p.feed(&bad, &mut c).unwrap_err();
        assert!(matches!(err, MeshError::TooManyParseErrors(3)));
        assert!(err.is_link_failure());
    }

    #[test]
    fn small_buffer_budget_overflows() {
        let mut p = RobustFrameParser::with_limits(16, 10);
        let mut c = Collect::default();
        let mut data = vec![0x94, 0xC3, 0x00, 0x40];
        data.extend(std::iter::repeat(0xAA).take(20));
        p.feed(&data, &mut c).unwrap();
        assert!(c.frames.is_empty());
        assert!(matches!(c.errors[0], FrameError::BufferOverflow(17)));
        assert_eq!(p.state(), ParserState::WaitStart1);
    }

    #[test]
    fn builder_counts_errors() {
        let mut b = RobustFrameBuilder::new();
        b.build_frame(b"abc").unwrap();
        assert!(b.build_frame(&[0u8; 600]).is_err());
        let s = b.stats();
        assert_eq!(s.frames_built, 1);
        assert_eq!(s.bytes_built, 7);
        assert_eq!(s.build_errors, 1);
    }
}
