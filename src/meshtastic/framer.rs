//! Length-prefixed frame codec for the Meshtastic serial API.
//!
//! Binary messages on the serial link are emitted as:
//!
//!   `0x94 0xC3 <len_hi> <len_lo> <protobuf bytes>`
//!
//! where the big-endian length covers only the protobuf payload (0..=512 bytes).
//! The same stream also carries plain-text firmware logging, so every byte that is
//! not part of a recognised header is handed to the sink as a log byte instead of
//! being discarded.
use log::{trace, warn};

use super::error::{MeshError, Result};

pub const START1: u8 = 0x94;
pub const START2: u8 = 0xC3;
pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = 512;

/// One complete wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: [u8; HEADER_LEN],
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_len(&self) -> usize {
        ((self.header[2] as usize) << 8) | self.header[3] as usize
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn decode_from_radio(
        &self,
    ) -> std::result::Result<crate::protobuf::meshtastic_generated::FromRadio, prost::DecodeError>
    {
        crate::protobuf::decode_from_radio(&self.payload)
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn decode_to_radio(
        &self,
    ) -> std::result::Result<crate::protobuf::meshtastic_generated::ToRadio, prost::DecodeError>
    {
        crate::protobuf::decode_to_radio(&self.payload)
    }
}

/// Receiver of parser output.
pub trait FrameSink {
    fn on_frame(&mut self, frame: Frame);
    fn on_log_byte(&mut self, byte: u8);
    /// Recoverable parse problem. Only the hardened parser reports these.
    fn on_error(&mut self, _err: &FrameError) {}
}

/// Recoverable conditions reported to [`FrameSink::on_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    InvalidLength(usize),
    BufferOverflow(usize),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::InvalidLength(n) => write!(f, "invalid payload length {}", n),
            FrameError::BufferOverflow(n) => write!(f, "frame buffer overflow at {} bytes", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ParserState {
    WaitStart1,
    WaitStart2,
    WaitLength,
    WaitPayload,
}

/// What happened to the byte that was just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Frame,
    InvalidLength(usize),
}

/// Byte-at-a-time frame parser.
#[derive(Debug)]
pub struct FrameParser {
    state: ParserState,
    buf: Vec<u8>,
    expect_len: usize,
    bytes_processed: u64,
    frames_processed: u64,
    state_resets: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::WaitStart1,
            buf: Vec::with_capacity(HEADER_LEN + MAX_PAYLOAD_SIZE),
            expect_len: 0,
            bytes_processed: 0,
            frames_processed: 0,
            state_resets: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn state_resets(&self) -> u64 {
        self.state_resets
    }

    /// Bytes captured for the frame currently being assembled.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Process a chunk of stream bytes in order.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn FrameSink) {
        self.bytes_processed += data.len() as u64;
        for &b in data {
            self.step(b, sink);
        }
    }

    pub fn process_byte(&mut self, b: u8, sink: &mut dyn FrameSink) {
        self.bytes_processed += 1;
        self.step(b, sink);
    }

    pub(crate) fn step(&mut self, b: u8, sink: &mut dyn FrameSink) -> Step {
        match self.state {
            ParserState::WaitStart1 => {
                if b == START1 {
                    self.buf.clear();
                    self.buf.push(b);
                    self.state = ParserState::WaitStart2;
                } else {
                    sink.on_log_byte(b);
                }
            }
            ParserState::WaitStart2 => {
                if b == START2 {
                    self.buf.push(b);
                    self.state = ParserState::WaitLength;
                } else if b == START1 {
                    // The earlier marker was log text; this one may still open a frame.
                    sink.on_log_byte(START1);
                    self.buf.clear();
                    self.buf.push(b);
                } else {
                    self.reset();
                    sink.on_log_byte(START1);
                    sink.on_log_byte(b);
                }
            }
            ParserState::WaitLength => {
                self.buf.push(b);
                if self.buf.len() >= HEADER_LEN {
                    let len = ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
                    if len > MAX_PAYLOAD_SIZE {
                        warn!("Invalid payload length {}, resetting parser", len);
                        self.reset();
                        return Step::InvalidLength(len);
                    }
                    self.expect_len = len;
                    if len == 0 {
                        self.complete(sink);
                        return Step::Frame;
                    }
                    self.state = ParserState::WaitPayload;
                }
            }
            ParserState::WaitPayload => {
                self.buf.push(b);
                if self.buf.len() >= HEADER_LEN + self.expect_len {
                    self.complete(sink);
                    return Step::Frame;
                }
            }
        }
        Step::Continue
    }

    fn complete(&mut self, sink: &mut dyn FrameSink) {
        self.frames_processed += 1;
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let payload = self.buf[HEADER_LEN..HEADER_LEN + self.expect_len].to_vec();
        trace!("Frame complete: {} byte payload", payload.len());
        self.reset();
        sink.on_frame(Frame { header, payload });
    }

    pub(crate) fn reset(&mut self) {
        self.state_resets += 1;
        self.state = ParserState::WaitStart1;
        self.buf.clear();
        self.expect_len = 0;
    }
}

/// Builds wire frames for outbound payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameBuilder;

impl FrameBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Prepend the 4-byte header. Fails without producing any bytes when the payload
    /// is larger than [`MAX_PAYLOAD_SIZE`].
    pub fn build_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MeshError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(START1);
        out.push(START2);
        out.push(((payload.len() >> 8) & 0xFF) as u8);
        out.push((payload.len() & 0xFF) as u8);
        out.extend_from_slice(payload);
        Ok(out)
    }

    #[cfg(feature = "meshtastic-proto")]
    pub fn build_to_radio(
        &self,
        msg: &crate::protobuf::meshtastic_generated::ToRadio,
    ) -> Result<Vec<u8>> {
        self.build_frame(&crate::protobuf::encode_to_radio(msg))
    }
}
