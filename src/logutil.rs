//! Logging helpers for serial traffic.
//!
//! The radio interleaves plain-text firmware logging with binary frames on the same
//! stream. Bytes that are not part of a frame are assembled into lines here before being
//! handed to a log callback, and both kinds of traffic get sanitised before they reach
//! the `log` macros so a single record stays on a single line.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over `max_preview`) with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Compact lowercase hex of at most `max` bytes, with `...` when truncated.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out: String = data
        .iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if data.len() > max {
        out.push_str("...");
    }
    out
}

/// Multi-line `offset: hex |ascii|` dump, 16 bytes per row.
pub fn hex_dump(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut rows = Vec::new();
    for (i, chunk) in shown.chunks(16).enumerate() {
        let hex = chunk
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii: String = chunk
            .iter()
            .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
            .collect();
        rows.push(format!("{:04x}: {:<48} |{}|", i * 16, hex, ascii));
    }
    let mut out = rows.join("\n");
    if data.len() > max {
        out.push_str(&format!("\n... ({} more bytes)", data.len() - max));
    }
    out
}

/// Longest device log line we buffer before flushing it as-is.
pub const MAX_LOG_LINE: usize = 1024;

/// Collects firmware debug bytes into lines terminated by `\n` or `\r`.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one byte; returns a completed line (without terminator) when one ends.
    /// Empty lines, such as the second half of `\r\n`, are swallowed.
    pub fn push(&mut self, b: u8) -> Option<String> {
        if b == b'\n' || b == b'\r' {
            return self.take();
        }
        self.buf.push(b);
        if self.buf.len() >= MAX_LOG_LINE {
            return self.take();
        }
        None
    }

    /// Flush whatever is buffered, e.g. when the link goes away mid-line.
    pub fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}
