//! Link counters.
//!
//! Each connection owns one [`LinkCounters`]; the hot paths bump relaxed atomics and
//! `snapshot()` copies them out for status reporting.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct LinkCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    decode_errors: AtomicU64,
    messages_received: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
}

impl LinkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub fn add_bytes_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }
    pub fn inc_frames_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_frames_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_read_errors(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_write_errors(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connected(&self, at: Option<DateTime<Utc>>) {
        *self
            .connected_since
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = at;
    }

    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connected_since: *self
                .connected_since
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub decode_errors: u64,
    pub messages_received: u64,
    pub connected_since: Option<DateTime<Utc>>,
}
