//! Response body buffer with high/low watermark signalling.
//!
//! Crossing above the high watermark reports [`Watermark::High`] once; draining down to the low
//! watermark (half of high) afterwards reports [`Watermark::Low`] once. The caller turns these
//! into back-pressure on the engine.

use bytes::{Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    High,
    Low,
}

pub struct WatermarkBuffer {
    data: BytesMut,
    high: usize,
    low: usize,
    above_high: bool,
}

impl WatermarkBuffer {
    /// `high == 0` disables signalling.
    pub fn new(high: usize) -> Self {
        Self {
            data: BytesMut::new(),
            high,
            low: high / 2,
            above_high: false,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes at the tail.
    pub fn push(&mut self, bytes: &[u8]) -> Option<Watermark> {
        self.data.extend_from_slice(bytes);
        if self.high > 0 && !self.above_high && self.data.len() > self.high {
            self.above_high = true;
            return Some(Watermark::High);
        }
        None
    }

    /// Release up to `max` bytes from the head. Released bytes are never seen again.
    pub fn take(&mut self, max: usize) -> (Bytes, Option<Watermark>) {
        let n = max.min(self.data.len());
        let out = self.data.split_to(n).freeze();
        (out, self.check_low())
    }

    /// Drop buffered bytes without signalling; used once the stream is finished.
    pub fn clear(&mut self) {
        self.data.clear();
        self.above_high = false;
    }

    fn check_low(&mut self) -> Option<Watermark> {
        if self.above_high && self.data.len() <= self.low {
            self.above_high = false;
            return Some(Watermark::Low);
        }
        None
    }
}
