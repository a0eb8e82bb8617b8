//! # PPM Decoder
//!
//! Pulse-position modulation: all channels share one pulse train, each
//! channel encoded as the spacing between consecutive rising edges, with a
//! long end-of-frame gap (> 4 ms) marking the start of the next train.
//!
//! [`PpmCapture`] is the interrupt-side half: the hardware collaborator
//! calls [`PpmCapture::on_rising_edge`] with a microsecond timestamp for
//! every rising edge. Each slot is a single-writer/single-reader atomic
//! cell, so no locking is needed against the polled decoder.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{LinkDecoder, Protocol, PPM_SPEC};

/// Maximum channels a PPM train can carry here
pub const PPM_MAX_CHANNELS: usize = 8;

/// Rising-edge gap that marks the end of a train, in µs
const PPM_EOF_GAP_US: u32 = 4000;

/// Edge-capture state shared between interrupt context and the decoder
///
/// Single writer (the edge callback), single reader (the decoder poll);
/// every field is an independent word-sized atomic, so Relaxed ordering is
/// sufficient and values cannot tear.
pub struct PpmCapture {
    channel_count: usize,
    slots: [AtomicU16; PPM_MAX_CHANNELS],
    last_edge_us: AtomicU32,
    next_channel: AtomicUsize,
    synced: AtomicBool,
    heartbeat: AtomicBool,
}

impl PpmCapture {
    /// Create a capture for `channel_count` channels (clamped to 8)
    pub fn new(channel_count: usize) -> Arc<Self> {
        Arc::new(Self {
            channel_count: channel_count.clamp(1, PPM_MAX_CHANNELS),
            slots: std::array::from_fn(|_| AtomicU16::new(0)),
            last_edge_us: AtomicU32::new(0),
            next_channel: AtomicUsize::new(0),
            synced: AtomicBool::new(false),
            heartbeat: AtomicBool::new(false),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Record a rising edge; call from the GPIO edge handler
    ///
    /// The spacing to the previous edge is the pulse value. A gap longer
    /// than the end-of-frame time resynchronizes to channel 0; an
    /// out-of-band spacing aborts the train until the next gap.
    pub fn on_rising_edge(&self, now_us: u32) {
        let last = self.last_edge_us.swap(now_us, Ordering::Relaxed);
        let pulse = now_us.wrapping_sub(last);

        if pulse > PPM_EOF_GAP_US {
            self.next_channel.store(0, Ordering::Relaxed);
            self.synced.store(true, Ordering::Relaxed);
            return;
        }

        if !self.synced.load(Ordering::Relaxed) {
            return;
        }

        let min = (PPM_SPEC.cal.min - PPM_SPEC.cal.threshold) as u32;
        let max = (PPM_SPEC.cal.max + PPM_SPEC.cal.threshold) as u32;
        if pulse < min || pulse > max {
            // Corrupted train: drop sync until the next end-of-frame gap
            self.synced.store(false, Ordering::Relaxed);
            return;
        }

        let channel = self.next_channel.load(Ordering::Relaxed);
        self.slots[channel].store(pulse as u16, Ordering::Relaxed);
        self.next_channel.store(channel + 1, Ordering::Relaxed);

        if channel + 1 >= self.channel_count {
            self.heartbeat.store(true, Ordering::Relaxed);
            self.synced.store(false, Ordering::Relaxed);
        }
    }

    /// Consume the complete-train flag (reader side)
    fn take_heartbeat(&self) -> bool {
        self.heartbeat.swap(false, Ordering::Relaxed)
    }

    fn slot(&self, channel: usize) -> u16 {
        self.slots[channel].load(Ordering::Relaxed)
    }

    fn reset_slots(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Validity/timeout state machine for the PPM pulse train
pub struct PpmDecoder {
    capture: Arc<PpmCapture>,
    channels: [u16; PPM_MAX_CHANNELS],
    last_valid_ms: u32,
    input_lost: bool,
}

impl PpmDecoder {
    /// Create a decoder reading the given edge capture
    pub fn new(capture: Arc<PpmCapture>) -> Self {
        Self {
            capture,
            channels: [0; PPM_MAX_CHANNELS],
            last_valid_ms: 0,
            input_lost: true,
        }
    }
}

impl LinkDecoder for PpmDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ppm
    }

    fn update(&mut self, now_ms: u32) {
        if self.capture.take_heartbeat() {
            for i in 0..self.capture.channel_count() {
                self.channels[i] = PPM_SPEC.cal.normalize(self.capture.slot(i));
            }
            self.input_lost = false;
            self.last_valid_ms = now_ms;
        }

        if !self.input_lost
            && now_ms.wrapping_sub(self.last_valid_ms) >= PPM_SPEC.link_timeout_ms
        {
            self.input_lost = true;
            self.channels = [0; PPM_MAX_CHANNELS];
            self.capture.reset_slots();
        }
    }

    fn channels(&self) -> &[u16] {
        &self.channels[..self.capture.channel_count()]
    }

    fn input_lost(&self) -> bool {
        self.input_lost
    }
}
