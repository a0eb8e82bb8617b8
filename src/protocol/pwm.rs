//! # PWM Decoder
//!
//! One servo-style PWM signal per channel, each an independent physical
//! input: channels fail and recover individually, unlike the single-stream
//! protocols.
//!
//! [`PwmCapture`] is the interrupt-side half: the hardware collaborator
//! calls [`PwmCapture::on_edge`] for both edges of every channel pin. The
//! high time is measured on the falling edge and accepted only when the
//! pulse and the signal period are plausible. A faulted channel must
//! deliver several consecutive pulses (time-in) before its fault clears,
//! so a glitch cannot fake a healthy input.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::{LinkDecoder, Protocol, PWM_SPEC};

/// Maximum independent PWM input channels
pub const PWM_MAX_CHANNELS: usize = 4;

/// Plausible signal period bounds, µs (40–100 Hz servo refresh)
const PWM_PERIOD_MIN_US: u32 = 10_000;
const PWM_PERIOD_MAX_US: u32 = 25_000;

/// Maximum signal period in ms, the time-in retry window
const PWM_PERIOD_MAX_MS: u32 = 25;

/// Consecutive pulses required to clear a channel fault
const PWM_TIMEIN_CYCLES: u8 = 3;

/// Edge-capture state shared between interrupt context and the decoder
///
/// Each channel's slot is written only by that channel's edge handler and
/// consumed (swap to 0) only by the decoder poll; word-sized atomics with
/// Relaxed ordering are all the synchronization this needs.
pub struct PwmCapture {
    channel_count: usize,
    slots: [AtomicU32; PWM_MAX_CHANNELS],
    level: [AtomicBool; PWM_MAX_CHANNELS],
    rise_us: [AtomicU32; PWM_MAX_CHANNELS],
    fall_us: [AtomicU32; PWM_MAX_CHANNELS],
}

impl PwmCapture {
    /// Create a capture for `channel_count` input pins (clamped to 4)
    pub fn new(channel_count: usize) -> Arc<Self> {
        Arc::new(Self {
            channel_count: channel_count.clamp(1, PWM_MAX_CHANNELS),
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
            level: std::array::from_fn(|_| AtomicBool::new(false)),
            rise_us: std::array::from_fn(|_| AtomicU32::new(0)),
            fall_us: std::array::from_fn(|_| AtomicU32::new(0)),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Record a pin edge; call from the GPIO edge handler
    ///
    /// # Arguments
    ///
    /// * `channel` - Input pin index
    /// * `high` - Pin level after the edge
    /// * `now_us` - Capture-timer timestamp
    pub fn on_edge(&self, channel: usize, high: bool, now_us: u32) {
        if channel >= self.channel_count {
            return;
        }

        // Ignore noise that flips back faster than the handler is serviced
        let prev = self.level[channel].swap(high, Ordering::Relaxed);
        if prev == high {
            return;
        }

        if high {
            self.rise_us[channel].store(now_us, Ordering::Relaxed);
        } else {
            let period = now_us.wrapping_sub(self.fall_us[channel].load(Ordering::Relaxed));
            let pulse = now_us.wrapping_sub(self.rise_us[channel].load(Ordering::Relaxed));

            let pulse_min = (PWM_SPEC.cal.min - PWM_SPEC.cal.threshold) as u32;
            let pulse_max = (PWM_SPEC.cal.max + PWM_SPEC.cal.threshold) as u32;
            if (pulse_min..=pulse_max).contains(&pulse)
                && (PWM_PERIOD_MIN_US..=PWM_PERIOD_MAX_US).contains(&period)
            {
                self.slots[channel].store(pulse, Ordering::Relaxed);
            }

            self.fall_us[channel].store(now_us, Ordering::Relaxed);
        }
    }

    /// Consume the latest accepted pulse width, 0 when none arrived
    fn take_pulse(&self, channel: usize) -> u32 {
        self.slots[channel].swap(0, Ordering::Relaxed)
    }
}

/// Per-channel validity/timeout state machine for PWM inputs
pub struct PwmDecoder {
    capture: Arc<PwmCapture>,
    channels: [u16; PWM_MAX_CHANNELS],
    fault: [bool; PWM_MAX_CHANNELS],
    time_in: [u8; PWM_MAX_CHANNELS],
    tick_ms: [u32; PWM_MAX_CHANNELS],
}

impl PwmDecoder {
    /// Create a decoder reading the given edge capture
    pub fn new(capture: Arc<PwmCapture>) -> Self {
        Self {
            capture,
            channels: [0; PWM_MAX_CHANNELS],
            fault: [true; PWM_MAX_CHANNELS],
            time_in: [0; PWM_MAX_CHANNELS],
            tick_ms: [0; PWM_MAX_CHANNELS],
        }
    }

    fn count(&self) -> usize {
        self.capture.channel_count()
    }
}

impl LinkDecoder for PwmDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Pwm
    }

    fn update(&mut self, now_ms: u32) {
        for ch in 0..self.count() {
            let pulse = self.capture.take_pulse(ch) as u16;

            if self.fault[ch] {
                if pulse != 0 {
                    self.time_in[ch] += 1;
                    self.tick_ms[ch] = now_ms;
                    if self.time_in[ch] >= PWM_TIMEIN_CYCLES {
                        // Timed in: this pulse already counts as data
                        self.fault[ch] = false;
                        self.channels[ch] = PWM_SPEC.cal.normalize(pulse);
                    }
                } else if self.time_in[ch] > 0
                    && now_ms.wrapping_sub(self.tick_ms[ch]) >= PWM_PERIOD_MAX_MS
                {
                    // The pulses stopped again before timing in
                    self.time_in[ch] = 0;
                    self.tick_ms[ch] = now_ms;
                }
            } else if pulse != 0 {
                self.channels[ch] = PWM_SPEC.cal.normalize(pulse);
                self.tick_ms[ch] = now_ms;
            } else if now_ms.wrapping_sub(self.tick_ms[ch]) >= PWM_SPEC.link_timeout_ms {
                self.fault[ch] = true;
                self.channels[ch] = 0;
                self.time_in[ch] = 0;
                self.tick_ms[ch] = now_ms;
            }
        }
    }

    fn channels(&self) -> &[u16] {
        &self.channels[..self.count()]
    }

    fn input_lost(&self) -> bool {
        self.all_fault()
    }

    fn channel_fault(&self, channel: usize) -> bool {
        self.fault.get(channel).copied().unwrap_or(true)
    }

    fn all_fault(&self) -> bool {
        self.fault[..self.count()].iter().all(|&f| f)
    }

    fn any_fault(&self) -> bool {
        self.fault[..self.count()].iter().any(|&f| f)
    }
}
