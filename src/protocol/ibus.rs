//! # IBUS Decoder
//!
//! FlySky IBUS servo frames: `0x20 0x40 | 14 × u16le channels | checksum`,
//! fixed 32 bytes at 115 200 baud.
//!
//! Both header bytes must match before payload capture begins. The trailing
//! checksum is the 16-bit running subtraction from 0xFFFF over every
//! preceding byte, stored little-endian. Channels are direct pulse values
//! (nominally 1000..2000), no bit packing and no range mapping.

use tracing::trace;

use crate::checksum::ibus_checksum;
use crate::io::ByteSource;

use super::{LinkDecoder, Protocol, IBUS_SPEC};

/// First IBUS header byte
pub const IBUS_HEADER1: u8 = 0x20;

/// Second IBUS header byte
pub const IBUS_HEADER2: u8 = 0x40;

const CHANNEL_COUNT: usize = 14;

/// Fixed total frame size: 2 headers + 14 × 2 data + 2 checksum
const IBUS_FRAME_LEN: usize = 2 + CHANNEL_COUNT * 2 + 2;

/// Offset of the first channel byte
const IBUS_DATA_INDEX: usize = 2;

/// Offset of the little-endian checksum field
const IBUS_CHECKSUM_INDEX: usize = IBUS_FRAME_LEN - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Scanning for the first header byte
    Idle,
    /// First header seen, expecting the second
    HaveSync,
    /// Accumulating payload and checksum
    Collecting,
}

/// Frame-assembly state machine for the IBUS protocol
pub struct IbusDecoder {
    source: Box<dyn ByteSource>,
    frame: [u8; IBUS_FRAME_LEN],
    state: FrameState,
    index: usize,
    frame_started_ms: u32,
    last_valid_ms: u32,
    input_lost: bool,
    channels: [u16; CHANNEL_COUNT],
}

impl IbusDecoder {
    /// Create a decoder reading from the given byte source
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            source,
            frame: [0; IBUS_FRAME_LEN],
            state: FrameState::Idle,
            index: 0,
            frame_started_ms: 0,
            last_valid_ms: 0,
            input_lost: true,
            channels: [0; CHANNEL_COUNT],
        }
    }

    fn step(&mut self, byte: u8, now_ms: u32) {
        match self.state {
            FrameState::Idle => {
                if byte == IBUS_HEADER1 {
                    self.frame[0] = byte;
                    self.index = 1;
                    self.frame_started_ms = now_ms;
                    self.state = FrameState::HaveSync;
                }
            }
            FrameState::HaveSync => {
                if byte == IBUS_HEADER2 {
                    self.frame[1] = byte;
                    self.index = 2;
                    self.state = FrameState::Collecting;
                } else if byte == IBUS_HEADER1 {
                    // Two sequential 0x20s: keep waiting for the second header
                    self.frame_started_ms = now_ms;
                } else {
                    self.state = FrameState::Idle;
                }
            }
            FrameState::Collecting => {
                self.frame[self.index] = byte;
                self.index += 1;
                if self.index >= IBUS_FRAME_LEN {
                    self.finish(now_ms);
                    self.state = FrameState::Idle;
                }
            }
        }
    }

    fn finish(&mut self, now_ms: u32) {
        let received = u16::from_le_bytes([
            self.frame[IBUS_CHECKSUM_INDEX],
            self.frame[IBUS_CHECKSUM_INDEX + 1],
        ]);
        let expected = ibus_checksum(&self.frame[..IBUS_CHECKSUM_INDEX]);
        if received != expected {
            trace!(
                "IBUS checksum mismatch: expected {:#06X}, got {:#06X}",
                expected,
                received
            );
            return;
        }

        for (i, slot) in self.channels.iter_mut().enumerate() {
            let lo = self.frame[IBUS_DATA_INDEX + i * 2];
            let hi = self.frame[IBUS_DATA_INDEX + i * 2 + 1];
            *slot = IBUS_SPEC.cal.normalize(u16::from_le_bytes([lo, hi]));
        }

        self.input_lost = false;
        self.last_valid_ms = now_ms;
    }
}

impl LinkDecoder for IbusDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Ibus
    }

    fn update(&mut self, now_ms: u32) {
        if self.state != FrameState::Idle
            && now_ms.wrapping_sub(self.frame_started_ms) > IBUS_SPEC.frame_timeout_ms
        {
            self.state = FrameState::Idle;
        }

        let mut chunk = [0u8; IBUS_FRAME_LEN];
        while self.source.available() > 0 {
            let n = self.source.read(&mut chunk);
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                self.step(byte, now_ms);
            }
        }

        if !self.input_lost
            && now_ms.wrapping_sub(self.last_valid_ms) >= IBUS_SPEC.link_timeout_ms
        {
            self.input_lost = true;
            self.channels = [0; CHANNEL_COUNT];
        }
    }

    fn channels(&self) -> &[u16] {
        &self.channels
    }

    fn input_lost(&self) -> bool {
        self.input_lost
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a complete IBUS frame from 14 channel pulse values
    pub fn ibus_frame(values: &[u16; 14]) -> [u8; IBUS_FRAME_LEN] {
        let mut frame = [0u8; IBUS_FRAME_LEN];
        frame[0] = IBUS_HEADER1;
        frame[1] = IBUS_HEADER2;
        for (i, &value) in values.iter().enumerate() {
            let bytes = value.to_le_bytes();
            frame[IBUS_DATA_INDEX + i * 2] = bytes[0];
            frame[IBUS_DATA_INDEX + i * 2 + 1] = bytes[1];
        }
        let checksum = ibus_checksum(&frame[..IBUS_CHECKSUM_INDEX]);
        frame[IBUS_CHECKSUM_INDEX..].copy_from_slice(&checksum.to_le_bytes());
        frame
    }
}
