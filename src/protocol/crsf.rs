//! # CRSF Decoder
//!
//! Crossfire receiver frames: `sync (0xC8) | length | type | payload | crc`.
//!
//! Length counts type + payload + crc, so the full frame is `length + 2`
//! bytes, at most 64. The CRC is CRC8-DVB-S2 over type + payload. Many
//! frame types share the link; only RC Channels Packed (0x16) feeds the
//! channel vector, every other valid frame just refreshes the link
//! watchdog.

use tracing::trace;

use crate::channels::unpack_channels;
use crate::checksum::crc8_dvb_s2;
use crate::io::ByteSource;

use super::{LinkDecoder, Protocol, CRSF_SPEC};

/// CRSF frame sync byte (always 0xC8)
pub const CRSF_SYNC_BYTE: u8 = 0xC8;

/// RC Channels Packed frame type
pub const CRSF_FRAMETYPE_RC_CHANNELS_PACKED: u8 = 0x16;

/// Maximum total frame size
const CRSF_MAX_FRAME_LEN: usize = 64;

/// Valid range of the length byte (type + payload + crc)
const CRSF_LEN_MIN: u8 = 3;
const CRSF_LEN_MAX: u8 = (CRSF_MAX_FRAME_LEN - 2) as u8;

/// Total size of an RC channels frame: sync + length + type + 22 + crc
const CRSF_RC_FRAME_LEN: usize = 26;

/// Payload offset of the packed channel data within the frame buffer
const CRSF_RC_DATA_INDEX: usize = 3;

const CHANNEL_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Scanning for the sync byte
    Idle,
    /// Sync seen, waiting for the length byte
    HaveSync,
    /// Accumulating the declared number of bytes
    Collecting,
}

/// Frame-assembly state machine for the CRSF protocol
pub struct CrsfDecoder {
    source: Box<dyn ByteSource>,
    frame: [u8; CRSF_MAX_FRAME_LEN],
    state: FrameState,
    index: usize,
    expected: usize,
    frame_started_ms: u32,
    last_valid_ms: u32,
    input_lost: bool,
    channels: [u16; CHANNEL_COUNT],
}

impl CrsfDecoder {
    /// Create a decoder reading from the given byte source
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            source,
            frame: [0; CRSF_MAX_FRAME_LEN],
            state: FrameState::Idle,
            index: 0,
            expected: 0,
            frame_started_ms: 0,
            last_valid_ms: 0,
            input_lost: true,
            channels: [0; CHANNEL_COUNT],
        }
    }

    fn step(&mut self, byte: u8, now_ms: u32) {
        match self.state {
            FrameState::Idle => {
                if byte == CRSF_SYNC_BYTE {
                    self.frame[0] = byte;
                    self.index = 1;
                    self.frame_started_ms = now_ms;
                    self.state = FrameState::HaveSync;
                }
            }
            FrameState::HaveSync => {
                if (CRSF_LEN_MIN..=CRSF_LEN_MAX).contains(&byte) {
                    self.frame[1] = byte;
                    self.index = 2;
                    self.expected = byte as usize + 2;
                    self.state = FrameState::Collecting;
                } else {
                    // Out-of-range length: drop the frame, rescan
                    self.state = FrameState::Idle;
                }
            }
            FrameState::Collecting => {
                self.frame[self.index] = byte;
                self.index += 1;
                if self.index >= self.expected {
                    self.finish(now_ms);
                    self.state = FrameState::Idle;
                }
            }
        }
    }

    fn finish(&mut self, now_ms: u32) {
        let crc_index = self.expected - 1;
        let crc = crc8_dvb_s2(&self.frame[2..crc_index]);
        if crc != self.frame[crc_index] {
            trace!(
                "CRSF checksum mismatch: expected {:#04X}, got {:#04X}",
                crc,
                self.frame[crc_index]
            );
            return;
        }

        if self.frame[2] == CRSF_FRAMETYPE_RC_CHANNELS_PACKED
            && self.expected == CRSF_RC_FRAME_LEN
        {
            let mut raw = [0u16; CHANNEL_COUNT];
            unpack_channels(&self.frame, CRSF_RC_DATA_INDEX, &mut raw);
            for (slot, &r) in self.channels.iter_mut().zip(raw.iter()) {
                *slot = CRSF_SPEC.cal.normalize(r);
            }
        }
        // Any valid frame proves the link is alive, channels or not

        self.input_lost = false;
        self.last_valid_ms = now_ms;
    }
}

impl LinkDecoder for CrsfDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Crsf
    }

    fn update(&mut self, now_ms: u32) {
        // Mid-frame watchdog: a stalled frame must not wedge resync
        if self.state != FrameState::Idle
            && now_ms.wrapping_sub(self.frame_started_ms) > CRSF_SPEC.frame_timeout_ms
        {
            self.state = FrameState::Idle;
        }

        let mut chunk = [0u8; CRSF_MAX_FRAME_LEN];
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
            && now_ms.wrapping_sub(self.last_valid_ms) >= CRSF_SPEC.link_timeout_ms
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
    use crate::channels::CHANNEL_BITS;

    /// Build a complete RC channels frame from 16 raw 11-bit values
    pub fn rc_channels_frame(raw: &[u16; 16]) -> Vec<u8> {
        let mut payload = [0u8; 22];
        let mut bit_index = 0;
        for &value in raw {
            for bit in 0..CHANNEL_BITS {
                if (value >> bit) & 1 == 1 {
                    payload[bit_index / 8] |= 1 << (bit_index % 8);
                }
                bit_index += 1;
            }
        }

        let mut frame = vec![CRSF_SYNC_BYTE, 24, CRSF_FRAMETYPE_RC_CHANNELS_PACKED];
        frame.extend_from_slice(&payload);
        let crc = crc8_dvb_s2(&frame[2..]);
        frame.push(crc);
        frame
    }

    /// Build a valid non-channels frame (link statistics style)
    pub fn other_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![CRSF_SYNC_BYTE, (payload.len() + 2) as u8, frame_type];
        frame.extend_from_slice(payload);
        let crc = crc8_dvb_s2(&frame[2..]);
        frame.push(crc);
        frame
    }
}
