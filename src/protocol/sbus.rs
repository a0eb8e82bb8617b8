//! # SBUS Decoder
//!
//! Futaba SBUS frames: `sync (0x0F) | 22 data bytes | flags | footer (0x00)`,
//! fixed 25 bytes, inverted UART at 100k (fast variant 200k) baud.
//!
//! The 22 data bytes carry 16 packed 11-bit channels in the same bit layout
//! CRSF uses. The flags byte carries two digital channels, a frame-lost
//! indicator and the transmitter-side failsafe bit; failsafe forces
//! `input_lost` immediately, without waiting for the link watchdog.

use tracing::trace;

use crate::channels::unpack_channels;
use crate::io::ByteSource;

use super::{LinkDecoder, Protocol, SBUS_SPEC};

/// SBUS frame sync byte
pub const SBUS_SYNC_BYTE: u8 = 0x0F;

/// SBUS frame footer byte
pub const SBUS_FOOTER_BYTE: u8 = 0x00;

/// Fixed total frame size
const SBUS_FRAME_LEN: usize = 25;

/// Offset of the packed channel data
const SBUS_DATA_INDEX: usize = 1;

/// Offset of the flags byte
const SBUS_FLAGS_INDEX: usize = 23;

/// Offset of the footer byte
const SBUS_FOOTER_INDEX: usize = 24;

const SBUS_CH17_MASK: u8 = 0x01;
const SBUS_CH18_MASK: u8 = 0x02;
const SBUS_LOSTFRAME_MASK: u8 = 0x04;
const SBUS_FAILSAFE_MASK: u8 = 0x08;

const CHANNEL_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Collecting,
}

/// Frame-assembly state machine for the SBUS protocol
pub struct SbusDecoder {
    source: Box<dyn ByteSource>,
    frame: [u8; SBUS_FRAME_LEN],
    state: FrameState,
    index: usize,
    frame_started_ms: u32,
    last_valid_ms: u32,
    input_lost: bool,
    failsafe: bool,
    frame_lost: bool,
    ch17: bool,
    ch18: bool,
    channels: [u16; CHANNEL_COUNT],
}

impl SbusDecoder {
    /// Create a decoder reading from the given byte source
    pub fn new(source: Box<dyn ByteSource>) -> Self {
        Self {
            source,
            frame: [0; SBUS_FRAME_LEN],
            state: FrameState::Idle,
            index: 0,
            frame_started_ms: 0,
            last_valid_ms: 0,
            input_lost: true,
            failsafe: false,
            frame_lost: false,
            ch17: false,
            ch18: false,
            channels: [0; CHANNEL_COUNT],
        }
    }

    /// Transmitter-declared failsafe state from the last frame
    pub fn failsafe(&self) -> bool {
        self.failsafe
    }

    /// Receiver-side dropped-frame indicator from the last frame
    pub fn frame_lost(&self) -> bool {
        self.frame_lost
    }

    /// Digital channels 17 and 18
    pub fn digital_channels(&self) -> (bool, bool) {
        (self.ch17, self.ch18)
    }

    fn step(&mut self, byte: u8, now_ms: u32) {
        match self.state {
            FrameState::Idle => {
                if byte == SBUS_SYNC_BYTE {
                    self.frame[0] = byte;
                    self.index = 1;
                    self.frame_started_ms = now_ms;
                    self.state = FrameState::Collecting;
                }
            }
            FrameState::Collecting => {
                self.frame[self.index] = byte;
                self.index += 1;
                if self.index >= SBUS_FRAME_LEN {
                    self.finish(now_ms);
                    self.state = FrameState::Idle;
                }
            }
        }
    }

    fn finish(&mut self, now_ms: u32) {
        if self.frame[SBUS_FOOTER_INDEX] != SBUS_FOOTER_BYTE {
            trace!(
                "SBUS footer mismatch: got {:#04X}",
                self.frame[SBUS_FOOTER_INDEX]
            );
            return;
        }

        let mut raw = [0u16; CHANNEL_COUNT];
        unpack_channels(&self.frame, SBUS_DATA_INDEX, &mut raw);
        for (slot, &r) in self.channels.iter_mut().zip(raw.iter()) {
            *slot = SBUS_SPEC.cal.normalize(r);
        }

        let flags = self.frame[SBUS_FLAGS_INDEX];
        self.ch17 = flags & SBUS_CH17_MASK != 0;
        self.ch18 = flags & SBUS_CH18_MASK != 0;
        self.frame_lost = flags & SBUS_LOSTFRAME_MASK != 0;
        self.failsafe = flags & SBUS_FAILSAFE_MASK != 0;

        self.input_lost = false;
        self.last_valid_ms = now_ms;
    }
}

impl LinkDecoder for SbusDecoder {
    fn protocol(&self) -> Protocol {
        Protocol::Sbus
    }

    fn update(&mut self, now_ms: u32) {
        if self.state != FrameState::Idle
            && now_ms.wrapping_sub(self.frame_started_ms) > SBUS_SPEC.frame_timeout_ms
        {
            self.state = FrameState::Idle;
        }

        let mut chunk = [0u8; SBUS_FRAME_LEN];
        while self.source.available() > 0 {
            let n = self.source.read(&mut chunk);
            if n == 0 {
                break;
            }
            for &byte in &chunk[..n] {
                self.step(byte, now_ms);
            }
        }

        if self.failsafe {
            // Explicit transmitter failsafe beats any timing argument
            self.input_lost = true;
            self.channels = [0; CHANNEL_COUNT];
        } else if !self.input_lost
            && now_ms.wrapping_sub(self.last_valid_ms) >= SBUS_SPEC.link_timeout_ms
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

    /// Build a complete SBUS frame from 16 raw 11-bit values and flag bits
    pub fn sbus_frame(raw: &[u16; 16], flags: u8) -> [u8; SBUS_FRAME_LEN] {
        let mut frame = [0u8; SBUS_FRAME_LEN];
        frame[0] = SBUS_SYNC_BYTE;

        let mut bit_index = SBUS_DATA_INDEX * 8;
        for &value in raw {
            for bit in 0..CHANNEL_BITS {
                if (value >> bit) & 1 == 1 {
                    frame[bit_index / 8] |= 1 << (bit_index % 8);
                }
                bit_index += 1;
            }
        }

        frame[SBUS_FLAGS_INDEX] = flags;
        frame[SBUS_FOOTER_INDEX] = SBUS_FOOTER_BYTE;
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::io::SharedRxBuffer;

    fn decoder_with_buffer() -> (SbusDecoder, SharedRxBuffer) {
        let buffer = SharedRxBuffer::new();
        (SbusDecoder::new(Box::new(buffer.clone())), buffer)
    }

    #[test]
    fn test_decodes_center_frame_to_1500() {
        let (mut decoder, buffer) = decoder_with_buffer();
        buffer.push(&sbus_frame(&[992; 16], 0));

        decoder.update(0);

        assert!(!decoder.input_lost());
        assert_eq!(decoder.channels(), &[1500u16; 16]);
    }

    #[test]
    fn test_bad_footer_discards_frame() {
        let (mut decoder, buffer) = decoder_with_buffer();
        let mut frame = sbus_frame(&[992; 16], 0);
        frame[SBUS_FOOTER_INDEX] = 0xFF;
        buffer.push(&frame);

        decoder.update(0);

        assert!(decoder.input_lost());
        assert!(decoder.channels().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_failsafe_bit_forces_input_lost() {
        let (mut decoder, buffer) = decoder_with_buffer();
        buffer.push(&sbus_frame(&[992; 16], SBUS_FAILSAFE_MASK));

        decoder.update(0);

        // Frame itself was valid, but the failsafe flag wins immediately
        assert!(decoder.input_lost());
        assert!(decoder.failsafe());
        assert!(decoder.channels().iter().all(|&c| c == 0));
    }

    #[test]
    fn test_failsafe_clears_on_clean_frame() {
        let (mut decoder, buffer) = decoder_with_buffer();
        buffer.push(&sbus_frame(&[992; 16], SBUS_FAILSAFE_MASK));
        decoder.update(0);
        assert!(decoder.input_lost());

        buffer.push(&sbus_frame(&[992; 16], 0));
        decoder.update(1);

        assert!(!decoder.input_lost());
        assert_eq!(decoder.channels(), &[1500u16; 16]);
    }

    #[test]
    fn test_flag_bits_exposed() {
        let (mut decoder, buffer) = decoder_with_buffer();
        buffer.push(&sbus_frame(
            &[992; 16],
            SBUS_CH17_MASK | SBUS_LOSTFRAME_MASK,
        ));

        decoder.update(0);

        assert_eq!(decoder.digital_channels(), (true, false));
        assert!(decoder.frame_lost());
        assert!(!decoder.failsafe());
        assert!(!decoder.input_lost());
    }

    #[test]
    fn test_resynchronizes_after_stray_bytes() {
        let (mut decoder, buffer) = decoder_with_buffer();

        buffer.push(&[0x55, 0xAA]);
        buffer.push(&sbus_frame(&[992; 16], 0));
        buffer.push(&[0x13]);
        buffer.push(&sbus_frame(&[172; 16], 0));

        decoder.update(0);

        assert!(!decoder.input_lost());
        assert_eq!(decoder.channels(), &[1000u16; 16]);
    }

    #[test]
    fn test_mid_frame_timeout_recovers() {
        let (mut decoder, buffer) = decoder_with_buffer();

        let frame = sbus_frame(&[992; 16], 0);
        buffer.push(&frame[..12]);
        decoder.update(0);
        assert!(decoder.input_lost());

        decoder.update(SBUS_SPEC.frame_timeout_ms + 1);

        buffer.push(&sbus_frame(&[992; 16], 0));
        decoder.update(SBUS_SPEC.frame_timeout_ms + 2);

        assert!(!decoder.input_lost());
        assert_eq!(decoder.channels(), &[1500u16; 16]);
    }

    #[test]
    fn test_link_timeout_boundary() {
        let (mut decoder, buffer) = decoder_with_buffer();
        buffer.push(&sbus_frame(&[992; 16], 0));
        decoder.update(50);
        assert!(!decoder.input_lost());

        decoder.update(50 + SBUS_SPEC.link_timeout_ms - 1);
        assert!(!decoder.input_lost());

        decoder.update(50 + SBUS_SPEC.link_timeout_ms);
        assert!(decoder.input_lost());
        assert!(decoder.channels().iter().all(|&c| c == 0));

        buffer.push(&sbus_frame(&[992; 16], 0));
        decoder.update(50 + SBUS_SPEC.link_timeout_ms + 1);
        assert!(!decoder.input_lost());
    }
}
