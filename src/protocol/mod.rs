//! # Protocol Layer
//!
//! One decoder per supported receiver protocol plus the descriptor table
//! and the dispatch seam the radio layer drives them through.
//!
//! Byte protocols (CRSF, SBUS, IBUS) assemble frames from a polled
//! [`crate::io::ByteSource`]; pulse protocols (PPM, PWM) consume edge
//! captures written from interrupt context. All five produce the same
//! thing: a normalized channel vector and a link-alive verdict.

pub mod crsf;
pub mod ibus;
pub mod ppm;
pub mod pwm;
pub mod sbus;

use serde::Deserialize;

use crate::channels::{Calibration, RangeMap, CHANNEL_OUT_MAX, CHANNEL_OUT_MIN};
use crate::io::SerialSettings;

pub use crsf::CrsfDecoder;
pub use ibus::IbusDecoder;
pub use ppm::{PpmCapture, PpmDecoder};
pub use pwm::{PwmCapture, PwmDecoder};
pub use sbus::SbusDecoder;

/// Widest channel vector any protocol produces
pub const MAX_CHANNELS: usize = 16;

/// Supported receiver link protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Crsf,
    Sbus,
    Ibus,
    Ppm,
    Pwm,
}

impl Protocol {
    /// Fixed auto-detection trial order
    pub const TRIAL_ORDER: [Protocol; 5] = [
        Protocol::Ppm,
        Protocol::Sbus,
        Protocol::Ibus,
        Protocol::Pwm,
        Protocol::Crsf,
    ];

    /// Static descriptor for this protocol
    pub fn spec(&self) -> &'static ProtocolSpec {
        match self {
            Protocol::Crsf => &CRSF_SPEC,
            Protocol::Sbus => &SBUS_SPEC,
            Protocol::Ibus => &IBUS_SPEC,
            Protocol::Ppm => &PPM_SPEC,
            Protocol::Pwm => &PWM_SPEC,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.spec().name)
    }
}

/// Static per-protocol descriptor
///
/// Calibration constants, watchdog periods and serial parameters for one
/// protocol. One immutable instance exists per protocol; the dispatcher
/// reads whichever belongs to the active selection.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolSpec {
    pub name: &'static str,
    /// Frame sync byte sequence (empty for pulse protocols)
    pub sync: &'static [u8],
    /// Nominal channel count (pulse protocols may be configured lower)
    pub channel_count: usize,
    pub cal: Calibration,
    /// Mid-frame watchdog: max ms between sync and frame completion
    pub frame_timeout_ms: u32,
    /// Link watchdog: max ms between valid frames before `input_lost`
    pub link_timeout_ms: u32,
    /// Auto-detection trial window in ms
    pub detect_window_ms: u32,
    /// UART parameters, `None` for pulse protocols
    pub serial: Option<SerialSettings>,
    /// Alternate UART parameters tried during detection (SBUS fast baud)
    pub serial_fast: Option<SerialSettings>,
}

pub(crate) const CRSF_SERIAL: SerialSettings = SerialSettings {
    baud: 420_000,
    inverted: false,
};
pub(crate) const SBUS_SERIAL: SerialSettings = SerialSettings {
    baud: 100_000,
    inverted: true,
};
pub(crate) const SBUS_SERIAL_FAST: SerialSettings = SerialSettings {
    baud: 200_000,
    inverted: true,
};
pub(crate) const IBUS_SERIAL: SerialSettings = SerialSettings {
    baud: 115_200,
    inverted: false,
};

pub static CRSF_SPEC: ProtocolSpec = ProtocolSpec {
    name: "CRSF",
    sync: &[0xC8],
    channel_count: 16,
    cal: Calibration {
        min: 172,
        center: 992,
        max: 1811,
        threshold: 50,
        map: Some(RangeMap {
            out_min: CHANNEL_OUT_MIN,
            out_max: CHANNEL_OUT_MAX,
        }),
    },
    frame_timeout_ms: 4,
    link_timeout_ms: 40,
    detect_window_ms: 80,
    serial: Some(CRSF_SERIAL),
    serial_fast: None,
};

pub static SBUS_SPEC: ProtocolSpec = ProtocolSpec {
    name: "SBUS",
    sync: &[0x0F],
    channel_count: 16,
    cal: Calibration {
        min: 172,
        center: 992,
        max: 1811,
        threshold: 500,
        map: Some(RangeMap {
            out_min: CHANNEL_OUT_MIN,
            out_max: CHANNEL_OUT_MAX,
        }),
    },
    frame_timeout_ms: 4,
    // 3 dropped frames at the 14 ms analogue frame period
    link_timeout_ms: 42,
    detect_window_ms: 84,
    serial: Some(SBUS_SERIAL),
    serial_fast: Some(SBUS_SERIAL_FAST),
};

pub static IBUS_SPEC: ProtocolSpec = ProtocolSpec {
    name: "IBUS",
    sync: &[0x20, 0x40],
    channel_count: 14,
    cal: Calibration {
        min: 1000,
        center: 1500,
        max: 2000,
        threshold: 500,
        map: None,
    },
    frame_timeout_ms: 4,
    // 3 dropped frames at the 7 ms frame period
    link_timeout_ms: 21,
    detect_window_ms: 42,
    serial: Some(IBUS_SERIAL),
    serial_fast: None,
};

pub static PPM_SPEC: ProtocolSpec = ProtocolSpec {
    name: "PPM",
    sync: &[],
    channel_count: 8,
    cal: Calibration {
        min: 1000,
        center: 1500,
        max: 2000,
        threshold: 100,
        map: None,
    },
    frame_timeout_ms: 0,
    // 3 dropped trains at the 20 ms frame period
    link_timeout_ms: 60,
    detect_window_ms: 120,
    serial: None,
    serial_fast: None,
};

pub static PWM_SPEC: ProtocolSpec = ProtocolSpec {
    name: "PWM",
    sync: &[],
    channel_count: 4,
    cal: Calibration {
        min: 1000,
        center: 1500,
        max: 2000,
        threshold: 350,
        map: None,
    },
    frame_timeout_ms: 0,
    // 5 missed pulses at the 25 ms maximum signal period
    link_timeout_ms: 125,
    detect_window_ms: 150,
    serial: None,
    serial_fast: None,
};

/// Common decoder contract the dispatcher drives
///
/// Construction is protocol initialization; dropping the instance is
/// deinitialization (port resources are torn down separately through
/// [`crate::io::RadioPorts::release`]).
pub trait LinkDecoder {
    /// Which protocol this decoder implements
    fn protocol(&self) -> Protocol;

    /// Ingest pending input and run the watchdogs; poll at ~1 ms
    fn update(&mut self, now_ms: u32);

    /// Normalized channel vector (0 = no valid sample)
    fn channels(&self) -> &[u16];

    /// Whole-link failsafe verdict
    fn input_lost(&self) -> bool;

    /// Per-channel fault; identical to `input_lost` for single-stream
    /// protocols, independent per channel for PWM
    fn channel_fault(&self, channel: usize) -> bool {
        let _ = channel;
        self.input_lost()
    }

    /// True when every channel is faulted
    fn all_fault(&self) -> bool {
        self.input_lost()
    }

    /// True when at least one channel is faulted
    fn any_fault(&self) -> bool {
        self.input_lost()
    }
}

/// The active decoder, as a closed set of tagged variants
///
/// Dispatch stays O(1) and exhaustive: adding a protocol extends this enum
/// and the compiler points at every match that must learn about it.
pub enum ActiveDecoder {
    Crsf(CrsfDecoder),
    Sbus(SbusDecoder),
    Ibus(IbusDecoder),
    Ppm(PpmDecoder),
    Pwm(PwmDecoder),
}

impl ActiveDecoder {
    fn inner(&self) -> &dyn LinkDecoder {
        match self {
            ActiveDecoder::Crsf(d) => d,
            ActiveDecoder::Sbus(d) => d,
            ActiveDecoder::Ibus(d) => d,
            ActiveDecoder::Ppm(d) => d,
            ActiveDecoder::Pwm(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LinkDecoder {
        match self {
            ActiveDecoder::Crsf(d) => d,
            ActiveDecoder::Sbus(d) => d,
            ActiveDecoder::Ibus(d) => d,
            ActiveDecoder::Ppm(d) => d,
            ActiveDecoder::Pwm(d) => d,
        }
    }
}

impl LinkDecoder for ActiveDecoder {
    fn protocol(&self) -> Protocol {
        self.inner().protocol()
    }

    fn update(&mut self, now_ms: u32) {
        self.inner_mut().update(now_ms);
    }

    fn channels(&self) -> &[u16] {
        self.inner().channels()
    }

    fn input_lost(&self) -> bool {
        self.inner().input_lost()
    }

    fn channel_fault(&self, channel: usize) -> bool {
        self.inner().channel_fault(channel)
    }

    fn all_fault(&self) -> bool {
        self.inner().all_fault()
    }

    fn any_fault(&self) -> bool {
        self.inner().any_fault()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_sync_bytes() {
        assert_eq!(Protocol::Crsf.spec().sync, &[0xC8]);
        assert_eq!(Protocol::Sbus.spec().sync, &[0x0F]);
        assert_eq!(Protocol::Ibus.spec().sync, &[0x20, 0x40]);
        assert!(Protocol::Ppm.spec().sync.is_empty());
        assert!(Protocol::Pwm.spec().sync.is_empty());
    }

    #[test]
    fn test_spec_channel_counts() {
        assert_eq!(Protocol::Crsf.spec().channel_count, 16);
        assert_eq!(Protocol::Sbus.spec().channel_count, 16);
        assert_eq!(Protocol::Ibus.spec().channel_count, 14);
        assert_eq!(Protocol::Ppm.spec().channel_count, 8);
        assert_eq!(Protocol::Pwm.spec().channel_count, 4);

        for p in Protocol::TRIAL_ORDER {
            assert!(p.spec().channel_count <= MAX_CHANNELS);
        }
    }

    #[test]
    fn test_spec_serial_settings() {
        assert_eq!(Protocol::Crsf.spec().serial.unwrap().baud, 420_000);
        let sbus = Protocol::Sbus.spec();
        assert_eq!(sbus.serial.unwrap().baud, 100_000);
        assert!(sbus.serial.unwrap().inverted);
        assert_eq!(sbus.serial_fast.unwrap().baud, 200_000);
        assert_eq!(Protocol::Ibus.spec().serial.unwrap().baud, 115_200);
        assert!(Protocol::Ppm.spec().serial.is_none());
        assert!(Protocol::Pwm.spec().serial.is_none());
    }

    #[test]
    fn test_trial_order_covers_all_protocols() {
        for p in [
            Protocol::Crsf,
            Protocol::Sbus,
            Protocol::Ibus,
            Protocol::Ppm,
            Protocol::Pwm,
        ] {
            assert!(Protocol::TRIAL_ORDER.contains(&p));
        }
    }

    #[test]
    fn test_protocol_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            protocol: Protocol,
        }

        let w: Wrapper = toml::from_str("protocol = \"sbus\"").unwrap();
        assert_eq!(w.protocol, Protocol::Sbus);
    }
}
