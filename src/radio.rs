//! # Radio Dispatcher
//!
//! Protocol selection, runtime dispatch and derived channel state.
//!
//! [`Radio`] owns exactly one live decoder at a time, constructed through
//! the [`RadioPorts`] provider on selection and dropped on reselection.
//! `select` runs the auto-detection trial loop; after that every per-tick
//! operation routes through the active decoder, so the consumer never
//! branches on which protocol won.
//!
//! On top of the raw channel vector the dispatcher captures a per-channel
//! neutral reference shortly after the link comes up and classifies each
//! channel's movement relative to it (`Centered` / `Forward` / `Reverse`).

use tracing::{debug, info, warn};

use crate::channels::CHANNEL_INVALID;
use crate::error::Result;
use crate::io::{Clock, RadioPorts};
use crate::protocol::{
    ActiveDecoder, CrsfDecoder, IbusDecoder, LinkDecoder, PpmCapture, PpmDecoder, Protocol,
    PwmCapture, PwmDecoder, SbusDecoder, CRSF_SERIAL, IBUS_SERIAL, MAX_CHANNELS, SBUS_SERIAL,
    SBUS_SERIAL_FAST,
};

/// Delay after selection before the neutral reference is captured, letting
/// the transmitter's analog sticks settle
const NEUTRAL_DELAY_MS: u32 = 100;

/// Inner deadband: a channel this close to neutral is centered
const ACTIVITY_DEADBAND: u16 = 100;

/// Outer threshold: a channel this far from neutral is commanded
const ACTIVITY_THRESHOLD: u16 = 200;

/// Absolute sane pulse range; anything outside classifies as centered
const CHANNEL_ABS_MIN: u16 = 650;
const CHANNEL_ABS_MAX: u16 = 2350;

/// Fault aggregation queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultQuery {
    /// Every channel faulted (whole link down)
    All,
    /// At least one channel faulted
    Any,
    /// A specific channel faulted
    Channel(usize),
}

/// Per-channel movement classification relative to the neutral reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelActivity {
    Centered,
    Forward,
    Reverse,
}

/// Tunables for the pulse protocols' configured channel counts
#[derive(Debug, Clone, Copy)]
pub struct RadioOptions {
    pub ppm_channels: usize,
    pub pwm_channels: usize,
}

impl Default for RadioOptions {
    fn default() -> Self {
        Self {
            ppm_channels: 8,
            pwm_channels: 4,
        }
    }
}

/// Protocol-agnostic receiver frontend
pub struct Radio {
    ports: Box<dyn RadioPorts>,
    clock: Box<dyn Clock>,
    options: RadioOptions,
    decoder: ActiveDecoder,
    /// SBUS detection latched onto the fast (200k) baud variant
    sbus_fast: bool,
    values: [u16; MAX_CHANNELS],
    zero: [u16; MAX_CHANNELS],
    zero_set: bool,
    activity: [ChannelActivity; MAX_CHANNELS],
    selected_at_ms: u32,
    was_lost: bool,
}

impl Radio {
    /// Initialize with the given protocol, without running detection
    ///
    /// # Arguments
    ///
    /// * `protocol` - Protocol to activate
    /// * `options` - Pulse-protocol channel counts
    /// * `ports` - Hardware resource provider
    /// * `clock` - Monotonic time source
    ///
    /// # Errors
    ///
    /// Returns error if the provider cannot supply the protocol's resources
    /// (e.g. a serial device that cannot be opened).
    pub fn new(
        protocol: Protocol,
        options: RadioOptions,
        mut ports: Box<dyn RadioPorts>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let decoder = build_decoder(ports.as_mut(), &options, false, protocol)?;
        let selected_at_ms = clock.now_ms();

        Ok(Self {
            ports,
            clock,
            options,
            decoder,
            sbus_fast: false,
            values: [0; MAX_CHANNELS],
            zero: [0; MAX_CHANNELS],
            zero_set: false,
            activity: [ChannelActivity::Centered; MAX_CHANNELS],
            selected_at_ms,
            was_lost: true,
        })
    }

    /// Detect the connected protocol, preferring `preferred`
    ///
    /// Runs the preferred protocol for its trial window first, then walks
    /// the remaining protocols in the fixed trial order, deinitializing
    /// each attempt before the next. If nothing produces a valid frame or
    /// pulse the preferred protocol is re-activated regardless: the radio
    /// always ends initialized in *some* protocol and simply reports fault
    /// until a signal appears.
    ///
    /// # Returns
    ///
    /// * `Result<Protocol>` - The protocol left active
    pub fn select(&mut self, preferred: Protocol) -> Result<Protocol> {
        info!("Detecting radio protocol (preferred: {})", preferred);

        match self.try_protocol(preferred) {
            Ok(true) => {
                info!("Detected {} on the preferred protocol", preferred);
                return Ok(preferred);
            }
            Ok(false) => {}
            Err(e) => debug!("{} trial failed: {}", preferred, e),
        }

        for protocol in Protocol::TRIAL_ORDER {
            if protocol == preferred {
                continue;
            }
            match self.try_protocol(protocol) {
                Ok(true) => {
                    info!("Detected {}", protocol);
                    return Ok(protocol);
                }
                Ok(false) => {}
                Err(e) => debug!("{} trial failed: {}", protocol, e),
            }
        }

        // Nothing answered; end initialized in the preferred protocol anyway
        self.activate(preferred)?;
        warn!(
            "No radio detected, staying on {} with the link reported lost",
            preferred
        );
        Ok(preferred)
    }

    /// Poll the active decoder and refresh the derived channel state
    ///
    /// Intended to be called from a fixed-period control loop (~1 ms).
    pub fn update(&mut self) {
        let now = self.clock.now_ms();
        self.decoder.update(now);

        let count = self.channel_count();
        self.values[..count].copy_from_slice(self.decoder.channels());

        let lost = self.decoder.input_lost();
        if lost != self.was_lost {
            if lost {
                warn!("{} link lost", self.decoder.protocol());
            } else {
                info!("{} link up", self.decoder.protocol());
            }
            self.was_lost = lost;
        }

        if !self.zero_set
            && !lost
            && now.wrapping_sub(self.selected_at_ms) >= NEUTRAL_DELAY_MS
        {
            self.capture_zero();
        }

        if !lost && self.zero_set {
            for ch in 0..count {
                self.activity[ch] = classify(self.values[ch], self.zero[ch], self.activity[ch]);
            }
        }
    }

    /// Number of channels the active protocol carries
    pub fn channel_count(&self) -> usize {
        self.decoder.channels().len()
    }

    /// The currently active protocol
    pub fn active(&self) -> Protocol {
        self.decoder.protocol()
    }

    /// Normalized channel values (0 = no valid sample)
    pub fn channels(&self) -> &[u16] {
        &self.values[..self.channel_count()]
    }

    /// Aggregated fault state
    pub fn is_faulted(&self, query: FaultQuery) -> bool {
        match query {
            FaultQuery::All => self.decoder.all_fault(),
            FaultQuery::Any => self.decoder.any_fault(),
            FaultQuery::Channel(ch) => {
                ch >= self.channel_count() || self.decoder.channel_fault(ch)
            }
        }
    }

    /// Movement classification per channel
    pub fn channel_activity(&self) -> &[ChannelActivity] {
        &self.activity[..self.channel_count()]
    }

    /// Re-capture the neutral reference from the current channel values
    ///
    /// Does nothing to the reference while the link is down; the activity
    /// classification is reset either way, since nothing can be commanded
    /// relative to a reference captured this instant.
    pub fn rezero(&mut self) {
        if !self.decoder.input_lost() {
            let count = self.channel_count();
            self.zero[..count].copy_from_slice(&self.values[..count]);
            self.zero_set = true;
        }
        self.activity = [ChannelActivity::Centered; MAX_CHANNELS];
    }

    fn capture_zero(&mut self) {
        let count = self.channel_count();
        self.zero[..count].copy_from_slice(&self.values[..count]);
        self.zero_set = true;
        self.activity = [ChannelActivity::Centered; MAX_CHANNELS];
        debug!("Neutral reference captured: {:?}", &self.zero[..count]);
    }

    /// Tear down the current protocol and bring up `protocol`
    fn activate(&mut self, protocol: Protocol) -> Result<()> {
        self.ports.release();
        self.decoder = build_decoder(
            self.ports.as_mut(),
            &self.options,
            self.sbus_fast,
            protocol,
        )?;
        self.selected_at_ms = self.clock.now_ms();
        self.values = [0; MAX_CHANNELS];
        self.zero_set = false;
        self.activity = [ChannelActivity::Centered; MAX_CHANNELS];
        self.was_lost = true;
        Ok(())
    }

    /// Activate `protocol` and poll it for its detection window
    fn try_protocol(&mut self, protocol: Protocol) -> Result<bool> {
        self.activate(protocol)?;
        if self.run_trial(protocol.spec().detect_window_ms) {
            return Ok(true);
        }

        // SBUS ships at two baud rates; retry the fast variant before
        // moving on
        if protocol == Protocol::Sbus && !self.sbus_fast {
            self.sbus_fast = true;
            self.activate(protocol)?;
            if self.run_trial(protocol.spec().detect_window_ms) {
                return Ok(true);
            }
            self.sbus_fast = false;
        }

        Ok(false)
    }

    /// Busy-poll the active decoder until it validates or the window ends
    fn run_trial(&mut self, window_ms: u32) -> bool {
        let start = self.clock.now_ms();
        loop {
            let now = self.clock.now_ms();
            self.decoder.update(now);
            if !self.decoder.input_lost() {
                return true;
            }
            if now.wrapping_sub(start) >= window_ms {
                return false;
            }
            self.clock.idle();
        }
    }
}

/// Construct the decoder for `protocol`, acquiring its port resources
fn build_decoder(
    ports: &mut dyn RadioPorts,
    options: &RadioOptions,
    sbus_fast: bool,
    protocol: Protocol,
) -> Result<ActiveDecoder> {
    match protocol {
        Protocol::Crsf => {
            let source = ports.open_serial(&CRSF_SERIAL)?;
            Ok(ActiveDecoder::Crsf(CrsfDecoder::new(source)))
        }
        Protocol::Sbus => {
            let settings = if sbus_fast { SBUS_SERIAL_FAST } else { SBUS_SERIAL };
            let source = ports.open_serial(&settings)?;
            Ok(ActiveDecoder::Sbus(SbusDecoder::new(source)))
        }
        Protocol::Ibus => {
            let source = ports.open_serial(&IBUS_SERIAL)?;
            Ok(ActiveDecoder::Ibus(IbusDecoder::new(source)))
        }
        Protocol::Ppm => {
            let capture = PpmCapture::new(options.ppm_channels);
            ports.bind_ppm(capture.clone())?;
            Ok(ActiveDecoder::Ppm(PpmDecoder::new(capture)))
        }
        Protocol::Pwm => {
            let capture = PwmCapture::new(options.pwm_channels);
            ports.bind_pwm(capture.clone())?;
            Ok(ActiveDecoder::Pwm(PwmDecoder::new(capture)))
        }
    }
}

/// Classify one channel against its neutral reference
///
/// Between the inner deadband and the outer threshold the previous
/// classification is retained, so a value hovering there cannot flap.
fn classify(value: u16, zero: u16, previous: ChannelActivity) -> ChannelActivity {
    if value == CHANNEL_INVALID || !(CHANNEL_ABS_MIN..=CHANNEL_ABS_MAX).contains(&value) {
        return ChannelActivity::Centered;
    }

    let delta = value as i32 - zero as i32;
    if delta >= ACTIVITY_THRESHOLD as i32 {
        ChannelActivity::Forward
    } else if delta <= -(ACTIVITY_THRESHOLD as i32) {
        ChannelActivity::Reverse
    } else if delta.unsigned_abs() <= ACTIVITY_DEADBAND as u32 {
        ChannelActivity::Centered
    } else {
        previous
    }
}
