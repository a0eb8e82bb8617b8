//! # I/O Abstractions
//!
//! Trait seams between the protocol core and its hardware collaborators:
//! a polled byte source per UART protocol, a monotonic clock, and a port
//! provider the dispatcher asks for serial/pulse resources when a protocol
//! is (re)selected.
//!
//! The byte-source side is deliberately synchronous — decoders drain
//! whatever has arrived since the last poll. [`SharedRxBuffer`] bridges an
//! async producer (the tokio-serial pump in [`TokioSerialPorts`]) into that
//! polled model, and doubles as the scripted source in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{RcLinkError, Result};
use crate::protocol::ppm::PpmCapture;
use crate::protocol::pwm::PwmCapture;

/// Polled byte source backing a UART protocol decoder
pub trait ByteSource: Send {
    /// Number of bytes currently buffered
    fn available(&self) -> usize;

    /// Read up to `buf.len()` buffered bytes, returning the count read
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Monotonic time source for decoder watchdogs and detection trials
pub trait Clock: Send {
    /// Milliseconds since an arbitrary epoch (wraps)
    fn now_ms(&self) -> u32;

    /// Microseconds since an arbitrary epoch (wraps); pulse-width domain
    fn now_us(&self) -> u32;

    /// Yield point inside busy-wait detection trials
    fn idle(&self);
}

/// UART parameters a protocol needs from its port provider
///
/// `inverted` records SBUS signal polarity for the collaborator that owns
/// the transceiver; host serial adapters cannot invert in software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub inverted: bool,
}

/// Hardware resource provider consulted on protocol (re)selection
///
/// Exactly one protocol holds resources at a time: the dispatcher calls
/// [`RadioPorts::release`] before every activation, and `release` must
/// leave no dangling UART reader or GPIO edge registration behind.
pub trait RadioPorts: Send {
    /// Open the receiver UART with protocol-specific settings
    fn open_serial(&mut self, settings: &SerialSettings) -> Result<Box<dyn ByteSource>>;

    /// Register the PPM edge capture with the pulse-input pin
    fn bind_ppm(&mut self, capture: Arc<PpmCapture>) -> Result<()>;

    /// Register the PWM edge capture with the per-channel input pins
    fn bind_pwm(&mut self, capture: Arc<PwmCapture>) -> Result<()>;

    /// Tear down whatever the previous activation acquired
    fn release(&mut self);
}

/// Wall-clock implementation of [`Clock`] for hosted targets
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    fn now_us(&self) -> u32 {
        self.start.elapsed().as_micros() as u32
    }

    fn idle(&self) {
        std::thread::sleep(std::time::Duration::from_micros(500));
    }
}

/// Thread-safe byte queue implementing [`ByteSource`]
///
/// Clone handles share the same queue: the producer half is pushed from a
/// reader task (or a test), the consumer half is handed to a decoder.
#[derive(Clone, Default)]
pub struct SharedRxBuffer {
    inner: Arc<Mutex<VecDeque<u8>>>,
}

impl SharedRxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes (producer side)
    pub fn push(&self, bytes: &[u8]) {
        let mut queue = self.inner.lock().unwrap();
        queue.extend(bytes.iter().copied());
    }

    /// Drop everything buffered, e.g. on reconfiguration
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

impl ByteSource for SharedRxBuffer {
    fn available(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let count = buf.len().min(queue.len());
        for slot in buf.iter_mut().take(count) {
            *slot = queue.pop_front().unwrap();
        }
        count
    }
}

/// [`RadioPorts`] implementation for hosted targets with a USB/UART adapter
///
/// Serial protocols are served by opening the configured device with
/// tokio-serial and pumping it into a [`SharedRxBuffer`] from a background
/// task. Pulse protocols (PPM/PWM) need GPIO edge capture this provider
/// does not have, so binding them fails and auto-detection skips past them.
pub struct TokioSerialPorts {
    device_path: String,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl TokioSerialPorts {
    /// Create a provider for the given serial device path
    ///
    /// # Arguments
    ///
    /// * `device_path` - Device path (e.g. "/dev/ttyUSB0")
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            reader: None,
        }
    }
}

impl RadioPorts for TokioSerialPorts {
    fn open_serial(&mut self, settings: &SerialSettings) -> Result<Box<dyn ByteSource>> {
        use tokio_serial::SerialPortBuilderExt;

        if settings.inverted {
            warn!(
                "{} requires an inverted signal; expecting an external inverter",
                self.device_path
            );
        }

        let mut port = tokio_serial::new(&self.device_path, settings.baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                RcLinkError::Serial(format!("Failed to open {}: {}", self.device_path, e))
            })?;

        debug!(
            "Opened {} at {} baud",
            self.device_path, settings.baud
        );

        let buffer = SharedRxBuffer::new();
        let producer = buffer.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut chunk = [0u8; 256];
            loop {
                match port.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => producer.push(&chunk[..n]),
                    Err(e) => {
                        warn!("Serial read failed: {}", e);
                        break;
                    }
                }
            }
        }));

        Ok(Box::new(buffer))
    }

    fn bind_ppm(&mut self, _capture: Arc<PpmCapture>) -> Result<()> {
        Err(RcLinkError::Unsupported("PPM"))
    }

    fn bind_pwm(&mut self, _capture: Arc<PwmCapture>) -> Result<()> {
        Err(RcLinkError::Unsupported("PWM"))
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for TokioSerialPorts {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Manually advanced clock; `idle` steps 1 ms so detection trials
    /// terminate without wall time
    #[derive(Clone, Default)]
    pub struct MockClock {
        now_ms: Arc<AtomicU32>,
    }

    impl MockClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance_ms(&self, ms: u32) {
            self.now_ms.fetch_add(ms, Ordering::Relaxed);
        }

        pub fn set_ms(&self, ms: u32) {
            self.now_ms.store(ms, Ordering::Relaxed);
        }
    }

    impl Clock for MockClock {
        fn now_ms(&self) -> u32 {
            self.now_ms.load(Ordering::Relaxed)
        }

        fn now_us(&self) -> u32 {
            self.now_ms.load(Ordering::Relaxed).wrapping_mul(1000)
        }

        fn idle(&self) {
            self.advance_ms(1);
        }
    }

    /// Port provider whose serial sources are externally scripted buffers
    ///
    /// Clone handles share all state, so a test can keep one handle while
    /// the dispatcher owns the other.
    #[derive(Clone)]
    pub struct MockPorts {
        pub serial: SharedRxBuffer,
        pub opened: Arc<Mutex<Vec<SerialSettings>>>,
        pub released: Arc<AtomicU32>,
        pub ppm: Arc<Mutex<Option<Arc<PpmCapture>>>>,
        pub pwm: Arc<Mutex<Option<Arc<PwmCapture>>>>,
        pub allow_pulse: bool,
    }

    impl MockPorts {
        pub fn new(serial: SharedRxBuffer) -> Self {
            Self {
                serial,
                opened: Arc::new(Mutex::new(Vec::new())),
                released: Arc::new(AtomicU32::new(0)),
                ppm: Arc::new(Mutex::new(None)),
                pwm: Arc::new(Mutex::new(None)),
                allow_pulse: false,
            }
        }

        pub fn opened_bauds(&self) -> Vec<u32> {
            self.opened.lock().unwrap().iter().map(|s| s.baud).collect()
        }
    }

    impl RadioPorts for MockPorts {
        fn open_serial(&mut self, settings: &SerialSettings) -> Result<Box<dyn ByteSource>> {
            self.opened.lock().unwrap().push(*settings);
            Ok(Box::new(self.serial.clone()))
        }

        fn bind_ppm(&mut self, capture: Arc<PpmCapture>) -> Result<()> {
            if !self.allow_pulse {
                return Err(RcLinkError::Unsupported("PPM"));
            }
            *self.ppm.lock().unwrap() = Some(capture);
            Ok(())
        }

        fn bind_pwm(&mut self, capture: Arc<PwmCapture>) -> Result<()> {
            if !self.allow_pulse {
                return Err(RcLinkError::Unsupported("PWM"));
            }
            *self.pwm.lock().unwrap() = Some(capture);
            Ok(())
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::Relaxed);
            *self.ppm.lock().unwrap() = None;
            *self.pwm.lock().unwrap() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_rx_buffer_fifo_order() {
        let buffer = SharedRxBuffer::new();
        buffer.push(&[1, 2, 3]);
        buffer.push(&[4, 5]);

        let mut source: Box<dyn ByteSource> = Box::new(buffer.clone());
        assert_eq!(source.available(), 5);

        let mut out = [0u8; 3];
        assert_eq!(source.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(source.available(), 2);

        let mut out = [0u8; 8];
        assert_eq!(source.read(&mut out), 2);
        assert_eq!(&out[..2], &[4, 5]);
        assert_eq!(source.available(), 0);
    }

    #[test]
    fn test_shared_rx_buffer_clear() {
        let buffer = SharedRxBuffer::new();
        buffer.push(&[0xC8; 16]);
        buffer.clear();
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_shared_rx_buffer_read_from_empty() {
        let mut buffer = SharedRxBuffer::new();
        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        clock.idle();
        let b = clock.now_ms();
        assert!(b >= a);
    }
}
