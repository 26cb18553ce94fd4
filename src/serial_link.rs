// src/serial_link.rs
//
// Serial port owner for the RS-485 bus.
//
// A dedicated blocking thread holds the port open, scans the byte stream
// for start-terminated frames and forwards parsed frames over a channel.
// Writes go through a cloned handle behind a mutex so commands and the
// reader never fight over the port. On any I/O error the port is closed
// and the reader reopens it with exponential back-off.

use std::io::{ErrorKind, Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::SerialSettings;
use crate::protocol::{
    parse_frame, ParsedFrame, FRAME_END_BYTE, FRAME_LENGTH, FRAME_MAX_LENGTH, FRAME_START_BYTE,
};

/// First retry delay after a failed open
const RETRY_INITIAL: Duration = Duration::from_secs(1);
/// Retry delay ceiling
const RETRY_MAX: Duration = Duration::from_secs(8);
/// Minimum spacing between "port unavailable" write warnings
const SEND_WARN_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Traits
// ============================================================================

/// Anything that can put a raw frame on the bus. The transaction engine
/// only needs this much, which keeps it testable against a mock.
pub trait FrameSender: Send + Sync {
    /// Returns false when the frame could not be written; callers treat
    /// that as transaction failure.
    fn send_frame(&self, bytes: &[u8]) -> bool;
}

// ============================================================================
// Frame Scanner
// ============================================================================

/// Result of feeding one byte to the scanner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanEvent {
    /// Need more bytes
    Incomplete,
    /// A complete candidate frame (14 or 15 bytes, terminator last)
    Frame(Vec<u8>),
    /// Max length reached without a terminator
    Discarded(Vec<u8>),
}

/// Accumulates bytes into start-terminated frame candidates.
///
/// Bytes before a start marker are noise and dropped. A candidate
/// completes at 14 bytes when the terminator is in place, or at 15 bytes
/// for controllers that insert one extra byte; 15 bytes without a
/// terminator is malformed.
#[derive(Default)]
pub struct FrameScanner {
    buf: Vec<u8>,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> ScanEvent {
        if self.buf.is_empty() && byte != FRAME_START_BYTE {
            return ScanEvent::Incomplete;
        }

        self.buf.push(byte);

        let len = self.buf.len();
        if len == FRAME_LENGTH && byte == FRAME_END_BYTE {
            return ScanEvent::Frame(std::mem::take(&mut self.buf));
        }
        if len == FRAME_MAX_LENGTH {
            let frame = std::mem::take(&mut self.buf);
            if byte == FRAME_END_BYTE {
                return ScanEvent::Frame(frame);
            }
            return ScanEvent::Discarded(frame);
        }

        ScanEvent::Incomplete
    }
}

// ============================================================================
// Serial Link
// ============================================================================

struct WriterState {
    port: Option<Box<dyn SerialPort>>,
    last_unavailable_warn: Option<Instant>,
}

struct Shared {
    settings: SerialSettings,
    writer: Mutex<WriterState>,
    cancel: AtomicBool,
    /// Set by the writer on failure so the reader rebuilds both handles
    reset: AtomicBool,
}

/// Cloneable sending handle, valid for the lifetime of the link.
#[derive(Clone)]
pub struct SerialHandle {
    shared: Arc<Shared>,
}

pub struct SerialLink {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                writer: Mutex::new(WriterState {
                    port: None,
                    last_unavailable_warn: None,
                }),
                cancel: AtomicBool::new(false),
                reset: AtomicBool::new(false),
            }),
            reader: None,
        }
    }

    pub fn handle(&self) -> SerialHandle {
        SerialHandle {
            shared: self.shared.clone(),
        }
    }

    /// Spawn the reader thread. Parsed frames arrive on `frame_tx`.
    pub fn start(&mut self, frame_tx: mpsc::Sender<ParsedFrame>) {
        if self.reader.is_some() {
            return;
        }
        self.shared.cancel.store(false, Ordering::Relaxed);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("serial-reader".to_string())
            .spawn(move || run_reader(shared, frame_tx))
            .expect("failed to spawn serial reader thread");
        self.reader = Some(handle);
    }

    /// Stop the reader and drop the port. Idempotent.
    pub fn stop(&mut self) {
        self.shared.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        let mut writer = self.shared.writer.lock().expect("writer lock poisoned");
        writer.port = None;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FrameSender for SerialHandle {
    fn send_frame(&self, bytes: &[u8]) -> bool {
        let mut writer = self.shared.writer.lock().expect("writer lock poisoned");

        let Some(port) = writer.port.as_mut() else {
            let now = Instant::now();
            let warn_due = writer
                .last_unavailable_warn
                .map_or(true, |last| now.duration_since(last) >= SEND_WARN_INTERVAL);
            if warn_due {
                writer.last_unavailable_warn = Some(now);
                warn!("serial port unavailable, frame dropped");
            }
            return false;
        };

        match port.write_all(bytes).and_then(|_| port.flush()) {
            Ok(()) => {
                trace!(frame = %hex::encode(bytes), "frame sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "serial write failed, closing port");
                writer.port = None;
                self.shared.reset.store(true, Ordering::Relaxed);
                false
            }
        }
    }
}

// ============================================================================
// Reader Loop
// ============================================================================

fn run_reader(shared: Arc<Shared>, frame_tx: mpsc::Sender<ParsedFrame>) {
    let mut retry_delay = RETRY_INITIAL;

    'outer: while !shared.cancel.load(Ordering::Relaxed) {
        let mut port = match open_port(&shared.settings) {
            Ok(port) => {
                retry_delay = RETRY_INITIAL;
                port
            }
            Err(e) => {
                warn!(
                    port = %shared.settings.port,
                    error = %e,
                    retry_in = ?retry_delay,
                    "failed to open serial port"
                );
                if !sleep_cancellable(&shared.cancel, retry_delay) {
                    return;
                }
                retry_delay = (retry_delay * 3 / 2).min(RETRY_MAX);
                continue;
            }
        };

        match port.try_clone() {
            Ok(clone) => {
                let mut writer = shared.writer.lock().expect("writer lock poisoned");
                writer.port = Some(clone);
            }
            Err(e) => warn!(error = %e, "could not clone serial handle for writes"),
        }
        shared.reset.store(false, Ordering::Relaxed);

        info!(
            port = %shared.settings.port,
            baudrate = shared.settings.baudrate,
            "serial port opened"
        );

        let mut scanner = FrameScanner::new();
        let mut byte = [0u8; 1];

        while !shared.cancel.load(Ordering::Relaxed) {
            if shared.reset.swap(false, Ordering::Relaxed) {
                debug!("write side requested reopen");
                break;
            }

            match port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => match scanner.push(byte[0]) {
                    ScanEvent::Incomplete => {}
                    ScanEvent::Frame(raw) => match parse_frame(&raw) {
                        Ok(frame) => {
                            if frame_tx.blocking_send(frame).is_err() {
                                // Dispatcher is gone, shut the reader down
                                break 'outer;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, frame = %hex::encode(&raw), "invalid frame dropped");
                        }
                    },
                    ScanEvent::Discarded(raw) => {
                        warn!(frame = %hex::encode(&raw), "frame without terminator dropped");
                    }
                },
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "serial read failed, reopening");
                    break;
                }
            }
        }

        let mut writer = shared.writer.lock().expect("writer lock poisoned");
        writer.port = None;
    }
}

/// Sleep in short slices so shutdown stays prompt. Returns false when
/// cancelled.
fn sleep_cancellable(cancel: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}

// ============================================================================
// Port Setup
// ============================================================================

fn to_serialport_data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn to_serialport_stop_bits(bits: u8) -> serialport::StopBits {
    match bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    }
}

fn to_serialport_parity(parity: &str) -> serialport::Parity {
    match parity.trim().to_uppercase().as_str() {
        "E" | "EVEN" => serialport::Parity::Even,
        "O" | "ODD" => serialport::Parity::Odd,
        _ => serialport::Parity::None,
    }
}

fn builder(settings: &SerialSettings) -> serialport::SerialPortBuilder {
    serialport::new(settings.port.clone(), settings.baudrate)
        .data_bits(to_serialport_data_bits(settings.bytesize))
        .stop_bits(to_serialport_stop_bits(settings.stopbits))
        .parity(to_serialport_parity(&settings.parity))
        .timeout(Duration::from_secs_f64(settings.timeout_sec.max(0.01)))
}

#[cfg(unix)]
fn open_port(settings: &SerialSettings) -> serialport::Result<Box<dyn SerialPort>> {
    let mut port = builder(settings).open_native()?;
    if let Err(e) = port.set_exclusive(true) {
        debug!(error = %e, "exclusive open not supported");
    }
    Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_port(settings: &SerialSettings) -> serialport::Result<Box<dyn SerialPort>> {
    builder(settings).open()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut FrameScanner, bytes: &[u8]) -> Vec<ScanEvent> {
        bytes
            .iter()
            .map(|&b| scanner.push(b))
            .filter(|e| *e != ScanEvent::Incomplete)
            .collect()
    }

    #[test]
    fn test_scanner_complete_frame() {
        let mut scanner = FrameScanner::new();
        let raw = [
            0x49, 0x02, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46,
        ];
        let events = feed(&mut scanner, &raw);
        assert_eq!(events, vec![ScanEvent::Frame(raw.to_vec())]);
    }

    #[test]
    fn test_scanner_skips_leading_noise() {
        let mut scanner = FrameScanner::new();
        let mut stream = vec![0x00, 0xFF, 0x12];
        let frame = [
            0x49, 0x02, 0x50, 0x11, 0x01, 0, 0x04, 0x16, 0, 0, 0x02, 0x02, 0x01, 0x46,
        ];
        stream.extend_from_slice(&frame);
        let events = feed(&mut scanner, &stream);
        assert_eq!(events, vec![ScanEvent::Frame(frame.to_vec())]);
    }

    #[test]
    fn test_scanner_accepts_15_byte_frame() {
        let mut scanner = FrameScanner::new();
        let raw = [
            0x49, 0x02, 0x50, 0x11, 0x01, 0, 0x04, 0x16, 0, 0, 0x02, 0x02, 0x01, 0xF8, 0x46,
        ];
        let events = feed(&mut scanner, &raw);
        assert_eq!(events, vec![ScanEvent::Frame(raw.to_vec())]);

        let parsed = parse_frame(&raw).unwrap();
        assert_eq!(parsed.extra, Some(0xF8));
    }

    #[test]
    fn test_scanner_discards_without_terminator() {
        let mut scanner = FrameScanner::new();
        let raw = [0x49u8; FRAME_MAX_LENGTH];
        let events = feed(&mut scanner, &raw);
        assert_eq!(events, vec![ScanEvent::Discarded(raw.to_vec())]);

        // Scanner recovers for the next frame
        let frame = [
            0x49, 0x03, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46,
        ];
        let events = feed(&mut scanner, &frame);
        assert_eq!(events, vec![ScanEvent::Frame(frame.to_vec())]);
    }

    #[test]
    fn test_scanner_back_to_back_frames() {
        let mut scanner = FrameScanner::new();
        let frame_a = [
            0x49, 0x01, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46,
        ];
        let frame_b = [
            0x49, 0x02, 0x40, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46,
        ];
        let mut stream = frame_a.to_vec();
        stream.extend_from_slice(&frame_b);
        let events = feed(&mut scanner, &stream);
        assert_eq!(
            events,
            vec![
                ScanEvent::Frame(frame_a.to_vec()),
                ScanEvent::Frame(frame_b.to_vec())
            ]
        );
    }

    #[test]
    fn test_parity_conversions() {
        assert_eq!(to_serialport_parity("N"), serialport::Parity::None);
        assert_eq!(to_serialport_parity("e"), serialport::Parity::Even);
        assert_eq!(to_serialport_parity("odd"), serialport::Parity::Odd);
        assert_eq!(to_serialport_parity("bogus"), serialport::Parity::None);
    }
}
