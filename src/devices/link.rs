use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, error, info, warn};

use crate::config::PortSource;
use crate::error::{Result, StationError};

pub const BAUD_RATE: u32 = 4800;
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
pub const OPEN_ATTEMPTS: u32 = 3;
pub const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Unterminated input beyond this is discarded
pub const MAX_LINE_BYTES: usize = 4096;

/// Exclusive line-oriented connection to the instrument.
///
/// `read_line` returns `Ok(None)` when the timeout elapses without a complete
/// line; that is the normal "still waiting" case. `Err` is reserved for real
/// faults.
pub trait SerialLink: Send {
    fn open(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    /// Writes one already framed line.
    fn write_line(&mut self, line: &[u8]) -> Result<()>;
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;
    fn close(&mut self);
}

/// Fixed port parameters of the breathalyzer
#[derive(Debug, Clone, PartialEq)]
pub struct SerialEndpoint {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub read_timeout: Duration,
}

impl SerialEndpoint {
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate: BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: READ_TIMEOUT,
        }
    }

    fn open(&self) -> serialport::Result<Box<dyn SerialPort>> {
        serialport::new(self.port_name.clone(), self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .timeout(self.read_timeout)
            .open()
    }
}

/// Serial link backed by a real port.
pub struct BreathalyzerPort<P> {
    port: Option<Box<dyn SerialPort>>,
    source: P,
    read_buf: Vec<u8>,
    open_attempts: u32,
    retry_delay: Duration,
}

impl<P: PortSource> BreathalyzerPort<P> {
    pub fn new(source: P) -> Self {
        Self {
            port: None,
            source,
            read_buf: Vec::with_capacity(128),
            open_attempts: OPEN_ATTEMPTS,
            retry_delay: OPEN_RETRY_DELAY,
        }
    }

    /// Overrides how many times `open` tries the port and how long it waits between tries
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.open_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Index of the first linefeed in the read buffer, searching from `start`
    fn find_line_ending(&self, start: usize) -> Option<usize> {
        self.read_buf
            .iter()
            .skip(start)
            .position(|byte| *byte == b'\n')
            .map(|offset| start + offset)
    }

    /// Appends received bytes and returns the first complete line, if any
    fn absorb(&mut self, bytes: &[u8], searched: usize) -> Option<String> {
        self.read_buf.extend_from_slice(bytes);
        if let Some(end) = self.find_line_ending(searched) {
            return Some(self.take_line(end));
        }
        if self.read_buf.len() > MAX_LINE_BYTES {
            warn!(
                "Discarding {} bytes of unterminated input from breathalyzer",
                self.read_buf.len()
            );
            self.read_buf.clear();
        }
        None
    }

    fn take_line(&mut self, end: usize) -> String {
        let line: Vec<u8> = self.read_buf.drain(..=end).collect();
        String::from_utf8_lossy(&line).trim().to_string()
    }
}

impl<P: PortSource> SerialLink for BreathalyzerPort<P> {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            error!("Attempted to open the breathalyzer port while it is already open");
            return Err(StationError::LinkAlreadyOpen);
        }

        let mut last_port = String::new();
        let mut last_error = String::new();
        for attempt in 1..=self.open_attempts {
            // Re-read on every attempt so a port changed in the settings is picked up
            let port_name = self.source.current_port()?;
            let endpoint = SerialEndpoint::new(&port_name);
            info!("Attempting to open breathalyzer port {} ({} baud)", port_name, endpoint.baud_rate);

            match endpoint.open() {
                Ok(port) => {
                    info!("Breathalyzer port {} opened", port_name);
                    self.port = Some(port);
                    self.read_buf.clear();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{}: failed to open port {}: {}",
                        attempt, self.open_attempts, port_name, e
                    );
                    last_port = port_name;
                    last_error = e.to_string();
                    if attempt < self.open_attempts {
                        thread::sleep(self.retry_delay);
                    }
                }
            }
        }

        error!("Giving up on port {} after {} attempts", last_port, self.open_attempts);
        Err(StationError::PortUnavailable {
            port: last_port,
            attempts: self.open_attempts,
            reason: last_error,
        })
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write_line(&mut self, line: &[u8]) -> Result<()> {
        if let Some(port) = &mut self.port {
            info!("Sending command to breathalyzer: {}", String::from_utf8_lossy(line).trim());
            port.write_all(line)?;
            port.flush()?;
            Ok(())
        } else {
            error!("Attempted to write to breathalyzer but port is not open");
            Err(StationError::LinkNotOpen)
        }
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        if let Some(end) = self.find_line_ending(0) {
            return Ok(Some(self.take_line(end)));
        }

        let deadline = Instant::now() + timeout;
        let mut searched = self.read_buf.len();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("No complete line from breathalyzer within {:?}", timeout);
                return Ok(None);
            }

            let port = self.port.as_mut().ok_or_else(|| {
                error!("Attempted to read from breathalyzer but port is not open");
                StationError::LinkNotOpen
            })?;
            port.set_timeout(remaining)?;

            let mut chunk = [0u8; 64];
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    if let Some(line) = self.absorb(&chunk[..n], searched) {
                        info!("Received response from breathalyzer: {}", line);
                        return Ok(Some(line));
                    }
                    searched = self.read_buf.len();
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    debug!("Breathalyzer read timed out");
                    return Ok(None);
                }
                Err(e) => {
                    error!("Failed to read from breathalyzer: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Breathalyzer port closed");
        }
        self.read_buf.clear();
    }
}
