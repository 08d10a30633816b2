use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use crate::{
    config::Config,
    lock::{self, ChannelLock, NoLock},
    timeout::{Clock, SystemClock},
    transport::{Drain, Transport, NEWLINE},
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A byte stream to the card, as exposed by a serial port driver.
pub trait SerialIo: Read + Write + Send {
    /// Number of received bytes waiting to be read.
    fn bytes_to_read(&mut self) -> io::Result<u32>;
}

#[cfg(feature = "serial")]
impl SerialIo for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        serialport::SerialPort::bytes_to_read(&**self).map_err(io::Error::from)
    }
}

/// Talks to the card over a UART-like serial line.
pub struct SerialTransport<P> {
    port: P,
    lock: Box<dyn ChannelLock>,
    clock: Arc<dyn Clock>,
    segment_max_len: usize,
    segment_delay: Duration,
    poll_interval: Duration,
    reset_drain: Duration,
    reset_retries: u32,
    lock_attempts: u32,
}

#[cfg(feature = "serial")]
impl SerialTransport<Box<dyn serialport::SerialPort>> {
    /// Open a serial device and guard it with a lock file so that other
    /// processes using this crate do not interleave with our transactions.
    pub fn open(path: &str, baud_rate: u32, config: &Config) -> Result<Self, crate::Error> {
        log::debug!("Opening serial device {} at {} baud", path, baud_rate);

        let mut port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(10))
            .open()?;

        port.set_flow_control(serialport::FlowControl::None)?;
        port.set_data_bits(serialport::DataBits::Eight)?;
        port.set_parity(serialport::Parity::None)?;
        port.set_stop_bits(serialport::StopBits::One)?;

        let lock = crate::lock::FileLock::for_port(path)?;
        log::trace!("Using lock file {}", lock.path().display());

        Ok(Self::new(port, config).with_lock(lock))
    }
}

impl<P: SerialIo> SerialTransport<P> {
    /// Wrap an open port. No channel lock is used until [`Self::with_lock`].
    pub fn new(port: P, config: &Config) -> Self {
        let lock_attempts = (config.lock_timeout().as_millis() / LOCK_POLL_INTERVAL.as_millis())
            .max(1) as u32;
        Self {
            port,
            lock: Box::new(NoLock),
            clock: Arc::new(SystemClock::new()),
            segment_max_len: config.segment_max_len.max(1),
            segment_delay: config.segment_delay(),
            poll_interval: config.poll_interval(),
            reset_drain: config.reset_drain(),
            reset_retries: config.reset_retries.max(1),
            lock_attempts,
        }
    }

    pub fn with_lock(mut self, lock: impl ChannelLock + 'static) -> Self {
        self.lock = Box::new(lock);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn bytes_waiting(&mut self) -> Result<usize, crate::Error> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_byte(&mut self) -> Result<Option<u8>, crate::Error> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read everything the card sends until it stays quiet for a full drain
    /// window.
    fn drain(&mut self) -> Result<Drain, crate::Error> {
        let mut drain = Drain::default();
        let mut start = self.clock.now();

        while !self.clock.has_timed_out(start, self.reset_drain) {
            let mut received = false;
            while self.bytes_waiting()? > 0 {
                let Some(byte) = self.read_byte()? else {
                    break;
                };
                drain.observe(&[byte]);
                received = true;
            }

            if received {
                start = self.clock.now();
            } else {
                self.clock.sleep(self.poll_interval);
            }
        }

        Ok(drain)
    }
}

impl<P: SerialIo> Transport for SerialTransport<P> {
    fn transmit(&mut self, data: &[u8], delay: bool) -> Result<(), crate::Error> {
        for (index, segment) in data.chunks(self.segment_max_len).enumerate() {
            if index > 0 && delay {
                self.clock.sleep(self.segment_delay);
            }
            self.port.write_all(segment)?;
            self.port.flush()?;
        }
        log::trace!("Transmitted {} byte(s)", data.len());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration, delay: bool) -> Result<Vec<u8>, crate::Error> {
        let mut line = Vec::new();
        let mut start = self.clock.now();

        loop {
            if self.bytes_waiting()? == 0 {
                if self.clock.has_timed_out(start, timeout) {
                    return Err(crate::Error::Timeout(format!(
                        "no data from card for {} ms ({} byte(s) received)",
                        timeout.as_millis(),
                        line.len()
                    )));
                }
                // lazy until the first byte, greedy afterwards
                if delay && line.is_empty() {
                    self.clock.sleep(self.poll_interval);
                }
                continue;
            }

            let Some(byte) = self.read_byte()? else {
                continue;
            };
            start = self.clock.now();
            line.push(byte);
            if byte == NEWLINE {
                return Ok(line);
            }
        }
    }

    fn available(&mut self) -> Result<bool, crate::Error> {
        Ok(self.bytes_waiting()? > 0)
    }

    fn reset(&mut self) -> Result<(), crate::Error> {
        self.clock.sleep(self.segment_delay);

        for attempt in 1..=self.reset_retries {
            if let Err(e) = self.transmit(&[NEWLINE], false) {
                log::debug!("Reset attempt {} could not write: {}", attempt, e);
                continue;
            }

            match self.drain() {
                Ok(drain) if drain.in_sync() => {
                    log::debug!("Serial reset complete after {} attempt(s)", attempt);
                    return Ok(());
                }
                Ok(drain) => log::debug!("Reset attempt {}: {}", attempt, drain.describe()),
                Err(e) => log::debug!("Reset attempt {} could not read: {}", attempt, e),
            }
        }

        Err(crate::Error::ResetFailed(self.reset_retries))
    }

    fn lock(&mut self) -> Result<(), crate::Error> {
        lock::acquire(
            self.lock.as_ref(),
            self.clock.as_ref(),
            self.lock_attempts,
            LOCK_POLL_INTERVAL,
        )
    }

    fn unlock(&mut self) -> Result<(), crate::Error> {
        self.lock.unlock()
    }
}
