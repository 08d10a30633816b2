//! Serial-over-I2C.
//!
//! The card exposes a byte pipe through a tiny register protocol. A read is a
//! write of `[0x00, len]` followed by a read of `len + 2` bytes: the number of
//! bytes still waiting on the card, the number returned in this packet, then
//! the data. A write is the payload prefixed with its length.

use std::{sync::Arc, time::Duration};

use embedded_hal::i2c::{Error as _, I2c};

use crate::{
    config::Config,
    lock::{self, ChannelLock, NoLock},
    timeout::{Clock, SystemClock},
    transport::{Drain, Transport, NEWLINE},
};

/// Factory-default 7-bit address of the card.
pub const DEFAULT_ADDRESS: u8 = 0x17;

const HEADER_LEN: usize = 2;

fn bus_error(e: impl embedded_hal::i2c::Error) -> crate::Error {
    crate::Error::Transport(format!("i2c bus error: {:?}", e.kind()))
}

pub struct I2cTransport<B> {
    bus: B,
    address: u8,
    lock: Box<dyn ChannelLock>,
    clock: Arc<dyn Clock>,
    max_transfer: u8,
    segment_max_len: usize,
    segment_delay: Duration,
    chunk_delay: Duration,
    poll_interval: Duration,
    reset_drain: Duration,
    reset_retries: u32,
    lock_attempts: u32,
    lock_retry_delay: Duration,
}

impl<B: I2c> I2cTransport<B> {
    /// Talk to the card at [`DEFAULT_ADDRESS`]. Drivers sharing the bus inside
    /// one process should pass a common [`crate::lock::SharedLock`] through
    /// [`Self::with_lock`].
    pub fn new(bus: B, config: &Config) -> Self {
        Self {
            bus,
            address: DEFAULT_ADDRESS,
            lock: Box::new(NoLock),
            clock: Arc::new(SystemClock::new()),
            max_transfer: config.i2c_max_transfer.max(1),
            segment_max_len: config.segment_max_len.max(1),
            segment_delay: config.segment_delay(),
            chunk_delay: config.i2c_chunk_delay(),
            poll_interval: config.poll_interval(),
            reset_drain: config.reset_drain(),
            reset_retries: config.reset_retries.max(1),
            lock_attempts: config.i2c_lock_attempts,
            lock_retry_delay: config.i2c_lock_retry_delay(),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }

    pub fn with_lock(mut self, lock: impl ChannelLock + 'static) -> Self {
        self.lock = Box::new(lock);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn into_inner(self) -> B {
        self.bus
    }

    /// Ask for up to `len` bytes. Returns how many bytes the card still has
    /// queued after this packet, and the packet's data.
    fn read_packet(&mut self, len: u8) -> Result<(usize, Vec<u8>), crate::Error> {
        self.bus
            .write(self.address, &[0x00, len])
            .map_err(bus_error)?;

        let mut packet = vec![0u8; len as usize + HEADER_LEN];
        self.bus.read(self.address, &mut packet).map_err(bus_error)?;

        let available = packet[0] as usize;
        let returned = packet[1] as usize;
        if returned > len as usize {
            return Err(crate::Error::Transport(format!(
                "card returned {} bytes for a {} byte read",
                returned, len
            )));
        }
        packet.truncate(HEADER_LEN + returned);
        Ok((available, packet.split_off(HEADER_LEN)))
    }

    fn write_packet(&mut self, chunk: &[u8]) -> Result<(), crate::Error> {
        let mut packet = Vec::with_capacity(chunk.len() + 1);
        packet.push(chunk.len() as u8);
        packet.extend_from_slice(chunk);
        self.bus.write(self.address, &packet).map_err(bus_error)
    }

    fn next_read_len(&self, available: usize) -> u8 {
        available.min(self.max_transfer as usize) as u8
    }

    fn drain(&mut self) -> Result<Drain, crate::Error> {
        let mut drain = Drain::default();
        let mut available = 0;
        let mut start = self.clock.now();

        while !self.clock.has_timed_out(start, self.reset_drain) {
            let len = self.next_read_len(available);
            let (remaining, data) = self.read_packet(len)?;
            available = remaining;

            // a pending count with no bytes delivered is not progress
            if data.is_empty() {
                self.clock.sleep(self.poll_interval);
                continue;
            }
            drain.observe(&data);
            start = self.clock.now();
        }

        Ok(drain)
    }
}

impl<B: I2c + Send> Transport for I2cTransport<B> {
    fn transmit(&mut self, data: &[u8], delay: bool) -> Result<(), crate::Error> {
        let mut segment_len = 0;
        for chunk in data.chunks(self.max_transfer as usize) {
            self.clock.sleep(self.chunk_delay);
            self.write_packet(chunk)?;

            segment_len += chunk.len();
            if delay && segment_len >= self.segment_max_len {
                self.clock.sleep(self.segment_delay);
                segment_len = 0;
            }
        }
        log::trace!("Transmitted {} byte(s) over i2c", data.len());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration, delay: bool) -> Result<Vec<u8>, crate::Error> {
        let mut line = Vec::new();
        let mut terminated = false;
        let mut available = 0;
        let mut start = self.clock.now();

        loop {
            let len = self.next_read_len(available);
            let (remaining, data) = self.read_packet(len)?;
            available = remaining;

            if !data.is_empty() {
                terminated |= data.contains(&NEWLINE);
                line.extend_from_slice(&data);
                start = self.clock.now();

                // keep reading past the newline until the card has nothing left
                if available > 0 {
                    continue;
                }
            }

            if terminated && available == 0 {
                return Ok(line);
            }
            if self.clock.has_timed_out(start, timeout) {
                return Err(crate::Error::Timeout(format!(
                    "no newline from card within {} ms ({} byte(s) received)",
                    timeout.as_millis(),
                    line.len()
                )));
            }
            if delay {
                self.clock.sleep(self.poll_interval);
            }
        }
    }

    fn available(&mut self) -> Result<bool, crate::Error> {
        let (available, _) = self.read_packet(0)?;
        Ok(available > 0)
    }

    fn reset(&mut self) -> Result<(), crate::Error> {
        self.clock.sleep(self.segment_delay);

        for attempt in 1..=self.reset_retries {
            if let Err(e) = self.write_packet(&[NEWLINE]) {
                log::debug!("Reset attempt {} could not write: {}", attempt, e);
                continue;
            }

            match self.drain() {
                Ok(drain) if drain.in_sync() => {
                    log::debug!("I2C reset complete after {} attempt(s)", attempt);
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
            self.lock_retry_delay,
        )
    }

    fn unlock(&mut self) -> Result<(), crate::Error> {
        self.lock.unlock()
    }
}
