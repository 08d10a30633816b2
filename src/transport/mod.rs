//! Byte-level access to the card.
//!
//! A [`Transport`] moves raw bytes and knows the pacing, chunking and reset
//! rules of its physical channel. It has no notion of JSON, sequence numbers
//! or retries; that belongs to [`crate::card`].

use std::time::Duration;

pub mod i2c;
pub mod serial;

pub use i2c::I2cTransport;
pub use serial::SerialTransport;

pub(crate) const NEWLINE: u8 = b'\n';
pub(crate) const CARRIAGE_RETURN: u8 = b'\r';

pub trait Transport: Send {
    /// Write `data`. With `delay`, pause between segments so the card's small
    /// receive buffer is not overrun; callers that already pace their payload
    /// pass `false`.
    fn transmit(&mut self, data: &[u8], delay: bool) -> Result<(), crate::Error>;

    /// Read one newline-terminated line, terminator included. Fails with
    /// [`crate::Error::Timeout`] when nothing arrives for `timeout`. With
    /// `delay`, idle polls sleep instead of spinning.
    fn receive(&mut self, timeout: Duration, delay: bool) -> Result<Vec<u8>, crate::Error>;

    /// Whether the card has bytes waiting.
    fn available(&mut self) -> Result<bool, crate::Error>;

    /// Resynchronize with the card: send a newline and drain until only line
    /// terminators come back. The caller holds the channel lock.
    fn reset(&mut self) -> Result<(), crate::Error>;

    /// Take the channel for exclusive use.
    fn lock(&mut self) -> Result<(), crate::Error>;

    fn unlock(&mut self) -> Result<(), crate::Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, data: &[u8], delay: bool) -> Result<(), crate::Error> {
        (**self).transmit(data, delay)
    }

    fn receive(&mut self, timeout: Duration, delay: bool) -> Result<Vec<u8>, crate::Error> {
        (**self).receive(timeout, delay)
    }

    fn available(&mut self) -> Result<bool, crate::Error> {
        (**self).available()
    }

    fn reset(&mut self) -> Result<(), crate::Error> {
        (**self).reset()
    }

    fn lock(&mut self) -> Result<(), crate::Error> {
        (**self).lock()
    }

    fn unlock(&mut self) -> Result<(), crate::Error> {
        (**self).unlock()
    }
}

/// What came back from the card during one reset drain window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Drain {
    pub seen: bool,
    pub noise: bool,
}

impl Drain {
    pub fn observe(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.seen = true;
        if bytes
            .iter()
            .any(|&b| b != NEWLINE && b != CARRIAGE_RETURN)
        {
            self.noise = true;
        }
    }

    /// The card echoed only line terminators: both sides are in sync.
    pub fn in_sync(&self) -> bool {
        self.seen && !self.noise
    }

    pub fn describe(&self) -> &'static str {
        match (self.seen, self.noise) {
            (false, _) => "card not responding to newline",
            (true, true) => "received non-control characters from card",
            (true, false) => "in sync",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_requires_only_terminators() {
        let mut drain = Drain::default();
        assert!(!drain.in_sync());

        drain.observe(b"\r\n");
        assert!(drain.in_sync());

        drain.observe(b"{}");
        assert!(!drain.in_sync());
        assert_eq!(drain.describe(), "received non-control characters from card");
    }
}
