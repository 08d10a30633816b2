//! Optional ready-to-transact / clear-to-transact GPIO handshake.
//!
//! When the host wires two GPIO lines to the card, every transaction is
//! bracketed by [`TransactionManager::start`] and [`TransactionManager::stop`]:
//! the host raises RTX and waits for the card to raise CTX before talking.

use std::{sync::Arc, time::Duration};

use crate::timeout::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pull {
    None,
    Up,
    Down,
}

/// A GPIO line as needed by the handshake.
pub trait Pin: Send {
    fn set_direction(&mut self, direction: Direction) -> Result<(), crate::Error>;
    fn set_pull(&mut self, pull: Pull) -> Result<(), crate::Error>;
    fn set_high(&mut self, high: bool) -> Result<(), crate::Error>;
    fn is_high(&mut self) -> Result<bool, crate::Error>;
}

pub trait TransactionManager: Send {
    /// Wait until the card signals it is ready, or fail after `timeout`.
    fn start(&mut self, timeout: Duration) -> Result<(), crate::Error>;

    /// Release the lines. Must be safe to call after a failed `start`.
    fn stop(&mut self) -> Result<(), crate::Error>;
}

/// Used when no handshake lines are wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpTransactionManager;

impl TransactionManager for NoOpTransactionManager {
    fn start(&mut self, _timeout: Duration) -> Result<(), crate::Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), crate::Error> {
        Ok(())
    }
}

pub struct GpioTransactionManager<R, C> {
    rtx: R,
    ctx: C,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<R: Pin, C: Pin> GpioTransactionManager<R, C> {
    pub fn new(rtx: R, ctx: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            rtx,
            ctx,
            clock,
            poll_interval: Duration::from_millis(1),
        }
    }

    pub fn into_pins(self) -> (R, C) {
        (self.rtx, self.ctx)
    }
}

impl<R: Pin, C: Pin> TransactionManager for GpioTransactionManager<R, C> {
    fn start(&mut self, timeout: Duration) -> Result<(), crate::Error> {
        self.rtx.set_direction(Direction::Output)?;
        self.rtx.set_high(true)?;
        // with the pull-up, a card that ignores RTX still reads as clear
        self.ctx.set_direction(Direction::Input)?;
        self.ctx.set_pull(Pull::Up)?;

        let start = self.clock.now();
        loop {
            if self.ctx.is_high()? {
                return Ok(());
            }
            if self.clock.has_timed_out(start, timeout) {
                break;
            }
            self.clock.sleep(self.poll_interval);
        }

        if let Err(e) = self.stop() {
            log::warn!("Failed to release handshake lines: {}", e);
        }
        Err(crate::Error::Timeout(
            "card did not assert clear-to-transact".to_string(),
        ))
    }

    fn stop(&mut self) -> Result<(), crate::Error> {
        self.rtx.set_direction(Direction::Input)?;
        self.ctx.set_pull(Pull::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeout::ManualClock;
    use std::sync::Mutex;

    #[derive(Clone, Debug, Default)]
    struct FakePin {
        log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
        level: Arc<Mutex<bool>>,
    }

    impl FakePin {
        fn record(&self, event: String) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
        }
    }

    impl Pin for FakePin {
        fn set_direction(&mut self, direction: Direction) -> Result<(), crate::Error> {
            self.record(format!("{:?}", direction));
            Ok(())
        }

        fn set_pull(&mut self, pull: Pull) -> Result<(), crate::Error> {
            self.record(format!("pull-{:?}", pull));
            Ok(())
        }

        fn set_high(&mut self, high: bool) -> Result<(), crate::Error> {
            self.record(format!("high={}", high));
            Ok(())
        }

        fn is_high(&mut self) -> Result<bool, crate::Error> {
            Ok(*self.level.lock().unwrap())
        }
    }

    fn pins(ctx_high: bool) -> (FakePin, FakePin, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let rtx = FakePin { log: log.clone(), name: "rtx", ..Default::default() };
        let ctx = FakePin {
            log: log.clone(),
            name: "ctx",
            level: Arc::new(Mutex::new(ctx_high)),
        };
        (rtx, ctx, log)
    }

    #[test]
    fn start_raises_rtx_and_waits_for_ctx() {
        let (rtx, ctx, log) = pins(true);
        let mut manager = GpioTransactionManager::new(rtx, ctx, Arc::new(ManualClock::default()));

        manager.start(Duration::from_secs(1)).unwrap();
        manager.stop().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "rtx:Output",
                "rtx:high=true",
                "ctx:Input",
                "ctx:pull-Up",
                "rtx:Input",
                "ctx:pull-None",
            ]
        );
    }

    #[test]
    fn start_times_out_and_releases_lines() {
        let (rtx, ctx, log) = pins(false);
        let clock = Arc::new(ManualClock::default());
        let mut manager = GpioTransactionManager::new(rtx, ctx, clock.clone());

        let result = manager.start(Duration::from_millis(50));
        assert!(matches!(result, Err(crate::Error::Timeout(_))));
        assert!(clock.millis() >= 50);

        let log = log.lock().unwrap();
        assert_eq!(log[log.len() - 2..], ["rtx:Input", "ctx:pull-None"]);
    }
}
