//! Host-side driver for the Notecard.
//!
//! The card speaks newline-delimited JSON over a serial port or over a
//! register-windowed I2C protocol. This crate provides the transaction engine
//! that frames, sequences, integrity-checks, retries and resets those
//! exchanges ([`Notecard`]), the binary store protocol used to move raw
//! payloads through the card ([`BinaryStore`]), and chunked uploads relayed to
//! a remote route ([`Upload`]).
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # fn main() -> Result<(), notecard::Error> {
//! use notecard::{transport::serial::SerialTransport, Config, Notecard, Request};
//!
//! let config = Config::default();
//! let transport = SerialTransport::open("/dev/ttyACM0", 9600, &config)?;
//! let card = Notecard::builder(transport).config(config).open()?;
//!
//! let response = card.transact(&Request::new("card.version"))?;
//! println!("{:?}", response);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serial"))]
//! # fn main() {}
//! ```

pub mod binary;
pub mod card;
pub mod cobs;
pub mod config;
pub mod crc;
pub mod handshake;
pub mod lock;
pub mod request;
pub mod timeout;
pub mod transport;
pub mod upload;

pub use binary::{BinaryStatus, BinaryStore};
pub use card::{DeviceState, Notecard, NotecardBuilder, Session};
pub use config::Config;
pub use request::{Request, Response};
pub use upload::{Progress, Upload, UploadStats};

/// Errors produced while talking to the card.
///
/// Device-reported domain errors are not represented here: they come back as
/// the `err` field of a normal [`Response`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("failed to acquire channel lock: {0}")]
    Lock(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("binary store invalid: {}", .0.error().unwrap_or("{bad-bin}"))]
    BadBin(Box<Response>),
    #[error("device error: {0}")]
    Device(String),
    #[error("{0}")]
    Precondition(String),
    #[error("failed to reset notecard after {0} attempts")]
    ResetFailed(u32),
    #[error("failed to transact with notecard: {0}")]
    TransactFailed(String),
    #[error("failed to transmit binary data: {0}")]
    BinaryTransmitFailed(String),
    #[error("md5 mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures of the physical channel, which warrant a reset
    /// before the next attempt.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::Lock(_) | Error::ResetFailed(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::Timeout(e.to_string()),
            _ => Error::Transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(feature = "serial")]
impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Transport(format!("serialport error: {}", e))
    }
}
