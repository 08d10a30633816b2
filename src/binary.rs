//! The card's binary store: a staging buffer for payloads too large or too
//! binary for the JSON channel.
//!
//! Payloads cross the wire COBS-encoded with `\n` as the excluded byte, so a
//! whole payload is one line. Each transfer is announced by a control request
//! carrying the MD5 of the raw payload, which the receiving side verifies.

use md5::{Digest, Md5};

use crate::{
    card::{Attempt, Channel, Notecard},
    cobs,
    request::{Request, Response},
    transport::NEWLINE,
};

const CARD_BINARY: &str = "card.binary";
const CARD_BINARY_PUT: &str = "card.binary.put";
const CARD_BINARY_GET: &str = "card.binary.get";

/// Store occupancy as reported by the card.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BinaryStatus {
    /// Bytes currently staged.
    pub length: usize,
    /// Capacity. Zero when the card has no binary store.
    pub max: usize,
}

impl BinaryStatus {
    fn from_response(response: &Response) -> Self {
        Self {
            length: response.get_u64("length").unwrap_or_default() as usize,
            max: response.get_u64("max").unwrap_or_default() as usize,
        }
    }

    pub fn remaining(&self) -> usize {
        self.max.saturating_sub(self.length)
    }
}

/// Lowercase hex MD5, as the card reports it.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

fn device_error(name: &str, response: &Response) -> crate::Error {
    crate::Error::Device(format!(
        "{}: {}",
        name,
        response.error().unwrap_or_default()
    ))
}

/// Ask for the store's status. An invalid store reads as empty.
fn query(channel: &mut Channel) -> Result<BinaryStatus, crate::Error> {
    match channel.request_locked(&Request::new(CARD_BINARY)) {
        Ok(response) if response.is_error() => Err(device_error(CARD_BINARY, &response)),
        Ok(response) => Ok(BinaryStatus::from_response(&response)),
        Err(crate::Error::BadBin(response)) => Ok(BinaryStatus {
            length: 0,
            ..BinaryStatus::from_response(&response)
        }),
        Err(e) => Err(e),
    }
}

fn clear(channel: &mut Channel) -> Result<(), crate::Error> {
    let response = channel.request_locked(&Request::new(CARD_BINARY).with("delete", true))?;
    if response.is_error() {
        return Err(device_error(CARD_BINARY, &response));
    }
    Ok(())
}

/// Announce and send one encoded payload. The caller holds the lock so
/// nothing can interleave between the control request and the payload.
fn put(channel: &mut Channel, encoded: &[u8], md5: &str, offset: usize) -> Result<(), crate::Error> {
    let mut request = Request::new(CARD_BINARY_PUT)
        .with("cobs", encoded.len())
        .with("status", md5);
    if offset > 0 {
        request.insert("offset", offset);
    }

    let response = channel.request_locked(&request)?;
    if response.is_error() {
        return Err(device_error(CARD_BINARY_PUT, &response));
    }

    let mut payload = Vec::with_capacity(encoded.len() + 1);
    payload.extend_from_slice(encoded);
    payload.push(NEWLINE);
    channel.transmit_raw(&payload, false)
}

/// Binary store operations on one card.
pub struct BinaryStore<'a> {
    card: &'a Notecard,
}

impl<'a> BinaryStore<'a> {
    pub(crate) fn new(card: &'a Notecard) -> Self {
        Self { card }
    }

    pub fn status(&self) -> Result<BinaryStatus, crate::Error> {
        self.card.exclusive(query)
    }

    /// Bytes currently staged; 0 when the store is invalid.
    pub fn length(&self) -> Result<usize, crate::Error> {
        self.status().map(|status| status.length)
    }

    /// Discard the store's contents.
    pub fn reset(&self) -> Result<(), crate::Error> {
        self.card.exclusive(clear)
    }

    /// Append `data` to the store. `offset` must equal the store's current
    /// length.
    pub fn transmit(&self, data: &[u8], offset: usize) -> Result<(), crate::Error> {
        let retries = self.card.config().binary_retries;

        self.card.exclusive(|channel| {
            // an invalid store is about to be overwritten
            let status = query(channel)?;
            if status.max == 0 {
                return Err(crate::Error::Precondition(
                    "card reports no binary store capacity".to_string(),
                ));
            }
            if offset != status.length {
                return Err(crate::Error::Precondition(format!(
                    "offset {} does not match the {} byte(s) already stored",
                    offset, status.length
                )));
            }
            if data.len() > status.remaining() {
                return Err(crate::Error::Precondition(format!(
                    "{} byte(s) do not fit in the {} byte(s) remaining of {}",
                    data.len(),
                    status.remaining(),
                    status.max
                )));
            }

            let encoded = cobs::encode(data, NEWLINE);
            let md5 = md5_hex(data);

            for attempt in 0..=retries {
                put(channel, &encoded, &md5, offset)?;
                match query_staged(channel) {
                    Attempt::Complete(_) => {
                        log::debug!("Staged {} byte(s) at offset {}", data.len(), offset);
                        return Ok(());
                    }
                    Attempt::Retry(e) => {
                        log::warn!("Staging attempt {}/{} failed: {}", attempt + 1, retries + 1, e)
                    }
                    Attempt::Abort(e) => return Err(e),
                }
            }

            Err(crate::Error::BinaryTransmitFailed(format!(
                "card rejected {} byte(s) at offset {} after {} attempts",
                data.len(),
                offset,
                retries + 1
            )))
        })
    }

    /// Read `length` bytes starting at `offset`, verified against the MD5 the
    /// card reports.
    pub fn receive(&self, offset: usize, length: usize) -> Result<Vec<u8>, crate::Error> {
        let request = Request::new(CARD_BINARY_GET)
            .with("offset", offset)
            .with("length", length);

        let (response, mut encoded) = self.card.exclusive(|channel| {
            let response = channel.request_locked(&request)?;
            if response.is_error() {
                return Err(device_error(CARD_BINARY_GET, &response));
            }
            let encoded = channel.receive_raw(false)?;
            Ok((response, encoded))
        })?;

        if encoded.last() == Some(&NEWLINE) {
            encoded.pop();
        }
        let data = cobs::decode(&encoded, NEWLINE);

        let expected = response.get_str("status").unwrap_or_default().to_string();
        let computed = md5_hex(&data);
        if !expected.eq_ignore_ascii_case(&computed) {
            return Err(crate::Error::ChecksumMismatch { expected, computed });
        }
        Ok(data)
    }

    /// Replace the store's contents with `data` for relaying. Retried as a
    /// whole, clearing the store each time, until the card reports exactly
    /// `data.len()` bytes staged. Returns the payload's MD5.
    pub(crate) fn stage(&self, data: &[u8]) -> Result<String, crate::Error> {
        let attempts = self.card.config().stage_retries.max(1);
        let encoded = cobs::encode(data, NEWLINE);
        let md5 = md5_hex(data);
        let mut cause = None;

        for attempt in 1..=attempts {
            let outcome = self.card.exclusive(|channel| {
                clear(channel)?;
                put(channel, &encoded, &md5, 0)?;
                Ok(query_staged(channel))
            });

            let e = match outcome {
                Ok(Attempt::Complete(status)) if status.length == data.len() => return Ok(md5),
                Ok(Attempt::Complete(status)) => crate::Error::BinaryTransmitFailed(format!(
                    "card staged {} byte(s), expected {}",
                    status.length,
                    data.len()
                )),
                Ok(Attempt::Retry(e)) => e,
                Ok(Attempt::Abort(e)) if is_staging_retryable(&e) => e,
                Ok(Attempt::Abort(e)) => return Err(e),
                Err(e) if is_staging_retryable(&e) => e,
                Err(e) => return Err(e),
            };
            log::warn!("Staging chunk failed (attempt {}/{}): {}", attempt, attempts, e);
            cause = Some(e);
        }

        Err(crate::Error::BinaryTransmitFailed(match cause {
            Some(e) => format!("{} byte chunk after {} attempts: {}", data.len(), attempts, e),
            None => format!("{} byte chunk after {} attempts", data.len(), attempts),
        }))
    }
}

/// Re-query the store after a put. An invalid store means the payload did
/// not arrive intact.
fn query_staged(channel: &mut Channel) -> Attempt<BinaryStatus> {
    match channel.request_locked(&Request::new(CARD_BINARY)) {
        Ok(response) if response.is_error() => {
            Attempt::Abort(device_error(CARD_BINARY, &response))
        }
        Ok(response) => Attempt::Complete(BinaryStatus::from_response(&response)),
        Err(crate::Error::BadBin(response)) => Attempt::Retry(crate::Error::BadBin(response)),
        Err(e) if e.is_transport() => Attempt::Retry(e),
        Err(e) => Attempt::Abort(e),
    }
}

fn is_staging_retryable(e: &crate::Error) -> bool {
    e.is_transport()
        || matches!(
            e,
            crate::Error::BadBin(_)
                | crate::Error::TransactFailed(_)
                | crate::Error::Integrity(_)
                | crate::Error::Serialization(_)
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn md5_matches_reference_digests() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            md5_hex(b"The quick brown fox jumps over the lazy dog"),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[test]
    fn status_reads_length_and_capacity() {
        let response: Response =
            serde_json::from_value(json!({"length": 300, "max": 1024})).unwrap();
        let status = BinaryStatus::from_response(&response);
        assert_eq!(status, BinaryStatus { length: 300, max: 1024 });
        assert_eq!(status.remaining(), 724);

        assert_eq!(BinaryStatus::from_response(&Response::default()).max, 0);
    }
}
