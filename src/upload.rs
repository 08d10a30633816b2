//! Chunked upload of a payload to a remote route.
//!
//! The payload is cut into chunks that fit the card's binary store. Each chunk
//! is staged in the store and then relayed with a `web.post` that references
//! it; the remote side reassembles the chunks from their offsets.

use std::time::Duration;

use crate::{
    card::Notecard,
    request::{Request, Response},
};

const WEB_POST: &str = "web.post";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Reported after every chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// 1-based.
    pub chunk_index: usize,
    pub chunk_count: usize,
    pub bytes_sent: usize,
    pub total_bytes: usize,
    pub percent: f64,
    /// Throughput of the last chunk, bytes per second.
    pub instant_bps: f64,
    /// Throughput since the upload began, bytes per second.
    pub average_bps: f64,
    /// Time remaining at the average rate; zero while the rate is unknown.
    pub eta: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadStats {
    pub bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
    pub average_bps: f64,
}

fn rate(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// An upload to one route.
///
/// ```no_run
/// # fn upload(card: &notecard::Notecard, image: &[u8]) -> Result<(), notecard::Error> {
/// let stats = notecard::Upload::new("images")
///     .content_type("image/jpeg")
///     .max_chunk_size(64 * 1024)
///     .progress(|p| println!("{:.0}%", p.percent))
///     .send(card, image)?;
/// println!("sent {} bytes in {} chunks", stats.bytes, stats.chunks);
/// # Ok(())
/// # }
/// ```
pub struct Upload<'a> {
    route: String,
    max_chunk_size: Option<usize>,
    content_type: String,
    name: Option<String>,
    label: Option<String>,
    progress: Option<Box<dyn FnMut(&Progress) + 'a>>,
}

impl<'a> Upload<'a> {
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            max_chunk_size: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            name: None,
            label: None,
            progress: None,
        }
    }

    /// Upper bound on chunk size. The store's capacity still applies.
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Target name passed through to the route, e.g. a file name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn progress(mut self, callback: impl FnMut(&Progress) + 'a) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Effective chunk size for a store of `capacity` bytes.
    pub fn chunk_size(&self, capacity: usize) -> usize {
        match self.max_chunk_size {
            Some(ceiling) if ceiling > 0 => ceiling.min(capacity),
            _ => capacity,
        }
    }

    pub fn send(mut self, card: &Notecard, data: &[u8]) -> Result<UploadStats, crate::Error> {
        if data.is_empty() {
            return Err(crate::Error::Precondition("nothing to upload".to_string()));
        }

        let store = card.binary();
        match store.reset() {
            Ok(()) | Err(crate::Error::BadBin(_)) => {}
            Err(e) => return Err(e),
        }

        let capacity = store.status()?.max;
        if capacity == 0 {
            return Err(crate::Error::Precondition(
                "card reports no binary store capacity".to_string(),
            ));
        }

        let chunk_size = self.chunk_size(capacity);
        let chunk_count = data.len().div_ceil(chunk_size);
        log::debug!(
            "Uploading {} byte(s) to {:?} in {} chunk(s) of up to {} byte(s)",
            data.len(),
            self.route,
            chunk_count,
            chunk_size
        );

        let clock = card.clock().clone();
        let start = clock.now();

        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            let offset = index * chunk_size;
            let chunk_start = clock.now();

            self.send_chunk(card, chunk, offset, data.len(), chunk_count)?;

            let bytes_sent = offset + chunk.len();
            let average_bps = rate(bytes_sent, clock.elapsed(start));
            let remaining = data.len() - bytes_sent;
            let progress = Progress {
                chunk_index: index + 1,
                chunk_count,
                bytes_sent,
                total_bytes: data.len(),
                percent: bytes_sent as f64 * 100.0 / data.len() as f64,
                instant_bps: rate(chunk.len(), clock.elapsed(chunk_start)),
                average_bps,
                eta: if average_bps > 0.0 {
                    Duration::from_secs_f64(remaining as f64 / average_bps)
                } else {
                    Duration::ZERO
                },
            };
            log::debug!(
                "Chunk {}/{} sent ({:.1}%)",
                progress.chunk_index,
                chunk_count,
                progress.percent
            );
            if let Some(callback) = self.progress.as_mut() {
                callback(&progress);
            }
        }

        let elapsed = clock.elapsed(start);
        Ok(UploadStats {
            bytes: data.len(),
            chunks: chunk_count,
            elapsed,
            average_bps: rate(data.len(), elapsed),
        })
    }

    fn send_chunk(
        &self,
        card: &Notecard,
        chunk: &[u8],
        offset: usize,
        total: usize,
        chunk_count: usize,
    ) -> Result<(), crate::Error> {
        let attempts = card.config().post_retries.max(1);
        let mut cause = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                card.clock().sleep(card.config().post_retry_delay());
            }

            let md5 = card.binary().stage(chunk)?;
            let request = self.post_request(offset, &md5, total, chunk_count);

            cause = match card.request(&request) {
                Ok(response) if posted(&response) => return Ok(()),
                Ok(response) => match response.error() {
                    Some(err) => err.to_string(),
                    None => format!(
                        "result {}",
                        response.get("result").cloned().unwrap_or_default()
                    ),
                },
                Err(e @ (crate::Error::Precondition(_) | crate::Error::InvalidRequest(_))) => {
                    return Err(e)
                }
                Err(e) => e.to_string(),
            };
            log::warn!(
                "Posting chunk at offset {} failed (attempt {}/{}): {}",
                offset,
                attempt,
                attempts,
                cause
            );
        }

        Err(crate::Error::UploadFailed(format!(
            "chunk at offset {} not accepted by {:?} after {} attempts: {}",
            offset, self.route, attempts, cause
        )))
    }

    fn post_request(&self, offset: usize, md5: &str, total: usize, chunk_count: usize) -> Request {
        let mut request = Request::new(WEB_POST)
            .with("route", self.route.as_str())
            .with("binary", true)
            .with("content", self.content_type.as_str())
            .with("offset", offset)
            .with("status", md5);
        if chunk_count > 1 {
            request.insert("total", total);
        }
        if let Some(name) = &self.name {
            request.insert("name", name.as_str());
        }
        if let Some(label) = &self.label {
            request.insert("label", label.as_str());
        }
        request
    }
}

/// The route accepted the chunk: no error, and a 2xx result if one is given.
fn posted(response: &Response) -> bool {
    if response.is_error() {
        return false;
    }
    match response.get("result") {
        None => true,
        Some(result) => result
            .as_u64()
            .is_some_and(|code| (200..300).contains(&code)),
    }
}
