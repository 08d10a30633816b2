//! The transaction engine.
//!
//! A [`Notecard`] owns one transport and serializes every exchange with the
//! card through it. Each request is framed as one line of compact JSON; when a
//! response is expected the line carries a `"crc":"SSSS:CCCCCCCC"` field so
//! that the card can detect corruption and the host can match the response to
//! its request. Failed exchanges are retried, with a channel reset after
//! transport failures.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde_json::{Map, Value};

use crate::{
    binary::BinaryStore,
    config::Config,
    crc::crc32,
    handshake::{NoOpTransactionManager, TransactionManager},
    request::{Request, Response, TAG_BAD_BIN, TAG_IO, TAG_NOT_SUPPORTED},
    timeout::{Clock, SystemClock},
    transport::{Transport, NEWLINE},
};

const HUB_SET: &str = "hub.set";
const CRC_KEY: &[u8] = br#""crc":""#;

/// Mutable per-handle protocol state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceState {
    /// Sequence number of the next request.
    pub sequence: u16,
    /// The channel must be resynchronized before the next exchange.
    pub reset_required: bool,
    /// The card has been seen answering with an integrity field. Once set,
    /// responses without one are rejected.
    pub crc_supported: bool,
    pub user_agent_sent: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            sequence: 0,
            reset_required: true,
            crc_supported: false,
            user_agent_sent: false,
        }
    }
}

/// Outcome of one try of a retried operation.
#[derive(Debug)]
pub(crate) enum Attempt<T> {
    Complete(T),
    Retry(crate::Error),
    Abort(crate::Error),
}

/// Everything guarded by the handle's mutex.
pub(crate) struct Channel {
    transport: Box<dyn Transport>,
    manager: Box<dyn TransactionManager>,
    clock: Arc<dyn Clock>,
    config: Config,
    app: Map<String, Value>,
    state: DeviceState,
}

impl Channel {
    /// Run `f` with the transport's channel lock held. The lock is released
    /// whatever `f` returns.
    pub(crate) fn with_lock<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, crate::Error>,
    ) -> Result<T, crate::Error> {
        self.transport.lock()?;
        let result = f(self);
        if let Err(e) = self.transport.unlock() {
            log::warn!("Failed to release channel lock: {}", e);
        }
        result
    }

    /// Bracket one transport phase with the handshake.
    fn bracket<T>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut dyn Transport) -> Result<T, crate::Error>,
    ) -> Result<T, crate::Error> {
        self.manager.start(timeout)?;
        let result = f(self.transport.as_mut());
        if let Err(e) = self.manager.stop() {
            log::warn!("Failed to end handshake: {}", e);
        }
        result
    }

    /// Resynchronize the channel. The caller holds the channel lock.
    pub(crate) fn reset_transport(&mut self) -> Result<(), crate::Error> {
        log::debug!("Resetting channel to card");
        match self.transport.reset() {
            Ok(()) => {
                self.state.reset_required = false;
                Ok(())
            }
            Err(e) => {
                self.state.reset_required = true;
                Err(e)
            }
        }
    }

    /// Send one request or command. The caller holds the channel lock. The
    /// sequence number advances once per call, whatever the outcome.
    pub(crate) fn transact_locked(
        &mut self,
        request: &Request,
    ) -> Result<Option<Response>, crate::Error> {
        let result = self.transact_unsequenced(request);
        self.state.sequence = self.state.sequence.wrapping_add(1);
        result
    }

    /// Send a request and require a response.
    pub(crate) fn request_locked(&mut self, request: &Request) -> Result<Response, crate::Error> {
        if !request.expects_response() {
            return Err(crate::Error::InvalidRequest(format!(
                "{} is a command and has no response",
                request.name()
            )));
        }
        self.transact_locked(request)?.ok_or_else(|| {
            crate::Error::TransactFailed(format!("{}: no response", request.name()))
        })
    }

    /// Write raw bytes outside the JSON framing.
    pub(crate) fn transmit_raw(&mut self, data: &[u8], delay: bool) -> Result<(), crate::Error> {
        let timeout = self.config.inter_transaction_timeout();
        self.bracket(timeout, |transport| transport.transmit(data, delay))
    }

    /// Read one raw line outside the JSON framing. A failure leaves the
    /// channel out of sync.
    pub(crate) fn receive_raw(&mut self, delay: bool) -> Result<Vec<u8>, crate::Error> {
        let timeout = self.config.inter_transaction_timeout();
        let result = self.bracket(timeout, |transport| transport.receive(timeout, delay));
        if result.is_err() {
            self.state.reset_required = true;
        }
        result
    }

    fn transact_unsequenced(&mut self, request: &Request) -> Result<Option<Response>, crate::Error> {
        if self.state.reset_required {
            self.reset_transport()?;
        }

        let timeout = transaction_timeout(&self.config, request);
        let line = self.prepare(request)?;
        self.log_line(">>", &line);

        if request.expects_response() {
            self.exchange(request.name(), &line, timeout).map(Some)
        } else {
            self.send_command(request.name(), &line, timeout)
                .map(|()| None)
        }
    }

    /// Serialize `request` into the line sent to the card.
    fn prepare(&mut self, request: &Request) -> Result<Vec<u8>, crate::Error> {
        let mut body = request.body().clone();

        if request.name() == HUB_SET && !self.state.user_agent_sent {
            merge_user_agent(&mut body, user_agent(&self.app));
            self.state.user_agent_sent = true;
        }

        let mut line = serde_json::to_vec(&body)?;
        if request.expects_response() {
            let field = format!(
                r#","crc":"{:04X}:{:08X}""#,
                self.state.sequence,
                crc32(&line)
            );
            if line.last() == Some(&b'}') {
                line.pop();
                line.extend_from_slice(field.as_bytes());
                line.push(b'}');
            }
        }
        line.push(NEWLINE);
        Ok(line)
    }

    fn exchange(
        &mut self,
        name: &str,
        line: &[u8],
        timeout: Duration,
    ) -> Result<Response, crate::Error> {
        let sequence = self.state.sequence;
        let retries = self.config.transaction_retries.max(1);
        let mut cause = None;

        for attempt in 1..=retries {
            match self.attempt(line, sequence, timeout) {
                Attempt::Complete(response) => return Ok(response),
                Attempt::Abort(e) => return Err(e),
                Attempt::Retry(e) => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}",
                        name,
                        attempt,
                        retries,
                        e
                    );
                    if e.is_transport() {
                        if let Err(reset) = self.reset_transport() {
                            log::warn!("Reset after failed exchange did not complete: {}", reset);
                        }
                    }
                    if attempt < retries {
                        self.clock.sleep(self.config.retry_delay());
                    }
                    cause = Some(e);
                }
            }
        }

        self.state.reset_required = true;
        Err(crate::Error::TransactFailed(match cause {
            Some(e) => format!("{} after {} attempts: {}", name, retries, e),
            None => format!("{} after {} attempts", name, retries),
        }))
    }

    fn attempt(&mut self, line: &[u8], sequence: u16, timeout: Duration) -> Attempt<Response> {
        let received = self.bracket(timeout, |transport| {
            transport.transmit(line, true)?;
            transport.receive(timeout, true)
        });
        let received = match received {
            Ok(received) => received,
            Err(e) if e.is_transport() => return Attempt::Retry(e),
            Err(e) => return Attempt::Abort(e),
        };
        self.log_line("<<", &received);

        if let Err(e) = self.verify(&received, sequence) {
            return Attempt::Retry(e);
        }

        let response: Response = match serde_json::from_slice(&received) {
            Ok(response) => response,
            Err(e) => return Attempt::Retry(e.into()),
        };

        if response.has_error_tag(TAG_IO) && !response.has_error_tag(TAG_NOT_SUPPORTED) {
            let err = response.error().unwrap_or_default().to_string();
            return Attempt::Retry(crate::Error::Device(err));
        }
        if response.has_error_tag(TAG_BAD_BIN) {
            return Attempt::Abort(crate::Error::BadBin(Box::new(response)));
        }

        Attempt::Complete(response)
    }

    /// Check the response's integrity field against the request's sequence
    /// number and a fresh CRC of the rest of the line.
    fn verify(&mut self, received: &[u8], sequence: u16) -> Result<(), crate::Error> {
        let Some((stripped, field)) = split_crc_field(trim_end(received)) else {
            if self.state.crc_supported {
                return Err(crate::Error::Integrity(
                    "response is missing its crc field".to_string(),
                ));
            }
            return Ok(());
        };
        self.state.crc_supported = true;

        let (received_sequence, received_crc) = parse_crc_field(&field).ok_or_else(|| {
            crate::Error::Integrity(format!("malformed crc field {:?}", field))
        })?;
        if received_sequence != sequence {
            return Err(crate::Error::Integrity(format!(
                "sequence mismatch: sent {:04X}, received {:04X}",
                sequence, received_sequence
            )));
        }
        let computed = crc32(&stripped);
        if computed != received_crc {
            return Err(crate::Error::Integrity(format!(
                "crc mismatch: received {:08X}, computed {:08X}",
                received_crc, computed
            )));
        }
        Ok(())
    }

    fn send_command(&mut self, name: &str, line: &[u8], timeout: Duration) -> Result<(), crate::Error> {
        self.bracket(timeout, |transport| transport.transmit(line, true))
            .map_err(|e| {
                self.state.reset_required = true;
                crate::Error::TransactFailed(format!("{}: {}", name, e))
            })
    }

    fn log_line(&self, direction: &str, line: &[u8]) {
        let text = String::from_utf8_lossy(trim_end(line));
        if self.config.debug {
            log::debug!("{} {}", direction, text);
        } else {
            log::trace!("{} {}", direction, text);
        }
    }
}

/// How long to wait for the response to `request`.
fn transaction_timeout(config: &Config, request: &Request) -> Duration {
    let name = request.name();
    let web = name.starts_with("web.");
    if name == "note.add" || web {
        if let Some(ms) = request.get("milliseconds").and_then(Value::as_u64) {
            return Duration::from_millis(ms) + Duration::from_secs(1);
        }
        if let Some(secs) = request.get("seconds").and_then(Value::as_u64) {
            return Duration::from_secs(secs + 1);
        }
        if web {
            return config.web_transaction_timeout();
        }
    }
    config.inter_transaction_timeout()
}

fn trim_end(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &line[..end]
}

/// Remove the trailing `"crc":"..."` member from a compact JSON object,
/// returning the remaining bytes and the field's value. The card appends the
/// field last, so a `crc` key nested in the response's own data is left alone.
fn split_crc_field(line: &[u8]) -> Option<(Vec<u8>, String)> {
    let start = line
        .windows(CRC_KEY.len())
        .rposition(|window| window == CRC_KEY)?;
    let value_start = start + CRC_KEY.len();
    let value_len = line[value_start..].iter().position(|&b| b == b'"')?;
    let end = value_start + value_len + 1;
    if &line[end..] != b"}" {
        return None;
    }
    let value = std::str::from_utf8(&line[value_start..end - 1]).ok()?;

    let begin = if start > 0 && line[start - 1] == b',' {
        start - 1
    } else {
        start
    };

    let mut stripped = line[..begin].to_vec();
    stripped.extend_from_slice(&line[end..]);
    Some((stripped, value.to_string()))
}

/// `SSSS:CCCCCCCC`, hex in either case.
fn parse_crc_field(field: &str) -> Option<(u16, u32)> {
    let (sequence, crc) = field.split_once(':')?;
    if sequence.len() != 4 || crc.len() != 8 {
        return None;
    }
    Some((
        u16::from_str_radix(sequence, 16).ok()?,
        u32::from_str_radix(crc, 16).ok()?,
    ))
}

/// Descriptor identifying this host library, merged with the application's.
fn user_agent(app: &Map<String, Value>) -> Map<String, Value> {
    let mut agent = Map::new();
    agent.insert("agent".into(), Value::from(env!("CARGO_PKG_NAME")));
    agent.insert("compiler".into(), Value::from("rustc"));
    agent.insert("req_interface".into(), Value::from(env!("CARGO_PKG_VERSION")));
    agent.insert("os_name".into(), Value::from(std::env::consts::OS));
    agent.insert("os_family".into(), Value::from(std::env::consts::FAMILY));
    agent.insert("cpu_arch".into(), Value::from(std::env::consts::ARCH));
    for (key, value) in app {
        agent.insert(key.clone(), value.clone());
    }
    agent
}

/// Fill `body.body` with the descriptor, keeping anything the caller set.
fn merge_user_agent(body: &mut Map<String, Value>, agent: Map<String, Value>) {
    let target = body
        .entry("body")
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(target) = target else {
        log::debug!("hub.set body is not an object; not adding user agent");
        return;
    };
    for (key, value) in agent {
        target.entry(key).or_insert(value);
    }
}

pub struct NotecardBuilder {
    transport: Box<dyn Transport>,
    manager: Box<dyn TransactionManager>,
    clock: Arc<dyn Clock>,
    config: Config,
    app: Map<String, Value>,
}

impl NotecardBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Clock used for engine retry delays and binary/upload pacing.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn transaction_manager(mut self, manager: impl TransactionManager + 'static) -> Self {
        self.manager = Box::new(manager);
        self
    }

    pub fn app_descriptor(mut self, app: Map<String, Value>) -> Self {
        self.app = app;
        self
    }

    /// Build the handle and resynchronize with the card.
    pub fn open(self) -> Result<Notecard, crate::Error> {
        self.config.validate()?;
        let card = Notecard {
            clock: self.clock.clone(),
            config: self.config.clone(),
            channel: Mutex::new(Channel {
                transport: self.transport,
                manager: self.manager,
                clock: self.clock,
                config: self.config,
                app: self.app,
                state: DeviceState::default(),
            }),
        };
        card.reset()?;
        Ok(card)
    }
}

/// Exclusive use of the channel across several exchanges.
///
/// Exchanges made through a session skip per-call locking. No other caller's
/// traffic can land between them.
pub struct Session<'a> {
    channel: &'a mut Channel,
}

impl Session<'_> {
    pub fn transact(&mut self, request: &Request) -> Result<Option<Response>, crate::Error> {
        self.channel.transact_locked(request)
    }

    pub fn request(&mut self, request: &Request) -> Result<Response, crate::Error> {
        self.channel.request_locked(request)
    }

    /// Write bytes outside the JSON framing, unpaced.
    pub fn transmit_raw(&mut self, data: &[u8]) -> Result<(), crate::Error> {
        self.channel.transmit_raw(data, false)
    }

    /// Read one raw line. A failure marks the channel for reset.
    pub fn receive_raw(&mut self) -> Result<Vec<u8>, crate::Error> {
        self.channel.receive_raw(false)
    }
}

/// Handle to one card.
///
/// All methods take `&self`; exchanges from several threads are serialized.
pub struct Notecard {
    clock: Arc<dyn Clock>,
    config: Config,
    channel: Mutex<Channel>,
}

impl Notecard {
    pub fn builder(transport: impl Transport + 'static) -> NotecardBuilder {
        NotecardBuilder {
            transport: Box::new(transport),
            manager: Box::new(NoOpTransactionManager),
            clock: Arc::new(SystemClock::new()),
            config: Config::default(),
            app: Map::new(),
        }
    }

    fn channel(&self) -> Result<MutexGuard<'_, Channel>, crate::Error> {
        self.channel
            .lock()
            .map_err(|_| crate::Error::Lock("channel state poisoned by a panic".to_string()))
    }

    /// Run `f` with exclusive use of the channel, in process and on the wire.
    pub(crate) fn exclusive<T>(
        &self,
        f: impl FnOnce(&mut Channel) -> Result<T, crate::Error>,
    ) -> Result<T, crate::Error> {
        self.channel()?.with_lock(f)
    }

    /// Send a request or command. Commands return `Ok(None)`.
    ///
    /// Errors reported by the card in `err` are returned in the response,
    /// except `{bad-bin}`, which is [`crate::Error::BadBin`].
    pub fn transact(&self, request: &Request) -> Result<Option<Response>, crate::Error> {
        self.exclusive(|channel| channel.transact_locked(request))
    }

    /// Send a request that expects a response.
    pub fn request(&self, request: &Request) -> Result<Response, crate::Error> {
        self.exclusive(|channel| channel.request_locked(request))
    }

    /// Send a command; the card does not answer.
    pub fn command(&self, request: &Request) -> Result<(), crate::Error> {
        if request.expects_response() {
            return Err(crate::Error::InvalidRequest(format!(
                "{} expects a response; use request()",
                request.name()
            )));
        }
        self.transact(request).map(|_| ())
    }

    /// Run several exchanges under one acquisition of the channel.
    pub fn session<T>(
        &self,
        f: impl FnOnce(&mut Session<'_>) -> Result<T, crate::Error>,
    ) -> Result<T, crate::Error> {
        self.exclusive(|channel| f(&mut Session { channel }))
    }

    /// Resynchronize with the card now.
    pub fn reset(&self) -> Result<(), crate::Error> {
        self.exclusive(|channel| channel.reset_transport())
    }

    /// Fields merged into the user agent sent with the first `hub.set`.
    pub fn set_app_descriptor(&self, app: Map<String, Value>) -> Result<(), crate::Error> {
        self.channel()?.app = app;
        Ok(())
    }

    /// The descriptor merged into the first `hub.set`.
    pub fn user_agent(&self) -> Result<Map<String, Value>, crate::Error> {
        Ok(user_agent(&self.channel()?.app))
    }

    pub fn state(&self) -> Result<DeviceState, crate::Error> {
        Ok(self.channel()?.state)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The card's binary store.
    pub fn binary(&self) -> BinaryStore<'_> {
        BinaryStore::new(self)
    }
}
