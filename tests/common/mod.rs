#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use notecard::{
    binary::md5_hex,
    cobs,
    crc::crc32,
    timeout::{Clock, Stamp},
    transport::Transport,
    Config, Notecard,
};
use serde_json::{json, Map, Value};

/// Simulated time: sleeping returns at once and every reading advances a
/// millisecond.
#[derive(Debug, Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for TestClock {
    fn now(&self) -> Stamp {
        Stamp(self.now.fetch_add(1, Ordering::SeqCst))
    }

    fn elapsed(&self, start: Stamp) -> Duration {
        Duration::from_millis(self.millis().saturating_sub(start.0))
    }

    fn sleep(&self, duration: Duration) {
        self.now
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct PendingPut {
    cobs: usize,
    status: String,
    offset: usize,
}

#[derive(Debug)]
enum Outbound {
    Line(Vec<u8>),
    Raw(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct CardState {
    pub capacity: usize,
    pub store: Vec<u8>,
    pub store_valid: bool,
    /// Requests as received, integrity field removed.
    pub requests: Vec<Map<String, Value>>,
    /// Sequence number carried by each request; `None` for commands.
    pub sequences: Vec<Option<u16>>,
    pub payload_transmits: usize,
    pub resets: usize,
    /// Upcoming payloads to reject as if corrupted in flight.
    pub corrupt_payloads: usize,
    /// Upcoming receives that fail at the transport level.
    pub receive_failures: usize,
    /// Upcoming raw payload reads that fail at the transport level.
    pub raw_receive_failures: usize,
    /// Upcoming responses sent with a wrong sequence number.
    pub wrong_sequences: usize,
    /// Results for upcoming `web.post` requests; 200 once exhausted.
    pub post_results: VecDeque<Value>,
    outbound: VecDeque<Outbound>,
    pending_put: Option<PendingPut>,
}

impl CardState {
    pub fn requests_named(&self, name: &str) -> Vec<&Map<String, Value>> {
        self.requests
            .iter()
            .filter(|request| request.get("req").and_then(Value::as_str) == Some(name))
            .collect()
    }
}

/// A card with a binary store, speaking the line protocol over an in-memory
/// channel.
#[derive(Clone, Debug)]
pub struct FakeCard(Arc<Mutex<CardState>>);

impl FakeCard {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(CardState {
            capacity,
            store_valid: true,
            ..Default::default()
        })))
    }

    pub fn state(&self) -> MutexGuard<'_, CardState> {
        self.0.lock().unwrap()
    }

    pub fn open(&self) -> (Notecard, Arc<TestClock>) {
        self.open_with(Config::default())
    }

    pub fn open_with(&self, config: Config) -> (Notecard, Arc<TestClock>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = Arc::new(TestClock::default());
        let card = Notecard::builder(self.clone())
            .config(config)
            .clock(clock.clone())
            .open()
            .unwrap();
        (card, clock)
    }
}

fn respond(state: &mut CardState, sequence: Option<u16>, body: Value) {
    let json = serde_json::to_string(&body).unwrap();
    let line = match sequence {
        Some(mut sequence) => {
            if state.wrong_sequences > 0 {
                state.wrong_sequences -= 1;
                sequence = sequence.wrapping_add(1);
            }
            let crc = crc32(json.as_bytes());
            format!(
                "{},\"crc\":\"{:04X}:{:08X}\"}}",
                &json[..json.len() - 1],
                sequence,
                crc
            )
        }
        None => json,
    };
    state
        .outbound
        .push_back(Outbound::Line(format!("{}\r\n", line).into_bytes()));
}

fn bad_bin(state: &CardState) -> Value {
    json!({"err": "binary data invalid {bad-bin}", "max": state.capacity})
}

fn handle_request(state: &mut CardState, mut body: Map<String, Value>) {
    let sequence = body
        .remove("crc")
        .and_then(|crc| crc.as_str().map(str::to_string))
        .and_then(|crc| u16::from_str_radix(&crc[..4], 16).ok());
    state.requests.push(body.clone());
    state.sequences.push(sequence);

    let Some(name) = body.get("req").and_then(Value::as_str) else {
        // commands get no answer
        return;
    };

    let reply = match name {
        "card.binary" if body.get("delete") == Some(&json!(true)) => {
            state.store.clear();
            state.store_valid = true;
            json!({})
        }
        "card.binary" if !state.store_valid => bad_bin(state),
        "card.binary" => json!({"length": state.store.len(), "max": state.capacity}),
        "card.binary.put" => {
            let offset = body.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
            if offset != state.store.len() && offset != 0 {
                json!({"err": "offset does not match"})
            } else {
                state.pending_put = Some(PendingPut {
                    cobs: body["cobs"].as_u64().unwrap() as usize,
                    status: body["status"].as_str().unwrap().to_string(),
                    offset,
                });
                json!({})
            }
        }
        "card.binary.get" => {
            let offset = body["offset"].as_u64().unwrap() as usize;
            let length = body["length"].as_u64().unwrap() as usize;
            let data = state.store[offset..offset + length].to_vec();
            respond(state, sequence, json!({"status": md5_hex(&data)}));
            let mut raw = cobs::encode(&data, b'\n');
            raw.push(b'\n');
            state.outbound.push_back(Outbound::Raw(raw));
            return;
        }
        "web.post" => {
            let result = state.post_results.pop_front().unwrap_or(json!(200));
            json!({"result": result})
        }
        _ => json!({}),
    };
    respond(state, sequence, reply);
}

fn accept_payload(state: &mut CardState, put: PendingPut, data: &[u8]) {
    state.payload_transmits += 1;

    let mut encoded = data.to_vec();
    if encoded.last() == Some(&b'\n') {
        encoded.pop();
    }
    let decoded = cobs::decode(&encoded, b'\n');

    let corrupted = if state.corrupt_payloads > 0 {
        state.corrupt_payloads -= 1;
        true
    } else {
        false
    };

    if corrupted || encoded.len() != put.cobs || md5_hex(&decoded) != put.status {
        state.store_valid = false;
        return;
    }
    state.store.truncate(put.offset);
    state.store.extend_from_slice(&decoded);
    state.store_valid = true;
}

impl Transport for FakeCard {
    fn transmit(&mut self, data: &[u8], _delay: bool) -> Result<(), notecard::Error> {
        let mut state = self.state();
        if let Some(put) = state.pending_put.take() {
            accept_payload(&mut state, put, data);
            return Ok(());
        }

        let text = std::str::from_utf8(data).unwrap().trim_end();
        let body: Map<String, Value> = serde_json::from_str(text).unwrap();
        handle_request(&mut state, body);
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration, _delay: bool) -> Result<Vec<u8>, notecard::Error> {
        let mut state = self.state();
        match state.outbound.pop_front() {
            Some(_) if state.receive_failures > 0 => {
                state.receive_failures -= 1;
                Err(notecard::Error::Transport("line noise".into()))
            }
            Some(Outbound::Raw(_)) if state.raw_receive_failures > 0 => {
                state.raw_receive_failures -= 1;
                Err(notecard::Error::Timeout("payload cut short".into()))
            }
            Some(Outbound::Line(bytes) | Outbound::Raw(bytes)) => Ok(bytes),
            None => Err(notecard::Error::Timeout("card has nothing to send".into())),
        }
    }

    fn available(&mut self) -> Result<bool, notecard::Error> {
        Ok(!self.state().outbound.is_empty())
    }

    fn reset(&mut self) -> Result<(), notecard::Error> {
        let mut state = self.state();
        state.resets += 1;
        state.outbound.clear();
        state.pending_put = None;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), notecard::Error> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), notecard::Error> {
        Ok(())
    }
}

/// `len` bytes that exercise every byte value, the delimiter included.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}
