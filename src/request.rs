//! JSON requests sent to the card and the responses it returns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key naming a request that expects a response.
pub const REQ: &str = "req";
/// Key naming a fire-and-forget command.
pub const CMD: &str = "cmd";
/// Key carrying a device-reported error.
pub const ERR: &str = "err";
/// Key carrying the `SSSS:CCCCCCCC` integrity field.
pub const CRC: &str = "crc";

pub const TAG_BAD_BIN: &str = "{bad-bin}";
pub const TAG_IO: &str = "{io}";
pub const TAG_NOT_SUPPORTED: &str = "{not-supported}";

/// A request or command.
///
/// Always holds exactly one of `req` or `cmd`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Request {
    body: Map<String, Value>,
}

impl Request {
    /// A request that expects a response.
    pub fn new(name: &str) -> Self {
        let mut body = Map::new();
        body.insert(REQ.to_string(), Value::from(name));
        Self { body }
    }

    /// A command; the card sends nothing back.
    pub fn command(name: &str) -> Self {
        let mut body = Map::new();
        body.insert(CMD.to_string(), Value::from(name));
        Self { body }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a field. The `req`/`cmd` key cannot be replaced this way.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        if key == REQ || key == CMD {
            log::warn!("Ignoring attempt to overwrite request key {:?}", key);
            return;
        }
        self.body.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if key == REQ || key == CMD {
            return None;
        }
        self.body.remove(key)
    }

    /// The request or command name, e.g. `card.binary`.
    pub fn name(&self) -> &str {
        self.body
            .get(REQ)
            .or_else(|| self.body.get(CMD))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn expects_response(&self) -> bool {
        self.body.contains_key(REQ)
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }

    /// Compact single-line JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(serde_json::to_vec(&self.body)?)
    }
}

impl TryFrom<Value> for Request {
    type Error = crate::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(body) = value else {
            return Err(crate::Error::InvalidRequest(
                "request must be a JSON object".to_string(),
            ));
        };
        Self::try_from(body)
    }
}

impl TryFrom<Map<String, Value>> for Request {
    type Error = crate::Error;

    fn try_from(body: Map<String, Value>) -> Result<Self, Self::Error> {
        let named = |key: &str| body.get(key).map(Value::is_string);
        match (named(REQ), named(CMD)) {
            (Some(true), None) | (None, Some(true)) => Ok(Self { body }),
            (Some(_), Some(_)) => Err(crate::Error::InvalidRequest(
                "request has both \"req\" and \"cmd\"".to_string(),
            )),
            (None, None) => Err(crate::Error::InvalidRequest(
                "request needs a \"req\" or \"cmd\" name".to_string(),
            )),
            _ => Err(crate::Error::InvalidRequest(
                "request name must be a string".to_string(),
            )),
        }
    }
}

impl std::str::FromStr for Request {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: Value = serde_json::from_str(s)
            .map_err(|e| crate::Error::InvalidRequest(e.to_string()))?;
        Self::try_from(value)
    }
}

/// A response from the card.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Response {
    body: Map<String, Value>,
}

impl Response {
    pub fn from_body(body: Map<String, Value>) -> Self {
        Self { body }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.body.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// The device-reported error, if any.
    pub fn error(&self) -> Option<&str> {
        self.get_str(ERR)
    }

    pub fn is_error(&self) -> bool {
        self.body.contains_key(ERR)
    }

    /// True when the error message carries `tag`, e.g. `{bad-bin}`.
    pub fn has_error_tag(&self, tag: &str) -> bool {
        self.error().is_some_and(|err| err.contains(tag))
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    pub fn into_body(self) -> Map<String, Value> {
        self.body
    }
}
