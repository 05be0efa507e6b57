use std::collections::BTreeMap;
use std::fmt;

/// Header key carrying the dispatch discriminant.
pub const MSG_TYPE: &str = "msgType";
/// Legacy spelling of [`MSG_TYPE`] still emitted by older clients.
pub const MESSAGE_TYPE: &str = "message_type";

/// Scalar header value. Brokers carry richer AMQP types; only these three
/// are meaningful to the dispatch layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Long(i64),
    Bool(bool),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Renders the scalar as text regardless of its wire type.
    pub fn to_string_lossy(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Long(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered header mapping attached to every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<HeaderValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.0.iter()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.0.retain(|key, _| keep(key));
    }

    /// String view of a header. Numeric and boolean values are rendered.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key).map(HeaderValue::to_string_lossy)
    }

    /// Long view of a header; numeric strings are parsed.
    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            HeaderValue::Long(n) => Some(*n),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    /// Boolean view of a header; `"true"`/`"false"` strings are accepted.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            HeaderValue::Bool(b) => Some(*b),
            HeaderValue::Str(s) => s.trim().parse().ok(),
            HeaderValue::Long(_) => None,
        }
    }

    /// The dispatch discriminant, preferring `msgType` over `message_type`.
    pub fn message_type(&self) -> Option<String> {
        let present = |key: &str| self.get_str(key).filter(|s| !s.is_empty());
        present(MSG_TYPE).or_else(|| present(MESSAGE_TYPE))
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Immutable broker message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }
}

/// A message handed out by the transport together with its delivery tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub message: Message,
}
