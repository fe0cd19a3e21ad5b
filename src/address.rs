//! Endpoint addressing: `proclink://host/process/endpoint`.
//!
//! An [`Address`] is an immutable, cheaply cloneable value. Text is kept
//! verbatim and parsed on first structured access; derived addresses
//! (cluster, process, relative) are computed once and memoized on the
//! instance.
//!
//! ```text
//! proclink://node-a/worker-7/calculator
//! └──scheme─┘└host┘ └process┘ └endpoint┘
//!
//! /worker-7/calculator        relative form (no host)
//! /                           relative root
//! ```
//!
//! Equality and hashing are ASCII case-insensitive over the raw text. Use
//! [`RelativeKey`] when an address reported by a server (absolute) must match
//! one registered by a client (possibly relative).
//!
//! # Example
//!
//! ```
//! use proclink::Address;
//!
//! let addr = Address::parse("proclink://node-a/worker-7/calc").unwrap();
//! assert_eq!(addr.host_authority().unwrap(), Some("node-a"));
//! assert_eq!(addr.relative_address().unwrap().as_str(), "/worker-7/calc");
//! assert_eq!(addr.cluster_address().unwrap().as_str(), "proclink://node-a");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, RpcError};

/// Address scheme.
pub const SCHEME: &str = "proclink";

/// Scheme plus separator, the prefix of every absolute address.
const ABSOLUTE_PREFIX: &str = "proclink://";

/// Path delimiter.
const DELIMITER: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
struct Parts {
    host: Option<String>,
    process: Option<String>,
    endpoint: Option<String>,
}

#[derive(Debug)]
struct Inner {
    text: String,
    parts: OnceLock<std::result::Result<Parts, String>>,
    cluster: OnceLock<Address>,
    process: OnceLock<Address>,
    relative: OnceLock<Address>,
}

/// Address of a cluster, a process, or an endpoint inside a process.
#[derive(Clone)]
pub struct Address {
    inner: Arc<Inner>,
}

impl Address {
    fn from_text(text: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                text,
                parts: OnceLock::new(),
                cluster: OnceLock::new(),
                process: OnceLock::new(),
                relative: OnceLock::new(),
            }),
        }
    }

    /// Wrap text without validating it.
    ///
    /// Parsing happens on first structured access, which then fails with
    /// [`RpcError::AddressFormat`] if the text is malformed.
    pub fn lazy(text: impl Into<String>) -> Self {
        Self::from_text(text.into())
    }

    /// Parse and validate address text.
    pub fn parse(text: &str) -> Result<Self> {
        let addr = Self::lazy(text);
        addr.parts()?;
        Ok(addr)
    }

    /// Build canonical text from components, then parse it.
    ///
    /// `host = None` yields a relative address. An endpoint requires a process.
    pub fn create(host: Option<&str>, process: Option<&str>, endpoint: Option<&str>) -> Result<Self> {
        if endpoint.is_some() && process.is_none() {
            return Err(RpcError::address(
                endpoint.unwrap_or_default(),
                "an endpoint requires a process",
            ));
        }

        let mut text = match host {
            Some(host) => format!("{ABSOLUTE_PREFIX}{host}"),
            None => String::new(),
        };
        for segment in [process, endpoint].into_iter().flatten() {
            text.push(DELIMITER);
            text.push_str(segment);
        }
        if text.is_empty() {
            text.push(DELIMITER);
        }

        Self::parse(&text)
    }

    /// The relative root `/`.
    pub fn root() -> Self {
        Self::lazy("/")
    }

    /// Original text, verbatim.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.inner.text
    }

    fn parts(&self) -> Result<&Parts> {
        self.inner
            .parts
            .get_or_init(|| parse_parts(&self.inner.text))
            .as_ref()
            .map_err(|reason| RpcError::address(&self.inner.text, reason.clone()))
    }

    /// Check whether the text parses.
    pub fn is_valid(&self) -> bool {
        self.parts().is_ok()
    }

    /// Host authority, `None` for relative addresses.
    pub fn host_authority(&self) -> Result<Option<&str>> {
        Ok(self.parts()?.host.as_deref())
    }

    /// Process id segment.
    pub fn process_id(&self) -> Result<Option<&str>> {
        Ok(self.parts()?.process.as_deref())
    }

    /// Endpoint id segment.
    pub fn endpoint_id(&self) -> Result<Option<&str>> {
        Ok(self.parts()?.endpoint.as_deref())
    }

    /// Whether the address names a host.
    pub fn is_absolute(&self) -> Result<bool> {
        Ok(self.parts()?.host.is_some())
    }

    /// Same host, no process or endpoint (`/` for relative addresses).
    pub fn cluster_address(&self) -> Result<&Address> {
        let parts = self.parts()?;
        if parts.process.is_none() {
            return Ok(self);
        }
        Ok(self.inner.cluster.get_or_init(|| match &parts.host {
            Some(host) => Address::lazy(format!("{ABSOLUTE_PREFIX}{host}")),
            None => Address::root(),
        }))
    }

    /// Same host and process, no endpoint.
    pub fn process_address(&self) -> Result<&Address> {
        let parts = self.parts()?;
        if parts.endpoint.is_none() {
            return Ok(self);
        }
        Ok(self.inner.process.get_or_init(|| {
            let process = parts.process.as_deref().unwrap_or_default();
            match &parts.host {
                Some(host) => Address::lazy(format!("{ABSOLUTE_PREFIX}{host}/{process}")),
                None => Address::lazy(format!("/{process}")),
            }
        }))
    }

    /// Host authority stripped.
    pub fn relative_address(&self) -> Result<&Address> {
        let parts = self.parts()?;
        if parts.host.is_none() {
            return Ok(self);
        }
        Ok(self.inner.relative.get_or_init(|| {
            let mut text = String::new();
            for segment in [&parts.process, &parts.endpoint].into_iter().flatten() {
                text.push(DELIMITER);
                text.push_str(segment);
            }
            if text.is_empty() {
                text.push(DELIMITER);
            }
            Address::lazy(text)
        }))
    }

    /// Append a suffix with exactly one separating delimiter.
    pub fn combine(&self, suffix: &str) -> Result<Address> {
        let head = self.inner.text.trim_end_matches(DELIMITER);
        let tail = suffix.trim_start_matches(DELIMITER);
        Address::parse(&format!("{head}{DELIMITER}{tail}"))
    }

    /// Whether `self` is `other` or one of its ancestors (relative comparison).
    pub fn contains(&self, other: &Address) -> Result<bool> {
        let mine = self.relative_address()?.parts()?;
        let theirs = other.relative_address()?.parts()?;
        let segment_eq = |a: &Option<String>, b: &Option<String>| match (a, b) {
            (None, _) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (Some(_), None) => false,
        };
        Ok(segment_eq(&mine.process, &theirs.process)
            && segment_eq(&mine.endpoint, &theirs.endpoint)
            && (mine.process.is_some() || mine.endpoint.is_none()))
    }

    /// Compare relative forms.
    pub fn relative_eq(&self, other: &Address) -> bool {
        RelativeKey::new(self.clone()) == RelativeKey::new(other.clone())
    }
}

fn parse_parts(text: &str) -> std::result::Result<Parts, String> {
    if text.is_empty() {
        return Err("address is empty".to_string());
    }

    let (host, path) = if let Some(rest) = text.strip_prefix(DELIMITER) {
        (None, rest)
    } else {
        let Some((scheme, rest)) = text.split_once("://") else {
            return Err("expected '/' or 'proclink://'".to_string());
        };
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(format!("unsupported scheme '{scheme}'"));
        }
        let (host, path) = rest.split_once(DELIMITER).unwrap_or((rest, ""));
        if host.is_empty() {
            return Err("host authority is empty".to_string());
        }
        (Some(host.to_string()), path)
    };

    let segments: Vec<&str> = path.split(DELIMITER).filter(|s| !s.is_empty()).collect();
    if segments.len() > 2 {
        return Err(format!(
            "path has {} segments, at most process/endpoint allowed",
            segments.len()
        ));
    }
    if let Some(bad) = segments.iter().find(|s| s.contains(':') || s.trim() != **s) {
        return Err(format!("invalid segment '{bad}'"));
    }

    Ok(Parts {
        host,
        process: segments.first().map(|s| s.to_string()),
        endpoint: segments.get(1).map(|s| s.to_string()),
    })
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || self.inner.text.eq_ignore_ascii_case(&other.inner.text)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_ignore_case(&self.inner.text, state);
    }
}

fn hash_ignore_case<H: Hasher>(text: &str, state: &mut H) {
    for b in text.bytes() {
        state.write_u8(b.to_ascii_lowercase());
    }
    state.write_u8(0xff);
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.text)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.inner.text)
    }
}

impl FromStr for Address {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner.text)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Address::lazy)
    }
}

/// Map key that compares addresses by their relative form.
///
/// Lets a registration made through `/p/e` match a server-reported
/// `proclink://host/p/e`. Malformed addresses fall back to raw text.
#[derive(Clone, Debug)]
pub struct RelativeKey(Address);

impl RelativeKey {
    /// Key an address by its relative form.
    pub fn new(address: Address) -> Self {
        match address.relative_address() {
            Ok(relative) => Self(relative.clone()),
            Err(_) => Self(address),
        }
    }

    /// The relative address this key compares by.
    pub fn address(&self) -> &Address {
        &self.0
    }
}

impl PartialEq for RelativeKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for RelativeKey {}

impl Hash for RelativeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Interning cache for addresses.
///
/// Owned by whoever creates it (normally one per [`Connection`](crate::Connection));
/// there is no process-wide instance. Interned addresses share their memoized
/// derived forms.
#[derive(Debug)]
pub struct AddressCache {
    entries: Mutex<HashMap<String, Address>>,
    capacity: usize,
}

/// Default number of distinct addresses kept by an [`AddressCache`].
pub const DEFAULT_ADDRESS_CACHE_CAPACITY: usize = 4096;

impl Default for AddressCache {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_CACHE_CAPACITY)
    }
}

impl AddressCache {
    /// Create a cache bounded to `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Return the interned instance equal to `address`, inserting it if new.
    ///
    /// When full the cache is cleared rather than evicting piecemeal.
    pub fn intern(&self, address: Address) -> Address {
        let key = address.as_str().to_ascii_lowercase();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }
        if entries.len() >= self.capacity {
            entries.clear();
        }
        entries.insert(key, address.clone());
        address
    }

    /// Number of interned addresses.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
