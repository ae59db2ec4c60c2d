//! Query key types and construction.
//!
//! A [`QueryKey`] identifies one distinct query: a logical name (for example
//! `"invoices"`) plus the parameters the query was issued with.
//!
//! ## Format
//!
//! When rendered as a string, keys follow this format:
//! `{name}:key1=value1&key2=value2`
//!
//! - The `:` separator is omitted when there are no parts
//! - A part without a value renders as its bare key
//!
//! ```
//! use querybox_core::{KeyPart, QueryKey};
//!
//! let key = QueryKey::new("invoices", vec![KeyPart::new("status", Some("paid"))]);
//! assert_eq!(format!("{}", key), "invoices:status=paid");
//!
//! let key = QueryKey::named("dashboard");
//! assert_eq!(format!("{}", key), "dashboard");
//!
//! let key = QueryKey::new("orders", vec![
//!     KeyPart::new("page", Some("2")),
//!     KeyPart::new("archived", None::<&str>),
//! ]);
//! assert_eq!(format!("{}", key), "orders:page=2&archived");
//! ```
//!
//! ## Performance
//!
//! [`QueryKey`] uses `Arc` internally for cheap cloning, and both the name
//! and the parts use [`SmolStr`], which keeps short strings inline.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use smol_str::SmolStr;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize)]
struct QueryKeyInner {
    name: SmolStr,
    parts: Vec<KeyPart>,
    /// Rendered form, computed once; pattern invalidation matches against it.
    #[serde(skip)]
    rendered: SmolStr,
}

/// Identity of a cached query.
///
/// Two keys are equal when their names and parts are equal, in order.
/// Use [`QueryKey::from_params`] to derive a key whose identity does not
/// depend on the field order of the parameters.
///
/// # Example
///
/// ```
/// use querybox_core::QueryKey;
/// use serde_json::json;
///
/// let a = QueryKey::from_params("invoices", &json!({"page": 1, "status": "paid"}));
/// let b = QueryKey::from_params("invoices", &json!({"status": "paid", "page": 1}));
///
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "invoices:page=1&status=paid");
/// assert!(a.contains("invoices"));
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(into = "QueryKeyInner")]
pub struct QueryKey {
    inner: Arc<QueryKeyInner>,
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl From<QueryKey> for QueryKeyInner {
    fn from(key: QueryKey) -> Self {
        Arc::try_unwrap(key.inner).unwrap_or_else(|arc| (*arc).clone())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.rendered)
    }
}

impl QueryKey {
    /// Creates a key from a name and an explicit list of parts.
    pub fn new(name: impl Into<SmolStr>, parts: Vec<KeyPart>) -> Self {
        let name = name.into();
        let rendered = render(&name, &parts);
        QueryKey {
            inner: Arc::new(QueryKeyInner {
                name,
                parts,
                rendered,
            }),
        }
    }

    /// Creates a key with no parts.
    pub fn named(name: impl Into<SmolStr>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Derives a key from a name and serializable parameters.
    ///
    /// Top-level fields of an object become parts sorted by field name.
    /// Strings render without quotes, `null` fields render as bare keys and
    /// nested values render as compact JSON. Any other non-null value becomes
    /// a single `params` part. Parameters that fail to serialize yield a key
    /// with no parts.
    pub fn from_params<P: Serialize + ?Sized>(name: impl Into<SmolStr>, params: &P) -> Self {
        let value = serde_json::to_value(params).unwrap_or(Value::Null);
        Self::new(name, parts_from_value(&value))
    }

    /// Returns the logical name of the query.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns an iterator over the key parts.
    pub fn parts(&self) -> impl Iterator<Item = &KeyPart> {
        self.inner.parts.iter()
    }

    /// Returns `true` if the rendered key contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.inner.rendered.contains(pattern)
    }

    /// Returns the rendered key.
    pub fn as_str(&self) -> &str {
        &self.inner.rendered
    }
}

fn render(name: &str, parts: &[KeyPart]) -> SmolStr {
    if parts.is_empty() {
        return SmolStr::new(name);
    }
    let rendered = parts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("&");
    SmolStr::new(format!("{name}:{rendered}"))
}

fn parts_from_value(value: &Value) -> Vec<KeyPart> {
    match value {
        Value::Null => Vec::new(),
        Value::Object(map) => {
            let mut parts: Vec<KeyPart> = map
                .iter()
                .map(|(key, value)| KeyPart::new(key, scalar(value)))
                .collect();
            parts.sort_by(|a, b| a.key.cmp(&b.key));
            parts
        }
        other => vec![KeyPart::new("params", scalar(other))],
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A single component of a query key.
///
/// ```
/// use querybox_core::KeyPart;
///
/// let page = KeyPart::new("page", Some("2"));
/// assert_eq!(page.key(), "page");
/// assert_eq!(page.value(), Some("2"));
///
/// let flag = KeyPart::new("archived", None::<&str>);
/// assert_eq!(flag.value(), None);
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeyPart {
    key: SmolStr,
    value: Option<SmolStr>,
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if let Some(ref value) = self.value {
            write!(f, "={}", value)?;
        }
        Ok(())
    }
}

impl KeyPart {
    /// Creates a new key part.
    pub fn new<K: AsRef<str>, V: AsRef<str>>(key: K, value: Option<V>) -> Self {
        KeyPart {
            key: SmolStr::new(key),
            value: value.map(SmolStr::new),
        }
    }

    /// Returns the key name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the optional value.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl From<&str> for QueryKey {
    fn from(name: &str) -> Self {
        QueryKey::named(name)
    }
}
