//! Canonical argument fingerprinting — the crate's stable serializer.
//!
//! Producer call sites build a `Vec<KeyArg>` out of their argument tuple (or
//! rely on a `KeyArg: From<T>` conversion for the common scalar types) and
//! pass it to [`fingerprint`]. The output is the `Key` used by the memoize
//! engine and the single-flight coordinator.
//!
//! Every composite encoding is wrapped in an explicit byte-length prefix, so
//! the whole scheme is unambiguous: two structurally different argument
//! lists can never serialize to the same string, no matter what characters
//! their string/byte literals contain.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

/// The reserved delimiter joining top-level argument fingerprints. Chosen
/// because every composite encoding below is length-prefixed and never
/// emits this byte, so it cannot appear inside any literal's encoding.
const ARG_DELIMITER: char = '\u{1F}';

/// Fingerprint returned when the argument list is empty.
const EMPTY_SENTINEL: &str = "0";

/// A value in the key-fingerprinting AST.
///
/// This mirrors the literal taxonomy `spec.md` requires: every JS-ish value
/// kind that needs distinct treatment gets its own variant, and
/// non-serializable values collapse to a stable per-instance identifier.
#[derive(Debug, Clone)]
pub enum KeyArg {
    Null,
    Bool(bool),
    Str(String),
    Int(i64),
    /// IEEE-754 double. `NaN` and `-0.0` are preserved distinctly because the
    /// encoding is keyed on the raw bit pattern, not equality.
    Float(f64),
    Bytes(Vec<u8>),
    /// Epoch-millisecond timestamp (the serializer's encoding for dates).
    Millis(i64),
    Regex { source: String, flags: String },
    /// An ordered sequence, serialized positionally.
    Seq(Vec<KeyArg>),
    /// An unordered collection (set, map-keys); serialized in sorted order.
    SortedSeq(Vec<KeyArg>),
    /// A mapping; entries are serialized with keys sorted lexicographically.
    Map(Vec<(String, KeyArg)>),
    /// A non-serializable value (function, symbol, error, weak collection):
    /// collapses to a per-instance identifier minted from its address.
    Opaque(usize),
    /// A node that may participate in a reference cycle. Detected via
    /// pointer-address tracking during encoding; a cyclic back-reference
    /// emits the node's stable identifier instead of recursing forever.
    Shared(Rc<RefCell<KeyArg>>),
}

impl From<bool> for KeyArg {
    fn from(b: bool) -> Self {
        KeyArg::Bool(b)
    }
}
impl From<i64> for KeyArg {
    fn from(i: i64) -> Self {
        KeyArg::Int(i)
    }
}
impl From<f64> for KeyArg {
    fn from(f: f64) -> Self {
        KeyArg::Float(f)
    }
}
impl From<String> for KeyArg {
    fn from(s: String) -> Self {
        KeyArg::Str(s)
    }
}
impl From<&str> for KeyArg {
    fn from(s: &str) -> Self {
        KeyArg::Str(s.to_owned())
    }
}

/// Process-wide identity registry for non-serializable/shared values.
///
/// Two distinct instances never collide; the same instance (same address)
/// always collides with itself. Addresses are reused once a value is freed,
/// so identity is only stable for the value's lifetime.
static IDENTITY_COUNTER: AtomicU64 = AtomicU64::new(1);
static IDENTITY_REGISTRY: OnceLock<Mutex<HashMap<usize, u64>>> = OnceLock::new();

fn identity_of(addr: usize) -> u64 {
    let registry = IDENTITY_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard.entry(addr).or_insert_with(|| IDENTITY_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Mint (or recall) a stable per-instance identifier for a non-serializable
/// value, keyed on its address.
pub fn opaque_id<T>(value: &T) -> usize {
    identity_of(value as *const T as usize)
}

fn wrap(tag: char, body: &str) -> String {
    format!("{tag}{}:{}", body.len(), body)
}

fn encode_str(s: &str) -> String {
    wrap('s', s)
}

fn encode(arg: &KeyArg, visiting: &mut Vec<usize>) -> String {
    match arg {
        KeyArg::Null => "z".to_string(),
        KeyArg::Bool(b) => format!("b{}", *b as u8),
        KeyArg::Int(i) => format!("i{i}"),
        KeyArg::Float(f) => format!("f{:016x}", f.to_bits()),
        KeyArg::Str(s) => encode_str(s),
        KeyArg::Bytes(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2);
            for b in bytes {
                hex.push_str(&format!("{b:02x}"));
            }
            wrap('y', &hex)
        }
        KeyArg::Millis(ms) => format!("d{ms}"),
        KeyArg::Regex { source, flags } => {
            let body = format!("{}={}", encode_str(source), encode_str(flags));
            wrap('r', &body)
        }
        KeyArg::Seq(items) => {
            let body =
                items.iter().map(|i| encode(i, visiting)).collect::<Vec<_>>().join(",");
            wrap('q', &body)
        }
        KeyArg::SortedSeq(items) => {
            let mut encoded: Vec<String> = items.iter().map(|i| encode(i, visiting)).collect();
            encoded.sort();
            wrap('u', &encoded.join(","))
        }
        KeyArg::Map(entries) => {
            let mut sorted: Vec<&(String, KeyArg)> = entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let body = sorted
                .into_iter()
                .map(|(k, v)| format!("{}={}", encode_str(k), encode(v, visiting)))
                .collect::<Vec<_>>()
                .join(",");
            wrap('m', &body)
        }
        KeyArg::Opaque(addr) => format!("o{}", identity_of(*addr)),
        KeyArg::Shared(shared) => {
            let addr = Rc::as_ptr(shared) as usize;
            if visiting.contains(&addr) {
                return format!("c{}", identity_of(addr));
            }
            visiting.push(addr);
            let inner = shared.borrow();
            let encoded = encode(&inner, visiting);
            visiting.pop();
            wrap('x', &format!("{}:{encoded}", identity_of(addr)))
        }
    }
}

/// Produce the stable fingerprint for an ordered list of top-level
/// arguments. Returns [`EMPTY_SENTINEL`] when `args` is empty.
pub fn fingerprint(args: &[KeyArg]) -> String {
    if args.is_empty() {
        return EMPTY_SENTINEL.to_string();
    }
    let mut visiting = Vec::new();
    args.iter()
        .map(|a| encode(a, &mut visiting))
        .collect::<Vec<_>>()
        .join(&ARG_DELIMITER.to_string())
}
