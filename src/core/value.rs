//! AK-001: Tagged value model.
//!
//! Every output a recipe can produce is one of these kinds. Operations that
//! would rely on runtime introspection elsewhere (checksum dispatch,
//! serialization dispatch) become explicit matches over this enum.

use indexmap::{IndexMap, IndexSet};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// A value flowing through the recipe graph.
///
/// Mappings and sets preserve insertion order; equality for both is by
/// entries/elements regardless of order. Floats compare and hash by their
/// canonical bit pattern (all NaNs collapse to one).
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(IndexMap<Value, Value>),
    Set(IndexSet<Value>),
    /// Reference to an external file or directory. The referenced content
    /// participates in checksums; the value itself is just the path.
    Path(PathBuf),
    /// Caller-encoded value the engine treats as a byte payload.
    Opaque(OpaqueValue),
}

/// An opaque payload: a type tag naming the caller's codec plus the encoded
/// bytes. Only usable when the configuration allows the opaque fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpaqueValue {
    pub type_tag: String,
    pub bytes: Vec<u8>,
}

impl OpaqueValue {
    pub fn new(type_tag: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            bytes,
        }
    }
}

/// Discriminant of a [`Value`], used in error messages and dispatch checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Seq,
    Map,
    Set,
    Path,
    Opaque,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::Seq => "seq",
            Self::Map => "map",
            Self::Set => "set",
            Self::Path => "path",
            Self::Opaque => "opaque",
        };
        write!(f, "{}", name)
    }
}

/// Canonical bit pattern for a float: all NaNs collapse to the same bits so
/// that equality, hashing and checksums agree.
pub(crate) fn canonical_bits(f: f64) -> u64 {
    if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Seq(_) => ValueKind::Seq,
            Self::Map(_) => ValueKind::Map,
            Self::Set(_) => ValueKind::Set,
            Self::Path(_) => ValueKind::Path,
            Self::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// Build a sequence from anything convertible to values.
    pub fn seq<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::Seq(items.into_iter().map(Into::into).collect())
    }

    /// Build a mapping from key/value pairs, preserving order.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Value>,
        V: Into<Value>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a set, preserving insertion order.
    pub fn set<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Self {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<Value, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&IndexSet<Value>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => canonical_bits(*a) == canonical_bits(*b),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Path(a), Self::Path(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Order-insensitive combination of per-item hashes, for kinds whose
/// equality ignores order.
fn unordered_hash<T: Hash>(items: impl Iterator<Item = T>) -> u64 {
    items.fold(0u64, |acc, item| {
        let mut hasher = DefaultHasher::new();
        item.hash(&mut hasher);
        acc ^ hasher.finish()
    })
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => canonical_bits(*f).hash(state),
            Self::Str(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Seq(v) => v.hash(state),
            Self::Map(m) => state.write_u64(unordered_hash(m.iter())),
            Self::Set(s) => state.write_u64(unordered_hash(s.iter())),
            Self::Path(p) => p.hash(state),
            Self::Opaque(o) => o.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Seq(v)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Self::Path(p)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Self::Path(p.to_path_buf())
    }
}

/// Fixed-arity tuple of values returned by a bound function. Arity 0 denotes
/// a unit result, which still counts as "evaluated" for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outputs(Vec<Value>);

impl Outputs {
    /// The empty (unit) output tuple.
    pub fn unit() -> Self {
        Self(Vec::new())
    }

    /// A single-value output tuple.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// The sole value of an arity-1 tuple.
    pub fn only(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [value] => Some(value),
            _ => None,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }

    /// The value this tuple contributes when consumed as an ingredient:
    /// arity 1 passes the value through, arity 0 contributes null, higher
    /// arities contribute the tuple as a sequence.
    pub fn contribution(&self) -> Value {
        match self.0.as_slice() {
            [] => Value::Null,
            [value] => value.clone(),
            values => Value::Seq(values.to_vec()),
        }
    }
}

impl From<Value> for Outputs {
    fn from(value: Value) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<Value>> for Outputs {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_ak001_float_nan_equals_itself() {
        let a = Value::Float(f64::NAN);
        let b = Value::Float(0.0 / 0.0);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_ak001_int_and_float_distinct() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn test_ak001_map_equality_ignores_order() {
        let a = Value::map([("x", 1i64), ("y", 2i64)]);
        let b = Value::map([("y", 2i64), ("x", 1i64)]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_ak001_seq_equality_respects_order() {
        let a = Value::seq([1i64, 2]);
        let b = Value::seq([2i64, 1]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_ak001_set_equality_ignores_order() {
        let a = Value::set(["p", "q"]);
        let b = Value::set(["q", "p"]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_ak001_non_string_map_keys() {
        let m = Value::map([(Value::Int(1), Value::from("one"))]);
        let inner = m.as_map().unwrap();
        assert_eq!(inner.get(&Value::Int(1)).unwrap().as_str(), Some("one"));
    }

    #[test]
    fn test_ak001_outputs_contribution() {
        assert_eq!(Outputs::unit().contribution(), Value::Null);
        assert_eq!(Outputs::single(7i64).contribution(), Value::Int(7));
        let pair = Outputs::new(vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(pair.contribution(), Value::seq([1i64, 2]));
    }

    #[test]
    fn test_ak001_kind_display() {
        assert_eq!(Value::Null.kind().to_string(), "null");
        assert_eq!(Value::path("/tmp/x").kind().to_string(), "path");
    }
}
