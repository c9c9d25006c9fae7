//! AK-002: Checksum engine.
//!
//! Computes stable hex-string fingerprints for values, external files, and
//! output tuples. Fingerprints are for change detection only, never for
//! integrity. The default backend is MD5; the `xxhash` feature swaps in
//! XXH3-128 for acceleration. Every checksum string carries a method prefix
//! so caches produced with one backend never alias another's.

pub mod fingerprint;

use crate::config::{AlkymiConfig, FileChecksumMethod};
use crate::core::value::{canonical_bits, Value};
use crate::error::{AlkymiError, Result};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

// One tag byte per value kind keeps different kinds with the same byte
// encoding from colliding.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STR: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_SEQ: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_SET: u8 = 0x08;
const TAG_PATH: u8 = 0x09;
const TAG_OPAQUE: u8 = 0x0a;
const TAG_TUPLE: u8 = 0x0b;
const TAG_FILE_CONTENT: u8 = 0x0c;
const TAG_FILE_MTIME: u8 = 0x0d;
const TAG_DIR: u8 = 0x0e;
const TAG_MISSING: u8 = 0x0f;
const TAG_ENTRY: u8 = 0x10;

#[cfg(not(feature = "xxhash"))]
mod backend {
    use md5::{Digest, Md5};

    pub(super) const METHOD: &str = "md5";

    pub(super) struct Backend(Md5);

    impl Backend {
        pub(super) fn new() -> Self {
            Self(Md5::new())
        }

        pub(super) fn update(&mut self, bytes: &[u8]) {
            self.0.update(bytes);
        }

        pub(super) fn finish(self) -> String {
            super::to_hex(&self.0.finalize())
        }
    }
}

#[cfg(feature = "xxhash")]
mod backend {
    use xxhash_rust::xxh3::Xxh3;

    pub(super) const METHOD: &str = "xxh3";

    pub(super) struct Backend(Xxh3);

    impl Backend {
        pub(super) fn new() -> Self {
            Self(Xxh3::new())
        }

        pub(super) fn update(&mut self, bytes: &[u8]) {
            self.0.update(bytes);
        }

        pub(super) fn finish(self) -> String {
            format!("{:032x}", self.0.digest128())
        }
    }
}

#[allow(dead_code)]
fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// The active checksum method name (`"md5"` or `"xxh3"`).
pub fn method() -> &'static str {
    backend::METHOD
}

/// Incremental checksum builder over raw bytes. Higher-level value hashing
/// folds child digests through this.
pub struct Checksummer {
    inner: backend::Backend,
}

impl Checksummer {
    pub fn new() -> Self {
        Self {
            inner: backend::Backend::new(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn update_len(&mut self, len: usize) {
        self.inner.update(&(len as u64).to_be_bytes());
    }

    /// Finish with the method prefix, e.g. `"md5:<hex>"`.
    pub fn digest(self) -> String {
        format!("{}:{}", backend::METHOD, self.inner.finish())
    }

    /// Finish as a bare hex string (used for content-addressed file names).
    pub fn digest_hex(self) -> String {
        self.inner.finish()
    }
}

impl Default for Checksummer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bare hex hash of a byte payload, used to name sidecar blobs.
pub(crate) fn blob_hash(bytes: &[u8]) -> String {
    let mut hasher = Checksummer::new();
    hasher.update(bytes);
    hasher.digest_hex()
}

/// Checksum of a single value.
pub fn checksum(value: &Value) -> Result<String> {
    let cfg = AlkymiConfig::get();
    checksum_with(value, &cfg)
}

/// Checksum of a value against an explicit configuration snapshot.
pub(crate) fn checksum_with(value: &Value, cfg: &AlkymiConfig) -> Result<String> {
    let mut hasher = Checksummer::new();
    match value {
        Value::Null => hasher.update(&[TAG_NULL]),
        Value::Bool(b) => {
            hasher.update(&[TAG_BOOL, u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(&[TAG_INT]);
            hasher.update(&i.to_be_bytes());
        }
        Value::Float(f) => {
            hasher.update(&[TAG_FLOAT]);
            hasher.update(&canonical_bits(*f).to_be_bytes());
        }
        Value::Str(s) => {
            hasher.update(&[TAG_STR]);
            hasher.update(s.as_bytes());
        }
        Value::Bytes(b) => {
            return Ok(checksum_from_bytes_hash(&blob_hash(b)));
        }
        Value::Seq(items) => {
            let mut hashed: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                hashed.push(checksum_with(item, cfg)?);
            }
            return Ok(checksum_seq_parts(hashed));
        }
        Value::Map(entries) => {
            let mut hashed: Vec<(String, String)> = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                hashed.push((checksum_with(key, cfg)?, checksum_with(val, cfg)?));
            }
            return Ok(checksum_map_entries(hashed));
        }
        Value::Set(items) => {
            let mut hashed: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                hashed.push(checksum_with(item, cfg)?);
            }
            return Ok(checksum_set_elements(hashed));
        }
        Value::Path(path) => {
            update_path(&mut hasher, path, cfg.file_checksum_method)?;
        }
        Value::Opaque(opaque) => {
            if !cfg.allow_opaque {
                return Err(AlkymiError::Checksum(format!(
                    "opaque value '{}' rejected: opaque fallback is disabled",
                    opaque.type_tag
                )));
            }
            return Ok(checksum_from_opaque_hash(
                &opaque.type_tag,
                &blob_hash(&opaque.bytes),
            ));
        }
    }
    Ok(hasher.digest())
}

/// Checksum of a byte value given the bare hash of its payload. Lets the
/// document-side checksum agree with the value-side one without rereading
/// blob contents.
pub(crate) fn checksum_from_bytes_hash(hash_hex: &str) -> String {
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_BYTES]);
    hasher.update(hash_hex.as_bytes());
    hasher.digest()
}

/// Opaque-value counterpart of [`checksum_from_bytes_hash`].
pub(crate) fn checksum_from_opaque_hash(type_tag: &str, hash_hex: &str) -> String {
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_OPAQUE]);
    hasher.update(type_tag.as_bytes());
    hasher.update(&[0x00]);
    hasher.update(hash_hex.as_bytes());
    hasher.digest()
}

/// Fold pre-computed element checksums as an ordered sequence.
pub(crate) fn checksum_seq_parts(parts: Vec<String>) -> String {
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_SEQ]);
    hasher.update_len(parts.len());
    for part in &parts {
        hasher.update(part.as_bytes());
    }
    hasher.digest()
}

/// Fold pre-computed map entry checksums, sorted by key hash.
pub(crate) fn checksum_map_entries(mut entries: Vec<(String, String)>) -> String {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_MAP]);
    hasher.update_len(entries.len());
    for (key_hash, value_hash) in &entries {
        let mut entry = Checksummer::new();
        entry.update(&[TAG_ENTRY]);
        entry.update(key_hash.as_bytes());
        entry.update(value_hash.as_bytes());
        hasher.update(entry.digest().as_bytes());
    }
    hasher.digest()
}

/// Fold pre-computed set element checksums, sorted lexicographically.
pub(crate) fn checksum_set_elements(mut elements: Vec<String>) -> String {
    elements.sort();
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_SET]);
    hasher.update_len(elements.len());
    for element in &elements {
        hasher.update(element.as_bytes());
    }
    hasher.digest()
}

/// Combine checksums into a single tuple checksum, order-sensitive with a
/// length prefix. Used for output tuples, per-ingredient input checksums and
/// foreach aggregates.
pub fn combine<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let parts: Vec<&str> = parts.into_iter().collect();
    let mut hasher = Checksummer::new();
    hasher.update(&[TAG_TUPLE]);
    hasher.update_len(parts.len());
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hasher.digest()
}

/// Fold a path value into a hasher: basename plus, for regular files, a
/// content (or mtime) component; for directories only the path string; for
/// missing paths a distinct tag.
fn update_path(hasher: &mut Checksummer, path: &Path, method: FileChecksumMethod) -> Result<()> {
    hasher.update(&[TAG_PATH]);
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    hasher.update(basename.as_bytes());
    hasher.update(&[0x00]);

    if path.is_dir() {
        hasher.update(&[TAG_DIR]);
        hasher.update(path.to_string_lossy().as_bytes());
        return Ok(());
    }
    if !path.exists() {
        hasher.update(&[TAG_MISSING]);
        return Ok(());
    }

    match method {
        FileChecksumMethod::Content => {
            hasher.update(&[TAG_FILE_CONTENT]);
            hasher.update(hash_file_contents(path)?.as_bytes());
        }
        FileChecksumMethod::Mtime => {
            hasher.update(&[TAG_FILE_MTIME]);
            let meta = std::fs::metadata(path).map_err(|e| {
                AlkymiError::Checksum(format!("cannot stat {}: {}", path.display(), e))
            })?;
            let mtime = meta.modified().map_err(|e| {
                AlkymiError::Checksum(format!("no mtime for {}: {}", path.display(), e))
            })?;
            let dur = mtime
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            hasher.update(&dur.as_secs().to_be_bytes());
            hasher.update(&dur.subsec_nanos().to_be_bytes());
        }
    }
    Ok(())
}

/// Bare hex hash of a file's byte contents, streamed.
pub(crate) fn hash_file_contents(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| AlkymiError::Checksum(format!("cannot open {}: {}", path.display(), e)))?;
    let mut hasher = Checksummer::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            AlkymiError::Checksum(format!("read error {}: {}", path.display(), e))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_guard;
    use crate::core::value::OpaqueValue;

    #[test]
    fn test_ak002_deterministic() {
        let v = Value::seq([Value::Int(1), Value::from("two"), Value::Float(3.0)]);
        assert_eq!(checksum(&v).unwrap(), checksum(&v).unwrap());
    }

    #[test]
    fn test_ak002_method_prefix() {
        let cs = checksum(&Value::Int(42)).unwrap();
        assert!(cs.starts_with(&format!("{}:", method())));
    }

    #[test]
    fn test_ak002_kinds_do_not_alias() {
        let one_int = checksum(&Value::Int(1)).unwrap();
        let one_float = checksum(&Value::Float(1.0)).unwrap();
        let one_str = checksum(&Value::from("1")).unwrap();
        assert_ne!(one_int, one_float);
        assert_ne!(one_int, one_str);
        assert_ne!(one_float, one_str);
    }

    #[test]
    fn test_ak002_str_and_bytes_distinct() {
        let s = checksum(&Value::from("ab")).unwrap();
        let b = checksum(&Value::Bytes(b"ab".to_vec())).unwrap();
        assert_ne!(s, b);
    }

    #[test]
    fn test_ak002_seq_length_prefix_prevents_collision() {
        let joined = checksum(&Value::seq(["ab"])).unwrap();
        let split = checksum(&Value::seq(["a", "b"])).unwrap();
        assert_ne!(joined, split);
    }

    #[test]
    fn test_ak002_map_order_insensitive() {
        let a = Value::map([("x", 1i64), ("y", 2i64)]);
        let b = Value::map([("y", 2i64), ("x", 1i64)]);
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
    }

    #[test]
    fn test_ak002_set_order_insensitive() {
        let a = Value::set(["p", "q"]);
        let b = Value::set(["q", "p"]);
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
    }

    #[test]
    fn test_ak002_nan_canonical() {
        let a = checksum(&Value::Float(f64::NAN)).unwrap();
        let b = checksum(&Value::Float(-(0.0f64 / 0.0))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ak002_file_content_changes_checksum() {
        let _guard = test_guard();
        crate::config::AlkymiConfig::reset();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"before").unwrap();
        let before = checksum(&Value::path(&path)).unwrap();
        std::fs::write(&path, b"after").unwrap();
        let after = checksum(&Value::path(&path)).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_ak002_missing_file_distinct_from_empty() {
        let _guard = test_guard();
        crate::config::AlkymiConfig::reset();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.bin");
        let missing = checksum(&Value::path(&path)).unwrap();
        std::fs::write(&path, b"").unwrap();
        let empty = checksum(&Value::path(&path)).unwrap();
        assert_ne!(missing, empty);
    }

    #[test]
    fn test_ak002_directory_hashed_by_path_only() {
        let _guard = test_guard();
        crate::config::AlkymiConfig::reset();
        let dir = tempfile::tempdir().unwrap();
        let before = checksum(&Value::path(dir.path())).unwrap();
        std::fs::write(dir.path().join("new.txt"), b"contents").unwrap();
        let after = checksum(&Value::path(dir.path())).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_ak002_mtime_method() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamped.txt");
        std::fs::write(&path, b"same").unwrap();
        crate::config::AlkymiConfig::update(|c| {
            c.file_checksum_method = FileChecksumMethod::Mtime
        });
        let a = checksum(&Value::path(&path)).unwrap();
        let b = checksum(&Value::path(&path)).unwrap();
        assert_eq!(a, b);
        crate::config::AlkymiConfig::reset();
        // Content and mtime methods never produce the same fingerprint
        let content = checksum(&Value::path(&path)).unwrap();
        assert_ne!(a, content);
    }

    #[test]
    fn test_ak002_opaque_respects_config() {
        let _guard = test_guard();
        crate::config::AlkymiConfig::reset();
        let v = Value::Opaque(OpaqueValue::new("demo", vec![1, 2, 3]));
        assert!(checksum(&v).is_ok());
        crate::config::AlkymiConfig::update(|c| c.allow_opaque = false);
        let result = checksum(&v);
        crate::config::AlkymiConfig::reset();
        assert!(matches!(result, Err(AlkymiError::Checksum(_))));
    }

    #[test]
    fn test_ak002_combine_sensitive_to_order_and_length() {
        let a = combine(["md5:aaa", "md5:bbb"]);
        let b = combine(["md5:bbb", "md5:aaa"]);
        let c = combine(["md5:aaa"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, combine(["md5:aaa", "md5:bbb"]));
    }

    #[test]
    fn test_ak002_bytes_hash_agrees_with_blob_helper() {
        let payload = b"payload".to_vec();
        let via_value = checksum(&Value::Bytes(payload.clone())).unwrap();
        let via_hash = checksum_from_bytes_hash(&blob_hash(&payload));
        assert_eq!(via_value, via_hash);
    }
}
