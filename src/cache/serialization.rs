//! AK-006: Output documents and sidecar blobs.
//!
//! Outputs persist as a JSON tree mirroring their structure. JSON-native
//! primitives inline; byte payloads land in content-addressed sidecar files
//! referenced by `"::blob::<hexhash>"` tokens. Containers recurse; mappings
//! keep non-string keys by storing entry pairs. Decoding returns handles
//! that defer blob reads until a value is consumed, so status checks never
//! load heavy payloads.

use crate::checksum;
use crate::config::AlkymiConfig;
use crate::core::value::{OpaqueValue, Outputs, Value};
use crate::error::{AlkymiError, Result};
use serde_json::{json, Value as Doc};
use std::path::{Path, PathBuf};

/// Token prefix marking a sidecar blob reference.
pub const BLOB_TOKEN: &str = "::blob::";

const KEY_MAP: &str = "__map__";
const KEY_SET: &str = "__set__";
const KEY_PATH: &str = "__path__";
const KEY_FLOAT: &str = "__float__";
const KEY_STR: &str = "__str__";
const KEY_OPAQUE: &str = "__opaque__";

/// Encoded form of an output tuple: one document and one checksum per
/// output, plus the blob payloads the documents reference.
pub(crate) struct EncodedOutputs {
    pub docs: Vec<Doc>,
    pub checksums: Vec<String>,
    pub blobs: Vec<(String, Vec<u8>)>,
}

/// Encode an output tuple into documents plus pending blob payloads.
pub(crate) fn encode_outputs(outputs: &Outputs, cfg: &AlkymiConfig) -> Result<EncodedOutputs> {
    let mut blobs = Vec::new();
    let mut docs = Vec::with_capacity(outputs.len());
    for value in outputs.iter() {
        docs.push(encode_value(value, &mut blobs, cfg)?);
    }
    let mut checksums = Vec::with_capacity(docs.len());
    for value in outputs.iter() {
        checksums.push(checksum::checksum_with(value, cfg)?);
    }
    Ok(EncodedOutputs {
        docs,
        checksums,
        blobs,
    })
}

/// Encode a single value, collecting blob payloads along the way.
pub(crate) fn encode_value(
    value: &Value,
    blobs: &mut Vec<(String, Vec<u8>)>,
    cfg: &AlkymiConfig,
) -> Result<Doc> {
    Ok(match value {
        Value::Null => Doc::Null,
        Value::Bool(b) => Doc::Bool(*b),
        Value::Int(i) => json!(*i),
        Value::Float(f) => {
            if f.is_nan() {
                json!({ KEY_FLOAT: "nan" })
            } else if *f == f64::INFINITY {
                json!({ KEY_FLOAT: "inf" })
            } else if *f == f64::NEG_INFINITY {
                json!({ KEY_FLOAT: "-inf" })
            } else {
                json!(*f)
            }
        }
        Value::Str(s) => {
            // A real string may collide with the blob token; shield it.
            if s.starts_with(BLOB_TOKEN) {
                json!({ KEY_STR: s })
            } else {
                Doc::String(s.clone())
            }
        }
        Value::Bytes(bytes) => {
            let hash = checksum::blob_hash(bytes);
            let token = format!("{}{}", BLOB_TOKEN, hash);
            blobs.push((hash, bytes.clone()));
            Doc::String(token)
        }
        Value::Seq(items) => {
            let mut docs = Vec::with_capacity(items.len());
            for item in items {
                docs.push(encode_value(item, blobs, cfg)?);
            }
            Doc::Array(docs)
        }
        Value::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (key, val) in entries {
                pairs.push(Doc::Array(vec![
                    encode_value(key, blobs, cfg)?,
                    encode_value(val, blobs, cfg)?,
                ]));
            }
            json!({ KEY_MAP: pairs })
        }
        Value::Set(items) => {
            let mut docs = Vec::with_capacity(items.len());
            for item in items {
                docs.push(encode_value(item, blobs, cfg)?);
            }
            json!({ KEY_SET: docs })
        }
        Value::Path(path) => json!({ KEY_PATH: path.to_string_lossy() }),
        Value::Opaque(opaque) => {
            if !cfg.allow_opaque {
                return Err(AlkymiError::Serialization(format!(
                    "cannot serialize opaque value '{}': opaque fallback is disabled",
                    opaque.type_tag
                )));
            }
            let hash = checksum::blob_hash(&opaque.bytes);
            let token = format!("{}{}", BLOB_TOKEN, hash);
            blobs.push((hash, opaque.bytes.clone()));
            json!({ KEY_OPAQUE: { "type": opaque.type_tag, "data": token } })
        }
    })
}

/// File name of a sidecar blob within a recipe directory.
pub(crate) fn blob_file_name(hash: &str) -> String {
    format!("{}.bin", hash)
}

fn blob_hash_of_token(token: &str) -> Option<&str> {
    token.strip_prefix(BLOB_TOKEN)
}

/// Whether every blob a document references is present on disk. Used to
/// reject stale reuse candidates instead of failing later at decode time.
pub(crate) fn doc_blobs_present(doc: &Doc, dir: &Path) -> bool {
    match doc {
        Doc::String(s) => match blob_hash_of_token(s) {
            Some(hash) => dir.join(blob_file_name(hash)).exists(),
            None => true,
        },
        Doc::Array(items) => items.iter().all(|item| doc_blobs_present(item, dir)),
        Doc::Object(fields) => fields.values().all(|item| doc_blobs_present(item, dir)),
        _ => true,
    }
}

/// Handle to one persisted output. Holds the document only; the sidecar
/// blobs it references are read when [`OutputHandle::load`] is called.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    doc: Doc,
    dir: PathBuf,
}

impl OutputHandle {
    pub(crate) fn new(doc: Doc, dir: PathBuf) -> Self {
        Self { doc, dir }
    }

    /// Materialize the value, reading referenced blobs.
    pub fn load(&self) -> Result<Value> {
        decode_document(&self.doc, &self.dir)
    }
}

/// Decode a document back into a value, reading blobs from `dir`.
pub(crate) fn decode_document(doc: &Doc, dir: &Path) -> Result<Value> {
    let cfg = AlkymiConfig::get();
    decode_inner(doc, dir, &cfg)
}

fn read_blob(dir: &Path, hash: &str) -> Result<Vec<u8>> {
    let path = dir.join(blob_file_name(hash));
    std::fs::read(&path)
        .map_err(|e| AlkymiError::Serialization(format!("cannot read blob {}: {}", path.display(), e)))
}

fn decode_inner(doc: &Doc, dir: &Path, cfg: &AlkymiConfig) -> Result<Value> {
    Ok(match doc {
        Doc::Null => Value::Null,
        Doc::Bool(b) => Value::Bool(*b),
        Doc::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(AlkymiError::Serialization(format!(
                    "unrepresentable number in document: {}",
                    n
                )));
            }
        }
        Doc::String(s) => match blob_hash_of_token(s) {
            Some(hash) => Value::Bytes(read_blob(dir, hash)?),
            None => Value::Str(s.clone()),
        },
        Doc::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(decode_inner(item, dir, cfg)?);
            }
            Value::Seq(values)
        }
        Doc::Object(fields) => {
            if let Some(pairs) = fields.get(KEY_MAP) {
                let pairs = pairs.as_array().ok_or_else(|| {
                    AlkymiError::Serialization("malformed __map__ document".to_string())
                })?;
                let mut map = indexmap::IndexMap::with_capacity(pairs.len());
                for pair in pairs {
                    let entry = pair.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                        AlkymiError::Serialization("malformed __map__ entry".to_string())
                    })?;
                    map.insert(
                        decode_inner(&entry[0], dir, cfg)?,
                        decode_inner(&entry[1], dir, cfg)?,
                    );
                }
                Value::Map(map)
            } else if let Some(items) = fields.get(KEY_SET) {
                let items = items.as_array().ok_or_else(|| {
                    AlkymiError::Serialization("malformed __set__ document".to_string())
                })?;
                let mut set = indexmap::IndexSet::with_capacity(items.len());
                for item in items {
                    set.insert(decode_inner(item, dir, cfg)?);
                }
                Value::Set(set)
            } else if let Some(path) = fields.get(KEY_PATH) {
                let path = path.as_str().ok_or_else(|| {
                    AlkymiError::Serialization("malformed __path__ document".to_string())
                })?;
                Value::Path(PathBuf::from(path))
            } else if let Some(special) = fields.get(KEY_FLOAT) {
                match special.as_str() {
                    Some("nan") => Value::Float(f64::NAN),
                    Some("inf") => Value::Float(f64::INFINITY),
                    Some("-inf") => Value::Float(f64::NEG_INFINITY),
                    _ => {
                        return Err(AlkymiError::Serialization(
                            "malformed __float__ document".to_string(),
                        ))
                    }
                }
            } else if let Some(s) = fields.get(KEY_STR) {
                let s = s.as_str().ok_or_else(|| {
                    AlkymiError::Serialization("malformed __str__ document".to_string())
                })?;
                Value::Str(s.to_string())
            } else if let Some(opaque) = fields.get(KEY_OPAQUE) {
                if !cfg.allow_opaque {
                    return Err(AlkymiError::Serialization(
                        "cannot deserialize opaque value: opaque fallback is disabled".to_string(),
                    ));
                }
                let type_tag = opaque
                    .get("type")
                    .and_then(Doc::as_str)
                    .ok_or_else(|| {
                        AlkymiError::Serialization("malformed __opaque__ document".to_string())
                    })?;
                let token = opaque
                    .get("data")
                    .and_then(Doc::as_str)
                    .and_then(blob_hash_of_token)
                    .ok_or_else(|| {
                        AlkymiError::Serialization("malformed __opaque__ document".to_string())
                    })?;
                Value::Opaque(OpaqueValue::new(type_tag, read_blob(dir, token)?))
            } else {
                return Err(AlkymiError::Serialization(format!(
                    "unknown document marker: {}",
                    doc
                )));
            }
        }
    })
}

/// Checksum a persisted output from its document without reading blob
/// payloads. Agrees with the value checksum by construction: blob tokens
/// fold their content hash, path markers re-hash the referenced file (this
/// is where external-file change detection happens), everything else hashes
/// as the inline value would. A missing sidecar blob is a checksum error.
pub(crate) fn checksum_of_document(doc: &Doc, dir: &Path, cfg: &AlkymiConfig) -> Result<String> {
    Ok(match doc {
        Doc::Null => checksum::checksum_with(&Value::Null, cfg)?,
        Doc::Bool(b) => checksum::checksum_with(&Value::Bool(*b), cfg)?,
        Doc::Number(n) => {
            if let Some(i) = n.as_i64() {
                checksum::checksum_with(&Value::Int(i), cfg)?
            } else if let Some(f) = n.as_f64() {
                checksum::checksum_with(&Value::Float(f), cfg)?
            } else {
                return Err(AlkymiError::Checksum(format!(
                    "unrepresentable number in document: {}",
                    n
                )));
            }
        }
        Doc::String(s) => match blob_hash_of_token(s) {
            Some(hash) => {
                if !dir.join(blob_file_name(hash)).exists() {
                    return Err(AlkymiError::Checksum(format!(
                        "missing sidecar blob {} in {}",
                        hash,
                        dir.display()
                    )));
                }
                checksum::checksum_from_bytes_hash(hash)
            }
            None => checksum::checksum_with(&Value::Str(s.clone()), cfg)?,
        },
        Doc::Array(items) => {
            let mut hashed = Vec::with_capacity(items.len());
            for item in items {
                hashed.push(checksum_of_document(item, dir, cfg)?);
            }
            checksum::checksum_seq_parts(hashed)
        }
        Doc::Object(fields) => {
            if let Some(pairs) = fields.get(KEY_MAP) {
                let pairs = pairs.as_array().ok_or_else(|| {
                    AlkymiError::Checksum("malformed __map__ document".to_string())
                })?;
                let mut hashed = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    let entry = pair.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                        AlkymiError::Checksum("malformed __map__ entry".to_string())
                    })?;
                    hashed.push((
                        checksum_of_document(&entry[0], dir, cfg)?,
                        checksum_of_document(&entry[1], dir, cfg)?,
                    ));
                }
                checksum::checksum_map_entries(hashed)
            } else if let Some(items) = fields.get(KEY_SET) {
                let items = items.as_array().ok_or_else(|| {
                    AlkymiError::Checksum("malformed __set__ document".to_string())
                })?;
                let mut hashed = Vec::with_capacity(items.len());
                for item in items {
                    hashed.push(checksum_of_document(item, dir, cfg)?);
                }
                checksum::checksum_set_elements(hashed)
            } else if let Some(path) = fields.get(KEY_PATH) {
                let path = path.as_str().ok_or_else(|| {
                    AlkymiError::Checksum("malformed __path__ document".to_string())
                })?;
                checksum::checksum_with(&Value::Path(PathBuf::from(path)), cfg)?
            } else if fields.contains_key(KEY_FLOAT) {
                let value = decode_inner(doc, dir, cfg)?;
                checksum::checksum_with(&value, cfg)?
            } else if let Some(s) = fields.get(KEY_STR) {
                let s = s.as_str().ok_or_else(|| {
                    AlkymiError::Checksum("malformed __str__ document".to_string())
                })?;
                checksum::checksum_with(&Value::Str(s.to_string()), cfg)?
            } else if let Some(opaque) = fields.get(KEY_OPAQUE) {
                if !cfg.allow_opaque {
                    return Err(AlkymiError::Checksum(
                        "opaque value rejected: opaque fallback is disabled".to_string(),
                    ));
                }
                let type_tag = opaque.get("type").and_then(Doc::as_str).ok_or_else(|| {
                    AlkymiError::Checksum("malformed __opaque__ document".to_string())
                })?;
                let hash = opaque
                    .get("data")
                    .and_then(Doc::as_str)
                    .and_then(blob_hash_of_token)
                    .ok_or_else(|| {
                        AlkymiError::Checksum("malformed __opaque__ document".to_string())
                    })?;
                if !dir.join(blob_file_name(hash)).exists() {
                    return Err(AlkymiError::Checksum(format!(
                        "missing sidecar blob {} in {}",
                        hash,
                        dir.display()
                    )));
                }
                checksum::checksum_from_opaque_hash(type_tag, hash)
            } else {
                return Err(AlkymiError::Checksum(format!(
                    "unknown document marker: {}",
                    doc
                )));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_guard;

    fn encode_one(value: &Value, dir: &Path) -> Doc {
        let cfg = AlkymiConfig::get();
        let mut blobs = Vec::new();
        let doc = encode_value(value, &mut blobs, &cfg).unwrap();
        for (hash, bytes) in blobs {
            std::fs::write(dir.join(blob_file_name(&hash)), bytes).unwrap();
        }
        doc
    }

    fn roundtrip(value: &Value) -> Value {
        let dir = tempfile::tempdir().unwrap();
        let doc = encode_one(value, dir.path());
        decode_document(&doc, dir.path()).unwrap()
    }

    #[test]
    fn test_ak006_roundtrip_primitives() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-9),
            Value::Float(2.5),
            Value::from("hello"),
            Value::path("/tmp/data.bin"),
        ] {
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn test_ak006_roundtrip_float_specials() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        assert_eq!(roundtrip(&Value::Float(f64::INFINITY)), Value::Float(f64::INFINITY));
        assert_eq!(
            roundtrip(&Value::Float(f64::NEG_INFINITY)),
            Value::Float(f64::NEG_INFINITY)
        );
        assert_eq!(roundtrip(&Value::Float(f64::NAN)), Value::Float(f64::NAN));
    }

    #[test]
    fn test_ak006_roundtrip_containers() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let value = Value::map([
            (Value::Int(1), Value::seq(["a", "b"])),
            (Value::from("k"), Value::set([10i64, 20])),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_ak006_bytes_become_blob_token() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let cfg = AlkymiConfig::get();
        let mut blobs = Vec::new();
        let doc = encode_value(&Value::Bytes(b"payload".to_vec()), &mut blobs, &cfg).unwrap();
        let token = doc.as_str().unwrap();
        assert!(token.starts_with(BLOB_TOKEN));
        assert_eq!(blobs.len(), 1);
        assert_eq!(token, format!("{}{}", BLOB_TOKEN, blobs[0].0));
    }

    #[test]
    fn test_ak006_string_colliding_with_token_is_shielded() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let tricky = Value::from(format!("{}cafe", BLOB_TOKEN));
        assert_eq!(roundtrip(&tricky), tricky);
    }

    #[test]
    fn test_ak006_handle_defers_blob_read() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let dir = tempfile::tempdir().unwrap();
        let doc = encode_one(&Value::Bytes(b"big payload".to_vec()), dir.path());

        // Remove the sidecar: building a handle must still succeed.
        for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
            std::fs::remove_file(entry.path()).unwrap();
        }
        let handle = OutputHandle::new(doc, dir.path().to_path_buf());
        let result = handle.load();
        assert!(matches!(result, Err(AlkymiError::Serialization(_))));
    }

    #[test]
    fn test_ak006_document_checksum_matches_value_checksum() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let cfg = AlkymiConfig::get();
        let dir = tempfile::tempdir().unwrap();
        let external = dir.path().join("ext.txt");
        std::fs::write(&external, b"external contents").unwrap();

        let value = Value::seq([
            Value::Int(5),
            Value::Bytes(b"blobbed".to_vec()),
            Value::path(&external),
            Value::map([("k", "v")]),
        ]);
        let doc = encode_one(&value, dir.path());
        let from_doc = checksum_of_document(&doc, dir.path(), &cfg).unwrap();
        let from_value = crate::checksum::checksum(&value).unwrap();
        assert_eq!(from_doc, from_value);
    }

    #[test]
    fn test_ak006_document_checksum_sees_external_file_change() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let cfg = AlkymiConfig::get();
        let dir = tempfile::tempdir().unwrap();
        let external = dir.path().join("ext.txt");
        std::fs::write(&external, b"v1").unwrap();

        let doc = encode_one(&Value::path(&external), dir.path());
        let before = checksum_of_document(&doc, dir.path(), &cfg).unwrap();
        std::fs::write(&external, b"v2").unwrap();
        let after = checksum_of_document(&doc, dir.path(), &cfg).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_ak006_missing_blob_is_checksum_error() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let cfg = AlkymiConfig::get();
        let dir = tempfile::tempdir().unwrap();
        let doc = Doc::String(format!("{}deadbeef", BLOB_TOKEN));
        let result = checksum_of_document(&doc, dir.path(), &cfg);
        assert!(matches!(result, Err(AlkymiError::Checksum(_))));
    }

    #[test]
    fn test_ak006_opaque_roundtrip_and_config_gate() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let value = Value::Opaque(OpaqueValue::new("demo/v1", vec![9, 8, 7]));
        assert_eq!(roundtrip(&value), value);

        AlkymiConfig::update(|c| c.allow_opaque = false);
        let cfg = AlkymiConfig::get();
        let mut blobs = Vec::new();
        let result = encode_value(&value, &mut blobs, &cfg);
        AlkymiConfig::reset();
        assert!(matches!(result, Err(AlkymiError::Serialization(_))));
    }

    #[test]
    fn test_ak006_unknown_marker_rejected() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let dir = tempfile::tempdir().unwrap();
        let doc = json!({ "__custom__": 1 });
        assert!(decode_document(&doc, dir.path()).is_err());
    }
}
