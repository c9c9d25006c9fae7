//! AK-007: Persistent cache store.
//!
//! One directory per recipe under the cache root, holding `meta.json` (the
//! evaluation record plus output documents) and content-addressed sidecar
//! blobs. Blobs are flushed before `meta.json` is swapped into place via a
//! temp-file rename, so a crash mid-store leaves the previous record intact.
//! Unreadable metadata is treated as "not evaluated", never as an error: a
//! poisoned cache must not block progress.

pub mod serialization;

use crate::error::{AlkymiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Doc;
use serialization::OutputHandle;
use std::path::{Path, PathBuf};
use tracing::warn;

const META_FILE: &str = "meta.json";
const SCHEMA_VERSION: &str = "1";

/// Per-recipe evaluation record, persisted as `meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub schema: String,
    pub name: String,
    /// One combined checksum per ingredient, in ingredient order.
    pub input_checksums: Vec<String>,
    /// One checksum per output, in tuple order.
    pub output_checksums: Vec<String>,
    pub function_checksum: String,
    /// Output documents, one per output (see [`serialization`]).
    pub outputs: Vec<Doc>,
    /// Extra per-element state for foreach recipes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped: Option<MappedRecord>,
}

impl Record {
    pub fn new(
        name: &str,
        input_checksums: Vec<String>,
        output_checksums: Vec<String>,
        function_checksum: String,
        outputs: Vec<Doc>,
    ) -> Self {
        Self {
            schema: SCHEMA_VERSION.to_string(),
            name: name.to_string(),
            input_checksums,
            output_checksums,
            function_checksum,
            outputs,
            mapped: None,
        }
    }
}

/// Shape of a foreach recipe's mapped input at record time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappedKind {
    Sequence,
    Mapping,
}

/// Per-element memoization state for a foreach recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappedRecord {
    pub kind: MappedKind,
    /// Order-preserving checksum over the whole mapped input.
    pub aggregate_checksum: String,
    pub elements: Vec<ElementRecord>,
}

/// One evaluated element of a mapped input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementRecord {
    /// Key document for mapping elements; absent for sequence elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Doc>,
    pub input_checksum: String,
    pub output_checksum: String,
    /// The element's output document, reused verbatim when the element is
    /// unchanged so cached bytes stay identical across runs.
    pub output: Doc,
}

/// Directory holding a recipe's cache entry. Recipe names become directory
/// names; separators are flattened and the `.`/`..` path components are
/// remapped so an entry can never resolve outside the root.
pub fn recipe_dir(root: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect();
    let safe = match safe.as_str() {
        "" => "_".to_string(),
        "." | ".." => format!("_{}", safe),
        _ => safe,
    };
    root.join(safe)
}

/// Load a recipe's record. Returns `None` when the entry is missing or
/// unreadable; corruption is logged and treated as "not evaluated".
pub fn load_record(root: &Path, name: &str) -> Option<Record> {
    let path = recipe_dir(root, name).join(META_FILE);
    if !path.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            warn!("cannot read {}: {}, treating as not evaluated", path.display(), e);
            return None;
        }
    };
    let record: Record = match serde_json::from_str(&content) {
        Ok(record) => record,
        Err(e) => {
            warn!("invalid cache metadata {}: {}, treating as not evaluated", path.display(), e);
            return None;
        }
    };
    if record.schema != SCHEMA_VERSION || record.name != name {
        warn!(
            "stale cache metadata {} (schema {}, name {}), treating as not evaluated",
            path.display(),
            record.schema,
            record.name
        );
        return None;
    }
    Some(record)
}

/// Persist a record and its sidecar blobs. Blobs are written first (ones
/// already present are skipped, they are content-addressed), then
/// `meta.json` is written to a temp name and renamed into place.
pub fn store(root: &Path, record: &Record, blobs: &[(String, Vec<u8>)]) -> Result<()> {
    let dir = recipe_dir(root, &record.name);
    std::fs::create_dir_all(&dir)
        .map_err(|e| AlkymiError::Serialization(format!("cannot create {}: {}", dir.display(), e)))?;

    for (hash, bytes) in blobs {
        let blob_path = dir.join(serialization::blob_file_name(hash));
        if blob_path.exists() {
            continue;
        }
        std::fs::write(&blob_path, bytes).map_err(|e| {
            AlkymiError::Serialization(format!("cannot write {}: {}", blob_path.display(), e))
        })?;
    }

    let json = serde_json::to_string_pretty(record)
        .map_err(|e| AlkymiError::Serialization(format!("cannot encode record: {}", e)))?;
    let meta_path = dir.join(META_FILE);
    let tmp_path = dir.join(format!("{}.tmp", META_FILE));
    std::fs::write(&tmp_path, &json).map_err(|e| {
        AlkymiError::Serialization(format!("cannot write {}: {}", tmp_path.display(), e))
    })?;
    std::fs::rename(&tmp_path, &meta_path).map_err(|e| {
        AlkymiError::Serialization(format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            meta_path.display(),
            e
        ))
    })?;
    Ok(())
}

/// Lazy handles over a record's outputs. No blob is read here.
pub fn output_handles(root: &Path, record: &Record) -> Vec<OutputHandle> {
    let dir = recipe_dir(root, &record.name);
    record
        .outputs
        .iter()
        .map(|doc| OutputHandle::new(doc.clone(), dir.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record(name: &str) -> Record {
        Record::new(
            name,
            vec!["md5:in".to_string()],
            vec!["md5:out".to_string()],
            "md5:func".to_string(),
            vec![serde_json::json!(42)],
        )
    }

    #[test]
    fn test_ak007_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let record = make_record("answer");
        store(dir.path(), &record, &[]).unwrap();

        let loaded = load_record(dir.path(), "answer").unwrap();
        assert_eq!(loaded.name, "answer");
        assert_eq!(loaded.output_checksums, vec!["md5:out"]);
        assert_eq!(loaded.outputs, vec![serde_json::json!(42)]);
    }

    #[test]
    fn test_ak007_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_record(dir.path(), "ghost").is_none());
    }

    #[test]
    fn test_ak007_corrupt_meta_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let entry = recipe_dir(dir.path(), "broken");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join(META_FILE), b"{not json").unwrap();
        assert!(load_record(dir.path(), "broken").is_none());
    }

    #[test]
    fn test_ak007_name_mismatch_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let record = make_record("original");
        store(dir.path(), &record, &[]).unwrap();
        // Copy the entry under a different directory name
        let from = recipe_dir(dir.path(), "original").join(META_FILE);
        let to_dir = recipe_dir(dir.path(), "impostor");
        std::fs::create_dir_all(&to_dir).unwrap();
        std::fs::copy(from, to_dir.join(META_FILE)).unwrap();
        assert!(load_record(dir.path(), "impostor").is_none());
    }

    #[test]
    fn test_ak007_atomic_write_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let record = make_record("atomic");
        store(dir.path(), &record, &[]).unwrap();
        let entry = recipe_dir(dir.path(), "atomic");
        assert!(entry.join(META_FILE).exists());
        assert!(!entry.join(format!("{}.tmp", META_FILE)).exists());
    }

    #[test]
    fn test_ak007_blobs_written_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let record = make_record("blobby");
        let blobs = vec![("cafe01".to_string(), b"payload".to_vec())];
        store(dir.path(), &record, &blobs).unwrap();

        let blob_path = recipe_dir(dir.path(), "blobby").join("cafe01.bin");
        assert!(blob_path.exists());
        let first_mtime = std::fs::metadata(&blob_path).unwrap().modified().unwrap();

        // Second store with the same content-addressed blob leaves it alone
        store(dir.path(), &record, &blobs).unwrap();
        let second_mtime = std::fs::metadata(&blob_path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }

    #[test]
    fn test_ak007_recipe_dir_flattens_separators() {
        let dir = recipe_dir(Path::new("/cache"), "group/item");
        assert_eq!(dir, PathBuf::from("/cache/group_item"));
    }

    #[test]
    fn test_ak007_recipe_dir_dot_names_stay_inside_root() {
        let root = Path::new("/cache");
        for name in ["..", ".", ""] {
            let dir = recipe_dir(root, name);
            assert!(dir.starts_with(root), "{} escaped the root", name);
            assert!(
                !dir.components().any(|c| matches!(
                    c,
                    std::path::Component::ParentDir | std::path::Component::CurDir
                )),
                "{:?} still contains a relative component",
                dir
            );
        }
        assert_eq!(recipe_dir(root, ".."), PathBuf::from("/cache/_.."));
        assert_eq!(recipe_dir(root, "."), PathBuf::from("/cache/_."));
    }

    #[test]
    fn test_ak007_store_overwrites_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path(), &make_record("evolving"), &[]).unwrap();
        let mut updated = make_record("evolving");
        updated.output_checksums = vec!["md5:changed".to_string()];
        store(dir.path(), &updated, &[]).unwrap();
        let loaded = load_record(dir.path(), "evolving").unwrap();
        assert_eq!(loaded.output_checksums, vec!["md5:changed"]);
    }
}
