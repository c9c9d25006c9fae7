//! AK-004: Process-global engine configuration.
//!
//! A single configuration instance governs caching for the whole process so
//! that every recipe, wherever it was built, agrees on the cache root and
//! checksum method. Relative and absolute invocations resolve to the same
//! root to avoid split caches.

use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::RwLock;

/// Default cache root, resolved against the current directory.
pub const DEFAULT_CACHE_DIR: &str = ".alkymi_cache";

/// How external files referenced by `Value::Path` are fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChecksumMethod {
    /// Hash the file's byte contents (default).
    Content,
    /// Hash the file's modification timestamp. Faster, less precise.
    Mtime,
}

/// Global engine configuration.
#[derive(Debug, Clone)]
pub struct AlkymiConfig {
    /// Master switch for disk persistence. When false, nothing is written to
    /// or read from the cache root.
    pub cache: bool,
    /// Override for the cache root directory.
    pub cache_path: Option<PathBuf>,
    /// Fingerprinting method for external files.
    pub file_checksum_method: FileChecksumMethod,
    /// Whether opaque values may be checksummed and serialized. When false,
    /// such values error at checksum/serialize time.
    pub allow_opaque: bool,
}

impl Default for AlkymiConfig {
    fn default() -> Self {
        Self {
            cache: true,
            cache_path: None,
            file_checksum_method: FileChecksumMethod::Content,
            allow_opaque: true,
        }
    }
}

static CONFIG: Lazy<RwLock<AlkymiConfig>> = Lazy::new(|| RwLock::new(AlkymiConfig::default()));

impl AlkymiConfig {
    /// Snapshot of the current configuration.
    pub fn get() -> AlkymiConfig {
        CONFIG.read().expect("config lock poisoned").clone()
    }

    /// Mutate the global configuration.
    pub fn update(f: impl FnOnce(&mut AlkymiConfig)) {
        let mut cfg = CONFIG.write().expect("config lock poisoned");
        f(&mut cfg);
    }

    /// Reset the global configuration to defaults.
    pub fn reset() {
        Self::update(|cfg| *cfg = AlkymiConfig::default());
    }

    /// The effective cache root. The default is `./.alkymi_cache` resolved
    /// against the current directory; canonicalization keeps relative and
    /// absolute invocations pointing at the same directory.
    pub fn cache_root(&self) -> PathBuf {
        let root = match &self.cache_path {
            Some(path) => path.clone(),
            None => std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(DEFAULT_CACHE_DIR),
        };
        // The root may not exist yet; canonicalize the closest existing
        // ancestor instead of failing.
        match root.canonicalize() {
            Ok(canonical) => canonical,
            Err(_) => {
                let parent = root.parent().map(|p| p.to_path_buf());
                let name = root.file_name().map(|n| n.to_os_string());
                match (parent, name) {
                    (Some(parent), Some(name)) => match parent.canonicalize() {
                        Ok(parent) => parent.join(name),
                        Err(_) => root,
                    },
                    _ => root,
                }
            }
        }
    }
}

/// Serializes tests that mutate the global configuration.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Acquire the config test lock, surviving poisoning from failed tests.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run a test body against a fresh configuration with an isolated cache
/// root, holding the config test lock throughout.
#[cfg(test)]
pub(crate) fn with_temp_cache(f: impl FnOnce(&std::path::Path)) {
    let _guard = test_guard();
    AlkymiConfig::reset();
    let dir = tempfile::tempdir().unwrap();
    AlkymiConfig::update(|cfg| cfg.cache_path = Some(dir.path().to_path_buf()));
    f(dir.path());
    AlkymiConfig::reset();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ak004_defaults() {
        let _guard = test_guard();
        AlkymiConfig::reset();
        let cfg = AlkymiConfig::get();
        assert!(cfg.cache);
        assert!(cfg.cache_path.is_none());
        assert_eq!(cfg.file_checksum_method, FileChecksumMethod::Content);
        assert!(cfg.allow_opaque);
    }

    #[test]
    fn test_ak004_update_and_reset() {
        let _guard = test_guard();
        AlkymiConfig::update(|cfg| cfg.cache = false);
        assert!(!AlkymiConfig::get().cache);
        AlkymiConfig::reset();
        assert!(AlkymiConfig::get().cache);
    }

    #[test]
    fn test_ak004_cache_root_override() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        AlkymiConfig::update(|cfg| cfg.cache_path = Some(dir.path().to_path_buf()));
        let root = AlkymiConfig::get().cache_root();
        assert_eq!(root, dir.path().canonicalize().unwrap());
        AlkymiConfig::reset();
    }

    #[test]
    fn test_ak004_cache_root_relative_and_absolute_agree() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("cache");
        std::fs::create_dir_all(&sub).unwrap();

        AlkymiConfig::update(|cfg| cfg.cache_path = Some(sub.clone()));
        let absolute = AlkymiConfig::get().cache_root();

        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        AlkymiConfig::update(|cfg| cfg.cache_path = Some(PathBuf::from("cache")));
        let relative = AlkymiConfig::get().cache_root();
        std::env::set_current_dir(prev).unwrap();

        assert_eq!(absolute, relative);
        AlkymiConfig::reset();
    }

    #[test]
    fn test_ak004_cache_root_nonexistent_keeps_name() {
        let _guard = test_guard();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-yet-created");
        AlkymiConfig::update(|cfg| cfg.cache_path = Some(missing.clone()));
        let root = AlkymiConfig::get().cache_root();
        assert_eq!(root.file_name().unwrap(), "not-yet-created");
        AlkymiConfig::reset();
    }
}
