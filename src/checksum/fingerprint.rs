//! AK-003: Bound-function fingerprints.
//!
//! A recipe is dirty when the function behind it changes. Without bytecode
//! introspection, the fingerprint is assembled from what identifies a Rust
//! closure: its compiler type name (unique per closure site), an explicit
//! body-version token, and the declared constants, default arguments and
//! captured callables it closes over. Anything not declared, in particular
//! module-level globals, is excluded by construction.

use crate::checksum::Checksummer;
use crate::core::value::{canonical_bits, Value};

const TAG_FN: u8 = 0x11;
const TAG_CONST_PATH: u8 = 0x12;

/// Stable fingerprint of a bound function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FnFingerprint {
    checksum: String,
}

impl FnFingerprint {
    /// Start a fingerprint from a closure's type identity.
    pub fn of<F: ?Sized>() -> FingerprintBuilder {
        FingerprintBuilder::for_identity(std::any::type_name::<F>())
    }

    /// Start a fingerprint from an explicit identity string.
    pub fn named(identity: &str) -> FingerprintBuilder {
        FingerprintBuilder::for_identity(identity)
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

/// Builder collecting the components that make up a fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    identity: String,
    version: Option<String>,
    captures: Vec<(String, String)>,
    callables: Vec<(String, String)>,
    defaults: Vec<(String, String)>,
}

impl FingerprintBuilder {
    fn for_identity(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            version: None,
            captures: Vec::new(),
            callables: Vec::new(),
            defaults: Vec::new(),
        }
    }

    /// Declare a body-version token. Bump it when the function body changes
    /// in a way the type identity cannot see.
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Declare a constant the function body embeds.
    pub fn capture(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.captures
            .push((name.to_string(), constant_checksum(&value.into())));
        self
    }

    /// Declare another bound function the body calls into. Its fingerprint
    /// folds in recursively, so a change anywhere in the call chain shows.
    pub fn capture_fn(mut self, name: &str, fingerprint: &FnFingerprint) -> Self {
        self.callables
            .push((name.to_string(), fingerprint.checksum.clone()));
        self
    }

    /// Declare a default-argument value.
    pub fn default_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.defaults
            .push((name.to_string(), constant_checksum(&value.into())));
        self
    }

    pub fn build(self) -> FnFingerprint {
        let mut hasher = Checksummer::new();
        hasher.update(&[TAG_FN]);
        hasher.update(self.identity.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(self.version.as_deref().unwrap_or("").as_bytes());
        hasher.update(&[0x00]);
        for section in [&self.captures, &self.callables, &self.defaults] {
            hasher.update(&(section.len() as u64).to_be_bytes());
            for (name, cs) in section {
                hasher.update(name.as_bytes());
                hasher.update(&[0x00]);
                hasher.update(cs.as_bytes());
            }
        }
        FnFingerprint {
            checksum: hasher.digest(),
        }
    }
}

/// Checksum of a declared constant. Unlike the main value checksum this
/// never touches the filesystem and ignores the opaque switch: the
/// fingerprint reflects the function body, not external state, so paths
/// hash by their string and opaque payloads by their bytes.
fn constant_checksum(value: &Value) -> String {
    let mut hasher = Checksummer::new();
    update_constant(&mut hasher, value);
    hasher.digest()
}

fn update_constant(hasher: &mut Checksummer, value: &Value) {
    match value {
        Value::Null => hasher.update(&[0x00]),
        Value::Bool(b) => hasher.update(&[0x01, u8::from(*b)]),
        Value::Int(i) => {
            hasher.update(&[0x02]);
            hasher.update(&i.to_be_bytes());
        }
        Value::Float(f) => {
            hasher.update(&[0x03]);
            hasher.update(&canonical_bits(*f).to_be_bytes());
        }
        Value::Str(s) => {
            hasher.update(&[0x04]);
            hasher.update(s.as_bytes());
        }
        Value::Bytes(b) => {
            hasher.update(&[0x05]);
            hasher.update(b);
        }
        Value::Seq(items) => {
            hasher.update(&[0x06]);
            hasher.update(&(items.len() as u64).to_be_bytes());
            for item in items {
                hasher.update(constant_checksum(item).as_bytes());
            }
        }
        Value::Map(entries) => {
            let mut hashed: Vec<(String, String)> = entries
                .iter()
                .map(|(k, v)| (constant_checksum(k), constant_checksum(v)))
                .collect();
            hashed.sort();
            hasher.update(&[0x07]);
            hasher.update(&(hashed.len() as u64).to_be_bytes());
            for (k, v) in hashed {
                hasher.update(k.as_bytes());
                hasher.update(v.as_bytes());
            }
        }
        Value::Set(items) => {
            let mut hashed: Vec<String> = items.iter().map(constant_checksum).collect();
            hashed.sort();
            hasher.update(&[0x08]);
            hasher.update(&(hashed.len() as u64).to_be_bytes());
            for item in hashed {
                hasher.update(item.as_bytes());
            }
        }
        Value::Path(path) => {
            hasher.update(&[TAG_CONST_PATH]);
            hasher.update(path.to_string_lossy().as_bytes());
        }
        Value::Opaque(opaque) => {
            hasher.update(&[0x0a]);
            hasher.update(opaque.type_tag.as_bytes());
            hasher.update(&[0x00]);
            hasher.update(&opaque.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ak003_deterministic() {
        let a = FnFingerprint::named("demo").version("1").build();
        let b = FnFingerprint::named("demo").version("1").build();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ak003_version_changes_fingerprint() {
        let v1 = FnFingerprint::named("demo").version("1").build();
        let v2 = FnFingerprint::named("demo").version("2").build();
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_ak003_capture_changes_fingerprint() {
        let a = FnFingerprint::named("demo").capture("k", 42i64).build();
        let b = FnFingerprint::named("demo").capture("k", 7i64).build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ak003_default_arg_changes_fingerprint() {
        let a = FnFingerprint::named("demo").default_arg("n", 1i64).build();
        let b = FnFingerprint::named("demo").default_arg("n", 2i64).build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ak003_captured_callable_folds_in() {
        let helper_v1 = FnFingerprint::named("helper").version("1").build();
        let helper_v2 = FnFingerprint::named("helper").version("2").build();
        let a = FnFingerprint::named("outer").capture_fn("helper", &helper_v1).build();
        let b = FnFingerprint::named("outer").capture_fn("helper", &helper_v2).build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_ak003_closure_identities_differ() {
        fn identity_of<F>(_: &F) -> FnFingerprint {
            FnFingerprint::of::<F>().build()
        }
        let one = |x: i64| x + 1;
        let two = |x: i64| x + 2;
        assert_ne!(identity_of(&one), identity_of(&two));
    }

    #[test]
    fn test_ak003_path_constants_hash_by_string() {
        // Fingerprints never read the filesystem: a path constant hashes the
        // same whether or not the file exists.
        let a = FnFingerprint::named("demo")
            .capture("p", Value::path("/nonexistent/x"))
            .build();
        let b = FnFingerprint::named("demo")
            .capture("p", Value::path("/nonexistent/x"))
            .build();
        assert_eq!(a, b);
    }
}
