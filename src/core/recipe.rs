//! AK-008: Recipe nodes.
//!
//! A recipe wraps a bound function together with its ingredient references,
//! dirtiness-related flags and the evaluation state carried between runs.
//! Nodes are built once via [`RecipeBuilder`] and shared as `Arc<Recipe>`;
//! the graph is immutable after construction, so cycles cannot form. All
//! mutable state lives behind a single lock owned by the controller thread.

use crate::cache::{self, Record};
use crate::checksum::{self, fingerprint::FnFingerprint};
use crate::config::AlkymiConfig;
use crate::core::scheduler::{self, CancelToken};
use crate::core::status::{self, StatusReport};
use crate::core::value::{Outputs, Value};
use crate::error::{AlkymiError, Result};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Bound function of a standard recipe: ingredient contributions in, output
/// tuple out. Failures are plain messages; the engine wraps them with the
/// recipe name.
pub type RecipeFn = dyn Fn(&[Value]) -> std::result::Result<Outputs, String> + Send + Sync;

/// Bound function of a foreach recipe, applied once per mapped element.
pub type ElementFn =
    dyn Fn(&Value, &[Value]) -> std::result::Result<Value, String> + Send + Sync;

/// Custom cleanliness predicate, called with the cached outputs.
pub type CleanFn = dyn Fn(&Outputs) -> std::result::Result<bool, String> + Send + Sync;

pub(crate) enum RecipeKind {
    Standard(Arc<RecipeFn>),
    Foreach(Arc<ElementFn>),
    /// Argument holder: evaluation returns the stored value.
    Arg(Mutex<Value>),
}

/// In-memory evaluation state of a node.
pub(crate) struct NodeState {
    /// Last evaluation record, loaded from disk or produced this run.
    pub record: Option<Record>,
    /// Whether the disk probe for the record already happened.
    pub record_loaded: bool,
    /// Materialized output values, if forced this run.
    pub outputs: Option<Outputs>,
}

/// A node in the recipe graph.
pub struct Recipe {
    id: u64,
    /// Back-reference to the owning `Arc`, so `&self` methods can hand the
    /// graph walker shared handles.
    me: Weak<Recipe>,
    name: String,
    doc: Option<String>,
    ingredients: Vec<Arc<Recipe>>,
    kind: RecipeKind,
    transient: bool,
    cache: bool,
    cleanliness: Option<Arc<CleanFn>>,
    fingerprint: FnFingerprint,
    state: Mutex<NodeState>,
}

impl fmt::Debug for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipe")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transient", &self.transient)
            .finish()
    }
}

impl Recipe {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn ingredients(&self) -> &[Arc<Recipe>] {
        &self.ingredients
    }

    pub fn transient(&self) -> bool {
        self.transient
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> &RecipeKind {
        &self.kind
    }

    pub(crate) fn is_foreach(&self) -> bool {
        matches!(self.kind, RecipeKind::Foreach(_))
    }

    pub(crate) fn cleanliness(&self) -> Option<&Arc<CleanFn>> {
        self.cleanliness.as_ref()
    }

    /// Checksum of the bound function.
    pub fn function_checksum(&self) -> &str {
        self.fingerprint.checksum()
    }

    pub(crate) fn fingerprint(&self) -> &FnFingerprint {
        &self.fingerprint
    }

    /// Whether this node persists records to disk under the given config.
    pub(crate) fn persists(&self, cfg: &AlkymiConfig) -> bool {
        cfg.cache && self.cache && !self.transient
    }

    fn as_arc(&self) -> Arc<Recipe> {
        // The weak back-reference is set at construction and lives as long
        // as the node itself.
        self.me.upgrade().unwrap()
    }

    /// Dirtiness classification for this recipe and its transitive
    /// ingredients. Never invokes bound functions.
    pub fn status(&self) -> Result<StatusReport> {
        status::status_report(&self.as_arc())
    }

    /// Evaluate this recipe, reusing cached work, with `jobs` parallel
    /// workers for bound-function execution.
    pub fn brew(&self, jobs: usize) -> Result<Outputs> {
        scheduler::brew(&self.as_arc(), jobs, CancelToken::new())
    }

    /// Like [`Recipe::brew`] with an external cancellation token.
    pub fn brew_with_cancel(&self, jobs: usize, cancel: CancelToken) -> Result<Outputs> {
        scheduler::brew(&self.as_arc(), jobs, cancel)
    }

    /// Output values materialized in this process, if any.
    pub fn outputs(&self) -> Option<Outputs> {
        self.state_guard().outputs.clone()
    }

    /// Replace the stored value of an argument recipe. Changing the value
    /// changes this node's output checksum, which invalidates every
    /// downstream record on the next status/brew.
    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        match &self.kind {
            RecipeKind::Arg(slot) => {
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = value.into();
                self.state_guard().outputs = None;
                Ok(())
            }
            _ => Err(AlkymiError::user_code(
                &self.name,
                "set() is only supported on argument recipes",
            )),
        }
    }

    pub(crate) fn arg_value(&self) -> Option<Value> {
        match &self.kind {
            RecipeKind::Arg(slot) => {
                Some(slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
            }
            _ => None,
        }
    }

    fn state_guard(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The node's evaluation record, probing the cache directory once if
    /// persistence is enabled.
    pub(crate) fn load_record(&self, cfg: &AlkymiConfig, root: &Path) -> Option<Record> {
        let mut state = self.state_guard();
        if state.record.is_none() && !state.record_loaded {
            state.record_loaded = true;
            if self.persists(cfg) {
                state.record = cache::load_record(root, &self.name);
            }
        }
        state.record.clone()
    }

    /// Replace the in-memory record without materialized outputs, used when
    /// persisting partial foreach progress on an aborted brew.
    pub(crate) fn set_record(&self, record: Record) {
        let mut state = self.state_guard();
        state.record = Some(record);
        state.record_loaded = true;
        state.outputs = None;
    }

    /// Record a fresh evaluation in memory.
    pub(crate) fn set_evaluated(&self, record: Record, outputs: Outputs) {
        let mut state = self.state_guard();
        state.record = Some(record);
        state.record_loaded = true;
        state.outputs = Some(outputs);
    }

    /// Materialize this node's outputs, reading cached documents and blobs
    /// if they were not produced in this process yet.
    pub(crate) fn materialize_outputs(&self, root: &Path) -> Result<Outputs> {
        let mut state = self.state_guard();
        if let Some(outputs) = &state.outputs {
            return Ok(outputs.clone());
        }
        let record = state.record.as_ref().ok_or_else(|| AlkymiError::CacheCorruption {
            path: cache::recipe_dir(root, &self.name),
            reason: "no evaluation record to load outputs from".to_string(),
        })?;
        let mut values = Vec::with_capacity(record.outputs.len());
        for handle in cache::output_handles(root, record) {
            values.push(handle.load()?);
        }
        let outputs = Outputs::new(values);
        state.outputs = Some(outputs.clone());
        Ok(outputs)
    }

    /// The value this node contributes to a consuming bound function.
    pub(crate) fn contribution(&self, root: &Path) -> Result<Value> {
        Ok(self.materialize_outputs(root)?.contribution())
    }

    /// Combined checksum over the recorded output tuple, if a record exists.
    pub(crate) fn output_tuple_checksum(&self) -> Option<String> {
        let state = self.state_guard();
        state
            .record
            .as_ref()
            .map(|r| checksum::combine(r.output_checksums.iter().map(String::as_str)))
    }
}

/// Start building a standard recipe.
pub fn recipe(name: &str) -> RecipeBuilder {
    RecipeBuilder::new(name)
}

/// Builder for [`Recipe`] nodes.
pub struct RecipeBuilder {
    name: String,
    doc: Option<String>,
    ingredients: Vec<Arc<Recipe>>,
    transient: bool,
    cache: bool,
    cleanliness: Option<Arc<CleanFn>>,
    version: Option<String>,
    captures: Vec<(String, Value)>,
    callables: Vec<(String, FnFingerprint)>,
    defaults: Vec<(String, Value)>,
}

impl RecipeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            doc: None,
            ingredients: Vec::new(),
            transient: false,
            cache: true,
            cleanliness: None,
            version: None,
            captures: Vec::new(),
            callables: Vec::new(),
            defaults: Vec::new(),
        }
    }

    /// Append a dependency. Its output is passed to the bound function in
    /// declaration order.
    pub fn ingredient(mut self, ingredient: &Arc<Recipe>) -> Self {
        self.ingredients.push(ingredient.clone());
        self
    }

    pub fn ingredients<'a>(
        mut self,
        ingredients: impl IntoIterator<Item = &'a Arc<Recipe>>,
    ) -> Self {
        self.ingredients.extend(ingredients.into_iter().cloned());
        self
    }

    /// Never persist outputs; the node re-evaluates on every brew.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Disable disk persistence for this node only.
    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    pub fn doc(mut self, doc: &str) -> Self {
        self.doc = Some(doc.to_string());
        self
    }

    /// Install a custom cleanliness predicate for impure functions. It
    /// receives the cached outputs; returning false marks the node dirty.
    pub fn cleanliness<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Outputs) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        self.cleanliness = Some(Arc::new(predicate));
        self
    }

    /// Body-version token folded into the bound-function checksum.
    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Declare a constant the bound function embeds.
    pub fn capture(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.captures.push((name.to_string(), value.into()));
        self
    }

    /// Declare another recipe's bound function as a callee.
    pub fn capture_fn(mut self, name: &str, callee: &Arc<Recipe>) -> Self {
        self.callables
            .push((name.to_string(), callee.fingerprint().clone()));
        self
    }

    /// Declare a default-argument value.
    pub fn default_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.defaults.push((name.to_string(), value.into()));
        self
    }

    fn build_fingerprint(&self, identity: &str) -> FnFingerprint {
        let mut builder = FnFingerprint::named(identity);
        if let Some(version) = &self.version {
            builder = builder.version(version);
        }
        for (name, value) in &self.captures {
            builder = builder.capture(name, value.clone());
        }
        for (name, fp) in &self.callables {
            builder = builder.capture_fn(name, fp);
        }
        for (name, value) in &self.defaults {
            builder = builder.default_arg(name, value.clone());
        }
        builder.build()
    }

    fn build(self, kind: RecipeKind, fingerprint: FnFingerprint) -> Arc<Recipe> {
        Arc::new_cyclic(|me| Recipe {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            name: self.name,
            doc: self.doc,
            ingredients: self.ingredients,
            kind,
            transient: self.transient,
            cache: self.cache,
            cleanliness: self.cleanliness,
            fingerprint,
            state: Mutex::new(NodeState {
                record: None,
                record_loaded: false,
                outputs: None,
            }),
        })
    }

    /// Bind the function and build the node.
    pub fn run<F>(self, func: F) -> Arc<Recipe>
    where
        F: Fn(&[Value]) -> std::result::Result<Outputs, String> + Send + Sync + 'static,
    {
        let fingerprint = self.build_fingerprint(std::any::type_name::<F>());
        self.build(RecipeKind::Standard(Arc::new(func)), fingerprint)
    }

    pub(crate) fn run_foreach<F>(self, func: F) -> Arc<Recipe>
    where
        F: Fn(&Value, &[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let fingerprint = self.build_fingerprint(std::any::type_name::<F>());
        self.build(RecipeKind::Foreach(Arc::new(func)), fingerprint)
    }

    pub(crate) fn build_arg(self, initial: Value) -> Arc<Recipe> {
        let fingerprint = self.build_fingerprint("alkymi::arg");
        self.build(RecipeKind::Arg(Mutex::new(initial)), fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ak008_builder_carries_flags() {
        let base = recipe("base").run(|_| Ok(Outputs::single(1i64)));
        let node = recipe("node")
            .ingredient(&base)
            .transient()
            .no_cache()
            .doc("does things")
            .run(|_| Ok(Outputs::unit()));
        assert_eq!(node.name(), "node");
        assert_eq!(node.doc(), Some("does things"));
        assert!(node.transient());
        assert!(!node.cache_enabled());
        assert_eq!(node.ingredients().len(), 1);
        assert_eq!(node.ingredients()[0].name(), "base");
    }

    #[test]
    fn test_ak008_ids_are_unique() {
        let a = recipe("a").run(|_| Ok(Outputs::unit()));
        let b = recipe("b").run(|_| Ok(Outputs::unit()));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_ak008_capture_changes_function_checksum() {
        let a = recipe("x").capture("k", 42i64).run(|_| Ok(Outputs::unit()));
        let b = recipe("x").capture("k", 7i64).run(|_| Ok(Outputs::unit()));
        assert_ne!(a.function_checksum(), b.function_checksum());
    }

    #[test]
    fn test_ak008_version_changes_function_checksum() {
        fn make(version: &str) -> Arc<Recipe> {
            recipe("versioned")
                .version(version)
                .run(|_| Ok(Outputs::single(0i64)))
        }
        let v1 = make("1");
        let v2 = make("2");
        assert_ne!(v1.function_checksum(), v2.function_checksum());
    }

    #[test]
    fn test_ak008_set_rejected_on_non_arg() {
        let node = recipe("plain").run(|_| Ok(Outputs::unit()));
        assert!(node.set(1i64).is_err());
    }

    #[test]
    fn test_ak008_arg_holds_value() {
        let node = RecipeBuilder::new("threshold").build_arg(Value::Int(10));
        assert_eq!(node.arg_value(), Some(Value::Int(10)));
        node.set(20i64).unwrap();
        assert_eq!(node.arg_value(), Some(Value::Int(20)));
    }

    #[test]
    fn test_ak008_capture_fn_folds_callee() {
        let helper_a = recipe("helper").version("a").run(|_| Ok(Outputs::unit()));
        let helper_b = recipe("helper").version("b").run(|_| Ok(Outputs::unit()));
        let with_a = recipe("outer")
            .capture_fn("helper", &helper_a)
            .run(|_| Ok(Outputs::unit()));
        let with_b = recipe("outer")
            .capture_fn("helper", &helper_b)
            .run(|_| Ok(Outputs::unit()));
        assert_ne!(with_a.function_checksum(), with_b.function_checksum());
    }
}
