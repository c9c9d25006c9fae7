//! AK-011: Status evaluation.
//!
//! A pure pass over the DAG: classify every node in the target's closure
//! without invoking a single bound function. Records and sidecar metadata
//! may be read; blob payloads are never deserialized. Each node is
//! inspected exactly once per call.

use crate::cache::{self, serialization};
use crate::checksum;
use crate::config::AlkymiConfig;
use crate::core::foreach;
use crate::core::graph;
use crate::core::recipe::{Recipe, RecipeKind};
use crate::core::value::Value;
use crate::error::{AlkymiError, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Dirtiness classification of a recipe.
///
/// When several causes hold at once the highest-priority one is surfaced:
/// `OutputsInvalid` > `BoundFunctionChanged` > `InputsChanged` >
/// `CustomDirty` > `NotEvaluatedYet` > `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Cached outputs are reusable; no evaluation needed.
    Ok,
    /// One or more ingredients are themselves dirty. Collapsed to
    /// `InputsChanged` in user-facing reports.
    IngredientDirty,
    /// No evaluation record exists (or the node is transient).
    NotEvaluatedYet,
    /// Ingredient outputs changed since the last evaluation.
    InputsChanged,
    /// Persisted outputs no longer match their recorded checksums.
    OutputsInvalid,
    /// The bound function changed.
    BoundFunctionChanged,
    /// The custom cleanliness predicate reported dirty.
    CustomDirty,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// The form reported to users: the distinction between a dirty
    /// ingredient and a changed ingredient output is collapsed.
    pub(crate) fn reported(self) -> Status {
        match self {
            Status::IngredientDirty => Status::InputsChanged,
            other => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::IngredientDirty => "ingredient dirty",
            Status::NotEvaluatedYet => "not evaluated yet",
            Status::InputsChanged => "inputs changed",
            Status::OutputsInvalid => "outputs invalid",
            Status::BoundFunctionChanged => "bound function changed",
            Status::CustomDirty => "custom dirty",
        };
        write!(f, "{}", text)
    }
}

/// Per-recipe status keyed by name, in evaluation order.
pub type StatusReport = IndexMap<String, Status>;

/// User-facing status map for a target and its transitive ingredients.
pub fn status_report(target: &Arc<Recipe>) -> Result<StatusReport> {
    let nodes = graph::collect(target);
    let statuses = compute_statuses(target)?;
    let mut report = IndexMap::with_capacity(nodes.len());
    for node in &nodes {
        report.insert(node.name().to_string(), statuses[&node.id()].reported());
    }
    Ok(report)
}

/// Status of every node in the target's closure, keyed by node id. The
/// walk is memoized through the topological order: every ingredient is
/// classified before its dependents.
pub(crate) fn compute_statuses(target: &Arc<Recipe>) -> Result<HashMap<u64, Status>> {
    let cfg = AlkymiConfig::get();
    let root = cfg.cache_root();
    let mut statuses: HashMap<u64, Status> = HashMap::new();

    for node in graph::collect(target) {
        let ingredient_dirty = node
            .ingredients()
            .iter()
            .any(|ing| statuses[&ing.id()] != Status::Ok);
        let status = own_status(&node, ingredient_dirty, &cfg, &root)?;
        if status != Status::Ok {
            debug!("{} -> dirty: {}", node.name(), status);
        }
        statuses.insert(node.id(), status);
    }
    Ok(statuses)
}

/// Classify one node against its record, assuming ingredient statuses are
/// already known.
fn own_status(
    recipe: &Arc<Recipe>,
    ingredient_dirty: bool,
    cfg: &AlkymiConfig,
    root: &Path,
) -> Result<Status> {
    if recipe.transient() {
        return Ok(Status::NotEvaluatedYet);
    }
    let Some(record) = recipe.load_record(cfg, root) else {
        return Ok(Status::NotEvaluatedYet);
    };

    // Checks run in surfacing-priority order, so when several causes hold
    // the highest-priority one is reported.

    // Re-checksum persisted outputs; this is where external files referenced
    // by path values get re-hashed. A checksum failure (vanished file,
    // missing blob) is not fatal here, it just invalidates.
    let outputs_invalid = if recipe.persists(cfg) {
        let own_dir = cache::recipe_dir(root, recipe.name());
        outputs_invalid_on_disk(&record, &own_dir, cfg)?
    } else {
        outputs_invalid_in_memory(recipe, &record, cfg)?
    };
    if outputs_invalid {
        return Ok(Status::OutputsInvalid);
    }

    if record.function_checksum != recipe.function_checksum() {
        return Ok(Status::BoundFunctionChanged);
    }

    if ingredient_dirty {
        return Ok(Status::IngredientDirty);
    }

    if inputs_changed(recipe, &record, cfg, root)? {
        return Ok(Status::InputsChanged);
    }

    if let Some(predicate) = recipe.cleanliness() {
        let outputs = recipe.materialize_outputs(root)?;
        match predicate(&outputs) {
            Ok(true) => {}
            Ok(false) => return Ok(Status::CustomDirty),
            Err(message) => return Err(AlkymiError::user_code(recipe.name(), message)),
        }
    }

    Ok(Status::Ok)
}

fn outputs_invalid_on_disk(
    record: &cache::Record,
    own_dir: &Path,
    cfg: &AlkymiConfig,
) -> Result<bool> {
    if record.outputs.len() != record.output_checksums.len() {
        return Ok(true);
    }
    for (doc, recorded) in record.outputs.iter().zip(&record.output_checksums) {
        match serialization::checksum_of_document(doc, own_dir, cfg) {
            Ok(current) if current == *recorded => {}
            Ok(_) => return Ok(true),
            Err(AlkymiError::Checksum(_)) => return Ok(true),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Validity check for nodes that do not persist: their outputs only exist
/// in memory, so re-checksum the values directly.
fn outputs_invalid_in_memory(
    recipe: &Recipe,
    record: &cache::Record,
    cfg: &AlkymiConfig,
) -> Result<bool> {
    let Some(outputs) = recipe.outputs() else {
        return Ok(true);
    };
    if outputs.len() != record.output_checksums.len() {
        return Ok(true);
    }
    for (value, recorded) in outputs.iter().zip(&record.output_checksums) {
        match checksum::checksum_with(value, cfg) {
            Ok(current) if current == *recorded => {}
            Ok(_) => return Ok(true),
            Err(AlkymiError::Checksum(_)) => return Ok(true),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Whether the node's inputs differ from the recorded ones. Foreach nodes
/// additionally compare the aggregate mapped-input checksum, so partially
/// evaluated mapped inputs keep reporting `InputsChanged` until complete.
fn inputs_changed(
    recipe: &Arc<Recipe>,
    record: &cache::Record,
    cfg: &AlkymiConfig,
    root: &Path,
) -> Result<bool> {
    let current = match recipe.kind() {
        RecipeKind::Arg(_) => {
            let value = recipe.arg_value().unwrap_or(Value::Null);
            vec![checksum::checksum_with(&value, cfg)?]
        }
        _ => {
            let mut checksums = Vec::with_capacity(recipe.ingredients().len());
            for ingredient in recipe.ingredients() {
                match ingredient.output_tuple_checksum() {
                    Some(cs) => checksums.push(cs),
                    // A clean ingredient always has a record; treat a
                    // missing one as changed rather than guessing.
                    None => return Ok(true),
                }
            }
            checksums
        }
    };
    if current != record.input_checksums {
        return Ok(true);
    }
    if recipe.is_foreach() {
        return foreach_aggregate_changed(recipe, record, cfg, root);
    }
    Ok(false)
}

fn foreach_aggregate_changed(
    recipe: &Arc<Recipe>,
    record: &cache::Record,
    cfg: &AlkymiConfig,
    root: &Path,
) -> Result<bool> {
    let Some(mapped_record) = record.mapped.as_ref() else {
        return Ok(true);
    };
    let Some(mapped) = recipe.ingredients().first() else {
        return Ok(true);
    };
    let Some(mapped_node_record) = mapped.load_record(cfg, root) else {
        return Ok(true);
    };
    let mapped_dir = cache::recipe_dir(root, mapped.name());
    match foreach::aggregate_from_record(&mapped_node_record, &mapped_dir, cfg) {
        Ok(Some(aggregate)) => Ok(aggregate != mapped_record.aggregate_checksum),
        // Not a mappable shape; the brew will surface the real error.
        Ok(None) => Ok(true),
        Err(AlkymiError::Checksum(_)) => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::with_temp_cache;
    use crate::core::recipe::recipe;
    use crate::core::value::Outputs;

    #[test]
    fn test_ak011_not_evaluated_before_first_brew() {
        with_temp_cache(|_| {
            let answer = recipe("answer").run(|_| Ok(Outputs::single(42i64)));
            let report = answer.status().unwrap();
            assert_eq!(report["answer"], Status::NotEvaluatedYet);
        });
    }

    #[test]
    fn test_ak011_ok_after_brew() {
        with_temp_cache(|_| {
            let answer = recipe("answer").run(|_| Ok(Outputs::single(42i64)));
            let double = recipe("double").ingredient(&answer).run(|inputs| {
                Ok(Outputs::single(inputs[0].as_int().unwrap_or(0) * 2))
            });
            double.brew(1).unwrap();
            let report = double.status().unwrap();
            assert!(report.values().all(Status::is_clean), "{:?}", report);
        });
    }

    #[test]
    fn test_ak011_transient_never_clean() {
        with_temp_cache(|_| {
            let tick = recipe("tick").transient().run(|_| Ok(Outputs::single(1i64)));
            tick.brew(1).unwrap();
            assert_eq!(tick.status().unwrap()["tick"], Status::NotEvaluatedYet);
        });
    }

    #[test]
    fn test_ak011_bound_function_change_detected() {
        with_temp_cache(|_| {
            let v1 = recipe("answer").version("1").run(|_| Ok(Outputs::single(42i64)));
            v1.brew(1).unwrap();

            // Same name and cache entry, new body
            let v2 = recipe("answer").version("2").run(|_| Ok(Outputs::single(7i64)));
            assert_eq!(v2.status().unwrap()["answer"], Status::BoundFunctionChanged);
        });
    }

    #[test]
    fn test_ak011_external_file_mutation_invalidates_outputs() {
        with_temp_cache(|dir| {
            let target = dir.join("data.bin");
            std::fs::write(&target, b"original").unwrap();
            let path_for_recipe = target.clone();
            let produce = recipe("produce")
                .run(move |_| Ok(Outputs::single(Value::path(path_for_recipe.clone()))));
            produce.brew(1).unwrap();
            assert_eq!(produce.status().unwrap()["produce"], Status::Ok);

            std::fs::write(&target, b"tampered").unwrap();
            assert_eq!(produce.status().unwrap()["produce"], Status::OutputsInvalid);
        });
    }

    #[test]
    fn test_ak011_arg_change_reports_inputs_changed() {
        with_temp_cache(|_| {
            let threshold = crate::recipes::arg("threshold", 10i64);
            threshold.brew(1).unwrap();
            assert_eq!(threshold.status().unwrap()["threshold"], Status::Ok);

            threshold.set(20i64).unwrap();
            assert_eq!(threshold.status().unwrap()["threshold"], Status::InputsChanged);
        });
    }

    #[test]
    fn test_ak011_ingredient_dirty_collapsed_in_report() {
        with_temp_cache(|_| {
            // One construction site for the dependent keeps its bound
            // function identical across both graph builds.
            let make_dependent = |base: &std::sync::Arc<crate::Recipe>| {
                recipe("dependent")
                    .ingredient(base)
                    .run(|inputs| Ok(Outputs::single(inputs[0].clone())))
            };
            let base = recipe("base").version("1").run(|_| Ok(Outputs::single(1i64)));
            let dependent = make_dependent(&base);
            dependent.brew(1).unwrap();

            // Rebuild base with a new body; the dependent's own record is
            // intact but its ingredient is dirty.
            let base2 = recipe("base").version("2").run(|_| Ok(Outputs::single(1i64)));
            let dependent2 = make_dependent(&base2);
            let report = dependent2.status().unwrap();
            assert_eq!(report["base"], Status::BoundFunctionChanged);
            assert_eq!(report["dependent"], Status::InputsChanged);
        });
    }

    #[test]
    fn test_ak011_undeclared_global_does_not_dirty() {
        static SCALE: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(2);
        with_temp_cache(|_| {
            let scaled = recipe("scaled").run(|_| {
                let factor = SCALE.load(std::sync::atomic::Ordering::SeqCst);
                Ok(Outputs::single(21 * factor))
            });
            scaled.brew(1).unwrap();
            assert_eq!(scaled.status().unwrap()["scaled"], Status::Ok);

            // The global is not declared as a capture, so changing it is
            // invisible to the fingerprint: no re-evaluation happens.
            SCALE.store(3, std::sync::atomic::Ordering::SeqCst);
            assert_eq!(scaled.status().unwrap()["scaled"], Status::Ok);
        });
    }

    #[test]
    fn test_ak011_custom_cleanliness_marks_dirty() {
        with_temp_cache(|_| {
            let fickle = recipe("fickle")
                .cleanliness(|_| Ok(false))
                .run(|_| Ok(Outputs::single(1i64)));
            fickle.brew(1).unwrap();
            assert_eq!(fickle.status().unwrap()["fickle"], Status::CustomDirty);
        });
    }

    #[test]
    fn test_ak011_cleanliness_error_is_fatal() {
        with_temp_cache(|_| {
            let broken = recipe("broken")
                .cleanliness(|_| Err("predicate exploded".to_string()))
                .run(|_| Ok(Outputs::single(1i64)));
            broken.brew(1).unwrap();
            let result = broken.status();
            assert!(matches!(result, Err(AlkymiError::UserCode { .. })));
        });
    }

    #[test]
    fn test_ak011_priority_outputs_invalid_wins() {
        with_temp_cache(|dir| {
            let target = dir.join("payload.bin");
            std::fs::write(&target, b"v1").unwrap();
            let path = target.clone();
            let v1 = recipe("multi")
                .version("1")
                .run(move |_| Ok(Outputs::single(Value::path(path.clone()))));
            v1.brew(1).unwrap();

            // Both the bound function and the external file changed; the
            // invalid outputs take precedence.
            std::fs::write(&target, b"v2").unwrap();
            let path2 = target.clone();
            let v2 = recipe("multi")
                .version("2")
                .run(move |_| Ok(Outputs::single(Value::path(path2.clone()))));
            assert_eq!(v2.status().unwrap()["multi"], Status::OutputsInvalid);
        });
    }

    #[test]
    fn test_ak011_corrupt_cache_reports_not_evaluated() {
        with_temp_cache(|_| {
            let answer = recipe("answer").run(|_| Ok(Outputs::single(42i64)));
            answer.brew(1).unwrap();

            let root = AlkymiConfig::get().cache_root();
            let meta = cache::recipe_dir(&root, "answer").join("meta.json");
            std::fs::write(&meta, b"{broken").unwrap();

            // A fresh node object (no in-memory state) sees the corruption
            let again = recipe("answer").run(|_| Ok(Outputs::single(42i64)));
            assert_eq!(again.status().unwrap()["answer"], Status::NotEvaluatedYet);
        });
    }
}
