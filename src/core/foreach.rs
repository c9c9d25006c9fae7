//! AK-009: Foreach recipes.
//!
//! A foreach recipe applies its bound function once per element of a mapped
//! ingredient (the first ingredient) and memoizes per element: unchanged
//! elements keep their recorded output documents verbatim, new elements are
//! the only ones invoked, and dropped elements fall out of the record.
//! Sequences match elements by value checksum, mappings by key. A mapped
//! input that flips kind (sequence ↔ mapping) invalidates every element.

use crate::cache::serialization::{self, encode_value};
use crate::cache::{self, ElementRecord, MappedKind, MappedRecord, Record};
use crate::checksum;
use crate::config::AlkymiConfig;
use crate::core::recipe::{Recipe, RecipeBuilder};
use crate::core::value::{Outputs, Value};
use crate::error::{AlkymiError, Result};
use serde_json::Value as Doc;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

/// Start building a foreach recipe over `mapped`. The mapped ingredient
/// must produce a sequence or a mapping; further ingredients added to the
/// builder are passed to the bound function alongside each element.
pub fn foreach(name: &str, mapped: &Arc<Recipe>) -> ForeachBuilder {
    ForeachBuilder {
        inner: RecipeBuilder::new(name).ingredient(mapped),
    }
}

/// Builder for foreach recipes; mirrors [`RecipeBuilder`].
pub struct ForeachBuilder {
    inner: RecipeBuilder,
}

impl ForeachBuilder {
    pub fn ingredient(mut self, ingredient: &Arc<Recipe>) -> Self {
        self.inner = self.inner.ingredient(ingredient);
        self
    }

    pub fn transient(mut self) -> Self {
        self.inner = self.inner.transient();
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.inner = self.inner.no_cache();
        self
    }

    pub fn doc(mut self, doc: &str) -> Self {
        self.inner = self.inner.doc(doc);
        self
    }

    pub fn cleanliness<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Outputs) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        self.inner = self.inner.cleanliness(predicate);
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.inner = self.inner.version(version);
        self
    }

    pub fn capture(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inner = self.inner.capture(name, value);
        self
    }

    pub fn capture_fn(mut self, name: &str, callee: &Arc<Recipe>) -> Self {
        self.inner = self.inner.capture_fn(name, callee);
        self
    }

    pub fn default_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inner = self.inner.default_arg(name, value);
        self
    }

    /// Bind the per-element function and build the node.
    pub fn run<F>(self, func: F) -> Arc<Recipe>
    where
        F: Fn(&Value, &[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.inner.run_foreach(func)
    }
}

/// Mapped input broken into elements, document-side. Used by the status
/// evaluator, which must not materialize values.
pub(crate) enum MappedDocs {
    Sequence(Vec<Doc>),
    Mapping(Vec<(Doc, Doc)>),
}

/// The document a record contributes when consumed as an ingredient;
/// mirrors [`Outputs::contribution`] in document space.
pub(crate) fn contribution_doc(record: &Record) -> Doc {
    match record.outputs.as_slice() {
        [] => Doc::Null,
        [doc] => doc.clone(),
        docs => Doc::Array(docs.to_vec()),
    }
}

/// Split a contribution document into mapped elements, if it has a mappable
/// shape.
pub(crate) fn mapped_docs(doc: &Doc) -> Option<MappedDocs> {
    match doc {
        Doc::Array(items) => Some(MappedDocs::Sequence(items.clone())),
        Doc::Object(fields) => {
            let pairs = fields.get("__map__")?.as_array()?;
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in pairs {
                let entry = pair.as_array().filter(|a| a.len() == 2)?;
                entries.push((entry[0].clone(), entry[1].clone()));
            }
            Some(MappedDocs::Mapping(entries))
        }
        _ => None,
    }
}

/// Order-preserving checksum over the whole mapped input. The kind marker
/// keeps a sequence and a mapping with equal element hashes apart.
pub(crate) fn aggregate_checksum(kind: MappedKind, parts: &[String]) -> String {
    let marker = match kind {
        MappedKind::Sequence => "seq",
        MappedKind::Mapping => "map",
    };
    let mut all: Vec<&str> = Vec::with_capacity(parts.len() + 1);
    all.push(marker);
    all.extend(parts.iter().map(String::as_str));
    checksum::combine(all)
}

/// Aggregate checksum of the current mapped input computed from the mapped
/// ingredient's record, without reading blob payloads.
pub(crate) fn aggregate_from_record(
    mapped_record: &Record,
    mapped_dir: &Path,
    cfg: &AlkymiConfig,
) -> Result<Option<String>> {
    let doc = contribution_doc(mapped_record);
    let Some(docs) = mapped_docs(&doc) else {
        return Ok(None);
    };
    let mut parts = Vec::new();
    let kind = match &docs {
        MappedDocs::Sequence(items) => {
            for item in items {
                parts.push(serialization::checksum_of_document(item, mapped_dir, cfg)?);
            }
            MappedKind::Sequence
        }
        MappedDocs::Mapping(entries) => {
            for (key, value) in entries {
                parts.push(serialization::checksum_of_document(key, mapped_dir, cfg)?);
                parts.push(serialization::checksum_of_document(value, mapped_dir, cfg)?);
            }
            MappedKind::Mapping
        }
    };
    Ok(Some(aggregate_checksum(kind, &parts)))
}

/// One element of the current mapped input, with its reuse decision.
pub(crate) struct PlannedElement {
    /// The element value handed to the bound function.
    pub item: Value,
    /// Mapping key, if the input is a mapping.
    pub key: Option<Value>,
    pub key_doc: Option<Doc>,
    pub key_checksum: Option<String>,
    pub input_checksum: String,
    /// Recorded entry to reuse verbatim instead of invoking.
    pub reuse: Option<ElementRecord>,
}

/// Evaluation plan for a foreach node's mapped input.
pub(crate) struct ForeachPlan {
    pub kind: MappedKind,
    pub elements: Vec<PlannedElement>,
    /// Blob payloads produced while encoding mapping keys.
    pub key_blobs: Vec<(String, Vec<u8>)>,
}

impl ForeachPlan {
    pub fn fresh_count(&self) -> usize {
        self.elements.iter().filter(|e| e.reuse.is_none()).count()
    }

    /// Aggregate over the given subset of elements (indices into
    /// `self.elements`), in input order.
    pub fn aggregate_over(&self, included: impl Iterator<Item = usize>) -> String {
        let mut parts = Vec::new();
        for idx in included {
            let element = &self.elements[idx];
            if let Some(key_cs) = &element.key_checksum {
                parts.push(key_cs.clone());
            }
            parts.push(element.input_checksum.clone());
        }
        aggregate_checksum(self.kind, &parts)
    }
}

/// Split the current mapped input value into elements and match them
/// against the previous record. Transient recipes never reuse.
pub(crate) fn plan_elements(
    recipe: &Recipe,
    contribution: &Value,
    record: Option<&Record>,
    root: &Path,
    cfg: &AlkymiConfig,
) -> Result<ForeachPlan> {
    let own_dir = cache::recipe_dir(root, recipe.name());
    let previous = record
        .and_then(|r| r.mapped.as_ref())
        .filter(|_| !recipe.transient());

    match contribution {
        Value::Seq(items) => {
            // Index previous elements by input checksum; equal elements are
            // consumed first-match so duplicates pair up one-to-one.
            let mut by_checksum: HashMap<&str, VecDeque<&ElementRecord>> = HashMap::new();
            if let Some(prev) = previous.filter(|p| p.kind == MappedKind::Sequence) {
                for element in &prev.elements {
                    by_checksum
                        .entry(element.input_checksum.as_str())
                        .or_default()
                        .push_back(element);
                }
            }
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                let input_checksum = checksum::checksum_with(item, cfg)?;
                let reuse = by_checksum
                    .get_mut(input_checksum.as_str())
                    .and_then(|queue| queue.pop_front())
                    .filter(|prev| serialization::doc_blobs_present(&prev.output, &own_dir))
                    .cloned();
                elements.push(PlannedElement {
                    item: item.clone(),
                    key: None,
                    key_doc: None,
                    key_checksum: None,
                    input_checksum,
                    reuse,
                });
            }
            Ok(ForeachPlan {
                kind: MappedKind::Sequence,
                elements,
                key_blobs: Vec::new(),
            })
        }
        Value::Map(entries) => {
            // Index previous elements by key checksum; reuse only when the
            // element's value checksum also matches.
            let mut by_key: HashMap<String, &ElementRecord> = HashMap::new();
            if let Some(prev) = previous.filter(|p| p.kind == MappedKind::Mapping) {
                for element in &prev.elements {
                    if let Some(key_doc) = &element.key {
                        if let Ok(key_cs) =
                            serialization::checksum_of_document(key_doc, &own_dir, cfg)
                        {
                            by_key.insert(key_cs, element);
                        }
                    }
                }
            }
            let mut key_blobs = Vec::new();
            let mut elements = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                let key_checksum = checksum::checksum_with(key, cfg)?;
                let input_checksum = checksum::checksum_with(item, cfg)?;
                let key_doc = encode_value(key, &mut key_blobs, cfg)?;
                let reuse = by_key
                    .get(&key_checksum)
                    .filter(|prev| prev.input_checksum == input_checksum)
                    .filter(|prev| serialization::doc_blobs_present(&prev.output, &own_dir))
                    .map(|prev| (*prev).clone());
                elements.push(PlannedElement {
                    item: item.clone(),
                    key: Some(key.clone()),
                    key_doc: Some(key_doc),
                    key_checksum: Some(key_checksum),
                    input_checksum,
                    reuse,
                });
            }
            Ok(ForeachPlan {
                kind: MappedKind::Mapping,
                elements,
                key_blobs,
            })
        }
        other => Err(AlkymiError::user_code(
            recipe.name(),
            format!(
                "mapped input must be a sequence or mapping, got {}",
                other.kind()
            ),
        )),
    }
}

/// Build the mapped record, container document and container checksum from
/// per-element results. `results[i]` is the freshly computed value for
/// element `i`, or `None` for reused ones. Elements with neither a result
/// nor a reusable record (not yet evaluated when a brew aborts) are folded
/// out, which is what preserves partial progress.
pub(crate) fn gather_record(
    plan: &ForeachPlan,
    results: &[Option<Value>],
    cfg: &AlkymiConfig,
) -> Result<GatheredForeach> {
    let mut blobs = plan.key_blobs.clone();
    let mut element_records = Vec::new();
    let mut included = Vec::new();
    let mut container_parts = Vec::new();

    for (idx, element) in plan.elements.iter().enumerate() {
        let (doc, output_checksum) = match (&results[idx], &element.reuse) {
            (Some(value), _) => {
                let doc = encode_value(value, &mut blobs, cfg)?;
                (doc, checksum::checksum_with(value, cfg)?)
            }
            (None, Some(prev)) => (prev.output.clone(), prev.output_checksum.clone()),
            (None, None) => continue,
        };
        included.push(idx);
        container_parts.push((element, doc.clone(), output_checksum.clone()));
        element_records.push(ElementRecord {
            key: element.key_doc.clone(),
            input_checksum: element.input_checksum.clone(),
            output_checksum,
            output: doc,
        });
    }

    let aggregate = plan.aggregate_over(included.iter().copied());
    let mapped = MappedRecord {
        kind: plan.kind,
        aggregate_checksum: aggregate,
        elements: element_records,
    };

    let (container_doc, container_checksum) = match plan.kind {
        MappedKind::Sequence => {
            let docs: Vec<Doc> = container_parts.iter().map(|(_, d, _)| d.clone()).collect();
            let parts: Vec<String> = container_parts.iter().map(|(_, _, c)| c.clone()).collect();
            (Doc::Array(docs), checksum::checksum_seq_parts(parts))
        }
        MappedKind::Mapping => {
            let pairs: Vec<Doc> = container_parts
                .iter()
                .map(|(e, d, _)| {
                    Doc::Array(vec![
                        e.key_doc.clone().unwrap_or(Doc::Null),
                        d.clone(),
                    ])
                })
                .collect();
            let entries: Vec<(String, String)> = container_parts
                .iter()
                .map(|(e, _, c)| {
                    (
                        e.key_checksum.clone().unwrap_or_default(),
                        c.clone(),
                    )
                })
                .collect();
            (
                serde_json::json!({ "__map__": pairs }),
                checksum::checksum_map_entries(entries),
            )
        }
    };

    Ok(GatheredForeach {
        mapped,
        container_doc,
        container_checksum,
        blobs,
    })
}

/// Result of folding a foreach evaluation into record form.
pub(crate) struct GatheredForeach {
    pub mapped: MappedRecord,
    pub container_doc: Doc,
    pub container_checksum: String,
    pub blobs: Vec<(String, Vec<u8>)>,
}

/// Assemble the in-memory container value from fresh results and reused
/// recorded documents. Only called for complete evaluations.
pub(crate) fn gather_value(
    plan: &ForeachPlan,
    results: &[Option<Value>],
    recipe: &Recipe,
    root: &Path,
) -> Result<Value> {
    let own_dir = cache::recipe_dir(root, recipe.name());
    let mut values = Vec::with_capacity(plan.elements.len());
    for (idx, element) in plan.elements.iter().enumerate() {
        let value = match (&results[idx], &element.reuse) {
            (Some(value), _) => value.clone(),
            (None, Some(prev)) => serialization::decode_document(&prev.output, &own_dir)?,
            (None, None) => {
                return Err(AlkymiError::user_code(
                    recipe.name(),
                    "incomplete foreach evaluation cannot be gathered",
                ))
            }
        };
        values.push(value);
    }
    Ok(match plan.kind {
        MappedKind::Sequence => Value::Seq(values),
        MappedKind::Mapping => Value::Map(
            plan.elements
                .iter()
                .zip(values)
                .map(|(e, v)| (e.key.clone().unwrap_or(Value::Null), v))
                .collect(),
        ),
    })
}
