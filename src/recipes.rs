//! AK-014: Built-in recipe factories.
//!
//! Convenience constructors layered on the public builder API: argument
//! holders, external-file references, directory globs and sequence zipping.

use crate::core::recipe::{recipe, Recipe, RecipeBuilder};
use crate::core::value::{Outputs, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An argument-holder recipe. `set()` replaces the stored value; the new
/// output checksum invalidates every downstream record on the next brew.
pub fn arg(name: &str, initial: impl Into<Value>) -> Arc<Recipe> {
    RecipeBuilder::new(name).build_arg(initial.into())
}

/// A recipe handing out a reference to an existing external file. Content
/// changes show up as invalid outputs, which re-runs the recipe and dirties
/// everything downstream.
pub fn file(name: &str, path: impl Into<PathBuf>) -> Arc<Recipe> {
    let path = path.into();
    recipe(name)
        .capture("path", Value::path(path.clone()))
        .run(move |_| Ok(Outputs::single(Value::path(path.clone()))))
}

/// A recipe globbing `pattern` under `directory`, producing a sorted
/// sequence of path values. Globbing is impure, so a cleanliness predicate
/// re-runs the glob and compares against the cached listing.
pub fn glob_files(name: &str, directory: impl Into<PathBuf>, pattern: &str) -> Arc<Recipe> {
    let directory = directory.into();
    let pattern = pattern.to_string();
    let check_dir = directory.clone();
    let check_pattern = pattern.clone();
    recipe(name)
        .capture("directory", Value::path(directory.clone()))
        .capture("pattern", pattern.as_str())
        .cleanliness(move |outputs| {
            let current = run_glob(&check_dir, &check_pattern)?;
            Ok(outputs.only() == Some(&current))
        })
        .run(move |_| Ok(Outputs::single(run_glob(&directory, &pattern)?)))
}

fn run_glob(directory: &Path, pattern: &str) -> std::result::Result<Value, String> {
    let full = directory.join(pattern);
    let full = full.to_string_lossy();
    let entries = glob::glob(&full).map_err(|e| format!("invalid glob pattern '{}': {}", full, e))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in entries {
        paths.push(entry.map_err(|e| format!("glob error: {}", e))?);
    }
    paths.sort();
    Ok(Value::Seq(paths.into_iter().map(Value::Path).collect()))
}

/// Zip the sequence outputs of two recipes into a sequence of pairs. The
/// sequences must have equal length.
pub fn zip_results(name: &str, left: &Arc<Recipe>, right: &Arc<Recipe>) -> Arc<Recipe> {
    recipe(name)
        .ingredient(left)
        .ingredient(right)
        .run(|inputs| {
            let left = inputs[0]
                .as_seq()
                .ok_or_else(|| "zip_results expects sequence outputs".to_string())?;
            let right = inputs[1]
                .as_seq()
                .ok_or_else(|| "zip_results expects sequence outputs".to_string())?;
            if left.len() != right.len() {
                return Err(format!(
                    "cannot zip sequences of lengths {} and {}",
                    left.len(),
                    right.len()
                ));
            }
            let pairs: Vec<Value> = left
                .iter()
                .zip(right)
                .map(|(l, r)| Value::Seq(vec![l.clone(), r.clone()]))
                .collect();
            Ok(Outputs::single(Value::Seq(pairs)))
        })
}
