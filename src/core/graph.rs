//! AK-010: DAG collection and evaluation order.
//!
//! The graph is implicit in the `Arc` references between recipes and is
//! acyclic by construction (a builder can only reference nodes that already
//! exist). A depth-first postorder walk therefore doubles as a topological
//! sort: every ingredient appears before its dependents, deterministically,
//! with each node visited once.

use crate::core::recipe::Recipe;
use std::collections::HashSet;
use std::sync::Arc;

/// Collect the transitive closure of `target` in topological order
/// (ingredients first, `target` last).
pub(crate) fn collect(target: &Arc<Recipe>) -> Vec<Arc<Recipe>> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    visit(target, &mut seen, &mut order);
    order
}

fn visit(recipe: &Arc<Recipe>, seen: &mut HashSet<u64>, order: &mut Vec<Arc<Recipe>>) {
    if !seen.insert(recipe.id()) {
        return;
    }
    for ingredient in recipe.ingredients() {
        visit(ingredient, seen, order);
    }
    order.push(recipe.clone());
}
