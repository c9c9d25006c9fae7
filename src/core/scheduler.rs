//! AK-012: Scheduler / executor.
//!
//! A single-threaded cooperative controller walks the plan while a bounded
//! pool of OS worker threads runs bound functions. The controller owns all
//! graph state and performs every disk write; workers only receive input
//! values and hand back output values. Clean nodes are never invoked and
//! their cached outputs load lazily, only when a dirty dependent actually
//! consumes them. The first error aborts the brew: in-flight work is
//! drained, further errors are discarded with a warning, and completed
//! foreach elements are folded into a partial record so the next brew
//! resumes mid-sequence.

use crate::cache::{self, serialization::encode_outputs, Record};
use crate::checksum;
use crate::config::AlkymiConfig;
use crate::core::foreach::{self, ForeachPlan};
use crate::core::graph;
use crate::core::recipe::{Recipe, RecipeKind};
use crate::core::status::{self, Status};
use crate::core::value::{Outputs, Value};
use crate::error::{AlkymiError, Result};
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between a brew and its caller. A
/// running bound function is never interrupted mid-execution; it finishes
/// before the cancellation is observed.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum TaskPayload {
    Standard {
        func: Arc<crate::core::recipe::RecipeFn>,
        inputs: Vec<Value>,
    },
    Element {
        func: Arc<crate::core::recipe::ElementFn>,
        item: Value,
        extra: Arc<Vec<Value>>,
    },
}

struct Task {
    node_idx: usize,
    element_idx: Option<usize>,
    payload: TaskPayload,
}

struct TaskDone {
    worker: usize,
    node_idx: usize,
    element_idx: Option<usize>,
    result: std::result::Result<Outputs, String>,
}

/// Per-node scheduling state for one brew.
struct NodeRun {
    recipe: Arc<Recipe>,
    invoke: bool,
    done: bool,
    /// Ids of dirty ingredients this node still waits for.
    pending_ingredients: HashSet<u64>,
    /// Indices of dirty dependents to notify on completion.
    dependents: Vec<usize>,
    input_checksums: Option<Vec<String>>,
    foreach: Option<ForeachRun>,
}

struct ForeachRun {
    plan: ForeachPlan,
    /// Freshly computed element values, indexed like `plan.elements`.
    results: Vec<Option<Value>>,
    /// Fresh elements not yet completed.
    pending: usize,
}

/// Evaluate `target` with up to `jobs` parallel bound-function invocations.
pub(crate) fn brew(target: &Arc<Recipe>, jobs: usize, cancel: CancelToken) -> Result<Outputs> {
    let jobs = jobs.max(1);
    let cfg = AlkymiConfig::get();
    let root = cfg.cache_root();

    let nodes = graph::collect(target);
    let statuses = status::compute_statuses(target)?;

    let mut runs: Vec<NodeRun> = nodes
        .iter()
        .map(|recipe| NodeRun {
            recipe: recipe.clone(),
            invoke: statuses[&recipe.id()] != Status::Ok,
            done: false,
            pending_ingredients: HashSet::new(),
            dependents: Vec::new(),
            input_checksums: None,
            foreach: None,
        })
        .collect();

    if runs.iter().all(|run| !run.invoke) {
        debug!("{}: everything clean, reusing cached outputs", target.name());
        return target.materialize_outputs(&root);
    }

    // Wire dependency edges between the nodes that must be invoked. Clean
    // nodes in between contribute cached outputs and never block anyone.
    let index_of: std::collections::HashMap<u64, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id(), idx))
        .collect();
    for idx in 0..runs.len() {
        if !runs[idx].invoke {
            continue;
        }
        let ingredient_ids: Vec<u64> = runs[idx]
            .recipe
            .ingredients()
            .iter()
            .map(|ing| ing.id())
            .collect();
        for ing_id in ingredient_ids {
            let ing_idx = index_of[&ing_id];
            if runs[ing_idx].invoke && runs[idx].pending_ingredients.insert(ing_id) {
                runs[ing_idx].dependents.push(idx);
            }
        }
    }

    let ready: VecDeque<usize> = (0..runs.len())
        .filter(|&idx| runs[idx].invoke && runs[idx].pending_ingredients.is_empty())
        .collect();

    let (done_tx, done_rx) = mpsc::channel::<TaskDone>();

    let outcome = std::thread::scope(|scope| {
        let mut task_txs: Vec<mpsc::Sender<Task>> = Vec::with_capacity(jobs);
        for worker in 0..jobs {
            let (task_tx, task_rx) = mpsc::channel::<Task>();
            task_txs.push(task_tx);
            let done_tx = done_tx.clone();
            scope.spawn(move || {
                while let Ok(task) = task_rx.recv() {
                    let done = TaskDone {
                        worker,
                        node_idx: task.node_idx,
                        element_idx: task.element_idx,
                        result: run_task(&task),
                    };
                    if done_tx.send(done).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        let outcome = control_loop(
            &mut runs, ready, &task_txs, &done_rx, jobs, &cfg, &root, &cancel,
        );
        // Dropping the task channels lets the workers drain and exit; the
        // scope joins them.
        drop(task_txs);
        outcome
    });

    match outcome {
        Ok(()) => target.materialize_outputs(&root),
        Err(error) => {
            persist_partial_foreach(&runs, &cfg, &root);
            Err(error)
        }
    }
}

fn run_task(task: &Task) -> std::result::Result<Outputs, String> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match &task.payload {
        TaskPayload::Standard { func, inputs } => func(inputs),
        TaskPayload::Element { func, item, extra } => func(item, extra).map(Outputs::single),
    }));
    match outcome {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "bound function panicked".to_string()
    }
}

/// The controller: expand ready nodes into tasks, dispatch to idle workers,
/// fold completions back into the graph. Single-threaded; never blocks on
/// user code, only on the completion channel.
#[allow(clippy::too_many_arguments)]
fn control_loop(
    runs: &mut [NodeRun],
    mut ready: VecDeque<usize>,
    task_txs: &[mpsc::Sender<Task>],
    done_rx: &mpsc::Receiver<TaskDone>,
    jobs: usize,
    cfg: &AlkymiConfig,
    root: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let mut idle: Vec<usize> = (0..jobs).collect();
    let mut in_flight = 0usize;
    let mut tasks: VecDeque<Task> = VecDeque::new();
    let mut first_error: Option<AlkymiError> = None;

    loop {
        if first_error.is_none() && cancel.is_cancelled() {
            first_error = Some(AlkymiError::Cancelled);
        }

        if first_error.is_none() {
            while let Some(node_idx) = ready.pop_front() {
                if let Err(e) = start_node(node_idx, runs, cfg, root, &mut tasks, &mut ready) {
                    first_error = Some(e);
                    break;
                }
            }
        }

        if first_error.is_none() {
            while !tasks.is_empty() && !idle.is_empty() {
                let worker = idle.pop().unwrap();
                let task = tasks.pop_front().unwrap();
                if task_txs[worker].send(task).is_err() {
                    first_error = Some(AlkymiError::user_code(
                        "scheduler",
                        "worker pool disconnected",
                    ));
                    break;
                }
                in_flight += 1;
            }
        }

        if in_flight == 0 {
            if first_error.is_some() || (tasks.is_empty() && ready.is_empty()) {
                break;
            }
            continue;
        }

        let done = match done_rx.recv() {
            Ok(done) => done,
            Err(_) => {
                first_error.get_or_insert_with(|| {
                    AlkymiError::user_code("scheduler", "worker pool disconnected")
                });
                break;
            }
        };
        idle.push(done.worker);
        in_flight -= 1;
        handle_done(done, runs, cfg, root, &mut ready, &mut first_error);
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Expand one ready node: arg nodes finish inline, standard nodes queue a
/// single task, foreach nodes queue one task per fresh element (in input
/// order) or gather immediately when everything is reusable.
fn start_node(
    idx: usize,
    runs: &mut [NodeRun],
    cfg: &AlkymiConfig,
    root: &Path,
    tasks: &mut VecDeque<Task>,
    ready: &mut VecDeque<usize>,
) -> Result<()> {
    let recipe = runs[idx].recipe.clone();
    runs[idx].input_checksums = Some(current_input_checksums(&recipe, cfg)?);
    debug!("evaluating recipe: {}", recipe.name());

    match recipe.kind() {
        RecipeKind::Arg(_) => {
            let value = recipe.arg_value().unwrap_or(Value::Null);
            finish_with_outputs(idx, Outputs::single(value), runs, cfg, root, ready)
        }
        RecipeKind::Standard(func) => {
            let mut inputs = Vec::with_capacity(recipe.ingredients().len());
            for ingredient in recipe.ingredients() {
                inputs.push(ingredient.contribution(root)?);
            }
            tasks.push_back(Task {
                node_idx: idx,
                element_idx: None,
                payload: TaskPayload::Standard {
                    func: func.clone(),
                    inputs,
                },
            });
            Ok(())
        }
        RecipeKind::Foreach(func) => {
            let mapped = recipe.ingredients().first().cloned().ok_or_else(|| {
                AlkymiError::user_code(recipe.name(), "foreach requires a mapped ingredient")
            })?;
            let contribution = mapped.contribution(root)?;
            let record = recipe.load_record(cfg, root);
            let plan = foreach::plan_elements(&recipe, &contribution, record.as_ref(), root, cfg)?;

            let mut extra = Vec::with_capacity(recipe.ingredients().len().saturating_sub(1));
            for ingredient in &recipe.ingredients()[1..] {
                extra.push(ingredient.contribution(root)?);
            }
            let extra = Arc::new(extra);

            let fresh: Vec<usize> = plan
                .elements
                .iter()
                .enumerate()
                .filter(|(_, element)| element.reuse.is_none())
                .map(|(element_idx, _)| element_idx)
                .collect();
            let results = vec![None; plan.elements.len()];
            let pending = plan.fresh_count();
            runs[idx].foreach = Some(ForeachRun {
                plan,
                results,
                pending,
            });

            if fresh.is_empty() {
                return finish_foreach(idx, runs, cfg, root, ready);
            }
            for element_idx in fresh {
                let item = runs[idx].foreach.as_ref().unwrap().plan.elements[element_idx]
                    .item
                    .clone();
                tasks.push_back(Task {
                    node_idx: idx,
                    element_idx: Some(element_idx),
                    payload: TaskPayload::Element {
                        func: func.clone(),
                        item,
                        extra: extra.clone(),
                    },
                });
            }
            Ok(())
        }
    }
}

/// Fold one worker completion back into the graph. Successful results are
/// recorded even while aborting (completed work is kept); errors after the
/// first are discarded with a warning.
fn handle_done(
    done: TaskDone,
    runs: &mut [NodeRun],
    cfg: &AlkymiConfig,
    root: &Path,
    ready: &mut VecDeque<usize>,
    first_error: &mut Option<AlkymiError>,
) {
    let name = runs[done.node_idx].recipe.name().to_string();
    match done.element_idx {
        None => match done.result {
            Ok(outputs) => {
                if let Err(e) = finish_with_outputs(done.node_idx, outputs, runs, cfg, root, ready)
                {
                    if first_error.is_none() {
                        *first_error = Some(e);
                    } else {
                        warn!("discarding error from '{}': {}", name, e);
                    }
                }
            }
            Err(message) => {
                if first_error.is_none() {
                    *first_error = Some(AlkymiError::user_code(&name, message));
                } else {
                    warn!("discarding error from '{}': {}", name, message);
                }
            }
        },
        Some(element_idx) => {
            let run = &mut runs[done.node_idx];
            let foreach_run = run.foreach.as_mut().unwrap();
            foreach_run.pending -= 1;
            match done.result {
                Ok(outputs) => {
                    let value = outputs.into_vec().pop().unwrap_or(Value::Null);
                    foreach_run.results[element_idx] = Some(value);
                    if foreach_run.pending == 0 && first_error.is_none() {
                        if let Err(e) = finish_foreach(done.node_idx, runs, cfg, root, ready) {
                            *first_error = Some(e);
                        }
                    }
                }
                Err(message) => {
                    if first_error.is_none() {
                        *first_error = Some(AlkymiError::user_code(&name, message));
                    } else {
                        warn!("discarding error from '{}': {}", name, message);
                    }
                }
            }
        }
    }
}

/// Current per-ingredient input checksums; argument recipes use their
/// stored value as the sole input.
fn current_input_checksums(recipe: &Recipe, cfg: &AlkymiConfig) -> Result<Vec<String>> {
    if let Some(value) = recipe.arg_value() {
        return Ok(vec![checksum::checksum_with(&value, cfg)?]);
    }
    Ok(recipe
        .ingredients()
        .iter()
        // Ingredients are clean or already finished here, so records exist.
        .map(|ing| ing.output_tuple_checksum().unwrap_or_default())
        .collect())
}

/// Checksum, persist and publish a completed standard/arg evaluation, then
/// release dependents.
fn finish_with_outputs(
    idx: usize,
    outputs: Outputs,
    runs: &mut [NodeRun],
    cfg: &AlkymiConfig,
    root: &Path,
    ready: &mut VecDeque<usize>,
) -> Result<()> {
    let recipe = runs[idx].recipe.clone();
    let encoded = encode_outputs(&outputs, cfg)?;
    let record = Record::new(
        recipe.name(),
        runs[idx].input_checksums.clone().unwrap_or_default(),
        encoded.checksums,
        recipe.function_checksum().to_string(),
        encoded.docs,
    );
    if recipe.persists(cfg) {
        cache::store(root, &record, &encoded.blobs)?;
    }
    recipe.set_evaluated(record, outputs);
    mark_done(idx, runs, ready);
    Ok(())
}

/// Gather a fully evaluated foreach node: assemble the container from fresh
/// results and reused documents, persist the per-element record, release
/// dependents.
fn finish_foreach(
    idx: usize,
    runs: &mut [NodeRun],
    cfg: &AlkymiConfig,
    root: &Path,
    ready: &mut VecDeque<usize>,
) -> Result<()> {
    let recipe = runs[idx].recipe.clone();
    let input_checksums = runs[idx].input_checksums.clone().unwrap_or_default();
    let (gathered, value) = {
        let foreach_run = runs[idx].foreach.as_ref().unwrap();
        let gathered = foreach::gather_record(&foreach_run.plan, &foreach_run.results, cfg)?;
        let value = foreach::gather_value(&foreach_run.plan, &foreach_run.results, &recipe, root)?;
        (gathered, value)
    };
    let mut record = Record::new(
        recipe.name(),
        input_checksums,
        vec![gathered.container_checksum.clone()],
        recipe.function_checksum().to_string(),
        vec![gathered.container_doc.clone()],
    );
    record.mapped = Some(gathered.mapped);
    if recipe.persists(cfg) {
        cache::store(root, &record, &gathered.blobs)?;
    }
    recipe.set_evaluated(record, Outputs::single(value));
    mark_done(idx, runs, ready);
    Ok(())
}

fn mark_done(idx: usize, runs: &mut [NodeRun], ready: &mut VecDeque<usize>) {
    runs[idx].done = true;
    let id = runs[idx].recipe.id();
    let dependents = runs[idx].dependents.clone();
    for dep_idx in dependents {
        let dependent = &mut runs[dep_idx];
        dependent.pending_ingredients.remove(&id);
        if dependent.pending_ingredients.is_empty() && !dependent.done {
            ready.push_back(dep_idx);
        }
    }
}

/// After an aborted brew, fold every completed element of unfinished
/// foreach nodes into a partial record so the next brew resumes where this
/// one stopped. Failures here only warn; the original error wins.
fn persist_partial_foreach(runs: &[NodeRun], cfg: &AlkymiConfig, root: &Path) {
    for run in runs {
        if run.done {
            continue;
        }
        let Some(foreach_run) = &run.foreach else {
            continue;
        };
        let completed = foreach_run.results.iter().filter(|r| r.is_some()).count()
            + foreach_run
                .plan
                .elements
                .iter()
                .filter(|e| e.reuse.is_some())
                .count();
        if completed == 0 || !run.recipe.persists(cfg) {
            continue;
        }
        match foreach::gather_record(&foreach_run.plan, &foreach_run.results, cfg) {
            Ok(gathered) => {
                let mut record = Record::new(
                    run.recipe.name(),
                    run.input_checksums.clone().unwrap_or_default(),
                    vec![gathered.container_checksum.clone()],
                    run.recipe.function_checksum().to_string(),
                    vec![gathered.container_doc.clone()],
                );
                record.mapped = Some(gathered.mapped);
                match cache::store(root, &record, &gathered.blobs) {
                    Ok(()) => {
                        debug!(
                            "persisted partial foreach progress for '{}' ({} elements)",
                            run.recipe.name(),
                            completed
                        );
                        run.recipe.set_record(record);
                    }
                    Err(e) => warn!(
                        "could not persist partial progress for '{}': {}",
                        run.recipe.name(),
                        e
                    ),
                }
            }
            Err(e) => warn!(
                "could not gather partial progress for '{}': {}",
                run.recipe.name(),
                e
            ),
        }
    }
}
