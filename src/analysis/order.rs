//! Realization order.
//!
//! Every stage must be realized after the stages it reads and before the
//! stage whose loop nest hosts its compute or store level. Those
//! constraints form a directed graph over the stages reachable from the
//! outputs; the order is a topological sort of it, ties broken by
//! declaration order. Cycles are reported with the stages on them.

use crate::ir::expr::Expr;
use crate::ir::schedule::LoopLevel;
use crate::ir::stage::{Stage, StageGraph, StageId};
use crate::utils::errors::{GraphError, GraphErrorKind, LowerResult};
use log::{debug, trace};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// The resolved realization order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizationOrder {
    /// Producers first; outputs last
    pub order: Vec<StageId>,
    /// Host stage of every stage computed inside another stage's loops
    pub parents: HashMap<StageId, StageId>,
}

impl RealizationOrder {
    pub fn position(&self, id: StageId) -> Option<usize> {
        self.order.iter().position(|s| *s == id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.order.contains(&id)
    }

    pub fn names(&self, graph: &StageGraph) -> Vec<String> {
        self.order.iter().map(|id| graph.stage(*id).name.clone()).collect()
    }
}

/// Directed constraint graph over stage indices.
#[derive(Debug, Default)]
struct ConstraintGraph {
    nodes: BTreeSet<usize>,
    edges: HashMap<usize, BTreeSet<usize>>,
}

impl ConstraintGraph {
    fn add_edge(&mut self, from: usize, to: usize) {
        self.edges.entry(from).or_default().insert(to);
    }

    fn successors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges.get(&v).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Kahn's algorithm, always taking the smallest ready index.
    fn topological_sort(&self) -> Option<Vec<usize>> {
        let mut in_degree: HashMap<usize, usize> = self.nodes.iter().map(|&n| (n, 0)).collect();
        for &n in &self.nodes {
            for m in self.successors(n) {
                *in_degree.entry(m).or_insert(0) += 1;
            }
        }
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| Reverse(*n))
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(n)) = ready.pop() {
            result.push(n);
            for m in self.successors(n) {
                if let Some(d) = in_degree.get_mut(&m) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(Reverse(m));
                    }
                }
            }
        }
        if result.len() == self.nodes.len() {
            Some(result)
        } else {
            None
        }
    }

    /// Tarjan's algorithm.
    fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        let mut state = TarjanState::default();
        for &v in &self.nodes {
            if !state.indices.contains_key(&v) {
                self.strongconnect(v, &mut state);
            }
        }
        state.sccs
    }

    fn strongconnect(&self, v: usize, state: &mut TarjanState) {
        state.indices.insert(v, state.counter);
        state.lowlinks.insert(v, state.counter);
        state.counter += 1;
        state.stack.push(v);
        state.on_stack.insert(v);

        for w in self.successors(v) {
            if !state.indices.contains_key(&w) {
                self.strongconnect(w, state);
                let low = state.lowlinks[&v].min(state.lowlinks[&w]);
                state.lowlinks.insert(v, low);
            } else if state.on_stack.contains(&w) {
                let low = state.lowlinks[&v].min(state.indices[&w]);
                state.lowlinks.insert(v, low);
            }
        }

        if state.lowlinks[&v] == state.indices[&v] {
            let mut scc = Vec::new();
            while let Some(w) = state.stack.pop() {
                state.on_stack.remove(&w);
                scc.push(w);
                if w == v {
                    break;
                }
            }
            scc.sort_unstable();
            state.sccs.push(scc);
        }
    }
}

#[derive(Default)]
struct TarjanState {
    counter: usize,
    stack: Vec<usize>,
    indices: HashMap<usize, usize>,
    lowlinks: HashMap<usize, usize>,
    on_stack: HashSet<usize>,
    sccs: Vec<Vec<usize>>,
}

fn graph_error(kind: GraphErrorKind, message: String, stages: &[&str]) -> GraphError {
    GraphError::new(kind, message, stages.iter().map(|s| s.to_string()).collect())
}

/// Stages reachable from the outputs through calls, in discovery order.
fn reachable(graph: &StageGraph, outputs: &[StageId]) -> LowerResult<BTreeSet<usize>> {
    let mut seen = BTreeSet::new();
    let mut work: Vec<usize> = outputs.iter().map(|s| s.0).collect();
    while let Some(i) = work.pop() {
        if !seen.insert(i) {
            continue;
        }
        let stage = &graph.stages[i];
        for p in stage.producers() {
            match graph.find(&p) {
                Some(id) => work.push(id.0),
                None => {
                    return Err(graph_error(
                        GraphErrorKind::UnknownStage,
                        format!("`{}` calls unknown stage `{}`", stage.name, p),
                        &[&stage.name],
                    )
                    .into())
                }
            }
        }
    }
    Ok(seen)
}

fn check_calls(graph: &StageGraph, stage: &Stage, e: &Expr) -> LowerResult<()> {
    let mut result = Ok(());
    e.visit(&mut |n| {
        if result.is_err() {
            return;
        }
        if let Expr::Call { name, args, value_index } = n {
            let Some(callee) = graph.by_name(name) else {
                result = Err(graph_error(
                    GraphErrorKind::UnknownStage,
                    format!("`{}` calls unknown stage `{}`", stage.name, name),
                    &[&stage.name],
                ));
                return;
            };
            if args.len() != callee.dimensions() || *value_index >= callee.values() {
                result = Err(graph_error(
                    GraphErrorKind::ArityMismatch,
                    format!(
                        "`{}` calls `{}` with {} arguments (value {}), expected {} arguments and fewer than {} values",
                        stage.name,
                        name,
                        args.len(),
                        value_index,
                        callee.dimensions(),
                        callee.values()
                    ),
                    &[&stage.name, name],
                ));
            }
        }
    });
    result.map_err(Into::into)
}

fn check_definitions(graph: &StageGraph, stage: &Stage) -> LowerResult<()> {
    for (k, def) in stage.definitions.iter().enumerate() {
        if def.args.len() != stage.dimensions() || def.values.len() != stage.values() {
            return Err(graph_error(
                GraphErrorKind::ArityMismatch,
                format!(
                    "definition {} of `{}` has {} arguments and {} values, expected {} and {}",
                    k,
                    stage.name,
                    def.args.len(),
                    def.values.len(),
                    stage.dimensions(),
                    stage.values()
                ),
                &[&stage.name],
            )
            .into());
        }
        for e in def.exprs() {
            check_calls(graph, stage, e)?;
        }
        if k == 0 {
            if def.values.iter().any(|v| v.calls(&stage.name)) {
                return Err(graph_error(
                    GraphErrorKind::RecursiveDefinition,
                    format!("pure definition of `{}` calls itself", stage.name),
                    &[&stage.name],
                )
                .into());
            }
            continue;
        }
        // Pure variables of an update must be iterated, i.e. appear verbatim
        // at their own position on the left-hand side.
        let iterated: HashSet<&str> = stage
            .args
            .iter()
            .zip(def.args.iter())
            .filter(|(a, e)| e.as_var() == Some(a.as_str()))
            .map(|(a, _)| a.as_str())
            .collect();
        for e in def.exprs() {
            for v in e.free_vars() {
                if stage.dim_index(&v).is_some() && !iterated.contains(v.as_str()) && !def.is_rvar(&v) {
                    return Err(graph_error(
                        GraphErrorKind::FreeVariable,
                        format!(
                            "update {} of `{}` uses pure variable `{}` without iterating it",
                            k, stage.name, v
                        ),
                        &[&stage.name],
                    )
                    .into());
                }
            }
        }
    }
    Ok(())
}

fn check_level(graph: &StageGraph, id: StageId, level: &LoopLevel, outputs: &[StageId]) -> LowerResult<()> {
    let stage = graph.stage(id);
    let LoopLevel::At { stage: host, definition, var } = level else {
        return Ok(());
    };
    if outputs.contains(&id) {
        return Err(graph_error(
            GraphErrorKind::InvalidNesting,
            format!("output `{}` cannot be computed or stored inside another stage", stage.name),
            &[&stage.name],
        )
        .into());
    }
    let Some(host_stage) = graph.get(*host) else {
        return Err(graph_error(
            GraphErrorKind::UnknownStage,
            format!("`{}` is scheduled at unknown stage {}", stage.name, host),
            &[&stage.name],
        )
        .into());
    };
    if *host == id {
        return Err(graph_error(
            GraphErrorKind::SelfNesting,
            format!("`{}` is scheduled inside its own loop `{}`", stage.name, var),
            &[&stage.name],
        )
        .into());
    }
    if host_stage.is_input() || *definition >= host_stage.definitions.len() {
        return Err(graph_error(
            GraphErrorKind::InvalidNesting,
            format!(
                "`{}` is scheduled at definition {} of `{}`, which has no such loop nest",
                stage.name, definition, host_stage.name
            ),
            &[&stage.name, &host_stage.name],
        )
        .into());
    }
    if host_stage.schedule.compute_level.is_inlined() && !outputs.contains(host) {
        return Err(graph_error(
            GraphErrorKind::InvalidNesting,
            format!("`{}` is scheduled inside `{}`, which is inlined", stage.name, host_stage.name),
            &[&stage.name, &host_stage.name],
        )
        .into());
    }
    Ok(())
}

/// Compute the realization order of everything the outputs depend on.
pub fn realization_order(graph: &StageGraph, outputs: &[StageId]) -> LowerResult<RealizationOrder> {
    let mut names = HashSet::new();
    for s in &graph.stages {
        if !names.insert(s.name.as_str()) {
            return Err(graph_error(
                GraphErrorKind::DuplicateStage,
                format!("stage name `{}` is declared twice", s.name),
                &[&s.name],
            )
            .into());
        }
    }
    for out in outputs {
        match graph.get(*out) {
            None => {
                return Err(graph_error(
                    GraphErrorKind::UnknownStage,
                    format!("output {} is not a stage of the graph", out),
                    &[],
                )
                .into())
            }
            Some(s) if s.is_input() => {
                return Err(graph_error(
                    GraphErrorKind::InvalidNesting,
                    format!("input `{}` cannot be an output", s.name),
                    &[&s.name],
                )
                .into())
            }
            Some(_) => {}
        }
    }

    let live = reachable(graph, outputs)?;
    let mut constraints = ConstraintGraph::default();
    let mut parents = HashMap::new();
    for &i in &live {
        let id = StageId(i);
        let stage = graph.stage(id);
        constraints.nodes.insert(i);
        check_definitions(graph, stage)?;
        for p in stage.producers() {
            let producer = graph.find(&p).map(|s| s.0).unwrap_or(i);
            if outputs.iter().any(|o| o.0 == producer) {
                return Err(graph_error(
                    GraphErrorKind::OutputConsumed,
                    format!("output `{}` is read by `{}`", p, stage.name),
                    &[&p, &stage.name],
                )
                .into());
            }
            constraints.add_edge(producer, i);
        }
        let compute = &stage.schedule.compute_level;
        let store = stage.schedule.store_level();
        for level in [compute, store] {
            check_level(graph, id, level, outputs)?;
            if let Some(host) = level.stage() {
                if !live.contains(&host.0) {
                    let host = &graph.stage(host).name;
                    return Err(graph_error(
                        GraphErrorKind::InvalidNesting,
                        format!("`{}` is scheduled inside `{}`, which no output needs", stage.name, host),
                        &[&stage.name, host],
                    )
                    .into());
                }
                constraints.add_edge(i, host.0);
            }
        }
        if let Some(host) = compute.stage() {
            parents.insert(id, host);
        }
    }

    match constraints.topological_sort() {
        Some(order) => {
            let order: Vec<StageId> = order.into_iter().map(StageId).collect();
            debug!(
                "realization order: {}",
                order.iter().map(|s| graph.stage(*s).name.as_str()).collect::<Vec<_>>().join(", ")
            );
            for (child, host) in &parents {
                trace!("`{}` nests in `{}`", graph.stage(*child).name, graph.stage(*host).name);
            }
            Ok(RealizationOrder { order, parents })
        }
        None => {
            let cycle = constraints
                .strongly_connected_components()
                .into_iter()
                .find(|scc| scc.len() > 1)
                .unwrap_or_default();
            let names: Vec<&str> = cycle.iter().map(|i| graph.stages[*i].name.as_str()).collect();
            Err(graph_error(
                GraphErrorKind::Cycle,
                "cycle in realization order".to_string(),
                &names,
            )
            .into())
        }
    }
}
