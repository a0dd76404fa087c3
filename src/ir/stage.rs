//! The stage graph.
//!
//! Stages live in an arena and refer to each other by [`StageId`] (for
//! schedule levels) or by name (for calls in expressions). The graph is
//! never mutated by lowering; passes that need a rewritten graph work on a
//! clone.

use crate::ir::expr::Expr;
use crate::ir::schedule::{DefinitionSchedule, StageSchedule};
use crate::ir::stmt::Range;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a stage in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId(pub usize);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named reduction variable iterating `[min, min + extent)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionVariable {
    pub name: String,
    pub min: Expr,
    pub extent: Expr,
}

/// The iteration domain of an update definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReductionDomain {
    /// Innermost first
    pub vars: Vec<ReductionVariable>,
    #[serde(default)]
    pub predicate: Option<Expr>,
}

impl ReductionDomain {
    /// A rectangular domain from `(name, min, extent)` triples.
    pub fn new(vars: &[(&str, i64, i64)]) -> Self {
        Self {
            vars: vars
                .iter()
                .map(|(name, min, extent)| ReductionVariable {
                    name: name.to_string(),
                    min: Expr::Int(*min),
                    extent: Expr::Int(*extent),
                })
                .collect(),
            predicate: None,
        }
    }

    /// Restrict the visited points.
    pub fn with_predicate(mut self, predicate: Expr) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(p) => Expr::and(p, predicate),
            None => predicate,
        });
        self
    }

    pub fn contains(&self, var: &str) -> bool {
        self.vars.iter().any(|v| v.name == var)
    }
}

/// One definition of a stage: `name(args) = values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub args: Vec<Expr>,
    pub values: Vec<Expr>,
    #[serde(default)]
    pub rdom: Option<ReductionDomain>,
    #[serde(default)]
    pub schedule: DefinitionSchedule,
}

impl Definition {
    /// Reduction variable names, innermost first.
    pub fn rvars(&self) -> Vec<&str> {
        self.rdom
            .as_ref()
            .map(|r| r.vars.iter().map(|v| v.name.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn is_rvar(&self, name: &str) -> bool {
        self.rdom.as_ref().map_or(false, |r| r.contains(name))
    }

    /// All expressions of the definition, including its domain.
    pub fn exprs(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.args.iter().chain(self.values.iter()).collect();
        if let Some(rdom) = &self.rdom {
            for v in &rdom.vars {
                out.push(&v.min);
                out.push(&v.extent);
            }
            if let Some(p) = &rdom.predicate {
                out.push(p);
            }
        }
        out
    }

    /// Every call to `stage` in the definition, as argument lists.
    pub fn calls_to(&self, stage: &str) -> Vec<Vec<Expr>> {
        let mut out = Vec::new();
        for e in self.exprs() {
            e.visit(&mut |n| {
                if let Expr::Call { name, args, .. } = n {
                    if name == stage {
                        out.push(args.clone());
                    }
                }
            });
        }
        out
    }
}

/// A named computation over integer coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Pure dimension names, first is innermost by default
    pub args: Vec<String>,
    /// Empty for input stages; otherwise the pure definition then updates
    #[serde(default)]
    pub definitions: Vec<Definition>,
    #[serde(default)]
    pub schedule: StageSchedule,
}

impl Stage {
    /// Input stages are external buffers bound at execution time.
    pub fn is_input(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    /// Number of values each point holds.
    pub fn values(&self) -> usize {
        self.definitions.first().map_or(1, |d| d.values.len())
    }

    pub fn has_updates(&self) -> bool {
        self.definitions.len() > 1
    }

    pub fn updates(&self) -> &[Definition] {
        if self.definitions.len() > 1 {
            &self.definitions[1..]
        } else {
            &[]
        }
    }

    /// Index of a pure dimension.
    pub fn dim_index(&self, var: &str) -> Option<usize> {
        self.args.iter().position(|a| a == var)
    }

    /// Names of every stage this stage reads.
    pub fn producers(&self) -> Vec<String> {
        let mut out = std::collections::BTreeSet::new();
        for def in &self.definitions {
            for e in def.exprs() {
                out.extend(e.called_stages());
            }
        }
        out.remove(&self.name);
        out.into_iter().collect()
    }

    /// Storage name of value `index`; tuple stages get one buffer per value.
    pub fn buffer_name(&self, index: usize) -> String {
        buffer_name(&self.name, index, self.values())
    }
}

/// Storage name of value `index` of a stage with `values` values.
pub fn buffer_name(stage: &str, index: usize, values: usize) -> String {
    if values == 1 {
        stage.to_string()
    } else {
        format!("{}.{}", stage, index)
    }
}

/// A stage to compute and the region of it the caller wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub stage: StageId,
    /// One range per pure dimension
    pub region: Vec<Range>,
}

impl OutputRequest {
    pub fn new(stage: StageId, region: Vec<Range>) -> Self {
        Self { stage, region }
    }

    /// A region with constant `(min, extent)` per dimension.
    pub fn constant(stage: StageId, region: &[(i64, i64)]) -> Self {
        Self {
            stage,
            region: region.iter().map(|(m, e)| Range::new(*m, *e)).collect(),
        }
    }
}

/// Arena of stages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageGraph {
    pub stages: Vec<Stage>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input stage (an external buffer).
    pub fn add_input(&mut self, name: &str, args: &[&str]) -> StageId {
        self.push(Stage {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            definitions: Vec::new(),
            schedule: StageSchedule::default(),
        })
    }

    /// Declare a computed stage with its pure definition.
    pub fn add_stage(&mut self, name: &str, args: &[&str], value: Expr) -> StageId {
        self.add_tuple_stage(name, args, vec![value])
    }

    /// Declare a computed stage producing several values per point.
    pub fn add_tuple_stage(&mut self, name: &str, args: &[&str], values: Vec<Expr>) -> StageId {
        let pure = Definition {
            args: args.iter().map(|a| Expr::var(*a)).collect(),
            values,
            rdom: None,
            schedule: DefinitionSchedule::default(),
        };
        self.push(Stage {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            definitions: vec![pure],
            schedule: StageSchedule::default(),
        })
    }

    /// Append an update definition; returns its definition index.
    pub fn add_update(
        &mut self,
        id: StageId,
        args: Vec<Expr>,
        values: Vec<Expr>,
        rdom: Option<ReductionDomain>,
    ) -> usize {
        let stage = &mut self.stages[id.0];
        stage.definitions.push(Definition {
            args,
            values,
            rdom,
            schedule: DefinitionSchedule::default(),
        });
        stage.definitions.len() - 1
    }

    fn push(&mut self, stage: Stage) -> StageId {
        self.stages.push(stage);
        StageId(self.stages.len() - 1)
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn stage_mut(&mut self, id: StageId) -> &mut Stage {
        &mut self.stages[id.0]
    }

    pub fn get(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id.0)
    }

    /// Stage-level schedule of `id`.
    pub fn schedule(&mut self, id: StageId) -> &mut StageSchedule {
        &mut self.stages[id.0].schedule
    }

    /// Loop directives of definition `def` of `id`.
    pub fn definition_schedule(&mut self, id: StageId, def: usize) -> &mut DefinitionSchedule {
        &mut self.stages[id.0].definitions[def].schedule
    }

    pub fn find(&self, name: &str) -> Option<StageId> {
        self.stages.iter().position(|s| s.name == name).map(StageId)
    }

    pub fn by_name(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blur_graph() -> (StageGraph, StageId, StageId, StageId) {
        let mut g = StageGraph::new();
        let input = g.add_input("in", &["x"]);
        let f = g.add_stage("f", &["x"], Expr::call("in", vec![Expr::var("x")]) * 2);
        let out = g.add_stage(
            "out",
            &["x"],
            Expr::call("f", vec![Expr::var("x") - 1]) + Expr::call("f", vec![Expr::var("x") + 1]),
        );
        (g, input, f, out)
    }

    #[test]
    fn test_graph_queries() {
        let (g, input, f, out) = blur_graph();
        assert!(g.stage(input).is_input());
        assert_eq!(g.find("f"), Some(f));
        assert_eq!(g.stage(out).producers(), vec!["f".to_string()]);
        assert_eq!(g.stage(out).definitions[0].calls_to("f").len(), 2);
    }

    #[test]
    fn test_updates_and_buffers() {
        let (mut g, _, f, _) = blur_graph();
        let rdom = ReductionDomain::new(&[("r", 0, 4)]);
        let k = g.add_update(
            f,
            vec![Expr::var("r")],
            vec![Expr::call("f", vec![Expr::var("r")]) + 1],
            Some(rdom),
        );
        assert_eq!(k, 1);
        let stage = g.stage(f);
        assert!(stage.has_updates());
        assert!(stage.updates()[0].is_rvar("r"));
        assert_eq!(stage.buffer_name(0), "f");
        assert_eq!(buffer_name("t", 1, 2), "t.1");
    }
}
