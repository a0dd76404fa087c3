//! Direct evaluation of stage definitions.
//!
//! Computes every point of a stage from its definitions alone, ignoring all
//! scheduling. Update definitions are replayed point by point in serial
//! order of their reduction domain, so the results are the values any
//! legal schedule must produce.

use crate::analysis::simplify::const_value;
use crate::interp::buffer::Buffer;
use crate::ir::expr::Expr;
use crate::ir::stage::{OutputRequest, StageGraph};
use crate::utils::errors::ExecError;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

type Env = HashMap<String, i64>;

/// The update step being evaluated: reads of the stage itself at `point`
/// see `current`, reads elsewhere see the state before `step`.
struct Step<'s> {
    stage: usize,
    def: usize,
    step: usize,
    point: &'s [i64],
    current: &'s [i64],
}

/// Memoizing evaluator over a stage graph.
pub struct Reference<'a> {
    graph: &'a StageGraph,
    inputs: &'a BTreeMap<String, Buffer>,
    values: HashMap<(usize, Vec<i64>), Vec<i64>>,
    states: HashMap<(usize, usize, usize, Vec<i64>), Vec<i64>>,
    domains: HashMap<(usize, usize), Rc<Vec<Vec<i64>>>>,
}

impl<'a> Reference<'a> {
    pub fn new(graph: &'a StageGraph, inputs: &'a BTreeMap<String, Buffer>) -> Self {
        Self {
            graph,
            inputs,
            values: HashMap::new(),
            states: HashMap::new(),
            domains: HashMap::new(),
        }
    }

    /// Every value of stage `name` at `coords`.
    pub fn value_at(&mut self, name: &str, coords: &[i64]) -> Result<Vec<i64>, ExecError> {
        let graph = self.graph;
        let id = graph.find(name).ok_or_else(|| ExecError::UnknownBuffer(name.to_string()))?;
        let stage = graph.stage(id);
        if stage.is_input() {
            let buffer = self.inputs.get(name).ok_or_else(|| ExecError::UnknownBuffer(name.to_string()))?;
            return buffer.get(coords).map(|v| vec![v]).ok_or_else(|| ExecError::OutOfBounds {
                buffer: name.to_string(),
                index: buffer.offset(coords),
                size: buffer.len(),
            });
        }
        let key = (id.0, coords.to_vec());
        if let Some(v) = self.values.get(&key) {
            return Ok(v.clone());
        }
        let value = self.after(id.0, stage.definitions.len() - 1, coords)?;
        self.values.insert(key, value.clone());
        Ok(value)
    }

    /// State of a point once definitions `0..=def` have all run.
    fn after(&mut self, stage: usize, def: usize, coords: &[i64]) -> Result<Vec<i64>, ExecError> {
        if def == 0 {
            return self.pure(stage, coords);
        }
        let steps = self.domain(stage, def)?.len();
        self.before_step(stage, def, steps, coords)
    }

    fn pure(&mut self, stage: usize, coords: &[i64]) -> Result<Vec<i64>, ExecError> {
        let graph = self.graph;
        let stage = &graph.stages[stage];
        let env: Env = stage.args.iter().cloned().zip(coords.iter().copied()).collect();
        stage.definitions[0].values.iter().map(|v| self.eval(v, &env, None)).collect()
    }

    /// State of a point after definition `def` has run its first `steps`
    /// domain points.
    fn before_step(&mut self, stage: usize, def: usize, steps: usize, coords: &[i64]) -> Result<Vec<i64>, ExecError> {
        let key = (stage, def, steps, coords.to_vec());
        if let Some(v) = self.states.get(&key) {
            return Ok(v.clone());
        }
        let mut current = self.after(stage, def - 1, coords)?;
        let graph = self.graph;
        let definition = &graph.stages[stage].definitions[def];
        let domain = self.domain(stage, def)?;
        let rvars = definition.rvars();

        let mut env = Env::new();
        for (d, arg) in definition.args.iter().enumerate() {
            if let Some(x) = arg.as_var() {
                if !definition.is_rvar(x) {
                    env.insert(x.to_string(), coords[d]);
                }
            }
        }
        for (step, point) in domain.iter().take(steps).enumerate() {
            for (r, value) in rvars.iter().zip(point) {
                env.insert(r.to_string(), *value);
            }
            let at = Step { stage, def, step, point: coords, current: &current };
            if let Some(p) = definition.rdom.as_ref().and_then(|r| r.predicate.as_ref()) {
                if self.eval(p, &env, Some(&at))? == 0 {
                    continue;
                }
            }
            let lhs = definition
                .args
                .iter()
                .map(|a| self.eval(a, &env, Some(&at)))
                .collect::<Result<Vec<_>, _>>()?;
            if lhs != coords {
                continue;
            }
            current = definition
                .values
                .iter()
                .map(|v| self.eval(v, &env, Some(&at)))
                .collect::<Result<Vec<_>, _>>()?;
        }
        self.states.insert(key, current.clone());
        Ok(current)
    }

    /// Points of the reduction domain of `def` in execution order, the
    /// first variable varying fastest.
    fn domain(&mut self, stage: usize, def: usize) -> Result<Rc<Vec<Vec<i64>>>, ExecError> {
        if let Some(d) = self.domains.get(&(stage, def)) {
            return Ok(Rc::clone(d));
        }
        let graph = self.graph;
        let stage_def = &graph.stages[stage];
        let definition = &stage_def.definitions[def];
        self.check_self_reads(stage, def)?;

        let mut points = vec![Vec::new()];
        if let Some(rdom) = &definition.rdom {
            for var in &rdom.vars {
                let (Some(min), Some(extent)) = (const_value(&var.min), const_value(&var.extent)) else {
                    return Err(ExecError::Unsupported(format!(
                        "reduction variable `{}` of `{}` has a non-constant domain",
                        var.name, stage_def.name
                    )));
                };
                let mut next = Vec::with_capacity(points.len() * extent.max(0) as usize);
                for value in min..min + extent {
                    for p in &points {
                        let mut p = p.clone();
                        p.push(value);
                        next.push(p);
                    }
                }
                points = next;
            }
        }
        let points = Rc::new(points);
        self.domains.insert((stage, def), Rc::clone(&points));
        Ok(points)
    }

    /// A read of the stage from its own update must keep every pure
    /// dimension at the position the update writes.
    fn check_self_reads(&self, stage: usize, def: usize) -> Result<(), ExecError> {
        let s = &self.graph.stages[stage];
        let definition = &s.definitions[def];
        for args in definition.calls_to(&s.name) {
            for (d, lhs) in definition.args.iter().enumerate() {
                let pure = lhs.as_var().map_or(false, |x| !definition.is_rvar(x));
                if pure && args.get(d) != Some(lhs) {
                    return Err(ExecError::Unsupported(format!(
                        "update {} of `{}` reads itself at another position of dimension {}",
                        def, s.name, d
                    )));
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, e: &Expr, env: &Env, at: Option<&Step>) -> Result<i64, ExecError> {
        match e {
            Expr::Int(v) => Ok(*v),
            Expr::Var(name) => env.get(name).copied().ok_or_else(|| ExecError::UnboundVariable(name.clone())),
            Expr::Binary { op, a, b } => {
                let a = self.eval(a, env, at)?;
                let b = self.eval(b, env, at)?;
                Ok(op.apply(a, b))
            }
            Expr::Not(a) => Ok((self.eval(a, env, at)? == 0) as i64),
            Expr::Select { cond, then_value, else_value } => {
                if self.eval(cond, env, at)? != 0 {
                    self.eval(then_value, env, at)
                } else {
                    self.eval(else_value, env, at)
                }
            }
            Expr::Call { name, args, value_index } => {
                let coords = args.iter().map(|a| self.eval(a, env, at)).collect::<Result<Vec<_>, _>>()?;
                let values = match at {
                    Some(step) if self.graph.stages[step.stage].name == *name => {
                        if coords == step.point {
                            step.current.to_vec()
                        } else {
                            self.before_step(step.stage, step.def, step.step, &coords)?
                        }
                    }
                    _ => self.value_at(name, &coords)?,
                };
                values.get(*value_index).copied().ok_or_else(|| {
                    ExecError::Unsupported(format!("`{}` has no value {}", name, value_index))
                })
            }
            Expr::Load { buffer, .. } => {
                Err(ExecError::Unsupported(format!("flat load from `{}` in a stage definition", buffer)))
            }
        }
    }
}

/// Evaluate the requested region of a stage: one buffer per value.
pub fn evaluate(
    graph: &StageGraph,
    inputs: &BTreeMap<String, Buffer>,
    request: &OutputRequest,
) -> Result<Vec<Buffer>, ExecError> {
    let stage = graph
        .get(request.stage)
        .ok_or_else(|| ExecError::UnknownBuffer(request.stage.to_string()))?;
    let mut mins = Vec::new();
    let mut extents = Vec::new();
    for range in &request.region {
        let (Some(min), Some(extent)) = (const_value(&range.min), const_value(&range.extent)) else {
            return Err(ExecError::Unsupported(format!("region of `{}` is not constant", stage.name)));
        };
        mins.push(min);
        extents.push(extent);
    }
    let shape = Buffer::new(mins, extents);
    let mut out = vec![shape.clone(); stage.values()];
    let mut reference = Reference::new(graph, inputs);
    for point in shape.points() {
        let values = reference.value_at(&stage.name, &point)?;
        for (buffer, v) in out.iter_mut().zip(values) {
            buffer.set(&point, v);
        }
    }
    debug!("evaluated {} point(s) of {}", shape.len(), stage.name);
    Ok(out)
}
