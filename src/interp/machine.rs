//! Executor for flattened statement trees.
//!
//! Parallel loops run on scoped threads, each thread taking a contiguous
//! chunk of iterations. Semaphores are counters guarded by a mutex; a wait
//! that does not complete within the machine's timeout is reported as a
//! deadlock. Every load and store is checked against its allocation.

use crate::analysis::simplify::const_value;
use crate::interp::buffer::Buffer;
use crate::ir::expr::{BinOp, Expr};
use crate::ir::stmt::{ForKind, Stmt};
use crate::transform::flatten::{buffer_extent, buffer_min, buffer_stride};
use crate::transform::pipeline::{BufferRole, LoweredPipeline};
use crate::utils::errors::ExecError;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Upper bound on threads per parallel loop.
const MAX_THREADS: i64 = 16;

type Storage = Arc<Vec<AtomicI64>>;

fn storage(data: &[i64]) -> Storage {
    Arc::new(data.iter().map(|v| AtomicI64::new(*v)).collect())
}

struct Semaphore {
    count: Mutex<i64>,
    changed: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self { count: Mutex::new(0), changed: Condvar::new() }
    }

    fn signal(&self, amount: i64) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += amount;
        self.changed.notify_all();
    }

    fn wait(&self, name: &str, target: i64, timeout: Duration) -> Result<(), ExecError> {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, result) = self
            .changed
            .wait_timeout_while(count, timeout, |c| *c < target)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && *count < target {
            return Err(ExecError::Deadlock(name.to_string()));
        }
        Ok(())
    }
}

/// Counters collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecStats {
    /// Stores per buffer
    pub stores: BTreeMap<String, u64>,
    /// Largest allocation made for each buffer, in elements
    pub allocations: BTreeMap<String, i64>,
    /// Loop iterations executed
    pub iterations: u64,
}

impl ExecStats {
    fn merge(&mut self, other: ExecStats) {
        for (buffer, n) in other.stores {
            *self.stores.entry(buffer).or_insert(0) += n;
        }
        for (buffer, size) in other.allocations {
            let entry = self.allocations.entry(buffer).or_insert(size);
            *entry = (*entry).max(size);
        }
        self.iterations += other.iterations;
    }

    pub fn stores_to(&self, buffer: &str) -> u64 {
        self.stores.get(buffer).copied().unwrap_or(0)
    }

    pub fn total_stores(&self) -> u64 {
        self.stores.values().sum()
    }
}

/// Execution state of one thread.
struct Context<'m> {
    machine: &'m Machine,
    vars: Vec<(String, i64)>,
    buffers: Vec<(String, Storage)>,
    semaphores: Vec<(String, Arc<Semaphore>)>,
    stats: ExecStats,
}

impl<'m> Context<'m> {
    fn new(machine: &'m Machine) -> Self {
        Self { machine, vars: Vec::new(), buffers: Vec::new(), semaphores: Vec::new(), stats: ExecStats::default() }
    }

    /// A context for a worker thread: same bindings, fresh counters.
    fn fork(&self) -> Self {
        Self {
            machine: self.machine,
            vars: self.vars.clone(),
            buffers: self.buffers.clone(),
            semaphores: self.semaphores.clone(),
            stats: ExecStats::default(),
        }
    }

    fn var(&self, name: &str) -> Result<i64, ExecError> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .or_else(|| self.machine.params.get(name).copied())
            .ok_or_else(|| ExecError::UnboundVariable(name.to_string()))
    }

    fn storage(&self, name: &str) -> Result<&Storage, ExecError> {
        self.buffers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
            .or_else(|| self.machine.buffers.get(name))
            .ok_or_else(|| ExecError::UnknownBuffer(name.to_string()))
    }

    fn semaphore(&self, name: &str) -> Result<Arc<Semaphore>, ExecError> {
        self.semaphores
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, s)| Arc::clone(s))
            .ok_or_else(|| ExecError::Unsupported(format!("semaphore `{}` is not declared", name)))
    }

    fn slot<'s>(storage: &'s Storage, buffer: &str, index: i64) -> Result<&'s AtomicI64, ExecError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| storage.get(i))
            .ok_or_else(|| ExecError::OutOfBounds { buffer: buffer.to_string(), index, size: storage.len() })
    }

    fn eval(&self, e: &Expr) -> Result<i64, ExecError> {
        match e {
            Expr::Int(v) => Ok(*v),
            Expr::Var(name) => self.var(name),
            Expr::Binary { op: BinOp::And, a, b } => Ok((self.eval(a)? != 0 && self.eval(b)? != 0) as i64),
            Expr::Binary { op: BinOp::Or, a, b } => Ok((self.eval(a)? != 0 || self.eval(b)? != 0) as i64),
            Expr::Binary { op, a, b } => Ok(op.apply(self.eval(a)?, self.eval(b)?)),
            Expr::Not(a) => Ok((self.eval(a)? == 0) as i64),
            Expr::Select { cond, then_value, else_value } => {
                if self.eval(cond)? != 0 {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
            Expr::Load { buffer, index } => {
                let index = self.eval(index)?;
                let storage = self.storage(buffer)?;
                Ok(Self::slot(storage, buffer, index)?.load(Ordering::Relaxed))
            }
            Expr::Call { name, .. } => {
                Err(ExecError::Unsupported(format!("call to `{}` in a statement that was not flattened", name)))
            }
        }
    }

    fn exec(&mut self, s: &Stmt) -> Result<(), ExecError> {
        match s {
            Stmt::Block(stmts) => stmts.iter().try_for_each(|s| self.exec(s)),
            Stmt::For { name, min, extent, kind, body } => {
                let min = self.eval(min)?;
                let extent = self.eval(extent)?;
                if extent <= 0 {
                    return Ok(());
                }
                self.stats.iterations += extent as u64;
                if *kind == ForKind::Parallel && extent > 1 {
                    return self.parallel(name, min, extent, body);
                }
                self.vars.push((name.clone(), min));
                let slot = self.vars.len() - 1;
                for i in 0..extent {
                    self.vars[slot].1 = min + i;
                    self.exec(body)?;
                }
                self.vars.pop();
                Ok(())
            }
            Stmt::LetStmt { name, value, body } => {
                let value = self.eval(value)?;
                self.vars.push((name.clone(), value));
                self.exec(body)?;
                self.vars.pop();
                Ok(())
            }
            Stmt::IfThenElse { cond, then_case, else_case } => {
                if self.eval(cond)? != 0 {
                    self.exec(then_case)
                } else if let Some(e) = else_case {
                    self.exec(e)
                } else {
                    Ok(())
                }
            }
            Stmt::ProducerConsumer { produce, updates, consume, .. } => {
                self.exec(produce)?;
                for u in updates {
                    self.exec(u)?;
                }
                self.exec(consume)
            }
            Stmt::Allocate { name, size, body } => {
                let size = self.eval(size)?;
                if size < 0 {
                    return Err(ExecError::Unsupported(format!("allocation of `{}` has negative size {}", name, size)));
                }
                trace!("allocate {}[{}]", name, size);
                let entry = self.stats.allocations.entry(name.clone()).or_insert(size);
                *entry = (*entry).max(size);
                self.buffers.push((name.clone(), Arc::new((0..size).map(|_| AtomicI64::new(0)).collect())));
                self.exec(body)?;
                self.buffers.pop();
                Ok(())
            }
            Stmt::Store { buffer, index, value } => {
                let value = self.eval(value)?;
                let index = self.eval(index)?;
                let storage = self.storage(buffer)?;
                Self::slot(storage, buffer, index)?.store(value, Ordering::Relaxed);
                match self.stats.stores.get_mut(buffer) {
                    Some(n) => *n += 1,
                    None => {
                        self.stats.stores.insert(buffer.clone(), 1);
                    }
                }
                Ok(())
            }
            Stmt::AssertStmt { cond, message } => {
                if self.eval(cond)? == 0 {
                    return Err(ExecError::AssertionFailed(message.clone()));
                }
                Ok(())
            }
            Stmt::Semaphore { name, body } => {
                self.semaphores.push((name.clone(), Arc::new(Semaphore::new())));
                self.exec(body)?;
                self.semaphores.pop();
                Ok(())
            }
            Stmt::Signal { semaphore, amount } => {
                let amount = self.eval(amount)?;
                self.semaphore(semaphore)?.signal(amount);
                Ok(())
            }
            Stmt::Wait { semaphore, count } => {
                let count = self.eval(count)?;
                self.semaphore(semaphore)?.wait(semaphore, count, self.machine.timeout)
            }
            // Host and device share memory here.
            Stmt::DeviceTransfer { .. } | Stmt::DeviceSync | Stmt::NoOp => Ok(()),
            Stmt::Realize { name, .. } | Stmt::Provide { name, .. } => Err(ExecError::Unsupported(format!(
                "multi-dimensional access to `{}`; flatten the statement first",
                name
            ))),
        }
    }

    fn parallel(&mut self, name: &str, min: i64, extent: i64, body: &Stmt) -> Result<(), ExecError> {
        let threads = extent.min(MAX_THREADS);
        let chunk = (extent + threads - 1) / threads;
        let results: Vec<Result<ExecStats, ExecError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let mut ctx = self.fork();
                    scope.spawn(move || -> Result<ExecStats, ExecError> {
                        ctx.vars.push((name.to_string(), min));
                        let slot = ctx.vars.len() - 1;
                        for i in (t * chunk)..((t + 1) * chunk).min(extent) {
                            ctx.vars[slot].1 = min + i;
                            ctx.exec(body)?;
                        }
                        Ok(ctx.stats)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(ExecError::Unsupported("worker thread panicked".to_string())))
                })
                .collect()
        });
        let mut first_error = None;
        for result in results {
            match result {
                Ok(stats) => self.stats.merge(stats),
                // A failing worker leaves the others waiting; report the
                // cause rather than the resulting timeouts.
                Err(ExecError::Deadlock(s)) => {
                    first_error.get_or_insert(ExecError::Deadlock(s));
                }
                Err(e) => {
                    if matches!(first_error, None | Some(ExecError::Deadlock(_))) {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Executes flattened statement trees against caller-bound buffers and
/// parameters.
#[derive(Debug)]
pub struct Machine {
    params: HashMap<String, i64>,
    buffers: HashMap<String, Storage>,
    shapes: HashMap<String, (Vec<i64>, Vec<i64>)>,
    timeout: Duration,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            params: HashMap::new(),
            buffers: HashMap::new(),
            shapes: HashMap::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Time after which a blocked wait is reported as a deadlock.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bind_param(&mut self, name: impl Into<String>, value: i64) {
        self.params.insert(name.into(), value);
    }

    /// Bind an external buffer and its `min`/`extent`/`stride` parameters.
    pub fn bind_buffer(&mut self, name: &str, buffer: &Buffer) {
        for (d, stride) in buffer.strides().into_iter().enumerate() {
            self.bind_param(buffer_min(name, d), buffer.mins[d]);
            self.bind_param(buffer_extent(name, d), buffer.extents[d]);
            self.bind_param(buffer_stride(name, d), stride);
        }
        self.buffers.insert(name.to_string(), storage(&buffer.data));
        self.shapes.insert(name.to_string(), (buffer.mins.clone(), buffer.extents.clone()));
    }

    /// Current contents of a bound buffer.
    pub fn buffer(&self, name: &str) -> Option<Buffer> {
        let (mins, extents) = self.shapes.get(name)?;
        let data = self.buffers.get(name)?.iter().map(|v| v.load(Ordering::Relaxed)).collect();
        Some(Buffer { mins: mins.clone(), extents: extents.clone(), data })
    }

    /// A machine with `inputs` bound and every output of `pipeline`
    /// allocated over its requested region.
    pub fn for_pipeline(pipeline: &LoweredPipeline, inputs: &BTreeMap<String, Buffer>) -> Result<Self, ExecError> {
        let mut machine = Self::new();
        for buffer in &pipeline.buffers {
            match buffer.role {
                BufferRole::Input => {
                    let data = inputs.get(&buffer.name).ok_or_else(|| ExecError::UnknownBuffer(buffer.name.clone()))?;
                    machine.bind_buffer(&buffer.name, data);
                }
                BufferRole::Output => {
                    let region = pipeline
                        .regions
                        .get(&buffer.stage)
                        .ok_or_else(|| ExecError::UnknownBuffer(buffer.name.clone()))?;
                    let mut mins = Vec::with_capacity(region.len());
                    let mut extents = Vec::with_capacity(region.len());
                    for interval in region {
                        let (Some(min), Some(max)) = (
                            interval.min.as_ref().and_then(const_value),
                            interval.max.as_ref().and_then(const_value),
                        ) else {
                            return Err(ExecError::Unsupported(format!(
                                "region of output `{}` is not constant",
                                buffer.name
                            )));
                        };
                        mins.push(min);
                        extents.push(max - min + 1);
                    }
                    machine.bind_buffer(&buffer.name, &Buffer::new(mins, extents));
                }
            }
        }
        Ok(machine)
    }

    /// Execute `body`.
    pub fn run(&self, body: &Stmt) -> Result<ExecStats, ExecError> {
        let mut ctx = Context::new(self);
        ctx.exec(body)?;
        debug!(
            "executed {} iteration(s), {} store(s)",
            ctx.stats.iterations,
            ctx.stats.total_stores()
        );
        Ok(ctx.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(buffer: &str, index: Expr, value: Expr) -> Stmt {
        Stmt::Store { buffer: buffer.into(), index, value }
    }

    #[test]
    fn test_loop_and_load() {
        // out[i] = in[i] * 2
        let body = Stmt::for_loop(
            "i",
            Expr::int(0),
            Expr::var("out.extent.0"),
            ForKind::Serial,
            store("out", Expr::var("i"), Expr::load("in", Expr::var("i")) * 2),
        );
        let mut m = Machine::new();
        m.bind_buffer("in", &Buffer::from_fn(vec![0], vec![4], |p| p[0] + 1));
        m.bind_buffer("out", &Buffer::new(vec![0], vec![4]));
        let stats = m.run(&body).unwrap();
        assert_eq!(m.buffer("out").unwrap().data, vec![2, 4, 6, 8]);
        assert_eq!(stats.stores_to("out"), 4);
        assert_eq!(stats.iterations, 4);
    }

    #[test]
    fn test_out_of_bounds_store() {
        let body = Stmt::Allocate {
            name: "t".into(),
            size: Expr::int(2),
            body: Box::new(store("t", Expr::int(2), Expr::int(0))),
        };
        let err = Machine::new().run(&body).unwrap_err();
        assert_eq!(err, ExecError::OutOfBounds { buffer: "t".into(), index: 2, size: 2 });
    }

    #[test]
    fn test_parallel_loop_with_semaphore_chain() {
        // Each iteration waits for the previous one: out[i] = out[i - 1] + 1
        let body = Stmt::Block(vec![
            Stmt::Wait { semaphore: "s".into(), count: Expr::var("i") },
            Stmt::if_then(
                Expr::lt(Expr::int(0), Expr::var("i")),
                store("out", Expr::var("i"), Expr::load("out", Expr::var("i") - 1) + 1),
            ),
            Stmt::Signal { semaphore: "s".into(), amount: Expr::int(1) },
        ]);
        let s = Stmt::Semaphore {
            name: "s".into(),
            body: Box::new(Stmt::for_loop("i", Expr::int(0), Expr::int(40), ForKind::Parallel, body)),
        };
        let mut m = Machine::new();
        m.bind_buffer("out", &Buffer::new(vec![0], vec![40]));
        m.run(&s).unwrap();
        assert_eq!(m.buffer("out").unwrap().data, (0..40).collect::<Vec<i64>>());
    }

    #[test]
    fn test_unsatisfied_wait_times_out() {
        let s = Stmt::Semaphore {
            name: "s".into(),
            body: Box::new(Stmt::Wait { semaphore: "s".into(), count: Expr::int(1) }),
        };
        let m = Machine::new().with_timeout(Duration::from_millis(20));
        assert_eq!(m.run(&s).unwrap_err(), ExecError::Deadlock("s".into()));
    }

    #[test]
    fn test_failed_assertion() {
        let s = Stmt::AssertStmt { cond: Expr::lt(Expr::var("n"), Expr::int(3)), message: "n < 3".into() };
        let mut m = Machine::new();
        m.bind_param("n", 5);
        assert_eq!(m.run(&s).unwrap_err(), ExecError::AssertionFailed("n < 3".into()));
    }
}
