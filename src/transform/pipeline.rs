//! The lowering driver.
//!
//! Runs every pass in order over one stage graph:
//!
//! order → inline → loop nests and realizations → bounds → sliding window
//! → storage folding → device transfers → synchronization → flattening →
//! custom passes → simplification.

use crate::analysis::bounds::infer_bounds;
use crate::analysis::interval::Region;
use crate::analysis::order::realization_order;
use crate::ir::stage::{OutputRequest, StageGraph, StageId};
use crate::ir::stmt::Stmt;
use crate::ir::target::Target;
use crate::transform::device::insert_device_transfers;
use crate::transform::flatten::flatten;
use crate::transform::inline::inline_stages;
use crate::transform::loops::NestOptions;
use crate::transform::realize::build_realizations;
use crate::transform::simplify::SimplifyStmt;
use crate::transform::sliding_window::{slide_windows, SlideInfo};
use crate::transform::storage_folding::{fold_storage, FoldPlan};
use crate::transform::sync::synchronize;
use crate::transform::Transform;
use crate::utils::errors::{BoundsError, BoundsErrorKind, GraphError, GraphErrorKind, LowerResult};
use crate::utils::pretty::CodeFormatter;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Lowering configuration.
#[derive(Clone)]
pub struct LowerConfig {
    pub target: Target,
    /// Lower vectorized loops as serial loops
    pub no_vectorize: bool,
    pub enable_sliding_window: bool,
    /// Choose folds automatically; explicit requests are always honored
    pub enable_storage_folding: bool,
    /// Passes run after flattening, in order
    pub custom_passes: Vec<Arc<dyn Transform + Send + Sync>>,
}

impl fmt::Debug for LowerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowerConfig")
            .field("target", &self.target)
            .field("no_vectorize", &self.no_vectorize)
            .field("enable_sliding_window", &self.enable_sliding_window)
            .field("enable_storage_folding", &self.enable_storage_folding)
            .field("custom_passes", &self.custom_passes.iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            target: Target::host(),
            no_vectorize: false,
            enable_sliding_window: true,
            enable_storage_folding: true,
            custom_passes: Vec::new(),
        }
    }
}

impl LowerConfig {
    /// Default configuration for `target`.
    pub fn for_target(target: Target) -> Self {
        Self { target, ..Default::default() }
    }

    /// No reuse between iterations: every stage computes its full region
    /// on every iteration of its compute loop.
    pub fn without_reuse() -> Self {
        Self {
            enable_sliding_window: false,
            enable_storage_folding: false,
            ..Default::default()
        }
    }

    /// Append a custom pass.
    pub fn with_pass(mut self, pass: Arc<dyn Transform + Send + Sync>) -> Self {
        self.custom_passes.push(pass);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferRole {
    Input,
    Output,
}

/// A buffer bound by the caller at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBuffer {
    pub name: String,
    pub stage: String,
    pub dimensions: usize,
    pub role: BufferRole,
}

/// Result of lowering.
#[derive(Debug, Clone, Serialize)]
pub struct LoweredPipeline {
    pub name: String,
    pub body: Stmt,
    /// Stage names in realization order
    pub order: Vec<String>,
    /// Region of every stage
    pub regions: BTreeMap<String, Region>,
    pub buffers: Vec<ExternalBuffer>,
    pub slides: Vec<SlideInfo>,
    pub folds: Vec<FoldPlan>,
    /// Passes that changed the tree
    pub applied_passes: Vec<String>,
}

impl LoweredPipeline {
    pub fn inputs(&self) -> impl Iterator<Item = &ExternalBuffer> {
        self.buffers.iter().filter(|b| b.role == BufferRole::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &ExternalBuffer> {
        self.buffers.iter().filter(|b| b.role == BufferRole::Output)
    }
}

/// Lowering driver.
pub struct Lowering<'a> {
    config: &'a LowerConfig,
}

impl<'a> Lowering<'a> {
    pub fn new(config: &'a LowerConfig) -> Self {
        Self { config }
    }

    fn check_outputs(graph: &StageGraph, outputs: &[OutputRequest]) -> LowerResult<()> {
        for request in outputs {
            let Some(stage) = graph.get(request.stage) else {
                return Err(GraphError::new(
                    GraphErrorKind::UnknownStage,
                    format!("output {} does not exist", request.stage),
                    vec![],
                )
                .into());
            };
            if request.region.len() != stage.dimensions() {
                return Err(BoundsError::new(
                    BoundsErrorKind::RegionMismatch,
                    &stage.name,
                    None,
                    format!(
                        "requested region has {} dimension(s), stage has {}",
                        request.region.len(),
                        stage.dimensions()
                    ),
                )
                .into());
            }
        }
        Ok(())
    }

    fn external_buffers(graph: &StageGraph, order: &[StageId], outputs: &[OutputRequest]) -> Vec<ExternalBuffer> {
        let mut buffers = Vec::new();
        for id in order {
            let stage = graph.stage(*id);
            let role = if stage.is_input() {
                BufferRole::Input
            } else if outputs.iter().any(|o| o.stage == *id) {
                BufferRole::Output
            } else {
                continue;
            };
            for v in 0..stage.values() {
                buffers.push(ExternalBuffer {
                    name: stage.buffer_name(v),
                    stage: stage.name.clone(),
                    dimensions: stage.dimensions(),
                    role,
                });
            }
        }
        buffers
    }

    /// Lower `graph` computing the requested `outputs`.
    pub fn lower(&self, name: &str, graph: &StageGraph, outputs: &[OutputRequest]) -> LowerResult<LoweredPipeline> {
        let config = self.config;
        info!("lowering pipeline `{}` for target {}", name, config.target);
        Self::check_outputs(graph, outputs)?;
        let output_ids: Vec<StageId> = outputs.iter().map(|o| o.stage).collect();

        let order = realization_order(graph, &output_ids)?;
        debug!("realization order: {}", order.names(graph).join(", "));

        let graph = inline_stages(graph, &order, outputs)?;
        let options = NestOptions { target: &config.target, no_vectorize: config.no_vectorize };
        let tree = build_realizations(&graph, &order, outputs, options)?;
        debug!("loop nests built");

        let bounds = infer_bounds(tree, &graph, &order, outputs)?;
        debug!("bounds inferred for {} stage(s)", bounds.regions.len());

        let (tree, windows) = slide_windows(bounds.body, &graph, config.enable_sliding_window);
        let slides: Vec<SlideInfo> = windows.slides().cloned().collect();
        debug!("{} stage(s) slid", slides.len());

        let (tree, folds) = fold_storage(tree, &graph, &windows, config.enable_storage_folding)?;
        let tree = insert_device_transfers(tree, &graph)?;
        let tree = synchronize(tree, &windows, &folds);
        let mut body = flatten(tree, &graph);
        debug!("storage flattened");

        let mut applied_passes = Vec::new();
        for pass in &config.custom_passes {
            if pass.apply(&mut body)? {
                applied_passes.push(pass.name().to_string());
            }
        }
        if SimplifyStmt.apply(&mut body)? {
            applied_passes.push(SimplifyStmt.name().to_string());
        }

        info!("lowered `{}`: {} stage(s) in order", name, order.order.len());
        Ok(LoweredPipeline {
            name: name.to_string(),
            body,
            order: order.names(&graph),
            regions: bounds.regions,
            buffers: Self::external_buffers(&graph, &order.order, outputs),
            slides,
            folds,
            applied_passes,
        })
    }
}

fn summarize(s: &Stmt, out: &mut CodeFormatter) {
    match s {
        Stmt::For { name, kind, body, .. } => {
            out.section(&format!("{}for {}", kind.prefix(), name), |o| summarize(body, o))
        }
        Stmt::ProducerConsumer { name, produce, updates, consume } => {
            out.section(&format!("produce {}", name), |o| summarize(produce, o));
            for u in updates {
                out.section(&format!("update {}", name), |o| summarize(u, o));
            }
            if !consume.is_no_op() {
                out.section(&format!("consume {}", name), |o| summarize(consume, o));
            }
        }
        Stmt::Allocate { name, body, .. } => out.section(&format!("store {}", name), |o| summarize(body, o)),
        Stmt::Realize { name, body, .. } => out.section(&format!("store {}", name), |o| summarize(body, o)),
        Stmt::Semaphore { name, body } => out.section(&format!("semaphore {}", name), |o| summarize(body, o)),
        Stmt::Store { buffer, .. } => out.writeln(&format!("{}(...) = ...", buffer)),
        Stmt::Provide { name, .. } => out.writeln(&format!("{}(...) = ...", name)),
        Stmt::DeviceTransfer { buffer, direction, .. } => out.writeln(&format!("{:?} {}", direction, buffer)),
        other => {
            for c in other.children() {
                summarize(c, out);
            }
        }
    }
}

/// Loop and produce/consume structure of a statement, one line per loop
/// or stage.
pub fn print_loop_nest(s: &Stmt) -> String {
    let mut out = CodeFormatter::default_indent();
    summarize(s, &mut out);
    out.finish()
}
