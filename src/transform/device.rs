//! Host/device transfer markers around GPU kernels.
//!
//! Every outermost `GpuBlock` loop is a kernel launch. Buffers it reads are
//! copied to the device before it, buffers it writes are copied back after
//! it, and a `device_sync` separates the launch from the copies back.
//! Storage realized inside the kernel stays on the device.

use crate::analysis::bounds::{boxes_touched, Access};
use crate::analysis::interval::Region;
use crate::ir::stage::StageGraph;
use crate::ir::stmt::{ForKind, Range, Stmt, TransferDirection};
use crate::utils::errors::{BoundsError, BoundsErrorKind, LowerResult, ScheduleError, ScheduleErrorKind};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

fn realized_inside(s: &Stmt) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    s.visit(&mut |n| {
        if let Stmt::Realize { name, .. } = n {
            out.insert(name.clone());
        }
    });
    out
}

fn to_ranges(stage: &str, region: &Region) -> LowerResult<Vec<Range>> {
    region
        .iter()
        .map(|i| match (&i.min, i.extent()) {
            (Some(min), Some(extent)) => Ok(Range::new(min.clone(), extent)),
            _ => Err(BoundsError::new(
                BoundsErrorKind::Unbounded,
                stage,
                None,
                "region copied to or from the device is unbounded",
            )
            .into()),
        })
        .collect()
}

fn transfers(
    graph: &StageGraph,
    boxes: &BTreeMap<String, Region>,
    local: &BTreeSet<String>,
    direction: TransferDirection,
) -> LowerResult<Vec<Stmt>> {
    let mut out = Vec::new();
    for (stage, region) in boxes {
        if local.contains(stage) {
            continue;
        }
        let region = to_ranges(stage, region)?;
        let values = graph.by_name(stage).map_or(1, |s| s.values());
        for v in 0..values {
            out.push(Stmt::DeviceTransfer {
                buffer: crate::ir::stage::buffer_name(stage, v, values),
                direction,
                region: region.clone(),
            });
        }
    }
    Ok(out)
}

fn kernel(graph: &StageGraph, launch: Stmt) -> LowerResult<Stmt> {
    let local = realized_inside(&launch);
    let reads = boxes_touched(&launch, Access::Reads);
    let writes = boxes_touched(&launch, Access::Writes);
    let mut stmts = transfers(graph, &reads, &local, TransferDirection::ToDevice)?;
    if let Stmt::For { name, .. } = &launch {
        debug!("kernel `{}` reads {} and writes {} buffer(s)", name, reads.len(), writes.len());
    }
    stmts.push(launch);
    stmts.push(Stmt::DeviceSync);
    stmts.extend(transfers(graph, &writes, &local, TransferDirection::ToHost)?);
    Ok(Stmt::block(stmts))
}

fn check_thread_loops(s: &Stmt, in_block: bool) -> LowerResult<()> {
    let in_block = match s {
        Stmt::For { name, kind: ForKind::GpuThread, .. } if !in_block => {
            let stage = name.split('.').next().unwrap_or(name);
            return Err(ScheduleError::new(
                ScheduleErrorKind::IllegalLoopKind,
                stage,
                format!("GPU thread loop `{}` is not inside a GPU block loop", name),
            )
            .into());
        }
        Stmt::For { kind: ForKind::GpuBlock, .. } => true,
        _ => in_block,
    };
    s.children().into_iter().try_for_each(|c| check_thread_loops(c, in_block))
}

fn mark(graph: &StageGraph, s: Stmt) -> LowerResult<Stmt> {
    match s {
        launch @ Stmt::For { kind: ForKind::GpuBlock, .. } => kernel(graph, launch),
        other => {
            let mut err = None;
            let out = other.map_children(|c| match mark(graph, c) {
                Ok(c) => c,
                Err(e) => {
                    err.get_or_insert(e);
                    Stmt::NoOp
                }
            });
            match err {
                Some(e) => Err(e),
                None => Ok(out),
            }
        }
    }
}

/// Insert transfers around every GPU kernel in `tree`.
pub fn insert_device_transfers(tree: Stmt, graph: &StageGraph) -> LowerResult<Stmt> {
    check_thread_loops(&tree, false)?;
    mark(graph, tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::Expr;
    use crate::utils::errors::LowerError;

    fn kernel_loop(kind: ForKind) -> Stmt {
        let body = Stmt::Provide {
            name: "out".into(),
            values: vec![Expr::call("in", vec![Expr::var("out.s0.x")]) + 1],
            args: vec![Expr::var("out.s0.x")],
        };
        Stmt::for_loop("out.s0.x", Expr::int(0), Expr::int(16), kind, body)
    }

    fn graph() -> StageGraph {
        let mut g = StageGraph::new();
        g.add_input("in", &["x"]);
        g.add_stage("out", &["x"], Expr::call("in", vec![Expr::var("x")]) + 1);
        g
    }

    #[test]
    fn test_kernel_is_bracketed() {
        let s = insert_device_transfers(kernel_loop(ForKind::GpuBlock), &graph()).unwrap();
        let text = s.to_string();
        let to_device = text.find("copy_to_device in([0, 16])").unwrap();
        let launch = text.find("gpu_block for").unwrap();
        let sync = text.find("device_sync").unwrap();
        let to_host = text.find("copy_to_host out([0, 16])").unwrap();
        assert!(to_device < launch && launch < sync && sync < to_host);
    }

    #[test]
    fn test_cpu_loops_have_no_transfers() {
        let s = insert_device_transfers(kernel_loop(ForKind::Parallel), &graph()).unwrap();
        assert_eq!(s, kernel_loop(ForKind::Parallel));
    }

    #[test]
    fn test_thread_loop_needs_block_loop() {
        match insert_device_transfers(kernel_loop(ForKind::GpuThread), &graph()).unwrap_err() {
            LowerError::Schedule(e) => assert_eq!(e.kind, ScheduleErrorKind::IllegalLoopKind),
            other => panic!("unexpected {}", other),
        }
    }
}
