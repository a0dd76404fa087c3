//! Producer/consumer synchronization for sliding windows over parallel
//! loops.
//!
//! Iteration `i` of a parallel loop reuses what iteration `i - 1` computed,
//! so producers run in iteration order. With folded storage a producer may
//! also overwrite rows that earlier iterations still read, so it first
//! waits until enough consumers are done:
//!
//! ```text
//! semaphore f.produced {
//!  semaphore f.consumed {
//!   parallel for (v, ...) {
//!    produce f {
//!     wait(f.produced, i)
//!     wait(f.consumed, i + lag)
//!     ...
//!     signal(f.produced, 1)
//!    }
//!    consume f {
//!     ...
//!     wait(f.consumed, i)
//!     signal(f.consumed, 1)
//!    }
//! ```

use crate::analysis::simplify::simplify;
use crate::ir::expr::Expr;
use crate::ir::stmt::{ForKind, Stmt};
use crate::transform::sliding_window::SlidingWindows;
use crate::transform::storage_folding::{consumer_lag, FoldPlan};
use log::debug;

pub fn produced_semaphore(stage: &str) -> String {
    format!("{}.produced", stage)
}

pub fn consumed_semaphore(stage: &str) -> String {
    format!("{}.consumed", stage)
}

fn wait(semaphore: &str, count: Expr) -> Stmt {
    Stmt::Wait { semaphore: semaphore.to_string(), count }
}

fn signal(semaphore: &str) -> Stmt {
    Stmt::Signal { semaphore: semaphore.to_string(), amount: Expr::int(1) }
}

fn guard_producer(tree: Stmt, stage: &str, iteration: &Expr, lag: Option<i64>) -> Stmt {
    let produced = produced_semaphore(stage);
    let consumed = consumed_semaphore(stage);
    tree.replace_producer(stage, &mut |pc| match pc {
        Stmt::ProducerConsumer { name, produce, updates, consume } => {
            let mut pre = vec![wait(&produced, iteration.clone())];
            if let Some(lag) = lag {
                pre.push(wait(&consumed, simplify(&(iteration.clone() + lag))));
            }
            pre.push(*produce);
            pre.push(signal(&produced));
            let consume = Stmt::block(vec![*consume, wait(&consumed, iteration.clone()), signal(&consumed)]);
            Stmt::ProducerConsumer {
                name,
                produce: Box::new(Stmt::block(pre)),
                updates,
                consume: Box::new(consume),
            }
        }
        other => other,
    })
}

fn wrap_loop(tree: Stmt, loop_name: &str, stage: &str, iteration: &Expr, lag: Option<i64>) -> Stmt {
    match tree {
        Stmt::For { name, min, extent, kind, body } if name == loop_name => {
            let body = guard_producer(*body, stage, iteration, lag);
            let inner = Stmt::For { name, min, extent, kind, body: Box::new(body) };
            Stmt::Semaphore {
                name: produced_semaphore(stage),
                body: Box::new(Stmt::Semaphore { name: consumed_semaphore(stage), body: Box::new(inner) }),
            }
        }
        other => other.map_children(|c| wrap_loop(c, loop_name, stage, iteration, lag)),
    }
}

/// Insert semaphores for every stage that slides along a parallel loop.
pub fn synchronize(tree: Stmt, windows: &SlidingWindows, folds: &[FoldPlan]) -> Stmt {
    let mut tree = tree;
    for info in windows.slides().filter(|s| s.loop_kind == ForKind::Parallel) {
        let lag = folds
            .iter()
            .find(|p| p.stage == info.stage)
            .and_then(|p| consumer_lag(info.window?, info.growth?, p.factor));
        let iteration = simplify(&(Expr::var(info.loop_name.clone()) - info.loop_min.clone()));
        debug!(
            "synchronizing `{}` across parallel loop `{}` (consumer lag {:?})",
            info.stage, info.loop_name, lag
        );
        tree = wrap_loop(tree, &info.loop_name, &info.stage, &iteration, lag);
    }
    tree
}
