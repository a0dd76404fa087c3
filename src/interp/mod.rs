//! Execution of lowered pipelines.
//!
//! - [`machine`]: runs flattened statement trees
//! - [`reference`]: evaluates stage definitions directly, without a schedule
//! - [`buffer`]: dense buffers shared by both

pub mod buffer;
pub mod machine;
pub mod reference;

pub use buffer::Buffer;
pub use machine::{ExecStats, Machine};
pub use reference::{evaluate, Reference};

use crate::transform::pipeline::LoweredPipeline;
use crate::utils::errors::ExecError;
use std::collections::BTreeMap;

/// Run a lowered pipeline over `inputs`; returns every output buffer.
pub fn run_pipeline(
    pipeline: &LoweredPipeline,
    inputs: &BTreeMap<String, Buffer>,
) -> Result<(BTreeMap<String, Buffer>, ExecStats), ExecError> {
    let machine = Machine::for_pipeline(pipeline, inputs)?;
    let stats = machine.run(&pipeline.body)?;
    let mut outputs = BTreeMap::new();
    for buffer in pipeline.outputs() {
        let data = machine.buffer(&buffer.name).ok_or_else(|| ExecError::UnknownBuffer(buffer.name.clone()))?;
        outputs.insert(buffer.name.clone(), data);
    }
    Ok((outputs, stats))
}
