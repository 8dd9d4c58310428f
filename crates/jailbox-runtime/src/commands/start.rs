//! `start` - release a created container into its command.

use std::fs::OpenOptions;
use std::io::Write;

use crate::error::{Error, Result};
use crate::hooks::{self, Phase};
use crate::oci;
use crate::state::Status;
use crate::Runtime;

pub fn run(runtime: &Runtime, id: &str) -> Result<()> {
    let handle = runtime.state_db().handle(id);
    let _lock = handle.lock()?;
    let mut state = handle.load()?;

    if state.status != Status::Created {
        return Err(Error::InvalidState {
            id: id.to_string(),
            status: state.status.to_string(),
            expected: "\"created\"",
        });
    }
    state.status = Status::Running;
    handle.save(&state)?;

    // OCI 1.0 lineage: prestart first, then createRuntime.
    let hook_set = oci::hooks(&state.config)?;
    let report = state.report();
    hooks::run_phase(&hook_set, Phase::Prestart, &report)?;
    hooks::run_phase(&hook_set, Phase::CreateRuntime, &report)?;

    // One byte into the fifo unblocks the container process.
    let mut fifo = OpenOptions::new()
        .read(true)
        .write(true)
        .open(handle.start_fifo())?;
    fifo.write_all(&[0])?;
    drop(fifo);

    hooks::run_phase(&hook_set, Phase::Poststart, &report)?;
    Ok(())
}
