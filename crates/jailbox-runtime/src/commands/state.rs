//! `state` - report the OCI state document.

use serde_json::Value;

use crate::error::Result;
use crate::Runtime;

pub fn run(runtime: &Runtime, id: &str) -> Result<Value> {
    let handle = runtime.state_db().handle(id);
    let _lock = handle.lock()?;
    let mut state = handle.load()?;
    handle.check_status(&mut state)?;
    Ok(state.report())
}
