//! `list` - enumerate containers under the state root.

use std::fmt::Write as _;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::state::Status;
use crate::Runtime;

#[derive(Debug, Serialize)]
pub struct ListEntry {
    pub id: String,
    pub pid: i32,
    pub status: Status,
    pub bundle: PathBuf,
}

/// Lock, load and refresh every container that has a state file.
pub fn run(runtime: &Runtime) -> Result<Vec<ListEntry>> {
    let db = runtime.state_db();
    let mut entries = Vec::new();
    for id in db.ids()? {
        let handle = db.handle(&id);
        if !handle.exists() {
            continue;
        }
        let _lock = handle.lock()?;
        let mut state = handle.load()?;
        handle.check_status(&mut state)?;
        let pid = if state.status == Status::Stopped {
            0
        } else {
            state.pid
        };
        entries.push(ListEntry {
            id,
            pid,
            status: state.status,
            bundle: state.bundle,
        });
    }
    Ok(entries)
}

/// Bare ids, one per line (`--quiet`).
pub fn render_quiet(entries: &[ListEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.id);
        out.push('\n');
    }
    out
}

/// The fixed-column table.
pub fn render_table(entries: &[ListEntry]) -> String {
    let id_width = entries
        .iter()
        .map(|e| e.id.len())
        .chain(std::iter::once("ID".len()))
        .max()
        .unwrap_or(2);

    let mut out = String::new();
    let _ = writeln!(out, "{:<id_width$} {:<10} {:<8} {:<40}", "ID", "PID", "STATUS", "BUNDLE");
    for entry in entries {
        let _ = writeln!(
            out,
            "{:<id_width$} {:<10} {:<8} {:<40}",
            entry.id,
            entry.pid,
            entry.status.as_str(),
            entry.bundle.display(),
        );
    }
    out
}

pub fn render_json(entries: &[ListEntry]) -> Value {
    serde_json::json!(entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "pid": e.pid,
                "status": e.status.as_str(),
                "bundle": e.bundle,
            })
        })
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<ListEntry> {
        vec![
            ListEntry {
                id: "alpha".into(),
                pid: 120,
                status: Status::Running,
                bundle: PathBuf::from("/bundles/alpha"),
            },
            ListEntry {
                id: "beta-long-name".into(),
                pid: 0,
                status: Status::Stopped,
                bundle: PathBuf::from("/bundles/beta"),
            },
        ]
    }

    #[test]
    fn table_pads_to_widest_id() {
        let table = render_table(&entries());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ID "));
        assert!(lines[1].starts_with("alpha          120"));
        assert!(lines[2].starts_with("beta-long-name 0"));
    }

    #[test]
    fn json_rendering() {
        let doc = render_json(&entries());
        assert_eq!(doc[0]["id"], "alpha");
        assert_eq!(doc[0]["status"], "running");
        assert_eq!(doc[1]["pid"], 0);
    }

    #[test]
    fn quiet_lists_ids() {
        assert_eq!(render_quiet(&entries()), "alpha\nbeta-long-name\n");
    }
}
