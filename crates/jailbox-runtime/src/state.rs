//! The on-disk container state store.
//!
//! Every container owns one directory under the state root:
//!
//! ```text
//! <root>/<id>/
//! ├── state.json   persistent record
//! ├── state.lock   advisory exclusive lock
//! └── start_wait   named pipe read by the container until `start`
//! ```
//!
//! All commands that read or mutate a live container take the lock before
//! loading and hold it until their last write. `create` releases its lock
//! explicitly before signaling the forked container process, which never
//! holds it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

const STATE_JSON: &str = "state.json";
const STATE_LOCK: &str = "state.lock";
const START_FIFO: &str = "start_wait";

/// Container status. `Creating` is transient and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_file_mount_supported() -> bool {
    true
}

/// The persistent per-container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub root_path: PathBuf,
    pub bundle: PathBuf,
    /// The bundle config.json, verbatim.
    pub config: Value,
    pub status: Status,
    #[serde(default)]
    pub jid: i32,
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub root_readonly: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly_root_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_jail: Option<String>,
    /// Paths this runtime created on the host, removed on delete in
    /// descending lexicographic order.
    #[serde(default)]
    pub remove_on_unmount: Vec<PathBuf>,
    /// Whether the host nullfs accepts file mount targets; discovered at
    /// mount time and persisted so unmount uses the matching strategy.
    #[serde(default = "default_file_mount_supported")]
    pub file_mount_supported: bool,
}

impl ContainerState {
    pub fn new(id: &str, root_path: PathBuf, bundle: PathBuf, config: Value) -> Self {
        Self {
            id: id.to_string(),
            root_path,
            bundle,
            config,
            status: Status::Creating,
            jid: 0,
            pid: 0,
            root_readonly: false,
            readonly_root_path: None,
            parent_jail: None,
            remove_on_unmount: Vec::new(),
            file_mount_supported: true,
        }
    }

    /// The rootfs the jail actually uses: the read-only alias when one was
    /// mounted, the real rootfs otherwise.
    pub fn effective_root(&self) -> &Path {
        match &self.readonly_root_path {
            Some(alias) if self.root_readonly => alias,
            _ => &self.root_path,
        }
    }

    /// The OCI state document: `{ociVersion, id, status, pid?, bundle,
    /// annotations?}`. `pid` is omitted when stopped.
    pub fn report(&self) -> Value {
        let oci_version = self
            .config
            .get("ociVersion")
            .and_then(Value::as_str)
            .unwrap_or("1.1.0");
        let mut doc = json!({
            "ociVersion": oci_version,
            "id": self.id,
            "status": self.status.as_str(),
            "bundle": self.bundle,
        });
        if self.status != Status::Stopped {
            doc["pid"] = json!(self.pid);
        }
        if let Some(annotations) = self.config.get("annotations") {
            if annotations.is_object() {
                doc["annotations"] = annotations.clone();
            }
        }
        doc
    }

    /// Probe the leader with signal 0 and demote to `stopped` if it is no
    /// longer signalable. Returns true when the status changed.
    pub fn refresh_status(&mut self) -> bool {
        if !matches!(self.status, Status::Created | Status::Running) {
            return false;
        }
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(self.pid), None).is_ok();
        if alive {
            false
        } else {
            self.status = Status::Stopped;
            true
        }
    }
}

/// Scoped holder of the advisory exclusive lock on `state.lock`.
///
/// Dropping the guard closes the descriptor, which releases the lock; all
/// exit paths release exactly once. `unlock` exists for the one place that
/// must release early (`create`, before signaling its child).
#[derive(Debug)]
pub struct StateLock {
    fd: OwnedFd,
}

impl StateLock {
    /// Release the lock now instead of at end of scope.
    pub fn unlock(self) {
        let _ = flock(&self.fd, FlockOperation::Unlock);
    }
}

/// The state root; hands out per-container handles.
#[derive(Debug, Clone)]
pub struct StateDb {
    root: PathBuf,
}

impl StateDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self, id: &str) -> StateHandle {
        StateHandle {
            dir: self.root.join(id),
            id: id.to_string(),
        }
    }

    /// Container ids present under the state root, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Handle for one container's state directory.
#[derive(Debug, Clone)]
pub struct StateHandle {
    dir: PathBuf,
    id: String,
}

impl StateHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state_dir(&self) -> &Path {
        &self.dir
    }

    pub fn start_fifo(&self) -> PathBuf {
        self.dir.join(START_FIFO)
    }

    /// True iff the persistent record exists.
    pub fn exists(&self) -> bool {
        self.dir.join(STATE_JSON).is_file()
    }

    /// Reset the directory (removing any residue), recreate it, and take
    /// the exclusive lock.
    pub fn create(&self) -> Result<StateLock> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.dir)?;
        self.acquire_lock()
    }

    /// Take the exclusive lock on an existing container.
    pub fn lock(&self) -> Result<StateLock> {
        if !self.dir.is_dir() {
            return Err(Error::ContainerNotFound(self.id.clone()));
        }
        self.acquire_lock()
    }

    fn acquire_lock(&self) -> Result<StateLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(self.dir.join(STATE_LOCK))?;
        let fd = OwnedFd::from(file);
        flock(&fd, FlockOperation::LockExclusive)
            .map_err(|e| Error::syscall(format!("locking {}", self.dir.display()), e))?;
        Ok(StateLock { fd })
    }

    /// Read `state.json`.
    pub fn load(&self) -> Result<ContainerState> {
        let data = match fs::read(self.dir.join(STATE_JSON)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ContainerNotFound(self.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Atomically replace `state.json`.
    pub fn save(&self, state: &ContainerState) -> Result<()> {
        let tmp = self.dir.join(".state.json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(state)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(STATE_JSON))?;
        Ok(())
    }

    /// Recursively delete the state directory.
    pub fn remove_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load, probe the leader, persist a demotion to `stopped`.
    pub fn check_status(&self, state: &mut ContainerState) -> Result<()> {
        if state.refresh_status() {
            self.save(state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(id: &str) -> ContainerState {
        ContainerState::new(
            id,
            PathBuf::from("/bundles/web/root"),
            PathBuf::from("/bundles/web"),
            json!({ "ociVersion": "1.0.2", "annotations": { "a": "b" } }),
        )
    }

    #[test]
    fn save_load_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::new(root.path());
        let handle = db.handle("c1");
        let _lock = handle.create().unwrap();

        let mut state = sample_state("c1");
        state.status = Status::Created;
        state.jid = 7;
        state.pid = 1234;
        state.remove_on_unmount = vec![PathBuf::from("/r/a/b"), PathBuf::from("/r/a")];
        handle.save(&state).unwrap();

        let loaded = handle.load().unwrap();
        assert_eq!(loaded.id, "c1");
        assert_eq!(loaded.status, Status::Created);
        assert_eq!(loaded.jid, 7);
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.remove_on_unmount, state.remove_on_unmount);
        assert!(loaded.file_mount_supported);
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&state).unwrap()
        );
    }

    #[test]
    fn exists_tracks_state_json() {
        let root = tempfile::tempdir().unwrap();
        let handle = StateDb::new(root.path()).handle("c1");
        assert!(!handle.exists());
        let _lock = handle.create().unwrap();
        assert!(!handle.exists());
        handle.save(&sample_state("c1")).unwrap();
        assert!(handle.exists());
        handle.remove_all().unwrap();
        assert!(!handle.exists());
    }

    #[test]
    fn load_missing_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let handle = StateDb::new(root.path()).handle("ghost");
        assert!(matches!(
            handle.load(),
            Err(Error::ContainerNotFound(id)) if id == "ghost"
        ));
        assert!(matches!(
            handle.lock(),
            Err(Error::ContainerNotFound(_))
        ));
    }

    #[test]
    fn create_resets_residue() {
        let root = tempfile::tempdir().unwrap();
        let handle = StateDb::new(root.path()).handle("c1");
        let _lock = handle.create().unwrap();
        handle.save(&sample_state("c1")).unwrap();
        drop(_lock);

        let _lock = handle.create().unwrap();
        assert!(!handle.exists());
    }

    #[test]
    fn report_omits_pid_when_stopped() {
        let mut state = sample_state("c1");
        state.pid = 99;
        state.status = Status::Running;
        let doc = state.report();
        assert_eq!(doc["status"], "running");
        assert_eq!(doc["pid"], 99);
        assert_eq!(doc["ociVersion"], "1.0.2");
        assert_eq!(doc["annotations"]["a"], "b");

        state.status = Status::Stopped;
        let doc = state.report();
        assert!(doc.get("pid").is_none());
    }

    #[test]
    fn refresh_status_detects_dead_pid() {
        let mut state = sample_state("c1");
        state.status = Status::Running;
        // PID_MAX on FreeBSD is 99999; this pid cannot exist.
        state.pid = i32::MAX - 1;
        assert!(state.refresh_status());
        assert_eq!(state.status, Status::Stopped);

        let mut state = sample_state("c1");
        state.status = Status::Running;
        state.pid = std::process::id() as i32;
        assert!(!state.refresh_status());
        assert_eq!(state.status, Status::Running);
    }

    #[test]
    fn refresh_status_ignores_stopped() {
        let mut state = sample_state("c1");
        state.status = Status::Stopped;
        state.pid = i32::MAX - 1;
        assert!(!state.refresh_status());
    }

    #[test]
    fn ids_sorted() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::new(root.path());
        for id in ["zeta", "alpha", "mid"] {
            let handle = db.handle(id);
            let _lock = handle.create().unwrap();
            handle.save(&sample_state(id)).unwrap();
        }
        assert_eq!(db.ids().unwrap(), vec!["alpha", "mid", "zeta"]);

        let empty = StateDb::new(root.path().join("missing"));
        assert!(empty.ids().unwrap().is_empty());
    }

    #[test]
    fn lock_is_exclusive_across_handles() {
        let root = tempfile::tempdir().unwrap();
        let db = StateDb::new(root.path());
        let handle = db.handle("c1");
        let lock = handle.create().unwrap();

        // A second flock attempt on the same file must block; probe with a
        // nonblocking request from a fresh descriptor.
        let file = File::open(root.path().join("c1").join(STATE_LOCK)).unwrap();
        let fd = OwnedFd::from(file);
        assert!(flock(&fd, FlockOperation::NonBlockingLockExclusive).is_err());

        lock.unlock();
        assert!(flock(&fd, FlockOperation::NonBlockingLockExclusive).is_ok());
    }
}
