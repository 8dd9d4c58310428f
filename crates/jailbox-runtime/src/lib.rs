//! jailbox-runtime: OCI container lifecycle on FreeBSD jails.
//!
//! The runtime is a short-lived CLI process; every invocation runs one
//! lifecycle verb against a shared on-disk state root. The pieces:
//!
//! - **state** - Crash-safe per-container state store with advisory locking
//! - **jail** - Typed parameter wrapper over the jail(2) syscalls
//! - **mounts** - OCI mount records applied against a contained rootfs
//! - **hooks** - OCI lifecycle hooks at six phases
//! - **process** - The container `process` object: validation, tty handoff,
//!   exec
//! - **commands** - The lifecycle verbs orchestrating everything above
//!
//! ## Concurrency
//!
//! Multiple invocations may race on one container; `state.lock` carries an
//! advisory exclusive lock for the lifetime of any mutating command. The
//! `create` rendezvous between the runtime and the prospective container
//! process runs over a socketpair plus a named pipe (`start_wait`), which
//! the container holds open until `start` writes the release byte.

pub mod commands;
pub mod error;
pub mod hooks;
pub mod jail;
pub mod mounts;
pub mod oci;
pub mod process;
pub mod signals;
pub mod state;

pub use error::{Error, Result};

use std::path::PathBuf;

/// Exit-after-validation switch, driven by the hidden `--testing` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestMode {
    #[default]
    None,
    Validation,
}

/// Per-invocation context shared by all commands.
#[derive(Debug, Clone)]
pub struct Runtime {
    /// State directory root (`--root`, default `/var/run/jailbox`).
    pub state_root: PathBuf,
    pub test_mode: TestMode,
}

impl Runtime {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            test_mode: TestMode::None,
        }
    }

    pub fn with_test_mode(mut self, mode: TestMode) -> Self {
        self.test_mode = mode;
        self
    }

    pub(crate) fn state_db(&self) -> state::StateDb {
        state::StateDb::new(&self.state_root)
    }
}
