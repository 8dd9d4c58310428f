//! The mount engine: OCI mount records against a contained rootfs.
//!
//! Option strings split three ways: names mapped to a mount flag (with
//! polarity - positive sets, negative clears), pseudo-options the runtime
//! interprets itself, and arbitrary `key=value` pairs forwarded to
//! `nmount`. Destinations are resolved component by component inside the
//! rootfs so a hostile symlink cannot escape it.
//!
//! nullfs cannot always cover a single file; support is assumed until the
//! first `ENOTDIR` from the kernel, after which file mounts are emulated
//! by saving the destination aside and copying the source over it. The
//! discovered value persists in state so `unmount` picks the matching
//! strategy.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use rustix::io::Errno;
use tracing::debug;

use crate::error::{Error, Result};
use crate::oci::MountSpec;
use crate::state::ContainerState;
use jailbox_sys::mount as sys;

/// Matches the kernel's symlink recursion limit.
const SYMLOOP_MAX: u32 = 32;

enum OptionEffect {
    Set(u64),
    Clear(u64),
    Ignore,
}

/// The flag-option vocabulary. `None` means the name is not a flag option.
fn flag_for(name: &str) -> Option<OptionEffect> {
    use OptionEffect::{Clear, Ignore, Set};
    Some(match name {
        "async" => Set(sys::MNT_ASYNC),
        "atime" => Clear(sys::MNT_NOATIME),
        "exec" => Clear(sys::MNT_NOEXEC),
        "suid" => Clear(sys::MNT_NOSUID),
        "symfollow" => Clear(sys::MNT_NOSYMFOLLOW),
        "rdonly" | "ro" => Set(sys::MNT_RDONLY),
        "rw" => Clear(sys::MNT_RDONLY),
        "sync" => Set(sys::MNT_SYNCHRONOUS),
        "union" => Set(sys::MNT_UNION),
        "clusterr" => Clear(sys::MNT_NOCLUSTERR),
        "clusterw" => Clear(sys::MNT_NOCLUSTERW),
        "suiddir" => Set(sys::MNT_SUIDDIR),
        "snapshot" => Set(sys::MNT_SNAPSHOT),
        "multilabel" => Set(sys::MNT_MULTILABEL),
        "acls" => Set(sys::MNT_ACLS),
        "nfsv4acls" => Set(sys::MNT_NFS4ACLS),
        "automounted" => Set(sys::MNT_AUTOMOUNTED),
        "untrusted" => Set(sys::MNT_UNTRUSTED),
        "force" => Set(sys::MNT_FORCE),
        "update" => Set(sys::MNT_UPDATE),
        "cover" => Clear(sys::MNT_NOCOVER),
        "emptydir" => Set(sys::MNT_EMPTYDIR),
        "userquota" | "groupquota" | "private" | "rprivate" | "rbind" | "nodev" | "bind" => Ignore,
        _ => return None,
    })
}

/// A mount option the runtime interprets instead of the kernel.
#[derive(Debug)]
enum PseudoOption {
    /// `tmpfs:tmpcopyup` - stage the destination's contents before the
    /// mount hides them, copy them back into the fresh tmpfs after.
    TmpCopyUp { staged: Option<tempfile::TempDir> },
    /// `devfs:rule` - apply a devfs rule to the mounted filesystem.
    DevfsRule,
}

impl PseudoOption {
    fn lookup(fstype: &str, key: &str) -> Option<Self> {
        match (fstype, key) {
            ("tmpfs", "tmpcopyup") => Some(Self::TmpCopyUp { staged: None }),
            ("devfs", "rule") => Some(Self::DevfsRule),
            _ => None,
        }
    }

    fn before_mount(&mut self, destination: &Path, _value: &str) -> Result<()> {
        match self {
            Self::TmpCopyUp { staged } => {
                let tmp = tempfile::Builder::new().prefix("tmpcopyup.").tempdir()?;
                copy_tree(destination, tmp.path())?;
                *staged = Some(tmp);
                Ok(())
            }
            Self::DevfsRule => Ok(()),
        }
    }

    fn after_mount(&mut self, destination: &Path, value: &str) -> Result<()> {
        match self {
            Self::TmpCopyUp { staged } => {
                if let Some(tmp) = staged.take() {
                    copy_tree(tmp.path(), destination)?;
                }
                Ok(())
            }
            Self::DevfsRule => apply_devfs_rule(destination, value),
        }
    }
}

/// Copy a directory tree, preserving symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let kind = entry.file_type()?;
        if kind.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if kind.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn apply_devfs_rule(destination: &Path, rule: &str) -> Result<()> {
    let status = Command::new("/sbin/devfs")
        .arg("-m")
        .arg(destination)
        .arg("rule")
        .arg("apply")
        .args(rule.split_whitespace())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::DevfsFailed(status.code().unwrap_or(-1)))
    }
}

fn push_components(work: &mut VecDeque<OsString>, path: &Path) {
    let mut parts = VecDeque::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => parts.push_back(name.to_os_string()),
            Component::ParentDir => parts.push_back(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    while let Some(part) = parts.pop_back() {
        work.push_front(part);
    }
}

/// Resolve `destination` inside `root`, never escaping it.
///
/// The walk consults the host filesystem one component at a time: symlinks
/// are followed (absolute targets restart from the rootfs, `..` at the
/// rootfs is pinned there) up to [`SYMLOOP_MAX`] expansions. The result is
/// a descendant of `root` by construction.
pub fn resolve_in_rootfs(root: &Path, destination: &str) -> Result<PathBuf> {
    let mut resolved = root.to_path_buf();
    let mut depth = 0u32;
    let mut work = VecDeque::new();
    push_components(&mut work, Path::new(destination));

    while let Some(part) = work.pop_front() {
        if part == ".." {
            if resolved != root {
                resolved.pop();
            }
            continue;
        }
        let candidate = resolved.join(&part);
        match fs::read_link(&candidate) {
            Ok(target) => {
                depth += 1;
                if depth > SYMLOOP_MAX {
                    return Err(Error::syscall(
                        format!("resolving {destination}"),
                        Errno::LOOP,
                    ));
                }
                if target.is_absolute() {
                    resolved = root.to_path_buf();
                }
                push_components(&mut work, &target);
            }
            // Not a symlink, or does not exist yet: take it literally.
            Err(_) => resolved = candidate,
        }
    }
    Ok(resolved)
}

/// Create every missing directory on the way to `path`, recording what was
/// created, deepest path first.
fn create_dir_chain(path: &Path, created: &mut Vec<PathBuf>) -> Result<()> {
    let mut missing = Vec::new();
    let mut current = path;
    while !current.exists() {
        missing.push(current.to_path_buf());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    for dir in missing.iter().rev() {
        fs::create_dir(dir)?;
    }
    created.extend(missing);
    Ok(())
}

/// Where an emulated file mount stashes the original destination.
fn save_path(state: &ContainerState, destination: &Path) -> (PathBuf, PathBuf) {
    let parent = destination.parent().unwrap_or(Path::new("/"));
    let save_dir = parent.join(format!(".save-{}", state.id));
    let save_path = destination
        .file_name()
        .map(|name| save_dir.join(name))
        .unwrap_or_else(|| save_dir.clone());
    (save_dir, save_path)
}

/// Stand in for a nullfs file mount: stash any existing destination under
/// `.save-<id>` and copy the source over it.
fn emulate_file_mount(
    state: &mut ContainerState,
    source: &Path,
    destination: &Path,
    existed: bool,
) -> Result<()> {
    if existed {
        let (save_dir, save_to) = save_path(state, destination);
        if !save_dir.exists() {
            fs::create_dir_all(&save_dir)?;
            state.remove_on_unmount.push(save_dir);
        }
        fs::rename(destination, save_to)?;
    }
    fs::copy(source, destination)?;
    Ok(())
}

/// Apply one mount record.
fn mount_volume(
    state: &mut ContainerState,
    root: &Path,
    mount: &MountSpec,
    prepare_only: bool,
) -> Result<()> {
    let destination = resolve_in_rootfs(root, &mount.destination)?;
    let fstype = mount.effective_type();
    let file_source: Option<&Path> = if fstype == "nullfs" {
        mount.source_path().filter(|p| p.is_file())
    } else {
        None
    };
    let file_mount = file_source.is_some();

    let mut flags: u64 = 0;
    let mut pseudo: Vec<(PseudoOption, String)> = Vec::new();
    let mut opts: Vec<(String, String)> = vec![
        ("fstype".into(), fstype.to_string()),
        ("fspath".into(), destination.to_string_lossy().into_owned()),
    ];
    if fstype == "nullfs" {
        let source = mount
            .source
            .as_deref()
            .ok_or_else(|| Error::malformed("nullfs mount requires a source"))?;
        opts.push(("target".into(), source.to_string()));
    }
    if let Some(options) = &mount.options {
        for option in options {
            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, value),
                None => (option.as_str(), ""),
            };
            if let Some(effect) = flag_for(key) {
                match effect {
                    OptionEffect::Set(flag) => flags |= flag,
                    OptionEffect::Clear(flag) => flags &= !flag,
                    OptionEffect::Ignore => {}
                }
            } else if let Some(handler) = PseudoOption::lookup(fstype, key) {
                pseudo.push((handler, value.to_string()));
            } else {
                opts.push((key.to_string(), value.to_string()));
            }
        }
    }

    let existed = destination.symlink_metadata().is_ok();
    if existed {
        let meta = fs::metadata(&destination)?;
        if file_mount {
            if !meta.is_file() {
                return Err(Error::malformed(format!(
                    "destination {} for file mount exists and is not a file",
                    mount.destination
                )));
            }
        } else if !meta.is_dir() {
            return Err(Error::malformed(format!(
                "destination {} exists and is not a directory",
                mount.destination
            )));
        }
    } else {
        let mut created = Vec::new();
        if file_mount {
            if let Some(parent) = destination.parent() {
                create_dir_chain(parent, &mut created)?;
            }
            fs::File::create(&destination)?;
            state.remove_on_unmount.push(destination.clone());
        } else {
            create_dir_chain(&destination, &mut created)?;
        }
        state.remove_on_unmount.extend(created);
    }

    // First pass of a read-only root only prepares mount points.
    if prepare_only {
        return Ok(());
    }

    for (handler, value) in &mut pseudo {
        handler.before_mount(&destination, value)?;
    }

    match file_source {
        Some(source) if !state.file_mount_supported => {
            emulate_file_mount(state, source, &destination, existed)?;
        }
        _ => match sys::nmount(&opts, flags) {
            Ok(()) => {}
            Err(Errno::NOTDIR) if file_source.is_some() => {
                debug!(destination = %mount.destination, "nullfs refused a file target, emulating");
                state.file_mount_supported = false;
                if let Some(source) = file_source {
                    emulate_file_mount(state, source, &destination, existed)?;
                }
            }
            Err(errno) => {
                return Err(Error::syscall(format!("mounting {}", mount.destination), errno))
            }
        },
    }

    for (handler, value) in &mut pseudo {
        handler.after_mount(&destination, value)?;
    }
    Ok(())
}

/// Apply the mount list in array order. With `prepare_only` set, mount
/// points are created but no mount syscall is issued (the first pass over
/// a read-only root). The first failure triggers a best-effort revert of
/// everything attempted so far.
pub fn mount_volumes(
    state: &mut ContainerState,
    root: &Path,
    mounts: &[MountSpec],
    prepare_only: bool,
) -> Result<()> {
    for (index, mount) in mounts.iter().enumerate() {
        if let Err(e) = mount_volume(state, root, mount, prepare_only) {
            let _ = unmount_volumes(state, root, &mounts[..=index]);
            return Err(e);
        }
    }
    Ok(())
}

/// Undo one mount record: restore a stashed file, or force-unmount.
fn unmount_volume(state: &ContainerState, root: &Path, mount: &MountSpec) -> Result<()> {
    let destination = resolve_in_rootfs(root, &mount.destination)?;
    let fstype = mount.effective_type();
    let file_mount = fstype == "nullfs" && mount.source_path().is_some_and(Path::is_file);

    if file_mount && !state.file_mount_supported {
        let (_, save_from) = save_path(state, &destination);
        if save_from.exists() {
            fs::rename(save_from, destination)?;
        }
        Ok(())
    } else {
        match sys::unmount(&destination, sys::MNT_FORCE) {
            // Nothing mounted there counts as done.
            Ok(()) | Err(Errno::INVAL) | Err(Errno::NOENT) => Ok(()),
            Err(errno) => Err(Error::syscall(
                format!("unmounting {}", mount.destination),
                errno,
            )),
        }
    }
}

/// Revert the mount list and delete the paths this runtime created.
///
/// Unmounts run in reverse array order; failures are collected so the
/// whole set is attempted, and the first one is returned at the end.
/// Cleanup removes `remove_on_unmount` entries in descending lexicographic
/// order so nested paths go before their parents; missing paths are fine.
pub fn unmount_volumes(
    state: &mut ContainerState,
    root: &Path,
    mounts: &[MountSpec],
) -> Result<()> {
    let mut first_error = None;
    for mount in mounts.iter().rev() {
        if let Err(e) = unmount_volume(state, root, mount) {
            first_error.get_or_insert(e);
        }
    }

    let mut paths = std::mem::take(&mut state.remove_on_unmount);
    paths.sort();
    for path in paths.iter().rev() {
        let result = match path.symlink_metadata() {
            Ok(meta) if meta.is_dir() => fs::remove_dir(path),
            Ok(_) => fs::remove_file(path),
            Err(_) => Ok(()),
        };
        if let Err(e) = result {
            first_error.get_or_insert(e.into());
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Mount `target` as a nullfs view at `fspath` (the read-only root alias).
pub fn mount_nullfs(fspath: &Path, target: &Path, flags: u64) -> Result<()> {
    let opts = vec![
        ("fstype".into(), "nullfs".to_string()),
        ("fspath".into(), fspath.to_string_lossy().into_owned()),
        ("target".into(), target.to_string_lossy().into_owned()),
    ];
    sys::nmount(&opts, flags)
        .map_err(|errno| Error::syscall(format!("mounting {}", fspath.display()), errno))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::symlink;

    fn state_for(root: &Path) -> ContainerState {
        ContainerState::new(
            "t1",
            root.to_path_buf(),
            PathBuf::from("/bundle"),
            json!({ "ociVersion": "1.0.2" }),
        )
    }

    fn mount_spec(value: serde_json::Value) -> MountSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn resolve_plain_destination() {
        let root = tempfile::tempdir().unwrap();
        let resolved = resolve_in_rootfs(root.path(), "/data/db").unwrap();
        assert_eq!(resolved, root.path().join("data/db"));
    }

    #[test]
    fn resolve_pins_parent_at_root() {
        let root = tempfile::tempdir().unwrap();
        let resolved = resolve_in_rootfs(root.path(), "/../../etc").unwrap();
        assert_eq!(resolved, root.path().join("etc"));
    }

    #[test]
    fn resolve_follows_relative_symlink() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("real")).unwrap();
        symlink("real", root.path().join("alias")).unwrap();
        let resolved = resolve_in_rootfs(root.path(), "/alias/sub").unwrap();
        assert_eq!(resolved, root.path().join("real/sub"));
    }

    #[test]
    fn resolve_confines_absolute_symlink() {
        let root = tempfile::tempdir().unwrap();
        symlink("/etc", root.path().join("foo")).unwrap();
        let resolved = resolve_in_rootfs(root.path(), "/foo").unwrap();
        assert_eq!(resolved, root.path().join("etc"));
    }

    #[test]
    fn resolve_confines_escaping_symlink() {
        let root = tempfile::tempdir().unwrap();
        symlink("/../../etc", root.path().join("foo")).unwrap();
        let resolved = resolve_in_rootfs(root.path(), "/foo").unwrap();
        assert_eq!(resolved, root.path().join("etc"));
        assert!(resolved.starts_with(root.path()));
    }

    #[test]
    fn resolve_rejects_symlink_loop() {
        let root = tempfile::tempdir().unwrap();
        symlink("b", root.path().join("a")).unwrap();
        symlink("a", root.path().join("b")).unwrap();
        let err = resolve_in_rootfs(root.path(), "/a").unwrap_err();
        assert!(matches!(err, Error::Syscall { errno, .. } if errno == Errno::LOOP));
    }

    #[test]
    fn flag_table_polarity() {
        assert!(matches!(flag_for("ro"), Some(OptionEffect::Set(f)) if f == sys::MNT_RDONLY));
        assert!(matches!(flag_for("rdonly"), Some(OptionEffect::Set(f)) if f == sys::MNT_RDONLY));
        assert!(matches!(flag_for("rw"), Some(OptionEffect::Clear(f)) if f == sys::MNT_RDONLY));
        assert!(matches!(flag_for("atime"), Some(OptionEffect::Clear(f)) if f == sys::MNT_NOATIME));
        assert!(matches!(flag_for("nodev"), Some(OptionEffect::Ignore)));
        assert!(flag_for("tmpcopyup").is_none());
        assert!(flag_for("size").is_none());
    }

    #[test]
    fn pseudo_option_registry() {
        assert!(PseudoOption::lookup("tmpfs", "tmpcopyup").is_some());
        assert!(PseudoOption::lookup("devfs", "rule").is_some());
        assert!(PseudoOption::lookup("nullfs", "tmpcopyup").is_none());
        assert!(PseudoOption::lookup("tmpfs", "rule").is_none());
    }

    #[test]
    fn prepare_only_creates_directory_chain() {
        let root = tempfile::tempdir().unwrap();
        let mut state = state_for(root.path());
        let mounts = [mount_spec(json!({
            "destination": "/var/lib/db",
            "source": "/nonexistent-src-dir",
        }))];
        mount_volumes(&mut state, root.path(), &mounts, true).unwrap();
        assert!(root.path().join("var/lib/db").is_dir());
        // Deepest created path first.
        assert_eq!(
            state.remove_on_unmount,
            vec![
                root.path().join("var/lib/db"),
                root.path().join("var/lib"),
                root.path().join("var"),
            ]
        );
    }

    #[test]
    fn prepare_only_creates_file_mount_point() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::NamedTempFile::new().unwrap();
        let mut state = state_for(root.path());
        let mounts = [mount_spec(json!({
            "destination": "/etc/resolv.conf",
            "source": src.path(),
        }))];
        mount_volumes(&mut state, root.path(), &mounts, true).unwrap();
        assert!(root.path().join("etc/resolv.conf").is_file());
        assert_eq!(
            state.remove_on_unmount,
            vec![
                root.path().join("etc/resolv.conf"),
                root.path().join("etc"),
            ]
        );
    }

    #[test]
    fn prepare_rejects_shape_mismatch() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("data")).unwrap();
        let src = tempfile::NamedTempFile::new().unwrap();
        let mut state = state_for(root.path());
        // File mount onto an existing directory.
        let mounts = [mount_spec(json!({
            "destination": "/data",
            "source": src.path(),
        }))];
        let err = mount_volumes(&mut state, root.path(), &mounts, true).unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }

    #[test]
    fn emulated_file_mount_saves_and_restores() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/resolv.conf"), b"original").unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("resolv.conf");
        fs::write(&src, b"from host").unwrap();

        let mut state = state_for(root.path());
        state.file_mount_supported = false;
        let mounts = [mount_spec(json!({
            "destination": "/etc/resolv.conf",
            "source": src,
        }))];
        mount_volumes(&mut state, root.path(), &mounts, false).unwrap();

        let dest = root.path().join("etc/resolv.conf");
        assert_eq!(fs::read(&dest).unwrap(), b"from host");
        let saved = root.path().join("etc/.save-t1/resolv.conf");
        assert_eq!(fs::read(&saved).unwrap(), b"original");

        unmount_volumes(&mut state, root.path(), &mounts).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"original");
        assert!(!root.path().join("etc/.save-t1").exists());
        assert!(state.remove_on_unmount.is_empty());
    }

    #[test]
    fn cleanup_removes_nested_before_parents() {
        let root = tempfile::tempdir().unwrap();
        let mut state = state_for(root.path());
        let mounts = [mount_spec(json!({
            "destination": "/a/b/c",
            "source": "/nonexistent-src-dir",
        }))];
        mount_volumes(&mut state, root.path(), &mounts, true).unwrap();
        assert!(root.path().join("a/b/c").is_dir());

        unmount_volumes(&mut state, root.path(), &mounts).unwrap();
        assert!(!root.path().join("a").exists());
    }

    #[test]
    fn unmount_ignores_missing_cleanup_paths() {
        let root = tempfile::tempdir().unwrap();
        let mut state = state_for(root.path());
        state
            .remove_on_unmount
            .push(root.path().join("never/created"));
        unmount_volumes(&mut state, root.path(), &[]).unwrap();
    }

    #[test]
    fn copy_tree_preserves_symlinks() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub/file"), b"x").unwrap();
        symlink("sub/file", src.path().join("link")).unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(fs::read(dst.path().join("sub/file")).unwrap(), b"x");
        let meta = fs::symlink_metadata(dst.path().join("link")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_link(dst.path().join("link")).unwrap(),
            PathBuf::from("sub/file")
        );
    }

    #[test]
    fn nullfs_mount_requires_source() {
        let root = tempfile::tempdir().unwrap();
        let mut state = state_for(root.path());
        let mounts = [mount_spec(json!({ "destination": "/data" }))];
        let err = mount_volumes(&mut state, root.path(), &mounts, false).unwrap_err();
        assert!(matches!(err, Error::MalformedConfig(_)));
    }
}
