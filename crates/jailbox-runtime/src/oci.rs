//! The OCI bundle config model.
//!
//! `config.json` is kept verbatim as a [`serde_json::Value`] (the state
//! store persists it untouched) and the pieces the runtime acts on are
//! extracted through typed views. Shape violations surface as
//! `malformed config` errors before any state is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Annotation naming the jail this container nests under.
pub const ANNOTATION_PARENT_JAIL: &str = "org.freebsd.parentJail";
/// Annotation selecting a new vnet instead of inherited address families.
pub const ANNOTATION_VNET: &str = "org.freebsd.jail.vnet";

/// One record from `config.mounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub fstype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl MountSpec {
    /// The effective filesystem type: default `nullfs`, with the literal
    /// `bind` spelling rewritten to `nullfs`.
    pub fn effective_type(&self) -> &str {
        match self.fstype.as_deref() {
            None | Some("bind") => "nullfs",
            Some(other) => other,
        }
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref().map(Path::new)
    }
}

/// One hook record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSpec {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Parsed but not enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// The six hook phases of the OCI 1.0/1.1 lineage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<HookSpec>,
    #[serde(
        rename = "createRuntime",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub create_runtime: Vec<HookSpec>,
    #[serde(
        rename = "createContainer",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub create_container: Vec<HookSpec>,
    #[serde(
        rename = "startContainer",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub start_container: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<HookSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<HookSpec>,
}

/// `process.user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSpec {
    pub uid: u32,
    pub gid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub umask: Option<u32>,
    #[serde(rename = "additionalGids", skip_serializing_if = "Option::is_none")]
    pub additional_gids: Option<Vec<u32>>,
}

/// The `process` object from config.json or an exec `process.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub cwd: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,
}

impl ProcessSpec {
    /// Parse and shape-check a `process` fragment.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::malformed("process must be an object"));
        }
        let spec: ProcessSpec = serde_json::from_value(value.clone())
            .map_err(|e| Error::malformed(format!("process: {e}")))?;
        if spec.args.is_empty() {
            return Err(Error::malformed(
                "process.args must have at least one element",
            ));
        }
        Ok(spec)
    }
}

/// Accept `major.minor.patch` with an optional `-rc.N` or `-dev` suffix;
/// only 1.0.x and 1.1.x pass.
pub fn check_version(config: &Value) -> Result<()> {
    let version = config
        .get("ociVersion")
        .ok_or_else(|| Error::malformed("no ociVersion"))?
        .as_str()
        .ok_or_else(|| Error::malformed("ociVersion must be a string"))?;

    let mut base = version;
    if let Some((prefix, suffix)) = version.split_once('-') {
        if !suffix.starts_with("rc.") && suffix != "dev" {
            return Err(Error::malformed(format!("malformed ociVersion {version}")));
        }
        base = prefix;
    }

    let parts: Vec<&str> = base.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::malformed(format!("malformed ociVersion {version}")));
    }
    if parts[0] != "1" || !(parts[1] == "0" || parts[1] == "1") {
        return Err(Error::UnsupportedOciVersion(version.to_string()));
    }
    Ok(())
}

/// Typed view over `config.mounts`; absent or null means no mounts.
pub fn mounts(config: &Value) -> Result<Vec<MountSpec>> {
    match config.get("mounts") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => {
            if !value.is_array() {
                return Err(Error::malformed("mounts must be an array"));
            }
            serde_json::from_value(value.clone())
                .map_err(|e| Error::malformed(format!("mounts: {e}")))
        }
    }
}

/// Typed view over `config.hooks`; absent or null means no hooks.
pub fn hooks(config: &Value) -> Result<Hooks> {
    match config.get("hooks") {
        None | Some(Value::Null) => Ok(Hooks::default()),
        Some(value) => {
            if !value.is_object() {
                return Err(Error::malformed("hooks must be an object"));
            }
            serde_json::from_value(value.clone())
                .map_err(|e| Error::malformed(format!("hooks: {e}")))
        }
    }
}

/// String-valued annotations; non-string values are dropped.
pub fn annotations(config: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(map) = config.get("annotations").and_then(Value::as_object) {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                out.insert(key.clone(), value.to_string());
            }
        }
    }
    out
}

/// One string annotation, if present and a string.
pub fn annotation<'a>(config: &'a Value, key: &str) -> Option<&'a str> {
    config.get("annotations")?.get(key)?.as_str()
}

/// Resolve the rootfs: `config.root.path` if set, else `<bundle>/root`.
/// Relative paths are taken relative to the bundle.
pub fn root_path(config: &Value, bundle: &Path) -> Result<(PathBuf, bool)> {
    let mut path = bundle.join("root");
    let mut readonly = false;
    if let Some(root) = config.get("root") {
        if !root.is_object() && !root.is_null() {
            return Err(Error::malformed("root must be an object"));
        }
        if let Some(p) = root.get("path") {
            let p = p
                .as_str()
                .ok_or_else(|| Error::malformed("root.path must be a string"))?;
            path = bundle.join(p);
        }
        if let Some(ro) = root.get("readonly") {
            readonly = ro
                .as_bool()
                .ok_or_else(|| Error::malformed("root.readonly must be a boolean"))?;
        }
    }
    Ok((path, readonly))
}
