//! Typed wrapper over the jail(2) parameter interface.
//!
//! [`JailConfig`] maps parameter names to typed values and refuses the
//! wrong variant for well-known keys at insertion time; [`Jail`] is a
//! handle on a live jail. The kernel's `errmsg` text rides along on every
//! failure.

use std::collections::BTreeMap;

use jailbox_sys::jail::{self as sys, ParamList, JAIL_CREATE, JAIL_UPDATE};
use rustix::io::Errno;

use crate::error::{Error, Result};

/// Address-family / namespace inheritance mode for `ip4`, `ip6`, `host`
/// and `vnet` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Ns {
    Disabled = 0,
    New = 1,
    Inherit = 2,
}

/// One jail parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JailValue {
    /// Presence-only parameter (`persist`, `allow.*`, ...).
    Flag,
    Str(String),
    U32(u32),
    I32(i32),
    Ns(Ns),
}

impl JailValue {
    fn to_bytes(&self) -> Vec<u8> {
        match self {
            JailValue::Flag => Vec::new(),
            JailValue::Str(s) => {
                let mut bytes = s.clone().into_bytes();
                bytes.push(0);
                bytes
            }
            JailValue::U32(v) => v.to_ne_bytes().to_vec(),
            JailValue::I32(v) => v.to_ne_bytes().to_vec(),
            JailValue::Ns(ns) => (*ns as u32).to_ne_bytes().to_vec(),
        }
    }
}

/// Whether `value` is the variant the kernel expects for `key`.
///
/// Keys outside the well-known set take strings.
fn well_typed(key: &str, value: &JailValue) -> bool {
    match key {
        "jid" | "devfs_ruleset" | "enforce_statfs" | "children.max" | "children.cur" => {
            matches!(value, JailValue::U32(_))
        }
        "ip4" | "ip6" => matches!(value, JailValue::Ns(_)),
        "host" | "vnet" => matches!(value, JailValue::Ns(ns) if *ns != Ns::Disabled),
        "persist" | "sysvmsg" | "sysvsem" | "sysvshm" => matches!(value, JailValue::Flag),
        _ if key.starts_with("allow.") => matches!(value, JailValue::Flag),
        _ => matches!(value, JailValue::Str(_)),
    }
}

/// An ordered jail parameter set.
#[derive(Debug, Clone, Default)]
pub struct JailConfig {
    params: BTreeMap<String, JailValue>,
}

impl JailConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter. The well-known keys must carry the variant the
    /// kernel expects; getting this wrong is a programming error.
    pub fn set(&mut self, key: &str, value: JailValue) -> &mut Self {
        debug_assert!(
            well_typed(key, &value),
            "jail parameter {key} given the wrong value type: {value:?}"
        );
        self.params.insert(key.to_string(), value);
        self
    }

    pub fn set_flag(&mut self, key: &str) -> &mut Self {
        self.set(key, JailValue::Flag)
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.set(key, JailValue::Str(value.into()))
    }

    pub fn set_u32(&mut self, key: &str, value: u32) -> &mut Self {
        self.set(key, JailValue::U32(value))
    }

    pub fn set_ns(&mut self, key: &str, value: Ns) -> &mut Self {
        self.set(key, JailValue::Ns(value))
    }

    pub fn get(&self, key: &str) -> Option<&JailValue> {
        self.params.get(key)
    }

    fn to_params(&self) -> Result<ParamList> {
        let mut params = ParamList::new();
        for (key, value) in &self.params {
            params
                .push(key, value.to_bytes())
                .map_err(|errno| Error::syscall(format!("jail parameter {key}"), errno))?;
        }
        Ok(params)
    }
}

/// A live jail, identified by its kernel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jail {
    jid: i32,
}

impl Jail {
    /// Create a jail from `config`.
    pub fn create(config: &JailConfig) -> Result<Jail> {
        let mut params = config.to_params()?;
        let jid = sys::jail_set(&mut params, JAIL_CREATE)
            .map_err(|source| Error::Jail { op: "jail_set", source })?;
        Ok(Jail { jid })
    }

    /// Resolve an existing jail by name.
    pub fn find(name: &str) -> Result<Jail> {
        let mut params = ParamList::new();
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        params
            .push("name", name_bytes)
            .map_err(|errno| Error::syscall("jail parameter name", errno))?;
        let jid = sys::jail_get(&mut params, 0)
            .map_err(|source| Error::Jail { op: "jail_get", source })?;
        Ok(Jail { jid })
    }

    /// Wrap a known jail id without consulting the kernel.
    pub fn from_jid(jid: i32) -> Jail {
        Jail { jid }
    }

    pub fn jid(&self) -> i32 {
        self.jid
    }

    /// Enter the jail. The calling process cannot escape afterwards.
    pub fn attach(&self) -> Result<()> {
        sys::jail_attach(self.jid).map_err(|errno| Error::syscall("jail_attach", errno))
    }

    /// Destroy the jail. Already-removed (EINVAL) counts as success.
    pub fn remove(&self) -> Result<()> {
        match sys::jail_remove(self.jid) {
            Ok(()) | Err(Errno::INVAL) => Ok(()),
            Err(errno) => Err(Error::syscall("jail_remove", errno)),
        }
    }

    /// Read an unsigned integer parameter from the live jail.
    ///
    /// Goes straight to a [`ParamList`]: reads pass an output buffer, not
    /// a typed value, so the set-side typing rules do not apply.
    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let mut params = ParamList::new();
        params
            .push("jid", (self.jid as u32).to_ne_bytes().to_vec())
            .map_err(|errno| Error::syscall("jail parameter jid", errno))?;
        params
            .push(key, vec![0u8; 4])
            .map_err(|errno| Error::syscall(format!("jail parameter {key}"), errno))?;
        sys::jail_get(&mut params, 0)
            .map_err(|source| Error::Jail { op: "jail_get", source })?;
        let bytes = params
            .value(key)
            .ok_or_else(|| Error::syscall(format!("jail parameter {key}"), Errno::NOENT))?;
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|_| Error::syscall(format!("jail parameter {key}"), Errno::INVAL))?;
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self.get_u32(key)? != 0)
    }

    /// Update one parameter on the live jail.
    pub fn set_u32(&self, key: &str, value: u32) -> Result<()> {
        let mut config = JailConfig::new();
        config.set_u32("jid", self.jid as u32);
        config.set(key, JailValue::U32(value));
        let mut params = config.to_params()?;
        sys::jail_set(&mut params, JAIL_UPDATE)
            .map_err(|source| Error::Jail { op: "jail_set", source })?;
        Ok(())
    }
}
