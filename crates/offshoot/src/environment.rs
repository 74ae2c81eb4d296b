//! Environment model for spawned processes.
//!
//! The environment is either inherited from the parent (snapshotted at
//! spawn time, so later mutations in the parent do not leak into the
//! child) or replaced wholesale. Either form accepts explicit overrides;
//! for duplicate keys the last occurrence wins.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use crate::error::{Error, Result};

/// Environment the child will observe.
#[derive(Debug, Clone)]
pub struct Environment {
    base: Base,
    overrides: Vec<(OsString, OsString)>,
}

#[derive(Debug, Clone)]
enum Base {
    Inherit,
    Replace,
}

impl Environment {
    /// Inherit the parent's environment, snapshotted at spawn time.
    #[must_use]
    pub fn inherit() -> Self {
        Self {
            base: Base::Inherit,
            overrides: Vec::new(),
        }
    }

    /// Start from an empty environment containing only the given pairs.
    #[must_use]
    pub fn replace<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let overrides = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_os_string(), v.as_ref().to_os_string()))
            .collect();
        Self {
            base: Base::Replace,
            overrides,
        }
    }

    /// Add or override a single variable.
    #[must_use]
    pub fn insert(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.overrides
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Flatten into the `KEY=VALUE` entries the child will receive.
    ///
    /// Later occurrences of a key shadow earlier ones; the inherited
    /// snapshot counts as the earliest layer.
    pub(crate) fn materialize(&self) -> Result<Vec<CString>> {
        let mut keys: Vec<OsString> = Vec::new();
        let mut values: Vec<OsString> = Vec::new();

        let mut apply = |key: OsString, value: OsString| {
            if let Some(pos) = keys.iter().position(|k| *k == key) {
                values[pos] = value;
            } else {
                keys.push(key);
                values.push(value);
            }
        };

        if matches!(self.base, Base::Inherit) {
            for (key, value) in std::env::vars_os() {
                apply(key, value);
            }
        }
        for (key, value) in &self.overrides {
            apply(key.clone(), value.clone());
        }

        keys.iter()
            .zip(values.iter())
            .map(|(key, value)| {
                if key.is_empty() || key.as_bytes().contains(&b'=') {
                    return Err(Error::InvalidConfiguration(format!(
                        "malformed environment key {key:?}"
                    )));
                }
                let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
                entry.extend_from_slice(key.as_bytes());
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).map_err(|_| {
                    Error::InvalidConfiguration(format!(
                        "nul byte in environment entry for {key:?}"
                    ))
                })
            })
            .collect()
    }
}

impl Default for Environment {
    /// Inheriting the parent's environment is the default.
    fn default() -> Self {
        Self::inherit()
    }
}

/// Locate the value of `name` within materialized `KEY=VALUE` entries.
pub(crate) fn lookup<'a>(entries: &'a [CString], name: &str) -> Option<&'a [u8]> {
    entries.iter().find_map(|entry| {
        let bytes = entry.as_bytes();
        bytes
            .strip_prefix(name.as_bytes())
            .and_then(|rest| rest.strip_prefix(b"="))
    })
}
