//! Environment table handed to child processes

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

#[cfg(target_os = "macos")]
const LIBRARY_PATH: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
const LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

type Table = BTreeMap<String, String>;

/// A copy-on-write `NAME=VALUE` table.
///
/// Clones share one backing table behind a lock; the first mutation through
/// a shared handle detaches it onto a private copy, so readers holding other
/// clones never observe the change.
///
/// Names are case-sensitive on Unix and upper-cased on Windows.
#[derive(Clone, Default)]
pub struct ProcessEnvironment {
    table: Arc<RwLock<Table>>,
}

impl ProcessEnvironment {
    /// Creates an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calling process's environment
    pub fn system_environment() -> Self {
        let table = std::env::vars_os()
            .filter_map(|(name, value)| {
                let name = name.into_string().ok()?;
                (!name.is_empty())
                    .then(|| (prepare_name(&name), value.to_string_lossy().into_owned()))
            })
            .collect();
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    /// Builds a table from `NAME=VALUE` entries.
    ///
    /// The separator is the first `=` at index 1 or later, so a leading `=`
    /// stays part of the name. Entries without a separator are skipped.
    pub fn from_list<I, S>(list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self::new();
        for entry in list {
            let entry = entry.as_ref();
            let Some((pos, _)) = entry.char_indices().skip(1).find(|&(_, c)| c == '=') else {
                continue;
            };
            env.insert(&entry[..pos], &entry[pos + 1..]);
        }
        env
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn clear(&mut self) {
        self.detach();
        self.table.write().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.read().contains_key(&prepare_name(name))
    }

    /// Inserts or replaces `name`
    pub fn insert(&mut self, name: &str, value: &str) {
        self.detach();
        self.table
            .write()
            .insert(prepare_name(name), value.to_string());
    }

    /// Copies every entry of `other` into this table, overwriting duplicates
    pub fn insert_all(&mut self, other: &ProcessEnvironment) {
        if Arc::ptr_eq(&self.table, &other.table) {
            return;
        }
        let entries = other.table.read().clone();
        self.detach();
        self.table.write().extend(entries);
    }

    pub fn remove(&mut self, name: &str) {
        let key = prepare_name(name);
        if !self.table.read().contains_key(&key) {
            return;
        }
        self.detach();
        self.table.write().remove(&key);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.table.read().get(&prepare_name(name)).cloned()
    }

    /// Value of `name`, or `default` when unset
    pub fn value(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    pub fn keys(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }

    /// Flat `NAME=VALUE` list
    pub fn to_string_list(&self) -> Vec<String> {
        self.table
            .read()
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect()
    }

    /// Builds the child's environment block.
    ///
    /// The parent's library search path is carried over when the table does
    /// not set one, otherwise a dynamically linked child could fail to load.
    pub(crate) fn to_envp(&self) -> Result<Vec<CString>> {
        let table = self.table.read();
        let mut envp = table
            .iter()
            .map(|(name, value)| CString::new(format!("{name}={value}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if !table.contains_key(LIBRARY_PATH) {
            if let Some(path) = std::env::var_os(LIBRARY_PATH).filter(|p| !p.is_empty()) {
                envp.push(CString::new(format!(
                    "{LIBRARY_PATH}={}",
                    path.to_string_lossy()
                ))?);
            }
        }
        Ok(envp)
    }

    fn detach(&mut self) {
        if Arc::strong_count(&self.table) > 1 {
            let copy = self.table.read().clone();
            self.table = Arc::new(RwLock::new(copy));
        }
    }
}

impl PartialEq for ProcessEnvironment {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.table, &other.table) || *self.table.read() == *other.table.read()
    }
}

impl Eq for ProcessEnvironment {}

impl fmt::Debug for ProcessEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.table.read().iter()).finish()
    }
}

/// Flat `NAME=VALUE` snapshot of the calling process's environment
pub fn system_environment() -> Vec<String> {
    std::env::vars_os()
        .map(|(name, value)| format!("{}={}", name.to_string_lossy(), value.to_string_lossy()))
        .collect()
}

#[cfg(windows)]
fn prepare_name(name: &str) -> String {
    name.to_uppercase()
}

#[cfg(not(windows))]
fn prepare_name(name: &str) -> String {
    name.to_string()
}
