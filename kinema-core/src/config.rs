//! Typed configuration store.
//!
//! Entries are registered with a type, default, description and experience
//! level. Registration returns the effective value, which may come from a
//! config file loaded before the owning subsystem registered its keys.
//! Change callbacks run outside the store mutex, in unspecified order.
//! The on-disk format is `key:value` per line with `#` comments and a
//! version header.

use std::{
    collections::HashMap,
    fmt::Write as _,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

pub const CONFIG_FILE_VERSION: u32 = 2;

/// Value passed to change callbacks and returned by lookups.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Num(i32),
    Str(String),
}

impl ConfigValue {
    pub fn as_num(&self) -> Option<i32> {
        match *self {
            ConfigValue::Num(v) => Some(v),
            ConfigValue::Bool(v) => Some(v as i32),
            ConfigValue::Str(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            ConfigValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Snapshot handed to change callbacks.
#[derive(Clone, Debug)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: ConfigValue,
}

pub type ConfigCallback = Arc<dyn Fn(&ConfigUpdate) + Send + Sync>;

enum EntryKind {
    Bool {
        value: bool,
        default: bool,
    },
    Num {
        value: i32,
        default: i32,
    },
    Range {
        value: i32,
        default: i32,
        min: i32,
        max: i32,
    },
    Enum {
        value: usize,
        default: usize,
        labels: Vec<String>,
    },
    Str {
        value: String,
        default: String,
        filename: bool,
    },
    /// Read from a file before any subsystem claimed the key. Preserved
    /// verbatim across save so foreign entries are not lost.
    Unclaimed {
        value: String,
    },
}

impl EntryKind {
    fn type_name(&self) -> &'static str {
        match self {
            EntryKind::Bool { .. } => "bool",
            EntryKind::Num { .. } => "num",
            EntryKind::Range { .. } => "range",
            EntryKind::Enum { .. } => "enum",
            EntryKind::Str { filename: false, .. } => "string",
            EntryKind::Str { filename: true, .. } => "filename",
            EntryKind::Unclaimed { .. } => "unclaimed",
        }
    }

    fn current(&self) -> ConfigValue {
        match self {
            EntryKind::Bool { value, .. } => ConfigValue::Bool(*value),
            EntryKind::Num { value, .. } | EntryKind::Range { value, .. } => {
                ConfigValue::Num(*value)
            }
            EntryKind::Enum { value, .. } => ConfigValue::Num(*value as i32),
            EntryKind::Str { value, .. } => ConfigValue::Str(value.clone()),
            EntryKind::Unclaimed { value } => ConfigValue::Str(value.clone()),
        }
    }
}

struct Entry {
    key: String,
    kind: EntryKind,
    description: Option<String>,
    help: Option<String>,
    exp_level: u8,
    callbacks: Vec<ConfigCallback>,
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Inner {
    fn lookup(&self, key: &str) -> Option<&Entry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    fn lookup_mut(&mut self, key: &str) -> Option<&mut Entry> {
        let i = *self.index.get(key)?;
        Some(&mut self.entries[i])
    }

    fn insert(&mut self, entry: Entry) {
        self.index.insert(entry.key.clone(), self.entries.len());
        self.entries.push(entry);
    }
}

/// Parameters common to every registration call.
pub struct Registration<'a> {
    pub key: &'a str,
    pub description: Option<&'a str>,
    pub help: Option<&'a str>,
    pub exp_level: u8,
    pub callback: Option<ConfigCallback>,
}

impl<'a> Registration<'a> {
    pub fn new(key: &'a str) -> Registration<'a> {
        Registration {
            key,
            description: None,
            help: None,
            exp_level: 0,
            callback: None,
        }
    }

    pub fn description(mut self, description: &'a str) -> Self {
        self.description = Some(description);
        self
    }

    pub fn help(mut self, help: &'a str) -> Self {
        self.help = Some(help);
        self
    }

    pub fn exp_level(mut self, exp_level: u8) -> Self {
        self.exp_level = exp_level;
        self
    }

    pub fn callback(mut self, callback: ConfigCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Default)]
pub struct ConfigStore {
    inner: Mutex<Inner>,
}

impl ConfigStore {
    pub fn new() -> ConfigStore {
        ConfigStore::default()
    }

    pub fn register_bool(&self, reg: Registration<'_>, default: bool) -> bool {
        let claimed = |raw: &str| EntryKind::Bool {
            value: raw.trim() == "1",
            default,
        };
        let fresh = EntryKind::Bool {
            value: default,
            default,
        };
        match self.register(reg, fresh, claimed) {
            ConfigValue::Bool(v) => v,
            _ => default,
        }
    }

    pub fn register_num(&self, reg: Registration<'_>, default: i32) -> i32 {
        let claimed = |raw: &str| EntryKind::Num {
            value: raw.trim().parse().unwrap_or(default),
            default,
        };
        let fresh = EntryKind::Num {
            value: default,
            default,
        };
        match self.register(reg, fresh, claimed) {
            ConfigValue::Num(v) => v,
            _ => default,
        }
    }

    pub fn register_range(&self, reg: Registration<'_>, default: i32, min: i32, max: i32) -> i32 {
        let claimed = move |raw: &str| EntryKind::Range {
            value: raw.trim().parse().unwrap_or(default).clamp(min, max),
            default,
            min,
            max,
        };
        let fresh = EntryKind::Range {
            value: default,
            default,
            min,
            max,
        };
        match self.register(reg, fresh, claimed) {
            ConfigValue::Num(v) => v,
            _ => default,
        }
    }

    /// Returns the index of the effective label.
    pub fn register_enum(&self, reg: Registration<'_>, default: usize, labels: &[&str]) -> usize {
        let owned: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let claimed = {
            let owned = owned.clone();
            move |raw: &str| {
                let raw = raw.trim();
                let value = owned
                    .iter()
                    .position(|l| l == raw)
                    .or_else(|| raw.parse::<usize>().ok().filter(|&i| i < owned.len()))
                    .unwrap_or(default);
                EntryKind::Enum {
                    value,
                    default,
                    labels: owned.clone(),
                }
            }
        };
        let fresh = EntryKind::Enum {
            value: default,
            default,
            labels: owned,
        };
        match self.register(reg, fresh, claimed) {
            ConfigValue::Num(v) => v as usize,
            _ => default,
        }
    }

    pub fn register_string(&self, reg: Registration<'_>, default: &str) -> String {
        self.register_string_kind(reg, default, false)
    }

    pub fn register_filename(&self, reg: Registration<'_>, default: &str) -> String {
        self.register_string_kind(reg, default, true)
    }

    fn register_string_kind(&self, reg: Registration<'_>, default: &str, filename: bool) -> String {
        let default_owned = default.to_string();
        let claimed = {
            let default_owned = default_owned.clone();
            move |raw: &str| EntryKind::Str {
                value: raw.to_string(),
                default: default_owned.clone(),
                filename,
            }
        };
        let fresh = EntryKind::Str {
            value: default_owned.clone(),
            default: default_owned,
            filename,
        };
        match self.register(reg, fresh, claimed) {
            ConfigValue::Str(v) => v,
            _ => default.to_string(),
        }
    }

    fn register(
        &self,
        reg: Registration<'_>,
        fresh: EntryKind,
        claim: impl Fn(&str) -> EntryKind,
    ) -> ConfigValue {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.lookup_mut(reg.key) {
            if let EntryKind::Unclaimed { value } = &entry.kind {
                // A file loaded before registration owns the value.
                let raw = value.clone();
                entry.kind = claim(&raw);
            } else if entry.kind.type_name() != fresh.type_name() {
                warn!(
                    key = reg.key,
                    old = entry.kind.type_name(),
                    new = fresh.type_name(),
                    "config key re-registered with a different type"
                );
                entry.kind = fresh;
            }
            // Same-type re-registration keeps the current value and default.
            if reg.description.is_some() {
                entry.description = reg.description.map(str::to_string);
            }
            if reg.help.is_some() {
                entry.help = reg.help.map(str::to_string);
            }
            entry.exp_level = reg.exp_level;
            if let Some(callback) = reg.callback {
                entry.callbacks.push(callback);
            }
            return entry.kind.current();
        }

        let value = fresh.current();
        inner.insert(Entry {
            key: reg.key.to_string(),
            kind: fresh,
            description: reg.description.map(str::to_string),
            help: reg.help.map(str::to_string),
            exp_level: reg.exp_level,
            callbacks: reg.callback.into_iter().collect(),
        });
        value
    }

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.inner
            .lock()
            .unwrap()
            .lookup(key)
            .map(|e| e.kind.current())
    }

    pub fn get_num(&self, key: &str) -> Option<i32> {
        self.get(key)?.as_num()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            ConfigValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Update a numeric-family entry (bool, num, range, enum).
    pub fn update_num(&self, key: &str, value: i32) -> Result<()> {
        let (update, callbacks) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .lookup_mut(key)
                .ok_or_else(|| anyhow!("unknown config key {key}"))?;
            match &mut entry.kind {
                EntryKind::Bool { value: v, .. } => *v = value != 0,
                EntryKind::Num { value: v, .. } => *v = value,
                EntryKind::Range { value: v, min, max, .. } => *v = value.clamp(*min, *max),
                EntryKind::Enum { value: v, labels, .. } => {
                    if value < 0 || value as usize >= labels.len() {
                        bail!("value {value} out of range for enum {key}");
                    }
                    *v = value as usize;
                }
                EntryKind::Str { .. } | EntryKind::Unclaimed { .. } => {
                    bail!("config key {key} is not numeric");
                }
            }
            (
                ConfigUpdate {
                    key: entry.key.clone(),
                    value: entry.kind.current(),
                },
                entry.callbacks.clone(),
            )
        };
        // Callbacks run outside the store mutex so they may re-enter.
        for callback in &callbacks {
            callback(&update);
        }
        Ok(())
    }

    pub fn update_string(&self, key: &str, value: &str) -> Result<()> {
        let (update, callbacks) = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .lookup_mut(key)
                .ok_or_else(|| anyhow!("unknown config key {key}"))?;
            match &mut entry.kind {
                EntryKind::Str { value: v, .. } => *v = value.to_string(),
                EntryKind::Unclaimed { value: v } => *v = value.to_string(),
                _ => bail!("config key {key} is not a string"),
            }
            (
                ConfigUpdate {
                    key: entry.key.clone(),
                    value: entry.kind.current(),
                },
                entry.callbacks.clone(),
            )
        };
        for callback in &callbacks {
            callback(&update);
        }
        Ok(())
    }

    /// Read a config file. Unknown keys are kept as unclaimed entries so a
    /// later registration (or save) does not lose them. Missing files are
    /// not an error.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(format!("failed to read config {path:?}")),
        };

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, raw)) = line.split_once(':') else {
                continue;
            };
            if key == ".version" {
                let version: u32 = raw.trim().parse().unwrap_or(0);
                if version > CONFIG_FILE_VERSION {
                    warn!(version, "config file from a newer engine version");
                }
                continue;
            }

            let known = self.inner.lock().unwrap().lookup(key).map(|e| e.kind.type_name());
            match known {
                None => {
                    debug!(key, "unclaimed config entry");
                    self.inner.lock().unwrap().insert(Entry {
                        key: key.to_string(),
                        kind: EntryKind::Unclaimed {
                            value: raw.to_string(),
                        },
                        description: None,
                        help: None,
                        exp_level: 0,
                        callbacks: Vec::new(),
                    });
                }
                Some("string") | Some("filename") | Some("unclaimed") => {
                    self.update_string(key, raw)?;
                }
                Some("enum") => {
                    // Enums serialize by label.
                    let value = {
                        let inner = self.inner.lock().unwrap();
                        match &inner.lookup(key).unwrap().kind {
                            EntryKind::Enum { labels, value, .. } => labels
                                .iter()
                                .position(|l| l == raw.trim())
                                .or_else(|| raw.trim().parse().ok())
                                .unwrap_or(*value),
                            _ => unreachable!(),
                        }
                    };
                    self.update_num(key, value as i32)?;
                }
                Some(_) => {
                    self.update_num(key, raw.trim().parse().unwrap_or(0))?;
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "#\n# kinema config file\n#");
        let _ = writeln!(out, ".version:{CONFIG_FILE_VERSION}\n");

        {
            let inner = self.inner.lock().unwrap();
            for entry in &inner.entries {
                if let Some(description) = &entry.description {
                    let _ = writeln!(out, "# {description}");
                }
                match &entry.kind {
                    EntryKind::Bool { value, default } => {
                        let _ = writeln!(out, "# bool, default: {}", *default as i32);
                        let _ = writeln!(out, "{}:{}\n", entry.key, *value as i32);
                    }
                    EntryKind::Num { value, default } => {
                        let _ = writeln!(out, "# numeric, default: {default}");
                        let _ = writeln!(out, "{}:{}\n", entry.key, value);
                    }
                    EntryKind::Range {
                        value,
                        default,
                        min,
                        max,
                    } => {
                        let _ = writeln!(out, "# [{min}..{max}], default: {default}");
                        let _ = writeln!(out, "{}:{}\n", entry.key, value);
                    }
                    EntryKind::Enum {
                        value,
                        default,
                        labels,
                    } => {
                        let _ = writeln!(
                            out,
                            "# {{ {} }}, default: {}",
                            labels.join(" "),
                            labels[*default]
                        );
                        let _ = writeln!(out, "{}:{}\n", entry.key, labels[*value]);
                    }
                    EntryKind::Str { value, default, .. } => {
                        let _ = writeln!(out, "# string, default: {default}");
                        let _ = writeln!(out, "{}:{}\n", entry.key, value);
                    }
                    EntryKind::Unclaimed { value } => {
                        let _ = writeln!(out, "{}:{}\n", entry.key, value);
                    }
                }
            }
        }

        std::fs::write(path.as_ref(), out)
            .with_context(|| format!("failed to write config {:?}", path.as_ref()))
    }
}
