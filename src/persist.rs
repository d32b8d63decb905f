//! Persistence key/value store (C2).
//!
//! Grounded on `lanserv/persist.c`: records are `name:type:value` lines,
//! `type` one of `i` (signed decimal), `d` (raw bytes, backslash-hex
//! escaped) or `s` (same escaping, null-terminated after decoding).
//! Writes go to `<name>.tmp` then an atomic rename.

use crate::error::PersistError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One persisted value. `Str` keeps a Rust `String`; `Bytes` keeps the
/// raw payload (never null-terminated, matching the `d` type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

/// An in-memory collection of named records, associated with one backing
/// file under the store's base directory.
#[derive(Debug, Default, Clone)]
pub struct Bundle {
    name: String,
    items: HashMap<String, Value>,
    // insertion order, since `iterate_persist` in the original walks the
    // list in (reverse-of-insertion, i.e. most-recently-added-first) order
    order: Vec<String>,
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Bundle {
            name: name.into(),
            items: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn insert(&mut self, key: String, value: Value) {
        if !self.items.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.items.insert(key, value);
    }

    pub fn add_int(&mut self, name: impl Into<String>, val: i64) {
        self.insert(name.into(), Value::Int(val));
    }

    pub fn add_bytes(&mut self, name: impl Into<String>, val: Vec<u8>) {
        self.insert(name.into(), Value::Bytes(val));
    }

    pub fn add_string(&mut self, name: impl Into<String>, val: impl Into<String>) {
        self.insert(name.into(), Value::Str(val.into()));
    }

    pub fn find(&self, name: &str) -> Option<Value> {
        self.items.get(name).cloned()
    }

    pub fn find_int(&self, name: &str) -> Result<i64, PersistError> {
        match self.find(name) {
            Some(Value::Int(v)) => Ok(v),
            Some(_) => Err(PersistError::WrongType(name.to_string())),
            None => Err(PersistError::NotFound(name.to_string())),
        }
    }

    pub fn find_bytes(&self, name: &str) -> Result<Vec<u8>, PersistError> {
        match self.find(name) {
            Some(Value::Bytes(v)) => Ok(v),
            Some(_) => Err(PersistError::WrongType(name.to_string())),
            None => Err(PersistError::NotFound(name.to_string())),
        }
    }

    pub fn find_string(&self, name: &str) -> Result<String, PersistError> {
        match self.find(name) {
            Some(Value::Str(v)) => Ok(v),
            Some(_) => Err(PersistError::WrongType(name.to_string())),
            None => Err(PersistError::NotFound(name.to_string())),
        }
    }
}

fn to_hex_escaped(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        let printable = (0x20..0x7f).contains(&b) && b != b'\\';
        if printable {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:02x}", b));
        }
    }
    out
}

fn from_hex_escaped(s: &str) -> Result<Vec<u8>, PersistError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if i + 2 >= bytes.len() {
                return Err(PersistError::Malformed("truncated escape".into()));
            }
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .map_err(|_| PersistError::Malformed("non-utf8 escape".into()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| PersistError::Malformed("bad hex escape".into()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// A persistence store rooted at `<basedir>/<app>/<instance>/`.
///
/// The global enable flag mirrors `persist_enable` in the original: when
/// disabled, reads always miss and writes silently succeed without
/// touching the filesystem.
pub struct Store {
    dir: PathBuf,
    enabled: Mutex<bool>,
}

impl Store {
    /// Build `<basedir>/<app>/<instance>/`, creating intermediate
    /// directories with mode 0755 as needed.
    pub fn init(basedir: impl AsRef<Path>, app: &str, instance: &str) -> Result<Self, PersistError> {
        let dir = basedir.as_ref().join(app).join(instance);
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&dir)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&dir, perms)?;
        }
        Ok(Store {
            dir,
            enabled: Mutex::new(true),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock().unwrap() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock().unwrap()
    }

    pub fn create(&self, name: impl Into<String>) -> Bundle {
        Bundle::new(name)
    }

    fn path_for(&self, name: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{name}{suffix}"))
    }

    /// Write `bundle` to `<name>.tmp` then atomically rename to `<name>`.
    /// A no-op (returns `Ok(())`) when the store is disabled.
    pub fn write(&self, bundle: &Bundle) -> Result<(), PersistError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let tmp = self.path_for(bundle.name(), ".tmp");
        let fin = self.path_for(bundle.name(), "");

        let mut out = String::new();
        for key in &bundle.order {
            let value = bundle.items.get(key).expect("order tracks items");
            match value {
                Value::Int(v) => out.push_str(&format!("{key}:i:{v}\n")),
                Value::Bytes(b) => out.push_str(&format!("{key}:d:{}\n", to_hex_escaped(b))),
                Value::Str(s) => out.push_str(&format!("{key}:s:{}\n", to_hex_escaped(s.as_bytes()))),
            }
        }
        fs::write(&tmp, out)?;
        fs::rename(&tmp, &fin)?;
        Ok(())
    }

    /// Read and parse `<name>`. Returns `Err(NotFound)` when the store is
    /// disabled or the file is absent, matching the original's
    /// "disabled store reads as not-found" behavior.
    pub fn read(&self, name: &str) -> Result<Bundle, PersistError> {
        if !self.is_enabled() {
            return Err(PersistError::NotFound(name.to_string()));
        }
        let path = self.path_for(name, "");
        let contents = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PersistError::NotFound(name.to_string())
            } else {
                PersistError::Io(e)
            }
        })?;

        let mut bundle = Bundle::new(name);
        for line in contents.lines() {
            let mut parts = line.splitn(3, ':');
            let (Some(iname), Some(kind), Some(val)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if iname.is_empty() || kind.len() != 1 {
                continue;
            }
            match kind {
                "i" => {
                    if let Ok(v) = parse_c_long(val) {
                        bundle.add_int(iname, v);
                    }
                }
                "d" => {
                    if let Ok(bytes) = from_hex_escaped(val) {
                        bundle.add_bytes(iname, bytes);
                    }
                }
                "s" => {
                    if let Ok(bytes) = from_hex_escaped(val) {
                        if let Ok(s) = String::from_utf8(bytes) {
                            bundle.add_string(iname, s);
                        }
                    }
                }
                _ => continue,
            }
        }
        Ok(bundle)
    }
}

/// Parse an integer the way C's `strtol(val, &end, 0)` does: base
/// auto-detected from a `0x`/`0X` or leading-zero prefix.
fn parse_c_long(val: &str) -> Result<i64, PersistError> {
    let trimmed = val.trim();
    let (neg, rest) = match trimmed.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let (radix, digits) = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        (16, hex)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };
    let magnitude = i64::from_str_radix(digits, radix)
        .map_err(|_| PersistError::Malformed(format!("not an integer: {val:?}")))?;
    Ok(if neg { -magnitude } else { magnitude })
}
