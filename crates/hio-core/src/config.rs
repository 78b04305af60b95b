use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{HioError, HioResult};

/// Prefix recognized in configuration files.
pub const FILE_PREFIX: &str = "hio.";
/// Prefix recognized in the environment.
pub const ENV_PREFIX: &str = "MCA_HIO_";

/// Default byte budget for the per-dataset request buffer (1 MiB).
pub const DEFAULT_BUFFER_SIZE: u64 = 1 << 20;
/// Default stripe block size for optimized file mode (1 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 20;

/// Typed value of a configuration variable.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Uint(u64),
    Bool(bool),
    Str(String),
}

impl ConfigValue {
    fn set_from_str(&mut self, s: &str) -> HioResult<()> {
        match self {
            ConfigValue::Int(v) => *v = s.parse().map_err(|_| HioError::BadParam)?,
            ConfigValue::Uint(v) => *v = parse_size(s)?,
            ConfigValue::Bool(v) => {
                *v = !matches!(s, "0" | "false" | "no");
            }
            ConfigValue::Str(v) => *v = s.to_string(),
        }
        Ok(())
    }

    pub fn as_str(&self) -> String {
        match self {
            ConfigValue::Int(v) => v.to_string(),
            ConfigValue::Uint(v) => v.to_string(),
            ConfigValue::Bool(v) => v.to_string(),
            ConfigValue::Str(v) => v.clone(),
        }
    }
}

/// Parse a size value with an optional k/m/g suffix.
fn parse_size(s: &str) -> HioResult<u64> {
    let s = s.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1u64 << 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let base: u64 = digits.parse().map_err(|_| HioError::BadParam)?;
    base.checked_mul(mult).ok_or(HioError::BadParam)
}

#[derive(Debug, Clone)]
struct ConfigEntry {
    value: ConfigValue,
    readonly: bool,
}

/// Registry of configuration variables. Variables must be registered with a
/// default before they can be set; unknown names are rejected so typos in
/// config files surface as errors.
#[derive(Debug, Clone, Default)]
pub struct ConfigSet {
    vars: BTreeMap<String, ConfigEntry>,
}

impl ConfigSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the variables every context recognizes.
    pub fn with_context_defaults() -> Self {
        let mut set = Self::new();
        set.register("data_roots", ConfigValue::Str(String::new()), false);
        set.register("dataset_file_mode", ConfigValue::Str("basic".into()), false);
        set.register(
            "dataset_filesystem_type",
            ConfigValue::Str("default".into()),
            true,
        );
        set.register(
            "dataset_buffer_size",
            ConfigValue::Uint(DEFAULT_BUFFER_SIZE),
            false,
        );
        set.register("dataset_block_size", ConfigValue::Uint(DEFAULT_BLOCK_SIZE), false);
        set.register("dataset_expected_size", ConfigValue::Uint(0), false);
        set.register("verbose", ConfigValue::Int(0), false);
        set.register("debug", ConfigValue::Int(0), false);
        set
    }

    pub fn register(&mut self, name: &str, default: ConfigValue, readonly: bool) {
        self.vars.insert(
            name.to_string(),
            ConfigEntry {
                value: default,
                readonly,
            },
        );
    }

    /// Set a variable from its string representation. Read-only variables
    /// reject external sets; internal updates use `force_set`.
    pub fn set(&mut self, name: &str, value: &str) -> HioResult<()> {
        let entry = self.vars.get_mut(name).ok_or(HioError::NotFound)?;
        if entry.readonly {
            return Err(HioError::Perm);
        }
        entry.value.set_from_str(value)
    }

    /// Set a variable regardless of its read-only flag.
    pub fn force_set(&mut self, name: &str, value: ConfigValue) {
        if let Some(entry) = self.vars.get_mut(name) {
            entry.value = value;
        }
    }

    pub fn get(&self, name: &str) -> Option<&ConfigValue> {
        self.vars.get(name).map(|e| &e.value)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            ConfigValue::Uint(v) => Some(*v),
            ConfigValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ConfigValue::Int(v) => Some(*v),
            ConfigValue::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ConfigValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Names of all registered variables, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }

    /// Apply `MCA_HIO_<name>=<value>` settings from the environment.
    /// Unknown names are ignored; malformed values are reported.
    pub fn load_env(&mut self) -> HioResult<()> {
        for (key, value) in std::env::vars() {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if !self.vars.contains_key(name) {
                continue;
            }
            self.set(name, &value)?;
        }
        Ok(())
    }

    /// Parse `<prefix><name> = <value>` lines from a file. Lines without the
    /// prefix, blank lines, and `#` comments are skipped.
    pub fn parse_file(&mut self, path: &Path, prefix: Option<&str>) -> HioResult<()> {
        let prefix = prefix.unwrap_or(FILE_PREFIX);
        let contents = std::fs::read_to_string(path).map_err(HioError::from)?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(body) = line.strip_prefix(prefix) else {
                continue;
            };
            let Some((name, value)) = body.split_once('=') else {
                return Err(HioError::BadParam);
            };
            self.set(name.trim(), value.trim())?;
        }

        Ok(())
    }
}

/// Split a colon-separated data-root list into its ordered entries.
pub fn parse_data_roots(spec: &str) -> Vec<String> {
    spec.split(':')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ConfigSet::with_context_defaults();
        assert_eq!(cfg.get_u64("dataset_buffer_size"), Some(1 << 20));
        assert_eq!(cfg.get_str("dataset_file_mode"), Some("basic"));
        assert_eq!(cfg.get_i64("verbose"), Some(0));
    }

    #[test]
    fn test_set_and_readonly() {
        let mut cfg = ConfigSet::with_context_defaults();
        cfg.set("dataset_buffer_size", "4096").unwrap();
        assert_eq!(cfg.get_u64("dataset_buffer_size"), Some(4096));

        assert_eq!(
            cfg.set("dataset_filesystem_type", "lustre"),
            Err(HioError::Perm)
        );
        cfg.force_set("dataset_filesystem_type", ConfigValue::Str("lustre".into()));
        assert_eq!(cfg.get_str("dataset_filesystem_type"), Some("lustre"));

        assert_eq!(cfg.set("no_such_var", "1"), Err(HioError::NotFound));
    }

    #[test]
    fn test_size_suffixes() {
        let mut cfg = ConfigSet::with_context_defaults();
        cfg.set("dataset_buffer_size", "64k").unwrap();
        assert_eq!(cfg.get_u64("dataset_buffer_size"), Some(64 << 10));
        cfg.set("dataset_expected_size", "2m").unwrap();
        assert_eq!(cfg.get_u64("dataset_expected_size"), Some(2 << 20));
        assert_eq!(cfg.set("dataset_buffer_size", "oops"), Err(HioError::BadParam));
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# checkpoint settings").unwrap();
        writeln!(file, "hio.dataset_file_mode = optimized").unwrap();
        writeln!(file, "hio.dataset_buffer_size = 128k").unwrap();
        writeln!(file, "unrelated line").unwrap();
        file.flush().unwrap();

        let mut cfg = ConfigSet::with_context_defaults();
        cfg.parse_file(file.path(), None).unwrap();
        assert_eq!(cfg.get_str("dataset_file_mode"), Some("optimized"));
        assert_eq!(cfg.get_u64("dataset_buffer_size"), Some(128 << 10));
    }

    #[test]
    fn test_parse_data_roots() {
        assert_eq!(
            parse_data_roots("/nonexistent:/tmp/hio"),
            vec!["/nonexistent".to_string(), "/tmp/hio".to_string()]
        );
        assert_eq!(parse_data_roots(""), Vec::<String>::new());
    }
}
