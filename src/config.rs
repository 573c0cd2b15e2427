//! Configuration database and delta plumbing.
//!
//! A deliberately small store: named sections of string entries, a plain
//! `[section]` / `key value` text form, and delta handlers that fire when a
//! section changed between the working database and a newly applied one.
//! Repeated keys accumulate (the `plugin` list). The full schema engine of a
//! routing daemon lives outside this crate; the core only consumes validated
//! sections.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;

use log::{info, warn};

use crate::acl::Acl;
use crate::net::stream::StreamSocketConfig;

pub type Section = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDb {
    sections: BTreeMap<String, Section>,
}

impl ConfigDb {
    pub fn new() -> ConfigDb {
        ConfigDb::default()
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// First value of an entry.
    pub fn entry(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values of an entry.
    pub fn entries(&self, section: &str, key: &str) -> &[String] {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append a value to an entry.
    pub fn add(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// Replace the values of an entry.
    pub fn put(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), vec![value.to_string()]);
    }

    /// Handle a CLI `--set section.key=value` argument. Without `=value` an
    /// empty entry is created; a bare section name creates the section.
    pub fn set(&mut self, spec: &str) -> Result<(), String> {
        let (path, value) = match spec.split_once('=') {
            Some((path, value)) => (path, Some(value)),
            None => (spec, None),
        };
        match path.split_once('.') {
            Some((section, key)) => {
                self.put(section, key, value.unwrap_or(""));
            }
            None => {
                if value.is_some() {
                    return Err(format!("'{}' is not a section.key path", spec));
                }
                self.sections.entry(path.to_string()).or_default();
            }
        }
        Ok(())
    }

    /// Handle a CLI `--remove section[.key]` argument.
    pub fn remove(&mut self, spec: &str) -> Result<(), String> {
        match spec.split_once('.') {
            Some((section, key)) => {
                if let Some(s) = self.sections.get_mut(section) {
                    s.remove(key);
                }
            }
            None => {
                self.sections.remove(spec);
            }
        }
        Ok(())
    }

    /// Handle a CLI `--get [section[.key]]` argument.
    pub fn get(&self, spec: &str) -> String {
        let mut out = String::new();
        if spec.is_empty() {
            for name in self.sections.keys() {
                let _ = writeln!(out, "{}", name);
            }
            return out;
        }
        match spec.split_once('.') {
            Some((section, key)) => {
                for value in self.entries(section, key) {
                    let _ = writeln!(out, "{}", value);
                }
            }
            None => {
                if let Some(section) = self.sections.get(spec) {
                    for key in section.keys() {
                        let _ = writeln!(out, "{}", key);
                    }
                }
            }
        }
        out
    }

    /// Parse the text form.
    pub fn parse(text: &str) -> Result<ConfigDb, String> {
        let mut db = ConfigDb::new();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| format!("line {}: unterminated section header", lineno + 1))?;
                db.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }
            let Some(section) = &current else {
                return Err(format!("line {}: entry outside of a section", lineno + 1));
            };
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            db.add(section, key, value);
        }
        Ok(db)
    }

    pub fn load(path: &Path) -> io::Result<ConfigDb> {
        let text = fs::read_to_string(path)?;
        ConfigDb::parse(&text).map_err(|err| {
            warn!("cannot parse configuration {}: {}", path.display(), err);
            io::Error::new(io::ErrorKind::InvalidData, err)
        })
    }

    /// Render the text form.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for (name, section) in &self.sections {
            let _ = writeln!(out, "[{}]", name);
            for (key, values) in section {
                if values.is_empty() {
                    let _ = writeln!(out, "{}", key);
                }
                for value in values {
                    if value.is_empty() {
                        let _ = writeln!(out, "{}", key);
                    } else {
                        let _ = writeln!(out, "{} {}", key, value);
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.format())
    }

    /// Overlay another database; its entries replace same-named ones.
    pub fn merge(&mut self, other: &ConfigDb) {
        for (name, section) in &other.sections {
            let target = self.sections.entry(name.clone()).or_default();
            for (key, values) in section {
                target.insert(key.clone(), values.clone());
            }
        }
    }
}

/// Parse a boolean entry; unknown strings are false.
pub fn get_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        None => default,
        Some(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "on"
        ),
    }
}

/// Globally scoped daemon options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub ipv4: bool,
    pub ipv6: bool,
    pub failfast: bool,
    pub plugins: Vec<String>,
}

impl Default for GlobalConfig {
    fn default() -> GlobalConfig {
        GlobalConfig {
            ipv4: true,
            ipv6: true,
            failfast: false,
            plugins: Vec::new(),
        }
    }
}

pub fn global_config(db: &ConfigDb) -> GlobalConfig {
    GlobalConfig {
        ipv4: get_bool(db.entry("global", "ipv4"), true),
        ipv6: get_bool(db.entry("global", "ipv6"), true),
        failfast: get_bool(db.entry("global", "failfast"), false),
        plugins: db.entries("global", "plugin").to_vec(),
    }
}

/// Build a managed stream socket configuration from a section, falling back
/// to the schema defaults.
pub fn stream_socket_config(
    db: &ConfigDb,
    section: &str,
    default_port: u16,
) -> Result<StreamSocketConfig, String> {
    let global = global_config(db);

    let bind_v4 = db
        .entry(section, "bindto_v4")
        .unwrap_or("127.0.0.1")
        .parse()
        .map_err(|_| format!("{}.bindto_v4 is not an address", section))?;
    let bind_v6 = db
        .entry(section, "bindto_v6")
        .unwrap_or("::1")
        .parse()
        .map_err(|_| format!("{}.bindto_v6 is not an address", section))?;
    let port = match db.entry(section, "port") {
        None => default_port,
        Some(v) => v
            .parse()
            .map_err(|_| format!("{}.port is not a port number", section))?,
    };
    let acl = match db.entry(section, "acl") {
        None => Acl::parse("127.0.0.1 ::1 default_reject")?,
        Some(v) => Acl::parse(v)?,
    };

    Ok(StreamSocketConfig {
        bind_v4: Some(bind_v4),
        bind_v6: Some(bind_v6),
        port,
        ipv4: global.ipv4,
        ipv6: global.ipv6,
        acl,
    })
}

/// Reject databases the daemon cannot run with. Validation failures keep
/// the previous configuration in a running daemon.
pub fn validate(db: &ConfigDb) -> Result<(), String> {
    for section in ["telnet", "http"] {
        if db.section(section).is_some() {
            stream_socket_config(db, section, 1)?;
        }
    }
    for key in ["ipv4", "ipv6", "failfast"] {
        if let Some(value) = db.entry("global", key) {
            let v = value.to_ascii_lowercase();
            if !matches!(
                v.as_str(),
                "true" | "false" | "0" | "1" | "yes" | "no" | "on" | "off"
            ) {
                return Err(format!("global.{} is not a boolean", key));
            }
        }
    }
    Ok(())
}

/// A subscriber to configuration changes of one section.
pub struct DeltaHandler {
    pub section: String,
    #[allow(clippy::type_complexity)]
    pub callback: Box<dyn Fn(Option<&Section>, Option<&Section>) -> io::Result<()>>,
}

/// Run every handler whose section differs between the two databases; on
/// the first apply every handler fires.
pub fn handle_deltas(
    old: &ConfigDb,
    new: &ConfigDb,
    handlers: &[DeltaHandler],
    first: bool,
) -> io::Result<()> {
    for handler in handlers {
        let old_section = old.section(&handler.section);
        let new_section = new.section(&handler.section);
        if first || old_section != new_section {
            info!("applying configuration of section '{}'", handler.section);
            (handler.callback)(old_section, new_section)?;
        }
    }
    Ok(())
}

/// One known configuration entry, for `--schema`.
pub struct SchemaEntry {
    pub section: &'static str,
    pub key: &'static str,
    pub default: &'static str,
    pub help: &'static str,
}

pub const SCHEMA: &[SchemaEntry] = &[
    SchemaEntry {
        section: "global",
        key: "ipv4",
        default: "true",
        help: "Enable IPv4 sockets",
    },
    SchemaEntry {
        section: "global",
        key: "ipv6",
        default: "true",
        help: "Enable IPv6 sockets",
    },
    SchemaEntry {
        section: "global",
        key: "failfast",
        default: "false",
        help: "Abort configuration apply if a plugin fails to load",
    },
    SchemaEntry {
        section: "global",
        key: "plugin",
        default: "",
        help: "Plugin to load, repeat the entry for multiple plugins",
    },
    SchemaEntry {
        section: "telnet",
        key: "acl",
        default: "127.0.0.1 ::1 default_reject",
        help: "Access control list for the telnet interface",
    },
    SchemaEntry {
        section: "telnet",
        key: "bindto_v4",
        default: "127.0.0.1",
        help: "Bind telnet ipv4 socket to this address",
    },
    SchemaEntry {
        section: "telnet",
        key: "bindto_v6",
        default: "::1",
        help: "Bind telnet ipv6 socket to this address",
    },
    SchemaEntry {
        section: "telnet",
        key: "port",
        default: "2006",
        help: "Network port for the telnet interface",
    },
    SchemaEntry {
        section: "http",
        key: "acl",
        default: "127.0.0.1 ::1 default_reject",
        help: "Access control list for the http interface",
    },
    SchemaEntry {
        section: "http",
        key: "bindto_v4",
        default: "127.0.0.1",
        help: "Bind http ipv4 socket to this address",
    },
    SchemaEntry {
        section: "http",
        key: "bindto_v6",
        default: "::1",
        help: "Bind http ipv6 socket to this address",
    },
    SchemaEntry {
        section: "http",
        key: "port",
        default: "1978",
        help: "Network port for the http interface",
    },
];

/// Render the schema, optionally filtered by `section` or `section.key`.
pub fn format_schema(filter: Option<&str>) -> String {
    let mut out = String::new();
    for entry in SCHEMA {
        let matches = match filter {
            None | Some("") => true,
            Some(filter) => match filter.split_once('.') {
                Some((section, key)) => entry.section == section && entry.key == key,
                None => entry.section == filter,
            },
        };
        if matches {
            let _ = writeln!(
                out,
                "{}.{} (default: '{}')\n    {}",
                entry.section, entry.key, entry.default, entry.help
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# daemon configuration
[global]
ipv4 true
plugin one
plugin two

[telnet]
port 2006
acl 127.0.0.1 default_reject
";

    #[test]
    fn parse_and_format_round_trip() {
        let db = ConfigDb::parse(SAMPLE).unwrap();
        assert_eq!(db.entry("telnet", "port"), Some("2006"));
        assert_eq!(db.entries("global", "plugin"), &["one", "two"]);

        let again = ConfigDb::parse(&db.format()).unwrap();
        assert_eq!(db, again);
    }

    #[test]
    fn parse_rejects_loose_entries() {
        assert!(ConfigDb::parse("key value\n").is_err());
        assert!(ConfigDb::parse("[broken\nkey value\n").is_err());
    }

    #[test]
    fn set_remove_get() {
        let mut db = ConfigDb::new();
        db.set("telnet.port=2007").unwrap();
        db.set("global").unwrap();
        assert!(db.set("nosection=1").is_err());

        assert_eq!(db.entry("telnet", "port"), Some("2007"));
        assert_eq!(db.get("telnet.port"), "2007\n");
        assert_eq!(db.get(""), "global\ntelnet\n");

        db.remove("telnet.port").unwrap();
        assert_eq!(db.entry("telnet", "port"), None);
        db.remove("telnet").unwrap();
        assert!(db.section("telnet").is_none());
    }

    #[test]
    fn global_extraction() {
        let db = ConfigDb::parse(SAMPLE).unwrap();
        let global = global_config(&db);
        assert!(global.ipv4);
        assert!(global.ipv6);
        assert!(!global.failfast);
        assert_eq!(global.plugins, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn stream_config_defaults_and_errors() {
        let db = ConfigDb::parse(SAMPLE).unwrap();
        let config = stream_socket_config(&db, "telnet", 2006).unwrap();
        assert_eq!(config.port, 2006);
        assert!(config.ipv4);

        let config = stream_socket_config(&db, "http", 1978).unwrap();
        assert_eq!(config.port, 1978);

        let mut db = ConfigDb::new();
        db.put("http", "port", "not-a-port");
        assert!(stream_socket_config(&db, "http", 1978).is_err());
        assert!(validate(&db).is_err());
    }

    #[test]
    fn delta_fires_only_on_change() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut old = ConfigDb::new();
        old.put("telnet", "port", "2006");
        old.put("http", "port", "1978");

        let mut new = old.clone();
        new.put("telnet", "port", "2007");

        let telnet_calls = Rc::new(Cell::new(0));
        let http_calls = Rc::new(Cell::new(0));
        let handlers = vec![
            DeltaHandler {
                section: "telnet".to_string(),
                callback: {
                    let calls = telnet_calls.clone();
                    Box::new(move |_, _| {
                        calls.set(calls.get() + 1);
                        Ok(())
                    })
                },
            },
            DeltaHandler {
                section: "http".to_string(),
                callback: {
                    let calls = http_calls.clone();
                    Box::new(move |_, _| {
                        calls.set(calls.get() + 1);
                        Ok(())
                    })
                },
            },
        ];

        handle_deltas(&old, &new, &handlers, false).unwrap();
        assert_eq!(telnet_calls.get(), 1);
        assert_eq!(http_calls.get(), 0);

        // First apply fires everything.
        handle_deltas(&old, &new, &handlers, true).unwrap();
        assert_eq!(telnet_calls.get(), 2);
        assert_eq!(http_calls.get(), 1);
    }

    #[test]
    fn schema_filter() {
        assert!(format_schema(None).contains("telnet.port"));
        let filtered = format_schema(Some("http"));
        assert!(filtered.contains("http.port"));
        assert!(!filtered.contains("telnet.port"));
        let one = format_schema(Some("global.failfast"));
        assert_eq!(one.lines().count(), 2);
    }
}
