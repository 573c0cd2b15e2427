//! Build-time data baked into the binary.

pub const PROGRAM: &str = "meshd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Target triple-ish build system marker.
pub const BUILD_SYSTEM: &str = std::env::consts::OS;

/// Search path for dynamically loaded plugins; overridable at build time.
pub const PLUGIN_PATH: &str = match option_env!("MESHD_PLUGIN_PATH") {
    Some(path) => path,
    None => ".",
};

/// Shared-library naming pieces used by the plugin loader patterns.
pub const SHARED_LIBRARY_PREFIX: &str = "libmeshd_";
pub const SHARED_LIBRARY_SUFFIX: &str = ".so";

/// Default configuration file, overridable at build time.
pub const DEFAULT_CONFIGFILE: &str = match option_env!("MESHD_CONFIGFILE") {
    Some(path) => path,
    None => "/etc/meshd/meshd.conf",
};

/// One-line version banner for the telnet `version` command and `--version`.
pub fn version_banner() -> String {
    format!("{} {} ({})", PROGRAM, VERSION, BUILD_SYSTEM)
}
