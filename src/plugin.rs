//! Plugin registry and loader.
//!
//! Plugins are either static (linked into the binary, registered through the
//! startup table before any subsystem initializes) or dynamic (shared
//! objects resolved through templated name patterns and `dlopen`). Both kinds
//! share one record with a four-phase lifecycle: load, enable, disable,
//! unload. A dynamic object must export [`PLUGIN_ENTRY_SYMBOL`] and register
//! exactly one record from it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::raw::c_void;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::build_data;

/// Symbol a plugin shared object must export:
/// `unsafe extern "C" fn(*const PluginRegistry)`.
pub const PLUGIN_ENTRY_SYMBOL: &str = "meshd_plugin_register";

pub type PluginRegisterFn = unsafe extern "C" fn(*const PluginRegistry);

/// Lifecycle hook of a plugin phase.
pub type PluginHook = Box<dyn FnMut() -> io::Result<()>>;

struct DlHandle(*mut c_void);

impl Drop for DlHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from dlopen and is closed exactly once.
        unsafe { libc::dlclose(self.0) };
    }
}

/// One plugin record.
pub struct Plugin {
    pub name: String,
    pub descr: String,
    pub author: String,
    /// Plugin may be deactivated at runtime.
    pub can_disable: bool,
    /// Plugin may be unloaded at runtime.
    pub can_unload: bool,
    pub load: Option<PluginHook>,
    pub enable: Option<PluginHook>,
    pub disable: Option<PluginHook>,
    pub unload: Option<PluginHook>,
    loaded: bool,
    enabled: bool,
    is_static: bool,
    dl: Option<DlHandle>,
}

impl Plugin {
    pub fn new(name: &str, descr: &str, author: &str) -> Plugin {
        Plugin {
            name: name.to_string(),
            descr: descr.to_string(),
            author: author.to_string(),
            can_disable: false,
            can_unload: false,
            load: None,
            enable: None,
            disable: None,
            unload: None,
            loaded: false,
            enabled: false,
            is_static: false,
            dl: None,
        }
    }
}

/// Snapshot of a plugin's runtime state, for listings.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub name: String,
    pub loaded: bool,
    pub enabled: bool,
    pub is_static: bool,
}

struct Registry {
    map: BTreeMap<String, Plugin>,
}

/// Shared handle to the plugin table.
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Rc<RefCell<Registry>>,
}

impl Default for PluginRegistry {
    fn default() -> PluginRegistry {
        PluginRegistry::new()
    }
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry {
            inner: Rc::new(RefCell::new(Registry {
                map: BTreeMap::new(),
            })),
        }
    }

    /// Insert a record registered by a dynamic object's entry symbol.
    pub fn register(&self, plugin: Plugin) -> bool {
        self.insert(plugin, false)
    }

    /// Insert a record for a plugin linked into the binary.
    pub fn register_static(&self, plugin: Plugin) -> bool {
        self.insert(plugin, true)
    }

    fn insert(&self, mut plugin: Plugin, is_static: bool) -> bool {
        let key = canonical_name(&plugin.name);
        plugin.is_static = is_static;
        let mut inner = self.inner.borrow_mut();
        if inner.map.contains_key(&key) {
            warn!("plugin {} is already registered", plugin.name);
            return false;
        }
        inner.map.insert(key, plugin);
        true
    }

    /// Resolve a requested name to the canonical key of a known plugin.
    pub fn get(&self, name: &str) -> Option<String> {
        let key = canonical_name(name);
        self.inner.borrow().map.contains_key(&key).then_some(key)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.inner
            .borrow()
            .map
            .values()
            .map(|p| PluginInfo {
                name: p.name.clone(),
                loaded: p.loaded,
                enabled: p.enabled,
                is_static: p.is_static,
            })
            .collect()
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let key = canonical_name(name);
        self.inner
            .borrow()
            .map
            .get(&key)
            .map_or(false, |p| p.enabled)
    }

    pub fn is_static(&self, name: &str) -> bool {
        let key = canonical_name(name);
        self.inner
            .borrow()
            .map
            .get(&key)
            .map_or(false, |p| p.is_static)
    }

    /// Load a plugin: resolve the shared object if the name is unknown, then
    /// run its load hook.
    pub fn load(&self, name: &str) -> io::Result<()> {
        let key = canonical_name(name);

        if self.inner.borrow().map.get(&key).is_none() {
            let handle = open_plugin(name)?;

            // SAFETY: the symbol type is part of the plugin ABI contract.
            let entry = unsafe {
                let symbol = CString::new(PLUGIN_ENTRY_SYMBOL).expect("symbol name");
                libc::dlsym(handle.0, symbol.as_ptr())
            };
            if entry.is_null() {
                warn!("plugin {} does not export {}", name, PLUGIN_ENTRY_SYMBOL);
                return Err(io::ErrorKind::InvalidData.into());
            }
            // SAFETY: a plugin exporting the entry symbol guarantees this
            // signature; the registry pointer is valid for the call.
            unsafe {
                let entry: PluginRegisterFn = std::mem::transmute(entry);
                entry(self as *const PluginRegistry);
            }

            let mut inner = self.inner.borrow_mut();
            match inner.map.get_mut(&key) {
                Some(plugin) => plugin.dl = Some(handle),
                None => {
                    warn!("plugin object {} did not register '{}'", name, key);
                    return Err(io::ErrorKind::InvalidData.into());
                }
            }
        }

        self.with_plugin(&key, |plugin| {
            if !plugin.loaded {
                if let Some(hook) = plugin.load.as_mut() {
                    if let Err(err) = hook() {
                        warn!("load callback failed for plugin {}: {}", plugin.name, err);
                        return Err(err);
                    }
                }
                debug!("load callback of plugin {} successful", plugin.name);
            }
            plugin.loaded = true;
            Ok(())
        })
        .unwrap_or(Err(io::ErrorKind::NotFound.into()))
    }

    /// Enable a loaded plugin; loads it first if necessary.
    pub fn enable(&self, name: &str) -> io::Result<()> {
        let key = canonical_name(name);
        self.with_plugin(&key, |plugin| {
            if plugin.enabled {
                return Ok(());
            }
            if !plugin.loaded {
                if let Some(hook) = plugin.load.as_mut() {
                    hook().map_err(|err| {
                        warn!("load failed for plugin {}: {}", plugin.name, err);
                        err
                    })?;
                }
                plugin.loaded = true;
            }
            if let Some(hook) = plugin.enable.as_mut() {
                hook().map_err(|err| {
                    warn!("enable failed for plugin {}: {}", plugin.name, err);
                    err
                })?;
            }
            plugin.enabled = true;
            if !plugin.author.is_empty() && !plugin.descr.is_empty() {
                info!(
                    "plugin '{}' ({}) by {} activated successfully",
                    plugin.descr, plugin.name, plugin.author
                );
            } else {
                info!("plugin '{}' activated successfully", plugin.name);
            }
            Ok(())
        })
        .unwrap_or(Err(io::ErrorKind::NotFound.into()))
    }

    /// Disable (but keep loaded) an active plugin.
    pub fn disable(&self, name: &str) -> io::Result<()> {
        let key = canonical_name(name);
        self.with_plugin(&key, |plugin| {
            if !plugin.enabled {
                return Ok(());
            }
            if !plugin.can_disable {
                debug!("plugin {} does not support disabling", plugin.name);
                return Err(io::ErrorKind::Unsupported.into());
            }
            info!("deactivating plugin {}", plugin.name);
            if let Some(hook) = plugin.disable.as_mut() {
                hook().map_err(|err| {
                    warn!("disable failed for plugin {}: {}", plugin.name, err);
                    err
                })?;
            }
            plugin.enabled = false;
            Ok(())
        })
        .unwrap_or(Err(io::ErrorKind::NotFound.into()))
    }

    /// Unload a plugin. Static plugins are refused outside final shutdown.
    pub fn unload(&self, name: &str) -> io::Result<()> {
        self.unload_internal(&canonical_name(name), false)
    }

    fn unload_internal(&self, key: &str, cleanup: bool) -> io::Result<()> {
        let Some(mut plugin) = self.inner.borrow_mut().map.remove(key) else {
            return Err(io::ErrorKind::NotFound.into());
        };

        if plugin.enabled {
            if plugin.can_disable || cleanup {
                if let Some(hook) = plugin.disable.as_mut() {
                    let _ = hook();
                }
                plugin.enabled = false;
            } else if !cleanup {
                self.inner.borrow_mut().map.insert(key.to_string(), plugin);
                return Err(io::ErrorKind::Unsupported.into());
            }
        }

        if plugin.is_static && !cleanup {
            // Static plugins stay until final shutdown.
            self.inner.borrow_mut().map.insert(key.to_string(), plugin);
            return Err(io::ErrorKind::Unsupported.into());
        }

        info!("unloading plugin {}", plugin.name);
        if let Some(hook) = plugin.unload.as_mut() {
            let _ = hook();
        }
        // Dropping the record closes the dl handle.
        Ok(())
    }

    /// Apply the configured plugin set: load and enable everything
    /// requested, drop dynamic plugins that are no longer listed.
    pub fn apply_config(&self, requested: &[String], failfast: bool) -> io::Result<()> {
        for name in requested {
            if let Err(err) = self.load(name) {
                if failfast {
                    return Err(err);
                }
            }
        }

        let keys: Vec<String> = self.inner.borrow().map.keys().cloned().collect();
        let wanted: Vec<String> = requested.iter().map(|n| canonical_name(n)).collect();

        for key in &keys {
            if let Err(err) = self.enable(key) {
                if failfast {
                    return Err(err);
                }
            }
        }

        for key in &keys {
            let is_static = self
                .inner
                .borrow()
                .map
                .get(key)
                .map_or(true, |p| p.is_static);
            if is_static || wanted.contains(key) {
                continue;
            }
            let _ = self.disable(key);
            let _ = self.unload_internal(key, false);
        }
        Ok(())
    }

    /// Final shutdown: disable and unload everything, static plugins
    /// included.
    pub fn shutdown(&self) {
        let keys: Vec<String> = self.inner.borrow().map.keys().cloned().collect();
        for key in keys {
            let _ = self.unload_internal(&key, true);
        }
    }

    fn with_plugin<R>(&self, key: &str, f: impl FnOnce(&mut Plugin) -> R) -> Option<R> {
        // The record is taken out of the table while its hooks run, so a
        // hook may call back into the registry.
        let mut plugin = self.inner.borrow_mut().map.remove(key)?;
        let result = f(&mut plugin);
        self.inner.borrow_mut().map.insert(key.to_string(), plugin);
        Some(result)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("PluginRegistry")
            .field("plugins", &inner.map.len())
            .finish()
    }
}

/// Reduce a requested plugin name to its table key: no directory, no shared
/// library prefix, no extension, lower case.
fn canonical_name(libname: &str) -> String {
    let name = libname.rsplit('/').next().unwrap_or(libname);
    let name = name
        .strip_prefix(build_data::SHARED_LIBRARY_PREFIX)
        .or_else(|| name.strip_prefix("meshd_"))
        .or_else(|| name.strip_prefix("lib"))
        .unwrap_or(name);
    let name = name.split('.').next().unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Try the templated name patterns in order until one resolves.
fn open_plugin(libname: &str) -> io::Result<DlHandle> {
    let path = build_data::PLUGIN_PATH;
    let prefix = build_data::SHARED_LIBRARY_PREFIX;
    let suffix = build_data::SHARED_LIBRARY_SUFFIX;
    let version = build_data::VERSION;

    let patterns = [
        format!("{}/{}{}{}.{}", path, prefix, libname, suffix, version),
        format!("{}/{}{}{}", path, prefix, libname, suffix),
        format!("{}{}{}.{}", prefix, libname, suffix, version),
        format!("{}{}{}", prefix, libname, suffix),
    ];

    for pattern in &patterns {
        debug!("trying to load library: {}", pattern);
        let Ok(cpath) = CString::new(pattern.as_str()) else {
            continue;
        };
        // SAFETY: dlopen with a valid C string.
        let handle = unsafe { libc::dlopen(cpath.as_ptr(), libc::RTLD_NOW) };
        if !handle.is_null() {
            info!("loading plugin {} from {}", libname, pattern);
            return Ok(DlHandle(handle));
        }
    }

    warn!("dynamic library loading failed for {}", libname);
    Err(io::ErrorKind::NotFound.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counting_plugin(
        name: &str,
        counter: Rc<Cell<u32>>,
        fail_enable: bool,
    ) -> Plugin {
        let mut plugin = Plugin::new(name, "test plugin", "nobody");
        plugin.can_disable = true;
        plugin.can_unload = true;
        plugin.enable = Some(Box::new(move || {
            if fail_enable {
                return Err(io::ErrorKind::Other.into());
            }
            counter.set(counter.get() + 1);
            Ok(())
        }));
        plugin
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("foo"), "foo");
        assert_eq!(canonical_name("libmeshd_foo.so"), "foo");
        assert_eq!(canonical_name("libmeshd_foo.so.0.3.1"), "foo");
        assert_eq!(canonical_name("/usr/lib/libmeshd_Foo.so"), "foo");
        assert_eq!(canonical_name("meshd_bar"), "bar");
        assert_eq!(canonical_name("libbaz.so"), "baz");
    }

    #[test]
    fn lifecycle() {
        let registry = PluginRegistry::new();
        let enables = Rc::new(Cell::new(0));
        registry.register_static(counting_plugin("demo", enables.clone(), false));

        assert!(registry.get("demo").is_some());
        assert!(!registry.is_enabled("demo"));

        registry.load("demo").unwrap();
        registry.enable("demo").unwrap();
        assert!(registry.is_enabled("demo"));
        assert_eq!(enables.get(), 1);

        // Enabling twice is a no-op.
        registry.enable("demo").unwrap();
        assert_eq!(enables.get(), 1);

        registry.disable("demo").unwrap();
        assert!(!registry.is_enabled("demo"));

        // Static plugins refuse unload outside shutdown.
        assert!(registry.unload("demo").is_err());
        assert!(registry.get("demo").is_some());

        registry.shutdown();
        assert!(registry.get("demo").is_none());
    }

    #[test]
    fn failing_enable_leaves_plugin_loaded() {
        let registry = PluginRegistry::new();
        let enables = Rc::new(Cell::new(0));
        registry.register_static(counting_plugin("bad", enables.clone(), true));

        registry.load("bad").unwrap();
        assert!(registry.enable("bad").is_err());
        assert!(!registry.is_enabled("bad"));

        let info = registry.list();
        assert_eq!(info.len(), 1);
        assert!(info[0].loaded);
        assert!(!info[0].enabled);
    }

    #[test]
    fn disable_requires_capability() {
        let registry = PluginRegistry::new();
        let mut plugin = Plugin::new("fixed", "", "");
        plugin.can_disable = false;
        registry.register_static(plugin);

        registry.enable("fixed").unwrap();
        assert!(registry.disable("fixed").is_err());
        assert!(registry.is_enabled("fixed"));
    }

    #[test]
    fn config_delta_drops_unlisted_dynamic_plugins() {
        let registry = PluginRegistry::new();
        let counter = Rc::new(Cell::new(0));

        // Simulate two already-registered dynamic plugins.
        registry.register(counting_plugin("one", counter.clone(), false));
        registry.register(counting_plugin("two", counter.clone(), false));
        registry.register_static(counting_plugin("core", counter.clone(), false));

        registry
            .apply_config(&["one".to_string(), "core".to_string()], false)
            .unwrap();

        assert!(registry.get("one").is_some());
        assert!(registry.is_enabled("one"));
        // "two" was not requested and is dynamic: gone.
        assert!(registry.get("two").is_none());
        // static plugins stay.
        assert!(registry.get("core").is_some());
    }
}
