//! Backup methods and the plugins providing them.
//!
//! A plugin module groups handler types; each handler declares an option
//! schema and the entry points that the registered methods point to.

pub mod archive;
pub mod mysql;
pub mod postgresql;
pub mod registry;
pub mod rsync;
pub mod schema;

use crate::backup::config::{parse_bool, ConfigMap};
use crate::backup::plugin::registry::{PluginModule, PluginRegistry};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;

pub static BUILTIN_PLUGINS: [&str; 4] = ["archive", "mysql", "postgresql", "rsync"];

pub fn builtin_plugin(name: &str) -> Option<&'static dyn PluginModule> {
    match name {
        "archive" => Some(&archive::ArchivePlugin),
        "mysql" => Some(&mysql::MySqlPlugin),
        "postgresql" => Some(&postgresql::PostgreSqlPlugin),
        "rsync" => Some(&rsync::RsyncPlugin),
        _ => None,
    }
}

impl PluginRegistry {
    /// Registry with the builtin plugins enabled by the `plugins` section.
    ///
    /// Without a section every builtin plugin is loaded, otherwise only the
    /// ones switched on. Naming an unknown plugin is fatal.
    pub fn with_plugins(plugins: Option<&ConfigMap>) -> Result<Self> {
        let mut registry = PluginRegistry::new();
        let enabled: Vec<&str> = match plugins {
            None => BUILTIN_PLUGINS.to_vec(),
            Some(section) => {
                let mut enabled = Vec::new();
                for (name, value) in section {
                    if builtin_plugin(name).is_none() {
                        return Err(Error::fatal_config(format!(
                            "Plugin {name} not found, available plugins: {}",
                            BUILTIN_PLUGINS.join(", ")
                        )));
                    }
                    match parse_bool(value) {
                        Some(true) => enabled.push(name.as_str()),
                        Some(false) => tracing::debug!("Plugin {name} disabled by configuration."),
                        None => {
                            return Err(Error::fatal_config(format!(
                                "Invalid value for plugin {name}: {value:?}"
                            )))
                        }
                    }
                }
                enabled
            }
        };

        for name in enabled {
            if let Some(module) = builtin_plugin(name) {
                registry.load_plugin(module)?;
            }
        }
        Ok(registry)
    }
}
