//! Declared options of backup handlers and the validated, merged
//! configuration a handler is built from.

use crate::backup::config::{flag, split_list, ConfigMap};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use itertools::Itertools;
use std::fmt::{Debug, Formatter};
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionDecl {
    pub name: &'static str,
    pub help: &'static str,
}

impl OptionDecl {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self { name, help }
    }
}

/// Immutable option table of a handler type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerSchema {
    pub options: &'static [OptionDecl],
    /// Keys the job section itself must define.
    pub required: &'static [&'static str],
    pub defaults: &'static [(&'static str, &'static str)],
}

impl HandlerSchema {
    pub fn accepts(&self, key: &str) -> bool {
        BASE_SCHEMA.options.iter().chain(self.options).any(|o| o.name == key)
    }
}

/// Options every job may use, whatever its method.
pub const BASE_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        OptionDecl::new("method", "Backup method."),
        OptionDecl::new("plugin", "Plugin providing the backup method."),
        OptionDecl::new("active", "Enable / disable the backup job. (Enabled by default.)"),
        OptionDecl::new("user", "The backup job must be run as this OS user."),
        OptionDecl::new("job_pre_exec", "Script executed before the backup job."),
        OptionDecl::new("job_post_exec", "Script executed after the backup job."),
        OptionDecl::new("cmd_compress", "Command used for compression of dump files."),
        OptionDecl::new("suffix_compress", "Filename suffix of compressed files."),
        OptionDecl::new("cmd_tar", "Command used for generation of tar archives."),
        OptionDecl::new("suffix_tgz", "Filename suffix of compressed tar archives."),
        OptionDecl::new("suffix_index", "Filename suffix of index files."),
    ],
    required: &[],
    defaults: &[("cmd_tar", "tar"), ("suffix_tgz", "tgz"), ("suffix_index", "list")],
};

/// Operator-wide keys; a missing one fails every job, so it aborts the run.
pub const GLOBAL_REQUIRED: &[&str] = &["cmd_compress", "suffix_compress", "cmd_tar"];

/// Help text of a method: base options followed by the handler's own options.
pub fn describe(method: &str, plugin: &str, description: &str, schema: &HandlerSchema) -> String {
    let mut text = format!("{method} (plugin {plugin}: {description})\n");
    for (title, options) in [("Base options", BASE_SCHEMA.options), ("Method options", schema.options)] {
        text.push_str(title);
        text.push_str(":\n");
        for option in options {
            let marker = if schema.required.contains(&option.name) {
                " (required)"
            } else {
                ""
            };
            text.push_str(&format!("  {}: {}{}\n", option.name, option.help, marker));
        }
    }
    text
}

/// Working configuration of one handler instance.
///
/// Precedence, lowest first: base defaults, handler defaults, general
/// section, job section.
#[derive(Clone)]
pub struct HandlerConfig {
    values: ConfigMap,
}

impl Debug for HandlerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.values.iter().map(|(k, v)| {
                if k.contains("password") {
                    (k.as_str(), crate::backup::redacted::REDACTED_SECRET)
                } else {
                    (k.as_str(), v.as_str())
                }
            }))
            .finish()
    }
}

impl HandlerConfig {
    pub fn build(schema: &HandlerSchema, global: &ConfigMap, job: &ConfigMap) -> Result<Self> {
        let mut values: ConfigMap = BASE_SCHEMA
            .defaults
            .iter()
            .chain(schema.defaults)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        values.extend(global.iter().map(|(k, v)| (k.clone(), v.clone())));

        let missing_global = GLOBAL_REQUIRED
            .iter()
            .filter(|key| !values.contains_key(**key))
            .join(", ");
        if !missing_global.is_empty() {
            return Err(Error::fatal_config(format!(
                "Required options missing in general configuration: {missing_global}"
            )));
        }

        let missing = schema
            .required
            .iter()
            .filter(|key| !job.contains_key(**key))
            .join(", ");
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "Required options missing in job configuration: {missing}"
            )));
        }

        let unknown = job.keys().filter(|key| !schema.accepts(key)).join(", ");
        if !unknown.is_empty() {
            return Err(Error::config(format!(
                "Invalid options in job configuration: {unknown}"
            )));
        }

        values.extend(job.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::config(format!("Option {key} not defined.")))
    }

    /// Fills `key` only when no source defined it.
    pub fn set_default(&mut self, key: &str, value: String) {
        self.values.entry(key.to_owned()).or_insert(value);
    }

    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        flag(&self.values, key, default)
    }

    pub fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(split_list)
    }

    /// Lexically normalized entries of a path list option.
    pub fn path_list(&self, key: &str) -> Result<Vec<String>> {
        let paths = split_list(self.require(key)?)
            .iter()
            .map(|p| normalize_path(p))
            .collect_vec();
        if paths.is_empty() {
            return Err(Error::config("No valid source paths defined for backup."));
        }
        Ok(paths)
    }

    pub fn job_path(&self) -> Result<PathBuf> {
        self.require("job_path").map(PathBuf::from)
    }

    /// Compressor command line, `cmd_compress` split on whitespace.
    pub fn compressor(&self) -> Result<Vec<String>> {
        let compressor = self
            .require("cmd_compress")?
            .split_whitespace()
            .map(str::to_owned)
            .collect_vec();
        if compressor.is_empty() {
            return Err(Error::config("Option cmd_compress is empty."));
        }
        Ok(compressor)
    }
}

pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<Component> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) => {}
                _ => parts.push(component),
            },
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        return ".".to_owned();
    }
    parts
        .iter()
        .collect::<PathBuf>()
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::ErrorKind;

    const TEST_SCHEMA: HandlerSchema = HandlerSchema {
        options: &[
            OptionDecl::new("path_list", "Paths."),
            OptionDecl::new("level", "Level."),
        ],
        required: &["path_list"],
        defaults: &[("level", "3"), ("suffix_tgz", "tar.gz")],
    };

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn global() -> ConfigMap {
        map(&[("cmd_compress", "gzip -9"), ("suffix_compress", "gz"), ("level", "5")])
    }

    #[test]
    fn test_merge_precedence() {
        let job = map(&[("path_list", "/etc"), ("method", "test")]);
        let conf = HandlerConfig::build(&TEST_SCHEMA, &global(), &job).unwrap();

        assert_eq!(conf.get("cmd_tar"), Some("tar"));
        assert_eq!(conf.get("suffix_tgz"), Some("tar.gz"));
        assert_eq!(conf.get("level"), Some("5"));

        let job = map(&[("path_list", "/etc"), ("level", "9")]);
        let conf = HandlerConfig::build(&TEST_SCHEMA, &global(), &job).unwrap();
        assert_eq!(conf.get("level"), Some("9"));
    }

    #[test]
    fn test_missing_global_key_is_fatal() {
        let job = map(&[("path_list", "/etc")]);
        let error =
            HandlerConfig::build(&TEST_SCHEMA, &map(&[("cmd_compress", "gzip")]), &job).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::FatalConfig);
        assert!(error.to_string().contains("suffix_compress"));
    }

    #[test]
    fn test_missing_required_job_key() {
        let error = HandlerConfig::build(&TEST_SCHEMA, &global(), &map(&[("level", "1")])).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Config);
        assert!(error.to_string().contains("path_list"));
    }

    #[test]
    fn test_required_key_in_general_section_is_not_enough() {
        let mut global = global();
        global.insert("path_list".to_string(), "/etc".to_string());
        let error = HandlerConfig::build(&TEST_SCHEMA, &global, &ConfigMap::new()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_unknown_job_key_is_rejected() {
        let job = map(&[("path_list", "/etc"), ("pathlist", "/home")]);
        let error = HandlerConfig::build(&TEST_SCHEMA, &global(), &job).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Config);
        assert!(error.to_string().contains("pathlist"));
    }

    #[test]
    fn test_accessors() {
        let job = map(&[("path_list", "/etc/./ssh, /var/lib/../log /srv/")]);
        let conf = HandlerConfig::build(&TEST_SCHEMA, &global(), &job).unwrap();

        assert_eq!(conf.path_list("path_list").unwrap(), vec!["/etc/ssh", "/var/log", "/srv"]);
        assert_eq!(conf.compressor().unwrap(), vec!["gzip", "-9"]);
        assert_eq!(conf.require("missing").unwrap_err().kind(), ErrorKind::Config);
        assert!(conf.job_path().is_err());
    }

    #[test]
    fn test_set_default_keeps_configured_values() {
        let job = map(&[("path_list", "/etc")]);
        let mut conf = HandlerConfig::build(&TEST_SCHEMA, &global(), &job).unwrap();
        conf.set_default("level", "1".to_string());
        conf.set_default("dst_dir", "/backup".to_string());

        assert_eq!(conf.get("level"), Some("5"));
        assert_eq!(conf.get("dst_dir"), Some("/backup"));
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let mut global = global();
        global.insert("db_password".to_string(), "hunter22".to_string());
        let conf = HandlerConfig::build(&TEST_SCHEMA, &global, &map(&[("path_list", "/etc")])).unwrap();

        assert!(!format!("{:?}", conf).contains("hunter22"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/etc/./ssh/"), "/etc/ssh");
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("../x"), "../x");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("./"), ".");
    }

    #[test]
    fn test_describe_lists_options() {
        let text = describe("test", "testing", "Test plugin.", &TEST_SCHEMA);

        assert!(text.starts_with("test (plugin testing: Test plugin.)"));
        assert!(text.contains("  method: Backup method."));
        assert!(text.contains("  path_list: Paths. (required)"));
    }
}
