//! Configuration file loading and global initialisation.
//!
//! The YAML file carries a mandatory `general` section, the `jobs` in
//! declaration order and an optional `plugins` section. Every value is
//! flattened to a string so handlers validate their own keys.

use crate::backup::function_path;
use crate::backup::result_error::error::{Error, ErrorKind};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDetails, AddFunctionName, AddMsg};
use crate::backup::validate::{validate_dir_exist_or_created, validate_log_level, validate_umask};
use bon::Builder;
use chrono::Local;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{gethostname, getuid, User};
use serde::Deserialize;
use serde_yml::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

pub type ConfigMap = BTreeMap<String, String>;

pub static DEFAULT_CONFIG_PATHS: [&str; 2] = ["./backup_runner.yml", "/etc/backup_runner.yml"];
pub static DEFAULT_LOGFILE: &str = "backup.log";

#[derive(Clone, Debug, Default, Builder, Getters)]
#[getset(get = "pub")]
pub struct BackupConfig {
    #[builder(default)]
    global: ConfigMap,
    /// Jobs in declaration order.
    #[builder(default)]
    jobs: Vec<(String, ConfigMap)>,
    plugins: Option<ConfigMap>,
}

impl BackupConfig {
    /// Reads the first existing file of `path` or the default locations.
    #[named]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect(),
        };
        let Some(found) = candidates.iter().find(|p| p.is_file()) else {
            return Err(Error::fatal_config(format!(
                "Configuration file not found in any of the following locations: {}",
                candidates.iter().map(|p| p.display()).join(" ")
            )));
        };

        tracing::debug!("Reading configuration file {:?}", found);
        let value: Value = File::open(found)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, Value>(f).map_err(Error::from))
            .map_err(|e| e.or_kind(ErrorKind::FatalConfig))
            .add_msg(format!("Parse YAML config failed: {:?}", found))
            .add_fn_name(function_path!())?;
        Self::from_value(value).add_msg(format!("Invalid configuration file: {:?}", found))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let value: Value =
            serde_yml::from_str(yaml).map_err(|e| Error::from(e).or_kind(ErrorKind::FatalConfig))?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Mapping(mut root) = value else {
            return Err(Error::fatal_config("Top level of configuration must be a mapping."));
        };

        let global = match root.remove("general") {
            Some(section) => section_to_map("general", section)?,
            None => {
                return Err(Error::fatal_config(
                    "Missing mandatory section 'general' in configuration file.",
                ))
            }
        };

        let jobs = match root.remove("jobs") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Mapping(jobs)) => jobs
                .into_iter()
                .map(|(name, section)| -> Result<(String, ConfigMap)> {
                    let name = scalar_to_string(&name).ok_or_else(|| {
                        Error::fatal_config(format!("Invalid job name: {:?}", name))
                    })?;
                    let conf = section_to_map(&name, section)?;
                    Ok((name, conf))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(Error::fatal_config("Section 'jobs' must be a mapping.")),
        };

        let plugins = root
            .remove("plugins")
            .map(|section| section_to_map("plugins", section))
            .transpose()?;

        if let Some(unknown) = root.keys().next() {
            return Err(Error::fatal_config(format!(
                "Unknown top level section in configuration file: {:?}",
                unknown
            )));
        }

        Ok(Self {
            global,
            jobs,
            plugins,
        })
    }

    pub fn job(&self, name: &str) -> Option<&ConfigMap> {
        self.jobs.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|(n, _)| n.clone()).collect()
    }
}

fn section_to_map(section: &str, value: Value) -> Result<ConfigMap> {
    match value {
        Value::Null => Ok(ConfigMap::new()),
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(k, v)| -> Result<(String, String)> {
                let key = scalar_to_string(&k).ok_or_else(|| {
                    Error::fatal_config(format!("Invalid key in section {section}: {:?}", k))
                })?;
                let value = value_to_string(&v).ok_or_else(|| {
                    Error::fatal_config(format!(
                        "Invalid value for option {key} in section {section}, \
                         expected a scalar or a list of scalars."
                    ))
                })?;
                Ok((key, value))
            })
            .collect(),
        _ => Err(Error::fatal_config(format!("Section {section} must be a mapping."))),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Sequence(items) => items
            .iter()
            .map(scalar_to_string)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        v => scalar_to_string(v),
    }
}

/// Parses boolean-like option values.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Some(true),
        "no" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Boolean option `key` of `conf`, `default` when absent.
pub fn flag(conf: &ConfigMap, key: &str, default: bool) -> Result<bool> {
    match conf.get(key) {
        None => Ok(default),
        Some(value) => parse_bool(value).ok_or_else(|| {
            Error::config(format!(
                "Invalid value for boolean option {key}: {value:?}"
            ))
        }),
    }
}

/// Splits list-like option values on commas and whitespace.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether the process runs as the OS user `name`.
pub fn running_as_user(name: &str) -> Result<bool> {
    let user = User::from_name(name)?
        .ok_or_else(|| Error::environment(format!("Unknown user: {name}")))?;
    Ok(user.uid == getuid())
}

/// Typed view of the `general` section.
#[derive(Clone, Debug, Default, Deserialize, Validate)]
pub struct GlobalSettings {
    pub backup_root: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub hostname_dir: Option<String>,
    pub user: Option<String>,
    #[validate(custom(function = validate_umask))]
    pub umask: Option<String>,
    #[validate(custom(function = validate_log_level))]
    pub console_loglevel: Option<String>,
    #[validate(custom(function = validate_log_level))]
    pub logfile_loglevel: Option<String>,
    pub filename_logfile: Option<String>,
}

impl GlobalSettings {
    pub fn from_config(global: &ConfigMap) -> Result<Self> {
        let settings: GlobalSettings = serde_json::to_value(global)
            .and_then(serde_json::from_value)
            .map_err(|e| Error::from(e).or_kind(ErrorKind::FatalConfig))?;
        settings
            .validate()
            .map_err(|e| Error::from(e).or_kind(ErrorKind::FatalConfig))?;
        Ok(settings)
    }

    pub fn filename_logfile(&self) -> &str {
        self.filename_logfile.as_deref().unwrap_or(DEFAULT_LOGFILE)
    }
}

/// General configuration after startup checks, with `backup_path` resolved.
#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct Globals {
    config: ConfigMap,
    settings: GlobalSettings,
}

impl Globals {
    /// Checks the running user, applies the umask and resolves (and unless
    /// `dry_run` creates) the backup path shared by all jobs.
    #[named]
    pub fn init(global: &ConfigMap, dry_run: bool) -> Result<Self> {
        let mut settings = GlobalSettings::from_config(global).add_fn_name(function_path!())?;

        if let Some(user) = &settings.user {
            let matches = running_as_user(user).map_err(|e| {
                Error::fatal_environment(format!("Checking backup user {user} failed."))
                    .add_details(vec![e.to_string()])
            })?;
            if !matches {
                return Err(Error::fatal_environment(format!(
                    "Backup script must be run as user {user}."
                )));
            }
        }

        if let Some(mask) = &settings.umask {
            let bits = u32::from_str_radix(mask, 8)
                .map_err(|_| Error::fatal_config(format!("Invalid umask: {mask}")))?;
            umask(Mode::from_bits_truncate(bits as nix::libc::mode_t));
        }

        let backup_path = match (&settings.backup_root, &settings.backup_path) {
            (Some(root), _) => {
                let mut path = root.clone();
                if let Some(hostname_dir) = &settings.hostname_dir {
                    if parse_bool(hostname_dir).unwrap_or(false) {
                        let hostname = gethostname()?.to_string_lossy().into_owned();
                        let short = hostname.split('.').next().unwrap_or_default().to_owned();
                        path = path.join(short).join(Local::now().format("%Y-%m-%d").to_string());
                    }
                }
                path
            }
            (None, Some(path)) => path.clone(),
            (None, None) => {
                return Err(Error::fatal_config(
                    "Backup root directory (backup_root) not defined.",
                ))
            }
        };

        if dry_run {
            tracing::info!("Dry-run, backup base directory not created: {:?}", backup_path);
        } else if validate_dir_exist_or_created(&backup_path).map_err(|e| {
            Error::fatal_environment(format!(
                "Creation of backup base directory ({}) failed.",
                backup_path.display()
            ))
            .add_details(vec![e.to_string()])
        })? {
            tracing::debug!("Backup base directory ({:?}) created.", backup_path);
        }

        let mut config = global.clone();
        config.insert(
            "backup_path".to_owned(),
            backup_path.to_string_lossy().into_owned(),
        );
        settings.backup_path = Some(backup_path);

        Ok(Self { config, settings })
    }
}
