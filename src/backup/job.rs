//! A single backup job moving through its lifecycle:
//! created, validated, directory ready, method dispatched, then
//! succeeded or failed.

use crate::backup::command::CommandRunner;
use crate::backup::config::{running_as_user, ConfigMap};
use crate::backup::plugin::registry::PluginRegistry;
use crate::backup::result_error::error::{Error, ErrorKind};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDetails;
use crate::backup::validate::{validate_dir_exist_or_created, validate_job_name};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum JobState {
    Created,
    Validated,
    DirectoryReady,
    MethodDispatched,
    Succeeded,
    Failed,
}

#[derive(Debug, Getters, CopyGetters)]
pub struct Job {
    #[getset(get = "pub")]
    name: String,
    /// General section overlaid with the job section and derived keys.
    #[getset(get = "pub")]
    conf: ConfigMap,
    /// General section plus the derived keys, handed to the handler.
    global: ConfigMap,
    job_conf: ConfigMap,
    #[getset(get = "pub")]
    job_path: PathBuf,
    #[getset(get_copy = "pub")]
    state: JobState,
}

impl Job {
    pub fn new(name: &str, global: &ConfigMap, job_conf: &ConfigMap) -> Result<Self> {
        validate_job_name(name).map_err(|e| {
            Error::config(format!("Invalid backup job name: {name}")).add_details(vec![e.to_string()])
        })?;
        let backup_path = global.get("backup_path").ok_or_else(|| {
            Error::fatal_config("Backup base directory (backup_path) not defined.")
        })?;
        let job_path = PathBuf::from(backup_path).join(name);

        let derived = [
            ("job_name".to_owned(), name.to_owned()),
            ("job_path".to_owned(), job_path.to_string_lossy().into_owned()),
        ];
        let mut global = global.clone();
        global.extend(derived.iter().cloned());
        let mut conf = global.clone();
        conf.extend(job_conf.iter().map(|(k, v)| (k.clone(), v.clone())));
        conf.extend(derived);

        Ok(Self {
            name: name.to_owned(),
            conf,
            global,
            job_conf: job_conf.clone(),
            job_path,
            state: JobState::Created,
        })
    }

    fn advance(&mut self, next: JobState) {
        tracing::debug!("Backup job {}: {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    /// Runs the job to a terminal state; an error leaves it in [`JobState::Failed`].
    pub fn run(&mut self, registry: &PluginRegistry, runner: &CommandRunner) -> Result<()> {
        let result = self
            .validate()
            .and_then(|_| self.prepare_directory(runner.dry_run()))
            .and_then(|_| self.dispatch(registry, runner));
        match result {
            Ok(()) => self.advance(JobState::Succeeded),
            Err(_) => self.advance(JobState::Failed),
        }
        result
    }

    fn validate(&mut self) -> Result<()> {
        if let Some(user) = self.conf.get("user") {
            let matches = running_as_user(user).map_err(|e| e.or_kind(ErrorKind::Environment))?;
            if !matches {
                return Err(Error::environment(format!(
                    "Backup job must be run as user {user}."
                )));
            }
        }
        self.advance(JobState::Validated);
        Ok(())
    }

    fn prepare_directory(&mut self, dry_run: bool) -> Result<()> {
        if dry_run {
            tracing::info!("Dry-run, backup job directory not created: {:?}", self.job_path);
        } else {
            let created = validate_dir_exist_or_created(&self.job_path).map_err(|e| {
                Error::environment(format!(
                    "Creation of backup job directory ({}) failed.",
                    self.job_path.display()
                ))
                .add_details(vec![e.to_string()])
            })?;
            if created {
                tracing::debug!("Backup job directory ({:?}) created.", self.job_path);
            }
        }
        self.advance(JobState::DirectoryReady);
        Ok(())
    }

    fn dispatch(&mut self, registry: &PluginRegistry, runner: &CommandRunner) -> Result<()> {
        let method = self
            .job_conf
            .get("method")
            .cloned()
            .ok_or_else(|| Error::config("Backup method not defined."))?;
        let Some(registration) = registry.registration(&method) else {
            return Err(Error::config(format!("Invalid backup method: {method}")));
        };
        if let Some(plugin) = self.job_conf.get("plugin") {
            if registration.plugin().as_deref() != Some(plugin.as_str()) {
                return Err(Error::config(format!(
                    "Backup method {method} is not provided by plugin {plugin}."
                )));
            }
        }
        self.advance(JobState::MethodDispatched);
        tracing::info!("Executing backup method {method}");
        registry.invoke(&method, &self.global, &self.job_conf, runner)
    }
}
