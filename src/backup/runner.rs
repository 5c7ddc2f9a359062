//! Sequential execution of the selected backup jobs with their hooks and
//! the abort-or-continue decision for every failure.

use crate::backup::command::{CommandRunner, ExecRequest};
use crate::backup::config::{flag, BackupConfig, ConfigMap};
use crate::backup::job::Job;
use crate::backup::logging::context_span;
use crate::backup::plugin::registry::PluginRegistry;
use crate::backup::result_error::error::{Error, ErrorKind};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDetails;
use bon::Builder;
use getset::{CopyGetters, Getters};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct RunStatistics {
    total: usize,
    disabled: usize,
    succeeded: usize,
    failed: usize,
}

impl RunStatistics {
    pub fn enabled(&self) -> usize {
        self.total - self.disabled
    }
}

impl Display for RunStatistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total jobs: {}, enabled: {}, disabled: {}, succeeded: {}, failed: {}",
            self.total,
            self.enabled(),
            self.disabled,
            self.succeeded,
            self.failed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Disabled,
    Failed(ErrorKind),
}

#[derive(Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct Runner {
    config: BackupConfig,
    /// General section with the resolved `backup_path`.
    globals: ConfigMap,
    registry: PluginRegistry,
    #[builder(default)]
    command_runner: CommandRunner,
    /// Every error is returned after logging instead of only fatal ones.
    #[builder(default)]
    trace: bool,
}

impl Runner {
    /// Runs `job_names`, or every configured job in declaration order.
    ///
    /// Returns `Err` only when the run had to be aborted.
    pub fn run(&self, job_names: Option<&[String]>) -> Result<RunStatistics> {
        let dry_run = self.command_runner.dry_run();
        let jobs = match job_names {
            Some(names) => names.to_vec(),
            None => self.config.job_names(),
        };
        if jobs.is_empty() {
            return Err(Error::startup("No backup job selected for execution."));
        }

        let mut stats = RunStatistics::default();

        if let Some(script) = self.globals.get("pre_exec") {
            let _span = context_span("PRE-EXEC", dry_run).entered();
            if let Err(e) = self.run_script(script, "pre-execution") {
                self.log_error(&e);
                if self.trace {
                    return Err(e);
                }
                tracing::error!("Global pre-execution script failed, no backup job executed.");
                for name in &jobs {
                    stats.total += 1;
                    let active = self
                        .config
                        .job(name)
                        .map(|job_conf| flag(job_conf, "active", true).unwrap_or(true));
                    match active {
                        Some(false) => stats.disabled += 1,
                        _ => stats.failed += 1,
                    }
                }
                self.log_summary(&stats);
                return Ok(stats);
            }
        }

        for name in &jobs {
            let _span = context_span(name, dry_run).entered();
            let outcome = self.run_job(name, &mut stats)?;
            tracing::debug!("Backup job {name} finished: {:?}", outcome);
        }

        if let Some(script) = self.globals.get("post_exec") {
            let _span = context_span("POST-EXEC", dry_run).entered();
            if let Err(e) = self.run_script(script, "post-execution") {
                self.log_error(&e);
                if self.trace {
                    return Err(e);
                }
            }
        }

        self.log_summary(&stats);
        Ok(stats)
    }

    fn run_job(&self, name: &str, stats: &mut RunStatistics) -> Result<JobOutcome> {
        stats.total += 1;
        let Some(job_conf) = self.config.job(name) else {
            return self.job_failed(
                stats,
                Error::config(format!("No configuration found for backup job {name}.")),
            );
        };
        match flag(job_conf, "active", true) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Backup job disabled by configuration.");
                stats.disabled += 1;
                return Ok(JobOutcome::Disabled);
            }
            Err(e) => return self.job_failed(stats, e),
        }

        let hook = |key: &str| job_conf.get(key).or_else(|| self.globals.get(key));
        if let Some(script) = hook("job_pre_exec") {
            if let Err(e) = self.run_script(script, "job pre-execution") {
                return self.job_failed(stats, e);
            }
        }

        tracing::info!("Starting execution of backup job.");
        let mut failure = match Job::new(name, &self.globals, job_conf)
            .and_then(|mut job| job.run(&self.registry, &self.command_runner))
        {
            Ok(()) => {
                tracing::info!("Finished execution of backup job.");
                None
            }
            Err(e) => {
                self.log_error(&e);
                if e.is_fatal() || self.trace {
                    stats.failed += 1;
                    return Err(e);
                }
                Some(e.kind())
            }
        };

        if let Some(script) = hook("job_post_exec") {
            if let Err(e) = self.run_script(script, "job post-execution") {
                self.log_error(&e);
                if self.trace {
                    stats.failed += 1;
                    return Err(e);
                }
                failure.get_or_insert(e.kind());
            }
        }

        match failure {
            None => {
                stats.succeeded += 1;
                Ok(JobOutcome::Succeeded)
            }
            Some(kind) => {
                stats.failed += 1;
                Ok(JobOutcome::Failed(kind))
            }
        }
    }

    fn job_failed(&self, stats: &mut RunStatistics, error: Error) -> Result<JobOutcome> {
        self.log_error(&error);
        stats.failed += 1;
        if error.is_fatal() || self.trace {
            return Err(error);
        }
        Ok(JobOutcome::Failed(error.kind()))
    }

    fn run_script(&self, script: &str, what: &str) -> Result<()> {
        tracing::info!("Executing {what} script: {script}");
        let request = ExecRequest::builder().argv(vec![script.to_owned()]).build();
        let output = self.command_runner.run(&request).map_err(|e| {
            Error::external_script(format!("Execution of {what} script {script} failed."))
                .add_details(e.to_string().lines().map(str::to_owned))
        })?;
        if !output.success() {
            return Err(Error::external_script(format!(
                "Execution of {what} script {script} failed with error code: {}.",
                output.exit_code
            ))
            .add_details(output.stderr_lines()));
        }
        tracing::info!("Finished {what} script: {script}");
        Ok(())
    }

    fn log_error(&self, error: &Error) {
        let kind = error.kind();
        if kind.is_fatal() {
            tracing::error!("FATAL: {}", kind.description());
        } else {
            tracing::error!("{}", kind.description());
        }
        for line in error.to_string().lines() {
            tracing::error!("  {line}");
        }
    }

    fn log_summary(&self, stats: &RunStatistics) {
        let _span = context_span("FINAL", self.command_runner.dry_run()).entered();
        if stats.failed > 0 {
            tracing::warn!("{stats}");
        } else {
            tracing::info!("{stats}");
        }
    }
}
