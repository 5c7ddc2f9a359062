//! Validation functions for configuration values.
//!
//! Provides custom validation functions for job names, directories,
//! umask values and log levels.

use crate::backup::logging::parse_level;
use sanitize_filename::{is_sanitized, sanitize};
use validator::ValidationError;

use std::path::Path;

pub fn validate_job_name<S: AsRef<str>>(name: S) -> Result<(), ValidationError> {
    let name = name.as_ref();
    if name.is_empty() || name == "." || name == ".." || !is_sanitized(name) {
        return Err(ValidationError::new("InvalidJobName").with_message(
            format!(
                "Invalid job name {:?}, it must be usable as a directory name, try {:?}",
                name,
                sanitize(name)
            )
            .into(),
        ));
    }

    Ok(())
}

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

/// Returns `true` when the directory had to be created.
pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> Result<bool, ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
        return Ok(false);
    }

    std::fs::create_dir_all(dir).map_err(|e| {
        ValidationError::new("InvalidDirectory").with_message(
            format!("cannot create or access directory {:?}: {}", dir, e).into(),
        )
    })?;
    Ok(true)
}

pub fn validate_umask<S: AsRef<str>>(umask: S) -> Result<(), ValidationError> {
    let umask = umask.as_ref();
    match u32::from_str_radix(umask, 8) {
        Ok(value) if value <= 0o777 => Ok(()),
        _ => Err(ValidationError::new("InvalidUmask")
            .with_message(format!("Invalid octal umask: {umask:?}").into())),
    }
}

pub fn validate_log_level<S: AsRef<str>>(level: S) -> Result<(), ValidationError> {
    let level = level.as_ref();
    if parse_level(level).is_none() {
        return Err(ValidationError::new("InvalidLogLevel")
            .with_message(format!("Invalid log level: {level:?}").into()));
    }

    Ok(())
}
