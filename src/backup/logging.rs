//! Console and log-file setup plus the context spans that tag every log line.

use crate::backup::config::GlobalSettings;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddDetails;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::subscriber::DefaultGuard;
use tracing::{Span, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub static DEFAULT_CONSOLE_LEVEL: LevelFilter = LevelFilter::WARN;
pub static DEFAULT_LOGFILE_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" | "critical" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogSettings {
    pub console: LevelFilter,
    pub file: Option<(PathBuf, LevelFilter)>,
}

impl LogSettings {
    /// Console-only logging, used before the general section is known.
    pub fn console_only(verbose: bool, debug: bool) -> Self {
        let console = if debug {
            LevelFilter::DEBUG
        } else if verbose {
            LevelFilter::INFO
        } else {
            DEFAULT_CONSOLE_LEVEL
        };
        Self {
            console,
            file: None,
        }
    }

    /// Command line switches win over the levels of the general section.
    /// No log file is written in dry-run.
    pub fn from_global(
        settings: &GlobalSettings,
        verbose: bool,
        debug: bool,
        dry_run: bool,
    ) -> Result<Self> {
        let (console, logfile) = if debug {
            (LevelFilter::DEBUG, LevelFilter::DEBUG)
        } else if verbose {
            (LevelFilter::INFO, LevelFilter::INFO)
        } else {
            (
                configured_level(settings.console_loglevel.as_deref(), "console_loglevel")?
                    .unwrap_or(DEFAULT_CONSOLE_LEVEL),
                configured_level(settings.logfile_loglevel.as_deref(), "logfile_loglevel")?
                    .unwrap_or(DEFAULT_LOGFILE_LEVEL),
            )
        };

        let file = match (&settings.backup_path, dry_run) {
            (Some(backup_path), false) => {
                Some((backup_path.join(settings.filename_logfile()), logfile))
            }
            _ => None,
        };

        Ok(Self { console, file })
    }

    pub fn init(&self) -> Result<()> {
        self.subscriber()?
            .try_init()
            .map_err(|e| Error::startup(format!("Logging setup failed: {e}")))
    }

    /// Installs the subscriber for the current thread until the guard is dropped.
    pub fn init_scoped(&self) -> Result<DefaultGuard> {
        Ok(self.subscriber()?.set_default())
    }

    fn subscriber(&self) -> Result<impl Subscriber + Send + Sync + 'static> {
        let file_layer = match &self.file {
            Some((path, level)) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        Error::fatal_environment(format!("Opening log file {:?} failed.", path))
                            .add_details(vec![e.to_string()])
                    })?;
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file))
                        .with_filter(*level),
                )
            }
            None => None,
        };

        Ok(tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(self.console))
            .with(file_layer))
    }
}

fn configured_level(value: Option<&str>, key: &str) -> Result<Option<LevelFilter>> {
    match value {
        None => Ok(None),
        Some(name) => parse_level(name).map(Some).ok_or_else(|| {
            Error::fatal_config(format!(
                "Invalid log level set in configuration file for option: {key}"
            ))
        }),
    }
}

/// Span tagging log lines with a job name or lifecycle phase (STARTUP, FINAL, ...).
///
/// Dry-run contexts are prefixed with `TEST-`.
pub fn context_span(context: &str, dry_run: bool) -> Span {
    let context = if dry_run {
        format!("TEST-{context}")
    } else {
        context.to_owned()
    };
    tracing::info_span!("ctx", context = %context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn log_in_context(context: &str, dry_run: bool) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let _span = context_span(context, dry_run).entered();
            tracing::info!("Starting execution of backup job.");
        });
        captured.text()
    }

    fn settings(console: Option<&str>, logfile: Option<&str>) -> GlobalSettings {
        GlobalSettings {
            console_loglevel: console.map(str::to_owned),
            logfile_loglevel: logfile.map(str::to_owned),
            backup_path: Some(Path::new("/var/backups/host").to_path_buf()),
            ..GlobalSettings::default()
        }
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("Critical"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level(" debug "), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("chatty"), None);
    }

    #[test]
    fn test_levels_from_general_section() {
        let log = LogSettings::from_global(&settings(Some("error"), Some("debug")), false, false, false)
            .unwrap();

        assert_eq!(log.console, LevelFilter::ERROR);
        assert_eq!(
            log.file,
            Some((Path::new("/var/backups/host/backup.log").to_path_buf(), LevelFilter::DEBUG))
        );
    }

    #[test]
    fn test_switches_override_general_section() {
        let log = LogSettings::from_global(&settings(Some("error"), None), true, false, false).unwrap();
        assert_eq!(log.console, LevelFilter::INFO);

        let log = LogSettings::from_global(&settings(Some("error"), None), true, true, false).unwrap();
        assert_eq!(log.console, LevelFilter::DEBUG);
    }

    #[test]
    fn test_invalid_level_is_fatal() {
        let error = LogSettings::from_global(&settings(Some("loud"), None), false, false, false)
            .unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("console_loglevel"));
    }

    #[test]
    fn test_no_log_file_in_dry_run() {
        let log = LogSettings::from_global(&settings(None, None), false, false, true).unwrap();
        assert_eq!(log.file, None);
        assert_eq!(log.console, DEFAULT_CONSOLE_LEVEL);
    }

    #[test]
    fn test_dry_run_lines_are_tagged() {
        let line = log_in_context("web", true);
        assert!(line.contains("context=TEST-web"), "{line}");
        assert!(line.contains("Starting execution of backup job."));

        let line = log_in_context("web", false);
        assert!(line.contains("context=web"), "{line}");
        assert!(!line.contains("TEST-"));
    }

    #[test]
    fn test_scoped_console_logging() {
        let _guard = LogSettings::console_only(false, true).init_scoped().unwrap();
        assert!(tracing::enabled!(tracing::Level::DEBUG));
    }
}
