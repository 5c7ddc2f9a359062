//! # backup_runner
//!
//! Runs configured backup jobs by invoking external dump tools, archivers
//! and file synchronizers, optionally compressing their output.
//!
//! ## Features
//!
//! - **Backup Methods**: tar archives, PostgreSQL and MySQL dumps, rsync
//! - **Plugins**: methods grouped in plugins, enabled per configuration file
//! - **Compression**: dump output piped through any compressor command
//! - **Hooks**: global and per-job pre/post execution scripts
//! - **Dry-run**: complete rehearsal of a run without writing backups
//! - **Failure Isolation**: a failing job never stops the others unless the
//!   failure affects the whole run
//!
//! ## Quick Start
//!
//! ```no_run
//! use backup_runner::backup::command::CommandRunner;
//! use backup_runner::backup::config::{BackupConfig, Globals};
//! use backup_runner::backup::plugin::registry::PluginRegistry;
//! use backup_runner::backup::runner::Runner;
//!
//! let config = BackupConfig::load(None)?;
//! let globals = Globals::init(config.global(), false)?;
//! let registry = PluginRegistry::with_plugins(config.plugins().as_ref())?;
//!
//! let runner = Runner::builder()
//!     .globals(globals.config().clone())
//!     .config(config)
//!     .registry(registry)
//!     .command_runner(CommandRunner::new(false))
//!     .build();
//! let stats = runner.run(None)?;
//! println!("{stats}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
