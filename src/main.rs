use backup_runner::backup::command::CommandRunner;
use backup_runner::backup::config::{BackupConfig, Globals};
use backup_runner::backup::logging::{context_span, LogSettings};
use backup_runner::backup::plugin::registry::PluginRegistry;
use backup_runner::backup::result_error::error::{Error, ErrorKind};
use backup_runner::backup::result_error::result::Result;
use backup_runner::backup::runner::{RunStatistics, Runner};
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use tracing::error;

/// Execute configured backup jobs
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log info messages to console
    #[arg(short, long)]
    verbose: bool,

    /// Log debug messages to console and log file
    #[arg(short, long)]
    debug: bool,

    /// Stop on every error instead of continuing with the next job
    #[arg(short, long)]
    trace: bool,

    /// Execute all configured backup jobs
    #[arg(short, long, conflicts_with = "jobs")]
    all: bool,

    /// Simulate the run without writing backups
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// List available plugins
    #[arg(long)]
    list_plugins: bool,

    /// List the backup methods of a plugin
    #[arg(long, value_name = "PLUGIN")]
    list_methods: Option<String>,

    /// Describe the options of a backup method
    #[arg(long, value_name = "METHOD")]
    describe_method: Option<String>,

    /// Backup jobs to execute
    jobs: Vec<String>,
}

impl Args {
    fn is_listing(&self) -> bool {
        self.list_plugins || self.list_methods.is_some() || self.describe_method.is_some()
    }
}

enum Outcome {
    Listed,
    Finished(RunStatistics),
    /// Run stopped by an error the runner already logged.
    Aborted,
}

fn main() {
    let args = Args::parse();

    match execute(&args) {
        Ok(Outcome::Listed) => exit(0),
        Ok(Outcome::Finished(stats)) if stats.failed() == 0 => exit(0),
        Ok(Outcome::Finished(_)) | Ok(Outcome::Aborted) => exit(1),
        Err(e) => {
            // Fails when the run already set up logging, which is fine.
            let _ = LogSettings::console_only(args.verbose, args.debug).init();
            let _span = context_span("STARTUP", args.dry_run).entered();
            error!("{}", e.kind().description());
            for line in e.to_string().lines() {
                error!("  {line}");
            }
            exit(1);
        }
    }
}

fn execute(args: &Args) -> Result<Outcome> {
    let (config, registry, globals) = {
        // Console only until the general section tells where the log file goes.
        let _logging = LogSettings::console_only(args.verbose, args.debug).init_scoped()?;
        let _span = context_span("STARTUP", args.dry_run).entered();

        let config = BackupConfig::load(args.config.as_deref())?;
        let registry = PluginRegistry::with_plugins(config.plugins().as_ref())?;

        if args.is_listing() {
            list(args, &registry)?;
            return Ok(Outcome::Listed);
        }
        if !args.all && args.jobs.is_empty() {
            return Err(Error::startup("No backup job selected for execution."));
        }

        let globals = Globals::init(config.global(), args.dry_run)?;
        (config, registry, globals)
    };
    let jobs = (!args.all).then(|| args.jobs.clone());

    LogSettings::from_global(globals.settings(), args.verbose, args.debug, args.dry_run)?
        .init()?;
    {
        let _span = context_span("STARTUP", args.dry_run).entered();
        if args.dry_run {
            tracing::info!("Dry-run, backups are simulated only.");
        }
        tracing::info!("Backup path: {:?}", globals.settings().backup_path);
    }

    let runner = Runner::builder()
        .globals(globals.config().clone())
        .config(config)
        .registry(registry)
        .command_runner(CommandRunner::new(args.dry_run))
        .trace(args.trace)
        .build();
    match runner.run(jobs.as_deref()) {
        Ok(stats) => Ok(Outcome::Finished(stats)),
        Err(e) if e.kind() == ErrorKind::Startup => Err(e),
        Err(_) => Ok(Outcome::Aborted),
    }
}

fn list(args: &Args, registry: &PluginRegistry) -> Result<()> {
    if args.list_plugins {
        for (name, description) in registry.list_plugins() {
            println!("{name}: {description}");
        }
    }
    if let Some(plugin) = &args.list_methods {
        let methods = registry.list_methods(Some(plugin.as_str()));
        if methods.is_empty() {
            return Err(Error::startup(format!("Plugin {plugin} not loaded.")));
        }
        for method in methods {
            println!("{method}");
        }
    }
    if let Some(method) = &args.describe_method {
        let text = registry
            .describe_method(method)
            .ok_or_else(|| Error::startup(format!("Backup method {method} not registered.")))?;
        print!("{text}");
    }
    Ok(())
}
