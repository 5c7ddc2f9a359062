//! Backups of directory trees into compressed tar archives.

use crate::backup::command::{CommandRunner, ExecRequest};
use crate::backup::plugin::registry::{
    BackupHandler, EntryPoint, HandlerType, MethodDecl, PluginModule,
};
use crate::backup::plugin::schema::{HandlerConfig, HandlerSchema, OptionDecl};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::path::Path;

pub struct ArchivePlugin;

impl PluginModule for ArchivePlugin {
    fn name(&self) -> &'static str {
        "archive"
    }

    fn description(&self) -> &'static str {
        "Plugin for backups using tar archives."
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![MethodDecl {
            method: "archive",
            handler: HandlerType::of::<PluginArchive>(),
            entry_point: "backup_dirs",
        }]
    }
}

const ARCHIVE_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        OptionDecl::new("filename_archive", "Filename for archive file. (Without extension.)"),
        OptionDecl::new("path_list", "List of paths to be included in the backup."),
        OptionDecl::new(
            "base_dir",
            "Base directory for list of paths to be included in the backup. \
             (Absolute paths are used by default.)",
        ),
        OptionDecl::new("backup_index", "Enable / disable index file. (Enabled by default.)"),
        OptionDecl::new(
            "exclude_patterns",
            "List of filename patterns to exclude from the backup.",
        ),
        OptionDecl::new(
            "exclude_patterns_file",
            "Path for file that stores list of filename patterns to exclude from the backup.",
        ),
    ],
    required: &["filename_archive", "path_list"],
    defaults: &[("backup_index", "yes"), ("suffix_index", "list")],
};

#[derive(Debug)]
pub struct PluginArchive {
    conf: HandlerConfig,
}

impl BackupHandler for PluginArchive {
    const SCHEMA: &'static HandlerSchema = &ARCHIVE_SCHEMA;
    const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[EntryPoint {
        name: "backup_dirs",
        run: PluginArchive::backup_dirs,
    }];

    fn from_config(conf: HandlerConfig) -> Result<Self> {
        Ok(Self { conf })
    }
}

impl PluginArchive {
    fn backup_dirs(&mut self, runner: &CommandRunner) -> Result<()> {
        let conf = &self.conf;
        let job_path = conf.job_path()?;
        let filename = conf.require("filename_archive")?;
        let archive_path = job_path.join(format!("{}.{}", filename, conf.require("suffix_tgz")?));
        let index_path = job_path.join(format!("{}.{}", filename, conf.require("suffix_index")?));
        let backup_index = conf.flag("backup_index", true)?;
        let base_dir = conf.get("base_dir");
        let path_list = conf.path_list("path_list")?;

        tracing::info!("Starting backup of paths: {}", path_list.join(", "));
        let mut args = vec![conf.require("cmd_tar")?.to_owned()];
        if let Some(base_dir) = base_dir {
            if !Path::new(base_dir).is_dir() {
                return Err(Error::config(format!(
                    "Invalid base directory (base_dir): {base_dir}"
                )));
            }
            args.extend(["-C".to_owned(), base_dir.to_owned()]);
        }
        if backup_index {
            args.push("-v".to_owned());
        }
        exclude_args(conf, &mut args)?;
        args.extend(["-zcf".to_owned(), archive_path.to_string_lossy().into_owned()]);
        check_src_paths(&path_list, base_dir.unwrap_or("/"))?;
        args.extend(path_list.iter().cloned());

        let request = ExecRequest::builder()
            .argv(args)
            .maybe_out_path(backup_index.then_some(index_path))
            .build();
        runner.run(&request)?.check("Backup of paths")?;
        tracing::info!("Finished backup of paths: {}", path_list.join(", "));
        Ok(())
    }
}

/// `--exclude` arguments shared by tar and rsync.
pub(crate) fn exclude_args(conf: &HandlerConfig, args: &mut Vec<String>) -> Result<()> {
    if let Some(patterns) = conf.list("exclude_patterns") {
        args.extend(patterns.iter().map(|p| format!("--exclude={p}")));
    }
    if let Some(file) = conf.get("exclude_patterns_file") {
        if !Path::new(file).is_file() {
            return Err(Error::config(format!("Invalid exclude patterns file: {file}")));
        }
        args.push(format!("--exclude-from={file}"));
    }
    Ok(())
}

fn check_src_paths(path_list: &[String], base_dir: &str) -> Result<()> {
    match path_list
        .iter()
        .find(|path| !Path::new(base_dir).join(path).exists())
    {
        Some(path) => Err(Error::config(format!("Invalid source path: {path}"))),
        None => Ok(()),
    }
}
