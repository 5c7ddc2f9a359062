//! Directory synchronisation with rsync, from local or remote sources.
//!
//! rsync always runs, in dry-run mode with its own `-n` switch, so paths and
//! connectivity are checked without transferring data.

use crate::backup::command::{CommandRunner, ExecRequest};
use crate::backup::plugin::archive::exclude_args;
use crate::backup::plugin::registry::{
    BackupHandler, EntryPoint, HandlerType, MethodDecl, PluginModule,
};
use crate::backup::plugin::schema::{normalize_path, HandlerConfig, HandlerSchema, OptionDecl};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::validate::validate_dir_exist;
use std::path::{Path, PathBuf};

pub struct RsyncPlugin;

impl PluginModule for RsyncPlugin {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn description(&self) -> &'static str {
        "Plugin for backups using rsync."
    }

    fn methods(&self) -> Vec<MethodDecl> {
        vec![
            MethodDecl {
                method: "rsync_dirs",
                handler: HandlerType::of::<PluginRsync>(),
                entry_point: "sync_dirs",
            },
            MethodDecl {
                method: "rsync_backupdir",
                handler: HandlerType::of::<PluginBackupSync>(),
                entry_point: "sync_dirs",
            },
        ]
    }
}

const REMOTE_HOST: OptionDecl =
    OptionDecl::new("remote_host", "The remote host for backup. (Local host by default.)");
const REMOTE_USER: OptionDecl = OptionDecl::new(
    "remote_user",
    "User for connecting to remote host. (Same as user executing backup by default.)",
);
const BACKUP_INDEX: OptionDecl =
    OptionDecl::new("backup_index", "Enable / disable index file. (Enabled by default.)");
const COMPRESS: OptionDecl = OptionDecl::new(
    "compress",
    "Enable / disable compression of file data for network transfer. (Enabled by default.)",
);
const DELETE: OptionDecl = OptionDecl::new(
    "delete",
    "Enable / disable deletion of files from destination path. (Disabled by default.)",
);
const EXCLUDE_PATTERNS: OptionDecl = OptionDecl::new(
    "exclude_patterns",
    "List of filename patterns to exclude from the backup.",
);
const EXCLUDE_PATTERNS_FILE: OptionDecl = OptionDecl::new(
    "exclude_patterns_file",
    "Path for file that stores list of filename patterns to exclude from the backup.",
);
const FILENAME_INDEX: OptionDecl =
    OptionDecl::new("filename_index", "Filename for index of synchronized files.");
const CMD_RSYNC: OptionDecl = OptionDecl::new("cmd_rsync", "Command for file synchronization.");

const RSYNC_DEFAULTS: &[(&str, &str)] = &[
    ("cmd_rsync", "rsync"),
    ("filename_index", "rsync"),
    ("suffix_index", "list"),
];

const RSYNC_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        REMOTE_HOST,
        REMOTE_USER,
        OptionDecl::new("path_list", "List of paths to be included in the backup."),
        OptionDecl::new(
            "base_dir",
            "Base directory for list of paths to be included in the backup. \
             (Absolute paths are used by default.)",
        ),
        OptionDecl::new(
            "dst_dir",
            "Destination directory for files. (The job directory is used by default.)",
        ),
        BACKUP_INDEX,
        COMPRESS,
        DELETE,
        EXCLUDE_PATTERNS,
        EXCLUDE_PATTERNS_FILE,
        FILENAME_INDEX,
        CMD_RSYNC,
    ],
    required: &["path_list"],
    defaults: RSYNC_DEFAULTS,
};

const BACKUP_SYNC_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        REMOTE_HOST,
        REMOTE_USER,
        OptionDecl::new(
            "remote_backup_root",
            "Backup root directory of remote host. (Same as local backup_root by default.)",
        ),
        OptionDecl::new(
            "dst_dir",
            "Destination directory for files. (Backup root directory is used by default.)",
        ),
        BACKUP_INDEX,
        COMPRESS,
        DELETE,
        EXCLUDE_PATTERNS,
        EXCLUDE_PATTERNS_FILE,
        FILENAME_INDEX,
        CMD_RSYNC,
    ],
    required: &["remote_host"],
    defaults: RSYNC_DEFAULTS,
};

/// Synchronises `path_list` into the job directory or `dst_dir`.
#[derive(Debug)]
pub struct PluginRsync {
    conf: HandlerConfig,
    /// `[user@]host` of the remote side.
    remote: Option<String>,
    index_path: PathBuf,
}

impl BackupHandler for PluginRsync {
    const SCHEMA: &'static HandlerSchema = &RSYNC_SCHEMA;
    const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[EntryPoint {
        name: "sync_dirs",
        run: PluginRsync::sync_dirs,
    }];

    fn from_config(conf: HandlerConfig) -> Result<Self> {
        let index_path = conf.job_path()?.join(format!(
            "{}.{}",
            conf.require("filename_index")?,
            conf.require("suffix_index")?
        ));
        let remote = conf.get("remote_host").map(|host| match conf.get("remote_user") {
            Some(user) => format!("{user}@{host}"),
            None => host.to_owned(),
        });
        Ok(Self {
            conf,
            remote,
            index_path,
        })
    }
}

impl PluginRsync {
    /// Source arguments; only the first remote source names the host.
    fn sources(&self, path_list: &[String], base_dir: Option<&str>) -> Vec<String> {
        path_list
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let src = match base_dir {
                    Some(base_dir) => format!("{}/./{}", base_dir.trim_end_matches('/'), path),
                    None => path.clone(),
                };
                match (&self.remote, i) {
                    (Some(remote), 0) => format!("{remote}:{src}"),
                    (Some(_), _) => format!(":{src}"),
                    (None, _) => src,
                }
            })
            .collect()
    }

    fn destination(&self) -> Result<String> {
        match self.conf.get("dst_dir") {
            Some(dst_dir) => {
                validate_dir_exist(dst_dir).map_err(|_| {
                    Error::config(format!(
                        "Destination directory (dst_dir: {dst_dir}) does not exist."
                    ))
                })?;
                Ok(normalize_path(dst_dir))
            }
            None => {
                let host = self.conf.get("remote_host").unwrap_or("localhost");
                Ok(self.conf.job_path()?.join(host).to_string_lossy().into_owned())
            }
        }
    }

    fn sync(&self, runner: &CommandRunner, path_list: &[String], sources: Vec<String>) -> Result<()> {
        let compress = self.conf.flag("compress", true)?;
        let delete = self.conf.flag("delete", false)?;
        let backup_index = self.conf.flag("backup_index", true)?;

        tracing::info!("Starting backup of paths: {}", path_list.join(", "));
        let mut args = vec![self.conf.require("cmd_rsync")?.to_owned()];
        if runner.dry_run() {
            args.push("-n".to_owned());
        }
        args.push("-aR".to_owned());
        if compress {
            args.push("-z".to_owned());
        }
        if backup_index {
            args.extend(["-v".to_owned(), "--stats".to_owned()]);
        }
        if delete {
            args.push("--delete".to_owned());
        }
        exclude_args(&self.conf, &mut args)?;
        if sources.is_empty() {
            return Err(Error::config("No valid source paths defined for backup."));
        }
        args.extend(sources);
        args.push(self.destination()?);

        let request = ExecRequest::builder()
            .argv(args)
            .maybe_out_path(backup_index.then(|| self.index_path.clone()))
            .force_exec(true)
            .build();
        runner.run(&request)?.check("Backup of paths")?;
        tracing::info!("Finished backup of paths: {}", path_list.join(", "));
        Ok(())
    }

    fn sync_dirs(&mut self, runner: &CommandRunner) -> Result<()> {
        let path_list = self.conf.path_list("path_list")?;
        let sources = self.sources(&path_list, self.conf.get("base_dir"));
        self.sync(runner, &path_list, sources)
    }
}

/// Pulls the backup root of a remote host into the local backup root.
#[derive(Debug)]
pub struct PluginBackupSync {
    inner: PluginRsync,
}

impl BackupHandler for PluginBackupSync {
    const SCHEMA: &'static HandlerSchema = &BACKUP_SYNC_SCHEMA;
    const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[EntryPoint {
        name: "sync_dirs",
        run: PluginBackupSync::sync_dirs,
    }];

    fn from_config(mut conf: HandlerConfig) -> Result<Self> {
        let backup_root = conf
            .get("backup_root")
            .map(str::to_owned)
            .ok_or_else(|| Error::config("Backup root directory (backup_root) not defined."))?;
        conf.set_default("dst_dir", backup_root.clone());
        conf.set_default("remote_backup_root", backup_root);
        Ok(Self {
            inner: PluginRsync::from_config(conf)?,
        })
    }
}

impl PluginBackupSync {
    fn sync_dirs(&mut self, runner: &CommandRunner) -> Result<()> {
        let remote_root = self.inner.conf.require("remote_backup_root")?.to_owned();
        let src = Path::new(&remote_root).join(".").join("*");
        let src = src.to_string_lossy();
        let sources = match &self.inner.remote {
            Some(remote) => vec![format!("{remote}:{src}")],
            None => vec![src.into_owned()],
        };
        self.inner.sync(runner, &[remote_root], sources)
    }
}
