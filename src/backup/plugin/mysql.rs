//! MySQL dumps with `mysqldump`, one container and one data dump per database.

use crate::backup::command::{CommandRunner, ExecRequest};
use crate::backup::plugin::registry::{
    BackupHandler, EntryPoint, HandlerType, MethodDecl, PluginModule,
};
use crate::backup::plugin::schema::{HandlerConfig, HandlerSchema, OptionDecl};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDetails, AddMsg};
use derive_more::Display;
use std::collections::BTreeMap;

pub struct MySqlPlugin;

impl PluginModule for MySqlPlugin {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn description(&self) -> &'static str {
        "Plugin for backups of MySQL Database."
    }

    fn methods(&self) -> Vec<MethodDecl> {
        let handler = HandlerType::of::<PluginMySql>();
        vec![
            MethodDecl {
                method: "mysql_dump_full",
                handler,
                entry_point: "dump_full",
            },
            MethodDecl {
                method: "mysql_dump_databases",
                handler,
                entry_point: "dump_databases",
            },
        ]
    }
}

const MYSQL_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        OptionDecl::new("filename_dump_db", "Filename prefix for MySQL dump files."),
        OptionDecl::new("db_host", "MySQL Database Server Name or IP."),
        OptionDecl::new("db_port", "MySQL Database Server Port."),
        OptionDecl::new("db_user", "MySQL Database Server User."),
        OptionDecl::new("db_password", "MySQL Database Server Password."),
        OptionDecl::new("db_list", "List of databases. (All databases by default.)"),
        OptionDecl::new("cmd_mysqldump", "Command for dumping MySQL databases."),
        OptionDecl::new("cmd_mysql", "Command for querying the MySQL Database Server."),
    ],
    required: &[],
    defaults: &[
        ("cmd_mysqldump", "mysqldump"),
        ("cmd_mysql", "mysql"),
        ("filename_dump_db", "mysql_dump"),
    ],
};

static EXCLUDED_DATABASES: [&str; 1] = ["performance_schema"];
static NO_LOCK_DATABASES: [&str; 2] = ["information_schema", "mysql"];

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
enum DumpKind {
    /// Database definition without tables.
    #[display("db")]
    Container,
    #[display("data")]
    Data,
}

impl DumpKind {
    fn description(self) -> &'static str {
        match self {
            DumpKind::Container => "MySQL Database Container",
            DumpKind::Data => "MySQL Database Contents",
        }
    }
}

#[derive(Debug)]
pub struct PluginMySql {
    conf: HandlerConfig,
    conn_args: Vec<String>,
    env: BTreeMap<String, RedactedString>,
}

impl BackupHandler for PluginMySql {
    const SCHEMA: &'static HandlerSchema = &MYSQL_SCHEMA;
    const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[
        EntryPoint {
            name: "dump_full",
            run: PluginMySql::dump_full,
        },
        EntryPoint {
            name: "dump_databases",
            run: PluginMySql::dump_databases,
        },
    ];

    fn from_config(conf: HandlerConfig) -> Result<Self> {
        let conn_args = [("-h", "db_host"), ("-P", "db_port"), ("-u", "db_user")]
            .iter()
            .filter_map(|(opt, key)| conf.get(key).map(|v| [opt.to_string(), v.to_owned()]))
            .flatten()
            .collect();
        let mut env = BTreeMap::new();
        if let Some(password) = conf.get("db_password") {
            env.insert("MYSQL_PWD".to_owned(), RedactedString::from(password));
        }
        Ok(Self {
            conf,
            conn_args,
            env,
        })
    }
}

impl PluginMySql {
    fn dump_database(&self, runner: &CommandRunner, db: &str, kind: DumpKind) -> Result<()> {
        let dump_path = self.conf.job_path()?.join(format!(
            "{}_{}_{}.dump.{}",
            self.conf.require("filename_dump_db")?,
            db,
            kind,
            self.conf.require("suffix_compress")?
        ));
        let mut args = vec![self.conf.require("cmd_mysqldump")?.to_owned()];
        args.extend(self.conn_args.iter().cloned());
        if NO_LOCK_DATABASES.contains(&db) {
            args.push("--skip-lock-tables".to_owned());
        }
        if kind == DumpKind::Container {
            args.extend(
                ["--no-create-info", "--no-data", "--databases"].map(str::to_owned),
            );
        }
        args.push(db.to_owned());

        let description = kind.description();
        tracing::info!("Starting dump of {description}: {db} Backup: {:?}", dump_path);
        let request = ExecRequest::builder()
            .argv(args)
            .env(self.env.clone())
            .out_path(&dump_path)
            .compressor(self.conf.compressor()?)
            .build();
        runner
            .run(&request)?
            .check(format!("Dump of {description} for {db}"))?;
        tracing::info!("Finished dump of {description}: {db} Backup: {:?}", dump_path);
        Ok(())
    }

    fn databases(&self, runner: &CommandRunner) -> Result<Vec<String>> {
        let databases = match self.conf.list("db_list") {
            Some(list) => list,
            None => {
                let mut args = vec![self.conf.require("cmd_mysql")?.to_owned()];
                args.extend(self.conn_args.iter().cloned());
                args.extend(["-N", "-B", "-e", "SHOW DATABASES"].map(str::to_owned));
                let request = ExecRequest::builder()
                    .argv(args)
                    .env(self.env.clone())
                    .force_exec(true)
                    .build();
                runner
                    .run(&request)
                    .and_then(|output| output.check("Query of database list"))
                    .map_err(|e| {
                        Error::backup("Connection to MySQL Server for querying database list failed.")
                            .add_details(e.to_string().lines().map(str::to_owned))
                    })?
                    .stdout_lines()
                    .iter()
                    .map(|line| line.trim().to_owned())
                    .collect()
            }
        };
        Ok(databases
            .into_iter()
            .filter(|db| !EXCLUDED_DATABASES.contains(&db.as_str()))
            .collect())
    }

    fn dump_databases(&mut self, runner: &CommandRunner) -> Result<()> {
        let databases = self.databases(runner)?;
        tracing::info!("Starting dump of {} MySQL Databases.", databases.len());
        for db in &databases {
            for kind in [DumpKind::Container, DumpKind::Data] {
                self.dump_database(runner, db, kind)
                    .add_msg(format!("Backup of MySQL database {db} failed"))?;
            }
        }
        tracing::info!("Finished dump of MySQL Databases.");
        Ok(())
    }

    fn dump_full(&mut self, runner: &CommandRunner) -> Result<()> {
        self.dump_databases(runner)
    }
}
