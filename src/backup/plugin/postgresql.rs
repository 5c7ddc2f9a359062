//! PostgreSQL dumps with `pg_dumpall` and `pg_dump`.

use crate::backup::command::{CommandRunner, ExecRequest};
use crate::backup::plugin::registry::{
    BackupHandler, EntryPoint, HandlerType, MethodDecl, PluginModule,
};
use crate::backup::plugin::schema::{HandlerConfig, HandlerSchema, OptionDecl};
use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddDetails, AddMsg};
use std::collections::BTreeMap;

pub struct PostgreSqlPlugin;

impl PluginModule for PostgreSqlPlugin {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn description(&self) -> &'static str {
        "Plugin for backups of PostgreSQL Database."
    }

    fn methods(&self) -> Vec<MethodDecl> {
        let handler = HandlerType::of::<PluginPostgreSql>();
        vec![
            MethodDecl {
                method: "pg_dump_full",
                handler,
                entry_point: "dump_full",
            },
            MethodDecl {
                method: "pg_dump_globals",
                handler,
                entry_point: "dump_globals",
            },
            MethodDecl {
                method: "pg_dump_databases",
                handler,
                entry_point: "dump_databases",
            },
        ]
    }
}

const POSTGRESQL_SCHEMA: HandlerSchema = HandlerSchema {
    options: &[
        OptionDecl::new("filename_dump_globals", "Filename for dump of global objects."),
        OptionDecl::new("filename_dump_db", "Filename prefix for database dumps."),
        OptionDecl::new("db_host", "PostgreSQL Database Server Name or IP."),
        OptionDecl::new("db_port", "PostgreSQL Database Server Port."),
        OptionDecl::new("db_user", "PostgreSQL Database Server User."),
        OptionDecl::new("db_password", "PostgreSQL Database Server Password."),
        OptionDecl::new("db_database", "PostgreSQL Database for initial connection."),
        OptionDecl::new("db_list", "List of databases. (All databases by default.)"),
        OptionDecl::new("cmd_pg_dump", "Command for dumping PostgreSQL databases."),
        OptionDecl::new("cmd_pg_dumpall", "Command for dumping PostgreSQL global objects."),
        OptionDecl::new("cmd_psql", "Command for querying the PostgreSQL Database Server."),
    ],
    required: &[],
    defaults: &[
        ("cmd_pg_dump", "pg_dump"),
        ("cmd_pg_dumpall", "pg_dumpall"),
        ("cmd_psql", "psql"),
        ("filename_dump_globals", "pg_dump_globals"),
        ("filename_dump_db", "pg_dump_db"),
    ],
};

/// Databases that cannot be connected to and are never dumped.
static EXCLUDED_DATABASES: [&str; 1] = ["template0"];

#[derive(Debug)]
pub struct PluginPostgreSql {
    conf: HandlerConfig,
    conn_args: Vec<String>,
    env: BTreeMap<String, RedactedString>,
}

impl BackupHandler for PluginPostgreSql {
    const SCHEMA: &'static HandlerSchema = &POSTGRESQL_SCHEMA;
    const ENTRY_POINTS: &'static [EntryPoint<Self>] = &[
        EntryPoint {
            name: "dump_full",
            run: PluginPostgreSql::dump_full,
        },
        EntryPoint {
            name: "dump_globals",
            run: PluginPostgreSql::dump_globals,
        },
        EntryPoint {
            name: "dump_databases",
            run: PluginPostgreSql::dump_databases,
        },
    ];

    fn from_config(conf: HandlerConfig) -> Result<Self> {
        let conn_args = [("-h", "db_host"), ("-p", "db_port"), ("-U", "db_user")]
            .iter()
            .filter_map(|(opt, key)| conf.get(key).map(|v| [opt.to_string(), v.to_owned()]))
            .flatten()
            .collect();
        let mut env = BTreeMap::new();
        if let Some(password) = conf.get("db_password") {
            env.insert("PGPASSWORD".to_owned(), RedactedString::from(password));
        }
        Ok(Self {
            conf,
            conn_args,
            env,
        })
    }
}

impl PluginPostgreSql {
    fn dump_globals(&mut self, runner: &CommandRunner) -> Result<()> {
        let dump_path = self.conf.job_path()?.join(format!(
            "{}.{}",
            self.conf.require("filename_dump_globals")?,
            self.conf.require("suffix_compress")?
        ));
        let mut args = vec![
            self.conf.require("cmd_pg_dumpall")?.to_owned(),
            "-w".to_owned(),
            "-g".to_owned(),
        ];
        args.extend(self.conn_args.iter().cloned());
        if let Some(database) = self.conf.get("db_database") {
            args.extend(["-l".to_owned(), database.to_owned()]);
        }

        tracing::info!("Starting PostgreSQL Global Objects dump. Backup: {:?}", dump_path);
        let request = ExecRequest::builder()
            .argv(args)
            .env(self.env.clone())
            .out_path(&dump_path)
            .compressor(self.conf.compressor()?)
            .build();
        runner.run(&request)?.check("Dump of PostgreSQL Global Objects")?;
        tracing::info!("Finished PostgreSQL Global Objects dump. Backup: {:?}", dump_path);
        Ok(())
    }

    fn dump_database(&self, runner: &CommandRunner, db: &str) -> Result<()> {
        let dump_path = self.conf.job_path()?.join(format!(
            "{}_{}.dump",
            self.conf.require("filename_dump_db")?,
            db
        ));
        let mut args = vec![
            self.conf.require("cmd_pg_dump")?.to_owned(),
            "-w".to_owned(),
            "-Fc".to_owned(),
        ];
        args.extend(self.conn_args.iter().cloned());
        args.extend([
            "-f".to_owned(),
            dump_path.to_string_lossy().into_owned(),
            db.to_owned(),
        ]);

        tracing::info!("Starting dump of PostgreSQL Database: {db} Backup: {:?}", dump_path);
        let request = ExecRequest::builder()
            .argv(args)
            .env(self.env.clone())
            .build();
        runner
            .run(&request)?
            .check(format!("Dump of PostgreSQL database {db}"))?;
        tracing::info!("Finished dump of PostgreSQL Database: {db} Backup: {:?}", dump_path);
        Ok(())
    }

    /// Databases of `db_list`, or every database of the server.
    fn databases(&self, runner: &CommandRunner) -> Result<Vec<String>> {
        let databases = match self.conf.list("db_list") {
            Some(list) => list,
            None => {
                let mut args = vec![
                    self.conf.require("cmd_psql")?.to_owned(),
                    "-w".to_owned(),
                    "-A".to_owned(),
                    "-t".to_owned(),
                    "-c".to_owned(),
                    "SELECT datname FROM pg_database".to_owned(),
                ];
                args.extend(self.conn_args.iter().cloned());
                if let Some(database) = self.conf.get("db_database") {
                    args.extend(["-d".to_owned(), database.to_owned()]);
                }
                let request = ExecRequest::builder()
                    .argv(args)
                    .env(self.env.clone())
                    .force_exec(true)
                    .build();
                runner
                    .run(&request)
                    .and_then(|output| output.check("Query of database list"))
                    .map_err(|e| {
                        Error::backup(
                            "Connection to PostgreSQL Server for querying database list failed.",
                        )
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
        tracing::info!("Starting dump of {} PostgreSQL Databases.", databases.len());
        for db in &databases {
            self.dump_database(runner, db)
                .add_msg(format!("Backup of PostgreSQL database {db} failed"))?;
        }
        tracing::info!("Finished dump of PostgreSQL Databases.");
        Ok(())
    }

    fn dump_full(&mut self, runner: &CommandRunner) -> Result<()> {
        self.dump_globals(runner)?;
        self.dump_databases(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::config::ConfigMap;
    use crate::backup::result_error::error::ErrorKind;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Writes an executable shell script standing in for a client tool.
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        temp_dir: TempDir,
        global: ConfigMap,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let dir = temp_dir.path();
            let log = dir.join("calls.log");
            let dumpall = fake_tool(
                dir,
                "pg_dumpall",
                &format!("echo \"dumpall $* $PGPASSWORD\" >> {log:?}; echo 'CREATE ROLE x;'"),
            );
            let dump = fake_tool(
                dir,
                "pg_dump",
                &format!("echo \"dump $*\" >> {log:?}; while [ \"$1\" != -f ]; do shift; done; echo data > \"$2\""),
            );
            let psql = fake_tool(
                dir,
                "psql",
                "printf 'postgres\\ntemplate0\\ntemplate1\\nsales\\n'",
            );
            let global = map(&[
                ("cmd_compress", "gzip"),
                ("suffix_compress", "gz"),
                ("cmd_pg_dumpall", dumpall.to_str().unwrap()),
                ("cmd_pg_dump", dump.to_str().unwrap()),
                ("cmd_psql", psql.to_str().unwrap()),
                ("job_path", dir.to_str().unwrap()),
            ]);
            Self { temp_dir, global }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.temp_dir.path().join(name)
        }

        fn calls(&self) -> String {
            fs::read_to_string(self.path("calls.log")).unwrap_or_default()
        }

        fn handler(&self, job: &[(&str, &str)]) -> PluginPostgreSql {
            let conf = HandlerConfig::build(&POSTGRESQL_SCHEMA, &self.global, &map(job)).unwrap();
            PluginPostgreSql::from_config(conf).unwrap()
        }
    }

    #[test]
    fn test_dump_globals_is_compressed() {
        let f = Fixture::new();
        let mut handler = f.handler(&[("db_host", "db1"), ("db_password", "pw"), ("db_database", "postgres")]);

        handler.dump_globals(&CommandRunner::new(false)).unwrap();

        let dump = fs::read(f.path("pg_dump_globals.gz")).unwrap();
        assert_eq!(&dump[..2], &[0x1f, 0x8b]);
        assert!(f.calls().contains("dumpall -w -g -h db1 -l postgres pw"));
    }

    #[test]
    fn test_dump_enumerated_databases() {
        let f = Fixture::new();
        let mut handler = f.handler(&[("db_user", "backup")]);

        handler.dump_databases(&CommandRunner::new(false)).unwrap();

        let calls = f.calls();
        assert!(!calls.contains("template0"));
        for db in ["postgres", "template1", "sales"] {
            assert!(f.path(&format!("pg_dump_db_{db}.dump")).is_file());
        }
        assert!(calls.contains("dump -w -Fc -U backup -f"));
    }

    #[test]
    fn test_tool_commands_set_in_job_section() {
        let f = Fixture::new();
        let psql = fake_tool(f.temp_dir.path(), "psql_hr", "echo hr");
        let mut handler = f.handler(&[("cmd_psql", psql.to_str().unwrap())]);

        handler.dump_databases(&CommandRunner::new(false)).unwrap();

        assert!(f.path("pg_dump_db_hr.dump").is_file());
        assert!(!f.path("pg_dump_db_sales.dump").exists());
    }

    #[test]
    fn test_dump_database_list() {
        let f = Fixture::new();
        let mut handler = f.handler(&[("db_list", "sales, template0")]);

        handler.dump_full(&CommandRunner::new(false)).unwrap();

        assert!(f.path("pg_dump_globals.gz").is_file());
        assert!(f.path("pg_dump_db_sales.dump").is_file());
        assert!(!f.path("pg_dump_db_postgres.dump").exists());
        assert!(!f.path("pg_dump_db_template0.dump").exists());
    }

    #[test]
    fn test_dry_run_only_queries_database_list() {
        let f = Fixture::new();
        let mut handler = f.handler(&[]);

        handler.dump_full(&CommandRunner::new(true)).unwrap();

        assert_eq!(f.calls(), "");
        assert!(!f.path("pg_dump_globals.gz").exists());
    }

    #[test]
    fn test_failed_database_query() {
        let mut f = Fixture::new();
        let psql = fake_tool(f.temp_dir.path(), "psql_down", "echo 'connection refused' >&2; exit 2");
        f.global
            .insert("cmd_psql".to_string(), psql.to_string_lossy().into_owned());
        let mut handler = f.handler(&[]);

        let error = handler.dump_databases(&CommandRunner::new(false)).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Backup);
        assert!(error.details().iter().any(|l| l.contains("connection refused")));
    }

    #[test]
    fn test_password_is_not_in_argv_or_debug() {
        let f = Fixture::new();
        let handler = f.handler(&[("db_password", "hunter22")]);

        assert!(!handler.conn_args.iter().any(|a| a.contains("hunter22")));
        assert!(!format!("{:?}", handler).contains("hunter22"));
    }
}
