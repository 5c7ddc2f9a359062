use crate::backup::result_error::{AddDetails, AddFunctionName, AddMsg};
use derive_more::Display;
use std::fmt::Debug;
use thiserror::Error;
use thiserror_ext::Construct;

/// Severity class of an [`Error`].
///
/// The runner uses the class to decide whether a failure only fails the
/// current job or aborts the whole run.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Startup,
    Config,
    FatalConfig,
    Environment,
    FatalEnvironment,
    Command,
    ExternalScript,
    FileCreate,
    BadPlugin,
    Backup,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Startup
                | ErrorKind::FatalConfig
                | ErrorKind::FatalEnvironment
                | ErrorKind::BadPlugin
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::Startup => "Fatal error on startup.",
            ErrorKind::Config => "Configuration error in backup job.",
            ErrorKind::FatalConfig => "Fatal configuration error in backup job.",
            ErrorKind::Environment => "Error in backup job environment.",
            ErrorKind::FatalEnvironment => "Fatal error in backup job environment.",
            ErrorKind::Command => "Error in execution of backup command.",
            ErrorKind::ExternalScript => "Error in execution of external script.",
            ErrorKind::FileCreate => "Error in creation of backup file.",
            ErrorKind::BadPlugin => "Plugin does not conform to standards.",
            ErrorKind::Backup => "Error in execution of backup job.",
        }
    }
}

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error("{0}")]
    Startup(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    FatalConfig(String),
    #[error("{0}")]
    Environment(String),
    #[error("{0}")]
    FatalEnvironment(String),
    #[error("{0}")]
    Command(String),
    #[error("{0}")]
    ExternalScript(String),
    #[error("{0}")]
    FileCreate(String),
    #[error("{0}")]
    BadPlugin(String),
    #[error("{0}")]
    Backup(String),
    #[error(transparent)]
    #[construct(skip)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    #[construct(skip)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    #[construct(skip)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[construct(skip)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    #[construct(skip)]
    Nix(#[from] nix::Error),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    #[construct(skip)]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    #[construct(skip)]
    WithFnName { fn_name: String, error: Box<Error> },
    #[error("{}\n{}", error, indent::indent_all_with("  ", details.join("\n")))]
    #[construct(skip)]
    WithDetails { error: Box<Error>, details: Vec<String> },
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFnName {
            fn_name: fn_name.into(),
            error: Box::new(self),
        }
    }
}

impl<I: IntoIterator<Item = String>> AddDetails<I> for Error {
    fn add_details(self, details: I) -> Self {
        let details: Vec<String> = details.into_iter().collect();
        if details.is_empty() {
            return self;
        }
        Self::WithDetails {
            error: Box::new(self),
            details,
        }
    }
}

impl Error {
    /// Classification of the innermost error, seen through the context wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Startup(_) => ErrorKind::Startup,
            Error::Config(_) => ErrorKind::Config,
            Error::FatalConfig(_) => ErrorKind::FatalConfig,
            Error::Environment(_) => ErrorKind::Environment,
            Error::FatalEnvironment(_) => ErrorKind::FatalEnvironment,
            Error::Command(_) => ErrorKind::Command,
            Error::ExternalScript(_) => ErrorKind::ExternalScript,
            Error::FileCreate(_) => ErrorKind::FileCreate,
            Error::BadPlugin(_) => ErrorKind::BadPlugin,
            Error::Backup(_)
            | Error::Io(_)
            | Error::SerdeYml(_)
            | Error::SerdeJson(_)
            | Error::ValidationError(_)
            | Error::Nix(_) => ErrorKind::Backup,
            Error::WithMsg { error, .. }
            | Error::WithFnName { error, .. }
            | Error::WithDetails { error, .. } => error.kind(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// All diagnostic lines attached anywhere in the wrapper chain, outermost last.
    pub fn details(&self) -> Vec<String> {
        match self {
            Error::WithDetails { error, details } => {
                let mut lines = error.details();
                lines.extend(details.iter().cloned());
                lines
            }
            Error::WithMsg { error, .. } | Error::WithFnName { error, .. } => error.details(),
            _ => Vec::new(),
        }
    }

    /// Wraps `self` into `kind` unless it already carries a classification.
    pub fn or_kind(self, kind: ErrorKind) -> Self {
        if self.kind() != ErrorKind::Backup {
            return self;
        }
        let msg = self.to_string();
        match kind {
            ErrorKind::Startup => Error::startup(msg),
            ErrorKind::Config => Error::config(msg),
            ErrorKind::FatalConfig => Error::fatal_config(msg),
            ErrorKind::Environment => Error::environment(msg),
            ErrorKind::FatalEnvironment => Error::fatal_environment(msg),
            ErrorKind::Command => Error::command(msg),
            ErrorKind::ExternalScript => Error::external_script(msg),
            ErrorKind::FileCreate => Error::file_create(msg),
            ErrorKind::BadPlugin => Error::bad_plugin(msg),
            ErrorKind::Backup => self,
        }
    }
}
