use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[cfg(feature = "live")]
    #[error("Error while watching for file changes:\n{0}")]
    Watch(#[from] WatchError),

    #[error("Failed to build runtime")]
    RuntimeBuild(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file '{0}'.\n{1}")]
    Read(Utf8PathBuf, #[source] std::io::Error),

    #[error("Couldn't parse config file '{0}'.\n{1}")]
    Parse(Utf8PathBuf, #[source] toml::de::Error),

    #[error("Invalid glob pattern '{0}'.\n{1}")]
    Pattern(String, #[source] glob::PatternError),
}

/// Failures reported by [`crate::TaskGraph::run`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}' is not registered")]
    NotFound(String),

    #[error("Task '{0}' failed:\n{1}")]
    Failed(String, anyhow::Error),

    #[error("Task '{0}' depends on itself through its prerequisites")]
    Cycle(String),
}

impl TaskError {
    /// Name of the task this error is attributed to.
    pub fn task(&self) -> &str {
        match self {
            TaskError::NotFound(name) | TaskError::Failed(name, _) | TaskError::Cycle(name) => {
                name
            }
        }
    }
}

/// Fatal per-file failure of the external renderer. Everything else the
/// interpreter does (empty output, diagnostics, non-zero exit) is not an error.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Couldn't spawn interpreter '{0}' for {1}.\n{2}")]
    Spawn(String, Utf8PathBuf, #[source] std::io::Error),

    #[error("I/O error while rendering {0}.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),

    #[error("Path {0} is outside of {1}")]
    OutsideBase(Utf8PathBuf, Utf8PathBuf),
}

/// Structured stylesheet compile error, one per malformed entry point.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}:{line}:{column} {message}")]
pub struct StyleError {
    pub path: Utf8PathBuf,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Path {0} is outside of {1}")]
    OutsideBase(Utf8PathBuf, Utf8PathBuf),

    #[error("Couldn't copy {0}.\n{1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),
}

#[derive(Debug, Error)]
#[error("Error while clearing the build directory:\n{0}")]
pub struct StepClearError(#[from] std::io::Error);

#[cfg(feature = "live")]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}
