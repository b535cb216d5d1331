use std::env::JoinPathsError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that reject a caller-visible supervisor operation
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The OS could not start av1an
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// av1an exited with a non-zero code while not cancelled
    #[error("av1an exited with code {code}{}", stderr_suffix(.stderr))]
    AbnormalExit { code: i32, stderr: String },

    /// A process is already attached to this job
    #[error("job {0} already has a running process")]
    AlreadyRunning(String),

    /// A cancelled job stays cancelled
    #[error("job {0} was cancelled")]
    Cancelled(String),

    /// Directory preparation failed before spawning
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The exit status of a spawned av1an could not be collected
    #[error("failed to wait for av1an: {0}")]
    Wait(#[source] io::Error),

    /// A dependency directory could not be joined into PATH
    #[error("invalid dependency path: {0}")]
    Path(#[from] JoinPathsError),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr.trim_end())
    }
}

/// Failure reading one of av1an's side files. Always transient from the
/// supervisor's point of view.
#[derive(Debug, Error)]
pub enum SideFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
