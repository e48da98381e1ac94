use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BeaconError {
    #[error("invalid model uid: {0}")]
    InvalidUid(String),

    #[error("invalid pipeline stage: {0}")]
    InvalidStage(String),

    #[error("unknown data loader: {0}")]
    UnknownLoader(String),

    #[error("model data could not be loaded: {0}")]
    LoaderData(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("QMEAN request failed: {0}")]
    RemoteHttp(String),

    #[error("QMEAN service returned status {status}: {message}")]
    RemoteService { status: u16, message: String },

    #[error("unknown QMEAN job status '{status}' ({job})")]
    UnknownJobStatus { status: String, job: String },

    #[error("QMEAN job {job} did not finish within {waited_secs}s")]
    PollTimeout { job: String, waited_secs: u64 },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("scoring tool failed (exit code {code:?}): `{command}`\n{stderr}")]
    ScoringTool {
        command: String,
        stderr: String,
        code: Option<i32>,
    },

    #[error("failed to parse score document: {0}")]
    ScoreParse(String),

    #[error("conversion failed (exit code {code:?}): `{command}`\nstdout: {stdout}\nstderr: {stderr}")]
    Conversion {
        command: String,
        stdout: String,
        stderr: String,
        code: Option<i32>,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("model record not found: {0}")]
    RecordNotFound(String),

    #[error("task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("invalid command-line usage: {0}")]
    Usage(String),

    #[error("invalid task graph: {0}")]
    InvalidGraph(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
