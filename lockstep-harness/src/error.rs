use std::path::PathBuf;

/// Errors surfaced by the harness itself.
///
/// Worker failures are not errors here: they are data, reported through
/// the run summary.
#[derive(thiserror::Error, Debug)]
pub enum HarnessError {
    #[error("failed to spawn thread for worker {worker}: {source}")]
    Spawn {
        worker: String,
        source: std::io::Error,
    },
    #[error("failed to write run report to {}: {source}", path.display())]
    ReportIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize run report: {0}")]
    ReportEncode(#[from] serde_json::Error),
}
