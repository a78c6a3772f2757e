// dbstream/src/errors.rs
use std::fmt;

use thiserror::Error;

use crate::pipeline::ExitReport;

/// Where in one backup/restore operation a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    VersionCheck,
    Prepare,
    Spawn,
    ProcessExit,
    ProducerStream,
    TransformStream,
    ConsumerStream,
    Cancelled,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::VersionCheck => "version-check",
            Stage::Prepare => "prepare",
            Stage::Spawn => "spawn",
            Stage::ProcessExit => "process-exit",
            Stage::ProducerStream => "producer-stream",
            Stage::TransformStream => "transform-stream",
            Stage::ConsumerStream => "consumer-stream",
            Stage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Versions mismatch: database {server}, tool {tool}")]
    VersionMismatch { server: String, tool: String },

    #[error("No version number found in {0:?}")]
    UnparsableVersion(String),

    #[error("Failed to prepare target database: {0}")]
    Prepare(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {report}")]
    ProcessExit {
        program: String,
        report: ExitReport,
        diagnostics: Vec<String>,
    },

    #[error("{stage} failed: {source}")]
    Stream {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl PipelineError {
    pub fn stream(stage: Stage, source: std::io::Error) -> Self {
        PipelineError::Stream { stage, source }
    }

    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Connection(_) => Stage::Connect,
            PipelineError::VersionMismatch { .. } | PipelineError::UnparsableVersion(_) => {
                Stage::VersionCheck
            }
            PipelineError::Prepare(_) => Stage::Prepare,
            PipelineError::Spawn { .. } => Stage::Spawn,
            PipelineError::ProcessExit { .. } => Stage::ProcessExit,
            PipelineError::Stream { stage, .. } => *stage,
            PipelineError::Cancelled(_) => Stage::Cancelled,
        }
    }

    /// Tail of the tool's stderr, if the failure came from the tool itself.
    pub fn diagnostics(&self) -> &[String] {
        match self {
            PipelineError::ProcessExit { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_stage_tags_are_kebab_case() {
        assert_eq!(Stage::ProcessExit.to_string(), "process-exit");
        assert_eq!(Stage::ProducerStream.to_string(), "producer-stream");
        assert_eq!(Stage::TransformStream.to_string(), "transform-stream");
        assert_eq!(Stage::ConsumerStream.to_string(), "consumer-stream");
        assert_eq!(Stage::Spawn.to_string(), "spawn");
    }

    #[test]
    fn test_error_maps_to_stage() {
        let err = PipelineError::stream(Stage::ConsumerStream, io::Error::other("disk full"));
        assert_eq!(err.stage(), Stage::ConsumerStream);
        assert_eq!(err.to_string(), "consumer-stream failed: disk full");

        let err = PipelineError::VersionMismatch {
            server: "10.0".into(),
            tool: "8.0".into(),
        };
        assert_eq!(err.stage(), Stage::VersionCheck);

        let err = PipelineError::Spawn {
            program: "pg_dump".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.stage(), Stage::Spawn);
        assert!(err.diagnostics().is_empty());
    }

    #[test]
    fn test_process_exit_carries_diagnostics() {
        let err = PipelineError::ProcessExit {
            program: "psql".into(),
            report: ExitReport { code: Some(2), signal: None },
            diagnostics: vec!["FATAL: password authentication failed".into()],
        };
        assert_eq!(err.stage(), Stage::ProcessExit);
        assert_eq!(err.to_string(), "psql exited with code 2");
        assert_eq!(err.diagnostics().len(), 1);
    }
}
