// dbstream/src/restore/mod.rs
//! Restore direction: artifact file → gunzip → tool stdin.

use std::io;

use tokio::fs::File;
use tokio::io::BufReader;
use tracing::{debug, info};

use crate::config::{ArtifactLocation, Operation};
use crate::errors::{PipelineError, Stage};
use crate::pipeline::compose::{PipelineOutcome, StreamComposer};
use crate::pipeline::transform::GzipDecompress;
use crate::pipeline::{ProcessHandle, RunControl, ToolCommand};

/// Feeds the decompressed contents of `artifact` to the restore tool.
///
/// The artifact is opened before the tool starts, so an unreadable file
/// never launches anything.
pub async fn run(command: &ToolCommand, artifact: &ArtifactLocation, control: &RunControl) -> PipelineOutcome {
    let file = File::open(&artifact.path)
        .await
        .map_err(|e| PipelineError::stream(Stage::ProducerStream, e))?;
    info!("📂 Restoring from {}", artifact.path.display());

    let mut tool = command.spawn(Operation::Restore)?;
    let stdin = match tool.take_stdin() {
        Some(stdin) => stdin,
        None => {
            if let Err(e) = tool.kill().await {
                debug!("Kill of {} reported: {}", tool.program(), e);
            }
            return Err(PipelineError::stream(
                Stage::ConsumerStream,
                io::Error::other(format!("{} stdin was not captured", command.name())),
            ));
        }
    };

    debug!(state = ?tool.state(), "{} stdin captured", command.name());

    StreamComposer::new(tool)
        .with_control(control.clone())
        .run(BufReader::new(file), Some(Box::new(GzipDecompress::new())), stdin)
        .await
}
