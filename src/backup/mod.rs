// dbstream/src/backup/mod.rs
//! Backup direction: tool stdout → gzip → artifact file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::BufWriter;
use tracing::{debug, info, warn};

use crate::config::{ArtifactLocation, Operation};
use crate::errors::{PipelineError, Stage};
use crate::pipeline::compose::{PipelineOutcome, StreamComposer};
use crate::pipeline::transform::GzipCompress;
use crate::pipeline::{ProcessHandle, RunControl, SpawnedTool, ToolCommand};

const PARTIAL_SUFFIX: &str = ".partial";

/// Sibling path the dump is written to before it replaces the artifact.
fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Runs the dump tool and streams its output, compressed, into `artifact`.
///
/// Bytes go to `<artifact>.partial`, created only once the tool has started,
/// and the artifact is replaced only after the pipeline succeeds. A failed run
/// leaves any earlier artifact at the same path untouched.
pub async fn run(command: &ToolCommand, artifact: &ArtifactLocation, control: &RunControl) -> PipelineOutcome {
    info!("📦 Backing up to {}", artifact.path.display());
    let mut tool = command.spawn(Operation::Backup)?;

    let stdout = match tool.take_stdout() {
        Some(stdout) => stdout,
        None => {
            kill_quietly(&mut tool).await;
            return Err(PipelineError::stream(
                Stage::ProducerStream,
                io::Error::other(format!("{} stdout was not captured", command.name())),
            ));
        }
    };

    debug!(state = ?tool.state(), "{} stdout captured", command.name());

    let partial = partial_path(&artifact.path);
    let file = match File::create(&partial).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Cannot create {}: {}", partial.display(), e);
            kill_quietly(&mut tool).await;
            return Err(PipelineError::stream(Stage::ConsumerStream, e));
        }
    };

    let summary = match StreamComposer::new(tool)
        .with_control(control.clone())
        .run(stdout, Some(Box::new(GzipCompress::new())), BufWriter::new(file))
        .await
    {
        Ok(summary) => summary,
        Err(e) => {
            remove_partial(&partial).await;
            return Err(e);
        }
    };

    if let Err(e) = tokio::fs::rename(&partial, &artifact.path).await {
        warn!("Cannot move {} into place: {}", partial.display(), e);
        remove_partial(&partial).await;
        return Err(PipelineError::stream(Stage::ConsumerStream, e));
    }
    Ok(summary)
}

async fn kill_quietly(tool: &mut SpawnedTool) {
    if let Err(e) = tool.kill().await {
        debug!("Kill of {} reported: {}", tool.program(), e);
    }
}

async fn remove_partial(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => warn!("🗑️ Removed incomplete backup {}", partial.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove incomplete backup {}: {}", partial.display(), e),
    }
}
