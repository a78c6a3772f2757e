// dbstream/src/orchestrator/mod.rs
//! One backup or restore, start to finish: connect, check tool versions,
//! prepare the target, then stream.

use tracing::{debug, info, warn};

use crate::backup;
use crate::config::{ArtifactLocation, ConnectionConfig, Operation};
use crate::connection::{ConnectionAdapter, DatabaseSession};
use crate::errors::PipelineError;
use crate::pipeline::compose::PipelineOutcome;
use crate::pipeline::RunControl;
use crate::restore;
use crate::utils::Toolchain;
use crate::utils::version::check_compatibility;
use crate::vendor::{Vendor, vendor_for};

pub struct Orchestrator<A, T> {
    adapter: A,
    toolchain: T,
    control: RunControl,
}

impl<A: ConnectionAdapter, T: Toolchain> Orchestrator<A, T> {
    pub fn new(adapter: A, toolchain: T) -> Self {
        Orchestrator {
            adapter,
            toolchain,
            control: RunControl::default(),
        }
    }

    pub fn with_control(mut self, control: RunControl) -> Self {
        self.control = control;
        self
    }

    /// Runs `operation` against the database described by `config`.
    ///
    /// Restores connect to the vendor's admin database first so the target
    /// can be created when missing. The pre-flight session is closed whatever
    /// the outcome.
    pub async fn execute(
        &self,
        config: &ConnectionConfig,
        artifact: &ArtifactLocation,
        operation: Operation,
    ) -> PipelineOutcome {
        let vendor = vendor_for(config.kind);
        let session_config = match operation {
            Operation::Backup => config.clone(),
            Operation::Restore => config.with_database(vendor.admin_database()),
        };

        info!(
            "🔌 Connecting to {} at {}:{} for {}",
            vendor.kind(), config.host, config.port, operation
        );
        if self.control.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("interrupted".to_string()));
        }
        let mut session = tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => {
                return Err(PipelineError::Cancelled("interrupted".to_string()));
            }
            session = self.adapter.connect(&session_config) => session?,
        };

        let outcome = self
            .run_session(session.as_mut(), vendor, config, artifact, operation)
            .await;

        if let Err(e) = session.close().await {
            warn!("Failed to close pre-flight connection: {}", e);
        }
        outcome
    }

    async fn run_session(
        &self,
        session: &mut dyn DatabaseSession,
        vendor: &dyn Vendor,
        config: &ConnectionConfig,
        artifact: &ArtifactLocation,
        operation: Operation,
    ) -> PipelineOutcome {
        let tool = vendor.tool(operation, artifact.format);

        let server_version = session.server_version().await?;
        let banner = self.toolchain.version_banner(tool).await?;
        let versions = check_compatibility(
            vendor.server_version_text(&server_version),
            vendor.tool_version_text(&banner),
        )?;
        info!(
            "✓ Versions compatible: database {}, {} {}",
            versions.server, tool, versions.tool
        );

        if operation == Operation::Restore {
            session.ensure_database(&config.database).await?;
        }

        let command = vendor.command(self.toolchain.locate(tool)?, operation, config, artifact.format);
        debug!(
            program = %command.program().display(),
            args = ?command.get_args(),
            env = ?command.get_env().keys().collect::<Vec<_>>(),
            "Prepared {} command",
            tool
        );

        match operation {
            Operation::Backup => backup::run(&command, artifact, &self.control).await,
            Operation::Restore => restore::run(&command, artifact, &self.control).await,
        }
    }
}
