pub mod backup_files;
pub mod version;

use async_trait::async_trait;
use std::io;
use tokio::process::Command;
use which::which;

use crate::errors::{PipelineError, Result};
use crate::pipeline::ToolCommand;

/// Access to the locally installed vendor client tools.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Base command for `tool`, ready to receive the vendor arguments.
    fn locate(&self, tool: &str) -> Result<ToolCommand>;

    /// Raw output of `<tool> --version`.
    async fn version_banner(&self, tool: &str) -> Result<String>;
}

/// Tools found in `PATH`.
pub struct SystemToolchain;

#[async_trait]
impl Toolchain for SystemToolchain {
    fn locate(&self, tool: &str) -> Result<ToolCommand> {
        let path = which(tool).map_err(|e| PipelineError::Spawn {
            program: tool.to_string(),
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!(
                    "{} executable not found in PATH ({}). Please ensure the database client tools are installed and in your PATH.",
                    tool, e
                ),
            ),
        })?;
        Ok(ToolCommand::new(path).named(tool))
    }

    async fn version_banner(&self, tool: &str) -> Result<String> {
        let cmd = self.locate(tool)?;
        let output = Command::new(cmd.program())
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| PipelineError::Spawn {
                program: cmd.name().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(PipelineError::Spawn {
                program: tool.to_string(),
                source: io::Error::other(format!(
                    "`{} --version` failed with status {}: {}",
                    tool,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Stage;

    #[test]
    fn test_locate_missing_tool() {
        let err = SystemToolchain.locate("definitely-not-a-dump-tool").unwrap_err();
        assert_eq!(err.stage(), Stage::Spawn);
        assert!(err.to_string().contains("definitely-not-a-dump-tool"));
    }

    #[test]
    fn test_locate_finds_shell() -> anyhow::Result<()> {
        let cmd = SystemToolchain.locate("sh")?;
        assert_eq!(cmd.name(), "sh");
        assert!(cmd.get_args().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_version_banner_of_missing_tool() {
        let err = SystemToolchain.version_banner("definitely-not-a-dump-tool").await.unwrap_err();
        assert_eq!(err.stage(), Stage::Spawn);
    }
}
