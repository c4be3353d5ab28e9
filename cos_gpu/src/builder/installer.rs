use super::command::{run_and_log, CommandError};
use super::toolchain::{self, ToolchainEnv};
use super::{Artifacts, BuildError, DriverCompiler};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

const RUNFILE_MODE: u32 = 0o755;

/// Name of the package the installer writes next to the run-file with `--add-this-kernel`.
pub fn custom_runfile_name(runfile: &str) -> String {
    format!("{}-custom.run", runfile.strip_suffix(".run").unwrap_or(runfile))
}

pub fn installer_args(kernel_source: &Path) -> Vec<String> {
    vec![
        format!("--kernel-source-path={}", kernel_source.display()),
        "--add-this-kernel".into(),
        "--no-install-compat32-libs".into(),
        "--silent".into(),
        "--accept-license".into(),
    ]
}

/// Builds the custom driver package with the NVIDIA run-file itself, cross compiling the kernel
/// modules with the COS toolchain.
#[derive(Debug, Clone, Default)]
pub struct NvidiaInstaller;

impl NvidiaInstaller {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DriverCompiler for NvidiaInstaller {
    async fn compile(
        &self,
        work_dir: &Path,
        artifacts: &Artifacts,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, BuildError> {
        toolchain::extract(&artifacts.toolchain, work_dir, cancel).await?;
        toolchain::extract(&artifacts.kernel_headers, work_dir, cancel).await?;

        let env = ToolchainEnv::prepare(
            work_dir,
            &artifacts.toolchain_env,
            std::env::var_os("PATH"),
        )?;
        let kernel_source = toolchain::kernel_source_dir(work_dir)?;

        let runfile = work_dir.join(&artifacts.runfile);
        tokio::fs::set_permissions(&runfile, std::fs::Permissions::from_mode(RUNFILE_MODE))
            .await
            .map_err(|source| BuildError::Io {
                path: runfile.clone(),
                source,
            })?;

        info!(
            runfile = artifacts.runfile,
            kernel_source = %kernel_source.display(),
            cc = ?env.get("CC"),
            "Running NVIDIA installer"
        );

        let mut command = Command::new(&runfile);
        command
            .args(installer_args(&kernel_source))
            .current_dir(work_dir)
            .envs(env.vars());

        run_and_log(command, cancel).await.map_err(|e| match e {
            CommandError::Cancelled(_) => BuildError::Cancelled,
            e => BuildError::Compile(e.to_string()),
        })?;

        let package = work_dir.join(custom_runfile_name(&artifacts.runfile));
        if !package.is_file() {
            return Err(BuildError::Compile(format!(
                "installer succeeded but '{}' was not produced",
                package.display()
            )));
        }

        info!(package = %package.display(), "Built custom driver package");
        Ok(package)
    }
}
