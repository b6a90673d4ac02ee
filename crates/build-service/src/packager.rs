//! External build tooling: dependency install, project build and packaging

use async_trait::async_trait;
use nightly_common::{BuildError, Platform, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Directory, relative to the project root, receiving packaged binaries
const OUTPUT_DIR: &str = "dist";

/// Turns a source tree into one binary per platform
#[async_trait]
pub trait Packager: Send + Sync {
    /// Install the project's declared dependencies
    async fn install_dependencies(&self, project_dir: &Path) -> Result<()>;

    /// Run the project's own build step
    async fn build_project(&self, project_dir: &Path) -> Result<()>;

    /// Produce the binary for `platform`, returning its path
    async fn package(&self, project_dir: &Path, platform: Platform) -> Result<PathBuf>;
}

/// Result of one external command
#[derive(Debug)]
pub struct StepOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    /// Short description of a failure for error messages
    fn describe(&self) -> String {
        let code = self
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let tail: String = last_lines(&self.stderr, 5);
        if tail.is_empty() {
            format!("exit status {}", code)
        } else {
            format!("exit status {}: {}", code, tail)
        }
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

/// Run a shell command line to completion inside `dir`, bounded by `timeout`.
///
/// Output is captured for diagnostics only; callers decide on `success`.
pub async fn run_step(
    name: &str,
    command_line: &str,
    dir: &Path,
    timeout: Duration,
) -> std::io::Result<StepOutput> {
    info!("Running {} step: {}", name, command_line);

    let child = Command::new("sh")
        .arg("-c")
        .arg(command_line)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} step timed out after {}s", name, timeout.as_secs()),
            )
        })??;

    let step = StepOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    debug!("{} stdout:\n{}", name, step.stdout);
    if step.success {
        debug!("{} stderr:\n{}", name, step.stderr);
    } else {
        warn!("{} step failed ({}):\n{}", name, step.describe(), step.stderr);
    }

    Ok(step)
}

/// Packager running configured shell commands
pub struct CommandPackager {
    install_command: String,
    build_command: String,
    package_command: String,
    binary_name: String,
    timeout: Duration,
}

impl CommandPackager {
    pub fn new(
        install_command: &str,
        build_command: &str,
        package_command: &str,
        binary_name: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            install_command: install_command.to_string(),
            build_command: build_command.to_string(),
            package_command: package_command.to_string(),
            binary_name: binary_name.to_string(),
            timeout,
        }
    }

    /// Packager target name for a platform
    fn target(platform: Platform) -> &'static str {
        match platform {
            Platform::Linux => "linux",
            Platform::Windows => "win",
            Platform::Macos => "macos",
        }
    }

    /// Project-relative path the binary for `platform` is written to
    pub fn output_path(&self, platform: Platform) -> PathBuf {
        Path::new(OUTPUT_DIR).join(platform.binary_name(&self.binary_name))
    }

    /// Package command line for `platform`
    pub fn package_command_for(&self, platform: Platform) -> String {
        self.package_command
            .replace("{platform}", platform.as_str())
            .replace("{target}", Self::target(platform))
            .replace("{output}", &self.output_path(platform).to_string_lossy())
    }
}

#[async_trait]
impl Packager for CommandPackager {
    async fn install_dependencies(&self, project_dir: &Path) -> Result<()> {
        let out = run_step("install", &self.install_command, project_dir, self.timeout)
            .await
            .map_err(|e| BuildError::DependencyInstallFailed(e.to_string()))?;
        if !out.success {
            return Err(BuildError::DependencyInstallFailed(out.describe()));
        }
        Ok(())
    }

    async fn build_project(&self, project_dir: &Path) -> Result<()> {
        let out = run_step("build", &self.build_command, project_dir, self.timeout)
            .await
            .map_err(|e| BuildError::ProjectBuildFailed(e.to_string()))?;
        if !out.success {
            return Err(BuildError::ProjectBuildFailed(out.describe()));
        }
        Ok(())
    }

    async fn package(&self, project_dir: &Path, platform: Platform) -> Result<PathBuf> {
        let failed = |detail: String| BuildError::PackagingFailed { platform, detail };

        tokio::fs::create_dir_all(project_dir.join(OUTPUT_DIR))
            .await
            .map_err(|e| failed(e.to_string()))?;

        let command = self.package_command_for(platform);
        let out = run_step("package", &command, project_dir, self.timeout)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !out.success {
            return Err(failed(out.describe()));
        }

        let binary = project_dir.join(self.output_path(platform));
        if !tokio::fs::try_exists(&binary).await.unwrap_or(false) {
            return Err(failed(format!(
                "packager exited cleanly but {} was not produced",
                binary.display()
            )));
        }
        Ok(binary)
    }
}
