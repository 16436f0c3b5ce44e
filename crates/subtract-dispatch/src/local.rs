use std::process::Stdio;

use async_trait::async_trait;
use subtract_types::{CommandError, DispatchConfig, DispatchMode};

use crate::dispatcher::{decode_output, CommandDispatcher, CommandOutput, CommandSpec};
use crate::routing::route;

/// Dispatcher that spawns commands on the local machine.
///
/// In [`DispatchMode::Conda`] every command is wrapped in
/// `conda run -n <context> --no-capture-output`, where the context comes
/// from [`route`]. In [`DispatchMode::Direct`] the program is run from `PATH`.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    mode: DispatchMode,
    conda_executable: String,
}

impl LocalDispatcher {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            mode,
            conda_executable: "conda".into(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            mode: config.mode,
            conda_executable: config.conda_executable.clone(),
        }
    }

    /// Program and argument vector actually spawned for `spec`.
    pub fn command_line(&self, spec: &CommandSpec) -> (String, Vec<String>) {
        match self.mode {
            DispatchMode::Direct => (spec.program.clone(), spec.args.clone()),
            DispatchMode::Conda => {
                let mut args = vec![
                    "run".to_string(),
                    "-n".to_string(),
                    route(&spec.program).to_string(),
                    "--no-capture-output".to_string(),
                    spec.program.clone(),
                ];
                args.extend(spec.args.iter().cloned());
                (self.conda_executable.clone(), args)
            }
        }
    }
}

#[async_trait]
impl CommandDispatcher for LocalDispatcher {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let (program, args) = self.command_line(&spec);
        let shown = spec.display();
        let context = route(&spec.program);

        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args).envs(&spec.env).stdin(Stdio::null());
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if spec.capture {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }

        tracing::debug!(command = %shown, context, "Dispatching command");

        let start = tokio::time::Instant::now();
        let output = cmd.output().await.map_err(|source| CommandError::Spawn {
            command: shown.clone(),
            source,
        })?;
        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.stdout.is_empty() {
            tracing::debug!(command = %shown, stdout = %decode_output(&output.stdout), "Command stdout");
        }
        if !output.stderr.is_empty() {
            tracing::debug!(command = %shown, stderr = %decode_output(&output.stderr), "Command stderr");
        }

        if !output.status.success() {
            tracing::error!(command = %shown, exit_code, duration_ms, "Command failed");
            return Err(CommandError::Exited {
                command: shown,
                exit_code,
                stderr: decode_output(&output.stderr).trim().to_string(),
            });
        }

        tracing::debug!(command = %shown, duration_ms, "Command finished");
        Ok(CommandOutput {
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
