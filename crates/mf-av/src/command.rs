//! Builder for executing external tool commands with timeout support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use mf_core::Error;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// ```no_run
/// use mf_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> mf_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_format"])
///     .arg("/path/to/video.mp4")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - [`Error::ToolTimeout`] if the process outlives the timeout; the
    ///   process is killed.
    /// - [`Error::Tool`] if spawning fails or the process exits non-zero
    ///   (message includes stderr).
    pub async fn execute(&self) -> mf_core::Result<ToolOutput> {
        self.execute_with_line_callback(|_| {}).await
    }

    /// Like [`execute`](Self::execute) but hands every stdout line to
    /// `on_line` as soon as it is read.
    pub async fn execute_with_line_callback<F>(&self, mut on_line: F) -> mf_core::Result<ToolOutput>
    where
        F: FnMut(&str) + Send,
    {
        let program_name = self.program_name();
        tracing::debug!(tool = %program_name, args = ?self.args, "Running tool");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool(&program_name, format!("failed to spawn: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tool(&program_name, "stderr was not captured"))?;

        // Drain stderr concurrently so a chatty tool never blocks on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(e) = stderr.read_to_end(&mut buf).await {
                tracing::debug!("Could not read tool stderr: {e}");
            }
            String::from_utf8_lossy(&buf).to_string()
        });

        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut captured = String::new();
            while let Some(line) = lines.next_line().await? {
                on_line(&line);
                captured.push_str(&line);
                captured.push('\n');
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, captured))
        };

        let result = tokio::time::timeout(self.timeout, run).await;

        match result {
            Ok(Ok((status, stdout))) => {
                let stderr = stderr_task.await.unwrap_or_else(|e| {
                    tracing::debug!(tool = %program_name, "stderr reader did not finish: {e}");
                    String::new()
                });
                if !status.success() {
                    return Err(Error::tool(
                        program_name,
                        format!("exited with status {status}: {}", stderr.trim()),
                    ));
                }
                Ok(ToolOutput {
                    status,
                    stdout,
                    stderr,
                })
            }
            Ok(Err(e)) => {
                stderr_task.abort();
                Err(Error::tool(
                    program_name,
                    format!("I/O error waiting for process: {e}"),
                ))
            }
            Err(_elapsed) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(tool = %program_name, "Could not kill timed-out process: {e}");
                }
                stderr_task.abort();
                Err(Error::ToolTimeout {
                    tool: program_name,
                    after: self.timeout,
                })
            }
        }
    }
}
