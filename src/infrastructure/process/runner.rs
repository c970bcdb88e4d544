use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `sh -c <script>`, used for user-supplied build commands.
    pub fn shell(script: &str, timeout: Duration) -> Self {
        Self::new("sh", timeout).arg("-c").arg(script)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {seconds}s")]
    Timeout { program: String, seconds: u64 },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Runs external programs with a hard timeout. The child is killed when the
/// deadline passes or when the future is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run to completion and collect output.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.run_streaming(spec, &|_| {}).await
    }

    /// Run to completion, handing every stdout/stderr line to `on_line` as it
    /// arrives. Output is also collected into the returned value.
    pub async fn run_streaming(
        &self,
        spec: &CommandSpec,
        on_line: &(dyn Fn(String) + Send + Sync),
    ) -> Result<CommandOutput, ProcessError> {
        debug!(program = %spec.program, args = ?spec.args, "Spawning process");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let io_err = |source| ProcessError::Io {
            program: spec.program.clone(),
            source,
        };

        let collect = async {
            let mut output = CommandOutput::default();
            let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
            let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

            while out_lines.is_some() || err_lines.is_some() {
                tokio::select! {
                    line = next_line(&mut out_lines), if out_lines.is_some() => {
                        match line.map_err(io_err)? {
                            Some(line) => {
                                output.stdout.push_str(&line);
                                output.stdout.push('\n');
                                on_line(line);
                            }
                            None => out_lines = None,
                        }
                    }
                    line = next_line(&mut err_lines), if err_lines.is_some() => {
                        match line.map_err(io_err)? {
                            Some(line) => {
                                output.stderr.push_str(&line);
                                output.stderr.push('\n');
                                on_line(line);
                            }
                            None => err_lines = None,
                        }
                    }
                }
            }

            let status = child.wait().await.map_err(io_err)?;
            output.exit_code = status.code();
            Ok::<_, ProcessError>(output)
        };

        let outcome = tokio::time::timeout(spec.timeout, collect).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(program = %spec.program, "Process timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(program = %spec.program, "Failed to kill timed out process: {}", e);
                }
                Err(ProcessError::Timeout {
                    program: spec.program.clone(),
                    seconds: spec.timeout.as_secs(),
                })
            }
        }
    }
}

async fn next_line<R>(
    lines: &mut Option<tokio::io::Lines<BufReader<R>>>,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_collects_both_streams() {
        let runner = ProcessRunner::new();
        let spec = CommandSpec::shell("echo out; echo err 1>&2; exit 3", Duration::from_secs(10));

        let seen = Mutex::new(Vec::new());
        let output = runner
            .run_streaming(&spec, &|line| seen.lock().unwrap().push(line))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec!["err".to_string(), "out".to_string()]);
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("echo \"$GREETING\"; pwd", Duration::from_secs(10))
            .env("GREETING", "hello")
            .cwd(dir.path());

        let output = ProcessRunner::new().run(&spec).await.unwrap();

        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let cwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(cwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let spec = CommandSpec::new("sleep", Duration::from_millis(200)).arg("30");

        let started = std::time::Instant::now();
        let result = ProcessRunner::new().run(&spec).await;

        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Duration::from_secs(1));
        let result = ProcessRunner::new().run(&spec).await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
