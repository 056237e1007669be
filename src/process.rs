//! Launching external tools (git, the agent, build tooling) and reading
//! their combined output line by line.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An executable, its arguments and the directory it runs in
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            envs: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
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
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, one line per `\n`
    pub output: String,
    pub cancelled: bool,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// A launched process whose stdout and stderr feed one line channel
pub struct RunningProcess {
    child: Child,
    lines: mpsc::Receiver<String>,
}

impl RunningProcess {
    /// Next output line, or `None` once both streams are closed
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the process to exit, then kill it if it is still alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            debug!("Sending SIGTERM to process {}", pid);
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to process {}: {}", pid, e);
            }
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => return status,
                Err(_) => {
                    warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.child.kill().await?;
        self.child.wait().await
    }
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Launch `spec` with stdin closed and both output streams piped.
    pub fn spawn(spec: &CommandSpec) -> io::Result<RunningProcess> {
        debug!("Executing command: {} (cwd: {})", spec, spec.cwd.display());

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, lines) = mpsc::channel(256);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        if let Some(pid) = child.id() {
            debug!("Process spawned with PID: {}", pid);
        }
        Ok(RunningProcess { child, lines })
    }

    /// Run `spec` to completion, handing each output line to `on_line`.
    ///
    /// When `cancel` fires the process is terminated (SIGTERM, then a kill
    /// after `grace`) and the outcome is marked cancelled.
    pub async fn run<F>(
        spec: &CommandSpec,
        cancel: &CancellationToken,
        grace: Duration,
        mut on_line: F,
    ) -> io::Result<ProcessOutcome>
    where
        F: FnMut(&str),
    {
        let mut process = Self::spawn(spec)?;
        let mut output = String::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = process.next_line() => match line {
                    Some(line) => {
                        on_line(&line);
                        output.push_str(&line);
                        output.push('\n');
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    info!("Cancelling: {}", spec);
                    cancelled = true;
                    break;
                }
            }
        }

        let status = if cancelled {
            process.terminate(grace).await?
        } else {
            process.wait().await?
        };

        Ok(ProcessOutcome {
            exit_code: status.code(),
            output,
            cancelled,
        })
    }

    /// Run `spec` to completion without cancellation.
    pub async fn output<F>(spec: &CommandSpec, on_line: F) -> io::Result<ProcessOutcome>
    where
        F: FnMut(&str),
    {
        Self::run(spec, &CancellationToken::new(), Duration::ZERO, on_line).await
    }
}

async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read process output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", std::env::temp_dir()).args(["-c", script])
    }

    #[tokio::test]
    async fn collects_stdout_and_stderr() {
        let mut seen = Vec::new();
        let outcome = ProcessRunner::output(&sh("echo out; echo err 1>&2"), |line| {
            seen.push(line.to_string())
        })
        .await
        .unwrap();

        assert!(outcome.success());
        seen.sort();
        assert_eq!(seen, vec!["err", "out"]);
        assert!(outcome.output.contains("out\n"));
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let outcome = ProcessRunner::output(&sh("echo nope; exit 3"), |_| {})
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        // `cat` would block forever on an open stdin
        let outcome = ProcessRunner::output(&sh("cat; echo done"), |_| {})
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.output.trim(), "done");
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", std::env::temp_dir());
        assert!(ProcessRunner::output(&spec, |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = ProcessRunner::run(
            &sh("echo started; exec sleep 30"),
            &cancel,
            Duration::from_secs(2),
            |_| {},
        )
        .await
        .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stubborn_process_is_killed_after_grace() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let outcome = ProcessRunner::run(
            &sh("trap '' TERM; sleep 30"),
            &cancel,
            Duration::from_millis(300),
            |_| {},
        )
        .await
        .unwrap();

        assert!(outcome.cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("git", ".").args(["checkout", "-b", "x"]);
        assert_eq!(spec.to_string(), "git checkout -b x");
    }
}
