//! Streaming command execution, local or over an already-open SSH session.
//!
//! This is the lowest layer of the engine's C4 SSH transport: everything
//! above it (probing, fact gathering, the remote applier) goes through
//! [`RemoteCommand`] so that timeout, cancellation and output-tailing
//! discipline lives in exactly one place, the same way the
//! `better-command`/`fleet-base::command` pair centralizes it for local and
//! `openssh`-backed commands alike.

pub mod handler;

use std::ffi::OsStr;
use std::pin::pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use handler::Handler;
use openssh::{OverSsh, Session};
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::select;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("command was cancelled")]
    Cancelled,
    #[error("local process error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("command '{command}' exited with status {code}")]
    NonZeroExit { command: String, code: i32 },
}

fn ostoutf8(os: impl AsRef<OsStr>) -> String {
    os.as_ref().to_str().expect("non-utf8 argument").to_owned()
}

/// A command to run either on the local machine or over an existing
/// `openssh::Session`. Cloning the session handle (not opening a new one)
/// matches spec §4.4's requirement that one connection serves arbitrarily
/// many sequential commands.
#[derive(Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    session: Option<Arc<Session>>,
}

impl RemoteCommand {
    pub fn local(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: ostoutf8(program),
            args: Vec::new(),
            env: Vec::new(),
            session: None,
        }
    }

    pub fn on_session(program: impl AsRef<OsStr>, session: Arc<Session>) -> Self {
        Self {
            program: ostoutf8(program),
            args: Vec::new(),
            env: Vec::new(),
            session: Some(session),
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(ostoutf8(arg));
        self
    }

    pub fn args<I: IntoIterator<Item = V>, V: AsRef<OsStr>>(&mut self, args: I) -> &mut Self {
        for a in args {
            self.arg(a);
        }
        self
    }

    pub fn env(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> &mut Self {
        self.env
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }

    /// Runs the command to completion, streaming stdout+stderr line-by-line
    /// through `handler`, and returns the exit code. Bounded by `timeout`
    /// and cooperatively cancellable via `cancel` (spec §4.4, §5
    /// "Cancellation and timeouts").
    pub async fn run(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        handler: &mut dyn Handler,
    ) -> Result<i32, CommandError> {
        self.run_capturing(timeout, cancel, handler, false)
            .await
            .map(|(code, _)| code)
    }

    /// Like [`Self::run`], but also captures raw stdout bytes (used by fact
    /// gathering and any one-shot `cmd | value` style reads); stderr still
    /// streams through `handler`.
    pub async fn run_captured(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        handler: &mut dyn Handler,
    ) -> Result<(i32, Vec<u8>), CommandError> {
        self.run_capturing(timeout, cancel, handler, true).await
    }

    async fn run_capturing(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
        handler: &mut dyn Handler,
        want_stdout: bool,
    ) -> Result<(i32, Vec<u8>), CommandError> {
        let display = self.display();
        let deadline = tokio::time::sleep(timeout);
        let body = self.drive(handler, want_stdout);
        let mut deadline = pin!(deadline);
        let mut body = pin!(body);
        select! {
            biased;
            _ = cancel.cancelled() => Err(CommandError::Cancelled),
            _ = &mut deadline => Err(CommandError::Timeout(timeout)),
            res = &mut body => {
                let (code, out) = res?;
                if code != 0 {
                    return Err(CommandError::NonZeroExit { command: display, code });
                }
                Ok((code, out))
            }
        }
    }

    async fn drive(
        &self,
        handler: &mut dyn Handler,
        want_stdout: bool,
    ) -> Result<(i32, Vec<u8>), CommandError> {
        if let Some(session) = &self.session {
            self.drive_ssh(session, handler, want_stdout).await
        } else {
            self.drive_local(handler, want_stdout).await
        }
    }

    fn build_local_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    async fn drive_local(
        &self,
        handler: &mut dyn Handler,
        want_stdout: bool,
    ) -> Result<(i32, Vec<u8>), CommandError> {
        debug!(command = %self.display(), "running local command");
        let mut cmd = self.build_local_command();
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let wait = async { child.wait().await.map_err(CommandError::from) };
        stream_output(stdout, stderr, handler, want_stdout, wait).await
    }

    async fn drive_ssh(
        &self,
        session: &Arc<Session>,
        handler: &mut dyn Handler,
        want_stdout: bool,
    ) -> Result<(i32, Vec<u8>), CommandError> {
        debug!(command = %self.display(), "running command over ssh");
        // openssh sessions don't forward environment by default; fold
        // explicit env vars into an `env NAME=value ...` prefix the way the
        // teacher's `translate_env_into_env` does.
        let mut local = if self.env.is_empty() {
            let mut c = Command::new(&self.program);
            c.args(&self.args);
            c
        } else {
            let mut c = Command::new("env");
            for (k, v) in &self.env {
                c.arg(format!("{k}={v}"));
            }
            c.arg(&self.program);
            c.args(&self.args);
            c
        };
        let mut remote = local
            .over_ssh(session.clone())
            .map_err(|e| CommandError::Ssh(e.to_string()))?;
        remote.stdout(openssh::Stdio::piped());
        remote.stderr(openssh::Stdio::piped());
        let mut child = remote
            .spawn()
            .await
            .map_err(|e| CommandError::Ssh(e.to_string()))?;
        let stdout = child.stdout().take().expect("piped stdout");
        let stderr = child.stderr().take().expect("piped stderr");
        let wait = async {
            child
                .wait()
                .await
                .map_err(|e| CommandError::Ssh(e.to_string()))
        };
        stream_output(stdout, stderr, handler, want_stdout, wait).await
    }
}

async fn stream_output<O, E, W>(
    stdout: O,
    stderr: E,
    handler: &mut dyn Handler,
    want_stdout: bool,
    wait: W,
) -> Result<(i32, Vec<u8>), CommandError>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
    W: std::future::Future<Output = Result<std::process::ExitStatus, CommandError>>,
{
    let mut out_lines = FramedRead::new(stdout, LinesCodec::new());
    let mut err_lines = FramedRead::new(stderr, LinesCodec::new());
    let mut captured = Vec::new();
    let mut wait = pin!(wait);
    loop {
        select! {
            line = out_lines.next() => {
                match line {
                    Some(Ok(line)) => {
                        if want_stdout {
                            captured.extend_from_slice(line.as_bytes());
                            captured.push(b'\n');
                        } else {
                            handler.handle_line(&line);
                        }
                    }
                    Some(Err(_)) | None => {}
                }
            }
            line = err_lines.next() => {
                if let Some(Ok(line)) = line {
                    handler.handle_line(&line);
                }
            }
            status = &mut wait => {
                let status = status?;
                let code = status.code().unwrap_or(-1);
                return Ok((code, captured));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use handler::NoopHandler;

    #[tokio::test]
    async fn local_echo_captures_stdout() {
        let mut cmd = RemoteCommand::local("echo");
        cmd.arg("hello");
        let cancel = CancellationToken::new();
        let mut handler = NoopHandler;
        let (code, out) = cmd
            .run_captured(Duration::from_secs(5), &cancel, &mut handler)
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(String::from_utf8(out).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let cmd = RemoteCommand::local("false");
        let cancel = CancellationToken::new();
        let mut handler = NoopHandler;
        let err = cmd
            .run(Duration::from_secs(5), &cancel, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NonZeroExit { code: 1, .. }));
    }

    #[tokio::test]
    async fn timeout_is_enforced() {
        let mut cmd = RemoteCommand::local("sleep");
        cmd.arg("5");
        let cancel = CancellationToken::new();
        let mut handler = NoopHandler;
        let err = cmd
            .run(Duration::from_millis(50), &cancel, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let mut cmd = RemoteCommand::local("sleep");
        cmd.arg("5");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut handler = NoopHandler;
        let err = cmd
            .run(Duration::from_secs(5), &cancel, &mut handler)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled));
    }
}
