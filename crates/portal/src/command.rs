//! External-command login portal
//!
//! Runs a configured automation program (typically a headless browser script)
//! once per login. The account is appended as the last argument and the secret
//! is written to the program's stdin so it never shows up in a process listing.
//!
//! The program reports its outcome as one JSON object on stdout:
//! - success: `{"token": "...", "expires_at": 1735500000000}` (`expires_at` optional)
//! - failure: `{"error": {"kind": "challenge", "message": "captcha misread"}}`
//!
//! A non-zero exit without a parseable error object is classified `Unknown`.
//! A program still running after the attempt timeout is killed and reaped,
//! and the attempt fails as `Timeout`.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use common::Secret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{ErrorKind, IssuedToken, LoginPortal, PortalError, Result};

/// Maximum number of stderr bytes carried into an error message.
const STDERR_EXCERPT_LEN: usize = 512;

/// How often a running login program is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandOutput {
    Issued {
        token: String,
        #[serde(default)]
        expires_at: Option<u64>,
    },
    Failed {
        error: CommandFailure,
    },
}

#[derive(Debug, Deserialize)]
struct CommandFailure {
    kind: ErrorKind,
    #[serde(default)]
    message: String,
}

/// Login portal backed by an external automation program.
pub struct CommandPortal {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPortal {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Wait for the program to exit, killing it once `timeout` has passed.
    fn wait_bounded(&self, child: &mut Child, account: &str) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if started.elapsed() >= self.timeout => {
                    warn!(account, timeout_secs = self.timeout.as_secs(), "killing login command after timeout");
                    if let Err(e) = child.kill() {
                        debug!(account, error = %e, "login command exited before kill");
                    }
                    let _ = child.wait();
                    return Err(PortalError::new(
                        ErrorKind::Timeout,
                        format!("login command timed out after {:?}", self.timeout),
                    ));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(PortalError::new(
                        ErrorKind::Unknown,
                        format!("failed waiting for login command: {e}"),
                    ));
                }
            }
        }
    }
}

/// Drain a pipe on its own thread so a chatty program cannot fill it and stall.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl LoginPortal for CommandPortal {
    fn id(&self) -> &str {
        "command"
    }

    fn login(&self, account: &str, secret: &Secret<String>) -> Result<IssuedToken> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(account)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PortalError::new(
                    ErrorKind::Validation,
                    format!("failed to start {}: {e}", self.program.display()),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A script that exits without reading stdin closes the pipe early;
            // its exit status and stdout still decide the outcome.
            if let Err(e) = stdin.write_all(secret.expose().as_bytes()) {
                debug!(account, error = %e, "login command closed stdin early");
            }
        }

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait_bounded(&mut child, account)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        let stdout = String::from_utf8_lossy(&stdout);
        let parsed = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<CommandOutput>(line.trim()).ok());

        match parsed {
            Some(CommandOutput::Issued { token, expires_at }) if status.success() => {
                if token.is_empty() {
                    return Err(PortalError::new(
                        ErrorKind::Unknown,
                        "login command returned an empty token",
                    ));
                }
                Ok(IssuedToken {
                    token: Secret::new(token),
                    expires_at,
                })
            }
            Some(CommandOutput::Failed { error }) => Err(PortalError::new(
                error.kind,
                if error.message.is_empty() {
                    "login command reported failure".to_string()
                } else {
                    error.message
                },
            )),
            _ => {
                let stderr = String::from_utf8_lossy(&stderr);
                let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT_LEN).collect();
                Err(PortalError::new(
                    ErrorKind::Unknown,
                    format!("login command exited with {status}: {excerpt}"),
                ))
            }
        }
    }
}
