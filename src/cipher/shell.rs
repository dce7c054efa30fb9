//! Decryption through an external `sqlcipher` shell.
//!
//! Used when the linked engine cannot open the file. The first candidate that
//! answers `.quit` with exit status 0 is fed the export script on
//! stdin. The subprocess runs exactly once and without a timeout.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use super::{BackendError, CipherParams, DecryptBackend};

/// Executable names tried in order.
pub fn default_candidates() -> Vec<String> {
    let names = ["sqlcipher", "sqlcipher-x64", "sqlcipher-x86"];
    names
        .iter()
        .map(|n| {
            if cfg!(windows) {
                format!("{}.exe", n)
            } else {
                n.to_string()
            }
        })
        .collect()
}

pub struct ShellBackend {
    candidates: Vec<String>,
}

impl Default for ShellBackend {
    fn default() -> Self {
        Self::new(default_candidates())
    }
}

impl ShellBackend {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }

    /// First candidate that runs and exits cleanly on `.quit`.
    pub fn locate(&self) -> Option<&str> {
        self.candidates
            .iter()
            .map(String::as_str)
            .find(|cmd| answers_quit(cmd))
    }
}

fn answers_quit(cmd: &str) -> bool {
    run_with_stdin(Command::new(cmd), ".quit\n")
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_with_stdin(mut cmd: Command, input: &str) -> std::io::Result<std::process::Output> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes())?;
    }
    child.wait_with_output()
}

impl DecryptBackend for ShellBackend {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn export(
        &self,
        input: &Path,
        plaintext: &Path,
        key: &str,
        params: &CipherParams,
    ) -> Result<(), BackendError> {
        let cmd = self.locate().ok_or_else(|| {
            BackendError::NotInstalled(format!(
                "no sqlcipher executable found (tried {})",
                self.candidates.join(", ")
            ))
        })?;
        log::info!("Using sqlcipher shell {}", cmd);

        let mut command = Command::new(cmd);
        command.arg("-bail").arg(input);
        let output = run_with_stdin(command, &params.export_script(key, plaintext))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let detail = if stderr.is_empty() { stdout } else { stderr };
            return Err(BackendError::Exit {
                code: output.status.code(),
                stderr: detail,
            });
        }
        Ok(())
    }
}
