//! Helpers for running local child processes (podman, mainly).

use std::io::{Read, Seek};
use std::process::Command;

use color_eyre::eyre::{eyre, Context, Result};

/// Extension methods for [`std::process::Command`].
pub trait CommandRun {
    /// Run the child to completion; error (including trailing stderr) on
    /// abnormal exit.
    fn run(&mut self) -> Result<()>;

    /// Run the child and capture stdout as a string. Errors on abnormal exit.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Read the tail of a capture file for inclusion in an error message.
fn trailing_content(mut f: std::fs::File) -> String {
    // Truncate to the trailing bytes to avoid pathological error messages
    const MAX_TAIL_BYTES: u64 = 1024;
    let len = f.metadata().map(|m| m.len()).unwrap_or(0);
    let tail = len.min(MAX_TAIL_BYTES);
    let mut buf = Vec::with_capacity(tail as usize);
    let r = f
        .seek(std::io::SeekFrom::Start(len - tail))
        .and_then(|_| f.read_to_end(&mut buf));
    match r {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read captured stderr: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        tracing::trace!("exec: {self:?}");
        let status = self.status()?;
        if status.success() {
            Ok(())
        } else {
            Err(eyre!(
                "Subprocess failed: {status:?}\n{}",
                trailing_content(stderr)
            ))
        }
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile()?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout.read_to_string(&mut s)?;
        Ok(s)
    }
}
