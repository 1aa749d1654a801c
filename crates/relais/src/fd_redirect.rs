//! Scoped stdout diversion for host processes.
//!
//! A host uses fd 1 (stdout) as its protocol channel. The hosted computation
//! (native model runtimes, tokenizers, progress bars) often prints straight to
//! fd 1, which would interleave garbage with protocol lines. While a
//! [`Diversion`] is alive, fd 1 points at the diagnostic stream (fd 2) instead;
//! dropping the guard flushes whatever was buffered and points fd 1 back at the
//! protocol channel.
//!
//! The host holds a diversion around setup and around every command, and only
//! writes protocol lines once the guard is gone.
//!
//! ## Safety contracts
//!
//! The `unsafe` block relies on:
//! 1. fd 1 is open for the whole process lifetime (guaranteed by the OS at
//!    startup, and never closed by this module).
//! 2. The temporary `OwnedFd` wrapping fd 1 is forgotten right after `dup2`,
//!    so it never closes the descriptor.
//! 3. Diversions are not nested or shared across threads: the host handles
//!    one request at a time.

use std::io::{self, Write};

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

#[cfg(unix)]
use nix::unistd::{dup, dup2};

#[cfg(unix)]
const STDOUT_FD: i32 = 1;

/// Where a host's stray stdout output goes while the computation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticSink {
    /// Point fd 1 at stderr for the duration of each diversion.
    #[default]
    Stderr,
    /// No redirection. For hosts whose protocol streams are not the process
    /// stdio (tests, sockets).
    Disabled,
}

impl DiagnosticSink {
    /// Divert stdout until the returned guard is dropped.
    pub fn divert(&self) -> io::Result<Diversion> {
        match self {
            Self::Disabled => Ok(Diversion::inactive()),
            Self::Stderr => divert_stdout_to_stderr(),
        }
    }
}

/// Guard restoring stdout on drop, on every exit path.
#[must_use = "stdout is restored as soon as the diversion is dropped"]
pub struct Diversion {
    #[cfg(unix)]
    saved_stdout: Option<OwnedFd>,
}

impl Diversion {
    fn inactive() -> Self {
        Self {
            #[cfg(unix)]
            saved_stdout: None,
        }
    }

    pub fn is_active(&self) -> bool {
        #[cfg(unix)]
        {
            self.saved_stdout.is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl Drop for Diversion {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = self.saved_stdout.take() {
            // Noise still sitting in the std buffer belongs on stderr.
            let _ = io::stdout().flush();
            if let Err(e) = point_stdout_at(saved.as_fd()) {
                tracing::error!(error = %e, "Failed to restore stdout after diversion");
            }
        }
    }
}

#[cfg(unix)]
fn divert_stdout_to_stderr() -> io::Result<Diversion> {
    io::stdout().flush()?;

    let saved = dup(io::stdout().as_fd())
        .map_err(|e| io::Error::other(format!("dup(1) failed: {}", e)))?;
    point_stdout_at(io::stderr().as_fd())?;

    tracing::trace!("Stdout diverted to stderr");
    Ok(Diversion {
        saved_stdout: Some(saved),
    })
}

#[cfg(unix)]
fn point_stdout_at(fd: BorrowedFd<'_>) -> io::Result<()> {
    // Safety: see module docs (fd 1 stays open, wrapper is forgotten).
    let mut stdout_fd = unsafe { OwnedFd::from_raw_fd(STDOUT_FD) };
    let result = dup2(fd, &mut stdout_fd);
    std::mem::forget(stdout_fd);
    result.map_err(|e| io::Error::other(format!("dup2 onto stdout failed: {}", e)))
}

#[cfg(not(unix))]
fn divert_stdout_to_stderr() -> io::Result<Diversion> {
    // No fd-level redirection off unix: stray prints reach the protocol
    // stream and show up client-side as malformed lines.
    tracing::debug!("Stdout diversion unsupported on this platform");
    Ok(Diversion::inactive())
}
