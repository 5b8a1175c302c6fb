//! # Native PTY Spawn
//!
//! `forkpty`-based process spawning, grounded in `coop`'s
//! `crates/cli/src/pty/{spawn,nbio}.rs` — a direct PTY syscall path in
//! place of a capture-helper shell-out. [`terminal`] layers the
//! multiplexer-specific attach/resize/close contract on top of this
//! primitive.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, ForkResult, Pid};
use tokio::io::unix::AsyncFd;

use crate::error::AgentError;

/// Newtype wrapper around `OwnedFd` so it can back an `AsyncFd`.
pub struct PtyFd(pub OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct PtyChild {
    pub master: AsyncFd<PtyFd>,
    pub pid: Pid,
}

impl PtyChild {
    /// Spawn `argv` on a freshly allocated PTY of the given geometry.
    #[allow(unsafe_code)]
    pub fn spawn(argv: &[String], cols: u16, rows: u16) -> Result<Self, AgentError> {
        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: the child is partially initialized between fork and exec;
        // we touch only async-signal-safe calls before execvp.
        let ForkptyResult { master, fork_result } =
            unsafe { forkpty(&winsize, None) }.map_err(|e| AgentError::External(format!("forkpty: {e}")))?;

        match fork_result {
            ForkResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                let c_args: Vec<CString> = argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .expect("argv must not contain NUL bytes");
                let _ = execvp(&c_args[0], &c_args);
                std::process::exit(127); // execvp only returns on failure
            }
            ForkResult::Parent { child } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(PtyFd(master))
                    .map_err(|e| AgentError::External(format!("AsyncFd::new: {e}")))?;
                Ok(Self { master: afd, pid: child })
            }
        }
    }

    pub async fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| {
                nix::unistd::read(inner.as_raw_fd(), buf).map_err(io_err)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| nix::unistd::write(inner, &data[offset..]).map_err(io_err)) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// `TIOCSWINSZ` on the PTY master. Per §4.5, SIGWINCH alone is not
    /// enough — the caller must also instruct the remote multiplexer to
    /// resize its named session.
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn signal(&self, sig: Signal) {
        let _ = kill(self.pid, sig);
    }

    pub async fn wait(self) -> Option<i32> {
        let pid = self.pid;
        tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Some(code),
                Ok(WaitStatus::Signaled(..)) => return None,
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return None,
            }
        })
        .await
        .unwrap_or(None)
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        let _ = kill(self.pid, Signal::SIGHUP);
        let _ = waitpid(self.pid, Some(WaitPidFlag::WNOHANG));
    }
}

fn set_nonblocking(fd: &impl AsRawFd) -> std::io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}
