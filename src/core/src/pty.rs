//! Portable PTY: spawn a login shell and bridge its I/O for the session pumps.
//! A blocking thread reads the master and feeds an async channel; writes and
//! resizes go through mutexes on the master side so the client pump can apply
//! a resize strictly before the next input byte.
//!
//! The reader thread polls with a short deadline instead of blocking forever,
//! so teardown is observed within ~100 ms even when the shell is silent. That
//! matters because the thread holds the last master-side descriptor: once it
//! exits, the shell sees hangup, which is how every teardown short of the
//! forced admin kill ends the process.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Initial window until the client sends a resize.
const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

/// Chunks read from the PTY master per loop iteration.
const READ_CHUNK: usize = 4096;

/// Queue depth between the blocking reader thread and the async output pump.
const OUTPUT_QUEUE: usize = 256;

/// Read deadline on the master, in milliseconds. Expired deadlines only check
/// for teardown and re-arm.
#[cfg(unix)]
const READ_POLL_MS: libc::c_int = 100;

/// Shell command: `$SHELL -l` on Unix (default bash), cmd on Windows.
/// TERM is forced so the session is seen as a 256-color xterm.
#[cfg(unix)]
fn shell_command() -> CommandBuilder {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string());
    let mut c = CommandBuilder::new(shell);
    c.arg("-l");
    c.env("TERM", "xterm-256color");
    c
}

#[cfg(windows)]
fn shell_command() -> CommandBuilder {
    let mut c = CommandBuilder::new("cmd.exe");
    c.env("TERM", "xterm-256color");
    c
}

/// One spawned shell: master for resize, writer for stdin, child for signals.
/// All three are locked independently; none of the locks is held across an
/// await point by callers.
pub struct PtyBridge {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

/// Spawn the user's shell in a fresh PTY. Returns the bridge plus the receiver
/// of raw output chunks; the channel closes when the shell exits (reader EOF).
pub fn spawn_shell() -> Result<(PtyBridge, mpsc::Receiver<Vec<u8>>), Box<dyn std::error::Error + Send + Sync>> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows: INITIAL_ROWS,
        cols: INITIAL_COLS,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let child = pair.slave.spawn_command(shell_command())?;
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    // The thread's own dup of the master, for deadline polling. Owned so it
    // closes when the thread exits, releasing the shell's terminal.
    #[cfg(unix)]
    let poll_fd = pair.master.as_raw_fd().and_then(|raw| {
        let fd = unsafe { libc::dup(raw) };
        (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
    });

    let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);

    // Blocking thread: drain the master until EOF, error, or teardown. The
    // poll deadline keeps a silent shell from pinning the thread (and with it
    // the master descriptor) after the session is gone.
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            #[cfg(unix)]
            if let Some(ref fd) = poll_fd {
                let mut pollfd = libc::pollfd {
                    fd: fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                match unsafe { libc::poll(&mut pollfd, 1, READ_POLL_MS) } {
                    n if n < 0 => break,
                    0 => {
                        if tx.is_closed() {
                            break;
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let bridge = PtyBridge {
        master: Mutex::new(pair.master),
        writer: Mutex::new(writer),
        child: Mutex::new(child),
    };
    Ok((bridge, rx))
}

impl PtyBridge {
    /// Write client input to the shell's stdin.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty writer mutex poisoned"))?;
        w.write_all(data)?;
        w.flush()
    }

    /// Set the PTY window size.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty master mutex poisoned"))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    /// SIGTERM first, hard kill if that fails. Only the forced admin kill
    /// uses this; ordinary teardown just closes the master and lets the
    /// shell see hangup.
    pub fn signal_terminate(&self) -> io::Result<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pty child mutex poisoned"))?;
        #[cfg(unix)]
        if let Some(pid) = child.process_id() {
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                return Ok(());
            }
            warn!("failed to send SIGTERM to pid {pid}: {}, falling back to hard kill", io::Error::last_os_error());
        }
        child.kill()
    }

    /// Unconditional hard kill. The child may already be gone, so errors are
    /// not interesting.
    pub fn kill(&self) {
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }
}
