//! PTY-backed `exec` sessions.
//!
//! The runtime CLI is started as `<binary> exec -it <id> <cmd>` on the slave
//! side of a host pseudo-terminal, so the daemon sees a real TTY and the
//! container process gets job control, line editing and window sizes.
//! Blocking PTY reads and writes run on the blocking thread pool and are
//! bridged to async code through channels.

use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;

use bytes::Bytes;
use log::{debug, warn};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot};

use super::error::{RuntimeError, RuntimeResult};
use super::{ExecRequest, PtyControl, PtyProcess, TerminalSize};

/// Capacity of the input and output channels, in chunks.
const CHANNEL_CAPACITY: usize = 64;

/// Read buffer size for PTY output.
const READ_BUFFER_SIZE: usize = 8192;

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct CliPtyControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl PtyControl for CliPtyControl {
    fn resize(&self, size: TerminalSize) -> RuntimeResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| RuntimeError::Pty("pty master lock poisoned".to_string()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| RuntimeError::Pty(format!("resize failed: {e}")))
    }

    fn kill(&self) -> RuntimeResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| RuntimeError::Pty("pty killer lock poisoned".to_string()))?;
        match killer.kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::InvalidInput => {
                Ok(())
            }
            Err(e) => Err(RuntimeError::Pty(format!("kill failed: {e}"))),
        }
    }
}

/// Spawn `<binary> exec -it` for `container_id` under a fresh PTY.
pub(crate) fn spawn_exec(
    binary: &str,
    container_id: &str,
    request: &ExecRequest,
) -> RuntimeResult<PtyProcess> {
    if request.command.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "exec command cannot be empty".to_string(),
        ));
    }

    let pair = native_pty_system()
        .openpty(pty_size(request.size))
        .map_err(|e| RuntimeError::Pty(format!("openpty failed: {e}")))?;

    let mut cmd = CommandBuilder::new(binary);
    cmd.arg("exec");
    cmd.arg("-it");
    for (key, value) in &request.env {
        cmd.arg("-e");
        cmd.arg(format!("{key}={value}"));
    }
    cmd.arg(container_id);
    for part in &request.command {
        cmd.arg(part);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| RuntimeError::Pty(format!("spawning {binary} exec failed: {e}")))?;
    // The child holds its own slave handle; keeping ours open would keep the
    // master readable after the child exits.
    drop(pair.slave);

    let killer = child.clone_killer();
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| RuntimeError::Pty(format!("cloning pty reader failed: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| RuntimeError::Pty(format!("taking pty writer failed: {e}")))?;

    let (output_tx, output_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();

    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx
                        .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                // EIO once the slave side is gone.
                Err(e) => {
                    debug!("pty reader finished: {}", e);
                    break;
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        while let Some(chunk) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                warn!("pty write failed: {}", e);
                break;
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!("waiting for exec process failed: {}", e);
                None
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(PtyProcess {
        input: input_tx,
        output: output_rx,
        exit: exit_rx,
        control: Box::new(CliPtyControl {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
        }),
    })
}
