//! The client stub: `open`/`close`/`add`/`get`/`del`/`tag`, with
//! bootstrap-on-demand (spawning a daemon and racing its bind) when no
//! daemon is listening at the rendezvous path.
//!
//! Grounded on `crates/agency/src/utils/daemon.rs`'s connect-or-bail shape
//! (`connect_daemon_socket`) and its pattern of spawning the daemon as a
//! detached child process on demand, adapted here so the client spawns its
//! own binary directly against the rendezvous path (the escrowd binary has
//! no subcommands — running it at all means running the daemon) rather than
//! relying on a surrounding CLI to know how to background a sibling process.
//!
//! Not safe for concurrent use from multiple threads of one process: each
//! `Handle` serializes its own request/reply pair and has no internal
//! locking (spec.md §4.5).

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::daemon::resolve_path;
use crate::error::EscrowError;
use crate::transport::{recv_frame, send_frame};
use crate::wire::Message;

/// Delay between spawning a daemon and retrying the connect, tolerating the
/// daemon's bind race (spec.md §9).
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// An open session to an escrowd daemon.
pub struct Handle {
    stream: UnixStream,
}

/// True if `err` indicates "nobody is listening here" rather than some
/// other connect failure worth surfacing untranslated.
fn is_no_daemon_listening(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused)
        || err.raw_os_error() == Some(libc::ESHUTDOWN)
}

/// Spawns a new daemon bound to `path` with `nr_tags` tags, detached from
/// this process's stdio, and returns immediately without waiting for it to
/// finish binding — the caller retries the connect after a short sleep.
fn spawn_daemon(path: &Path, nr_tags: u16) -> Result<(), EscrowError> {
    let exe = std::env::current_exe().map_err(EscrowError::from)?;
    debug!("spawning daemon: {} -t {nr_tags} {}", exe.display(), path.display());
    std::process::Command::new(exe)
        .arg("-t")
        .arg(nr_tags.to_string())
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(EscrowError::from)?;
    Ok(())
}

impl Handle {
    /// Connects to the daemon at `path` (or `$ESCROW_PATH` if `path` is
    /// `None`), spawning it on demand if nobody is listening. Loops
    /// indefinitely on the "no daemon" condition; other connect errors are
    /// surfaced immediately.
    pub fn open(path: Option<&str>, nr_tags: u16) -> Result<Self, EscrowError> {
        let path = resolve_path(path)?;
        loop {
            match UnixStream::connect(&path) {
                Ok(stream) => return Ok(Self { stream }),
                Err(err) if is_no_daemon_listening(&err) => {
                    spawn_daemon(&path, nr_tags)?;
                    std::thread::sleep(SPAWN_RETRY_DELAY);
                }
                Err(err) => return Err(EscrowError::from(err)),
            }
        }
    }

    /// Connects to an already-running daemon without ever spawning one;
    /// used by tests and by callers that want "fail if not running"
    /// semantics instead of autostart.
    pub fn connect_existing(path: &Path) -> Result<Self, EscrowError> {
        let stream = UnixStream::connect(path).map_err(EscrowError::from)?;
        Ok(Self { stream })
    }

    fn roundtrip(&self, msg: &Message, fd: Option<BorrowedFd<'_>>) -> Result<(Message, Option<OwnedFd>), EscrowError> {
        send_frame(&self.stream, msg, fd)?;
        recv_frame(&self.stream)
    }

    /// Deposits `fd` (or no descriptor, for a payload-only entry) and
    /// `payload` at `(tag, idx)`, echoing `ufd` back on a later `get`.
    ///
    /// Rejected locally with `EscrowError::Invalid` (rather than sent) when
    /// `payload` exceeds `MAX_PAYLOAD` — `Message::encode` asserts on this,
    /// so it must never be reached with an oversize payload.
    pub fn add(
        &self,
        tag: u16,
        idx: u32,
        fd: Option<BorrowedFd<'_>>,
        ufd: i32,
        payload: &[u8],
    ) -> Result<(), EscrowError> {
        crate::domain::validate_payload_len(payload.len())?;
        let msg = Message::Add {
            tag,
            idx,
            ufd,
            data: payload.to_vec(),
        };
        let (reply, _) = self.roundtrip(&msg, fd)?;
        expect_ok(reply)
    }

    /// Retrieves the slot at `(tag, idx)`. Copies up to `buf.len()` payload
    /// bytes into `buf` and returns `(descriptor, ufd, original_len)` —
    /// `original_len` may exceed `buf.len()` if the stored payload was
    /// truncated to fit.
    pub fn get(&self, tag: u16, idx: u32, buf: &mut [u8]) -> Result<(Option<OwnedFd>, i32, usize), EscrowError> {
        let (reply, fd) = self.roundtrip(&Message::Get { tag, idx }, None)?;
        match reply {
            Message::Add { ufd, data, .. } => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((fd, ufd, data.len()))
            }
            Message::Rep { rc, message } => Err(rep_to_error(rc, message)),
            other => Err(EscrowError::Protocol(format!("unexpected reply to GET: {other:?}"))),
        }
    }

    /// Deletes the slot at `(tag, idx)`.
    pub fn del(&self, tag: u16, idx: u32) -> Result<(), EscrowError> {
        let (reply, _) = self.roundtrip(&Message::Del { tag, idx }, None)?;
        expect_ok(reply)
    }

    /// Returns `(nr, total_payload_bytes)` for `tag`.
    pub fn tag(&self, tag: u16) -> Result<(u32, u32), EscrowError> {
        let (reply, _) = self.roundtrip(&Message::Tag { tag }, None)?;
        match reply {
            Message::Inf { nr, total } => Ok((nr, total)),
            Message::Rep { rc, message } => Err(rep_to_error(rc, message)),
            other => Err(EscrowError::Protocol(format!("unexpected reply to TAG: {other:?}"))),
        }
    }

    /// Returns a borrowed view of the underlying session socket, for tests
    /// that need to inject raw frames.
    pub fn raw_stream(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn expect_ok(reply: Message) -> Result<(), EscrowError> {
    match reply {
        Message::Rep { rc: 0, .. } => Ok(()),
        Message::Rep { rc, message } => Err(rep_to_error(rc, message)),
        other => Err(EscrowError::Protocol(format!("unexpected reply: {other:?}"))),
    }
}

/// Translates a `REP`'s negated return code and message back into an
/// `EscrowError`, preserving the distinction between not-found and
/// invalid-argument for the caller, per spec.md §7.
fn rep_to_error(rc: i16, message: String) -> EscrowError {
    match rc {
        -2 => EscrowError::NotFound,
        -22 => EscrowError::Invalid(message),
        -12 => EscrowError::Exhausted(message),
        -71 => EscrowError::Protocol(message),
        _ => EscrowError::Protocol(format!("rc={rc}: {message}")),
    }
}
