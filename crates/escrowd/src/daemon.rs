//! The daemon session loop: bind the rendezvous socket, accept one client
//! at a time, dispatch opcodes against the tag store, reply, and loop on
//! disconnect. Never exits on a client disconnect or a client-induced
//! error — only a transport failure on the accepted socket ends the
//! current session; the daemon itself exits only on SIGINT/SIGTERM, via
//! [`install_teardown_on_signal`].
//!
//! Grounded on `crates/agency/src/daemon.rs`'s bind-with-permissions
//! helper and accept/dispatch shape, generalized from "many short control
//! connections plus at most one attached PTY" down to this system's
//! stricter "exactly one accepted session at a time, full stop" model
//! (spec.md forbids a worker pool; correctness depends on no two sessions
//! observing the tag store simultaneously).

use std::fs;
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;

use crate::domain::{Domain, Slot, validate_payload_len};
use crate::error::EscrowError;
use crate::transport::{recv_frame, send_frame};
use crate::wire::{Message, reply};

/// Binds the rendezvous socket at `path` with owner-only `rw-------`
/// permissions. If `force` is set, an existing path is unlinked first;
/// otherwise a stale socket at `path` is also removed, since a leftover
/// socket node from a previous daemon that did not exit cleanly must not
/// block a fresh bind (the daemon is the sole owner of this path for as
/// long as it runs).
pub fn bind_rendezvous(path: &Path, force: bool) -> Result<UnixListener, EscrowError> {
    if path.exists() && (force || UnixStream::connect(path).is_err()) {
        fs::remove_file(path).map_err(EscrowError::from)?;
    }
    let listener = UnixListener::bind(path).map_err(EscrowError::from)?;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).map_err(EscrowError::from)?;
    Ok(listener)
}

/// Wires up spec.md §4.4's teardown ("on daemon exit ... the rendezvous
/// socket is closed and its filesystem path unlinked") to SIGINT/SIGTERM.
///
/// `run`'s accept loop has no natural exit point to hook teardown into —
/// it runs forever by design — so this blocks both signals process-wide
/// (via `pthread_sigmask`, safe to call from a multi-threaded process) and
/// hands their delivery to a dedicated watcher thread reading a
/// `signalfd` instead. The watcher unlinks the rendezvous socket and exits
/// the process on the first signal it sees; it never touches `Domain` or
/// the session loop, so it needs no coordination with them beyond `path`.
///
/// Must be called once, from the main thread, before spawning any other
/// thread (a blocked signal mask is inherited by threads created after the
/// call, not ones already running).
pub fn install_teardown_on_signal(path: PathBuf) -> Result<(), EscrowError> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().map_err(EscrowError::from)?;

    let mut signal_fd = SignalFd::new(&mask).map_err(EscrowError::from)?;
    std::thread::Builder::new()
        .name("escrowd-teardown".into())
        .spawn(move || {
            let signo = signal_fd.read_signal().ok().flatten().map(|info| info.ssi_signo);
            info!("received signal {signo:?}, unlinking rendezvous socket");
            unlink_rendezvous(&path);
            std::process::exit(0);
        })
        .map_err(EscrowError::from)?;
    Ok(())
}

/// Runs the daemon's outer accept loop forever. Each iteration accepts
/// exactly one client, runs it to completion via [`run_session`], and
/// loops — the daemon never exits on a client disconnect.
pub fn run(listener: &UnixListener, domain: &mut Domain, verbose: bool) -> ! {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                info!("client connected");
                run_session(&stream, domain, verbose);
                info!("client disconnected");
            }
            Err(err) => {
                warn!("accept failed: {err}");
            }
        }
    }
}

/// Runs the inner session loop for one accepted client until a transport
/// error or peer shutdown is observed.
pub fn run_session(stream: &UnixStream, domain: &mut Domain, verbose: bool) {
    loop {
        let (msg, fd) = match recv_frame(stream) {
            Ok(v) => v,
            Err(err) if err.is_transport() => {
                debug!("session ending: {err}");
                return;
            }
            Err(err) => {
                // Decode-level protocol errors (malformed ancillary data,
                // unknown opcode) end the session outright rather than
                // reply: the frame never decoded into a request, so there
                // is nothing to answer and no request/reply pairing to honor.
                debug!("session ending on malformed frame: {err}");
                return;
            }
        };
        if verbose {
            debug!("recv {}", msg.opcode_name());
        }

        let outcome = dispatch(domain, msg, fd);
        if verbose {
            debug!("send {}", outcome.0.opcode_name());
        }
        if let Err(err) = send_frame(stream, &outcome.0, outcome.1.as_ref().map(|fd| fd.as_fd())) {
            debug!("session ending on send failure: {err}");
            return;
        }
    }
}

/// Dispatches one request against `domain`, returning the reply message and
/// an optional descriptor to attach to it (only populated for a successful
/// `GET`).
fn dispatch(
    domain: &mut Domain,
    msg: Message,
    fd: Option<std::os::fd::OwnedFd>,
) -> (Message, Option<std::os::fd::OwnedFd>) {
    match msg {
        Message::Add { tag, idx, ufd, data } => (handle_add(domain, tag, idx, ufd, data, fd), None),
        Message::Del { tag, idx } => {
            if fd.is_some() {
                return (
                    reply(
                        EscrowError::Invalid("DEL must not carry a descriptor".into()).rc(),
                        "DEL must not carry a descriptor",
                    ),
                    None,
                );
            }
            (handle_del(domain, tag, idx), None)
        }
        Message::Tag { tag } => {
            if fd.is_some() {
                return (
                    reply(
                        EscrowError::Invalid("TAG must not carry a descriptor".into()).rc(),
                        "TAG must not carry a descriptor",
                    ),
                    None,
                );
            }
            (handle_tag(domain, tag), None)
        }
        Message::Get { tag, idx } => {
            if fd.is_some() {
                return (
                    reply(
                        EscrowError::Invalid("GET must not carry a descriptor".into()).rc(),
                        "GET must not carry a descriptor",
                    ),
                    None,
                );
            }
            handle_get(domain, tag, idx)
        }
        Message::Hel { .. } | Message::Rep { .. } | Message::Inf { .. } => {
            let err = EscrowError::Protocol("unexpected opcode from client".into());
            (reply(err.rc(), err.to_string()), None)
        }
    }
}

fn handle_add(
    domain: &mut Domain,
    tag: u16,
    idx: u32,
    ufd: i32,
    data: Vec<u8>,
    fd: Option<std::os::fd::OwnedFd>,
) -> Message {
    if let Err(err) = domain.validate(tag, idx) {
        return reply(err.rc(), err.to_string());
    }
    if ufd < 0 {
        let err = EscrowError::Invalid(format!("ufd {ufd} must be non-negative"));
        return reply(err.rc(), err.to_string());
    }
    if let Err(err) = validate_payload_len(data.len()) {
        return reply(err.rc(), err.to_string());
    }
    let slot = Slot { fd, ufd, payload: data };
    // Overwriting drops (and thus closes the descriptor of) any existing
    // slot at this (tag, idx); Tag::add does this implicitly via SparseSeq::put.
    domain.tag_mut(tag).expect("validated above").add(idx, slot);
    reply(0, "ok")
}

fn handle_del(domain: &mut Domain, tag: u16, idx: u32) -> Message {
    if let Err(err) = domain.validate(tag, idx) {
        return reply(err.rc(), err.to_string());
    }
    match domain.tag_mut(tag).expect("validated above").remove(idx) {
        Some(_slot) => reply(0, "ok"), // dropping _slot closes its descriptor
        None => {
            let err = EscrowError::NotFound;
            reply(err.rc(), err.to_string())
        }
    }
}

fn handle_tag(domain: &mut Domain, tag: u16) -> Message {
    if let Err(err) = domain.validate(tag, 0) {
        return reply(err.rc(), err.to_string());
    }
    let t = domain.tag(tag).expect("validated above");
    Message::Inf {
        nr: t.size(),
        total: t.total_payload_bytes(),
    }
}

fn handle_get(domain: &mut Domain, tag: u16, idx: u32) -> (Message, Option<std::os::fd::OwnedFd>) {
    if let Err(err) = domain.validate(tag, idx) {
        return (reply(err.rc(), err.to_string()), None);
    }
    let Some(slot) = domain.tag(tag).expect("validated above").get(idx) else {
        let err = EscrowError::NotFound;
        return (reply(err.rc(), err.to_string()), None);
    };
    // GET is non-destructive: the daemon retains the slot and its
    // descriptor; the kernel duplicates the descriptor across the
    // ancillary-data boundary for the receiving client, so we only need a
    // borrowed view here, not ownership transfer.
    let fd = match slot.fd.as_ref().map(crate::transport::dup) {
        Some(Ok(fd)) => Some(fd),
        Some(Err(io_err)) => {
            // `dup` fails only under descriptor-table exhaustion (EMFILE);
            // this is the spec's "resource exhaustion" taxonomy entry, not a
            // reason to take the whole daemon down.
            let err = EscrowError::Exhausted(io_err.to_string());
            return (reply(err.rc(), err.to_string()), None);
        }
        None => None,
    };
    (
        Message::Add {
            tag,
            idx,
            ufd: slot.ufd,
            data: slot.payload.clone(),
        },
        fd,
    )
}

/// Removes the rendezvous socket node. Best-effort: called on orderly
/// daemon exit; a missing file is not an error.
pub fn unlink_rendezvous(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Resolves the rendezvous path from an explicit CLI argument or the
/// `ESCROW_PATH` environment variable, per spec.md's client-stub contract
/// (shared with the daemon side so `escrowd` started with no positional
/// path still has somewhere to bind).
pub fn resolve_path(explicit: Option<&str>) -> Result<PathBuf, EscrowError> {
    if let Some(p) = explicit {
        return Ok(PathBuf::from(p));
    }
    std::env::var_os("ESCROW_PATH")
        .map(PathBuf::from)
        .ok_or_else(|| EscrowError::Startup("no rendezvous path given and ESCROW_PATH unset".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn temp_socket_path() -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow.sock");
        std::mem::forget(dir); // keep the directory alive for the socket's lifetime in the test
        path
    }

    #[test]
    fn bind_rendezvous_sets_owner_only_permissions() {
        let path = temp_socket_path();
        let _listener = bind_rendezvous(&path, false).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn add_then_get_round_trips_payload_and_fd() {
        let mut domain = Domain::new(4);
        let (p0, p1) = UnixStream::pair().unwrap();
        let resp = handle_add(&mut domain, 1, 7, 3, b"abc".to_vec(), Some(p0.into()));
        assert_eq!(resp, reply(0, "ok"));
        let (get_resp, get_fd) = handle_get(&mut domain, 1, 7);
        assert!(get_fd.is_some());
        match get_resp {
            Message::Add { tag, idx, ufd, data } => {
                assert_eq!((tag, idx, ufd, data), (1, 7, 3, b"abc".to_vec()));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        drop(p1);
    }

    #[test]
    fn get_on_empty_slot_is_not_found() {
        let mut domain = Domain::new(4);
        let (resp, fd) = handle_get(&mut domain, 0, 0);
        assert!(fd.is_none());
        assert_eq!(resp, reply(EscrowError::NotFound.rc(), "not found"));
    }

    #[test]
    fn add_with_oversize_payload_is_invalid() {
        let mut domain = Domain::new(4);
        let data = vec![0u8; crate::wire::MAX_PAYLOAD + 1];
        let resp = handle_add(&mut domain, 0, 0, 0, data, None);
        match resp {
            Message::Rep { rc, .. } => assert_eq!(rc, EscrowError::Invalid(String::new()).rc()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn add_with_out_of_range_tag_is_invalid() {
        let mut domain = Domain::new(4);
        let resp = handle_add(&mut domain, 4, 0, 0, Vec::new(), None);
        match resp {
            Message::Rep { rc, .. } => assert_eq!(rc, EscrowError::Invalid(String::new()).rc()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn del_then_get_is_not_found() {
        let mut domain = Domain::new(4);
        handle_add(&mut domain, 0, 0, 0, Vec::new(), None);
        let del_resp = handle_del(&mut domain, 0, 0);
        assert_eq!(del_resp, reply(0, "ok"));
        let (get_resp, _) = handle_get(&mut domain, 0, 0);
        assert_eq!(get_resp, reply(EscrowError::NotFound.rc(), "not found"));
    }

    #[test]
    fn tag_reports_size_and_total_payload() {
        let mut domain = Domain::new(4);
        handle_add(&mut domain, 2, 0, 0, vec![], None);
        handle_add(&mut domain, 2, 5, 0, vec![0], None);
        handle_add(&mut domain, 2, 1023, 0, vec![0, 0], None);
        handle_add(&mut domain, 2, 1024, 0, vec![0, 0, 0], None);
        handle_add(&mut domain, 2, 100_000, 0, vec![0, 0, 0, 0], None);
        let resp = handle_tag(&mut domain, 2);
        assert_eq!(resp, Message::Inf { nr: 100_001, total: 10 });
    }

    #[test]
    fn non_destructive_get_does_not_change_tag_size() {
        let mut domain = Domain::new(4);
        handle_add(&mut domain, 0, 3, 0, vec![1, 2, 3], None);
        for _ in 0..3 {
            handle_get(&mut domain, 0, 3);
        }
        let resp = handle_tag(&mut domain, 0);
        assert_eq!(resp, Message::Inf { nr: 4, total: 3 });
    }

    #[test]
    fn overwrite_closes_old_descriptor() {
        let mut domain = Domain::new(4);
        let (p0, p1) = UnixStream::pair().unwrap();
        let (q0, q1) = UnixStream::pair().unwrap();
        handle_add(&mut domain, 0, 0, 1, Vec::new(), Some(p0.into()));
        handle_add(&mut domain, 0, 0, 2, Vec::new(), Some(q0.into()));
        let (resp, _) = handle_get(&mut domain, 0, 0);
        match resp {
            Message::Add { ufd, .. } => assert_eq!(ufd, 2),
            other => panic!("unexpected reply: {other:?}"),
        }
        drop(p1);
        drop(q1);
    }

    #[test]
    fn unexpected_opcode_from_client_is_protocol_error() {
        let mut domain = Domain::new(4);
        let (resp, fd) = dispatch(
            &mut domain,
            Message::Hel { nr_tags: 4, flags: 0, key: 0 },
            None,
        );
        assert!(fd.is_none());
        match resp {
            Message::Rep { rc, .. } => assert_eq!(rc, EscrowError::Protocol(String::new()).rc()),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
