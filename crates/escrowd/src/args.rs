use std::path::PathBuf;

use clap::Parser;

/// `escrowd` — a file-descriptor escrow daemon.
///
/// Holds file descriptors and small opaque payloads on behalf of one
/// client process at a time, keyed by `(tag, index)`, so a client process
/// can exit and a successor can retrieve the same kernel descriptors
/// (zero-downtime service upgrade, crash recovery, or privileged
/// descriptor handoff).
#[derive(Debug, Parser)]
#[command(version, about, long_about = None, bin_name = "escrowd")]
pub struct Cli {
    /// Daemonize into the background instead of running in the foreground.
    #[arg(short = 'd')]
    pub daemonize: bool,

    /// Log every received/sent protocol message at debug level.
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Unlink the rendezvous path before bind if it already exists.
    #[arg(short = 'f')]
    pub force: bool,

    /// Number of tags the daemon will serve.
    #[arg(short = 't', default_value_t = 32)]
    pub nr_tags: u16,

    /// Filesystem path of the rendezvous socket.
    pub path: PathBuf,
}
