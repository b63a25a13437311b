//! `escrowd` binary entry point. There is no subcommand layer: invoking this
//! binary at all means running the daemon in the foreground against the
//! positional rendezvous path, mirroring the original `escrowd path-to-socket`
//! invocation convention.

mod args;

use std::process::ExitCode;

use clap::Parser;
use log::{error, warn};

use args::Cli;
use escrowd::daemon::{bind_rendezvous, install_teardown_on_signal, run};
use escrowd::domain::Domain;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    if cli.daemonize {
        warn!("-d requested but background daemonization is not implemented; running in the foreground");
    }

    let listener = match bind_rendezvous(&cli.path, cli.force) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {err}", cli.path.display());
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = install_teardown_on_signal(cli.path.clone()) {
        warn!("failed to install signal-triggered teardown, rendezvous socket won't be unlinked on exit: {err}");
    }

    let mut domain = Domain::new(cli.nr_tags);

    run(&listener, &mut domain, cli.verbose)
}
