//! CLI-surface checks that don't require a running daemon session: help
//! text and argument validation. Grounded on `crates/agency/tests/cli_help.rs`'s
//! `assert_cmd`/`predicates` style for one-shot command assertions.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

#[test]
fn help_lists_the_flat_flag_surface() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("escrowd")?;
    cmd.arg("--help");

    cmd.assert().success().stdout(
        predicates::str::contains("Usage")
            .and(predicates::str::contains("-d"))
            .and(predicates::str::contains("-v"))
            .and(predicates::str::contains("-f"))
            .and(predicates::str::contains("-t"))
            .from_utf8(),
    );

    Ok(())
}

#[test]
fn missing_rendezvous_path_is_a_usage_error() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("escrowd")?;
    // No positional path argument supplied.
    cmd.assert().failure();

    Ok(())
}
