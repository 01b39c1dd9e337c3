// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: exo-sim command surface
//! TEST_SCOPE: config file loading, scenario output, monitor prompt

use std::io::{Cursor, Write};

use clap::Parser;
use exo_sim::cli::{execute, resolve_config, Cli};

fn run(args: &[&str], stdin: &str) -> String {
    let cli = Cli::try_parse_from(std::iter::once("exo-sim").chain(args.iter().copied())).expect("args");
    let cfg = resolve_config(&cli).expect("config");
    let mut out = Vec::new();
    execute(&cli, &cfg, Cursor::new(stdin.to_string()), &mut out).expect("execute");
    String::from_utf8(out).expect("utf8")
}

#[test]
fn config_file_sets_machine_limits() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "[machine]\nframes = 48\nmax_envs = 4\n\n[log]\nlevel = \"warn\"").expect("write");
    let path = file.path().to_str().expect("utf8 path");
    let cli = Cli::try_parse_from(["exo-sim", "--config", path]).expect("args");
    let cfg = resolve_config(&cli).expect("config");
    assert_eq!(cfg.machine.frames, 48);
    assert_eq!(cfg.machine.max_envs, 4);
    assert_eq!(cfg.log.level, "warn");
}

#[test]
fn scenario_shows_cow_then_private_copy() {
    let out = run(&["scenario"], "");
    let rows: Vec<&str> = out.lines().filter(|l| l.starts_with("  0x00800000")).collect();
    assert_eq!(rows.len(), 4);
    // COW pages are present, user, not writable on both sides right after fork.
    assert!(rows[0].ends_with("1       0       1"));
    assert!(rows[1].ends_with("1       0       1"));
    // After the child's write only the child is writable.
    assert!(rows[2].ends_with("1       0       1"));
    assert!(rows[3].ends_with("1       1       1"));
    assert_ne!(rows[2], rows[3]);
    assert_eq!(out.lines().last(), Some("ok"));
}

#[test]
fn sfork_scenario_keeps_sharing() {
    let out = run(&["scenario", "--mode", "sfork"], "");
    let rows: Vec<&str> = out.lines().filter(|l| l.starts_with("  0x00800000")).collect();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|row| row.ends_with("1       1       1")));
    assert_eq!(rows[2], rows[3]);
}

#[test]
fn monitor_prompt_runs_commands() {
    let out = run(&["monitor", "--target", "child"], "help\nshowmappings 0x800000 0x801000\nchperm 0x900000 2\nbogus\n");
    assert!(out.contains("Welcome to the exokernel monitor"));
    assert!(out.contains("chperm - Change the permission of a virtual page"));
    assert!(out.contains("  0x00801000  -           -       -       0"));
    assert!(out.contains("ERROR: page not present!"));
    assert!(out.contains("Unknown command 'bogus'"));
    assert_eq!(out.matches("K> ").count(), 5);
}
