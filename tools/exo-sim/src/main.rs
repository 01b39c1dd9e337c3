// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    if let Err(err) = exo_sim::cli::run() {
        eprintln!("exo-sim: {err}");
        std::process::exit(1);
    }
}
