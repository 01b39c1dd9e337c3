// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host simulator driving the exokernel model and the fork library
//! OWNERS: @tools-team
//! STATUS: Experimental
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - CLI: exo-sim [--config <toml>] [--frames N] [--max-envs N] [--log-level L]
//!          [scenario --mode fork|sfork | monitor --mode .. --target parent|child]
//!
//! DEPENDENCIES:
//!   - clap: argument parsing
//!   - serde + toml: configuration file
//!   - env_logger: log output for the library crates

#![forbid(unsafe_code)]
#![deny(clippy::all)]

pub mod cli;
pub mod config;
pub mod scenario;
