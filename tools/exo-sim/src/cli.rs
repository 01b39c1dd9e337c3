// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Command-line surface of the simulator.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use exo_abi::EnvId;
use exokern::{KernelError, Machine};
use log::info;

use crate::config::{ConfigError, SimConfig};
use crate::scenario::{self, ForkMode, ScenarioError};

#[derive(Debug, Parser)]
#[command(name = "exo-sim", about = "Host exokernel with user-level copy-on-write fork")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Physical frames (overrides the config file).
    #[arg(long)]
    pub frames: Option<usize>,
    /// Environment table size (overrides the config file).
    #[arg(long)]
    pub max_envs: Option<usize>,
    /// Log filter when RUST_LOG is unset (overrides the config file).
    #[arg(long)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Copy, Debug, Subcommand)]
pub enum Command {
    /// Run the fork scenario at 0x800000 and print the mappings.
    Scenario {
        #[arg(long, value_enum, default_value_t = ForkMode::Fork)]
        mode: ForkMode,
    },
    /// Run the scenario, then read monitor commands from stdin.
    Monitor {
        #[arg(long, value_enum, default_value_t = ForkMode::Fork)]
        mode: ForkMode,
        /// Environment whose page directory the commands act on.
        #[arg(long, value_enum, default_value_t = Target::Parent)]
        target: Target,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Parent,
    Child,
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Final configuration: file values with command-line overrides applied.
pub fn resolve_config(cli: &Cli) -> Result<SimConfig, ConfigError> {
    let mut cfg = SimConfig::load(cli.config.as_deref())?;
    if let Some(frames) = cli.frames {
        cfg.machine.frames = frames;
    }
    if let Some(max_envs) = cli.max_envs {
        cfg.machine.max_envs = max_envs;
    }
    if let Some(level) = &cli.log_level {
        cfg.log.level = level.clone();
    }
    Ok(cfg)
}

/// Runs the selected command; monitor input is read from `input`.
pub fn execute(
    cli: &Cli,
    cfg: &SimConfig,
    input: impl BufRead,
    out: &mut impl Write,
) -> Result<(), SimError> {
    let machine = Machine::new(cfg.machine_config());
    match cli.command.unwrap_or(Command::Scenario { mode: ForkMode::Fork }) {
        Command::Scenario { mode } => {
            let report = scenario::run(&machine, mode)?;
            for line in &report.lines {
                writeln!(out, "{line}")?;
            }
        }
        Command::Monitor { mode, target } => {
            let report = scenario::run(&machine, mode)?;
            let env = match target {
                Target::Parent => report.parent,
                Target::Child => report.child,
            };
            monitor_loop(&machine, env, input, out)?;
        }
    }
    Ok(())
}

/// Line loop in the style of the kernel monitor prompt.
pub fn monitor_loop(
    machine: &Machine,
    env: EnvId,
    input: impl BufRead,
    out: &mut impl Write,
) -> Result<(), SimError> {
    writeln!(out, "Welcome to the exokernel monitor (env {env}).")?;
    writeln!(out, "Type 'help' for a list of commands.")?;
    write!(out, "K> ")?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        write!(out, "{}", machine.monitor(env, &line)?)?;
        write!(out, "K> ")?;
        out.flush()?;
    }
    writeln!(out)?;
    Ok(())
}

/// Parses `std::env::args`, installs the logger and runs.
pub fn run() -> Result<(), SimError> {
    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log.level.as_str()))
        .init();
    info!(
        "machine: {} frames, {} environments",
        cfg.machine.frames, cfg.machine.max_envs
    );
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    execute(&cli, &cfg, stdin.lock(), &mut stdout)
}
