// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel monitor commands for inspecting and patching page tables
//! OWNERS: @kernel-team
//!
//! Commands never fail towards the dispatcher: argument and lookup errors are
//! printed and the command still returns `Ok`. The typed entry points
//! [`inspect_range`] and [`change_perm`] report errors as values instead.

use core::fmt;

use exo_abi::{Pte, PteFlags, VirtAddr, PGSIZE, PTE_LOW};

use crate::mm::page_table::PageDirectory;

/// Maximum whitespace-separated tokens per command line, command included.
pub const MAXARGS: usize = 16;

/// Handler signature: arguments (command name first), target directory, output.
pub type CommandFn = fn(&[&str], &mut PageDirectory, &mut dyn fmt::Write) -> fmt::Result;

/// A monitor command.
pub struct Command {
    /// Word typed at the prompt.
    pub name: &'static str,
    /// One-line summary printed by `help`.
    pub desc: &'static str,
    /// Handler.
    pub func: CommandFn,
}

/// Commands known to [`runcmd`].
pub const COMMANDS: &[Command] = &[
    Command { name: "help", desc: "Display this list of commands", func: mon_help },
    Command { name: "showmappings", desc: "Display physical page mappings", func: mon_showmappings },
    Command { name: "chperm", desc: "Change the permission of a virtual page", func: mon_chperm },
];

/// Errors from the typed monitor entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// Unparsable address or unsupported permission code.
    #[error("parameters not correct")]
    BadArgument,
    /// No present page at the address.
    #[error("page not present")]
    NotPresent,
}

/// One row of a mapping listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingRow {
    /// No page table covers the address.
    NoTable(VirtAddr),
    /// The page table exists but the page is not present.
    NotPresent(VirtAddr),
    /// A present page and its entry.
    Present {
        /// Page address.
        va: VirtAddr,
        /// Entry mapping it.
        pte: Pte,
    },
}

impl MappingRow {
    /// Page address of the row.
    pub fn va(&self) -> VirtAddr {
        match *self {
            Self::NoTable(va) | Self::NotPresent(va) => va,
            Self::Present { va, .. } => va,
        }
    }
}

impl fmt::Display for MappingRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NoTable(va) => write!(f, "  {va}  -           -       -       -"),
            Self::NotPresent(va) => write!(f, "  {va}  -           -       -       0"),
            Self::Present { va, pte } => {
                let bit = |flag: PteFlags| u8::from(pte.flags().contains(flag));
                write!(
                    f,
                    "  {va}  {}  {}       {}       {}",
                    pte.frame(),
                    bit(PteFlags::USER),
                    bit(PteFlags::WRITABLE),
                    bit(PteFlags::PRESENT)
                )
            }
        }
    }
}

/// Lists every page from `begin` to `end` inclusive, both rounded down to a
/// page boundary. The walk stops at the last page of the address space.
pub fn inspect_range(pgdir: &PageDirectory, begin: VirtAddr, end: VirtAddr) -> Vec<MappingRow> {
    let end = end.round_down();
    let mut rows = Vec::new();
    let mut va = Some(begin.round_down());
    while let Some(at) = va.filter(|at| *at <= end) {
        let row = match pgdir.lookup(at) {
            None => MappingRow::NoTable(at),
            Some(pte) if !pte.is_present() => MappingRow::NotPresent(at),
            Some(pte) => MappingRow::Present { va: at, pte },
        };
        rows.push(row);
        va = at.checked_add(PGSIZE);
    }
    rows
}

/// Overwrites the low permission bits of the page containing `va`.
///
/// `code` is 0, 2, 4 or 6: Writable is bit 1, User is bit 2, Present is
/// always set. The frame and every other bit are left alone.
///
/// This bypasses copy-on-write bookkeeping entirely: granting Writable on a
/// shared COW page lets writes reach every environment mapping that frame.
pub fn change_perm(pgdir: &mut PageDirectory, va: VirtAddr, code: u32) -> Result<Pte, MonitorError> {
    if code > 6 || code % 2 != 0 {
        return Err(MonitorError::BadArgument);
    }
    let low = PteFlags::from_bits_truncate(code) | PteFlags::PRESENT;
    let entry = pgdir.walk_mut(va.round_down()).filter(|pte| pte.is_present());
    let Some(entry) = entry else {
        return Err(MonitorError::NotPresent);
    };
    *entry = entry.with_low_perms(low & PTE_LOW);
    log::info!(target: "exokern::monitor", "chperm {} -> {:?}", va.round_down(), *entry);
    Ok(*entry)
}

/// Parses a hexadecimal address with an optional `0x` prefix.
pub fn parse_hex(text: &str) -> Result<VirtAddr, MonitorError> {
    let digits =
        text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u32::from_str_radix(digits, 16).map(VirtAddr::new).map_err(|_| MonitorError::BadArgument)
}

fn mon_help(_argv: &[&str], _pgdir: &mut PageDirectory, out: &mut dyn fmt::Write) -> fmt::Result {
    for cmd in COMMANDS {
        writeln!(out, "{} - {}", cmd.name, cmd.desc)?;
    }
    Ok(())
}

fn mon_showmappings(
    argv: &[&str],
    pgdir: &mut PageDirectory,
    out: &mut dyn fmt::Write,
) -> fmt::Result {
    if argv.len() != 3 {
        return writeln!(out, "usage: showmappings VA_BEGIN VA_END");
    }
    writeln!(out, "  VADDR       PADDR       PTE_U   PTE_W   PTE_P")?;
    let (Ok(begin), Ok(end)) = (parse_hex(argv[1]), parse_hex(argv[2])) else {
        return writeln!(out, "showmappings: ERROR: parameters not correct. See -h");
    };
    for row in inspect_range(pgdir, begin, end) {
        writeln!(out, "{row}")?;
    }
    Ok(())
}

fn mon_chperm(argv: &[&str], pgdir: &mut PageDirectory, out: &mut dyn fmt::Write) -> fmt::Result {
    if argv.len() != 3 {
        writeln!(out, "Usage: chperm VADDR PERM")?;
        writeln!(out, "Change the permission of vitual address VADDR to PERM.")?;
        writeln!(out, " PERM:\t0\t2\t4\t6")?;
        writeln!(out, " KERN:\tR\tRW\tRW\tRW")?;
        return writeln!(out, " USER:\t-\t-\tR\tRW");
    }
    let parsed = parse_hex(argv[1])
        .and_then(|va| argv[2].parse::<u32>().map(|code| (va, code)).map_err(|_| MonitorError::BadArgument));
    let result = parsed.and_then(|(va, code)| change_perm(pgdir, va, code));
    match result {
        Ok(_) => Ok(()),
        Err(MonitorError::BadArgument) => writeln!(out, "ERROR: parameters not correct!"),
        Err(MonitorError::NotPresent) => writeln!(out, "ERROR: page not present!"),
    }
}

/// Tokenizes `line` and dispatches it to the matching command.
pub fn runcmd(line: &str, pgdir: &mut PageDirectory, out: &mut dyn fmt::Write) -> fmt::Result {
    let argv: Vec<&str> = line.split_whitespace().collect();
    if argv.len() >= MAXARGS {
        return writeln!(out, "Too many arguments (max {MAXARGS})");
    }
    let Some(name) = argv.first() else {
        return Ok(());
    };
    match COMMANDS.iter().find(|cmd| cmd.name == *name) {
        Some(cmd) => (cmd.func)(&argv, pgdir, out),
        None => writeln!(out, "Unknown command '{name}'"),
    }
}
