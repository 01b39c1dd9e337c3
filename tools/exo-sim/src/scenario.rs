// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The reference copy-on-write scenario at `UTEXT` (0x800000).

use exo_abi::{AddressSpaceView, EnvId, Perm, Pte, SysError, Syscalls, UTEXT};
use exo_fork::Process;
use exokern::{EnvHandle, KernelError, Machine};

const PATTERN: &[u8] = b"copy-on-write";

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ForkMode {
    /// Copy-on-write fork.
    Fork,
    /// Shared-memory fork.
    Sfork,
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("check failed: {0}")]
    Check(String),
}

impl From<SysError> for ScenarioError {
    fn from(err: SysError) -> Self {
        Self::Kernel(err.into())
    }
}

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct Report {
    pub parent: EnvId,
    pub child: EnvId,
    pub lines: Vec<String>,
}

fn check(ok: bool, what: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if ok {
        Ok(())
    } else {
        Err(ScenarioError::Check(what()))
    }
}

fn snapshot(machine: &Machine, env: EnvId, label: &str, lines: &mut Vec<String>) -> Result<(), KernelError> {
    lines.push(format!("[{label} {env}]"));
    let out = machine.monitor(env, &format!("showmappings {UTEXT} {UTEXT}"))?;
    lines.extend(out.lines().map(str::to_string));
    Ok(())
}

/// Maps `UTEXT` writable in a fresh parent, forks, writes one byte in the
/// child and verifies who ends up with which frame.
pub fn run(machine: &Machine, mode: ForkMode) -> Result<Report, ScenarioError> {
    let mut parent = Process::new(machine.spawn()?);
    parent.sys().page_alloc(EnvId::CURRENT, UTEXT, Perm::USER_RW)?;
    parent.store(UTEXT, PATTERN);
    let original: Pte = parent.sys().pte_at(UTEXT);

    let child = match mode {
        ForkMode::Fork => parent.fork(),
        ForkMode::Sfork => parent.sfork(),
    };
    let mut lines = vec![format!("{mode:?}: parent {} -> child {child}", parent.this_env())];
    snapshot(machine, parent.this_env(), "parent", &mut lines)?;
    snapshot(machine, child, "child", &mut lines)?;

    let mut resumed: Process<EnvHandle> = parent.inherited(machine.handle(child));
    let again = match mode {
        ForkMode::Fork => resumed.fork(),
        ForkMode::Sfork => resumed.sfork(),
    };
    check(again.is_current(), || format!("child resumed with {again}"))?;
    check(resumed.this_env() == child, || format!("child identity {}", resumed.this_env()))?;

    resumed.store(UTEXT, b"C");
    lines.push(format!("child wrote 'C' at {UTEXT}"));
    snapshot(machine, parent.this_env(), "parent", &mut lines)?;
    snapshot(machine, child, "child", &mut lines)?;

    let mine = parent.sys().pte_at(UTEXT);
    let theirs = resumed.sys().pte_at(UTEXT);
    let mut seen = vec![0u8; PATTERN.len()];
    parent.load(UTEXT, &mut seen);
    match mode {
        ForkMode::Fork => {
            check(mine.frame() == original.frame(), || "parent frame moved".into())?;
            check(mine.is_cow(), || "parent mapping lost COW".into())?;
            check(theirs.frame() != original.frame(), || "child still shares the frame".into())?;
            check(Perm::from_pte(theirs) == Perm::USER_RW, || "child copy not writable".into())?;
            check(seen == PATTERN, || "parent observed the child's write".into())?;
        }
        ForkMode::Sfork => {
            check(theirs.frame() == original.frame(), || "child lost the shared frame".into())?;
            check(seen[0] == b'C', || "parent missed the child's write".into())?;
        }
    }
    let mut child_view = vec![0u8; PATTERN.len()];
    resumed.load(UTEXT, &mut child_view);
    check(child_view[0] == b'C' && child_view[1..] == PATTERN[1..], || {
        format!("child reads {:?}", String::from_utf8_lossy(&child_view))
    })?;
    lines.push("ok".to_string());
    Ok(Report { parent: parent.this_env(), child, lines })
}
