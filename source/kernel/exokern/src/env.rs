// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Environment table with generation-stamped identifiers.

use exo_abi::{EnvId, EnvStatus, SysError, SysResult, UpcallEntry, ENV_GEN_STEP, NENV};

use crate::mm::page_table::PageDirectory;

/// A single environment: one address space, one upcall, one identity.
pub struct Env {
    /// Own identity.
    pub id: EnvId,
    /// Creator; [`EnvId::CURRENT`] for roots.
    pub parent: EnvId,
    /// Scheduling status.
    pub status: EnvStatus,
    /// Address space.
    pub pgdir: PageDirectory,
    /// Registered page-fault upcall.
    pub upcall: Option<UpcallEntry>,
    /// Set on children until they observe their exofork return value.
    pub(crate) resume_exofork: bool,
}

impl Env {
    fn new(id: EnvId, parent: EnvId) -> Self {
        Self {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            pgdir: PageDirectory::new(),
            upcall: None,
            resume_exofork: false,
        }
    }
}

/// Fixed-capacity table of environments.
pub struct EnvTable {
    slots: Vec<Option<Env>>,
    last_ids: Vec<i32>,
}

impl EnvTable {
    /// Table with `capacity` slots, clamped to `1..=NENV`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, NENV);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, last_ids: vec![0; capacity] }
    }

    /// Allocates a not-runnable environment whose parent is `parent`.
    pub fn alloc(&mut self, parent: EnvId) -> SysResult<EnvId> {
        let slot = self.slots.iter().position(Option::is_none).ok_or(SysError::NoFreeEnv)?;
        let mut generation = self.last_ids[slot].wrapping_add(ENV_GEN_STEP) & !(NENV as i32 - 1);
        if generation <= 0 {
            generation = ENV_GEN_STEP;
        }
        let id = EnvId::from_raw(generation | slot as i32);
        self.last_ids[slot] = id.raw();
        self.slots[slot] = Some(Env::new(id, parent));
        Ok(id)
    }

    /// Live environment `id`; stale generations resolve to `None`.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots.get(id.slot())?.as_ref().filter(|env| env.id == id)
    }

    /// Mutable counterpart of [`EnvTable::get`].
    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots.get_mut(id.slot())?.as_mut().filter(|env| env.id == id)
    }

    /// Resolves `id` on behalf of `caller`.
    ///
    /// `EnvId::CURRENT` names the caller. With `checkperm`, the target must be
    /// the caller itself or one of its immediate children.
    pub fn resolve(&self, caller: EnvId, id: EnvId, checkperm: bool) -> SysResult<EnvId> {
        if id.is_current() {
            return self.get(caller).map(|env| env.id).ok_or(SysError::BadEnv);
        }
        let env = self.get(id).ok_or(SysError::BadEnv)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(SysError::BadEnv);
        }
        Ok(env.id)
    }

    /// Removes `id` from the table, handing back the environment for teardown.
    pub fn take(&mut self, id: EnvId) -> Option<Env> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.as_ref().map(|env| env.id) != Some(id) {
            return None;
        }
        slot.take()
    }

    /// Every live environment in slot order.
    pub fn live(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().flatten()
    }
}
