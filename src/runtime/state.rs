//! Runtime storage for gamevars and gamearrays, plus the engine RNG.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::Program;
use crate::bytecode::ir::{ArrayBacking, ArrayDecl, ArrayId, VarDecl, VarId, VarStorage};
use crate::lang::limits::{MAXPLAYERS, MAXSPRITES};
use crate::runtime::runtime_error::VmError;

/// Largest size `resizearray` accepts.
pub const MAX_ARRAY_SIZE: i32 = 1 << 24;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown gamearray '{0}'")]
    UnknownArray(String),
    #[error("gamearray '{0}' is not external")]
    NotExternal(String),
    #[error("snapshot codec error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Whose per-actor and per-player slots a dispatch reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scope {
    pub actor: Option<i32>,
    pub player: Option<i32>,
}

impl Scope {
    pub fn new(actor: Option<i32>, player: Option<i32>) -> Self {
        Scope { actor, player }
    }
}

#[derive(Debug, Clone)]
enum VarValues {
    Global(i32),
    PerPlayer(Vec<i32>),
    /// Grown on first write; actors never written read the default.
    PerActor(Vec<i32>),
    System,
}

impl VarValues {
    fn fresh(decl: &VarDecl) -> Self {
        match decl.storage {
            VarStorage::Global => VarValues::Global(decl.default),
            VarStorage::PerPlayer => VarValues::PerPlayer(vec![decl.default; MAXPLAYERS as usize]),
            VarStorage::PerActor => VarValues::PerActor(Vec::new()),
            VarStorage::System => VarValues::System,
        }
    }
}

#[derive(Debug, Clone)]
enum ArrayValues {
    Owned(Vec<i32>),
    External(Option<Rc<RefCell<Vec<i32>>>>),
}

impl ArrayValues {
    fn fresh(decl: &ArrayDecl) -> Self {
        match decl.backing {
            ArrayBacking::Owned => ArrayValues::Owned(vec![0; decl.size.max(0) as usize]),
            ArrayBacking::External => ArrayValues::External(None),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum SavedVar {
    Global(i32),
    PerPlayer(Vec<i32>),
    PerActor(Vec<i32>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    vars: Vec<(String, SavedVar)>,
    arrays: Vec<(String, Vec<i32>)>,
}

/// Everything a script can mutate apart from the object store.
#[derive(Debug, Clone)]
pub struct EngineState {
    var_decls: Vec<VarDecl>,
    array_decls: Vec<ArrayDecl>,
    vars: Vec<VarValues>,
    arrays: Vec<ArrayValues>,
    seed: u32,
}

impl EngineState {
    pub fn new(program: &Program) -> Self {
        EngineState {
            vars: program.vars.iter().map(VarValues::fresh).collect(),
            arrays: program.arrays.iter().map(ArrayValues::fresh).collect(),
            var_decls: program.vars.clone(),
            array_decls: program.arrays.clone(),
            seed: 0,
        }
    }

    pub fn set_seed(&mut self, seed: u32) {
        self.seed = seed;
    }

    /// Next value of the engine LCG, in `0..65536`.
    pub fn krand(&mut self) -> i32 {
        self.seed = self.seed.wrapping_mul(1664525).wrapping_add(221297);
        (self.seed >> 16) as i32
    }

    pub fn var_id(&self, name: &str) -> Option<VarId> {
        self.var_decls
            .iter()
            .position(|d| d.name == name)
            .map(|i| VarId(i as u32))
    }

    pub fn array_id(&self, name: &str) -> Option<ArrayId> {
        self.array_decls
            .iter()
            .position(|d| d.name == name)
            .map(|i| ArrayId(i as u32))
    }

    fn var_decl(&self, id: VarId) -> Result<&VarDecl, VmError> {
        self.var_decls
            .get(id.index())
            .ok_or_else(|| VmError::Runtime(format!("unknown gamevar #{}", id.0)))
    }

    pub fn get_var(&self, id: VarId, scope: Scope) -> Result<i32, VmError> {
        let decl = self.var_decl(id)?;
        match &self.vars[id.index()] {
            VarValues::Global(v) => Ok(*v),
            VarValues::PerPlayer(values) => Ok(values[player_slot(scope)?]),
            VarValues::PerActor(values) => Ok(values
                .get(actor_slot(scope)?)
                .copied()
                .unwrap_or(decl.default)),
            VarValues::System => Ok(match id {
                VarId::THISACTOR => scope.actor.unwrap_or(-1),
                VarId::THISPLAYER => scope.player.unwrap_or(-1),
                _ => 0,
            }),
        }
    }

    pub fn set_var(&mut self, id: VarId, value: i32, scope: Scope) -> Result<(), VmError> {
        let default = self.var_decl(id)?.default;
        match &mut self.vars[id.index()] {
            VarValues::Global(v) => *v = value,
            VarValues::PerPlayer(values) => values[player_slot(scope)?] = value,
            VarValues::PerActor(values) => {
                let slot = actor_slot(scope)?;
                if slot >= values.len() {
                    values.resize(slot + 1, default);
                }
                values[slot] = value;
            }
            VarValues::System => {
                return Err(VmError::Runtime(format!(
                    "gamevar '{}' is read-only",
                    self.var_decls[id.index()].name
                )));
            }
        }
        Ok(())
    }

    pub fn array_get(&self, id: ArrayId, index: i32) -> Result<i32, VmError> {
        let decl = array_decl(&self.array_decls, id)?;
        let read = |values: &[i32]| {
            usize::try_from(index)
                .ok()
                .and_then(|i| values.get(i).copied())
                .ok_or_else(|| out_of_bounds(decl, index, values.len()))
        };
        match &self.arrays[id.index()] {
            ArrayValues::Owned(values) => read(values.as_slice()),
            ArrayValues::External(Some(buf)) => read(buf.borrow().as_slice()),
            ArrayValues::External(None) => Err(VmError::Unbound(decl.name.clone())),
        }
    }

    pub fn array_set(&mut self, id: ArrayId, index: i32, value: i32) -> Result<(), VmError> {
        let decl = array_decl(&self.array_decls, id)?;
        match &mut self.arrays[id.index()] {
            ArrayValues::Owned(values) => {
                let len = values.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| values.get_mut(i))
                    .ok_or_else(|| out_of_bounds(decl, index, len))?;
                *slot = value;
                Ok(())
            }
            ArrayValues::External(_) => Err(VmError::Runtime(format!(
                "gamearray '{}' is read-only",
                decl.name
            ))),
        }
    }

    pub fn array_size(&self, id: ArrayId) -> Result<i32, VmError> {
        let decl = array_decl(&self.array_decls, id)?;
        match &self.arrays[id.index()] {
            ArrayValues::Owned(values) => Ok(values.len() as i32),
            ArrayValues::External(Some(buf)) => Ok(buf.borrow().len() as i32),
            ArrayValues::External(None) => Err(VmError::Unbound(decl.name.clone())),
        }
    }

    /// New slots are zero filled.
    pub fn resize_array(&mut self, id: ArrayId, size: i32) -> Result<(), VmError> {
        let decl = array_decl(&self.array_decls, id)?;
        if !(0..=MAX_ARRAY_SIZE).contains(&size) {
            return Err(VmError::range(format!(
                "invalid size {} for gamearray '{}'",
                size, decl.name
            )));
        }
        match &mut self.arrays[id.index()] {
            ArrayValues::Owned(values) => {
                values.resize(size as usize, 0);
                Ok(())
            }
            ArrayValues::External(_) => Err(VmError::Runtime(format!(
                "cannot resize external gamearray '{}'",
                decl.name
            ))),
        }
    }

    /// Copies `count` elements. Both ranges must be in bounds or nothing is
    /// copied.
    pub fn copy_array(
        &mut self,
        src: ArrayId,
        src_index: i32,
        dst: ArrayId,
        dst_index: i32,
        count: i32,
    ) -> Result<(), VmError> {
        if count < 0 {
            return Err(VmError::range(format!("negative copy count {}", count)));
        }
        let size = self.array_size(src)?;
        check_span(array_decl(&self.array_decls, src)?, src_index, count, size)?;
        let values: Vec<i32> = (src_index..src_index + count)
            .map(|i| self.array_get(src, i))
            .collect::<Result<_, _>>()?;

        let size = self.array_size(dst)?;
        check_span(array_decl(&self.array_decls, dst)?, dst_index, count, size)?;
        for (i, value) in values.into_iter().enumerate() {
            self.array_set(dst, dst_index + i as i32, value)?;
        }
        Ok(())
    }

    /// Attaches a host buffer to an external gamearray.
    pub fn bind_external(
        &mut self,
        name: &str,
        buffer: Rc<RefCell<Vec<i32>>>,
    ) -> Result<(), StateError> {
        let id = self
            .array_id(name)
            .ok_or_else(|| StateError::UnknownArray(name.to_string()))?;
        match &mut self.arrays[id.index()] {
            ArrayValues::External(slot) => {
                *slot = Some(buffer);
                Ok(())
            }
            ArrayValues::Owned(_) => Err(StateError::NotExternal(name.to_string())),
        }
    }

    /// Forgets every per-actor value of `actor`, e.g. when its sprite slot
    /// is freed or reused.
    pub fn reset_actor(&mut self, actor: i32) {
        let Ok(slot) = usize::try_from(actor) else {
            return;
        };
        for (decl, values) in self.var_decls.iter().zip(self.vars.iter_mut()) {
            if let VarValues::PerActor(values) = values {
                if let Some(v) = values.get_mut(slot) {
                    *v = decl.default;
                }
            }
        }
    }

    /// Restores every gamevar without NORESET and every owned gamearray to
    /// its declared state.
    pub fn reset_level(&mut self) {
        for (decl, values) in self.var_decls.iter().zip(self.vars.iter_mut()) {
            if !decl.flags.noreset() {
                *values = VarValues::fresh(decl);
            }
        }
        for (decl, values) in self.array_decls.iter().zip(self.arrays.iter_mut()) {
            if let ArrayValues::Owned(_) = values {
                *values = ArrayValues::fresh(decl);
            }
        }
    }

    /// Encodes NORESET gamevars and owned gamearrays, keyed by name.
    pub fn save_persistent(&self) -> Result<Vec<u8>, StateError> {
        let mut snapshot = Snapshot::default();
        for (decl, values) in self.var_decls.iter().zip(&self.vars) {
            if !decl.flags.noreset() {
                continue;
            }
            let saved = match values {
                VarValues::Global(v) => SavedVar::Global(*v),
                VarValues::PerPlayer(v) => SavedVar::PerPlayer(v.clone()),
                VarValues::PerActor(v) => SavedVar::PerActor(v.clone()),
                VarValues::System => continue,
            };
            snapshot.vars.push((decl.name.clone(), saved));
        }
        for (decl, values) in self.array_decls.iter().zip(&self.arrays) {
            if let ArrayValues::Owned(v) = values {
                snapshot.arrays.push((decl.name.clone(), v.clone()));
            }
        }
        Ok(postcard::to_allocvec(&snapshot)?)
    }

    /// Applies a snapshot. Names the program no longer declares, or whose
    /// storage changed, are skipped.
    pub fn load_persistent(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let snapshot: Snapshot = postcard::from_bytes(bytes)?;
        for (name, saved) in snapshot.vars {
            let Some(id) = self.var_id(&name) else {
                log::debug!("snapshot gamevar '{}' no longer declared", name);
                continue;
            };
            match (&mut self.vars[id.index()], saved) {
                (VarValues::Global(v), SavedVar::Global(s)) => *v = s,
                (VarValues::PerPlayer(v), SavedVar::PerPlayer(s)) if s.len() == v.len() => *v = s,
                (VarValues::PerActor(v), SavedVar::PerActor(s)) => *v = s,
                _ => log::debug!("snapshot gamevar '{}' changed storage", name),
            }
        }
        for (name, saved) in snapshot.arrays {
            match self.array_id(&name).map(|id| &mut self.arrays[id.index()]) {
                Some(ArrayValues::Owned(v)) => *v = saved,
                _ => log::debug!("snapshot gamearray '{}' skipped", name),
            }
        }
        Ok(())
    }
}

fn array_decl(decls: &[ArrayDecl], id: ArrayId) -> Result<&ArrayDecl, VmError> {
    decls
        .get(id.index())
        .ok_or_else(|| VmError::Runtime(format!("unknown gamearray #{}", id.0)))
}

fn player_slot(scope: Scope) -> Result<usize, VmError> {
    let player = scope.player.unwrap_or(0);
    if !(0..MAXPLAYERS).contains(&player) {
        return Err(VmError::range(format!("player {} out of range", player)));
    }
    Ok(player as usize)
}

fn actor_slot(scope: Scope) -> Result<usize, VmError> {
    let actor = scope.actor.ok_or(VmError::NoActor)?;
    if !(0..MAXSPRITES).contains(&actor) {
        return Err(VmError::range(format!("actor {} out of range", actor)));
    }
    Ok(actor as usize)
}

fn out_of_bounds(decl: &ArrayDecl, index: i32, len: usize) -> VmError {
    VmError::range(format!(
        "index {} out of bounds for gamearray '{}' (size {})",
        index, decl.name, len
    ))
}

fn check_span(decl: &ArrayDecl, start: i32, count: i32, size: i32) -> Result<(), VmError> {
    if start < 0 || start as i64 + count as i64 > size as i64 {
        return Err(VmError::range(format!(
            "copy of {} elements at {} exceeds gamearray '{}' (size {})",
            count, start, decl.name, size
        )));
    }
    Ok(())
}
