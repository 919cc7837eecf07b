use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bytecode::Op;
use crate::bytecode::op::{Operand, Place};
use crate::lang::events::EventId;
use crate::lang::limits::MAX_EVENTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArrayId(pub u32);

impl VarId {
    pub const RETURN: VarId = VarId(0);
    pub const THISACTOR: VarId = VarId(1);
    pub const THISPLAYER: VarId = VarId(2);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ArrayId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl LabelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelKind {
    State,
    Actor,
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub kind: LabelKind,
    /// `None` while the label has only been referenced.
    pub offset: Option<u32>,
    pub size: u32,
    pub line: usize,
}

/// Gamevar flag bits as written in scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VarFlags(pub u32);

impl VarFlags {
    pub const PERPLAYER: u32 = 0x1;
    pub const PERACTOR: u32 = 0x2;
    pub const READONLY: u32 = 0x1000;
    pub const NORESET: u32 = 0x20000;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn readonly(self) -> bool {
        self.contains(Self::READONLY)
    }

    pub fn noreset(self) -> bool {
        self.contains(Self::NORESET)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarStorage {
    Global,
    PerPlayer,
    PerActor,
    /// Computed from the dispatch context (`THISACTOR`, `THISPLAYER`).
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub default: i32,
    pub flags: VarFlags,
    pub storage: VarStorage,
}

impl VarDecl {
    pub fn new(name: &str, default: i32, flags: VarFlags) -> Self {
        let storage = if flags.contains(VarFlags::PERPLAYER) {
            VarStorage::PerPlayer
        } else if flags.contains(VarFlags::PERACTOR) {
            VarStorage::PerActor
        } else {
            VarStorage::Global
        };
        VarDecl {
            name: name.to_string(),
            default,
            flags,
            storage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayBacking {
    Owned,
    /// Bound to a host buffer at runtime; read-only to scripts.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayDecl {
    pub name: String,
    pub size: i32,
    pub backing: ArrayBacking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourcePos {
    pub file: u16,
    pub line: u32,
}

/// A compiled script program. Never mutated after compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<Op>,
    /// Source position of every instruction, parallel to `code`.
    pub lines: Vec<SourcePos>,
    pub files: Vec<String>,

    pub labels: Vec<Label>,
    /// Entry offsets indexed by event id; slot 0 is unused.
    pub events: Vec<Option<u32>>,
    /// Actor entry offsets keyed by tile number.
    pub actors: BTreeMap<i32, u32>,

    pub vars: Vec<VarDecl>,
    pub arrays: Vec<ArrayDecl>,
}

impl Program {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            lines: Vec::new(),
            files: Vec::new(),
            labels: Vec::new(),
            events: vec![None; MAX_EVENTS + 1],
            actors: BTreeMap::new(),
            vars: Vec::new(),
            arrays: Vec::new(),
        }
    }

    pub fn event_offset(&self, event: EventId) -> Option<u32> {
        self.events.get(event.index()).copied().flatten()
    }

    pub fn actor_offset(&self, tile: i32) -> Option<u32> {
        self.actors.get(&tile).copied()
    }

    /// `file:line` of an instruction, for diagnostics.
    pub fn location(&self, ip: usize) -> String {
        match self.lines.get(ip) {
            Some(pos) => {
                let file = self
                    .files
                    .get(pos.file as usize)
                    .map(String::as_str)
                    .unwrap_or("?");
                format!("{}:{}", file, pos.line)
            }
            None => format!("@{}", ip),
        }
    }

    pub fn var_name(&self, id: VarId) -> &str {
        self.vars
            .get(id.index())
            .map(|v| v.name.as_str())
            .unwrap_or("?")
    }

    pub fn array_name(&self, id: ArrayId) -> &str {
        self.arrays
            .get(id.index())
            .map(|a| a.name.as_str())
            .unwrap_or("?")
    }

    pub fn label_name(&self, id: LabelId) -> &str {
        self.labels
            .get(id.index())
            .map(|l| l.name.as_str())
            .unwrap_or("?")
    }

    pub fn operand_text(&self, operand: &Operand) -> String {
        match operand {
            Operand::Imm(n) => n.to_string(),
            Operand::Var(v) => self.var_name(*v).to_string(),
            Operand::Elem(a, i) => format!("{}[{}]", self.array_name(*a), self.operand_text(i)),
        }
    }

    pub fn place_text(&self, place: &Place) -> String {
        self.operand_text(&place.as_operand())
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
