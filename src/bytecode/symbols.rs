//! Compile-time symbol table: labels, gamevars, gamearrays and defines.
//!
//! Member labels are static and live in `lang::labels`.

use std::collections::HashMap;

use thiserror::Error;

use crate::bytecode::ir::{
    ArrayBacking, ArrayDecl, ArrayId, Label, LabelId, LabelKind, VarDecl, VarFlags, VarId,
    VarStorage,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("invalid size {size} for gamearray '{name}'")]
    InvalidSize { name: String, size: i32 },
}

/// What a name stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRef {
    Define(i32),
    Var(VarId),
    Array(ArrayId),
    Label(LabelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefineOutcome {
    New,
    Same,
    Changed(i32),
}

const SYSTEM_VARS: &[(&str, VarStorage, u32)] = &[
    ("RETURN", VarStorage::Global, 0),
    ("THISACTOR", VarStorage::System, VarFlags::READONLY),
    ("THISPLAYER", VarStorage::System, VarFlags::READONLY),
];

#[derive(Debug, Clone)]
pub struct SymbolTable {
    labels: Vec<Label>,
    label_index: HashMap<String, LabelId>,

    vars: Vec<VarDecl>,
    var_index: HashMap<String, VarId>,

    arrays: Vec<ArrayDecl>,
    array_index: HashMap<String, ArrayId>,

    defines: HashMap<String, i32>,
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            labels: Vec::new(),
            label_index: HashMap::new(),
            vars: Vec::new(),
            var_index: HashMap::new(),
            arrays: Vec::new(),
            array_index: HashMap::new(),
            defines: HashMap::new(),
        };
        for (name, storage, flags) in SYSTEM_VARS {
            let id = VarId(table.vars.len() as u32);
            let mut decl = VarDecl::new(name, 0, VarFlags(*flags));
            decl.storage = *storage;
            table.vars.push(decl);
            table.var_index.insert(name.to_string(), id);
        }
        table
    }

    pub fn is_system_var(&self, id: VarId) -> bool {
        id.index() < SYSTEM_VARS.len()
    }

    // Labels

    /// Defines a label. A label that was only referenced so far keeps its id.
    pub fn declare_label(
        &mut self,
        name: &str,
        kind: LabelKind,
        line: usize,
    ) -> Result<LabelId, SymbolError> {
        if let Some(&id) = self.label_index.get(name) {
            let label = &mut self.labels[id.index()];
            if label.offset.is_some() && kind != LabelKind::Event {
                return Err(SymbolError::DuplicateLabel(name.to_string()));
            }
            label.kind = kind;
            label.line = line;
            return Ok(id);
        }
        Ok(self.push_label(name, kind, line))
    }

    /// Looks up a state label, creating a forward reference when absent.
    pub fn reference_label(&mut self, name: &str, line: usize) -> LabelId {
        match self.label_index.get(name) {
            Some(&id) => id,
            None => self.push_label(name, LabelKind::State, line),
        }
    }

    fn push_label(&mut self, name: &str, kind: LabelKind, line: usize) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(Label {
            name: name.to_string(),
            kind,
            offset: None,
            size: 0,
            line,
        });
        self.label_index.insert(name.to_string(), id);
        id
    }

    pub fn label(&self, id: LabelId) -> &Label {
        &self.labels[id.index()]
    }

    pub fn set_label_offset(&mut self, id: LabelId, offset: u32) {
        self.labels[id.index()].offset = Some(offset);
    }

    pub fn set_label_size(&mut self, id: LabelId, size: u32) {
        self.labels[id.index()].size = size;
    }

    // Gamevars

    /// Declares a gamevar. Returns `true` as second value when the name was
    /// already declared; the new default and flags replace the old ones.
    pub fn declare_var(&mut self, name: &str, default: i32, flags: VarFlags) -> (VarId, bool) {
        let decl = VarDecl::new(name, default, flags);
        match self.var_index.get(name) {
            Some(&id) => {
                self.vars[id.index()] = decl;
                (id, true)
            }
            None => {
                let id = VarId(self.vars.len() as u32);
                self.vars.push(decl);
                self.var_index.insert(name.to_string(), id);
                (id, false)
            }
        }
    }

    pub fn var(&self, id: VarId) -> &VarDecl {
        &self.vars[id.index()]
    }

    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.var_index.get(name).copied()
    }

    // Gamearrays

    pub fn declare_array(
        &mut self,
        name: &str,
        size: i32,
        backing: ArrayBacking,
    ) -> Result<ArrayId, SymbolError> {
        if size < 0 {
            return Err(SymbolError::InvalidSize {
                name: name.to_string(),
                size,
            });
        }
        let decl = ArrayDecl {
            name: name.to_string(),
            size,
            backing,
        };
        match self.array_index.get(name) {
            Some(&id) => {
                self.arrays[id.index()] = decl;
                Ok(id)
            }
            None => {
                let id = ArrayId(self.arrays.len() as u32);
                self.arrays.push(decl);
                self.array_index.insert(name.to_string(), id);
                Ok(id)
            }
        }
    }

    pub fn array(&self, id: ArrayId) -> &ArrayDecl {
        &self.arrays[id.index()]
    }

    // Defines

    pub fn define(&mut self, name: &str, value: i32) -> DefineOutcome {
        match self.defines.insert(name.to_string(), value) {
            None => DefineOutcome::New,
            Some(old) if old == value => DefineOutcome::Same,
            Some(old) => DefineOutcome::Changed(old),
        }
    }

    pub fn find_define(&self, name: &str) -> Option<i32> {
        self.defines.get(name).copied()
    }

    /// Resolves a name. Gamevars shadow arrays, defines and labels.
    pub fn resolve(&self, name: &str) -> Result<SymbolRef, SymbolError> {
        if let Some(&id) = self.var_index.get(name) {
            return Ok(SymbolRef::Var(id));
        }
        if let Some(&id) = self.array_index.get(name) {
            return Ok(SymbolRef::Array(id));
        }
        if let Some(&value) = self.defines.get(name) {
            return Ok(SymbolRef::Define(value));
        }
        if let Some(&id) = self.label_index.get(name) {
            return Ok(SymbolRef::Label(id));
        }
        Err(SymbolError::UnknownSymbol(name.to_string()))
    }

    pub fn into_parts(self) -> (Vec<Label>, Vec<VarDecl>, Vec<ArrayDecl>) {
        (self.labels, self.vars, self.arrays)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
