use thiserror::Error;

use crate::bytecode::symbols::SymbolError;
use crate::frontend::lexer::LexError;
use crate::lang::events::EventId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("{0}")]
    Lex(String),
    #[error("duplicate label '{0}'")]
    DuplicateLabel(String),
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("state '{0}' is referenced but never defined")]
    UnresolvedLabel(String),
    #[error("invalid size {size} for gamearray '{name}'")]
    InvalidSize { name: String, size: i32 },
    #[error("cannot write to read-only {0}")]
    ReadOnlyViolation(String),
    #[error("{0}")]
    Syntax(String),
    #[error("{what} {value} out of range (0..{limit})")]
    Range {
        what: &'static str,
        value: i32,
        limit: i32,
    },
    #[error("cannot include '{path}': {reason}")]
    Include { path: String, reason: String },
    #[error("too many errors, compilation aborted")]
    TooManyErrors,
    #[error("'{0}' is not a gamevar")]
    NotAVar(String),
    #[error("'{0}' is not a gamearray")]
    NotAnArray(String),
}

impl CompileError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        CompileError::Syntax(msg.into())
    }
}

impl From<SymbolError> for CompileError {
    fn from(e: SymbolError) -> Self {
        match e {
            SymbolError::DuplicateLabel(name) => CompileError::DuplicateLabel(name),
            SymbolError::UnknownSymbol(name) => CompileError::UnknownSymbol(name),
            SymbolError::InvalidSize { name, size } => CompileError::InvalidSize { name, size },
        }
    }
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError::Lex(e.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileWarning {
    #[error("gamevar '{0}' redeclared, new default replaces the old one")]
    DuplicateDefinition(String),
    #[error("backwards tile range {from}..{to}, swapped")]
    BackwardsRange { from: i32, to: i32 },
    #[error("duplicate case {0}, first one wins")]
    DuplicateCase(i32),
    #[error("define '{name}' changed from {old} to {new}")]
    RedefinedDefine { name: String, old: i32, new: i32 },
    #[error("gamevar '{0}' matches an existing define")]
    NameMatchesDefine(String),
    #[error("default include '{0}' not found")]
    DefaultIncludeMissing(String),
    #[error("{0} redefined, previous handler replaced")]
    EventRedefined(EventId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    Error(CompileError),
    Warning(CompileWarning),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: String,
    pub line: usize,
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self.kind, DiagnosticKind::Error(_))
    }

    pub fn severity(&self) -> &'static str {
        match self.kind {
            DiagnosticKind::Error(_) => "error",
            DiagnosticKind::Warning(_) => "warning",
        }
    }

    pub fn error(&self) -> Option<&CompileError> {
        match &self.kind {
            DiagnosticKind::Error(e) => Some(e),
            DiagnosticKind::Warning(_) => None,
        }
    }

    pub fn warning(&self) -> Option<&CompileWarning> {
        match &self.kind {
            DiagnosticKind::Warning(w) => Some(w),
            DiagnosticKind::Error(_) => None,
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}: ", self.file, self.line, self.severity())?;
        match &self.kind {
            DiagnosticKind::Error(e) => write!(f, "{}", e),
            DiagnosticKind::Warning(w) => write!(f, "{}", w),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &CompileError> {
        self.items.iter().filter_map(Diagnostic::error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CompileWarning> {
        self.items.iter().filter_map(Diagnostic::warning)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.is_error()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.items.len() - self.error_count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for d in &self.items {
            writeln!(f, "{}", d)?;
        }
        write!(
            f,
            "{} error(s), {} warning(s)",
            self.error_count(),
            self.warning_count()
        )
    }
}

/// A compilation unit that could not produce a program.
#[derive(Debug, Clone, Error)]
#[error("compilation failed with {} error(s)", diagnostics.error_count())]
pub struct CompileFailure {
    pub diagnostics: Diagnostics,
}
