use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Component, Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{
        compile_error::{
            CompileError, CompileFailure, CompileWarning, Diagnostic, DiagnosticKind, Diagnostics,
        },
        ir::{ArrayBacking, ArrayId, LabelId, LabelKind, Program, SourcePos, VarFlags, VarId},
        op::{ArithOp, Cmp, Cond, IterKind, Op, Operand, Place},
        symbols::{DefineOutcome, SymbolRef, SymbolTable},
    },
    frontend::{
        lexer::{Lexer, Span, Spanned},
        token::{CompareOp, Keyword, Token},
    },
    lang::{
        events::EventId,
        labels::{Field, ObjectKind, find_label},
        limits::{MAX_EVENTS, MAXSTATUS, MAXUSERTILES},
    },
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// File pulled in by `includedefault`.
    pub default_include: Option<PathBuf>,
    /// Stop after this many errors. Zero never stops.
    pub abort_error_count: usize,
    /// Gamearrays whose storage the host binds at runtime.
    pub external_arrays: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            default_include: None,
            abort_error_count: 8,
            external_arrays: Vec::new(),
        }
    }
}

/// Where included source text comes from.
pub trait SourceLoader {
    fn load(&self, path: &Path) -> std::io::Result<String>;

    /// Identity of a path for the include-once check.
    fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf>;
}

pub struct FsLoader;

impl SourceLoader for FsLoader {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf> {
        path.canonicalize()
    }
}

/// In-memory file set, keyed by lexically normalised path.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    files: HashMap<PathBuf, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl AsRef<Path>, text: &str) -> Self {
        self.insert(path, text);
        self
    }

    pub fn insert(&mut self, path: impl AsRef<Path>, text: &str) {
        self.files.insert(normalize(path.as_ref()), text.to_string());
    }
}

impl SourceLoader for MemoryLoader {
    fn load(&self, path: &Path) -> std::io::Result<String> {
        self.files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"))
    }

    fn canonicalize(&self, path: &Path) -> std::io::Result<PathBuf> {
        let path = normalize(path);
        if self.files.contains_key(&path) {
            Ok(path)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file",
            ))
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub program: Program,
    pub diagnostics: Diagnostics,
}

/// Token cursor over one source file.
struct Source {
    tokens: Vec<Spanned>,
    pos: usize,
    file: u16,
    path: PathBuf,
}

impl Source {
    fn new(mut tokens: Vec<Spanned>, file: u16, path: PathBuf) -> Self {
        if !matches!(tokens.last(), Some(Spanned { token: Token::Eof, .. })) {
            let span = tokens
                .last()
                .map(|s| s.span)
                .unwrap_or(Span { line: 1, col: 1 });
            tokens.push(Spanned {
                token: Token::Eof,
                span,
            });
        }
        Source {
            tokens,
            pos: 0,
            file,
            path,
        }
    }
}

/// A `state` call waiting for its label to be defined.
struct Fixup {
    at: usize,
    label: LabelId,
    pos: SourcePos,
}

/// Emission state to restore when a statement fails.
#[derive(Clone, Copy)]
struct Mark {
    code: usize,
    breaks: usize,
}

#[derive(Clone, Copy)]
enum StmtEnd<'a> {
    Brace,
    Keywords(&'a [Keyword]),
}

const CASE_END: &[Keyword] = &[Keyword::Case, Keyword::Default, Keyword::EndSwitch];

/// Single forward pass from tokens to a flat `Program`.
pub struct Compiler<L: SourceLoader = FsLoader> {
    config: CompilerConfig,
    loader: L,
    symbols: SymbolTable,

    code: Vec<Op>,
    lines: Vec<SourcePos>,
    files: Vec<String>,
    events: Vec<Option<u32>>,
    actors: BTreeMap<i32, u32>,

    fixups: Vec<Fixup>,
    /// Pending `break` jumps per enclosing loop or switch.
    breaks: Vec<Vec<usize>>,

    /// Files already included (prevents duplicates)
    included: HashSet<PathBuf>,

    diagnostics: Diagnostics,
    errors: usize,
    aborted: bool,

    src: Source,
    /// Position diagnostics are attributed to.
    stmt_pos: SourcePos,
}

impl Compiler<FsLoader> {
    pub fn new(config: CompilerConfig) -> Self {
        Self::with_loader(config, FsLoader)
    }
}

impl<L: SourceLoader> Compiler<L> {
    pub fn with_loader(config: CompilerConfig, loader: L) -> Self {
        Self {
            config,
            loader,
            symbols: SymbolTable::new(),
            code: Vec::new(),
            lines: Vec::new(),
            files: Vec::new(),
            events: vec![None; MAX_EVENTS + 1],
            actors: BTreeMap::new(),
            fixups: Vec::new(),
            breaks: Vec::new(),
            included: HashSet::new(),
            diagnostics: Diagnostics::new(),
            errors: 0,
            aborted: false,
            src: Source::new(Vec::new(), 0, PathBuf::new()),
            stmt_pos: SourcePos::default(),
        }
    }

    pub fn compile_source(
        mut self,
        name: &str,
        text: &str,
    ) -> Result<CompileOutput, CompileFailure> {
        let path = PathBuf::from(name);
        let canonical = self
            .loader
            .canonicalize(&path)
            .unwrap_or_else(|_| path.clone());
        self.included.insert(canonical);
        self.compile_text(path, text);
        self.finish()
    }

    pub fn compile_file(mut self, path: &Path) -> Result<CompileOutput, CompileFailure> {
        if let Err(e) = self.include_path(path.to_path_buf()) {
            self.files.push(path.display().to_string());
            self.push_diag(SourcePos::default(), DiagnosticKind::Error(e));
            return Err(CompileFailure {
                diagnostics: self.diagnostics,
            });
        }
        self.finish()
    }

    fn compile_text(&mut self, path: PathBuf, text: &str) {
        let file = self.files.len() as u16;
        self.files.push(path.display().to_string());

        let mut tokens = Vec::new();
        for item in Lexer::new(text) {
            match item {
                Ok(t) => tokens.push(t),
                Err(e) => {
                    let pos = SourcePos {
                        file,
                        line: e.line as u32,
                    };
                    tokens.push(e.placeholder());
                    self.error_at(pos, e.into());
                }
            }
        }

        let outer = std::mem::replace(&mut self.src, Source::new(tokens, file, path));
        self.unit();
        self.src = outer;
    }

    fn finish(mut self) -> Result<CompileOutput, CompileFailure> {
        let fixups = std::mem::take(&mut self.fixups);
        let unresolved = !fixups.is_empty();
        for f in fixups {
            let name = self.symbols.label(f.label).name.clone();
            self.push_diag(f.pos, DiagnosticKind::Error(CompileError::UnresolvedLabel(name)));
        }
        if unresolved {
            return Err(CompileFailure {
                diagnostics: self.diagnostics,
            });
        }

        let (labels, vars, arrays) = self.symbols.into_parts();
        let program = Program {
            code: self.code,
            lines: self.lines,
            files: self.files,
            labels,
            events: self.events,
            actors: self.actors,
            vars,
            arrays,
        };
        debug!(
            "compiled {} ops, {} error(s), {} warning(s)",
            program.code.len(),
            self.diagnostics.error_count(),
            self.diagnostics.warning_count()
        );
        Ok(CompileOutput {
            program,
            diagnostics: self.diagnostics,
        })
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn push_diag(&mut self, pos: SourcePos, kind: DiagnosticKind) {
        let file = self
            .files
            .get(pos.file as usize)
            .cloned()
            .unwrap_or_default();
        self.diagnostics.push(Diagnostic {
            file,
            line: pos.line as usize,
            kind,
        });
    }

    fn error_at(&mut self, pos: SourcePos, e: CompileError) {
        if self.aborted {
            return;
        }
        self.push_diag(pos, DiagnosticKind::Error(e));
        self.errors += 1;
        let limit = self.config.abort_error_count;
        if limit > 0 && self.errors >= limit {
            self.aborted = true;
            self.push_diag(pos, DiagnosticKind::Error(CompileError::TooManyErrors));
        }
    }

    fn error(&mut self, e: CompileError) {
        self.error_at(self.stmt_pos, e);
    }

    fn warn(&mut self, w: CompileWarning) {
        self.push_diag(self.stmt_pos, DiagnosticKind::Warning(w));
    }

    // =========================================================================
    // Token cursor
    // =========================================================================

    fn peek(&self) -> &Token {
        let i = self.src.pos.min(self.src.tokens.len() - 1);
        &self.src.tokens[i].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.src.pos < self.src.tokens.len() - 1 {
            self.src.pos += 1;
        }
        token
    }

    fn here_pos(&self) -> SourcePos {
        let i = self.src.pos.min(self.src.tokens.len() - 1);
        SourcePos {
            file: self.src.file,
            line: self.src.tokens[i].span.line as u32,
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), CompileError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(CompileError::syntax(format!(
                "expected '{}', found '{}'",
                token,
                self.peek()
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(name)
            }
            Token::Keyword(k) => Err(CompileError::syntax(format!(
                "'{}' is a keyword and cannot be used as a name",
                k
            ))),
            other => Err(CompileError::syntax(format!(
                "expected a name, found '{}'",
                other
            ))),
        }
    }

    /// Skips to the next statement boundary.
    fn recover(&mut self) {
        loop {
            match self.peek() {
                Token::Eof | Token::RBrace | Token::Keyword(_) => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Skips to the next top-level item.
    fn recover_top(&mut self) {
        loop {
            match self.peek() {
                Token::Eof => return,
                Token::Keyword(k) if k.is_top_level() => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn here(&self) -> u32 {
        self.code.len() as u32
    }

    fn emit(&mut self, op: Op) -> usize {
        let at = self.code.len();
        self.code.push(op);
        self.lines.push(self.stmt_pos);
        at
    }

    fn patch(&mut self, at: usize, to: u32) {
        match &mut self.code[at] {
            Op::Jump(t) => *t = to,
            Op::JumpUnless { target, .. } => *target = to,
            Op::ForInit { next, .. } => *next = to,
            Op::ForNext { end, .. } => *end = to,
            Op::CallState { target, .. } => *target = to,
            _ => {}
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            code: self.code.len(),
            breaks: self.breaks.len(),
        }
    }

    fn rollback(&mut self, mark: Mark) {
        self.code.truncate(mark.code);
        self.lines.truncate(mark.code);
        self.fixups.retain(|f| f.at < mark.code);
        self.breaks.truncate(mark.breaks);
        for pending in &mut self.breaks {
            pending.retain(|&at| at < mark.code);
        }
    }

    fn close_breaks(&mut self, end: u32) {
        if let Some(pending) = self.breaks.pop() {
            for at in pending {
                self.patch(at, end);
            }
        }
    }

    fn resolve_fixups(&mut self, label: LabelId, offset: u32) {
        let (ready, waiting): (Vec<Fixup>, Vec<Fixup>) = std::mem::take(&mut self.fixups)
            .into_iter()
            .partition(|f| f.label == label);
        self.fixups = waiting;
        for f in ready {
            self.patch(f.at, offset);
        }
    }

    // =========================================================================
    // Top level
    // =========================================================================

    fn unit(&mut self) {
        while !self.aborted && *self.peek() != Token::Eof {
            self.top_level();
        }
    }

    fn top_level(&mut self) {
        self.stmt_pos = self.here_pos();
        let result = match self.peek().clone() {
            Token::Keyword(k) => match k {
                Keyword::Define => self.define_item(),
                Keyword::Include => self.include_item(),
                Keyword::IncludeDefault => {
                    self.include_default_item();
                    Ok(())
                }
                Keyword::GameVar => self.gamevar_item(),
                Keyword::GameArray => self.gamearray_item(),
                Keyword::DefState => {
                    self.defstate_item();
                    Ok(())
                }
                Keyword::OnEvent => {
                    self.event_item();
                    Ok(())
                }
                Keyword::Actor => {
                    self.actor_item();
                    Ok(())
                }
                other => {
                    self.advance();
                    Err(CompileError::syntax(format!(
                        "'{}' outside of a block",
                        other
                    )))
                }
            },
            other => {
                self.advance();
                Err(CompileError::syntax(format!(
                    "unexpected '{}' at top level",
                    other
                )))
            }
        };
        if let Err(e) = result {
            self.error(e);
            self.recover_top();
        }
    }

    fn define_item(&mut self) -> Result<(), CompileError> {
        self.advance();
        let name = self.expect_name()?;
        let value = self.constant()?;
        if let DefineOutcome::Changed(old) = self.symbols.define(&name, value) {
            self.warn(CompileWarning::RedefinedDefine {
                name,
                old,
                new: value,
            });
        }
        Ok(())
    }

    fn include_item(&mut self) -> Result<(), CompileError> {
        self.advance();
        let name = match self.advance() {
            Token::String(s) => s,
            other => {
                return Err(CompileError::syntax(format!(
                    "expected a quoted file name after include, found '{}'",
                    other
                )));
            }
        };
        let path = match self.src.path.parent() {
            Some(dir) => dir.join(&name),
            None => PathBuf::from(&name),
        };
        self.include_path(path)
    }

    fn include_default_item(&mut self) {
        self.advance();
        let Some(path) = self.config.default_include.clone() else {
            self.warn(CompileWarning::DefaultIncludeMissing("(none configured)".to_string()));
            return;
        };
        if self.include_path(path.clone()).is_err() {
            self.warn(CompileWarning::DefaultIncludeMissing(
                path.display().to_string(),
            ));
        }
    }

    fn include_path(&mut self, path: PathBuf) -> Result<(), CompileError> {
        let fail = |e: std::io::Error| CompileError::Include {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        let canonical = self.loader.canonicalize(&path).map_err(fail)?;

        // Already included? Skip (prevents infinite loops and duplicate definitions)
        if self.included.contains(&canonical) {
            debug!("skipping already included {}", path.display());
            return Ok(());
        }
        let text = self.loader.load(&canonical).map_err(fail)?;
        self.included.insert(canonical);

        debug!("including {}", path.display());
        self.compile_text(path, &text);
        Ok(())
    }

    fn gamevar_item(&mut self) -> Result<(), CompileError> {
        self.advance();
        let name = self.expect_name()?;
        let default = self.constant()?;
        let flags = match self.peek() {
            Token::Integer(_) | Token::Ident(_) => self.constant()?,
            _ => 0,
        };
        let flags = VarFlags(flags as u32);

        if self
            .symbols
            .find_var(&name)
            .is_some_and(|id| self.symbols.is_system_var(id))
        {
            return Err(CompileError::syntax(format!(
                "cannot redeclare system gamevar '{}'",
                name
            )));
        }
        if flags.contains(VarFlags::PERPLAYER) && flags.contains(VarFlags::PERACTOR) {
            return Err(CompileError::syntax(format!(
                "gamevar '{}' cannot be both per-player and per-actor",
                name
            )));
        }
        if self.symbols.find_define(&name).is_some() {
            self.warn(CompileWarning::NameMatchesDefine(name.clone()));
        }

        let (_, redeclared) = self.symbols.declare_var(&name, default, flags);
        if redeclared {
            self.warn(CompileWarning::DuplicateDefinition(name));
        }
        Ok(())
    }

    fn gamearray_item(&mut self) -> Result<(), CompileError> {
        self.advance();
        let name = self.expect_name()?;
        let size = self.constant()?;
        let backing = if self.config.external_arrays.iter().any(|a| *a == name) {
            ArrayBacking::External
        } else {
            ArrayBacking::Owned
        };
        self.symbols.declare_array(&name, size, backing)?;
        Ok(())
    }

    fn defstate_item(&mut self) {
        self.advance();
        let line = self.stmt_pos.line as usize;
        let label = match self.expect_name() {
            Ok(name) => match self.symbols.declare_label(&name, LabelKind::State, line) {
                Ok(id) => Some(id),
                Err(e) => {
                    self.error(e.into());
                    None
                }
            },
            Err(e) => {
                self.error(e);
                None
            }
        };

        let start = self.here();
        if let Some(id) = label {
            self.symbols.set_label_offset(id, start);
            self.resolve_fixups(id, start);
        }
        self.block_until(&[Keyword::Ends], "ends");
        self.emit(Op::End);
        if let Some(id) = label {
            self.symbols.set_label_size(id, self.here() - start);
        }
    }

    fn event_item(&mut self) {
        self.advance();
        let line = self.stmt_pos.line as usize;
        let event = match self.event_id() {
            Ok(e) => Some(e),
            Err(e) => {
                self.error(e);
                None
            }
        };

        let start = self.here();
        let mut label = None;
        if let Some(event) = event {
            if self.events[event.index()].is_some() {
                self.warn(CompileWarning::EventRedefined(event));
            }
            self.events[event.index()] = Some(start);
            if let Ok(id) = self
                .symbols
                .declare_label(&event.to_string(), LabelKind::Event, line)
            {
                self.symbols.set_label_offset(id, start);
                label = Some(id);
            }
        }
        self.block_until(&[Keyword::EndEvent], "endevent");
        self.emit(Op::End);
        if let Some(id) = label {
            self.symbols.set_label_size(id, self.here() - start);
        }
    }

    fn event_id(&mut self) -> Result<EventId, CompileError> {
        let value = match self.peek().clone() {
            Token::Ident(name) => {
                if let Some(event) = EventId::from_name(&name) {
                    self.advance();
                    return Ok(event);
                }
                self.constant()?
            }
            _ => self.constant()?,
        };
        EventId::new(value).ok_or(CompileError::Range {
            what: "event",
            value,
            limit: MAX_EVENTS as i32 + 1,
        })
    }

    fn actor_item(&mut self) {
        self.advance();
        let line = self.stmt_pos.line as usize;
        let tile = match self.constant() {
            Ok(t) if (0..MAXUSERTILES).contains(&t) => Some(t),
            Ok(t) => {
                self.error(CompileError::Range {
                    what: "tile",
                    value: t,
                    limit: MAXUSERTILES,
                });
                None
            }
            Err(e) => {
                self.error(e);
                None
            }
        };

        let start = self.here();
        let mut label = None;
        if let Some(tile) = tile {
            match self
                .symbols
                .declare_label(&format!("actor {}", tile), LabelKind::Actor, line)
            {
                Ok(id) => {
                    self.symbols.set_label_offset(id, start);
                    self.actors.insert(tile, start);
                    label = Some(id);
                }
                Err(e) => self.error(e.into()),
            }
        }
        self.block_until(&[Keyword::EndA], "enda");
        self.emit(Op::End);
        if let Some(id) = label {
            self.symbols.set_label_size(id, self.here() - start);
        }
    }

    /// Compiles statements up to and including the closing keyword.
    fn block_until(&mut self, end: &[Keyword], what: &str) {
        self.stmt_list(StmtEnd::Keywords(end));
        match self.peek() {
            Token::Keyword(k) if end.contains(k) => {
                self.advance();
            }
            _ => self.error(CompileError::syntax(format!("missing '{}'", what))),
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn stmt_list(&mut self, end: StmtEnd) {
        loop {
            if self.aborted {
                return;
            }
            match (self.peek(), end) {
                (Token::Eof, _) => return,
                (Token::RBrace, StmtEnd::Brace) => return,
                (Token::Keyword(k), StmtEnd::Keywords(ks)) if ks.contains(k) => return,
                (Token::Keyword(k), _) if k.is_top_level() => return,
                (Token::RBrace, _) => {
                    let saved = self.stmt_pos;
                    self.stmt_pos = self.here_pos();
                    self.advance();
                    self.error(CompileError::syntax("unmatched '}'"));
                    self.stmt_pos = saved;
                }
                _ => self.guarded_statement(),
            }
        }
    }

    /// Compiles one statement; on error its code is dropped and parsing
    /// resumes at the next statement boundary.
    fn guarded_statement(&mut self) {
        let saved = self.stmt_pos;
        self.stmt_pos = self.here_pos();
        let mark = self.mark();
        let start = self.src.pos;

        if let Err(e) = self.statement() {
            self.rollback(mark);
            self.error(e);
            if self.src.pos == start {
                self.advance();
            }
            self.recover();
        }
        self.stmt_pos = saved;
    }

    /// The body of an `if`, loop or `for`.
    fn body(&mut self) {
        match self.peek() {
            Token::Eof | Token::RBrace => {}
            Token::Keyword(k) if k.is_top_level() || ends_block(*k) => {}
            _ => return self.guarded_statement(),
        }
        self.error(CompileError::syntax(format!(
            "expected a statement, found '{}'",
            self.peek()
        )));
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        let k = match self.advance() {
            Token::Keyword(k) => k,
            Token::LBrace => {
                self.stmt_list(StmtEnd::Brace);
                return self.expect(Token::RBrace);
            }
            other => {
                return Err(CompileError::syntax(format!("unexpected '{}'", other)));
            }
        };

        if let Some((op, varvar)) = arith_keyword(k) {
            return self.arith(op, varvar);
        }
        if let Some((cmp, varvar)) = compare_keyword(k) {
            let cond = self.var_condition(cmp, varvar)?;
            return self.conditional(cond);
        }

        use Keyword as K;
        match k {
            K::WhileVarN => self.while_loop(Cmp::Ne, false),
            K::WhileVarL => self.while_loop(Cmp::Lt, false),
            K::WhileVarVarN => self.while_loop(Cmp::Ne, true),
            K::WhileVarVarL => self.while_loop(Cmp::Lt, true),
            K::If => {
                let cond = self.infix_condition()?;
                self.conditional(cond)
            }
            K::Switch => self.switch(),
            K::For => self.for_loop(),
            K::State => self.state_call(),
            K::Return => {
                let value = if self.starts_value() {
                    Some(self.value()?)
                } else {
                    None
                };
                self.emit(Op::Return(value));
                Ok(())
            }
            K::Break => {
                if self.breaks.is_empty() {
                    self.emit(Op::Return(None));
                } else {
                    let at = self.emit(Op::Jump(0));
                    if let Some(pending) = self.breaks.last_mut() {
                        pending.push(at);
                    }
                }
                Ok(())
            }

            K::Sin | K::Cos | K::Sqrt => {
                let dst = self.place()?;
                let value = self.value()?;
                self.emit(match k {
                    K::Sin => Op::Sin { dst, angle: value },
                    K::Cos => Op::Cos { dst, angle: value },
                    _ => Op::Sqrt { dst, value },
                });
                Ok(())
            }
            K::GetAngle => {
                let dst = self.place()?;
                let dx = self.value()?;
                let dy = self.value()?;
                self.emit(Op::GetAngle { dst, dx, dy });
                Ok(())
            }
            K::Clamp => {
                let dst = self.place()?;
                let min = self.value()?;
                let max = self.value()?;
                self.emit(Op::Clamp { dst, min, max });
                Ok(())
            }
            K::Inv => {
                let dst = self.place()?;
                self.emit(Op::Inv(dst));
                Ok(())
            }
            K::MulScale | K::DivScale => {
                let dst = self.place()?;
                let a = self.value()?;
                let b = self.value()?;
                let shift = self.value()?;
                if k == K::DivScale && b == Operand::Imm(0) {
                    return Err(CompileError::syntax("divscale by zero"));
                }
                self.emit(if k == K::MulScale {
                    Op::MulScale { dst, a, b, shift }
                } else {
                    Op::DivScale { dst, a, b, shift }
                });
                Ok(())
            }
            K::Dist | K::LDist => {
                let dst = self.place()?;
                let a = self.sprite_index()?;
                let b = self.sprite_index()?;
                self.emit(if k == K::Dist {
                    Op::Dist { dst, a, b }
                } else {
                    Op::LDist { dst, a, b }
                });
                Ok(())
            }

            K::GetSector => self.get_member(ObjectKind::Sector),
            K::GetWall => self.get_member(ObjectKind::Wall),
            K::GetSprite | K::GetActor => self.get_member(ObjectKind::Sprite),
            K::SetSector => self.set_member(ObjectKind::Sector),
            K::SetWall => self.set_member(ObjectKind::Wall),
            K::SetSprite | K::SetActor => self.set_member(ObjectKind::Sprite),

            K::SetArray => {
                let (array, index) = self.array_element(true)?;
                let src = self.value()?;
                self.emit(Op::Arith {
                    op: ArithOp::Set,
                    dst: Place::Elem(array, Box::new(index)),
                    src,
                });
                Ok(())
            }
            K::GetArraySize => {
                let array = self.array_ref(false)?;
                let dst = self.place()?;
                self.emit(Op::GetArraySize { array, dst });
                Ok(())
            }
            K::ResizeArray => {
                let array = self.array_ref(true)?;
                let size = self.value()?;
                if let Operand::Imm(n) = size {
                    if n < 0 {
                        return Err(CompileError::InvalidSize {
                            name: self.symbols.array(array).name.clone(),
                            size: n,
                        });
                    }
                }
                self.emit(Op::ResizeArray { array, size });
                Ok(())
            }
            K::Copy => {
                let (src, src_index) = self.array_element(false)?;
                let (dst, dst_index) = self.array_element(true)?;
                let count = self.value()?;
                self.emit(Op::CopyArray {
                    src,
                    src_index,
                    dst,
                    dst_index,
                    count,
                });
                Ok(())
            }

            K::KillIt => {
                self.emit(Op::KillIt);
                Ok(())
            }
            K::InsertSprite => {
                let sector = self.object_index(ObjectKind::Sector)?;
                let status = self.status()?;
                let dst = self.place()?;
                self.emit(Op::InsertSprite {
                    sector,
                    status,
                    dst,
                });
                Ok(())
            }
            K::DeleteSprite => {
                let sprite = self.sprite_index()?;
                self.emit(Op::DeleteSprite(sprite));
                Ok(())
            }
            K::ChangeSpriteStat => {
                let sprite = self.sprite_index()?;
                let status = self.status()?;
                self.emit(Op::ChangeSpriteStat { sprite, status });
                Ok(())
            }
            K::ChangeSpriteSect => {
                let sprite = self.sprite_index()?;
                let sector = self.object_index(ObjectKind::Sector)?;
                self.emit(Op::ChangeSpriteSect { sprite, sector });
                Ok(())
            }

            K::AddLog => match self.advance() {
                Token::String(text) => {
                    self.emit(Op::AddLog(text));
                    Ok(())
                }
                other => Err(CompileError::syntax(format!(
                    "expected a quoted message after addlog, found '{}'",
                    other
                ))),
            },
            K::AddLogVar => {
                let value = self.var_operand()?;
                self.emit(Op::AddLogVar(value));
                Ok(())
            }

            K::Else => Err(CompileError::syntax("'else' without a matching if")),
            other => Err(CompileError::syntax(format!("unexpected '{}'", other))),
        }
    }

    fn arith(&mut self, op: ArithOp, varvar: bool) -> Result<(), CompileError> {
        let dst = self.place()?;
        let src = if varvar {
            self.var_operand()?
        } else {
            self.value()?
        };
        if matches!(op, ArithOp::Div | ArithOp::Mod) && src == Operand::Imm(0) {
            return Err(CompileError::syntax("division by zero"));
        }
        self.emit(Op::Arith { op, dst, src });
        Ok(())
    }

    fn var_condition(&mut self, cmp: Cmp, varvar: bool) -> Result<Cond, CompileError> {
        let lhs = self.var_operand()?;
        let rhs = if varvar {
            self.var_operand()?
        } else {
            self.value()?
        };
        Ok(Cond { cmp, lhs, rhs })
    }

    fn infix_condition(&mut self) -> Result<Cond, CompileError> {
        let lhs = self.value()?;
        let cmp = match self.advance() {
            Token::Compare(op) => compare_op(op),
            other => {
                return Err(CompileError::syntax(format!(
                    "expected a comparison operator, found '{}'",
                    other
                )));
            }
        };
        let rhs = self.value()?;
        Ok(Cond { cmp, lhs, rhs })
    }

    fn conditional(&mut self, cond: Cond) -> Result<(), CompileError> {
        let jump = self.emit(Op::JumpUnless { cond, target: 0 });
        self.body();

        if self.eat(&Token::Keyword(Keyword::Else)) {
            let skip = self.emit(Op::Jump(0));
            let else_start = self.here();
            self.patch(jump, else_start);
            self.body();
            let end = self.here();
            self.patch(skip, end);
        } else {
            let end = self.here();
            self.patch(jump, end);
        }
        Ok(())
    }

    fn while_loop(&mut self, cmp: Cmp, varvar: bool) -> Result<(), CompileError> {
        let cond = self.var_condition(cmp, varvar)?;
        let top = self.here();
        let exit = self.emit(Op::JumpUnless { cond, target: 0 });

        self.breaks.push(Vec::new());
        self.body();
        self.emit(Op::Jump(top));

        let end = self.here();
        self.patch(exit, end);
        self.close_breaks(end);
        Ok(())
    }

    fn switch(&mut self) -> Result<(), CompileError> {
        let value = self.value()?;
        let at = self.emit(Op::Switch {
            value,
            cases: Vec::new(),
            default: 0,
        });
        self.breaks.push(Vec::new());

        let mut cases: Vec<(i32, u32)> = Vec::new();
        let mut default = None;
        loop {
            match self.peek() {
                Token::Keyword(Keyword::Case) => {
                    self.advance();
                    let v = self.constant()?;
                    self.eat(&Token::Colon);
                    if cases.iter().any(|(c, _)| *c == v) {
                        self.warn(CompileWarning::DuplicateCase(v));
                    } else {
                        cases.push((v, self.here()));
                    }
                    self.case_body();
                }
                Token::Keyword(Keyword::Default) => {
                    self.advance();
                    self.eat(&Token::Colon);
                    if default.is_some() {
                        return Err(CompileError::syntax("more than one default in switch"));
                    }
                    default = Some(self.here());
                    self.case_body();
                }
                Token::Keyword(Keyword::EndSwitch) => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(CompileError::syntax(format!(
                        "expected 'case', 'default' or 'endswitch', found '{}'",
                        other
                    )));
                }
            }
        }

        let end = self.here();
        if let Op::Switch {
            cases: c,
            default: d,
            ..
        } = &mut self.code[at]
        {
            *c = cases;
            *d = default.unwrap_or(end);
        }
        self.close_breaks(end);
        Ok(())
    }

    fn case_body(&mut self) {
        let start = self.here();
        self.stmt_list(StmtEnd::Keywords(CASE_END));
        if self.here() != start {
            let at = self.emit(Op::Jump(0));
            if let Some(pending) = self.breaks.last_mut() {
                pending.push(at);
            }
        }
    }

    fn for_loop(&mut self) -> Result<(), CompileError> {
        let var = self.place()?;
        let name = self.expect_name()?;
        let iter = IterKind::from_name(&name)
            .ok_or_else(|| CompileError::syntax(format!("unknown iterator '{}'", name)))?;

        let mut args = Vec::with_capacity(iter.arity());
        for _ in 0..iter.arity() {
            args.push(self.value()?);
        }
        self.check_iter_args(iter, &mut args)?;

        let init = self.emit(Op::ForInit {
            var,
            iter,
            args,
            next: 0,
        });
        let next = self.emit(Op::ForNext {
            init: init as u32,
            end: 0,
        });
        self.patch(init, next as u32);

        self.breaks.push(Vec::new());
        self.body();
        self.emit(Op::Jump(next as u32));

        let end = self.here();
        self.patch(next, end);
        self.close_breaks(end);
        Ok(())
    }

    fn check_iter_args(&mut self, iter: IterKind, args: &mut [Operand]) -> Result<(), CompileError> {
        match (iter, &mut *args) {
            (IterKind::SpritesOfSector | IterKind::WallsOfSector, [Operand::Imm(s)]) => {
                check_index(ObjectKind::Sector, *s)
            }
            (IterKind::LoopOfWall, [Operand::Imm(w)]) => check_index(ObjectKind::Wall, *w),
            (IterKind::SpritesOfStatus, [Operand::Imm(n)]) => check_status(*n),
            (IterKind::TileRange, [a, b]) => {
                for v in [&*a, &*b] {
                    if let Operand::Imm(t) = v {
                        check_tile(*t)?;
                    }
                }
                let backwards = match (&*a, &*b) {
                    (Operand::Imm(from), Operand::Imm(to)) if to < from => Some((*from, *to)),
                    _ => None,
                };
                if let Some((from, to)) = backwards {
                    self.warn(CompileWarning::BackwardsRange { from, to });
                    std::mem::swap(a, b);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn state_call(&mut self) -> Result<(), CompileError> {
        let name = self.expect_name()?;
        if let Ok(sym) = self.symbols.resolve(&name) {
            if !matches!(sym, SymbolRef::Label(_)) {
                return Err(CompileError::syntax(format!("'{}' is not a state", name)));
            }
        }
        let label = self
            .symbols
            .reference_label(&name, self.stmt_pos.line as usize);
        let (kind, offset) = {
            let def = self.symbols.label(label);
            (def.kind, def.offset)
        };
        if kind != LabelKind::State {
            return Err(CompileError::syntax(format!("'{}' is not a state", name)));
        }

        match offset {
            Some(target) => {
                self.emit(Op::CallState { label, target });
            }
            None => {
                let at = self.emit(Op::CallState {
                    label,
                    target: u32::MAX,
                });
                self.fixups.push(Fixup {
                    at,
                    label,
                    pos: self.stmt_pos,
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Member access
    // =========================================================================

    fn member_target(&mut self, kind: ObjectKind) -> Result<(Field, Operand), CompileError> {
        let index = if self.eat(&Token::LBracket) {
            let index = self.object_index(kind)?;
            self.expect(Token::RBracket)?;
            index
        } else if kind == ObjectKind::Sprite {
            Operand::Var(VarId::THISACTOR)
        } else {
            return Err(CompileError::syntax(format!(
                "expected '[' after {} access",
                kind
            )));
        };

        self.expect(Token::Dot)?;
        let name = self.expect_name()?;
        let label = find_label(kind, &name).ok_or_else(|| {
            CompileError::syntax(format!("unknown {} member '{}'", kind, name))
        })?;
        Ok((label.field, index))
    }

    fn get_member(&mut self, kind: ObjectKind) -> Result<(), CompileError> {
        let (field, index) = self.member_target(kind)?;
        let dst = self.place()?;
        self.emit(Op::GetMember { field, index, dst });
        Ok(())
    }

    fn set_member(&mut self, kind: ObjectKind) -> Result<(), CompileError> {
        let (field, index) = self.member_target(kind)?;
        let label = field.label();
        if label.readonly {
            return Err(CompileError::ReadOnlyViolation(format!(
                "member {}.{}",
                kind, label.name
            )));
        }
        let value = self.value()?;
        self.emit(Op::SetMember {
            field,
            index,
            value,
        });
        Ok(())
    }

    // =========================================================================
    // Operands
    // =========================================================================

    fn starts_value(&self) -> bool {
        matches!(self.peek(), Token::Integer(_) | Token::Ident(_))
    }

    /// A compile-time integer: literal or define.
    fn constant(&mut self) -> Result<i32, CompileError> {
        match self.peek().clone() {
            Token::Integer(n) => {
                self.advance();
                Ok(n)
            }
            Token::Ident(name) => {
                self.advance();
                match self.symbols.resolve(&name)? {
                    SymbolRef::Define(v) => Ok(v),
                    _ => Err(CompileError::syntax(format!(
                        "'{}' is not a constant",
                        name
                    ))),
                }
            }
            other => Err(CompileError::syntax(format!(
                "expected a constant, found '{}'",
                other
            ))),
        }
    }

    /// VALUE: literal, define, gamevar or array element.
    fn value(&mut self) -> Result<Operand, CompileError> {
        match self.peek().clone() {
            Token::Integer(n) => {
                self.advance();
                Ok(Operand::Imm(n))
            }
            Token::Ident(name) => {
                self.advance();
                match self.symbols.resolve(&name)? {
                    SymbolRef::Define(v) => Ok(Operand::Imm(v)),
                    SymbolRef::Var(id) => Ok(Operand::Var(id)),
                    SymbolRef::Array(id) => {
                        let index = self.subscript()?;
                        Ok(Operand::Elem(id, Box::new(index)))
                    }
                    SymbolRef::Label(_) => Err(CompileError::NotAVar(name)),
                }
            }
            other => Err(CompileError::syntax(format!(
                "expected a value, found '{}'",
                other
            ))),
        }
    }

    /// VAR: gamevar or array element.
    fn var_operand(&mut self) -> Result<Operand, CompileError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                match self.symbols.resolve(&name)? {
                    SymbolRef::Var(id) => Ok(Operand::Var(id)),
                    SymbolRef::Array(id) => {
                        let index = self.subscript()?;
                        Ok(Operand::Elem(id, Box::new(index)))
                    }
                    _ => Err(CompileError::NotAVar(name)),
                }
            }
            other => Err(CompileError::syntax(format!(
                "expected a gamevar, found '{}'",
                other
            ))),
        }
    }

    /// PLACE: writable gamevar or owned array element.
    fn place(&mut self) -> Result<Place, CompileError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                match self.symbols.resolve(&name)? {
                    SymbolRef::Var(id) => {
                        if self.symbols.var(id).flags.readonly() {
                            return Err(CompileError::ReadOnlyViolation(format!(
                                "gamevar '{}'",
                                name
                            )));
                        }
                        Ok(Place::Var(id))
                    }
                    SymbolRef::Array(id) => {
                        self.check_writable_array(id)?;
                        let index = self.subscript()?;
                        Ok(Place::Elem(id, Box::new(index)))
                    }
                    _ => Err(CompileError::NotAVar(name)),
                }
            }
            other => Err(CompileError::syntax(format!(
                "expected a gamevar, found '{}'",
                other
            ))),
        }
    }

    fn subscript(&mut self) -> Result<Operand, CompileError> {
        self.expect(Token::LBracket)?;
        let index = self.value()?;
        self.expect(Token::RBracket)?;
        Ok(index)
    }

    fn array_ref(&mut self, write: bool) -> Result<ArrayId, CompileError> {
        let name = self.expect_name()?;
        match self.symbols.resolve(&name)? {
            SymbolRef::Array(id) => {
                if write {
                    self.check_writable_array(id)?;
                }
                Ok(id)
            }
            _ => Err(CompileError::NotAnArray(name)),
        }
    }

    fn array_element(&mut self, write: bool) -> Result<(ArrayId, Operand), CompileError> {
        let array = self.array_ref(write)?;
        let index = self.subscript()?;
        Ok((array, index))
    }

    fn check_writable_array(&self, id: ArrayId) -> Result<(), CompileError> {
        let decl = self.symbols.array(id);
        if decl.backing == ArrayBacking::External {
            return Err(CompileError::ReadOnlyViolation(format!(
                "gamearray '{}'",
                decl.name
            )));
        }
        Ok(())
    }

    fn object_index(&mut self, kind: ObjectKind) -> Result<Operand, CompileError> {
        let index = self.value()?;
        if let Operand::Imm(n) = index {
            check_index(kind, n)?;
        }
        Ok(index)
    }

    fn sprite_index(&mut self) -> Result<Operand, CompileError> {
        self.object_index(ObjectKind::Sprite)
    }

    fn status(&mut self) -> Result<Operand, CompileError> {
        let status = self.value()?;
        if let Operand::Imm(n) = status {
            check_status(n)?;
        }
        Ok(status)
    }
}

fn check_index(kind: ObjectKind, value: i32) -> Result<(), CompileError> {
    if (0..kind.limit()).contains(&value) {
        return Ok(());
    }
    let what = match kind {
        ObjectKind::Sector => "sector",
        ObjectKind::Wall => "wall",
        ObjectKind::Sprite => "sprite",
    };
    Err(CompileError::Range {
        what,
        value,
        limit: kind.limit(),
    })
}

fn check_status(value: i32) -> Result<(), CompileError> {
    if (0..MAXSTATUS).contains(&value) {
        Ok(())
    } else {
        Err(CompileError::Range {
            what: "status",
            value,
            limit: MAXSTATUS,
        })
    }
}

fn check_tile(value: i32) -> Result<(), CompileError> {
    if (0..MAXUSERTILES).contains(&value) {
        Ok(())
    } else {
        Err(CompileError::Range {
            what: "tile",
            value,
            limit: MAXUSERTILES,
        })
    }
}

/// Keywords that close a block rather than start a statement.
fn ends_block(k: Keyword) -> bool {
    matches!(
        k,
        Keyword::Ends
            | Keyword::EndEvent
            | Keyword::EndA
            | Keyword::EndSwitch
            | Keyword::Case
            | Keyword::Default
            | Keyword::Else
    )
}

fn arith_keyword(k: Keyword) -> Option<(ArithOp, bool)> {
    use Keyword as K;
    let r = match k {
        K::SetVar => (ArithOp::Set, false),
        K::AddVar => (ArithOp::Add, false),
        K::SubVar => (ArithOp::Sub, false),
        K::MulVar => (ArithOp::Mul, false),
        K::DivVar => (ArithOp::Div, false),
        K::ModVar => (ArithOp::Mod, false),
        K::AndVar => (ArithOp::And, false),
        K::OrVar => (ArithOp::Or, false),
        K::XorVar => (ArithOp::Xor, false),
        K::ShiftVarL => (ArithOp::Shl, false),
        K::ShiftVarR => (ArithOp::Shr, false),
        K::RandVar => (ArithOp::Rand, false),
        K::SetVarVar => (ArithOp::Set, true),
        K::AddVarVar => (ArithOp::Add, true),
        K::SubVarVar => (ArithOp::Sub, true),
        K::MulVarVar => (ArithOp::Mul, true),
        K::DivVarVar => (ArithOp::Div, true),
        K::ModVarVar => (ArithOp::Mod, true),
        K::AndVarVar => (ArithOp::And, true),
        K::OrVarVar => (ArithOp::Or, true),
        K::XorVarVar => (ArithOp::Xor, true),
        K::RandVarVar => (ArithOp::Rand, true),
        _ => return None,
    };
    Some(r)
}

fn compare_keyword(k: Keyword) -> Option<(Cmp, bool)> {
    use Keyword as K;
    let r = match k {
        K::IfVarL => (Cmp::Lt, false),
        K::IfVarLE => (Cmp::Le, false),
        K::IfVarG => (Cmp::Gt, false),
        K::IfVarGE => (Cmp::Ge, false),
        K::IfVarE => (Cmp::Eq, false),
        K::IfVarN => (Cmp::Ne, false),
        K::IfVarAnd => (Cmp::And, false),
        K::IfVarOr => (Cmp::Or, false),
        K::IfVarXor => (Cmp::Xor, false),
        K::IfVarEither => (Cmp::Either, false),
        K::IfVarBoth => (Cmp::Both, false),
        K::IfVarVarL => (Cmp::Lt, true),
        K::IfVarVarLE => (Cmp::Le, true),
        K::IfVarVarG => (Cmp::Gt, true),
        K::IfVarVarGE => (Cmp::Ge, true),
        K::IfVarVarE => (Cmp::Eq, true),
        K::IfVarVarN => (Cmp::Ne, true),
        K::IfVarVarAnd => (Cmp::And, true),
        K::IfVarVarOr => (Cmp::Or, true),
        K::IfVarVarXor => (Cmp::Xor, true),
        K::IfVarVarEither => (Cmp::Either, true),
        K::IfVarVarBoth => (Cmp::Both, true),
        _ => return None,
    };
    Some(r)
}

fn compare_op(op: CompareOp) -> Cmp {
    match op {
        CompareOp::Lt => Cmp::Lt,
        CompareOp::Le => Cmp::Le,
        CompareOp::Gt => Cmp::Gt,
        CompareOp::Ge => Cmp::Ge,
        CompareOp::Eq => Cmp::Eq,
        CompareOp::Ne => Cmp::Ne,
        CompareOp::And => Cmp::And,
        CompareOp::Or => Cmp::Or,
        CompareOp::Xor => Cmp::Xor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::labels::SpriteField;

    fn compile(src: &str) -> CompileOutput {
        Compiler::new(CompilerConfig::default())
            .compile_source("test.con", src)
            .expect("compilation should succeed")
    }

    fn compile_failure(src: &str) -> Diagnostics {
        match Compiler::new(CompilerConfig::default()).compile_source("test.con", src) {
            Ok(out) => panic!("expected failure, got {:?}", out.program.code),
            Err(f) => f.diagnostics,
        }
    }

    fn errors(out: &CompileOutput) -> Vec<CompileError> {
        out.diagnostics.errors().cloned().collect()
    }

    fn warnings(out: &CompileOutput) -> Vec<CompileWarning> {
        out.diagnostics.warnings().cloned().collect()
    }

    /// Code of the block starting at `offset` up to its `End`.
    fn block(program: &Program, offset: u32) -> &[Op] {
        let start = offset as usize;
        let len = program.code[start..]
            .iter()
            .position(|op| *op == Op::End)
            .expect("block is terminated");
        &program.code[start..start + len]
    }

    fn event_code(out: &CompileOutput, event: EventId) -> &[Op] {
        let offset = out.program.event_offset(event).expect("event defined");
        block(&out.program, offset)
    }

    fn var(out: &CompileOutput, name: &str) -> VarId {
        let i = out
            .program
            .vars
            .iter()
            .position(|v| v.name == name)
            .expect("gamevar declared");
        VarId(i as u32)
    }

    #[test]
    fn test_compile_gamevar_and_event() {
        let out = compile(
            "gamevar health 100 0
             onevent EVENT_GAME
                addvar health -10
             endevent",
        );
        assert!(out.diagnostics.is_empty());
        let health = var(&out, "health");
        assert_eq!(out.program.vars[health.index()].default, 100);
        assert_eq!(
            event_code(&out, EventId::GAME),
            &[Op::Arith {
                op: ArithOp::Add,
                dst: Place::Var(health),
                src: Operand::Imm(-10),
            }]
        );
    }

    #[test]
    fn test_if_immediate_addressing() {
        let out = compile(
            "gamevar health 0 0
             actor 1405
                if health < 0 { killit }
             enda",
        );
        let health = var(&out, "health");
        let offset = out.program.actor_offset(1405).expect("actor compiled");
        let code = block(&out.program, offset);
        assert_eq!(
            code[0],
            Op::JumpUnless {
                cond: Cond {
                    cmp: Cmp::Lt,
                    lhs: Operand::Var(health),
                    rhs: Operand::Imm(0),
                },
                target: offset + 2,
            }
        );
        assert_eq!(code[1], Op::KillIt);
    }

    #[test]
    fn test_ifvar_and_ifvarvar_differ_only_in_addressing() {
        let out = compile(
            "gamevar a 0 0
             gamevar b 0 0
             onevent 1
                ifvarl a 5 setvar b 1
                ifvarvarl a b setvar b 1
             endevent",
        );
        let (a, b) = (var(&out, "a"), var(&out, "b"));
        let code = event_code(&out, EventId::INIT);
        match (&code[0], &code[2]) {
            (Op::JumpUnless { cond: c1, .. }, Op::JumpUnless { cond: c2, .. }) => {
                assert_eq!(c1.lhs, Operand::Var(a));
                assert_eq!(c1.rhs, Operand::Imm(5));
                assert_eq!(c2.lhs, Operand::Var(a));
                assert_eq!(c2.rhs, Operand::Var(b));
                assert_eq!(c1.cmp, c2.cmp);
            }
            other => panic!("unexpected code {:?}", other),
        }
    }

    #[test]
    fn test_forward_and_backward_state_calls_agree() {
        let out = compile(
            "onevent EVENT_GAME state walk endevent
             defstate walk setvar RETURN 1 ends
             onevent EVENT_WORLD state walk endevent",
        );
        let targets: Vec<u32> = out
            .program
            .code
            .iter()
            .filter_map(|op| match op {
                Op::CallState { target, .. } => Some(*target),
                _ => None,
            })
            .collect();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], targets[1]);
        let walk = out
            .program
            .labels
            .iter()
            .find(|l| l.name == "walk")
            .expect("state label");
        assert_eq!(walk.offset, Some(targets[0]));
        assert_eq!(walk.size, 2);
    }

    #[test]
    fn test_unresolved_label_fails_unit() {
        let ds = compile_failure("onevent EVENT_GAME state nowhere endevent");
        assert!(
            ds.errors()
                .any(|e| *e == CompileError::UnresolvedLabel("nowhere".to_string()))
        );
    }

    #[test]
    fn test_gamevar_redeclared_warns_once() {
        let out = compile("gamevar hp 10 0\ngamevar hp 20 0");
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::DuplicateDefinition("hp".to_string())]
        );
        assert_eq!(out.program.vars[var(&out, "hp").index()].default, 20);
    }

    #[test]
    fn test_readonly_member_write_rest_compiles() {
        let out = compile(
            "gamevar x 0 0
             onevent EVENT_GAME
                setsprite[0].sectnum 3
                setvar x 7
             endevent",
        );
        assert_eq!(
            errors(&out),
            vec![CompileError::ReadOnlyViolation(
                "member sprite.sectnum".to_string()
            )]
        );
        assert_eq!(out.diagnostics.iter().next().map(|d| d.line), Some(3));
        assert_eq!(
            event_code(&out, EventId::GAME),
            &[Op::Arith {
                op: ArithOp::Set,
                dst: Place::Var(var(&out, "x")),
                src: Operand::Imm(7),
            }]
        );
    }

    #[test]
    fn test_readonly_gamevar_write() {
        let out = compile(
            "gamevar limit 5 4096
             onevent 1 setvar limit 1 setvar THISACTOR 2 endevent",
        );
        let errs = errors(&out);
        assert_eq!(errs.len(), 2);
        assert!(errs.iter().all(|e| matches!(e, CompileError::ReadOnlyViolation(_))));
    }

    #[test]
    fn test_backwards_tile_range_swapped() {
        let out = compile(
            "gamevar t 0 0
             onevent 1 for t tilerange 20 10 { addvar RETURN 1 } endevent",
        );
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::BackwardsRange { from: 20, to: 10 }]
        );
        let init = out
            .program
            .code
            .iter()
            .find_map(|op| match op {
                Op::ForInit { args, .. } => Some(args.clone()),
                _ => None,
            })
            .expect("for loop");
        assert_eq!(init, vec![Operand::Imm(10), Operand::Imm(20)]);
    }

    #[test]
    fn test_for_loop_layout() {
        let out = compile(
            "gamevar i 0 0
             onevent 1 for i spritesofsector 5 { break } endevent",
        );
        let base = out.program.event_offset(EventId::INIT).unwrap();
        let code = event_code(&out, EventId::INIT);
        assert_eq!(
            code[0],
            Op::ForInit {
                var: Place::Var(var(&out, "i")),
                iter: IterKind::SpritesOfSector,
                args: vec![Operand::Imm(5)],
                next: base + 1,
            }
        );
        assert_eq!(
            code[1],
            Op::ForNext {
                init: base,
                end: base + 4
            }
        );
        assert_eq!(code[2], Op::Jump(base + 4));
        assert_eq!(code[3], Op::Jump(base + 1));
    }

    #[test]
    fn test_constant_index_range_checked() {
        let out = compile("gamevar x 0 0 onevent 1 getsector[5000].floorz x endevent");
        assert_eq!(
            errors(&out),
            vec![CompileError::Range {
                what: "sector",
                value: 5000,
                limit: 4096
            }]
        );
    }

    #[test]
    fn test_sprite_member_defaults_to_thisactor() {
        let out = compile("gamevar x 0 0 actor 1 getactor.ang x enda");
        let code = block(&out.program, out.program.actor_offset(1).unwrap());
        assert_eq!(
            code[0],
            Op::GetMember {
                field: Field::Sprite(SpriteField::Ang),
                index: Operand::Var(VarId::THISACTOR),
                dst: Place::Var(var(&out, "x")),
            }
        );
    }

    #[test]
    fn test_switch_cases() {
        let out = compile(
            "gamevar v 0 0
             onevent 1
                switch v
                case 1
                case 2: setvar RETURN 10
                case 1 setvar RETURN 99
                default setvar RETURN 5
                endswitch
             endevent",
        );
        assert_eq!(warnings(&out), vec![CompileWarning::DuplicateCase(1)]);
        let base = out.program.event_offset(EventId::INIT).unwrap();
        match &event_code(&out, EventId::INIT)[0] {
            Op::Switch { cases, default, .. } => {
                assert_eq!(cases, &vec![(1, base + 1), (2, base + 1)]);
                assert_eq!(*default, base + 5);
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_define_redefinition_keeps_earlier_references() {
        let out = compile(
            "define SPEED 4
             onevent 1 setvar RETURN SPEED endevent
             define SPEED 8
             onevent 2 setvar RETURN SPEED endevent",
        );
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::RedefinedDefine {
                name: "SPEED".to_string(),
                old: 4,
                new: 8
            }]
        );
        let src = |e| match &event_code(&out, e)[0] {
            Op::Arith { src, .. } => src.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(src(EventId::INIT), Operand::Imm(4));
        assert_eq!(src(EventId::ENTERLEVEL), Operand::Imm(8));
    }

    #[test]
    fn test_gamevar_matching_define_warns() {
        let out = compile("define speed 3\ngamevar speed 0 0");
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::NameMatchesDefine("speed".to_string())]
        );
    }

    #[test]
    fn test_errors_recover_to_next_statement() {
        let out = compile(
            "gamevar a 0 0
             onevent 1
                setvar nope 1
                addvar a 2
                divvar a 0
                addvar a 3
             endevent",
        );
        assert_eq!(out.diagnostics.error_count(), 2);
        let code = event_code(&out, EventId::INIT);
        assert_eq!(code.len(), 2);
    }

    #[test]
    fn test_abort_after_too_many_errors() {
        let src = "onevent 1\n".to_string() + &"setvar nope 1\n".repeat(20) + "endevent";
        let out = compile(&src);
        assert_eq!(out.diagnostics.error_count(), 9);
        assert!(out.diagnostics.errors().any(|e| *e == CompileError::TooManyErrors));
    }

    #[test]
    fn test_missing_terminator_reported() {
        let out = compile("onevent 1 setvar RETURN 1\nonevent 2 endevent");
        assert_eq!(
            errors(&out),
            vec![CompileError::Syntax("missing 'endevent'".to_string())]
        );
        assert!(out.program.event_offset(EventId::ENTERLEVEL).is_some());
    }

    #[test]
    fn test_duplicate_state_is_error() {
        let out = compile("defstate a ends defstate a ends");
        assert_eq!(errors(&out), vec![CompileError::DuplicateLabel("a".to_string())]);
    }

    #[test]
    fn test_duplicate_actor_is_error() {
        let out = compile("actor 5 enda actor 5 enda");
        assert_eq!(
            errors(&out),
            vec![CompileError::DuplicateLabel("actor 5".to_string())]
        );
    }

    #[test]
    fn test_event_redefinition_replaces() {
        let out = compile("onevent 1 endevent onevent 1 setvar RETURN 1 endevent");
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::EventRedefined(EventId::INIT)]
        );
        assert_eq!(event_code(&out, EventId::INIT).len(), 1);
    }

    #[test]
    fn test_negative_array_size() {
        let out = compile("gamearray bad -4");
        assert!(matches!(
            errors(&out).as_slice(),
            [CompileError::InvalidSize { size: -4, .. }]
        ));
    }

    #[test]
    fn test_external_array_is_read_only() {
        let config = CompilerConfig {
            external_arrays: vec!["tiles".to_string()],
            ..CompilerConfig::default()
        };
        let out = Compiler::new(config)
            .compile_source(
                "test.con",
                "gamearray tiles 16
                 onevent 1
                    setvar RETURN tiles[3]
                    setarray tiles[3] 1
                    resizearray tiles 4
                 endevent",
            )
            .unwrap();
        assert_eq!(out.diagnostics.error_count(), 2);
        assert_eq!(out.program.arrays[0].backing, ArrayBacking::External);
    }

    #[test]
    fn test_keyword_as_name_is_error() {
        let out = compile("gamevar setvar 0 0");
        assert_eq!(out.diagnostics.error_count(), 1);
    }

    #[test]
    fn test_break_outside_loop_returns() {
        let out = compile("onevent 1 break endevent");
        assert_eq!(event_code(&out, EventId::INIT), &[Op::Return(None)]);
    }

    #[test]
    fn test_while_loop_layout() {
        let out = compile("gamevar n 3 0 onevent 1 whilevarn n 0 subvar n 1 endevent");
        let base = out.program.event_offset(EventId::INIT).unwrap();
        let code = event_code(&out, EventId::INIT);
        assert!(matches!(code[0], Op::JumpUnless { target, .. } if target == base + 3));
        assert_eq!(code[2], Op::Jump(base));
    }

    #[test]
    fn test_lex_error_is_diagnostic() {
        let out = compile("gamevar x 99999999999 0\ngamevar y 1 0");
        assert!(matches!(errors(&out).as_slice(), [CompileError::Lex(_), ..]));
        assert!(out.program.vars.iter().any(|v| v.name == "y"));
    }

    #[test]
    fn test_malformed_literal_keeps_operands_aligned() {
        let out = compile(
            "gamevar x 99999999999 2
             gamevar y 7 1
             onevent 1 addlog \"a\\q\" setvar y 3 endevent",
        );
        assert_eq!(errors(&out).len(), 2);
        assert!(errors(&out).iter().all(|e| matches!(e, CompileError::Lex(_))));
        let x = &out.program.vars[var(&out, "x").index()];
        assert_eq!((x.default, x.flags.0), (0, 2));
        let y = &out.program.vars[var(&out, "y").index()];
        assert_eq!((y.default, y.flags.0), (7, 1));
        assert!(matches!(
            event_code(&out, EventId::INIT).last(),
            Some(Op::Arith {
                op: ArithOp::Set,
                src: Operand::Imm(3),
                ..
            })
        ));
    }

    #[test]
    fn test_include_from_memory() {
        let loader = MemoryLoader::new()
            .with_file("game/main.con", "include \"defs.con\"\ninclude \"defs.con\"\nonevent 1 setvar RETURN MAXHP endevent")
            .with_file("game/defs.con", "define MAXHP 250");
        let out = Compiler::with_loader(CompilerConfig::default(), loader)
            .compile_file(Path::new("game/main.con"))
            .unwrap();
        assert!(out.diagnostics.is_empty());
        assert_eq!(out.program.files.len(), 2);
        assert!(matches!(
            &event_code(&out, EventId::INIT)[0],
            Op::Arith { src: Operand::Imm(250), .. }
        ));
    }

    #[test]
    fn test_missing_include_continues() {
        let loader = MemoryLoader::new().with_file(
            "main.con",
            "include \"gone.con\"\nonevent 1 setvar RETURN 1 endevent",
        );
        let out = Compiler::with_loader(CompilerConfig::default(), loader)
            .compile_file(Path::new("main.con"))
            .unwrap();
        assert!(matches!(
            errors(&out).as_slice(),
            [CompileError::Include { .. }]
        ));
        assert!(out.program.event_offset(EventId::INIT).is_some());
    }

    #[test]
    fn test_missing_default_include_warns() {
        let config = CompilerConfig {
            default_include: Some(PathBuf::from("defaults.con")),
            ..CompilerConfig::default()
        };
        let out = Compiler::with_loader(config, MemoryLoader::new())
            .compile_source("main.con", "includedefault")
            .unwrap();
        assert_eq!(
            warnings(&out),
            vec![CompileWarning::DefaultIncludeMissing("defaults.con".to_string())]
        );
        assert_eq!(out.diagnostics.error_count(), 0);
    }

    #[test]
    fn test_include_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.con"), "gamevar shared 7 0").unwrap();
        let main = dir.path().join("main.con");
        std::fs::write(&main, "include \"lib.con\"\nonevent 1 setvar RETURN shared endevent")
            .unwrap();

        let out = Compiler::new(CompilerConfig::default())
            .compile_file(&main)
            .unwrap();
        assert!(out.diagnostics.is_empty());
        assert!(out.program.vars.iter().any(|v| v.name == "shared"));
    }

    #[test]
    fn test_missing_root_file_fails() {
        let result = Compiler::with_loader(CompilerConfig::default(), MemoryLoader::new())
            .compile_file(Path::new("nothing.con"));
        let failure = result.expect_err("root file is missing");
        assert_eq!(failure.diagnostics.error_count(), 1);
    }

    #[test]
    fn test_lines_track_source() {
        let out = compile("onevent 1\n\nsetvar RETURN 1\nendevent");
        let offset = out.program.event_offset(EventId::INIT).unwrap() as usize;
        assert_eq!(out.program.lines[offset].line, 3);
        assert_eq!(out.program.location(offset), "test.con:3");
    }
}
