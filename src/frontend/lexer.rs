use thiserror::Error;

use crate::frontend::token::{CompareOp, Keyword, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    String,
    Number,
}

/// A malformed string or numeric literal. Nothing else fails to lex.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexError {
    pub message: String,
    pub literal: LiteralKind,
    pub line: usize,
    pub col: usize,
}

impl LexError {
    /// Token standing in for the malformed literal, so the statement around
    /// it keeps its operand positions.
    pub fn placeholder(&self) -> Spanned {
        let token = match self.literal {
            LiteralKind::String => Token::String(String::new()),
            LiteralKind::Number => Token::Integer(0),
        };
        Spanned {
            token,
            span: Span {
                line: self.line,
                col: self.col,
            },
        }
    }
}

/// Lazy tokenizer over one source text.
///
/// The lexer is an iterator of `Result<Spanned, LexError>`: it yields exactly
/// one `Token::Eof` and then ends. After a `LexError` it has already skipped
/// the rest of the malformed literal, so iteration can simply continue.
/// Each include file gets a fresh lexer.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    done: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            done: false,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn unterminated(&self, start: Span) -> LexError {
        self.error(LiteralKind::String, "unterminated string literal", start)
    }

    fn error(&self, literal: LiteralKind, message: impl Into<String>, span: Span) -> LexError {
        LexError {
            message: message.into(),
            literal,
            line: span.line,
            col: span.col,
        }
    }

    /// Skips whitespace, `// line` and `/* block */` comments.
    fn skip_trivia(&mut self) {
        loop {
            match (self.current(), self.peek()) {
                (Some(ch), _) if ch.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    while let Some(ch) = self.current() {
                        if ch == '*' && self.peek() == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Skips to the closing quote (or end of line) after a bad escape.
    fn skip_string_rest(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
            if ch == '"' {
                break;
            }
        }
    }

    fn read_string(&mut self) -> Result<Token, LexError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Token::String(string));
                }
                Some('\\') => {
                    let escape_at = self.span();
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some(ch) if ch != '\n' => {
                            self.skip_string_rest();
                            return Err(self.error(
                                LiteralKind::String,
                                format!("unknown escape sequence: \\{}", ch),
                                escape_at,
                            ));
                        }
                        _ => {
                            return Err(self.unterminated(start));
                        }
                    }
                    self.advance();
                }
                Some('\n') | None => {
                    return Err(self.unterminated(start));
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn is_word_char(ch: char) -> bool {
        ch.is_alphanumeric() || ch == '_'
    }

    /// Consumes any identifier characters glued to a number.
    fn take_glued(&mut self) -> String {
        let mut rest = String::new();
        while let Some(ch) = self.current() {
            if Self::is_word_char(ch) {
                rest.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        rest
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.span();

        let is_negative = self.current() == Some('-');
        if is_negative {
            self.advance();
        }

        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();

            let mut hex = String::new();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            let glued = self.take_glued();

            if hex.is_empty() || !glued.is_empty() {
                let message = format!("malformed hex literal: 0x{}{}", hex, glued);
                return Err(self.error(LiteralKind::Number, message, start));
            }

            // hex spells a raw 32-bit pattern
            let bits = u32::from_str_radix(&hex, 16)
                .map_err(|_| {
                    let message = format!("hex literal out of range: 0x{}", hex);
                    self.error(LiteralKind::Number, message, start)
                })?;
            let value = bits as i32;
            return Ok(Token::Integer(if is_negative {
                value.wrapping_neg()
            } else {
                value
            }));
        }

        let mut digits = String::new();
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let glued = self.take_glued();
        if !glued.is_empty() {
            let message = format!("malformed number: {}{}", digits, glued);
            return Err(self.error(LiteralKind::Number, message, start));
        }

        if is_negative {
            digits.insert(0, '-');
        }
        digits
            .parse::<i32>()
            .map(Token::Integer)
            .map_err(|_| {
                let message = format!("integer literal out of range: {}", digits);
                self.error(LiteralKind::Number, message, start)
            })
    }

    fn read_word(&mut self) -> Token {
        let word = self.take_glued();
        match Keyword::from_word(&word) {
            Some(k) => Token::Keyword(k),
            None => Token::Ident(word),
        }
    }

    /// Anything the grammar has no use for becomes an identifier; the
    /// compiler reports it with a line number.
    fn read_unknown(&mut self) -> Token {
        let mut text = String::new();
        while let Some(ch) = self.current() {
            if ch.is_whitespace() || "{}[].:\"".contains(ch) || (!text.is_empty() && Self::is_word_char(ch)) {
                break;
            }
            text.push(ch);
            self.advance();
        }
        Token::Ident(text)
    }

    fn read_punct(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('<', Some('=')) => (Token::Compare(CompareOp::Le), 2),
            ('>', Some('=')) => (Token::Compare(CompareOp::Ge), 2),
            ('=', Some('=')) => (Token::Compare(CompareOp::Eq), 2),
            ('!', Some('=')) => (Token::Compare(CompareOp::Ne), 2),
            ('<', _) => (Token::Compare(CompareOp::Lt), 1),
            ('>', _) => (Token::Compare(CompareOp::Gt), 1),
            ('&', _) => (Token::Compare(CompareOp::And), 1),
            ('|', _) => (Token::Compare(CompareOp::Or), 1),
            ('^', _) => (Token::Compare(CompareOp::Xor), 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('.', _) => (Token::Dot, 1),
            (':', _) => (Token::Colon, 1),
            _ => return None,
        };
        for _ in 0..width {
            self.advance();
        }
        Some(token)
    }

    fn next_token(&mut self) -> Result<Spanned, LexError> {
        self.skip_trivia();
        let span = self.span();

        let token = match self.current() {
            None => Token::Eof,
            Some('"') => self.read_string()?,
            Some(ch) if ch.is_ascii_digit() => self.read_number()?,
            Some('-') if self.peek().is_some_and(|c| c.is_ascii_digit()) => self.read_number()?,
            Some(ch) if ch.is_alphabetic() || ch == '_' => self.read_word(),
            Some(_) => match self.read_punct() {
                Some(t) => t,
                None => self.read_unknown(),
            },
        };

        Ok(Spanned { token, span })
    }

    /// Collects the whole token stream, stopping at the first error.
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexError> {
        self.by_ref().collect()
    }
}

impl Iterator for Lexer {
    type Item = Result<Spanned, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_token();
        if let Ok(Spanned {
            token: Token::Eof, ..
        }) = &item
        {
            self.done = true;
        }
        Some(item)
    }
}
