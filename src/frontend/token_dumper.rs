use std::fmt::Write as _;

use crate::frontend::lexer::Spanned;
use crate::frontend::token::{Keyword, Token};

/// Renders a token stream one token per row, grouped under the source line
/// that produced it.
pub struct TokenDumper {
    pub color: bool,
    /// Print the source spelling instead of the `Debug` form.
    pub spelling: bool,
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            spelling: false,
        }
    }
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const BOLD_BLUE: &str = "\x1b[1;34m";
const BLUE: &str = "\x1b[34m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const MAGENTA: &str = "\x1b[35m";

impl TokenDumper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.spelling = true;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        print!("{}", self.render(tokens));
    }

    pub fn render(&self, tokens: &[Spanned]) -> String {
        let mut out = String::new();
        let mut line = 0;
        for s in tokens {
            let gutter = if s.span.line != line {
                line = s.span.line;
                format!("{:>4}", line)
            } else {
                String::new()
            };
            let (class, paint) = classify(&s.token);
            let (open, close) = if self.color { (paint, RESET) } else { ("", "") };
            let text = if self.spelling {
                s.token.to_string()
            } else {
                format!("{:?}", s.token)
            };
            let _ = writeln!(
                out,
                "{:>4}:{:<3} {}{:<7} {}{}",
                gutter, s.span.col, open, class, text, close
            );
        }
        out
    }
}

fn classify(t: &Token) -> (&'static str, &'static str) {
    match t {
        Token::Eof => ("EOF", DIM),
        Token::Integer(_) => ("INT", CYAN),
        Token::String(_) => ("STRING", GREEN),
        Token::Ident(_) => ("IDENT", YELLOW),
        Token::Keyword(k) if is_structural(*k) => ("BLOCK", BOLD_BLUE),
        Token::Keyword(_) => ("COMMAND", BLUE),
        Token::Compare(_) => ("CMP", MAGENTA),
        Token::LBrace | Token::RBrace | Token::LBracket | Token::RBracket => ("PUNCT", DIM),
        Token::Dot | Token::Colon => ("PUNCT", DIM),
    }
}

/// Declarations and the words that open or close a top-level block.
fn is_structural(k: Keyword) -> bool {
    matches!(
        k,
        Keyword::Define
            | Keyword::Include
            | Keyword::IncludeDefault
            | Keyword::GameVar
            | Keyword::GameArray
            | Keyword::DefState
            | Keyword::Ends
            | Keyword::OnEvent
            | Keyword::EndEvent
            | Keyword::Actor
            | Keyword::EndA
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn plain(src: &str) -> Vec<String> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        TokenDumper::new()
            .no_color()
            .pretty()
            .render(&tokens)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_render_groups_by_line() {
        let lines = plain("setvar x 5\nends");
        assert_eq!(
            lines,
            vec![
                "   1:1   COMMAND setvar",
                "    :8   IDENT   x",
                "    :10  INT     5",
                "   2:1   BLOCK   ends",
                "    :5   EOF     EOF",
            ]
        );
    }

    #[test]
    fn test_debug_form_and_color() {
        let tokens = Lexer::new("gamevar").tokenize().unwrap();
        let text = TokenDumper::new().render(&tokens);
        assert!(text.contains(BOLD_BLUE));
        assert!(text.contains("Keyword(GameVar)"));
    }
}
