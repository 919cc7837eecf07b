/// Declares the keyword enum together with its spelling table.
macro_rules! keywords {
    ($($variant:ident => $word:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Keyword {
            $($variant,)*
        }

        impl Keyword {
            pub fn from_word(word: &str) -> Option<Keyword> {
                match word {
                    $($word => Some(Keyword::$variant),)*
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Keyword::$variant => $word,)*
                }
            }
        }
    };
}

keywords! {
    // definitions
    Define => "define",
    Include => "include",
    IncludeDefault => "includedefault",
    GameVar => "gamevar",
    GameArray => "gamearray",
    DefState => "defstate",
    Ends => "ends",
    OnEvent => "onevent",
    EndEvent => "endevent",
    Actor => "actor",
    EndA => "enda",

    // control flow
    State => "state",
    If => "if",
    Else => "else",
    Return => "return",
    Break => "break",
    Switch => "switch",
    Case => "case",
    Default => "default",
    EndSwitch => "endswitch",
    For => "for",

    // var ops
    SetVar => "setvar",
    AddVar => "addvar",
    SubVar => "subvar",
    MulVar => "mulvar",
    DivVar => "divvar",
    ModVar => "modvar",
    AndVar => "andvar",
    OrVar => "orvar",
    XorVar => "xorvar",
    ShiftVarL => "shiftvarl",
    ShiftVarR => "shiftvarr",
    RandVar => "randvar",

    // varvar ops
    SetVarVar => "setvarvar",
    AddVarVar => "addvarvar",
    SubVarVar => "subvarvar",
    MulVarVar => "mulvarvar",
    DivVarVar => "divvarvar",
    ModVarVar => "modvarvar",
    AndVarVar => "andvarvar",
    OrVarVar => "orvarvar",
    XorVarVar => "xorvarvar",
    RandVarVar => "randvarvar",

    // math
    Sin => "sin",
    Cos => "cos",
    GetAngle => "getangle",
    Sqrt => "sqrt",
    Clamp => "clamp",
    Inv => "inv",
    MulScale => "mulscale",
    DivScale => "divscale",
    Dist => "dist",
    LDist => "ldist",

    // if var
    IfVarL => "ifvarl",
    IfVarLE => "ifvarle",
    IfVarG => "ifvarg",
    IfVarGE => "ifvarge",
    IfVarE => "ifvare",
    IfVarN => "ifvarn",
    IfVarAnd => "ifvarand",
    IfVarOr => "ifvaror",
    IfVarXor => "ifvarxor",
    IfVarEither => "ifvareither",
    IfVarBoth => "ifvarboth",
    WhileVarN => "whilevarn",
    WhileVarL => "whilevarl",

    // if varvar
    IfVarVarL => "ifvarvarl",
    IfVarVarLE => "ifvarvarle",
    IfVarVarG => "ifvarvarg",
    IfVarVarGE => "ifvarvarge",
    IfVarVarE => "ifvarvare",
    IfVarVarN => "ifvarvarn",
    IfVarVarAnd => "ifvarvarand",
    IfVarVarOr => "ifvarvaror",
    IfVarVarXor => "ifvarvarxor",
    IfVarVarEither => "ifvarvareither",
    IfVarVarBoth => "ifvarvarboth",
    WhileVarVarN => "whilevarvarn",
    WhileVarVarL => "whilevarvarl",

    // member access
    GetSector => "getsector",
    SetSector => "setsector",
    GetWall => "getwall",
    SetWall => "setwall",
    GetSprite => "getsprite",
    SetSprite => "setsprite",
    GetActor => "getactor",
    SetActor => "setactor",

    // arrays
    SetArray => "setarray",
    GetArraySize => "getarraysize",
    ResizeArray => "resizearray",
    Copy => "copy",

    // engine
    KillIt => "killit",
    InsertSprite => "insertsprite",
    DeleteSprite => "deletesprite",
    ChangeSpriteStat => "changespritestat",
    ChangeSpriteSect => "changespritesect",

    // log
    AddLog => "addlog",
    AddLogVar => "addlogvar",
}

impl Keyword {
    /// Keywords that may only start a top-level item.
    pub fn is_top_level(self) -> bool {
        matches!(
            self,
            Keyword::Define
                | Keyword::Include
                | Keyword::IncludeDefault
                | Keyword::GameVar
                | Keyword::GameArray
                | Keyword::DefState
                | Keyword::OnEvent
                | Keyword::Actor
        )
    }
}

impl std::fmt::Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infix comparison operators of the `if a <op> b` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Xor,
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::And => "&",
            CompareOp::Or => "|",
            CompareOp::Xor => "^",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Integer(i32),
    String(std::string::String),

    Keyword(Keyword),

    // Identifier (define, gamevar, gamearray, label, or anything unrecognised)
    Ident(std::string::String),

    // Punctuation
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Dot,
    Colon,
    Compare(CompareOp),

    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::String(s) => write!(f, "\"{}\"", s),
            Token::Keyword(k) => write!(f, "{}", k),
            Token::Ident(s) => write!(f, "{}", s),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Dot => write!(f, "."),
            Token::Colon => write!(f, ":"),
            Token::Compare(op) => write!(f, "{}", op),
            Token::Eof => write!(f, "EOF"),
        }
    }
}
