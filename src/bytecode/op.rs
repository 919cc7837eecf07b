use serde::{Deserialize, Serialize};

use crate::bytecode::ir::{ArrayId, LabelId, VarId};
use crate::lang::labels::Field;

// =============================================================================
// Operands
// =============================================================================

/// A readable value: immediate, gamevar, or gamearray element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    Imm(i32),
    Var(VarId),
    Elem(ArrayId, Box<Operand>),
}

/// A writable location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Place {
    Var(VarId),
    Elem(ArrayId, Box<Operand>),
}

impl Place {
    pub fn as_operand(&self) -> Operand {
        match self {
            Place::Var(v) => Operand::Var(*v),
            Place::Elem(a, i) => Operand::Elem(*a, i.clone()),
        }
    }
}

/// `dst = dst <op> src`. `Set` ignores the old value, `Rand` stores a random
/// number in `0..=src`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Rand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// bitwise and is non-zero
    And,
    /// bitwise or is non-zero
    Or,
    /// bitwise xor is non-zero
    Xor,
    /// either side non-zero
    Either,
    /// both sides non-zero
    Both,
}

impl Cmp {
    pub fn test(self, a: i32, b: i32) -> bool {
        match self {
            Cmp::Lt => a < b,
            Cmp::Le => a <= b,
            Cmp::Gt => a > b,
            Cmp::Ge => a >= b,
            Cmp::Eq => a == b,
            Cmp::Ne => a != b,
            Cmp::And => a & b != 0,
            Cmp::Or => a | b != 0,
            Cmp::Xor => a ^ b != 0,
            Cmp::Either => a != 0 || b != 0,
            Cmp::Both => a != 0 && b != 0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
            Cmp::Eq => "==",
            Cmp::Ne => "!=",
            Cmp::And => "&",
            Cmp::Or => "|",
            Cmp::Xor => "^",
            Cmp::Either => "||",
            Cmp::Both => "&&",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cond {
    pub cmp: Cmp,
    pub lhs: Operand,
    pub rhs: Operand,
}

/// Traversal kinds of the `for` statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterKind {
    AllSprites,
    AllSectors,
    AllWalls,
    SpritesOfSector,
    SpritesOfStatus,
    WallsOfSector,
    LoopOfWall,
    Range,
    TileRange,
}

impl IterKind {
    pub fn from_name(name: &str) -> Option<IterKind> {
        let kind = match name {
            "allsprites" => IterKind::AllSprites,
            "allsectors" => IterKind::AllSectors,
            "allwalls" => IterKind::AllWalls,
            "spritesofsector" => IterKind::SpritesOfSector,
            "spritesofstatus" => IterKind::SpritesOfStatus,
            "wallsofsector" => IterKind::WallsOfSector,
            "loopofwall" => IterKind::LoopOfWall,
            "range" => IterKind::Range,
            "tilerange" => IterKind::TileRange,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            IterKind::AllSprites => "allsprites",
            IterKind::AllSectors => "allsectors",
            IterKind::AllWalls => "allwalls",
            IterKind::SpritesOfSector => "spritesofsector",
            IterKind::SpritesOfStatus => "spritesofstatus",
            IterKind::WallsOfSector => "wallsofsector",
            IterKind::LoopOfWall => "loopofwall",
            IterKind::Range => "range",
            IterKind::TileRange => "tilerange",
        }
    }

    /// Number of operands following the iterator name.
    pub fn arity(self) -> usize {
        match self {
            IterKind::AllSprites | IterKind::AllSectors | IterKind::AllWalls => 0,
            IterKind::TileRange => 2,
            _ => 1,
        }
    }
}

// =============================================================================
// OP - Bytecode instructions
// =============================================================================

/// One instruction. Jump targets are absolute indices into `Program::code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    // arithmetic
    Arith {
        op: ArithOp,
        dst: Place,
        src: Operand,
    },

    // math
    Sin {
        dst: Place,
        angle: Operand,
    },
    Cos {
        dst: Place,
        angle: Operand,
    },
    GetAngle {
        dst: Place,
        dx: Operand,
        dy: Operand,
    },
    Sqrt {
        dst: Place,
        value: Operand,
    },
    Clamp {
        dst: Place,
        min: Operand,
        max: Operand,
    },
    Inv(Place),
    MulScale {
        dst: Place,
        a: Operand,
        b: Operand,
        shift: Operand,
    },
    DivScale {
        dst: Place,
        a: Operand,
        b: Operand,
        shift: Operand,
    },
    /// 3-D distance between two sprites.
    Dist {
        dst: Place,
        a: Operand,
        b: Operand,
    },
    /// 2-D distance between two sprites.
    LDist {
        dst: Place,
        a: Operand,
        b: Operand,
    },

    // ==========================================================================
    // Control flow
    // ==========================================================================
    /// Continue with the next instruction when `cond` holds, otherwise jump.
    JumpUnless {
        cond: Cond,
        target: u32,
    },
    Jump(u32),
    Switch {
        value: Operand,
        cases: Vec<(i32, u32)>,
        default: u32,
    },
    /// Snapshot the traversal and jump to the matching `ForNext` at `next`.
    ForInit {
        var: Place,
        iter: IterKind,
        args: Vec<Operand>,
        next: u32,
    },
    /// Store the next live entry of the snapshot taken at `init` and fall
    /// through into the body, or jump to `end` when exhausted.
    ForNext {
        init: u32,
        end: u32,
    },
    CallState {
        label: LabelId,
        target: u32,
    },
    Return(Option<Operand>),
    End,

    // member access
    GetMember {
        field: Field,
        index: Operand,
        dst: Place,
    },
    SetMember {
        field: Field,
        index: Operand,
        value: Operand,
    },

    // arrays
    GetArraySize {
        array: ArrayId,
        dst: Place,
    },
    ResizeArray {
        array: ArrayId,
        size: Operand,
    },
    CopyArray {
        src: ArrayId,
        src_index: Operand,
        dst: ArrayId,
        dst_index: Operand,
        count: Operand,
    },

    // engine
    KillIt,
    InsertSprite {
        sector: Operand,
        status: Operand,
        dst: Place,
    },
    DeleteSprite(Operand),
    ChangeSpriteStat {
        sprite: Operand,
        status: Operand,
    },
    ChangeSpriteSect {
        sprite: Operand,
        sector: Operand,
    },

    // log
    AddLog(String),
    AddLogVar(Operand),
}

impl Op {
    /// Jump targets this instruction may transfer control to.
    pub fn targets(&self) -> Vec<u32> {
        match self {
            Op::JumpUnless { target, .. } => vec![*target],
            Op::Jump(t) => vec![*t],
            Op::Switch { cases, default, .. } => {
                let mut t: Vec<u32> = cases.iter().map(|(_, t)| *t).collect();
                t.push(*default);
                t
            }
            Op::ForInit { next, .. } => vec![*next],
            Op::ForNext { end, .. } => vec![*end],
            _ => Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Arith { op, .. } => match op {
                ArithOp::Set => "set",
                ArithOp::Add => "add",
                ArithOp::Sub => "sub",
                ArithOp::Mul => "mul",
                ArithOp::Div => "div",
                ArithOp::Mod => "mod",
                ArithOp::And => "and",
                ArithOp::Or => "or",
                ArithOp::Xor => "xor",
                ArithOp::Shl => "shl",
                ArithOp::Shr => "shr",
                ArithOp::Rand => "rand",
            },
            Op::Sin { .. } => "sin",
            Op::Cos { .. } => "cos",
            Op::GetAngle { .. } => "getangle",
            Op::Sqrt { .. } => "sqrt",
            Op::Clamp { .. } => "clamp",
            Op::Inv(_) => "inv",
            Op::MulScale { .. } => "mulscale",
            Op::DivScale { .. } => "divscale",
            Op::Dist { .. } => "dist",
            Op::LDist { .. } => "ldist",
            Op::JumpUnless { .. } => "jump_unless",
            Op::Jump(_) => "jump",
            Op::Switch { .. } => "switch",
            Op::ForInit { .. } => "for_init",
            Op::ForNext { .. } => "for_next",
            Op::CallState { .. } => "state",
            Op::Return(_) => "return",
            Op::End => "end",
            Op::GetMember { .. } => "get",
            Op::SetMember { .. } => "set_member",
            Op::GetArraySize { .. } => "getarraysize",
            Op::ResizeArray { .. } => "resizearray",
            Op::CopyArray { .. } => "copy",
            Op::KillIt => "killit",
            Op::InsertSprite { .. } => "insertsprite",
            Op::DeleteSprite(_) => "deletesprite",
            Op::ChangeSpriteStat { .. } => "changespritestat",
            Op::ChangeSpriteSect { .. } => "changespritesect",
            Op::AddLog(_) => "addlog",
            Op::AddLogVar(_) => "addlogvar",
        }
    }
}
