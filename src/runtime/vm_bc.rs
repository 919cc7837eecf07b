use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bytecode::Program;
use crate::bytecode::ir::{LabelId, VarId};
use crate::bytecode::op::{ArithOp, Op, Operand, Place};
use crate::lang::events::EventId;
use crate::lang::labels::{Field, ObjectKind, SpriteField};
use crate::lang::limits::MAXSTATUS;
use crate::runtime::iter::Cursor;
use crate::runtime::math;
use crate::runtime::runtime_error::VmError;
use crate::runtime::state::{EngineState, Scope};
use crate::runtime::world::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    pub max_call_depth: usize,
    /// Per dispatch.
    pub max_instructions: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_instructions: 1_000_000,
        }
    }
}

/// What a frame is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    TopLevel,
    Event(EventId),
    State(LabelId),
    Actor(i32),
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Context::TopLevel => write!(f, "top level"),
            Context::Event(id) => write!(f, "{}", id),
            Context::State(label) => write!(f, "state #{}", label.0),
            Context::Actor(tile) => write!(f, "actor {}", tile),
        }
    }
}

/// How a frame ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Ran to `end` (or off the end of the code).
    Done,
    /// Left through `return`.
    Return,
    /// The current actor was deleted; the whole dispatch unwinds.
    Kill,
}

struct Frame {
    ip: usize,
    context: Context,
    /// Open `for` traversals keyed by the ip of their `ForInit`.
    cursors: HashMap<usize, Cursor>,
}

impl Frame {
    fn new(ip: usize, context: Context) -> Self {
        Frame {
            ip,
            context,
            cursors: HashMap::new(),
        }
    }
}

/// Interpreter for one dispatch. Holds the borrowed program, state and
/// object store for as long as the dispatch runs.
pub struct Vm<'a> {
    program: &'a Program,
    state: &'a mut EngineState,
    store: &'a mut dyn ObjectStore,
    config: &'a VmConfig,
    scope: Scope,
    frames: Vec<Frame>,
    instructions: u64,
}

impl<'a> Vm<'a> {
    pub fn new(
        program: &'a Program,
        state: &'a mut EngineState,
        store: &'a mut dyn ObjectStore,
        config: &'a VmConfig,
    ) -> Self {
        Vm {
            program,
            state,
            store,
            config,
            scope: Scope::default(),
            frames: Vec::new(),
            instructions: 0,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Runs from `entry` until the outermost frame ends. Errors are logged
    /// here, once, with the failing instruction's source position.
    pub fn run(&mut self, entry: u32, context: Context) -> Result<Flow, VmError> {
        self.frames.clear();
        self.frames.push(Frame::new(entry as usize, context));

        loop {
            let Some(frame) = self.frames.last() else {
                return Ok(Flow::Done);
            };
            let ip = frame.ip;
            match self.step(ip) {
                Ok(None) => {}
                Ok(Some(Flow::Kill)) => {
                    self.frames.clear();
                    return Ok(Flow::Kill);
                }
                Ok(Some(flow)) => {
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(flow);
                    }
                }
                Err(e) => {
                    let frame_context = self.frames.last().map(|f| f.context).unwrap_or(context);
                    let op = self.program.code.get(ip).map(Op::name).unwrap_or("?");
                    log::warn!(
                        "{}: {} in {}: {}",
                        self.program.location(ip),
                        op,
                        self.describe(frame_context),
                        e
                    );
                    self.frames.clear();
                    return Err(e);
                }
            }
        }
    }

    fn describe(&self, context: Context) -> String {
        match context {
            Context::State(label) => format!("state {}", self.program.label_name(label)),
            other => other.to_string(),
        }
    }

    fn check_limits(&mut self) -> Result<(), VmError> {
        self.instructions += 1;
        if self.instructions > self.config.max_instructions {
            return Err(VmError::InstructionLimit(self.config.max_instructions));
        }
        Ok(())
    }

    fn frame(&mut self) -> Result<&mut Frame, VmError> {
        self.frames
            .last_mut()
            .ok_or_else(|| VmError::Runtime("no active frame".to_string()))
    }

    fn goto(&mut self, target: u32) -> Result<(), VmError> {
        self.frame()?.ip = target as usize;
        Ok(())
    }

    /// Executes the instruction at `ip`. `Some(flow)` when the frame ends.
    fn step(&mut self, ip: usize) -> Result<Option<Flow>, VmError> {
        self.check_limits()?;
        let program = self.program;
        let Some(op) = program.code.get(ip) else {
            return Ok(Some(Flow::Done));
        };
        self.frame()?.ip = ip + 1;

        match op {
            Op::Arith { op, dst, src } => self.arith(*op, dst, src)?,

            Op::Sin { dst, angle } => {
                let a = self.read(angle)?;
                self.write(dst, math::sin(a))?;
            }
            Op::Cos { dst, angle } => {
                let a = self.read(angle)?;
                self.write(dst, math::cos(a))?;
            }
            Op::GetAngle { dst, dx, dy } => {
                let (x, y) = (self.read(dx)?, self.read(dy)?);
                self.write(dst, math::get_angle(x, y))?;
            }
            Op::Sqrt { dst, value } => {
                let v = self.read(value)?;
                self.write(dst, math::sqrt(v))?;
            }
            Op::Clamp { dst, min, max } => {
                let (lo, hi) = (self.read(min)?, self.read(max)?);
                let v = self.read(&dst.as_operand())?;
                let clamped = if v < lo {
                    lo
                } else if v > hi {
                    hi
                } else {
                    v
                };
                self.write(dst, clamped)?;
            }
            Op::Inv(dst) => {
                let v = self.read(&dst.as_operand())?;
                self.write(dst, v.wrapping_neg())?;
            }
            Op::MulScale { dst, a, b, shift } => {
                let (a, b, s) = (self.read(a)?, self.read(b)?, self.read(shift)?);
                self.write(dst, math::mul_scale(a, b, s))?;
            }
            Op::DivScale { dst, a, b, shift } => {
                let (a, b, s) = (self.read(a)?, self.read(b)?, self.read(shift)?);
                match math::div_scale(a, b, s) {
                    Some(v) => self.write(dst, v)?,
                    None => {
                        self.write(dst, 0)?;
                        return Err(VmError::DivideByZero);
                    }
                }
            }
            Op::Dist { dst, a, b } => {
                let (a, b) = (self.read(a)?, self.read(b)?);
                let d = self.delta(a, b, SpriteField::X)?;
                let e = self.delta(a, b, SpriteField::Y)?;
                let z = self.delta(a, b, SpriteField::Z)?;
                self.write(dst, math::dist(d, e, z))?;
            }
            Op::LDist { dst, a, b } => {
                let (a, b) = (self.read(a)?, self.read(b)?);
                let d = self.delta(a, b, SpriteField::X)?;
                let e = self.delta(a, b, SpriteField::Y)?;
                self.write(dst, math::ldist(d, e))?;
            }

            Op::JumpUnless { cond, target } => {
                let (lhs, rhs) = (self.read(&cond.lhs)?, self.read(&cond.rhs)?);
                if !cond.cmp.test(lhs, rhs) {
                    self.goto(*target)?;
                }
            }
            Op::Jump(target) => self.goto(*target)?,
            Op::Switch {
                value,
                cases,
                default,
            } => {
                let v = self.read(value)?;
                let target = cases
                    .iter()
                    .find(|(case, _)| *case == v)
                    .map(|(_, t)| *t)
                    .unwrap_or(*default);
                self.goto(target)?;
            }
            Op::ForInit {
                var: _,
                iter,
                args,
                next,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.read(a))
                    .collect::<Result<Vec<_>, _>>()?;
                let cursor = Cursor::snapshot(&*self.store, *iter, &args)?;
                let frame = self.frame()?;
                frame.cursors.insert(ip, cursor);
                frame.ip = *next as usize;
            }
            Op::ForNext { init, end } => {
                let init = *init as usize;
                let Some(Op::ForInit { var, .. }) = program.code.get(init) else {
                    return Err(VmError::Runtime(format!("no for loop at {}", init)));
                };
                let frame = self
                    .frames
                    .last_mut()
                    .ok_or_else(|| VmError::Runtime("no active frame".to_string()))?;
                let cursor = frame
                    .cursors
                    .get_mut(&init)
                    .ok_or_else(|| VmError::Runtime(format!("for loop at {} not started", init)))?;
                match cursor.next(&*self.store) {
                    Some(value) => self.write(var, value)?,
                    None => {
                        frame.cursors.remove(&init);
                        frame.ip = *end as usize;
                    }
                }
            }
            Op::CallState { label, target } => {
                if self.frames.len() >= self.config.max_call_depth {
                    return Err(VmError::CallDepth(self.config.max_call_depth));
                }
                self.frames
                    .push(Frame::new(*target as usize, Context::State(*label)));
            }
            Op::Return(value) => {
                if let Some(value) = value {
                    let v = self.read(value)?;
                    self.state.set_var(VarId::RETURN, v, self.scope)?;
                }
                return Ok(Some(Flow::Return));
            }
            Op::End => return Ok(Some(Flow::Done)),

            Op::GetMember { field, index, dst } => {
                let id = self.read(index)?;
                match self.store.get_field(field.kind(), id, *field) {
                    Ok(v) => self.write(dst, v)?,
                    Err(e) => {
                        self.write(dst, 0)?;
                        return Err(VmError::range(e.to_string()));
                    }
                }
            }
            Op::SetMember {
                field,
                index,
                value,
            } => {
                let (id, v) = (self.read(index)?, self.read(value)?);
                self.set_member(*field, id, v)?;
            }

            Op::GetArraySize { array, dst } => {
                let size = self.state.array_size(*array)?;
                self.write(dst, size)?;
            }
            Op::ResizeArray { array, size } => {
                let size = self.read(size)?;
                self.state.resize_array(*array, size)?;
            }
            Op::CopyArray {
                src,
                src_index,
                dst,
                dst_index,
                count,
            } => {
                let (si, di, n) = (
                    self.read(src_index)?,
                    self.read(dst_index)?,
                    self.read(count)?,
                );
                self.state.copy_array(*src, si, *dst, di, n)?;
            }

            Op::KillIt => {
                let actor = self.scope.actor.ok_or(VmError::NoActor)?;
                self.delete_sprite(actor)?;
                return Ok(Some(Flow::Kill));
            }
            Op::InsertSprite {
                sector,
                status,
                dst,
            } => {
                let (sector, status) = (self.read(sector)?, self.read(status)?);
                self.check_sector(sector)?;
                check_status(status)?;
                let template = [
                    (Field::Sprite(SpriteField::SectNum), sector),
                    (Field::Sprite(SpriteField::StatNum), status),
                    (Field::Sprite(SpriteField::Owner), self.scope.actor.unwrap_or(-1)),
                ];
                let id = self.store.insert_object(ObjectKind::Sprite, &template)?;
                self.state.reset_actor(id);
                self.write(dst, id)?;
            }
            Op::DeleteSprite(sprite) => {
                let id = self.read(sprite)?;
                self.delete_sprite(id)?;
                if Some(id) == self.scope.actor {
                    return Ok(Some(Flow::Kill));
                }
            }
            Op::ChangeSpriteStat { sprite, status } => {
                let (id, status) = (self.read(sprite)?, self.read(status)?);
                check_status(status)?;
                self.store.set_field(
                    ObjectKind::Sprite,
                    id,
                    Field::Sprite(SpriteField::StatNum),
                    status,
                )?;
            }
            Op::ChangeSpriteSect { sprite, sector } => {
                let (id, sector) = (self.read(sprite)?, self.read(sector)?);
                self.check_sector(sector)?;
                self.store.set_field(
                    ObjectKind::Sprite,
                    id,
                    Field::Sprite(SpriteField::SectNum),
                    sector,
                )?;
            }

            Op::AddLog(text) => log::info!("{}: {}", program.location(ip), text),
            Op::AddLogVar(value) => {
                let v = self.read(value)?;
                log::info!(
                    "{}: {} = {}",
                    program.location(ip),
                    program.operand_text(value),
                    v
                );
            }
        }
        Ok(None)
    }

    fn read(&self, operand: &Operand) -> Result<i32, VmError> {
        match operand {
            Operand::Imm(n) => Ok(*n),
            Operand::Var(v) => self.state.get_var(*v, self.scope),
            Operand::Elem(a, index) => {
                let i = self.read(index)?;
                self.state.array_get(*a, i)
            }
        }
    }

    fn write(&mut self, place: &Place, value: i32) -> Result<(), VmError> {
        match place {
            Place::Var(v) => self.state.set_var(*v, value, self.scope),
            Place::Elem(a, index) => {
                let i = self.read(index)?;
                self.state.array_set(*a, i, value)
            }
        }
    }

    fn arith(&mut self, op: ArithOp, dst: &Place, src: &Operand) -> Result<(), VmError> {
        let rhs = self.read(src)?;
        let value = match op {
            ArithOp::Set => rhs,
            ArithOp::Rand => {
                let r = self.state.krand() as i64;
                ((r * (rhs as i64 + 1)) >> 16) as i32
            }
            _ => {
                let lhs = self.read(&dst.as_operand())?;
                match op {
                    ArithOp::Add => lhs.wrapping_add(rhs),
                    ArithOp::Sub => lhs.wrapping_sub(rhs),
                    ArithOp::Mul => lhs.wrapping_mul(rhs),
                    ArithOp::Div | ArithOp::Mod if rhs == 0 => {
                        self.write(dst, 0)?;
                        return Err(VmError::DivideByZero);
                    }
                    ArithOp::Div => lhs.wrapping_div(rhs),
                    ArithOp::Mod => lhs.wrapping_rem(rhs),
                    ArithOp::And => lhs & rhs,
                    ArithOp::Or => lhs | rhs,
                    ArithOp::Xor => lhs ^ rhs,
                    ArithOp::Shl => lhs.wrapping_shl(rhs as u32),
                    ArithOp::Shr => lhs.wrapping_shr(rhs as u32),
                    ArithOp::Set | ArithOp::Rand => rhs,
                }
            }
        };
        self.write(dst, value)
    }

    fn sprite(&self, id: i32, field: SpriteField) -> Result<i32, VmError> {
        Ok(self
            .store
            .get_field(ObjectKind::Sprite, id, Field::Sprite(field))?)
    }

    fn delta(&self, a: i32, b: i32, field: SpriteField) -> Result<i32, VmError> {
        Ok(self.sprite(b, field)?.wrapping_sub(self.sprite(a, field)?))
    }

    fn set_member(&mut self, field: Field, id: i32, value: i32) -> Result<(), VmError> {
        let kind = field.kind();
        if self.store.generation(kind, id).is_none() {
            return Err(VmError::range(format!("{} {} does not exist", kind, id)));
        }
        let label = field.label();
        if label.readonly {
            return Err(VmError::range(format!("{}.{} is read-only", kind, label.name)));
        }
        let out_of_range = || {
            VmError::range(format!(
                "{} out of range for {}.{} ({}..={})",
                value, kind, label.name, label.min, label.max
            ))
        };
        match label.validate(value) {
            Ok(v) => self.store.set_field(kind, id, field, v)?,
            Err(Some(clamped)) => {
                self.store.set_field(kind, id, field, clamped)?;
                return Err(out_of_range());
            }
            Err(None) => return Err(out_of_range()),
        }
        Ok(())
    }

    fn delete_sprite(&mut self, id: i32) -> Result<(), VmError> {
        self.store.delete_object(ObjectKind::Sprite, id)?;
        self.state.reset_actor(id);
        Ok(())
    }

    fn check_sector(&self, sector: i32) -> Result<(), VmError> {
        if self.store.generation(ObjectKind::Sector, sector).is_none() {
            return Err(VmError::range(format!("sector {} does not exist", sector)));
        }
        Ok(())
    }
}

fn check_status(status: i32) -> Result<(), VmError> {
    if !(0..MAXSTATUS).contains(&status) {
        return Err(VmError::range(format!("status {} out of range", status)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ir::{ArrayBacking, ArrayDecl, ArrayId, VarDecl, VarFlags, VarStorage};
    use crate::bytecode::op::{Cmp, Cond, IterKind};
    use crate::bytecode::{Compiler, CompilerConfig};
    use crate::lang::labels::SectorField;
    use crate::runtime::world::{Sector, Sprite, World};

    // ---------------------------------------------------------------------
    // helpers
    // ---------------------------------------------------------------------

    /// Program with the system vars plus `a`, `b`, `c` and an owned array
    /// `arr` of four elements.
    fn program_from_ops(ops: Vec<Op>) -> Program {
        let mut p = Program::new();
        for name in ["RETURN", "THISACTOR", "THISPLAYER", "a", "b", "c"] {
            p.vars.push(VarDecl::new(name, 0, VarFlags(0)));
        }
        for system in [VarId::THISACTOR, VarId::THISPLAYER] {
            p.vars[system.index()].storage = VarStorage::System;
        }
        p.arrays.push(ArrayDecl {
            name: "arr".to_string(),
            size: 4,
            backing: ArrayBacking::Owned,
        });
        p.code = ops;
        p
    }

    const A: VarId = VarId(3);
    const B: VarId = VarId(4);
    const C: VarId = VarId(5);
    const ARR: ArrayId = ArrayId(0);

    fn var(v: VarId) -> Operand {
        Operand::Var(v)
    }

    fn imm(n: i32) -> Operand {
        Operand::Imm(n)
    }

    fn set(dst: VarId, src: Operand) -> Op {
        arith(ArithOp::Set, dst, src)
    }

    fn arith(op: ArithOp, dst: VarId, src: Operand) -> Op {
        Op::Arith {
            op,
            dst: Place::Var(dst),
            src,
        }
    }

    struct Run {
        result: Result<Flow, VmError>,
        state: EngineState,
        world: World,
        instructions: u64,
    }

    fn run_with(program: &Program, world: World, scope: Scope, config: VmConfig) -> Run {
        let mut state = EngineState::new(program);
        let mut world = world;
        let (result, instructions) = {
            let mut vm = Vm::new(program, &mut state, &mut world, &config).with_scope(scope);
            let result = vm.run(0, Context::TopLevel);
            (result, vm.instructions())
        };
        Run {
            result,
            state,
            world,
            instructions,
        }
    }

    fn run_ops(ops: Vec<Op>) -> Run {
        let p = program_from_ops(ops);
        run_with(&p, World::new(), Scope::default(), VmConfig::default())
    }

    fn get(run: &Run, v: VarId) -> i32 {
        run.state.get_var(v, Scope::default()).unwrap()
    }

    fn assert_vars(ops: Vec<Op>, expected: &[(VarId, i32)]) {
        let run = run_ops(ops);
        assert!(run.result.is_ok(), "unexpected error: {:?}", run.result);
        for (v, value) in expected {
            assert_eq!(get(&run, *v), *value, "var #{}", v.0);
        }
    }

    fn assert_error(ops: Vec<Op>, error_contains: &str) {
        let run = run_ops(ops);
        match run.result {
            Err(e) => assert!(
                e.to_string().contains(error_contains),
                "expected error containing '{}', got '{}'",
                error_contains,
                e
            ),
            Ok(flow) => panic!("expected error containing '{}', got {:?}", error_contains, flow),
        }
    }

    fn compile(src: &str) -> Program {
        Compiler::new(CompilerConfig::default())
            .compile_source("test.con", src)
            .expect("compiles")
            .program
    }

    fn world_with_sprites(n: usize) -> World {
        let mut w = World::new();
        w.add_sector(Sector::default());
        for _ in 0..n {
            w.spawn(Sprite::default()).unwrap();
        }
        w
    }

    // ---------------------------------------------------------------------
    // arithmetic
    // ---------------------------------------------------------------------

    #[test]
    fn test_set_and_add() {
        assert_vars(
            vec![set(A, imm(5)), arith(ArithOp::Add, A, imm(-7)), Op::End],
            &[(A, -2)],
        );
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_vars(
            vec![
                set(A, imm(i32::MAX)),
                arith(ArithOp::Add, A, imm(1)),
                set(B, imm(i32::MIN)),
                arith(ArithOp::Div, B, imm(-1)),
                Op::End,
            ],
            &[(A, i32::MIN), (B, i32::MIN)],
        );
    }

    #[test]
    fn test_bitwise_and_shifts() {
        assert_vars(
            vec![
                set(A, imm(0b1100)),
                arith(ArithOp::And, A, imm(0b0110)),
                set(B, imm(1)),
                arith(ArithOp::Shl, B, imm(4)),
                set(C, imm(-16)),
                arith(ArithOp::Shr, C, imm(2)),
                Op::End,
            ],
            &[(A, 0b0100), (B, 16), (C, -4)],
        );
    }

    #[test]
    fn test_mod_and_div() {
        assert_vars(
            vec![
                set(A, imm(17)),
                arith(ArithOp::Mod, A, imm(5)),
                set(B, imm(-17)),
                arith(ArithOp::Div, B, imm(5)),
                Op::End,
            ],
            &[(A, 2), (B, -3)],
        );
    }

    #[test]
    fn test_divide_by_zero_stores_zero() {
        let run = run_ops(vec![
            set(A, imm(9)),
            set(B, imm(0)),
            arith(ArithOp::Div, A, var(B)),
            set(C, imm(1)),
            Op::End,
        ]);
        assert_eq!(run.result, Err(VmError::DivideByZero));
        assert_eq!(get(&run, A), 0);
        // the dispatch stops at the failing instruction
        assert_eq!(get(&run, C), 0);
    }

    #[test]
    fn test_rand_stays_in_range() {
        let mut ops = Vec::new();
        for _ in 0..50 {
            ops.push(arith(ArithOp::Rand, A, imm(9)));
            ops.push(Op::JumpUnless {
                cond: Cond {
                    cmp: Cmp::Le,
                    lhs: var(A),
                    rhs: imm(9),
                },
                target: 200,
            });
        }
        ops.push(set(B, imm(1)));
        ops.push(Op::End);
        assert_vars(ops, &[(B, 1)]);
    }

    #[test]
    fn test_math_ops() {
        let p = |v| Place::Var(v);
        assert_vars(
            vec![
                Op::Sin {
                    dst: p(A),
                    angle: imm(512),
                },
                Op::Sqrt {
                    dst: p(B),
                    value: imm(81),
                },
                set(C, imm(300)),
                Op::Clamp {
                    dst: p(C),
                    min: imm(0),
                    max: imm(255),
                },
                Op::End,
            ],
            &[(A, 16384), (B, 9), (C, 255)],
        );
        assert_vars(
            vec![
                set(A, imm(4)),
                Op::Inv(p(A)),
                Op::MulScale {
                    dst: p(B),
                    a: imm(3),
                    b: imm(1 << 16),
                    shift: imm(16),
                },
                Op::End,
            ],
            &[(A, -4), (B, 3)],
        );
        assert_error(
            vec![
                Op::DivScale {
                    dst: p(A),
                    a: imm(1),
                    b: imm(0),
                    shift: imm(16),
                },
                Op::End,
            ],
            "divide by zero",
        );
    }

    // ---------------------------------------------------------------------
    // control flow
    // ---------------------------------------------------------------------

    #[test]
    fn test_jump_unless() {
        let ops = |start| {
            vec![
                set(A, imm(start)),
                Op::JumpUnless {
                    cond: Cond {
                        cmp: Cmp::Eq,
                        lhs: var(A),
                        rhs: imm(1),
                    },
                    target: 3,
                },
                set(B, imm(10)),
                Op::End,
            ]
        };
        assert_vars(ops(1), &[(B, 10)]);
        assert_vars(ops(2), &[(B, 0)]);
    }

    #[test]
    fn test_switch_dispatches_cases() {
        let ops = |v| {
            vec![
                Op::Switch {
                    value: imm(v),
                    cases: vec![(1, 1), (2, 3)],
                    default: 5,
                },
                set(A, imm(10)),
                Op::Jump(6),
                set(A, imm(20)),
                Op::Jump(6),
                set(A, imm(30)),
                Op::End,
            ]
        };
        assert_vars(ops(1), &[(A, 10)]);
        assert_vars(ops(2), &[(A, 20)]);
        assert_vars(ops(9), &[(A, 30)]);
    }

    #[test]
    fn test_return_sets_value_and_ends_frame() {
        assert_vars(
            vec![Op::Return(Some(imm(42))), set(A, imm(1)), Op::End],
            &[(VarId::RETURN, 42), (A, 0)],
        );
    }

    #[test]
    fn test_state_call_returns_to_caller() {
        let run = run_ops(vec![
            Op::CallState {
                label: LabelId(0),
                target: 3,
            },
            arith(ArithOp::Add, A, imm(1)),
            Op::End,
            // state body
            set(A, imm(10)),
            Op::Return(None),
            set(A, imm(99)),
            Op::End,
        ]);
        assert_eq!(run.result, Ok(Flow::Done));
        assert_eq!(get(&run, A), 11);
    }

    #[test]
    fn test_instruction_limit() {
        let p = program_from_ops(vec![Op::Jump(0)]);
        let config = VmConfig {
            max_instructions: 100,
            ..VmConfig::default()
        };
        let run = run_with(&p, World::new(), Scope::default(), config);
        assert_eq!(run.result, Err(VmError::InstructionLimit(100)));
        assert_eq!(run.instructions, 101);
    }

    #[test]
    fn test_call_depth_limit() {
        let p = program_from_ops(vec![Op::CallState {
            label: LabelId(0),
            target: 0,
        }]);
        let config = VmConfig {
            max_call_depth: 16,
            ..VmConfig::default()
        };
        let run = run_with(&p, World::new(), Scope::default(), config);
        assert_eq!(run.result, Err(VmError::CallDepth(16)));
    }

    #[test]
    fn test_running_off_the_end() {
        let run = run_ops(vec![set(A, imm(1))]);
        assert_eq!(run.result, Ok(Flow::Done));
    }

    // ---------------------------------------------------------------------
    // for loops
    // ---------------------------------------------------------------------

    fn for_loop(iter: IterKind, args: Vec<Operand>, body: Vec<Op>) -> Vec<Op> {
        let body_len = body.len() as u32;
        let end = 2 + body_len + 1;
        let mut ops = vec![
            Op::ForInit {
                var: Place::Var(A),
                iter,
                args,
                next: 1,
            },
            Op::ForNext { init: 0, end },
        ];
        ops.extend(body);
        ops.push(Op::Jump(1));
        ops.push(Op::End);
        ops
    }

    #[test]
    fn test_for_range_sums() {
        assert_vars(
            for_loop(
                IterKind::Range,
                vec![imm(5)],
                vec![arith(ArithOp::Add, B, var(A))],
            ),
            &[(B, 10)],
        );
    }

    #[test]
    fn test_for_over_empty_sector() {
        let mut w = World::new();
        for _ in 0..6 {
            w.add_sector(Sector::default());
        }
        w.spawn(Sprite {
            sectnum: 1,
            ..Sprite::default()
        })
        .unwrap();
        let p = program_from_ops(for_loop(
            IterKind::SpritesOfSector,
            vec![imm(5)],
            vec![arith(ArithOp::Add, B, imm(1))],
        ));
        let run = run_with(&p, w, Scope::default(), VmConfig::default());
        assert_eq!(run.result, Ok(Flow::Done));
        assert_eq!(get(&run, B), 0);
    }

    #[test]
    fn test_for_deleting_each_sprite() {
        let p = program_from_ops(for_loop(
            IterKind::AllSprites,
            vec![],
            vec![
                Op::DeleteSprite(var(A)),
                arith(ArithOp::Add, B, imm(1)),
            ],
        ));
        let run = run_with(&p, world_with_sprites(4), Scope::default(), VmConfig::default());
        assert_eq!(run.result, Ok(Flow::Done));
        assert_eq!(get(&run, B), 4);
        assert!(run.world.live_sprites().is_empty());
    }

    #[test]
    fn test_huge_range_hits_instruction_limit() {
        let p = program_from_ops(for_loop(
            IterKind::Range,
            vec![imm(2_000_000_000)],
            vec![arith(ArithOp::Add, B, imm(1))],
        ));
        let config = VmConfig {
            max_instructions: 1000,
            ..VmConfig::default()
        };
        let run = run_with(&p, World::new(), Scope::default(), config);
        assert_eq!(run.result, Err(VmError::InstructionLimit(1000)));
        assert!(get(&run, B) < 1000);
    }

    #[test]
    fn test_tile_range_out_of_bounds_at_runtime() {
        let p = program_from_ops(for_loop(
            IterKind::TileRange,
            vec![imm(-5), imm(3)],
            vec![arith(ArithOp::Add, B, imm(1))],
        ));
        let run = run_with(&p, World::new(), Scope::default(), VmConfig::default());
        assert!(matches!(run.result, Err(VmError::Range(_))));
        assert_eq!(get(&run, B), 0);
    }

    // ---------------------------------------------------------------------
    // members and arrays
    // ---------------------------------------------------------------------

    #[test]
    fn test_member_get_on_dead_sprite_yields_zero() {
        let run = run_ops(vec![
            set(A, imm(5)),
            Op::GetMember {
                field: Field::Sprite(SpriteField::X),
                index: imm(3),
                dst: Place::Var(A),
            },
            Op::End,
        ]);
        assert!(matches!(run.result, Err(VmError::Range(_))));
        assert_eq!(get(&run, A), 0);
    }

    #[test]
    fn test_member_set_clamps_or_rejects() {
        let p = program_from_ops(vec![
            Op::SetMember {
                field: Field::Sprite(SpriteField::Shade),
                index: imm(0),
                value: imm(500),
            },
            Op::End,
        ]);
        let run = run_with(&p, world_with_sprites(1), Scope::default(), VmConfig::default());
        assert!(matches!(run.result, Err(VmError::Range(_))));
        assert_eq!(run.world.sprite(0).map(|s| s.shade), Some(127));

        let p = program_from_ops(vec![
            Op::SetMember {
                field: Field::Sprite(SpriteField::Picnum),
                index: imm(0),
                value: imm(-1),
            },
            Op::End,
        ]);
        let run = run_with(&p, world_with_sprites(1), Scope::default(), VmConfig::default());
        assert!(matches!(run.result, Err(VmError::Range(_))));
        assert_eq!(run.world.sprite(0).map(|s| s.picnum), Some(0));
    }

    #[test]
    fn test_member_roundtrip_through_vars() {
        let p = program_from_ops(vec![
            Op::SetMember {
                field: Field::Sector(SectorField::FloorZ),
                index: imm(0),
                value: imm(8192),
            },
            Op::GetMember {
                field: Field::Sector(SectorField::FloorZ),
                index: imm(0),
                dst: Place::Var(A),
            },
            Op::End,
        ]);
        let run = run_with(&p, world_with_sprites(0), Scope::default(), VmConfig::default());
        assert_eq!(run.result, Ok(Flow::Done));
        assert_eq!(get(&run, A), 8192);
    }

    #[test]
    fn test_array_ops() {
        let elem = |i| Place::Elem(ARR, Box::new(imm(i)));
        assert_vars(
            vec![
                Op::Arith {
                    op: ArithOp::Set,
                    dst: elem(1),
                    src: imm(7),
                },
                Op::Arith {
                    op: ArithOp::Add,
                    dst: elem(1),
                    src: imm(1),
                },
                set(A, Operand::Elem(ARR, Box::new(imm(1)))),
                Op::ResizeArray {
                    array: ARR,
                    size: imm(10),
                },
                Op::GetArraySize {
                    array: ARR,
                    dst: Place::Var(B),
                },
                Op::End,
            ],
            &[(A, 8), (B, 10)],
        );
        assert_error(
            vec![set(A, Operand::Elem(ARR, Box::new(imm(4)))), Op::End],
            "out of bounds",
        );
    }

    // ---------------------------------------------------------------------
    // actors
    // ---------------------------------------------------------------------

    #[test]
    fn test_killit_deletes_current_actor_once() {
        let p = program_from_ops(vec![Op::KillIt, set(A, imm(1)), Op::End]);
        let run = run_with(
            &p,
            world_with_sprites(2),
            Scope::new(Some(1), None),
            VmConfig::default(),
        );
        assert_eq!(run.result, Ok(Flow::Kill));
        assert_eq!(run.world.live_sprites(), vec![0]);
        assert_eq!(get(&run, A), 0);
    }

    #[test]
    fn test_killit_without_actor() {
        assert_error(vec![Op::KillIt, Op::End], "no current actor");
    }

    #[test]
    fn test_kill_unwinds_nested_states() {
        let p = program_from_ops(vec![
            Op::CallState {
                label: LabelId(0),
                target: 3,
            },
            set(A, imm(1)),
            Op::End,
            Op::KillIt,
            Op::End,
        ]);
        let run = run_with(
            &p,
            world_with_sprites(1),
            Scope::new(Some(0), None),
            VmConfig::default(),
        );
        assert_eq!(run.result, Ok(Flow::Kill));
        assert_eq!(get(&run, A), 0);
    }

    #[test]
    fn test_insert_and_move_sprite() {
        let p = program_from_ops(vec![
            Op::InsertSprite {
                sector: imm(0),
                status: imm(2),
                dst: Place::Var(A),
            },
            Op::ChangeSpriteStat {
                sprite: var(A),
                status: imm(5),
            },
            Op::End,
        ]);
        let run = run_with(&p, world_with_sprites(1), Scope::default(), VmConfig::default());
        assert_eq!(run.result, Ok(Flow::Done));
        assert_eq!(get(&run, A), 1);
        assert_eq!(run.world.sprite(1).map(|s| s.statnum), Some(5));
    }

    #[test]
    fn test_this_actor() {
        let p = program_from_ops(vec![set(A, var(VarId::THISACTOR)), Op::End]);
        let run = run_with(
            &p,
            world_with_sprites(4),
            Scope::new(Some(3), None),
            VmConfig::default(),
        );
        assert_eq!(get(&run, A), 3);
    }

    #[test]
    fn test_dist_between_sprites() {
        let mut w = World::new();
        w.spawn(Sprite::default()).unwrap();
        w.spawn(Sprite {
            x: 1024,
            ..Sprite::default()
        })
        .unwrap();
        let p = program_from_ops(vec![
            Op::LDist {
                dst: Place::Var(A),
                a: imm(0),
                b: imm(1),
            },
            Op::End,
        ]);
        let run = run_with(&p, w, Scope::default(), VmConfig::default());
        assert_eq!(get(&run, A), math::ldist(1024, 0));
    }

    // ---------------------------------------------------------------------
    // compiled scripts
    // ---------------------------------------------------------------------

    #[test]
    fn test_compiled_loop_and_state() {
        let p = compile(
            "gamevar total 0 0
             gamevar i 0 0
             defstate bump addvar total 2 ends
             onevent EVENT_GAME
               for i range 3 { state bump }
             endevent",
        );
        let entry = p.event_offset(EventId::GAME).unwrap();
        let config = VmConfig::default();
        let mut state = EngineState::new(&p);
        let mut world = World::new();
        let flow = Vm::new(&p, &mut state, &mut world, &config)
            .run(entry, Context::Event(EventId::GAME))
            .unwrap();
        assert_eq!(flow, Flow::Done);
        let total = state.var_id("total").unwrap();
        assert_eq!(state.get_var(total, Scope::default()), Ok(6));
    }
}
