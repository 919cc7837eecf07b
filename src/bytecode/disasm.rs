use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;

use crate::bytecode::Program;
use crate::bytecode::ir::LabelKind;
use crate::bytecode::op::{ArithOp, Op, Operand, Place};
use crate::lang::labels::Field;

/// Print disassembly of a bytecode program
pub fn print_bc(program: &Program) {
    print!("{}", disassemble(program));
}

/// Full listing: a header per state, event and actor entry, a marker on
/// every jump target.
pub fn disassemble(program: &Program) -> String {
    let mut out = String::new();
    let entries = collect_entries(program);
    let jump_targets = collect_jump_targets(&program.code);

    let _ = writeln!(out, "=== BYTECODE PROGRAM ===");
    let _ = writeln!(
        out,
        "{} instructions, {} gamevars, {} gamearrays\n",
        program.code.len(),
        program.vars.len(),
        program.arrays.len()
    );

    for (ip, op) in program.code.iter().enumerate() {
        if let Some(names) = entries.get(&(ip as u32)) {
            let _ = writeln!(out, "════════════════════════════════════════");
            for name in names {
                let _ = writeln!(out, " {}", name);
            }
            let _ = writeln!(out, "════════════════════════════════════════");
        }
        if jump_targets.contains(&(ip as u32)) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }

        let marker = if jump_targets.contains(&(ip as u32)) {
            "► "
        } else {
            "  "
        };
        let _ = writeln!(
            out,
            "{:04} {}{:<40} ; {}",
            ip,
            marker,
            format_op(program, op, ip),
            program.location(ip)
        );
    }
    out
}

fn collect_entries(program: &Program) -> BTreeMap<u32, Vec<String>> {
    let mut entries: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for label in &program.labels {
        if let Some(offset) = label.offset {
            let name = match label.kind {
                LabelKind::State => format!("state {}", label.name),
                LabelKind::Actor | LabelKind::Event => label.name.clone(),
            };
            entries.entry(offset).or_default().push(name);
        }
    }
    entries
}

fn collect_jump_targets(ops: &[Op]) -> HashSet<u32> {
    ops.iter().flat_map(|op| op.targets()).collect()
}

fn field_name(field: Field) -> String {
    format!("{}.{}", field.kind(), field.label().name)
}

fn format_op(p: &Program, op: &Op, ip: usize) -> String {
    let v = |o: &Operand| p.operand_text(o);
    let d = |pl: &Place| p.place_text(pl);

    match op {
        Op::Arith { op, dst, src } => {
            let sym = match op {
                ArithOp::Set => "=",
                ArithOp::Add => "+=",
                ArithOp::Sub => "-=",
                ArithOp::Mul => "*=",
                ArithOp::Div => "/=",
                ArithOp::Mod => "%=",
                ArithOp::And => "&=",
                ArithOp::Or => "|=",
                ArithOp::Xor => "^=",
                ArithOp::Shl => "<<=",
                ArithOp::Shr => ">>=",
                ArithOp::Rand => "= rand",
            };
            format!("{:<12}{} {} {}", "ARITH", d(dst), sym, v(src))
        }
        Op::Sin { dst, angle } => format!("{:<12}{} {}", "SIN", d(dst), v(angle)),
        Op::Cos { dst, angle } => format!("{:<12}{} {}", "COS", d(dst), v(angle)),
        Op::GetAngle { dst, dx, dy } => {
            format!("{:<12}{} {} {}", "GETANGLE", d(dst), v(dx), v(dy))
        }
        Op::Sqrt { dst, value } => format!("{:<12}{} {}", "SQRT", d(dst), v(value)),
        Op::Clamp { dst, min, max } => {
            format!("{:<12}{} {} {}", "CLAMP", d(dst), v(min), v(max))
        }
        Op::Inv(dst) => format!("{:<12}{}", "INV", d(dst)),
        Op::MulScale { dst, a, b, shift } => {
            format!("{:<12}{} {} {} {}", "MULSCALE", d(dst), v(a), v(b), v(shift))
        }
        Op::DivScale { dst, a, b, shift } => {
            format!("{:<12}{} {} {} {}", "DIVSCALE", d(dst), v(a), v(b), v(shift))
        }
        Op::Dist { dst, a, b } => format!("{:<12}{} {} {}", "DIST", d(dst), v(a), v(b)),
        Op::LDist { dst, a, b } => format!("{:<12}{} {} {}", "LDIST", d(dst), v(a), v(b)),

        Op::JumpUnless { cond, target } => {
            let arrow = if (*target as usize) > ip { "↓" } else { "↑" };
            format!(
                "{:<12}{} {} {} → {:04} {}",
                "JUMP_UNLESS",
                v(&cond.lhs),
                cond.cmp.symbol(),
                v(&cond.rhs),
                target,
                arrow
            )
        }
        Op::Jump(target) => {
            let arrow = if (*target as usize) > ip { "↓" } else { "↑" };
            format!("{:<12}→ {:04} {}", "JUMP", target, arrow)
        }
        Op::Switch {
            value,
            cases,
            default,
        } => {
            let arms: Vec<String> = cases
                .iter()
                .map(|(c, t)| format!("{}→{:04}", c, t))
                .collect();
            format!(
                "{:<12}{} [{}] default→{:04}",
                "SWITCH",
                v(value),
                arms.join(" "),
                default
            )
        }
        Op::ForInit {
            var,
            iter,
            args,
            next,
        } => {
            let args: Vec<String> = args.iter().map(|a| v(a)).collect();
            format!(
                "{:<12}{} in {} {} → {:04}",
                "FOR_INIT",
                d(var),
                iter.name(),
                args.join(" "),
                next
            )
        }
        Op::ForNext { init, end } => {
            format!("{:<12}@{:04} done→{:04}", "FOR_NEXT", init, end)
        }
        Op::CallState { label, target } => {
            format!("{:<12}{} → {:04}", "STATE", p.label_name(*label), target)
        }
        Op::Return(Some(value)) => format!("{:<12}{}", "RETURN", v(value)),
        Op::Return(None) => "RETURN".to_string(),
        Op::End => "END".to_string(),

        Op::GetMember { field, index, dst } => format!(
            "{:<12}{}[{}] → {}",
            "GET",
            field_name(*field),
            v(index),
            d(dst)
        ),
        Op::SetMember {
            field,
            index,
            value,
        } => format!(
            "{:<12}{}[{}] ← {}",
            "SET",
            field_name(*field),
            v(index),
            v(value)
        ),

        Op::GetArraySize { array, dst } => {
            format!("{:<12}{} → {}", "ARRAY_SIZE", p.array_name(*array), d(dst))
        }
        Op::ResizeArray { array, size } => {
            format!("{:<12}{} {}", "RESIZE", p.array_name(*array), v(size))
        }
        Op::CopyArray {
            src,
            src_index,
            dst,
            dst_index,
            count,
        } => format!(
            "{:<12}{}[{}] → {}[{}] x{}",
            "COPY",
            p.array_name(*src),
            v(src_index),
            p.array_name(*dst),
            v(dst_index),
            v(count)
        ),

        Op::KillIt => "KILLIT".to_string(),
        Op::InsertSprite {
            sector,
            status,
            dst,
        } => format!(
            "{:<12}sector {} status {} → {}",
            "INSERT",
            v(sector),
            v(status),
            d(dst)
        ),
        Op::DeleteSprite(sprite) => format!("{:<12}{}", "DELETE", v(sprite)),
        Op::ChangeSpriteStat { sprite, status } => {
            format!("{:<12}{} {}", "CHANGE_STAT", v(sprite), v(status))
        }
        Op::ChangeSpriteSect { sprite, sector } => {
            format!("{:<12}{} {}", "CHANGE_SECT", v(sprite), v(sector))
        }

        Op::AddLog(text) => format!("{:<12}{:?}", "LOG", text),
        Op::AddLogVar(value) => format!("{:<12}{}", "LOG_VAR", v(value)),
    }
}

/// Instruction counts by opcode, most frequent first.
pub fn op_counts(program: &Program) -> Vec<(&'static str, usize)> {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for op in &program.code {
        *counts.entry(op.name()).or_insert(0) += 1;
    }
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    counts
}

pub fn print_bc_stats(program: &Program) {
    println!("=== BYTECODE STATS ===");
    println!("instructions: {}", program.code.len());
    println!(
        "states: {}",
        program
            .labels
            .iter()
            .filter(|l| l.kind == LabelKind::State)
            .count()
    );
    println!(
        "events: {}",
        program.events.iter().filter(|e| e.is_some()).count()
    );
    println!("actors: {}", program.actors.len());
    for (name, count) in op_counts(program) {
        println!("  {:<18} {}", name, count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Compiler, CompilerConfig};

    fn compile(src: &str) -> Program {
        Compiler::new(CompilerConfig::default())
            .compile_source("test.con", src)
            .expect("compiles")
            .program
    }

    #[test]
    fn test_listing_has_entry_headers() {
        let p = compile(
            "gamevar hp 10 0
             defstate heal addvar hp 5 ends
             onevent EVENT_GAME state heal endevent",
        );
        let text = disassemble(&p);
        assert!(text.contains(" state heal"));
        assert!(text.contains(" EVENT_GAME"));
        assert!(text.contains("hp += 5"));
        assert!(text.contains("STATE       heal → 0000"));
    }

    #[test]
    fn test_jump_targets_marked() {
        let p = compile("gamevar a 0 0 onevent 1 ifvare a 1 setvar a 2 setvar a 3 endevent");
        let text = disassemble(&p);
        assert!(text.contains("0002 ► ARITH"));
        assert!(text.contains("JUMP_UNLESS a == 1 → 0002 ↓"));
    }

    #[test]
    fn test_op_counts() {
        let p = compile("gamevar a 0 0 onevent 1 addvar a 1 addvar a 2 setvar a 0 endevent");
        let counts = op_counts(&p);
        assert_eq!(counts[0], ("add", 2));
        assert!(counts.contains(&("end", 1)));
        assert!(counts.contains(&("set", 1)));
    }
}
