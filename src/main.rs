use std::{
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

use conscript::bytecode::disasm::{print_bc, print_bc_stats};
use conscript::bytecode::{Compiler, CompilerConfig, Program};
use conscript::frontend::lexer::Lexer;
use conscript::frontend::token_dumper::TokenDumper;
use conscript::lang::events::EventId;
use conscript::runtime::{ScriptRuntime, VmConfig, World};

/// Compile a game script and optionally run it against a world.
#[derive(Parser, Debug)]
#[command(about = "Compiler and VM for CON-style game scripts", version)]
struct Args {
    /// Script to compile
    script: PathBuf,

    /// Print the token stream and exit
    #[arg(long)]
    tokens: bool,

    /// Disable ANSI colors in the token dump
    #[arg(long)]
    no_color: bool,

    /// Print tokens by their source spelling
    #[arg(long)]
    pretty: bool,

    /// Print the bytecode listing
    #[arg(long)]
    bc: bool,

    /// Print instruction counts by opcode
    #[arg(long)]
    stats: bool,

    /// JSON file with `compiler` and `vm` settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// File pulled in by `includedefault`
    #[arg(long)]
    include_default: Option<PathBuf>,

    /// Instruction ceiling per dispatch
    #[arg(long)]
    max_instructions: Option<u64>,

    /// JSON world to run against (empty world when omitted)
    #[arg(long)]
    world: Option<PathBuf>,

    /// Write the world back as JSON after running
    #[arg(long)]
    save_world: Option<PathBuf>,

    /// Dispatch this event once (name like EVENT_GAME or a number)
    #[arg(long)]
    event: Option<String>,

    /// Run this many ticks after entering the level
    #[arg(long, default_value_t = 0)]
    ticks: u32,

    /// Players processed each tick
    #[arg(long, default_value_t = 1)]
    players: i32,

    /// Initial RNG seed
    #[arg(long, default_value_t = 0)]
    seed: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    compiler: CompilerConfig,
    vm: VmConfig,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.tokens {
        return dump_tokens(&args.script, args.no_color, args.pretty);
    }

    let mut config = match args.config.as_deref() {
        Some(path) => load_config(path)?,
        None => CliConfig::default(),
    };
    if let Some(path) = args.include_default.clone() {
        config.compiler.default_include = Some(path);
    }
    if let Some(max) = args.max_instructions {
        config.vm.max_instructions = max;
    }

    let program = compile(&args.script, config.compiler)?;
    if args.bc {
        print_bc(&program);
    }
    if args.stats {
        print_bc_stats(&program);
    }
    if args.event.is_none() && args.ticks == 0 {
        return Ok(());
    }

    let mut world = match args.world.as_deref() {
        Some(path) => load_world(path)?,
        None => World::new(),
    };
    let mut runtime = ScriptRuntime::with_config(Rc::new(program), config.vm);
    runtime.state.set_seed(args.seed);

    if let Some(name) = args.event.as_deref() {
        let event = parse_event(name)?;
        let outcome = runtime.dispatch_with_outcome(&mut world, event, None, None, 0);
        println!(
            "{} -> {} ({} instructions{})",
            event,
            outcome.value,
            outcome.instructions,
            outcome
                .error
                .map(|e| format!(", error: {}", e))
                .unwrap_or_default()
        );
    }

    if args.ticks > 0 {
        runtime.enter_level(&mut world);
        for tick in 1..=args.ticks {
            let summary = runtime.tick(&mut world, args.players);
            println!(
                "tick {:>4}: {} dispatches, {} errors, {} killed, {} instructions, {} sprites",
                tick,
                summary.dispatches,
                summary.errors,
                summary.killed,
                summary.instructions,
                world.live_sprites().len()
            );
        }
    }

    if let Some(path) = args.save_world.as_ref() {
        let json = world.to_json().context("serializing world")?;
        fs::write(path, json).with_context(|| format!("writing world to {}", path.display()))?;
    }
    Ok(())
}

fn dump_tokens(path: &Path, no_color: bool, pretty: bool) -> Result<()> {
    let source =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let tokens = Lexer::new(&source)
        .tokenize()
        .with_context(|| format!("tokenizing {}", path.display()))?;

    let mut dumper = TokenDumper::new();
    if no_color {
        dumper = dumper.no_color();
    }
    if pretty {
        dumper = dumper.pretty();
    }
    dumper.dump(&tokens);
    Ok(())
}

fn load_config(path: &Path) -> Result<CliConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn load_world(path: &Path) -> Result<World> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading world {}", path.display()))?;
    World::from_json(&text).with_context(|| format!("parsing world {}", path.display()))
}

fn compile(path: &Path, config: CompilerConfig) -> Result<Program> {
    match Compiler::new(config).compile_file(path) {
        Ok(out) => {
            if !out.diagnostics.is_empty() {
                eprintln!("{}", out.diagnostics);
            }
            Ok(out.program)
        }
        Err(failure) => {
            eprintln!("{}", failure.diagnostics);
            Err(anyhow::Error::new(failure).context(format!("compiling {}", path.display())))
        }
    }
}

fn parse_event(name: &str) -> Result<EventId> {
    if let Some(event) = EventId::from_name(name) {
        return Ok(event);
    }
    match name.parse::<i32>() {
        Ok(n) => EventId::new(n).ok_or_else(|| anyhow!("event {} out of range", n)),
        Err(_) => bail!("unknown event '{}'", name),
    }
}
