//! Entry points the host calls: events, actor code, and whole ticks.

use std::rc::Rc;

use crate::bytecode::Program;
use crate::bytecode::ir::VarId;
use crate::lang::events::EventId;
use crate::lang::labels::{Field, ObjectKind, SpriteField};
use crate::runtime::runtime_error::VmError;
use crate::runtime::state::{EngineState, Scope};
use crate::runtime::vm_bc::{Context, Flow, Vm, VmConfig};
use crate::runtime::world::ObjectStore;

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// `RETURN` after the run, or the default when nothing ran.
    pub value: i32,
    pub error: Option<VmError>,
    /// The current actor was deleted.
    pub killed: bool,
    pub instructions: u64,
}

impl DispatchOutcome {
    fn skipped(value: i32) -> Self {
        DispatchOutcome {
            value,
            error: None,
            killed: false,
            instructions: 0,
        }
    }
}

/// Totals over one `tick`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatches: usize,
    pub errors: usize,
    pub killed: usize,
    pub instructions: u64,
}

impl TickSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        if outcome.instructions == 0 && outcome.error.is_none() {
            return;
        }
        self.dispatches += 1;
        self.errors += outcome.error.is_some() as usize;
        self.killed += outcome.killed as usize;
        self.instructions += outcome.instructions;
    }
}

pub struct ScriptRuntime {
    pub program: Rc<Program>,
    pub state: EngineState,
    pub config: VmConfig,
}

impl ScriptRuntime {
    pub fn new(program: Rc<Program>) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Rc<Program>, config: VmConfig) -> Self {
        let state = EngineState::new(&program);
        ScriptRuntime {
            program,
            state,
            config,
        }
    }

    pub fn has_event(&self, event: EventId) -> bool {
        self.program.event_offset(event).is_some()
    }

    /// Runs `event` and returns its `RETURN` value, or `default` when no
    /// script handles it. Errors are logged by the VM and otherwise dropped.
    pub fn dispatch(
        &mut self,
        store: &mut dyn ObjectStore,
        event: EventId,
        actor: Option<i32>,
        player: Option<i32>,
        default: i32,
    ) -> i32 {
        self.dispatch_with_outcome(store, event, actor, player, default)
            .value
    }

    pub fn dispatch_with_outcome(
        &mut self,
        store: &mut dyn ObjectStore,
        event: EventId,
        actor: Option<i32>,
        player: Option<i32>,
        default: i32,
    ) -> DispatchOutcome {
        let Some(entry) = self.program.event_offset(event) else {
            return DispatchOutcome::skipped(default);
        };
        log::debug!("dispatch {} actor={:?} player={:?}", event, actor, player);
        self.run(
            store,
            entry,
            Context::Event(event),
            Scope::new(actor, player),
            default,
        )
    }

    /// Runs the actor block for the sprite's tile, if the script has one.
    pub fn run_actor(
        &mut self,
        store: &mut dyn ObjectStore,
        sprite: i32,
        player: Option<i32>,
    ) -> DispatchOutcome {
        let picnum = match store.get_field(
            ObjectKind::Sprite,
            sprite,
            Field::Sprite(SpriteField::Picnum),
        ) {
            Ok(picnum) => picnum,
            Err(e) => {
                return DispatchOutcome {
                    error: Some(e.into()),
                    ..DispatchOutcome::skipped(0)
                };
            }
        };
        let Some(entry) = self.program.actor_offset(picnum) else {
            return DispatchOutcome::skipped(0);
        };
        log::debug!("actor {} sprite={}", picnum, sprite);
        self.run(
            store,
            entry,
            Context::Actor(picnum),
            Scope::new(Some(sprite), player),
            0,
        )
    }

    /// One game tick: world events, then every sprite that is live at the
    /// start of the actor phase (actor code, then `EVENT_GAME`), then
    /// `EVENT_PROCESSINPUT` for each player.
    pub fn tick(&mut self, store: &mut dyn ObjectStore, players: i32) -> TickSummary {
        let mut summary = TickSummary::default();
        for event in [EventId::PREWORLD, EventId::WORLD] {
            let outcome = self.dispatch_with_outcome(store, event, None, None, 0);
            summary.record(&outcome);
        }

        let sprites: Vec<(i32, u32)> = (0..store.object_count(ObjectKind::Sprite))
            .filter_map(|id| store.generation(ObjectKind::Sprite, id).map(|g| (id, g)))
            .collect();
        for (id, generation) in sprites {
            let alive = |store: &dyn ObjectStore| {
                store.generation(ObjectKind::Sprite, id) == Some(generation)
            };
            if !alive(&*store) {
                continue;
            }
            let outcome = self.run_actor(store, id, None);
            summary.record(&outcome);
            if outcome.killed || !alive(&*store) {
                continue;
            }
            let outcome = self.dispatch_with_outcome(store, EventId::GAME, Some(id), None, 0);
            summary.record(&outcome);
        }

        for player in 0..players {
            let outcome =
                self.dispatch_with_outcome(store, EventId::PROCESSINPUT, None, Some(player), 0);
            summary.record(&outcome);
        }
        summary
    }

    /// Resets level-scoped storage and runs `EVENT_ENTERLEVEL`.
    pub fn enter_level(&mut self, store: &mut dyn ObjectStore) -> DispatchOutcome {
        self.state.reset_level();
        self.dispatch_with_outcome(store, EventId::ENTERLEVEL, None, None, 0)
    }

    fn run(
        &mut self,
        store: &mut dyn ObjectStore,
        entry: u32,
        context: Context,
        scope: Scope,
        default: i32,
    ) -> DispatchOutcome {
        let program = Rc::clone(&self.program);
        if let Err(e) = self.state.set_var(VarId::RETURN, default, scope) {
            return DispatchOutcome {
                error: Some(e),
                ..DispatchOutcome::skipped(default)
            };
        }

        let mut vm = Vm::new(&program, &mut self.state, store, &self.config).with_scope(scope);
        let result = vm.run(entry, context);
        let instructions = vm.instructions();

        let value = self
            .state
            .get_var(VarId::RETURN, scope)
            .unwrap_or(default);
        let (killed, error) = match result {
            Ok(flow) => (flow == Flow::Kill, None),
            Err(e) => (false, Some(e)),
        };
        DispatchOutcome {
            value,
            error,
            killed,
            instructions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Compiler, CompilerConfig};
    use crate::runtime::world::{AccessError, Sector, Sprite, World};

    fn runtime(src: &str) -> ScriptRuntime {
        let out = Compiler::new(CompilerConfig::default())
            .compile_source("test.con", src)
            .expect("compiles");
        ScriptRuntime::new(Rc::new(out.program))
    }

    fn var(rt: &ScriptRuntime, name: &str, scope: Scope) -> i32 {
        let id = rt.state.var_id(name).expect("declared");
        rt.state.get_var(id, scope).unwrap()
    }

    fn world_with(sprites: &[Sprite]) -> World {
        let mut w = World::new();
        w.add_sector(Sector::default());
        for s in sprites {
            w.spawn(s.clone()).unwrap();
        }
        w
    }

    /// Forwards to a `World` and counts deletions.
    struct CountingStore {
        inner: World,
        deletes: usize,
    }

    impl ObjectStore for CountingStore {
        fn object_count(&self, kind: ObjectKind) -> i32 {
            self.inner.object_count(kind)
        }

        fn generation(&self, kind: ObjectKind, id: i32) -> Option<u32> {
            self.inner.generation(kind, id)
        }

        fn get_field(&self, kind: ObjectKind, id: i32, field: Field) -> Result<i32, AccessError> {
            self.inner.get_field(kind, id, field)
        }

        fn set_field(
            &mut self,
            kind: ObjectKind,
            id: i32,
            field: Field,
            value: i32,
        ) -> Result<(), AccessError> {
            self.inner.set_field(kind, id, field, value)
        }

        fn insert_object(
            &mut self,
            kind: ObjectKind,
            template: &[(Field, i32)],
        ) -> Result<i32, AccessError> {
            self.inner.insert_object(kind, template)
        }

        fn delete_object(&mut self, kind: ObjectKind, id: i32) -> Result<(), AccessError> {
            self.deletes += 1;
            self.inner.delete_object(kind, id)
        }
    }

    #[test]
    fn test_event_accumulates_across_dispatches() {
        let mut rt = runtime(
            "gamevar health 100 0
             onevent EVENT_GAME addvar health -10 endevent",
        );
        let mut world = World::new();
        rt.dispatch(&mut world, EventId::GAME, None, None, 0);
        rt.dispatch(&mut world, EventId::GAME, None, None, 0);
        assert_eq!(var(&rt, "health", Scope::default()), 80);
    }

    #[test]
    fn test_killit_calls_delete_exactly_once() {
        let mut rt = runtime(
            "gamevar health -5 0
             onevent EVENT_GAME
               if health < 0 { killit }
               setvar health 1
             endevent",
        );
        let mut store = CountingStore {
            inner: world_with(&[Sprite::default()]),
            deletes: 0,
        };
        let outcome = rt.dispatch_with_outcome(&mut store, EventId::GAME, Some(0), None, 0);
        assert!(outcome.killed);
        assert_eq!(outcome.error, None);
        assert_eq!(store.deletes, 1);
        assert!(store.inner.live_sprites().is_empty());
        // unwound before the following statement
        assert_eq!(var(&rt, "health", Scope::default()), -5);
    }

    #[test]
    fn test_missing_event_returns_default() {
        let mut rt = runtime("gamevar a 0 0");
        let mut world = World::new();
        assert!(!rt.has_event(EventId::GAME));
        assert_eq!(rt.dispatch(&mut world, EventId::GAME, None, None, 7), 7);
    }

    #[test]
    fn test_return_value() {
        let mut rt = runtime(
            "onevent EVENT_DAMAGESPRITE
               ifvare RETURN 10 return 3
             endevent",
        );
        let mut world = World::new();
        assert_eq!(rt.dispatch(&mut world, EventId::DAMAGESPRITE, None, None, 10), 3);
        assert_eq!(rt.dispatch(&mut world, EventId::DAMAGESPRITE, None, None, 4), 4);
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let mut rt = runtime(
            "gamevar a 5 0
             gamevar zero 0 0
             onevent EVENT_GAME divvarvar a zero endevent",
        );
        let mut world = World::new();
        let outcome = rt.dispatch_with_outcome(&mut world, EventId::GAME, None, None, 0);
        assert_eq!(outcome.error, Some(VmError::DivideByZero));
        assert_eq!(var(&rt, "a", Scope::default()), 0);
    }

    #[test]
    fn test_instruction_ceiling() {
        let mut rt = runtime(
            "gamevar a 0 0
             onevent EVENT_GAME whilevarn a 1 { addvar a 2 } endevent",
        );
        rt.config.max_instructions = 500;
        let mut world = World::new();
        let outcome = rt.dispatch_with_outcome(&mut world, EventId::GAME, None, None, 0);
        assert_eq!(outcome.error, Some(VmError::InstructionLimit(500)));
    }

    #[test]
    fn test_actor_code_uses_per_actor_vars() {
        let mut rt = runtime(
            "gamevar count 0 2
             actor 1405 addvar count 1 enda",
        );
        let mut world = world_with(&[
            Sprite {
                picnum: 1405,
                ..Sprite::default()
            },
            Sprite {
                picnum: 7,
                ..Sprite::default()
            },
        ]);
        rt.run_actor(&mut world, 0, None);
        rt.run_actor(&mut world, 0, None);
        let skipped = rt.run_actor(&mut world, 1, None);
        assert_eq!(skipped.instructions, 0);
        assert_eq!(var(&rt, "count", Scope::new(Some(0), None)), 2);
        assert_eq!(var(&rt, "count", Scope::new(Some(1), None)), 0);
    }

    #[test]
    fn test_tick_order() {
        let mut rt = runtime(
            "gamearray trace 16
             gamevar n 0 0
             onevent EVENT_PREWORLD setarray trace[n] 1 addvar n 1 endevent
             onevent EVENT_WORLD setarray trace[n] 2 addvar n 1 endevent
             actor 100 setarray trace[n] 10 addvar n 1 enda
             onevent EVENT_GAME setarray trace[n] 20 addvar n 1 endevent
             onevent EVENT_PROCESSINPUT setarray trace[n] 30 addvar n 1 endevent",
        );
        let mut world = world_with(&[Sprite {
            picnum: 100,
            ..Sprite::default()
        }]);
        let summary = rt.tick(&mut world, 2);
        assert_eq!(summary.dispatches, 6);
        assert_eq!(summary.errors, 0);

        let trace = rt.state.array_id("trace").unwrap();
        let got: Vec<i32> = (0..6).map(|i| rt.state.array_get(trace, i).unwrap()).collect();
        assert_eq!(got, vec![1, 2, 10, 20, 30, 30]);
    }

    #[test]
    fn test_tick_skips_sprites_deleted_earlier_in_tick() {
        let mut rt = runtime(
            "gamevar seen 0 0
             actor 1 deletesprite 1 enda
             actor 2 addvar seen 1 enda",
        );
        let mut world = world_with(&[
            Sprite {
                picnum: 1,
                ..Sprite::default()
            },
            Sprite {
                picnum: 2,
                ..Sprite::default()
            },
        ]);
        rt.tick(&mut world, 0);
        assert_eq!(var(&rt, "seen", Scope::default()), 0);
        assert_eq!(world.live_sprites(), vec![0]);
    }

    #[test]
    fn test_enter_level_resets_vars() {
        let mut rt = runtime(
            "gamevar kills 0 0
             gamevar total 0 0x20000
             onevent EVENT_ENTERLEVEL addvar kills 1 addvar total 1 endevent",
        );
        let mut world = World::new();
        rt.enter_level(&mut world);
        rt.enter_level(&mut world);
        assert_eq!(var(&rt, "kills", Scope::default()), 1);
        assert_eq!(var(&rt, "total", Scope::default()), 2);
    }
}
