use serde::{Deserialize, Serialize};

use super::limits::MAX_EVENTS;

/// A global hook point. Valid ids are `1..=MAX_EVENTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(u16);

impl EventId {
    pub const INIT: EventId = EventId(1);
    pub const ENTERLEVEL: EventId = EventId(2);
    pub const RESETPLAYER: EventId = EventId(3);
    pub const PREWORLD: EventId = EventId(4);
    pub const WORLD: EventId = EventId(5);
    pub const GAME: EventId = EventId(6);
    pub const EGS: EventId = EventId(7);
    pub const SPAWN: EventId = EventId(8);
    pub const PROCESSINPUT: EventId = EventId(9);
    pub const LOADACTOR: EventId = EventId(10);
    pub const DAMAGESPRITE: EventId = EventId(11);
    pub const DAMAGEWALL: EventId = EventId(12);
    pub const USER: EventId = EventId(64);

    pub fn new(id: i32) -> Option<EventId> {
        if id >= 1 && id as usize <= MAX_EVENTS {
            Some(EventId(id as u16))
        } else {
            None
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Looks up an `EVENT_*` name.
    pub fn from_name(name: &str) -> Option<EventId> {
        EVENT_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, id)| *id)
    }

    pub fn name(self) -> Option<&'static str> {
        EVENT_NAMES
            .iter()
            .find(|(_, id)| *id == self)
            .map(|(n, _)| *n)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "event {}", self.0),
        }
    }
}

pub const EVENT_NAMES: &[(&str, EventId)] = &[
    ("EVENT_INIT", EventId::INIT),
    ("EVENT_ENTERLEVEL", EventId::ENTERLEVEL),
    ("EVENT_RESETPLAYER", EventId::RESETPLAYER),
    ("EVENT_PREWORLD", EventId::PREWORLD),
    ("EVENT_WORLD", EventId::WORLD),
    ("EVENT_GAME", EventId::GAME),
    ("EVENT_EGS", EventId::EGS),
    ("EVENT_SPAWN", EventId::SPAWN),
    ("EVENT_PROCESSINPUT", EventId::PROCESSINPUT),
    ("EVENT_LOADACTOR", EventId::LOADACTOR),
    ("EVENT_DAMAGESPRITE", EventId::DAMAGESPRITE),
    ("EVENT_DAMAGEWALL", EventId::DAMAGEWALL),
    ("EVENT_USER", EventId::USER),
];
