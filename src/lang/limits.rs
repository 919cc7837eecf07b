//! Static engine limits the compiler range-checks constants against.

pub const MAXSECTORS: i32 = 4096;
pub const MAXWALLS: i32 = 16384;
pub const MAXSPRITES: i32 = 16384;

pub const MAXTILES: i32 = 30720;
/// Tiles above this are reserved for the engine.
pub const MAXUSERTILES: i32 = MAXTILES - 16;

pub const MAXSTATUS: i32 = 1024;
pub const MAXPLAYERS: i32 = 16;

/// Event ids live in `1..=MAX_EVENTS`.
pub const MAX_EVENTS: usize = 128;

/// Angle units per full turn. Every angle/trig operator works in this domain.
pub const ANGLE_UNITS: i32 = 2048;
pub const ANGLE_MASK: i32 = ANGLE_UNITS - 1;
