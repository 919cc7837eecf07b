//! Snapshotted traversals for the `for` statement.
//!
//! The visiting order is fixed when the loop starts. Object entries carry
//! the generation they had then, and an entry whose object has since been
//! deleted (or whose slot was reused) is skipped, so mutating the world
//! from the loop body never skips or repeats any other object. Numeric
//! ranges are counted lazily and never materialized.

use crate::bytecode::op::IterKind;
use crate::lang::labels::{Field, ObjectKind, SectorField, SpriteField, WallField};
use crate::lang::limits::{MAXSECTORS, MAXSTATUS, MAXUSERTILES};
use crate::runtime::runtime_error::VmError;
use crate::runtime::world::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    value: i32,
    handle: Option<(ObjectKind, u32)>,
}

#[derive(Debug, Clone)]
enum Walk {
    Objects { entries: Vec<Entry>, pos: usize },
    /// Half-open `next..end`.
    Numbers { next: i64, end: i64 },
}

#[derive(Debug, Clone)]
pub struct Cursor(Walk);

impl Cursor {
    pub fn snapshot(
        store: &dyn ObjectStore,
        kind: IterKind,
        args: &[i32],
    ) -> Result<Cursor, VmError> {
        let arg = |i: usize| args.get(i).copied().unwrap_or(0);
        let entries = match kind {
            IterKind::AllSprites => live(store, ObjectKind::Sprite, |_| true),
            IterKind::AllSectors => live(store, ObjectKind::Sector, |_| true),
            IterKind::AllWalls => live(store, ObjectKind::Wall, |_| true),
            IterKind::SpritesOfSector => {
                let sector = arg(0);
                check_bound("sector", sector, MAXSECTORS)?;
                live(store, ObjectKind::Sprite, |id| {
                    sprite_field(store, id, SpriteField::SectNum) == Some(sector)
                })
            }
            IterKind::SpritesOfStatus => {
                let status = arg(0);
                check_bound("status", status, MAXSTATUS)?;
                live(store, ObjectKind::Sprite, |id| {
                    sprite_field(store, id, SpriteField::StatNum) == Some(status)
                })
            }
            IterKind::WallsOfSector => walls_of_sector(store, arg(0))?,
            IterKind::LoopOfWall => loop_of_wall(store, arg(0))?,
            IterKind::Range => return Ok(Cursor::numbers(0, i64::from(arg(0)))),
            IterKind::TileRange => {
                let (a, b) = (arg(0), arg(1));
                let (lo, hi) = if a > b { (b, a) } else { (a, b) };
                check_bound("tile", lo, MAXUSERTILES)?;
                check_bound("tile", hi, MAXUSERTILES)?;
                return Ok(Cursor::numbers(i64::from(lo), i64::from(hi) + 1));
            }
        };
        Ok(Cursor(Walk::Objects { entries, pos: 0 }))
    }

    fn numbers(next: i64, end: i64) -> Cursor {
        Cursor(Walk::Numbers {
            next,
            end: end.max(next),
        })
    }

    /// Next entry whose object is still the one snapshotted.
    pub fn next(&mut self, store: &dyn ObjectStore) -> Option<i32> {
        match &mut self.0 {
            Walk::Numbers { next, end } => {
                if *next >= *end {
                    return None;
                }
                let value = *next;
                *next += 1;
                i32::try_from(value).ok()
            }
            Walk::Objects { entries, pos } => {
                while let Some(entry) = entries.get(*pos).copied() {
                    *pos += 1;
                    match entry.handle {
                        Some((kind, generation)) => {
                            if store.generation(kind, entry.value) == Some(generation) {
                                return Some(entry.value);
                            }
                        }
                        None => return Some(entry.value),
                    }
                }
                None
            }
        }
    }

    pub fn remaining(&self) -> usize {
        match &self.0 {
            Walk::Numbers { next, end } => usize::try_from(end - next).unwrap_or(0),
            Walk::Objects { entries, pos } => entries.len().saturating_sub(*pos),
        }
    }
}

fn handle(store: &dyn ObjectStore, kind: ObjectKind, id: i32) -> Option<Entry> {
    store.generation(kind, id).map(|generation| Entry {
        value: id,
        handle: Some((kind, generation)),
    })
}

fn live(store: &dyn ObjectStore, kind: ObjectKind, keep: impl Fn(i32) -> bool) -> Vec<Entry> {
    (0..store.object_count(kind))
        .filter_map(|id| handle(store, kind, id))
        .filter(|e| keep(e.value))
        .collect()
}

fn sprite_field(store: &dyn ObjectStore, id: i32, field: SpriteField) -> Option<i32> {
    store
        .get_field(ObjectKind::Sprite, id, Field::Sprite(field))
        .ok()
}

fn check_bound(what: &str, value: i32, limit: i32) -> Result<(), VmError> {
    if !(0..limit).contains(&value) {
        return Err(VmError::range(format!("{} {} out of range", what, value)));
    }
    Ok(())
}

fn walls_of_sector(store: &dyn ObjectStore, sector: i32) -> Result<Vec<Entry>, VmError> {
    let get = |f| store.get_field(ObjectKind::Sector, sector, Field::Sector(f));
    let start = get(SectorField::WallPtr)?;
    let count = get(SectorField::WallNum)?;
    Ok((start..start.saturating_add(count))
        .filter_map(|id| handle(store, ObjectKind::Wall, id))
        .collect())
}

fn loop_of_wall(store: &dyn ObjectStore, wall: i32) -> Result<Vec<Entry>, VmError> {
    let point2 = |id| store.get_field(ObjectKind::Wall, id, Field::Wall(WallField::Point2));
    let mut entries = Vec::new();
    let mut current = wall;
    // a malformed loop never closes; stop after visiting every wall once
    for _ in 0..store.object_count(ObjectKind::Wall) {
        let next = point2(current)?;
        entries.extend(handle(store, ObjectKind::Wall, current));
        if next == wall {
            break;
        }
        current = next;
    }
    Ok(entries)
}
