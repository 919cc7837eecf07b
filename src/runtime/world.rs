//! The object accessor surface scripts run against, and an in-memory
//! implementation with a generational sprite arena.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lang::labels::{Field, ObjectKind, SectorField, SpriteField, WallField};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("{kind} {id} out of range")]
    OutOfRange { kind: ObjectKind, id: i32 },
    #[error("{kind} {id} does not exist")]
    Dead { kind: ObjectKind, id: i32 },
    #[error("cannot {op} {kind} objects")]
    Unsupported { kind: ObjectKind, op: &'static str },
    #[error("no free {0} slots")]
    Full(ObjectKind),
}

/// Host-side object storage. Every call re-validates the id.
pub trait ObjectStore {
    /// Upper bound (exclusive) on ids of this kind.
    fn object_count(&self, kind: ObjectKind) -> i32;

    /// Generation of a live object; `None` when the id is free or out of range.
    fn generation(&self, kind: ObjectKind, id: i32) -> Option<u32>;

    fn get_field(&self, kind: ObjectKind, id: i32, field: Field) -> Result<i32, AccessError>;

    fn set_field(
        &mut self,
        kind: ObjectKind,
        id: i32,
        field: Field,
        value: i32,
    ) -> Result<(), AccessError>;

    fn insert_object(&mut self, kind: ObjectKind, template: &[(Field, i32)])
    -> Result<i32, AccessError>;

    fn delete_object(&mut self, kind: ObjectKind, id: i32) -> Result<(), AccessError>;
}

/// Generates `get`/`set` over a struct whose members map 1:1 onto a field enum.
macro_rules! field_slots {
    ($ty:ident, $field:ident { $($variant:ident => $member:ident,)* }) => {
        impl $ty {
            pub fn get(&self, f: $field) -> i32 {
                match f {
                    $($field::$variant => self.$member,)*
                }
            }

            pub fn set(&mut self, f: $field, value: i32) {
                match f {
                    $($field::$variant => self.$member = value,)*
                }
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sector {
    pub wallptr: i32,
    pub wallnum: i32,
    pub ceilingz: i32,
    pub floorz: i32,
    pub ceilingstat: i32,
    pub floorstat: i32,
    pub ceilingpicnum: i32,
    pub ceilingslope: i32,
    pub ceilingshade: i32,
    pub ceilingpal: i32,
    pub ceilingxpanning: i32,
    pub ceilingypanning: i32,
    pub floorpicnum: i32,
    pub floorslope: i32,
    pub floorshade: i32,
    pub floorpal: i32,
    pub floorxpanning: i32,
    pub floorypanning: i32,
    pub visibility: i32,
    pub alignto: i32,
    pub lotag: i32,
    pub hitag: i32,
    pub extra: i32,
}

field_slots!(Sector, SectorField {
    WallPtr => wallptr,
    WallNum => wallnum,
    CeilingZ => ceilingz,
    FloorZ => floorz,
    CeilingStat => ceilingstat,
    FloorStat => floorstat,
    CeilingPicnum => ceilingpicnum,
    CeilingSlope => ceilingslope,
    CeilingShade => ceilingshade,
    CeilingPal => ceilingpal,
    CeilingXPanning => ceilingxpanning,
    CeilingYPanning => ceilingypanning,
    FloorPicnum => floorpicnum,
    FloorSlope => floorslope,
    FloorShade => floorshade,
    FloorPal => floorpal,
    FloorXPanning => floorxpanning,
    FloorYPanning => floorypanning,
    Visibility => visibility,
    AlignTo => alignto,
    LoTag => lotag,
    HiTag => hitag,
    Extra => extra,
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Wall {
    pub x: i32,
    pub y: i32,
    pub point2: i32,
    pub nextwall: i32,
    pub nextsector: i32,
    pub cstat: i32,
    pub picnum: i32,
    pub overpicnum: i32,
    pub shade: i32,
    pub pal: i32,
    pub xrepeat: i32,
    pub yrepeat: i32,
    pub xpanning: i32,
    pub ypanning: i32,
    pub lotag: i32,
    pub hitag: i32,
    pub extra: i32,
}

field_slots!(Wall, WallField {
    X => x,
    Y => y,
    Point2 => point2,
    NextWall => nextwall,
    NextSector => nextsector,
    Cstat => cstat,
    Picnum => picnum,
    OverPicnum => overpicnum,
    Shade => shade,
    Pal => pal,
    XRepeat => xrepeat,
    YRepeat => yrepeat,
    XPanning => xpanning,
    YPanning => ypanning,
    LoTag => lotag,
    HiTag => hitag,
    Extra => extra,
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sprite {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub cstat: i32,
    pub picnum: i32,
    pub shade: i32,
    pub pal: i32,
    pub clipdist: i32,
    pub detail: i32,
    pub xrepeat: i32,
    pub yrepeat: i32,
    pub xoffset: i32,
    pub yoffset: i32,
    pub sectnum: i32,
    pub statnum: i32,
    pub ang: i32,
    pub owner: i32,
    pub xvel: i32,
    pub yvel: i32,
    pub zvel: i32,
    pub lotag: i32,
    pub hitag: i32,
    pub extra: i32,
}

field_slots!(Sprite, SpriteField {
    X => x,
    Y => y,
    Z => z,
    Cstat => cstat,
    Picnum => picnum,
    Shade => shade,
    Pal => pal,
    ClipDist => clipdist,
    Detail => detail,
    XRepeat => xrepeat,
    YRepeat => yrepeat,
    XOffset => xoffset,
    YOffset => yoffset,
    SectNum => sectnum,
    StatNum => statnum,
    Ang => ang,
    Owner => owner,
    XVel => xvel,
    YVel => yvel,
    ZVel => zvel,
    LoTag => lotag,
    HiTag => hitag,
    Extra => extra,
});

#[derive(Debug, Clone, Default)]
struct SpriteSlot {
    generation: u32,
    sprite: Option<Sprite>,
}

/// On-disk shape of a world: `null` sprite entries are free slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldData {
    pub sectors: Vec<Sector>,
    pub walls: Vec<Wall>,
    pub sprites: Vec<Option<Sprite>>,
}

/// In-memory map. Sectors and walls are fixed; sprites live in a
/// generational arena whose freed slots are reused, lowest id first.
#[derive(Debug, Clone, Default)]
pub struct World {
    sectors: Vec<Sector>,
    walls: Vec<Wall>,
    sprites: Vec<SpriteSlot>,
    free: BinaryHeap<Reverse<usize>>,
    sprite_limit: usize,
}

impl World {
    pub fn new() -> Self {
        Self::from_data(WorldData::default())
    }

    pub fn from_data(data: WorldData) -> Self {
        let mut free = BinaryHeap::new();
        let sprites = data
            .sprites
            .into_iter()
            .enumerate()
            .map(|(i, sprite)| {
                if sprite.is_none() {
                    free.push(Reverse(i));
                }
                SpriteSlot {
                    generation: 0,
                    sprite,
                }
            })
            .collect();
        World {
            sectors: data.sectors,
            walls: data.walls,
            sprites,
            free,
            sprite_limit: ObjectKind::Sprite.limit() as usize,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<WorldData>(text).map(Self::from_data)
    }

    pub fn to_data(&self) -> WorldData {
        WorldData {
            sectors: self.sectors.clone(),
            walls: self.walls.clone(),
            sprites: self.sprites.iter().map(|s| s.sprite.clone()).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_data())
    }

    /// Caps the sprite arena below the engine limit.
    pub fn with_sprite_limit(mut self, limit: usize) -> Self {
        self.sprite_limit = limit;
        self
    }

    pub fn add_sector(&mut self, sector: Sector) -> i32 {
        self.sectors.push(sector);
        self.sectors.len() as i32 - 1
    }

    pub fn add_wall(&mut self, wall: Wall) -> i32 {
        self.walls.push(wall);
        self.walls.len() as i32 - 1
    }

    pub fn spawn(&mut self, sprite: Sprite) -> Result<i32, AccessError> {
        let id = match self.free.pop() {
            Some(Reverse(id)) => id,
            None => {
                if self.sprites.len() >= self.sprite_limit {
                    return Err(AccessError::Full(ObjectKind::Sprite));
                }
                self.sprites.push(SpriteSlot::default());
                self.sprites.len() - 1
            }
        };
        self.sprites[id].sprite = Some(sprite);
        Ok(id as i32)
    }

    pub fn sector(&self, id: i32) -> Option<&Sector> {
        usize::try_from(id).ok().and_then(|i| self.sectors.get(i))
    }

    pub fn wall(&self, id: i32) -> Option<&Wall> {
        usize::try_from(id).ok().and_then(|i| self.walls.get(i))
    }

    pub fn sprite(&self, id: i32) -> Option<&Sprite> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.sprites.get(i))
            .and_then(|s| s.sprite.as_ref())
    }

    /// Ids of live sprites, ascending.
    pub fn live_sprites(&self) -> Vec<i32> {
        self.sprites
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sprite.is_some())
            .map(|(i, _)| i as i32)
            .collect()
    }

    fn index(&self, kind: ObjectKind, id: i32) -> Result<usize, AccessError> {
        let len = self.object_count(kind) as usize;
        match usize::try_from(id) {
            Ok(i) if i < len => Ok(i),
            _ => Err(AccessError::OutOfRange { kind, id }),
        }
    }

    fn live_sprite_mut(&mut self, id: i32) -> Result<&mut Sprite, AccessError> {
        let i = self.index(ObjectKind::Sprite, id)?;
        self.sprites[i].sprite.as_mut().ok_or(AccessError::Dead {
            kind: ObjectKind::Sprite,
            id,
        })
    }
}

impl ObjectStore for World {
    fn object_count(&self, kind: ObjectKind) -> i32 {
        match kind {
            ObjectKind::Sector => self.sectors.len() as i32,
            ObjectKind::Wall => self.walls.len() as i32,
            ObjectKind::Sprite => self.sprites.len() as i32,
        }
    }

    fn generation(&self, kind: ObjectKind, id: i32) -> Option<u32> {
        let i = self.index(kind, id).ok()?;
        match kind {
            ObjectKind::Sector | ObjectKind::Wall => Some(0),
            ObjectKind::Sprite => {
                let slot = &self.sprites[i];
                slot.sprite.as_ref().map(|_| slot.generation)
            }
        }
    }

    fn get_field(&self, kind: ObjectKind, id: i32, field: Field) -> Result<i32, AccessError> {
        let i = self.index(kind, id)?;
        match field {
            Field::Sector(f) if kind == ObjectKind::Sector => Ok(self.sectors[i].get(f)),
            Field::Wall(f) if kind == ObjectKind::Wall => Ok(self.walls[i].get(f)),
            Field::Sprite(f) if kind == ObjectKind::Sprite => self.sprites[i]
                .sprite
                .as_ref()
                .map(|s| s.get(f))
                .ok_or(AccessError::Dead { kind, id }),
            _ => Err(AccessError::Unsupported { kind, op: "read" }),
        }
    }

    fn set_field(
        &mut self,
        kind: ObjectKind,
        id: i32,
        field: Field,
        value: i32,
    ) -> Result<(), AccessError> {
        let i = self.index(kind, id)?;
        match field {
            Field::Sector(f) if kind == ObjectKind::Sector => self.sectors[i].set(f, value),
            Field::Wall(f) if kind == ObjectKind::Wall => self.walls[i].set(f, value),
            Field::Sprite(f) if kind == ObjectKind::Sprite => {
                self.live_sprite_mut(id)?.set(f, value)
            }
            _ => return Err(AccessError::Unsupported { kind, op: "write" }),
        }
        Ok(())
    }

    fn insert_object(
        &mut self,
        kind: ObjectKind,
        template: &[(Field, i32)],
    ) -> Result<i32, AccessError> {
        if kind != ObjectKind::Sprite {
            return Err(AccessError::Unsupported { kind, op: "insert" });
        }
        let mut sprite = Sprite {
            owner: -1,
            ..Sprite::default()
        };
        for (field, value) in template {
            if let Field::Sprite(f) = field {
                sprite.set(*f, *value);
            }
        }
        self.spawn(sprite)
    }

    fn delete_object(&mut self, kind: ObjectKind, id: i32) -> Result<(), AccessError> {
        if kind != ObjectKind::Sprite {
            return Err(AccessError::Unsupported { kind, op: "delete" });
        }
        let i = self.index(kind, id)?;
        let slot = &mut self.sprites[i];
        if slot.sprite.take().is_none() {
            return Err(AccessError::Dead { kind, id });
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(Reverse(i));
        Ok(())
    }
}
