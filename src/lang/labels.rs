//! Member labels: the named, range-validated fields scripts can read and
//! write on sectors, walls and sprites.

use serde::{Deserialize, Serialize};

use super::limits::{MAXSECTORS, MAXSPRITES, MAXSTATUS, MAXTILES, MAXWALLS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Sector,
    Wall,
    Sprite,
}

impl ObjectKind {
    /// Static upper bound on ids of this kind.
    pub fn limit(self) -> i32 {
        match self {
            ObjectKind::Sector => MAXSECTORS,
            ObjectKind::Wall => MAXWALLS,
            ObjectKind::Sprite => MAXSPRITES,
        }
    }

    pub fn labels(self) -> &'static [MemberLabel] {
        match self {
            ObjectKind::Sector => SECTOR_LABELS,
            ObjectKind::Wall => WALL_LABELS,
            ObjectKind::Sprite => SPRITE_LABELS,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Sector => write!(f, "sector"),
            ObjectKind::Wall => write!(f, "wall"),
            ObjectKind::Sprite => write!(f, "sprite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorField {
    WallPtr,
    WallNum,
    CeilingZ,
    FloorZ,
    CeilingStat,
    FloorStat,
    CeilingPicnum,
    CeilingSlope,
    CeilingShade,
    CeilingPal,
    CeilingXPanning,
    CeilingYPanning,
    FloorPicnum,
    FloorSlope,
    FloorShade,
    FloorPal,
    FloorXPanning,
    FloorYPanning,
    Visibility,
    AlignTo,
    LoTag,
    HiTag,
    Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WallField {
    X,
    Y,
    Point2,
    NextWall,
    NextSector,
    Cstat,
    Picnum,
    OverPicnum,
    Shade,
    Pal,
    XRepeat,
    YRepeat,
    XPanning,
    YPanning,
    LoTag,
    HiTag,
    Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpriteField {
    X,
    Y,
    Z,
    Cstat,
    Picnum,
    Shade,
    Pal,
    ClipDist,
    Detail,
    XRepeat,
    YRepeat,
    XOffset,
    YOffset,
    SectNum,
    StatNum,
    Ang,
    Owner,
    XVel,
    YVel,
    ZVel,
    LoTag,
    HiTag,
    Extra,
}

/// A field of one object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Sector(SectorField),
    Wall(WallField),
    Sprite(SpriteField),
}

impl Field {
    pub fn kind(self) -> ObjectKind {
        match self {
            Field::Sector(_) => ObjectKind::Sector,
            Field::Wall(_) => ObjectKind::Wall,
            Field::Sprite(_) => ObjectKind::Sprite,
        }
    }

    /// The static label describing this field.
    pub fn label(self) -> &'static MemberLabel {
        // every Field variant has exactly one entry in its kind's table
        self.kind()
            .labels()
            .iter()
            .find(|l| l.field == self)
            .unwrap_or(&UNKNOWN_LABEL)
    }
}

/// What an out-of-range write does to the stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    /// Store the value clamped into `min..=max`.
    Clamp,
    /// Leave the stored value untouched.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberLabel {
    pub name: &'static str,
    pub field: Field,
    pub readonly: bool,
    pub min: i32,
    pub max: i32,
    pub policy: WritePolicy,
}

impl MemberLabel {
    pub fn contains(&self, value: i32) -> bool {
        value >= self.min && value <= self.max
    }

    /// Applies the write policy. `Ok` when the value is in range, otherwise
    /// `Err` with the value to store instead (if any).
    pub fn validate(&self, value: i32) -> Result<i32, Option<i32>> {
        if self.contains(value) {
            return Ok(value);
        }
        match self.policy {
            WritePolicy::Clamp => Err(Some(value.clamp(self.min, self.max))),
            WritePolicy::Reject => Err(None),
        }
    }
}

/// Looks up a field by its script name.
pub fn find_label(kind: ObjectKind, name: &str) -> Option<&'static MemberLabel> {
    kind.labels()
        .iter()
        .find(|l| l.name.eq_ignore_ascii_case(name))
}

const I16_MIN: i32 = i16::MIN as i32;
const I16_MAX: i32 = i16::MAX as i32;

const fn rw(name: &'static str, field: Field, min: i32, max: i32) -> MemberLabel {
    MemberLabel {
        name,
        field,
        readonly: false,
        min,
        max,
        policy: WritePolicy::Clamp,
    }
}

const fn strict(name: &'static str, field: Field, min: i32, max: i32) -> MemberLabel {
    MemberLabel {
        name,
        field,
        readonly: false,
        min,
        max,
        policy: WritePolicy::Reject,
    }
}

const fn ro(name: &'static str, field: Field, min: i32, max: i32) -> MemberLabel {
    MemberLabel {
        name,
        field,
        readonly: true,
        min,
        max,
        policy: WritePolicy::Reject,
    }
}

static UNKNOWN_LABEL: MemberLabel = ro("?", Field::Sprite(SpriteField::Extra), 0, 0);

use SectorField as S;
use SpriteField as P;
use WallField as W;

pub const SECTOR_LABELS: &[MemberLabel] = &[
    ro("wallptr", Field::Sector(S::WallPtr), 0, MAXWALLS - 1),
    ro("wallnum", Field::Sector(S::WallNum), 0, MAXWALLS),
    rw("ceilingz", Field::Sector(S::CeilingZ), i32::MIN, i32::MAX),
    rw("floorz", Field::Sector(S::FloorZ), i32::MIN, i32::MAX),
    rw("ceilingstat", Field::Sector(S::CeilingStat), 0, 65535),
    rw("floorstat", Field::Sector(S::FloorStat), 0, 65535),
    strict("ceilingpicnum", Field::Sector(S::CeilingPicnum), 0, MAXTILES - 1),
    rw("ceilingslope", Field::Sector(S::CeilingSlope), I16_MIN, I16_MAX),
    rw("ceilingshade", Field::Sector(S::CeilingShade), -128, 127),
    rw("ceilingpal", Field::Sector(S::CeilingPal), 0, 255),
    rw("ceilingxpanning", Field::Sector(S::CeilingXPanning), 0, 255),
    rw("ceilingypanning", Field::Sector(S::CeilingYPanning), 0, 255),
    strict("floorpicnum", Field::Sector(S::FloorPicnum), 0, MAXTILES - 1),
    rw("floorslope", Field::Sector(S::FloorSlope), I16_MIN, I16_MAX),
    rw("floorshade", Field::Sector(S::FloorShade), -128, 127),
    rw("floorpal", Field::Sector(S::FloorPal), 0, 255),
    rw("floorxpanning", Field::Sector(S::FloorXPanning), 0, 255),
    rw("floorypanning", Field::Sector(S::FloorYPanning), 0, 255),
    rw("visibility", Field::Sector(S::Visibility), 0, 255),
    rw("alignto", Field::Sector(S::AlignTo), 0, 255),
    rw("lotag", Field::Sector(S::LoTag), I16_MIN, I16_MAX),
    rw("hitag", Field::Sector(S::HiTag), I16_MIN, I16_MAX),
    rw("extra", Field::Sector(S::Extra), I16_MIN, I16_MAX),
];

pub const WALL_LABELS: &[MemberLabel] = &[
    rw("x", Field::Wall(W::X), i32::MIN, i32::MAX),
    rw("y", Field::Wall(W::Y), i32::MIN, i32::MAX),
    ro("point2", Field::Wall(W::Point2), 0, MAXWALLS - 1),
    ro("nextwall", Field::Wall(W::NextWall), -1, MAXWALLS - 1),
    ro("nextsector", Field::Wall(W::NextSector), -1, MAXSECTORS - 1),
    rw("cstat", Field::Wall(W::Cstat), 0, 65535),
    strict("picnum", Field::Wall(W::Picnum), 0, MAXTILES - 1),
    strict("overpicnum", Field::Wall(W::OverPicnum), 0, MAXTILES - 1),
    rw("shade", Field::Wall(W::Shade), -128, 127),
    rw("pal", Field::Wall(W::Pal), 0, 255),
    rw("xrepeat", Field::Wall(W::XRepeat), 0, 255),
    rw("yrepeat", Field::Wall(W::YRepeat), 0, 255),
    rw("xpanning", Field::Wall(W::XPanning), 0, 255),
    rw("ypanning", Field::Wall(W::YPanning), 0, 255),
    rw("lotag", Field::Wall(W::LoTag), I16_MIN, I16_MAX),
    rw("hitag", Field::Wall(W::HiTag), I16_MIN, I16_MAX),
    rw("extra", Field::Wall(W::Extra), I16_MIN, I16_MAX),
];

pub const SPRITE_LABELS: &[MemberLabel] = &[
    rw("x", Field::Sprite(P::X), i32::MIN, i32::MAX),
    rw("y", Field::Sprite(P::Y), i32::MIN, i32::MAX),
    rw("z", Field::Sprite(P::Z), i32::MIN, i32::MAX),
    rw("cstat", Field::Sprite(P::Cstat), 0, 65535),
    strict("picnum", Field::Sprite(P::Picnum), 0, MAXTILES - 1),
    rw("shade", Field::Sprite(P::Shade), -128, 127),
    rw("pal", Field::Sprite(P::Pal), 0, 255),
    rw("clipdist", Field::Sprite(P::ClipDist), 0, 255),
    rw("detail", Field::Sprite(P::Detail), 0, 255),
    rw("xrepeat", Field::Sprite(P::XRepeat), 0, 255),
    rw("yrepeat", Field::Sprite(P::YRepeat), 0, 255),
    rw("xoffset", Field::Sprite(P::XOffset), -128, 127),
    rw("yoffset", Field::Sprite(P::YOffset), -128, 127),
    ro("sectnum", Field::Sprite(P::SectNum), 0, MAXSECTORS - 1),
    ro("statnum", Field::Sprite(P::StatNum), 0, MAXSTATUS - 1),
    rw("ang", Field::Sprite(P::Ang), 0, 2047),
    strict("owner", Field::Sprite(P::Owner), -1, MAXSPRITES - 1),
    rw("xvel", Field::Sprite(P::XVel), I16_MIN, I16_MAX),
    rw("yvel", Field::Sprite(P::YVel), I16_MIN, I16_MAX),
    rw("zvel", Field::Sprite(P::ZVel), I16_MIN, I16_MAX),
    rw("lotag", Field::Sprite(P::LoTag), I16_MIN, I16_MAX),
    rw("hitag", Field::Sprite(P::HiTag), I16_MIN, I16_MAX),
    rw("extra", Field::Sprite(P::Extra), I16_MIN, I16_MAX),
];
