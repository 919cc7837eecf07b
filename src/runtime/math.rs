//! Fixed-point engine math. Angles use 2048 units per turn.

use once_cell::sync::Lazy;

use crate::lang::limits::{ANGLE_MASK, ANGLE_UNITS};

/// `16384 * sin(a)` for every angle unit.
static SINE_TABLE: Lazy<Vec<i32>> = Lazy::new(|| {
    (0..ANGLE_UNITS)
        .map(|a| {
            let rad = a as f64 * std::f64::consts::TAU / ANGLE_UNITS as f64;
            (rad.sin() * 16384.0).round() as i32
        })
        .collect()
});

pub fn sin(angle: i32) -> i32 {
    SINE_TABLE[(angle & ANGLE_MASK) as usize]
}

pub fn cos(angle: i32) -> i32 {
    sin(angle.wrapping_add(ANGLE_UNITS / 4))
}

/// Angle of the vector `(dx, dy)` in `0..2048`.
pub fn get_angle(dx: i32, dy: i32) -> i32 {
    if dx == 0 && dy == 0 {
        return 0;
    }
    if dx == 0 {
        return if dy < 0 { 1536 } else { 512 };
    }
    if dy == 0 {
        return if dx < 0 { 1024 } else { 0 };
    }
    if dx == dy {
        return if dx < 0 { 1280 } else { 256 };
    }
    if dx == -dy {
        return if dx > 0 { 1792 } else { 768 };
    }
    let rad = (dy as f64).atan2(dx as f64);
    let units = (rad * ANGLE_UNITS as f64 / std::f64::consts::TAU).round() as i32;
    units & ANGLE_MASK
}

/// Integer square root of the value read as unsigned.
pub fn sqrt(value: i32) -> i32 {
    (value as u32).isqrt() as i32
}

pub fn mul_scale(a: i32, b: i32, shift: i32) -> i32 {
    ((a as i64 * b as i64) >> shift.clamp(0, 63)) as i32
}

/// `(a << shift) / b`; `None` when `b` is zero.
pub fn div_scale(a: i32, b: i32, shift: i32) -> Option<i32> {
    if b == 0 {
        return None;
    }
    Some((((a as i64) << shift.clamp(0, 31)) / b as i64) as i32)
}

/// 3-D distance approximation; `dz` is in the 16x finer z units.
pub fn dist(dx: i32, dy: i32, dz: i32) -> i32 {
    let mut x = (dx as i64).abs();
    let mut y = (dy as i64).abs();
    let mut z = ((dz as i64) >> 4).abs();
    if x < y {
        std::mem::swap(&mut x, &mut y);
    }
    if x < z {
        std::mem::swap(&mut x, &mut z);
    }
    let t = y + z;
    (x - (x >> 4) + (t >> 2) + (t >> 3)) as i32
}

/// 2-D distance approximation.
pub fn ldist(dx: i32, dy: i32) -> i32 {
    let mut x = (dx as i64).abs();
    let mut y = (dy as i64).abs();
    if x < y {
        std::mem::swap(&mut x, &mut y);
    }
    let t = y + (y >> 1);
    (x - (x >> 5) - (x >> 7) + (t >> 2) + (t >> 6)) as i32
}
