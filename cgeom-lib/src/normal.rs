//! Unit normal quantization.
//!
//! A normal is folded into the all-positive octant (3 sign bits) and then into
//! the sextant where `|x| >= |z| >= |y|` (3 swap bits). What is left lies on a
//! small triangular patch of the sphere, sampled by a `(u, v)` grid of
//! `2^bits` steps per side: `v` walks the y angle from 0 to `asin(1/sqrt 3)`,
//! `u` walks from the `x == z` edge (`u == 0`) to the `y == z` edge
//! (`u + v == 2^bits`). The corner `(2^bits, 0)` is the x axis and `(0, 2^bits)`
//! the `(1, 1, 1)` diagonal.

use crate::common::NORMAL_QUANT_MAX;
use crate::error::CgError;
use once_cell::sync::Lazy;
use std::f64::consts::FRAC_PI_4;

/// Grid width of the finest normal quantization level.
pub(crate) const MAX_UV_ENTRIES: i32 = 64;

/// `asin(1 / sqrt(3))`, the y angle of the diagonal normal.
const NORMAL_MAX_Y_ANG: f64 = 0.615_479_708_670_387_3;

const FIXED_14: f64 = 16384.0;
const INVERSE_SINE_SHIFT: u32 = 4;
const INVERSE_SINE_ENTRIES: usize = (16384 >> INVERSE_SINE_SHIFT) + 1;

/// Folded axis order per sextant code: folded component `k` is original axis `SEXTANT_AXES[s][k]`.
const SEXTANT_AXES: [[usize; 3]; 6] = [
    [0, 1, 2],
    [1, 0, 2],
    [0, 2, 1],
    [1, 2, 0],
    [2, 1, 0],
    [2, 0, 1],
];

struct NormalGrid {
    width: usize,
    normals: Vec<[f64; 3]>,
    inverse_sine: Vec<usize>,
}

impl NormalGrid {
    fn new(bits: u32) -> Self {
        let width = 1_usize << bits;
        let mut normals = vec![[0.0; 3]; (width + 1) * (width + 1)];
        for v in 0..=width {
            for u in 0..=(width - v) {
                normals[v * (width + 1) + u] = grid_normal(u, v, width);
            }
        }

        let inverse_sine = (0..INVERSE_SINE_ENTRIES)
            .map(|i| {
                let sine = ((i << INVERSE_SINE_SHIFT) as f64 / FIXED_14).min(1.0);
                let row = sine.asin() / NORMAL_MAX_Y_ANG * width as f64;
                (row as usize).min(width)
            })
            .collect();

        NormalGrid {
            width,
            normals,
            inverse_sine,
        }
    }

    #[inline]
    fn normal(&self, u: usize, v: usize) -> [f64; 3] {
        self.normals[v * (self.width + 1) + u]
    }

    /// Closest grid point to a folded normal, searching only the row its y
    /// component maps to and the row above.
    fn nearest(&self, folded: [f64; 3]) -> (usize, usize) {
        let iy = (folded[1] * FIXED_14) as usize;
        let row = self.inverse_sine[(iy >> INVERSE_SINE_SHIFT).min(INVERSE_SINE_ENTRIES - 1)];

        let mut best = (0, row);
        let mut best_dot = f64::NEG_INFINITY;
        for v in row..=(row + 1).min(self.width) {
            for u in 0..=(self.width - v) {
                let g = self.normal(u, v);
                let dot = g[0] * folded[0] + g[1] * folded[1] + g[2] * folded[2];
                if dot > best_dot {
                    best_dot = dot;
                    best = (u, v);
                }
            }
        }
        best
    }
}

/// Grid point `(u, v)` of a `width`-step patch, rounded through s1.14 fixed point.
fn grid_normal(u: usize, v: usize, width: usize) -> [f64; 3] {
    let psi = NORMAL_MAX_Y_ANG * v as f64 / width as f64;
    let theta = if v == width {
        FRAC_PI_4
    } else {
        let edge = psi.tan().min(1.0).asin();
        FRAC_PI_4 - (FRAC_PI_4 - edge) * u as f64 / (width - v) as f64
    };
    let normal = [
        theta.cos() * psi.cos(),
        psi.sin(),
        theta.sin() * psi.cos(),
    ];
    normal.map(|c| f64::from((c * FIXED_14) as i32) / FIXED_14)
}

static NORMAL_GRIDS: Lazy<Vec<NormalGrid>> =
    Lazy::new(|| (0..=NORMAL_QUANT_MAX).map(NormalGrid::new).collect());

/// Octant bit recording the sign of original axis `axis` (x = 4, y = 2, z = 1).
#[inline]
const fn octant_bit(axis: usize) -> u32 {
    4 >> axis
}

fn sextant_with_axes(axes: [usize; 3]) -> u32 {
    SEXTANT_AXES
        .iter()
        .position(|a| *a == axes)
        .map_or(0, |s| s as u32)
}

/// Sextant reached by crossing the folded `x == z` edge.
fn flip_xz(sextant: u32) -> u32 {
    let mut axes = SEXTANT_AXES[sextant as usize];
    axes.swap(0, 2);
    sextant_with_axes(axes)
}

/// Sextant reached by crossing the folded `y == z` edge.
fn flip_yz(sextant: u32) -> u32 {
    let mut axes = SEXTANT_AXES[sextant as usize];
    axes.swap(1, 2);
    sextant_with_axes(axes)
}

/// A normal as transmitted: sextant, octant and grid indices at some level.
///
/// Special normals carry their 6-bit code in `sextant` (6 or 7) and `octant`
/// and have `u == v == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantizedNormal {
    pub sextant: u32,
    pub octant: u32,
    pub u: i32,
    pub v: i32,
}

impl QuantizedNormal {
    pub fn is_special(&self) -> bool {
        self.sextant > 5
    }

    /// Rescales grid indices of level `bits` to the finest grid.
    pub fn to_finest(self, bits: u32) -> Self {
        let scale = NORMAL_QUANT_MAX - bits.min(NORMAL_QUANT_MAX);
        QuantizedNormal {
            u: self.u << scale,
            v: self.v << scale,
            ..self
        }
    }
}

/// Maps a normal to the nearest grid point at `bits` (0..=6) of resolution.
///
/// Zero-length or non-finite input encodes as the +x axis.
pub fn quantize_normal(normal: [f32; 3], bits: u32) -> QuantizedNormal {
    let bits = bits.min(NORMAL_QUANT_MAX);
    let mut n = normal.map(f64::from);
    let length = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
    if length > 0.0 && length.is_finite() {
        n = n.map(|c| c / length);
    } else {
        n = [1.0, 0.0, 0.0];
    }

    let mut octant = 0;
    if n[0] < 0.0 {
        octant |= 4;
    }
    if n[1] < 0.0 {
        octant |= 2;
    }
    if n[2] < 0.0 {
        octant |= 1;
    }
    let mut folded = n.map(f64::abs);

    let mut sextant = 0;
    if folded[0] < folded[1] {
        folded.swap(0, 1);
        sextant |= 1;
    }
    if folded[2] < folded[1] {
        folded.swap(1, 2);
        sextant |= 2;
    }
    if folded[0] < folded[2] {
        folded.swap(0, 2);
        sextant |= 4;
    }

    let grid = &NORMAL_GRIDS[bits as usize];
    let (u, v) = grid.nearest(folded);
    let (u, v) = (u as i32, v as i32);

    // The special corners compare against the finest grid width, so they are
    // only ever detected at the finest level.
    if u == MAX_UV_ENTRIES && v == 0 {
        let axis = SEXTANT_AXES[sextant as usize][0];
        let sign = u32::from(octant & octant_bit(axis) != 0);
        return QuantizedNormal {
            sextant: 6 | (axis as u32 >> 1),
            octant: ((axis as u32 & 1) << 2) | (sign << 1),
            u: 0,
            v: 0,
        };
    }
    if u == 0 && v == MAX_UV_ENTRIES {
        return QuantizedNormal {
            sextant: 6 | (octant >> 2),
            octant: ((octant & 3) << 1) | 1,
            u: 0,
            v: 0,
        };
    }

    QuantizedNormal {
        sextant,
        octant,
        u,
        v,
    }
}

/// Reconstructs the unit vector a quantized normal stands for.
///
/// Fails when the codes or grid indices do not name a point of the level
/// `bits` grid.
pub fn dequantize_normal(q: &QuantizedNormal, bits: u32) -> Result<[f32; 3], CgError> {
    let bits = bits.min(NORMAL_QUANT_MAX);
    if q.sextant > 7 || q.octant > 7 {
        return Err(CgError::Decode(format!(
            "Normal codes ({}, {}) do not fit in three bits",
            q.sextant, q.octant
        )));
    }
    let mut out;
    let octant;

    if q.is_special() {
        if q.octant & 1 == 0 {
            let axis = (((q.sextant & 1) << 1) | ((q.octant & 4) >> 2)) as usize;
            if axis > 2 {
                return Err(CgError::Decode(format!(
                    "Special normal code ({}, {}) names no axis",
                    q.sextant, q.octant
                )));
            }
            out = [0.0; 3];
            out[axis] = 1.0;
            let sign = (q.octant & 2) >> 1;
            octant = (sign << 2) | (sign << 1) | sign;
        } else {
            out = [1.0 / 3.0_f64.sqrt(); 3];
            octant = ((q.sextant & 1) << 2) | (q.octant >> 1);
        }
    } else {
        let grid = &NORMAL_GRIDS[bits as usize];
        if q.u < 0 || q.v < 0 || (q.u + q.v) as usize > grid.width {
            return Err(CgError::Decode(format!(
                "Normal grid index ({}, {}) is off the {}-bit grid",
                q.u, q.v, bits
            )));
        }
        let folded = grid.normal(q.u as usize, q.v as usize);
        let axes = SEXTANT_AXES[q.sextant as usize];
        out = [0.0; 3];
        for k in 0..3 {
            out[axes[k]] = folded[k];
        }
        octant = q.octant;
    }

    if octant & 4 != 0 {
        out[0] = -out[0];
    }
    if octant & 2 != 0 {
        out[1] = -out[1];
    }
    if octant & 1 != 0 {
        out[2] = -out[2];
    }
    Ok(out.map(|c| c as f32))
}

/// Grid delta from `previous` to `current`, if the pair is delta-codable.
///
/// Besides pairs in the same octant and sextant, three edge crossings are
/// representable: leaving `v` negative flips the sign of the folded y axis,
/// leaving `u` negative crosses the `x == z` edge, and overshooting
/// `u + v == width` crosses the `y == z` edge (mirrored as `(width - v, width - u)`).
/// A crossing is only used when the target is strictly off the edge so the
/// decoder sees it unambiguously.
pub(crate) fn normal_delta(
    previous: &QuantizedNormal,
    current: &QuantizedNormal,
    width: i32,
) -> Option<(i32, i32)> {
    if previous.is_special() || current.is_special() {
        return None;
    }
    let same_sextant = previous.sextant == current.sextant;
    let same_octant = previous.octant == current.octant;

    if same_sextant && same_octant {
        return Some((current.u - previous.u, current.v - previous.v));
    }

    let y_axis = SEXTANT_AXES[previous.sextant as usize][1];
    if same_sextant && current.octant == previous.octant ^ octant_bit(y_axis) && current.v > 0 {
        return Some((current.u - previous.u, -current.v - previous.v));
    }
    if same_octant && current.sextant == flip_xz(previous.sextant) && current.u > 0 {
        return Some((-current.u - previous.u, current.v - previous.v));
    }
    if same_octant
        && current.sextant == flip_yz(previous.sextant)
        && current.u + current.v < width
    {
        return Some((
            width - current.v - previous.u,
            width - current.u - previous.v,
        ));
    }
    None
}

/// Inverse of [`normal_delta`].
pub(crate) fn apply_normal_delta(
    previous: &QuantizedNormal,
    du: i32,
    dv: i32,
    width: i32,
) -> Result<QuantizedNormal, CgError> {
    if previous.is_special() {
        return Err(CgError::Decode(
            "Relative normal follows a special normal".to_string(),
        ));
    }
    let mut next = QuantizedNormal {
        u: previous.u + du,
        v: previous.v + dv,
        ..*previous
    };

    if next.v < 0 {
        next.v = -next.v;
        next.octant ^= octant_bit(SEXTANT_AXES[previous.sextant as usize][1]);
    } else if next.u < 0 {
        next.u = -next.u;
        next.sextant = flip_xz(previous.sextant);
    } else if next.u + next.v > width {
        let (u, v) = (width - next.v, width - next.u);
        next.u = u;
        next.v = v;
        next.sextant = flip_yz(previous.sextant);
    }

    if next.u < 0 || next.v < 0 || next.u + next.v > width {
        return Err(CgError::Decode(format!(
            "Relative normal lands off the grid at ({}, {})",
            next.u, next.v
        )));
    }
    Ok(next)
}
