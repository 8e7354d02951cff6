pub const POSITION_QUANT_MIN: u32 = 1;
pub const POSITION_QUANT_MAX: u32 = 16;
pub const COLOR_QUANT_MIN: u32 = 2;
pub const COLOR_QUANT_MAX: u32 = 16;
pub const NORMAL_QUANT_MIN: u32 = 0;
pub const NORMAL_QUANT_MAX: u32 = 6;

/// Fixed-point scale for positions and colors (s.15).
pub(crate) const FIXED_SCALE: f64 = 32768.0;
pub(crate) const FIXED_MAX: i32 = 32767;

#[inline]
pub(crate) fn clamp_quant(bits: u32, min: u32, max: u32) -> u32 {
    bits.clamp(min, max)
}

/// Mask keeping the `bits` most significant bits of a 16-bit two's complement value.
#[inline]
pub(crate) const fn quantization_mask(bits: u32) -> i32 {
    (0xFFFF_0000_u32 as i32) >> bits
}

#[inline]
pub(crate) const fn length_mask(length: u32) -> u32 {
    if length >= 32 {
        u32::MAX
    } else {
        (1 << length) - 1
    }
}

/// Wraps a delta to 16 bits by sign-extending bit 15.
#[inline]
pub(crate) const fn wrap_16(value: i32) -> i32 {
    (value << 16) >> 16
}

#[inline]
pub(crate) const fn sign_extend(bits: u32, length: u32) -> i32 {
    if length == 0 {
        0
    } else {
        ((bits << (32 - length)) as i32) >> (32 - length)
    }
}

/// Truncating s.15 conversion, clamped to the open unit interval.
#[inline]
pub(crate) fn to_fixed(value: f64) -> i32 {
    ((value * FIXED_SCALE) as i32).clamp(-FIXED_MAX, FIXED_MAX)
}

#[inline]
pub(crate) fn from_fixed(value: i32) -> f32 {
    (value as f64 / FIXED_SCALE) as f32
}

/// Bits needed to hold `value` in two's complement, sign bit included.
#[inline]
pub(crate) const fn signed_length(value: i32) -> u32 {
    if value >= 0 {
        33 - value.leading_zeros()
    } else {
        33 - (!value).leading_zeros()
    }
}

/// Common field length and trailing-zero shift of a group of components.
///
/// Non-negative components are OR'ed together and negative ones AND'ed
/// together before measuring: values of equal sign share their leading bits,
/// so the combined value needs exactly as many bits as the widest member.
pub(crate) fn compute_length_shift(values: &[i32]) -> (u32, u32) {
    let all = values.iter().fold(0, |acc, &v| acc | v);
    if all == 0 {
        return (0, 0);
    }
    let shift = all.trailing_zeros();

    let mut positive = 0_i32;
    let mut negative = -1_i32;
    for &v in values {
        let v = v >> shift;
        if v < 0 {
            negative &= v;
        } else {
            positive |= v;
        }
    }
    let length = signed_length(positive).max(signed_length(negative));
    (length, shift)
}

/// Field length and shift for unsigned values such as normal grid indices.
pub(crate) fn compute_unsigned_length_shift(values: &[i32]) -> (u32, u32) {
    let all = values.iter().fold(0, |acc, &v| acc | v);
    if all <= 0 {
        return (0, 0);
    }
    let shift = all.trailing_zeros();
    (32 - (all >> shift).leading_zeros(), shift)
}
