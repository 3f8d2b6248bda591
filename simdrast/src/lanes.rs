//! Fixed-width batches of values processed in lockstep.
//!
//! The pipeline stages are written against [`F32s`]`<W>` and [`Mask`] so that
//! the same code serves every supported lane width. The compiler is expected
//! to vectorize the element-wise loops; nothing here depends on a particular
//! instruction set.
use std::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, MulAssign, Neg, Sub, SubAssign};

/// A set of lanes. Bit `i` corresponds to lane `i`.
pub type Mask = u32;

/// The mask with all `w` lanes set.
#[inline]
pub fn full_mask(w: usize) -> Mask {
    debug_assert!(w <= 32);
    if w >= 32 {
        !0
    } else {
        (1 << w) - 1
    }
}

/// Iterate through the set lanes of `mask` in ascending order.
#[inline]
pub fn lanes_of(mut mask: Mask) -> impl Iterator<Item = usize> {
    std::iter::from_fn(move || {
        if mask == 0 {
            None
        } else {
            let i = mask.trailing_zeros();
            mask &= mask - 1;
            Some(i as usize)
        }
    })
}

/// Round to the nearest integer, ties to even. This is the rounding mode of
/// the default floating-point environment, which the vertex snapping relies
/// on.
#[inline]
pub fn round_even(x: f32) -> f32 {
    let r = x.round();
    if (r - x).abs() == 0.5 {
        (x * 0.5).round() * 2.0
    } else {
        r
    }
}

/// `W` single-precision values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct F32s<const W: usize>(pub [f32; W]);

/// `W` double-precision values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct F64s<const W: usize>(pub [f64; W]);

impl<const W: usize> F32s<W> {
    #[inline]
    pub fn splat(x: f32) -> Self {
        Self([x; W])
    }

    #[inline]
    pub fn from_fn(f: impl FnMut(usize) -> f32) -> Self {
        Self(std::array::from_fn(f))
    }

    #[inline]
    pub fn map(self, mut f: impl FnMut(f32) -> f32) -> Self {
        Self::from_fn(|i| f(self.0[i]))
    }

    #[inline]
    pub fn zip(self, other: Self, mut f: impl FnMut(f32, f32) -> f32) -> Self {
        Self::from_fn(|i| f(self.0[i], other.0[i]))
    }

    #[inline]
    pub fn min(self, other: Self) -> Self {
        self.zip(other, f32::min)
    }

    #[inline]
    pub fn max(self, other: Self) -> Self {
        self.zip(other, f32::max)
    }

    #[inline]
    pub fn abs(self) -> Self {
        self.map(f32::abs)
    }

    #[inline]
    pub fn floor(self) -> Self {
        self.map(f32::floor)
    }

    #[inline]
    pub fn ceil(self) -> Self {
        self.map(f32::ceil)
    }

    #[inline]
    pub fn round(self) -> Self {
        self.map(round_even)
    }

    #[inline]
    pub fn recip(self) -> Self {
        self.map(f32::recip)
    }

    /// The lanes whose sign bit is set. Includes `-0.0`.
    #[inline]
    pub fn sign_mask(self) -> Mask {
        self.mask_by(|x| x.is_sign_negative())
    }

    #[inline]
    pub fn mask_by(self, mut f: impl FnMut(f32) -> bool) -> Mask {
        let mut mask = 0;
        for (i, &x) in self.0.iter().enumerate() {
            mask |= (f(x) as Mask) << i;
        }
        mask
    }

    #[inline]
    fn cmp_mask(self, other: Self, mut f: impl FnMut(f32, f32) -> bool) -> Mask {
        let mut mask = 0;
        for i in 0..W {
            mask |= (f(self.0[i], other.0[i]) as Mask) << i;
        }
        mask
    }

    #[inline]
    pub fn lt(self, other: Self) -> Mask {
        self.cmp_mask(other, |a, b| a < b)
    }

    #[inline]
    pub fn le(self, other: Self) -> Mask {
        self.cmp_mask(other, |a, b| a <= b)
    }

    #[inline]
    pub fn gt(self, other: Self) -> Mask {
        self.cmp_mask(other, |a, b| a > b)
    }

    #[inline]
    pub fn ge(self, other: Self) -> Mask {
        self.cmp_mask(other, |a, b| a >= b)
    }

    #[inline]
    pub fn eq_mask(self, other: Self) -> Mask {
        self.cmp_mask(other, |a, b| a == b)
    }

    /// `mask ? if_true : if_false`, lane by lane.
    #[inline]
    pub fn select(mask: Mask, if_true: Self, if_false: Self) -> Self {
        Self::from_fn(|i| {
            if mask & (1 << i) != 0 {
                if_true.0[i]
            } else {
                if_false.0[i]
            }
        })
    }

    /// Zero the lanes not included in `mask`.
    #[inline]
    pub fn keep(self, mask: Mask) -> Self {
        Self::select(mask, self, Self::splat(0.0))
    }

    #[inline]
    pub fn sum(self) -> f32 {
        self.0.iter().sum()
    }

    #[inline]
    pub fn to_f64(self) -> F64s<W> {
        F64s(std::array::from_fn(|i| self.0[i] as f64))
    }

    /// Convert to `i16` with truncation, saturating at the bounds.
    #[inline]
    pub fn to_i16_sat(self) -> [i16; W] {
        std::array::from_fn(|i| self.0[i] as i16)
    }
}

impl<const W: usize> F64s<W> {
    #[inline]
    pub fn splat(x: f64) -> Self {
        Self([x; W])
    }

    #[inline]
    pub fn to_f32(self) -> F32s<W> {
        F32s::from_fn(|i| self.0[i] as f32)
    }
}

/// Transpose `W` rows of four values (array of structures) to four batches
/// (structure of arrays).
#[inline]
pub fn soa4<const W: usize>(mut row: impl FnMut(usize) -> [f32; 4]) -> [F32s<W>; 4] {
    let mut out = [F32s::splat(0.0); 4];
    for i in 0..W {
        let r = row(i);
        for (c, &x) in out.iter_mut().zip(r.iter()) {
            c.0[i] = x;
        }
    }
    out
}

/// Transpose four batches to `W` rows of four values.
#[inline]
pub fn aos4<const W: usize>(cols: [F32s<W>; 4]) -> [[f32; 4]; W] {
    std::array::from_fn(|i| [cols[0].0[i], cols[1].0[i], cols[2].0[i], cols[3].0[i]])
}

macro_rules! impl_binop {
    ($ty:ident, $elem:ty, $tr:ident, $f:ident, $atr:ident, $af:ident, $op:tt) => {
        impl<const W: usize> $tr for $ty<W> {
            type Output = Self;
            #[inline]
            fn $f(self, rhs: Self) -> Self {
                Self(std::array::from_fn(|i| self.0[i] $op rhs.0[i]))
            }
        }

        impl<const W: usize> $tr<$elem> for $ty<W> {
            type Output = Self;
            #[inline]
            fn $f(self, rhs: $elem) -> Self {
                Self(std::array::from_fn(|i| self.0[i] $op rhs))
            }
        }

        impl<const W: usize> $atr for $ty<W> {
            #[inline]
            fn $af(&mut self, rhs: Self) {
                *self = *self $op rhs;
            }
        }

        impl<const W: usize> $atr<$elem> for $ty<W> {
            #[inline]
            fn $af(&mut self, rhs: $elem) {
                *self = *self $op rhs;
            }
        }
    };
}

impl_binop!(F32s, f32, Add, add, AddAssign, add_assign, +);
impl_binop!(F32s, f32, Sub, sub, SubAssign, sub_assign, -);
impl_binop!(F32s, f32, Mul, mul, MulAssign, mul_assign, *);
impl_binop!(F64s, f64, Add, add, AddAssign, add_assign, +);
impl_binop!(F64s, f64, Sub, sub, SubAssign, sub_assign, -);
impl_binop!(F64s, f64, Mul, mul, MulAssign, mul_assign, *);

impl<const W: usize> Div for F32s<W> {
    type Output = Self;
    #[inline]
    fn div(self, rhs: Self) -> Self {
        self.zip(rhs, |a, b| a / b)
    }
}

impl<const W: usize> Neg for F32s<W> {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        self.map(|x| -x)
    }
}

impl<const W: usize> Index<usize> for F32s<W> {
    type Output = f32;
    #[inline]
    fn index(&self, i: usize) -> &f32 {
        &self.0[i]
    }
}

impl<const W: usize> IndexMut<usize> for F32s<W> {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut f32 {
        &mut self.0[i]
    }
}

impl<const W: usize> Index<usize> for F64s<W> {
    type Output = f64;
    #[inline]
    fn index(&self, i: usize) -> &f64 {
        &self.0[i]
    }
}
