//! Site objects and SIMD lane permutation.
//!
//! A site object is one stored element of a lattice. A vectorized object
//! packs [`SiteObject::LANES`] logical sites into one value; a scalar object
//! has a single lane. Lanes are addressed by a linear lane index whose
//! per-dimension coordinates follow the grid's inner strides.

use std::fmt::Debug;

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};

/// Element type stored at every outer site of a lattice.
pub trait SiteObject: Pod + PartialEq + Debug + Send + Sync {
    /// Value held by one lane.
    type Scalar: Pod + PartialEq + Debug + Send + Sync;

    /// Number of lanes.
    const LANES: usize;

    /// Read lane `i`.
    fn lane(&self, i: usize) -> Self::Scalar;

    /// Write lane `i`.
    fn set_lane(&mut self, i: usize, value: Self::Scalar);

    /// Object with every lane set to `value`.
    fn splat(value: Self::Scalar) -> Self {
        let mut out = Self::zeroed();
        for i in 0..Self::LANES {
            out.set_lane(i, value);
        }
        out
    }

    /// Rearrange lanes: output lane `l` takes input lane
    /// [`perm.source_lane(l)`](PermuteType::source_lane).
    fn permute(&self, perm: &PermuteType) -> Self {
        let mut out = *self;
        for l in 0..Self::LANES {
            out.set_lane(l, self.lane(perm.source_lane(l)));
        }
        out
    }
}

macro_rules! scalar_site {
    ($($t:ty),*) => {$(
        impl SiteObject for $t {
            type Scalar = $t;
            const LANES: usize = 1;

            #[inline]
            fn lane(&self, _i: usize) -> $t {
                *self
            }

            #[inline]
            fn set_lane(&mut self, _i: usize, value: $t) {
                *self = value;
            }
        }
    )*};
}

scalar_site!(f32, f64, i32, i64, u32, u64);

/// `N` scalar lanes packed in one vector.
#[derive(Clone, Copy, PartialEq, Debug)]
#[repr(transparent)]
pub struct Lanes<T, const N: usize>(pub [T; N]);

// SAFETY: a transparent wrapper over an array of `T` has the same layout as
// the array, which is zeroable/pod whenever `T` is.
unsafe impl<T: Zeroable, const N: usize> Zeroable for Lanes<T, N> {}
unsafe impl<T: Pod, const N: usize> Pod for Lanes<T, N> {}

impl<T: Pod, const N: usize> Default for Lanes<T, N> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<T: Copy, const N: usize> Lanes<T, N> {
    /// Build from a function of the lane index.
    pub fn from_fn(f: impl FnMut(usize) -> T) -> Self {
        Lanes(std::array::from_fn(f))
    }
}

impl<T, const N: usize> SiteObject for Lanes<T, N>
where
    T: Pod + PartialEq + Debug + Send + Sync,
{
    type Scalar = T;
    const LANES: usize = N;

    #[inline]
    fn lane(&self, i: usize) -> T {
        self.0[i]
    }

    #[inline]
    fn set_lane(&mut self, i: usize, value: T) {
        self.0[i] = value;
    }
}

/// Several vectorized components per site (e.g. the colors of a field).
///
/// Each lane is the `K`-tuple of the components' lanes.
impl<V, const K: usize> SiteObject for [V; K]
where
    V: SiteObject,
    [V; K]: Pod,
    [V::Scalar; K]: Pod + PartialEq + Debug + Send + Sync,
{
    type Scalar = [V::Scalar; K];
    const LANES: usize = V::LANES;

    fn lane(&self, i: usize) -> Self::Scalar {
        std::array::from_fn(|k| self[k].lane(i))
    }

    fn set_lane(&mut self, i: usize, value: Self::Scalar) {
        for (component, v) in self.iter_mut().zip(value) {
            component.set_lane(i, v);
        }
    }
}

/// Which lane rearrangements a dimension supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Swap the two halves of the lane set (two lanes along the dimension).
    Exchange,
    /// Arbitrary cyclic rotation of the lanes along the dimension.
    Rotate,
}

/// Lane layout of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanePattern {
    /// Supported rearrangement.
    pub kind: PatternKind,
    /// Distance between lanes adjacent along the dimension.
    pub istride: usize,
    /// Lanes along the dimension.
    pub lanes: usize,
}

/// A lane permutation: rotate the lane coordinate along one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermuteType {
    /// Lane layout of the dimension.
    pub base: LanePattern,
    /// Lane positions to rotate by, in `0..base.lanes`.
    pub rotate: usize,
}

impl PermuteType {
    /// Permutation rotating `base` by `slice` lanes.
    ///
    /// # Errors
    ///
    /// [`Error::RotationUnsupported`] if more than two lanes lie along the
    /// dimension, `slice` is nonzero and `base` cannot rotate.
    pub fn combine(base: LanePattern, slice: usize) -> Result<Self> {
        if base.lanes > 2 && slice != 0 && base.kind != PatternKind::Rotate {
            return Err(Error::RotationUnsupported {
                slice,
                lanes: base.lanes,
            });
        }
        Ok(PermuteType {
            base,
            rotate: slice % base.lanes.max(1),
        })
    }

    /// Whether the permutation leaves every lane in place.
    pub fn is_identity(&self) -> bool {
        self.rotate == 0
    }

    /// Input lane feeding output lane `l`.
    #[inline]
    pub fn source_lane(&self, l: usize) -> usize {
        let LanePattern { istride, lanes, .. } = self.base;
        let c = (l / istride) % lanes;
        let nc = (c + self.rotate) % lanes;
        l - c * istride + nc * istride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(kind: PatternKind, istride: usize, lanes: usize) -> LanePattern {
        LanePattern {
            kind,
            istride,
            lanes,
        }
    }

    #[test]
    fn exchange_swaps_halves() {
        let p = PermuteType::combine(pattern(PatternKind::Exchange, 1, 2), 1).unwrap();
        let v = Lanes([10.0f64, 20.0]);
        assert_eq!(v.permute(&p), Lanes([20.0, 10.0]));
    }

    #[test]
    fn rotation_along_inner_stride() {
        // 8 lanes laid out as 2 (stride 1) x 4 (stride 2); rotate the second
        // dimension by one.
        let p = PermuteType::combine(pattern(PatternKind::Rotate, 2, 4), 1).unwrap();
        let v = Lanes::<u32, 8>::from_fn(|i| i as u32);
        assert_eq!(v.permute(&p), Lanes([2, 3, 4, 5, 6, 7, 0, 1]));
    }

    #[test]
    fn rotation_needs_rotating_pattern() {
        let exchange = pattern(PatternKind::Exchange, 1, 4);
        assert!(matches!(
            PermuteType::combine(exchange, 1),
            Err(Error::RotationUnsupported { slice: 1, lanes: 4 })
        ));
        assert!(PermuteType::combine(exchange, 0).unwrap().is_identity());
        assert!(PermuteType::combine(pattern(PatternKind::Exchange, 1, 2), 1).is_ok());
    }

    #[test]
    fn scalar_sites_have_one_lane() {
        assert_eq!(<f64 as SiteObject>::LANES, 1);
        let mut x = 1.5f64;
        x.set_lane(0, 2.5);
        assert_eq!(x.lane(0), 2.5);
        assert_eq!(<u64 as SiteObject>::splat(7), 7);
    }

    #[test]
    fn component_arrays_permute_every_component() {
        let p = PermuteType::combine(pattern(PatternKind::Exchange, 1, 2), 1).unwrap();
        let v = [Lanes([1u64, 2]), Lanes([3, 4])];
        assert_eq!(v.lane(1), [2, 4]);
        assert_eq!(v.permute(&p), [Lanes([2, 1]), Lanes([4, 3])]);
    }
}
