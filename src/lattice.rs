//! Lattice storage: one site object per outer site of a grid.
//!
//! A lattice only exists on a grid whose inner site count equals the lane
//! count of its site object, so every outer site maps onto whole lanes.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::grid::{GridLayout, Parity};
use crate::simd::SiteObject;

/// Field of site objects laid out by a [`GridLayout`].
///
/// On a red-black grid the lattice holds the sites of one parity only,
/// given by [`checkerboard()`](Self::checkerboard).
#[derive(Debug, Clone, PartialEq)]
pub struct Lattice<V: SiteObject> {
    grid: Arc<GridLayout>,
    checkerboard: Parity,
    odata: Vec<V>,
}

impl<V: SiteObject> Lattice<V> {
    /// Zero-filled lattice of even parity.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLayout`] if `V` does not carry exactly
    /// `grid.isites()` lanes.
    pub fn new(grid: Arc<GridLayout>) -> Result<Self> {
        Self::with_checkerboard(grid, Parity::Even)
    }

    /// Zero-filled lattice of parity `checkerboard`.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_checkerboard(grid: Arc<GridLayout>, checkerboard: Parity) -> Result<Self> {
        Error::check_layout(V::LANES == grid.isites(), || {
            format!(
                "site object has {} lanes, layout has {}",
                V::LANES,
                grid.isites()
            )
        })?;
        let odata = vec![V::zeroed(); grid.osites()];
        Ok(Lattice {
            grid,
            checkerboard,
            odata,
        })
    }

    /// Lattice whose every site holds `f(full global coordinate)`.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn from_fn(
        grid: Arc<GridLayout>,
        checkerboard: Parity,
        mut f: impl FnMut(&[usize]) -> V::Scalar,
    ) -> Result<Self> {
        let mut lattice = Self::with_checkerboard(grid, checkerboard)?;
        let grid = Arc::clone(&lattice.grid);
        for (o, site) in lattice.odata.iter_mut().enumerate() {
            for lane in 0..V::LANES {
                site.set_lane(lane, f(&grid.global_coor(o, lane, checkerboard)));
            }
        }
        Ok(lattice)
    }

    /// The layout.
    pub fn grid(&self) -> &Arc<GridLayout> {
        &self.grid
    }

    /// Parity of the stored sites.
    pub fn checkerboard(&self) -> Parity {
        self.checkerboard
    }

    /// Relabel the parity of the stored sites.
    pub fn set_checkerboard(&mut self, checkerboard: Parity) {
        self.checkerboard = checkerboard;
    }

    /// Site objects in outer-index order.
    pub fn odata(&self) -> &[V] {
        &self.odata
    }

    /// Mutable site objects in outer-index order.
    pub fn odata_mut(&mut self) -> &mut [V] {
        &mut self.odata
    }

    /// Fail with [`Error::GridMismatch`] unless `other` shares this layout.
    pub fn conformable<W: SiteObject>(&self, other: &Lattice<W>) -> Result<()> {
        if Arc::ptr_eq(&self.grid, &other.grid) || *self.grid == *other.grid {
            Ok(())
        } else {
            Err(Error::GridMismatch)
        }
    }

    /// Value at full global coordinate `coor`, if stored here.
    pub fn peek(&self, coor: &[usize]) -> Option<V::Scalar> {
        let (o, lane, cb) = self.grid.locate(coor)?;
        (cb == self.checkerboard).then(|| self.odata[o].lane(lane))
    }

    /// Store `value` at full global coordinate `coor`; returns whether the
    /// site is stored here.
    pub fn poke(&mut self, coor: &[usize], value: V::Scalar) -> bool {
        match self.grid.locate(coor) {
            Some((o, lane, cb)) if cb == self.checkerboard => {
                self.odata[o].set_lane(lane, value);
                true
            }
            _ => false,
        }
    }

    /// Visit every stored site with its full global coordinate.
    pub fn for_each_site(&self, mut f: impl FnMut(&[usize], V::Scalar)) {
        for (o, site) in self.odata.iter().enumerate() {
            for lane in 0..V::LANES {
                f(&self.grid.global_coor(o, lane, self.checkerboard), site.lane(lane));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CheckerLayout;
    use crate::simd::Lanes;

    #[test]
    fn fill_and_peek_by_global_coordinate() {
        let grid = Arc::new(GridLayout::local(&[4, 4], &[2, 1]).unwrap());
        let lat: Lattice<Lanes<u64, 2>> =
            Lattice::from_fn(grid, Parity::Even, |c| (10 * c[0] + c[1]) as u64).unwrap();
        assert_eq!(lat.odata().len(), 8);
        assert_eq!(lat.peek(&[3, 2]), Some(32));
        // Lane 1 of outer site 0 holds x = 2.
        assert_eq!(lat.odata()[0], Lanes([0, 20]));
        let mut count = 0;
        lat.for_each_site(|c, v| {
            assert_eq!(v, (10 * c[0] + c[1]) as u64);
            count += 1;
        });
        assert_eq!(count, 16);
    }

    #[test]
    fn parity_filters_access() {
        let grid = Arc::new(
            GridLayout::red_black(&[4], &[1], &[1], &[0], CheckerLayout::new(0, 1))
                .unwrap(),
        );
        let mut lat: Lattice<f64> = Lattice::with_checkerboard(grid, Parity::Odd).unwrap();
        assert!(lat.poke(&[3], 1.5));
        assert!(!lat.poke(&[2], 1.5));
        assert_eq!(lat.peek(&[3]), Some(1.5));
        assert_eq!(lat.peek(&[2]), None);
    }

    #[test]
    fn different_grids_are_not_conformable() {
        let a: Lattice<f64> = Lattice::new(Arc::new(GridLayout::local(&[4], &[1]).unwrap())).unwrap();
        let b: Lattice<f64> = Lattice::new(Arc::new(GridLayout::local(&[8], &[1]).unwrap())).unwrap();
        let c: Lattice<u64> = Lattice::new(Arc::new(GridLayout::local(&[4], &[1]).unwrap())).unwrap();
        assert!(matches!(a.conformable(&b), Err(Error::GridMismatch)));
        assert!(a.conformable(&c).is_ok());
    }

    #[test]
    fn lane_count_must_match_layout() {
        let two = Arc::new(GridLayout::local(&[4], &[2]).unwrap());
        let four = Arc::new(GridLayout::local(&[8], &[4]).unwrap());
        assert!(matches!(
            Lattice::<f64>::from_fn(Arc::clone(&two), Parity::Even, |c| c[0] as f64),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            Lattice::<Lanes<u64, 2>>::new(four),
            Err(Error::InvalidLayout(_))
        ));

        // With matching lanes every site is visited and addressable.
        let lat: Lattice<Lanes<f64, 2>> =
            Lattice::from_fn(two, Parity::Even, |c| c[0] as f64).unwrap();
        assert_eq!(lat.peek(&[2]), Some(2.0));
        let mut seen = Vec::new();
        lat.for_each_site(|c, v| seen.push((c[0], v)));
        seen.sort_by_key(|&(x, _)| x);
        assert_eq!(seen, vec![(0, 0.0), (1, 1.0), (2, 2.0), (3, 3.0)]);
    }
}
