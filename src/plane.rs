//! Hyperplane gather, scatter and copy.
//!
//! A plane is the set of outer sites with a fixed reduced coordinate along
//! one dimension. In outer-index order a plane of dimension `d` is
//! `slice_nblock(d)` blocks of `slice_block(d)` contiguous sites, successive
//! blocks `slice_stride(d)` apart; the plane at coordinate `x` starts at
//! `x * ostride[d]`.
//!
//! Every operation takes a parity mask. It only has an effect along the
//! checkerboarded dimension of a red-black grid; elsewhere every site of the
//! plane is selected.
//!
//! Writes are partitioned by block row with `par_chunks_mut(slice_stride)`:
//! row `n` of a plane lies entirely in chunk `n`, so rows can be written in
//! parallel without sharing.

use rayon::prelude::*;
use tracing::warn;

use crate::error::{Error, Result};
use crate::grid::{CbMask, GridLayout};
use crate::lattice::Lattice;
use crate::simd::{PermuteType, SiteObject};

/// Shape of one plane.
#[derive(Debug, Clone, Copy)]
struct PlaneGeometry {
    /// Offset of the plane within a block row.
    so: usize,
    block: usize,
    nblock: usize,
    stride: usize,
}

impl PlaneGeometry {
    fn new(grid: &GridLayout, dim: usize, plane: usize) -> Self {
        PlaneGeometry {
            so: plane * grid.ostride()[dim],
            block: grid.slice_block(dim),
            nblock: grid.slice_nblock(dim),
            stride: grid.slice_stride(dim),
        }
    }

    fn sites(&self) -> usize {
        self.block * self.nblock
    }
}

fn effective_mask(grid: &GridLayout, dim: usize, cbmask: CbMask) -> CbMask {
    if grid.checkerboarded(dim) {
        cbmask
    } else {
        CbMask::BOTH
    }
}

fn selected(grid: &GridLayout, cbmask: CbMask, o: usize) -> bool {
    cbmask.contains(grid.checkerboard_from_oindex(o))
}

fn check_len(expected: usize, found: usize) -> Result<()> {
    if found < expected {
        return Err(Error::SizeMismatch { expected, found });
    }
    Ok(())
}

/// Number of plane sites a gather with `cbmask` produces.
pub fn plane_count(grid: &GridLayout, dim: usize, plane: usize, cbmask: CbMask) -> usize {
    let geom = PlaneGeometry::new(grid, dim, plane);
    let cbmask = effective_mask(grid, dim, cbmask);
    if cbmask.is_full() {
        return geom.sites();
    }
    (0..geom.nblock)
        .flat_map(|n| (0..geom.block).map(move |b| geom.so + n * geom.stride + b))
        .filter(|&o| selected(grid, cbmask, o))
        .count()
}

/// Copy the selected sites of plane `plane` of `rhs` into `buffer`,
/// compacted, in block order. Returns the number of sites written.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if `buffer` is too short.
pub fn gather_plane_simple<V: SiteObject>(
    rhs: &Lattice<V>,
    buffer: &mut [V],
    dim: usize,
    plane: usize,
    cbmask: CbMask,
) -> Result<usize> {
    let grid = rhs.grid();
    let geom = PlaneGeometry::new(grid, dim, plane);
    let cbmask = effective_mask(grid, dim, cbmask);
    let odata = rhs.odata();

    if cbmask.is_full() {
        check_len(geom.sites(), buffer.len())?;
        buffer[..geom.sites()]
            .par_chunks_mut(geom.block)
            .enumerate()
            .for_each(|(n, row)| {
                let start = geom.so + n * geom.stride;
                row.copy_from_slice(&odata[start..start + geom.block]);
            });
        return Ok(geom.sites());
    }

    // (buffer offset, lattice offset) of every selected site.
    let mut table = Vec::with_capacity(geom.sites());
    for n in 0..geom.nblock {
        for b in 0..geom.block {
            let o = geom.so + n * geom.stride + b;
            if selected(grid, cbmask, o) {
                table.push((table.len(), o));
            }
        }
    }
    check_len(table.len(), buffer.len())?;
    buffer[..table.len()]
        .par_iter_mut()
        .zip(table.par_iter())
        .for_each(|(dst, &(_, o))| *dst = odata[o]);
    Ok(table.len())
}

/// Inverse of [`gather_plane_simple`]: write the compacted `buffer` into the
/// selected sites of plane `plane` of `lhs`. Returns the number of sites read.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if `buffer` is too short.
pub fn scatter_plane_simple<V: SiteObject>(
    lhs: &mut Lattice<V>,
    buffer: &[V],
    dim: usize,
    plane: usize,
    cbmask: CbMask,
) -> Result<usize> {
    let grid = std::sync::Arc::clone(lhs.grid());
    let geom = PlaneGeometry::new(&grid, dim, plane);
    let cbmask = effective_mask(&grid, dim, cbmask);
    let odata = lhs.odata_mut();

    if cbmask.is_full() {
        check_len(geom.sites(), buffer.len())?;
        odata
            .par_chunks_mut(geom.stride)
            .enumerate()
            .for_each(|(n, chunk)| {
                let src = &buffer[n * geom.block..(n + 1) * geom.block];
                chunk[geom.so..geom.so + geom.block].copy_from_slice(src);
            });
        return Ok(geom.sites());
    }

    // Per row: (offset in row chunk, buffer offset).
    let mut rows = Vec::with_capacity(geom.nblock);
    let mut bo = 0;
    for n in 0..geom.nblock {
        let mut row = Vec::new();
        for b in 0..geom.block {
            if selected(&grid, cbmask, geom.so + n * geom.stride + b) {
                row.push((geom.so + b, bo));
                bo += 1;
            }
        }
        rows.push(row);
    }
    check_len(bo, buffer.len())?;
    odata
        .par_chunks_mut(geom.stride)
        .zip(rows.par_iter())
        .for_each(|(chunk, row)| {
            for &(off, bo) in row {
                chunk[off] = buffer[bo];
            }
        });
    Ok(bo)
}

/// Split plane `plane` of `rhs` into one scalar buffer per lane; site
/// `b + n * block` of the plane goes to index `b + n * block` of every lane
/// buffer.
///
/// With a partial mask only the selected sites are written and the buffers
/// keep their holes.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if there are too few buffers or one is too short.
pub fn gather_plane_extract<V: SiteObject>(
    rhs: &Lattice<V>,
    buffers: &mut [Vec<V::Scalar>],
    dim: usize,
    plane: usize,
    cbmask: CbMask,
) -> Result<()> {
    let grid = rhs.grid();
    let geom = PlaneGeometry::new(grid, dim, plane);
    let cbmask = effective_mask(grid, dim, cbmask);
    let odata = rhs.odata();

    check_len(V::LANES, buffers.len())?;
    for buf in buffers.iter() {
        check_len(geom.sites(), buf.len())?;
    }
    if !cbmask.is_full() {
        warn!(dim, plane, mask = cbmask.bits(), "lane buffer not densely packed");
    }

    buffers[..V::LANES]
        .par_iter_mut()
        .enumerate()
        .for_each(|(lane, buf)| {
            for n in 0..geom.nblock {
                for b in 0..geom.block {
                    let o = geom.so + n * geom.stride + b;
                    if cbmask.is_full() || selected(grid, cbmask, o) {
                        buf[b + n * geom.block] = odata[o].lane(lane);
                    }
                }
            }
        });
    Ok(())
}

/// Inverse of [`gather_plane_extract`]: rebuild plane `plane` of `lhs` from
/// one scalar buffer per lane.
///
/// # Errors
///
/// [`Error::SizeMismatch`] if there are too few buffers or one is too short.
pub fn scatter_plane_merge<V: SiteObject>(
    lhs: &mut Lattice<V>,
    buffers: &[&[V::Scalar]],
    dim: usize,
    plane: usize,
    cbmask: CbMask,
) -> Result<()> {
    let grid = std::sync::Arc::clone(lhs.grid());
    let geom = PlaneGeometry::new(&grid, dim, plane);
    let cbmask = effective_mask(&grid, dim, cbmask);

    check_len(V::LANES, buffers.len())?;
    for buf in buffers.iter() {
        check_len(geom.sites(), buf.len())?;
    }
    if !cbmask.is_full() {
        warn!(dim, plane, mask = cbmask.bits(), "lane buffer not densely packed");
    }

    lhs.odata_mut()
        .par_chunks_mut(geom.stride)
        .enumerate()
        .for_each(|(n, chunk)| {
            for b in 0..geom.block {
                let o = geom.so + n * geom.stride + b;
                if cbmask.is_full() || selected(&grid, cbmask, o) {
                    let site = &mut chunk[geom.so + b];
                    for (lane, buf) in buffers[..V::LANES].iter().enumerate() {
                        site.set_lane(lane, buf[b + n * geom.block]);
                    }
                }
            }
        });
    Ok(())
}

/// Copy plane `rplane` of `rhs` into plane `lplane` of `lhs`.
///
/// # Errors
///
/// [`Error::GridMismatch`] if the lattices have different layouts.
pub fn copy_plane<V: SiteObject>(
    lhs: &mut Lattice<V>,
    rhs: &Lattice<V>,
    dim: usize,
    lplane: usize,
    rplane: usize,
    cbmask: CbMask,
) -> Result<()> {
    copy_plane_with(lhs, rhs, dim, lplane, rplane, cbmask, |v| *v)
}

/// Copy plane `rplane` of `rhs` into plane `lplane` of `lhs`, permuting the
/// lanes of every site by `perm`.
///
/// # Errors
///
/// [`Error::GridMismatch`] if the lattices have different layouts.
pub fn copy_plane_permute<V: SiteObject>(
    lhs: &mut Lattice<V>,
    rhs: &Lattice<V>,
    dim: usize,
    lplane: usize,
    rplane: usize,
    cbmask: CbMask,
    perm: &PermuteType,
) -> Result<()> {
    copy_plane_with(lhs, rhs, dim, lplane, rplane, cbmask, |v| v.permute(perm))
}

fn copy_plane_with<V: SiteObject>(
    lhs: &mut Lattice<V>,
    rhs: &Lattice<V>,
    dim: usize,
    lplane: usize,
    rplane: usize,
    cbmask: CbMask,
    f: impl Fn(&V) -> V + Sync,
) -> Result<()> {
    lhs.conformable(rhs)?;
    let grid = std::sync::Arc::clone(rhs.grid());
    let cbmask = effective_mask(&grid, dim, cbmask);
    let ro = rplane * grid.ostride()[dim];
    let lo = lplane * grid.ostride()[dim];
    let block = grid.slice_block(dim);
    let stride = grid.slice_stride(dim);
    let src = rhs.odata();

    lhs.odata_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(n, chunk)| {
            let row = n * stride;
            for b in 0..block {
                if cbmask.is_full() || selected(&grid, cbmask, row + ro + b) {
                    chunk[lo + b] = f(&src[row + ro + b]);
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{CheckerLayout, Parity};
    use crate::simd::Lanes;
    use std::sync::Arc;

    fn coord_lattice(grid: GridLayout) -> Lattice<u64> {
        Lattice::from_fn(Arc::new(grid), Parity::Even, |c| {
            c.iter().fold(0, |acc, &x| acc * 16 + x as u64)
        })
        .unwrap()
    }

    #[test]
    fn gather_scatter_full_plane() {
        let lat = coord_lattice(GridLayout::local(&[4, 3, 2], &[1, 1, 1]).unwrap());
        let mut buf = vec![0u64; 8];
        assert_eq!(gather_plane_simple(&lat, &mut buf, 1, 2, CbMask::BOTH).unwrap(), 8);
        // Every gathered site has y = 2.
        for v in &buf {
            assert_eq!((v >> 4) & 0xf, 2);
        }

        let mut out = Lattice::<u64>::new(Arc::clone(lat.grid())).unwrap();
        scatter_plane_simple(&mut out, &buf, 1, 2, CbMask::BOTH).unwrap();
        out.for_each_site(|c, v| {
            if c[1] == 2 {
                assert_eq!(Some(v), lat.peek(c));
            } else {
                assert_eq!(v, 0);
            }
        });
    }

    #[test]
    fn mask_is_ignored_off_the_checker_dimension() {
        let lat = coord_lattice(GridLayout::local(&[4, 4], &[1, 1]).unwrap());
        assert_eq!(plane_count(lat.grid(), 0, 1, CbMask::EVEN), 4);
        let mut buf = vec![0u64; 4];
        assert_eq!(gather_plane_simple(&lat, &mut buf, 0, 1, CbMask::ODD).unwrap(), 4);
    }

    #[test]
    fn short_buffer_is_rejected() {
        let lat = coord_lattice(GridLayout::local(&[4, 4], &[1, 1]).unwrap());
        let mut buf = vec![0u64; 3];
        assert!(matches!(
            gather_plane_simple(&lat, &mut buf, 0, 0, CbMask::BOTH),
            Err(Error::SizeMismatch { expected: 4, found: 3 })
        ));
    }

    #[test]
    fn extract_merge_restores_plane() {
        let grid = Arc::new(GridLayout::local(&[4, 4], &[2, 2]).unwrap());
        let lat: Lattice<Lanes<u64, 4>> =
            Lattice::from_fn(Arc::clone(&grid), Parity::Even, |c| (c[0] * 4 + c[1]) as u64).unwrap();
        let sites = grid.plane_sites(1);
        let mut bufs = vec![vec![0u64; sites]; 4];
        gather_plane_extract(&lat, &mut bufs, 1, 1, CbMask::BOTH).unwrap();

        let mut out = Lattice::<Lanes<u64, 4>>::new(Arc::clone(&grid)).unwrap();
        let views: Vec<&[u64]> = bufs.iter().map(Vec::as_slice).collect();
        scatter_plane_merge(&mut out, &views, 1, 1, CbMask::BOTH).unwrap();
        assert_eq!(out.odata()[2], lat.odata()[2]);
        assert_eq!(out.odata()[3], lat.odata()[3]);
        assert_eq!(out.odata()[0], Lanes([0; 4]));
    }

    #[test]
    fn permuted_copy_rotates_lanes() {
        let grid = Arc::new(GridLayout::local(&[4], &[2]).unwrap());
        let lat: Lattice<Lanes<u64, 2>> =
            Lattice::from_fn(Arc::clone(&grid), Parity::Even, |c| c[0] as u64).unwrap();
        let mut out = Lattice::new(Arc::clone(&grid)).unwrap();
        let perm = PermuteType::combine(grid.permute_type(0), 1).unwrap();
        copy_plane_permute(&mut out, &lat, 0, 0, 1, CbMask::BOTH, &perm).unwrap();
        // Plane 1 holds x = 1, 3; rotated, lane 0 reads 3.
        assert_eq!(out.odata()[0], Lanes([3, 1]));
    }

    #[test]
    fn partial_mask_touches_one_parity() {
        let grid = Arc::new(
            GridLayout::red_black(&[4, 4], &[1, 1], &[1, 1], &[0, 0], CheckerLayout::new(0, 2))
                .unwrap(),
        );
        let lat: Lattice<u64> = Lattice::from_fn(Arc::clone(&grid), Parity::Even, |_| 9).unwrap();
        let mut out = Lattice::<u64>::new(Arc::clone(&grid)).unwrap();
        copy_plane(&mut out, &lat, 0, 1, 1, CbMask::ODD).unwrap();
        for o in 0..grid.osites() {
            let on_plane = grid.ocoor_from_oindex(o)[0] == 1;
            let odd = grid.checkerboard_from_oindex(o) == Parity::Odd;
            assert_eq!(out.odata()[o], if on_plane && odd { 9 } else { 0 });
        }
    }
}
