//! Cartesian shift of a lattice along one dimension.
//!
//! `cshift(out, rhs, dim, shift)` leaves `out(x) = rhs(x + shift * e_dim)`
//! for every full global coordinate `x`, periodically.
//!
//! The shift is performed plane by plane over the reduced coordinate of
//! `dim`. A plane either stays on the process (a local plane copy, with a
//! lane permutation when the shift wraps across SIMD lanes) or is exchanged
//! with a neighbour along the processor grid.
//!
//! On a red-black grid shifting along the checker dimension moves even and
//! odd rows by different amounts of stored sites; the shift then runs as two
//! passes, one per parity mask.

use bytemuck::Zeroable;
use tracing::trace;

use crate::cartesian::CartesianCommunicator;
use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::grid::{CbMask, GridLayout, Parity};
use crate::lattice::Lattice;
use crate::plane::{
    copy_plane, copy_plane_permute, gather_plane_extract, gather_plane_simple, plane_count,
    scatter_plane_merge, scatter_plane_simple,
};
use crate::simd::{PermuteType, SiteObject};

/// Shift `rhs` by `shift` sites along `dim` into `out`, exchanging planes
/// with the neighbours on `cart` where needed.
///
/// Collective over `cart`: every rank must call it with the same `dim` and
/// `shift`. The parity of `out` is set to the parity of the result.
///
/// # Errors
///
/// - [`Error::GridMismatch`] if `out`, `rhs` and `cart` disagree on the
///   layout
/// - [`Error::InvalidLayout`] if `dim` is out of range
/// - [`Error::RotationUnsupported`] for a lane rotation the layout cannot do
/// - any transport or shared-memory error from the exchange
pub fn cshift<V, C>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    cart: &CartesianCommunicator<C>,
    dim: usize,
    shift: isize,
) -> Result<()>
where
    V: SiteObject,
    C: Communicator,
{
    let grid = std::sync::Arc::clone(rhs.grid());
    if grid.processors() != cart.processors() || grid.processor_coor() != cart.processor_coor()
    {
        return Err(Error::GridMismatch);
    }
    let shift = prepare(out, rhs, &grid, dim, shift)?;

    for cbmask in passes(&grid, rhs.checkerboard(), dim, shift) {
        if grid.processors()[dim] == 1 {
            local_pass(out, rhs, &grid, dim, shift, cbmask)?;
        } else if grid.permute_dim(dim) {
            comms_simd_pass(out, rhs, cart, &grid, dim, shift, cbmask)?;
        } else {
            comms_pass(out, rhs, cart, &grid, dim, shift, cbmask)?;
        }
    }
    Ok(())
}

/// Shift along a dimension that is not distributed over processes.
///
/// # Errors
///
/// As [`cshift`]; additionally [`Error::InvalidLayout`] if `dim` is split
/// over more than one process.
pub fn cshift_local<V: SiteObject>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    dim: usize,
    shift: isize,
) -> Result<()> {
    let grid = std::sync::Arc::clone(rhs.grid());
    let shift = prepare(out, rhs, &grid, dim, shift)?;
    Error::check_layout(grid.processors()[dim] == 1, || {
        format!(
            "dimension {dim} is split over {} processes",
            grid.processors()[dim]
        )
    })?;
    for cbmask in passes(&grid, rhs.checkerboard(), dim, shift) {
        local_pass(out, rhs, &grid, dim, shift, cbmask)?;
    }
    Ok(())
}

/// Validate the operands, normalize `shift` into `[0, full extent)` and set
/// the parity of `out`.
fn prepare<V: SiteObject>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    grid: &GridLayout,
    dim: usize,
    shift: isize,
) -> Result<usize> {
    out.conformable(rhs)?;
    Error::check_layout(dim < grid.nd(), || {
        format!("shift dimension {dim} outside {} dimensions", grid.nd())
    })?;
    let full = grid.fdimensions()[dim] as isize;
    let shift = shift.rem_euclid(full) as usize;
    out.set_checkerboard(grid.checkerboard_destination(rhs.checkerboard(), shift, dim));
    Ok(shift)
}

/// Parity masks to run: one pass if both parities move by the same amount.
fn passes(grid: &GridLayout, cb: Parity, dim: usize, shift: usize) -> Vec<CbMask> {
    let even = grid.checkerboard_shift_for_cb(cb, dim, shift, Parity::Even);
    let odd = grid.checkerboard_shift_for_cb(cb, dim, shift, Parity::Odd);
    if even == odd {
        vec![CbMask::BOTH]
    } else {
        vec![CbMask::EVEN, CbMask::ODD]
    }
}

fn local_pass<V: SiteObject>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    grid: &GridLayout,
    dim: usize,
    shift: usize,
    cbmask: CbMask,
) -> Result<()> {
    let sshift = grid.checkerboard_shift_for_cb(rhs.checkerboard(), dim, shift, cbmask.pass_parity());
    let rd = grid.rdimensions()[dim];
    let ly = grid.simd_layout()[dim];
    trace!(dim, shift, sshift, mask = cbmask.bits(), "local shift pass");

    for x in 0..rd {
        let sx = (x + sshift) % rd;
        let slice = if grid.permute_dim(dim) {
            let wrap = (sshift / rd) % ly;
            let num = sshift % rd;
            if x < rd - num {
                wrap
            } else {
                (wrap + 1) % ly
            }
        } else {
            0
        };
        if slice != 0 {
            let perm = PermuteType::combine(grid.permute_type(dim), slice)?;
            copy_plane_permute(out, rhs, dim, x, sx, cbmask, &perm)?;
        } else {
            copy_plane(out, rhs, dim, x, sx, cbmask)?;
        }
    }
    Ok(())
}

fn comms_pass<V: SiteObject, C: Communicator>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    cart: &CartesianCommunicator<C>,
    grid: &GridLayout,
    dim: usize,
    shift: usize,
    cbmask: CbMask,
) -> Result<()> {
    let sshift = grid.checkerboard_shift_for_cb(rhs.checkerboard(), dim, shift, cbmask.pass_parity());
    let rd = grid.rdimensions()[dim];
    let pd = grid.processors()[dim];
    trace!(dim, shift, sshift, mask = cbmask.bits(), "communicating shift pass");

    for x in 0..rd {
        let sx = (x + sshift) % rd;
        let comm_proc = ((x + sshift) / rd) % pd;
        if comm_proc == 0 {
            copy_plane(out, rhs, dim, x, sx, cbmask)?;
            continue;
        }

        let words = plane_count(grid, dim, sx, cbmask);
        let mut send = vec![V::zeroed(); words];
        let mut recv = vec![V::zeroed(); words];
        gather_plane_simple(rhs, &mut send, dim, sx, cbmask)?;
        let (xmit_to, recv_from) = cart.shifted_ranks(dim, comm_proc);
        cart.send_to_recv_from(&send, xmit_to, &mut recv, recv_from, x as i32)?;
        scatter_plane_simple(out, &recv, dim, x, cbmask)?;
    }
    Ok(())
}

fn comms_simd_pass<V: SiteObject, C: Communicator>(
    out: &mut Lattice<V>,
    rhs: &Lattice<V>,
    cart: &CartesianCommunicator<C>,
    grid: &GridLayout,
    dim: usize,
    shift: usize,
    cbmask: CbMask,
) -> Result<()> {
    let sshift = grid.checkerboard_shift_for_cb(rhs.checkerboard(), dim, shift, cbmask.pass_parity());
    let rd = grid.rdimensions()[dim];
    let ld = grid.ldimensions()[dim];
    let pd = grid.processors()[dim];
    let ly = grid.simd_layout()[dim];
    let istride = grid.istride()[dim];
    let nsimd = V::LANES;
    let words = grid.plane_sites(dim);
    trace!(dim, shift, sshift, mask = cbmask.bits(), "communicating lane shift pass");

    for x in 0..rd {
        let sx = (x + sshift) % rd;
        let mut send = vec![vec![<V::Scalar as Zeroable>::zeroed(); words]; nsimd];
        gather_plane_extract(rhs, &mut send, dim, sx, cbmask)?;

        // Lane i of the result comes from lane `sources[i]` of plane `sx`,
        // on the process `nbr_proc` steps up along `dim`.
        let mut sources = Vec::with_capacity(nsimd);
        let mut received: Vec<Option<Vec<V::Scalar>>> = vec![None; nsimd];
        for (i, slot) in received.iter_mut().enumerate() {
            let ic = (i / istride) % ly;
            let nbr = rd * ic + x + sshift;
            let nbr_proc = (nbr / ld) % pd;
            let nbr_ic = (nbr % ld) / rd;
            let nbr_lane = i - ic * istride + nbr_ic * istride;
            sources.push(nbr_lane);

            if nbr_proc != 0 {
                let mut recv = vec![<V::Scalar as Zeroable>::zeroed(); words];
                let (xmit_to, recv_from) = cart.shifted_ranks(dim, nbr_proc);
                let tag = (x * nsimd + i) as i32;
                cart.send_to_recv_from(&send[nbr_lane], xmit_to, &mut recv, recv_from, tag)?;
                *slot = Some(recv);
            }
        }

        let lanes: Vec<&[V::Scalar]> = received
            .iter()
            .zip(&sources)
            .map(|(r, &src)| r.as_deref().unwrap_or(send[src].as_slice()))
            .collect();
        scatter_plane_merge(out, &lanes, dim, x, cbmask)?;
    }
    Ok(())
}
