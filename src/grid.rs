//! Cartesian lattice layout over processes and SIMD lanes.
//!
//! A [`GridLayout`] describes how a `D`-dimensional lattice of full extent
//! `fdimensions` is distributed:
//!
//! - across a processor grid (`processors`), giving each rank a block of
//!   `ldimensions` sites;
//! - across SIMD lanes (`simd_layout`), folding the block into `rdimensions`
//!   outer sites of `isites` lanes each. Lane `i` along a dimension holds the
//!   local sites `x + rd * i`.
//!
//! A red-black (checkerboarded) layout additionally halves the extent along
//! one checker dimension and stores one parity per lattice. Which full
//! coordinate a stored site stands for depends on the lattice parity and on
//! the parity of its other coordinates, see [`GridLayout::global_coor`].
//!
//! Outer sites are ordered with dimension 0 fastest (`ostride`), lanes the
//! same way (`istride`).

use crate::error::{Error, Result};
use crate::simd::{LanePattern, PatternKind};

/// Checkerboard parity of a lattice or a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    /// Even sites (mask bit `0x1`).
    #[default]
    Even,
    /// Odd sites (mask bit `0x2`).
    Odd,
}

impl Parity {
    /// Parity of the low bit of `bit`.
    pub fn from_bit(bit: usize) -> Self {
        if bit & 1 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    /// `0` for even, `1` for odd.
    pub fn bit(self) -> usize {
        match self {
            Parity::Even => 0,
            Parity::Odd => 1,
        }
    }

    /// The other parity.
    pub fn flip(self) -> Self {
        Parity::from_bit(self.bit() + 1)
    }
}

/// Set of parities a plane operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbMask(u8);

impl CbMask {
    /// Even sites only.
    pub const EVEN: CbMask = CbMask(0x1);
    /// Odd sites only.
    pub const ODD: CbMask = CbMask(0x2);
    /// Every site.
    pub const BOTH: CbMask = CbMask(0x3);

    /// Mask selecting just `parity`.
    pub fn of(parity: Parity) -> Self {
        CbMask(1 << parity.bit())
    }

    /// Raw mask bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether sites of `parity` are selected.
    #[inline]
    pub fn contains(self, parity: Parity) -> bool {
        self.0 & (1 << parity.bit()) != 0
    }

    /// Whether every site is selected.
    pub fn is_full(self) -> bool {
        self == CbMask::BOTH
    }

    /// Parity a single-parity pass runs with: odd for the odd mask, even
    /// otherwise.
    pub fn pass_parity(self) -> Parity {
        if self == CbMask::ODD {
            Parity::Odd
        } else {
            Parity::Even
        }
    }
}

/// Checkerboarding of a red-black layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerLayout {
    /// Dimension whose extent is halved.
    pub dim: usize,
    /// Dimensions contributing to site parity.
    pub mask: Vec<bool>,
}

impl CheckerLayout {
    /// Checkerboard along `dim` with every dimension contributing to parity.
    pub fn new(dim: usize, nd: usize) -> Self {
        CheckerLayout {
            dim,
            mask: vec![true; nd],
        }
    }
}

/// Distribution of a Cartesian lattice over processes and SIMD lanes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridLayout {
    fdimensions: Vec<usize>,
    gdimensions: Vec<usize>,
    ldimensions: Vec<usize>,
    rdimensions: Vec<usize>,
    simd_layout: Vec<usize>,
    processors: Vec<usize>,
    processor_coor: Vec<usize>,
    ostride: Vec<usize>,
    istride: Vec<usize>,
    slice_stride: Vec<usize>,
    slice_block: Vec<usize>,
    slice_nblock: Vec<usize>,
    osites: usize,
    isites: usize,
    checker: Option<CheckerLayout>,
}

impl GridLayout {
    /// Layout of the whole lattice on a single process.
    pub fn local(fdimensions: &[usize], simd_layout: &[usize]) -> Result<Self> {
        let ones = vec![1; fdimensions.len()];
        let zeros = vec![0; fdimensions.len()];
        Self::new(fdimensions, simd_layout, &ones, &zeros, None)
    }

    /// Full (not checkerboarded) layout.
    pub fn full(
        fdimensions: &[usize],
        simd_layout: &[usize],
        processors: &[usize],
        processor_coor: &[usize],
    ) -> Result<Self> {
        Self::new(fdimensions, simd_layout, processors, processor_coor, None)
    }

    /// Red-black layout checkerboarded along `checker.dim`.
    pub fn red_black(
        fdimensions: &[usize],
        simd_layout: &[usize],
        processors: &[usize],
        processor_coor: &[usize],
        checker: CheckerLayout,
    ) -> Result<Self> {
        Self::new(
            fdimensions,
            simd_layout,
            processors,
            processor_coor,
            Some(checker),
        )
    }

    /// Red-black counterpart of a full layout.
    pub fn to_red_black(&self, checker: CheckerLayout) -> Result<Self> {
        Self::red_black(
            &self.fdimensions,
            &self.simd_layout,
            &self.processors,
            &self.processor_coor,
            checker,
        )
    }

    /// Build and validate a layout.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidLayout`] if the extents do not divide evenly, the
    /// checkerboard is not representable, or the argument lengths differ.
    pub fn new(
        fdimensions: &[usize],
        simd_layout: &[usize],
        processors: &[usize],
        processor_coor: &[usize],
        checker: Option<CheckerLayout>,
    ) -> Result<Self> {
        let nd = fdimensions.len();
        Error::check_layout(nd > 0, || "lattice needs at least one dimension".into())?;
        Error::check_layout(
            simd_layout.len() == nd && processors.len() == nd && processor_coor.len() == nd,
            || {
                format!(
                    "dimension count mismatch: fdims {nd}, simd {}, processors {}, coor {}",
                    simd_layout.len(),
                    processors.len(),
                    processor_coor.len()
                )
            },
        )?;

        let mut gdimensions = fdimensions.to_vec();
        if let Some(ch) = &checker {
            Error::check_layout(ch.dim < nd && ch.mask.len() == nd, || {
                format!("checker dimension {} / mask {:?} for {nd} dims", ch.dim, ch.mask)
            })?;
            Error::check_layout(fdimensions[ch.dim] % 2 == 0, || {
                format!(
                    "checkerboarded extent {} in dimension {} is odd",
                    fdimensions[ch.dim], ch.dim
                )
            })?;
            gdimensions[ch.dim] /= 2;
        }

        let mut ldimensions = vec![0; nd];
        let mut rdimensions = vec![0; nd];
        for d in 0..nd {
            let (g, p, s) = (gdimensions[d], processors[d], simd_layout[d]);
            Error::check_layout(g > 0 && p > 0 && s > 0, || {
                format!("zero extent in dimension {d}")
            })?;
            Error::check_layout(processor_coor[d] < p, || {
                format!("processor coordinate {} outside {p} in dimension {d}", processor_coor[d])
            })?;
            Error::check_layout(g % p == 0, || {
                format!("extent {g} not divisible by {p} processors in dimension {d}")
            })?;
            ldimensions[d] = g / p;
            Error::check_layout(ldimensions[d] % s == 0, || {
                format!(
                    "local extent {} not divisible by {s} lanes in dimension {d}",
                    ldimensions[d]
                )
            })?;
            rdimensions[d] = ldimensions[d] / s;
        }

        if let Some(ch) = &checker {
            for d in (0..nd).filter(|&d| d != ch.dim && ch.mask[d]) {
                Error::check_layout(processors[d] == 1 || ldimensions[d] % 2 == 0, || {
                    format!("odd local extent {} in checkerboarded dimension {d}", ldimensions[d])
                })?;
                Error::check_layout(simd_layout[d] == 1 || rdimensions[d] % 2 == 0, || {
                    format!("odd reduced extent {} in checkerboarded dimension {d}", rdimensions[d])
                })?;
            }
        }

        let mut ostride = vec![1; nd];
        let mut istride = vec![1; nd];
        for d in 1..nd {
            ostride[d] = ostride[d - 1] * rdimensions[d - 1];
            istride[d] = istride[d - 1] * simd_layout[d - 1];
        }
        let osites: usize = rdimensions.iter().product();
        let isites: usize = simd_layout.iter().product();

        let slice_block = ostride.clone();
        let slice_stride: Vec<usize> = (0..nd).map(|d| ostride[d] * rdimensions[d]).collect();
        let slice_nblock: Vec<usize> = slice_stride.iter().map(|s| osites / s).collect();

        Ok(GridLayout {
            fdimensions: fdimensions.to_vec(),
            gdimensions,
            ldimensions,
            rdimensions,
            simd_layout: simd_layout.to_vec(),
            processors: processors.to_vec(),
            processor_coor: processor_coor.to_vec(),
            ostride,
            istride,
            slice_stride,
            slice_block,
            slice_nblock,
            osites,
            isites,
            checker,
        })
    }

    // ========================================================================
    // Extents
    // ========================================================================

    /// Number of dimensions.
    pub fn nd(&self) -> usize {
        self.fdimensions.len()
    }

    /// Full lattice extent.
    pub fn fdimensions(&self) -> &[usize] {
        &self.fdimensions
    }

    /// Global stored extent (checker dimension halved).
    pub fn gdimensions(&self) -> &[usize] {
        &self.gdimensions
    }

    /// Stored extent per process.
    pub fn ldimensions(&self) -> &[usize] {
        &self.ldimensions
    }

    /// Outer (reduced) extent per process.
    pub fn rdimensions(&self) -> &[usize] {
        &self.rdimensions
    }

    /// Lanes per dimension.
    pub fn simd_layout(&self) -> &[usize] {
        &self.simd_layout
    }

    /// Processor grid.
    pub fn processors(&self) -> &[usize] {
        &self.processors
    }

    /// This process's coordinate in the processor grid.
    pub fn processor_coor(&self) -> &[usize] {
        &self.processor_coor
    }

    /// Outer strides, dimension 0 fastest.
    pub fn ostride(&self) -> &[usize] {
        &self.ostride
    }

    /// Lane strides, dimension 0 fastest.
    pub fn istride(&self) -> &[usize] {
        &self.istride
    }

    /// Outer sites per process.
    pub fn osites(&self) -> usize {
        self.osites
    }

    /// Lanes per outer site.
    pub fn isites(&self) -> usize {
        self.isites
    }

    /// Stored sites per process.
    pub fn lsites(&self) -> usize {
        self.osites * self.isites
    }

    /// Distance between consecutive blocks of a plane.
    pub fn slice_stride(&self, dim: usize) -> usize {
        self.slice_stride[dim]
    }

    /// Contiguous outer sites per block of a plane.
    pub fn slice_block(&self, dim: usize) -> usize {
        self.slice_block[dim]
    }

    /// Blocks per plane.
    pub fn slice_nblock(&self, dim: usize) -> usize {
        self.slice_nblock[dim]
    }

    /// Outer sites per plane.
    pub fn plane_sites(&self, dim: usize) -> usize {
        self.slice_nblock[dim] * self.slice_block[dim]
    }

    // ========================================================================
    // Checkerboarding
    // ========================================================================

    /// Checkerboarding, `None` for a full layout.
    pub fn checker(&self) -> Option<&CheckerLayout> {
        self.checker.as_ref()
    }

    /// Whether `dim` is the checkerboarded dimension.
    pub fn checkerboarded(&self, dim: usize) -> bool {
        self.checker.as_ref().is_some_and(|c| c.dim == dim)
    }

    /// Parity contributed by the non-checker dimensions at outer site `o`.
    pub fn checkerboard_from_oindex(&self, o: usize) -> Parity {
        let Some(ch) = &self.checker else {
            return Parity::Even;
        };
        let ocoor = self.ocoor_from_oindex(o);
        let sum: usize = (0..self.nd())
            .filter(|&d| d != ch.dim && ch.mask[d])
            .map(|d| ocoor[d])
            .sum();
        Parity::from_bit(sum)
    }

    /// Stored-site shift realizing a full-coordinate `shift` along `dim`, for
    /// a lattice of parity `source` at sites whose other coordinates have
    /// parity `ocb`.
    pub fn checkerboard_shift_for_cb(
        &self,
        source: Parity,
        dim: usize,
        shift: usize,
        ocb: Parity,
    ) -> usize {
        if !self.checkerboarded(dim) {
            return shift;
        }
        let shift = shift % self.fdimensions[dim];
        if (source.bit() + ocb.bit()) & 1 == 1 {
            shift / 2
        } else {
            (shift + 1) / 2
        }
    }

    /// Parity of the result of shifting a lattice of parity `source` by
    /// `shift` along `dim`.
    pub fn checkerboard_destination(&self, source: Parity, shift: usize, dim: usize) -> Parity {
        match &self.checker {
            Some(ch) if ch.mask[dim] => {
                if (shift % self.fdimensions[dim]) & 1 == 1 {
                    source.flip()
                } else {
                    source
                }
            }
            _ => source,
        }
    }

    // ========================================================================
    // Lanes
    // ========================================================================

    /// Whether sites along `dim` are spread over several lanes.
    pub fn permute_dim(&self, dim: usize) -> bool {
        self.simd_layout[dim] > 1
    }

    /// Lane layout of `dim`.
    pub fn permute_type(&self, dim: usize) -> LanePattern {
        let lanes = self.simd_layout[dim];
        LanePattern {
            kind: if lanes == 2 {
                PatternKind::Exchange
            } else {
                PatternKind::Rotate
            },
            istride: self.istride[dim],
            lanes,
        }
    }

    // ========================================================================
    // Coordinates
    // ========================================================================

    /// Outer coordinate of outer index `o`.
    pub fn ocoor_from_oindex(&self, mut o: usize) -> Vec<usize> {
        self.rdimensions
            .iter()
            .map(|&r| {
                let c = o % r;
                o /= r;
                c
            })
            .collect()
    }

    /// Outer index of outer coordinate `ocoor`.
    pub fn oindex_from_ocoor(&self, ocoor: &[usize]) -> usize {
        ocoor.iter().zip(&self.ostride).map(|(c, s)| c * s).sum()
    }

    /// Lane coordinate of lane `lane`.
    pub fn icoor_from_iindex(&self, mut lane: usize) -> Vec<usize> {
        self.simd_layout
            .iter()
            .map(|&s| {
                let c = lane % s;
                lane /= s;
                c
            })
            .collect()
    }

    /// Lane index of lane coordinate `icoor`.
    pub fn iindex_from_icoor(&self, icoor: &[usize]) -> usize {
        icoor.iter().zip(&self.istride).map(|(c, s)| c * s).sum()
    }

    /// Full global coordinate of the site stored at outer index `o`, lane
    /// `lane`, in a lattice of parity `cb`.
    pub fn global_coor(&self, o: usize, lane: usize, cb: Parity) -> Vec<usize> {
        let ocoor = self.ocoor_from_oindex(o);
        let icoor = self.icoor_from_iindex(lane);
        let mut g: Vec<usize> = (0..self.nd())
            .map(|d| {
                self.processor_coor[d] * self.ldimensions[d]
                    + icoor[d] * self.rdimensions[d]
                    + ocoor[d]
            })
            .collect();
        if let Some(ch) = &self.checker {
            let p = self.other_parity(ch, &g);
            g[ch.dim] = 2 * g[ch.dim] + ((cb.bit() + p) & 1);
        }
        g
    }

    /// Where full global coordinate `coor` is stored on this process:
    /// `(outer index, lane, parity)`, or `None` if another process owns it.
    pub fn locate(&self, coor: &[usize]) -> Option<(usize, usize, Parity)> {
        if coor.len() != self.nd() {
            return None;
        }
        let mut g = coor.to_vec();
        let mut cb = Parity::Even;
        if let Some(ch) = &self.checker {
            cb = Parity::from_bit(coor[ch.dim] + self.other_parity(ch, coor));
            g[ch.dim] /= 2;
        }
        let mut ocoor = vec![0; self.nd()];
        let mut icoor = vec![0; self.nd()];
        for d in 0..self.nd() {
            if g[d] >= self.gdimensions[d] || g[d] / self.ldimensions[d] != self.processor_coor[d]
            {
                return None;
            }
            let l = g[d] % self.ldimensions[d];
            icoor[d] = l / self.rdimensions[d];
            ocoor[d] = l % self.rdimensions[d];
        }
        Some((
            self.oindex_from_ocoor(&ocoor),
            self.iindex_from_icoor(&icoor),
            cb,
        ))
    }

    /// Parity of the masked coordinates other than the checker dimension.
    fn other_parity(&self, ch: &CheckerLayout, coor: &[usize]) -> usize {
        (0..self.nd())
            .filter(|&d| d != ch.dim && ch.mask[d])
            .map(|d| coor[d])
            .sum::<usize>()
            & 1
    }
}
