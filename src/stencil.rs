//! Branch-free 27-point stencil access into the storage buffer.
//!
//! [`StencilConstants`] packs everything the accessor needs into five
//! values derived once per grid; [`CellStencil`] is a throwaway view of
//! a single centre cell that turns any neighbour triplet into a storage
//! index with a chain of integer multiply-adds. Out-of-slab neighbours
//! are handled without branching: a periodic self-wrap adds a
//! precomputed shift, a missing neighbour falls back to the centre
//! cell's own index.

use itertools::iproduct;

use crate::bitmask::BitMask32;
use crate::coordinates::Coordinates;
use crate::types::CellIndex;

/// Number of cells in the 3x3x3 neighbourhood, self included.
pub const NUM_NEIGHBOURS: usize = 27;

/// Slot of the centre cell in the linear neighbour encoding.
pub const CENTER_NEIGHBOUR: u32 = 13;

/// Linear neighbour slot of an offset triplet from `{-1, 0, 1}^3`.
pub fn xyz_to_linear(x: i32, y: i32, z: i32) -> u32 {
    ((x + 1) * 9 + (y + 1) * 3 + (z + 1)) as u32
}

/// X component of the offset triplet encoded in neighbour slot `i`.
pub fn linear_to_x(i: u32) -> i32 {
    i as i32 / 9 - 1
}

/// Y component of the offset triplet encoded in neighbour slot `i`.
pub fn linear_to_y(i: u32) -> i32 {
    (i as i32 % 9) / 3 - 1
}

/// Z component of the offset triplet encoded in neighbour slot `i`.
pub fn linear_to_z(i: u32) -> i32 {
    i as i32 % 3 - 1
}

/// Per-grid constants feeding the stencil accessor.
#[derive(Clone, Copy, Debug, Default)]
pub struct StencilConstants {
    /// Inner extents of the local slab.
    pub limits: [CellIndex; 3],
    /// Storage strides, zeroed on collapsed axes.
    pub multipliers: [CellIndex; 3],
    /// Storage index of local cell `(0, 0, 0)`.
    pub offset: CellIndex,
    /// Bit `n` set iff neighbour `n` is this task itself (periodic
    /// wrap onto the own slab). Bit 13 is never set.
    pub shift: BitMask32,
    /// Bit `n` set iff neighbour `n` does not exist (open boundary).
    /// Bit 13 is never set.
    pub fallback_to_center: BitMask32,
}

impl StencilConstants {
    /// Assemble the constants from their parts.
    pub fn new(
        limits: [CellIndex; 3],
        multipliers: [CellIndex; 3],
        offset: CellIndex,
        shift: BitMask32,
        fallback_to_center: BitMask32,
    ) -> Self {
        Self {
            limits,
            multipliers,
            offset,
            shift,
            fallback_to_center,
        }
    }

    /// Derive the constants for a task from its coordinates and
    /// neighbour table.
    pub fn from_coordinates(
        coordinates: &Coordinates,
        shift: BitMask32,
        fallback_to_center: BitMask32,
    ) -> Self {
        let multipliers = coordinates.storage_multipliers();
        let offset = coordinates.num_ghost_cells * multipliers.iter().sum::<CellIndex>();
        Self::new(
            coordinates.local_size,
            multipliers,
            offset,
            shift,
            fallback_to_center,
        )
    }

    /// Per-axis position of a cell relative to the slab: -1 below,
    /// 0 inside, +1 above.
    pub fn locality_multipliers(&self, values: [CellIndex; 3]) -> [i32; 3] {
        [
            i32::from(values[0] >= self.limits[0]) - i32::from(values[0] < 0),
            i32::from(values[1] >= self.limits[1]) - i32::from(values[1] < 0),
            i32::from(values[2] >= self.limits[2]) - i32::from(values[2] < 0),
        ]
    }

    /// Neighbour slot of a locality triple.
    pub fn neighbour_index(&self, locality: [i32; 3]) -> u32 {
        (13 + locality[0] * 9 + locality[1] * 3 + locality[2]) as u32
    }

    /// Wrap-around offsets for a locality triple: a cell above the slab
    /// shifts down by the slab extent and vice versa.
    pub fn shift_offsets(&self, locality: [i32; 3]) -> [CellIndex; 3] {
        [
            -locality[0] * self.limits[0],
            -locality[1] * self.limits[1],
            -locality[2] * self.limits[2],
        ]
    }

    /// Storage index of a (resolved) local cell coordinate.
    pub fn apply_multipliers_and_offset(&self, values: [CellIndex; 3]) -> usize {
        (i64::from(self.offset)
            + i64::from(self.multipliers[0]) * i64::from(values[0])
            + i64::from(self.multipliers[1]) * i64::from(values[1])
            + i64::from(self.multipliers[2]) * i64::from(values[2])) as usize
    }
}

/// Lightweight accessor enumerating the 27 neighbour storage indices of
/// one centre cell. Copy-by-value; build one per cell visit.
#[derive(Clone, Copy, Debug)]
pub struct CellStencil {
    center_cell: [CellIndex; 3],
    constants: StencilConstants,
}

impl CellStencil {
    /// View the neighbourhood of the local cell `center_cell`.
    pub fn new(center_cell: [CellIndex; 3], constants: StencilConstants) -> Self {
        Self {
            center_cell,
            constants,
        }
    }

    /// Storage index of the cell at the given local coordinate,
    /// resolving out-of-slab coordinates by periodic wrap or fallback
    /// to the centre cell. Free of data-dependent branches.
    pub fn calculate_index(&self, mut cell_index: [CellIndex; 3]) -> usize {
        let constants = &self.constants;
        let locality = constants.locality_multipliers(cell_index); // -1, 0, 1
        let ni = constants.neighbour_index(locality); // 0..27
        let fallback = constants.fallback_to_center.get(ni); // 0, 1
        let valid = 1 - fallback;
        let add_shift = constants.shift.get(ni); // 0, 1
        let offsets = constants.shift_offsets(locality); // -limits, 0, limits

        // Valid coordinates keep their value, shifted if the slab wraps
        // onto itself in that direction; invalid ones collapse onto the
        // centre cell.
        cell_index[0] = valid * (cell_index[0] + add_shift * offsets[0]) + fallback * self.center_cell[0];
        cell_index[1] = valid * (cell_index[1] + add_shift * offsets[1]) + fallback * self.center_cell[1];
        cell_index[2] = valid * (cell_index[2] + add_shift * offsets[2]) + fallback * self.center_cell[2];

        constants.apply_multipliers_and_offset(cell_index)
    }

    /// Whether the cell displaced by `(dx, dy, dz)` from the centre
    /// exists (reads of nonexistent cells fall back to the centre).
    pub fn cell_exists(&self, dx: CellIndex, dy: CellIndex, dz: CellIndex) -> bool {
        let displaced = [
            self.center_cell[0] + dx,
            self.center_cell[1] + dy,
            self.center_cell[2] + dz,
        ];
        let locality = self.constants.locality_multipliers(displaced);
        let ni = self.constants.neighbour_index(locality);
        self.constants.fallback_to_center.get(ni) == 0
    }

    /// All 27 neighbour indices, x fastest, `(-1, -1, -1)` first.
    pub fn indices(&self) -> [usize; NUM_NEIGHBOURS] {
        let mut out = [0; NUM_NEIGHBOURS];
        for (slot, (dz, dy, dx)) in iproduct!(-1..=1, -1..=1, -1..=1).enumerate() {
            out[slot] = self.index_at(dx, dy, dz);
        }
        out
    }

    fn index_at(&self, dx: CellIndex, dy: CellIndex, dz: CellIndex) -> usize {
        self.calculate_index([
            self.center_cell[0] + dx,
            self.center_cell[1] + dy,
            self.center_cell[2] + dz,
        ])
    }

    /// Storage index of the centre cell.
    pub fn center(&self) -> usize {
        self.calculate_index(self.center_cell)
    }

    // Named neighbours. Right-handed convention: x runs left to right,
    // y down to up, z far to near.

    /// Neighbour at `(-1, 0, 0)`.
    pub fn left(&self) -> usize {
        self.index_at(-1, 0, 0)
    }
    /// Neighbour at `(1, 0, 0)`.
    pub fn right(&self) -> usize {
        self.index_at(1, 0, 0)
    }
    /// Neighbour at `(0, -1, 0)`.
    pub fn down(&self) -> usize {
        self.index_at(0, -1, 0)
    }
    /// Neighbour at `(0, 1, 0)`.
    pub fn up(&self) -> usize {
        self.index_at(0, 1, 0)
    }
    /// Neighbour at `(0, 0, -1)`.
    pub fn far(&self) -> usize {
        self.index_at(0, 0, -1)
    }
    /// Neighbour at `(0, 0, 1)`.
    pub fn near(&self) -> usize {
        self.index_at(0, 0, 1)
    }
    /// Neighbour at `(0, 1, 1)`.
    pub fn upnear(&self) -> usize {
        self.index_at(0, 1, 1)
    }
    /// Neighbour at `(0, 1, -1)`.
    pub fn upfar(&self) -> usize {
        self.index_at(0, 1, -1)
    }
    /// Neighbour at `(0, -1, 1)`.
    pub fn downnear(&self) -> usize {
        self.index_at(0, -1, 1)
    }
    /// Neighbour at `(0, -1, -1)`.
    pub fn downfar(&self) -> usize {
        self.index_at(0, -1, -1)
    }
    /// Neighbour at `(1, 0, 1)`.
    pub fn rightnear(&self) -> usize {
        self.index_at(1, 0, 1)
    }
    /// Neighbour at `(1, 0, -1)`.
    pub fn rightfar(&self) -> usize {
        self.index_at(1, 0, -1)
    }
    /// Neighbour at `(1, 1, 0)`.
    pub fn rightup(&self) -> usize {
        self.index_at(1, 1, 0)
    }
    /// Neighbour at `(1, 1, 1)`.
    pub fn rightupnear(&self) -> usize {
        self.index_at(1, 1, 1)
    }
    /// Neighbour at `(1, 1, -1)`.
    pub fn rightupfar(&self) -> usize {
        self.index_at(1, 1, -1)
    }
    /// Neighbour at `(1, -1, 0)`.
    pub fn rightdown(&self) -> usize {
        self.index_at(1, -1, 0)
    }
    /// Neighbour at `(1, -1, 1)`.
    pub fn rightdownnear(&self) -> usize {
        self.index_at(1, -1, 1)
    }
    /// Neighbour at `(1, -1, -1)`.
    pub fn rightdownfar(&self) -> usize {
        self.index_at(1, -1, -1)
    }
    /// Neighbour at `(-1, 0, 1)`.
    pub fn leftnear(&self) -> usize {
        self.index_at(-1, 0, 1)
    }
    /// Neighbour at `(-1, 0, -1)`.
    pub fn leftfar(&self) -> usize {
        self.index_at(-1, 0, -1)
    }
    /// Neighbour at `(-1, 1, 0)`.
    pub fn leftup(&self) -> usize {
        self.index_at(-1, 1, 0)
    }
    /// Neighbour at `(-1, 1, 1)`.
    pub fn leftupnear(&self) -> usize {
        self.index_at(-1, 1, 1)
    }
    /// Neighbour at `(-1, 1, -1)`.
    pub fn leftupfar(&self) -> usize {
        self.index_at(-1, 1, -1)
    }
    /// Neighbour at `(-1, -1, 0)`.
    pub fn leftdown(&self) -> usize {
        self.index_at(-1, -1, 0)
    }
    /// Neighbour at `(-1, -1, 1)`.
    pub fn leftdownnear(&self) -> usize {
        self.index_at(-1, -1, 1)
    }
    /// Neighbour at `(-1, -1, -1)`.
    pub fn leftdownfar(&self) -> usize {
        self.index_at(-1, -1, -1)
    }
}
