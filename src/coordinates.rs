//! Coordinate algebra over the per-task constants of the grid.
//!
//! Everything here is pure integer (or affine f64) math over values
//! fixed at construction: local/global cell coordinates, linear storage
//! indices, global IDs and owning tasks. No I/O, no allocation, no
//! mutable state.

use crate::types::{CellIndex, GlobalId, GridError, LocalId, Result, Task};

/// Immutable per-task coordinate constants.
///
/// Built once at grid construction. A passive task (position
/// `[-1, -1, -1]`) owns no cells: its local and storage sizes are zero.
#[derive(Clone, Debug)]
pub struct Coordinates {
    /// Physical extent of one cell along each axis.
    pub physical_grid_spacing: [f64; 3],
    /// Physical position of the low corner of global cell `(0, 0, 0)`.
    pub physical_global_start: [f64; 3],
    /// Global cell extents.
    pub global_size: [CellIndex; 3],
    /// Per-axis periodicity.
    pub periodic: [bool; 3],
    /// Process grid shape.
    pub num_tasks_per_dim: [Task; 3],
    /// This task's slot in the process grid, `[-1, -1, -1]` if passive.
    pub task_position: [Task; 3],
    /// Halo width in cells.
    pub num_ghost_cells: CellIndex,
    /// Extents of the inner region owned by this task.
    pub local_size: [CellIndex; 3],
    /// Global coordinate of this task's first inner cell.
    pub local_start: [CellIndex; 3],
    /// Extents of the storage buffer (inner region plus halos,
    /// collapsed axes stay a single cell thick).
    pub storage_size: [CellIndex; 3],
}

impl Coordinates {
    /// Derive the per-task constants and validate the resulting slab.
    pub fn new(
        physical_grid_spacing: [f64; 3],
        physical_global_start: [f64; 3],
        global_size: [CellIndex; 3],
        periodic: [bool; 3],
        num_tasks_per_dim: [Task; 3],
        task_position: [Task; 3],
        num_ghost_cells: CellIndex,
    ) -> Result<Self> {
        let passive = task_position[0] < 0;

        let mut local_size = [0; 3];
        let mut local_start = [0; 3];
        let mut storage_size = [0; 3];
        for axis in 0..3 {
            if passive {
                continue;
            }
            local_size[axis] = local_size_in_dim(
                global_size[axis],
                num_tasks_per_dim[axis],
                task_position[axis],
            );
            local_start[axis] = local_start_in_dim(
                global_size[axis],
                num_tasks_per_dim[axis],
                task_position[axis],
            );
            storage_size[axis] = if global_size[axis] <= 1 {
                1
            } else {
                local_size[axis] + 2 * num_ghost_cells
            };

            if local_size[axis] < 1 {
                return Err(GridError::DomainTooSmall(format!(
                    "task {:?} owns no cells on axis {} of domain {:?} split {:?}",
                    task_position, axis, global_size, num_tasks_per_dim
                )));
            }
            if global_size[axis] > num_ghost_cells && local_size[axis] < num_ghost_cells {
                return Err(GridError::DomainTooSmall(format!(
                    "task {:?} owns a {}-cell slab on axis {}, thinner than the {}-cell halo",
                    task_position, local_size[axis], axis, num_ghost_cells
                )));
            }
        }

        Ok(Self {
            physical_grid_spacing,
            physical_global_start,
            global_size,
            periodic,
            num_tasks_per_dim,
            task_position,
            num_ghost_cells,
            local_size,
            local_start,
            storage_size,
        })
    }

    /// Global cell coordinate of the local cell `(x, y, z)`.
    pub fn local_to_global(&self, x: CellIndex, y: CellIndex, z: CellIndex) -> [CellIndex; 3] {
        [
            self.local_start[0] + x,
            self.local_start[1] + y,
            self.local_start[2] + z,
        ]
    }

    /// Local coordinate of a global cell, `None` if it lies outside
    /// this task's inner region.
    pub fn global_to_local(
        &self,
        gx: CellIndex,
        gy: CellIndex,
        gz: CellIndex,
    ) -> Option<[CellIndex; 3]> {
        let local = [
            gx - self.local_start[0],
            gy - self.local_start[1],
            gz - self.local_start[2],
        ];
        let inside = local
            .iter()
            .zip(self.local_size.iter())
            .all(|(&c, &extent)| c >= 0 && c < extent);
        inside.then_some(local)
    }

    /// Global ID of the local cell `(x, y, z)`.
    pub fn global_id_from_local_coordinates(
        &self,
        x: CellIndex,
        y: CellIndex,
        z: CellIndex,
    ) -> GlobalId {
        let global = self.local_to_global(x, y, z);
        let gx = GlobalId::from(self.global_size[0]);
        let gy = GlobalId::from(self.global_size[1]);
        GlobalId::from(global[0]) + gx * GlobalId::from(global[1]) + gx * gy * GlobalId::from(global[2])
    }

    /// Global cell coordinate encoded by a global ID.
    pub fn global_id_to_cell_coord(&self, id: GlobalId) -> [CellIndex; 3] {
        let gx = GlobalId::from(self.global_size[0]);
        let gy = GlobalId::from(self.global_size[1]);
        [
            (id % gx) as CellIndex,
            ((id / gx) % gy) as CellIndex,
            (id / (gx * gy)) as CellIndex,
        ]
    }

    /// Storage strides with collapsed axes zeroed: moving one cell
    /// along a collapsed axis must not move in storage at all.
    pub fn storage_multipliers(&self) -> [CellIndex; 3] {
        [
            CellIndex::from(self.global_size[0] > 1),
            CellIndex::from(self.global_size[1] > 1) * self.storage_size[0],
            CellIndex::from(self.global_size[2] > 1) * self.storage_size[0] * self.storage_size[1],
        ]
    }

    /// Storage index of the local cell `(x, y, z)`.
    ///
    /// Pure arithmetic; coordinates may reach into the halos. Collapsed
    /// axes contribute nothing.
    pub fn local_id_from_local_coordinates(
        &self,
        x: CellIndex,
        y: CellIndex,
        z: CellIndex,
    ) -> LocalId {
        let multipliers = self.storage_multipliers();
        [x, y, z]
            .iter()
            .zip(multipliers.iter())
            .zip(self.global_size.iter())
            .map(|((&c, &stride), &global)| {
                let halo = if global > 1 { self.num_ghost_cells } else { 0 };
                LocalId::from((halo + c).max(0)) * LocalId::from(stride)
            })
            .sum()
    }

    /// Storage index of the cell `(x, y, z)`, halos included, checked
    /// against the storage range and against the global domain.
    ///
    /// Returns `None` when the coordinate lies outside the storage
    /// range, is nonzero on a collapsed axis, or reaches past a
    /// non-periodic global edge (there is no cell there).
    pub fn local_id_from_cell_coordinates(
        &self,
        x: CellIndex,
        y: CellIndex,
        z: CellIndex,
    ) -> Option<LocalId> {
        if !self.cell_indices_are_within_bounds(x, y, z) {
            return None;
        }
        let exists = [x, y, z].iter().enumerate().all(|(axis, &c)| {
            let global = self.local_start[axis] + c;
            self.periodic[axis] || (global >= 0 && global < self.global_size[axis])
        });
        exists.then(|| self.local_id_from_local_coordinates(x, y, z))
    }

    /// Whether a storage index addresses a cell of this task's buffer.
    pub fn local_id_in_bounds(&self, id: LocalId) -> bool {
        let cells: LocalId = self
            .storage_size
            .iter()
            .map(|&extent| LocalId::from(extent))
            .product();
        id >= 0 && id < cells
    }

    /// Whether `(x, y, z)` lies within the storage range of this task:
    /// inner region plus halos, exactly 0 on collapsed axes.
    pub fn cell_indices_are_within_bounds(
        &self,
        x: CellIndex,
        y: CellIndex,
        z: CellIndex,
    ) -> bool {
        [x, y, z].iter().enumerate().all(|(axis, &c)| {
            if self.global_size[axis] <= 1 {
                c == 0
            } else {
                c >= -self.num_ghost_cells && c < self.local_size[axis] + self.num_ghost_cells
            }
        })
    }

    /// Process-grid slot owning the cell with the given global ID.
    pub fn global_id_to_task_pos(&self, id: GlobalId) -> [Task; 3] {
        let cell = self.global_id_to_cell_coord(id);
        let mut task_pos = [0; 3];
        for axis in 0..3 {
            let per_task = self.global_size[axis] / self.num_tasks_per_dim[axis];
            let remainder = self.global_size[axis] % self.num_tasks_per_dim[axis];
            // The first `remainder` tasks own one extra cell each.
            task_pos[axis] = if cell[axis] < remainder * (per_task + 1) {
                cell[axis] / (per_task + 1)
            } else {
                remainder + (cell[axis] - remainder * (per_task + 1)) / per_task
            };
        }
        task_pos
    }

    /// Storage index the owning task uses for the cell with the given
    /// global ID.
    pub fn local_id_on_owner_for_global_id(&self, id: GlobalId) -> LocalId {
        let cell = self.global_id_to_cell_coord(id);
        let owner = self.global_id_to_task_pos(id);
        let mut index: LocalId = 0;
        let mut stride: LocalId = 1;
        for axis in 0..3 {
            if self.global_size[axis] <= 1 {
                continue;
            }
            let start = local_start_in_dim(
                self.global_size[axis],
                self.num_tasks_per_dim[axis],
                owner[axis],
            );
            let storage = local_size_in_dim(
                self.global_size[axis],
                self.num_tasks_per_dim[axis],
                owner[axis],
            ) + 2 * self.num_ghost_cells;
            index += stride * LocalId::from(cell[axis] - start + self.num_ghost_cells);
            stride *= LocalId::from(storage);
        }
        index
    }

    /// Physical position of the low corner of the local cell `(x, y, z)`.
    pub fn get_physical_coords(&self, x: CellIndex, y: CellIndex, z: CellIndex) -> [f64; 3] {
        let global = self.local_to_global(x, y, z);
        let mut coords = [0.0; 3];
        for axis in 0..3 {
            coords[axis] = self.physical_global_start[axis]
                + f64::from(global[axis]) * self.physical_grid_spacing[axis];
        }
        coords
    }

    /// Global cell containing the physical position.
    pub fn physical_to_global(&self, position: [f64; 3]) -> [CellIndex; 3] {
        let fractional = self.physical_to_fractional_global(position);
        [
            fractional[0].floor() as CellIndex,
            fractional[1].floor() as CellIndex,
            fractional[2].floor() as CellIndex,
        ]
    }

    /// Physical position in units of cells from the global origin.
    pub fn physical_to_fractional_global(&self, position: [f64; 3]) -> [f64; 3] {
        let mut fractional = [0.0; 3];
        for axis in 0..3 {
            fractional[axis] = (position[axis] - self.physical_global_start[axis])
                / self.physical_grid_spacing[axis];
        }
        fractional
    }
}

/// Slab thickness of the task at `task_position` along one axis, by the
/// unbalanced remainder rule: the first `global % tasks` slots own one
/// extra cell.
pub fn local_size_in_dim(
    global_cells: CellIndex,
    num_tasks: Task,
    task_position: Task,
) -> CellIndex {
    let per_task = global_cells / num_tasks;
    let remainder = global_cells % num_tasks;
    if task_position < remainder {
        per_task + 1
    } else {
        per_task
    }
}

/// First global cell of the task at `task_position` along one axis.
pub fn local_start_in_dim(
    global_cells: CellIndex,
    num_tasks: Task,
    task_position: Task,
) -> CellIndex {
    let per_task = global_cells / num_tasks;
    let remainder = global_cells % num_tasks;
    if task_position < remainder {
        task_position * (per_task + 1)
    } else {
        task_position * per_task + remainder
    }
}
