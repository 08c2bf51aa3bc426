//! The grid facade tying decomposition, coordinates, stencils and the
//! halo exchange together around one owned cell buffer.

use std::env;

use log::{debug, warn};
use mpi::collective::Operation;
use mpi::request::RequestCollection;
use mpi::topology::CartesianCommunicator;
use mpi::traits::*;
use mpi::Count;
use rayon::prelude::*;

use crate::coordinates::Coordinates;
use crate::decomposition::compute_domain_decomposition;
use crate::halo::{self, HaloRegion};
use crate::stencil::{CellStencil, StencilConstants, NUM_NEIGHBOURS};
use crate::topology;
use crate::types::{CellIndex, GlobalId, GridError, LocalId, Result, Task};

/// Environment variable capping the number of worker processes. When it
/// holds a positive integer smaller than the parent communicator size,
/// the remaining processes become passive ranks.
pub const WORKER_COUNT_ENV: &str = "CARTGRID_PROCS";

const TAG_SCATTER_IDS: i32 = 101;
const TAG_SCATTER_VALUES: i32 = 102;
const TAG_GATHER_IDS: i32 = 103;
const TAG_GATHER_VALUES: i32 = 104;

/// A distributed Cartesian grid of cells of type `T` with ghost-cell
/// halos.
///
/// Worker processes each own one rectangular slab of the global domain;
/// a process left out of the worker set is a passive rank: it owns no
/// cells, returns immediately from the exchange and short-circuits
/// collectives. All layout state is fixed at construction; the cell
/// buffer is the only thing that mutates afterwards.
pub struct CartGrid<T> {
    num_procs: Task,
    comm: Option<CartesianCommunicator>,
    rank: Task,
    coordinates: Coordinates,
    tasks: Vec<Task>,
    neighbour_index_to_rank: [Option<Task>; NUM_NEIGHBOURS],
    neighbour_rank_to_index: Vec<Option<u8>>,
    stencil_constants: StencilConstants,
    send_regions: [Option<HaloRegion>; NUM_NEIGHBOURS],
    recv_regions: [Option<HaloRegion>; NUM_NEIGHBOURS],
    data: Vec<T>,
}

impl<T: Clone + Default> CartGrid<T> {
    /// Build a grid over `global_size` cells, decomposed across
    /// `num_procs` workers drawn from `parent_comm`.
    ///
    /// `decomposition` overrides the automatic choice of process grid;
    /// its product must equal the worker count. Collective: every
    /// process of `parent_comm` must call this.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        global_size: [CellIndex; 3],
        parent_comm: &impl Communicator,
        num_procs: Task,
        periodic: [bool; 3],
        physical_grid_spacing: [f64; 3],
        physical_global_start: [f64; 3],
        num_ghost_cells: CellIndex,
        decomposition: Option<[Task; 3]>,
    ) -> Result<Self> {
        let num_procs = capped_worker_count(parent_comm, num_procs)?;
        let num_tasks_per_dim =
            compute_domain_decomposition(global_size, num_procs, num_ghost_cells, decomposition)?;

        let comm = topology::create_cartesian_communicator(
            parent_comm,
            num_tasks_per_dim,
            periodic,
            num_procs,
        )?;
        let rank = topology::cartesian_rank(comm.as_ref());
        let task_position = topology::task_position(comm.as_ref());

        let coordinates = Coordinates::new(
            physical_grid_spacing,
            physical_global_start,
            global_size,
            periodic,
            num_tasks_per_dim,
            task_position,
            num_ghost_cells,
        )?;

        let tasks = topology::task_pos_to_task(parent_comm, comm.as_ref(), num_tasks_per_dim);

        let neighbour_index_to_rank = topology::map_neighbour_index_to_rank(
            task_position,
            num_tasks_per_dim,
            periodic,
            rank,
            |position| tasks[topology::task_table_index(num_tasks_per_dim, position)],
        );
        let neighbour_rank_to_index =
            topology::map_neighbour_rank_to_index(&neighbour_index_to_rank, num_procs);

        let stencil_constants = StencilConstants::from_coordinates(
            &coordinates,
            topology::neighbour_bit_mask(rank, &neighbour_index_to_rank),
            topology::null_neighbour_bit_mask(&neighbour_index_to_rank),
        );

        let (send_regions, recv_regions, data) = if rank == -1 {
            ([None; NUM_NEIGHBOURS], [None; NUM_NEIGHBOURS], Vec::new())
        } else {
            let storage_cells = coordinates.storage_size.iter().product::<CellIndex>() as usize;
            (
                halo::send_regions(
                    coordinates.storage_size,
                    coordinates.local_size,
                    num_ghost_cells,
                ),
                halo::recv_regions(
                    coordinates.storage_size,
                    coordinates.local_size,
                    num_ghost_cells,
                ),
                vec![T::default(); storage_cells],
            )
        };

        Ok(Self {
            num_procs,
            comm,
            rank,
            coordinates,
            tasks,
            neighbour_index_to_rank,
            neighbour_rank_to_index,
            stencil_constants,
            send_regions,
            recv_regions,
            data,
        })
    }
}

impl<T> CartGrid<T> {
    /// The cell buffer: inner cells and halos, row-major, x fastest.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable view of the cell buffer.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Cell at the local coordinate, halos included.
    ///
    /// Returns `None` for coordinates outside the storage range or
    /// beyond an open boundary. A periodic wrap onto this task's own
    /// slab resolves to the real cell, not the halo copy.
    pub fn get(&self, x: CellIndex, y: CellIndex, z: CellIndex) -> Option<&T> {
        self.resolve_storage_index(x, y, z).map(|i| &self.data[i])
    }

    /// Mutable variant of [`CartGrid::get`].
    pub fn get_mut(&mut self, x: CellIndex, y: CellIndex, z: CellIndex) -> Option<&mut T> {
        self.resolve_storage_index(x, y, z)
            .map(move |i| &mut self.data[i])
    }

    /// Cell at a raw storage index, range-checked.
    pub fn get_by_local_id(&self, id: LocalId) -> Option<&T> {
        if id < 0 || id as usize >= self.data.len() {
            debug!("local id {} outside storage of {} cells", id, self.data.len());
            return None;
        }
        Some(&self.data[id as usize])
    }

    /// Mutable variant of [`CartGrid::get_by_local_id`].
    pub fn get_by_local_id_mut(&mut self, id: LocalId) -> Option<&mut T> {
        if id < 0 || id as usize >= self.data.len() {
            debug!("local id {} outside storage of {} cells", id, self.data.len());
            return None;
        }
        Some(&mut self.data[id as usize])
    }

    fn resolve_storage_index(&self, x: CellIndex, y: CellIndex, z: CellIndex) -> Option<usize> {
        if self.rank == -1 {
            return None;
        }
        if !self.coordinates.cell_indices_are_within_bounds(x, y, z) {
            debug!(
                "cell ({}, {}, {}) outside the storage range of task {:?}",
                x, y, z, self.coordinates.task_position
            );
            return None;
        }
        let constants = &self.stencil_constants;
        let locality = constants.locality_multipliers([x, y, z]);
        let slot = constants.neighbour_index(locality);
        if constants.fallback_to_center.get(slot) == 1 {
            debug!(
                "cell ({}, {}, {}) lies beyond an open boundary of task {:?}",
                x, y, z, self.coordinates.task_position
            );
            return None;
        }
        let mut cell = [x, y, z];
        if constants.shift.get(slot) == 1 {
            let offsets = constants.shift_offsets(locality);
            for axis in 0..3 {
                cell[axis] += offsets[axis];
            }
        }
        Some(constants.apply_multipliers_and_offset(cell))
    }

    /// Stencil view of the 27-cell neighbourhood of `(x, y, z)`.
    pub fn make_stencil(&self, x: CellIndex, y: CellIndex, z: CellIndex) -> CellStencil {
        CellStencil::new([x, y, z], self.stencil_constants)
    }

    /// Rank owning the cell with the given global ID.
    pub fn get_task_for_global_id(&self, id: GlobalId) -> Task {
        let task_pos = self.coordinates.global_id_to_task_pos(id);
        self.tasks[topology::task_table_index(self.coordinates.num_tasks_per_dim, task_pos)]
    }

    /// Data-parallel sweep over the local inner cells in row-major
    /// order. The body receives each cell's stencil and the cell
    /// buffer, and returns the cell's new value; results are written
    /// back after the whole sweep, so the body always reads the
    /// pre-sweep state. No cross-cell ordering is promised.
    pub fn parallel_for<F>(&mut self, body: F)
    where
        T: Send + Sync,
        F: Fn(CellStencil, &[T]) -> T + Sync,
    {
        let [lx, ly, lz] = self.coordinates.local_size;
        let cells = (lx * ly * lz) as usize;
        if cells == 0 {
            return;
        }
        let constants = self.stencil_constants;
        let data = &self.data;
        let updated: Vec<(usize, T)> = (0..cells)
            .into_par_iter()
            .map(|m| {
                let m = m as CellIndex;
                let x = m % lx;
                let y = (m / lx) % ly;
                let z = m / (lx * ly);
                let stencil = CellStencil::new([x, y, z], constants);
                let index = stencil.center();
                (index, body(stencil, data))
            })
            .collect();
        for (index, value) in updated {
            self.data[index] = value;
        }
    }

    // ---- getters over the immutable construction state ----

    /// Extents of this task's inner region.
    pub fn local_size(&self) -> [CellIndex; 3] {
        self.coordinates.local_size
    }

    /// Global coordinate of this task's first inner cell.
    pub fn local_start(&self) -> [CellIndex; 3] {
        self.coordinates.local_start
    }

    /// Global cell extents.
    pub fn global_size(&self) -> [CellIndex; 3] {
        self.coordinates.global_size
    }

    /// Extents of the storage buffer, halos included.
    pub fn storage_size(&self) -> [CellIndex; 3] {
        self.coordinates.storage_size
    }

    /// This process' rank among the workers, -1 if passive.
    pub fn rank(&self) -> Task {
        self.rank
    }

    /// Number of worker processes in the grid.
    pub fn num_worker_ranks(&self) -> Task {
        self.num_procs
    }

    /// Per-axis periodicity.
    pub fn periodic(&self) -> [bool; 3] {
        self.coordinates.periodic
    }

    /// Shape of the process grid.
    pub fn decomposition(&self) -> [Task; 3] {
        self.coordinates.num_tasks_per_dim
    }

    /// Physical extent of one cell.
    pub fn grid_spacing(&self) -> [f64; 3] {
        self.coordinates.physical_grid_spacing
    }

    /// Physical position of the global origin cell's low corner.
    pub fn physical_global_start(&self) -> [f64; 3] {
        self.coordinates.physical_global_start
    }

    /// Halo width in cells.
    pub fn num_ghost_cells(&self) -> CellIndex {
        self.coordinates.num_ghost_cells
    }

    /// The coordinate algebra of this task.
    pub fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    /// Stencil constants shared by all of this task's stencils.
    pub fn stencil_constants(&self) -> StencilConstants {
        self.stencil_constants
    }

    /// Neighbour slot at which `rank` appears, if it is a direct
    /// neighbour.
    pub fn neighbour_index_for_rank(&self, rank: Task) -> Option<u8> {
        if rank < 0 {
            return None;
        }
        self.neighbour_rank_to_index
            .get(rank as usize)
            .copied()
            .flatten()
    }

    /// Reduction over all workers, element-wise across the buffers.
    ///
    /// A passive rank copies `sendbuf` to `recvbuf` and reports itself
    /// with the distinguished [`GridError::PassiveRank`] status.
    pub fn all_reduce<V, O>(&self, sendbuf: &[V], recvbuf: &mut [V], op: O) -> Result<()>
    where
        V: Equivalence + Clone,
        O: Operation,
    {
        match &self.comm {
            Some(comm) => {
                comm.all_reduce_into(sendbuf, recvbuf, op);
                Ok(())
            }
            None => {
                recvbuf.clone_from_slice(sendbuf);
                Err(GridError::PassiveRank)
            }
        }
    }
}

impl<T: Equivalence + Clone + Default> CartGrid<T> {
    /// Fill every halo cell from its owning neighbour. Collective over
    /// the workers; passive ranks return immediately.
    ///
    /// All writes to local cells issued before the call are visible to
    /// the neighbours' halos after it returns.
    pub fn update_ghost_cells(&mut self) -> Result<()> {
        let Some(comm) = &self.comm else {
            return Ok(());
        };
        halo::exchange(
            comm,
            self.rank,
            &self.neighbour_index_to_rank,
            &self.send_regions,
            &self.recv_regions,
            self.coordinates.storage_size,
            &mut self.data,
        )
    }

    /// Route externally produced cell values to their owning tasks and
    /// store each at its cell. Collective over the workers; a passive
    /// rank must pass an empty slice.
    pub fn scatter_cells(&mut self, cells: &[(GlobalId, T)]) -> Result<()> {
        self.check_global_ids(cells.iter().map(|(id, _)| *id))?;
        let Some(comm) = &self.comm else {
            return if cells.is_empty() {
                Ok(())
            } else {
                Err(GridError::PassiveRank)
            };
        };

        let size = comm.size() as usize;
        let mut ids_for: Vec<Vec<GlobalId>> = vec![Vec::new(); size];
        let mut values_for: Vec<Vec<T>> = vec![Vec::new(); size];
        for (id, value) in cells {
            let owner = self.get_task_for_global_id(*id) as usize;
            ids_for[owner].push(*id);
            values_for[owner].push(value.clone());
        }

        let incoming_counts = exchange_counts(comm, &ids_for);
        let incoming_ids = exchange_sparse(comm, &ids_for, &incoming_counts, TAG_SCATTER_IDS);
        let incoming_values =
            exchange_sparse(comm, &values_for, &incoming_counts, TAG_SCATTER_VALUES);

        for (ids, values) in incoming_ids.iter().zip(incoming_values.into_iter()) {
            for (&id, value) in ids.iter().zip(values.into_iter()) {
                let index = self.owned_storage_index(id)?;
                self.data[index] = value;
            }
        }
        Ok(())
    }

    /// Fetch the cells with the given global IDs from their owning
    /// tasks, returned in request order. Collective over the workers; a
    /// passive rank must pass an empty slice.
    pub fn gather_cells(&self, ids: &[GlobalId]) -> Result<Vec<T>> {
        self.check_global_ids(ids.iter().copied())?;
        let Some(comm) = &self.comm else {
            return if ids.is_empty() {
                Ok(Vec::new())
            } else {
                Err(GridError::PassiveRank)
            };
        };

        let size = comm.size() as usize;
        let mut ids_for: Vec<Vec<GlobalId>> = vec![Vec::new(); size];
        let mut positions_for: Vec<Vec<usize>> = vec![Vec::new(); size];
        for (position, &id) in ids.iter().enumerate() {
            let owner = self.get_task_for_global_id(id) as usize;
            ids_for[owner].push(id);
            positions_for[owner].push(position);
        }

        let incoming_counts = exchange_counts(comm, &ids_for);
        let incoming_requests = exchange_sparse(comm, &ids_for, &incoming_counts, TAG_GATHER_IDS);

        let mut replies_for: Vec<Vec<T>> = Vec::with_capacity(size);
        for requested in &incoming_requests {
            let mut reply = Vec::with_capacity(requested.len());
            for &id in requested {
                let index = self.owned_storage_index(id)?;
                reply.push(self.data[index].clone());
            }
            replies_for.push(reply);
        }

        // Replies mirror requests, so the counts flow back along the
        // same lanes.
        let expected_counts: Vec<Count> =
            ids_for.iter().map(|bucket| bucket.len() as Count).collect();
        let incoming_values =
            exchange_sparse(comm, &replies_for, &expected_counts, TAG_GATHER_VALUES);

        let mut out = vec![T::default(); ids.len()];
        for (positions, values) in positions_for.iter().zip(incoming_values.into_iter()) {
            for (&position, value) in positions.iter().zip(values.into_iter()) {
                out[position] = value;
            }
        }
        Ok(out)
    }

    fn check_global_ids(&self, ids: impl Iterator<Item = GlobalId>) -> Result<()> {
        let total: GlobalId = self
            .coordinates
            .global_size
            .iter()
            .map(|&g| GlobalId::from(g))
            .product();
        for id in ids {
            if id < 0 || id >= total {
                return Err(GridError::OutOfBoundsAccess(format!(
                    "global id {} outside domain of {} cells",
                    id, total
                )));
            }
        }
        Ok(())
    }

    /// Storage index of a global ID owned by this task.
    fn owned_storage_index(&self, id: GlobalId) -> Result<usize> {
        let cell = self.coordinates.global_id_to_cell_coord(id);
        let local = self
            .coordinates
            .global_to_local(cell[0], cell[1], cell[2])
            .ok_or_else(|| {
                GridError::OutOfBoundsAccess(format!(
                    "global id {} routed to rank {} which does not own it",
                    id, self.rank
                ))
            })?;
        Ok(self
            .coordinates
            .local_id_from_local_coordinates(local[0], local[1], local[2]) as usize)
    }
}

/// Resolve the worker count against the parent communicator size and
/// the [`WORKER_COUNT_ENV`] cap.
fn capped_worker_count(parent_comm: &impl Communicator, requested: Task) -> Result<Task> {
    let parent_size = parent_comm.size();
    if requested < 1 || requested > parent_size {
        return Err(GridError::CommunicatorFailure {
            rank: parent_comm.rank(),
            primitive: "split_by_color",
            context: format!(
                "requested {} workers from a communicator of {}",
                requested, parent_size
            ),
        });
    }
    let mut workers = requested;
    if let Ok(value) = env::var(WORKER_COUNT_ENV) {
        match value.parse::<Task>() {
            Ok(cap) if cap > 0 && cap < parent_size => {
                if cap < workers {
                    warn!(
                        "{}={} caps the grid to {} of {} requested workers",
                        WORKER_COUNT_ENV, value, cap, workers
                    );
                    workers = cap;
                }
            }
            _ => warn!("ignoring invalid {} value {:?}", WORKER_COUNT_ENV, value),
        }
    }
    Ok(workers)
}

/// Tell every rank how many elements to expect from each peer.
fn exchange_counts<V>(comm: &CartesianCommunicator, outgoing: &[Vec<V>]) -> Vec<Count> {
    let send_counts: Vec<Count> = outgoing.iter().map(|bucket| bucket.len() as Count).collect();
    let mut recv_counts = vec![0 as Count; outgoing.len()];
    comm.all_to_all_into(&send_counts[..], &mut recv_counts[..]);
    recv_counts
}

/// Sparse point-to-point exchange: send each non-empty bucket to its
/// rank, receive the announced counts, self-delivery short-circuited.
fn exchange_sparse<V: Equivalence + Clone + Default>(
    comm: &CartesianCommunicator,
    outgoing: &[Vec<V>],
    incoming_counts: &[Count],
    tag: i32,
) -> Vec<Vec<V>> {
    let rank = comm.rank() as usize;
    let mut incoming: Vec<Vec<V>> = incoming_counts
        .iter()
        .map(|&count| vec![V::default(); count as usize])
        .collect();
    incoming[rank] = outgoing[rank].clone();

    let active_receives = incoming
        .iter()
        .enumerate()
        .filter(|(peer, bucket)| *peer != rank && !bucket.is_empty())
        .count();
    let active_sends = outgoing
        .iter()
        .enumerate()
        .filter(|(peer, bucket)| *peer != rank && !bucket.is_empty())
        .count();
    let request_count = active_receives + active_sends;
    if request_count == 0 {
        return incoming;
    }

    mpi::request::multiple_scope(
        request_count,
        |scope, requests: &mut RequestCollection<[V]>| {
            for (peer, buffer) in incoming.iter_mut().enumerate() {
                if peer == rank || buffer.is_empty() {
                    continue;
                }
                requests.add(
                    comm.process_at_rank(peer as Task)
                        .immediate_receive_into_with_tag(scope, &mut buffer[..], tag),
                );
            }
            for (peer, buffer) in outgoing.iter().enumerate() {
                if peer == rank || buffer.is_empty() {
                    continue;
                }
                requests.add(
                    comm.process_at_rank(peer as Task)
                        .immediate_send_with_tag(scope, &buffer[..], tag),
                );
            }
            let mut statuses = Vec::with_capacity(request_count);
            requests.wait_all(&mut statuses);
        },
    );
    incoming
}
