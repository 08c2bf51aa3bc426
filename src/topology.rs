//! Neighbour bookkeeping over the cartesian process grid.
//!
//! The table builders are pure: rank resolution is injected as a
//! closure, so everything except communicator creation itself can run
//! (and be tested) without an MPI world. The grid resolves ranks
//! through the broadcast task table of [`task_pos_to_task`].

use mpi::topology::{CartesianCommunicator, Color};
use mpi::traits::*;

use crate::bitmask::BitMask32;
use crate::stencil::{linear_to_x, linear_to_y, linear_to_z, CENTER_NEIGHBOUR, NUM_NEIGHBOURS};
use crate::types::{GridError, Result, Task};

/// Rank of each of the 27 neighbours, indexed by neighbour slot.
/// Slot 13 is this task itself; `None` marks an open boundary. A
/// passive task has no neighbours at all.
pub fn map_neighbour_index_to_rank<F>(
    task_position: [Task; 3],
    num_tasks_per_dim: [Task; 3],
    periodic: [bool; 3],
    rank: Task,
    resolve_rank: F,
) -> [Option<Task>; NUM_NEIGHBOURS]
where
    F: Fn([Task; 3]) -> Task,
{
    let mut ranks = [None; NUM_NEIGHBOURS];
    if rank == -1 {
        return ranks;
    }

    for (slot, entry) in ranks.iter_mut().enumerate() {
        let offset = [
            linear_to_x(slot as u32),
            linear_to_y(slot as u32),
            linear_to_z(slot as u32),
        ];
        let mut position = [0; 3];
        for axis in 0..3 {
            let candidate = task_position[axis] + offset[axis];
            position[axis] = if periodic[axis] {
                (candidate + num_tasks_per_dim[axis]) % num_tasks_per_dim[axis]
            } else {
                candidate
            };
        }
        let within_limits = position
            .iter()
            .zip(num_tasks_per_dim.iter())
            .all(|(&p, &n)| p >= 0 && p < n);
        if within_limits {
            *entry = Some(resolve_rank(position));
        }
    }
    ranks
}

/// Inverse of the neighbour table: the slot at which a rank appears,
/// `None` for ranks that are not direct neighbours.
pub fn map_neighbour_rank_to_index(
    index_to_rank: &[Option<Task>; NUM_NEIGHBOURS],
    num_ranks: Task,
) -> Vec<Option<u8>> {
    let mut indices = vec![None; num_ranks.max(0) as usize];
    for (slot, entry) in index_to_rank.iter().enumerate() {
        if let Some(rank) = entry {
            if *rank >= 0 && *rank < num_ranks {
                indices[*rank as usize] = Some(slot as u8);
            }
        }
    }
    indices
}

/// Mask of neighbour slots occupied by this task itself, centre slot
/// excluded. Feeds the stencil's periodic shift.
pub fn neighbour_bit_mask(
    rank: Task,
    index_to_rank: &[Option<Task>; NUM_NEIGHBOURS],
) -> BitMask32 {
    let mut bits = 0;
    for (slot, entry) in index_to_rank.iter().enumerate() {
        if slot != CENTER_NEIGHBOUR as usize && *entry == Some(rank) {
            bits |= 1 << slot;
        }
    }
    BitMask32::new(bits)
}

/// Mask of neighbour slots with no task behind them, centre slot
/// excluded. Feeds the stencil's fallback.
pub fn null_neighbour_bit_mask(
    index_to_rank: &[Option<Task>; NUM_NEIGHBOURS],
) -> BitMask32 {
    let mut bits = 0;
    for (slot, entry) in index_to_rank.iter().enumerate() {
        if slot != CENTER_NEIGHBOUR as usize && entry.is_none() {
            bits |= 1 << slot;
        }
    }
    BitMask32::new(bits)
}

/// Split off the worker processes and arrange them in a cartesian grid.
///
/// Ranks below `num_procs` in the parent communicator become workers;
/// reordering is off, so cartesian ranks match parent ranks. Returns
/// `None` for a process left out of the grid.
pub fn create_cartesian_communicator(
    parent_comm: &impl Communicator,
    num_tasks_per_dim: [Task; 3],
    periodic: [bool; 3],
    num_procs: Task,
) -> Result<Option<CartesianCommunicator>> {
    let parent_rank = parent_comm.rank();
    let color = if parent_rank < num_procs {
        Color::with_value(1)
    } else {
        Color::undefined()
    };
    let worker_comm = parent_comm.split_by_color(color);

    match worker_comm {
        Some(comm) => comm
            .create_cartesian_communicator(&num_tasks_per_dim, &periodic, false)
            .map(Some)
            .ok_or_else(|| GridError::CommunicatorFailure {
                rank: parent_rank,
                primitive: "create_cartesian_communicator",
                context: format!(
                    "dims {:?}, periodic {:?}, {} workers",
                    num_tasks_per_dim, periodic, num_procs
                ),
            }),
        None => Ok(None),
    }
}

/// Rank in the cartesian communicator, -1 for a passive process.
pub fn cartesian_rank(comm: Option<&CartesianCommunicator>) -> Task {
    comm.map_or(-1, |c| c.rank())
}

/// This process' slot in the process grid, `[-1, -1, -1]` if passive.
pub fn task_position(comm: Option<&CartesianCommunicator>) -> [Task; 3] {
    match comm {
        Some(c) => {
            let coords = c.rank_to_coordinates(c.rank());
            [coords[0], coords[1], coords[2]]
        }
        None => [-1, -1, -1],
    }
}

/// Flat index of a process-grid slot in the task table: x outermost,
/// z fastest.
pub fn task_table_index(num_tasks_per_dim: [Task; 3], position: [Task; 3]) -> usize {
    ((position[0] * num_tasks_per_dim[1] + position[1]) * num_tasks_per_dim[2] + position[2])
        as usize
}

/// The full `(tx, ty, tz) -> rank` table, broadcast over the parent
/// communicator so passive processes agree with the workers.
pub fn task_pos_to_task(
    parent_comm: &impl Communicator,
    comm: Option<&CartesianCommunicator>,
    num_tasks_per_dim: [Task; 3],
) -> Vec<Task> {
    let table_len = num_tasks_per_dim.iter().product::<Task>() as usize;
    let mut tasks = vec![0; table_len];
    if let Some(cart) = comm {
        for rank in 0..cart.size() {
            let coords = cart.rank_to_coordinates(rank);
            tasks[task_table_index(num_tasks_per_dim, [coords[0], coords[1], coords[2]])] = rank;
        }
    }
    parent_comm.process_at_rank(0).broadcast_into(&mut tasks[..]);
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::iproduct;

    /// Row-major rank layout, matching a cartesian communicator
    /// created without reordering.
    fn row_major(num_tasks_per_dim: [Task; 3]) -> impl Fn([Task; 3]) -> Task {
        move |pos| {
            (pos[0] * num_tasks_per_dim[1] + pos[1]) * num_tasks_per_dim[2] + pos[2]
        }
    }

    #[test]
    fn interior_task_sees_every_neighbour() {
        let dims = [3, 3, 3];
        let ranks = map_neighbour_index_to_rank([1, 1, 1], dims, [false; 3], 13, row_major(dims));
        for (slot, entry) in ranks.iter().enumerate() {
            let expected = row_major(dims)([
                1 + linear_to_x(slot as u32),
                1 + linear_to_y(slot as u32),
                1 + linear_to_z(slot as u32),
            ]);
            assert_eq!(*entry, Some(expected));
        }
        assert_eq!(ranks[13], Some(13));
        assert_eq!(null_neighbour_bit_mask(&ranks).bits(), 0);
        assert_eq!(neighbour_bit_mask(13, &ranks).bits(), 0);
    }

    #[test]
    fn corner_task_loses_the_outside_on_open_boundaries() {
        let dims = [3, 3, 3];
        let ranks = map_neighbour_index_to_rank([0, 0, 0], dims, [false; 3], 0, row_major(dims));
        for (slot, entry) in ranks.iter().enumerate() {
            let off_grid = linear_to_x(slot as u32) < 0
                || linear_to_y(slot as u32) < 0
                || linear_to_z(slot as u32) < 0;
            assert_eq!(entry.is_none(), off_grid);
        }
        let nulls = null_neighbour_bit_mask(&ranks);
        for slot in 0..27 {
            let off_grid = linear_to_x(slot) < 0 || linear_to_y(slot) < 0 || linear_to_z(slot) < 0;
            assert_eq!(nulls.get(slot), i32::from(off_grid));
        }
    }

    #[test]
    fn periodic_axes_wrap_the_task_grid() {
        let dims = [3, 1, 1];
        let ranks =
            map_neighbour_index_to_rank([0, 0, 0], dims, [true, false, false], 0, row_major(dims));
        // Left along x wraps to the last task, right is the next one.
        assert_eq!(ranks[xyz_to_linear_slot(-1, 0, 0)], Some(2));
        assert_eq!(ranks[xyz_to_linear_slot(1, 0, 0)], Some(1));
        // Off-grid in y and z.
        assert_eq!(ranks[xyz_to_linear_slot(0, 1, 0)], None);
        assert_eq!(ranks[xyz_to_linear_slot(0, 0, -1)], None);
    }

    #[test]
    fn single_periodic_slab_wraps_onto_itself() {
        let dims = [1, 1, 1];
        let ranks = map_neighbour_index_to_rank([0, 0, 0], dims, [true; 3], 0, row_major(dims));
        for entry in ranks.iter() {
            assert_eq!(*entry, Some(0));
        }
        // Everything except the centre is a self-wrap.
        let shifts = neighbour_bit_mask(0, &ranks);
        for slot in 0..27 {
            assert_eq!(shifts.get(slot), i32::from(slot != 13));
        }
        assert_eq!(shifts.get(13), 0);
    }

    #[test]
    fn mixed_periodicity_wraps_only_the_periodic_axes() {
        let dims = [1, 2, 1];
        let ranks = map_neighbour_index_to_rank(
            [0, 0, 0],
            dims,
            [true, false, true],
            0,
            row_major(dims),
        );
        // x and z wrap onto self, y reaches the real neighbour above
        // and nothing below.
        assert_eq!(ranks[xyz_to_linear_slot(-1, 0, 0)], Some(0));
        assert_eq!(ranks[xyz_to_linear_slot(0, 0, 1)], Some(0));
        assert_eq!(ranks[xyz_to_linear_slot(0, 1, 0)], Some(1));
        assert_eq!(ranks[xyz_to_linear_slot(0, -1, 0)], None);
        assert_eq!(ranks[xyz_to_linear_slot(-1, 1, 1)], Some(1));
    }

    #[test]
    fn passive_task_has_no_neighbours() {
        let dims = [2, 2, 2];
        let ranks =
            map_neighbour_index_to_rank([-1, -1, -1], dims, [true; 3], -1, row_major(dims));
        assert!(ranks.iter().all(Option::is_none));
    }

    #[test]
    fn rank_to_index_inverts_the_neighbour_table() {
        let dims = [4, 1, 1];
        let ranks =
            map_neighbour_index_to_rank([1, 0, 0], dims, [false; 3], 1, row_major(dims));
        let inverse = map_neighbour_rank_to_index(&ranks, 4);
        // Rank 3 is not adjacent to task 1 on a 4-slab open axis.
        assert_eq!(inverse[3], None);
        // The stored slot is the table index actually holding the rank,
        // interleaved invalid entries notwithstanding.
        assert_eq!(inverse[0], Some(xyz_to_linear_slot(-1, 0, 0) as u8));
        assert_eq!(inverse[1], Some(13));
        assert_eq!(inverse[2], Some(xyz_to_linear_slot(1, 0, 0) as u8));
        for (rank, slot) in inverse.iter().enumerate() {
            if let Some(slot) = slot {
                assert_eq!(ranks[*slot as usize], Some(rank as Task));
            }
        }
    }

    fn xyz_to_linear_slot(x: i32, y: i32, z: i32) -> usize {
        crate::stencil::xyz_to_linear(x, y, z) as usize
    }

    #[test]
    fn self_mask_flags_every_slot_holding_this_rank() {
        for (px, periodic) in iproduct!([1, 2], [true, false]) {
            let dims = [px, 1, 1];
            let ranks = map_neighbour_index_to_rank(
                [0, 0, 0],
                dims,
                [periodic, periodic, periodic],
                0,
                row_major(dims),
            );
            let mask = neighbour_bit_mask(0, &ranks);
            for slot in 0..27u32 {
                let expected = slot != 13 && ranks[slot as usize] == Some(0);
                assert_eq!(mask.get(slot), i32::from(expected));
            }
        }
    }
}
