//! Ghost-cell exchange between neighbouring tasks.
//!
//! Each of the 26 directions gets one block descriptor for the inner
//! face to send and one for the halo slab to receive. Cells travel as
//! `Equivalence`-typed values through per-direction packed buffers; the
//! descriptors are checked at runtime against the storage layout.
//! Directions whose neighbour is this task itself (periodic wrap of a
//! single slab) are serviced by in-buffer copies instead of
//! self-addressed messages.

use mpi::request::RequestCollection;
use mpi::topology::CartesianCommunicator;
use mpi::traits::*;

use crate::stencil::{linear_to_x, linear_to_y, linear_to_z, CENTER_NEIGHBOUR, NUM_NEIGHBOURS};
use crate::types::{CellIndex, GridError, Result, Task};

/// A 3D block of cells inside the row-major storage buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HaloRegion {
    /// Low corner of the block, in storage coordinates.
    pub start: [CellIndex; 3],
    /// Extents of the block.
    pub shape: [CellIndex; 3],
}

impl HaloRegion {
    /// Number of cells in the block.
    pub fn cell_count(&self) -> usize {
        self.shape.iter().product::<CellIndex>() as usize
    }
}

/// Whether direction `slot` moves no data: the centre, or any step
/// along a collapsed axis.
fn skipped(storage_size: [CellIndex; 3], offset: [i32; 3]) -> bool {
    let is_center = offset == [0, 0, 0];
    let flat_step = (0..3).any(|axis| storage_size[axis] == 1 && offset[axis] != 0);
    is_center || flat_step
}

fn direction_offset(slot: usize) -> [i32; 3] {
    [
        linear_to_x(slot as u32),
        linear_to_y(slot as u32),
        linear_to_z(slot as u32),
    ]
}

/// Block descriptors for the inner faces sent to each neighbour.
pub fn send_regions(
    storage_size: [CellIndex; 3],
    local_size: [CellIndex; 3],
    num_ghost_cells: CellIndex,
) -> [Option<HaloRegion>; NUM_NEIGHBOURS] {
    let mut regions = [None; NUM_NEIGHBOURS];
    for (slot, region) in regions.iter_mut().enumerate() {
        let offset = direction_offset(slot);
        if skipped(storage_size, offset) {
            continue;
        }
        let mut start = [0; 3];
        let mut shape = [0; 3];
        for axis in 0..3 {
            shape[axis] = if offset[axis] == 0 {
                local_size[axis]
            } else {
                num_ghost_cells
            };
            start[axis] = if storage_size[axis] == 1 {
                0
            } else if offset[axis] == 1 {
                // The inner slab touching the high face.
                storage_size[axis] - 2 * num_ghost_cells
            } else {
                // Offset 0 or -1: the inner region from its low edge.
                num_ghost_cells
            };
        }
        *region = Some(HaloRegion { start, shape });
    }
    regions
}

/// Block descriptors for the halo slabs filled from each neighbour.
/// The region at direction `d` is the `d`-side halo, fed by the
/// neighbour at `d`.
pub fn recv_regions(
    storage_size: [CellIndex; 3],
    local_size: [CellIndex; 3],
    num_ghost_cells: CellIndex,
) -> [Option<HaloRegion>; NUM_NEIGHBOURS] {
    let mut regions = [None; NUM_NEIGHBOURS];
    for (slot, region) in regions.iter_mut().enumerate() {
        let offset = direction_offset(slot);
        if skipped(storage_size, offset) {
            continue;
        }
        let mut start = [0; 3];
        let mut shape = [0; 3];
        for axis in 0..3 {
            shape[axis] = if offset[axis] == 0 {
                local_size[axis]
            } else {
                num_ghost_cells
            };
            start[axis] = if storage_size[axis] == 1 {
                0
            } else if offset[axis] == 1 {
                // The high halo.
                storage_size[axis] - num_ghost_cells
            } else if offset[axis] == -1 {
                // The low halo.
                0
            } else {
                num_ghost_cells
            };
        }
        *region = Some(HaloRegion { start, shape });
    }
    regions
}

fn row_start(storage_size: [CellIndex; 3], x: CellIndex, y: CellIndex, z: CellIndex) -> usize {
    ((z * storage_size[1] + y) * storage_size[0] + x) as usize
}

/// Copy a block out of the storage buffer into a contiguous vector,
/// x fastest.
pub fn pack_region<T: Clone>(
    data: &[T],
    storage_size: [CellIndex; 3],
    region: &HaloRegion,
) -> Vec<T> {
    let mut packed = Vec::with_capacity(region.cell_count());
    for z in region.start[2]..region.start[2] + region.shape[2] {
        for y in region.start[1]..region.start[1] + region.shape[1] {
            let row = row_start(storage_size, region.start[0], y, z);
            packed.extend_from_slice(&data[row..row + region.shape[0] as usize]);
        }
    }
    packed
}

/// Scatter a contiguous vector back into a block of the storage buffer.
pub fn unpack_region<T: Clone>(
    data: &mut [T],
    storage_size: [CellIndex; 3],
    region: &HaloRegion,
    values: &[T],
) {
    let mut consumed = 0;
    let width = region.shape[0] as usize;
    for z in region.start[2]..region.start[2] + region.shape[2] {
        for y in region.start[1]..region.start[1] + region.shape[1] {
            let row = row_start(storage_size, region.start[0], y, z);
            data[row..row + width].clone_from_slice(&values[consumed..consumed + width]);
            consumed += width;
        }
    }
}

/// Service the directions whose neighbour is this task itself: the halo
/// at direction `d` receives the inner face this task would send in
/// direction `26 - d`.
pub fn copy_wrapped_halos<T: Clone>(
    data: &mut [T],
    storage_size: [CellIndex; 3],
    rank: Task,
    index_to_rank: &[Option<Task>; NUM_NEIGHBOURS],
    send: &[Option<HaloRegion>; NUM_NEIGHBOURS],
    recv: &[Option<HaloRegion>; NUM_NEIGHBOURS],
) {
    for slot in 0..NUM_NEIGHBOURS {
        if slot == CENTER_NEIGHBOUR as usize || index_to_rank[slot] != Some(rank) {
            continue;
        }
        let mirrored = NUM_NEIGHBOURS - 1 - slot;
        if let (Some(to), Some(from)) = (recv[slot], send[mirrored]) {
            let packed = pack_region(data, storage_size, &from);
            unpack_region(data, storage_size, &to, &packed);
        }
    }
}

/// Run one full ghost-cell exchange over the cartesian communicator.
///
/// Receives are posted first, sends after, and both sets are awaited
/// before unpacking. A receive posts iff the receive descriptor and
/// the source rank of the same direction exist; sends symmetrically.
pub(crate) fn exchange<T>(
    comm: &CartesianCommunicator,
    rank: Task,
    index_to_rank: &[Option<Task>; NUM_NEIGHBOURS],
    send: &[Option<HaloRegion>; NUM_NEIGHBOURS],
    recv: &[Option<HaloRegion>; NUM_NEIGHBOURS],
    storage_size: [CellIndex; 3],
    data: &mut [T],
) -> Result<()>
where
    T: Equivalence + Clone + Default,
{
    let storage_cells = storage_size.iter().product::<CellIndex>() as usize;
    if data.len() != storage_cells {
        return Err(GridError::GhostExchangeFailure(format!(
            "storage buffer holds {} cells, layout expects {}",
            data.len(),
            storage_cells
        )));
    }

    copy_wrapped_halos(data, storage_size, rank, index_to_rank, send, recv);

    let remote = |slot: usize| match index_to_rank[slot] {
        Some(neighbour) => neighbour != rank,
        None => false,
    };

    let mut send_buffers: Vec<Vec<T>> = vec![Vec::new(); NUM_NEIGHBOURS];
    let mut recv_buffers: Vec<Vec<T>> = vec![Vec::new(); NUM_NEIGHBOURS];
    for slot in 0..NUM_NEIGHBOURS {
        if !remote(slot) {
            continue;
        }
        if let Some(region) = &send[slot] {
            send_buffers[slot] = pack_region(data, storage_size, region);
        }
        if let Some(region) = &recv[slot] {
            recv_buffers[slot] = vec![T::default(); region.cell_count()];
        }
    }

    let request_count = send_buffers.iter().filter(|b| !b.is_empty()).count()
        + recv_buffers.iter().filter(|b| !b.is_empty()).count();
    if request_count > 0 {
        let completed =
            mpi::request::multiple_scope(request_count, |scope, requests: &mut RequestCollection<[T]>| {
                for (slot, buffer) in recv_buffers.iter_mut().enumerate() {
                    if buffer.is_empty() {
                        continue;
                    }
                    let source = index_to_rank[slot].expect("active receive has a source");
                    // The sender labels the message with its own
                    // direction, which mirrors ours.
                    let tag = (NUM_NEIGHBOURS - 1 - slot) as i32;
                    requests.add(
                        comm.process_at_rank(source)
                            .immediate_receive_into_with_tag(scope, &mut buffer[..], tag),
                    );
                }
                for (slot, buffer) in send_buffers.iter().enumerate() {
                    if buffer.is_empty() {
                        continue;
                    }
                    let destination = index_to_rank[slot].expect("active send has a destination");
                    requests.add(
                        comm.process_at_rank(destination)
                            .immediate_send_with_tag(scope, &buffer[..], slot as i32),
                    );
                }
                let mut statuses = Vec::with_capacity(request_count);
                requests.wait_all(&mut statuses);
                statuses.len()
            });
        if completed != request_count {
            return Err(GridError::GhostExchangeFailure(format!(
                "{} of {} transfers completed",
                completed, request_count
            )));
        }
    }

    for (slot, buffer) in recv_buffers.iter().enumerate() {
        if buffer.is_empty() {
            continue;
        }
        let region = recv[slot].expect("active receive has a descriptor");
        unpack_region(data, storage_size, &region, buffer);
    }
    Ok(())
}
