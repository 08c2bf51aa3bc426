//! Choice of the 3D process grid for a given global domain.

use crate::types::{CellIndex, GridError, Result, Task};

/// Smallest slab thickness any task would own along one axis.
fn thinnest_slab(global_cells: CellIndex, num_tasks: Task) -> CellIndex {
    global_cells / num_tasks
}

/// Check that splitting `global_size` into `num_tasks_per_dim` slabs
/// leaves every task a usable slab: at least one cell thick, and at
/// least `num_ghost_cells` thick wherever the axis is wider than the
/// halo (otherwise a halo would span more than one neighbour).
fn decomposition_is_valid(
    global_size: [CellIndex; 3],
    num_tasks_per_dim: [Task; 3],
    num_ghost_cells: CellIndex,
) -> bool {
    global_size
        .iter()
        .zip(num_tasks_per_dim.iter())
        .all(|(&cells, &tasks)| {
            let thinnest = thinnest_slab(cells, tasks);
            thinnest >= 1 && (cells <= num_ghost_cells || thinnest >= num_ghost_cells)
        })
}

/// Surface-area proxy for the communication volume of a decomposition.
///
/// Each axis contributes the area of its cut planes times the number of
/// slabs; the representative slab extents are real-valued.
fn communication_surface(global_size: [CellIndex; 3], num_tasks_per_dim: [Task; 3]) -> f64 {
    let l: Vec<f64> = global_size
        .iter()
        .zip(num_tasks_per_dim.iter())
        .map(|(&g, &p)| f64::from(g) / f64::from(p))
        .collect();
    l[1] * l[2] * f64::from(num_tasks_per_dim[0])
        + l[0] * l[2] * f64::from(num_tasks_per_dim[1])
        + l[0] * l[1] * f64::from(num_tasks_per_dim[2])
}

/// Pick the process grid `(Px, Py, Pz)` with `Px * Py * Pz == num_procs`
/// minimizing [`communication_surface`], or validate a user override.
///
/// Collapsed axes (global extent 1) always end up with a single slab.
/// Ties are broken towards the lexicographically smallest triple.
pub fn compute_domain_decomposition(
    global_size: [CellIndex; 3],
    num_procs: Task,
    num_ghost_cells: CellIndex,
    user_decomposition: Option<[Task; 3]>,
) -> Result<[Task; 3]> {
    if num_procs < 1 {
        return Err(GridError::BadDecomposition(format!(
            "cannot decompose over {} processes",
            num_procs
        )));
    }

    if let Some(decomposition) = user_decomposition {
        let product: Task = decomposition.iter().product();
        if product != num_procs {
            return Err(GridError::BadDecomposition(format!(
                "user decomposition {:?} multiplies to {}, expected {}",
                decomposition, product, num_procs
            )));
        }
        if !decomposition_is_valid(global_size, decomposition, num_ghost_cells) {
            return Err(GridError::BadDecomposition(format!(
                "user decomposition {:?} leaves a task with an unusable slab of {:?}",
                decomposition, global_size
            )));
        }
        return Ok(decomposition);
    }

    let mut best: Option<([Task; 3], f64)> = None;
    for px in 1..=num_procs {
        if num_procs % px != 0 {
            continue;
        }
        let rest = num_procs / px;
        for py in 1..=rest {
            if rest % py != 0 {
                continue;
            }
            let pz = rest / py;
            let candidate = [px, py, pz];
            if !decomposition_is_valid(global_size, candidate, num_ghost_cells) {
                continue;
            }
            let surface = communication_surface(global_size, candidate);
            if best.map_or(true, |(_, best_surface)| surface < best_surface) {
                best = Some((candidate, surface));
            }
        }
    }

    best.map(|(decomposition, _)| decomposition).ok_or_else(|| {
        GridError::BadDecomposition(format!(
            "no valid factorization of {} processes for domain {:?} with halo {}",
            num_procs, global_size, num_ghost_cells
        ))
    })
}
