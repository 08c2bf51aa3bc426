//! Multi-process halo exchange, reduction and coupling checks.
//!
//! Build with `cargo build --examples` and run under mpirun, e.g.
//! `mpirun -n 4 target/debug/examples/halo_exchange_tests`. Any
//! process count works.

use std::env;

use cartgrid::grid::WORKER_COUNT_ENV;
use cartgrid::types::{CellIndex, GlobalId, GridError};
use cartgrid::CartGrid;
use mpi::collective::SystemOperation;
use mpi::datatype::UserDatatype;
use mpi::traits::*;

/// One tracer value per cell: the global ID it believes it mirrors and
/// the rank that wrote it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
struct TracerCell {
    global_id: f64,
    writer: f64,
}

unsafe impl Equivalence for TracerCell {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(2, &f64::equivalent_datatype())
    }
}

fn main() {
    let universe = mpi::initialize().unwrap();
    let world = universe.world();

    halos_mirror_the_owning_neighbour(&world);
    report(&world, "halos_mirror_the_owning_neighbour");
    exchange_is_idempotent(&world);
    report(&world, "exchange_is_idempotent");
    wide_halos_wrap_fully(&world);
    report(&world, "wide_halos_wrap_fully");
    flat_dimension_stays_flat(&world);
    report(&world, "flat_dimension_stays_flat");
    all_reduce_sums_cell_counts(&world);
    report(&world, "all_reduce_sums_cell_counts");
    scatter_then_gather_roundtrip(&world);
    report(&world, "scatter_then_gather_roundtrip");
    env_cap_creates_passive_ranks(&world);
    report(&world, "env_cap_creates_passive_ranks");
}

fn report(world: &impl Communicator, name: &str) {
    if world.rank() == 0 {
        println!("\t ... {} passed", name);
    }
}

fn tracer_grid(
    world: &impl Communicator,
    global_size: [CellIndex; 3],
    periodic: [bool; 3],
    num_ghost_cells: CellIndex,
) -> CartGrid<TracerCell> {
    let mut grid: CartGrid<TracerCell> = CartGrid::new(
        global_size,
        world,
        world.size(),
        periodic,
        [0.0; 3],
        [0.0; 3],
        num_ghost_cells,
        None,
    )
    .unwrap();
    let [lx, ly, lz] = grid.local_size();
    let rank = grid.rank();
    for x in 0..lx {
        for y in 0..ly {
            for z in 0..lz {
                let id = grid
                    .coordinates()
                    .global_id_from_local_coordinates(x, y, z);
                *grid.get_mut(x, y, z).unwrap() = TracerCell {
                    global_id: id as f64,
                    writer: f64::from(rank),
                };
            }
        }
    }
    grid
}

/// After one exchange, every existing storage cell (halos included)
/// carries the global ID of the cell it mirrors, periodic wrap
/// accounted for.
fn check_halos(grid: &CartGrid<TracerCell>) {
    let h = grid.num_ghost_cells();
    let [lx, ly, lz] = grid.local_size();
    let global = grid.global_size();
    let periodic = grid.periodic();
    let coords = grid.coordinates();

    for x in -h..lx + h {
        for y in -h..ly + h {
            for z in -h..lz + h {
                let Some(local_id) = coords.local_id_from_cell_coordinates(x, y, z) else {
                    continue;
                };
                let mut g = coords.local_to_global(x, y, z);
                for axis in 0..3 {
                    if periodic[axis] {
                        g[axis] = g[axis].rem_euclid(global[axis]);
                    }
                }
                let expected = GlobalId::from(g[0])
                    + GlobalId::from(global[0]) * GlobalId::from(g[1])
                    + GlobalId::from(global[0]) * GlobalId::from(global[1]) * GlobalId::from(g[2]);
                let cell = grid.data()[local_id as usize];
                assert_eq!(
                    cell.global_id, expected as f64,
                    "rank {} cell ({}, {}, {})",
                    grid.rank(),
                    x,
                    y,
                    z
                );
            }
        }
    }
}

fn halos_mirror_the_owning_neighbour(world: &impl Communicator) {
    let mut grid = tracer_grid(world, [24, 12, 8], [true, false, true], 1);
    grid.update_ghost_cells().unwrap();
    check_halos(&grid);
}

fn exchange_is_idempotent(world: &impl Communicator) {
    let mut grid = tracer_grid(world, [24, 12, 8], [true, true, false], 1);
    grid.update_ghost_cells().unwrap();
    let snapshot = grid.data().to_vec();
    grid.update_ghost_cells().unwrap();
    assert_eq!(grid.data(), &snapshot[..]);
}

fn wide_halos_wrap_fully(world: &impl Communicator) {
    let mut grid = tracer_grid(world, [16, 16, 16], [true, true, true], 2);
    grid.update_ghost_cells().unwrap();
    check_halos(&grid);
}

fn flat_dimension_stays_flat(world: &impl Communicator) {
    let mut grid = tracer_grid(world, [24, 1, 16], [true, false, true], 1);
    assert_eq!(grid.storage_size()[1], 1);
    grid.update_ghost_cells().unwrap();
    check_halos(&grid);
}

fn all_reduce_sums_cell_counts(world: &impl Communicator) {
    let grid = tracer_grid(world, [24, 12, 8], [false, false, false], 1);
    let local: i32 = grid.local_size().iter().product();
    let mut total = 0;
    grid.all_reduce(&[local], std::slice::from_mut(&mut total), SystemOperation::sum())
        .unwrap();
    assert_eq!(total, 24 * 12 * 8);
}

fn scatter_then_gather_roundtrip(world: &impl Communicator) {
    let mut grid = tracer_grid(world, [32, 9, 7], [false, false, false], 1);
    let volume: GlobalId = 32 * 9 * 7;
    let sample: Vec<GlobalId> = (0..volume).step_by(13).collect();

    // Rank 0 pushes marked values, everyone else contributes nothing.
    let outgoing: Vec<(GlobalId, TracerCell)> = if grid.rank() == 0 {
        sample
            .iter()
            .map(|&id| {
                (
                    id,
                    TracerCell {
                        global_id: id as f64,
                        writer: -7.0,
                    },
                )
            })
            .collect()
    } else {
        Vec::new()
    };
    grid.scatter_cells(&outgoing).unwrap();

    // Owners observe the scattered values directly.
    let coords = grid.coordinates();
    for &id in &sample {
        let cell = coords.global_id_to_cell_coord(id);
        if let Some(local) = coords.global_to_local(cell[0], cell[1], cell[2]) {
            let stored = grid.get(local[0], local[1], local[2]).unwrap();
            assert_eq!(stored.writer, -7.0);
            assert_eq!(stored.global_id, id as f64);
        }
    }

    // Every rank gathers the same sample and sees identical values.
    let gathered = grid.gather_cells(&sample).unwrap();
    assert_eq!(gathered.len(), sample.len());
    for (&id, cell) in sample.iter().zip(gathered.iter()) {
        assert_eq!(cell.global_id, id as f64);
        assert_eq!(cell.writer, -7.0);
    }
}

fn env_cap_creates_passive_ranks(world: &impl Communicator) {
    if world.size() < 2 {
        return;
    }
    let workers = world.size() - 1;
    env::set_var(WORKER_COUNT_ENV, workers.to_string());
    let mut grid: CartGrid<TracerCell> = CartGrid::new(
        [32, 8, 8],
        world,
        world.size(),
        [false, false, false],
        [0.0; 3],
        [0.0; 3],
        1,
        None,
    )
    .unwrap();
    env::remove_var(WORKER_COUNT_ENV);

    assert_eq!(grid.num_worker_ranks(), workers);
    let passive = world.rank() >= workers;
    if passive {
        assert_eq!(grid.rank(), -1);
        assert_eq!(grid.local_size(), [0, 0, 0]);
        assert!(grid.data().is_empty());
        assert!(grid.get(0, 0, 0).is_none());
    } else {
        assert_eq!(grid.rank(), world.rank());
    }

    // The exchange returns immediately on passive ranks and still
    // completes on the workers.
    grid.update_ghost_cells().unwrap();

    // Passive ranks short-circuit the reduction with the distinguished
    // status and a plain copy.
    let mut total = 0;
    let result = grid.all_reduce(&[1i32], std::slice::from_mut(&mut total), SystemOperation::sum());
    if passive {
        assert!(matches!(result, Err(GridError::PassiveRank)));
        assert_eq!(total, 1);
    } else {
        result.unwrap();
        assert_eq!(total, workers);
    }

    // Coupling collectives accept an empty contribution from passive
    // ranks.
    grid.scatter_cells(&[]).unwrap();
    let gathered = grid.gather_cells(&[]).unwrap();
    assert!(gathered.is_empty());
}
