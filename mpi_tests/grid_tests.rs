//! Multi-process grid checks.
//!
//! Build with `cargo build --examples` and run under mpirun, e.g.
//! `mpirun -n 8 target/debug/examples/grid_tests`. Any process count
//! works.

use cartgrid::CartGrid;
use mpi::datatype::UserDatatype;
use mpi::traits::*;

#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct Cell15 {
    values: [f64; 15],
}

unsafe impl Equivalence for Cell15 {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::contiguous(15, &f64::equivalent_datatype())
    }
}

fn main() {
    let universe = mpi::initialize().unwrap();
    let world = universe.world();

    local_to_global_roundtrip(&world);
    report(&world, "local_to_global_roundtrip");
    global_id_matches_task(&world);
    report(&world, "global_id_matches_task");
    local_ids_in_bounds(&world);
    report(&world, "local_ids_in_bounds");
    boundary_gets_non_periodic(&world);
    report(&world, "boundary_gets_non_periodic");
    boundary_gets_periodic(&world);
    report(&world, "boundary_gets_periodic");
    task_for_global_id(&world);
    report(&world, "task_for_global_id");
    stencil_matches_checked_ids_non_periodic(&world);
    report(&world, "stencil_matches_checked_ids_non_periodic");
    stencil_matches_checked_ids_periodic(&world);
    report(&world, "stencil_matches_checked_ids_periodic");
}

fn report(world: &impl Communicator, name: &str) {
    if world.rank() == 0 {
        println!("\t ... {} passed", name);
    }
}

fn local_to_global_roundtrip(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [1024, 666, 71],
        world,
        world.size(),
        [true, true, false],
        [0.0; 3],
        [0.0; 3],
        1,
        None,
    )
    .unwrap();
    let [lx, ly, lz] = grid.local_size();
    let coords = grid.coordinates();
    for x in 0..lx {
        for y in 0..ly {
            for z in 0..lz {
                let global = coords.local_to_global(x, y, z);
                let local = coords.global_to_local(global[0], global[1], global[2]);
                assert_eq!(local, Some([x, y, z]));
            }
        }
    }
}

fn global_id_matches_task(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [6547, 16, 77],
        world,
        world.size(),
        [true, false, false],
        [0.0; 3],
        [0.0; 3],
        1,
        None,
    )
    .unwrap();
    let [lx, ly, lz] = grid.local_size();
    let coords = grid.coordinates();
    for x in 0..lx {
        for y in 0..ly {
            for z in 0..lz {
                let id = coords.global_id_from_local_coordinates(x, y, z);
                assert_eq!(grid.get_task_for_global_id(id), grid.rank());
            }
        }
    }
}

fn local_ids_in_bounds(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [647, 1, 666],
        world,
        world.size(),
        [true, false, true],
        [0.0; 3],
        [0.0; 3],
        1,
        None,
    )
    .unwrap();
    let [lx, ly, lz] = grid.local_size();
    let coords = grid.coordinates();
    for x in 0..lx {
        for y in 0..ly {
            for z in 0..lz {
                let id = coords.local_id_from_local_coordinates(x, y, z);
                assert!(coords.local_id_in_bounds(id));
                assert!(grid.get_by_local_id(id).is_some());
            }
        }
    }
}

/// Probe one halo layer beyond each face: a halo coordinate resolves
/// iff a neighbour (or a periodic image) backs it, and coordinates
/// beyond the halo never resolve.
fn boundary_probes<T: Clone + Default>(grid: &CartGrid<T>) {
    let h = grid.num_ghost_cells();
    let local = grid.local_size();
    let start = grid.local_start();
    let global = grid.global_size();
    let periodic = grid.periodic();

    for x in 0..local[0] {
        for y in 0..local[1] {
            for z in 0..local[2] {
                assert!(grid.get(x, y, z).is_some());
            }
        }
    }

    for axis in 0..3 {
        if global[axis] <= 1 {
            continue;
        }
        let mut probe = [0, 0, 0];

        let below_exists = periodic[axis] || start[axis] - h >= 0;
        probe[axis] = -h;
        assert_eq!(grid.get(probe[0], probe[1], probe[2]).is_some(), below_exists);
        probe[axis] = -h - 1;
        assert!(grid.get(probe[0], probe[1], probe[2]).is_none());

        let above_exists =
            periodic[axis] || start[axis] + local[axis] + h <= global[axis];
        probe[axis] = local[axis] + h - 1;
        assert_eq!(grid.get(probe[0], probe[1], probe[2]).is_some(), above_exists);
        probe[axis] = local[axis] + h;
        assert!(grid.get(probe[0], probe[1], probe[2]).is_none());
    }
}

fn boundary_gets_non_periodic(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [12, 6, 2048],
        world,
        world.size(),
        [false, false, false],
        [0.0; 3],
        [0.0; 3],
        1,
        None,
    )
    .unwrap();
    boundary_probes(&grid);
}

fn boundary_gets_periodic(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [120, 5, 1048],
        world,
        world.size(),
        [true, true, true],
        [0.0; 3],
        [0.0; 3],
        2,
        None,
    )
    .unwrap();
    boundary_probes(&grid);
}

fn task_for_global_id(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [11, 5, 1048],
        world,
        world.size(),
        [true, true, false],
        [0.0; 3],
        [0.0; 3],
        2,
        None,
    )
    .unwrap();
    // Cell 666 sits at (6, 0, 12), well inside the first slab along
    // any reasonable split of this domain.
    assert_eq!(grid.get_task_for_global_id(666), 0);
}

fn compare_stencil_to_checked_ids<T: Clone + Default>(grid: &CartGrid<T>) {
    let [lx, ly, lz] = grid.local_size();
    let coords = grid.coordinates();
    for x in 0..lx {
        for y in 0..ly {
            for z in 0..lz {
                let stencil = grid.make_stencil(x, y, z);
                let indices = stencil.indices();
                let center = stencil.center();
                let mut slot = 0;
                for dz in -1..=1 {
                    for dy in -1..=1 {
                        for dx in -1..=1 {
                            let index = indices[slot];
                            slot += 1;
                            match coords.local_id_from_cell_coordinates(x + dx, y + dy, z + dz)
                            {
                                Some(id) => assert_eq!(index as i64, id),
                                None => assert_eq!(index, center),
                            }
                        }
                    }
                }
            }
        }
    }
}

fn stencil_matches_checked_ids_non_periodic(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [1048, 11, 5],
        world,
        world.size(),
        [false, false, false],
        [0.0; 3],
        [0.0; 3],
        2,
        None,
    )
    .unwrap();
    compare_stencil_to_checked_ids(&grid);
}

fn stencil_matches_checked_ids_periodic(world: &impl Communicator) {
    let grid: CartGrid<Cell15> = CartGrid::new(
        [1048, 11, 6],
        world,
        world.size(),
        [true, true, true],
        [0.0; 3],
        [0.0; 3],
        6,
        None,
    )
    .unwrap();
    compare_stencil_to_checked_ids(&grid);
}
