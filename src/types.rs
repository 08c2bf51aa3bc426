//! Scalar type aliases and the crate-wide error type.

/// Signed cell coordinate or extent along one axis, in cells.
pub type CellIndex = i32;

/// Linearized index of a cell in the global domain.
pub type GlobalId = i64;

/// Linearized index of a cell in a task's local storage buffer.
pub type LocalId = i64;

/// Rank of a task in the grid's communicator. A passive rank is `-1`.
pub type Task = i32;

/// Errors raised by grid construction and collective operations.
#[derive(thiserror::Error, Debug)]
pub enum GridError {
    /// A user-supplied decomposition does not multiply to the worker
    /// count, or no valid factorization exists.
    #[error("bad domain decomposition: {0}")]
    BadDecomposition(String),

    /// A task would own an empty slab, or a slab thinner than the halo.
    #[error("local domain too small: {0}")]
    DomainTooSmall(String),

    /// An underlying communicator primitive refused a call.
    #[error("communicator failure on rank {rank} during {primitive}: {context}")]
    CommunicatorFailure {
        /// Rank in the parent communicator observing the failure.
        rank: Task,
        /// Name of the refused primitive.
        primitive: &'static str,
        /// Call arguments or surrounding state.
        context: String,
    },

    /// A cell was addressed outside the global domain.
    #[error("out of bounds access: {0}")]
    OutOfBoundsAccess(String),

    /// A send, receive or wait failed mid-exchange.
    #[error("ghost cell exchange failed: {0}")]
    GhostExchangeFailure(String),

    /// Distinguished non-success status for collectives short-circuited
    /// on a passive rank.
    #[error("collective short-circuited on a passive rank")]
    PassiveRank,
}

/// Result type for grid operations.
pub type Result<T> = std::result::Result<T, GridError>;
