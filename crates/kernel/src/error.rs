//! Error types for kernel construction and tree validation.
//!
//! Nothing on the per-step path returns an error: capacity overflow inside a
//! step is handled by truncation, and structural problems in the tree are
//! only detected by [`crate::bvh::Bvh::validate`].

/// Errors raised while constructing a kernel or reading back GPU state.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// More particles were requested than the buffers (or the two-level
    /// prefix scan) can hold.
    #[error("particle capacity exceeded: requested {requested}, maximum {max}")]
    CapacityExceeded {
        /// Number of particles requested.
        requested: usize,
        /// Largest supported number of particles.
        max: usize,
    },
    /// The world half-width must be positive and finite.
    #[error("world extent must be positive and finite, got {0}")]
    InvalidWorldExtent(f32),
    /// Candidate lists need at least one slot per particle.
    #[error("candidate capacity must be at least 1")]
    InvalidCandidateCapacity,
    /// The properties table has no particle types besides the reserved entry.
    #[error("properties table has no particle types")]
    EmptyPropertiesTable,
    /// GPU adapter or device could not be created.
    #[error("GPU initialization failed: {0}")]
    GpuInit(String),
    /// Mapping a staging buffer for readback failed.
    #[error("GPU readback failed: {0}")]
    GpuReadback(String),
}

/// Structural defects found by [`crate::bvh::Bvh::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// Node array length is not `2N - 1`.
    #[error("expected {expected} nodes, found {found}")]
    NodeCount {
        /// `2N - 1`.
        expected: usize,
        /// Actual length.
        found: usize,
    },
    /// A node other than the root has no parent.
    #[error("node {node} has no parent")]
    Orphan {
        /// Orphaned node index.
        node: u32,
    },
    /// A parent does not list the node as one of its children.
    #[error("node {node} names parent {parent}, which does not list it as a child")]
    NotReciprocal {
        /// Child node index.
        node: u32,
        /// Parent it points at.
        parent: u32,
    },
    /// A child pointer is out of range or the node's leaf flag is wrong.
    #[error("node {node} has an invalid child link")]
    BadLink {
        /// Offending node index.
        node: u32,
    },
    /// Walking from the root did not visit every leaf exactly once in order.
    #[error("in-order leaf walk produced {found:?} instead of 0..{expected}")]
    LeafOrder {
        /// Number of leaves.
        expected: usize,
        /// Leaf sequence actually produced (truncated to the first mismatch).
        found: Vec<u32>,
    },
}
