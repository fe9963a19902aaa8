use thiserror::Error;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Cannot broadcast shapes {0:?} and {1:?}")]
    IncompatibleShape(Vec<usize>, Vec<usize>),

    #[error("Cannot multiply matrices of shapes {left:?} and {right:?}")]
    IncompatibleMatMulShape { left: Vec<usize>, right: Vec<usize> },

    #[error("Axis {axis} is missing from the permutation of a rank-{rank} shape")]
    MissingAxis { axis: usize, rank: usize },

    #[error("Axis {axis} appears more than once")]
    DuplicateAxis { axis: usize },

    #[error("Axis {axis} out of bounds for rank {rank}")]
    AxisOutOfBounds { axis: isize, rank: usize },

    #[error("Index {index} out of bounds for axis of size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("Shape mismatch: shape {shape:?} has {elements} elements but data length is {len}")]
    ShapeDataMismatch {
        shape: Vec<usize>,
        elements: usize,
        len: usize,
    },

    #[error("Resource {id} has already been released")]
    AlreadyReleased { id: u64 },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Device operation `{op}` failed after {attempts} attempt(s): {reason}")]
    DeviceOperationFailed {
        op: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Graph order violated: node {child} depends on node {parent} created after it")]
    GraphOrder { parent: u64, child: u64 },
}

pub type Result<T> = std::result::Result<T, KilnError>;
