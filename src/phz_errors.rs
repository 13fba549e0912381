use thiserror::Error;

use crate::constants::SourceId;

#[derive(Error, Debug)]
pub enum PhzError {
    #[error("Inconsistent configuration: {0}")]
    ConfigurationInconsistency(String),

    #[error("Source {source_id} is missing a required attribute: {attribute}")]
    MissingRequiredAttribute {
        source_id: SourceId,
        attribute: String,
    },

    #[error("Stopped by the user")]
    UserCancellation,

    #[error("Invalid grid file format: {0}")]
    GridFormat(String),

    #[error("Cannot serialize an empty grid")]
    EmptyGrid,

    #[error("Cannot serialize a grid with heterogeneous filter sets: {0}")]
    HeterogeneousGrid(String),

    #[error("Invalid axis operation: {0}")]
    InvalidAxis(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unable to build the worker pool: {0}")]
    ThreadPool(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rayon::ThreadPoolBuildError> for PhzError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        PhzError::ThreadPool(err.to_string())
    }
}

impl PartialEq for PhzError {
    fn eq(&self, other: &Self) -> bool {
        use PhzError::*;
        match (self, other) {
            (ConfigurationInconsistency(a), ConfigurationInconsistency(b)) => a == b,
            (
                MissingRequiredAttribute {
                    source_id: id_a,
                    attribute: attr_a,
                },
                MissingRequiredAttribute {
                    source_id: id_b,
                    attribute: attr_b,
                },
            ) => id_a == id_b && attr_a == attr_b,
            (GridFormat(a), GridFormat(b)) => a == b,
            (HeterogeneousGrid(a), HeterogeneousGrid(b)) => a == b,
            (InvalidAxis(a), InvalidAxis(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (ThreadPool(a), ThreadPool(b)) => a == b,

            // io errors carry no comparable payload
            (IoError(_), IoError(_)) => true,

            (UserCancellation, UserCancellation) => true,
            (EmptyGrid, EmptyGrid) => true,

            _ => false,
        }
    }
}
