use crate::utils::*;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a space could not be produced. Every variant is fatal for the requested construction;
/// nothing here is retried by the spaces themselves.
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error(
        "{name}: initial size {} / growth limit {} / capacity {} are not ordered",
        formatted_size(.initial_size.clone()),
        formatted_size(.growth_limit.clone()),
        formatted_size(.capacity.clone())
    )]
    InvalidSizes {
        name: String,
        initial_size: usize,
        growth_limit: usize,
        capacity: usize,
    },
    #[error("{name}: failed to reserve {}: {source}", formatted_size(.size.clone()))]
    Reservation {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("{name}: failed to initialize the space allocator")]
    AllocatorInit { name: String },
    #[error("{}: failed to read image: {source}", .path.display())]
    ImageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: invalid image: {reason}", .path.display())]
    ImageFormat { path: PathBuf, reason: String },
    #[error("{}: image requested at {requested} but mapped at {actual}", .path.display())]
    ImagePlacement {
        path: PathBuf,
        requested: Address,
        actual: Address,
    },
}

impl SpaceError {
    pub(crate) fn image_format(path: &std::path::Path, reason: impl Into<String>) -> Self {
        SpaceError::ImageFormat {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}
