use thiserror::Error;

use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Invalid page format")]
    InvalidPageFormat,

    #[error("Node size {0} does not fit the page layout")]
    BadNodeSize(usize),

    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
