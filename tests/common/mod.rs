use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;

use alderdb::index::btree::BPlusTree;
use alderdb::storage::buffer::BufferPoolManager;

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Create a B+ tree over i32 keys with explicit fan-outs; small values
// force deep trees out of few keys
#[allow(dead_code)]
pub fn create_test_tree(
    leaf_max_size: usize,
    internal_max_size: usize,
) -> Result<(BPlusTree<i32>, Arc<BufferPoolManager>, NamedTempFile)> {
    let (buffer_pool, file) = create_test_buffer_pool(64)?;
    let tree = BPlusTree::new_with_sizes("test_index", buffer_pool.clone(), leaf_max_size, internal_max_size)?;
    Ok((tree, buffer_pool, file))
}
