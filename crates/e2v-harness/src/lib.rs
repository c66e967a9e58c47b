#![forbid(unsafe_code)]
//! Test fixtures for ext2view: sparse JSON byte fixtures for the parsers
//! and a synthetic image builder for end-to-end reads.

pub mod image;

pub use image::{
    Ext2ImageBuilder, ImageGeometry, LOST_FOUND_INO, ROOT_INO, image_u32, pattern_block,
};

use anyhow::{Context, Result, bail};
use e2v_ondisk::{Ext2DirEntry, Ext2GroupDesc, Ext2Inode, Ext2Superblock, parse_dir_block};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A fixture stored as a zero-filled buffer plus hex-encoded writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

impl SparseFixture {
    /// Materialize the fixture bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.size];
        for write in &self.writes {
            let payload = hex::decode(&write.hex)
                .with_context(|| format!("invalid hex at offset {}", write.offset))?;

            let end = write
                .offset
                .checked_add(payload.len())
                .context("fixture offset overflow")?;
            if end > bytes.len() {
                bail!(
                    "fixture write out of bounds: offset={} payload={} size={}",
                    write.offset,
                    payload.len(),
                    bytes.len()
                );
            }

            bytes[write.offset..end].copy_from_slice(&payload);
        }
        Ok(bytes)
    }

    /// Encode `bytes` as runs of non-zero data.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut writes = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == 0 {
                i += 1;
                continue;
            }
            let start = i;
            while i < bytes.len() && bytes[i] != 0 {
                i += 1;
            }
            writes.push(FixtureWrite {
                offset: start,
                hex: hex::encode(&bytes[start..i]),
            });
        }
        Self {
            size: bytes.len(),
            writes,
        }
    }
}

/// Path of a named fixture under `conformance/fixtures`.
#[must_use]
pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
        .join("conformance")
        .join("fixtures")
        .join(name)
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    fixture.to_bytes()
}

pub fn validate_superblock_fixture(path: &Path) -> Result<Ext2Superblock> {
    let data = load_sparse_fixture(path)?;
    let sb = Ext2Superblock::parse_superblock_region(&data)
        .with_context(|| format!("failed superblock parse for fixture {}", path.display()))?;
    sb.validate()
        .with_context(|| format!("superblock validation failed for fixture {}", path.display()))?;
    Ok(sb)
}

pub fn validate_group_desc_fixture(path: &Path) -> Result<Ext2GroupDesc> {
    let data = load_sparse_fixture(path)?;
    Ext2GroupDesc::parse_from_bytes(&data)
        .with_context(|| format!("failed group desc parse for fixture {}", path.display()))
}

pub fn validate_inode_fixture(path: &Path) -> Result<Ext2Inode> {
    let data = load_sparse_fixture(path)?;
    Ext2Inode::parse_from_bytes(&data)
        .with_context(|| format!("failed inode parse for fixture {}", path.display()))
}

pub fn validate_dir_block_fixture(path: &Path) -> Result<Vec<Ext2DirEntry>> {
    let data = load_sparse_fixture(path)?;
    parse_dir_block(&data)
        .with_context(|| format!("failed dir block parse for fixture {}", path.display()))
}
