#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes byte slices into
//! typed superblocks, group descriptors, inodes and directory entries, and
//! computes the block-map routes used to resolve logical file blocks.

pub mod ext2;

pub use ext2::{
    BlockMapPath, DirBlockIter, Ext2CompatFeatures, Ext2DirEntry, Ext2FileType, Ext2GroupDesc,
    Ext2IncompatFeatures, Ext2Inode, Ext2RoCompatFeatures, Ext2Superblock, InodeLocation,
    block_map_capacity, block_map_path, parse_dir_block, read_block_pointer,
};
