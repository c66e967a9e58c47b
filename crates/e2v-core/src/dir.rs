#![forbid(unsafe_code)]
//! Directory traversal.

use crate::{Ext2Fs, Inode, corruption_at};
use e2v_error::{E2vError, Result};
use e2v_ondisk::{Ext2DirEntry, parse_dir_block};
use std::collections::VecDeque;
use tracing::trace;

/// Lazy iterator over the live entries of a directory.
///
/// Blocks are read one at a time as the iterator advances. The walk covers
/// the blocks implied by `i_size` and stops early at the first hole. After
/// an error the iterator is exhausted.
#[derive(Debug)]
pub struct DirEntries<'a> {
    fs: &'a Ext2Fs,
    dir: Inode,
    next_logical: u64,
    block_count: u64,
    pending: VecDeque<Ext2DirEntry>,
    done: bool,
}

impl DirEntries<'_> {
    /// Decode the next directory block into `pending`.
    ///
    /// Returns `Ok(false)` once there are no more blocks.
    fn fill(&mut self) -> Result<bool> {
        if self.next_logical >= self.block_count {
            return Ok(false);
        }
        let logical = self.next_logical;
        self.next_logical += 1;

        let Some(block) = self.fs.resolve_block(&self.dir, logical)? else {
            trace!(ino = self.dir.ino.0, logical, "directory hole ends walk");
            return Ok(false);
        };
        let buf = self.fs.read_block(block)?;
        let entries = parse_dir_block(buf.as_slice()).map_err(|e| corruption_at(block, &e))?;
        self.pending.extend(entries);
        Ok(true)
    }
}

impl Iterator for DirEntries<'_> {
    type Item = Result<Ext2DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if let Some(entry) = self.pending.pop_front() {
                return Some(Ok(entry));
            }
            match self.fill() {
                Ok(true) => {}
                Ok(false) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

impl Ext2Fs {
    /// Iterate the live entries of directory `dir`, in on-disk order.
    pub fn list_entries(&self, dir: &Inode) -> Result<DirEntries<'_>> {
        if !dir.is_dir() {
            return Err(E2vError::NotDirectory { ino: dir.ino.0 });
        }
        Ok(DirEntries {
            fs: self,
            dir: dir.clone(),
            next_logical: 0,
            block_count: dir.logical_block_count(self.block_size()),
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Collect every live entry of `dir`.
    pub fn read_dir(&self, dir: &Inode) -> Result<Vec<Ext2DirEntry>> {
        self.list_entries(dir)?.collect()
    }

    /// Find the entry called `name` in `dir`.
    ///
    /// Names are compared byte for byte. Stops reading blocks at the first
    /// match.
    pub fn lookup_name(&self, dir: &Inode, name: &[u8]) -> Result<Option<Ext2DirEntry>> {
        for entry in self.list_entries(dir)? {
            let entry = entry?;
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}
