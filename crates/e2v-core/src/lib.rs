#![forbid(unsafe_code)]
//! Read-only ext2 volume access.
//!
//! [`Ext2Fs`] opens a volume, decodes the superblock and the block group
//! descriptor table once, and then serves inode reads, block-map
//! resolution, directory walks, path lookups and file reads on demand.
//! [`Session`] layers a current directory on top for interactive use, and
//! [`dump`] renders the decoded records as text.

pub mod dir;
pub mod dump;
pub mod path;
pub mod session;

pub use dir::DirEntries;
pub use e2v_error::{E2vError, ErrorKind, Result};
pub use e2v_ondisk::{
    Ext2DirEntry, Ext2FileType, Ext2GroupDesc, Ext2Inode, Ext2Superblock, InodeLocation,
};
pub use e2v_types::{BlockNumber, GroupNumber, InodeNumber};
pub use path::ParsedPath;
pub use session::{DEFAULT_CAT_BYTES, Session};

use e2v_block::{
    BlockBuf, BlockCache, BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice,
    read_superblock_region,
};
use e2v_ondisk::{BlockMapPath, block_map_capacity, block_map_path, read_block_pointer};
use e2v_types::{EXT2_GROUP_DESC_SIZE, EXT2_SUPER_MAGIC, ParseError};
use serde::Serialize;
use std::ops::Deref;
use std::path::Path;
use tracing::{debug, trace, warn};

// ── options ─────────────────────────────────────────────────────────────────

/// Options for opening a volume.
///
/// By default the superblock is validated beyond its signature and no block
/// cache is installed.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Skip consistency validation (geometry, incompatible features).
    ///
    /// The signature check and the arithmetic preconditions (nonzero
    /// per-group counts, sane block size) always apply.
    pub skip_validation: bool,
    /// Install an LRU cache of this many whole blocks in front of the device.
    pub cache_blocks: Option<usize>,
}

// ── inode value ─────────────────────────────────────────────────────────────

/// An inode record together with the number it was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inode {
    pub ino: InodeNumber,
    pub raw: Ext2Inode,
}

impl Deref for Inode {
    type Target = Ext2Inode;

    fn deref(&self) -> &Ext2Inode {
        &self.raw
    }
}

// ── error conversion ────────────────────────────────────────────────────────

/// Convert a parse failure raised while opening the volume.
fn parse_error_to_e2v(e: &ParseError) -> E2vError {
    match e {
        ParseError::InvalidMagic { expected, actual } => E2vError::BadSignature {
            expected: u16::try_from(*expected).unwrap_or(EXT2_SUPER_MAGIC),
            actual: u16::try_from(*actual).unwrap_or(u16::MAX),
        },
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") {
                E2vError::UnsupportedFeature(format!("{field}: {reason}"))
            } else if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                E2vError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                E2vError::Format(e.to_string())
            }
        }
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            E2vError::Corruption {
                block: 0,
                detail: e.to_string(),
            }
        }
    }
}

/// Convert a parse failure in metadata read from `block`.
fn corruption_at(block: BlockNumber, e: &ParseError) -> E2vError {
    E2vError::Corruption {
        block: block.0,
        detail: e.to_string(),
    }
}

// ── Ext2Fs ──────────────────────────────────────────────────────────────────

/// An opened ext2 volume.
///
/// Construction is all-or-nothing: superblock, group descriptor table and
/// root inode are all decoded before an `Ext2Fs` exists.
pub struct Ext2Fs {
    sb: Ext2Superblock,
    groups: Vec<Ext2GroupDesc>,
    root: Inode,
    dev: Box<dyn BlockDevice>,
}

impl std::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ext2Fs")
            .field("block_size", &self.sb.block_size)
            .field("blocks_count", &self.sb.blocks_count)
            .field("inodes_count", &self.sb.inodes_count)
            .field("groups", &self.groups.len())
            .field("device_blocks", &self.dev.block_count())
            .finish_non_exhaustive()
    }
}

impl Ext2Fs {
    /// Open the image or device at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, &OpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let dev = FileByteDevice::open(path.as_ref())?;
        Self::from_device(dev, options)
    }

    /// Open a volume from an already-opened byte device.
    pub fn from_device<D: ByteDevice + 'static>(dev: D, options: &OpenOptions) -> Result<Self> {
        let region = read_superblock_region(&dev)?;
        let sb = Ext2Superblock::parse_superblock_region(&region)
            .map_err(|e| parse_error_to_e2v(&e))?;

        if options.skip_validation {
            let unsupported = sb.feature_incompat.unsupported();
            if unsupported.0 != 0 {
                warn!(
                    features = %unsupported,
                    "opening volume with unsupported incompatible features"
                );
            }
        } else {
            sb.validate().map_err(|e| parse_error_to_e2v(&e))?;
        }
        if sb.needs_recovery() {
            warn!("volume needs journal recovery; reading unreplayed metadata");
        }

        let block_dev = ByteBlockDevice::new(dev, sb.block_size)?;
        check_group_table_fits(&sb, block_dev.block_count())?;
        let dev: Box<dyn BlockDevice> = match options.cache_blocks {
            Some(capacity) => Box::new(BlockCache::new(block_dev, capacity)?),
            None => Box::new(block_dev),
        };

        let groups = read_group_table(&*dev, &sb)?;
        let root = load_inode(&*dev, &sb, &groups, InodeNumber::ROOT)?;
        if !root.is_dir() {
            return Err(E2vError::Format(format!(
                "root inode has mode {:#o}, expected a directory",
                root.mode
            )));
        }

        debug!(
            magic = format_args!("{:#06x}", sb.magic),
            rev = sb.rev_level,
            block_size = sb.block_size,
            groups = groups.len(),
            inodes = sb.inodes_count,
            "opened ext2 volume"
        );

        Ok(Self {
            sb,
            groups,
            root,
            dev,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Ext2Superblock {
        &self.sb
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.sb.block_size
    }

    #[must_use]
    pub fn groups_count(&self) -> u32 {
        self.sb.groups_count()
    }

    /// The full descriptor table, indexed by group number.
    #[must_use]
    pub fn group_descriptors(&self) -> &[Ext2GroupDesc] {
        &self.groups
    }

    /// Descriptor for `group`.
    pub fn group_desc(&self, group: GroupNumber) -> Result<&Ext2GroupDesc> {
        usize::try_from(group.0)
            .ok()
            .and_then(|i| self.groups.get(i))
            .ok_or(E2vError::OutOfRange {
                what: "group",
                index: u64::from(group.0),
                limit: self.groups.len() as u64,
            })
    }

    /// The root directory inode, decoded at open.
    #[must_use]
    pub fn root(&self) -> &Inode {
        &self.root
    }

    /// Read one block of the volume.
    ///
    /// Blocks at or past `s_blocks_count` are a range error and are never
    /// requested from the device.
    pub fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        read_volume_block(&*self.dev, &self.sb, block)
    }

    /// Read inode `ino` (1-based).
    pub fn read_inode(&self, ino: InodeNumber) -> Result<Inode> {
        load_inode(&*self.dev, &self.sb, &self.groups, ino)
    }

    /// Map logical block `logical` of `inode` to a physical block.
    ///
    /// `Ok(None)` is a hole. Direct slots are answered from the inode alone.
    pub fn resolve_block(&self, inode: &Inode, logical: u64) -> Result<Option<BlockNumber>> {
        if inode.uses_extents() {
            return Err(E2vError::UnsupportedFeature(format!(
                "inode {} is extent-mapped",
                inode.ino
            )));
        }
        let ppb = self.sb.pointers_per_block();
        let Some(route) = block_map_path(logical, ppb) else {
            return Err(E2vError::OutOfRange {
                what: "logical block",
                index: logical,
                limit: block_map_capacity(ppb),
            });
        };

        let physical = match route {
            BlockMapPath::Direct(slot) => nonzero(inode.direct[slot]),
            BlockMapPath::Single(a) => self.follow(inode.single_indirect, &[a])?,
            BlockMapPath::Double(a, b) => self.follow(inode.double_indirect, &[a, b])?,
            BlockMapPath::Triple(a, b, c) => self.follow(inode.triple_indirect, &[a, b, c])?,
        };
        trace!(ino = inode.ino.0, logical, physical = ?physical.map(|b| b.0), "resolve block");
        Ok(physical)
    }

    /// Walk a chain of indirect blocks starting at pointer `root`.
    fn follow(&self, root: u32, slots: &[u32]) -> Result<Option<BlockNumber>> {
        let mut ptr = root;
        for &slot in slots {
            let Some(table) = nonzero(ptr) else {
                return Ok(None);
            };
            let buf = self.read_block(table)?;
            ptr = read_block_pointer(buf.as_slice(), slot).map_err(|e| corruption_at(table, &e))?;
        }
        Ok(nonzero(ptr))
    }

    fn require_regular(inode: &Inode) -> Result<()> {
        if inode.is_dir() {
            return Err(E2vError::IsDirectory { ino: inode.ino.0 });
        }
        if !inode.is_regular() {
            return Err(E2vError::NotRegularFile { ino: inode.ino.0 });
        }
        Ok(())
    }

    /// Read file bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes copied, which is short only at end of
    /// file. Holes read as zeros.
    pub fn read_file_data(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Self::require_regular(inode)?;
        let file_size = u64::from(inode.size);
        if offset >= file_size || buf.is_empty() {
            return Ok(0);
        }

        let available = file_size - offset;
        let to_read = usize::try_from(available).map_or(buf.len(), |a| a.min(buf.len()));

        let bs = u64::from(self.block_size());
        let bs_usize = usize::try_from(self.block_size())
            .map_err(|_| E2vError::Format("block_size does not fit usize".to_owned()))?;
        let mut bytes_read = 0_usize;

        while bytes_read < to_read {
            let current_offset = offset + bytes_read as u64;
            let logical = current_offset / bs;
            #[allow(clippy::cast_possible_truncation)] // remainder < block_size
            let offset_in_block = (current_offset % bs) as usize;
            let chunk = (bs_usize - offset_in_block).min(to_read - bytes_read);
            let dest = &mut buf[bytes_read..bytes_read + chunk];

            match self.resolve_block(inode, logical)? {
                Some(block) => {
                    let data = self.read_block(block)?;
                    dest.copy_from_slice(&data.as_slice()[offset_in_block..offset_in_block + chunk]);
                }
                None => dest.fill(0),
            }
            bytes_read += chunk;
        }

        Ok(bytes_read)
    }

    /// Read up to `max_bytes` of a regular file from its start.
    ///
    /// The result holds exactly `min(max_bytes, size)` bytes.
    pub fn read(&self, inode: &Inode, max_bytes: usize) -> Result<Vec<u8>> {
        Self::require_regular(inode)?;
        let size = usize::try_from(inode.size).unwrap_or(usize::MAX);
        let mut buf = vec![0_u8; max_bytes.min(size)];
        let n = self.read_file_data(inode, 0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

fn nonzero(ptr: u32) -> Option<BlockNumber> {
    (ptr != 0).then(|| BlockNumber(u64::from(ptr)))
}

fn read_volume_block(
    dev: &dyn BlockDevice,
    sb: &Ext2Superblock,
    block: BlockNumber,
) -> Result<BlockBuf> {
    if block.0 >= u64::from(sb.blocks_count) {
        return Err(E2vError::OutOfRange {
            what: "block",
            index: block.0,
            limit: u64::from(sb.blocks_count),
        });
    }
    dev.read_block(block)
}

/// The descriptor table must lie inside the device before any of it is read.
///
/// Applies whether or not validation is skipped: the group count comes
/// straight from the superblock and sizes the table held in memory. A table
/// running past the device is a short image, reported like any short read.
fn check_group_table_fits(sb: &Ext2Superblock, device_blocks: u64) -> Result<()> {
    let end = sb.group_table_end();
    if end.0 > device_blocks {
        return Err(E2vError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!(
                "{} group descriptors end at block {end}, device holds {device_blocks} blocks",
                sb.groups_count()
            ),
        )));
    }
    Ok(())
}

fn read_group_table(dev: &dyn BlockDevice, sb: &Ext2Superblock) -> Result<Vec<Ext2GroupDesc>> {
    let count = sb.groups_count();
    let mut groups = Vec::new();
    let mut cached: Option<(BlockNumber, BlockBuf)> = None;

    for i in 0..count {
        let (block, offset) = sb.group_desc_location(GroupNumber(i));
        let buf = match cached.take() {
            Some((b, buf)) if b == block => buf,
            _ => read_volume_block(dev, sb, block)?,
        };
        let raw = buf
            .as_slice()
            .get(offset..offset + EXT2_GROUP_DESC_SIZE)
            .ok_or_else(|| E2vError::Corruption {
                block: block.0,
                detail: format!("group descriptor {i} crosses block end"),
            })?;
        groups.push(Ext2GroupDesc::parse_from_bytes(raw).map_err(|e| corruption_at(block, &e))?);
        cached = Some((block, buf));
    }

    trace!(count, "read group descriptor table");
    Ok(groups)
}

fn load_inode(
    dev: &dyn BlockDevice,
    sb: &Ext2Superblock,
    groups: &[Ext2GroupDesc],
    ino: InodeNumber,
) -> Result<Inode> {
    if ino.0 == 0 || ino.0 > u64::from(sb.inodes_count) {
        return Err(E2vError::OutOfRange {
            what: "inode",
            index: ino.0,
            limit: u64::from(sb.inodes_count),
        });
    }

    let loc = sb.locate_inode(ino);
    let gd = usize::try_from(loc.group.0)
        .ok()
        .and_then(|g| groups.get(g))
        .ok_or(E2vError::OutOfRange {
            what: "group",
            index: u64::from(loc.group.0),
            limit: groups.len() as u64,
        })?;
    let block = BlockNumber(u64::from(gd.inode_table) + loc.table_block);
    let buf = read_volume_block(dev, sb, block)?;

    let start = usize::try_from(loc.offset_in_block)
        .map_err(|_| E2vError::Format("inode offset does not fit usize".to_owned()))?;
    let len = usize::from(sb.inode_size).max(e2v_ondisk::ext2::EXT2_INODE_CORE_SIZE);
    let raw = buf
        .as_slice()
        .get(start..start + len)
        .ok_or_else(|| E2vError::Corruption {
            block: block.0,
            detail: format!("inode {ino} record crosses block end"),
        })?;
    let raw = Ext2Inode::parse_from_bytes(raw).map_err(|e| corruption_at(block, &e))?;
    Ok(Inode { ino, raw })
}
