#![forbid(unsafe_code)]

use e2v_types::{
    BlockNumber, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GROUP_DESC_SIZE, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE,
    EXT4_EXTENTS_FL, GroupNumber, InodeNumber, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, ensure_slice, ext2_block_size_from_log, inode_index_in_group,
    inode_to_group, read_fixed, read_le_u16, read_le_u32, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── feature flags ───────────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`). Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2CompatFeatures(pub u32);

impl Ext2CompatFeatures {
    pub const DIR_PREALLOC: Self = Self(0x0001);
    pub const IMAGIC_INODES: Self = Self(0x0002);
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "DIR_PREALLOC"),
        (0x0002, "IMAGIC_INODES"),
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

impl std::fmt::Display for Ext2CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// A reader that does not understand a set bit cannot interpret the volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2IncompatFeatures(pub u32);

impl Ext2IncompatFeatures {
    pub const COMPRESSION: Self = Self(0x0001);
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);
    pub const EXTENTS: Self = Self(0x0040);
    pub const BIT64: Self = Self(0x0080);
    pub const FLEX_BG: Self = Self(0x0200);

    /// Bits this reader can interpret. `RECOVER` is tolerated because the
    /// journal is never replayed; the caller is expected to warn.
    pub const SUPPORTED: Self = Self(Self::FILETYPE.0 | Self::RECOVER.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "COMPRESSION"),
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
        (0x0040, "EXTENTS"),
        (0x0080, "64BIT"),
        (0x0200, "FLEX_BG"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Bits outside [`Self::SUPPORTED`].
    #[must_use]
    pub fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }
}

impl std::fmt::Display for Ext2IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Read-only compatible feature flags (`s_feature_ro_compat`).
///
/// These only restrict writers, so a read-only decoder accepts all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2RoCompatFeatures(pub u32);

impl Ext2RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
    ];

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }
}

impl std::fmt::Display for Ext2RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Format a bitmask as `NAME|NAME`, `(none)` when zero, unknown bits as hex.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut names: Vec<String> = Vec::new();
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            names.push(name.to_owned());
            remaining &= !bit;
        }
    }
    if remaining != 0 {
        names.push(format!("{remaining:#x}"));
    }
    f.write_str(&names.join("|"))
}

// ── superblock ──────────────────────────────────────────────────────────────

/// Decoded ext2 superblock (`struct ext2_super_block`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // Counts
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,

    // Geometry
    pub first_data_block: u32,
    pub log_block_size: u32,
    /// Effective block size, `1024 << log_block_size`.
    pub block_size: u32,
    pub log_frag_size: u32,
    pub frag_size: u32,
    pub blocks_per_group: u32,
    pub frags_per_group: u32,
    pub inodes_per_group: u32,
    /// Inode record size. Always 128 on revision 0.
    pub inode_size: u16,
    /// First non-reserved inode. Always 11 on revision 0.
    pub first_ino: u32,
    pub block_group_nr: u16,

    // Identity
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // Revision & OS
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // Timestamps & mount bookkeeping
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: i16,
    pub lastcheck: u32,
    pub checkinterval: u32,

    // State
    pub state: u16,
    pub errors: u16,
    pub def_resuid: u16,
    pub def_resgid: u16,

    // Features
    pub feature_compat: Ext2CompatFeatures,
    pub feature_incompat: Ext2IncompatFeatures,
    pub feature_ro_compat: Ext2RoCompatFeatures,

    // Performance hints
    pub algorithm_usage_bitmap: u32,
    pub prealloc_blocks: u8,
    pub prealloc_dir_blocks: u8,

    // Journal
    pub journal_uuid: [u8; 16],
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub last_orphan: u32,
}

/// Where an inode record lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InodeLocation {
    pub group: GroupNumber,
    /// Index of the inode within its group's inode table.
    pub index: u32,
    /// Block offset from the start of the group's inode table.
    pub table_block: u64,
    /// Byte offset within that block.
    pub offset_in_block: u32,
}

impl Ext2Superblock {
    /// Parse the 1024-byte superblock region (bytes 1024..2048 of the image).
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = match ext2_block_size_from_log(log_block_size) {
            Some(size) if size <= 65536 => size,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "s_log_block_size",
                    reason: "block size must be a power of two in 1024..=65536",
                });
            }
        };
        let log_frag_size = read_le_u32(region, 0x1C)?;
        let frag_size = ext2_block_size_from_log(log_frag_size).unwrap_or(0);

        let blocks_per_group = read_le_u32(region, 0x20)?;
        if blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        let inodes_per_group = read_le_u32(region, 0x28)?;
        if inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }

        // Revision 0 leaves these fields undefined.
        let rev_level = read_le_u32(region, 0x4C)?;
        let (first_ino, inode_size) = if rev_level == 0 {
            (EXT2_GOOD_OLD_FIRST_INO, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,

            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            log_frag_size,
            frag_size,
            blocks_per_group,
            frags_per_group: read_le_u32(region, 0x24)?,
            inodes_per_group,
            inode_size,
            first_ino,
            block_group_nr: read_le_u16(region, 0x5A)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: i16::from_le_bytes(read_fixed::<2>(region, 0x36)?),
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            feature_compat: Ext2CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: Ext2IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: Ext2RoCompatFeatures(read_le_u32(region, 0x64)?),

            algorithm_usage_bitmap: read_le_u32(region, 0xC8)?,
            prealloc_blocks: read_u8(region, 0xCC)?,
            prealloc_dir_blocks: read_u8(region, 0xCD)?,

            journal_uuid: read_fixed::<16>(region, 0xD0)?,
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,
            last_orphan: read_le_u32(region, 0xE8)?,
        })
    }

    /// Number of block groups: `ceil(blocks_count / blocks_per_group)`, at least 1.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        e2v_types::groups_for_blocks(self.blocks_count, self.blocks_per_group).unwrap_or(1)
    }

    /// Number of 32-bit block pointers per indirect block.
    #[must_use]
    pub fn pointers_per_block(&self) -> u32 {
        self.block_size / 4
    }

    /// Whether the volume was not cleanly unmounted and its journal holds
    /// unreplayed transactions.
    #[must_use]
    pub fn needs_recovery(&self) -> bool {
        self.feature_incompat
            .contains(Ext2IncompatFeatures::RECOVER)
    }

    /// Mount-time consistency checks beyond the signature.
    pub fn validate(&self) -> Result<(), ParseError> {
        // ── per-group counts ────────────────────────────────────────────
        let bitmap_bits = self.block_size.saturating_mul(8);
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        // ── inode_size ──────────────────────────────────────────────────
        if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(self.inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }

        // ── layout ──────────────────────────────────────────────────────
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be less than s_blocks_count",
            });
        }
        if self.inodes_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "cannot be zero",
            });
        }
        let max_inodes = u64::from(self.groups_count()) * u64::from(self.inodes_per_group);
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "exceeds groups_count * inodes_per_group",
            });
        }

        // ── features ────────────────────────────────────────────────────
        if self.feature_incompat.unsupported().0 != 0 {
            return Err(ParseError::InvalidField {
                field: "s_feature_incompat",
                reason: "unsupported incompatible feature",
            });
        }

        Ok(())
    }

    /// Location of group descriptor `group`: the block holding it and the
    /// byte offset inside that block.
    #[must_use]
    pub fn group_desc_location(&self, group: GroupNumber) -> (BlockNumber, usize) {
        let table_start = u64::from(self.first_data_block) + 1;
        let byte = u64::from(group.0) * EXT2_GROUP_DESC_SIZE as u64;
        let bs = u64::from(self.block_size);
        // byte % bs < block_size <= 65536, always fits usize.
        #[allow(clippy::cast_possible_truncation)]
        let offset = (byte % bs) as usize;
        (BlockNumber(table_start + byte / bs), offset)
    }

    /// One past the last block of the group descriptor table.
    #[must_use]
    pub fn group_table_end(&self) -> BlockNumber {
        let bytes = u64::from(self.groups_count()) * EXT2_GROUP_DESC_SIZE as u64;
        let table_start = u64::from(self.first_data_block) + 1;
        BlockNumber(table_start + bytes.div_ceil(u64::from(self.block_size.max(1))))
    }

    /// Compute where inode `ino` lives. `ino` must be in `1..=inodes_count`.
    #[must_use]
    pub fn locate_inode(&self, ino: InodeNumber) -> InodeLocation {
        let group = inode_to_group(ino, self.inodes_per_group);
        let index = inode_index_in_group(ino, self.inodes_per_group);
        let byte = u64::from(index) * u64::from(self.inode_size);
        let bs = u64::from(self.block_size);
        #[allow(clippy::cast_possible_truncation)] // remainder of a u32 divisor
        let offset_in_block = (byte % bs) as u32;
        InodeLocation {
            group,
            index,
            table_block: byte / bs,
            offset_in_block,
        }
    }
}

// ── group descriptor ────────────────────────────────────────────────────────

/// Block group descriptor (`struct ext2_group_desc`, 32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(bytes, 0, EXT2_GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

// ── inode ───────────────────────────────────────────────────────────────────

/// Size of the fields this decoder reads from each inode record.
pub const EXT2_INODE_CORE_SIZE: usize = 128;

/// Decoded inode (`struct ext2_inode`).
///
/// Plain value; decoding the same record twice yields equal inodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Low 32 bits of the file size.
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    /// 512-byte sectors allocated to the inode.
    pub sectors: u32,
    pub flags: u32,
    pub osd1: u32,
    pub direct: [u32; EXT2_NDIR_BLOCKS],
    pub single_indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
    pub generation: u32,
    pub file_acl: u32,
    /// `i_dir_acl` on directories, `i_size_high` on regular files.
    pub dir_acl: u32,
    pub faddr: u32,
    pub osd2: [u8; 12],
}

impl Ext2Inode {
    /// Parse an inode record. Only the first 128 bytes are decoded; larger
    /// records carry extra fields this reader ignores.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let bytes = ensure_slice(bytes, 0, EXT2_INODE_CORE_SIZE)?;

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        let mut direct = [0_u32; EXT2_NDIR_BLOCKS];
        direct.copy_from_slice(&block[..EXT2_NDIR_BLOCKS]);

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            gid: read_le_u16(bytes, 0x18)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            sectors: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            osd1: read_le_u32(bytes, 0x24)?,
            direct,
            single_indirect: block[12],
            double_indirect: block[13],
            triple_indirect: block[14],
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,
            dir_acl: read_le_u32(bytes, 0x6C)?,
            faddr: read_le_u32(bytes, 0x70)?,
            osd2: read_fixed::<12>(bytes, 0x74)?,
        })
    }

    /// The file type bits of `mode`.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type_mode() == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permission_bits(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Whether the inode is mapped by an extent tree rather than block pointers.
    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT4_EXTENTS_FL) != 0
    }

    /// Number of logical blocks covered by `size`.
    #[must_use]
    pub fn logical_block_count(&self, block_size: u32) -> u64 {
        u64::from(self.size).div_ceil(u64::from(block_size))
    }
}

// ── block map ───────────────────────────────────────────────────────────────

/// Route from a logical block index to the pointer slots that map it.
///
/// Indices inside each level are slot numbers within the pointer block at
/// that level, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapPath {
    Direct(usize),
    Single(u32),
    Double(u32, u32),
    Triple(u32, u32, u32),
}

/// Total logical blocks addressable through direct and indirect pointers.
#[must_use]
pub fn block_map_capacity(ptrs_per_block: u32) -> u64 {
    let p = u64::from(ptrs_per_block);
    EXT2_NDIR_BLOCKS as u64 + p + p * p + p * p * p
}

/// Decompose `logical` into the slots that map it with `ptrs_per_block`
/// pointers per indirect block. `None` beyond triple-indirect capacity.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // every slot is < ptrs_per_block (u32)
pub fn block_map_path(logical: u64, ptrs_per_block: u32) -> Option<BlockMapPath> {
    let p = u64::from(ptrs_per_block);
    if p == 0 {
        return None;
    }
    let ndir = EXT2_NDIR_BLOCKS as u64;
    if logical < ndir {
        return Some(BlockMapPath::Direct(logical as usize));
    }

    let k = logical - ndir;
    if k < p {
        return Some(BlockMapPath::Single(k as u32));
    }

    let k = k - p;
    if k < p * p {
        return Some(BlockMapPath::Double((k / p) as u32, (k % p) as u32));
    }

    let k = k - p * p;
    if k < p * p * p {
        return Some(BlockMapPath::Triple(
            (k / (p * p)) as u32,
            ((k / p) % p) as u32,
            (k % p) as u32,
        ));
    }

    None
}

/// Read pointer slot `slot` from an indirect block.
pub fn read_block_pointer(block: &[u8], slot: u32) -> Result<u32, ParseError> {
    let offset = usize::try_from(slot)
        .ok()
        .and_then(|s| s.checked_mul(4))
        .ok_or(ParseError::IntegerConversion {
            field: "block_pointer_slot",
        })?;
    read_le_u32(block, offset)
}

// ── directory entries ───────────────────────────────────────────────────────

/// File type hint stored in directory entries (`FILETYPE` feature).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Classify an inode mode.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Single-character tag in the style of `ls -l`.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Unknown => '?',
            Self::RegFile => '-',
            Self::Dir => 'd',
            Self::Chrdev => 'c',
            Self::Blkdev => 'b',
            Self::Fifo => 'p',
            Self::Sock => 's',
            Self::Symlink => 'l',
        }
    }
}

/// A decoded directory entry (`struct ext2_dir_entry_2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// The minimal on-disk size of this entry (header + name, padded to 4).
    #[must_use]
    pub fn actual_size(&self) -> usize {
        (EXT2_DIR_ENTRY_HEADER_LEN + usize::from(self.name_len) + 3) & !3
    }

    /// Name as UTF-8 (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Iterator over the live entries of one directory block.
///
/// Deleted slots (inode 0) are skipped. A zero `rec_len` ends the block.
/// A malformed header yields one error and ends iteration.
#[derive(Debug)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }

    /// Decode the record at the cursor. `Ok(None)` marks end of block.
    fn decode_at(&self) -> Result<Option<(Ext2DirEntry, usize)>, ParseError> {
        let at = self.offset;
        if at + EXT2_DIR_ENTRY_HEADER_LEN > self.block.len() {
            return Ok(None);
        }

        let inode = read_le_u32(self.block, at)?;
        let rec_len = read_le_u16(self.block, at + 4)?;
        let name_len = read_u8(self.block, at + 6)?;
        let file_type = read_u8(self.block, at + 7)?;

        if rec_len == 0 {
            return Ok(None);
        }
        let rec = usize::from(rec_len);
        if rec < EXT2_DIR_ENTRY_HEADER_LEN {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry rec_len < 8",
            });
        }
        if at + rec > self.block.len() {
            return Err(ParseError::InvalidField {
                field: "rec_len",
                reason: "directory entry extends past block boundary",
            });
        }
        if EXT2_DIR_ENTRY_HEADER_LEN + usize::from(name_len) > rec {
            return Err(ParseError::InvalidField {
                field: "name_len",
                reason: "name extends past rec_len",
            });
        }

        let name = ensure_slice(
            self.block,
            at + EXT2_DIR_ENTRY_HEADER_LEN,
            usize::from(name_len),
        )?
        .to_vec();
        let entry = Ext2DirEntry {
            inode,
            rec_len,
            name_len,
            file_type: Ext2FileType::from_raw(file_type),
            name,
        };
        Ok(Some((entry, rec)))
    }
}

impl Iterator for DirBlockIter<'_> {
    type Item = Result<Ext2DirEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            match self.decode_at() {
                Ok(Some((entry, rec))) => {
                    self.offset += rec;
                    if entry.inode != 0 {
                        return Some(Ok(entry));
                    }
                }
                Ok(None) => self.done = true,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Collect all live entries of a directory block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    DirBlockIter::new(block).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn make_superblock() -> Vec<u8> {
        let mut sb = vec![0_u8; EXT2_SUPERBLOCK_SIZE];
        put_u32(&mut sb, 0x00, 2048); // inodes_count
        put_u32(&mut sb, 0x04, 8192); // blocks_count
        put_u32(&mut sb, 0x0C, 7000); // free_blocks_count
        put_u32(&mut sb, 0x14, 1); // first_data_block
        put_u32(&mut sb, 0x18, 0); // 1K blocks
        put_u32(&mut sb, 0x20, 8192); // blocks_per_group
        put_u32(&mut sb, 0x24, 8192); // frags_per_group
        put_u32(&mut sb, 0x28, 2048); // inodes_per_group
        put_u16(&mut sb, 0x36, 0xFFFF); // max_mnt_count = -1
        put_u16(&mut sb, 0x38, EXT2_SUPER_MAGIC);
        put_u16(&mut sb, 0x3A, 1); // clean
        put_u32(&mut sb, 0x4C, 1); // dynamic revision
        put_u32(&mut sb, 0x54, 11);
        put_u16(&mut sb, 0x58, 256);
        put_u32(&mut sb, 0x60, Ext2IncompatFeatures::FILETYPE.0);
        sb[0x78..0x7E].copy_from_slice(b"rootfs");
        sb
    }

    #[test]
    fn parse_superblock_fields() {
        let sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        assert_eq!(sb.magic, EXT2_SUPER_MAGIC);
        assert_eq!(sb.inodes_count, 2048);
        assert_eq!(sb.blocks_count, 8192);
        assert_eq!(sb.free_blocks_count, 7000);
        assert_eq!(sb.first_data_block, 1);
        assert_eq!(sb.block_size, 1024);
        assert_eq!(sb.frag_size, 1024);
        assert_eq!(sb.inode_size, 256);
        assert_eq!(sb.first_ino, 11);
        assert_eq!(sb.max_mnt_count, -1);
        assert_eq!(sb.volume_name, "rootfs");
        assert_eq!(sb.groups_count(), 1);
        assert_eq!(sb.pointers_per_block(), 256);
        assert!(sb.validate().is_ok());
    }

    #[test]
    fn rev0_uses_fixed_inode_size_and_first_ino() {
        let mut raw = make_superblock();
        put_u32(&mut raw, 0x4C, 0);
        // Garbage in the dynamic-revision fields must be ignored.
        put_u32(&mut raw, 0x54, 999);
        put_u16(&mut raw, 0x58, 1000);
        let sb = Ext2Superblock::parse_superblock_region(&raw).expect("parse");
        assert_eq!(sb.inode_size, 128);
        assert_eq!(sb.first_ino, 11);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = make_superblock();
        put_u16(&mut raw, 0x38, 0x1234);
        assert_eq!(
            Ext2Superblock::parse_superblock_region(&raw),
            Err(ParseError::InvalidMagic {
                expected: 0xEF53,
                actual: 0x1234,
            })
        );
    }

    #[test]
    fn short_region_is_rejected() {
        let raw = make_superblock();
        assert!(matches!(
            Ext2Superblock::parse_superblock_region(&raw[..512]),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn zero_per_group_counts_are_rejected() {
        let mut raw = make_superblock();
        put_u32(&mut raw, 0x20, 0);
        assert!(matches!(
            Ext2Superblock::parse_superblock_region(&raw),
            Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                ..
            })
        ));

        let mut raw = make_superblock();
        put_u32(&mut raw, 0x28, 0);
        assert!(matches!(
            Ext2Superblock::parse_superblock_region(&raw),
            Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                ..
            })
        ));
    }

    #[test]
    fn oversized_block_shift_is_rejected() {
        let mut raw = make_superblock();
        put_u32(&mut raw, 0x18, 7); // 128K
        assert!(matches!(
            Ext2Superblock::parse_superblock_region(&raw),
            Err(ParseError::InvalidField {
                field: "s_log_block_size",
                ..
            })
        ));
    }

    #[test]
    fn groups_count_uses_ceiling_division() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        for (blocks, per_group, expected) in [
            (8192, 8192, 1),
            (8193, 8192, 2),
            (20_000, 8192, 3),
            (100, 8192, 1),
            (32_768, 8192, 4),
        ] {
            sb.blocks_count = blocks;
            sb.blocks_per_group = per_group;
            assert_eq!(sb.groups_count(), expected, "blocks={blocks}");
        }
    }

    #[test]
    fn validate_rejects_unsupported_incompat() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        sb.feature_incompat = Ext2IncompatFeatures(
            Ext2IncompatFeatures::FILETYPE.0 | Ext2IncompatFeatures::EXTENTS.0,
        );
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField {
                field: "s_feature_incompat",
                ..
            })
        ));

        sb.feature_incompat = Ext2IncompatFeatures(
            Ext2IncompatFeatures::FILETYPE.0 | Ext2IncompatFeatures::RECOVER.0,
        );
        assert!(sb.validate().is_ok());
        assert!(sb.needs_recovery());
    }

    #[test]
    fn validate_rejects_bad_inode_size() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        sb.inode_size = 200;
        assert!(sb.validate().is_err());
        sb.inode_size = 2048;
        assert!(sb.validate().is_err());
        sb.inode_size = 128;
        assert!(sb.validate().is_ok());
    }

    #[test]
    fn validate_rejects_first_data_block_past_end() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        sb.first_data_block = sb.blocks_count;
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidField {
                field: "s_first_data_block",
                ..
            })
        ));
    }

    #[test]
    fn group_desc_location_follows_superblock() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        // 1K blocks: table starts at block 2; 32 descriptors per block.
        assert_eq!(sb.group_desc_location(GroupNumber(0)), (BlockNumber(2), 0));
        assert_eq!(sb.group_desc_location(GroupNumber(1)), (BlockNumber(2), 32));
        assert_eq!(sb.group_desc_location(GroupNumber(32)), (BlockNumber(3), 0));

        // 4K blocks: first_data_block is 0, table at block 1.
        sb.first_data_block = 0;
        sb.block_size = 4096;
        assert_eq!(sb.group_desc_location(GroupNumber(0)), (BlockNumber(1), 0));
        assert_eq!(sb.group_desc_location(GroupNumber(130)), (BlockNumber(2), 64));
    }

    #[test]
    fn group_table_end_rounds_up_to_whole_blocks() {
        let mut sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        // One group, one 32-byte descriptor: table is block 2 alone.
        assert_eq!(sb.group_table_end(), BlockNumber(3));

        // 34 groups need two 1K blocks of descriptors.
        sb.blocks_per_group = 248;
        assert_eq!(sb.groups_count(), 34);
        assert_eq!(sb.group_table_end(), BlockNumber(4));

        sb.blocks_count = u32::MAX;
        sb.blocks_per_group = 1;
        assert_eq!(
            sb.group_table_end(),
            BlockNumber(2 + (u64::from(u32::MAX) * 32).div_ceil(1024))
        );
    }

    #[test]
    fn locate_inode_matches_independent_arithmetic() {
        let sb = Ext2Superblock::parse_superblock_region(&make_superblock()).expect("parse");
        for n in [1_u64, 2, 3, 4, 5, 11, 2047, 2048] {
            let loc = sb.locate_inode(InodeNumber(n));
            let group = (n - 1) / u64::from(sb.inodes_per_group);
            let index = (n - 1) % u64::from(sb.inodes_per_group);
            let byte = index * u64::from(sb.inode_size);
            assert_eq!(u64::from(loc.group.0), group);
            assert_eq!(u64::from(loc.index), index);
            assert_eq!(loc.table_block, byte / 1024);
            assert_eq!(u64::from(loc.offset_in_block), byte % 1024);
        }
        // 256-byte inodes, 1K blocks: inode 5 is the first record of table block 1.
        let loc = sb.locate_inode(InodeNumber(5));
        assert_eq!((loc.table_block, loc.offset_in_block), (1, 0));
    }

    #[test]
    fn parse_group_desc() {
        let mut raw = [0_u8; 32];
        put_u32(&mut raw, 0x00, 3);
        put_u32(&mut raw, 0x04, 4);
        put_u32(&mut raw, 0x08, 5);
        put_u16(&mut raw, 0x0C, 100);
        put_u16(&mut raw, 0x0E, 200);
        put_u16(&mut raw, 0x10, 2);
        let gd = Ext2GroupDesc::parse_from_bytes(&raw).expect("gd");
        assert_eq!(
            gd,
            Ext2GroupDesc {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                free_blocks_count: 100,
                free_inodes_count: 200,
                used_dirs_count: 2,
            }
        );
        assert!(Ext2GroupDesc::parse_from_bytes(&raw[..20]).is_err());
    }

    #[test]
    fn parse_inode_pointers_and_type() {
        let mut raw = [0_u8; 128];
        put_u16(&mut raw, 0x00, S_IFREG | 0o644);
        put_u32(&mut raw, 0x04, 5000);
        put_u16(&mut raw, 0x1A, 1);
        for i in 0..15 {
            put_u32(&mut raw, 0x28 + i * 4, 100 + i as u32);
        }
        put_u32(&mut raw, 0x64, 77);
        let inode = Ext2Inode::parse_from_bytes(&raw).expect("inode");
        assert!(inode.is_regular());
        assert!(!inode.is_dir());
        assert_eq!(inode.permission_bits(), 0o644);
        assert_eq!(inode.size, 5000);
        assert_eq!(inode.direct[0], 100);
        assert_eq!(inode.direct[11], 111);
        assert_eq!(inode.single_indirect, 112);
        assert_eq!(inode.double_indirect, 113);
        assert_eq!(inode.triple_indirect, 114);
        assert_eq!(inode.generation, 77);
        assert_eq!(inode.logical_block_count(1024), 5);
        assert_eq!(inode.file_type(), Ext2FileType::RegFile);
        assert!(!inode.uses_extents());
    }

    #[test]
    fn inode_type_uses_masked_mode() {
        let mut raw = [0_u8; 128];
        // A symlink has both the S_IFREG and S_IFDIR bits set individually;
        // only the masked comparison classifies it correctly.
        put_u16(&mut raw, 0x00, S_IFLNK | 0o777);
        let inode = Ext2Inode::parse_from_bytes(&raw).expect("inode");
        assert!(inode.is_symlink());
        assert!(!inode.is_dir());
        assert!(!inode.is_regular());
    }

    #[test]
    fn block_map_path_boundaries() {
        let p = 256;
        assert_eq!(block_map_path(0, p), Some(BlockMapPath::Direct(0)));
        assert_eq!(block_map_path(11, p), Some(BlockMapPath::Direct(11)));
        assert_eq!(block_map_path(12, p), Some(BlockMapPath::Single(0)));
        assert_eq!(block_map_path(12 + 255, p), Some(BlockMapPath::Single(255)));
        assert_eq!(block_map_path(12 + 256, p), Some(BlockMapPath::Double(0, 0)));
        assert_eq!(
            block_map_path(12 + 256 + 257, p),
            Some(BlockMapPath::Double(1, 1))
        );
        let triple_start = 12 + 256 + 256 * 256;
        assert_eq!(
            block_map_path(triple_start, p),
            Some(BlockMapPath::Triple(0, 0, 0))
        );
        assert_eq!(
            block_map_path(triple_start + 256 * 256 + 256 + 1, p),
            Some(BlockMapPath::Triple(1, 1, 1))
        );
        let cap = block_map_capacity(p);
        assert_eq!(cap, triple_start + 256 * 256 * 256);
        assert!(block_map_path(cap - 1, p).is_some());
        assert_eq!(block_map_path(cap, p), None);
    }

    #[test]
    fn read_block_pointer_slots() {
        let mut block = vec![0_u8; 1024];
        put_u32(&mut block, 0, 9);
        put_u32(&mut block, 1020, 42);
        assert_eq!(read_block_pointer(&block, 0), Ok(9));
        assert_eq!(read_block_pointer(&block, 255), Ok(42));
        assert!(read_block_pointer(&block, 256).is_err());
    }

    fn write_dirent(buf: &mut [u8], off: usize, ino: u32, rec_len: u16, ft: u8, name: &[u8]) {
        put_u32(buf, off, ino);
        put_u16(buf, off + 4, rec_len);
        buf[off + 6] = u8::try_from(name.len()).expect("name fits u8");
        buf[off + 7] = ft;
        buf[off + 8..off + 8 + name.len()].copy_from_slice(name);
    }

    #[test]
    fn dir_block_skips_deleted_and_keeps_order() {
        let mut block = vec![0_u8; 1024];
        write_dirent(&mut block, 0, 2, 12, 2, b".");
        write_dirent(&mut block, 12, 2, 12, 2, b"..");
        write_dirent(&mut block, 24, 0, 16, 1, b"gone");
        write_dirent(&mut block, 40, 12, 984, 1, b"hello.txt");

        let entries = parse_dir_block(&block).expect("parse");
        let names: Vec<String> = entries.iter().map(Ext2DirEntry::name_str).collect();
        assert_eq!(names, vec![".", "..", "hello.txt"]);
        assert!(entries[0].is_dot());
        assert!(entries[1].is_dotdot());
        assert_eq!(entries[2].inode, 12);
        assert_eq!(entries[2].file_type, Ext2FileType::RegFile);
        assert_eq!(entries[2].actual_size(), 20);
    }

    #[test]
    fn dir_block_zero_rec_len_ends_block() {
        let mut block = vec![0_u8; 1024];
        write_dirent(&mut block, 0, 11, 20, 2, b"lost+found");
        // Remaining bytes are zero: rec_len 0 at offset 20.
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"lost+found");
    }

    #[test]
    fn dir_block_rejects_rec_len_past_block() {
        let mut block = vec![0_u8; 64];
        write_dirent(&mut block, 0, 5, 128, 1, b"x");
        let mut iter = DirBlockIter::new(&block);
        assert!(matches!(
            iter.next(),
            Some(Err(ParseError::InvalidField {
                field: "rec_len",
                ..
            }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn dir_block_rejects_name_longer_than_record() {
        let mut block = vec![0_u8; 64];
        write_dirent(&mut block, 0, 5, 12, 1, b"abcdefgh");
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                field: "name_len",
                ..
            })
        ));
    }

    #[test]
    fn file_type_from_mode_and_raw() {
        assert_eq!(Ext2FileType::from_raw(2), Ext2FileType::Dir);
        assert_eq!(Ext2FileType::from_raw(200), Ext2FileType::Unknown);
        assert_eq!(Ext2FileType::from_mode(S_IFDIR | 0o755), Ext2FileType::Dir);
        assert_eq!(Ext2FileType::from_mode(S_IFSOCK), Ext2FileType::Sock);
        assert_eq!(Ext2FileType::Dir.tag(), 'd');
    }

    #[test]
    fn feature_display() {
        let f = Ext2IncompatFeatures(
            Ext2IncompatFeatures::FILETYPE.0 | Ext2IncompatFeatures::RECOVER.0 | 0x8000_0000,
        );
        assert_eq!(f.to_string(), "FILETYPE|RECOVER|0x80000000");
        assert_eq!(Ext2CompatFeatures(0).to_string(), "(none)");
        assert_eq!(
            Ext2RoCompatFeatures(0x3).to_string(),
            "SPARSE_SUPER|LARGE_FILE"
        );
    }
}
