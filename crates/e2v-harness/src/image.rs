//! Synthetic ext2 image construction.
//!
//! [`Ext2ImageBuilder`] lays out a small but structurally complete volume:
//! superblock, group descriptor table, bitmaps, inode tables, a root
//! directory with `lost+found`, and whatever files and directories the
//! caller adds. Block pointers (including indirect chains) are computed
//! here with plain arithmetic so the reader under test is checked against
//! an independent mapping.

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub const ROOT_INO: u32 = 2;
pub const LOST_FOUND_INO: u32 = 11;

const SUPERBLOCK_OFFSET: usize = 1024;
const GROUP_DESC_SIZE: u32 = 32;
const FIRST_INO: u32 = 11;
/// Fixed timestamp stamped on every inode and the superblock.
const STAMP: u32 = 1_700_000_000;

const MODE_DIR: u16 = 0o040_755;
const MODE_FILE: u16 = 0o100_644;
const MODE_SYMLINK: u16 = 0o120_777;

const FT_REG: u8 = 1;
const FT_DIR: u8 = 2;
const FT_SYMLINK: u8 = 7;

const INCOMPAT_FILETYPE: u32 = 0x0002;

/// Volume geometry for a synthetic image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    pub block_size: u32,
    pub blocks_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub rev_level: u32,
}

impl Default for ImageGeometry {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: 2048,
            blocks_per_group: 8192,
            inodes_per_group: 128,
            inode_size: 128,
            rev_level: 1,
        }
    }
}

impl ImageGeometry {
    #[must_use]
    pub fn first_data_block(&self) -> u32 {
        u32::from(self.block_size == 1024)
    }

    #[must_use]
    pub fn groups_count(&self) -> u32 {
        self.blocks_count.div_ceil(self.blocks_per_group).max(1)
    }

    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        (self.inodes_per_group * u32::from(self.inode_size)).div_ceil(self.block_size)
    }

    #[must_use]
    pub fn gdt_blocks(&self) -> u32 {
        (self.groups_count() * GROUP_DESC_SIZE).div_ceil(self.block_size)
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupLayout {
    start: u32,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
}

#[derive(Debug, Clone)]
struct InodeSpec {
    mode: u16,
    size: u32,
    links: u16,
    flags: u32,
    i_block: [u32; 15],
    /// Data and pointer blocks owned by the inode, for `i_blocks`.
    owned_blocks: u32,
}

#[derive(Debug, Clone)]
struct DirSlot {
    ino: u32,
    file_type: u8,
    name: Vec<u8>,
}

/// Builder for an in-memory ext2 image.
#[derive(Debug)]
pub struct Ext2ImageBuilder {
    geometry: ImageGeometry,
    image: Vec<u8>,
    groups: Vec<GroupLayout>,
    reserved: BTreeSet<u32>,
    used_blocks: BTreeSet<u32>,
    next_block: u32,
    next_ino: u32,
    inodes: BTreeMap<u32, InodeSpec>,
    dirs: BTreeMap<u32, Vec<DirSlot>>,
    volume_name: String,
    incompat: u32,
}

impl Ext2ImageBuilder {
    /// Lay out metadata for `geometry` and create `/` and `/lost+found`.
    pub fn new(geometry: ImageGeometry) -> Result<Self> {
        ensure!(
            matches!(geometry.block_size, 1024 | 2048 | 4096),
            "unsupported block size {}",
            geometry.block_size
        );
        ensure!(geometry.blocks_per_group > 0, "blocks_per_group is zero");
        ensure!(
            geometry.inodes_per_group > FIRST_INO,
            "inodes_per_group must exceed the reserved inodes"
        );
        ensure!(
            geometry.inode_size >= 128 && u32::from(geometry.inode_size) <= geometry.block_size,
            "bad inode size {}",
            geometry.inode_size
        );
        let len = usize::try_from(u64::from(geometry.blocks_count) * u64::from(geometry.block_size))
            .context("image too large")?;

        let mut builder = Self {
            geometry,
            image: vec![0_u8; len],
            groups: Vec::new(),
            reserved: BTreeSet::new(),
            used_blocks: BTreeSet::new(),
            next_block: 0,
            next_ino: FIRST_INO,
            inodes: BTreeMap::new(),
            dirs: BTreeMap::new(),
            volume_name: "e2v-test".to_owned(),
            incompat: INCOMPAT_FILETYPE,
        };
        builder.layout_groups()?;

        builder.inodes.insert(ROOT_INO, dir_inode());
        builder.dirs.insert(ROOT_INO, dot_entries(ROOT_INO, ROOT_INO));
        let lost_found = builder.add_dir(ROOT_INO, "lost+found")?;
        debug_assert_eq!(lost_found, LOST_FOUND_INO);
        Ok(builder)
    }

    fn layout_groups(&mut self) -> Result<()> {
        let g = self.geometry;
        let first = g.first_data_block();
        let itb = g.inode_table_blocks();
        // Block 0 holds the boot sector (and the superblock on >1K volumes).
        self.reserved.insert(0);
        for group in 0..g.groups_count() {
            let start = first + group * g.blocks_per_group;
            let meta_start = if group == 0 {
                self.reserved.insert(start);
                for b in 0..g.gdt_blocks() {
                    self.reserved.insert(start + 1 + b);
                }
                start + 1 + g.gdt_blocks()
            } else {
                start
            };
            let layout = GroupLayout {
                start,
                block_bitmap: meta_start,
                inode_bitmap: meta_start + 1,
                inode_table: meta_start + 2,
            };
            let meta_end = layout.inode_table + itb;
            if meta_end > g.blocks_count {
                bail!("group {group} metadata does not fit: ends at {meta_end}");
            }
            for b in meta_start..meta_end {
                self.reserved.insert(b);
            }
            self.groups.push(layout);
        }
        self.next_block = 0;
        Ok(())
    }

    #[must_use]
    pub fn geometry(&self) -> ImageGeometry {
        self.geometry
    }

    pub fn set_volume_name(&mut self, name: &str) -> &mut Self {
        name.clone_into(&mut self.volume_name);
        self
    }

    /// Set extra incompatible feature bits in the superblock.
    pub fn set_incompat(&mut self, bits: u32) -> &mut Self {
        self.incompat = bits;
        self
    }

    /// Inode table start block of `group`.
    #[must_use]
    pub fn inode_table_block(&self, group: u32) -> Option<u32> {
        self.groups
            .get(usize::try_from(group).ok()?)
            .map(|g| g.inode_table)
    }

    fn alloc_block(&mut self) -> Result<u32> {
        let mut candidate = self.next_block;
        while candidate < self.geometry.blocks_count {
            if !self.reserved.contains(&candidate) && !self.used_blocks.contains(&candidate) {
                self.used_blocks.insert(candidate);
                self.next_block = candidate + 1;
                return Ok(candidate);
            }
            candidate += 1;
        }
        bail!("image is full ({} blocks)", self.geometry.blocks_count)
    }

    fn alloc_ino(&mut self) -> Result<u32> {
        let total = self.geometry.groups_count() * self.geometry.inodes_per_group;
        ensure!(self.next_ino <= total, "out of inodes ({total})");
        let ino = self.next_ino;
        self.next_ino += 1;
        Ok(ino)
    }

    /// Skip ahead so the next allocated inode is `ino`. Lets tests place
    /// inodes in later groups.
    pub fn reserve_inodes_until(&mut self, ino: u32) -> Result<()> {
        ensure!(ino >= self.next_ino, "inode {ino} already allocated");
        self.next_ino = ino;
        Ok(())
    }

    fn block_offset(&self, block: u32) -> usize {
        block as usize * self.geometry.block_size as usize
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(&self.image[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    fn write_block(&mut self, block: u32, data: &[u8]) {
        let off = self.block_offset(block);
        let len = data.len().min(self.geometry.block_size as usize);
        self.image[off..off + len].copy_from_slice(&data[..len]);
    }

    fn ensure_dir(&self, parent: u32) -> Result<()> {
        ensure!(self.dirs.contains_key(&parent), "inode {parent} is not a directory");
        Ok(())
    }

    fn link(&mut self, parent: u32, name: &str, ino: u32, file_type: u8) -> Result<()> {
        ensure!(
            !name.is_empty() && name.len() <= 255 && !name.contains('/'),
            "bad entry name {name:?}"
        );
        let slots = self
            .dirs
            .get_mut(&parent)
            .with_context(|| format!("inode {parent} is not a directory"))?;
        slots.push(DirSlot {
            ino,
            file_type,
            name: name.as_bytes().to_vec(),
        });
        Ok(())
    }

    /// Create a subdirectory and return its inode number.
    pub fn add_dir(&mut self, parent: u32, name: &str) -> Result<u32> {
        self.ensure_dir(parent)?;
        let ino = self.alloc_ino()?;
        self.link(parent, name, ino, FT_DIR)?;
        self.inodes.insert(ino, dir_inode());
        self.dirs.insert(ino, dot_entries(ino, parent));
        if let Some(p) = self.inodes.get_mut(&parent) {
            p.links += 1;
        }
        Ok(ino)
    }

    /// Create a regular file with contiguous data blocks.
    pub fn add_file(&mut self, parent: u32, name: &str, data: &[u8]) -> Result<u32> {
        let bs = self.geometry.block_size as usize;
        let chunks: Vec<(u64, &[u8])> = data
            .chunks(bs)
            .enumerate()
            .map(|(i, chunk)| (i as u64, chunk))
            .collect();
        let size = u32::try_from(data.len()).context("file too large")?;
        self.add_sparse_file(parent, name, size, &chunks)
    }

    /// Create a regular file of `size` bytes where only the listed logical
    /// blocks are allocated. Everything else is a hole.
    pub fn add_sparse_file(
        &mut self,
        parent: u32,
        name: &str,
        size: u32,
        blocks: &[(u64, &[u8])],
    ) -> Result<u32> {
        self.ensure_dir(parent)?;
        let ino = self.alloc_ino()?;
        let mut spec = InodeSpec {
            mode: MODE_FILE,
            size,
            links: 1,
            flags: 0,
            i_block: [0; 15],
            owned_blocks: 0,
        };
        for &(logical, data) in blocks {
            let phys = self.alloc_block()?;
            self.write_block(phys, data);
            spec.owned_blocks += 1;
            self.map_logical(&mut spec, logical, phys)?;
        }
        self.inodes.insert(ino, spec);
        self.link(parent, name, ino, FT_REG)?;
        Ok(ino)
    }

    /// Create a fast symlink (target stored inline in `i_block`).
    pub fn add_symlink(&mut self, parent: u32, name: &str, target: &str) -> Result<u32> {
        self.ensure_dir(parent)?;
        ensure!(target.len() < 60, "only fast symlinks are supported");
        let ino = self.alloc_ino()?;
        let mut raw = [0_u8; 60];
        raw[..target.len()].copy_from_slice(target.as_bytes());
        let mut i_block = [0_u32; 15];
        for (slot, chunk) in i_block.iter_mut().zip(raw.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.inodes.insert(
            ino,
            InodeSpec {
                mode: MODE_SYMLINK,
                size: u32::try_from(target.len()).context("symlink target")?,
                links: 1,
                flags: 0,
                i_block,
                owned_blocks: 0,
            },
        );
        self.link(parent, name, ino, FT_SYMLINK)?;
        Ok(ino)
    }

    /// Create an inode with caller-supplied block pointers and flags.
    ///
    /// Nothing is allocated; the pointers are written verbatim. Used to
    /// build deliberately inconsistent inodes.
    pub fn add_raw_inode(
        &mut self,
        parent: u32,
        name: &str,
        mode: u16,
        size: u32,
        flags: u32,
        i_block: [u32; 15],
    ) -> Result<u32> {
        self.ensure_dir(parent)?;
        let ino = self.alloc_ino()?;
        self.inodes.insert(
            ino,
            InodeSpec {
                mode,
                size,
                links: 1,
                flags,
                i_block,
                owned_blocks: 0,
            },
        );
        let file_type = match mode & 0o170_000 {
            0o040_000 => FT_DIR,
            0o100_000 => FT_REG,
            0o120_000 => FT_SYMLINK,
            _ => 0,
        };
        self.link(parent, name, ino, file_type)?;
        Ok(ino)
    }

    /// Insert a deleted slot (inode 0) into `parent` at the current position.
    pub fn add_deleted_entry(&mut self, parent: u32, name: &str) -> Result<()> {
        self.ensure_dir(parent)?;
        self.link(parent, name, 0, FT_REG)
    }

    /// Route logical block `logical` of `spec` to `phys`, allocating
    /// indirect blocks on the way.
    fn map_logical(&mut self, spec: &mut InodeSpec, logical: u64, phys: u32) -> Result<()> {
        let p = u64::from(self.geometry.block_size / 4);
        if logical < 12 {
            spec.i_block[logical as usize] = phys;
            return Ok(());
        }
        let mut k = logical - 12;
        let (root, slots): (usize, Vec<u64>) = if k < p {
            (12, vec![k])
        } else {
            k -= p;
            if k < p * p {
                (13, vec![k / p, k % p])
            } else {
                k -= p * p;
                ensure!(k < p * p * p, "logical block {logical} beyond triple indirect");
                (14, vec![k / (p * p), (k / p) % p, k % p])
            }
        };

        if spec.i_block[root] == 0 {
            spec.i_block[root] = self.alloc_block()?;
            spec.owned_blocks += 1;
        }
        let mut table = spec.i_block[root];
        let (last, inner) = slots.split_last().context("empty slot path")?;
        for &slot in inner {
            let at = self.block_offset(table) + slot as usize * 4;
            let mut next = self.get_u32(at);
            if next == 0 {
                next = self.alloc_block()?;
                spec.owned_blocks += 1;
                self.put_u32(at, next);
            }
            table = next;
        }
        let at = self.block_offset(table) + *last as usize * 4;
        self.put_u32(at, phys);
        Ok(())
    }

    fn pack_dir(&mut self, ino: u32) -> Result<()> {
        let bs = self.geometry.block_size as usize;
        let slots = self.dirs.get(&ino).cloned().unwrap_or_default();

        // Group entries into blocks; each block's last entry absorbs the slack.
        let mut blocks: Vec<Vec<(DirSlot, usize)>> = vec![Vec::new()];
        let mut used = 0;
        for slot in slots {
            let rec = (8 + slot.name.len() + 3) & !3;
            if used + rec > bs {
                blocks.push(Vec::new());
                used = 0;
            }
            used += rec;
            if let Some(current) = blocks.last_mut() {
                current.push((slot, rec));
            }
        }

        let mut spec = self
            .inodes
            .get(&ino)
            .cloned()
            .with_context(|| format!("directory inode {ino} missing"))?;
        for (logical, entries) in blocks.iter().enumerate() {
            let phys = self.alloc_block()?;
            spec.owned_blocks += 1;
            let base = self.block_offset(phys);
            let mut cursor = 0;
            for (i, (slot, rec)) in entries.iter().enumerate() {
                let rec_len = if i + 1 == entries.len() { bs - cursor } else { *rec };
                let at = base + cursor;
                self.put_u32(at, slot.ino);
                self.put_u16(at + 4, u16::try_from(rec_len).context("rec_len")?);
                self.image[at + 6] = u8::try_from(slot.name.len()).context("name_len")?;
                self.image[at + 7] = slot.file_type;
                self.image[at + 8..at + 8 + slot.name.len()].copy_from_slice(&slot.name);
                cursor += rec_len;
            }
            self.map_logical(&mut spec, logical as u64, phys)?;
        }
        spec.size = u32::try_from(blocks.len() * bs).context("directory too large")?;
        self.inodes.insert(ino, spec);
        Ok(())
    }

    fn inode_offset(&self, ino: u32) -> Result<usize> {
        let g = self.geometry;
        let group = (ino - 1) / g.inodes_per_group;
        let index = (ino - 1) % g.inodes_per_group;
        let layout = self
            .groups
            .get(group as usize)
            .with_context(|| format!("inode {ino} beyond last group"))?;
        Ok(self.block_offset(layout.inode_table) + (index * u32::from(g.inode_size)) as usize)
    }

    fn write_inode(&mut self, ino: u32, spec: &InodeSpec) -> Result<()> {
        let at = self.inode_offset(ino)?;
        let sectors = spec.owned_blocks * (self.geometry.block_size / 512);
        self.put_u16(at, spec.mode);
        self.put_u32(at + 0x04, spec.size);
        self.put_u32(at + 0x08, STAMP);
        self.put_u32(at + 0x0C, STAMP);
        self.put_u32(at + 0x10, STAMP);
        self.put_u16(at + 0x1A, spec.links);
        self.put_u32(at + 0x1C, sectors);
        self.put_u32(at + 0x20, spec.flags);
        for (i, ptr) in spec.i_block.iter().enumerate() {
            self.put_u32(at + 0x28 + i * 4, *ptr);
        }
        self.put_u32(at + 0x64, ino);
        Ok(())
    }

    fn set_bit(&mut self, block: u32, bit: u32) {
        let at = self.block_offset(block) + (bit / 8) as usize;
        self.image[at] |= 1 << (bit % 8);
    }

    fn write_metadata(&mut self) -> Result<()> {
        let g = self.geometry;
        let groups = self.groups.clone();
        let mut in_use: BTreeSet<u32> = self.reserved.clone();
        in_use.extend(self.used_blocks.iter().copied());

        let mut dirs_per_group: HashMap<u32, u16> = HashMap::new();
        for ino in self.dirs.keys() {
            *dirs_per_group.entry((ino - 1) / g.inodes_per_group).or_default() += 1;
        }

        let mut total_free_blocks = 0_u32;
        let mut total_free_inodes = 0_u32;
        let gdt_start = g.first_data_block() + 1;
        for (index, layout) in groups.iter().enumerate() {
            let group = u32::try_from(index).context("group index")?;
            let end = (layout.start + g.blocks_per_group).min(g.blocks_count);
            let mut free_blocks = 0_u32;
            for block in layout.start..end {
                if in_use.contains(&block) {
                    self.set_bit(layout.block_bitmap, block - layout.start);
                } else {
                    free_blocks += 1;
                }
            }

            let first_ino = group * g.inodes_per_group + 1;
            let mut free_inodes = 0_u32;
            for i in 0..g.inodes_per_group {
                let ino = first_ino + i;
                if ino < FIRST_INO || self.inodes.contains_key(&ino) {
                    self.set_bit(layout.inode_bitmap, i);
                } else {
                    free_inodes += 1;
                }
            }

            let at = self.block_offset(gdt_start) + index * GROUP_DESC_SIZE as usize;
            self.put_u32(at, layout.block_bitmap);
            self.put_u32(at + 0x04, layout.inode_bitmap);
            self.put_u32(at + 0x08, layout.inode_table);
            self.put_u16(at + 0x0C, u16::try_from(free_blocks).unwrap_or(u16::MAX));
            self.put_u16(at + 0x0E, u16::try_from(free_inodes).unwrap_or(u16::MAX));
            self.put_u16(
                at + 0x10,
                dirs_per_group.get(&group).copied().unwrap_or_default(),
            );
            total_free_blocks += free_blocks;
            total_free_inodes += free_inodes;
        }

        let sb = SUPERBLOCK_OFFSET;
        self.put_u32(sb, g.groups_count() * g.inodes_per_group);
        self.put_u32(sb + 0x04, g.blocks_count);
        self.put_u32(sb + 0x08, g.blocks_count / 20);
        self.put_u32(sb + 0x0C, total_free_blocks);
        self.put_u32(sb + 0x10, total_free_inodes);
        self.put_u32(sb + 0x14, g.first_data_block());
        self.put_u32(sb + 0x18, (g.block_size / 1024).trailing_zeros());
        self.put_u32(sb + 0x1C, (g.block_size / 1024).trailing_zeros());
        self.put_u32(sb + 0x20, g.blocks_per_group);
        self.put_u32(sb + 0x24, g.blocks_per_group);
        self.put_u32(sb + 0x28, g.inodes_per_group);
        self.put_u32(sb + 0x2C, STAMP);
        self.put_u32(sb + 0x30, STAMP);
        self.put_u16(sb + 0x36, 20);
        self.put_u16(sb + 0x38, 0xEF53);
        self.put_u16(sb + 0x3A, 1);
        self.put_u16(sb + 0x3C, 1);
        self.put_u32(sb + 0x40, STAMP);
        self.put_u32(sb + 0x4C, g.rev_level);
        if g.rev_level >= 1 {
            self.put_u32(sb + 0x54, FIRST_INO);
            self.put_u16(sb + 0x58, g.inode_size);
            self.put_u32(sb + 0x60, self.incompat);
        }
        let uuid: [u8; 16] = *b"e2v-harness-uuid";
        self.image[sb + 0x68..sb + 0x78].copy_from_slice(&uuid);
        let name = self.volume_name.as_bytes();
        let len = name.len().min(16);
        self.image[sb + 0x78..sb + 0x78 + len].copy_from_slice(&name[..len]);
        Ok(())
    }

    /// Finish layout and return the raw image bytes.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        ensure!(
            self.geometry.rev_level >= 1 || self.geometry.inode_size == 128,
            "revision 0 volumes use 128-byte inodes"
        );
        let dir_inos: Vec<u32> = self.dirs.keys().copied().collect();
        for ino in dir_inos {
            self.pack_dir(ino)?;
        }
        let inodes: Vec<(u32, InodeSpec)> =
            self.inodes.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (ino, spec) in &inodes {
            self.write_inode(*ino, spec)?;
        }
        self.write_metadata()?;
        Ok(self.image)
    }

    /// Finish layout and write the image to `path`.
    pub fn write_to(self, path: &Path) -> Result<()> {
        let bytes = self.finish()?;
        fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
    }
}

fn dir_inode() -> InodeSpec {
    InodeSpec {
        mode: MODE_DIR,
        size: 0,
        links: 2,
        flags: 0,
        i_block: [0; 15],
        owned_blocks: 0,
    }
}

fn dot_entries(ino: u32, parent: u32) -> Vec<DirSlot> {
    vec![
        DirSlot {
            ino,
            file_type: FT_DIR,
            name: b".".to_vec(),
        },
        DirSlot {
            ino: parent,
            file_type: FT_DIR,
            name: b"..".to_vec(),
        },
    ]
}

/// Byte pattern used for file content: block `n` is filled with a
/// recognizable sequence derived from `seed` and `n`.
#[must_use]
pub fn pattern_block(seed: u8, n: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((n as u8).wrapping_mul(31)).wrapping_add(i as u8))
        .collect()
}

/// Independent little-endian reader for assertions on built images.
#[must_use]
pub fn image_u32(image: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&image[offset..offset + 4]);
    u32::from_le_bytes(raw)
}
