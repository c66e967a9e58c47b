#![forbid(unsafe_code)]
//! Human-readable dumps of decoded on-disk records.
//!
//! Each dump is a block of `field = value` lines between a start and an end
//! banner, suitable for printing as is.

use crate::Inode;
use e2v_ondisk::{Ext2DirEntry, Ext2GroupDesc, Ext2Superblock};

struct Dump {
    title: String,
    out: String,
}

impl Dump {
    fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let out = format!("=== {title} ===\n");
        Self { title, out }
    }

    fn field(&mut self, name: &str, value: impl std::fmt::Display) -> &mut Self {
        self.out.push_str(&format!("{name:<22} = {value}\n"));
        self
    }

    fn finish(mut self) -> String {
        self.out.push_str(&format!("=== end {} ===\n", self.title));
        self.out
    }
}

/// Standard textual UUID form.
fn uuid(bytes: &[u8; 16]) -> String {
    let h = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

#[must_use]
pub fn dump_superblock(sb: &Ext2Superblock) -> String {
    let mut d = Dump::new("superblock");
    d.field("inodes_count", sb.inodes_count)
        .field("blocks_count", sb.blocks_count)
        .field("reserved_blocks_count", sb.reserved_blocks_count)
        .field("free_blocks_count", sb.free_blocks_count)
        .field("free_inodes_count", sb.free_inodes_count)
        .field("first_data_block", sb.first_data_block)
        .field("log_block_size", sb.log_block_size)
        .field("block_size", sb.block_size)
        .field("log_frag_size", sb.log_frag_size)
        .field("frag_size", sb.frag_size)
        .field("blocks_per_group", sb.blocks_per_group)
        .field("frags_per_group", sb.frags_per_group)
        .field("inodes_per_group", sb.inodes_per_group)
        .field("groups_count", sb.groups_count())
        .field("mtime", sb.mtime)
        .field("wtime", sb.wtime)
        .field("mnt_count", sb.mnt_count)
        .field("max_mnt_count", sb.max_mnt_count)
        .field("magic", format_args!("{:#06x}", sb.magic))
        .field("state", sb.state)
        .field("errors", sb.errors)
        .field("minor_rev_level", sb.minor_rev_level)
        .field("lastcheck", sb.lastcheck)
        .field("checkinterval", sb.checkinterval)
        .field("creator_os", sb.creator_os)
        .field("rev_level", sb.rev_level)
        .field("def_resuid", sb.def_resuid)
        .field("def_resgid", sb.def_resgid)
        .field("first_ino", sb.first_ino)
        .field("inode_size", sb.inode_size)
        .field("block_group_nr", sb.block_group_nr)
        .field("feature_compat", sb.feature_compat)
        .field("feature_incompat", sb.feature_incompat)
        .field("feature_ro_compat", sb.feature_ro_compat)
        .field("uuid", uuid(&sb.uuid))
        .field("volume_name", &sb.volume_name)
        .field("last_mounted", &sb.last_mounted)
        .field("algorithm_usage_bitmap", sb.algorithm_usage_bitmap)
        .field("prealloc_blocks", sb.prealloc_blocks)
        .field("prealloc_dir_blocks", sb.prealloc_dir_blocks)
        .field("journal_uuid", uuid(&sb.journal_uuid))
        .field("journal_inum", sb.journal_inum)
        .field("journal_dev", sb.journal_dev)
        .field("last_orphan", sb.last_orphan);
    d.finish()
}

/// Dump the whole descriptor table, one section per group.
#[must_use]
pub fn dump_group_descriptors(groups: &[Ext2GroupDesc]) -> String {
    let mut out = String::new();
    for (i, gd) in groups.iter().enumerate() {
        let mut d = Dump::new(format!("group {i}"));
        d.field("block_bitmap", gd.block_bitmap)
            .field("inode_bitmap", gd.inode_bitmap)
            .field("inode_table", gd.inode_table)
            .field("free_blocks_count", gd.free_blocks_count)
            .field("free_inodes_count", gd.free_inodes_count)
            .field("used_dirs_count", gd.used_dirs_count);
        out.push_str(&d.finish());
    }
    out
}

#[must_use]
pub fn dump_inode(inode: &Inode) -> String {
    let mut d = Dump::new(format!("inode {}", inode.ino));
    d.field(
        "mode",
        format_args!("{:#o} ({})", inode.mode, inode.file_type().tag()),
    )
    .field("uid", inode.uid)
    .field("gid", inode.gid)
    .field("size", inode.size)
    .field("atime", inode.atime)
    .field("ctime", inode.ctime)
    .field("mtime", inode.mtime)
    .field("dtime", inode.dtime)
    .field("links_count", inode.links_count)
    .field("sectors", inode.sectors)
    .field("flags", format_args!("{:#x}", inode.flags));
    for (i, ptr) in inode.direct.iter().enumerate() {
        d.field(&format!("direct[{i}]"), ptr);
    }
    d.field("single_indirect", inode.single_indirect)
        .field("double_indirect", inode.double_indirect)
        .field("triple_indirect", inode.triple_indirect)
        .field("generation", inode.generation)
        .field("file_acl", inode.file_acl)
        .field("dir_acl", inode.dir_acl);
    d.finish()
}

#[must_use]
pub fn dump_dirent(entry: &Ext2DirEntry) -> String {
    let mut d = Dump::new("dirent");
    d.field("inode", entry.inode)
        .field("rec_len", entry.rec_len)
        .field("name_len", entry.name_len)
        .field(
            "file_type",
            format_args!("{:?} ({})", entry.file_type, entry.file_type.tag()),
        )
        .field("name", entry.name_str());
    d.finish()
}
