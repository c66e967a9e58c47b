#![forbid(unsafe_code)]

use e2v_core::dump::{dump_group_descriptors, dump_inode, dump_superblock};
use e2v_core::{E2vError, ErrorKind, Ext2Fs, InodeNumber, OpenOptions, Session};
use e2v_harness::{Ext2ImageBuilder, ImageGeometry, ROOT_INO, pattern_block};
use std::path::PathBuf;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
    big: Vec<u8>,
}

/// A 4K-block, multi-group image written to a temporary file.
fn write_image() -> Fixture {
    let geometry = ImageGeometry {
        block_size: 4096,
        blocks_count: 3000,
        blocks_per_group: 1024,
        inodes_per_group: 64,
        inode_size: 256,
        rev_level: 1,
    };
    let mut builder = Ext2ImageBuilder::new(geometry).expect("builder");
    builder.set_volume_name("e2e");
    let etc = builder.add_dir(ROOT_INO, "etc").expect("etc");
    builder
        .add_file(etc, "hostname", b"ext2view-host\n")
        .expect("hostname");
    let home = builder.add_dir(ROOT_INO, "home").expect("home");
    let user = builder.add_dir(home, "user").expect("user");
    // 1100 blocks at 4K spans direct, single and double indirect (P = 1024).
    let big: Vec<u8> = (0..1100).flat_map(|n| pattern_block(5, n, 4096)).collect();
    builder.add_file(user, "big.dat", &big).expect("big");
    builder.add_symlink(user, "link", "big.dat").expect("link");

    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("volume.img");
    builder.write_to(&path).expect("write image");
    Fixture {
        _dir: dir,
        path,
        big,
    }
}

#[test]
fn open_file_backed_volume() {
    let fx = write_image();
    let fs = Ext2Fs::open(&fx.path).expect("open");
    assert_eq!(fs.block_size(), 4096);
    // ceil(3000 / 1024) = 3
    assert_eq!(fs.groups_count(), 3);
    assert_eq!(fs.superblock().inode_size, 256);
    assert_eq!(fs.superblock().volume_name, "e2e");
    assert!(fs.root().is_dir());
}

#[test]
fn large_file_reads_back_exactly() {
    let fx = write_image();
    let fs = Ext2Fs::open(&fx.path).expect("open");
    let inode = fs.resolve_path("/home/user/big.dat").expect("resolve");
    assert_eq!(u64::from(inode.size), fx.big.len() as u64);
    assert_ne!(inode.double_indirect, 0);

    let data = fs.read(&inode, usize::MAX).expect("read");
    assert_eq!(data.len(), fx.big.len());
    assert!(data == fx.big, "file content differs");

    // A window straddling the single/double indirect boundary.
    let boundary = (12 + 1024) * 4096_u64;
    let mut buf = vec![0_u8; 8192];
    let n = fs
        .read_file_data(&inode, boundary - 4096, &mut buf)
        .expect("window");
    assert_eq!(n, 8192);
    let start = usize::try_from(boundary - 4096).expect("offset");
    assert_eq!(buf.as_slice(), &fx.big[start..start + 8192]);
}

#[test]
fn cached_open_reads_the_same_bytes() {
    let fx = write_image();
    let options = OpenOptions {
        cache_blocks: Some(8),
        ..OpenOptions::default()
    };
    let fs = Ext2Fs::open_with_options(&fx.path, &options).expect("open");
    let inode = fs.resolve_path("/home/user/big.dat").expect("resolve");
    assert!(fs.read(&inode, usize::MAX).expect("read") == fx.big);
}

#[test]
fn session_walkthrough() {
    let fx = write_image();
    let mut session = Session::open(&fx.path).expect("session");
    assert_eq!(session.cwd(), "/");

    let names: Vec<String> = session
        .list("")
        .expect("ls /")
        .iter()
        .map(e2v_core::Ext2DirEntry::name_str)
        .collect();
    assert_eq!(names, vec![".", "..", "lost+found", "etc", "home"]);

    assert_eq!(session.change_directory("home/user").expect("cd"), "/home/user");
    let names: Vec<String> = session
        .list("")
        .expect("ls")
        .iter()
        .map(e2v_core::Ext2DirEntry::name_str)
        .collect();
    assert_eq!(names, vec![".", "..", "big.dat", "link"]);

    assert_eq!(session.cat("big.dat", Some(16)).expect("cat"), &fx.big[..16]);
    assert_eq!(
        session.cat("../../etc/hostname", None).expect("cat"),
        b"ext2view-host\n"
    );

    let err = session.cat("link", None).expect_err("symlink");
    assert!(matches!(err, E2vError::NotRegularFile { .. }));
    let err = session.change_directory("big.dat").expect_err("cd file");
    assert_eq!(err.kind(), ErrorKind::Type);
    assert_eq!(session.cwd(), "/home/user");

    let err = session.lookup("/etc/hostname/x").expect_err("through file");
    assert!(matches!(&err, E2vError::PathNotDirectory(p) if p == "/etc/hostname"));

    session.close();
}

#[test]
fn dumps_render_from_file_backed_volume() {
    let fx = write_image();
    let fs = Ext2Fs::open(&fx.path).expect("open");
    assert!(dump_superblock(fs.superblock()).contains("inode_size"));
    let groups = dump_group_descriptors(fs.group_descriptors());
    assert_eq!(groups.matches("=== end group").count(), 3);
    let root = fs.read_inode(InodeNumber::ROOT).expect("root");
    assert!(dump_inode(&root).starts_with("=== inode 2 ==="));
}

#[test]
fn truncated_file_fails_with_io() {
    let fx = write_image();
    let bytes = std::fs::read(&fx.path).expect("read image");
    let short = fx.path.with_file_name("short.img");
    std::fs::write(&short, &bytes[..1500]).expect("write short");

    let err = Ext2Fs::open(&short).expect_err("short image");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.to_errno(), libc::EIO);
}

#[test]
fn missing_image_is_io_error() {
    let dir = TempDir::new().expect("tempdir");
    let err = Ext2Fs::open(dir.path().join("absent.img")).expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn non_ext2_file_has_bad_signature() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("zeros.img");
    std::fs::write(&path, vec![0_u8; 64 * 1024]).expect("write");
    let err = Ext2Fs::open(&path).expect_err("zeros");
    assert!(matches!(err, E2vError::BadSignature { actual: 0, .. }));
}
