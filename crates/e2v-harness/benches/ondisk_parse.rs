#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use e2v_harness::{fixture_path, load_sparse_fixture};
use e2v_ondisk::{Ext2GroupDesc, Ext2Inode, Ext2Superblock, block_map_path, parse_dir_block};

fn bench_superblock_parse(c: &mut Criterion) {
    let data = load_sparse_fixture(&fixture_path("ext2_superblock_1k.json"))
        .expect("load superblock fixture");

    c.bench_function("ext2_superblock_parse", |b| {
        b.iter(|| Ext2Superblock::parse_superblock_region(black_box(&data)).expect("sb parse"));
    });
}

fn bench_group_desc_parse(c: &mut Criterion) {
    let data =
        load_sparse_fixture(&fixture_path("ext2_group_desc.json")).expect("load gd fixture");

    c.bench_function("ext2_group_desc_parse", |b| {
        b.iter(|| Ext2GroupDesc::parse_from_bytes(black_box(&data)).expect("gd parse"));
    });
}

fn bench_inode_parse(c: &mut Criterion) {
    let data = load_sparse_fixture(&fixture_path("ext2_inode_regular_file.json"))
        .expect("load inode fixture");

    c.bench_function("ext2_inode_parse", |b| {
        b.iter(|| Ext2Inode::parse_from_bytes(black_box(&data)).expect("inode parse"));
    });
}

fn bench_dir_block_parse(c: &mut Criterion) {
    let data =
        load_sparse_fixture(&fixture_path("ext2_dir_block.json")).expect("load dir block fixture");

    c.bench_function("ext2_dir_block_parse", |b| {
        b.iter(|| {
            let entries = parse_dir_block(black_box(&data)).expect("dir block parse");
            black_box(entries);
        });
    });
}

fn bench_block_map_path(c: &mut Criterion) {
    c.bench_function("ext2_block_map_path", |b| {
        b.iter(|| {
            for logical in [0_u64, 11, 12, 300, 70_000, 16_843_000] {
                black_box(block_map_path(black_box(logical), 1024));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_superblock_parse,
    bench_group_desc_parse,
    bench_inode_parse,
    bench_dir_block_parse,
    bench_block_map_path
);
criterion_main!(benches);
