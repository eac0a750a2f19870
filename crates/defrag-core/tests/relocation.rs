#![forbid(unsafe_code)]

use defrag_core::{DefragError, Depth, analyze, defragment};
use defrag_harness::{FileShape, Geometry, ImageBuilder, Placement, SyntheticImage, verify_defragmented};
use defrag_ondisk::{Inode, Superblock};
use defrag_types::{BlockPtr, DataBlock, SENTINEL, read_le_i32};
use proptest::prelude::*;

fn geometry() -> Geometry {
    // 64-byte blocks: 16 pointers per indirect node, 5 inode slots.
    Geometry::new(64, 8, 64, 2)
}

fn inode_at(image: &[u8], slot: usize) -> Inode {
    let sb = Superblock::parse_from_image(image).expect("superblock");
    let layout = defrag_ondisk::ImageLayout::from_superblock(&sb, image.len()).expect("layout");
    Inode::parse_at(image, layout.inode_addr(slot)).expect("inode")
}

fn block(image: &[u8], index: u32) -> Vec<u8> {
    let sb = Superblock::parse_from_image(image).expect("superblock");
    let layout = defrag_ondisk::ImageLayout::from_superblock(&sb, image.len()).expect("layout");
    layout.data_block(image, DataBlock(index)).expect("block").to_vec()
}

fn ptr(image: &[u8], node: u32, slot: usize) -> i32 {
    read_le_i32(&block(image, node), slot * 4).expect("pointer")
}

#[test]
fn direct_blocks_are_packed_from_zero() {
    let source = ImageBuilder::new(geometry())
        .file(FileShape::direct(3))
        .placement(Placement::Explicit(vec![40, 5, 12]))
        .build()
        .expect("image")
        .into_bytes();

    let out = defragment(&source).expect("defragment");
    let inode = inode_at(&out.image, 0);
    assert_eq!(&inode.dblocks[..3], &[BlockPtr(0), BlockPtr(1), BlockPtr(2)]);
    assert!(inode.dblocks[3..].iter().all(|p| p.is_none()));
    assert_eq!(block(&out.image, 0), block(&source, 40));
    assert_eq!(block(&out.image, 1), block(&source, 5));
    assert_eq!(block(&out.image, 2), block(&source, 12));

    assert_eq!(out.report.data_blocks, 3);
    assert_eq!(out.report.free_list_head, BlockPtr(3));
    assert_eq!(out.report.free_blocks, 61);
}

#[test]
fn single_indirect_pointers_are_rewritten() {
    let source = ImageBuilder::new(geometry())
        .file(FileShape::direct(2).with_single(&[2]))
        .placement(Placement::Explicit(vec![50, 7, 33, 20, 9]))
        .build()
        .expect("image")
        .into_bytes();

    let out = defragment(&source).expect("defragment");
    let inode = inode_at(&out.image, 0);
    assert_eq!(inode.dblocks[0], BlockPtr(0));
    assert_eq!(inode.dblocks[1], BlockPtr(1));
    assert_eq!(inode.iblocks[0], BlockPtr(2));
    assert_eq!(ptr(&out.image, 2, 0), 3);
    assert_eq!(ptr(&out.image, 2, 1), 4);
    assert_eq!(ptr(&out.image, 2, 2), SENTINEL);
    assert_eq!(block(&out.image, 3), block(&source, 20));
    assert_eq!(block(&out.image, 4), block(&source, 9));

    // Cursor advanced by two directs, one node, two leaves.
    assert_eq!(out.report.blocks_copied(), 5);
    assert_eq!(out.report.indirect_blocks, 1);
    assert_eq!(out.report.free_list_head, BlockPtr(5));
}

#[test]
fn files_are_packed_in_inode_order() {
    let source = ImageBuilder::new(geometry())
        .file_at(1, FileShape::direct(2))
        .file_at(3, FileShape::direct(1).with_single(&[1]))
        .placement(Placement::Reversed)
        .build()
        .expect("image")
        .into_bytes();

    let out = defragment(&source).expect("defragment");
    assert_eq!(inode_at(&out.image, 1).dblocks[0], BlockPtr(0));
    assert_eq!(inode_at(&out.image, 1).dblocks[1], BlockPtr(1));
    assert_eq!(inode_at(&out.image, 3).dblocks[0], BlockPtr(2));
    assert_eq!(inode_at(&out.image, 3).iblocks[0], BlockPtr(3));
    assert_eq!(out.report.live_inodes, 2);
    assert_eq!(out.report.inodes_relocated, 2);
    // Dead slots are byte-identical.
    assert_eq!(inode_at(&out.image, 0), inode_at(&source, 0));
}

fn depth_shapes() -> Vec<FileShape> {
    vec![
        FileShape::direct(10),
        FileShape::direct(1).with_single(&[16, 0, 3, 16]),
        FileShape::direct(4).with_double(&[2, 5]).with_holes(),
        FileShape::direct(2)
            .with_single(&[1])
            .with_double(&[1])
            .with_triple(&[vec![2, 1], vec![3]]),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_depth_combination_verifies(
        shape in proptest::sample::select(depth_shapes()),
        seed in any::<u64>(),
    ) {
        let source = ImageBuilder::new(geometry())
            .file(shape.clone())
            .placement(Placement::Shuffled { seed })
            .build()
            .unwrap()
            .into_bytes();
        let out = defragment(&source).unwrap();
        let report = verify_defragmented(&source, &out.image).unwrap();
        prop_assert!(
            report.is_clean(),
            "{:?}",
            report.failures().collect::<Vec<_>>()
        );
        prop_assert_eq!(out.report.blocks_copied(), u64::try_from(shape.block_count()).unwrap());
        prop_assert!(out.report.after.is_contiguous());
    }
}

#[test]
fn later_single_indirect_slots_relocate_under_double_depth() {
    let mut image = SyntheticImage::new(geometry()).expect("image");
    for (leaf, tag) in [(15, 1), (4, 2), (2, 3)] {
        image.fill_block(leaf, tag).expect("fill");
    }
    image.write_indirect(9, &[(0, 4)]).expect("single node");
    image.write_indirect(6, &[(0, 12)]).expect("double root");
    image.write_indirect(12, &[(0, 2)]).expect("double child");
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.dblocks[0] = BlockPtr(15);
    inode.iblocks[2] = BlockPtr(9);
    inode.i2block = BlockPtr(6);
    image.set_inode(0, &inode).expect("inode");
    let source = image.into_bytes();
    assert_eq!(Depth::for_inode(&inode), Some(Depth::Double));

    let out = defragment(&source).expect("defragment");
    let moved = inode_at(&out.image, 0);
    assert_eq!(moved.dblocks[0], BlockPtr(0));
    assert_eq!(
        moved.iblocks,
        [BlockPtr::NONE, BlockPtr::NONE, BlockPtr(1), BlockPtr::NONE]
    );
    assert_eq!(ptr(&out.image, 1, 0), 2);
    assert_eq!(moved.i2block, BlockPtr(3));
    assert_eq!(ptr(&out.image, 3, 0), 4);
    assert_eq!(ptr(&out.image, 4, 0), 5);
    assert_eq!(block(&out.image, 0), block(&source, 15));
    assert_eq!(block(&out.image, 2), block(&source, 4));
    assert_eq!(block(&out.image, 5), block(&source, 2));
    assert_eq!(out.report.blocks_copied(), 6);

    let report = verify_defragmented(&source, &out.image).expect("verify");
    assert!(report.is_clean(), "{:?}", report.failures().collect::<Vec<_>>());
}

#[test]
fn direct_depth_leaves_stale_indirect_slots_untouched() {
    let mut image = SyntheticImage::new(geometry()).expect("image");
    image.fill_block(20, 1).expect("fill");
    image.fill_block(3, 2).expect("fill");
    image.write_indirect(8, &[(0, 30)]).expect("stale node");
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.dblocks[0] = BlockPtr(20);
    inode.dblocks[1] = BlockPtr(3);
    inode.iblocks[1] = BlockPtr(8);
    image.set_inode(0, &inode).expect("inode");
    let source = image.into_bytes();
    assert_eq!(Depth::for_inode(&inode), Some(Depth::Direct));

    let out = defragment(&source).expect("defragment");
    let moved = inode_at(&out.image, 0);
    assert_eq!(&moved.dblocks[..2], &[BlockPtr(0), BlockPtr(1)]);
    assert_eq!(moved.iblocks, inode.iblocks);
    assert_eq!(out.report.blocks_copied(), 2);
    assert_eq!(out.report.indirect_blocks, 0);
    assert_eq!(out.report.free_list_head, BlockPtr(2));
}

#[test]
fn aliased_tree_stops_when_the_region_is_exhausted() {
    // 1024 pointers per node, every slot aliasing the same child: a full
    // walk would visit 1024^3 leaves.
    let block_size = 4096;
    let mut image = SyntheticImage::new(Geometry::new(block_size, 1, 8, 1)).expect("image");
    let slots = block_size / 4;
    for (node, child) in [(0, 1), (1, 2), (2, 3)] {
        let children: Vec<(usize, u32)> = (0..slots).map(|slot| (slot, child)).collect();
        image.write_indirect(node, &children).expect("node");
    }
    image.fill_block(3, 1).expect("leaf");
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.dblocks[0] = BlockPtr(3);
    inode.i3block = BlockPtr(0);
    image.set_inode(0, &inode).expect("inode");

    let err = defragment(&image.into_bytes()).unwrap_err();
    assert!(
        matches!(err, DefragError::NoSpace { needed: 9, available: 8 }),
        "{err}"
    );
}

#[test]
fn triple_indirect_depth_is_detected() {
    let shape = FileShape::direct(1).with_triple(&[vec![1]]);
    let source = ImageBuilder::new(geometry())
        .file(shape)
        .placement(Placement::Reversed)
        .build()
        .expect("image")
        .into_bytes();
    assert_eq!(Depth::for_inode(&inode_at(&source, 0)), Some(Depth::Triple));

    let out = defragment(&source).expect("defragment");
    let inode = inode_at(&out.image, 0);
    assert_eq!(inode.dblocks[0], BlockPtr(0));
    assert_eq!(inode.i3block, BlockPtr(1));
    assert_eq!(ptr(&out.image, 1, 0), 2);
    assert_eq!(ptr(&out.image, 2, 0), 3);
    assert_eq!(ptr(&out.image, 3, 0), 4);
}

#[test]
fn fully_packed_region_leaves_empty_free_list() {
    let geometry = Geometry::new(64, 2, 6, 3);
    let source = ImageBuilder::new(geometry)
        .file(FileShape::direct(2).with_single(&[3]))
        .placement(Placement::Reversed)
        .build()
        .expect("image")
        .into_bytes();

    let out = defragment(&source).expect("defragment");
    assert_eq!(out.report.free_blocks, 0);
    assert_eq!(out.report.free_list_head, BlockPtr::NONE);
    let sb = Superblock::parse_from_image(&out.image).expect("superblock");
    assert_eq!(sb.free_block, BlockPtr::NONE);

    let swap = defrag_ondisk::ImageLayout::from_superblock(&sb, out.image.len())
        .expect("layout")
        .swap_region_start();
    assert_eq!(out.image[swap..], source[swap..]);
}

#[test]
fn second_run_is_identity() {
    let source = ImageBuilder::new(geometry())
        .file(FileShape::direct(3).with_single(&[4]))
        .file(FileShape::direct(5).with_double(&[3, 3]))
        .placement(Placement::Shuffled { seed: 11 })
        .free_head(63)
        .build()
        .expect("image")
        .into_bytes();

    let first = defragment(&source).expect("first run");
    let second = defragment(&first.image).expect("second run");
    assert_eq!(first.image, second.image);
    assert!(second.report.before.is_contiguous());
}

#[test]
fn fragmentation_is_measured_before_and_after() {
    let source = ImageBuilder::new(geometry())
        .file(FileShape::direct(4))
        .placement(Placement::Explicit(vec![9, 3, 4, 20]))
        .build()
        .expect("image")
        .into_bytes();

    let before = analyze(&source).expect("analyze");
    assert_eq!(before.files, 1);
    assert_eq!(before.blocks, 4);
    // 9 -> 3 and 4 -> 20 break; 3 -> 4 does not.
    assert_eq!(before.breaks, 2);
    assert_eq!(before.fragmented_files, 1);

    let out = defragment(&source).expect("defragment");
    assert_eq!(out.report.before, before);
    assert_eq!(out.report.after.breaks, 0);
}

#[test]
fn inode_without_first_pointers_is_left_alone() {
    let mut image = SyntheticImage::new(geometry()).expect("image");
    image.fill_block(30, 1).expect("fill");
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.dblocks[2] = BlockPtr(30);
    image.set_inode(0, &inode).expect("inode");
    let source = image.into_bytes();

    let out = defragment(&source).expect("defragment");
    assert_eq!(out.report.inodes_skipped, 1);
    assert_eq!(out.report.inodes_relocated, 0);
    assert_eq!(inode_at(&out.image, 0), inode);
    assert_eq!(out.report.free_list_head, BlockPtr(0));
}

#[test]
fn out_of_range_pointer_aborts() {
    let mut image = SyntheticImage::new(geometry()).expect("image");
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.dblocks[0] = BlockPtr(64);
    image.set_inode(0, &inode).expect("inode");

    let err = defragment(&image.into_bytes()).unwrap_err();
    assert!(err.is_corruption(), "{err}");
}

#[test]
fn corrupt_child_pointer_aborts() {
    let mut image = SyntheticImage::new(geometry()).expect("image");
    image.write_indirect(4, &[(0, 5)]).expect("node");
    let layout = image.layout;
    let bytes = layout
        .data_block_mut(&mut image.bytes, DataBlock(4))
        .expect("block");
    bytes[4..8].copy_from_slice(&(-7_i32).to_le_bytes());
    let mut inode = Inode::empty();
    inode.nlink = 1;
    inode.iblocks[0] = BlockPtr(4);
    image.set_inode(0, &inode).expect("inode");

    let err = defragment(&image.into_bytes()).unwrap_err();
    assert!(matches!(err, DefragError::Corruption { block: 4, .. }), "{err}");
}

#[test]
fn report_serializes_to_json() {
    let source = ImageBuilder::new(geometry())
        .file(FileShape::direct(2))
        .build()
        .expect("image")
        .into_bytes();
    let out = defragment(&source).expect("defragment");
    let json = serde_json::to_value(&out.report).expect("json");
    assert_eq!(json["block_size"], 64);
    assert_eq!(json["live_inodes"], 1);
    assert_eq!(json["after"]["breaks"], 0);
}

#[test]
fn invalid_geometry_is_rejected() {
    let mut image = SyntheticImage::new(geometry()).expect("image").into_bytes();
    // swap_offset before data_offset
    image[524..528].copy_from_slice(&1_i32.to_le_bytes());
    assert!(matches!(
        defragment(&image),
        Err(DefragError::InvalidGeometry(_))
    ));
}
