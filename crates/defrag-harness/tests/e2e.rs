#![forbid(unsafe_code)]
//! Randomized end-to-end runs: build a scattered image, defragment it, and
//! check every invariant with the verifier.

use defrag_core::defragment;
use defrag_harness::{FileShape, Geometry, ImageBuilder, Placement, verify_defragmented};
use defrag_ondisk::{ImageLayout, Superblock};
use defrag_types::{INODE_SIZE, N_DBLOCKS, N_IBLOCKS};
use proptest::prelude::*;

/// One generated image: files with the dead inode slots before each,
/// unused data blocks, and the shuffle seed.
#[derive(Debug, Clone)]
struct Scenario {
    block_size: usize,
    files: Vec<(usize, FileShape)>,
    spare: usize,
    seed: u64,
}

impl Scenario {
    fn live_blocks(&self) -> usize {
        self.files.iter().map(|(_, shape)| shape.block_count()).sum()
    }

    fn build(&self) -> Vec<u8> {
        let mut slot = 0;
        let mut slots = Vec::with_capacity(self.files.len());
        for (gap, _) in &self.files {
            slot += gap;
            slots.push(slot);
            slot += 1;
        }
        let inode_blocks = (slot * INODE_SIZE).div_ceil(self.block_size);
        let blocks = self.live_blocks() + self.spare;

        let mut builder = ImageBuilder::new(Geometry::new(self.block_size, inode_blocks, blocks, 2))
            .placement(Placement::Shuffled { seed: self.seed });
        for (slot, (_, shape)) in slots.into_iter().zip(&self.files) {
            builder = builder.file_at(slot, shape.clone());
        }
        builder.build().expect("scenario image").into_bytes()
    }
}

fn shape_strategy() -> impl Strategy<Value = FileShape> {
    let leaves = || 1_usize..=6;
    (
        1..=N_DBLOCKS,
        proptest::collection::vec(0_usize..=6, 0..=N_IBLOCKS),
        proptest::option::of(proptest::collection::vec(leaves(), 1..=6)),
        proptest::option::of(proptest::collection::vec(
            proptest::collection::vec(leaves(), 1..=3),
            1..=3,
        )),
        any::<bool>(),
    )
        .prop_map(|(direct, single, double, triple, holes)| FileShape {
            direct,
            single,
            double,
            triple,
            holes,
        })
}

fn scenario_strategy() -> impl Strategy<Value = Scenario> {
    (
        proptest::sample::select(vec![64_usize, 128, 256]),
        proptest::collection::vec((0_usize..2, shape_strategy()), 1..=6),
        0_usize..=64,
        any::<u64>(),
    )
        .prop_map(|(block_size, files, spare, seed)| Scenario {
            block_size,
            files,
            spare,
            seed,
        })
}

fn fixed_scenario() -> Scenario {
    Scenario {
        block_size: 64,
        files: vec![
            (1, FileShape::direct(3).with_single(&[4, 0])),
            (0, FileShape::direct(2).with_double(&[3, 1]).with_holes()),
            (1, FileShape::direct(1).with_triple(&[vec![2], vec![1, 3]])),
        ],
        spare: 9,
        seed: 7,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn defragmented_images_satisfy_all_invariants(scenario in scenario_strategy()) {
        let source = scenario.build();
        let blocks = u64::try_from(scenario.live_blocks()).unwrap();
        let out = defragment(&source).unwrap();

        let report = verify_defragmented(&source, &out.image).unwrap();
        prop_assert!(
            report.is_clean(),
            "{:?}",
            report.failures().collect::<Vec<_>>()
        );
        prop_assert_eq!(report.live_blocks, blocks);
        prop_assert_eq!(out.report.blocks_copied(), blocks);
        prop_assert_eq!(
            u64::from(out.report.free_blocks),
            u64::from(out.report.data_region_blocks) - blocks
        );
        prop_assert_eq!(out.report.after.breaks, 0);
    }

    #[test]
    fn defragment_is_idempotent(scenario in scenario_strategy()) {
        let source = scenario.build();
        let first = defragment(&source).unwrap();
        let second = defragment(&first.image).unwrap();
        prop_assert!(first.image == second.image, "second run changed the image");
        prop_assert!(second.report.before.is_contiguous());
    }
}

#[test]
fn source_buffer_is_not_modified() {
    let source = fixed_scenario().build();
    let snapshot = source.clone();
    let _ = defragment(&source).expect("defragment");
    assert_eq!(source, snapshot);
}

#[test]
fn verifier_catches_a_swapped_pair() {
    let source = fixed_scenario().build();
    let out = defragment(&source).expect("defragment");
    let mut tampered = out.image.clone();
    let sb = Superblock::parse_from_image(&tampered).expect("superblock");
    let layout = ImageLayout::from_superblock(&sb, tampered.len()).expect("layout");
    let data_start = layout.data_region_start();
    let bs = layout.block_size;
    // Swap the first two relocated blocks.
    let (first, rest) = tampered[data_start..].split_at_mut(bs);
    first.swap_with_slice(&mut rest[..bs]);
    let report = verify_defragmented(&source, &tampered).expect("verify");
    assert!(!report.is_clean());
}
