use dirpatch::{
    diff_trees, ApplyEngine, BlockCodec, DiffMode, Error, OpKind, PatchReader, PatchWriter,
    TreeScan,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

type Tree = BTreeMap<String, Vec<u8>>;

fn materialize(files: &Tree) -> TempDir {
    let temp = TempDir::new().unwrap();
    for (rel, content) in files {
        let full = temp.path().join(rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }
    temp
}

fn snapshot(root: &Path) -> Tree {
    let scan = TreeScan::open(root).unwrap();
    scan.paths()
        .map(|p| (p.to_string(), std::fs::read(p.to_native(scan.root())).unwrap()))
        .collect()
}

/// Diff, write to artifact bytes, read back, apply with backup, then apply the reverse.
fn round_trip(base: &Tree, target: &Tree, mode: DiffMode) {
    let codec = BlockCodec::new(64, 3);
    let base_dir = materialize(base);
    let target_dir = materialize(target);
    let patch = diff_trees(
        &TreeScan::open(base_dir.path()).unwrap(),
        &TreeScan::open(target_dir.path()).unwrap(),
        mode,
        &codec,
    )
    .unwrap();

    let bytes = PatchWriter::default()
        .to_bytes(&patch.manifest, &patch.payloads)
        .unwrap();
    let reader = PatchReader::from_bytes(bytes).unwrap();
    assert_eq!(reader.manifest(), &patch.manifest);

    let live = materialize(base);
    let engine = ApplyEngine::new(live.path(), &codec).unwrap();
    let applied = engine.apply(reader.manifest(), &reader, true).unwrap();
    assert_eq!(&snapshot(live.path()), target);

    let reverse = applied.reverse.unwrap();
    engine.apply(&reverse.manifest, &reverse.payloads, false).unwrap();
    assert_eq!(&snapshot(live.path()), base);
}

fn tree_strategy() -> impl Strategy<Value = Tree> {
    let path = prop::sample::select(vec![
        "a", "b.txt", "c/d", "c/e.bin", "c/f/g", "h/i", "zz",
    ]);
    let content = prop::collection::vec(any::<u8>(), 0..300);
    prop::collection::btree_map(path.prop_map(String::from), content, 0..6)
}

/// No generated path is a prefix directory of another, so pairs never conflict.
fn tree_pair() -> impl Strategy<Value = (Tree, Tree)> {
    (tree_strategy(), tree_strategy())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_apply_then_reverse_restores_base((base, target) in tree_pair(), binary in any::<bool>()) {
        let mode = if binary { DiffMode::Binary } else { DiffMode::File };
        round_trip(&base, &target, mode);
    }

    #[test]
    fn prop_diff_of_identical_trees_is_noop(tree in tree_strategy()) {
        let codec = BlockCodec::default();
        let a = materialize(&tree);
        let b = materialize(&tree);
        let patch = diff_trees(
            &TreeScan::open(a.path()).unwrap(),
            &TreeScan::open(b.path()).unwrap(),
            DiffMode::Binary,
            &codec,
        )
        .unwrap();
        prop_assert!(patch.manifest.is_noop());
        prop_assert_eq!(patch.manifest.operations().len(), tree.len());
        prop_assert!(patch.payloads.is_empty());
    }
}

#[test]
fn test_scenario_manifest_and_reverse() {
    let base: Tree = [("a.txt", "hello"), ("b.txt", "world")]
        .into_iter()
        .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
        .collect();
    let target: Tree = [("a.txt", "hello!"), ("c.txt", "new")]
        .into_iter()
        .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
        .collect();

    let base_dir = materialize(&base);
    let target_dir = materialize(&target);
    let patch = diff_trees(
        &TreeScan::open(base_dir.path()).unwrap(),
        &TreeScan::open(target_dir.path()).unwrap(),
        DiffMode::Binary,
        &BlockCodec::default(),
    )
    .unwrap();
    let kinds: Vec<(&str, OpKind)> = patch
        .manifest
        .operations()
        .iter()
        .map(|op| (op.path().as_str(), op.kind()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("a.txt", OpKind::Modify),
            ("b.txt", OpKind::Delete),
            ("c.txt", OpKind::Add),
        ]
    );

    round_trip(&base, &target, DiffMode::Binary);
    round_trip(&base, &target, DiffMode::File);
}

#[test]
fn test_empty_base_single_add() {
    let base = Tree::new();
    let target: Tree = [("only.txt".to_string(), b"solo".to_vec())].into_iter().collect();
    round_trip(&base, &target, DiffMode::Binary);
}

#[test]
fn test_large_binary_modify_uses_small_delta() {
    let old: Vec<u8> = (0..256 * 1024u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
    let mut new = old.clone();
    new.splice(1000..1000, b"inserted bytes".iter().copied());
    new.truncate(200 * 1024);

    let base: Tree = [("big.bin".to_string(), old)].into_iter().collect();
    let target: Tree = [("big.bin".to_string(), new)].into_iter().collect();
    round_trip(&base, &target, DiffMode::Binary);

    let codec = BlockCodec::default();
    let base_dir = materialize(&base);
    let target_dir = materialize(&target);
    let patch = diff_trees(
        &TreeScan::open(base_dir.path()).unwrap(),
        &TreeScan::open(target_dir.path()).unwrap(),
        DiffMode::Binary,
        &codec,
    )
    .unwrap();
    assert!(patch.summary().payload_bytes < 8 * 1024);
}

#[test]
fn test_every_payload_byte_flip_is_caught() {
    let base: Tree = [("f.bin".to_string(), vec![1u8; 3000])].into_iter().collect();
    let mut changed = vec![1u8; 3000];
    changed[1500] = 2;
    let target: Tree = [("f.bin".to_string(), changed)].into_iter().collect();

    let codec = BlockCodec::default();
    let base_dir = materialize(&base);
    let target_dir = materialize(&target);
    let patch = diff_trees(
        &TreeScan::open(base_dir.path()).unwrap(),
        &TreeScan::open(target_dir.path()).unwrap(),
        DiffMode::Binary,
        &codec,
    )
    .unwrap();
    let bytes = PatchWriter::default()
        .to_bytes(&patch.manifest, &patch.payloads)
        .unwrap();
    let payload_len = patch.payloads.total_bytes() as usize;
    assert!(payload_len > 0);

    for offset in bytes.len() - payload_len..bytes.len() {
        let mut corrupted = bytes.clone();
        corrupted[offset] ^= 0x01;
        let reader = PatchReader::from_bytes(corrupted).unwrap();
        let live = materialize(&base);
        let engine = ApplyEngine::new(live.path(), &codec).unwrap();
        let failure = engine.apply(reader.manifest(), &reader, false).unwrap_err();
        assert!(
            matches!(failure.source, Error::PatchMismatch { check: "payload checksum", .. }),
            "offset {offset}: {:?}",
            failure.source
        );
        assert_eq!(snapshot(live.path()), base);
    }
}
