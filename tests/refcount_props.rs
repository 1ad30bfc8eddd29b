//! # Reference-Count Property Harness
//!
//! Drives the store with random add / remove / delete sequences over a
//! small set of payloads and checks it against a trivial model: a map
//! from root to reference count. After every sequence the stored set, the
//! readable payloads, and the slot accounting must match the model
//! exactly.

use hoststore::{merkle_root, Hash, HostStore, StoreError, SECTOR_SIZE};
use proptest::prelude::*;
use tempfile::tempdir;

const ROOT_COUNT: usize = 2;

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(usize),
    Remove(usize),
    Delete(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0..3u8, 0..ROOT_COUNT).prop_map(|(kind, root)| match kind {
        0 => Op::Add(root),
        1 => Op::Remove(root),
        _ => Op::Delete(root),
    })
}

fn payloads() -> Vec<(Hash, Vec<u8>)> {
    (0..ROOT_COUNT as u8)
        .map(|i| {
            let data = vec![0xa0 + i; SECTOR_SIZE];
            (merkle_root(&data), data)
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 8,
        .. ProptestConfig::default()
    })]

    #[test]
    fn store_matches_reference_count_model(
        ops in proptest::collection::vec(op_strategy(), 1..10)
    ) {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();

        let sectors = payloads();
        let mut model = [0u32; ROOT_COUNT];

        for op in ops {
            match op {
                Op::Add(i) => {
                    let (root, data) = &sectors[i];
                    store.add_sector(*root, data).unwrap();
                    model[i] += 1;
                }
                Op::Remove(i) => {
                    let (root, _) = &sectors[i];
                    if model[i] > 0 {
                        store.remove_sector(*root).unwrap();
                        model[i] -= 1;
                    } else {
                        prop_assert!(matches!(
                            store.remove_sector(*root),
                            Err(StoreError::SectorNotFound)
                        ));
                    }
                }
                Op::Delete(i) => {
                    let (root, _) = &sectors[i];
                    if model[i] > 0 {
                        store.delete_sector(*root).unwrap();
                        model[i] = 0;
                    } else {
                        prop_assert!(matches!(
                            store.delete_sector(*root),
                            Err(StoreError::SectorNotFound)
                        ));
                    }
                }
            }
        }

        // The stored set equals the model's live set.
        let live = model.iter().filter(|&&c| c > 0).count();
        prop_assert_eq!(store.stored_sector_count(), live);
        prop_assert_eq!(store.capacity().used_slots, live as u64);

        for (i, (root, data)) in sectors.iter().enumerate() {
            if model[i] > 0 {
                prop_assert_eq!(&store.read_sector(*root).unwrap(), data);
            } else {
                prop_assert!(matches!(
                    store.read_sector(*root),
                    Err(StoreError::SectorNotFound)
                ));
            }
        }

        // Surviving counts drain exactly as the model predicts.
        for (i, (root, _)) in sectors.iter().enumerate() {
            for _ in 0..model[i] {
                store.remove_sector(*root).unwrap();
            }
            prop_assert!(matches!(
                store.remove_sector(*root),
                Err(StoreError::SectorNotFound)
            ));
        }
        prop_assert_eq!(store.capacity().used_slots, 0);
    }
}
