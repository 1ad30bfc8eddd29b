//! # Storage Folder Management Tests
//!
//! Folder add / grow / shrink / remove against a real store, including
//! sector migration out of shrinking and disappearing folders, forced
//! discards, and folder index reuse.

use hoststore::{merkle_root, Hash, HostStore, StoreError, SECTOR_SIZE};
use tempfile::tempdir;

fn sector(byte: u8) -> (Hash, Vec<u8>) {
    let data = vec![byte; SECTOR_SIZE];
    (merkle_root(&data), data)
}

mod add {
    use super::*;

    #[test]
    fn duplicate_path_is_rejected() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        let folder = dir.path().join("a");
        store.add_storage_folder(&folder, 4).unwrap();

        assert!(matches!(
            store.add_storage_folder(&folder, 8),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert_eq!(store.folder_reports().len(), 1);
    }

    #[test]
    fn zero_slots_is_rejected() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        assert!(matches!(
            store.add_storage_folder(&dir.path().join("a"), 0),
            Err(StoreError::InvalidSlotCount { .. })
        ));
    }

    #[test]
    fn folders_are_listed_with_sizes() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();
        store.add_storage_folder(&dir.path().join("b"), 8).unwrap();

        let reports = store.folder_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].index, 0);
        assert_eq!(reports[0].slot_count, 4);
        assert_eq!(reports[1].index, 1);
        assert_eq!(reports[1].slot_count, 8);
        assert_eq!(store.capacity().total_slots, 12);
    }

    #[test]
    fn new_sectors_spread_to_the_emptiest_folder() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();
        store.add_storage_folder(&dir.path().join("b"), 2).unwrap();

        for byte in 1..=4u8 {
            let (root, data) = sector(byte);
            store.add_sector(root, &data).unwrap();
        }
        let reports = store.folder_reports();
        assert_eq!(reports[0].used_slots, 2);
        assert_eq!(reports[1].used_slots, 2);
    }
}

mod resize {
    use super::*;

    #[test]
    fn grow_extends_capacity_in_place() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        let folder = dir.path().join("a");
        store.add_storage_folder(&folder, 2).unwrap();

        let (root, data) = sector(0x01);
        store.add_sector(root, &data).unwrap();

        store.resize_storage_folder(0, 6, false).unwrap();
        assert_eq!(store.capacity().total_slots, 6);
        assert_eq!(
            std::fs::metadata(folder.join("sectors.dat")).unwrap().len(),
            6 * SECTOR_SIZE as u64
        );

        // Existing data survives and new slots are usable.
        assert_eq!(store.read_sector(root).unwrap(), data);
        for byte in 2..=6u8 {
            let (r, d) = sector(byte);
            store.add_sector(r, &d).unwrap();
        }
        assert_eq!(store.capacity().used_slots, 6);
    }

    #[test]
    fn grow_survives_restart() {
        let dir = tempdir().unwrap();
        let host_dir = dir.path().join("host");
        {
            let store = HostStore::open(&host_dir).unwrap();
            store.add_storage_folder(&dir.path().join("a"), 2).unwrap();
            store.resize_storage_folder(0, 8, false).unwrap();
        }
        let store = HostStore::open(&host_dir).unwrap();
        assert_eq!(store.capacity().total_slots, 8);
    }

    #[test]
    fn shrink_migrates_displaced_sectors() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 8).unwrap();
        store.add_storage_folder(&dir.path().join("b"), 8).unwrap();

        // Land a few sectors in folder a (allocation spreads, so add
        // enough to guarantee some live above slot 1 in folder 0).
        let sectors: Vec<_> = (1..=6u8).map(sector).collect();
        for (root, data) in &sectors {
            store.add_sector(*root, data).unwrap();
        }

        store.resize_storage_folder(0, 1, false).unwrap();

        let reports = store.folder_reports();
        assert_eq!(reports[0].slot_count, 1);
        assert_eq!(store.capacity().total_slots, 9);
        // Every sector is still readable, wherever it ended up.
        for (root, data) in &sectors {
            assert_eq!(&store.read_sector(*root).unwrap(), data);
        }
        assert_eq!(store.capacity().used_slots, 6);
    }

    #[test]
    fn shrink_without_room_aborts() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();

        let sectors: Vec<_> = (1..=4u8).map(sector).collect();
        for (root, data) in &sectors {
            store.add_sector(*root, data).unwrap();
        }

        let err = store.resize_storage_folder(0, 1, false).unwrap_err();
        assert!(matches!(err, StoreError::InsufficientCapacity { folder: 0 }));

        // Nothing was lost and the folder kept its size.
        assert_eq!(store.capacity().total_slots, 4);
        for (root, data) in &sectors {
            assert_eq!(&store.read_sector(*root).unwrap(), data);
        }
        // The aborted shrink released its reservations: the folder still
        // has no free slots it pretends are used.
        assert_eq!(store.capacity().used_slots, 4);
    }

    #[test]
    fn forced_shrink_discards_displaced_sectors() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();

        let sectors: Vec<_> = (1..=4u8).map(sector).collect();
        for (root, data) in &sectors {
            store.add_sector(*root, data).unwrap();
        }

        store.resize_storage_folder(0, 1, true).unwrap();
        assert_eq!(store.capacity().total_slots, 1);

        // At most one sector survived; the rest are gone, not corrupt.
        let mut survivors = 0;
        for (root, data) in &sectors {
            match store.read_sector(*root) {
                Ok(read) => {
                    assert_eq!(&read, data);
                    survivors += 1;
                }
                Err(StoreError::SectorNotFound) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert!(survivors <= 1);
        assert_eq!(store.stored_sector_count(), survivors);
    }

    #[test]
    fn resize_of_unknown_folder_is_not_found() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        assert!(matches!(
            store.resize_storage_folder(3, 8, false),
            Err(StoreError::FolderNotFound { index: 3 })
        ));
    }
}

mod remove {
    use super::*;

    #[test]
    fn removal_migrates_sectors_and_frees_the_index() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        let folder_a = dir.path().join("a");
        store.add_storage_folder(&folder_a, 1).unwrap();

        let (root, data) = sector(0x01);
        store.add_sector(root, &data).unwrap();

        store.add_storage_folder(&dir.path().join("b"), 4).unwrap();
        store.remove_storage_folder(0, false).unwrap();

        // The sector now lives in folder b and reads back intact.
        assert_eq!(store.read_sector(root).unwrap(), data);
        let reports = store.folder_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].index, 1);
        assert_eq!(reports[0].used_slots, 1);
        assert!(!folder_a.join("sectors.dat").exists());

        // Index 0 is reusable by a later add.
        store.add_storage_folder(&dir.path().join("c"), 2).unwrap();
        let reports = store.folder_reports();
        assert_eq!(reports[0].index, 0);
    }

    #[test]
    fn removal_without_room_aborts() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();

        let (root, data) = sector(0x02);
        store.add_sector(root, &data).unwrap();

        assert!(matches!(
            store.remove_storage_folder(0, false),
            Err(StoreError::InsufficientCapacity { folder: 0 })
        ));
        assert_eq!(store.read_sector(root).unwrap(), data);
        assert_eq!(store.folder_reports().len(), 1);
        // The abort released the evacuation fence.
        assert_eq!(store.capacity().used_slots, 1);
    }

    #[test]
    fn forced_removal_discards_stranded_sectors() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 2).unwrap();

        let (root, data) = sector(0x03);
        store.add_sector(root, &data).unwrap();

        store.remove_storage_folder(0, true).unwrap();
        assert!(store.folder_reports().is_empty());
        assert!(matches!(
            store.read_sector(root),
            Err(StoreError::SectorNotFound)
        ));
    }

    #[test]
    fn empty_folder_removal_needs_no_migration() {
        let dir = tempdir().unwrap();
        let store = HostStore::open(&dir.path().join("host")).unwrap();
        store.add_storage_folder(&dir.path().join("a"), 4).unwrap();
        store.remove_storage_folder(0, false).unwrap();
        assert!(store.folder_reports().is_empty());
        assert_eq!(store.capacity().total_slots, 0);
    }

    #[test]
    fn folder_set_changes_survive_restart() {
        let dir = tempdir().unwrap();
        let host_dir = dir.path().join("host");
        let (root, data) = sector(0x04);
        {
            let store = HostStore::open(&host_dir).unwrap();
            store.add_storage_folder(&dir.path().join("a"), 1).unwrap();
            store.add_sector(root, &data).unwrap();
            store.add_storage_folder(&dir.path().join("b"), 4).unwrap();
            store.remove_storage_folder(0, false).unwrap();
        }

        let store = HostStore::open(&host_dir).unwrap();
        let reports = store.folder_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].index, 1);
        assert_eq!(store.read_sector(root).unwrap(), data);
    }
}
