//! Put/get/range correctness — memtable-only and across flushes.

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::lsm::tests::helpers::*;
    use crate::lsm::{LsmError, LsmTree};
    use crate::record::Record;

    #[test]
    fn put_get_single() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(memtable_only_config(tmp.path())).unwrap();

        tree.put(sample(42, 1.0)).unwrap();
        assert_eq!(tree.get(42).unwrap(), Some(sample(42, 1.0)));
        assert_eq!(tree.get(43).unwrap(), None);
        tree.close().unwrap();
    }

    #[test]
    fn newest_write_wins_in_memtable() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(memtable_only_config(tmp.path())).unwrap();

        tree.put(sample(7, 1.0)).unwrap();
        tree.put(sample(7, 2.0)).unwrap();
        tree.put(sample(7, 3.0)).unwrap();

        let record = tree.get(7).unwrap().unwrap();
        assert_eq!(record.value.as_scalar(), Some(3.0));
        tree.close().unwrap();
    }

    #[test]
    fn newest_write_wins_across_flush_boundary() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(memtable_only_config(tmp.path())).unwrap();

        tree.put(sample(7, 1.0)).unwrap();
        tree.flush().unwrap();
        tree.put(sample(7, 2.0)).unwrap();

        assert_eq!(tree.get(7).unwrap().unwrap().value.as_scalar(), Some(2.0));

        // And across two SSTables, the newer-sequence file wins.
        tree.flush().unwrap();
        tree.put(sample(7, 3.0)).unwrap();
        tree.flush().unwrap();
        assert_eq!(tree.get(7).unwrap().unwrap().value.as_scalar(), Some(3.0));

        let range = tree.range(7, 7).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].value.as_scalar(), Some(3.0));
        tree.close().unwrap();
    }

    #[test]
    fn range_merges_memtable_and_sstables_in_order() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(memtable_only_config(tmp.path())).unwrap();

        for ts in [10, 30, 50] {
            tree.put(sample(ts, ts as f64)).unwrap();
        }
        tree.flush().unwrap();
        for ts in [20, 40] {
            tree.put(sample(ts, ts as f64)).unwrap();
        }

        let ts: Vec<i64> = tree
            .range(10, 50)
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(ts, vec![10, 20, 30, 40, 50]);
        tree.close().unwrap();
    }

    #[test]
    fn rotation_keeps_every_record_visible() {
        let tmp = TempDir::new().unwrap();
        // 512-byte budget: a handful of records per memtable.
        let tree = tree_with(small_buffer_config(tmp.path()), 0, 10, 100);

        for i in 0..100 {
            let record = tree.get(i * 10).unwrap().unwrap();
            assert_eq!(record.value.as_scalar(), Some(i as f64), "ts {}", i * 10);
        }
        tree.close().unwrap();
    }

    #[test]
    fn oversized_record_is_rejected_before_the_wal() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(small_buffer_config(tmp.path())).unwrap();

        let huge = Record::scalar(1, 0.0).with_field("blob", "x".repeat(4096));
        let err = tree.put(huge).unwrap_err();
        assert!(matches!(err, LsmError::RecordTooLarge { .. }));

        // The log carries nothing for the rejected record.
        drop(tree);
        let reopened = LsmTree::open(small_buffer_config(tmp.path())).unwrap();
        assert_eq!(reopened.get(1).unwrap(), None);
        reopened.close().unwrap();
    }

    #[test]
    fn stats_reflect_tree_shape() {
        let tmp = TempDir::new().unwrap();
        let tree = LsmTree::open(memtable_only_config(tmp.path())).unwrap();

        tree.put(sample(1, 1.0)).unwrap();
        let stats = tree.stats().unwrap();
        assert_eq!(stats.active_memtable_records, 1);
        assert!(stats.active_memtable_bytes > 0);
        assert!(stats.levels.is_empty());

        tree.flush().unwrap();
        let stats = tree.stats().unwrap();
        assert_eq!(stats.active_memtable_records, 0);
        assert_eq!(stats.levels.len(), 1);
        assert_eq!(stats.levels[0].files, 1);
        tree.close().unwrap();
    }

    #[test]
    fn clear_drops_everything() {
        let tmp = TempDir::new().unwrap();
        let tree = tree_with(small_buffer_config(tmp.path()), 0, 1, 50);
        tree.flush().unwrap();

        tree.clear().unwrap();
        assert!(tree.range(i64::MIN, i64::MAX).unwrap().is_empty());
        assert_eq!(tree.get(10).unwrap(), None);
        tree.close().unwrap();
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = memtable_only_config(tmp.path());
        config.memtable_max_bytes = 0;
        assert!(matches!(
            LsmTree::open(config),
            Err(LsmError::InvalidConfig(_))
        ));

        let mut config = memtable_only_config(tmp.path());
        config.max_levels = 0;
        assert!(LsmTree::open(config).is_err());
    }
}
