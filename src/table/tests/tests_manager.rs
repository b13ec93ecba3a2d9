//! Namespace, lifecycle, batch fan-out, and the global memory cap.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use crate::record::TimeRange;
    use crate::table::tests::helpers::*;
    use crate::table::{TableError, TableManager, TableManagerConfig, TableType};

    fn manager(tmp: &TempDir) -> TableManager {
        init_tracing();
        TableManager::new(TableManagerConfig::new(tmp.path())).unwrap()
    }

    #[test]
    fn create_lookup_and_type_mismatch() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        mgr.create_stream_table("s", &test_config()).unwrap();
        mgr.create_join_result_table("results", &test_config()).unwrap();

        assert!(mgr.has("s"));
        assert!(mgr.has("results"));
        assert!(!mgr.has("missing"));
        assert_eq!(mgr.count(), 2);

        assert!(mgr.get_stream_table("s").is_ok());
        assert!(matches!(
            mgr.get_stream_table("results"),
            Err(TableError::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.get_stream_table("missing"),
            Err(TableError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        mgr.create_stream_table("s", &test_config()).unwrap();
        assert!(matches!(
            mgr.create_stream_table("s", &test_config()),
            Err(TableError::AlreadyExists(_))
        ));
        assert!(matches!(
            mgr.create_join_result_table("s", &test_config()),
            Err(TableError::AlreadyExists(_))
        ));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        assert!(mgr.create_stream_table("", &test_config()).is_err());
        assert!(mgr.create_stream_table("a/b", &test_config()).is_err());
        assert!(mgr.create_stream_table("..", &test_config()).is_err());
    }

    #[test]
    fn pecj_tables_follow_the_naming_convention() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        let [s, r, results] = mgr.create_pecj_tables("exp1_").unwrap();
        assert_eq!(s, "exp1_stream_s");
        assert_eq!(r, "exp1_stream_r");
        assert_eq!(results, "exp1_join_results");

        assert_eq!(mgr.list_by_type(TableType::Stream).len(), 2);
        assert_eq!(mgr.list_by_type(TableType::JoinResult).len(), 1);
    }

    #[test]
    fn drop_requires_no_live_handles() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        let handle = mgr.create_stream_table("s", &test_config()).unwrap();
        assert!(matches!(
            mgr.drop_table("s"),
            Err(TableError::LiveHandles(_))
        ));

        drop(handle);
        mgr.drop_table("s").unwrap();
        assert!(!mgr.has("s"));
        assert!(!tmp.path().join("s").exists());

        assert!(matches!(
            mgr.drop_table("s"),
            Err(TableError::NotFound(_))
        ));
    }

    #[test]
    fn batch_fan_out_inserts_and_queries() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        mgr.create_stream_table("a", &test_config()).unwrap();
        mgr.create_stream_table("b", &test_config()).unwrap();

        let mut batches = HashMap::new();
        batches.insert(
            "a".to_string(),
            (0..5).map(|i| reading(i, "x", i as f64)).collect(),
        );
        batches.insert(
            "b".to_string(),
            (0..3).map(|i| reading(i * 10, "y", i as f64)).collect(),
        );

        let indices = mgr.insert_batch_to_tables(batches).unwrap();
        assert_eq!(indices["a"], vec![0, 1, 2, 3, 4]);
        assert_eq!(indices["b"], vec![0, 1, 2]);

        let mut ranges = HashMap::new();
        ranges.insert("a".to_string(), TimeRange::new(0, 100));
        ranges.insert("b".to_string(), TimeRange::new(0, 100));
        let results = mgr.query_batch_from_tables(ranges).unwrap();
        assert_eq!(results["a"].len(), 5);
        assert_eq!(results["b"].len(), 3);
    }

    #[test]
    fn batch_to_missing_table_fails() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut batches = HashMap::new();
        batches.insert("ghost".to_string(), vec![reading(1, "x", 1.0)]);
        assert!(matches!(
            mgr.insert_batch_to_tables(batches),
            Err(TableError::NotFound(_))
        ));
    }

    #[test]
    fn memory_cap_triggers_flush_all_not_rejection() {
        let tmp = TempDir::new().unwrap();
        let mgr = TableManager::new(TableManagerConfig {
            base_dir: tmp.path().to_path_buf(),
            // Absurdly low: any insert overflows the cap.
            max_total_memtable_bytes: Some(16),
        })
        .unwrap();
        mgr.create_stream_table("s", &test_config()).unwrap();

        let mut batches = HashMap::new();
        batches.insert(
            "s".to_string(),
            (0..10).map(|i| reading(i, "x", i as f64)).collect(),
        );
        // Accepted despite the cap; the manager flushed instead.
        mgr.insert_batch_to_tables(batches).unwrap();

        assert!(mgr.total_memtable_bytes().unwrap() <= 16);
        let table = mgr.get_stream_table("s").unwrap();
        assert_eq!(table.query(TimeRange::new(0, 9), None).unwrap().len(), 10);
    }

    #[test]
    fn flush_all_and_compact_all_cover_every_table() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        mgr.create_stream_table("a", &test_config()).unwrap();
        mgr.create_join_result_table("r", &test_config()).unwrap();

        let a = mgr.get_stream_table("a").unwrap();
        for i in 0..5 {
            a.insert(reading(i, "x", i as f64)).unwrap();
        }
        drop(a);

        mgr.flush_all().unwrap();
        assert_eq!(mgr.total_memtable_bytes().unwrap(), 0);
        mgr.compact_all().unwrap();
        mgr.close_all().unwrap();
    }
}
