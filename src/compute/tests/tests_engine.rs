//! Engine behavior: the deterministic SHJ scenario, error paths, result
//! records, and metrics.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::compute::tests::helpers::*;
    use crate::compute::{ComputeConfig, ComputeEngine, ComputeError, OperatorKind};
    use crate::record::TimeRange;

    /// The deterministic join: 10 S and 10 R tuples with keys repeating
    /// with period 5; every key contributes 2×2 pairs.
    #[test]
    fn shj_window_join_is_exact() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        for i in 0..10i64 {
            stream_s.insert(tuple_record(100 * i, i % 5, i as f64)).unwrap();
            stream_r
                .insert(tuple_record(100 * i + 50, i % 5, (2 * i) as f64))
                .unwrap();
        }

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let status = engine
            .execute_window_join(0, TimeRange::new(0, 2000))
            .unwrap();

        assert!(status.success);
        assert_eq!(status.input_s_count, 10);
        assert_eq!(status.input_r_count, 10);
        assert_eq!(status.join_count, 20);
        assert!((status.selectivity - 0.20).abs() < 1e-12);
        assert!(!status.used_aqp);
        assert_eq!(status.aqp_estimate, 0.0);
        assert!(!status.timeout_occurred);

        // One summary record landed in the result table.
        let result_table = tables.get_join_result_table(&results).unwrap();
        let written = result_table.query_by_window(0).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].tag("algorithm"), Some("SHJ"));
        assert_eq!(written[0].field("join_count"), Some("20"));
        assert_eq!(written[0].field("selectivity"), Some("0.200000"));
        assert_eq!(written[0].field("used_aqp"), Some("false"));
        tables.close_all().unwrap();
    }

    #[test]
    fn window_boundary_is_half_open() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        stream_s.insert(tuple_record(999, 1, 1.0)).unwrap();
        stream_s.insert(tuple_record(1000, 1, 1.0)).unwrap(); // at end: excluded
        stream_r.insert(tuple_record(500, 1, 1.0)).unwrap();

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let status = engine
            .execute_window_join(0, TimeRange::new(0, 1000))
            .unwrap();
        assert_eq!(status.input_s_count, 1);
        assert_eq!(status.input_r_count, 1);
        assert_eq!(status.join_count, 1);
        tables.close_all().unwrap();
    }

    #[test]
    fn aqp_capable_operator_reports_an_estimate() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        for i in 0..8i64 {
            stream_s.insert(tuple_record(10 * i, i % 2, 1.0)).unwrap();
            stream_r.insert(tuple_record(10 * i + 5, i % 2, 1.0)).unwrap();
        }

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::MeanAqp, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let status = engine
            .execute_window_join(1, TimeRange::new(0, 1000))
            .unwrap();
        // 2 keys, 4 S + 4 R each: exact 32; the uniform estimate agrees.
        assert_eq!(status.join_count, 32);
        assert!((status.aqp_estimate - 32.0).abs() < 1e-9);
        assert!(status.aqp_error < 1e-9);
        // No timeout happened, so the exact result was reported.
        assert!(!status.used_aqp);

        let metrics = engine.metrics();
        assert_eq!(metrics.aqp_invocations, 1);
        tables.close_all().unwrap();
    }

    #[test]
    fn uninitialized_engine_refuses_to_run() {
        let engine = ComputeEngine::uninitialized();
        assert!(!engine.is_initialized());
        let err = engine
            .execute_window_join(0, TimeRange::new(0, 1000))
            .unwrap_err();
        assert!(matches!(err, ComputeError::NotInitialized));
        assert_eq!(err.to_string(), "Engine not initialized");
    }

    #[test]
    fn invalid_range_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());
        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        for range in [TimeRange::new(10, 10), TimeRange::new(10, 5)] {
            assert!(matches!(
                engine.execute_window_join(0, range),
                Err(ComputeError::InvalidRange(_))
            ));
        }
        tables.close_all().unwrap();
    }

    #[test]
    fn missing_input_table_surfaces_as_table_error() {
        let tmp = TempDir::new().unwrap();
        let (tables, [_, r, results]) = pecj_setup(tmp.path());
        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, "ghost", &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        assert!(matches!(
            engine.execute_window_join(0, TimeRange::new(0, 1000)),
            Err(ComputeError::Table(_))
        ));
        tables.close_all().unwrap();
    }

    #[test]
    fn empty_window_completes_with_zero_counts() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());
        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Prj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let status = engine
            .execute_window_join(9, TimeRange::new(0, 1000))
            .unwrap();
        assert!(status.success);
        assert_eq!(status.join_count, 0);
        assert_eq!(status.selectivity, 0.0);
        tables.close_all().unwrap();
    }

    #[test]
    fn metrics_accumulate_and_reset_restores_initial_state() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, results]) = pecj_setup(tmp.path());

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        for i in 0..4i64 {
            stream_s.insert(tuple_record(i, 1, 1.0)).unwrap();
            stream_r.insert(tuple_record(i + 4, 1, 1.0)).unwrap();
        }

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();
        let baseline = engine.metrics();

        engine.execute_window_join(0, TimeRange::new(0, 100)).unwrap();
        engine.execute_window_join(1, TimeRange::new(0, 100)).unwrap();

        let metrics = engine.metrics();
        assert_eq!(metrics.total_windows_completed, 2);
        assert_eq!(metrics.total_tuples_processed, 16);
        assert!(metrics.avg_latency_ms >= 0.0);
        assert!(metrics.max_latency_ms >= metrics.min_latency_ms);
        assert!(metrics.peak_memory_bytes > 0);
        assert!(metrics.avg_join_selectivity > 0.0);

        // Reset restores the post-initialize metrics without touching the
        // tables.
        engine.reset();
        assert_eq!(engine.metrics(), baseline);
        let result_table = tables.get_join_result_table(&results).unwrap();
        assert_eq!(result_table.size(), 2);
        tables.close_all().unwrap();
    }

    #[test]
    fn rejects_empty_table_names() {
        let tmp = TempDir::new().unwrap();
        let (tables, [s, r, _]) = pecj_setup(tmp.path());
        let config = ComputeConfig::new(OperatorKind::Shj, &s, &r, "");
        assert!(matches!(
            ComputeEngine::initialize(config, Arc::clone(&tables), None),
            Err(ComputeError::InvalidConfig(_))
        ));
    }
}
