//! Window derivation (sliding, session), the state machine, and the
//! dispatch loop against a real compute engine.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::compute::{ComputeConfig, ComputeEngine, OperatorKind};
    use crate::record::{Record, TimeRange};
    use crate::table::{TableManager, TableManagerConfig};
    use crate::window::tests::helpers::*;
    use crate::window::{
        SchedulerConfig, SchedulerError, TriggerPolicy, WindowScheduler, WindowState, WindowType,
    };

    #[test]
    fn sliding_windows_cover_every_containing_slide() {
        let mut config = tumbling_config();
        config.window_type = WindowType::Sliding;
        config.window_len_us = 1_000_000;
        config.slide_len_us = 250_000;
        let scheduler = detached_scheduler(config);

        // ts 600_000 belongs to windows starting at 600k/250k slides:
        // starts 500k, 250k, 0, -250k → ids 2, 1, 0 (negative start still
        // yields a window; id -1 wraps but stays consistent).
        event_s(&scheduler, 600_000);
        let windows = scheduler.windows();
        assert!(windows.len() >= 3);

        let starts: Vec<i64> = windows.iter().map(|w| w.range.start_us).collect();
        assert!(starts.contains(&0));
        assert!(starts.contains(&250_000));
        assert!(starts.contains(&500_000));
        for window in &windows {
            assert_eq!(window.range.len_us(), 1_000_000);
            assert!(window.range.contains(600_000));
        }
    }

    #[test]
    fn session_windows_extend_and_separate() {
        let mut config = tumbling_config();
        config.window_type = WindowType::Session;
        config.window_len_us = 1_000_000; // gap timeout
        let scheduler = detached_scheduler(config);

        event_s(&scheduler, 100);
        let first = scheduler.windows();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].range, TimeRange::new(100, 1_000_100));

        // Falls inside the session: the end extends.
        event_s(&scheduler, 900_000);
        let extended = scheduler.windows();
        assert_eq!(extended.len(), 1);
        assert_eq!(extended[0].range.end_us, 1_900_000);

        // Past the gap: a new session opens.
        event_s(&scheduler, 5_000_000);
        assert_eq!(scheduler.windows().len(), 2);
    }

    #[test]
    fn schedule_window_rejects_degenerate_and_terminal() {
        let scheduler = detached_scheduler(tumbling_config());

        assert!(matches!(
            scheduler.schedule_window(1, TimeRange::new(10, 10)),
            Err(SchedulerError::InvalidWindow(_))
        ));

        scheduler.schedule_window(1, TimeRange::new(0, 100)).unwrap();
        assert_eq!(scheduler.window_state(1), Some(WindowState::Ready));
    }

    /// Full dispatch: windows trigger, execute through a real engine, and
    /// finish in a terminal state exactly once.
    #[test]
    fn dispatch_completes_each_window_exactly_once() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tables =
            Arc::new(TableManager::new(TableManagerConfig::new(tmp.path())).unwrap());
        let [s, r, results] = tables.create_pecj_tables("t_").unwrap();

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let config = SchedulerConfig {
            window_type: WindowType::Tumbling,
            window_len_us: 1_000_000,
            slide_len_us: 1_000_000,
            trigger: TriggerPolicy::TimeBased,
            watermark_slack_us: 0,
            max_delay_us: 0,
            trigger_interval_us: 5_000,
            ..SchedulerConfig::new(&s, &r, &results)
        };
        let scheduler = Arc::new(WindowScheduler::new(config, engine).unwrap());

        let completions = Arc::new(AtomicU64::new(0));
        let cb_completions = Arc::clone(&completions);
        scheduler.on_window_completed(move |window, status| {
            assert_eq!(window.state, WindowState::Completed);
            assert!(status.success);
            cb_completions.fetch_add(1, Ordering::SeqCst);
        });

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        scheduler.watch(&stream_s);
        scheduler.watch(&stream_r);
        scheduler.start().unwrap();

        // Two windows of data plus a watermark-driving event.
        for i in 0..10i64 {
            stream_s
                .insert(
                    Record::scalar(i * 100_000, i as f64)
                        .with_tag("key", (i % 2).to_string())
                        .with_field("value", i.to_string()),
                )
                .unwrap();
        }
        stream_r
            .insert(
                Record::scalar(500_000, 1.0)
                    .with_tag("key", "1")
                    .with_field("value", "2"),
            )
            .unwrap();
        // Drives the watermark past windows 0 and 1.
        stream_s
            .insert(
                Record::scalar(2_500_000, 0.0)
                    .with_tag("key", "0")
                    .with_field("value", "0"),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while completions.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        scheduler.stop(true).unwrap();

        assert_eq!(completions.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Completed));
        assert_eq!(scheduler.window_state(1), Some(WindowState::Completed));
        assert_eq!(scheduler.window_state(2), Some(WindowState::Accepting));
        assert_eq!(scheduler.active_window_count(), 0);

        let metrics = scheduler.metrics();
        assert_eq!(metrics.windows_completed, 2);
        assert_eq!(metrics.windows_failed, 0);
        assert_eq!(metrics.callback_errors, 0);

        // The engine wrote one summary per completed window.
        let result_table = tables.get_join_result_table(&results).unwrap();
        assert_eq!(result_table.query_by_window(0).unwrap().len(), 1);
        assert_eq!(result_table.query_by_window(1).unwrap().len(), 1);
        tables.close_all().unwrap();
    }

    /// Failures land in Failed, fire the failure callback, and panicking
    /// callbacks are contained.
    #[test]
    fn failed_windows_and_panicking_callbacks_are_counted() {
        init_tracing();
        // Uninitialized engine: every execution fails.
        let engine = ComputeEngine::uninitialized();
        let mut config = tumbling_config();
        config.trigger_interval_us = 5_000;
        let scheduler = Arc::new(WindowScheduler::new(config, engine).unwrap());

        let failures = Arc::new(AtomicU64::new(0));
        let cb_failures = Arc::clone(&failures);
        scheduler.on_window_failed(move |window, status| {
            assert_eq!(window.state, WindowState::Failed);
            assert!(!status.success);
            cb_failures.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.on_window_failed(|_, _| panic!("listener bug"));

        scheduler.start().unwrap();
        scheduler
            .schedule_window(3, TimeRange::new(0, 1_000_000))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while (failures.load(Ordering::SeqCst) < 1 || scheduler.metrics().callback_errors < 1)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        scheduler.stop(true).unwrap();

        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.window_state(3), Some(WindowState::Failed));
        let metrics = scheduler.metrics();
        assert_eq!(metrics.windows_failed, 1);
        assert_eq!(metrics.callback_errors, 1);
    }
}
