//! Trigger policies and watermark behavior, driven without the dispatch
//! loop.

#[cfg(test)]
mod tests {
    use rand::Rng;

    use crate::record::TimeRange;
    use crate::table::IngestObserver;
    use crate::window::tests::helpers::*;
    use crate::window::{TriggerPolicy, WindowState};

    /// The tumbling scenario: three events, three windows, eligibility
    /// driven purely by the watermark.
    #[test]
    fn tumbling_time_based_trigger() {
        let scheduler = detached_scheduler(tumbling_config());

        event_s(&scheduler, 500_000);
        // Watermark 500_000: window [0, 1_000_000) is not yet eligible.
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));

        event_s(&scheduler, 1_500_000);
        // Watermark 1_500_000 passes window 0's end.
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));
        assert_eq!(scheduler.window_state(1), Some(WindowState::Accepting));

        event_s(&scheduler, 2_500_000);
        assert_eq!(scheduler.window_state(1), Some(WindowState::Ready));
        assert_eq!(scheduler.window_state(2), Some(WindowState::Accepting));
    }

    #[test]
    fn slack_delays_time_eligibility() {
        let mut config = tumbling_config();
        config.watermark_slack_us = 250_000;
        let scheduler = detached_scheduler(config);

        event_s(&scheduler, 1_100_000);
        // Watermark 1_100_000 < end 1_000_000 + slack 250_000.
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));

        event_s(&scheduler, 1_250_000);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));
    }

    #[test]
    fn max_delay_holds_the_watermark_back() {
        let mut config = tumbling_config();
        config.max_delay_us = 400_000;
        let scheduler = detached_scheduler(config);

        event_s(&scheduler, 1_200_000);
        assert_eq!(scheduler.watermark(), 800_000);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));

        event_s(&scheduler, 1_400_000);
        assert_eq!(scheduler.watermark(), 1_000_000);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));
    }

    #[test]
    fn watermark_is_monotonic_under_out_of_order_events() {
        let mut config = tumbling_config();
        config.max_delay_us = 50_000;
        let scheduler = detached_scheduler(config);

        let mut rng = rand::rng();
        let mut last = scheduler.watermark();
        for _ in 0..500 {
            let ts: i64 = rng.random_range(0..10_000_000);
            event_s(&scheduler, ts);
            let now = scheduler.watermark();
            assert!(now >= last, "watermark regressed: {last} -> {now}");
            last = now;
        }
    }

    #[test]
    fn count_based_trigger_fires_on_combined_counts() {
        let mut config = tumbling_config();
        config.trigger = TriggerPolicy::CountBased;
        config.trigger_count_threshold = 4;
        let scheduler = detached_scheduler(config);

        event_s(&scheduler, 100);
        event_r(&scheduler, 200);
        event_s(&scheduler, 300);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));

        event_r(&scheduler, 400);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));

        let snapshot = &scheduler.windows()[0];
        assert_eq!(snapshot.s_count, 2);
        assert_eq!(snapshot.r_count, 2);
    }

    #[test]
    fn count_based_ignores_the_watermark() {
        let mut config = tumbling_config();
        config.trigger = TriggerPolicy::CountBased;
        config.trigger_count_threshold = 100;
        let scheduler = detached_scheduler(config);

        // Far-future event drives the watermark past every earlier window.
        event_s(&scheduler, 500);
        event_s(&scheduler, 99_000_000);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));
    }

    #[test]
    fn hybrid_trigger_is_a_disjunction() {
        let mut config = tumbling_config();
        config.trigger = TriggerPolicy::Hybrid;
        config.trigger_count_threshold = 2;
        let scheduler = detached_scheduler(config);

        // Count path: two events in window 0, watermark still behind.
        event_s(&scheduler, 100);
        event_r(&scheduler, 200);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));

        // Time path: a single event in window 5 plus a watermark sweep.
        event_s(&scheduler, 5_500_000);
        event_s(&scheduler, 7_000_000);
        assert_eq!(scheduler.window_state(5), Some(WindowState::Ready));
    }

    #[test]
    fn manual_policy_never_auto_triggers() {
        let mut config = tumbling_config();
        config.trigger = TriggerPolicy::Manual;
        config.trigger_count_threshold = 1;
        let scheduler = detached_scheduler(config);

        event_s(&scheduler, 500);
        event_r(&scheduler, 600);
        event_s(&scheduler, 99_000_000);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Accepting));

        // Explicit paths still work.
        assert_eq!(scheduler.trigger_pending_windows().unwrap(), 2);
        assert_eq!(scheduler.window_state(0), Some(WindowState::Ready));

        scheduler
            .schedule_window(42, TimeRange::new(0, 1_000_000))
            .unwrap();
        assert_eq!(scheduler.window_state(42), Some(WindowState::Ready));
    }

    #[test]
    fn unrelated_tables_are_ignored() {
        let scheduler = detached_scheduler(tumbling_config());
        scheduler.on_data_inserted("other_table", 5_000_000, 1);
        assert!(scheduler.windows().is_empty());
        assert_eq!(scheduler.watermark(), i64::MIN);
    }

    #[test]
    fn metrics_track_trigger_activity() {
        let scheduler = detached_scheduler(tumbling_config());
        event_s(&scheduler, 500_000);
        event_s(&scheduler, 2_500_000);

        let metrics = scheduler.metrics();
        assert_eq!(metrics.windows_created, 2);
        assert_eq!(metrics.windows_triggered, 1); // window 0 only
        assert_eq!(metrics.largest_event_time, 2_500_000);
        assert_eq!(metrics.watermark, 2_500_000);
    }
}
