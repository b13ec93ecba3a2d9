//! The operator registry: names, the AQP support matrix, and the shared
//! join core's contract.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::compute::{OperatorKind, OperatorTuple, build_operator};

    fn tuple(key: i64, ts: i64) -> OperatorTuple {
        OperatorTuple {
            key,
            value: 1.0,
            event_time: ts,
            arrival_time: ts,
        }
    }

    #[test]
    fn aqp_support_matrix_is_exact() {
        let aqp: Vec<OperatorKind> = OperatorKind::ALL
            .into_iter()
            .filter(OperatorKind::supports_aqp)
            .collect();
        assert_eq!(
            aqp,
            vec![
                OperatorKind::MeanAqp,
                OperatorKind::Ima,
                OperatorKind::Mswj,
                OperatorKind::IawjSel,
                OperatorKind::LazyIawjSel,
                OperatorKind::Pecj,
            ]
        );

        for kind in [
            OperatorKind::Iawj,
            OperatorKind::Ai,
            OperatorKind::LinearSvi,
            OperatorKind::Shj,
            OperatorKind::Prj,
        ] {
            assert!(!kind.supports_aqp(), "{kind} must not advertise AQP");
        }
    }

    #[test]
    fn names_round_trip_through_the_registry() {
        for kind in OperatorKind::ALL {
            assert_eq!(OperatorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(OperatorKind::from_name("SHJ"), Some(OperatorKind::Shj));
        assert_eq!(OperatorKind::from_name("MeanAQP"), Some(OperatorKind::MeanAqp));
        assert_eq!(OperatorKind::from_name("nope"), None);
    }

    #[test]
    fn every_kind_is_constructible() {
        for kind in OperatorKind::ALL {
            let mut operator = build_operator(kind);
            assert!(operator.set_config(&HashMap::new()));
            operator.set_window(1_000_000, 1_000_000);
            operator.sync_time(0);
            assert!(operator.start());
            operator.feed_tuple_s(tuple(1, 10));
            operator.feed_tuple_r(tuple(1, 20));
            assert_eq!(operator.get_result(), 1);
            operator.stop();
        }
    }

    #[test]
    fn symmetric_join_counts_cross_products_per_key() {
        let mut operator = build_operator(OperatorKind::Shj);
        operator.start();

        for i in 0..10i64 {
            operator.feed_tuple_s(tuple(i % 5, 100 * i));
        }
        for i in 0..10i64 {
            operator.feed_tuple_r(tuple(i % 5, 100 * i + 50));
        }
        // 5 keys × (2 S × 2 R) = 20.
        assert_eq!(operator.get_result(), 20);
    }

    #[test]
    fn feed_order_does_not_change_the_count() {
        let mut a = build_operator(OperatorKind::Shj);
        a.start();
        a.feed_tuple_s(tuple(1, 1));
        a.feed_tuple_s(tuple(1, 2));
        a.feed_tuple_r(tuple(1, 3));

        let mut b = build_operator(OperatorKind::Shj);
        b.start();
        b.feed_tuple_r(tuple(1, 3));
        b.feed_tuple_s(tuple(1, 1));
        b.feed_tuple_s(tuple(1, 2));

        assert_eq!(a.get_result(), b.get_result());
    }

    #[test]
    fn start_resets_accumulated_state() {
        let mut operator = build_operator(OperatorKind::Shj);
        operator.start();
        operator.feed_tuple_s(tuple(1, 1));
        operator.feed_tuple_r(tuple(1, 2));
        assert_eq!(operator.get_result(), 1);

        assert!(operator.start());
        assert_eq!(operator.get_result(), 0);
    }

    #[test]
    fn tuples_after_stop_are_ignored() {
        let mut operator = build_operator(OperatorKind::Shj);
        operator.start();
        operator.feed_tuple_s(tuple(1, 1));
        operator.stop();
        operator.feed_tuple_r(tuple(1, 2));
        assert_eq!(operator.get_result(), 0);
    }

    #[test]
    fn non_aqp_operators_estimate_zero() {
        let mut operator = build_operator(OperatorKind::Shj);
        operator.start();
        operator.feed_tuple_s(tuple(1, 1));
        operator.feed_tuple_r(tuple(1, 2));
        assert_eq!(operator.get_aqp_result(), 0.0);
    }

    #[test]
    fn uniform_estimate_tracks_skewless_input() {
        let mut operator = build_operator(OperatorKind::MeanAqp);
        operator.start();
        for i in 0..12i64 {
            operator.feed_tuple_s(tuple(i % 3, i));
            operator.feed_tuple_r(tuple(i % 3, i));
        }
        // 3 keys × 4×4 = 48 exact; the uniform estimate matches exactly
        // for unskewed keys.
        assert_eq!(operator.get_result(), 48);
        assert!((operator.get_aqp_result() - 48.0).abs() < 1e-9);
    }

    #[test]
    fn buffer_bound_evicts_oldest_tuples() {
        let mut operator = build_operator(OperatorKind::Shj);
        let mut config = HashMap::new();
        config.insert("s_buffer_len".to_string(), "2".to_string());
        assert!(operator.set_config(&config));
        operator.start();

        operator.feed_tuple_s(tuple(1, 1));
        operator.feed_tuple_s(tuple(1, 2));
        operator.feed_tuple_s(tuple(1, 3)); // evicts the first
        operator.feed_tuple_r(tuple(1, 4));
        // Only the two buffered S tuples can still match.
        assert_eq!(operator.get_result(), 2);
    }

    #[test]
    fn bad_buffer_config_is_rejected() {
        let mut operator = build_operator(OperatorKind::Shj);
        let mut config = HashMap::new();
        config.insert("s_buffer_len".to_string(), "not-a-number".to_string());
        assert!(!operator.set_config(&config));
    }
}
