//! Budget accounting, replacement, and the Full outcome.

#[cfg(test)]
mod tests {
    use crate::memtable::{MemTable, PutOutcome};
    use crate::record::Record;

    fn sized(ts: i64) -> (Record, usize) {
        let record = Record::scalar(ts, ts as f64);
        let len = record.encoded_len();
        (record, len)
    }

    #[test]
    fn put_get_single() {
        let mut mem = MemTable::new(1024);
        let (record, len) = sized(10);
        assert_eq!(mem.put(10, record.clone(), len), PutOutcome::Accepted);
        assert_eq!(mem.get(10), Some(&record));
        assert_eq!(mem.get(11), None);
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.size_bytes(), len);
    }

    #[test]
    fn full_when_budget_exceeded() {
        let (first, len) = sized(1);
        // Budget fits exactly one record.
        let mut mem = MemTable::new(len);
        assert_eq!(mem.put(1, first, len), PutOutcome::Accepted);
        assert!(mem.is_full());

        let (second, len2) = sized(2);
        assert_eq!(mem.put(2, second, len2), PutOutcome::Full);
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn replacement_is_always_accepted_and_reaccounted() {
        let (first, len) = sized(1);
        let mut mem = MemTable::new(len);
        assert_eq!(mem.put(1, first, len), PutOutcome::Accepted);

        // Same timestamp with a bigger record: accepted even though the
        // budget is exhausted; accounting follows the new size.
        let replacement = Record::scalar(1, 2.0).with_field("note", "replaced");
        let new_len = replacement.encoded_len();
        assert_eq!(
            mem.put(1, replacement.clone(), new_len),
            PutOutcome::Accepted
        );
        assert_eq!(mem.get(1), Some(&replacement));
        assert_eq!(mem.size_bytes(), new_len);
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn last_writer_wins_on_equal_timestamp() {
        let mut mem = MemTable::new(4096);
        for value in 0..5 {
            let record = Record::scalar(7, value as f64);
            let len = record.encoded_len();
            mem.put(7, record, len);
        }
        assert_eq!(mem.get(7).and_then(|r| r.value.as_scalar()), Some(4.0));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn clear_resets_accounting() {
        let mut mem = MemTable::new(4096);
        for ts in 0..10 {
            let (record, len) = sized(ts);
            mem.put(ts, record, len);
        }
        mem.clear();
        assert!(mem.is_empty());
        assert_eq!(mem.size_bytes(), 0);
        assert!(!mem.is_full());
    }

    #[test]
    fn put_unchecked_ignores_budget() {
        let mut mem = MemTable::new(1);
        let (record, len) = sized(1);
        mem.put_unchecked(1, record, len);
        assert_eq!(mem.len(), 1);
        assert!(mem.is_full());
    }

    #[test]
    fn can_accept_predicts_put() {
        let (first, len) = sized(1);
        let mut mem = MemTable::new(len);
        assert!(mem.can_accept(1, len));
        mem.put(1, first, len);
        assert!(!mem.can_accept(2, len));
        // Existing timestamp is always acceptable.
        assert!(mem.can_accept(1, len * 10));
    }
}
