//! Invalid files must be rejected at open, never half-read.

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::memtable::MemTable;
    use crate::record::Record;
    use crate::sstable::{self, SsTable, SsTableError};

    fn build(tmp: &TempDir) -> std::path::PathBuf {
        let mut mem = MemTable::new(1 << 20);
        for ts in 0..10 {
            let record = Record::scalar(ts, 0.0);
            let len = record.encoded_len();
            mem.put(ts, record, len);
        }
        let path = tmp.path().join(sstable::file_name(0, 1));
        sstable::build_from_memtable(&path, 0, 1, &mem).unwrap();
        path
    }

    #[test]
    fn bad_magic_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build(&tmp);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"NOPE").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let err = SsTable::open(&path).unwrap_err();
        assert!(matches!(err, SsTableError::Corruption(_)));
    }

    #[test]
    fn newer_format_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build(&tmp);

        // The version field sits right after the 4-byte magic.
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(4)).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let err = SsTable::open(&path).unwrap_err();
        assert!(matches!(err, SsTableError::Corruption(_)));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = build(&tmp);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len / 2).unwrap();
        file.sync_all().unwrap();
        drop(file);

        assert!(SsTable::open(&path).is_err());
    }

    #[test]
    fn short_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(sstable::file_name(0, 5));
        std::fs::write(&path, b"SSTB").unwrap();
        let err = SsTable::open(&path).unwrap_err();
        assert!(matches!(err, SsTableError::Corruption(_)));
    }
}
