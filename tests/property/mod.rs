//! Property-based testing for backup-home
//!
//! Uses proptest to check matcher, progress and compression invariants
//! across randomly generated inputs.

use ::backup_home::compression::ParallelGzEncoder;
use ::backup_home::*;
use proptest::prelude::*;
use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Generate relative paths of 1-6 segments
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    let segment = prop_oneof![
        "[a-z]{1,8}",
        "\\.[a-z]{1,6}",
        "[a-z]{1,6}\\.(txt|sock|tmp|rs)",
        Just("node_modules".to_string()),
        Just("target".to_string()),
        Just("Library".to_string()),
    ];
    prop::collection::vec(segment, 1..=6).prop_map(|segments| segments.iter().collect())
}

/// Reader that hands out data in caller-chosen chunk sizes
struct ChunkedReader {
    data: Cursor<Vec<u8>>,
    chunks: Vec<usize>,
    next: usize,
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let limit = self.chunks[self.next % self.chunks.len()].max(1);
        self.next += 1;
        let len = buf.len().min(limit);
        self.data.read(&mut buf[..len])
    }
}

fn transfer_bytes(events: &[TelemetryEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::TransferProgress(s) | TelemetryEvent::TransferCompleted(s) => Some(s.transferred),
            _ => None,
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matching_is_pure(path in path_strategy(), is_dir in any::<bool>()) {
        let sink = MemoryTelemetry::new();
        let set = ExclusionSet::for_platform(Platform::MacOs, "alice", &sink);
        let first = set.is_excluded(&path, is_dir);
        for _ in 0..3 {
            prop_assert_eq!(set.is_excluded(&path, is_dir), first);
        }
        // A freshly built set agrees with the first one.
        let again = ExclusionSet::for_platform(Platform::MacOs, "alice", &sink);
        prop_assert_eq!(again.is_excluded(&path, is_dir), first);
    }

    #[test]
    fn prop_any_segment_matches_anywhere(path in path_strategy()) {
        let set = ExclusionSet::builder().pattern("**/node_modules").build().unwrap();
        let contains = path.components().any(|c| c.as_os_str() == "node_modules");
        prop_assert_eq!(set.is_excluded(&path, false), contains);
    }

    #[test]
    fn prop_extension_matches_last_segment_only(path in path_strategy()) {
        let set = ExclusionSet::builder().pattern("*.sock").build().unwrap();
        let last = path.file_name().unwrap().to_string_lossy().into_owned();
        prop_assert_eq!(set.is_excluded(&path, false), last.ends_with(".sock"));
    }

    #[test]
    fn prop_windows_matching_ignores_case(path in path_strategy()) {
        let sink = MemoryTelemetry::new();
        let set = ExclusionSet::for_platform(Platform::Windows, "alice", &sink);
        let upper = PathBuf::from(path.to_string_lossy().to_uppercase());
        prop_assert_eq!(set.is_excluded(&path, true), set.is_excluded(&upper, true));
    }

    #[test]
    fn prop_progress_is_monotonic(
        data in prop::collection::vec(any::<u8>(), 1..20_000),
        chunks in prop::collection::vec(1usize..4096, 1..8),
    ) {
        let sink = Arc::new(MemoryTelemetry::new());
        let total = data.len() as u64;
        let source = ChunkedReader { data: Cursor::new(data.clone()), chunks, next: 0 };
        let mut reader = ProgressReader::new(source, total, "Upload", sink.clone())
            .with_interval(Duration::ZERO);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        prop_assert_eq!(out, data);

        let events = sink.events();
        let reported = transfer_bytes(&events);
        prop_assert!(reported.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(reported.last().copied(), Some(total));
        let completions = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::TransferCompleted(_)))
            .count();
        prop_assert_eq!(completions, 1);
    }

    #[test]
    fn prop_level_is_always_in_range(raw in any::<i64>()) {
        let level = CompressionLevel::new(raw);
        prop_assert!(level.get() <= 9);
        if !(0..=9).contains(&raw) {
            prop_assert_eq!(level, CompressionLevel::DEFAULT);
        }
    }

    #[test]
    fn prop_parallel_gzip_decodes_to_input(
        data in prop::collection::vec(any::<u8>(), 0..50_000),
        threads in 1usize..4,
        level in 0i64..=9,
    ) {
        let mut encoder =
            ParallelGzEncoder::with_block_size(Vec::new(), CompressionLevel::new(level), threads, 4096).unwrap();
        encoder.write_all(&data).unwrap();
        let (compressed, stats) = encoder.finish().unwrap();
        prop_assert_eq!(stats.bytes_in, data.len() as u64);

        let mut decoded = Vec::new();
        flate2::read::MultiGzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        prop_assert_eq!(decoded, data);
    }
}
