//! Chaos testing for backup-home
//!
//! Injects unreadable and failing source files into otherwise healthy trees
//! and checks that the soft-fail policy holds: with skip-on-error the run
//! finishes without the bad files, without it the run stops.

use ::backup_home::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// How an injected file misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `open` fails with permission denied
    Unreadable,
    /// Reads fail after this many bytes
    FailAfter(usize),
}

/// File opener that injects faults for selected file names
pub struct FaultyOpener {
    faults: Vec<(String, Fault)>,
}

impl fmt::Debug for FaultyOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyOpener").field("faults", &self.faults.len()).finish()
    }
}

impl FaultyOpener {
    pub fn new(faults: Vec<(String, Fault)>) -> Self {
        Self { faults }
    }

    fn fault_for(&self, path: &Path) -> Option<Fault> {
        let name = path.file_name()?.to_string_lossy();
        self.faults.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
    }
}

struct FailingReader {
    inner: File,
    remaining: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::other("device went away"));
        }
        let len = buf.len().min(self.remaining);
        let n = self.inner.read(&mut buf[..len])?;
        self.remaining -= n;
        Ok(n)
    }
}

impl FileOpener for FaultyOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        match self.fault_for(path) {
            Some(Fault::Unreadable) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")),
            Some(Fault::FailAfter(n)) => Ok(Box::new(FailingReader {
                inner: File::open(path)?,
                remaining: n,
            })),
            None => StdFileOpener.open(path),
        }
    }
}

/// Source tree of `count` random files named `file-NNN.bin`
pub struct ChaosTree {
    pub source: TempDir,
    pub out: TempDir,
    pub names: Vec<String>,
}

impl ChaosTree {
    pub fn new(count: usize, seed: u64) -> Self {
        let source = TempDir::new().unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut names = Vec::with_capacity(count);
        for i in 0..count {
            let dir = source.path().join(format!("dir{}", i % 7));
            fs::create_dir_all(&dir).unwrap();
            let name = format!("file-{:03}.bin", i);
            let size = rng.random_range(0..40_000usize);
            let content: Vec<u8> = (0..size).map(|_| rng.random()).collect();
            fs::write(dir.join(&name), content).unwrap();
            names.push(name);
        }
        Self {
            source,
            out: TempDir::new().unwrap(),
            names,
        }
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.out.path().join(name)
    }
}

fn archived_names(path: &Path) -> HashSet<String> {
    let mut archive = tar::Archive::new(flate2::read::MultiGzDecoder::new(File::open(path).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.header().entry_type() == tar::EntryType::Regular)
        .map(|e| {
            e.path()
                .unwrap()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn job(tree: &ChaosTree, output: &Path, opener: FaultyOpener, skip: bool) -> BackupJob {
        BackupBuilder::new(tree.source.path())
            .output(output)
            .platform(Platform::Other)
            .username("alice")
            .workers(4)
            .skip_on_error(skip)
            .opener(Arc::new(opener))
            .build()
            .unwrap()
    }

    #[test]
    #[traced_test]
    fn test_one_unreadable_file_is_skipped() {
        let tree = ChaosTree::new(100, 7);
        let bad = tree.names[42].clone();
        let output = tree.output("alice.tar.gz");
        let opener = FaultyOpener::new(vec![(bad.clone(), Fault::Unreadable)]);

        let report = job(&tree, &output, opener, true).run().unwrap();

        let names = archived_names(&output);
        assert_eq!(names.len(), 99);
        assert!(!names.contains(&bad));
        assert_eq!(report.archive.stats.files_written, 99);
        assert_eq!(report.archive.stats.files_skipped, 1);
        assert!(logs_contain("permission denied"));
        assert!(logs_contain(&bad));
    }

    #[test]
    fn test_one_unreadable_file_aborts_in_strict_mode() {
        let tree = ChaosTree::new(100, 7);
        let bad = tree.names[42].clone();
        let output = tree.output("alice.tar.gz");
        let opener = FaultyOpener::new(vec![(bad.clone(), Fault::Unreadable)]);

        let err = job(&tree, &output, opener, false).run().unwrap_err();
        match err {
            BackupError::ArchiveFailed(inner) => match *inner {
                BackupError::Entry { path, .. } => assert!(path.ends_with(&bad)),
                other => panic!("unexpected inner error: {other:?}"),
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_mid_read_failure_pads_tar_entry() {
        let tree = ChaosTree::new(20, 11);
        // Larger than one read-ahead buffer, so the failure lands after the header.
        fs::write(tree.source.path().join("dir0/big.bin"), vec![3u8; 100_000]).unwrap();
        let output = tree.output("alice.tar.gz");
        let sink = Arc::new(MemoryTelemetry::new());

        let stats = ArchivePipeline::new(
            tree.source.path(),
            &output,
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            sink.clone(),
        )
        .opener(Arc::new(FaultyOpener::new(vec![("big.bin".to_string(), Fault::FailAfter(40_000))])))
        .run()
        .unwrap();

        assert_eq!(stats.files_padded, 1);
        assert_eq!(stats.files_written, 20);
        assert_eq!(sink.count(|e| matches!(e, TelemetryEvent::EntryPadded { .. })), 1);

        // The stream stays readable to the end, padded entry included.
        let mut archive = tar::Archive::new(flate2::read::MultiGzDecoder::new(File::open(&output).unwrap()));
        let mut regular = 0;
        for item in archive.entries().unwrap() {
            let mut item = item.unwrap();
            if item.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            regular += 1;
            if item.path().unwrap().ends_with("big.bin") {
                let mut body = Vec::new();
                item.read_to_end(&mut body).unwrap();
                assert_eq!(body.len(), 100_000);
                assert!(body[..40_000].iter().all(|b| *b == 3));
                assert!(body[40_000..].iter().all(|b| *b == 0));
            }
        }
        assert_eq!(regular, 21);
    }

    #[test]
    fn test_mid_read_failure_discards_zip_entry() {
        let tree = ChaosTree::new(20, 13);
        let victim = tree.names[3].clone();
        let output = tree.output("alice.zip");
        let sink = Arc::new(MemoryTelemetry::new());

        let stats = ArchivePipeline::new(
            tree.source.path(),
            &output,
            ArchiveFormat::Zip,
            Arc::new(IncludeEverything),
            sink.clone(),
        )
        .opener(Arc::new(FaultyOpener::new(vec![(victim.clone(), Fault::FailAfter(0))])))
        .run()
        .unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.ends_with(&victim)));
        assert_eq!(stats.files_written + stats.files_skipped, 20);
        assert_eq!(sink.count(|e| matches!(e, TelemetryEvent::EntrySkipped { .. })), 1);
    }

    #[test]
    fn test_many_faults_under_load() {
        let tree = ChaosTree::new(200, 99);
        let mut rng = StdRng::seed_from_u64(5);
        let mut faults = Vec::new();
        for name in &tree.names {
            if rng.random_bool(0.1) {
                faults.push((name.clone(), Fault::Unreadable));
            }
        }
        let bad: HashSet<String> = faults.iter().map(|(n, _)| n.clone()).collect();
        let output = tree.output("alice.tar.gz");

        let stats = ArchivePipeline::new(
            tree.source.path(),
            &output,
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            Arc::new(MemoryTelemetry::new()),
        )
        .workers(8)
        .queue_capacity(2)
        .opener(Arc::new(FaultyOpener::new(faults)))
        .run()
        .unwrap();

        let names = archived_names(&output);
        assert_eq!(stats.files_skipped, bad.len());
        assert_eq!(names.len(), 200 - bad.len());
        assert!(names.is_disjoint(&bad));
    }
}
