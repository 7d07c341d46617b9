//! Integration tests for backup-home
//!
//! Builds real trees on disk, archives them, extracts the result and
//! compares it with the source.

use ::backup_home::*;
use flate2::read::MultiGzDecoder;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Test environment with a populated source tree
pub struct TestTree {
    pub source: TempDir,
    pub out: TempDir,
}

impl TestTree {
    pub fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            out: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.source.path()
    }

    pub fn write(&self, relative: &str, content: impl AsRef<[u8]>) {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    /// A small home-like tree with files that compress well
    pub fn populate(&self) {
        for i in 0..25 {
            self.write(
                &format!("projects/p{}/src/main.rs", i % 5),
                format!("fn main() {{ println!(\"{}\"); }}\n", i).repeat(40),
            );
            self.write(&format!("notes/{:02}.txt", i), "lorem ipsum dolor sit amet ".repeat(i + 1));
        }
        self.write("photos/raw.bin", (0..50_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>());
        self.write(".config/app/settings.toml", "theme = \"dark\"\n");
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.out.path().join(name)
    }

    /// Regular files below the source root, keyed by slash path
    pub fn source_files(&self) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(self.root()).min_depth(1) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let relative = entry.path().strip_prefix(self.root()).unwrap();
                files.insert(
                    relative.to_string_lossy().replace('\\', "/"),
                    fs::read(entry.path()).unwrap(),
                );
            }
        }
        files
    }
}

pub fn archive_with(
    source: &Path,
    output: &Path,
    format: ArchiveFormat,
    rules: Arc<dyn ExclusionRules>,
    level: CompressionLevel,
) -> ArchiveStats {
    ArchivePipeline::new(source, output, format, rules, Arc::new(MemoryTelemetry::new()))
        .level(level)
        .workers(4)
        .run()
        .unwrap()
}

pub fn tar_contents(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(MultiGzDecoder::new(File::open(path).unwrap()));
    let mut files = BTreeMap::new();
    for item in archive.entries().unwrap() {
        let mut item = item.unwrap();
        if item.header().entry_type() == tar::EntryType::Regular {
            let name = item.path().unwrap().to_string_lossy().into_owned();
            let mut body = Vec::new();
            item.read_to_end(&mut body).unwrap();
            assert!(files.insert(name, body).is_none(), "duplicate entry");
        }
    }
    files
}

pub fn zip_contents(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut files = BTreeMap::new();
    for i in 0..archive.len() {
        let mut item = archive.by_index(i).unwrap();
        if item.is_file() {
            let mut body = Vec::new();
            item.read_to_end(&mut body).unwrap();
            files.insert(item.name().to_string(), body);
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_archive_is_exhaustive() {
        let tree = TestTree::new();
        tree.populate();
        let output = tree.output("home.tar.gz");

        let stats = archive_with(
            tree.root(),
            &output,
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            CompressionLevel::DEFAULT,
        );

        let expected = tree.source_files();
        assert_eq!(stats.files_written, expected.len());
        assert_eq!(tar_contents(&output), expected);
    }

    #[test]
    fn test_tar_round_trip_restores_tree() {
        let tree = TestTree::new();
        tree.populate();
        #[cfg(unix)]
        std::os::unix::fs::symlink("notes/00.txt", tree.root().join("latest-note")).unwrap();
        let output = tree.output("home.tar.gz");

        archive_with(
            tree.root(),
            &output,
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            CompressionLevel::BEST,
        );

        let restored = TempDir::new().unwrap();
        tar::Archive::new(MultiGzDecoder::new(File::open(&output).unwrap()))
            .unpack(restored.path())
            .unwrap();

        for (relative, content) in tree.source_files() {
            assert_eq!(fs::read(restored.path().join(&relative)).unwrap(), content, "{}", relative);
        }
        assert!(restored.path().join("projects/p3/src").is_dir());
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(restored.path().join("latest-note")).unwrap(),
            PathBuf::from("notes/00.txt")
        );
    }

    #[test]
    fn test_headers_keep_mtime_and_mode() -> anyhow::Result<()> {
        let tree = TestTree::new();
        tree.write("old.txt", "from 2021");
        let mtime = filetime::FileTime::from_unix_time(1_620_000_000, 0);
        filetime::set_file_mtime(tree.root().join("old.txt"), mtime)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tree.root().join("old.txt"), fs::Permissions::from_mode(0o640))?;
        }
        let output = tree.output("home.tar.gz");

        archive_with(
            tree.root(),
            &output,
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            CompressionLevel::DEFAULT,
        );

        let mut archive = tar::Archive::new(MultiGzDecoder::new(File::open(&output)?));
        let item = archive
            .entries()?
            .find(|e| e.as_ref().map(|e| e.path().ok().as_deref() == Some(Path::new("old.txt"))).unwrap_or(false))
            .ok_or_else(|| anyhow::anyhow!("old.txt missing from archive"))??;
        assert_eq!(item.header().mtime()?, 1_620_000_000);
        #[cfg(unix)]
        assert_eq!(item.header().mode()? & 0o777, 0o640);
        Ok(())
    }

    #[test]
    fn test_zip_round_trip() {
        let tree = TestTree::new();
        tree.populate();
        let output = tree.output("home.zip");

        let stats = archive_with(
            tree.root(),
            &output,
            ArchiveFormat::Zip,
            Arc::new(IncludeEverything),
            CompressionLevel::DEFAULT,
        );

        let expected = tree.source_files();
        assert_eq!(stats.files_written, expected.len());
        assert_eq!(zip_contents(&output), expected);
    }

    #[test]
    fn test_node_modules_is_never_read() {
        let tree = TestTree::new();
        tree.write("a/node_modules/x.txt", "dependency");
        tree.write("a/node_modules/deep/y.txt", "dependency");
        tree.write("a/app.js", "app");
        let output = tree.output("home.tar.gz");
        let sink = Arc::new(MemoryTelemetry::new());
        let rules = ExclusionSet::builder().pattern("**/node_modules").build().unwrap();

        let stats = ArchivePipeline::new(tree.root(), &output, ArchiveFormat::TarGz, Arc::new(rules), sink.clone())
            .run()
            .unwrap();

        let files = tar_contents(&output);
        assert!(!files.contains_key("a/node_modules/x.txt"));
        assert!(files.contains_key("a/app.js"));
        assert_eq!(stats.excluded, 1);

        // Only a, a/app.js were reached; nothing under node_modules.
        let visited = sink.visited();
        assert_eq!(visited.len(), 2);
        assert!(visited.iter().all(|p| !p.starts_with("a/node_modules")));
    }

    #[test]
    fn test_extension_exclusion() {
        let tree = TestTree::new();
        tree.write("run/foo.sock", "");
        tree.write("run/foo.sock.bak", "kept");
        let output = tree.output("home.tar.gz");
        let rules = ExclusionSet::builder().pattern("*.sock").build().unwrap();

        archive_with(tree.root(), &output, ArchiveFormat::TarGz, Arc::new(rules), CompressionLevel::DEFAULT);

        let names: Vec<String> = tar_contents(&output).into_keys().collect();
        assert_eq!(names, vec!["run/foo.sock.bak".to_string()]);
    }

    #[test]
    fn test_best_compression_not_larger_than_store() {
        let tree = TestTree::new();
        tree.populate();
        let stored = tree.output("stored.tar.gz");
        let best = tree.output("best.tar.gz");

        for (path, level) in [(&stored, CompressionLevel::new(0)), (&best, CompressionLevel::new(9))] {
            archive_with(tree.root(), path, ArchiveFormat::TarGz, Arc::new(IncludeEverything), level);
            assert_eq!(tar_contents(path), tree.source_files());
        }

        let stored_size = fs::metadata(&stored).unwrap().len();
        let best_size = fs::metadata(&best).unwrap().len();
        assert!(best_size <= stored_size, "{} > {}", best_size, stored_size);
    }

    #[test]
    fn test_zip_levels_round_trip() {
        let tree = TestTree::new();
        tree.populate();

        let mut sizes = Vec::new();
        for level in [0, 9] {
            let path = tree.output(&format!("level{}.zip", level));
            archive_with(
                tree.root(),
                &path,
                ArchiveFormat::Zip,
                Arc::new(IncludeEverything),
                CompressionLevel::new(level),
            );
            assert_eq!(zip_contents(&path), tree.source_files());
            sizes.push(fs::metadata(&path).unwrap().len());
        }
        assert!(sizes[1] <= sizes[0]);
    }

    #[test]
    #[traced_test]
    fn test_invalid_pattern_is_logged_not_fatal() {
        let tree = TestTree::new();
        tree.write("keep.txt", "keep");
        tree.write("build/out.o", "obj");

        let report = BackupBuilder::new(tree.root())
            .output(tree.output("alice.tar.gz"))
            .platform(Platform::Other)
            .username("alice")
            .exclude("./[unclosed")
            .exclude("./build")
            .build()
            .unwrap()
            .run()
            .unwrap();

        assert!(logs_contain("Invalid exclude pattern"));
        assert_eq!(report.archive.stats.files_written, 1);
        assert_eq!(report.archive.stats.excluded, 1);
    }

    #[test]
    #[traced_test]
    fn test_existing_archive_reuse_is_logged() {
        let tree = TestTree::new();
        tree.write("a.txt", "a");
        let output = tree.output("alice.tar.gz");
        fs::write(&output, b"old").unwrap();

        let report = BackupBuilder::new(tree.root())
            .output(&output)
            .platform(Platform::Other)
            .build()
            .unwrap()
            .run()
            .unwrap();

        assert!(report.archive.reused);
        assert!(logs_contain("already exists"));
    }
}
