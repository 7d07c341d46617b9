//! Main test module for backup-home
//!
//! This module includes all test suites:
//! - Integration tests for whole archive runs
//! - Chaos tests for unreadable and failing sources
//! - Property-based tests for matcher and progress invariants

pub mod chaos;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backup_home::*;
    use flate2::read::MultiGzDecoder;
    use std::fs::{self, File};
    use std::io::Read;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn archive(source: &std::path::Path, output: PathBuf, format: ArchiveFormat) -> ArchiveStats {
        ArchivePipeline::new(
            source,
            output,
            format,
            Arc::new(IncludeEverything),
            Arc::new(MemoryTelemetry::new()),
        )
        .workers(2)
        .run()
        .unwrap()
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let output = out.path().join("empty.tar.gz");

        let stats = archive(temp_dir.path(), output.clone(), ArchiveFormat::TarGz);
        assert_eq!(stats.files_in_archive(), 0);

        let mut tar = tar::Archive::new(MultiGzDecoder::new(File::open(&output).unwrap()));
        assert_eq!(tar.entries().unwrap().count(), 0);
    }

    #[test]
    fn test_empty_directory_zip() {
        let temp_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let output = out.path().join("empty.zip");

        archive(temp_dir.path(), output.clone(), ArchiveFormat::Zip);
        let zip = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        assert_eq!(zip.len(), 0);
    }

    #[test]
    fn test_empty_files_and_unicode_names() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("empty.txt"), "").unwrap();
        fs::write(temp_dir.path().join("café ☕.txt"), "latte").unwrap();
        fs::create_dir(temp_dir.path().join("日本語")).unwrap();
        fs::write(temp_dir.path().join("日本語/メモ.md"), "memo").unwrap();
        let out = TempDir::new().unwrap();
        let output = out.path().join("u.tar.gz");

        let stats = archive(temp_dir.path(), output.clone(), ArchiveFormat::TarGz);
        assert_eq!(stats.files_written, 3);

        let mut tar = tar::Archive::new(MultiGzDecoder::new(File::open(&output).unwrap()));
        let mut found = Vec::new();
        for item in tar.entries().unwrap() {
            let mut item = item.unwrap();
            let name = item.path().unwrap().to_string_lossy().into_owned();
            let mut body = String::new();
            item.read_to_string(&mut body).unwrap();
            if name == "café ☕.txt" {
                assert_eq!(body, "latte");
            }
            found.push(name);
        }
        assert!(found.contains(&"empty.txt".to_string()));
        assert!(found.contains(&"日本語/メモ.md".to_string()));
    }

    #[test]
    fn test_deep_nesting_with_glob_rules() {
        let temp_dir = TempDir::new().unwrap();
        let mut deep = temp_dir.path().to_path_buf();
        for i in 0..60 {
            deep = deep.join(format!("d{}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), "leaf").unwrap();
        fs::write(deep.join("leaf.tmp"), "tmp").unwrap();

        let rules = ExclusionSet::builder()
            .patterns(["./**/d1/**/*.tmp", "./**/cache"])
            .build()
            .unwrap();
        let out = TempDir::new().unwrap();
        let stats = ArchivePipeline::new(
            temp_dir.path(),
            out.path().join("deep.tar.gz"),
            ArchiveFormat::TarGz,
            Arc::new(rules),
            Arc::new(MemoryTelemetry::new()),
        )
        .run()
        .unwrap();

        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.excluded, 1);
        assert_eq!(stats.directories, 60);
    }

    #[test]
    fn test_output_in_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();

        let result = ArchivePipeline::new(
            temp_dir.path(),
            temp_dir.path().join("no/such/dir/out.tar.gz"),
            ArchiveFormat::TarGz,
            Arc::new(IncludeEverything),
            Arc::new(MemoryTelemetry::new()),
        )
        .run();
        assert!(matches!(result, Err(BackupError::OutputCreate { .. })));
    }
}
