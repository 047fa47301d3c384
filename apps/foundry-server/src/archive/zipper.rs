//! Blocking zip creation and extraction. Call through `spawn_blocking`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::ArchiveError;
use crate::util::{private_file, wildcard_matches};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ZipStats {
    pub files: u64,
    pub bytes: u64,
    /// Entries left out because they could not be read.
    pub skipped: u64,
}

/// True when `pattern` matches the entry's relative path or any single component.
pub(crate) fn excluded(patterns: &[String], relative: &str) -> bool {
    patterns.iter().any(|p| {
        wildcard_matches(p, relative)
            || relative
                .split('/')
                .any(|component| wildcard_matches(p, component))
    })
}

fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_err(err: zip::result::ZipError) -> ArchiveError {
    ArchiveError::CreateFailed(err.to_string())
}

fn io_err(err: io::Error) -> ArchiveError {
    ArchiveError::CreateFailed(err.to_string())
}

/// Write `source` into a new zip at `dest`.
///
/// A directory contributes its contents at the archive root; a single file is
/// stored under its basename. `progress` is invoked at most every `interval`.
pub(crate) fn zip_path(
    source: &Path,
    dest: &Path,
    exclude: &[String],
    interval: Duration,
    progress: &mut dyn FnMut(ZipStats),
) -> Result<ZipStats, ArchiveError> {
    let meta = fs::metadata(source)
        .map_err(|_| ArchiveError::PathNotFound(source.display().to_string()))?;
    let out = private_file().open(dest).map_err(io_err)?;
    let mut zip = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut stats = ZipStats::default();
    let mut last = Instant::now();

    if meta.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ArchiveError::PathNotFound(source.display().to_string()))?;
        let mut file = File::open(source)
            .map_err(|_| ArchiveError::PathNotReadable(source.display().to_string()))?;
        zip.start_file(name, options.large_file(meta.len() >= u32::MAX as u64))
            .map_err(zip_err)?;
        stats.bytes += io::copy(&mut file, &mut zip).map_err(io_err)?;
        stats.files += 1;
    } else {
        fs::read_dir(source)
            .map_err(|_| ArchiveError::PathNotReadable(source.display().to_string()))?;
        let walker = WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| match e.path().strip_prefix(source) {
                Ok(rel) if !rel.as_os_str().is_empty() => !excluded(exclude, &entry_name(rel)),
                _ => true,
            });
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!("skipping unreadable entry: {err}");
                    stats.skipped += 1;
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(source) else {
                continue;
            };
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = entry_name(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                zip.add_directory(name, options).map_err(zip_err)?;
            } else if file_type.is_file() {
                let mut file = match File::open(entry.path()) {
                    Ok(file) => file,
                    Err(err) => {
                        tracing::warn!(path = %entry.path().display(), "skipping unreadable file: {err}");
                        stats.skipped += 1;
                        continue;
                    }
                };
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                zip.start_file(name, options.large_file(len >= u32::MAX as u64))
                    .map_err(zip_err)?;
                stats.bytes += io::copy(&mut file, &mut zip).map_err(io_err)?;
                stats.files += 1;
            }
            if last.elapsed() > interval {
                last = Instant::now();
                progress(stats);
            }
        }
    }
    zip.finish().map_err(zip_err)?;
    Ok(stats)
}

/// Extract every enclosed entry of `archive` into `dest`; returns the file count.
pub(crate) fn unzip_into(archive: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let file = File::open(archive)
        .map_err(|_| ArchiveError::PathNotReadable(archive.display().to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;
    fs::create_dir_all(dest).map_err(io_err)?;
    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let Some(rel) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "skipping zip entry outside archive root");
            continue;
        };
        let target: PathBuf = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_err)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut out = File::create(&target).map_err(io_err)?;
        io::copy(&mut entry, &mut out).map_err(io_err)?;
        files += 1;
    }
    Ok(files)
}

/// Recursively copy `src` into `dest`, refusing symlinks.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    fs::create_dir_all(dest).map_err(io_err)?;
    let mut files = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| ArchiveError::CreateFailed(e.to_string()))?;
        let Ok(rel) = entry.path().strip_prefix(src) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(io_err)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target).map_err(io_err)?;
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = entry_name(e.path().strip_prefix(root).unwrap());
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn names(zip_path: &Path) -> Vec<String> {
        let mut zip = ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn directory_contents_are_rooted() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("akismet");
        fs::create_dir_all(src.join("views/admin")).unwrap();
        fs::write(src.join("akismet.php"), b"<?php // plugin").unwrap();
        fs::write(src.join("views/admin/config.php"), vec![7u8; 70_000]).unwrap();
        fs::create_dir_all(src.join("empty")).unwrap();
        let dest = tmp.path().join("out.zip");
        let stats = zip_path(&src, &dest, &[], Duration::from_secs(2), &mut |_| {}).unwrap();
        assert_eq!(stats.files, 2);

        let listed = names(&dest);
        assert!(listed.iter().all(|n| !n.starts_with("akismet/")));
        assert!(listed.contains(&"akismet.php".to_string()));
        assert!(listed.iter().any(|n| n.trim_end_matches('/') == "empty"));

        let restored = tmp.path().join("restored");
        assert_eq!(unzip_into(&dest, &restored).unwrap(), 2);
        assert_eq!(snapshot(&src), snapshot(&restored));
        assert!(restored.join("empty").is_dir());
    }

    #[test]
    fn single_file_uses_basename() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("nested/dump.sql");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"CREATE TABLE wp_options (id int);\n").unwrap();
        let dest = tmp.path().join("db.zip");
        zip_path(&src, &dest, &[], Duration::from_secs(2), &mut |_| {}).unwrap();
        assert_eq!(names(&dest), vec!["dump.sql".to_string()]);
        let restored = tmp.path().join("r");
        unzip_into(&dest, &restored).unwrap();
        assert_eq!(fs::read(restored.join("dump.sql")).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("wp-content");
        fs::create_dir_all(src.join("cache/page")).unwrap();
        fs::create_dir_all(src.join("uploads")).unwrap();
        fs::write(src.join("cache/page/index.html"), b"x").unwrap();
        fs::write(src.join("uploads/a.jpg"), b"jpg").unwrap();
        fs::write(src.join("debug.log"), b"log").unwrap();
        let dest = tmp.path().join("c.zip");
        let stats = zip_path(
            &src,
            &dest,
            &["cache".into(), "*.log".into()],
            Duration::from_secs(2),
            &mut |_| {},
        )
        .unwrap();
        assert_eq!(stats.files, 1);
        assert!(names(&dest).iter().all(|n| !n.starts_with("cache")));
    }

    #[test]
    fn missing_source_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let err = zip_path(
            &tmp.path().join("nope"),
            &tmp.path().join("x.zip"),
            &[],
            Duration::from_secs(2),
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, ArchiveError::PathNotFound(_)));
    }

    #[test]
    fn progress_fires_with_zero_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("t");
        fs::create_dir_all(&src).unwrap();
        for i in 0..3 {
            fs::write(src.join(format!("{i}.txt")), b"abc").unwrap();
        }
        let mut calls = 0;
        zip_path(&src, &tmp.path().join("p.zip"), &[], Duration::ZERO, &mut |_| calls += 1).unwrap();
        assert!(calls >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn staged_zip_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("dump.sql");
        fs::write(&src, b"SELECT 1;").unwrap();
        let dest = tmp.path().join("db.zip");
        zip_path(&src, &dest, &[], Duration::from_secs(2), &mut |_| {}).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_entries_are_counted() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("plugin");
        fs::create_dir_all(src.join("locked")).unwrap();
        fs::write(src.join("ok.php"), b"<?php").unwrap();
        fs::write(src.join("secret.php"), b"<?php").unwrap();
        fs::write(src.join("locked/inner.php"), b"<?php").unwrap();
        fs::set_permissions(src.join("secret.php"), fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(src.join("locked"), fs::Permissions::from_mode(0o000)).unwrap();
        // Privileged users read through mode bits; nothing would be skipped.
        let privileged = File::open(src.join("secret.php")).is_ok();

        let dest = tmp.path().join("p.zip");
        let stats = zip_path(&src, &dest, &[], Duration::from_secs(2), &mut |_| {}).unwrap();
        fs::set_permissions(src.join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
        if privileged {
            assert_eq!(stats.skipped, 0);
            return;
        }
        assert_eq!(stats.files, 1);
        assert_eq!(stats.skipped, 2);
        assert!(names(&dest).contains(&"ok.php".to_string()));
    }

    #[test]
    fn copy_tree_mirrors_files() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("s");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/c.txt"), b"hi").unwrap();
        let dest = tmp.path().join("d");
        assert_eq!(copy_tree(&src, &dest).unwrap(), 1);
        assert_eq!(snapshot(&src), snapshot(&dest));
    }
}
