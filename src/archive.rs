#![forbid(unsafe_code)]

//! Packs a finished download directory into a single ZIP file.

use std::{
    fs::{self, File},
    io::{self, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::warn;
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

const MAX_FILE_STEM: usize = 120;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub size: u64,
}

/// Zips every file below `source_dir` into `archive_path`, then removes
/// `source_dir`. Entry names are relative to `source_dir`. On failure no
/// partial archive is left at `archive_path`.
///
/// Blocking; call it through `spawn_blocking` from async code.
pub fn create_archive(source_dir: &Path, archive_path: &Path) -> Result<ArchiveSummary> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let file = File::create(archive_path)
        .with_context(|| format!("creating {}", archive_path.display()))?;
    write_entries(file, source_dir)
        .and_then(|()| {
            fs::remove_dir_all(source_dir).with_context(|| {
                format!("removing scratch directory {}", source_dir.display())
            })
        })
        .inspect_err(|_| discard_partial(archive_path))?;

    let size = fs::metadata(archive_path)
        .with_context(|| format!("reading {}", archive_path.display()))?
        .len();
    Ok(ArchiveSummary {
        path: archive_path.to_path_buf(),
        size,
    })
}

fn write_entries(file: File, source_dir: &Path) -> Result<()> {
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", source_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .with_context(|| format!("resolving {}", entry.path().display()))?;
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        writer
            .start_file(name.as_str(), options)
            .with_context(|| format!("adding {name} to archive"))?;
        let mut input = File::open(entry.path())
            .with_context(|| format!("opening {}", entry.path().display()))?;
        io::copy(&mut input, &mut writer).with_context(|| format!("compressing {name}"))?;
    }

    let mut inner = writer.finish().context("finalizing archive")?;
    io::Write::flush(&mut inner).context("flushing archive")?;
    Ok(())
}

fn discard_partial(archive_path: &Path) {
    if let Err(err) = fs::remove_file(archive_path)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %archive_path.display(), error = %err, "could not remove partial archive");
    }
}

/// Removes archives and scratch directories left in `download_root` by an
/// earlier run. Jobs live in memory only, so nothing there is reachable
/// after a restart. Returns how many entries were removed.
pub fn sweep_leftovers(download_root: &Path) -> Result<usize> {
    let entries = match fs::read_dir(download_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("listing {}", download_root.display()));
        }
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", download_root.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("inspecting {}", path.display()))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let result = if file_type.is_dir() && is_scratch_dir_name(&name) {
            fs::remove_dir_all(&path)
        } else if file_type.is_file() && is_archive_name(&name) {
            fs::remove_file(&path)
        } else {
            continue;
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove leftover"),
        }
    }
    Ok(removed)
}

// `job-<id>`
fn is_scratch_dir_name(name: &str) -> bool {
    name.strip_prefix("job-")
        .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

// `<stem>-<id>.zip`
fn is_archive_name(name: &str) -> bool {
    name.strip_suffix(".zip")
        .and_then(|stem| stem.rsplit_once('-'))
        .is_some_and(|(_, id)| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
}

/// Human-readable size, e.g. `"12.34 MB"`.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Turns a video title into something safe to use as a file stem.
pub fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned
        .split_whitespace()
        .filter(|word| !word.chars().all(|c| c == '.'))
        .collect::<Vec<_>>()
        .join(" ");
    let trimmed = collapsed.trim_matches('.').trim();
    let stem: String = trimmed.chars().take(MAX_FILE_STEM).collect();
    if stem.is_empty() {
        "video".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use zip::ZipArchive;

    #[test]
    fn archive_contains_files_and_scratch_is_removed() {
        let temp = tempdir().unwrap();
        let scratch = temp.path().join("job-1");
        fs::create_dir_all(scratch.join("extra")).unwrap();
        fs::write(scratch.join("song.m4a"), b"audio bytes").unwrap();
        fs::write(scratch.join("extra").join("notes.txt"), b"hi").unwrap();

        let target = temp.path().join("out").join("song-1.zip");
        let summary = create_archive(&scratch, &target).unwrap();

        assert_eq!(summary.path, target);
        assert!(summary.size > 0);
        assert!(!scratch.exists());

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let mut contents = String::new();
        archive
            .by_name("song.m4a")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "audio bytes");
        assert!(archive.by_name("extra/notes.txt").is_ok());
    }

    #[test]
    fn failed_archive_leaves_nothing_behind() {
        let temp = tempdir().unwrap();
        let target = temp.path().join("a.zip");
        let err = create_archive(&temp.path().join("nope"), &target);
        assert!(err.is_err());
        assert!(!target.exists());
    }

    #[test]
    fn sweep_removes_only_job_leftovers() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("job-7")).unwrap();
        fs::write(root.join("job-7").join("part.m4a"), b"x").unwrap();
        fs::write(root.join("My Song-7.zip"), b"PK").unwrap();
        fs::write(root.join("notes.zip"), b"keep").unwrap();
        fs::write(root.join("readme.txt"), b"keep").unwrap();
        fs::create_dir_all(root.join("job-notes")).unwrap();

        assert_eq!(sweep_leftovers(root).unwrap(), 2);
        assert!(!root.join("job-7").exists());
        assert!(!root.join("My Song-7.zip").exists());
        assert!(root.join("notes.zip").exists());
        assert!(root.join("readme.txt").exists());
        assert!(root.join("job-notes").exists());

        assert_eq!(sweep_leftovers(&root.join("missing")).unwrap(), 0);
    }

    #[test]
    fn format_size_picks_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn sanitize_file_name_strips_separators() {
        assert_eq!(sanitize_file_name("a/b\\c: d?"), "a b c d");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "etc passwd");
        assert_eq!(sanitize_file_name("  \n\t "), "video");
        assert_eq!(sanitize_file_name("100% fun"), "100 fun");
        assert_eq!(sanitize_file_name(&"x".repeat(500)).len(), MAX_FILE_STEM);
    }
}
