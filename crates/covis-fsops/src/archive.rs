//! Archive extraction and packing.
//!
//! # Design
//! - The container format is sniffed from magic bytes first; the file name is
//!   only a fallback for headerless inputs.
//! - Every entry name is sanitised before it touches the filesystem; absolute
//!   paths and parent segments abort the extraction.
//! - The dataset root is the first directory met by a depth-first walk with
//!   children in lexical order. Archives that wrap several sibling directories
//!   therefore resolve to the lexically first one.
//! - Zip, tar, tar.gz and 7z containers unpack through the same sanitiser.
//! - Relocated runs are normalised to `tar.gz` with one top-level directory.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use covis_core::ArchiveFormat;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::EntryType;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{FsOpsError, FsOpsResult};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const SEVEN_ZIP_MAGIC: &[u8] = &[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// Detect the container format of `path`.
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn sniff_format(path: &Path) -> FsOpsResult<ArchiveFormat> {
    let mut header = Vec::with_capacity(USTAR_OFFSET + USTAR_MAGIC.len());
    File::open(path)
        .and_then(|file| {
            file.take((USTAR_OFFSET + USTAR_MAGIC.len()) as u64)
                .read_to_end(&mut header)
        })
        .map_err(|source| FsOpsError::io("archive.sniff", path, source))?;

    let format = if header.starts_with(GZIP_MAGIC) {
        ArchiveFormat::TarGz
    } else if header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC) {
        ArchiveFormat::Zip
    } else if header.starts_with(SEVEN_ZIP_MAGIC) {
        ArchiveFormat::SevenZip
    } else if header.get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()) == Some(USTAR_MAGIC) {
        ArchiveFormat::Tar
    } else {
        ArchiveFormat::from_path(path)
    };
    debug!(path = %path.display(), format = %format, "sniffed archive format");
    Ok(format)
}

/// Unpack `archive` into `dest_dir` and return the dataset root.
///
/// # Errors
///
/// Returns an error for unsupported formats, unsafe entry names, IO failures,
/// or when no directory is produced.
pub fn extract(archive: &Path, dest_dir: &Path) -> FsOpsResult<PathBuf> {
    fs::create_dir_all(dest_dir)
        .map_err(|source| FsOpsError::io("archive.prepare_destination", dest_dir, source))?;

    let format = sniff_format(archive)?;
    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest_dir)?,
        ArchiveFormat::Tar => {
            let file = open(archive)?;
            extract_tar(archive, BufReader::new(file), dest_dir)?;
        }
        ArchiveFormat::TarGz => {
            let file = open(archive)?;
            extract_tar(archive, GzDecoder::new(BufReader::new(file)), dest_dir)?;
        }
        ArchiveFormat::SevenZip => extract_7z(archive, dest_dir)?,
        ArchiveFormat::Unknown => {
            return Err(FsOpsError::UnsupportedFormat {
                path: archive.to_path_buf(),
                format: format.as_str(),
            });
        }
    }

    let root = find_dataset_root(dest_dir)?;
    info!(
        archive = %archive.display(),
        root = %root.display(),
        format = %format,
        "extracted archive"
    );
    Ok(root)
}

/// First directory below `dir` in lexical depth-first order.
///
/// # Errors
///
/// Returns [`FsOpsError::MalformedArchive`] when `dir` contains no directory.
pub fn find_dataset_root(dir: &Path) -> FsOpsResult<PathBuf> {
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| FsOpsError::Walkdir {
            operation: "archive.find_root",
            path: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_dir() {
            return Ok(entry.into_path());
        }
    }
    Err(FsOpsError::MalformedArchive {
        path: dir.to_path_buf(),
    })
}

/// Write `dataset_root` to `archive` as a gzip-compressed tarball whose single
/// top-level directory carries the root's name.
///
/// # Errors
///
/// Returns an error when the root has no usable name or any IO step fails.
pub fn pack(dataset_root: &Path, archive: &Path) -> FsOpsResult<()> {
    let name = dataset_root
        .file_name()
        .ok_or_else(|| FsOpsError::MalformedArchive {
            path: dataset_root.to_path_buf(),
        })?;
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| FsOpsError::io("archive.prepare_parent", parent, source))?;
    }
    let file =
        File::create(archive).map_err(|source| FsOpsError::io("archive.create", archive, source))?;

    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    builder
        .append_dir_all(name, dataset_root)
        .map_err(|source| FsOpsError::io("archive.append", dataset_root, source))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(|source| FsOpsError::io("archive.finish", archive, source))?;
    info!(root = %dataset_root.display(), archive = %archive.display(), "packed dataset");
    Ok(())
}

/// Async wrapper around [`extract`] that runs on the blocking pool.
///
/// # Errors
///
/// Same as [`extract`], plus a join failure if the blocking task panics.
pub async fn extract_blocking(archive: PathBuf, dest_dir: PathBuf) -> FsOpsResult<PathBuf> {
    tokio::task::spawn_blocking(move || extract(&archive, &dest_dir))
        .await
        .map_err(|source| FsOpsError::Join {
            operation: "archive.extract",
            source,
        })?
}

/// Async wrapper around [`pack`] that runs on the blocking pool.
///
/// # Errors
///
/// Same as [`pack`], plus a join failure if the blocking task panics.
pub async fn pack_blocking(dataset_root: PathBuf, archive: PathBuf) -> FsOpsResult<()> {
    tokio::task::spawn_blocking(move || pack(&dataset_root, &archive))
        .await
        .map_err(|source| FsOpsError::Join {
            operation: "archive.pack",
            source,
        })?
}

fn open(path: &Path) -> FsOpsResult<File> {
    File::open(path).map_err(|source| FsOpsError::io("archive.open", path, source))
}

fn extract_tar<R: Read>(archive: &Path, reader: R, target: &Path) -> FsOpsResult<()> {
    let mut tarball = tar::Archive::new(reader);
    let entries = tarball
        .entries()
        .map_err(|source| FsOpsError::io("archive.read_entries", archive, source))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|source| FsOpsError::io("archive.read_entry", archive, source))?;
        let raw_name = entry
            .path()
            .map_err(|source| FsOpsError::io("archive.entry_path", archive, source))?
            .to_string_lossy()
            .into_owned();
        let relative = sanitize_entry(archive, &raw_name)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let destination = target.join(&relative);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&destination).map_err(|source| {
                    FsOpsError::io("archive.create_dir", &destination, source)
                })?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|source| FsOpsError::io("archive.create_dir", parent, source))?;
                }
                entry
                    .unpack(&destination)
                    .map_err(|source| FsOpsError::io("archive.unpack", &destination, source))?;
            }
            other => {
                debug!(entry = %raw_name, kind = ?other, "skipping non-regular archive entry");
            }
        }
    }
    Ok(())
}

fn extract_zip(source: &Path, target: &Path) -> FsOpsResult<()> {
    let file = open(source)?;
    let mut archive = ZipArchive::new(file).map_err(|err| FsOpsError::Zip {
        operation: "archive.zip_open",
        path: source.to_path_buf(),
        source: err,
    })?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| FsOpsError::Zip {
            operation: "archive.zip_entry",
            path: source.to_path_buf(),
            source: err,
        })?;
        let relative = sanitize_entry(source, entry.name())?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let destination = target.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&destination)
                .map_err(|err| FsOpsError::io("archive.create_dir", &destination, err))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| FsOpsError::io("archive.create_dir", parent, err))?;
        }
        let mut output = File::create(&destination)
            .map_err(|err| FsOpsError::io("archive.create_file", &destination, err))?;
        io::copy(&mut entry, &mut output)
            .map_err(|err| FsOpsError::io("archive.write_file", &destination, err))?;
    }
    Ok(())
}

fn extract_7z(source: &Path, target: &Path) -> FsOpsResult<()> {
    let mut failure: Option<FsOpsError> = None;
    let walked = sevenz_rust::decompress_file_with_extract_fn(
        source,
        target,
        |entry, reader, _| {
            match write_7z_entry(source, target, &entry.name, entry.is_directory, reader) {
                Ok(()) => Ok(true),
                Err(err) => {
                    failure = Some(err);
                    Ok(false)
                }
            }
        },
    );
    if let Some(err) = failure {
        return Err(err);
    }
    walked.map_err(|err| FsOpsError::SevenZip {
        operation: "archive.7z_read",
        path: source.to_path_buf(),
        source: err,
    })
}

fn write_7z_entry(
    source: &Path,
    target: &Path,
    name: &str,
    is_directory: bool,
    reader: &mut dyn Read,
) -> FsOpsResult<()> {
    let relative = sanitize_entry(source, name)?;
    if relative.as_os_str().is_empty() {
        return Ok(());
    }
    let destination = target.join(&relative);
    if is_directory {
        return fs::create_dir_all(&destination)
            .map_err(|err| FsOpsError::io("archive.create_dir", &destination, err));
    }
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| FsOpsError::io("archive.create_dir", parent, err))?;
    }
    let mut output = File::create(&destination)
        .map_err(|err| FsOpsError::io("archive.create_file", &destination, err))?;
    io::copy(reader, &mut output)
        .map_err(|err| FsOpsError::io("archive.write_file", &destination, err))?;
    Ok(())
}

fn sanitize_entry(archive: &Path, entry: &str) -> FsOpsResult<PathBuf> {
    let unsafe_entry = || FsOpsError::UnsafeEntry {
        path: archive.to_path_buf(),
        entry: entry.to_string(),
    };
    let path = Path::new(entry);
    if path.is_absolute() || entry.starts_with('/') || entry.starts_with('\\') {
        return Err(unsafe_entry());
    }

    let mut sanitized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_entry());
            }
        }
    }
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use covis_test_support::fixtures::{write_7z, write_tar, write_tar_gz, write_zip};

    type TestResult<T> = Result<T>;

    const FILES: &[(&str, &[u8])] = &[
        ("dataset/", b""),
        ("dataset/index.json", b"{}"),
        ("dataset/raw/ping_0001.bin", b"\x00\x01\x02"),
    ];

    fn assert_files_match(root: &Path) -> TestResult<()> {
        for (name, contents) in FILES {
            if name.ends_with('/') {
                continue;
            }
            let relative = name.trim_start_matches("dataset/");
            assert_eq!(fs::read(root.join(relative))?, *contents, "entry {name}");
        }
        Ok(())
    }

    #[test]
    fn tar_gz_round_trip_yields_dataset_root() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.tar.gz");
        write_tar_gz(&archive, FILES)?;

        assert_eq!(sniff_format(&archive)?, ArchiveFormat::TarGz);
        let root = extract(&archive, &scratch.path().join("unpacked"))?;
        assert!(root.ends_with("dataset"));
        assert_files_match(&root)?;
        Ok(())
    }

    #[test]
    fn zip_and_plain_tar_are_sniffed_by_content() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let zip_path = scratch.path().join("misnamed.bin");
        write_zip(&zip_path, FILES)?;
        assert_eq!(sniff_format(&zip_path)?, ArchiveFormat::Zip);
        let root = extract(&zip_path, &scratch.path().join("zip"))?;
        assert!(root.ends_with("dataset"));

        let tar_path = scratch.path().join("run.tar");
        write_tar(&tar_path, FILES)?;
        assert_eq!(sniff_format(&tar_path)?, ArchiveFormat::Tar);
        let root = extract(&tar_path, &scratch.path().join("tar"))?;
        assert!(root.join("index.json").is_file());
        Ok(())
    }

    #[test]
    fn lexically_first_directory_wins() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("two.zip");
        write_zip(
            &archive,
            &[("b_second/x.txt", b"x"), ("a_first/y.txt", b"y"), ("z.txt", b"z")],
        )?;
        let root = extract(&archive, &scratch.path().join("out"))?;
        assert!(root.ends_with("a_first"));
        Ok(())
    }

    #[test]
    fn archive_without_directory_is_malformed() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("flat.zip");
        write_zip(&archive, &[("only.txt", b"x")])?;
        let err = extract(&archive, &scratch.path().join("out")).err();
        assert!(matches!(err, Some(FsOpsError::MalformedArchive { .. })));
        Ok(())
    }

    #[test]
    fn seven_zip_extracts_every_entry() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.7z");
        write_7z(&archive, FILES)?;

        assert_eq!(sniff_format(&archive)?, ArchiveFormat::SevenZip);
        let root = extract(&archive, &scratch.path().join("out"))?;
        assert!(root.ends_with("dataset"));
        assert_files_match(&root)?;
        Ok(())
    }

    #[test]
    fn truncated_seven_zip_is_malformed() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let archive = scratch.path().join("run.7z");
        fs::write(&archive, [b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c, 0, 4])?;
        assert_eq!(sniff_format(&archive)?, ArchiveFormat::SevenZip);
        let err = extract(&archive, &scratch.path().join("out")).err();
        assert!(matches!(err, Some(FsOpsError::SevenZip { .. })));
        Ok(())
    }

    #[test]
    fn sanitize_rejects_escaping_entries() {
        let archive = Path::new("x.tar");
        assert!(sanitize_entry(archive, "../evil").is_err());
        assert!(sanitize_entry(archive, "/etc/passwd").is_err());
        assert!(sanitize_entry(archive, "dataset/../../evil").is_err());
        assert_eq!(
            sanitize_entry(archive, "./dataset/a").ok(),
            Some(PathBuf::from("dataset/a"))
        );
    }

    #[test]
    fn pack_then_extract_preserves_tree() -> TestResult<()> {
        let scratch = tempfile::tempdir()?;
        let root = scratch.path().join("APLUWCOVISMBSONAR001_20190101T000000.000Z");
        fs::create_dir_all(root.join("raw"))?;
        fs::write(root.join("raw/ping.bin"), b"ping")?;

        let archive = scratch.path().join("out/run.tar.gz");
        pack(&root, &archive)?;
        assert_eq!(sniff_format(&archive)?, ArchiveFormat::TarGz);

        let extracted = extract(&archive, &scratch.path().join("unpacked"))?;
        assert_eq!(extracted.file_name(), root.file_name());
        assert_eq!(fs::read(extracted.join("raw/ping.bin"))?, b"ping");
        Ok(())
    }
}
