//! Archive and run builders.
//!
//! Entries are `(name, contents)` pairs; a name ending in `/` is a directory.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use covis_core::{ArchiveFormat, RawLocation, Run};
use flate2::Compression;
use flate2::write::GzEncoder;
use zip::write::FileOptions;

/// Archive entry: name and contents.
pub type Entry<'a> = (&'a str, &'a [u8]);

/// Write an uncompressed tarball.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn write_tar(path: &Path, entries: &[Entry<'_>]) -> io::Result<()> {
    let file = create(path)?;
    let mut builder = tar::Builder::new(file);
    append_entries(&mut builder, entries)?;
    builder.into_inner()?.flush()
}

/// Write a gzip-compressed tarball.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn write_tar_gz(path: &Path, entries: &[Entry<'_>]) -> io::Result<()> {
    let file = create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
    append_entries(&mut builder, entries)?;
    builder.into_inner()?.finish()?.flush()
}

/// Write a zip archive.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn write_zip(path: &Path, entries: &[Entry<'_>]) -> io::Result<()> {
    let file = create(path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).map_err(io::Error::other)?;
        } else {
            writer.start_file(*name, options).map_err(io::Error::other)?;
            writer.write_all(contents)?;
        }
    }
    writer.finish().map_err(io::Error::other)?.flush()
}

/// Write a 7z archive by staging `entries` in a sibling directory and
/// compressing its contents.
///
/// # Errors
///
/// Returns an error when staging or compression fails.
pub fn write_7z(path: &Path, entries: &[Entry<'_>]) -> io::Result<()> {
    let staging = path.with_extension("7z-staging");
    for (name, contents) in entries {
        let target = staging.join(name.trim_end_matches('/'));
        if name.ends_with('/') {
            fs::create_dir_all(&target)?;
        } else {
            create(&target)?.write_all(contents)?;
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let compressed = sevenz_rust::compress_to_path(&staging, path).map_err(io::Error::other);
    fs::remove_dir_all(&staging)?;
    compressed
}

/// Midnight UTC on the given day.
#[must_use]
pub fn day(year: i32, month: u32, date: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, date, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Run recorded on 2019-01-01 with one `7z` replica per host.
#[must_use]
pub fn sample_run(basename: &str, hosts: &[&str]) -> Run {
    let mut run = Run::new(basename, day(2019, 1, 1));
    for host in hosts {
        run.push_location(RawLocation::new(
            *host,
            format!("{basename}.7z"),
            ArchiveFormat::SevenZip,
        ));
    }
    run
}

fn create(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

fn append_entries<W: Write>(
    builder: &mut tar::Builder<W>,
    entries: &[Entry<'_>],
) -> io::Result<()> {
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        if name.ends_with('/') {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, name, io::empty())?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_write_non_empty_archives() -> io::Result<()> {
        let dir = tempfile::tempdir()?;
        let entries: &[Entry<'_>] = &[("dataset/", b""), ("dataset/a.txt", b"a")];
        for (name, writer) in [
            ("a.tar", write_tar as fn(&Path, &[Entry<'_>]) -> io::Result<()>),
            ("a.tar.gz", write_tar_gz),
            ("a.zip", write_zip),
        ] {
            let path = dir.path().join(name);
            writer(&path, entries)?;
            assert!(fs::metadata(&path)?.len() > 0);
        }
        Ok(())
    }

    #[test]
    fn sample_run_records_each_host_once() {
        let run = sample_run("B", &["DMAS", "DMAS", "COVIS-NAS"]);
        assert_eq!(run.hosts(), vec!["DMAS", "COVIS-NAS"]);
    }
}
