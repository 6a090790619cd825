//! Canonical tar archiving, gzip compression and extraction.
//!
//! Archives are deterministic: entries are sorted by path, timestamps and
//! ownership are zeroed and modes normalised, so an unchanged tree always
//! produces byte-identical archive bytes and therefore the same version.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

use super::{ExcludeRules, ToolError};
use crate::version::{HashingReader, VersionId};

/// Archive/compress collaborator.
pub trait Archiver {
    /// Write an uncompressed archive of everything under `root` not excluded.
    fn archive(&self, root: &Path, excludes: &ExcludeRules, output: &Path) -> Result<(), ToolError>;

    /// Compress `path` in place, returning the compressed file's path.
    fn compress(&self, path: &Path) -> Result<PathBuf, ToolError>;

    /// Decompress and extract `blob` into `dest`.
    ///
    /// Returns the version identifier of the decompressed archive bytes.
    fn extract(&self, blob: &Path, dest: &Path) -> Result<VersionId, ToolError>;
}

/// In-process tar + gzip archiver.
///
/// Symlinks are archived as links and must resolve inside the root.
#[derive(Debug, Clone, Default)]
pub struct TarArchiver;

impl TarArchiver {
    pub fn new() -> Self {
        Self
    }

    fn append_entry<W: Write>(
        &self,
        builder: &mut Builder<W>,
        root: &Path,
        path: &Path,
        rel_path: &Path,
    ) -> Result<(), ToolError> {
        let link_meta = fs::symlink_metadata(path)?;

        if link_meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            let resolved = if target.is_absolute() {
                target.clone()
            } else {
                path.parent().unwrap_or(path).join(&target)
            };
            let canonical = resolved.canonicalize().unwrap_or(resolved);
            let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
            if !canonical.starts_with(&canonical_root) {
                return Err(ToolError::Failed(format!(
                    "symlink escapes archive root: {}",
                    path.display()
                )));
            }

            let mut header = canonical_header(0, 0o777);
            header.set_entry_type(EntryType::Symlink);
            header.set_link_name(&target)?;
            header.set_cksum();
            builder.append_data(&mut header, rel_path, io::empty())?;
            return Ok(());
        }

        if link_meta.is_dir() {
            self.append_dir(builder, rel_path)
        } else {
            self.append_file(builder, path, rel_path)
        }
    }

    fn append_dir<W: Write>(&self, builder: &mut Builder<W>, rel_path: &Path) -> Result<(), ToolError> {
        let mut header = canonical_header(0, 0o755);
        header.set_entry_type(EntryType::Directory);
        header.set_cksum();
        builder.append_data(&mut header, rel_path, io::empty())?;
        Ok(())
    }

    fn append_file<W: Write>(
        &self,
        builder: &mut Builder<W>,
        path: &Path,
        rel_path: &Path,
    ) -> Result<(), ToolError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        // Preserve executable bit, normalize others
        let mode = if is_executable(path) { 0o755 } else { 0o644 };
        let mut header = canonical_header(size, mode);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, rel_path, BufReader::new(file))?;
        Ok(())
    }
}

fn canonical_header(size: u64, mode: u32) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

impl Archiver for TarArchiver {
    fn archive(&self, root: &Path, excludes: &ExcludeRules, output: &Path) -> Result<(), ToolError> {
        let out = File::create(output)?;
        let mut builder = Builder::new(BufWriter::new(out));
        builder.follow_symlinks(false);

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(rel) => rel.as_os_str().is_empty() || !excludes.is_excluded(rel),
                Err(_) => false,
            });

        let mut count = 0usize;
        for entry in walker {
            let entry = entry.map_err(|e| ToolError::Failed(format!("walking {}: {}", root.display(), e)))?;
            let rel_path = match entry.path().strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            self.append_entry(&mut builder, root, entry.path(), &rel_path)?;
            count += 1;
        }

        let mut writer = builder.into_inner()?;
        writer.flush()?;
        debug!("archived {} entries from {} into {}", count, root.display(), output.display());
        Ok(())
    }

    fn compress(&self, path: &Path) -> Result<PathBuf, ToolError> {
        let mut gz_name = path.as_os_str().to_os_string();
        gz_name.push(".gz");
        let gz_path = PathBuf::from(gz_name);

        let mut input = BufReader::new(File::open(path)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&gz_path)?), Compression::default());
        let result = io::copy(&mut input, &mut encoder).and_then(|_| encoder.finish()?.flush());
        if let Err(e) = result {
            let _ = fs::remove_file(&gz_path);
            return Err(e.into());
        }

        fs::remove_file(path)?;
        Ok(gz_path)
    }

    fn extract(&self, blob: &Path, dest: &Path) -> Result<VersionId, ToolError> {
        let decoder = GzDecoder::new(BufReader::new(File::open(blob)?));
        let mut archive = Archive::new(HashingReader::new(decoder));
        // Masks modes to 0o777; setuid/setgid/sticky bits are dropped
        archive.set_preserve_permissions(false);
        archive.set_preserve_mtime(false);
        archive.set_overwrite(true);
        archive.unpack(dest)?;

        Ok(archive.into_inner().finish()?)
    }
}

/// Check if a file is executable
fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::hash_file;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn create_tree(dir: &Path) {
        let code = dir.join("puppetcode/production");
        fs::create_dir_all(code.join("manifests")).unwrap();
        fs::write(code.join("manifests/site.pp"), "node default {}\n").unwrap();
        fs::write(code.join("environment.conf"), "modulepath = modules\n").unwrap();
        fs::create_dir_all(code.join(".git")).unwrap();
        fs::write(code.join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
    }

    fn archive_bytes(root: &Path, out_dir: &Path, name: &str) -> Vec<u8> {
        let out = out_dir.join(name);
        let rules = ExcludeRules::new(&[]).unwrap();
        TarArchiver::new().archive(root, &rules, &out).unwrap();
        fs::read(out).unwrap()
    }

    #[test]
    fn test_archive_is_deterministic() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        create_tree(src.path());

        let first = archive_bytes(src.path(), out.path(), "a.tar");
        // Touch a file without changing content
        let site = src.path().join("puppetcode/production/manifests/site.pp");
        fs::write(&site, "node default {}\n").unwrap();
        let second = archive_bytes(src.path(), out.path(), "b.tar");

        assert_eq!(first, second);
    }

    #[test]
    fn test_archive_excludes_and_canonical_headers() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        create_tree(src.path());

        let bytes = archive_bytes(src.path(), out.path(), "a.tar");
        let mut archive = Archive::new(Cursor::new(bytes));
        let mut paths = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.mtime().unwrap(), 0);
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            paths.push(entry.path().unwrap().to_string_lossy().into_owned());
        }

        assert!(paths.iter().any(|p| p.ends_with("manifests/site.pp")));
        assert!(!paths.iter().any(|p| p.contains(".git")));
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_compress_then_extract_reports_content_hash() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        create_tree(src.path());

        let archiver = TarArchiver::new();
        let tar_path = out.path().join("artifact.temp.tar");
        archiver.archive(src.path(), &ExcludeRules::new(&[]).unwrap(), &tar_path).unwrap();
        let expected = hash_file(&tar_path).unwrap();

        let gz_path = archiver.compress(&tar_path).unwrap();
        assert!(!tar_path.exists());
        assert!(gz_path.to_string_lossy().ends_with(".tar.gz"));

        let dest = out.path().join("unpacked");
        fs::create_dir(&dest).unwrap();
        let actual = archiver.extract(&gz_path, &dest).unwrap();

        assert_eq!(actual, expected);
        assert_eq!(
            fs::read_to_string(dest.join("puppetcode/production/manifests/site.pp")).unwrap(),
            "node default {}\n"
        );
    }

    #[test]
    fn test_extract_corrupt_blob_fails() {
        let out = TempDir::new().unwrap();
        let blob = out.path().join("bad.tar.gz");
        fs::write(&blob, b"definitely not gzip").unwrap();
        let dest = out.path().join("unpacked");
        fs::create_dir(&dest).unwrap();

        assert!(TarArchiver::new().extract(&blob, &dest).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_strips_setuid_bits() {
        use std::os::unix::fs::PermissionsExt;

        let out = TempDir::new().unwrap();
        let blob = out.path().join("crafted.tar.gz");
        let gz = GzEncoder::new(File::create(&blob).unwrap(), Compression::default());
        let mut builder = Builder::new(gz);
        let payload = b"#!/bin/sh\nid\n";
        let mut header = canonical_header(payload.len() as u64, 0o4755);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append_data(&mut header, "puppetcode/suid", &payload[..]).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = out.path().join("unpacked");
        fs::create_dir(&dest).unwrap();
        TarArchiver::new().extract(&blob, &dest).unwrap();

        let mode = fs::metadata(dest.join("puppetcode/suid")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7000, 0);
        assert_eq!(mode & 0o111, 0o111);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        use std::os::unix::fs::symlink;

        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(src.path().join("file.txt"), "content").unwrap();
        symlink("../../etc/passwd", src.path().join("escape_link")).unwrap();

        let err = TarArchiver::new()
            .archive(src.path(), &ExcludeRules::new(&[]).unwrap(), &out.path().join("a.tar"))
            .unwrap_err();
        assert!(err.to_string().contains("escape_link"));
    }
}
