//! Producing image entries from a source tree or a scripted manifest.
//!
//! Both walkers drive the same [`ImageBuilder`] push operations, in the
//! exact order the reader will observe: per directory, non-directory
//! children first, subdirectories after, each wrapped in an open/close
//! entry pair.  The root directory is implicit.

use std::{
    ffi::{OsStr, OsString},
    fs::File,
    io::{BufRead, BufReader},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, warn};
use rustix::{
    buffer::spare_capacity,
    fd::OwnedFd,
    fs::{fstat, openat, readlinkat, Dir, FileType, Mode, OFlags, CWD},
    io::read,
};

use crate::builder::ImageBuilder;
use crate::error::{ImageError, Result};

fn mtime_nanos(buf: &rustix::fs::Stat) -> i64 {
    (buf.st_mtime as i64) * 1_000_000_000 + buf.st_mtime_nsec as i64
}

fn utf8_name(name: &OsStr, dir_path: &Path) -> Result<String> {
    match name.to_str() {
        Some(name) => Ok(name.to_owned()),
        None => Err(ImageError::NonUnicodeName(dir_path.join(name))),
    }
}

/// Opens a child with O_PATH (nothing is read or followed) and stats it.
/// Classification comes from `st_mode`; the readdir type is only a hint
/// and is legitimately `Unknown` on some filesystems.  When readdir did
/// make a definite claim it must agree with `st_mode`, or the child
/// changed underneath us.
fn stat_child(
    dirfd: &OwnedFd,
    name: &OsStr,
    hint: FileType,
    dir_path: &Path,
) -> Result<rustix::fs::Stat> {
    let fd = openat(
        dirfd,
        name,
        OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    let buf = fstat(&fd)?;
    if hint != FileType::Unknown && FileType::from_raw_mode(buf.st_mode) != hint {
        return Err(ImageError::FileTypeChanged(dir_path.join(name)));
    }
    Ok(buf)
}

/// Emits entries by enumerating a real directory tree.
///
/// Children are visited in name order, which makes images reproducible
/// regardless of the underlying readdir order.  Zero-size device nodes
/// become whiteout markers; a device node with data aborts the build.
pub struct FilesystemWalker<'a> {
    builder: &'a mut ImageBuilder,
}

impl<'a> FilesystemWalker<'a> {
    pub fn new(builder: &'a mut ImageBuilder) -> Self {
        Self { builder }
    }

    /// Walks the tree rooted at `source`, emitting payloads and entries
    /// into the builder.  No entry pair is emitted for the root itself.
    pub fn walk(&mut self, source: &Path) -> Result<()> {
        let fd = openat(
            CWD,
            source,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        self.walk_directory(&fd, source)
    }

    fn walk_directory(&mut self, dirfd: &OwnedFd, dir_path: &Path) -> Result<()> {
        let mut children: Vec<(OsString, FileType)> = Vec::new();
        for item in Dir::read_from(dirfd)? {
            let entry = item?;
            let name = OsStr::from_bytes(entry.file_name().to_bytes());
            if name == "." || name == ".." {
                continue;
            }
            children.push((name.to_os_string(), entry.file_type()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        // Non-directory children go first to keep regular payloads
        // contiguous; subdirectories are buffered and recursed after.
        // The directory/leaf split keys off st_mode, never the readdir
        // hint alone.
        let mut subdirs = Vec::new();
        for (name, hint) in children {
            let buf = stat_child(dirfd, &name, hint, dir_path)?;
            if FileType::from_raw_mode(buf.st_mode) == FileType::Directory {
                subdirs.push(name);
            } else {
                self.walk_leaf(dirfd, &buf, &name, dir_path)?;
            }
        }

        for name in subdirs {
            self.walk_subdirectory(dirfd, &name, dir_path)?;
        }

        Ok(())
    }

    fn walk_subdirectory(&mut self, dirfd: &OwnedFd, name: &OsStr, dir_path: &Path) -> Result<()> {
        let fd = openat(
            dirfd,
            name,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        let buf = fstat(&fd)?;
        if FileType::from_raw_mode(buf.st_mode) != FileType::Directory {
            return Err(ImageError::FileTypeChanged(dir_path.join(name)));
        }
        let name = utf8_name(name, dir_path)?;

        debug!("including folder: {name}");
        self.builder
            .push_directory_open(&name, mtime_nanos(&buf), buf.st_mode as u32);
        self.walk_directory(&fd, &dir_path.join(&name))?;
        self.builder.push_directory_close();
        Ok(())
    }

    fn walk_leaf(
        &mut self,
        dirfd: &OwnedFd,
        buf: &rustix::fs::Stat,
        name: &OsStr,
        dir_path: &Path,
    ) -> Result<()> {
        let mod_time = mtime_nanos(buf);
        let mode = buf.st_mode as u32;
        let utf_name = utf8_name(name, dir_path)?;

        match FileType::from_raw_mode(buf.st_mode) {
            FileType::RegularFile => {
                // The classifying fd was O_PATH; reopen for content and
                // re-check that the file did not change underneath us.
                let fd = openat(
                    dirfd,
                    name,
                    OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                    Mode::empty(),
                )?;
                let buf = fstat(&fd)?;
                if FileType::from_raw_mode(buf.st_mode) != FileType::RegularFile {
                    return Err(ImageError::FileTypeChanged(dir_path.join(name)));
                }
                let mut content = Vec::with_capacity(buf.st_size as usize);
                if buf.st_size > 0 {
                    read(&fd, spare_capacity(&mut content))?;
                }
                debug!("including file: {utf_name}");
                self.builder.push_file(&utf_name, &content, mod_time, mode)?;
            }
            FileType::Symlink => {
                let target = readlinkat(dirfd, name, [])?;
                let target = target
                    .into_string()
                    .map_err(|_| ImageError::NonUnicodeName(dir_path.join(name)))?;
                debug!("including symlink: {utf_name} -> {target}");
                self.builder.push_symlink(&utf_name, &target, mod_time, mode);
            }
            FileType::CharacterDevice | FileType::BlockDevice => {
                if buf.st_size != 0 {
                    return Err(ImageError::NonWhiteoutDevice(dir_path.join(name)));
                }
                debug!("including whiteout: {utf_name}");
                self.builder.push_whiteout(&utf_name, mod_time);
            }
            _ => {
                warn!("skipping {:?}: unsupported file type", dir_path.join(name));
            }
        }

        Ok(())
    }
}

/// Recognized manifest formats.  Only the line-oriented `seq` grammar
/// ships; unknown tokens are rejected before any walking starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Seq,
}

impl FromStr for ManifestFormat {
    type Err = ImageError;

    fn from_str(token: &str) -> Result<Self> {
        match token {
            "seq" => Ok(ManifestFormat::Seq),
            other => Err(ImageError::UnknownManifestFormat(other.to_owned())),
        }
    }
}

/// Emits entries as scripted by a `seq` manifest.
///
/// One record per line, three `|`-separated fields:
///
/// ```text
/// f  | <dir-to-read-from> | <file-name>
/// sd | <parent-path>      | <dir-name>
/// ed | <ignored>          | <ignored>
/// ```
///
/// Directory opens and closes follow the script, not the filesystem;
/// `f`-line paths resolve against the build root when relative.
pub struct ManifestWalker<'a> {
    builder: &'a mut ImageBuilder,
    root: PathBuf,
}

impl<'a> ManifestWalker<'a> {
    pub fn new(builder: &'a mut ImageBuilder, root: &Path) -> Self {
        Self {
            builder,
            root: root.to_owned(),
        }
    }

    /// Replays the manifest into the builder.  Unknown actions and short
    /// records are fatal.
    pub fn walk(&mut self, manifest: &Path, format: ManifestFormat) -> Result<()> {
        match format {
            ManifestFormat::Seq => self.walk_seq(manifest),
        }
    }

    fn walk_seq(&mut self, manifest: &Path) -> Result<()> {
        let file = File::open(manifest)?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            self.apply_line(idx + 1, &line)?;
        }
        Ok(())
    }

    fn apply_line(&mut self, line_number: usize, line: &str) -> Result<()> {
        let fields: Vec<&str> = line.split('|').collect();
        let &[action, path, name] = fields.as_slice() else {
            return Err(ImageError::Manifest {
                line: line_number,
                message: format!("expected 3 '|'-separated fields, got {}", fields.len()),
            });
        };

        match action {
            "f" => {
                let source = self.root.join(path).join(name);
                debug!("including file: {name} (from {source:?})");
                let content = std::fs::read(&source)?;
                self.builder.push_file(name, &content, 0, 0)?;
            }
            "sd" => {
                debug!("including folder: {name}");
                self.builder.push_directory_open(name, 0, 0);
            }
            "ed" => self.builder.push_directory_close(),
            other => {
                return Err(ImageError::Manifest {
                    line: line_number,
                    message: format!("action not recognized: {other:?}"),
                })
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::entry::EntryKind;

    fn scratch_builder(td: &tempfile::TempDir) -> ImageBuilder {
        ImageBuilder::create(&td.path().join("test.img"), false).unwrap()
    }

    fn write_manifest(td: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = td.path().join("manifest.seq");
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_manifest_format_tokens() {
        assert_eq!("seq".parse::<ManifestFormat>().unwrap(), ManifestFormat::Seq);
        assert!(matches!(
            "yaml".parse::<ManifestFormat>(),
            Err(ImageError::UnknownManifestFormat(_))
        ));
    }

    #[test]
    fn test_manifest_unknown_action_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let manifest = write_manifest(&td, "q|.|x\n");
        let mut builder = scratch_builder(&td);

        let err = ManifestWalker::new(&mut builder, td.path())
            .walk(&manifest, ManifestFormat::Seq)
            .unwrap_err();
        assert!(matches!(err, ImageError::Manifest { line: 1, .. }));
    }

    #[test]
    fn test_manifest_short_record_is_fatal() {
        let td = tempfile::tempdir().unwrap();
        let manifest = write_manifest(&td, "sd|a\n");
        let mut builder = scratch_builder(&td);

        let err = ManifestWalker::new(&mut builder, td.path())
            .walk(&manifest, ManifestFormat::Seq)
            .unwrap_err();
        assert!(matches!(err, ImageError::Manifest { line: 1, .. }));
    }

    #[test]
    fn test_manifest_drives_emission() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir(td.path().join("a")).unwrap();
        std::fs::write(td.path().join("a/x"), b"payload").unwrap();
        let manifest = write_manifest(&td, "sd|.|a\nf|./a|x\ned||\n");

        let mut builder = scratch_builder(&td);
        ManifestWalker::new(&mut builder, td.path())
            .walk(&manifest, ManifestFormat::Seq)
            .unwrap();

        let kinds: Vec<_> = builder.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            [
                EntryKind::Directory,
                EntryKind::RegularFile,
                EntryKind::Directory
            ]
        );
        assert_eq!(builder.entries()[1].name, "x");
        assert_eq!(builder.entries()[1].end, 7);
        assert!(builder.entries()[2].is_directory_close());
    }

    #[test]
    fn test_filesystem_walk_orders_subdirectories_last() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path().join("root");
        std::fs::create_dir_all(root.join("aaa")).unwrap();
        std::fs::write(root.join("aaa/inner.txt"), b"inner").unwrap();
        std::fs::write(root.join("zzz.txt"), b"outer").unwrap();

        let mut builder = scratch_builder(&td);
        FilesystemWalker::new(&mut builder).walk(&root).unwrap();

        let names: Vec<_> = builder.entries().iter().map(|e| e.name.as_str()).collect();
        // "aaa" sorts before "zzz.txt", but non-directories come first.
        assert_eq!(names, ["zzz.txt", "aaa", "inner.txt", ".."]);
    }
}
