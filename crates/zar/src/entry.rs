//! The ordered metadata stream describing an image's layout.
//!
//! Every file, directory boundary, symlink, and whiteout in the image is
//! one [`Entry`] in emission order: a preorder walk where, per directory,
//! all non-directory children come first and subdirectories follow.  The
//! root directory is implicit and never emitted.  Directory entries come
//! in matched pairs, the closing half carrying the reserved [`CLOSE_DIR`]
//! name.

use serde::{Deserialize, Serialize};

/// Reserved name of a directory-closing entry.
pub const CLOSE_DIR: &str = "..";

/// What an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    RegularFile,
    Directory,
    Symlink,
    WhiteoutFile,
}

/// One record in the metadata stream.
///
/// `begin..end` is the payload byte range for regular files; payloadless
/// entries carry −1 in both.  `link` is empty except for symlinks, where
/// it holds the unresolved target recorded at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub begin: i64,
    pub end: i64,
    pub name: String,
    pub link: String,
    /// Nanoseconds since the epoch; 0 if unknown.
    pub mod_time: i64,
    /// Raw file-mode bits; 0 if unknown.
    pub mode: u32,
    pub kind: EntryKind,
}

impl Entry {
    pub fn file(name: &str, begin: i64, end: i64, mod_time: i64, mode: u32) -> Self {
        Self {
            begin,
            end,
            name: name.to_owned(),
            link: String::new(),
            mod_time,
            mode,
            kind: EntryKind::RegularFile,
        }
    }

    pub fn directory_open(name: &str, mod_time: i64, mode: u32) -> Self {
        Self {
            begin: -1,
            end: -1,
            name: name.to_owned(),
            link: String::new(),
            mod_time,
            mode,
            kind: EntryKind::Directory,
        }
    }

    pub fn directory_close() -> Self {
        Self {
            begin: -1,
            end: -1,
            name: CLOSE_DIR.to_owned(),
            link: String::new(),
            mod_time: 0,
            mode: 0,
            kind: EntryKind::Directory,
        }
    }

    pub fn symlink(name: &str, target: &str, mod_time: i64, mode: u32) -> Self {
        Self {
            begin: -1,
            end: -1,
            name: name.to_owned(),
            link: target.to_owned(),
            mod_time,
            mode,
            kind: EntryKind::Symlink,
        }
    }

    pub fn whiteout(name: &str, mod_time: i64) -> Self {
        Self {
            begin: -1,
            end: -1,
            name: name.to_owned(),
            link: String::new(),
            mod_time,
            mode: 0,
            kind: EntryKind::WhiteoutFile,
        }
    }

    /// True for the closing half of a directory pair.
    pub fn is_directory_close(&self) -> bool {
        self.kind == EntryKind::Directory && self.name == CLOSE_DIR
    }

    /// True when `begin..end` describes payload bytes in the data region.
    pub fn has_payload(&self) -> bool {
        self.begin >= 0
    }
}

/// Computes, in emission order, the `/`-joined image path of every regular
/// file and symlink: directory opens push a segment onto the running path,
/// closes drop one.  Whiteouts are excluded.  These are exactly the keys
/// inserted into the membership filter.
pub fn image_paths(entries: &[Entry]) -> Vec<String> {
    let mut path = String::new();
    let mut out = Vec::new();

    for entry in entries {
        match entry.kind {
            EntryKind::RegularFile | EntryKind::Symlink => {
                out.push(format!("{path}/{}", entry.name));
            }
            EntryKind::Directory => {
                if entry.is_directory_close() {
                    path.truncate(path.rfind('/').unwrap_or(0));
                } else {
                    path.push('/');
                    path.push_str(&entry.name);
                }
            }
            EntryKind::WhiteoutFile => {}
        }
    }

    out
}

/// Checks the directory-pairing invariant: opens and closes balance, and
/// no prefix of the stream closes a directory it never opened.
pub fn balanced_directories(entries: &[Entry]) -> bool {
    let mut depth = 0i64;
    for entry in entries {
        if entry.kind == EntryKind::Directory {
            if entry.is_directory_close() {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            } else {
                depth += 1;
            }
        }
    }
    depth == 0
}
