//! Counters accumulated during the walk, read once to size the filter.

/// Tallies of what the walk put into the image.
///
/// Only `num_files` participates in filter sizing; symlinks and
/// directories are inserted into the filter but not counted toward it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImageStats {
    /// Regular files in the image.
    pub num_files: u64,
    /// Non-root directories in the image.
    pub num_dirs: u64,
    /// Symbolic links in the image.
    pub num_symlinks: u64,
}

impl ImageStats {
    pub fn add_file(&mut self) {
        self.num_files += 1;
    }

    pub fn add_dir(&mut self) {
        self.num_dirs += 1;
    }

    pub fn add_symlink(&mut self) {
        self.num_symlinks += 1;
    }
}
