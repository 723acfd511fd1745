//! Filesystem seam used for descriptor loading, executable checks and the
//! identity side file.

use std::io;
use std::path::{Path, PathBuf};

pub trait FileSystem: Send + Sync {
    fn is_file(&self, path: &Path) -> bool;

    fn read_file(&self, path: &Path) -> io::Result<String>;

    /// Replace the file contents. Parent directories are created as needed.
    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Regular files directly inside `dir`, sorted by path.
    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The real local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read_file(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write next to the target then rename so readers never see a torn file
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        tracing::trace!(path = %path.display(), "File written");
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
