#![forbid(unsafe_code)]
//! Interactive session: an opened volume plus a current directory.

use crate::{Ext2Fs, Inode, OpenOptions};
use e2v_error::{E2vError, Result};
use e2v_ondisk::Ext2DirEntry;
use std::path::Path;
use tracing::info;

/// Bytes returned by [`Session::cat`] when no size is given.
pub const DEFAULT_CAT_BYTES: usize = 4096;

/// A volume with a current working directory.
///
/// Paths passed to session operations may be absolute or relative to the
/// current directory. Failed operations leave the current directory as it
/// was.
#[derive(Debug)]
pub struct Session {
    fs: Ext2Fs,
    cwd: String,
}

impl Session {
    /// Open `path` and start at `/`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_fs(Ext2Fs::open(path)?))
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        Ok(Self::from_fs(Ext2Fs::open_with_options(path, options)?))
    }

    #[must_use]
    pub fn from_fs(fs: Ext2Fs) -> Self {
        Self {
            fs,
            cwd: "/".to_owned(),
        }
    }

    /// Release the volume.
    pub fn close(self) {
        drop(self);
    }

    /// Current directory, always absolute and normalized.
    #[must_use]
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    #[must_use]
    pub fn fs(&self) -> &Ext2Fs {
        &self.fs
    }

    /// Turn `path` into a normalized absolute path. Empty means the current
    /// directory.
    ///
    /// `.` and `..` only step through directories: a component followed by
    /// either must itself resolve to a directory, so `notes.txt/..` fails with
    /// `PathNotDirectory` instead of collapsing away.
    pub fn absolute(&self, path: &str) -> Result<String> {
        let mut parts: Vec<&str> = if path.starts_with('/') {
            Vec::new()
        } else {
            self.cwd.split('/').filter(|c| !c.is_empty()).collect()
        };
        // Whether the last pushed component is known to be a directory.
        let mut verified = true;
        for component in path.split('/') {
            match component {
                "" => {}
                "." | ".." => {
                    if !verified {
                        self.require_dir(&join(&parts))?;
                        verified = true;
                    }
                    if component == ".." {
                        parts.pop();
                    }
                }
                name => {
                    parts.push(name);
                    verified = false;
                }
            }
        }
        Ok(join(&parts))
    }

    fn require_dir(&self, path: &str) -> Result<()> {
        if self.fs.resolve_path(path)?.is_dir() {
            Ok(())
        } else {
            Err(E2vError::PathNotDirectory(path.to_owned()))
        }
    }

    /// Resolve `path` to its inode.
    pub fn lookup(&self, path: &str) -> Result<Inode> {
        self.fs.resolve_path(&self.absolute(path)?)
    }

    /// List the directory at `path` (empty lists the current directory).
    pub fn list(&self, path: &str) -> Result<Vec<Ext2DirEntry>> {
        let dir = self.lookup(path)?;
        self.fs.read_dir(&dir)
    }

    /// Move to the directory at `path` and return the new current path.
    pub fn change_directory(&mut self, path: &str) -> Result<&str> {
        let target = self.absolute(path)?;
        let inode = self.fs.resolve_path(&target)?;
        if !inode.is_dir() {
            return Err(E2vError::NotDirectory { ino: inode.ino.0 });
        }
        info!(from = %self.cwd, to = %target, "change directory");
        self.cwd = target;
        Ok(&self.cwd)
    }

    /// Read up to `max_bytes` (default [`DEFAULT_CAT_BYTES`]) of the
    /// regular file at `path`.
    pub fn cat(&self, path: &str, max_bytes: Option<usize>) -> Result<Vec<u8>> {
        let inode = self.lookup(path)?;
        self.fs
            .read(&inode, max_bytes.unwrap_or(DEFAULT_CAT_BYTES))
    }
}

/// Absolute path from already-normalized components.
fn join(parts: &[&str]) -> String {
    if parts.is_empty() {
        return "/".to_owned();
    }
    let mut out = String::new();
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2v_block::MemByteDevice;
    use e2v_error::ErrorKind;
    use e2v_harness::{Ext2ImageBuilder, ImageGeometry, ROOT_INO};

    fn session() -> Session {
        let mut builder = Ext2ImageBuilder::new(ImageGeometry::default()).expect("builder");
        let docs = builder.add_dir(ROOT_INO, "docs").expect("docs");
        builder
            .add_file(docs, "notes.txt", b"remember the milk")
            .expect("notes");
        let big: Vec<u8> = (0..10_000_u32).map(|i| (i % 97) as u8).collect();
        builder.add_file(ROOT_INO, "big.bin", &big).expect("big");
        let fs = Ext2Fs::from_device(
            MemByteDevice::new(builder.finish().expect("finish")),
            &OpenOptions::default(),
        )
        .expect("open");
        Session::from_fs(fs)
    }

    #[test]
    fn absolute_collapses_dots() {
        let mut s = session();
        assert_eq!(s.absolute("/").expect("root"), "/");
        assert_eq!(s.absolute("/docs/./notes.txt").expect("dot"), "/docs/notes.txt");
        assert_eq!(s.absolute("/docs/../big.bin").expect("up"), "/big.bin");
        assert_eq!(s.absolute("/../..").expect("above root"), "/");
        assert_eq!(s.absolute("//docs//").expect("slashes"), "/docs");

        s.change_directory("docs").expect("cd");
        assert_eq!(s.absolute("").expect("cwd"), "/docs");
        assert_eq!(s.absolute("../big.bin").expect("relative"), "/big.bin");
    }

    #[test]
    fn dot_dot_does_not_step_through_files() {
        let mut s = session();
        let err = s.change_directory("docs/notes.txt/..").expect_err("through file");
        assert!(matches!(&err, E2vError::PathNotDirectory(p) if p == "/docs/notes.txt"));
        assert_eq!(err.kind(), ErrorKind::Lookup);
        assert_eq!(s.cwd(), "/");

        let err = s.cat("/big.bin/./x", None).expect_err("dot after file");
        assert!(matches!(&err, E2vError::PathNotDirectory(p) if p == "/big.bin"));

        let err = s.list("missing/..").expect_err("missing");
        assert!(matches!(&err, E2vError::NotFound(p) if p == "/missing"));
    }

    #[test]
    fn starts_at_root_and_lists_it() {
        let s = session();
        assert_eq!(s.cwd(), "/");
        let names: Vec<String> = s
            .list("")
            .expect("list")
            .iter()
            .map(Ext2DirEntry::name_str)
            .collect();
        assert_eq!(names, vec![".", "..", "lost+found", "docs", "big.bin"]);
    }

    #[test]
    fn relative_paths_follow_cwd() {
        let mut s = session();
        assert_eq!(s.change_directory("docs").expect("cd"), "/docs");
        assert_eq!(s.cat("notes.txt", None).expect("cat"), b"remember the milk");
        assert_eq!(s.cat("./notes.txt", Some(8)).expect("cat"), b"remember");

        let names: Vec<String> = s
            .list("")
            .expect("list")
            .iter()
            .map(Ext2DirEntry::name_str)
            .collect();
        assert_eq!(names, vec![".", "..", "notes.txt"]);

        assert_eq!(s.change_directory("..").expect("up"), "/");
        s.change_directory("/docs").expect("abs");
        assert_eq!(s.change_directory("/").expect("root"), "/");
    }

    #[test]
    fn cd_to_file_fails_and_keeps_cwd() {
        let mut s = session();
        s.change_directory("/docs").expect("cd");
        let err = s.change_directory("notes.txt").expect_err("file");
        assert_eq!(err.kind(), ErrorKind::Type);
        assert_eq!(s.cwd(), "/docs");

        let err = s.change_directory("missing").expect_err("missing");
        assert!(matches!(err, E2vError::NotFound(_)));
        assert_eq!(s.cwd(), "/docs");
    }

    #[test]
    fn cat_defaults_to_4096_bytes() {
        let s = session();
        let data = s.cat("/big.bin", None).expect("cat");
        assert_eq!(data.len(), DEFAULT_CAT_BYTES);
        assert_eq!(s.cat("/big.bin", Some(usize::MAX)).expect("all").len(), 10_000);
    }

    #[test]
    fn cat_directory_is_type_error() {
        let s = session();
        let err = s.cat("docs", None).expect_err("dir");
        assert!(matches!(err, E2vError::IsDirectory { .. }));
    }

    #[test]
    fn list_file_is_type_error() {
        let s = session();
        let err = s.list("/big.bin").expect_err("file");
        assert!(matches!(err, E2vError::NotDirectory { .. }));
    }
}
