#![forbid(unsafe_code)]
//! Absolute path parsing and resolution from the root directory.

use crate::{Ext2Fs, Inode};
use e2v_error::{E2vError, Result};
use e2v_types::InodeNumber;
use tracing::trace;

/// An absolute path split into its directory chain and final target.
///
/// `/a/b/c` has chain `["a", "b"]` and target `c`. `/` and separator-only
/// paths have an empty chain and no target. Empty components are dropped,
/// so `//a///b` parses like `/a/b`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub original: String,
    /// Directories walked before the target, outermost first.
    pub components: Vec<String>,
    pub target: Option<String>,
}

impl ParsedPath {
    /// Split `path`. It must be non-empty and start with `/`.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(E2vError::InvalidPath("empty path".to_owned()));
        }
        if !path.starts_with('/') {
            return Err(E2vError::InvalidPath(format!(
                "{path}: path must be absolute"
            )));
        }

        let mut components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();
        let target = components.pop();
        Ok(Self {
            original: path.to_owned(),
            components,
            target,
        })
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.target.is_none()
    }

    /// The path through the first `n` chain components, e.g. `/a/b`.
    #[must_use]
    pub fn prefix(&self, n: usize) -> String {
        let n = n.min(self.components.len());
        let mut out = String::new();
        for component in &self.components[..n] {
            out.push('/');
            out.push_str(component);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// The normalized full path: chain plus target.
    #[must_use]
    pub fn full(&self) -> String {
        match &self.target {
            Some(target) => {
                let mut out = self.prefix(self.components.len());
                if !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(target);
                out
            }
            None => "/".to_owned(),
        }
    }
}

impl Ext2Fs {
    /// Resolve an absolute path to its inode.
    ///
    /// Every chain component must exist and be a directory; a failure names
    /// the offending prefix. The target is returned whatever its type.
    pub fn resolve_path(&self, path: &str) -> Result<Inode> {
        let parsed = ParsedPath::parse(path)?;
        let Some(target) = &parsed.target else {
            return Ok(self.root().clone());
        };

        let mut current = self.root().clone();
        for (depth, component) in parsed.components.iter().enumerate() {
            let entry = self
                .lookup_name(&current, component.as_bytes())?
                .ok_or_else(|| E2vError::NotFound(parsed.prefix(depth + 1)))?;
            current = self.read_inode(InodeNumber::from(entry.inode))?;
            if !current.is_dir() {
                return Err(E2vError::PathNotDirectory(parsed.prefix(depth + 1)));
            }
        }

        let entry = self
            .lookup_name(&current, target.as_bytes())?
            .ok_or_else(|| E2vError::NotFound(parsed.full()))?;
        let inode = self.read_inode(InodeNumber::from(entry.inode))?;
        trace!(path, ino = inode.ino.0, "resolved path");
        Ok(inode)
    }
}
