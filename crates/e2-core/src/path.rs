//! Current-directory navigation.
//!
//! `cd` is a small state machine over (inode, group, path stack):
//!
//! | component | effect |
//! |-----------|--------|
//! | `.` | nothing |
//! | `..` at root | nothing |
//! | `..` | pop one name, follow the `..` entry |
//! | name | must exist and be a directory; push it |
//!
//! A multi-component path (`a/b/../c`, or `/x` from the root) is walked on
//! a scratch copy of the state and committed only if every step succeeds.

use crate::{Cwd, FileSystem};
use e2_error::{E2Error, Result};
use e2_inode::group_of;
use e2_types::InodeNumber;
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Names from the root down to the current directory. The root itself is
/// the empty stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PathStack(Vec<String>);

impl PathStack {
    pub fn push(&mut self, name: impl Into<String>) {
        self.0.push(name.into());
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for PathStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for name in &self.0 {
            write!(f, "/{name}")?;
        }
        Ok(())
    }
}

impl FileSystem {
    /// Render the current path: `/` for the root, else `/a/b`.
    #[must_use]
    pub fn pwd(&self) -> String {
        self.path.to_string()
    }

    /// Change the current directory.
    pub fn cd(&mut self, path: &str) -> Result<()> {
        let (mut cwd, mut stack) = if path.starts_with('/') {
            let root = self.read_inode(InodeNumber::ROOT)?;
            (
                Cwd {
                    ino: InodeNumber::ROOT,
                    inode: root,
                },
                PathStack::default(),
            )
        } else {
            (self.cwd.clone(), self.path.clone())
        };

        for component in path.split('/').filter(|c| !c.is_empty()) {
            self.step(&mut cwd, &mut stack, component)?;
        }

        // leave the cache on the new directory's group
        self.group_stats(group_of(&self.geo, cwd.ino))?;
        debug!(ino = cwd.ino.0, path = %stack, "changed directory");
        self.cwd = cwd;
        self.path = stack;
        Ok(())
    }

    fn step(&mut self, cwd: &mut Cwd, stack: &mut PathStack, name: &str) -> Result<()> {
        match name {
            "." => Ok(()),
            ".." if stack.is_root() => Ok(()),
            ".." => {
                let dir = self.dir_block(cwd.ino, &cwd.inode)?;
                let parent = dir
                    .lookup(b"..")
                    .map(|e| InodeNumber(e.inode))
                    .ok_or_else(|| E2Error::Corruption {
                        block: dir.block().0,
                        detail: format!("directory inode {} has no '..' entry", cwd.ino),
                    })?;
                let inode = self.read_inode(parent)?;
                *cwd = Cwd { ino: parent, inode };
                stack.pop();
                Ok(())
            }
            _ => {
                let dir = self.dir_block(cwd.ino, &cwd.inode)?;
                let entry = dir
                    .lookup(name.as_bytes())
                    .ok_or_else(|| E2Error::NotFound(name.to_owned()))?;
                let ino = InodeNumber(entry.inode);
                let inode = self.read_inode(ino)?;
                if !inode.is_dir() {
                    return Err(E2Error::NotADirectory(name.to_owned()));
                }
                *cwd = Cwd { ino, inode };
                stack.push(name);
                Ok(())
            }
        }
    }
}
