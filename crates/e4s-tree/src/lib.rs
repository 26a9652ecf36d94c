#![forbid(unsafe_code)]
//! The reconstructed file tree.
//!
//! Nodes are keyed by inode number and reference each other by number, not
//! by pointer: under corruption the parent/child relation is not reliably
//! acyclic, and number-keyed lookups also let the scanner wire up forward
//! references (a directory entry naming an inode whose own inode record
//! has not been visited yet).
//!
//! Each node carries the counters the damage-status derivation needs; the
//! six-bit [`FileStatus`] is derived on demand, never stored.

mod naming;
mod persist;

pub use naming::{node_paths, status_letters};
pub use persist::{
    cache_file_path, default_cache_dir, load_tree, remove_cache, store_tree, TREE_CACHE_VERSION,
};

use bitflags::bitflags;
use e4s_types::InodeNumber;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;

bitflags! {
    /// What is wrong with a file, one bit per finding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileStatus: u8 {
        const BAD_INODE      = 0x01;
        const PARENT_UNKNOWN = 0x02;
        const NAME_UNKNOWN   = 0x04;
        const MISSING_LINKS  = 0x08;
        const BAD_MAP        = 0x10;
        const BAD_DATA       = 0x20;
    }
}

impl FileStatus {
    #[must_use]
    pub fn ok(self) -> bool {
        self.is_empty()
    }
}

/// Counters common to every node kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCommon {
    pub ino: u32,
    /// Link count declared by the inode.
    pub link_count: u32,
    /// Bytes allocated on disk (the inode's 512-byte-sector count x 512).
    pub byte_count: u64,
    /// Logical size in bytes.
    pub size: u64,
    pub inode_ok: bool,
    pub block_map_ok: bool,
    /// Bytes covered by mapped extents.
    pub mapped_bytes: u64,
    /// Bytes covered by extents whose tree path was intact.
    pub reachable_bytes: u64,
    /// Readable subset of the reachable bytes, per the damage map.
    pub readable_bytes: u64,
}

impl FileCommon {
    fn new(ino: InodeNumber) -> Self {
        Self {
            ino: ino.0,
            // A node invented from a directory entry starts pessimistic;
            // visiting its inode upgrades these.
            inode_ok: false,
            block_map_ok: true,
            ..Self::default()
        }
    }
}

/// One name under one parent directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLink {
    pub parent: InodeNumber,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub common: FileCommon,
    pub parent: Option<InodeNumber>,
    pub parent_mismatch: bool,
    pub name: Option<String>,
    pub children: BTreeSet<InodeNumber>,
    pub subdir_count: u32,
}

impl Directory {
    fn new(ino: InodeNumber) -> Self {
        let root = ino == InodeNumber::ROOT;
        Self {
            common: FileCommon::new(ino),
            parent: None,
            parent_mismatch: false,
            name: root.then(|| "/".to_owned()),
            children: BTreeSet::new(),
            subdir_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedFile {
    pub common: FileCommon,
    /// Discovered links, in discovery order.
    pub links: Vec<FileLink>,
    /// Symlink target when it survived (not persisted in the tree cache).
    pub target: Option<String>,
}

impl LinkedFile {
    fn new(ino: InodeNumber) -> Self {
        Self {
            common: FileCommon::new(ino),
            links: Vec::new(),
            target: None,
        }
    }
}

/// Node kind tag, also the type tag of the tree-cache format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    RegularFile,
    SymbolicLink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileNode {
    Directory(Directory),
    RegularFile(LinkedFile),
    SymbolicLink(LinkedFile),
}

impl FileNode {
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Directory(_) => NodeKind::Directory,
            Self::RegularFile(_) => NodeKind::RegularFile,
            Self::SymbolicLink(_) => NodeKind::SymbolicLink,
        }
    }

    #[must_use]
    pub fn common(&self) -> &FileCommon {
        match self {
            Self::Directory(d) => &d.common,
            Self::RegularFile(f) | Self::SymbolicLink(f) => &f.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut FileCommon {
        match self {
            Self::Directory(d) => &mut d.common,
            Self::RegularFile(f) | Self::SymbolicLink(f) => &mut f.common,
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        InodeNumber(self.common().ino)
    }

    /// Links actually found during the scan.
    ///
    /// Directories count their subdirectories' back references plus their
    /// own `.` plus the entry naming them; files count discovered links.
    #[must_use]
    pub fn found_link_count(&self) -> u32 {
        match self {
            Self::Directory(d) => d.subdir_count + 1 + u32::from(d.name.is_some()),
            Self::RegularFile(f) | Self::SymbolicLink(f) => f.links.len() as u32,
        }
    }

    /// Derive the damage status bitmask.
    #[must_use]
    pub fn status(&self) -> FileStatus {
        let common = self.common();
        if !common.inode_ok {
            return FileStatus::BAD_INODE;
        }

        let mut status = FileStatus::empty();
        if !common.block_map_ok {
            status |= FileStatus::BAD_MAP;
        }
        if common.readable_bytes < common.reachable_bytes {
            status |= FileStatus::BAD_DATA;
        }

        match self {
            Self::Directory(d) => {
                if u64::from(d.subdir_count) != u64::from(common.link_count.saturating_sub(2)) {
                    status |= FileStatus::MISSING_LINKS;
                }
                if common.ino == InodeNumber::ROOT.0 {
                    return status;
                }
                if d.parent.is_none() || d.parent_mismatch {
                    status |= FileStatus::PARENT_UNKNOWN;
                }
                if d.name.is_none() {
                    status |= FileStatus::NAME_UNKNOWN | FileStatus::MISSING_LINKS;
                }
            }
            Self::RegularFile(f) | Self::SymbolicLink(f) => {
                if f.links.len() as u32 != common.link_count {
                    status |= FileStatus::MISSING_LINKS;
                }
                if f.links.is_empty() {
                    status |= FileStatus::PARENT_UNKNOWN | FileStatus::NAME_UNKNOWN;
                }
            }
        }
        status
    }
}

/// Map of inode number to node, plus derived root views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTree {
    nodes: BTreeMap<u32, FileNode>,
}

impl FileTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, ino: InodeNumber) -> Option<&FileNode> {
        self.nodes.get(&ino.0)
    }

    pub fn get_mut(&mut self, ino: InodeNumber) -> Option<&mut FileNode> {
        self.nodes.get_mut(&ino.0)
    }

    pub fn insert(&mut self, node: FileNode) {
        self.nodes.insert(node.common().ino, node);
    }

    /// Iterate nodes in ascending inode order.
    pub fn iter(&self) -> impl Iterator<Item = &FileNode> {
        self.nodes.values()
    }

    /// Get or create the directory node for `ino`.
    ///
    /// Returns `None` when the inode is already present with a different
    /// kind (conflicting evidence is left as first seen).
    pub fn directory_mut(&mut self, ino: InodeNumber) -> Option<&mut Directory> {
        let node = self
            .nodes
            .entry(ino.0)
            .or_insert_with(|| FileNode::Directory(Directory::new(ino)));
        match node {
            FileNode::Directory(d) => Some(d),
            _ => None,
        }
    }

    /// Get or create a regular-file or symlink node for `ino`.
    pub fn linked_file_mut(&mut self, ino: InodeNumber, kind: NodeKind) -> Option<&mut LinkedFile> {
        let node = self.nodes.entry(ino.0).or_insert_with(|| match kind {
            NodeKind::SymbolicLink => FileNode::SymbolicLink(LinkedFile::new(ino)),
            _ => FileNode::RegularFile(LinkedFile::new(ino)),
        });
        match (node, kind) {
            (FileNode::RegularFile(f), NodeKind::RegularFile)
            | (FileNode::SymbolicLink(f), NodeKind::SymbolicLink) => Some(f),
            _ => None,
        }
    }

    /// Associate `parent` as the parent directory of the directory `child`.
    ///
    /// The first association wins and is mirrored into the parent's
    /// children set and subdirectory count; a different second candidate
    /// only sets `parent_mismatch`. The root directory never gains a
    /// parent.
    pub fn associate_parent(&mut self, child: InodeNumber, parent: InodeNumber) {
        if child == InodeNumber::ROOT {
            return;
        }
        let Some(child_dir) = self.directory_mut(child) else {
            return;
        };
        match child_dir.parent {
            None => {
                child_dir.parent = Some(parent);
                if let Some(parent_dir) = self.directory_mut(parent) {
                    parent_dir.children.insert(child);
                    parent_dir.subdir_count += 1;
                }
            }
            Some(existing) if existing == parent => {}
            Some(_) => {
                child_dir.parent_mismatch = true;
            }
        }
    }

    /// Record a `(parent, name)` link to a regular file or symlink.
    pub fn add_link(&mut self, ino: InodeNumber, kind: NodeKind, parent: InodeNumber, name: &str) {
        let Some(file) = self.linked_file_mut(ino, kind) else {
            return;
        };
        file.links.push(FileLink {
            parent,
            name: name.to_owned(),
        });
        if let Some(parent_dir) = self.directory_mut(parent) {
            parent_dir.children.insert(ino);
        }
    }

    /// Nodes with no known parent: parentless directories and linkless
    /// files, in ascending inode order. A fully connected tree has exactly
    /// one root, the root directory.
    #[must_use]
    pub fn roots(&self) -> Vec<InodeNumber> {
        self.nodes
            .values()
            .filter(|node| match node {
                FileNode::Directory(d) => d.parent.is_none(),
                FileNode::RegularFile(f) | FileNode::SymbolicLink(f) => f.links.is_empty(),
            })
            .map(FileNode::ino)
            .collect()
    }
}
