//! Human-readable paths and status letters.
//!
//! Paths are derived on demand from the node graph. Nodes whose parent
//! chain breaks off get the `~~@UNKNOWN_PARENT/` prefix, and nameless
//! nodes get `~~DIR@`/`~~FILE@`/`~~SYMLINK@` placeholders, so every node
//! renders to something an operator can act on.

use crate::{FileNode, FileStatus, FileTree};
use e4s_types::InodeNumber;
use std::collections::HashSet;

const UNKNOWN_PARENT: &str = "~~@UNKNOWN_PARENT";

/// All paths under which a node is reachable.
///
/// Directories have exactly one path; files and symlinks have one per
/// discovered link, or a single placeholder path when no link survived.
#[must_use]
pub fn node_paths(tree: &FileTree, ino: InodeNumber) -> Vec<String> {
    let Some(node) = tree.get(ino) else {
        return vec![format!("{UNKNOWN_PARENT}/~~FILE@{ino}")];
    };
    match node {
        FileNode::Directory(_) => {
            let mut seen = HashSet::new();
            vec![directory_path(tree, ino, &mut seen)]
        }
        FileNode::RegularFile(file) => linked_paths(tree, file, &format!("~~FILE@{ino}")),
        FileNode::SymbolicLink(file) => linked_paths(tree, file, &format!("~~SYMLINK@{ino}")),
    }
}

fn linked_paths(tree: &FileTree, file: &crate::LinkedFile, placeholder: &str) -> Vec<String> {
    if file.links.is_empty() {
        return vec![format!("{UNKNOWN_PARENT}/{placeholder}")];
    }
    file.links
        .iter()
        .map(|link| {
            let mut seen = HashSet::new();
            join(&directory_path(tree, link.parent, &mut seen), &link.name)
        })
        .collect()
}

fn directory_path(tree: &FileTree, ino: InodeNumber, seen: &mut HashSet<InodeNumber>) -> String {
    if ino == InodeNumber::ROOT {
        return "/".to_owned();
    }
    let fallback = format!("~~DIR@{ino}");
    if !seen.insert(ino) {
        // Parent chain loops; treat the repeat as a detached root.
        return format!("{UNKNOWN_PARENT}/{fallback}");
    }
    let Some(FileNode::Directory(dir)) = tree.get(ino) else {
        return format!("{UNKNOWN_PARENT}/{fallback}");
    };
    let name = dir.name.clone().unwrap_or(fallback);
    match dir.parent {
        Some(parent) => join(&directory_path(tree, parent, seen), &name),
        None => format!("{UNKNOWN_PARENT}/{name}"),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Render a status bitmask as its six letters, `-` for clear bits.
///
/// Order: `i` bad inode, `p` parent unknown, `n` name unknown,
/// `l` missing links, `m` bad map, `d` bad data.
#[must_use]
pub fn status_letters(status: FileStatus) -> String {
    const LETTERS: [(FileStatus, char); 6] = [
        (FileStatus::BAD_INODE, 'i'),
        (FileStatus::PARENT_UNKNOWN, 'p'),
        (FileStatus::NAME_UNKNOWN, 'n'),
        (FileStatus::MISSING_LINKS, 'l'),
        (FileStatus::BAD_MAP, 'm'),
        (FileStatus::BAD_DATA, 'd'),
    ];
    LETTERS
        .iter()
        .map(|(bit, letter)| if status.contains(*bit) { *letter } else { '-' })
        .collect()
}
