//! Tree cache: persist a scanned `FileTree` keyed by image identity.
//!
//! The cache file name is the SHA-1 of the image's absolute path and
//! modification time (plus the rescue log's, when one was used), so any
//! change to either input retires the old cache automatically. The file
//! itself is line-oriented text: a version line, the two identity paths,
//! then one line per node.

use crate::{Directory, FileCommon, FileNode, FileTree, LinkedFile, NodeKind};
use chrono::{DateTime, Utc};
use e4s_error::{Result, SalvageError};
use e4s_types::InodeNumber;
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Format version; readers accept exactly this value.
pub const TREE_CACHE_VERSION: u32 = 10004;

/// Cache directory: `$E4S_CACHE_DIR`, else `$HOME/.ext4rescue`.
#[must_use]
pub fn default_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("E4S_CACHE_DIR") {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ext4rescue"))
}

fn mtime_iso8601(mtime: SystemTime) -> String {
    DateTime::<Utc>::from(mtime).to_rfc3339()
}

/// Compute the cache file path for an (image, rescue log) pair.
///
/// Both inputs are identified by absolute path and mtime; touching either
/// file therefore selects a fresh cache file.
pub fn cache_file_path(
    cache_dir: &Path,
    image: &Path,
    ddrescue_log: Option<&Path>,
) -> Result<PathBuf> {
    let image_abs = fs::canonicalize(image)?;
    let image_mtime = fs::metadata(&image_abs)?.modified()?;
    let mut identity = format!("{}!{}", image_abs.display(), mtime_iso8601(image_mtime));
    if let Some(log) = ddrescue_log {
        let log_abs = fs::canonicalize(log)?;
        let log_mtime = fs::metadata(&log_abs)?.modified()?;
        let _ = write!(
            identity,
            "!{}!{}",
            log_abs.display(),
            mtime_iso8601(log_mtime)
        );
    }

    let mut hasher = Sha1::new();
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();
    let mut name = String::with_capacity(digest.len() * 2 + 6);
    for byte in digest {
        let _ = write!(name, "{byte:02x}");
    }
    name.push_str(".cache");
    Ok(cache_dir.join(name))
}

/// Delete a cache file, ignoring its absence.
pub fn remove_cache(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn push_common(line: &mut String, tag: char, common: &FileCommon) {
    let _ = write!(
        line,
        "{tag}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
        common.ino,
        common.link_count,
        common.byte_count,
        common.size,
        u8::from(common.inode_ok),
        u8::from(common.block_map_ok),
        common.mapped_bytes,
        common.reachable_bytes,
        common.readable_bytes,
    );
}

/// Serialize a tree to `path`, creating the cache directory if needed.
pub fn store_tree(
    tree: &FileTree,
    path: &Path,
    image_path: &str,
    ddrescue_path: &str,
) -> Result<()> {
    let mut out = String::new();
    let _ = writeln!(out, "{TREE_CACHE_VERSION}");
    let _ = writeln!(out, "{image_path}");
    let _ = writeln!(out, "{ddrescue_path}");

    for node in tree.iter() {
        let mut line = String::new();
        match node {
            FileNode::Directory(dir) => {
                push_common(&mut line, 'd', &dir.common);
                // The root's implicit "/" would collide with the field
                // separator; it is stored empty and restored on load.
                let name = dir.name.as_deref().filter(|n| *n != "/").unwrap_or("");
                let _ = write!(
                    line,
                    "/{}/{}/{name}",
                    dir.parent.map_or(0, |p| p.0),
                    u8::from(dir.parent_mismatch),
                );
            }
            FileNode::RegularFile(file) => {
                push_common(&mut line, 'r', &file.common);
                for link in &file.links {
                    let _ = write!(line, "/{}/{}", link.parent.0, link.name);
                }
            }
            FileNode::SymbolicLink(file) => {
                push_common(&mut line, 'l', &file.common);
                for link in &file.links {
                    let _ = write!(line, "/{}/{}", link.parent.0, link.name);
                }
            }
        }
        let _ = writeln!(out, "{line}");
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, out)?;
    debug!(target: "e4s::cache", path = %path.display(), nodes = tree.len(), "stored tree cache");
    Ok(())
}

fn bad(line_no: usize, what: &str) -> SalvageError {
    SalvageError::CacheFormat(format!("line {line_no}: {what}"))
}

fn parse_u64(token: &str, line_no: usize) -> Result<u64> {
    token.parse().map_err(|_| bad(line_no, "malformed number"))
}

fn parse_bool(token: &str, line_no: usize) -> Result<bool> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(bad(line_no, "malformed flag")),
    }
}

fn parse_common(fields: &[&str], line_no: usize) -> Result<FileCommon> {
    Ok(FileCommon {
        ino: u32::try_from(parse_u64(fields[1], line_no)?)
            .map_err(|_| bad(line_no, "inode number out of range"))?,
        link_count: u32::try_from(parse_u64(fields[2], line_no)?)
            .map_err(|_| bad(line_no, "link count out of range"))?,
        byte_count: parse_u64(fields[3], line_no)?,
        size: parse_u64(fields[4], line_no)?,
        inode_ok: parse_bool(fields[5], line_no)?,
        block_map_ok: parse_bool(fields[6], line_no)?,
        mapped_bytes: parse_u64(fields[7], line_no)?,
        reachable_bytes: parse_u64(fields[8], line_no)?,
        readable_bytes: parse_u64(fields[9], line_no)?,
    })
}

/// Load a cached tree.
///
/// `Ok(None)` means no cache exists for this identity. Every other failure
/// (version or identity mismatch, malformed content, unreadable file) is an
/// error the caller treats as "rescan".
pub fn load_tree(
    path: &Path,
    image_path: &str,
    ddrescue_path: &str,
) -> Result<Option<FileTree>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let mut lines = text.lines().enumerate();
    let (_, version_line) = lines.next().ok_or_else(|| bad(1, "missing version"))?;
    let version: u32 = version_line
        .parse()
        .map_err(|_| bad(1, "malformed version"))?;
    if version != TREE_CACHE_VERSION {
        return Err(SalvageError::CacheFormat(format!(
            "unsupported cache version {version}"
        )));
    }

    let (_, cached_image) = lines.next().ok_or_else(|| bad(2, "missing image path"))?;
    if cached_image != image_path {
        return Err(SalvageError::CacheFormat("image path mismatch".to_owned()));
    }
    let (_, cached_log) = lines.next().ok_or_else(|| bad(3, "missing log path"))?;
    if cached_log != ddrescue_path {
        return Err(SalvageError::CacheFormat(
            "ddrescue log path mismatch".to_owned(),
        ));
    }

    let mut tree = FileTree::new();
    let mut dir_parents: Vec<(InodeNumber, u32, bool)> = Vec::new();
    let mut file_links: Vec<(InodeNumber, NodeKind, Vec<(u32, String)>)> = Vec::new();

    for (idx, line) in lines {
        let line_no = idx + 1;
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('/').collect();
        if fields.len() < 10 {
            return Err(bad(line_no, "truncated node record"));
        }
        let common = parse_common(&fields, line_no)?;
        let ino = InodeNumber(common.ino);

        match fields[0] {
            "d" => {
                if fields.len() != 13 {
                    return Err(bad(line_no, "malformed directory record"));
                }
                let parent = u32::try_from(parse_u64(fields[10], line_no)?)
                    .map_err(|_| bad(line_no, "parent inode out of range"))?;
                let mismatch = parse_bool(fields[11], line_no)?;
                let name = fields[12];
                let name = if ino == InodeNumber::ROOT {
                    Some("/".to_owned())
                } else {
                    (!name.is_empty()).then(|| name.to_owned())
                };
                tree.insert(FileNode::Directory(Directory {
                    common,
                    parent: None,
                    parent_mismatch: false,
                    name,
                    children: BTreeSet::new(),
                    subdir_count: 0,
                }));
                dir_parents.push((ino, parent, mismatch));
            }
            tag @ ("r" | "l") => {
                if (fields.len() - 10) % 2 != 0 {
                    return Err(bad(line_no, "unpaired link fields"));
                }
                let kind = if tag == "r" {
                    NodeKind::RegularFile
                } else {
                    NodeKind::SymbolicLink
                };
                let mut links = Vec::new();
                for pair in fields[10..].chunks(2) {
                    let parent = u32::try_from(parse_u64(pair[0], line_no)?)
                        .map_err(|_| bad(line_no, "parent inode out of range"))?;
                    links.push((parent, pair[1].to_owned()));
                }
                let file = LinkedFile {
                    common,
                    links: Vec::new(),
                    target: None,
                };
                tree.insert(match kind {
                    NodeKind::SymbolicLink => FileNode::SymbolicLink(file),
                    _ => FileNode::RegularFile(file),
                });
                file_links.push((ino, kind, links));
            }
            _ => return Err(bad(line_no, "unknown node type tag")),
        }
    }

    // Second pass: rebuild parent/child edges and link lists through the
    // same association paths the scanner uses, so derived counters match.
    for (child, parent, mismatch) in dir_parents {
        if parent != 0 {
            tree.associate_parent(child, InodeNumber(parent));
        }
        if mismatch {
            if let Some(FileNode::Directory(dir)) = tree.get_mut(child) {
                dir.parent_mismatch = true;
            }
        }
    }
    for (ino, kind, links) in file_links {
        for (parent, name) in links {
            tree.add_link(ino, kind, InodeNumber(parent), &name);
        }
    }

    debug!(target: "e4s::cache", path = %path.display(), nodes = tree.len(), "loaded tree cache");
    Ok(Some(tree))
}
