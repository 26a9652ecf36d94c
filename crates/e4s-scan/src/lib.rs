#![forbid(unsafe_code)]
//! Scanner: populate a `FileTree` from an `Ext4Image`.
//!
//! One pass over `{2} ∪ [11, inodes_count]` in ascending order. Each
//! directory contributes names and parent links for the inodes it
//! references (which may not have been visited yet); each regular file and
//! symlink gets a data-readability accounting over its extents. Damage is
//! absorbed: unreadable inodes are counted and skipped, damaged extent
//! trees degrade into bad extents, and a destroyed root inode triggers a
//! raw-block search for the root directory's data.

use e4s_error::Result;
use e4s_image::{Ext4Image, InodeView};
use e4s_ondisk::{DirEntryKind, Ext4DirEntry, FileKind};
use e4s_tree::{FileNode, FileTree, NodeKind};
use e4s_types::{BlockNumber, InodeNumber, EXT4_FIRST_NONRESERVED_INO};
use tracing::{debug, info, trace};

/// Outcome of a scan.
#[derive(Debug)]
pub struct ScanReport {
    pub tree: FileTree,
    /// Inodes whose on-disk bytes were not readable.
    pub unreadable_inodes: u32,
    /// False when the progress callback stopped the scan early.
    pub completed: bool,
    /// True when the root directory was rewired from a raw block.
    pub root_recovered: bool,
}

/// Extent-walk accumulator shared by all node kinds.
#[derive(Debug, Default, Clone, Copy)]
struct ExtentStats {
    mapped: u64,
    reachable: u64,
    readable: u64,
    map_ok: bool,
}

/// Scan every inode and reconstruct the file tree.
///
/// `progress` is called every `ceil(total / 1024)` inodes with
/// `(processed, total)`; returning `false` stops the scan and yields the
/// partially populated tree.
pub fn scan<F>(image: &Ext4Image, mut progress: F) -> Result<ScanReport>
where
    F: FnMut(u32, u32) -> bool,
{
    let inode_count = image.inode_count();
    let scan_total = if inode_count >= EXT4_FIRST_NONRESERVED_INO {
        inode_count - EXT4_FIRST_NONRESERVED_INO + 2
    } else {
        1
    };
    let step = scan_total.div_ceil(1024).max(1);

    let mut tree = FileTree::new();
    let mut unreadable_inodes = 0_u32;
    let mut processed = 0_u32;
    let mut completed = true;

    let numbers =
        std::iter::once(InodeNumber::ROOT.0).chain(EXT4_FIRST_NONRESERVED_INO..=inode_count);
    for n in numbers {
        if n > inode_count {
            break;
        }
        scan_inode(image, &mut tree, InodeNumber(n), &mut unreadable_inodes)?;
        processed += 1;
        if processed % step == 0 && !progress(processed, scan_total) {
            debug!(target: "e4s::scan", processed, "scan stopped by progress callback");
            completed = false;
            break;
        }
    }

    let mut root_recovered = false;
    if completed {
        root_recovered = recover_root_if_needed(image, &mut tree)?;
    }

    info!(
        target: "e4s::scan",
        nodes = tree.len(),
        unreadable_inodes,
        completed,
        root_recovered,
        "scan finished"
    );
    Ok(ScanReport {
        tree,
        unreadable_inodes,
        completed,
        root_recovered,
    })
}

fn scan_inode(
    image: &Ext4Image,
    tree: &mut FileTree,
    ino: InodeNumber,
    unreadable_inodes: &mut u32,
) -> Result<()> {
    let view = image.inode(ino)?;
    if !view.ok() {
        *unreadable_inodes += 1;
        trace!(target: "e4s::scan", ino = %ino, "unreadable inode");
        if ino == InodeNumber::ROOT {
            // The root is a directory by definition; materialize it so
            // root recovery has a node to repair.
            tree.directory_mut(ino);
        }
        return Ok(());
    }
    if view.is_deleted() {
        return Ok(());
    }

    match view.kind() {
        FileKind::Directory => scan_directory(image, tree, &view),
        FileKind::Regular => scan_linked_file(image, tree, &view, NodeKind::RegularFile),
        FileKind::Symlink => scan_linked_file(image, tree, &view, NodeKind::SymbolicLink),
        FileKind::Other => Ok(()),
    }
}

/// Walk an inode's extents, accumulating readability statistics.
///
/// `on_extent` sees each intact extent (for directories, to read its
/// blocks); bad extents only affect the accounting.
fn walk_extents<G>(image: &Ext4Image, view: &InodeView, mut on_extent: G) -> Result<ExtentStats>
where
    G: FnMut(u64, u16) -> Result<()>,
{
    let bs = u64::from(image.block_size().get());
    let mut stats = ExtentStats::default();
    let mut range = image.extents(view);
    for extent in range.by_ref() {
        let bytes = bs * u64::from(extent.block_count);
        stats.mapped += bytes;
        if extent.ok {
            stats.reachable += bytes;
            let start = extent.physical_block * bs;
            stats.readable += image.damage().count_readable_bytes(start, start + bytes);
            on_extent(extent.physical_block, extent.block_count)?;
        }
    }
    stats.map_ok = range.root_ok();
    Ok(stats)
}

fn record_common(tree_node: &mut e4s_tree::FileCommon, image: &Ext4Image, view: &InodeView) {
    let inode = view.inode();
    tree_node.link_count = u32::from(inode.links_count);
    tree_node.byte_count = image.inode_sector_count(inode) * 512;
    tree_node.size = inode.size();
    tree_node.inode_ok = true;
}

fn scan_directory(image: &Ext4Image, tree: &mut FileTree, view: &InodeView) -> Result<()> {
    let mut entries: Vec<Ext4DirEntry> = Vec::new();
    let stats = walk_extents(image, view, |physical, count| {
        for block in physical..physical + u64::from(count) {
            entries.extend(image.dir_block_entries(BlockNumber(block))?);
        }
        Ok(())
    })?;

    let ino = view.ino();
    {
        let Some(dir) = tree.directory_mut(ino) else {
            return Ok(());
        };
        record_common(&mut dir.common, image, view);
        dir.common.block_map_ok = stats.map_ok;
        dir.common.mapped_bytes = stats.mapped;
        dir.common.reachable_bytes = stats.reachable;
        dir.common.readable_bytes = stats.readable;
    }

    for entry in &entries {
        apply_dir_entry(tree, ino, entry, image.inode_count());
    }
    Ok(())
}

fn apply_dir_entry(
    tree: &mut FileTree,
    current: InodeNumber,
    entry: &Ext4DirEntry,
    inode_count: u32,
) {
    let target = entry.inode;
    if target == 0 || target > inode_count {
        return;
    }
    let target = InodeNumber(target);

    match entry.file_type {
        DirEntryKind::Dir => {
            if entry.is_dot() {
                // The directory's own self-reference.
            } else if entry.is_dotdot() {
                tree.associate_parent(current, target);
            } else {
                let name = entry.name_str();
                if target != InodeNumber::ROOT {
                    if let Some(dir) = tree.directory_mut(target) {
                        dir.name = Some(name);
                    }
                }
                tree.associate_parent(target, current);
            }
        }
        DirEntryKind::RegFile => {
            tree.add_link(target, NodeKind::RegularFile, current, &entry.name_str());
        }
        DirEntryKind::Symlink => {
            tree.add_link(target, NodeKind::SymbolicLink, current, &entry.name_str());
        }
        _ => {}
    }
}

fn scan_linked_file(
    image: &Ext4Image,
    tree: &mut FileTree,
    view: &InodeView,
    kind: NodeKind,
) -> Result<()> {
    let fast_symlink =
        kind == NodeKind::SymbolicLink && image.is_fast_symlink(view.inode());

    let stats = if fast_symlink {
        ExtentStats {
            map_ok: true,
            ..ExtentStats::default()
        }
    } else {
        walk_extents(image, view, |_, _| Ok(()))?
    };

    let target = if kind == NodeKind::SymbolicLink {
        image.symlink_target(view)
    } else {
        None
    };

    let Some(file) = tree.linked_file_mut(view.ino(), kind) else {
        return Ok(());
    };
    record_common(&mut file.common, image, view);
    file.common.block_map_ok = stats.map_ok;
    file.common.mapped_bytes = stats.mapped;
    file.common.reachable_bytes = stats.reachable;
    file.common.readable_bytes = stats.readable;
    file.target = target;
    Ok(())
}

// ── Root recovery ───────────────────────────────────────────────────────────

/// When the root inode was destroyed, search the first block group for a
/// block that looks like the root directory's data and rewire names and
/// parents from it.
fn recover_root_if_needed(image: &Ext4Image, tree: &mut FileTree) -> Result<bool> {
    let needs_recovery = match tree.get(InodeNumber::ROOT) {
        Some(FileNode::Directory(dir)) => !dir.common.inode_ok,
        Some(_) => false,
        None => true,
    };
    if !needs_recovery {
        return Ok(false);
    }
    tree.directory_mut(InodeNumber::ROOT);

    let sb = image.superblock();
    let search_blocks = u64::from(sb.blocks_per_group).min(sb.blocks_count);
    debug!(
        target: "e4s::scan",
        search_blocks,
        "root inode unreadable; searching for root directory data"
    );

    for block in 0..search_blocks {
        let entries = image.dir_block_entries(BlockNumber(block))?;
        if !plausible_root_block(&entries, tree, image.inode_count()) {
            continue;
        }
        info!(target: "e4s::scan", block, "recovered root directory block");
        for entry in entries.iter().skip(2) {
            if tree.get(InodeNumber(entry.inode)).is_some() {
                apply_dir_entry(tree, InodeNumber::ROOT, entry, image.inode_count());
            }
        }
        return Ok(true);
    }
    Ok(false)
}

/// A plausible root block opens with an exact `"."`/`".."` pair pointing
/// at inode 2, and none of its remaining entries contradict what the scan
/// already knows.
fn plausible_root_block(entries: &[Ext4DirEntry], tree: &FileTree, inode_count: u32) -> bool {
    let [dot, dotdot, rest @ ..] = entries else {
        return false;
    };
    if !(dot.is_dot()
        && dot.inode == InodeNumber::ROOT.0
        && dot.rec_len == 12
        && dot.file_type == DirEntryKind::Dir)
    {
        return false;
    }
    if !(dotdot.is_dotdot()
        && dotdot.inode == InodeNumber::ROOT.0
        && dotdot.file_type == DirEntryKind::Dir)
    {
        return false;
    }

    for entry in rest {
        if entry.inode > inode_count {
            return false;
        }
        let Some(node) = tree.get(InodeNumber(entry.inode)) else {
            continue;
        };
        match (entry.file_type, node) {
            (DirEntryKind::Dir, FileNode::Directory(dir)) => {
                if !(dir.parent.is_none() || dir.parent == Some(InodeNumber::ROOT)) {
                    return false;
                }
            }
            (DirEntryKind::RegFile, FileNode::RegularFile(file))
            | (DirEntryKind::Symlink, FileNode::SymbolicLink(file)) => {
                if file.links.len() as u32 >= file.common.link_count {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}
