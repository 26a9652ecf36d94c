//! Lazy extent-tree traversal that survives corruption.
//!
//! The tree is rooted in the inode's 60-byte i_block area and may continue
//! into arbitrary filesystem blocks. Corruption at any node degrades into
//! synthesized "bad" extents rather than errors: a bad header abandons the
//! subtree, a bad index entry is skipped, a bad leaf entry yields one bad
//! extent. Callers can always tell where the damage sits because a bad
//! extent carries the last known logical boundary.

use crate::Ext4Image;
use e4s_block::CachedBytes;
use e4s_ondisk::{ExtentHeader, ExtentIndex, ExtentLeaf};
use e4s_types::{BlockNumber, OnDisk};
use tracing::trace;

/// Deepest tree the reader will follow (the kernel caps trees at depth 5).
const MAX_EXTENT_DEPTH: usize = 5;

/// One mapping run of a file, or a marker for a damaged part of the tree.
///
/// A bad extent has `ok == false`, `block_count == 0`, and a
/// `logical_block` equal to the last known logical boundary before the
/// damage, so callers can account for holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub physical_block: u64,
    pub logical_block: u32,
    pub block_count: u16,
    pub uninitialized: bool,
    pub ok: bool,
}

impl Extent {
    #[must_use]
    pub fn bad(logical_block: u32) -> Self {
        Self {
            physical_block: 0,
            logical_block,
            block_count: 0,
            uninitialized: false,
            ok: false,
        }
    }
}

/// Bytes backing one tree node: the inode-resident root or a cached block.
enum NodeBytes {
    Root { bytes: [u8; 60], ok: bool },
    Block(CachedBytes),
}

impl NodeBytes {
    fn len(&self) -> usize {
        match self {
            Self::Root { bytes, .. } => bytes.len(),
            Self::Block(view) => view.len(),
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Root { bytes, .. } => bytes,
            Self::Block(view) => view.as_slice(),
        }
    }

    /// Whether `len` bytes at `offset` are present and readable.
    fn range_ok(&self, image: &Ext4Image, offset: usize, len: usize) -> bool {
        if offset + len > self.len() {
            return false;
        }
        match self {
            Self::Root { ok, .. } => *ok,
            Self::Block(view) => {
                let abs = view.abs_offset().0 + offset as u64;
                image.damage().all_good(abs, abs + len as u64)
            }
        }
    }
}

struct NodeFrame {
    node: NodeBytes,
    entries: u16,
    depth: u16,
    next: u16,
}

/// Single-pass iterator over the extents of one inode.
pub struct ExtentRange<'a> {
    image: &'a Ext4Image,
    stack: Vec<NodeFrame>,
    /// One queued bad extent (root damage discovered at construction, or a
    /// subtree abandoned mid-descent).
    pending_bad: bool,
    last_logical_end: u32,
    tree_blocks: Vec<u64>,
    root_ok: bool,
}

impl<'a> ExtentRange<'a> {
    /// Build the range from an inode's i_block bytes.
    ///
    /// `inode_ok` is the readability of the inode the root lives in; a
    /// root that is unreadable, lacks the extent magic, or belongs to an
    /// inode without the extents flag yields exactly one bad extent.
    pub(crate) fn new(
        image: &'a Ext4Image,
        root: [u8; 60],
        inode_ok: bool,
        uses_extents: bool,
    ) -> Self {
        let mut range = Self {
            image,
            stack: Vec::new(),
            pending_bad: false,
            last_logical_end: 0,
            tree_blocks: Vec::new(),
            root_ok: false,
        };

        let header = ExtentHeader::decode(&root[..ExtentHeader::SIZE]);
        let max_fit = (root.len() - ExtentHeader::SIZE) / ExtentLeaf::SIZE;
        if !inode_ok
            || !uses_extents
            || !header.magic_ok()
            || usize::from(header.entries) > max_fit
            || usize::from(header.depth) > MAX_EXTENT_DEPTH
        {
            range.pending_bad = true;
            return range;
        }

        range.root_ok = true;
        range.stack.push(NodeFrame {
            node: NodeBytes::Root {
                bytes: root,
                ok: inode_ok,
            },
            entries: header.entries,
            depth: header.depth,
            next: 0,
        });
        range
    }

    /// Whether the root header was intact (feeds `block_map_ok`).
    #[must_use]
    pub fn root_ok(&self) -> bool {
        self.root_ok
    }

    /// Block numbers of every tree node entered below the root.
    #[must_use]
    pub fn tree_block_nums(&self) -> &[u64] {
        &self.tree_blocks
    }

    /// Descend into the child node named by an index entry.
    ///
    /// Returns `false` when the child's header is unusable; the caller
    /// then yields one bad extent for the abandoned subtree.
    fn descend(&mut self, child_block: u64, parent_depth: u16) -> bool {
        self.tree_blocks.push(child_block);

        if self.stack.len() > MAX_EXTENT_DEPTH {
            return false;
        }

        let Ok(view) = self.image.cache().request(BlockNumber(child_block), 0) else {
            return false;
        };
        let node = NodeBytes::Block(view);
        if !node.range_ok(self.image, 0, ExtentHeader::SIZE) {
            return false;
        }

        let header = ExtentHeader::decode(&node.bytes()[..ExtentHeader::SIZE]);
        let max_fit = (node.len() - ExtentHeader::SIZE) / ExtentLeaf::SIZE;
        if !header.magic_ok()
            || usize::from(header.entries) > max_fit
            || usize::from(header.depth) + 1 != usize::from(parent_depth)
        {
            trace!(
                target: "e4s::extent",
                block = child_block,
                magic = header.magic,
                depth = header.depth,
                "abandoning extent subtree with bad header"
            );
            return false;
        }

        self.stack.push(NodeFrame {
            node,
            entries: header.entries,
            depth: header.depth,
            next: 0,
        });
        true
    }
}

impl Iterator for ExtentRange<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        loop {
            if self.pending_bad {
                self.pending_bad = false;
                return Some(Extent::bad(self.last_logical_end));
            }

            let frame = self.stack.last_mut()?;
            if frame.next >= frame.entries {
                self.stack.pop();
                continue;
            }

            let index = usize::from(frame.next);
            frame.next += 1;
            let offset = ExtentHeader::SIZE + index * ExtentLeaf::SIZE;
            let depth = frame.depth;

            if depth == 0 {
                if !frame.node.range_ok(self.image, offset, ExtentLeaf::SIZE) {
                    return Some(Extent::bad(self.last_logical_end));
                }
                let leaf = ExtentLeaf::decode(&frame.node.bytes()[offset..offset + ExtentLeaf::SIZE]);
                let count = leaf.actual_len();
                self.last_logical_end = leaf.logical_block.saturating_add(u32::from(count));
                return Some(Extent {
                    physical_block: leaf.physical_start,
                    logical_block: leaf.logical_block,
                    block_count: count,
                    uninitialized: leaf.is_uninitialized(),
                    ok: true,
                });
            }

            // Index level: a bad entry is skipped; a bad child subtree is
            // reported once and abandoned.
            if !frame.node.range_ok(self.image, offset, ExtentIndex::SIZE) {
                continue;
            }
            let idx = ExtentIndex::decode(&frame.node.bytes()[offset..offset + ExtentIndex::SIZE]);
            if !self.descend(idx.leaf_block, depth) {
                return Some(Extent::bad(self.last_logical_end));
            }
        }
    }
}
