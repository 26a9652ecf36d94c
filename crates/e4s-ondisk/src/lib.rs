#![forbid(unsafe_code)]
//! Decoders for the ext2/3/4 on-disk format.
//!
//! Field offsets and semantics follow the kernel's layout documentation
//! for `ext4_super_block`, `ext4_group_desc`, `ext4_inode`,
//! `ext4_extent_header` / `ext4_extent` / `ext4_extent_idx`, and
//! `ext4_dir_entry_2`. Everything on disk is little-endian; every
//! multi-byte field is decoded explicitly from bytes at its documented
//! offset, so the decoders behave identically on any host.
//!
//! Decoding never validates beyond structural bounds: whether the decoded
//! bytes were actually readable is the caller's concern (readability flags
//! travel on views, not on these records).

use e4s_types::{
    ensure_slice, ext4_block_size_from_log, read_fixed, read_le_u16, read_le_u32, trim_nul_padded,
    OnDisk, ParseError, EXT4_EXTENTS_FL, EXT4_FEATURE_INCOMPAT_64BIT,
    EXT4_FEATURE_RO_COMPAT_HUGE_FILE, EXT4_HUGE_FILE_FL, EXT4_SUPERBLOCK_SIZE, EXT4_SUPER_MAGIC,
    S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub desc_size: u16,

    pub magic: u16,
    pub rev_level: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,

    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
}

impl Ext4Superblock {
    /// Parse a superblock from its 1024-byte on-disk region.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT4_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT4_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT4_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT4_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let blocks_lo = u64::from(read_le_u32(region, 0x04)?);
        let blocks_hi = u64::from(read_le_u32(region, 0x150)?);

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext4_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: blocks_lo | (blocks_hi << 32),
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            first_ino: read_le_u32(region, 0x54)?,
            desc_size: read_le_u16(region, 0xFE)?,

            magic,
            rev_level: read_le_u32(region, 0x4C)?,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,
        })
    }

    #[must_use]
    pub fn has_incompat(&self, mask: u32) -> bool {
        (self.feature_incompat & mask) != 0
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: u32) -> bool {
        (self.feature_ro_compat & mask) != 0
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.has_incompat(EXT4_FEATURE_INCOMPAT_64BIT)
    }

    /// ro_compat `huge_file`: i_blocks may exceed 32 bits and may be
    /// counted in filesystem blocks.
    #[must_use]
    pub fn has_huge_file(&self) -> bool {
        self.has_ro_compat(EXT4_FEATURE_RO_COMPAT_HUGE_FILE)
    }

    /// Size of one group descriptor (live `s_desc_size` only with 64bit).
    #[must_use]
    pub fn group_desc_size(&self) -> u16 {
        if self.is_64bit() {
            self.desc_size.max(32)
        } else {
            32
        }
    }

    /// Basic geometry checks; a superblock that fails these is unusable.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inode_size < 128 || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        Ok(())
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4GroupDesc {
    pub block_bitmap: u64,
    pub inode_bitmap: u64,
    pub inode_table: u64,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub used_dirs_count: u32,
    pub flags: u16,
}

impl Ext4GroupDesc {
    /// Parse one descriptor; `desc_size` selects the 32- or 64-byte layout.
    pub fn parse(bytes: &[u8], desc_size: u16) -> Result<Self, ParseError> {
        let desc_size = usize::from(desc_size);
        if desc_size < 32 {
            return Err(ParseError::InvalidField {
                field: "s_desc_size",
                reason: "descriptor size must be >= 32",
            });
        }
        if bytes.len() < desc_size {
            return Err(ParseError::InsufficientData {
                needed: desc_size,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let block_bitmap_lo = u64::from(read_le_u32(bytes, 0x00)?);
        let inode_bitmap_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let inode_table_lo = u64::from(read_le_u32(bytes, 0x08)?);
        let free_blocks_lo = u32::from(read_le_u16(bytes, 0x0C)?);
        let free_inodes_lo = u32::from(read_le_u16(bytes, 0x0E)?);
        let used_dirs_lo = u32::from(read_le_u16(bytes, 0x10)?);
        let flags = read_le_u16(bytes, 0x12)?;

        if desc_size >= 64 {
            let block_bitmap_hi = u64::from(read_le_u32(bytes, 0x20)?);
            let inode_bitmap_hi = u64::from(read_le_u32(bytes, 0x24)?);
            let inode_table_hi = u64::from(read_le_u32(bytes, 0x28)?);
            let free_blocks_hi = u32::from(read_le_u16(bytes, 0x2C)?);
            let free_inodes_hi = u32::from(read_le_u16(bytes, 0x2E)?);
            let used_dirs_hi = u32::from(read_le_u16(bytes, 0x30)?);

            Ok(Self {
                block_bitmap: block_bitmap_lo | (block_bitmap_hi << 32),
                inode_bitmap: inode_bitmap_lo | (inode_bitmap_hi << 32),
                inode_table: inode_table_lo | (inode_table_hi << 32),
                free_blocks_count: free_blocks_lo | (free_blocks_hi << 16),
                free_inodes_count: free_inodes_lo | (free_inodes_hi << 16),
                used_dirs_count: used_dirs_lo | (used_dirs_hi << 16),
                flags,
            })
        } else {
            Ok(Self {
                block_bitmap: block_bitmap_lo,
                inode_bitmap: inode_bitmap_lo,
                inode_table: inode_table_lo,
                free_blocks_count: free_blocks_lo,
                free_inodes_count: free_inodes_lo,
                used_dirs_count: used_dirs_lo,
                flags,
            })
        }
    }
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// File kind derived from the inode mode.
///
/// Kinds other than directory, regular file, and symlink are lumped into
/// `Other` and skipped by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Directory,
    Regular,
    Symlink,
    Other,
}

impl FileKind {
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFREG => Self::Regular,
            S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext4Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size_lo: u32,
    pub size_hi: u32,
    pub links_count: u16,
    pub blocks_lo: u32,
    pub blocks_hi: u16,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u64,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// The 60-byte i_block area: extent tree root or fast-symlink target.
    pub block: [u8; 60],
}

impl Ext4Inode {
    /// Parse an inode from raw bytes (at least the 128-byte base).
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 128 {
            return Err(ParseError::InsufficientData {
                needed: 128,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let blocks_hi = read_le_u16(bytes, 0x74)?;
        let file_acl_lo = u64::from(read_le_u32(bytes, 0x68)?);
        let file_acl_hi = u64::from(read_le_u16(bytes, 0x76)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size_lo: read_le_u32(bytes, 0x04)?,
            size_hi: read_le_u32(bytes, 0x6C)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks_lo: read_le_u32(bytes, 0x1C)?,
            blocks_hi,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: file_acl_lo | (file_acl_hi << 32),

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,

            block: read_fixed::<60>(bytes, 0x28)?,
        })
    }

    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Logical size in bytes.
    ///
    /// Only regular files use the 64-bit size; for everything else the
    /// high half overlays other fields and must be ignored.
    #[must_use]
    pub fn size(&self) -> u64 {
        if self.kind() == FileKind::Regular {
            u64::from(self.size_lo) | (u64::from(self.size_hi) << 32)
        } else {
            u64::from(self.size_lo)
        }
    }

    #[must_use]
    pub fn is_huge_file(&self) -> bool {
        (self.flags & EXT4_HUGE_FILE_FL) != 0
    }

    #[must_use]
    pub fn uses_extents(&self) -> bool {
        (self.flags & EXT4_EXTENTS_FL) != 0
    }

    /// Block count normalized to 512-byte sectors.
    ///
    /// Without the superblock's `huge_file` ro_compat feature only the low
    /// 32 bits are live. With it, the high 16 bits join in, and an inode
    /// carrying the `HUGE_FILE` flag counts filesystem blocks instead of
    /// sectors and must be scaled by `2^(1 + s_log_block_size)`.
    #[must_use]
    pub fn sector_count(&self, sb_has_huge_file: bool, log_block_size: u32) -> u64 {
        if !sb_has_huge_file {
            return u64::from(self.blocks_lo);
        }
        let raw = u64::from(self.blocks_lo) | (u64::from(self.blocks_hi) << 32);
        if self.is_huge_file() {
            raw << (1 + log_block_size)
        } else {
            raw
        }
    }

    /// Whether this symlink stores its target inside the inode.
    ///
    /// A fast symlink occupies no data blocks; an xattr block (signalled
    /// by a nonzero `i_file_acl`) must be discounted first.
    #[must_use]
    pub fn is_fast_symlink(&self, sb_has_huge_file: bool, log_block_size: u32, block_size: u32) -> bool {
        if self.kind() != FileKind::Symlink {
            return false;
        }
        let mut sectors = self.sector_count(sb_has_huge_file, log_block_size);
        if self.file_acl != 0 {
            sectors = sectors.saturating_sub(u64::from(block_size) / 512);
        }
        sectors == 0
    }

    /// Fast-symlink target bytes (the i_block area truncated to `size`).
    #[must_use]
    pub fn fast_symlink_target(&self) -> &[u8] {
        let len = (self.size_lo as usize).min(self.block.len());
        &self.block[..len]
    }
}

// ── Extent tree records ─────────────────────────────────────────────────────

/// Bit 15 set in the raw length marks an uninitialized extent.
pub const EXT_INIT_MAX_LEN: u16 = 1_u16 << 15;

/// Extent tree node header (12 bytes, magic 0xF30A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
    pub generation: u32,
}

impl OnDisk for ExtentHeader {
    const SIZE: usize = 12;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            magic: u16::from_le_bytes([bytes[0], bytes[1]]),
            entries: u16::from_le_bytes([bytes[2], bytes[3]]),
            max_entries: u16::from_le_bytes([bytes[4], bytes[5]]),
            depth: u16::from_le_bytes([bytes[6], bytes[7]]),
            generation: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

impl ExtentHeader {
    #[must_use]
    pub fn magic_ok(&self) -> bool {
        self.magic == e4s_types::EXT4_EXTENT_MAGIC
    }
}

/// Leaf entry: a contiguous logical-to-physical mapping (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLeaf {
    pub logical_block: u32,
    pub raw_len: u16,
    pub physical_start: u64,
}

impl OnDisk for ExtentLeaf {
    const SIZE: usize = 12;

    fn decode(bytes: &[u8]) -> Self {
        let start_hi = u64::from(u16::from_le_bytes([bytes[6], bytes[7]]));
        let start_lo = u64::from(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]));
        Self {
            logical_block: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            raw_len: u16::from_le_bytes([bytes[4], bytes[5]]),
            physical_start: start_lo | (start_hi << 32),
        }
    }
}

impl ExtentLeaf {
    #[must_use]
    pub fn is_uninitialized(self) -> bool {
        self.raw_len > EXT_INIT_MAX_LEN
    }

    /// Effective block count (raw minus the uninitialized marker bit).
    #[must_use]
    pub fn actual_len(self) -> u16 {
        if self.raw_len <= EXT_INIT_MAX_LEN {
            self.raw_len
        } else {
            self.raw_len - EXT_INIT_MAX_LEN
        }
    }
}

/// Index entry: pointer to a child tree node (12 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub leaf_block: u64,
}

impl OnDisk for ExtentIndex {
    const SIZE: usize = 12;

    fn decode(bytes: &[u8]) -> Self {
        let leaf_lo = u64::from(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
        let leaf_hi = u64::from(u16::from_le_bytes([bytes[8], bytes[9]]));
        Self {
            logical_block: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            leaf_block: leaf_lo | (leaf_hi << 32),
        }
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// File type tags stored in `ext4_dir_entry_2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DirEntryKind {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl DirEntryKind {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// One decoded `ext4_dir_entry_2` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext4DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: DirEntryKind,
    pub name: Vec<u8>,
}

impl Ext4DirEntry {
    /// Parse the entry starting at `offset` within a directory block.
    ///
    /// Validates only structure (header fits, name fits inside `rec_len`
    /// and the block); an entry with `inode == 0` is an unused slot the
    /// caller should skip while still advancing by `rec_len`.
    pub fn parse_at(block: &[u8], offset: usize) -> Result<Self, ParseError> {
        let header = ensure_slice(block, offset, 8)?;
        let inode = read_le_u32(header, 0)?;
        let rec_len = read_le_u16(header, 4)?;
        let name_len = header[6];
        let file_type = DirEntryKind::from_raw(header[7]);

        if rec_len < 8 || usize::from(rec_len) % 4 != 0 {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "rec_len must be a multiple of 4 and >= 8",
            });
        }
        let entry_end = offset
            .checked_add(usize::from(rec_len))
            .ok_or(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "overflow",
            })?;
        if entry_end > block.len() {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "entry extends past block boundary",
            });
        }
        let name_end = offset + 8 + usize::from(name_len);
        if name_end > entry_end {
            return Err(ParseError::InvalidField {
                field: "de_name_len",
                reason: "name extends past rec_len",
            });
        }

        Ok(Self {
            inode,
            rec_len,
            name_len,
            file_type,
            name: block[offset + 8..name_end].to_vec(),
        })
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}
