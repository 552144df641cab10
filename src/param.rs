//! System-wide constants.

/// Size of one block-device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the file-system buffer cache, in sectors.
pub const NBUF: usize = 64;

/// Ticks between scheduled write-backs of the buffer cache.
pub const CACHE_FLUSH_TICKS: u64 = 10_000;

/// Number of sector slots in one on-disk inode.
pub const INODE_FANOUT: usize = 124;

/// Identifies an on-disk inode.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Maximum length of a file-name component, in bytes.
pub const NAME_MAX: usize = 14;

/// Entries pre-allocated for a newly created directory.
pub const DIR_INIT_ENTRIES: usize = 16;

/// Sector holding the free-sector map.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Size of one user page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per user page on the swap partition.
pub const PAGE_SECTORS: usize = PGSIZE / SECTOR_SIZE;

/// Maximum page slots tracked on the swap partition.
pub const NSWAP: usize = 1024;

/// Open files per process.
pub const NOFILE: usize = 128;

/// Memory mappings per process.
pub const NMMAP: usize = 64;

/// Lowest file descriptor handed to user code (0 and 1 stay reserved for
/// the console).
pub const FD_BASE: usize = 2;

/// First byte above user virtual memory.
pub const USER_TOP: usize = 0xc000_0000;

/// Span of the user stack region, growing down from `USER_TOP`.
pub const USER_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Lowest byte of the user stack region.
pub const USER_STACK_BOTTOM: usize = USER_TOP - USER_STACK_SIZE;

/// Round `addr` down to the nearest page base.
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Round `addr` up to the nearest page boundary.
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

/// Offset of `addr` within its page.
pub const fn pg_ofs(addr: usize) -> usize {
    addr & (PGSIZE - 1)
}
