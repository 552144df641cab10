//! Inodes.
//!
//! An inode describes a single file or directory. The on-disk structure
//! occupies exactly one sector: a byte length, the depth of its block tree,
//! a directory flag, `INODE_FANOUT` sector slots, and a magic number.
//!
//! At depth 0 every slot points at a data sector. At depth `d > 0` every
//! slot points at a sector holding another inode structure of depth `d - 1`,
//! so one slot covers `INODE_FANOUT^d` sectors of data and capacity grows
//! geometrically with depth.
//!
//! The kernel keeps a table of open inodes so that opening the same sector
//! twice returns the same `Inode`. The table entry carries bookkeeping that
//! never reaches the disk: the open count, the deferred-removal flag, and
//! the deny-write count. An inode marked removed keeps serving reads and
//! writes while open; the last close releases its entire tree of data and
//! index sectors back to the free map.
//!
//! Byte-level reads never extend a file; short reads happen only at end of
//! file. Byte-level writes extend the file as needed, zero-filling any hole
//! between the old length and the write offset, so holes read as zero.

use core::convert::TryFrom;
use core::mem;

use spin::Mutex;
use static_assertions::const_assert_eq;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::fs::freemap::FreeMap;
use crate::param::{INODE_FANOUT, INODE_MAGIC, SECTOR_SIZE};
use crate::{trace, Error};

/// On-disk inode structure. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    /// Byte length of the content. Non-negative.
    length: i32,
    /// Depth of the block tree. 0 means `blocks` holds data sectors.
    depth: u32,
    /// Directory flag.
    is_dir: u32,
    /// Data or index sectors, depending on `depth`.
    blocks: [u32; INODE_FANOUT],
    magic: u32,
}

const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// Sectors needed for `size` bytes of data.
fn bytes_to_sectors(size: u32) -> u64 {
    div_ceil(size as u64, SECTOR_SIZE as u64)
}

/// Minimum tree depth able to hold `size` bytes.
fn bytes_to_depth(size: u32) -> u32 {
    let mut sectors = bytes_to_sectors(size);
    let mut depth = 0;
    while sectors > INODE_FANOUT as u64 {
        sectors = div_ceil(sectors, INODE_FANOUT as u64);
        depth += 1;
    }
    depth
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

impl DiskInode {
    const fn zeroed() -> Self {
        Self {
            length: 0,
            depth: 0,
            is_dir: 0,
            blocks: [0; INODE_FANOUT],
            magic: 0,
        }
    }

    fn len(&self) -> u32 {
        debug_assert!(self.length >= 0);
        self.length as u32
    }

    /// Sectors covered by one slot at this depth.
    fn block_sectors(&self) -> u64 {
        (INODE_FANOUT as u64).pow(self.depth)
    }

    /// Bytes covered by one slot at this depth.
    fn max_block_size(&self) -> u64 {
        self.block_sectors() * SECTOR_SIZE as u64
    }

    /// Slots currently backing data.
    fn blocks_in_use(&self) -> u64 {
        div_ceil(self.len() as u64, self.max_block_size())
    }

    /// Bytes of data stored under slot `pos`. Slots before the last full one
    /// report the full span; the caller bounds the result by the remaining
    /// length anyway.
    fn block_size(&self, pos: u64) -> u64 {
        let max = self.max_block_size();
        let full_blocks = self.len() as u64 / max;
        if pos <= full_blocks {
            max
        } else if pos == full_blocks + 1 {
            self.len() as u64 % max
        } else {
            0
        }
    }
}

fn read_disk_inode(cache: &Bcache, sector: u32) -> DiskInode {
    let mut dinode = DiskInode::zeroed();
    cache.read(sector, dinode.as_bytes_mut());
    dinode
}

/// Writes an empty inode of the given depth to `sector`.
fn create_empty(cache: &Bcache, sector: u32, depth: u32, is_dir: bool) {
    let mut dinode = DiskInode::zeroed();
    dinode.depth = depth;
    dinode.is_dir = is_dir as u32;
    dinode.magic = INODE_MAGIC;
    cache.write(sector, dinode.as_bytes());
}

/// Sector containing byte `pos` of a depth-0 inode, or `None` past the end.
fn byte_to_sector_direct(dinode: &DiskInode, pos: u64) -> Option<u32> {
    debug_assert_eq!(dinode.depth, 0);
    if pos < dinode.len() as u64 {
        Some(dinode.blocks[pos as usize / SECTOR_SIZE])
    } else {
        None
    }
}

/// Grows a depth-0 inode to `size` bytes, allocating data sectors one at a
/// time. On allocation failure only the sectors taken by this call are
/// rolled back. When `zero` is set, new sectors are written with zeros.
fn grow_length_direct(
    cache: &Bcache,
    freemap: &FreeMap,
    dinode: &mut DiskInode,
    size: u32,
    zero: bool,
) -> bool {
    debug_assert_eq!(dinode.depth, 0);

    if size < dinode.len() {
        return false;
    }
    if size == dinode.len() {
        return true;
    }

    let old_sectors = bytes_to_sectors(dinode.len());
    let new_sectors = bytes_to_sectors(size);
    if new_sectors > INODE_FANOUT as u64 {
        return false;
    }

    let mut taken = old_sectors;
    while taken < new_sectors {
        match freemap.allocate() {
            Some(sector) => dinode.blocks[taken as usize] = sector,
            None => break,
        }
        if zero {
            let zeros = [0; SECTOR_SIZE];
            cache.write(dinode.blocks[taken as usize], &zeros);
        }
        taken += 1;
    }

    if taken != new_sectors {
        for i in old_sectors..taken {
            freemap.release(dinode.blocks[i as usize]);
        }
        return false;
    }

    dinode.length = size as i32;
    true
}

/// Grows the inode stored at `sector` to `length` bytes. The updated image
/// is written back even on failure, so partial growth stays valid.
fn sector_grow_length(
    cache: &Bcache,
    freemap: &FreeMap,
    sector: u32,
    length: u32,
    zero: bool,
) -> bool {
    let mut dinode = read_disk_inode(cache, sector);
    let grown = grow_length(cache, freemap, &mut dinode, length, zero);
    cache.write(sector, dinode.as_bytes());
    grown
}

/// Grows `dinode` to `length` bytes. The last partially-filled child is
/// grown to its span first, then fresh children are allocated as empty
/// inodes of one less depth and grown in turn. A child allocated by the
/// failing step is released; completed children are kept, leaving the inode
/// valid but short.
fn grow_length(
    cache: &Bcache,
    freemap: &FreeMap,
    dinode: &mut DiskInode,
    length: u32,
    zero: bool,
) -> bool {
    if dinode.depth == 0 {
        return grow_length_direct(cache, freemap, dinode, length, zero);
    }
    if length < dinode.len() {
        return false;
    }
    if length == dinode.len() {
        return true;
    }

    let max = dinode.max_block_size();
    let mut to_grow = length as u64 - dinode.len() as u64;
    let mut last_allocated = false;
    let mut block_index = 0;

    while dinode.len() != length {
        block_index = (dinode.len() as u64 / max) as usize;
        let block_length = dinode.len() as u64 % max;

        let new_block_length = (block_length + to_grow).min(max);

        // A zero-length child has no sector yet; allocate one and seed it
        // with an empty inode of one less depth.
        if block_length == 0 {
            match freemap.allocate() {
                Some(sector) => dinode.blocks[block_index] = sector,
                None => break,
            }
            last_allocated = true;
            create_empty(cache, dinode.blocks[block_index], dinode.depth - 1, false);
        }

        if !sector_grow_length(
            cache,
            freemap,
            dinode.blocks[block_index],
            new_block_length as u32,
            zero,
        ) {
            break;
        }

        dinode.length += (new_block_length - block_length) as i32;
        to_grow = length as u64 - dinode.len() as u64;
        last_allocated = false;
    }

    if last_allocated {
        freemap.release(dinode.blocks[block_index]);
    }

    dinode.len() == length
}

/// Releases every data and index sector reachable from `dinode`.
fn remove_disk(cache: &Bcache, freemap: &FreeMap, dinode: &DiskInode) {
    if dinode.depth == 0 {
        for i in 0..bytes_to_sectors(dinode.len()) {
            freemap.release(dinode.blocks[i as usize]);
        }
        return;
    }
    for i in 0..dinode.blocks_in_use() {
        let child = read_disk_inode(cache, dinode.blocks[i as usize]);
        freemap.release(dinode.blocks[i as usize]);
        remove_disk(cache, freemap, &child);
    }
}

fn read_at_direct(cache: &Bcache, dinode: &DiskInode, buf: &mut [u8], offset: u32) -> usize {
    debug_assert_eq!(dinode.depth, 0);

    let mut offset = offset as u64;
    let mut size = buf.len();
    let mut done = 0;

    while size > 0 {
        let inode_left = dinode.len() as i64 - offset as i64;
        let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;
        let sector_left = (SECTOR_SIZE - sector_ofs) as i64;
        let chunk = (size as i64).min(inode_left).min(sector_left);
        if chunk <= 0 {
            break;
        }
        let chunk = chunk as usize;

        let sector = byte_to_sector_direct(dinode, offset).expect("read_at_direct");
        if sector_ofs == 0 && chunk == SECTOR_SIZE {
            cache.read(sector, &mut buf[done..done + SECTOR_SIZE]);
        } else {
            cache.read_bytes(sector, sector_ofs, &mut buf[done..done + chunk]);
        }

        size -= chunk;
        offset += chunk as u64;
        done += chunk;
    }

    done
}

fn read_at_disk(cache: &Bcache, dinode: &DiskInode, buf: &mut [u8], offset: u32) -> usize {
    if dinode.depth == 0 {
        return read_at_direct(cache, dinode, buf, offset);
    }

    let max = dinode.max_block_size();
    let mut offset = offset as u64;
    let mut size = buf.len();
    let mut done = 0;

    while size > 0 {
        let block_index = offset / max;
        let block_offset = offset % max;
        assert!(
            block_index < dinode.blocks_in_use(),
            "read_at_disk: block index out of range"
        );

        let inode_left = dinode.len() as i64 - offset as i64;
        let block_left = dinode.block_size(block_index) as i64 - block_offset as i64;
        let chunk = (size as i64).min(inode_left).min(block_left);
        if chunk <= 0 {
            break;
        }

        let child = read_disk_inode(cache, dinode.blocks[block_index as usize]);
        let n = read_at_disk(
            cache,
            &child,
            &mut buf[done..done + chunk as usize],
            block_offset as u32,
        );
        if n == 0 {
            break;
        }

        size -= n;
        offset += n as u64;
        done += n;
    }

    done
}

fn write_at_direct(cache: &Bcache, dinode: &DiskInode, buf: &[u8], offset: u32) -> usize {
    debug_assert_eq!(dinode.depth, 0);

    let mut offset = offset as u64;
    let mut size = buf.len();
    let mut done = 0;

    while size > 0 {
        let sector = match byte_to_sector_direct(dinode, offset) {
            Some(sector) => sector,
            None => break,
        };
        let sector_ofs = (offset % SECTOR_SIZE as u64) as usize;

        let inode_left = dinode.len() as i64 - offset as i64;
        let sector_left = (SECTOR_SIZE - sector_ofs) as i64;
        let chunk = (size as i64).min(inode_left).min(sector_left);
        if chunk <= 0 {
            break;
        }
        let chunk = chunk as usize;

        if sector_ofs == 0 && chunk == SECTOR_SIZE {
            cache.write(sector, &buf[done..done + SECTOR_SIZE]);
        } else {
            cache.write_bytes(sector, sector_ofs, &buf[done..done + chunk]);
        }

        size -= chunk;
        offset += chunk as u64;
        done += chunk;
    }

    done
}

fn write_at_disk(cache: &Bcache, dinode: &DiskInode, buf: &[u8], offset: u32) -> usize {
    if dinode.depth == 0 {
        return write_at_direct(cache, dinode, buf, offset);
    }

    let max = dinode.max_block_size();
    let mut offset = offset as u64;
    let mut size = buf.len();
    let mut done = 0;

    while size > 0 {
        let block_index = offset / max;
        let block_offset = offset % max;
        if block_index >= dinode.blocks_in_use() {
            break;
        }

        let inode_left = dinode.len() as i64 - offset as i64;
        let block_left = dinode.block_size(block_index) as i64 - block_offset as i64;
        if (size as i64).min(inode_left).min(block_left) <= 0 {
            break;
        }
        let chunk = size.min(max as usize);

        let child = read_disk_inode(cache, dinode.blocks[block_index as usize]);
        let n = write_at_disk(
            cache,
            &child,
            &buf[done..done + chunk],
            block_offset as u32,
        );
        if n == 0 {
            break;
        }

        size -= n;
        offset += n as u64;
        done += n;
    }

    done
}

/// Promotes the tree height of `data`, stored at `sector`, to `depth`.
///
/// The existing root image moves to a freshly allocated sector and becomes
/// slot 0 of a new root one level taller, repeated until the target depth.
/// Allocation failure keeps the promotions already made.
fn grow_depth(
    cache: &Bcache,
    freemap: &FreeMap,
    data: &mut DiskInode,
    sector: u32,
    depth: u32,
) -> bool {
    if data.depth > depth {
        return false;
    }
    if data.depth == depth {
        return true;
    }

    let mut image = *data;

    let child = match freemap.allocate() {
        Some(child) => child,
        None => return false,
    };
    cache.write(child, image.as_bytes());

    image.blocks = [0; INODE_FANOUT];
    image.depth += 1;
    image.blocks[0] = child;

    while image.depth < depth {
        let child = match freemap.allocate() {
            Some(child) => child,
            None => return false,
        };
        cache.write(child, image.as_bytes());
        image.depth += 1;
        image.blocks[0] = child;
    }

    *data = image;
    cache.write(sector, data.as_bytes());
    true
}

/// In-memory inode. At most one exists per disk sector; see [`Itable`].
pub struct Inode {
    sector: u32,
    cache: Arc<Bcache>,
    freemap: Arc<FreeMap>,
    inner: Mutex<InodeInner>,
}

struct InodeInner {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
    /// Copy of the disk image.
    data: DiskInode,
}

/// A shared reference to an open inode. Must be returned to the table with
/// [`Itable::close`]; the table keeps its own reference, so dropping one of
/// these never deallocates behind the table's back.
pub type RcInode = Arc<Inode>;

impl Inode {
    /// The sector holding this inode's disk image; doubles as its number.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    pub fn len(&self) -> u32 {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dir(&self) -> bool {
        self.inner.lock().data.is_dir != 0
    }

    pub fn depth(&self) -> u32 {
        self.inner.lock().data.depth
    }

    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Registers another opener. The table entry is shared, so this only
    /// bumps the count.
    pub fn reopen(self: &Arc<Self>) -> RcInode {
        self.inner.lock().open_count += 1;
        Arc::clone(self)
    }

    /// Marks the inode for deletion once the last opener closes it.
    pub fn remove(&self) {
        self.inner.lock().removed = true;
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut inner = self.inner.lock();
        inner.deny_write_count += 1;
        assert!(inner.deny_write_count <= inner.open_count);
    }

    /// Re-enables writes. Must pair with an earlier `deny_write` by the same
    /// opener, before it closes the inode.
    pub fn allow_write(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.deny_write_count > 0);
        inner.deny_write_count -= 1;
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, short only at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let inner = self.inner.lock();
        read_at_disk(&self.cache, &inner.data, buf, offset)
    }

    /// Writes `buf` starting at byte `offset`, extending the inode as
    /// needed. A hole between the old length and `offset` is zero-filled.
    /// Returns the number of bytes written: 0 if writes are denied or
    /// extension failed, possibly short if space ran out mid-write.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        let mut inner = self.inner.lock();
        if inner.deny_write_count > 0 {
            return 0;
        }

        let new_length = offset as u64 + buf.len() as u64;
        let new_length = match u32::try_from(new_length) {
            Ok(len) if len <= i32::MAX as u32 => len,
            _ => return 0,
        };

        let depth = bytes_to_depth(new_length);
        if inner.data.depth < depth
            && !grow_depth(&self.cache, &self.freemap, &mut inner.data, self.sector, depth)
        {
            return 0;
        }

        // Zero-fill up to the write offset so the hole reads as zero, then
        // extend bare to the end of the write; the data below covers it.
        if inner.data.len() < offset && !self.grow(&mut inner.data, offset, true) {
            return 0;
        }
        if inner.data.len() < new_length && !self.grow(&mut inner.data, new_length, false) {
            return 0;
        }

        write_at_disk(&self.cache, &inner.data, buf, offset)
    }

    fn grow(&self, data: &mut DiskInode, length: u32, zero: bool) -> bool {
        let grown = grow_length(&self.cache, &self.freemap, data, length, zero);
        self.cache.write(self.sector, data.as_bytes());
        grown
    }
}

/// Table of open inodes, keyed by disk sector.
pub struct Itable {
    cache: Arc<Bcache>,
    freemap: Arc<FreeMap>,
    open: Mutex<Vec<RcInode>>,
}

impl Itable {
    pub fn new(cache: Arc<Bcache>, freemap: Arc<FreeMap>) -> Self {
        Self {
            cache,
            freemap,
            open: Mutex::new(Vec::new()),
        }
    }

    /// Initializes an inode of `length` bytes at `sector`, zero-filled.
    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> Result<(), Error> {
        create_empty(&self.cache, sector, bytes_to_depth(length), is_dir);
        if !sector_grow_length(&self.cache, &self.freemap, sector, length, true) {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Checks, without opening anything, that `sector` holds a directory
    /// inode. Mounting uses this to verify the root before the first open,
    /// which would panic on a bad image.
    pub fn is_valid_dir(&self, sector: u32) -> bool {
        let data = read_disk_inode(&self.cache, sector);
        data.magic == INODE_MAGIC && data.is_dir != 0 && data.length >= 0
    }

    /// Opens the inode at `sector`, loading it from disk unless it is
    /// already open, in which case the open count is bumped instead.
    pub fn open(&self, sector: u32) -> RcInode {
        let mut open = self.open.lock();
        if let Some(ip) = open.iter().find(|ip| ip.sector == sector) {
            ip.inner.lock().open_count += 1;
            return Arc::clone(ip);
        }

        let data = read_disk_inode(&self.cache, sector);
        assert_eq!(data.magic, INODE_MAGIC, "Itable::open: bad magic");
        let ip = Arc::new(Inode {
            sector,
            cache: Arc::clone(&self.cache),
            freemap: Arc::clone(&self.freemap),
            inner: Mutex::new(InodeInner {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                data,
            }),
        });
        open.push(Arc::clone(&ip));
        ip
    }

    /// Closes one reference to `ip`. The last close of a removed inode
    /// releases its root sector and its whole block tree.
    pub fn close(&self, ip: RcInode) {
        let mut open = self.open.lock();
        let mut inner = ip.inner.lock();
        inner.open_count -= 1;
        if inner.open_count > 0 {
            return;
        }

        open.retain(|other| !Arc::ptr_eq(other, &ip));
        if inner.removed {
            trace!("inode {}: releasing on last close", ip.sector);
            self.freemap.release(ip.sector);
            remove_disk(&self.cache, &self.freemap, &inner.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDisk};
    use crate::param::ROOT_DIR_SECTOR;

    fn setup(sectors: u32) -> (Arc<FreeMap>, Itable) {
        let disk = Arc::new(MemDisk::new(sectors));
        let cache = Arc::new(Bcache::new(disk as Arc<dyn BlockDevice>));
        cache.enable();
        let freemap = Arc::new(FreeMap::format(Arc::clone(&cache), sectors));
        let itable = Itable::new(cache, Arc::clone(&freemap));
        (freemap, itable)
    }

    #[test]
    fn depth_arithmetic() {
        assert_eq!(bytes_to_depth(0), 0);
        assert_eq!(bytes_to_depth(1), 0);
        assert_eq!(bytes_to_depth((INODE_FANOUT * SECTOR_SIZE) as u32), 0);
        assert_eq!(bytes_to_depth((INODE_FANOUT * SECTOR_SIZE) as u32 + 1), 1);
        assert_eq!(
            bytes_to_depth((INODE_FANOUT * INODE_FANOUT * SECTOR_SIZE) as u32),
            1
        );
        assert_eq!(
            bytes_to_depth((INODE_FANOUT * INODE_FANOUT * SECTOR_SIZE) as u32 + 1),
            2
        );
    }

    #[test]
    fn write_read_round_trip() {
        let (freemap, itable) = setup(256);
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();

        let ip = itable.open(sector);
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        assert_eq!(ip.write_at(&data, 0), data.len());
        assert_eq!(ip.len(), 3000);

        let mut out = vec![0u8; 3000];
        assert_eq!(ip.read_at(&mut out, 0), 3000);
        assert_eq!(out, data);
        itable.close(ip);
    }

    #[test]
    fn holes_read_as_zero() {
        let (freemap, itable) = setup(256);
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();

        let ip = itable.open(sector);
        assert_eq!(ip.write_at(&[0xff], 2000), 1);
        assert_eq!(ip.len(), 2001);

        let mut out = vec![0xaau8; 2001];
        assert_eq!(ip.read_at(&mut out, 0), 2001);
        assert!(out[..2000].iter().all(|&b| b == 0));
        assert_eq!(out[2000], 0xff);
        itable.close(ip);
    }

    #[test]
    fn depth_grows_past_direct_capacity() {
        let (freemap, itable) = setup(1024);
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();

        let ip = itable.open(sector);
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(ip.write_at(&data, 0), data.len());
        assert_eq!(ip.depth(), 1);

        let mut out = vec![0u8; data.len()];
        assert_eq!(ip.read_at(&mut out, 0), data.len());
        assert_eq!(out, data);
        itable.close(ip);
    }

    #[test]
    fn removed_inode_serves_until_last_close() {
        let (freemap, itable) = setup(256);
        let used_before = freemap.used();
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 4000, false).unwrap();

        let ip = itable.open(sector);
        let again = ip.reopen();
        ip.remove();

        assert_eq!(ip.write_at(b"still here", 0), 10);
        let mut out = [0u8; 10];
        assert_eq!(again.read_at(&mut out, 0), 10);
        assert_eq!(&out, b"still here");

        itable.close(again);
        let mut out = [0u8; 10];
        assert_eq!(ip.read_at(&mut out, 0), 10);

        itable.close(ip);
        assert_eq!(freemap.used(), used_before);
    }

    #[test]
    fn reopening_a_sector_shares_the_entry() {
        let (freemap, itable) = setup(256);
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();

        let a = itable.open(sector);
        let b = itable.open(sector);
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(sector, ROOT_DIR_SECTOR);
        itable.close(a);
        itable.close(b);
    }

    #[test]
    fn directory_probe_checks_magic_and_flag() {
        let (freemap, itable) = setup(256);
        let dir_sector = freemap.allocate().unwrap();
        itable.create(dir_sector, 0, true).unwrap();
        let file_sector = freemap.allocate().unwrap();
        itable.create(file_sector, 0, false).unwrap();
        let blank = freemap.allocate().unwrap();

        assert!(itable.is_valid_dir(dir_sector));
        assert!(!itable.is_valid_dir(file_sector));
        assert!(!itable.is_valid_dir(blank));
    }

    #[test]
    fn deny_write_blocks_writers() {
        let (freemap, itable) = setup(256);
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();

        let ip = itable.open(sector);
        ip.deny_write();
        assert_eq!(ip.write_at(b"nope", 0), 0);
        ip.allow_write();
        assert_eq!(ip.write_at(b"yes", 0), 3);
        itable.close(ip);
    }
}
