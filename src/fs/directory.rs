//! Directories.
//!
//! A directory is an inode with the `is_dir` flag whose content is a flat
//! array of fixed-size entries. Every directory carries `.` and `..`
//! entries; the root's `..` names the root itself. Lookups are linear scans
//! through the entry array; `add` reuses the first free slot before
//! appending past end of file.

use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::inode::{Inode, Itable, RcInode};
use crate::fs::path::FileName;
use crate::param::{DIR_INIT_ENTRIES, NAME_MAX, ROOT_DIR_SECTOR};
use crate::Error;

/// On-disk directory entry. The layout is part of the file-system format.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    /// Sector of the entry's inode.
    inode_sector: u32,
    /// NUL-terminated name.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

pub(crate) const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();
const_assert_eq!(DIR_ENTRY_SIZE, 20);

const DOT: &str = ".";
const DOTDOT: &str = "..";

impl DirEntry {
    const fn zeroed() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&ch| ch == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &FileName) {
        let bytes = name.as_bytes();
        self.name = [0; NAME_MAX + 1];
        self.name[..bytes.len()].copy_from_slice(bytes);
    }
}

fn read_entry(ip: &Inode, ofs: u32) -> Option<DirEntry> {
    let mut entry = DirEntry::zeroed();
    if ip.read_at(entry.as_bytes_mut(), ofs) == DIR_ENTRY_SIZE {
        Some(entry)
    } else {
        None
    }
}

fn entries(ip: &Inode) -> impl Iterator<Item = (DirEntry, u32)> + '_ {
    (0..ip.len())
        .step_by(DIR_ENTRY_SIZE)
        .map_while(move |ofs| read_entry(ip, ofs).map(|entry| (entry, ofs)))
}

/// Advances `pos` over the entry array of the directory inode `ip`,
/// returning the next in-use name that is not `.`/`..`. Backs `readdir` on
/// both directory handles and directory file descriptors.
pub fn readdir_at(ip: &Inode, pos: &mut u32) -> Option<String> {
    while let Some(entry) = read_entry(ip, *pos) {
        *pos += DIR_ENTRY_SIZE as u32;
        if entry.in_use == 0 {
            continue;
        }
        let name = entry.name_str();
        if name == DOT || name == DOTDOT {
            continue;
        }
        return Some(name.to_string());
    }
    None
}

/// An open directory handle: the backing inode plus a read position owned by
/// this handle, consumed by `readdir`.
pub struct Dir {
    ip: RcInode,
    pos: u32,
}

impl Dir {
    /// Initializes an empty directory inode at `sector`, with room for
    /// `DIR_INIT_ENTRIES` entries before it has to grow.
    pub fn create(itable: &Itable, sector: u32) -> Result<(), Error> {
        itable.create(sector, (DIR_INIT_ENTRIES * DIR_ENTRY_SIZE) as u32, true)
    }

    /// Opens the directory for `ip`, taking ownership of the reference. The
    /// reference is closed on failure.
    pub fn open(itable: &Itable, ip: RcInode) -> Result<Self, Error> {
        if !ip.is_dir() {
            itable.close(ip);
            return Err(Error::NotADirectory);
        }
        Ok(Self { ip, pos: 0 })
    }

    pub fn open_root(itable: &Itable) -> Self {
        Self::open(itable, itable.open(ROOT_DIR_SECTOR)).expect("root is not a directory")
    }

    /// A second handle on the same directory, with its own position.
    pub fn reopen(&self) -> Self {
        Self {
            ip: self.ip.reopen(),
            pos: 0,
        }
    }

    pub fn close(self, itable: &Itable) {
        itable.close(self.ip);
    }

    /// Dissolves the handle into its inode reference without closing it.
    pub fn into_inode(self) -> RcInode {
        self.ip
    }

    pub fn inode(&self) -> &RcInode {
        &self.ip
    }

    pub fn inumber(&self) -> u32 {
        self.ip.inumber()
    }

    /// True if nothing beyond `.` and `..` is in use.
    pub fn is_empty(&self) -> bool {
        entries(&self.ip)
            .filter(|(entry, _)| entry.in_use != 0)
            .all(|(entry, _)| entry.name_str() == DOT || entry.name_str() == DOTDOT)
    }

    fn find(&self, name: &str) -> Option<(DirEntry, u32)> {
        entries(&self.ip).find(|(entry, _)| entry.in_use != 0 && entry.name_str() == name)
    }

    /// Looks `name` up and opens its inode.
    pub fn lookup(&self, itable: &Itable, name: &str) -> Option<RcInode> {
        self.find(name).map(|(entry, _)| itable.open(entry.inode_sector))
    }

    /// Adds an entry binding `name` to the inode at `inode_sector`. The
    /// first free slot is reused; with none free the entry is appended past
    /// end of file, growing the directory.
    pub fn add(&self, name: &FileName, inode_sector: u32) -> Result<(), Error> {
        if self.find(name.as_str()).is_some() {
            return Err(Error::AlreadyExists);
        }

        let ofs = entries(&self.ip)
            .find(|(entry, _)| entry.in_use == 0)
            .map(|(_, ofs)| ofs)
            .unwrap_or_else(|| self.ip.len());

        let mut entry = DirEntry::zeroed();
        entry.in_use = 1;
        entry.inode_sector = inode_sector;
        entry.set_name(name);
        if self.ip.write_at(entry.as_bytes(), ofs) != DIR_ENTRY_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Erases the entry for `name` without touching its inode.
    fn erase(&self, name: &str) -> Result<(), Error> {
        let (mut entry, ofs) = self.find(name).ok_or(Error::NotFound)?;
        entry.in_use = 0;
        if self.ip.write_at(entry.as_bytes(), ofs) != DIR_ENTRY_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Removes the entry for `name` and marks its inode for deletion.
    /// Refuses `.`/`..`, and refuses directories that are not empty.
    pub fn remove(&self, itable: &Itable, name: &str) -> Result<(), Error> {
        if name == DOT || name == DOTDOT {
            return Err(Error::Invalid);
        }
        let (entry, _) = self.find(name).ok_or(Error::NotFound)?;

        let target = itable.open(entry.inode_sector);
        if target.is_dir() {
            let dir = Dir::open(itable, target.reopen())?;
            let empty = dir.is_empty();
            dir.close(itable);
            if !empty {
                itable.close(target);
                return Err(Error::Invalid);
            }
        }

        if let Err(err) = self.erase(name) {
            itable.close(target);
            return Err(err);
        }
        target.remove();
        itable.close(target);
        Ok(())
    }

    /// Yields the next entry name in insertion order, skipping `.`/`..` and
    /// free slots. Advances this handle's position.
    pub fn readdir(&mut self) -> Option<String> {
        readdir_at(&self.ip, &mut self.pos)
    }

    /// Gives `self` its `.` and `..` entries; `parent` is the directory
    /// `..` names. On a half-failure the `.` entry is rolled back.
    pub fn add_dot_entries(&self, parent: &Dir) -> Result<(), Error> {
        let dot = FileName::new(DOT).unwrap();
        let dotdot = FileName::new(DOTDOT).unwrap();

        self.add(dot, self.inumber())?;
        if let Err(err) = self.add(dotdot, parent.inumber()) {
            let _ = self.erase(DOT);
            return Err(err);
        }
        Ok(())
    }
}
