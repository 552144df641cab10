//! File-system implementation. Four layers:
//!   + Free map: allocator for raw disk sectors.
//!   + Inodes: multi-level indirect blocks, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: paths like /usr/doc/osprey for convenient naming.
//!
//! Everything reaches the device through the buffer cache. The facade here
//! resolves absolute and relative paths against a caller-supplied working
//! directory and serializes name-space operations under one lock; byte-level
//! file I/O takes only the per-structure locks.

use std::sync::{Arc, Mutex};

use scopeguard::ScopeGuard;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::file::File;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
use crate::Error;

mod directory;
mod freemap;
mod inode;
mod path;

pub use directory::{readdir_at, Dir};
pub use freemap::FreeMap;
pub use inode::{Inode, Itable, RcInode};
pub use path::{FileName, Path};

pub struct FileSystem {
    cache: Arc<Bcache>,
    freemap: Arc<FreeMap>,
    itable: Arc<Itable>,
    /// Name-space lock: path resolution and directory updates serialize
    /// here so a lookup never interleaves with a rename of the same entry.
    ops: Mutex<()>,
}

impl FileSystem {
    /// Mounts the file system on `dev`. With `format` set, writes a fresh
    /// free map and an empty root directory first.
    pub fn new(dev: Arc<dyn BlockDevice>, format: bool) -> Result<Arc<Self>, Error> {
        let sectors = dev.size();
        let cache = Arc::new(Bcache::new(dev));
        cache.enable();

        let freemap = Arc::new(if format {
            FreeMap::format(Arc::clone(&cache), sectors)
        } else {
            FreeMap::open(Arc::clone(&cache), sectors)
        });
        let itable = Arc::new(Itable::new(Arc::clone(&cache), Arc::clone(&freemap)));

        if format {
            Dir::create(&itable, ROOT_DIR_SECTOR)?;
            let root = Dir::open_root(&itable);
            let dotted = root.add_dot_entries(&root);
            root.close(&itable);
            dotted?;
        } else {
            // A mountable image carries an in-use free map and a root
            // directory at their reserved sectors; refuse anything else.
            if !freemap.is_allocated(FREE_MAP_SECTOR)
                || !freemap.is_allocated(ROOT_DIR_SECTOR)
                || !itable.is_valid_dir(ROOT_DIR_SECTOR)
            {
                return Err(Error::Invalid);
            }
        }

        Ok(Arc::new(Self {
            cache,
            freemap,
            itable,
            ops: Mutex::new(()),
        }))
    }

    /// Writes all unwritten data back and turns the cache off. Ordered
    /// before any later raw-device access.
    pub fn shutdown(&self) {
        self.cache.disable();
    }

    pub fn cache(&self) -> &Arc<Bcache> {
        &self.cache
    }

    pub fn freemap(&self) -> &Arc<FreeMap> {
        &self.freemap
    }

    pub fn itable(&self) -> &Arc<Itable> {
        &self.itable
    }

    /// Tick handler; schedules the cache's periodic flush.
    pub fn tick(&self) {
        self.cache.tick();
    }

    /// The directory resolution starts from: the root for absolute paths or
    /// when no working directory is given, the working directory otherwise.
    /// A removed working directory refuses resolution.
    fn base_dir(&self, cwd: Option<&Dir>, path: &Path) -> Result<Dir, Error> {
        match cwd {
            Some(cwd) if !path.is_absolute() => {
                if cwd.inode().is_removed() {
                    return Err(Error::NotFound);
                }
                Ok(cwd.reopen())
            }
            _ => Ok(Dir::open_root(&self.itable)),
        }
    }

    /// Walks every component of `path` as a directory.
    fn walk_dir(&self, cwd: Option<&Dir>, path: &Path) -> Result<Dir, Error> {
        let mut dir = self.base_dir(cwd, path)?;
        for name in path.components() {
            let ip = match dir.lookup(&self.itable, name) {
                Some(ip) => ip,
                None => {
                    dir.close(&self.itable);
                    return Err(Error::NotFound);
                }
            };
            dir.close(&self.itable);
            dir = Dir::open(&self.itable, ip)?;
        }
        Ok(dir)
    }

    /// Creates a regular file of `initial_size` zero bytes at `path`.
    pub fn create(&self, cwd: Option<&Dir>, path: &Path, initial_size: u32) -> Result<(), Error> {
        let _ops = self.ops.lock().unwrap();

        let (parent, base) = path.split();
        let name = FileName::new(base)?;
        // A trailing separator names a directory; reject it for files.
        if path.as_str().ends_with('/') {
            return Err(Error::Invalid);
        }

        let parent_dir = self.walk_dir(cwd, parent)?;
        let result = (|| {
            let sector = self.freemap.allocate().ok_or(Error::NoSpace)?;
            let sector = scopeguard::guard(sector, |sector| self.freemap.release(sector));
            self.itable.create(*sector, initial_size, false)?;
            parent_dir.add(name, *sector)?;
            let _ = ScopeGuard::into_inner(sector);
            Ok(())
        })();
        parent_dir.close(&self.itable);
        result
    }

    /// Creates an empty directory at `path`, with its `.` and `..` entries.
    pub fn create_dir(&self, cwd: Option<&Dir>, path: &Path) -> Result<(), Error> {
        let _ops = self.ops.lock().unwrap();

        let (parent, base) = path.split();
        let name = FileName::new(base)?;

        let parent_dir = self.walk_dir(cwd, parent)?;
        let result = (|| {
            let sector = self.freemap.allocate().ok_or(Error::NoSpace)?;
            let sector = scopeguard::guard(sector, |sector| self.freemap.release(sector));
            Dir::create(&self.itable, *sector)?;
            parent_dir.add(name, *sector)?;
            // From here the parent entry owns the sector; rollback goes
            // through removal instead of the guard.
            let sector = ScopeGuard::into_inner(sector);

            let base_dir = Dir::open(&self.itable, self.itable.open(sector))?;
            let dotted = base_dir.add_dot_entries(&parent_dir);
            base_dir.close(&self.itable);
            if dotted.is_err() {
                let _ = parent_dir.remove(&self.itable, name.as_str());
            }
            dotted
        })();
        parent_dir.close(&self.itable);
        result
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, cwd: Option<&Dir>, path: &Path) -> Result<File, Error> {
        let _ops = self.ops.lock().unwrap();

        if path.is_empty() {
            return Err(Error::Invalid);
        }

        let mut dir = self.base_dir(cwd, path)?;
        let mut components = path.components().peekable();
        while let Some(name) = components.next() {
            let ip = match dir.lookup(&self.itable, name) {
                Some(ip) => ip,
                None => {
                    dir.close(&self.itable);
                    return Err(Error::NotFound);
                }
            };
            dir.close(&self.itable);

            if ip.is_dir() {
                dir = Dir::open(&self.itable, ip)?;
            } else {
                // A regular file resolves only as the last component.
                if components.peek().is_some() {
                    self.itable.close(ip);
                    return Err(Error::NotADirectory);
                }
                return Ok(File::open(ip));
            }
        }
        Ok(File::open(dir.into_inode()))
    }

    /// Opens the directory at `path`. A trailing separator is accepted;
    /// a regular file on the way is `NotADirectory`.
    pub fn open_dir(&self, cwd: Option<&Dir>, path: &Path) -> Result<Dir, Error> {
        let _ops = self.ops.lock().unwrap();

        if path.is_empty() {
            return Err(Error::Invalid);
        }
        self.walk_dir(cwd, path)
    }

    /// Deletes the file or empty directory at `path`.
    pub fn remove(&self, cwd: Option<&Dir>, path: &Path) -> Result<(), Error> {
        let _ops = self.ops.lock().unwrap();

        let (parent, base) = path.split();
        if base.is_empty() {
            return Err(Error::Invalid);
        }

        let parent_dir = self.walk_dir(cwd, parent)?;
        let result = parent_dir.remove(&self.itable, base);
        parent_dir.close(&self.itable);
        result
    }
}
