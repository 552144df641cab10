//! Open-file handles.
//!
//! A `File` pairs an open inode with a byte position and remembers whether
//! this handle has denied writes to the inode (done for a running process's
//! executable). Handles duplicate with independent positions; the inode's
//! open count tracks every handle, so a file stays alive until the last one
//! closes.

use std::sync::Arc;

use crate::fs::{Itable, RcInode};
use crate::Error;

pub struct File {
    ip: RcInode,
    pos: u32,
    /// Whether this handle holds a deny-write on the inode.
    deny_write: bool,
}

impl File {
    /// Wraps an open inode reference, taking ownership of it.
    pub fn open(ip: RcInode) -> Self {
        Self {
            ip,
            pos: 0,
            deny_write: false,
        }
    }

    /// A second handle on the same inode with an independent position.
    pub fn reopen(&self) -> Self {
        Self::open(self.ip.reopen())
    }

    /// Closes the handle, re-allowing writes it denied.
    pub fn close(mut self, itable: &Itable) {
        if self.deny_write {
            self.ip.allow_write();
            self.deny_write = false;
        }
        itable.close(self.ip);
    }

    /// Closes a shared handle once every other reference has let go.
    /// Callers use this after tearing down the pages a mapping or segment
    /// handed the handle to; a concurrent eviction may hold a reference for
    /// an instant.
    pub fn close_shared(file: Arc<File>, itable: &Itable) {
        let mut file = file;
        loop {
            match Arc::try_unwrap(file) {
                Ok(file) => return file.close(itable),
                Err(again) => {
                    file = again;
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn inode(&self) -> &RcInode {
        &self.ip
    }

    pub fn inumber(&self) -> u32 {
        self.ip.inumber()
    }

    pub fn len(&self) -> u32 {
        self.ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_dir(&self) -> bool {
        self.ip.is_dir()
    }

    /// Reads from the current position, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.ip.read_at(buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Reads at `offset` without touching the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.ip.read_at(buf, offset)
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.ip.write_at(buf, self.pos);
        self.pos += n as u32;
        n
    }

    /// Writes at `offset` without touching the position.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        self.ip.write_at(buf, offset)
    }

    /// Moves the position to `pos`. Seeking past end of file is allowed;
    /// a later write extends the file.
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Denies writes to the backing inode until `allow_write` or close.
    /// At most once per handle.
    pub fn deny_write(&mut self) -> Result<(), Error> {
        if self.deny_write {
            return Err(Error::Denied);
        }
        self.ip.deny_write();
        self.deny_write = true;
        Ok(())
    }

    /// Re-allows writes denied through this handle.
    pub fn allow_write(&mut self) -> Result<(), Error> {
        if !self.deny_write {
            return Err(Error::Denied);
        }
        self.ip.allow_write();
        self.deny_write = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::Bcache;
    use crate::device::{BlockDevice, MemDisk};
    use crate::fs::FreeMap;
    use std::sync::Arc;

    fn open_file() -> (Arc<Itable>, File) {
        let disk = Arc::new(MemDisk::new(256));
        let cache = Arc::new(Bcache::new(disk as Arc<dyn BlockDevice>));
        cache.enable();
        let freemap = Arc::new(FreeMap::format(Arc::clone(&cache), 256));
        let itable = Arc::new(Itable::new(cache, Arc::clone(&freemap)));
        let sector = freemap.allocate().unwrap();
        itable.create(sector, 0, false).unwrap();
        let file = File::open(itable.open(sector));
        (itable, file)
    }

    #[test]
    fn position_advances_with_io() {
        let (itable, mut file) = open_file();
        assert_eq!(file.write(b"hello world"), 11);
        assert_eq!(file.tell(), 11);

        file.seek(6);
        let mut out = [0u8; 5];
        assert_eq!(file.read(&mut out), 5);
        assert_eq!(&out, b"world");
        assert_eq!(file.tell(), 11);
        file.close(&itable);
    }

    #[test]
    fn reopen_has_independent_position() {
        let (itable, mut file) = open_file();
        file.write(b"abcdef");

        let mut twin = file.reopen();
        let mut out = [0u8; 3];
        assert_eq!(twin.read(&mut out), 3);
        assert_eq!(&out, b"abc");
        assert_eq!(file.tell(), 6);

        twin.close(&itable);
        file.close(&itable);
    }

    #[test]
    fn deny_write_pairs_with_allow() {
        let (itable, mut file) = open_file();
        file.deny_write().unwrap();
        assert_eq!(file.write(b"no"), 0);
        assert!(file.deny_write().is_err());
        file.allow_write().unwrap();
        assert_eq!(file.write(b"yes"), 3);
        file.close(&itable);
    }
}
