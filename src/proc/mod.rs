//! Processes.
//!
//! A process owns a file-descriptor table, a memory-mapping table, a
//! supplemental page table with its page directory, a working directory,
//! and its executable held open with writes denied. Each one carries three
//! binary semaphores coordinating with its parent:
//!
//! * `load`: the child signals once it has tried to load its executable;
//!   the parent learns whether the exec succeeded.
//! * `wait`/`exit`: a two-phase handshake. The child signals `wait` after
//!   recording its exit code and again after tearing down; the parent reads
//!   the code in between and answers on `exit` both times. The second phase
//!   guarantees `wait` returns only after teardown, and a second `wait` on
//!   the same pid finds no child and returns -1.
//!
//! Children of an exiting parent are orphaned so they exit without the
//! handshake; a child that already committed to it is reaped by the
//! exiting parent instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::file::File;
use crate::fs::{Dir, Path};
use crate::kernel::Kernel;
use crate::param::{FD_BASE, NMMAP, NOFILE, USER_STACK_BOTTOM, USER_TOP};
use crate::sync::Semaphore;
use crate::vm::mmap::MmapFile;
use crate::vm::page::SuppTable;
use crate::{trace, Error};

pub type Pid = i32;

/// The body a process runs once its executable has loaded; its return value
/// is the exit code.
pub type ProcessEntry = Box<dyn FnOnce(&mut ProcessCtx) -> i32 + Send + 'static>;

pub type Fd = usize;
pub type MapId = usize;

enum ParentLink {
    /// No parent; exit skips the handshake.
    Orphan,
    Alive(Weak<ProcShared>),
    /// The child has committed to the handshake; an exiting parent must
    /// reap it.
    Handshaking,
}

/// The slice of a process shared with its parent and children.
pub(crate) struct ProcShared {
    pid: Pid,
    name: String,
    exit_code: Mutex<i32>,
    load_success: AtomicBool,
    load_sema: Semaphore,
    wait_sema: Semaphore,
    exit_sema: Semaphore,
    parent: Mutex<ParentLink>,
    children: Mutex<Vec<Arc<ProcShared>>>,
}

impl ProcShared {
    fn new(pid: Pid, name: String, parent: ParentLink) -> Self {
        Self {
            pid,
            name,
            exit_code: Mutex::new(-1),
            load_success: AtomicBool::new(false),
            load_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            exit_sema: Semaphore::new(0),
            parent: Mutex::new(parent),
            children: Mutex::new(Vec::new()),
        }
    }
}

/// Dense table of open files; descriptors start at `FD_BASE`.
struct FdTable {
    files: ArrayVec<Option<File>, NOFILE>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            files: ArrayVec::new(),
        }
    }

    fn allocate(&mut self, file: File) -> Option<Fd> {
        if let Some(slot) = self.files.iter().position(|f| f.is_none()) {
            self.files[slot] = Some(file);
            return Some(slot + FD_BASE);
        }
        if self.files.is_full() {
            return None;
        }
        self.files.push(Some(file));
        Some(self.files.len() - 1 + FD_BASE)
    }

    fn get_mut(&mut self, fd: Fd) -> Option<&mut File> {
        self.files
            .get_mut(fd.checked_sub(FD_BASE)?)?
            .as_mut()
    }

    fn get(&self, fd: Fd) -> Option<&File> {
        self.files.get(fd.checked_sub(FD_BASE)?)?.as_ref()
    }

    fn take(&mut self, fd: Fd) -> Option<File> {
        self.files.get_mut(fd.checked_sub(FD_BASE)?)?.take()
    }

    fn drain(&mut self) -> impl Iterator<Item = File> + '_ {
        self.files.drain(..).flatten()
    }
}

/// Dense table of memory mappings.
struct MmapTable {
    maps: ArrayVec<Option<MmapFile>, NMMAP>,
}

impl MmapTable {
    fn new() -> Self {
        Self {
            maps: ArrayVec::new(),
        }
    }

    fn allocate(&mut self, map: MmapFile) -> Option<MapId> {
        if let Some(slot) = self.maps.iter().position(|m| m.is_none()) {
            self.maps[slot] = Some(map);
            return Some(slot);
        }
        if self.maps.is_full() {
            return None;
        }
        self.maps.push(Some(map));
        Some(self.maps.len() - 1)
    }

    fn take(&mut self, id: MapId) -> Option<MmapFile> {
        self.maps.get_mut(id)?.take()
    }

    fn drain(&mut self) -> impl Iterator<Item = MmapFile> + '_ {
        self.maps.drain(..).flatten()
    }
}

/// A process, seen from its own kernel thread. Every process-facing
/// operation of the storage and VM core hangs off this.
pub struct ProcessCtx {
    kernel: Arc<Kernel>,
    shared: Arc<ProcShared>,
    supp: SuppTable,
    files: FdTable,
    mmaps: MmapTable,
    /// Backing handles of lazily loaded code segments; closed at exit after
    /// the supplemental table has dropped its references.
    segments: Vec<Arc<File>>,
    cwd: Option<Dir>,
    executable: Option<File>,
}

impl ProcessCtx {
    fn new(kernel: Arc<Kernel>, shared: Arc<ProcShared>) -> Self {
        let supp = kernel.vm().new_supp_table();
        Self {
            kernel,
            shared,
            supp,
            files: FdTable::new(),
            mmaps: MmapTable::new(),
            segments: Vec::new(),
            cwd: None,
            executable: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.shared.pid
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn supp(&self) -> &SuppTable {
        &self.supp
    }

    // File-system operations, resolved against this process's working
    // directory.

    pub fn create(&self, path: &str, initial_size: u32) -> Result<(), Error> {
        self.kernel
            .fs()
            .create(self.cwd.as_ref(), Path::new(path), initial_size)
    }

    pub fn create_dir(&self, path: &str) -> Result<(), Error> {
        self.kernel.fs().create_dir(self.cwd.as_ref(), Path::new(path))
    }

    pub fn remove(&self, path: &str) -> Result<(), Error> {
        self.kernel.fs().remove(self.cwd.as_ref(), Path::new(path))
    }

    pub fn open(&mut self, path: &str) -> Result<Fd, Error> {
        let file = self.kernel.fs().open(self.cwd.as_ref(), Path::new(path))?;
        match self.files.allocate(file) {
            Some(fd) => Ok(fd),
            None => Err(Error::NoMemory),
        }
    }

    pub fn close(&mut self, fd: Fd) -> Result<(), Error> {
        let file = self.files.take(fd).ok_or(Error::Invalid)?;
        file.close(self.kernel.fs().itable());
        Ok(())
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, Error> {
        let file = self.files.get_mut(fd).ok_or(Error::Invalid)?;
        Ok(file.read(buf))
    }

    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, Error> {
        let file = self.files.get_mut(fd).ok_or(Error::Invalid)?;
        if file.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(file.write(buf))
    }

    pub fn read_at(&self, fd: Fd, buf: &mut [u8], offset: u32) -> Result<usize, Error> {
        let file = self.files.get(fd).ok_or(Error::Invalid)?;
        Ok(file.read_at(buf, offset))
    }

    pub fn write_at(&self, fd: Fd, buf: &[u8], offset: u32) -> Result<usize, Error> {
        let file = self.files.get(fd).ok_or(Error::Invalid)?;
        if file.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(file.write_at(buf, offset))
    }

    pub fn seek(&mut self, fd: Fd, pos: u32) -> Result<(), Error> {
        let file = self.files.get_mut(fd).ok_or(Error::Invalid)?;
        file.seek(pos);
        Ok(())
    }

    pub fn tell(&self, fd: Fd) -> Result<u32, Error> {
        Ok(self.files.get(fd).ok_or(Error::Invalid)?.tell())
    }

    pub fn filesize(&self, fd: Fd) -> Result<u32, Error> {
        Ok(self.files.get(fd).ok_or(Error::Invalid)?.len())
    }

    pub fn is_dir(&self, fd: Fd) -> Result<bool, Error> {
        Ok(self.files.get(fd).ok_or(Error::Invalid)?.is_dir())
    }

    pub fn inumber(&self, fd: Fd) -> Result<u32, Error> {
        Ok(self.files.get(fd).ok_or(Error::Invalid)?.inumber())
    }

    pub fn deny_write(&mut self, fd: Fd) -> Result<(), Error> {
        self.files.get_mut(fd).ok_or(Error::Invalid)?.deny_write()
    }

    pub fn allow_write(&mut self, fd: Fd) -> Result<(), Error> {
        self.files.get_mut(fd).ok_or(Error::Invalid)?.allow_write()
    }

    /// Yields the next entry name of the directory open on `fd`.
    pub fn readdir(&mut self, fd: Fd) -> Result<Option<String>, Error> {
        let file = self.files.get_mut(fd).ok_or(Error::Invalid)?;
        if !file.is_dir() {
            return Err(Error::NotADirectory);
        }
        let mut pos = file.tell();
        let name = crate::fs::readdir_at(file.inode(), &mut pos);
        file.seek(pos);
        Ok(name)
    }

    /// Changes the working directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), Error> {
        let dir = self.kernel.fs().open_dir(self.cwd.as_ref(), Path::new(path))?;
        if let Some(old) = self.cwd.replace(dir) {
            old.close(self.kernel.fs().itable());
        }
        Ok(())
    }

    // Virtual memory.

    /// Maps the file open on `fd` at the page-aligned address `uaddr`.
    pub fn mmap(&mut self, fd: Fd, uaddr: usize) -> Result<MapId, Error> {
        let file = self.files.get(fd).ok_or(Error::Invalid)?;
        let map = MmapFile::create(&self.supp, self.kernel.fs().itable(), file, uaddr)?;
        match self.mmaps.allocate(map) {
            Some(id) => Ok(id),
            None => Err(Error::NoMemory),
        }
    }

    /// Unmaps mapping `id`, writing dirty pages back to the file.
    pub fn munmap(&mut self, id: MapId) -> Result<(), Error> {
        let map = self.mmaps.take(id).ok_or(Error::Invalid)?;
        map.destroy(&self.supp, self.kernel.fs().itable());
        Ok(())
    }

    /// Registers a lazily loaded segment of the file open on `fd`:
    /// `read_bytes` from offset `ofs`, then `zero_bytes` of zeros, faulted
    /// in page by page on first access.
    pub fn load_segment(
        &mut self,
        fd: Fd,
        ofs: u32,
        upage: usize,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<(), Error> {
        let file = self.files.get(fd).ok_or(Error::Invalid)?;
        let file = Arc::new(file.reopen());
        match self
            .supp
            .insert_segment(Arc::clone(&file), ofs, upage, read_bytes, zero_bytes, writable, false)
        {
            Ok(()) => {
                self.segments.push(file);
                Ok(())
            }
            Err(err) => {
                File::close_shared(file, self.kernel.fs().itable());
                Err(err)
            }
        }
    }

    /// Grows the stack by one page at `upage`, present immediately.
    pub fn allocate_stack(&self, upage: usize, zero: bool) -> Result<(), Error> {
        if !(USER_STACK_BOTTOM..USER_TOP).contains(&upage) {
            return Err(Error::Invalid);
        }
        self.supp.insert_stack(upage, zero)
    }

    /// Resolves a page fault at `addr`; false kills the process in the
    /// surrounding syscall layer.
    pub fn page_fault(&self, addr: usize) -> bool {
        self.supp.page_fault(addr)
    }

    pub fn read_user(&self, addr: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.supp.read_user(addr, buf)
    }

    pub fn write_user(&self, addr: usize, buf: &[u8]) -> Result<(), Error> {
        self.supp.write_user(addr, buf)
    }

    /// Suspends the process for at least `ticks` timer ticks.
    pub fn sleep(&self, ticks: u64) {
        self.kernel.timer().sleep(ticks);
    }

    // Process lifecycle.

    /// Starts a child process running `entry` once the program named by the
    /// first token of `command_line` has been opened with writes denied.
    /// Returns once the child has loaded, with its pid; a child that failed
    /// to load is reaped here and reported as an error.
    pub fn execute(&self, command_line: &str, entry: ProcessEntry) -> Result<Pid, Error> {
        let program = command_line
            .split_whitespace()
            .next()
            .ok_or(Error::Invalid)?
            .to_string();

        let child = Arc::new(ProcShared::new(
            self.kernel.next_pid(),
            program.clone(),
            ParentLink::Alive(Arc::downgrade(&self.shared)),
        ));
        self.shared.children.lock().push(Arc::clone(&child));

        let kernel = Arc::clone(&self.kernel);
        let shared = Arc::clone(&child);
        let _ = thread::spawn(move || run_process(kernel, shared, program, entry));

        child.load_sema.wait();
        if !child.load_success.load(Ordering::SeqCst) {
            let code = handshake(&child);
            debug_assert_eq!(code, -1);
            return Err(Error::NotFound);
        }
        Ok(child.pid)
    }

    /// Waits for child `pid` and returns its exit code; -1 for an unknown
    /// pid, a process that is not a child, or one already waited for.
    pub fn wait(&self, pid: Pid) -> i32 {
        let child = self
            .shared
            .children
            .lock()
            .iter()
            .find(|child| child.pid == pid)
            .cloned();
        match child {
            Some(child) => handshake(&child),
            None => -1,
        }
    }

    /// Releases everything the process owns and, with a live parent, walks
    /// the two-phase exit handshake.
    fn exit(mut self) {
        trace!("{}: exit({})", self.shared.name, *self.shared.exit_code.lock());
        let itable = Arc::clone(self.kernel.fs().itable());

        // The address space goes first: mappings write dirty pages back,
        // then the supplemental table releases frames and swap slots and
        // destroys the page directory.
        let maps: Vec<_> = self.mmaps.drain().collect();
        for map in maps {
            map.destroy(&self.supp, &itable);
        }
        self.supp.destroy_all();
        for segment in self.segments.drain(..) {
            File::close_shared(segment, &itable);
        }

        let parent = {
            let mut link = self.shared.parent.lock();
            let upgraded = match &*link {
                ParentLink::Alive(weak) => Some(weak.upgrade()),
                _ => None,
            };
            match upgraded {
                Some(Some(parent)) => {
                    *link = ParentLink::Handshaking;
                    Some(parent)
                }
                Some(None) => {
                    *link = ParentLink::Orphan;
                    None
                }
                None => None,
            }
        };

        if let Some(parent) = &parent {
            self.shared.wait_sema.signal();
            self.shared.exit_sema.wait();
            parent
                .children
                .lock()
                .retain(|child| child.pid != self.shared.pid);
        }

        // Orphan the children; one already mid-handshake gets reaped.
        let children: Vec<_> = self.shared.children.lock().drain(..).collect();
        for child in children {
            let mut link = child.parent.lock();
            if matches!(&*link, ParentLink::Handshaking) {
                drop(link);
                let _ = handshake(&child);
            } else {
                *link = ParentLink::Orphan;
            }
        }

        let files: Vec<_> = self.files.drain().collect();
        for file in files {
            file.close(&itable);
        }
        if let Some(mut executable) = self.executable.take() {
            let _ = executable.allow_write();
            executable.close(&itable);
        }
        if let Some(cwd) = self.cwd.take() {
            cwd.close(&itable);
        }

        if parent.is_some() {
            self.shared.wait_sema.signal();
            self.shared.exit_sema.wait();
        }
    }
}

/// The parent's half of the two-phase exit handshake.
fn handshake(child: &Arc<ProcShared>) -> i32 {
    child.wait_sema.wait();
    let code = *child.exit_code.lock();
    child.exit_sema.signal();
    child.wait_sema.wait();
    child.exit_sema.signal();
    code
}

/// Body of a child kernel thread: load the executable, report the result,
/// run the entry, tear down.
fn run_process(kernel: Arc<Kernel>, shared: Arc<ProcShared>, program: String, entry: ProcessEntry) {
    let mut ctx = ProcessCtx::new(kernel, Arc::clone(&shared));

    let loaded = match ctx.kernel.fs().open(None, Path::new(&program)) {
        Ok(mut file) if !file.is_dir() => {
            file.deny_write().expect("fresh handle");
            ctx.executable = Some(file);
            true
        }
        Ok(file) => {
            file.close(ctx.kernel.fs().itable());
            false
        }
        Err(_) => false,
    };
    shared.load_success.store(loaded, Ordering::SeqCst);
    shared.load_sema.signal();

    if loaded {
        let code = entry(&mut ctx);
        *shared.exit_code.lock() = code;
    }
    ctx.exit();
}

/// Runs `entry` as the initial process on the calling thread, returning its
/// exit code after full teardown. The initial process has no parent and no
/// executable image.
pub(crate) fn run_initial(
    kernel: &Arc<Kernel>,
    name: &str,
    entry: impl FnOnce(&mut ProcessCtx) -> i32,
) -> i32 {
    let shared = Arc::new(ProcShared::new(
        kernel.next_pid(),
        name.to_string(),
        ParentLink::Orphan,
    ));
    let mut ctx = ProcessCtx::new(Arc::clone(kernel), shared);
    let code = entry(&mut ctx);
    *ctx.shared.exit_code.lock() = code;
    ctx.exit();
    code
}
