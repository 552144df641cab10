//! osprey: the storage and virtual-memory core of a small teaching
//! operating system, hosted on std.
//!
//! The crate is organized bottom-up:
//! * `device`: fixed 512-byte sector block devices (one file-system
//!   partition, one swap partition).
//! * `bio`: a bounded write-back buffer cache over the file-system device.
//! * `fs`: free-sector map, multi-level indirect inodes, directories, and
//!   path resolution, tied together by a `FileSystem` facade.
//! * `vm`: bounded user-frame pool with second-chance eviction, page-slotted
//!   swap, per-process page directories, supplemental page tables, and
//!   memory-mapped files.
//! * `proc`: processes with file-descriptor and mapping tables, and the
//!   load/wait/exit coordination protocol.
//! * `sleep`: tick-driven sleep queue.
//!
//! Kernel threads map to OS threads; cooperative suspension maps to blocking
//! semaphores (`sync`). All state hangs off a `Kernel` root handle so that
//! independent instances can coexist.

mod bio;
mod device;
mod file;
mod fs;
mod kernel;
mod param;
mod proc;
mod sleep;
mod sync;
mod vm;

pub use bio::Bcache;
pub use device::{BlockDevice, MemDisk};
pub use file::File;
pub use fs::{Dir, FileName, FileSystem, FreeMap, Inode, Itable, Path, RcInode};
pub use kernel::{Kernel, KernelConfig, Ticker};
pub use param::*;
pub use proc::{Fd, MapId, Pid, ProcessCtx, ProcessEntry};
pub use sleep::Timer;
pub use sync::Semaphore;
pub use vm::{
    frame::{AllocFlags, FrameTable, KPage, Page, UserPool},
    mmap::MmapFile,
    page::SuppTable,
    pagedir::PageDir,
    swap::SwapTable,
    Vm,
};

/// Error kinds surfaced by the process-facing operations.
///
/// Internal seams keep the terser `Option`/`Result<_, ()>` style; the facade
/// translates to one of these so the syscall layer can map it to a
/// user-visible -1 or kill the offender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// A path component does not exist.
    NotFound,
    /// Create on a name that already exists.
    AlreadyExists,
    /// An intermediate path component is not a directory.
    NotADirectory,
    /// A directory where a regular file is required.
    IsADirectory,
    /// A name longer than `NAME_MAX` bytes.
    NameTooLong,
    /// Empty name, or a trailing separator on a regular-file create.
    Invalid,
    /// The free-sector map or the swap bitmap is exhausted.
    NoSpace,
    /// A kernel allocation failed.
    NoMemory,
    /// Write to an inode with writes denied.
    Denied,
    /// A page fault outside any supplemental-table entry.
    FaultUnhandled,
}

/// Subsystem trace line, compiled out unless the `trace` feature is on.
#[cfg(feature = "trace")]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        eprintln!("[osprey] {}", format_args!($($arg)*))
    };
}

/// Subsystem trace line, compiled out unless the `trace` feature is on.
#[cfg(not(feature = "trace"))]
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {{
        let _ = format_args!($($arg)*);
    }};
}
