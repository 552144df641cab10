//! The kernel root handle.
//!
//! Ties the subsystems together: the file system over one block device, the
//! VM over the other, and the timer feeding both the sleep queue and the
//! buffer cache's periodic flush. Nothing here is process-global in the
//! language sense; independent `Kernel` instances coexist, which is how the
//! tests build small machines.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::{BlockDevice, MemDisk};
use crate::fs::FileSystem;
use crate::proc::{self, Pid, ProcessCtx};
use crate::sleep::Timer;
use crate::vm::Vm;
use crate::Error;

pub struct KernelConfig {
    /// File-system partition size, in sectors.
    pub fs_sectors: u32,
    /// Swap partition size, in sectors.
    pub swap_sectors: u32,
    /// User-frame pool budget, in pages.
    pub user_frames: usize,
    /// Format the file system before mounting.
    pub format: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            fs_sectors: 4096,
            swap_sectors: 1024,
            user_frames: 256,
            format: true,
        }
    }
}

pub struct Kernel {
    fs: Arc<FileSystem>,
    vm: Arc<Vm>,
    timer: Arc<Timer>,
    next_pid: AtomicI32,
}

impl Kernel {
    /// Boots a kernel on fresh in-memory disks.
    pub fn new(config: KernelConfig) -> Result<Arc<Self>, Error> {
        let fs_dev = Arc::new(MemDisk::new(config.fs_sectors)) as Arc<dyn BlockDevice>;
        let swap_dev = Arc::new(MemDisk::new(config.swap_sectors)) as Arc<dyn BlockDevice>;
        Self::with_devices(fs_dev, swap_dev, config.user_frames, config.format)
    }

    /// Boots a kernel on caller-supplied devices.
    pub fn with_devices(
        fs_dev: Arc<dyn BlockDevice>,
        swap_dev: Arc<dyn BlockDevice>,
        user_frames: usize,
        format: bool,
    ) -> Result<Arc<Self>, Error> {
        Ok(Arc::new(Self {
            fs: FileSystem::new(fs_dev, format)?,
            vm: Vm::new(swap_dev, user_frames),
            timer: Arc::new(Timer::new()),
            next_pid: AtomicI32::new(1),
        }))
    }

    pub fn fs(&self) -> &Arc<FileSystem> {
        &self.fs
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub(crate) fn next_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    /// One timer tick: wakes due sleepers and advances the cache's
    /// write-back schedule.
    pub fn tick(&self) {
        self.timer.tick();
        self.fs.tick();
    }

    /// Drives `tick` from a background thread every `period` until the
    /// returned handle drops.
    pub fn start_ticker(self: &Arc<Self>, period: Duration) -> Ticker {
        let stop = Arc::new(AtomicBool::new(false));
        let kernel = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                kernel.tick();
                thread::sleep(period);
            }
        });
        Ticker {
            stop,
            handle: Some(handle),
        }
    }

    /// Runs `entry` as the initial process on the calling thread and
    /// returns its exit code after teardown.
    pub fn run(self: &Arc<Self>, name: &str, entry: impl FnOnce(&mut ProcessCtx) -> i32) -> i32 {
        proc::run_initial(self, name, entry)
    }

    /// Graceful shutdown: write everything back and stop caching.
    pub fn shutdown(&self) {
        self.fs.shutdown();
    }
}

/// Handle on the background ticker; dropping it stops the thread.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
