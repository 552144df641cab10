//! Process scenarios: the exec/wait handshake and timer sleep ordering.

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use osprey::{Kernel, KernelConfig};

#[test]
fn wait_returns_exit_code_once() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    let code = kernel.run("init", |ctx| {
        ctx.create("/child", 0).unwrap();
        let pid = ctx.execute("/child", Box::new(|_ctx| 42)).unwrap();

        assert_eq!(ctx.wait(pid), 42);
        // A second wait finds no such child.
        assert_eq!(ctx.wait(pid), -1);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn wait_rejects_unknown_pids() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    kernel.run("init", |ctx| {
        assert_eq!(ctx.wait(9999), -1);
        0
    });
}

#[test]
fn exec_of_a_missing_program_fails() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    kernel.run("init", |ctx| {
        assert!(ctx.execute("/no-such-program", Box::new(|_ctx| 0)).is_err());
        0
    });
}

#[test]
fn exec_denies_writes_to_the_running_image() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    kernel.run("init", |ctx| {
        ctx.create("/prog", 16).unwrap();

        let gate = Arc::new(Barrier::new(2));
        let inner = Arc::clone(&gate);
        let pid = ctx
            .execute(
                "/prog",
                Box::new(move |_child| {
                    inner.wait();
                    inner.wait();
                    7
                }),
            )
            .unwrap();

        gate.wait();
        // While the child runs, its image refuses writes.
        let fd = ctx.open("/prog").unwrap();
        assert_eq!(ctx.write(fd, b"overwrite").unwrap(), 0);
        ctx.close(fd).unwrap();
        gate.wait();

        assert_eq!(ctx.wait(pid), 7);

        // After exit the image is writable again.
        let fd = ctx.open("/prog").unwrap();
        assert_eq!(ctx.write(fd, b"overwrite").unwrap(), 9);
        ctx.close(fd).unwrap();
        0
    });
}

#[test]
fn children_of_an_exiting_parent_are_orphaned() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    kernel.run("init", |ctx| {
        ctx.create("/mid", 0).unwrap();
        ctx.create("/leaf", 0).unwrap();

        let pid = ctx
            .execute(
                "/mid",
                Box::new(|mid| {
                    // The grandchild outlives its parent; it must be able to
                    // exit without a handshake partner.
                    let _ = mid.execute(
                        "/leaf",
                        Box::new(|_leaf| {
                            thread::sleep(Duration::from_millis(50));
                            0
                        }),
                    );
                    5
                }),
            )
            .unwrap();

        assert_eq!(ctx.wait(pid), 5);
        // Give the orphan time to finish its teardown.
        thread::sleep(Duration::from_millis(200));
        0
    });
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();

    let code = kernel.run("init", |ctx| {
        for name in ["/a", "/b", "/c"] {
            ctx.create(name, 0).unwrap();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Barrier::new(4));
        let mut pids = Vec::new();

        for &(name, ticks) in &[("/a", 30u64), ("/b", 10), ("/c", 20)] {
            let order = Arc::clone(&order);
            let gate = Arc::clone(&gate);
            let pid = ctx
                .execute(
                    name,
                    Box::new(move |child| {
                        gate.wait();
                        let start = child.kernel().timer().ticks();
                        child.sleep(ticks);
                        let woke = child.kernel().timer().ticks();
                        assert!(woke >= start + ticks, "{} woke early", name);
                        order.lock().unwrap().push(name);
                        0
                    }),
                )
                .unwrap();
            pids.push(pid);
        }

        gate.wait();
        // Let all three park in the sleep queue before time advances.
        thread::sleep(Duration::from_millis(100));
        for _ in 0..30 {
            ctx.kernel().tick();
            thread::sleep(Duration::from_millis(2));
        }

        for pid in pids {
            assert_eq!(ctx.wait(pid), 0);
        }
        assert_eq!(*order.lock().unwrap(), vec!["/b", "/c", "/a"]);
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn background_ticker_drives_sleep() {
    let kernel = Kernel::new(KernelConfig::default()).unwrap();
    let ticker = kernel.start_ticker(Duration::from_millis(1));

    kernel.run("init", |ctx| {
        let before = ctx.kernel().timer().ticks();
        ctx.sleep(5);
        assert!(ctx.kernel().timer().ticks() >= before + 5);
        0
    });
    drop(ticker);
}
