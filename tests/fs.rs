//! File-system scenarios: inode round trips, holes, deferred deletion,
//! directory trees, path-split laws, and write-back persistence.

use std::sync::Arc;

use rand::{Rng, SeedableRng};

use osprey::{BlockDevice, FileSystem, MemDisk, Path};

fn fresh_fs(sectors: u32) -> Arc<FileSystem> {
    let disk = Arc::new(MemDisk::new(sectors)) as Arc<dyn BlockDevice>;
    FileSystem::new(disk, true).unwrap()
}

#[test]
fn create_write_reopen_round_trip() {
    let fs = fresh_fs(2048);

    // 200000 bytes forces one level of indirection: 391 sectors > 124.
    let data: Vec<u8> = (0..200_000usize).map(|i| (i % 256) as u8).collect();
    fs.create(None, Path::new("/a"), 0).unwrap();

    let mut file = fs.open(None, Path::new("/a")).unwrap();
    assert_eq!(file.write(&data), data.len());
    file.close(fs.itable());

    let mut file = fs.open(None, Path::new("/a")).unwrap();
    assert_eq!(file.inode().depth(), 1);
    let mut out = vec![0u8; data.len()];
    assert_eq!(file.read(&mut out), data.len());
    assert_eq!(out, data);
    file.close(fs.itable());
}

#[test]
fn random_payload_round_trips() {
    let fs = fresh_fs(2048);
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x05f5e1);

    for (path, len) in [("/small", 77usize), ("/mid", 9_000), ("/big", 120_000)] {
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);

        fs.create(None, Path::new(path), 0).unwrap();
        let file = fs.open(None, Path::new(path)).unwrap();
        assert_eq!(file.write_at(&data, 0), len);

        let mut out = vec![0u8; len];
        assert_eq!(file.read_at(&mut out, 0), len);
        assert_eq!(out, data, "{}", path);
        file.close(fs.itable());
    }
}

#[test]
fn hole_reads_as_zero() {
    let fs = fresh_fs(512);
    fs.create(None, Path::new("/holey"), 0).unwrap();

    let file = fs.open(None, Path::new("/holey")).unwrap();
    assert_eq!(file.write_at(&[0x7f], 5000), 1);
    assert_eq!(file.len(), 5001);

    let mut out = vec![0xffu8; 5000];
    assert_eq!(file.read_at(&mut out, 0), 5000);
    assert!(out.iter().all(|&b| b == 0));
    file.close(fs.itable());
}

#[test]
fn short_read_at_end_of_file() {
    let fs = fresh_fs(256);
    fs.create(None, Path::new("/short"), 0).unwrap();

    let file = fs.open(None, Path::new("/short")).unwrap();
    assert_eq!(file.write_at(b"abc", 0), 3);
    let mut out = [0u8; 10];
    assert_eq!(file.read_at(&mut out, 0), 3);
    assert_eq!(file.read_at(&mut out, 3), 0);
    file.close(fs.itable());
}

#[test]
fn removed_file_serves_open_handles_then_frees() {
    let fs = fresh_fs(512);
    let used_baseline = fs.freemap().used();

    fs.create(None, Path::new("/r"), 3000).unwrap();
    let a = fs.open(None, Path::new("/r")).unwrap();
    let b = fs.open(None, Path::new("/r")).unwrap();

    fs.remove(None, Path::new("/r")).unwrap();
    assert!(fs.open(None, Path::new("/r")).is_err());

    assert_eq!(a.write_at(b"unlinked", 0), 8);
    let mut out = [0u8; 8];
    assert_eq!(b.read_at(&mut out, 0), 8);
    assert_eq!(&out, b"unlinked");

    a.close(fs.itable());
    let mut out = [0u8; 8];
    assert_eq!(b.read_at(&mut out, 0), 8);
    b.close(fs.itable());

    // Last close returned every data sector and the inode sector.
    assert_eq!(fs.freemap().used(), used_baseline);
}

#[test]
fn directory_tree_scenario() {
    let fs = fresh_fs(512);

    fs.create_dir(None, Path::new("/d")).unwrap();
    fs.create_dir(None, Path::new("/d/e")).unwrap();
    fs.create(None, Path::new("/d/e/f"), 10).unwrap();

    let mut d = fs.open_dir(None, Path::new("/d")).unwrap();
    let mut names = Vec::new();
    while let Some(name) = d.readdir() {
        names.push(name);
    }
    assert_eq!(names, vec!["e"]);
    d.close(fs.itable());

    let mut e = fs.open_dir(None, Path::new("/d/e")).unwrap();
    assert_eq!(e.readdir(), Some("f".to_string()));
    assert_eq!(e.readdir(), None);
    e.close(fs.itable());

    assert!(fs.remove(None, Path::new("/d")).is_err());
    fs.remove(None, Path::new("/d/e/f")).unwrap();
    assert!(fs.remove(None, Path::new("/d")).is_err());
    fs.remove(None, Path::new("/d/e")).unwrap();
    fs.remove(None, Path::new("/d")).unwrap();
    assert!(fs.open_dir(None, Path::new("/d")).is_err());
}

#[test]
fn dot_and_dotdot_resolve() {
    let fs = fresh_fs(512);
    fs.create_dir(None, Path::new("/d")).unwrap();
    fs.create_dir(None, Path::new("/d/e")).unwrap();
    fs.create(None, Path::new("/d/e/f"), 1).unwrap();

    let direct = fs.open(None, Path::new("/d/e/f")).unwrap();
    let twisted = fs.open(None, Path::new("/d/./e/../e/f")).unwrap();
    assert_eq!(direct.inumber(), twisted.inumber());
    direct.close(fs.itable());
    twisted.close(fs.itable());

    // Root's `..` names the root itself.
    let root = fs.open_dir(None, Path::new("/")).unwrap();
    let still_root = fs.open_dir(None, Path::new("/../..")).unwrap();
    assert_eq!(root.inumber(), still_root.inumber());
    root.close(fs.itable());
    still_root.close(fs.itable());
}

#[test]
fn relative_paths_resolve_against_a_directory() {
    let fs = fresh_fs(512);
    fs.create_dir(None, Path::new("/d")).unwrap();
    fs.create(None, Path::new("/d/x"), 4).unwrap();

    let d = fs.open_dir(None, Path::new("/d")).unwrap();
    let file = fs.open(Some(&d), Path::new("x")).unwrap();
    assert_eq!(file.len(), 4);
    file.close(fs.itable());

    fs.create(Some(&d), Path::new("y"), 0).unwrap();
    let abs = fs.open(None, Path::new("/d/y")).unwrap();
    abs.close(fs.itable());
    d.close(fs.itable());
}

#[test]
fn path_split_joins_back_to_the_same_inode() {
    let fs = fresh_fs(512);
    fs.create_dir(None, Path::new("/d")).unwrap();
    fs.create_dir(None, Path::new("/d/e")).unwrap();
    fs.create(None, Path::new("/d/e/f"), 1).unwrap();

    for path in ["/d/e/f", "/d//e/f", "/d/e", "/d", "/d/e/"] {
        let (parent, base) = Path::new(path).split();
        let joined = if parent.as_str().is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", parent.as_str(), base)
        };

        let original = fs.open(None, Path::new(path)).unwrap();
        let rejoined = fs.open(None, Path::new(&joined)).unwrap();
        assert_eq!(original.inumber(), rejoined.inumber(), "{}", path);
        original.close(fs.itable());
        rejoined.close(fs.itable());
    }
}

#[test]
fn invalid_names_are_rejected() {
    let fs = fresh_fs(512);
    assert!(fs.create(None, Path::new("/waytoolongofaname"), 0).is_err());
    assert!(fs.create(None, Path::new(""), 0).is_err());
    assert!(fs.create(None, Path::new("/trailing/"), 0).is_err());
    assert!(fs.create(None, Path::new("/"), 0).is_err());
    assert!(fs.open(None, Path::new("/missing")).is_err());

    fs.create(None, Path::new("/dup"), 0).unwrap();
    assert!(fs.create(None, Path::new("/dup"), 0).is_err());
}

#[test]
fn a_file_is_not_a_directory() {
    let fs = fresh_fs(512);
    fs.create(None, Path::new("/plain"), 0).unwrap();
    assert!(fs.open(None, Path::new("/plain/below")).is_err());
    assert!(fs.open_dir(None, Path::new("/plain")).is_err());

    // But opening it as a file through the generic open works.
    let file = fs.open(None, Path::new("/plain")).unwrap();
    assert!(!file.is_dir());
    file.close(fs.itable());
}

#[test]
fn mounting_an_unformatted_disk_is_refused() {
    let disk = Arc::new(MemDisk::new(64)) as Arc<dyn BlockDevice>;
    assert!(FileSystem::new(disk, false).is_err());
}

#[test]
fn shutdown_persists_across_remount() {
    let disk = Arc::new(MemDisk::new(1024));
    let dev = Arc::clone(&disk) as Arc<dyn BlockDevice>;

    let fs = FileSystem::new(dev, true).unwrap();
    fs.create_dir(None, Path::new("/keep")).unwrap();
    fs.create(None, Path::new("/keep/data"), 0).unwrap();
    let file = fs.open(None, Path::new("/keep/data")).unwrap();
    assert_eq!(file.write_at(b"survives the flush", 0), 18);
    file.close(fs.itable());
    fs.shutdown();

    // Remount over the raw device; everything must be on disk by now.
    let fs = FileSystem::new(disk as Arc<dyn BlockDevice>, false).unwrap();
    let file = fs.open(None, Path::new("/keep/data")).unwrap();
    let mut out = [0u8; 18];
    assert_eq!(file.read_at(&mut out, 0), 18);
    assert_eq!(&out, b"survives the flush");
    file.close(fs.itable());
}
