use hitsz_logfs::{FileKind, FileSystem, MemDisk, BSIZE, DIRENT_SIZE, MAXFILE_BYTES, ROOTINO};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

fn fresh(nblocks: usize) -> (Arc<MemDisk>, FileSystem) {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk = Arc::new(MemDisk::new(nblocks));
    let fs = FileSystem::format(disk.clone(), nblocks, 200).unwrap();
    (disk, fs)
}

fn pattern(n: usize, seed: usize) -> Vec<u8> {
    (0..n).map(|i| ((i * 31 + seed) % 251) as u8).collect()
}

#[test]
fn large_write_spills_into_indirect_block() {
    let (disk, fs) = fresh(1000);
    let ctx = fs.begin_op();
    let ip = fs.create(&ctx, "/big", FileKind::File).unwrap();
    fs.end_op(ctx);

    let src = pattern(5000, 1);
    assert_eq!(fs.write_file(&ip, &src, 0), 5000);
    assert_eq!(fs.stat(&ip).size, 5000);
    {
        let guard = fs.inodes().lock(&ip);
        assert_ne!(guard.indirect, 0);
        assert!(guard.addrs.iter().all(|&a| a != 0));
    }
    let mut dst = vec![0u8; 6000];
    assert_eq!(fs.read_file(&ip, &mut dst, 0), 5000);
    assert_eq!(&dst[..5000], &src[..]);
    fs.close(ip);

    // same bytes after a remount
    let fs = FileSystem::mount(disk).unwrap();
    let ctx = fs.begin_op();
    let ip = fs.open(&ctx, "/big").unwrap();
    fs.end_op(ctx);
    let mut dst = vec![0u8; 5000];
    assert_eq!(fs.read_file(&ip, &mut dst, 0), 5000);
    assert_eq!(dst, src);
    fs.close(ip);
}

#[test]
fn overwrite_in_the_middle_keeps_size() {
    let (_disk, fs) = fresh(1000);
    let ctx = fs.begin_op();
    let ip = fs.create(&ctx, "/f", FileKind::File).unwrap();
    fs.end_op(ctx);

    fs.write_file(&ip, &pattern(3 * BSIZE, 2), 0);
    fs.write_file(&ip, b"patched", BSIZE - 3);
    assert_eq!(fs.stat(&ip).size, 3 * BSIZE);
    let mut dst = [0u8; 7];
    fs.read_file(&ip, &mut dst, BSIZE - 3);
    assert_eq!(&dst, b"patched");
    fs.close(ip);
}

#[test]
fn file_can_reach_max_size() {
    let (_disk, fs) = fresh(2000);
    let ctx = fs.begin_op();
    let ip = fs.create(&ctx, "/max", FileKind::File).unwrap();
    fs.end_op(ctx);

    let src = pattern(MAXFILE_BYTES, 3);
    assert_eq!(fs.write_file(&ip, &src, 0), MAXFILE_BYTES);
    let mut dst = vec![0u8; MAXFILE_BYTES];
    assert_eq!(fs.read_file(&ip, &mut dst, 0), MAXFILE_BYTES);
    assert!(dst == src);
    fs.close(ip);
}

#[test]
fn directory_slots_are_reused_after_unlink() {
    let (_disk, fs) = fresh(1000);
    let root = fs.inodes().root();
    let base = fs.stat(&root).size;

    let ctx = fs.begin_op();
    for name in ["/a", "/b"] {
        let ip = fs.create(&ctx, name, FileKind::File).unwrap();
        fs.inodes().put(&ctx, ip);
    }
    fs.end_op(ctx);
    assert_eq!(fs.stat(&root).size, base + 2 * DIRENT_SIZE);

    let ctx = fs.begin_op();
    fs.unlink(&ctx, "/a").unwrap();
    assert!(fs.open(&ctx, "/a").is_err());
    let c = fs.create(&ctx, "/c", FileKind::File).unwrap();
    fs.inodes().put(&ctx, c);
    fs.end_op(ctx);

    assert_eq!(fs.stat(&root).size, base + 2 * DIRENT_SIZE);
    let names: Vec<_> = fs.read_dir(&root).unwrap().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, [".", "..", "c", "b"]);
    fs.close(root);
}

#[test]
fn long_names_are_truncated() {
    let (_disk, fs) = fresh(1000);
    let ctx = fs.begin_op();
    let ip = fs.create(&ctx, "/abcdefghijklmnopqrstuvwxyz", FileKind::File).unwrap();
    let same = fs.open(&ctx, "/abcdefghijklmn").unwrap();
    assert_eq!(ip.inum(), same.inum());
    fs.inodes().put(&ctx, ip);
    fs.inodes().put(&ctx, same);
    fs.end_op(ctx);
}

#[test]
fn nested_tree_survives_remount() {
    let (disk, fs) = fresh(1000);
    let ctx = fs.begin_op();
    for dir in ["/etc", "/etc/conf.d", "/home"] {
        let ip = fs.create(&ctx, dir, FileKind::Directory).unwrap();
        fs.inodes().put(&ctx, ip);
    }
    fs.end_op(ctx);
    let ctx = fs.begin_op();
    let ip = fs.create(&ctx, "/etc/conf.d/net", FileKind::File).unwrap();
    fs.end_op(ctx);
    fs.write_file(&ip, b"dhcp", 0);
    fs.close(ip);
    drop(fs);

    let fs = FileSystem::mount(disk).unwrap();
    let ctx = fs.begin_op();
    let etc = fs.open(&ctx, "/etc").unwrap();
    let net = fs.open(&ctx, "/home/../etc/conf.d/net").unwrap();
    let up = fs.open(&ctx, "/etc/conf.d/..").unwrap();
    fs.end_op(ctx);
    assert_eq!(up.inum(), etc.inum());
    assert_eq!(fs.stat(&etc).nlink, 2);
    let mut buf = [0u8; 8];
    let n = fs.read_file(&net, &mut buf, 0);
    assert_eq!(&buf[..n], b"dhcp");
    let root = fs.inodes().root();
    assert_eq!(fs.stat(&root).nlink, 3);
    for ip in [etc, net, up, root] {
        fs.close(ip);
    }
}

#[test]
fn parallel_writers_get_distinct_inodes_and_blocks() {
    let (disk, fs) = fresh(2000);
    let free = fs.bitmap().count_free();
    let inums: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let fs = &fs;
                s.spawn(move || {
                    let path = format!("/f{t}");
                    let ctx = fs.begin_op();
                    let ip = fs.create(&ctx, &path, FileKind::File).unwrap();
                    fs.end_op(ctx);
                    fs.write_file(&ip, &pattern(4 * BSIZE, t), 0);
                    let inum = ip.inum();
                    fs.close(ip);
                    inum
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    let unique: HashSet<_> = inums.iter().copied().collect();
    assert_eq!(unique.len(), 4);
    assert!(!unique.contains(&ROOTINO));
    assert_eq!(fs.log_mgr().outstanding(), 0);
    assert_eq!(fs.bitmap().count_free(), free - 16);
    drop(fs);

    let fs = FileSystem::mount(disk).unwrap();
    for t in 0..4 {
        let ctx = fs.begin_op();
        let ip = fs.open(&ctx, &format!("/f{t}")).unwrap();
        fs.end_op(ctx);
        let mut dst = vec![0u8; 4 * BSIZE];
        assert_eq!(fs.read_file(&ip, &mut dst, 0), 4 * BSIZE);
        assert_eq!(dst, pattern(4 * BSIZE, t));
        fs.close(ip);
    }
    assert_eq!(fs.bitmap().count_free(), free - 16);
}

#[test]
fn independent_file_systems_share_nothing() {
    let (_d1, one) = fresh(1000);
    let (_d2, two) = fresh(1000);
    let ctx = one.begin_op();
    let ip = one.create(&ctx, "/only-here", FileKind::File).unwrap();
    one.inodes().put(&ctx, ip);
    one.end_op(ctx);

    let ctx = two.begin_op();
    assert!(two.open(&ctx, "/only-here").is_err());
    two.end_op(ctx);
    assert_eq!(two.log_mgr().commit_count(), 1);
}
