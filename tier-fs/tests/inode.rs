//! 文件读写、按需增长与回收，经 [`TierFs`] 服务入口驱动

mod common;

use std::sync::Arc;
use std::thread;

use common::pattern;
use common::CountingDisk;
use common::MemDisk;
use tier_fs::Match;
use tier_fs::TierFs;
use tier_fs::CACHE_SLOTS;
use tier_fs::MAX_LENGTH;
use tier_fs::SECTOR_SIZE;

#[test]
fn roundtrip_crosses_all_index_tiers() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();

    // 301 个数据扇区，尾部落在二级索引里
    let payload = pattern(7, 153_723);
    assert!(fs.create_file(&root, "deep.bin", payload.len() as u32));
    let inode = fs.open_file(&root, "deep.bin").unwrap();
    assert_eq!(inode.write_at(0, &payload), payload.len());

    let mut read_back = vec![0u8; payload.len()];
    assert_eq!(inode.read_at(0, &mut read_back), payload.len());
    assert_eq!(read_back, payload);

    // 跨索引层边界的零散读：63488 进一级索引，129024 进二级索引
    for offset in [0usize, 63_487, 63_488, 129_023, 129_024, 153_000] {
        let mut chunk = [0u8; 97];
        assert_eq!(inode.read_at(offset, &mut chunk), 97);
        assert_eq!(&chunk[..], &payload[offset..offset + 97]);
    }

    // 纯翻译：文件末尾之外无扇区
    assert!(inode.byte_to_sector(payload.len() - 1).is_some());
    assert!(inode.byte_to_sector(payload.len()).is_none());

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn preallocated_space_reads_as_zeros() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();

    assert!(fs.create_file(&root, "blank", 70_000));
    let inode = fs.open_file(&root, "blank").unwrap();
    assert_eq!(inode.length(), 70_000);

    let mut buf = vec![0xFFu8; 70_000];
    assert_eq!(inode.read_at(0, &mut buf), 70_000);
    assert!(buf.iter().all(|&byte| byte == 0));

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn growth_allocates_exactly_once() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();

    assert!(fs.create_file(&root, "grow", 0));
    let inode = fs.open_file(&root, "grow").unwrap();
    let before = fs.free_sectors();

    // 第一次越尾写长出两个数据扇区
    assert_eq!(inode.write_at(0, &[1u8; 1000]), 1000);
    assert_eq!(inode.length(), 1000);
    assert_eq!(before - fs.free_sectors(), 2);

    // 同范围重写不再分配
    assert_eq!(inode.write_at(0, &[2u8; 1000]), 1000);
    assert_eq!(before - fs.free_sectors(), 2);

    // 尾部续写只补差额
    assert_eq!(inode.write_at(1000, &[3u8; 100]), 100);
    assert_eq!(inode.length(), 1100);
    assert_eq!(before - fs.free_sectors(), 3);

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn write_beyond_end_zero_fills_the_gap() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();

    assert!(fs.create_file(&root, "gap", 0));
    let inode = fs.open_file(&root, "gap").unwrap();

    assert_eq!(inode.write_at(2000, b"tail"), 4);
    assert_eq!(inode.length(), 2004);

    let mut head = vec![0xFFu8; 2000];
    assert_eq!(inode.read_at(0, &mut head), 2000);
    assert!(head.iter().all(|&byte| byte == 0));

    let mut tail = [0u8; 4];
    assert_eq!(inode.read_at(2000, &mut tail), 4);
    assert_eq!(&tail, b"tail");

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn opens_share_one_in_memory_record() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();
    assert!(fs.create_file(&root, "shared", 512));

    let first = fs.open_file(&root, "shared").unwrap();
    let second = fs.open_file(&root, "shared").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    // 表里只有根目录和这一个文件
    assert_eq!(fs.open_inodes(), 2);

    // 一个句柄写，另一个立刻读到
    assert_eq!(first.write_at(0, b"written by first"), 16);
    let mut buf = [0u8; 16];
    assert_eq!(second.read_at(0, &mut buf), 16);
    assert_eq!(&buf, b"written by first");

    fs.close(first);
    fs.close(second);
    assert_eq!(fs.open_inodes(), 1);
    fs.close_dir(root);
    assert_eq!(fs.open_inodes(), 0);
}

#[test]
fn removed_file_space_returns_at_last_close() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();

    let baseline = fs.free_sectors();
    assert!(fs.create_file(&root, "doomed", 100_000));
    let spent = baseline - fs.free_sectors();
    assert!(spent > 0);

    let inode = fs.open_file(&root, "doomed").unwrap();
    assert!(fs.remove(&root, "doomed"));

    // 名字立即消失，已有句柄照常工作
    assert!(root.lookup("doomed", Match::Any).is_none());
    assert!(fs.open_file(&root, "doomed").is_none());
    assert_eq!(inode.write_at(0, b"still alive"), 11);
    let mut buf = [0u8; 11];
    assert_eq!(inode.read_at(0, &mut buf), 11);
    assert_eq!(&buf, b"still alive");

    // 空间原封不动，直到最后一次关闭才回来
    assert_eq!(baseline - fs.free_sectors(), spent);
    fs.close(inode);
    assert_eq!(fs.free_sectors(), baseline);

    fs.close_dir(root);
}

#[test]
fn deny_write_blocks_until_allowed() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk, 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();
    assert!(fs.create_file(&root, "guarded", 512));

    let writer = fs.open_file(&root, "guarded").unwrap();
    let reader = fs.open_file(&root, "guarded").unwrap();
    writer.deny_write();
    reader.deny_write();

    assert_eq!(writer.write_at(0, b"nope"), 0);
    // 拒写不拦读
    let mut buf = [0u8; 4];
    assert_eq!(reader.read_at(0, &mut buf), 4);

    // 两层拒写要撤两次
    writer.allow_write();
    assert_eq!(writer.write_at(0, b"nope"), 0);
    reader.allow_write();
    assert_eq!(writer.write_at(0, b"yes!"), 4);

    fs.close(writer);
    fs.close(reader);
    fs.close_dir(root);
}

#[test]
fn failed_growth_rolls_back_cleanly() {
    let disk = MemDisk::new(200);
    let fs = TierFs::format(disk, 200, CACHE_SLOTS).unwrap();
    let root = fs.root();

    assert!(fs.create_file(&root, "tight", 0));
    let inode = fs.open_file(&root, "tight").unwrap();
    let free = fs.free_sectors();

    // 300 个数据扇区的胃口在一级索引半途耗尽空间：
    // 数据、索引块连同长度全部回滚
    assert_eq!(inode.write_at(0, &vec![9u8; 153_600]), 0);
    assert_eq!(inode.length(), 0);
    assert_eq!(fs.free_sectors(), free);

    // 缩小胃口就能写进去
    assert_eq!(inode.write_at(0, &vec![9u8; 4096]), 4096);
    assert_eq!(inode.length(), 4096);
    assert_eq!(fs.free_sectors(), free - 8);

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn volume_persists_across_remount() {
    let disk = MemDisk::new(4096);
    let fs = TierFs::format(disk.clone(), 4096, CACHE_SLOTS).unwrap();
    let root = fs.root();
    assert!(fs.create_file(&root, "keep", 0));
    let inode = fs.open_file(&root, "keep").unwrap();
    let payload = pattern(3, 9000);
    assert_eq!(inode.write_at(0, &payload), 9000);
    fs.close(inode);
    fs.close_dir(root);
    let free_before = fs.free_sectors();
    fs.unmount();

    let fs = TierFs::mount(disk, CACHE_SLOTS).unwrap();
    assert_eq!(fs.free_sectors(), free_before);
    let root = fs.root();
    let inode = fs.open_file(&root, "keep").unwrap();
    assert_eq!(inode.length(), 9000);
    let mut read_back = vec![0u8; 9000];
    assert_eq!(inode.read_at(0, &mut read_back), 9000);
    assert_eq!(read_back, payload);
    fs.close(inode);
    fs.close_dir(root);
    fs.unmount();
}

#[test]
fn read_ahead_stages_the_sector_for_later_reads() {
    let mem = MemDisk::new(128);
    let fs = TierFs::format(mem.clone(), 128, CACHE_SLOTS).unwrap();
    let root = fs.root();
    let payload = pattern(11, 3 * SECTOR_SIZE);
    assert!(fs.create_file(&root, "ahead", 0));
    let inode = fs.open_file(&root, "ahead").unwrap();
    assert_eq!(inode.write_at(0, &payload), payload.len());
    fs.close(inode);
    fs.close_dir(root);
    fs.unmount();

    // 重新挂载后缓存一片空白，数谁挨了设备读
    let counting = CountingDisk::new(mem);
    let fs = TierFs::mount(counting.clone(), CACHE_SLOTS).unwrap();
    let root = fs.root();
    let inode = fs.open_file(&root, "ahead").unwrap();

    let target = inode.byte_to_sector(SECTOR_SIZE).unwrap();
    assert_eq!(counting.reads_of(target), 0);

    // 预读恰好装载一次
    inode.read_ahead(SECTOR_SIZE);
    assert_eq!(counting.reads_of(target), 1);

    // 随后的读直接命中，设备不再挨第二次读
    let mut sector = vec![0u8; SECTOR_SIZE];
    assert_eq!(inode.read_at(SECTOR_SIZE, &mut sector), SECTOR_SIZE);
    assert_eq!(counting.reads_of(target), 1);
    assert_eq!(&sector[..], &payload[SECTOR_SIZE..2 * SECTOR_SIZE]);

    // 越过文件末尾的预读连设备都不碰
    let before = counting.total_reads();
    inode.read_ahead(payload.len() + SECTOR_SIZE);
    assert_eq!(counting.total_reads(), before);

    fs.close(inode);
    fs.close_dir(root);
}

#[test]
fn parallel_writers_fill_disjoint_halves() {
    let disk = MemDisk::new(256);
    // 缓存压到八槽，两个写手互相把对方的槽顶出去
    let fs = TierFs::format(disk, 256, 8).unwrap();
    let root = fs.root();
    assert!(fs.create_file(&root, "halves", 0));

    let front = fs.open_file(&root, "halves").unwrap();
    let back = fs.open_file(&root, "halves").unwrap();
    let half = 16 * SECTOR_SIZE;
    let front_payload = pattern(3, half);
    let back_payload = pattern(7, half);
    let free = fs.free_sectors();

    thread::scope(|s| {
        s.spawn(|| assert_eq!(front.write_at(0, &front_payload), half));
        s.spawn(|| assert_eq!(back.write_at(half, &back_payload), half));
    });

    // 两半都完好，竞争的增长合计也只长出三十二个数据扇区
    assert_eq!(front.length() as usize, 2 * half);
    assert_eq!(free - fs.free_sectors(), 32);
    let mut read_back = vec![0u8; 2 * half];
    assert_eq!(front.read_at(0, &mut read_back), 2 * half);
    assert_eq!(&read_back[..half], &front_payload[..]);
    assert_eq!(&read_back[half..], &back_payload[..]);

    fs.close(front);
    fs.close(back);
    fs.close_dir(root);
}

#[test]
fn file_length_clamps_at_its_ceiling() {
    let disk = MemDisk::new(17_000);
    let fs = TierFs::format(disk, 17_000, CACHE_SLOTS).unwrap();
    let root = fs.root();

    assert!(fs.create_file(&root, "ceiling", 0));
    let inode = fs.open_file(&root, "ceiling").unwrap();

    // 整个写入都落在天花板之外：一个扇区也不该分出去
    let free_before = fs.free_sectors();
    assert_eq!(inode.write_at(MAX_LENGTH as usize + 10, &[1u8; 8]), 0);
    assert_eq!(inode.length(), 0);
    assert_eq!(fs.free_sectors(), free_before);

    // 从顶端向外写，越界的部分裁掉
    assert_eq!(inode.write_at(MAX_LENGTH as usize - 4, &[7u8; 100]), 4);
    assert_eq!(inode.length(), MAX_LENGTH);

    // 顶到天花板后一个字节也进不去
    assert_eq!(inode.write_at(MAX_LENGTH as usize, &[7u8; 8]), 0);

    let mut tail = [0u8; 4];
    assert_eq!(inode.read_at(MAX_LENGTH as usize - 4, &mut tail), 4);
    assert_eq!(&tail, &[7u8; 4]);

    fs.close(inode);
    fs.close_dir(root);
}
