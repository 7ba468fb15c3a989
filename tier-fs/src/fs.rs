//! # 卷服务层
//!
//! [`TierFs`] 把块缓存、空闲图与打开文件表攥在一起，对外提供
//! 命名空间操作。卷上扇区 0 存空闲图头部，扇区 1 固定是根目录的
//! inode，随后是空闲图位图，余下的扇区归数据与索引块。
//!
//! 命名空间的结构操作（建立、删除、按名字打开）由一把服务级锁
//! 串行化，防止查到的扇区在打开前被回收；已打开文件上的读写
//! 不经过这把锁。

use alloc::sync::Arc;

use block_dev::BlockDevice;
use log::debug;
use spin::Mutex;

use crate::cache::{BlockCache, SlotKey};
use crate::dir::{Dir, Match};
use crate::freemap::{BitFreeMap, FreeMap};
use crate::inode::{create_on_disk, release_on_disk, Inode, InodeTable, WalkCtx};
use crate::layout::{DirEntry, DiskInode};
use crate::{ROOT_DIR_CAPACITY, ROOT_SECTOR};

/// 单卷文件系统的服务对象
pub struct TierFs {
    device: Arc<dyn BlockDevice>,
    cache: Arc<BlockCache>,
    freemap: Arc<BitFreeMap>,
    inodes: InodeTable,
    /// 命名空间锁
    ns: Mutex<()>,
}

impl TierFs {
    /// 在设备上铺设新卷：重建空闲图并写出空的根目录，返回已挂载
    /// 的卷。设备容不下元数据时失败
    pub fn format(
        device: Arc<dyn BlockDevice>,
        total_sectors: u32,
        cache_slots: usize,
    ) -> Option<Self> {
        let freemap = Arc::new(BitFreeMap::format(total_sectors)?);
        let fs = Self {
            cache: Arc::new(BlockCache::new(device.clone(), cache_slots)),
            device,
            freemap,
            inodes: InodeTable::new(),
            ns: Mutex::new(()),
        };

        if !fs.build_dir(ROOT_SECTOR, ROOT_DIR_CAPACITY, ROOT_SECTOR) {
            return None;
        }
        fs.cache.sync_all();
        fs.freemap.sync(&fs.device);
        debug!(
            "formatted volume: {} sectors, {} free",
            total_sectors,
            fs.freemap.free_sectors()
        );
        Some(fs)
    }

    /// 挂载既有卷。空闲图对不上号或根扇区没有 inode 都算坏卷
    pub fn mount(device: Arc<dyn BlockDevice>, cache_slots: usize) -> Option<Self> {
        let freemap = Arc::new(BitFreeMap::load(&device)?);
        let fs = Self {
            cache: Arc::new(BlockCache::new(device.clone(), cache_slots)),
            device,
            freemap,
            inodes: InodeTable::new(),
            ns: Mutex::new(()),
        };

        let root_ok = fs
            .cache
            .get(SlotKey::Meta { sector: ROOT_SECTOR }, ROOT_SECTOR)?
            .map(0, |inode: &DiskInode| inode.is_valid());
        root_ok.then_some(fs)
    }

    /// 把全部脏扇区与空闲图落盘后拆除。之后卷可以重新挂载
    pub fn unmount(self) {
        self.cache.sync_all();
        self.freemap.sync(&self.device);
        debug!("unmounted volume, {} sectors free", self.freemap.free_sectors());
    }

    /// 打开根目录。每次调用都是一个独立引用，用毕交还 [`close_dir`]
    ///
    /// [`close_dir`]: TierFs::close_dir
    pub fn root(&self) -> Dir {
        let inode = self
            .open_inode(ROOT_SECTOR, true)
            .expect("cache exhausted while opening root");
        Dir::open(inode)
    }

    /// 在目录下建立一个预分配 `length` 字节的文件。名字冲突或
    /// 空间不足时失败，已分配的扇区全部收回
    pub fn create_file(&self, dir: &Dir, name: &str, length: u32) -> bool {
        let _ns = self.ns.lock();

        let Some(sector) = self.freemap.allocate(1) else {
            return false;
        };
        let ctx = self.walk_ctx(sector);
        if !create_on_disk(&ctx, length) {
            self.cache.release_meta(sector);
            self.freemap.release(sector, 1);
            return false;
        }
        if !dir.add(name, sector, false) {
            release_on_disk(&ctx);
            return false;
        }
        true
    }

    /// 在目录下建立一个可容 `capacity` 条记录的子目录，点记录
    /// 就位后才登记名字。失败时收回全部分配
    pub fn create_dir(&self, dir: &Dir, name: &str, capacity: u32) -> bool {
        let _ns = self.ns.lock();

        let Some(sector) = self.freemap.allocate(1) else {
            return false;
        };
        if !self.build_dir(sector, capacity, dir.sector()) {
            return false;
        }
        if !dir.add(name, sector, true) {
            release_on_disk(&self.walk_ctx(sector));
            return false;
        }
        true
    }

    /// 按名字打开目录下的文件。同名子目录不碍事
    pub fn open_file(&self, dir: &Dir, name: &str) -> Option<Arc<Inode>> {
        let _ns = self.ns.lock();
        let (sector, _) = dir.lookup(name, Match::File)?;
        self.open_inode(sector, false)
    }

    /// 按名字打开子目录
    pub fn open_dir(&self, dir: &Dir, name: &str) -> Option<Dir> {
        let _ns = self.ns.lock();
        let (sector, _) = dir.lookup(name, Match::Dir)?;
        Some(Dir::open(self.open_inode(sector, true)?))
    }

    /// 删除目录下的一条名字。目标被他人打开时记录即刻消失，
    /// 空间延迟到最后一次关闭再回收
    pub fn remove(&self, dir: &Dir, name: &str) -> bool {
        let _ns = self.ns.lock();
        dir.remove(self, name)
    }

    /// 交还一个打开引用。最后一个引用离开时写回并丢弃其数据槽，
    /// 被标记删除的 inode 连带回收全部空间
    pub fn close(&self, inode: Arc<Inode>) {
        self.inodes.close(inode);
    }

    /// 交还目录句柄
    pub fn close_dir(&self, dir: Dir) {
        self.inodes.close(dir.into_inode());
    }

    /// 不关任何句柄，把脏数据与空闲图落盘一遍
    pub fn sync(&self) {
        self.cache.sync_all();
        self.freemap.sync(&self.device);
    }

    /// 打开文件表里的记录数
    pub fn open_inodes(&self) -> usize {
        self.inodes.len()
    }

    pub fn free_sectors(&self) -> u32 {
        self.freemap.free_sectors()
    }

    pub fn total_sectors(&self) -> u32 {
        self.freemap.total_sectors()
    }

    pub(crate) fn open_inode(&self, sector: u32, is_dir: bool) -> Option<Arc<Inode>> {
        let freemap: Arc<dyn FreeMap> = self.freemap.clone();
        self.inodes.open(&self.cache, &freemap, sector, is_dir)
    }

    pub(crate) fn close_inode(&self, inode: Arc<Inode>) {
        self.inodes.close(inode);
    }

    /// 在指定扇区构筑新目录：预分配记录区并写入两条点记录。
    /// 任何一步失败都撤销包括扇区自身在内的全部分配
    fn build_dir(&self, sector: u32, capacity: u32, parent: u32) -> bool {
        // 点记录至少要占两席
        let capacity = capacity.max(2);
        let ctx = self.walk_ctx(sector);

        if !create_on_disk(&ctx, capacity * DirEntry::SIZE as u32) {
            self.cache.release_meta(sector);
            self.freemap.release(sector, 1);
            return false;
        }

        let Some(inode) = self.open_inode(sector, true) else {
            release_on_disk(&ctx);
            return false;
        };
        let dot = DirEntry::dot(sector);
        let dot_dot = DirEntry::dot_dot(parent);
        let ok = inode.write_at(0, dot.as_bytes()) == DirEntry::SIZE
            && inode.write_at(DirEntry::SIZE, dot_dot.as_bytes()) == DirEntry::SIZE;
        self.inodes.close(inode);

        if !ok {
            release_on_disk(&ctx);
        }
        ok
    }

    fn walk_ctx(&self, sector: u32) -> WalkCtx<'_> {
        WalkCtx {
            cache: &self.cache,
            freemap: &*self.freemap,
            inode_sector: sector,
        }
    }
}
