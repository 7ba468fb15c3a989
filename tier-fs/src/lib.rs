#![no_std]

extern crate alloc;

/* tier-fs 的整体架构，自上而下 */

// 服务对象层：持有整个卷的缓存表与打开文件表，负责格式化、挂载与卸载
mod fs;
pub use fs::TierFs;

// 目录层：目录是内容为定长目录项数组的 inode
mod dir;
pub use dir::{Dir, Match};

// 索引节点层：实现文件创建、打开、读写、按需增长等操作
mod inode;
pub use inode::Inode;

// 空闲扇区分配层：整卷粒度的位图分配器
mod freemap;
pub use freemap::{BitFreeMap, FreeMap};

// 磁盘数据结构层：表示磁盘文件系统的数据结构
mod layout;
pub use layout::{
    count_data_sectors, count_total_sectors, DirEntry, MAX_LENGTH, NAME_MAX, N_DIRECT,
    PTRS_PER_SECTOR,
};

// 块缓存层：内存上的磁盘扇区数据缓存
mod cache;
pub use cache::{BlockCache, SlotFlag, SlotKey, SlotRef};

// 磁盘块设备接口层：读写磁盘块设备的接口
pub use block_dev::BlockDevice;

pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_BITS: usize = SECTOR_SIZE * 8;

/// 根目录 inode 所在扇区，格式化时固定
pub const ROOT_SECTOR: u32 = 1;
/// 根目录的初始目录项容量
pub const ROOT_DIR_CAPACITY: u32 = 16;
/// 服务对象与宿主工具默认采用的缓存槽数
pub const CACHE_SLOTS: usize = 64;

type DataSector = [u8; SECTOR_SIZE];
