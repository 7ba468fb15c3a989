//! 索引节点与间接索引块
//! - 直接索引：inode 自带的扇区号表，每个编号指向一个**数据扇区**
//! - 一级索引：整个扇区连续存储扇区号，每个编号指向一个数据扇区
//! - 二级索引：外层表的每个编号指向一张内层表，内层表的编号指向数据扇区
//!
//! ## 扇区索引编码
//!
//! - 越过直接容量后，索引减去直接容量即是一级索引块的内部位置
//! - 越过一级容量后，余下部分除以单表容量得外层表位置，取模得内层表位置

use core::mem;

use crate::SECTOR_SIZE;

/// 间接索引块的编号容量
pub const PTRS_PER_SECTOR: usize = SECTOR_SIZE / mem::size_of::<u32>();
/// 间接索引块
pub(crate) type IndirectBlock = [u32; PTRS_PER_SECTOR];

/// 直接索引的编号数量
pub const N_DIRECT: usize = 124;
/// inode 扇区号表的槽数：直接索引加上两个间接索引槽
const SECTOR_SLOTS: usize = N_DIRECT + 2;

/// 只用直接索引时的编号容量
const DIRECT_CAP: usize = N_DIRECT;
/// 用上一级索引时的编号容量
const INDIRECT1_CAP: usize = DIRECT_CAP + PTRS_PER_SECTOR;
/// 用上二级索引时的编号容量
const INDIRECT2_CAP: usize = INDIRECT1_CAP + PTRS_PER_SECTOR * PTRS_PER_SECTOR;

/// 单个文件的字节容量上限
pub const MAX_LENGTH: u32 = (INDIRECT2_CAP * SECTOR_SIZE) as u32;

/// inode 扇区的校验标志
pub(crate) const INODE_TAG: u32 = u32::from_le_bytes(*b"tfsi");

/// 磁盘上的索引节点，恰好占据一个扇区
#[repr(C)]
pub struct DiskInode {
    /// 文件长度，单位字节
    // 不用usize是为了严控布局
    pub length: u32,
    /// 扇区号表；槽 `INDIRECT1`、`INDIRECT2` 分别存一级、二级索引块的扇区号
    sectors: [u32; SECTOR_SLOTS],
    /// 校验标志，防止把普通数据扇区当作 inode 使用
    tag: u32,
}

const _: () = assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    /// 一级索引块扇区号的槽位
    pub(crate) const INDIRECT1: usize = N_DIRECT;
    /// 二级索引块扇区号的槽位
    pub(crate) const INDIRECT2: usize = N_DIRECT + 1;

    pub fn init(&mut self) {
        self.length = 0;
        self.sectors.fill(0);
        self.tag = INODE_TAG;
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.tag == INODE_TAG
    }

    #[inline]
    pub(crate) fn sector_at(&self, slot: usize) -> u32 {
        self.sectors[slot]
    }

    #[inline]
    pub(crate) fn set_sector_at(&mut self, slot: usize, sector: u32) {
        self.sectors[slot] = sector;
    }
}

/// 文件内扇区索引在三级索引结构中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexPath {
    /// 直接索引槽位
    Direct(usize),
    /// 一级索引块的内部位置
    Indirect(usize),
    /// 二级索引的外层表位置与内层表位置
    DoublyIndirect(usize, usize),
}

impl IndexPath {
    /// 索引超出编号容量时返回空
    pub(crate) fn classify(index: usize) -> Option<Self> {
        if index < DIRECT_CAP {
            Some(Self::Direct(index))
        } else if index < INDIRECT1_CAP {
            Some(Self::Indirect(index - DIRECT_CAP))
        } else if index < INDIRECT2_CAP {
            let index = index - INDIRECT1_CAP;
            Some(Self::DoublyIndirect(
                index / PTRS_PER_SECTOR,
                index % PTRS_PER_SECTOR,
            ))
        } else {
            None
        }
    }
}

/// 计算容纳指定数据量需要多少个**数据扇区**
#[inline]
pub fn count_data_sectors(length: u32) -> usize {
    (length as usize).div_ceil(SECTOR_SIZE)
}

/// 计算给定数据扇区数需要多少个**索引扇区**（`IndirectBlock`）
pub fn count_index_sectors(data_sectors: usize) -> usize {
    let mut total = 0;

    // 超出直接索引，使用一级索引块
    if data_sectors > DIRECT_CAP {
        total += 1;
    }

    // 超出一级索引，使用二级索引的外层表与内层表
    if data_sectors > INDIRECT1_CAP {
        total += 1 + (data_sectors - INDIRECT1_CAP).div_ceil(PTRS_PER_SECTOR);
    }

    total
}

/// 计算容纳指定数据量需要多少个**数据扇区**和**索引扇区**
#[inline]
pub fn count_total_sectors(length: u32) -> usize {
    let data_sectors = count_data_sectors(length);
    data_sectors + count_index_sectors(data_sectors)
}
