//! # 磁盘数据结构层
//!
//! 卷上除空闲位图外的所有定长结构：
//! 索引节点、间接索引块与目录项记录。

mod dir_entry;
mod inode;

pub use dir_entry::{DirEntry, NAME_MAX};
pub use inode::{
    count_data_sectors, count_total_sectors, DiskInode, MAX_LENGTH, N_DIRECT, PTRS_PER_SECTOR,
};

pub(crate) use inode::{IndexPath, IndirectBlock};
