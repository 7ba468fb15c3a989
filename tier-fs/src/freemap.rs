//! # 空闲扇区分配层
//!
//! 以整卷粒度的位图记录扇区分配情况，置位表示在用。
//! 位图连同卷头一起持久化在卷首：0 号扇区是卷头（魔数、总扇区数、
//! 位图扇区数），根目录 inode 扇区之后紧跟位图扇区。
//! 挂载时整体读入内存，运行期间只改内存，卸载时写回。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use block_dev::BlockDevice;

use crate::DataSector;
use crate::ROOT_SECTOR;
use crate::{SECTOR_BITS, SECTOR_SIZE};

/// 卷头魔数
pub(crate) const VOLUME_MAGIC: u32 = u32::from_le_bytes(*b"tfsv");

/// 位图的首扇区，紧随卷头与根目录 inode
const BITMAP_START: u32 = ROOT_SECTOR + 1;

/// 空闲扇区分配接口，实现者自行同步
pub trait FreeMap: Send + Sync {
    /// 分配 `count` 个连续扇区并返回首扇区号；空间不足时返回空
    fn allocate(&self, count: u32) -> Option<u32>;

    /// 归还从 `sector` 起的 `count` 个扇区
    fn release(&self, sector: u32, count: u32);
}

/// 随卷持久化的位图分配器
pub struct BitFreeMap {
    words: Mutex<Vec<u64>>,
    total: u32,
}

impl BitFreeMap {
    /// 为全新卷建立位图：卷头、根目录扇区与位图自身预先标记在用。
    /// 卷小到放不下保留扇区时失败。
    pub fn format(total: u32) -> Option<Self> {
        let bitmap_sectors = Self::bitmap_sectors(total);
        let reserved = BITMAP_START + bitmap_sectors;
        if total <= reserved {
            return None;
        }

        let mut words = vec![0u64; (total as usize).div_ceil(64)];
        // 尾部越界的位恒置一，分配永不触及
        for bit in total as usize..words.len() * 64 {
            words[bit / 64] |= 1 << (bit % 64);
        }
        for sector in 0..reserved as usize {
            words[sector / 64] |= 1 << (sector % 64);
        }

        Some(Self {
            words: Mutex::new(words),
            total,
        })
    }

    /// 从卷头与位图扇区恢复分配器；魔数或几何不符时失败
    pub fn load(device: &Arc<dyn BlockDevice>) -> Option<Self> {
        let mut buf: DataSector = [0; SECTOR_SIZE];
        device.read_sector(0, &mut buf);

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let total = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let bitmap_sectors = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if magic != VOLUME_MAGIC || total == 0 || bitmap_sectors != Self::bitmap_sectors(total) {
            return None;
        }

        let mut words = vec![0u64; (total as usize).div_ceil(64)];
        for i in 0..bitmap_sectors {
            device.read_sector(BITMAP_START + i, &mut buf);
            let base = i as usize * (SECTOR_SIZE / 8);
            for (j, chunk) in buf.chunks_exact(8).enumerate() {
                if let Some(word) = words.get_mut(base + j) {
                    *word = u64::from_le_bytes(chunk.try_into().unwrap());
                }
            }
        }

        Some(Self {
            words: Mutex::new(words),
            total,
        })
    }

    /// 把卷头与位图写回设备
    pub fn sync(&self, device: &Arc<dyn BlockDevice>) {
        let words = self.words.lock();
        let bitmap_sectors = Self::bitmap_sectors(self.total);

        let mut header: DataSector = [0; SECTOR_SIZE];
        header[0..4].copy_from_slice(&VOLUME_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&self.total.to_le_bytes());
        header[8..12].copy_from_slice(&bitmap_sectors.to_le_bytes());
        device.write_sector(0, &header);

        for i in 0..bitmap_sectors {
            let mut buf: DataSector = [0; SECTOR_SIZE];
            let base = i as usize * (SECTOR_SIZE / 8);
            for (j, chunk) in buf.chunks_exact_mut(8).enumerate() {
                if let Some(word) = words.get(base + j) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
            }
            device.write_sector(BITMAP_START + i, &buf);
        }
    }

    /// 尚未分配的扇区数
    pub fn free_sectors(&self) -> u32 {
        // 越界位恒为一，零位只出现在卷界之内
        self.words
            .lock()
            .iter()
            .map(|word| word.count_zeros())
            .sum()
    }

    /// 卷的总扇区数
    #[inline]
    pub fn total_sectors(&self) -> u32 {
        self.total
    }

    /// 容纳 `total` 个扇区需要的位图扇区数
    pub(crate) fn bitmap_sectors(total: u32) -> u32 {
        (total as usize).div_ceil(SECTOR_BITS) as u32
    }
}

impl FreeMap for BitFreeMap {
    fn allocate(&self, count: u32) -> Option<u32> {
        assert!(count > 0);
        let mut words = self.words.lock();

        // 单扇区快路径：找第一个还有零位的组
        if count == 1 {
            let (group, bit) = words.iter().enumerate().find_map(|(group, &bits)| {
                (bits != u64::MAX).then_some((group, bits.trailing_ones() as usize))
            })?;
            words[group] |= 1 << bit;
            return Some((group * 64 + bit) as u32);
        }

        // 连续段按首次适应搜索
        let mut run_start = 0;
        let mut run_len = 0;
        for sector in 0..self.total {
            if words[sector as usize / 64] & (1 << (sector % 64)) == 0 {
                if run_len == 0 {
                    run_start = sector;
                }
                run_len += 1;
                if run_len == count {
                    for s in run_start..=sector {
                        words[s as usize / 64] |= 1 << (s % 64);
                    }
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }

        None
    }

    fn release(&self, sector: u32, count: u32) {
        assert!(count > 0);
        let mut words = self.words.lock();

        for s in sector..sector + count {
            assert!(s < self.total);
            // 归还的扇区一定处于在用状态
            assert_ne!(words[s as usize / 64] & (1 << (s % 64)), 0);
            words[s as usize / 64] &= !(1 << (s % 64));
        }
    }
}
