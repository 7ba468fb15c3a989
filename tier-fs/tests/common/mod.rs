//! 集成测试共用的设备桩

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tier_fs::BlockDevice;
use tier_fs::SECTOR_SIZE;

/// 内存扇区设备
pub struct MemDisk {
    inner: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(total_sectors: u32) -> Arc<Self> {
        let size = total_sectors as usize * SECTOR_SIZE;
        Arc::new(MemDisk {
            inner: Mutex::new(vec![0u8; size]),
        })
    }

    /// 越过上层直接取设备上一个扇区的字节
    pub fn raw_sector(&self, sector: u32) -> Vec<u8> {
        let data = self.inner.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].to_vec()
    }
}

impl BlockDevice for MemDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let data = self.inner.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        assert_eq!(buf.len(), SECTOR_SIZE);
        let mut data = self.inner.lock().unwrap();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

/// 套在内存设备外面数读取次数，观测缓存有没有多碰设备
pub struct CountingDisk {
    inner: Arc<MemDisk>,
    reads: Mutex<BTreeMap<u32, u32>>,
}

impl CountingDisk {
    pub fn new(inner: Arc<MemDisk>) -> Arc<Self> {
        Arc::new(CountingDisk {
            inner,
            reads: Mutex::new(BTreeMap::new()),
        })
    }

    /// 指定扇区挨过几次设备读
    pub fn reads_of(&self, sector: u32) -> u32 {
        self.reads.lock().unwrap().get(&sector).copied().unwrap_or(0)
    }

    /// 全部扇区的设备读总数
    pub fn total_reads(&self) -> u32 {
        self.reads.lock().unwrap().values().sum()
    }
}

impl BlockDevice for CountingDisk {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) {
        *self.reads.lock().unwrap().entry(sector).or_insert(0) += 1;
        self.inner.read_sector(sector, buf);
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) {
        self.inner.write_sector(sector, buf);
    }
}

/// 读回校验用的确定性字节串
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
