//! # 块设备接口层
//!
//! 块设备是以**扇区**为单位存储数据的设备，例如磁盘、光盘、U盘等；
//! [`BlockDevice`] 就是对读写块设备的抽象，
//! 实现了此特质的类型称为**块设备驱动**。
//!
//! 上层文件系统只通过块设备驱动读写块设备，
//! 读写都是同步的，调用线程阻塞至操作完成。

#![no_std]

use core::any::Any;

/// 块设备驱动特质
pub trait BlockDevice: Send + Sync + Any {
    fn read_sector(&self, sector: u32, buf: &mut [u8]);
    fn write_sector(&self, sector: u32, buf: &[u8]);
}
