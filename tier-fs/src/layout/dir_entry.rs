use core::{mem, ptr, slice};

/// 目录项名字的最大字节长度
pub const NAME_MAX: usize = 25;

/// 目录内容中的定长记录，描述一个子项
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct DirEntry {
    /// 子项 inode 所在扇区
    inode_sector: u32,
    // 最后一字节留给 \0
    name: [u8; NAME_MAX + 1],
    in_use: u8,
    is_dir: u8,
}

const _: () = assert!(mem::size_of::<DirEntry>() == DirEntry::SIZE);

impl DirEntry {
    /// 记录大小恒为32字节
    pub const SIZE: usize = 32;

    /// 构造在用记录；名字为空或超长时构造失败
    pub fn new(name: &str, inode_sector: u32, is_dir: bool) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > NAME_MAX {
            return None;
        }

        let mut name = [0; NAME_MAX + 1];
        name[..bytes.len()].copy_from_slice(bytes);

        Some(Self {
            inode_sector,
            name,
            in_use: 1,
            is_dir: is_dir as u8,
        })
    }

    /// 指向目录自身的 "." 记录
    pub(crate) fn dot(sector: u32) -> Self {
        let mut name = [0; NAME_MAX + 1];
        name[0] = b'.';

        Self {
            inode_sector: sector,
            name,
            in_use: 1,
            is_dir: 1,
        }
    }

    /// 指向父目录的 ".." 记录
    pub(crate) fn dot_dot(sector: u32) -> Self {
        let mut name = [0; NAME_MAX + 1];
        name[..2].copy_from_slice(b"..");

        Self {
            inode_sector: sector,
            name,
            in_use: 1,
            is_dir: 1,
        }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap();
        core::str::from_utf8(&self.name[..len]).unwrap()
    }

    #[inline]
    pub fn inode_sector(&self) -> u32 {
        self.inode_sector
    }

    #[inline]
    pub fn in_use(&self) -> bool {
        self.in_use != 0
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(ptr::from_ref(self).cast(), Self::SIZE) }
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(ptr::from_mut(self).cast(), Self::SIZE) }
    }
}
