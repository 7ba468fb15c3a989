//! # 目录层
//!
//! 目录是内容为定长记录数组的 inode，别无其他结构。头两条记录
//! 固定是 `.` 与 `..`，查找把它们当普通记录命中，列目录则跳过。
//! 删除记录只抹掉槽位，文件长度不回缩，空闲槽留待新记录复用。
//!
//! 同一目录上的并发修改须由调用方串行化；[`TierFs`] 的命名空间
//! 操作已经这样做了。

use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use crate::fs::TierFs;
use crate::inode::Inode;
use crate::layout::DirEntry;

/// 查找时对记录类别的要求
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// 只命中文件记录
    File,
    /// 只命中子目录记录
    Dir,
    /// 文件与子目录皆可，同名并存时先到先得
    Any,
}

/// 打开的目录句柄，自带列目录游标
pub struct Dir {
    inode: Arc<Inode>,
    /// 下一条待检视记录的序号
    pos: Mutex<u32>,
}

impl Dir {
    pub(crate) fn open(inode: Arc<Inode>) -> Self {
        assert!(inode.is_dir());
        Self {
            inode,
            pos: Mutex::new(0),
        }
    }

    pub(crate) fn into_inode(self) -> Arc<Inode> {
        self.inode
    }

    /// 目录自身的 inode
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    #[inline]
    pub fn sector(&self) -> u32 {
        self.inode.sector()
    }

    /// 在目录中查找名字，点记录同样参与匹配。
    /// 命中返回目标的 inode 扇区与类别
    pub fn lookup(&self, name: &str, want: Match) -> Option<(u32, bool)> {
        self.lookup_record(name, want)
            .map(|(_, entry)| (entry.inode_sector(), entry.is_dir()))
    }

    /// 登记一条新记录，优先复用空闲槽，没有就在末尾追加。
    /// 名字非法、同名同类已存在或目录无法再增长时失败
    pub fn add(&self, name: &str, sector: u32, is_dir: bool) -> bool {
        let Some(entry) = DirEntry::new(name, sector, is_dir) else {
            return false;
        };
        // 同名同类即冲突，文件与子目录可同名并存
        let conflict = if is_dir { Match::Dir } else { Match::File };
        if self.lookup_record(name, conflict).is_some() {
            return false;
        }

        let count = self.record_count();
        let slot = (0..count)
            .find(|&index| !self.read_record(index).in_use())
            .unwrap_or(count);

        // 记录不跨扇区，追加时增长失败即写不进任何字节
        self.inode
            .write_at(slot as usize * DirEntry::SIZE, entry.as_bytes())
            == DirEntry::SIZE
    }

    /// 删除一条记录并把目标 inode 标记为待回收。点记录不可删；
    /// 目标是目录时须为空目录。同名并存时删去先找到的记录
    pub fn remove(&self, fs: &TierFs, name: &str) -> bool {
        if name == "." || name == ".." {
            return false;
        }
        let Some((slot, entry)) = self.lookup_record(name, Match::Any) else {
            return false;
        };

        // 经打开文件表走一遭，与并行开启者共享同一条内存记录
        let Some(target) = fs.open_inode(entry.inode_sector(), entry.is_dir()) else {
            return false;
        };
        if target.is_dir() && !Dir::open(target.clone()).is_empty() {
            fs.close_inode(target);
            return false;
        }

        self.write_record(slot, &DirEntry::default());
        target.mark_removed();
        fs.close_inode(target);
        true
    }

    /// 依游标读出下一条在用记录的名字，点记录不上报，到尾为空。
    /// 游标属于句柄，重新打开目录即回到开头
    pub fn read_next(&self) -> Option<String> {
        let mut pos = self.pos.lock();
        while *pos < self.record_count() {
            let entry = self.read_record(*pos);
            *pos += 1;
            if entry.in_use() && entry.name() != "." && entry.name() != ".." {
                return Some(String::from(entry.name()));
            }
        }
        None
    }

    /// 除点记录外再无在用记录即为空
    pub fn is_empty(&self) -> bool {
        (0..self.record_count()).all(|index| {
            let entry = self.read_record(index);
            !entry.in_use() || entry.name() == "." || entry.name() == ".."
        })
    }

    fn lookup_record(&self, name: &str, want: Match) -> Option<(u32, DirEntry)> {
        (0..self.record_count())
            .map(|index| (index, self.read_record(index)))
            .find(|(_, entry)| {
                entry.in_use()
                    && entry.name() == name
                    && match want {
                        Match::File => !entry.is_dir(),
                        Match::Dir => entry.is_dir(),
                        Match::Any => true,
                    }
            })
    }

    /// 目录当前的记录总数，含空闲槽
    fn record_count(&self) -> u32 {
        self.inode.length() / DirEntry::SIZE as u32
    }

    fn read_record(&self, index: u32) -> DirEntry {
        let mut entry = DirEntry::default();
        let read = self
            .inode
            .read_at(index as usize * DirEntry::SIZE, entry.as_bytes_mut());
        assert_eq!(read, DirEntry::SIZE);
        entry
    }

    fn write_record(&self, index: u32, entry: &DirEntry) {
        let written = self
            .inode
            .write_at(index as usize * DirEntry::SIZE, entry.as_bytes());
        assert_eq!(written, DirEntry::SIZE);
    }
}
