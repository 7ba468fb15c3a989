//! # 索引节点层
//!
//! 打开的文件在内存中由 [`Inode`] 记录表示：同一扇区至多一条记录，
//! 所有打开者共享；引用计数归零时撤表销毁，若此前被标记删除，
//! 销毁前沿索引结构反向释放其全部扇区。
//!
//! 读写按字节寻址，途经块缓存逐扇区进行。越过文件末尾的写入触发
//! 按需增长：在增长锁内逐扇区链入清零的新扇区，索引块恰好在跨越
//! 索引边界时建立，全部成功后才更新文件长度。
//!
//! 锁序：打开文件表 → 增长锁 → 缓存时钟指针 → 槽元数据 → 槽缓冲区。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use log::debug;
use spin::Mutex;

use crate::cache::{BlockCache, SlotKey, SlotRef};
use crate::freemap::FreeMap;
use crate::layout::{count_data_sectors, DiskInode, IndexPath, IndirectBlock, MAX_LENGTH};
use crate::DataSector;
use crate::SECTOR_SIZE;

/// 零扇区，清零新分配的数据扇区时使用
static ZERO_SECTOR: DataSector = [0; SECTOR_SIZE];

/// 打开文件的内存记录
pub struct Inode {
    /// 磁盘 inode 所在扇区，亦是记录的身份
    sector: u32,
    is_dir: bool,
    cache: Arc<BlockCache>,
    freemap: Arc<dyn FreeMap>,
    state: Mutex<InodeState>,
    /// 增长锁，序列化同一文件的并发扩展
    grow: Mutex<()>,
}

struct InodeState {
    /// 磁盘长度的内存副本，增长成功后方更新
    length: u32,
    open_cnt: u32,
    removed: bool,
    deny_write_cnt: u32,
}

impl Inode {
    #[inline]
    pub fn sector(&self) -> u32 {
        self.sector
    }

    #[inline]
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn length(&self) -> u32 {
        self.state.lock().length
    }

    /// 从字节偏移 `offset` 读出数据填充 `buf`，返回读到的字节数。
    /// 读不越过文件末尾；缓存槽全部被钉住时提前截断。
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let length = self.length() as usize;
        let mut start = offset;
        let end = (start + buf.len()).min(length);

        if start >= end {
            return 0;
        }

        let mut read_size = 0;
        loop {
            let sector_index = start / SECTOR_SIZE;
            // 当前扇区的读取终点（字节）
            let current_sector_end = ((sector_index + 1) * SECTOR_SIZE).min(end);
            let copy_size = current_sector_end - start;

            let Some(slot) = self.data_slot(sector_index) else {
                break;
            };
            let dest = &mut buf[read_size..read_size + copy_size];
            slot.map(0, |data: &DataSector| {
                // 绝对地址 % 扇区大小 = 扇区内偏移
                let src = &data[start % SECTOR_SIZE..start % SECTOR_SIZE + copy_size];
                dest.copy_from_slice(src);
            });

            read_size += copy_size;
            if current_sector_end == end {
                break;
            }
            start = current_sector_end;
        }

        read_size
    }

    /// 向字节偏移 `offset` 写入 `buf`，返回写入的字节数。
    /// 越过文件末尾的部分触发按需增长，增长失败时写入截断到旧长度。
    /// 拒写计数非零期间不写入，返回 0。
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.state.lock().deny_write_cnt > 0 {
            return 0;
        }

        // 越限部分落不下一个字节时不值得增长
        let target = (offset + buf.len()).min(MAX_LENGTH as usize);
        if target <= offset {
            return 0;
        }
        let target = target as u32;
        if target > self.length() {
            self.extend_to(target);
        }

        let length = self.length() as usize;
        let mut start = offset;
        let end = (start + buf.len()).min(length);
        if start >= end {
            return 0;
        }

        let mut written_size = 0;
        loop {
            let sector_index = start / SECTOR_SIZE;
            let current_sector_end = ((sector_index + 1) * SECTOR_SIZE).min(end);
            let copy_size = current_sector_end - start;

            let Some(slot) = self.data_slot(sector_index) else {
                break;
            };
            let src = &buf[written_size..written_size + copy_size];
            slot.map_mut(0, |data: &mut DataSector| {
                let dest = &mut data[start % SECTOR_SIZE..start % SECTOR_SIZE + copy_size];
                dest.copy_from_slice(src);
            });

            written_size += copy_size;
            if current_sector_end == end {
                break;
            }
            start = current_sector_end;
        }

        written_size
    }

    /// 字节偏移到物理扇区的纯翻译，不分配；`pos` 越过文件末尾时为空
    pub fn byte_to_sector(&self, pos: usize) -> Option<u32> {
        if pos >= self.length() as usize {
            return None;
        }
        self.walk(pos / SECTOR_SIZE, IndexOp::Lookup)
    }

    /// 预取提示：经受保护置换把覆盖 `offset` 的扇区装入缓存。
    /// 偏移越界或缓存无可让出的槽时静默忽略。
    /// 独立于读路径，是否调用由上层自行决定。
    pub fn read_ahead(&self, offset: usize) {
        if offset >= self.length() as usize {
            return;
        }

        let sector_index = offset / SECTOR_SIZE;
        if let Some(sector) = self.walk(sector_index, IndexOp::Lookup) {
            self.cache.prefetch(
                SlotKey::Data {
                    owner: self.sector,
                    offset: (sector_index * SECTOR_SIZE) as u32,
                },
                sector,
                None,
            );
        }
    }

    /// 拒写嵌套加一。拒写计数超过打开计数是调用方缺陷
    pub fn deny_write(&self) {
        let mut state = self.state.lock();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// 撤销一层拒写
    pub fn allow_write(&self) {
        let mut state = self.state.lock();
        assert!(state.deny_write_cnt > 0);
        state.deny_write_cnt -= 1;
    }

    /// 标记删除，空间在最后一次关闭时回收。重复标记是调用方缺陷
    pub(crate) fn mark_removed(&self) {
        let mut state = self.state.lock();
        assert!(!state.removed, "inode storage removed twice");
        state.removed = true;
    }
}

impl Inode {
    /// 取出覆盖指定扇区索引的数据槽；索引未映射或缓存耗尽时为空
    fn data_slot(&self, sector_index: usize) -> Option<SlotRef<'_>> {
        let sector = self.walk(sector_index, IndexOp::Lookup)?;
        self.cache.get(
            SlotKey::Data {
                owner: self.sector,
                offset: (sector_index * SECTOR_SIZE) as u32,
            },
            sector,
        )
    }

    fn walk(&self, sector_index: usize, op: IndexOp) -> Option<u32> {
        let ctx = WalkCtx {
            cache: &self.cache,
            freemap: &*self.freemap,
            inode_sector: self.sector,
        };
        walk(&ctx, sector_index, op)
    }

    /// 在增长锁内把文件扩展到 `target` 字节
    fn extend_to(&self, target: u32) {
        let _grow = self.grow.lock();

        // 等锁期间别的扩展可能已经覆盖了目标
        let old_length = self.length();
        if target <= old_length {
            return;
        }

        let ctx = WalkCtx {
            cache: &self.cache,
            freemap: &*self.freemap,
            inode_sector: self.sector,
        };
        if extend(&ctx, old_length, target) {
            self.state.lock().length = target;
        }
    }
}

/// 打开文件表：扇区号到内存记录的仲裁者
pub(crate) struct InodeTable {
    inodes: Mutex<BTreeMap<u32, Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            inodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// 打开扇区上的 inode：在表时增加引用，不在表时装入。
    /// 缓存槽全部被钉住时失败；扇区校验失败是卷损坏，视为致命。
    pub(crate) fn open(
        &self,
        cache: &Arc<BlockCache>,
        freemap: &Arc<dyn FreeMap>,
        sector: u32,
        is_dir: bool,
    ) -> Option<Arc<Inode>> {
        let mut inodes = self.inodes.lock();

        if let Some(inode) = inodes.get(&sector) {
            inode.state.lock().open_cnt += 1;
            debug_assert_eq!(inode.is_dir, is_dir);
            return Some(inode.clone());
        }

        let guard = cache.get(SlotKey::Meta { sector }, sector)?;
        let length = guard.map(0, |inode: &DiskInode| {
            assert!(inode.is_valid(), "sector {sector} does not hold an inode");
            inode.length
        });
        drop(guard);

        let inode = Arc::new(Inode {
            sector,
            is_dir,
            cache: cache.clone(),
            freemap: freemap.clone(),
            state: Mutex::new(InodeState {
                length,
                open_cnt: 1,
                removed: false,
                deny_write_cnt: 0,
            }),
            grow: Mutex::new(()),
        });
        inodes.insert(sector, inode.clone());
        Some(inode)
    }

    /// 关闭一个打开引用；归零时撤表，被标记删除的 inode 连带回收其空间
    pub(crate) fn close(&self, inode: Arc<Inode>) {
        let mut inodes = self.inodes.lock();

        let mut state = inode.state.lock();
        assert!(state.open_cnt > 0);
        state.open_cnt -= 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
        if state.open_cnt > 0 {
            return;
        }
        let removed = state.removed;
        drop(state);

        inodes.remove(&inode.sector);
        // 记录撤表之后不会再有新开启者引用这些数据槽
        inode.cache.release_owner(inode.sector);

        if removed {
            let ctx = WalkCtx {
                cache: &inode.cache,
                freemap: &*inode.freemap,
                inode_sector: inode.sector,
            };
            release_on_disk(&ctx);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inodes.lock().len()
    }
}

/// 索引遍历的上下文，打开与未打开的 inode 通用
pub(crate) struct WalkCtx<'a> {
    pub cache: &'a BlockCache,
    pub freemap: &'a dyn FreeMap,
    pub inode_sector: u32,
}

/// 索引遍历策略
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexOp {
    /// 只读解析
    Lookup,
    /// 缺失即分配：数据扇区清零链入，索引块恰在跨越边界时建立。
    /// 要求按扇区索引递增调用
    Allocate,
    /// 释放数据扇区，索引块恰在离开边界时释放。
    /// 要求按扇区索引递减调用
    Release,
}

/// 统一的索引遍历：按策略解析、建立或拆除单个扇区索引的映射，
/// 返回对应的数据扇区号。索引越界、分配失败或缓存耗尽时为空；
/// Allocate 失败时本次调用建立的映射已全部撤销。
pub(crate) fn walk(ctx: &WalkCtx<'_>, sector_index: usize, op: IndexOp) -> Option<u32> {
    match IndexPath::classify(sector_index)? {
        IndexPath::Direct(slot) => match op {
            IndexOp::Lookup => read_inode_slot(ctx, slot),
            IndexOp::Allocate => {
                let sector = alloc_data_sector(ctx)?;
                if write_inode_slot(ctx, slot, sector).is_none() {
                    ctx.freemap.release(sector, 1);
                    return None;
                }
                Some(sector)
            }
            IndexOp::Release => {
                let sector = read_inode_slot(ctx, slot)?;
                ctx.freemap.release(sector, 1);
                Some(sector)
            }
        },

        IndexPath::Indirect(index) => match op {
            IndexOp::Lookup => {
                let table = read_inode_slot(ctx, DiskInode::INDIRECT1)?;
                read_table_entry(ctx, table, index)
            }
            IndexOp::Allocate => {
                // 跨入一级索引范围的第一个扇区带出索引块
                let table = if index == 0 {
                    let table = alloc_index_sector(ctx)?;
                    if write_inode_slot(ctx, DiskInode::INDIRECT1, table).is_none() {
                        release_index_sector(ctx, table);
                        return None;
                    }
                    table
                } else {
                    read_inode_slot(ctx, DiskInode::INDIRECT1)?
                };

                let Some(sector) = alloc_data_sector(ctx) else {
                    if index == 0 {
                        release_index_sector(ctx, table);
                    }
                    return None;
                };
                if write_table_entry(ctx, table, index, sector).is_none() {
                    ctx.freemap.release(sector, 1);
                    if index == 0 {
                        release_index_sector(ctx, table);
                    }
                    return None;
                }
                Some(sector)
            }
            IndexOp::Release => {
                let table = read_inode_slot(ctx, DiskInode::INDIRECT1)?;
                let sector = read_table_entry(ctx, table, index)?;
                ctx.freemap.release(sector, 1);
                // 最后一个占用者离开时连表一起释放
                if index == 0 {
                    release_index_sector(ctx, table);
                }
                Some(sector)
            }
        },

        IndexPath::DoublyIndirect(outer, inner) => match op {
            IndexOp::Lookup => {
                let outer_table = read_inode_slot(ctx, DiskInode::INDIRECT2)?;
                let inner_table = read_table_entry(ctx, outer_table, outer)?;
                read_table_entry(ctx, inner_table, inner)
            }
            IndexOp::Allocate => {
                // 跨入二级索引范围时带出外层表
                let outer_table = if outer == 0 && inner == 0 {
                    let table = alloc_index_sector(ctx)?;
                    if write_inode_slot(ctx, DiskInode::INDIRECT2, table).is_none() {
                        release_index_sector(ctx, table);
                        return None;
                    }
                    table
                } else {
                    read_inode_slot(ctx, DiskInode::INDIRECT2)?
                };

                // 每张内层表恰在其第一个扇区处建立
                let inner_table = if inner == 0 {
                    let Some(table) = alloc_index_sector(ctx) else {
                        if outer == 0 {
                            release_index_sector(ctx, outer_table);
                        }
                        return None;
                    };
                    if write_table_entry(ctx, outer_table, outer, table).is_none() {
                        release_index_sector(ctx, table);
                        if outer == 0 {
                            release_index_sector(ctx, outer_table);
                        }
                        return None;
                    }
                    table
                } else {
                    read_table_entry(ctx, outer_table, outer)?
                };

                let Some(sector) = alloc_data_sector(ctx) else {
                    if inner == 0 {
                        release_index_sector(ctx, inner_table);
                        if outer == 0 {
                            release_index_sector(ctx, outer_table);
                        }
                    }
                    return None;
                };
                if write_table_entry(ctx, inner_table, inner, sector).is_none() {
                    ctx.freemap.release(sector, 1);
                    if inner == 0 {
                        release_index_sector(ctx, inner_table);
                        if outer == 0 {
                            release_index_sector(ctx, outer_table);
                        }
                    }
                    return None;
                }
                Some(sector)
            }
            IndexOp::Release => {
                let outer_table = read_inode_slot(ctx, DiskInode::INDIRECT2)?;
                let inner_table = read_table_entry(ctx, outer_table, outer)?;
                let sector = read_table_entry(ctx, inner_table, inner)?;
                ctx.freemap.release(sector, 1);
                if inner == 0 {
                    release_index_sector(ctx, inner_table);
                    if outer == 0 {
                        release_index_sector(ctx, outer_table);
                    }
                }
                Some(sector)
            }
        },
    }
}

/// 把磁盘 inode 从 `old_length` 扩展到 `new_length`：逐扇区链入
/// 清零的新扇区，全部成功后把新长度写入磁盘 inode。任一扇区失败
/// 则按相反顺序撤销本次链入的所有扇区并返回失败。
pub(crate) fn extend(ctx: &WalkCtx<'_>, old_length: u32, new_length: u32) -> bool {
    debug_assert!(old_length < new_length && new_length <= MAX_LENGTH);

    let old_count = count_data_sectors(old_length);
    let new_count = count_data_sectors(new_length);

    for index in old_count..new_count {
        if walk(ctx, index, IndexOp::Allocate).is_none() {
            debug!(
                "extend of inode {} failed at sector index {index}, unwinding",
                ctx.inode_sector
            );
            for undo in (old_count..index).rev() {
                walk(ctx, undo, IndexOp::Release);
            }
            return false;
        }
    }

    let Some(guard) = meta_slot(ctx, ctx.inode_sector) else {
        for undo in (old_count..new_count).rev() {
            walk(ctx, undo, IndexOp::Release);
        }
        return false;
    };
    guard.map_mut(0, |inode: &mut DiskInode| inode.length = new_length);
    true
}

/// 在指定扇区构筑全新的磁盘 inode 并预分配 `length` 字节的空间。
/// 长度越限与分配失败同样对待：撤销本次分配的所有扇区并返回失败，
/// inode 扇区本身不动
pub(crate) fn create_on_disk(ctx: &WalkCtx<'_>, length: u32) -> bool {
    if length > MAX_LENGTH {
        return false;
    }

    let Some(guard) = meta_slot(ctx, ctx.inode_sector) else {
        return false;
    };
    guard.map_mut(0, |inode: &mut DiskInode| inode.init());
    drop(guard);

    length == 0 || extend(ctx, 0, length)
}

/// 释放 inode 可达的全部扇区，最后归还 inode 扇区自身。
/// 拆除顺序与建立相反：自末尾数据扇区起，索引块在离开边界时释放
pub(crate) fn release_on_disk(ctx: &WalkCtx<'_>) {
    let Some(guard) = meta_slot(ctx, ctx.inode_sector) else {
        debug!(
            "inode {}: cache exhausted on release, sectors leak",
            ctx.inode_sector
        );
        return;
    };
    let length = guard.map(0, |inode: &DiskInode| inode.length);
    drop(guard);

    for index in (0..count_data_sectors(length)).rev() {
        if walk(ctx, index, IndexOp::Release).is_none() {
            debug!(
                "inode {}: release walk truncated at sector index {index}",
                ctx.inode_sector
            );
            break;
        }
    }

    ctx.cache.release_meta(ctx.inode_sector);
    ctx.freemap.release(ctx.inode_sector, 1);
}

fn meta_slot<'a>(ctx: &WalkCtx<'a>, sector: u32) -> Option<SlotRef<'a>> {
    ctx.cache.get(SlotKey::Meta { sector }, sector)
}

fn read_inode_slot(ctx: &WalkCtx<'_>, slot: usize) -> Option<u32> {
    let guard = meta_slot(ctx, ctx.inode_sector)?;
    Some(guard.map(0, |inode: &DiskInode| inode.sector_at(slot)))
}

fn write_inode_slot(ctx: &WalkCtx<'_>, slot: usize, sector: u32) -> Option<()> {
    let guard = meta_slot(ctx, ctx.inode_sector)?;
    guard.map_mut(0, |inode: &mut DiskInode| inode.set_sector_at(slot, sector));
    Some(())
}

fn read_table_entry(ctx: &WalkCtx<'_>, table: u32, index: usize) -> Option<u32> {
    let guard = meta_slot(ctx, table)?;
    Some(guard.map(0, |entries: &IndirectBlock| entries[index]))
}

fn write_table_entry(ctx: &WalkCtx<'_>, table: u32, index: usize, sector: u32) -> Option<()> {
    let guard = meta_slot(ctx, table)?;
    guard.map_mut(0, |entries: &mut IndirectBlock| entries[index] = sector);
    Some(())
}

/// 分配一个数据扇区并清零。新扇区尚无任何缓存槽，直接写设备即可
fn alloc_data_sector(ctx: &WalkCtx<'_>) -> Option<u32> {
    let sector = ctx.freemap.allocate(1)?;
    ctx.cache.device().write_sector(sector, &ZERO_SECTOR);
    Some(sector)
}

/// 分配并清零一个索引块；表内容全零即“无映射”
fn alloc_index_sector(ctx: &WalkCtx<'_>) -> Option<u32> {
    let sector = ctx.freemap.allocate(1)?;
    let Some(guard) = meta_slot(ctx, sector) else {
        ctx.freemap.release(sector, 1);
        return None;
    };
    guard.map_mut(0, |table: &mut IndirectBlock| table.fill(0));
    Some(sector)
}

/// 丢弃索引块的缓存槽并归还扇区
fn release_index_sector(ctx: &WalkCtx<'_>, sector: u32) {
    ctx.cache.release_meta(sector);
    ctx.freemap.release(sector, 1);
}
