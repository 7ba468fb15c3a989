//! # 块缓存层
//!
//! 块设备读写速度一般慢于内存读写速度，因此我们在内存中开辟固定数量的
//! 缓存槽，把即将操作的扇区复制到槽内，提高对块设备的操作效率。
//!
//! 槽以两种键寻址：文件数据扇区用（宿主 inode 扇区号，块对齐偏移），
//! 卷元数据（inode 块、索引块）用物理扇区号。上层保证一个扇区
//! 不会同时经由两种键访问。
//!
//! 槽满之后装载新扇区要经过**时钟近似置换**：从上次牺牲槽的下一位起扫描，
//! 按（未访问不脏，未访问脏，访问过不脏）的优先级挑选牺牲槽，扫描途中
//! 清除访问位作老化。被钉住的槽绝不会被选中；所有槽都被钉住时装载失败，
//! 由调用方降级处理。
//!
//! 对槽内容的每次访问都在短持缓冲区锁内完成；钉住计数与缓冲区锁分离，
//! 前者只阻止置换，不阻止并发判定。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;

use enumflags2::{bitflags, BitFlags};
use log::trace;
use spin::{Mutex, MutexGuard};

use block_dev::BlockDevice;

use crate::DataSector;
use crate::SECTOR_SIZE;

/// 缓存槽的键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKey {
    /// 文件字节流中的扇区：宿主 inode 的扇区号加上块对齐的字节偏移
    Data { owner: u32, offset: u32 },
    /// 以物理扇区号寻址的卷元数据
    Meta { sector: u32 },
}

/// 槽状态位
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFlag {
    /// 槽内装载着扇区
    Used = 1 << 0,
    /// 近期被访问过，驱动置换算法的老化
    Accessed = 1 << 1,
    /// 缓冲区与磁盘内容不一致，复用前必须写回
    Dirty = 1 << 2,
}

/// 置换决策所需的槽元数据
struct SlotMeta {
    key: SlotKey,
    /// 装载内容的来源扇区，写回的目的地
    sector: u32,
    flags: BitFlags<SlotFlag>,
    /// 钉住计数，非零的槽不可置换
    pins: u32,
}

/// 扇区缓冲区。对齐到 8，容许以整型布局映射扇区内容
#[repr(C, align(8))]
struct SectorBuf(DataSector);

struct Slot {
    meta: Mutex<SlotMeta>,
    buf: Mutex<SectorBuf>,
}

/// 缓存槽表。归服务对象所有，随挂载构造、卸载写回
pub struct BlockCache {
    device: Arc<dyn BlockDevice>,
    slots: Box<[Slot]>,
    /// 时钟指针，指向上一个牺牲槽；装载决策期间持有此锁
    hand: Mutex<usize>,
}

impl BlockCache {
    pub fn new(device: Arc<dyn BlockDevice>, slots: usize) -> Self {
        assert!(slots.is_power_of_two());
        let slots = (0..slots)
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            device,
            slots,
            hand: Mutex::new(0),
        }
    }

    /// 取出键对应的槽并钉住，不在缓存时装载。
    /// 装载需要置换而所有槽都被钉住时返回空。
    pub fn get(&self, key: SlotKey, sector: u32) -> Option<SlotRef<'_>> {
        let mut hand = self.hand.lock();

        if let Some(index) = self.find(key) {
            let mut meta = self.slots[index].meta.lock();
            debug_assert_eq!(meta.sector, sector);
            meta.pins += 1;
            drop(meta);
            drop(hand);
            return Some(SlotRef { cache: self, index });
        }

        let index = self.victim(&mut hand, false, None)?;
        self.load_into(hand, index, key, sector, true);
        Some(SlotRef { cache: self, index })
    }

    /// 预取：若键不在缓存则以受保护置换装载，装不进就静默放弃。
    /// `keep` 指明调用方仍要使用的槽，置换绝不选中它。
    /// 该路径独立于读写路径，由上层自行决定是否调用。
    pub fn prefetch(&self, key: SlotKey, sector: u32, keep: Option<&SlotRef<'_>>) {
        let mut hand = self.hand.lock();

        if self.find(key).is_some() {
            return;
        }
        let Some(index) = self.victim(&mut hand, true, keep.map(SlotRef::index)) else {
            return;
        };

        // 不带访问位装载：未兑现的预取在下一轮扫描即可回收
        self.load_into(hand, index, key, sector, false);
        self.slots[index].meta.lock().pins -= 1;
    }

    /// 写回所有脏槽，卸载路径使用
    pub fn sync_all(&self) {
        for slot in self.slots.iter() {
            self.write_back(slot);
        }
    }

    /// 写回并释放指定宿主的全部数据槽，宿主 inode 关闭时使用。
    /// 要求这些槽都已解除钉住。
    pub fn release_owner(&self, owner: u32) {
        let _hand = self.hand.lock();

        for slot in self.slots.iter() {
            let mut meta = slot.meta.lock();
            if !meta.flags.contains(SlotFlag::Used) {
                continue;
            }
            let SlotKey::Data { owner: slot_owner, .. } = meta.key else {
                continue;
            };
            if slot_owner != owner {
                continue;
            }

            assert_eq!(meta.pins, 0, "releasing a pinned slot");
            if meta.flags.contains(SlotFlag::Dirty) {
                let buf = slot.buf.lock();
                self.device.write_sector(meta.sector, &buf.0);
            }
            meta.flags = BitFlags::empty();
        }
    }

    /// 丢弃元数据扇区的槽，不写回；该扇区即将归还分配器，内容已无意义
    pub fn release_meta(&self, sector: u32) {
        let _hand = self.hand.lock();

        for slot in self.slots.iter() {
            let mut meta = slot.meta.lock();
            if meta.flags.contains(SlotFlag::Used) && meta.key == (SlotKey::Meta { sector }) {
                assert_eq!(meta.pins, 0, "releasing a pinned slot");
                meta.flags = BitFlags::empty();
                return;
            }
        }
    }

    /// 键当前是否驻留；仅探测，不装载也不改动状态位
    pub fn contains(&self, key: SlotKey) -> bool {
        self.find(key).is_some()
    }

    /// 当前驻留的槽数
    pub fn resident(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.meta.lock().flags.contains(SlotFlag::Used))
            .count()
    }

    /// 槽表容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl BlockCache {
    #[inline]
    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    fn find(&self, key: SlotKey) -> Option<usize> {
        self.slots.iter().position(|slot| {
            let meta = slot.meta.lock();
            meta.flags.contains(SlotFlag::Used) && meta.key == key
        })
    }

    /// 时钟扫描选出牺牲槽并推进指针。
    ///
    /// `protected` 模式不动访问位，只考虑未访问的两档候选，选不出时
    /// 返回空，交由预取路径放弃；`keep` 指定的槽位在该模式下绝不选中。
    fn victim(&self, hand: &mut usize, protected: bool, keep: Option<usize>) -> Option<usize> {
        let len = self.slots.len();
        let start = (*hand + 1) % len;
        // 两档后备：未访问+脏，访问过+不脏
        let mut dirty_cold = None;
        let mut clean_warm = None;

        for step in 0..len {
            let index = (start + step) % len;
            if keep == Some(index) {
                continue;
            }

            let mut meta = self.slots[index].meta.lock();
            if meta.pins > 0 {
                continue;
            }

            // 从未装载过的槽直接短路
            if !meta.flags.contains(SlotFlag::Used) {
                *hand = index;
                return Some(index);
            }

            let accessed = meta.flags.contains(SlotFlag::Accessed);
            let dirty = meta.flags.contains(SlotFlag::Dirty);

            if !accessed && !dirty {
                *hand = index;
                return Some(index);
            }
            if !accessed && dirty && dirty_cold.is_none() {
                dirty_cold = Some(index);
            }
            if accessed && !dirty && !protected && clean_warm.is_none() {
                clean_warm = Some(index);
            }

            // 老化：被扫过的槽清除访问位
            if !protected {
                meta.flags.remove(SlotFlag::Accessed);
            }
        }

        if let Some(index) = dirty_cold.or(clean_warm) {
            *hand = index;
            return Some(index);
        }
        if protected {
            return None;
        }

        // 所有未钉住的槽都处于访问过+脏，访问位已在扫描中清除；
        // 回退选取起点之后第一个未钉住的槽，保证前进
        for step in 0..len {
            let index = (start + step) % len;
            let meta = self.slots[index].meta.lock();
            if meta.pins == 0 {
                trace!("clock scan fell back to slot {index}");
                *hand = index;
                return Some(index);
            }
        }

        // 所有槽都被钉住
        None
    }

    /// 在牺牲槽上装载新扇区，结束时该槽带有一个钉。
    /// 进入时持有 `hand` 锁：脏牺牲槽的写回在释放它之前完成，所有查找
    /// 都在时钟锁上排队，旧扇区此后的任何重装都读到已写回的内容。
    /// 替换读在释放时钟锁之后进行，期间持续持有缓冲区锁，装载完成前
    /// 命中此键的访问都会阻塞其上。
    fn load_into(
        &self,
        hand: MutexGuard<'_, usize>,
        index: usize,
        key: SlotKey,
        sector: u32,
        accessed: bool,
    ) {
        let slot = &self.slots[index];
        // 旧内容先落盘，后改换身份
        self.write_back(slot);

        let mut meta = slot.meta.lock();
        meta.key = key;
        meta.sector = sector;
        meta.flags = if accessed {
            SlotFlag::Used | SlotFlag::Accessed
        } else {
            SlotFlag::Used.into()
        };
        meta.pins = 1;

        let mut buf = slot.buf.lock();
        drop(meta);
        drop(hand);

        self.device.read_sector(sector, &mut buf.0);
    }

    /// 写回单个槽的脏内容；幂等
    fn write_back(&self, slot: &Slot) {
        let mut meta = slot.meta.lock();
        if meta.flags.contains(SlotFlag::Dirty) {
            let buf = slot.buf.lock();
            self.device.write_sector(meta.sector, &buf.0);
            meta.flags.remove(SlotFlag::Dirty);
        }
    }
}

/// RAII 钉住凭据：存在期间槽不会被置换，析构时解除钉住
pub struct SlotRef<'a> {
    cache: &'a BlockCache,
    index: usize,
}

impl SlotRef<'_> {
    /// 以 `T` 的布局读取缓冲区内 `offset` 处的内容
    #[inline]
    pub fn map<T: Sized, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        let slot = &self.cache.slots[self.index];
        slot.meta.lock().flags.insert(SlotFlag::Accessed);

        let buf = slot.buf.lock();
        f(buf.get(offset))
    }

    /// 以 `T` 的布局修改缓冲区内 `offset` 处的内容，槽随之转为脏
    #[inline]
    pub fn map_mut<T: Sized, V>(&self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        let slot = &self.cache.slots[self.index];
        slot.meta
            .lock()
            .flags
            .insert(SlotFlag::Accessed | SlotFlag::Dirty);

        let mut buf = slot.buf.lock();
        f(buf.get_mut(offset))
    }

    #[inline]
    fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        self.cache.slots[self.index].meta.lock().pins -= 1;
    }
}

impl Slot {
    fn new() -> Self {
        Self {
            meta: Mutex::new(SlotMeta {
                key: SlotKey::Meta { sector: 0 },
                sector: 0,
                flags: BitFlags::empty(),
                pins: 0,
            }),
            buf: Mutex::new(SectorBuf([0; SECTOR_SIZE])),
        }
    }
}

impl SectorBuf {
    fn get<T: Sized>(&self, offset: usize) -> &T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        let addr = unsafe { self.0.as_ptr().add(offset) };
        unsafe { &*addr.cast() }
    }

    fn get_mut<T: Sized>(&mut self, offset: usize) -> &mut T {
        let type_size = mem::size_of::<T>();
        assert!(type_size + offset <= SECTOR_SIZE);
        let addr = unsafe { self.0.as_mut_ptr().add(offset) };
        unsafe { &mut *addr.cast() }
    }
}
