//! 全局帧表
//!
//! 记录每个正在承载用户页的物理帧，以及占用它的页。帧到页是非拥有的关系，用
//! [`Weak`] 表示；共享（COW）的帧会有多个主人。

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};

use klocks::SpinMutex;
use slab::Slab;
use smallvec::SmallVec;

use crate::{
    address::KernelAddr,
    hal::PhysAllocator,
    page::{Page, PageRef},
    swap::SwapArea,
};

/// 帧在帧表中的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

struct FrameEntry {
    kva: KernelAddr,
    owners: SmallVec<[Weak<SpinMutex<Page>>; 2]>,
}

pub struct FrameTable {
    allocator: Arc<dyn PhysAllocator>,
    frames: Slab<FrameEntry>,
}

impl FrameTable {
    pub fn new(allocator: Arc<dyn PhysAllocator>) -> Self {
        Self {
            allocator,
            frames: Slab::new(),
        }
    }

    /// 分配一个清零的帧，还没有主人。物理页不够时换出一页
    ///
    /// # Panics
    ///
    /// 物理页耗尽且没有页可以换出时
    pub fn allocate_frame(&mut self, swap: &mut SwapArea) -> FrameId {
        if let Some(kva) = self.allocator.acquire_zeroed_page() {
            let id = FrameId(self.frames.insert(FrameEntry {
                kva,
                owners: SmallVec::new(),
            }));
            trace!("frame: allocate {id:?} at {kva:?}");
            return id;
        }
        match self.evict(swap) {
            Some(id) => id,
            None => {
                error!(
                    "out of memory: {} frames resident, swap {}/{}",
                    self.frames.len(),
                    swap.used(),
                    swap.capacity()
                );
                panic!("no frame can be evicted");
            }
        }
    }

    /// 按最近访问时间从旧到新排列的候选帧。共享的帧和正被别人锁住的页不在其中
    fn victims(&self) -> Vec<FrameId> {
        let mut candidates: Vec<(u64, FrameId)> = self
            .frames
            .iter()
            .filter_map(|(index, entry)| {
                let [owner] = entry.owners.as_slice() else {
                    return None;
                };
                let page = owner.upgrade()?;
                let last_access = page.try_lock()?.last_access;
                Some((last_access, FrameId(index)))
            })
            .collect();
        candidates.sort_unstable_by_key(|&(last_access, _)| last_access);
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// 最久未被访问的可换出帧
    pub fn select_victim(&self) -> Option<FrameId> {
        self.victims().first().copied()
    }

    /// 换出一页，返回腾出来的帧。某个牺牲者换出失败时（例如交换区满）试下一个
    pub fn evict(&mut self, swap: &mut SwapArea) -> Option<FrameId> {
        for id in self.victims() {
            let entry = &mut self.frames[id.0];
            let Some(owner) = entry.owners.first().and_then(Weak::upgrade) else {
                continue;
            };
            let Some(mut page) = owner.try_lock() else {
                continue;
            };
            if !page.swap_out(entry.kva, swap) {
                warn!("frame: failed to swap out {:?}, try next victim", page.va);
                continue;
            }
            page.mapper.clear(page.va);
            page.frame = None;
            page.cow = false;
            entry.owners.clear();
            // SAFETY: 帧已经没有主人了
            unsafe { entry.kva.as_page_bytes_mut().fill(0) };
            trace!("frame: evict {:?} from {id:?}", page.va);
            return Some(id);
        }
        None
    }

    pub fn link(&mut self, id: FrameId, page: &PageRef) {
        self.frames[id.0].owners.push(Arc::downgrade(page));
    }

    /// 解除 `page` 对帧的占用，没有主人时释放物理页
    pub fn unlink(&mut self, id: FrameId, page: &PageRef) {
        let entry = &mut self.frames[id.0];
        let target = Arc::as_ptr(page);
        entry.owners.retain(|owner| owner.as_ptr() != target);
        if entry.owners.is_empty() {
            let entry = self.frames.remove(id.0);
            // SAFETY: 帧表是这个物理页唯一的持有者
            unsafe { self.allocator.release_page(entry.kva) };
            trace!("frame: release {id:?}");
        }
    }

    pub fn kva(&self, id: FrameId) -> KernelAddr {
        self.frames[id.0].kva
    }

    pub fn ref_count(&self, id: FrameId) -> usize {
        self.frames[id.0].owners.len()
    }

    pub fn resident(&self) -> usize {
        self.frames.len()
    }

    pub fn shared(&self) -> usize {
        self.frames
            .iter()
            .filter(|(_, entry)| entry.owners.len() > 1)
            .count()
    }
}
