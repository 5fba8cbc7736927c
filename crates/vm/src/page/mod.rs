//! 页的元数据和三种后端
//!
//! 每页用一个封闭的枚举 [`PageKind`] 区分未初始化、匿名、文件三种状态，换入换出和
//! 销毁都按变体分派。

mod anon;
mod file;
mod uninit;

use alloc::sync::Arc;
use core::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
};

use common::config::PAGE_SIZE;
use klocks::SpinMutex;

pub use self::{
    anon::AnonPage,
    file::{FileBacking, FilePage, FILESYS_LOCK},
    uninit::{PageInitializer, SegmentLoader, UninitPage},
};
use crate::{
    address::{KernelAddr, VirtAddr},
    frame::{FrameId, FrameTable},
    hal::PageMapper,
    swap::SwapArea,
};

/// 页被 SPT 独占持有，帧表里只存它的弱引用
pub type PageRef = Arc<SpinMutex<Page>>;

/// 全局的访问时钟，LRU 近似用
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(0);

pub struct Page {
    pub(crate) va: VirtAddr,
    pub(crate) writable: bool,
    pub(crate) frame: Option<FrameId>,
    pub(crate) mapper: Arc<dyn PageMapper>,
    pub(crate) last_access: u64,
    /// 因为与别的页共享帧而被映射为只读
    pub(crate) cow: bool,
    pub(crate) kind: PageKind,
}

pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// 页（或未初始化页将要成为）的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Anon,
    File,
}

/// 未初始化页第一次被访问后要变成的类型
pub enum PageTarget {
    Anon,
    File(FileBacking),
}

/// 页当前的映射状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    /// 没有帧
    NotResident,
    /// 独占帧，映射权限就是页本身的权限
    Exclusive,
    /// 独占帧但仍映射为只读，写时只需重新映射
    PendingWrite,
    /// 与其他页共享帧，写时需要复制
    Shared,
}

impl Page {
    pub fn new(va: VirtAddr, writable: bool, mapper: Arc<dyn PageMapper>, kind: PageKind) -> Self {
        debug_assert!(va.is_page_aligned());
        Self {
            va,
            writable,
            frame: None,
            mapper,
            last_access: 0,
            cow: false,
            kind,
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target_type(),
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    pub fn is_uninit(&self) -> bool {
        matches!(self.kind, PageKind::Uninit(_))
    }

    pub(crate) fn touch(&mut self) {
        self.last_access = ACCESS_CLOCK.fetch_add(1, Ordering::Relaxed) + 1;
    }

    pub(crate) fn map_state(&self, frames: &FrameTable) -> MapState {
        match self.frame {
            None => MapState::NotResident,
            Some(_) if !self.cow => MapState::Exclusive,
            Some(frame) if frames.ref_count(frame) > 1 => MapState::Shared,
            Some(_) => MapState::PendingWrite,
        }
    }

    /// 硬件映射实际应有的写权限
    pub(crate) fn mapped_writable(&self) -> bool {
        self.writable && !self.cow
    }

    /// 重新建立映射，保留原有的脏位
    pub(crate) fn remap(&self, kva: KernelAddr, writable: bool) -> bool {
        let dirty = self.mapper.is_dirty(self.va);
        if !self.mapper.install(self.va, kva, writable) {
            return false;
        }
        if dirty {
            self.mapper.set_dirty(self.va, true);
        }
        true
    }

    pub(crate) fn swap_in(&mut self, kva: KernelAddr, swap: &mut SwapArea) -> bool {
        // SAFETY: 帧已链接到本页，持有 VM 锁和页锁，没有其他人会访问它
        let bytes = unsafe { kva.as_page_bytes_mut() };
        trace!("swap in {:?} into {kva:?}", self.va);
        self.kind.swap_in(bytes, swap)
    }

    pub(crate) fn swap_out(&mut self, kva: KernelAddr, swap: &mut SwapArea) -> bool {
        // SAFETY: 同上，且换出时帧只有本页一个主人
        let bytes = unsafe { kva.as_page_bytes() };
        trace!("swap out {:?} from {kva:?}", self.va);
        match &mut self.kind {
            // 未初始化页不会占有帧
            PageKind::Uninit(_) => false,
            PageKind::Anon(anon) => anon.swap_out(bytes, swap),
            PageKind::File(file) => file.swap_out(self.va, bytes, self.mapper.as_ref()),
        }
    }

    /// 释放类型相关的资源。`kva` 为 `None` 表示页不在内存中
    pub(crate) fn destroy(&mut self, kva: Option<KernelAddr>, swap: &mut SwapArea) {
        match &mut self.kind {
            PageKind::Uninit(_) => {}
            PageKind::Anon(anon) => anon.destroy(swap),
            PageKind::File(file) => match kva {
                Some(kva) if self.writable => {
                    // SAFETY: 帧仍链接在本页上
                    let bytes = unsafe { kva.as_page_bytes() };
                    file.destroy(self.va, bytes, self.mapper.as_ref());
                }
                _ => {}
            },
        }
    }
}

impl PageKind {
    fn swap_in(&mut self, page: &mut [u8; PAGE_SIZE], swap: &mut SwapArea) -> bool {
        match self {
            PageKind::Uninit(_) => {
                // 占位用的匿名页马上会被替换掉
                let PageKind::Uninit(uninit) = mem::replace(self, PageKind::Anon(AnonPage::new()))
                else {
                    unreachable!()
                };
                match uninit.initialize(page) {
                    Ok(kind) => {
                        *self = kind;
                        true
                    }
                    Err(uninit) => {
                        *self = PageKind::Uninit(uninit);
                        false
                    }
                }
            }
            PageKind::Anon(anon) => anon.swap_in(page, swap),
            PageKind::File(file) => file.swap_in(page),
        }
    }

    /// fork 时复制一份。文件句柄会被重新打开
    pub(crate) fn duplicate(&self) -> Option<PageKind> {
        Some(match self {
            PageKind::Uninit(uninit) => PageKind::Uninit(uninit.duplicate()?),
            // 驻留的匿名页不会持有交换槽
            PageKind::Anon(_) => PageKind::Anon(AnonPage::new()),
            PageKind::File(file) => PageKind::File(file.duplicate()?),
        })
    }
}

impl PageTarget {
    pub fn page_type(&self) -> PageType {
        match self {
            PageTarget::Anon => PageType::Anon,
            PageTarget::File(_) => PageType::File,
        }
    }

    pub(super) fn into_kind(self) -> PageKind {
        match self {
            PageTarget::Anon => PageKind::Anon(AnonPage::new()),
            PageTarget::File(backing) => PageKind::File(FilePage::new(backing)),
        }
    }

    pub(crate) fn duplicate(&self) -> Option<PageTarget> {
        Some(match self {
            PageTarget::Anon => PageTarget::Anon,
            PageTarget::File(backing) => PageTarget::File(backing.duplicate()?),
        })
    }
}
