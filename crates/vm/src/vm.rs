//! 全局 VM 状态：帧表和交换区，由同一把锁保护
//!
//! 锁的顺序是 VM 锁、页锁、文件系统锁，不能反过来。

use alloc::sync::Arc;

use klocks::{Once, SpinMutex, SpinMutexGuard};

use crate::{
    frame::FrameTable,
    hal::{BlockDevice, PhysAllocator},
    page::{MapState, Page, PageRef},
    swap::SwapArea,
};

pub struct Vm {
    inner: SpinMutex<VmInner>,
}

pub(crate) struct VmInner {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapArea,
}

/// 内存使用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub resident_frames: usize,
    pub shared_frames: usize,
    pub swap_used: usize,
    pub swap_total: usize,
}

impl Vm {
    pub fn new(allocator: Arc<dyn PhysAllocator>, swap_disk: Option<Arc<dyn BlockDevice>>) -> Self {
        Self {
            inner: SpinMutex::new(VmInner {
                frames: FrameTable::new(allocator),
                swap: SwapArea::new(swap_disk),
            }),
        }
    }

    pub(crate) fn lock(&self) -> SpinMutexGuard<'_, VmInner> {
        self.inner.lock()
    }

    pub fn stats(&self) -> VmStats {
        let inner = self.lock();
        VmStats {
            resident_frames: inner.frames.resident(),
            shared_frames: inner.frames.shared(),
            swap_used: inner.swap.used(),
            swap_total: inner.swap.capacity(),
        }
    }
}

impl VmInner {
    /// 为页分配帧、建立映射并填充内容。已驻留的页直接返回成功
    pub(crate) fn claim(&mut self, page_ref: &PageRef) -> bool {
        let mut page = page_ref.lock();
        if page.frame.is_some() {
            return true;
        }
        self.claim_locked(page_ref, &mut page)
    }

    /// 填充失败时帧被释放，页保持原来的状态
    pub(crate) fn claim_locked(&mut self, page_ref: &PageRef, page: &mut Page) -> bool {
        debug_assert!(page.frame.is_none());
        let id = self.frames.allocate_frame(&mut self.swap);
        let kva = self.frames.kva(id);
        self.frames.link(id, page_ref);
        page.frame = Some(id);
        page.cow = false;

        if !page.mapper.install(page.va, kva, page.writable) || !page.swap_in(kva, &mut self.swap) {
            debug!("failed to claim {:?}", page.va);
            page.mapper.clear(page.va);
            page.frame = None;
            self.frames.unlink(id, page_ref);
            return false;
        }
        page.touch();
        trace!("claim {:?} with {id:?}", page.va);
        true
    }

    /// 处理页上的缺页异常，页已经在 SPT 中
    pub(crate) fn resolve(&mut self, page_ref: &PageRef, write: bool) -> bool {
        let mut page = page_ref.lock();
        if write && !page.writable {
            debug!("write to read-only page {:?}", page.va);
            return false;
        }
        match page.map_state(&self.frames) {
            MapState::NotResident => self.claim_locked(page_ref, &mut page),
            MapState::PendingWrite | MapState::Shared if write => {
                self.resolve_cow(page_ref, &mut page)
            }
            // 页在内存里但映射丢了，补上即可
            _ => {
                let Some(id) = page.frame else {
                    return false;
                };
                page.touch();
                page.remap(self.frames.kva(id), page.mapped_writable())
            }
        }
    }

    /// 写时复制。帧已无人共享时只需恢复写权限
    fn resolve_cow(&mut self, page_ref: &PageRef, page: &mut Page) -> bool {
        let Some(old) = page.frame else {
            return false;
        };
        page.touch();
        if self.frames.ref_count(old) == 1 {
            page.cow = false;
            trace!("cow: {:?} is exclusive now", page.va);
            return page.remap(self.frames.kva(old), page.writable);
        }

        let new = self.frames.allocate_frame(&mut self.swap);
        let (src, dst) = (self.frames.kva(old), self.frames.kva(new));
        // SAFETY: 两帧不同，共享帧在复制期间只读
        unsafe { dst.as_page_bytes_mut().copy_from_slice(src.as_page_bytes()) };
        self.frames.unlink(old, page_ref);
        self.frames.link(new, page_ref);
        page.frame = Some(new);
        page.cow = false;
        trace!("cow: copy {:?} from {old:?} to {new:?}", page.va);

        if !page.remap(dst, page.writable) {
            page.mapper.clear(page.va);
            page.frame = None;
            self.frames.unlink(new, page_ref);
            return false;
        }
        true
    }

    /// 释放页的所有资源：后端资源、映射和帧
    pub(crate) fn destroy(&mut self, page_ref: &PageRef) {
        let mut page = page_ref.lock();
        let kva = page.frame.map(|id| self.frames.kva(id));
        page.destroy(kva, &mut self.swap);
        if let Some(id) = page.frame.take() {
            page.mapper.clear(page.va);
            self.frames.unlink(id, page_ref);
        }
    }
}

static VM: Once<Arc<Vm>> = Once::new();

/// 内核启动时调用一次，之后的调用返回第一次创建的实例
pub fn init(
    allocator: Arc<dyn PhysAllocator>,
    swap_disk: Option<Arc<dyn BlockDevice>>,
) -> &'static Arc<Vm> {
    VM.call_once(|| {
        info!("vm: initialized");
        Arc::new(Vm::new(allocator, swap_disk))
    })
}

/// 全局实例，`init` 之前为 `None`
pub fn global() -> Option<&'static Arc<Vm>> {
    VM.get()
}
