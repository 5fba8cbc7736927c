//! 虚存子系统依赖的外部能力
//!
//! 硬件页表、物理页分配器、块设备和文件对象都由内核其他部分提供，这里只定义接口。
//! 另外给出一个基于伙伴系统的 [`FramePool`]，内核可以直接拿来当物理页分配器。

use alloc::boxed::Box;

use buddy_system_allocator::FrameAllocator;
use common::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use klocks::SpinMutex;

use crate::address::{KernelAddr, VirtAddr};

/// 一个地址空间的硬件页表
pub trait PageMapper: Send + Sync {
    /// 建立 `va -> kva` 的映射。已有映射时覆盖之。页表页分配失败时返回 false
    fn install(&self, va: VirtAddr, kva: KernelAddr, writable: bool) -> bool;
    /// 移除 `va` 的映射，没有映射时什么也不做
    fn clear(&self, va: VirtAddr);
    fn is_dirty(&self, va: VirtAddr) -> bool;
    fn set_dirty(&self, va: VirtAddr, dirty: bool);
}

/// 物理页分配器
pub trait PhysAllocator: Send + Sync {
    /// 分配一页清零的物理页，返回其内核别名地址
    fn acquire_zeroed_page(&self) -> Option<KernelAddr>;
    /// # Safety
    ///
    /// `kva` 必须来自同一分配器的 [`PhysAllocator::acquire_zeroed_page`]，且之后不再被访问
    unsafe fn release_page(&self, kva: KernelAddr);
}

/// 块设备，扇区大小为 [`common::config::SECTOR_SIZE`]
pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    fn read_sector(&self, sector: usize, buf: &mut [u8]);
    fn write_sector(&self, sector: usize, buf: &[u8]);
}

/// 文件对象。调用方需持有 [`crate::FILESYS_LOCK`]；drop 即关闭
pub trait File: Send {
    fn length(&self) -> usize;
    fn seek(&mut self, pos: usize);
    /// 从当前偏移读，返回实际读到的字节数
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// 在 `offset` 处写，不影响当前偏移，返回实际写入的字节数
    fn write_at(&mut self, buf: &[u8], offset: usize) -> usize;
    /// 打开一个共享底层数据、但偏移独立的新句柄
    fn reopen(&self) -> Option<Box<dyn File>>;
}

const BUDDY_ORDER: usize = 32;

/// 管理一段连续内核内存的物理页分配器
pub struct FramePool {
    base: KernelAddr,
    allocator: SpinMutex<FrameAllocator<BUDDY_ORDER>>,
}

impl FramePool {
    /// # Safety
    ///
    /// `[base, base + pages * PAGE_SIZE)` 必须是按页对齐、可读写且不被其他人使用的内存，
    /// 并且在 `FramePool` 存活期间一直有效
    pub unsafe fn new(base: KernelAddr, pages: usize) -> Self {
        debug_assert_eq!(base.0 % PAGE_SIZE, 0);
        let mut allocator = FrameAllocator::new();
        allocator.add_frame(0, pages);
        Self {
            base,
            allocator: SpinMutex::new(allocator),
        }
    }
}

impl PhysAllocator for FramePool {
    fn acquire_zeroed_page(&self) -> Option<KernelAddr> {
        let index = self.allocator.lock().alloc(1)?;
        let kva = KernelAddr(self.base.0 + (index << PAGE_SIZE_BITS));
        // SAFETY: 页属于构造时交给我们的区域，刚分配出来，没有其他引用
        unsafe { kva.as_page_bytes_mut().fill(0) };
        Some(kva)
    }

    unsafe fn release_page(&self, kva: KernelAddr) {
        let index = (kva.0 - self.base.0) >> PAGE_SIZE_BITS;
        self.allocator.lock().dealloc(index, 1);
    }
}
