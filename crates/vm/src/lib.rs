//! 用户地址空间的虚拟内存管理
//!
//! 按需分页、匿名页换出到交换区、文件映射、fork 时的写时复制。硬件页表、物理页分配、
//! 磁盘和文件都通过 [`hal`] 中的接口由内核其他部分提供。

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

mod address;
mod fault;
mod fork;
mod frame;
pub mod hal;
mod mmap;
pub mod page;
mod spt;
mod swap;
mod user_check;
mod vm;

#[cfg(test)]
mod test_utils;

pub use self::{
    address::{KernelAddr, VirtAddr, VirtPageNum},
    fault::{is_stack_growth, FaultFlags, PageFault},
    frame::{FrameId, FrameTable},
    hal::{BlockDevice, File, FramePool, PageMapper, PhysAllocator},
    mmap::MAP_FAILED,
    page::{
        FileBacking, MapState, Page, PageInitializer, PageRef, PageTarget, PageType,
        SegmentLoader, FILESYS_LOCK,
    },
    spt::SupplementalPageTable,
    swap::{SwapArea, SwapSlot},
    vm::{global, init, Vm, VmStats},
};
