use core::{fmt, ops::Add};

use common::config::{PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_BITS, USER_SPACE_END};

/// 用户虚拟地址
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// 向下取整页号
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }

    /// 向上取整页号
    pub const fn vpn_ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    /// 所在页的起始地址
    pub const fn page_floor(&self) -> VirtAddr {
        VirtAddr(self.0 & !PAGE_OFFSET_MASK)
    }

    pub const fn is_user(&self) -> bool {
        self.0 != 0 && self.0 < USER_SPACE_END
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA({:#x})", self.0)
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// 虚拟页号，也是补充页表的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }

    /// `self..end` 中的每一页。`Step` 还没稳定，只好手写
    pub fn range_to(self, end: VirtPageNum) -> impl Iterator<Item = VirtPageNum> {
        (self.0..end.0).map(VirtPageNum)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;

    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}

/// 物理页在内核中的别名地址。帧表只通过它读写页内容
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelAddr(pub usize);

impl KernelAddr {
    /// # Safety
    ///
    /// 需保证该地址起的一整页由物理分配器分配，且未被释放
    pub unsafe fn as_page_bytes<'a>(self) -> &'a [u8; PAGE_SIZE] {
        unsafe { &*(self.0 as *const [u8; PAGE_SIZE]) }
    }

    /// # Safety
    ///
    /// 同 [`KernelAddr::as_page_bytes`]，并且调用方需要保证没有别的引用同时存在
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_page_bytes_mut<'a>(self) -> &'a mut [u8; PAGE_SIZE] {
        unsafe { &mut *(self.0 as *mut [u8; PAGE_SIZE]) }
    }
}

impl fmt::Debug for KernelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KVA({:#x})", self.0)
    }
}
