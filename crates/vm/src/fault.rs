//! 缺页异常处理，陷入处理函数的唯一入口

use bitflags::bitflags;
use common::config::{MAX_STACK_SIZE, STACK_PUSH_SLACK, USER_STACK_TOP};

use crate::{address::VirtAddr, page::PageTarget, spt::SupplementalPageTable};

bitflags! {
    /// 硬件报告的缺页原因
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultFlags: u8 {
        /// 页存在，是权限问题导致的异常
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        /// 异常发生在用户态
        const USER = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub addr: VirtAddr,
    /// 用户栈指针。内核态的异常（系统调用中）传入进入系统调用时保存的值
    pub sp: VirtAddr,
    pub flags: FaultFlags,
}

/// 栈增长的范围：不超过最大栈大小，且不低于栈指针下方 [`STACK_PUSH_SLACK`] 字节
pub fn is_stack_growth(addr: VirtAddr, sp: VirtAddr) -> bool {
    addr.0 < USER_STACK_TOP
        && addr.0 >= USER_STACK_TOP - MAX_STACK_SIZE
        && addr.0 >= sp.0.saturating_sub(STACK_PUSH_SLACK)
}

impl SupplementalPageTable {
    /// 返回 false 表示无法处理，调用方应当终止进程
    pub fn resolve_fault(&mut self, fault: &PageFault) -> bool {
        let addr = fault.addr;
        let write = fault.flags.contains(FaultFlags::WRITE);
        trace!("page fault at {addr:?} ({:?})", fault.flags);
        if !addr.is_user() {
            debug!("fault on non-user address {addr:?}");
            return false;
        }
        // 读一个已存在的页也出错，不是惰性加载能解决的
        if fault.flags.contains(FaultFlags::PRESENT) && !write {
            debug!("read fault on present page {addr:?}");
            return false;
        }

        let page = match self.find(addr) {
            Some(page) => page,
            None if is_stack_growth(addr, fault.sp) => {
                trace!("grow stack to {:?}", addr.page_floor());
                match self.declare_page(addr.page_floor(), true, PageTarget::Anon, None) {
                    Some(page) => page,
                    None => return false,
                }
            }
            None => {
                debug!("no page for {addr:?}, sp {:?}", fault.sp);
                return false;
            }
        };
        self.vm.lock().resolve(&page, write)
    }
}
