//! 文件映射区域（mmap / munmap）

use common::config::{PAGE_SIZE, USER_SPACE_END};
use defines::error::{errno, KResult};
use scopeguard::ScopeGuard;

use crate::{
    address::VirtAddr,
    hal::File,
    page::{FileBacking, PageTarget, FILESYS_LOCK},
    spt::SupplementalPageTable,
};

/// 系统调用层在 [`SupplementalPageTable::map`] 失败时返回给用户的值
pub const MAP_FAILED: usize = 0;

impl SupplementalPageTable {
    /// 把 `file` 从 `offset` 起映射到 `[addr, addr + length)`，每页一个独立的文件句柄
    ///
    /// 失败时已登记的页全部撤销。
    pub fn map(
        &mut self,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &dyn File,
        offset: usize,
    ) -> KResult<VirtAddr> {
        if addr.0 == 0 || !addr.is_page_aligned() || length == 0 || offset % PAGE_SIZE != 0 {
            debug!("mmap: bad arguments {addr:?}, len {length:#x}, offset {offset:#x}");
            return Err(errno::EINVAL);
        }
        let end = addr
            .0
            .checked_add(length)
            .filter(|&end| end <= USER_SPACE_END)
            .ok_or(errno::EINVAL)?;
        let file_len = {
            let _fs = FILESYS_LOCK.lock();
            file.length()
        };
        if file_len == 0 {
            debug!("mmap: empty file");
            return Err(errno::EINVAL);
        }

        let start = addr.vpn_floor();
        let pages = VirtAddr(end).vpn_ceil().0 - start.0;
        if offset.checked_add(pages * PAGE_SIZE).is_none() {
            debug!("mmap: offset {offset:#x} overflows");
            return Err(errno::EINVAL);
        }
        if start
            .range_to(start + pages)
            .any(|vpn| self.pages.contains_key(&vpn))
        {
            debug!("mmap: {addr:?} overlaps existing pages");
            return Err(errno::EEXIST);
        }

        let mut declared = scopeguard::guard((self, 0), |(spt, declared)| {
            for vpn in start.range_to(start + declared) {
                spt.remove(vpn.page_start());
            }
        });
        for i in 0..pages {
            let page_offset = offset + i * PAGE_SIZE;
            let read_bytes = PAGE_SIZE
                .min(length - i * PAGE_SIZE)
                .min(file_len.saturating_sub(page_offset));
            let handle = {
                let _fs = FILESYS_LOCK.lock();
                file.reopen()
            };
            let Some(handle) = handle else {
                return Err(errno::ENOMEM);
            };
            let target = PageTarget::File(FileBacking::new(handle, page_offset, read_bytes));
            let va = (start + i).page_start();
            if !declared.0.declare(va, writable, target, None) {
                return Err(errno::ENOMEM);
            }
            declared.1 += 1;
        }

        let (spt, declared) = ScopeGuard::into_inner(declared);
        spt.mmaps.insert(start, declared);
        trace!("mmap: {addr:?} with {declared} pages");
        Ok(addr)
    }

    /// 撤销 `addr` 起的映射，脏页写回文件
    pub fn unmap(&mut self, addr: VirtAddr) -> KResult<()> {
        let start = addr.vpn_floor();
        if !addr.is_page_aligned() {
            return Err(errno::EINVAL);
        }
        let Some(pages) = self.mmaps.remove(&start) else {
            debug!("munmap: {addr:?} is not mapped");
            return Err(errno::EINVAL);
        };
        for vpn in start.range_to(start + pages) {
            self.remove(vpn.page_start());
        }
        trace!("munmap: {addr:?} with {pages} pages");
        Ok(())
    }
}
