use alloc::boxed::Box;
use core::mem::ManuallyDrop;

use common::config::PAGE_SIZE;
use klocks::SpinMutex;

use crate::{
    address::VirtAddr,
    hal::{File, PageMapper},
};

/// 文件层没有细粒度的锁，所有文件操作都要先拿这把锁。它总是最后一个被获取的锁
pub static FILESYS_LOCK: SpinMutex<()> = SpinMutex::new(());

/// 一页在文件中的来源：从 `offset` 起的 `read_bytes` 字节，其余补零
pub struct FileBacking {
    file: ManuallyDrop<Box<dyn File>>,
    offset: usize,
    read_bytes: usize,
}

impl FileBacking {
    pub fn new(file: Box<dyn File>, offset: usize, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_SIZE);
        Self {
            file: ManuallyDrop::new(file),
            offset,
            read_bytes,
        }
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// 重新打开文件，得到一个独立的句柄
    pub fn duplicate(&self) -> Option<Self> {
        let file = {
            let _fs = FILESYS_LOCK.lock();
            self.file.reopen()
        };
        file.map(|file| Self::new(file, self.offset, self.read_bytes))
    }

    /// 读入文件内容。文件比预期短时，读不到的部分也补零
    pub(crate) fn load(&mut self, page: &mut [u8; PAGE_SIZE]) {
        let read = {
            let _fs = FILESYS_LOCK.lock();
            self.file.seek(self.offset);
            self.file.read(&mut page[..self.read_bytes])
        };
        page[read..].fill(0);
    }

    /// 把页的前 `read_bytes` 字节写回文件，返回是否写全
    pub(crate) fn write_back(&mut self, page: &[u8; PAGE_SIZE]) -> bool {
        let written = {
            let _fs = FILESYS_LOCK.lock();
            self.file.write_at(&page[..self.read_bytes], self.offset)
        };
        if written != self.read_bytes {
            warn!(
                "short write back at offset {:#x}: {written}/{}",
                self.offset, self.read_bytes
            );
            return false;
        }
        true
    }
}

impl Drop for FileBacking {
    fn drop(&mut self) {
        let _fs = FILESYS_LOCK.lock();
        // SAFETY: 之后不会再访问 `self.file`
        unsafe { ManuallyDrop::drop(&mut self.file) };
    }
}

/// 文件页，被换出时写回文件而不是交换区
pub struct FilePage {
    backing: FileBacking,
}

impl FilePage {
    pub fn new(backing: FileBacking) -> Self {
        Self { backing }
    }

    pub(super) fn swap_in(&mut self, page: &mut [u8; PAGE_SIZE]) -> bool {
        self.backing.load(page);
        true
    }

    /// 只有脏页才写回
    pub(super) fn swap_out(
        &mut self,
        va: VirtAddr,
        page: &[u8; PAGE_SIZE],
        mapper: &dyn PageMapper,
    ) -> bool {
        if !mapper.is_dirty(va) {
            return true;
        }
        if !self.backing.write_back(page) {
            return false;
        }
        mapper.set_dirty(va, false);
        true
    }

    /// 页仍驻留时由调用方保证，且只在页可写时调用
    pub(super) fn destroy(&mut self, va: VirtAddr, page: &[u8; PAGE_SIZE], mapper: &dyn PageMapper) {
        if mapper.is_dirty(va) && self.backing.write_back(page) {
            mapper.set_dirty(va, false);
        }
    }

    pub(super) fn duplicate(&self) -> Option<FilePage> {
        self.backing.duplicate().map(FilePage::new)
    }
}
