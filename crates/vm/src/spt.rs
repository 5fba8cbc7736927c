//! 补充页表（SPT）
//!
//! 每个地址空间一张，以虚拟页号为键独占持有该地址空间的所有页。

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};

use hashbrown::{hash_map::Entry, HashMap};
use klocks::SpinMutex;

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::PageMapper,
    page::{Page, PageInitializer, PageKind, PageRef, PageTarget, PageType, UninitPage},
    vm::Vm,
};

pub struct SupplementalPageTable {
    pub(crate) vm: Arc<Vm>,
    pub(crate) mapper: Arc<dyn PageMapper>,
    pub(crate) pages: HashMap<VirtPageNum, PageRef>,
    /// mmap 区域的起始页和页数
    pub(crate) mmaps: BTreeMap<VirtPageNum, usize>,
}

impl SupplementalPageTable {
    pub fn new(vm: Arc<Vm>, mapper: Arc<dyn PageMapper>) -> Self {
        Self {
            vm,
            mapper,
            pages: HashMap::new(),
            mmaps: BTreeMap::new(),
        }
    }

    pub fn mapper(&self) -> &Arc<dyn PageMapper> {
        &self.mapper
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 找到 `va` 所在的页，并刷新它的访问时间
    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        let page = self.pages.get(&va.vpn_floor())?;
        page.lock().touch();
        Some(Arc::clone(page))
    }

    /// 插入一页。地址已被占用时失败，原有的页不受影响
    pub fn insert(&mut self, page: Page) -> bool {
        self.insert_page(page).is_some()
    }

    pub(crate) fn insert_page(&mut self, page: Page) -> Option<PageRef> {
        let vpn = page.va.vpn_floor();
        match self.pages.entry(vpn) {
            Entry::Occupied(_) => {
                debug!("{:?} is already in spt", page.va);
                None
            }
            Entry::Vacant(entry) => {
                let page = Arc::new(SpinMutex::new(page));
                entry.insert(Arc::clone(&page));
                Some(page)
            }
        }
    }

    /// 移除并销毁 `va` 所在的页，返回该页是否存在
    pub fn remove(&mut self, va: VirtAddr) -> bool {
        let Some(page) = self.pages.remove(&va.vpn_floor()) else {
            return false;
        };
        self.vm.lock().destroy(&page);
        true
    }

    /// 登记一个未初始化页，第一次访问时才分配帧
    pub fn declare(
        &mut self,
        va: VirtAddr,
        writable: bool,
        target: PageTarget,
        init: Option<Box<dyn PageInitializer>>,
    ) -> bool {
        self.declare_page(va, writable, target, init).is_some()
    }

    pub(crate) fn declare_page(
        &mut self,
        va: VirtAddr,
        writable: bool,
        target: PageTarget,
        init: Option<Box<dyn PageInitializer>>,
    ) -> Option<PageRef> {
        if !va.is_user() || !va.is_page_aligned() {
            debug!("cannot declare page at {va:?}");
            return None;
        }
        let kind = PageKind::Uninit(UninitPage::new(target, init));
        self.insert_page(Page::new(va, writable, Arc::clone(&self.mapper), kind))
    }

    /// 立即为 `va` 所在的页分配帧并填充内容
    pub fn claim_page(&mut self, va: VirtAddr) -> bool {
        let Some(page) = self.find(va) else {
            return false;
        };
        self.vm.lock().claim(&page)
    }

    pub fn page_type(&self, va: VirtAddr) -> Option<PageType> {
        let page = self.pages.get(&va.vpn_floor())?;
        let page_type = page.lock().page_type();
        Some(page_type)
    }

    /// 销毁所有页。脏的文件页会被写回，交换槽会被释放
    pub fn teardown(&mut self) {
        if self.pages.is_empty() {
            return;
        }
        trace!("teardown spt with {} pages", self.pages.len());
        self.mmaps.clear();
        let mut vm = self.vm.lock();
        for (_, page) in self.pages.drain() {
            vm.destroy(&page);
        }
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.teardown();
    }
}
