use alloc::boxed::Box;

use common::config::PAGE_SIZE;

use super::{FileBacking, PageKind, PageTarget, PageType};

/// 未初始化页的延迟初始化器，只会被调用一次
pub trait PageInitializer: Send {
    /// 填充刚分配的帧，帧在调用前已被清零
    fn initialize(self: Box<Self>, page: &mut [u8; PAGE_SIZE]) -> bool;
    /// fork 时为子进程复制一份
    fn duplicate(&self) -> Option<Box<dyn PageInitializer>>;
}

impl<F> PageInitializer for F
where
    F: FnOnce(&mut [u8; PAGE_SIZE]) -> bool + Clone + Send + 'static,
{
    fn initialize(self: Box<Self>, page: &mut [u8; PAGE_SIZE]) -> bool {
        (*self)(page)
    }

    fn duplicate(&self) -> Option<Box<dyn PageInitializer>> {
        Some(Box::new(self.clone()))
    }
}

/// 可执行文件段的加载器：读 `read_bytes` 字节，其余补零
pub struct SegmentLoader {
    backing: FileBacking,
}

impl SegmentLoader {
    pub fn new(backing: FileBacking) -> Self {
        Self { backing }
    }
}

impl PageInitializer for SegmentLoader {
    fn initialize(mut self: Box<Self>, page: &mut [u8; PAGE_SIZE]) -> bool {
        self.backing.load(page);
        true
    }

    fn duplicate(&self) -> Option<Box<dyn PageInitializer>> {
        let backing = self.backing.duplicate()?;
        Some(Box::new(SegmentLoader { backing }))
    }
}

fn always_fail(_: &mut [u8; PAGE_SIZE]) -> bool {
    false
}

pub struct UninitPage {
    target: PageTarget,
    init: Option<Box<dyn PageInitializer>>,
}

impl UninitPage {
    pub fn new(target: PageTarget, init: Option<Box<dyn PageInitializer>>) -> Self {
        Self { target, init }
    }

    pub fn target_type(&self) -> PageType {
        self.target.page_type()
    }

    /// 变成目标类型并填充内容。初始化器失败时仍是未初始化页，下次访问会重新初始化
    pub(super) fn initialize(self, page: &mut [u8; PAGE_SIZE]) -> Result<PageKind, UninitPage> {
        let Self { mut target, init } = self;
        let Some(init) = init else {
            match &mut target {
                PageTarget::Anon => page.fill(0),
                PageTarget::File(backing) => backing.load(page),
            }
            return Ok(target.into_kind());
        };
        // 初始化器只能调用一次，先留一份给重试
        let retry = init.duplicate();
        if init.initialize(page) {
            return Ok(target.into_kind());
        }
        let init = retry.unwrap_or_else(|| Box::new(always_fail) as Box<dyn PageInitializer>);
        Err(UninitPage {
            target,
            init: Some(init),
        })
    }

    pub(crate) fn duplicate(&self) -> Option<UninitPage> {
        let init = match &self.init {
            Some(init) => Some(init.duplicate()?),
            None => None,
        };
        Some(UninitPage {
            target: self.target.duplicate()?,
            init,
        })
    }
}
