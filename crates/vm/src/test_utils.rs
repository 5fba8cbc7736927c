//! 单元测试用的内存版外部设施：页表、块设备、文件、物理内存

use std::{
    alloc::{alloc_zeroed, Layout},
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use common::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE, USER_STACK_TOP};

use crate::{
    address::{KernelAddr, VirtAddr, VirtPageNum},
    fault::{FaultFlags, PageFault},
    hal::{BlockDevice, File, FramePool, PageMapper},
    spt::SupplementalPageTable,
    vm::Vm,
};

pub fn init_logger() {
    simple_logger::init(|args| println!("{args}"));
}

/// 从泄漏的堆内存中切出 `pages` 页作为物理内存
pub fn frame_pool(pages: usize) -> Arc<FramePool> {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    Arc::new(unsafe { FramePool::new(KernelAddr(base as usize), pages) })
}

/// 新的地址空间，使用独立的 VM 实例
pub fn new_space(frames: usize, swap_slots: usize) -> (SupplementalPageTable, Arc<MockSpace>) {
    init_logger();
    let disk = (swap_slots > 0).then(|| {
        Arc::new(RamDisk::new(swap_slots * SECTORS_PER_PAGE)) as Arc<dyn BlockDevice>
    });
    let vm = Arc::new(Vm::new(frame_pool(frames), disk));
    let space = Arc::new(MockSpace::new());
    (SupplementalPageTable::new(vm, space.clone()), space)
}

/// 与 `parent` 共用同一个 VM 的空地址空间
pub fn fork_space(parent: &SupplementalPageTable) -> (SupplementalPageTable, Arc<MockSpace>) {
    let space = Arc::new(MockSpace::new());
    (
        SupplementalPageTable::new(Arc::clone(&parent.vm), space.clone()),
        space,
    )
}

struct Pte {
    kva: KernelAddr,
    writable: bool,
    dirty: bool,
}

/// 模拟 MMU：记录映射和脏位，访问未映射或只读的页时失败
#[derive(Default)]
pub struct MockSpace {
    ptes: Mutex<HashMap<VirtPageNum, Pte>>,
}

impl MockSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.ptes.lock().unwrap().contains_key(&va.vpn_floor())
    }

    /// 读同一页内的数据，未映射时返回 `None`
    pub fn read(&self, va: VirtAddr, len: usize) -> Option<Vec<u8>> {
        assert!(va.page_offset() + len <= PAGE_SIZE);
        let ptes = self.ptes.lock().unwrap();
        let pte = ptes.get(&va.vpn_floor())?;
        let bytes = unsafe { pte.kva.as_page_bytes() };
        Some(bytes[va.page_offset()..va.page_offset() + len].to_vec())
    }

    /// 写同一页内的数据并置脏位，未映射或只读时返回 false
    pub fn write(&self, va: VirtAddr, data: &[u8]) -> bool {
        assert!(va.page_offset() + data.len() <= PAGE_SIZE);
        let mut ptes = self.ptes.lock().unwrap();
        let Some(pte) = ptes.get_mut(&va.vpn_floor()) else {
            return false;
        };
        if !pte.writable {
            return false;
        }
        let bytes = unsafe { pte.kva.as_page_bytes_mut() };
        bytes[va.page_offset()..va.page_offset() + data.len()].copy_from_slice(data);
        pte.dirty = true;
        true
    }
}

impl PageMapper for MockSpace {
    fn install(&self, va: VirtAddr, kva: KernelAddr, writable: bool) -> bool {
        let pte = Pte {
            kva,
            writable,
            dirty: false,
        };
        self.ptes.lock().unwrap().insert(va.vpn_floor(), pte);
        true
    }

    fn clear(&self, va: VirtAddr) {
        self.ptes.lock().unwrap().remove(&va.vpn_floor());
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.ptes
            .lock()
            .unwrap()
            .get(&va.vpn_floor())
            .is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        if let Some(pte) = self.ptes.lock().unwrap().get_mut(&va.vpn_floor()) {
            pte.dirty = dirty;
        }
    }
}

fn fault_flags(space: &MockSpace, va: VirtAddr, write: bool) -> FaultFlags {
    let mut flags = FaultFlags::USER;
    flags.set(FaultFlags::WRITE, write);
    flags.set(FaultFlags::PRESENT, space.is_mapped(va));
    flags
}

fn fault_in(spt: &mut SupplementalPageTable, space: &MockSpace, va: VirtAddr, write: bool) -> bool {
    let fault = PageFault {
        addr: va,
        sp: VirtAddr(USER_STACK_TOP),
        flags: fault_flags(space, va, write),
    };
    spt.resolve_fault(&fault)
}

/// 以用户身份读，缺页时交给 `resolve_fault` 处理
pub fn user_read(
    spt: &mut SupplementalPageTable,
    space: &MockSpace,
    va: VirtAddr,
    len: usize,
) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    let mut cur = va;
    while out.len() < len {
        let chunk = (PAGE_SIZE - cur.page_offset()).min(len - out.len());
        let bytes = match space.read(cur, chunk) {
            Some(bytes) => bytes,
            None => {
                if !fault_in(spt, space, cur, false) {
                    return None;
                }
                space.read(cur, chunk)?
            }
        };
        out.extend_from_slice(&bytes);
        cur = cur + chunk;
    }
    Some(out)
}

/// 以用户身份写，缺页时交给 `resolve_fault` 处理
pub fn user_write(
    spt: &mut SupplementalPageTable,
    space: &MockSpace,
    va: VirtAddr,
    data: &[u8],
) -> bool {
    let mut cur = va;
    let mut rest = data;
    while !rest.is_empty() {
        let chunk = (PAGE_SIZE - cur.page_offset()).min(rest.len());
        let (head, tail) = rest.split_at(chunk);
        if !space.write(cur, head) && !(fault_in(spt, space, cur, true) && space.write(cur, head)) {
            return false;
        }
        cur = cur + chunk;
        rest = tail;
    }
    true
}

pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sectors]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector]);
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) {
        self.sectors.lock().unwrap()[sector].copy_from_slice(buf);
    }
}

/// 内存中的文件。每个句柄有独立的偏移，共享数据；长度固定，写不会扩展文件
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    handles: Arc<AtomicUsize>,
}

struct MemHandle {
    data: Arc<Mutex<Vec<u8>>>,
    handles: Arc<AtomicUsize>,
    pos: usize,
}

impl MemFile {
    pub fn new(content: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(content.to_vec())),
            handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn handle(&self) -> Box<dyn File> {
        Box::new(MemHandle::open(&self.data, &self.handles))
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }
}

impl MemHandle {
    fn open(data: &Arc<Mutex<Vec<u8>>>, handles: &Arc<AtomicUsize>) -> Self {
        handles.fetch_add(1, Ordering::SeqCst);
        Self {
            data: Arc::clone(data),
            handles: Arc::clone(handles),
            pos: 0,
        }
    }
}

impl File for MemHandle {
    fn length(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(self.pos));
        buf[..n].copy_from_slice(&data[self.pos..self.pos + n]);
        self.pos += n;
        n
    }

    fn write_at(&mut self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.data.lock().unwrap();
        let n = buf.len().min(data.len().saturating_sub(offset));
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    fn reopen(&self) -> Option<Box<dyn File>> {
        Some(Box::new(MemHandle::open(&self.data, &self.handles)))
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}
