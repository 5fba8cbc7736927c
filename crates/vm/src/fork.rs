//! fork 时复制地址空间。已驻留的页与子进程共享帧，直到一方写入（写时复制）

use alloc::sync::Arc;

use crate::{
    page::{Page, PageKind},
    spt::SupplementalPageTable,
};

impl SupplementalPageTable {
    /// 把 `src` 的所有页和 mmap 区域复制到 `self`。失败时 `self` 中可能留有部分页，由调用方销毁
    pub fn copy_from(&mut self, src: &SupplementalPageTable) -> bool {
        debug_assert!(Arc::ptr_eq(&self.vm, &src.vm));
        let vm = Arc::clone(&self.vm);
        let mut vm = vm.lock();
        for (vpn, src_ref) in &src.pages {
            let mut src_page = src_ref.lock();
            let va = vpn.page_start();

            if let PageKind::Uninit(uninit) = &src_page.kind {
                let Some(uninit) = uninit.duplicate() else {
                    debug!("fork: cannot duplicate initializer of {va:?}");
                    return false;
                };
                let page = Page::new(
                    va,
                    src_page.writable,
                    Arc::clone(&self.mapper),
                    PageKind::Uninit(uninit),
                );
                if !self.insert(page) {
                    return false;
                }
                continue;
            }

            // 换出的页先换回来再共享
            if src_page.frame.is_none() && !vm.claim_locked(src_ref, &mut src_page) {
                return false;
            }
            let Some(frame) = src_page.frame else {
                return false;
            };
            let Some(kind) = src_page.kind.duplicate() else {
                debug!("fork: cannot duplicate {va:?}");
                return false;
            };
            let mut page = Page::new(va, src_page.writable, Arc::clone(&self.mapper), kind);
            page.frame = Some(frame);
            page.cow = true;
            page.last_access = src_page.last_access;
            let Some(dst_ref) = self.insert_page(page) else {
                return false;
            };
            vm.frames.link(frame, &dst_ref);

            let kva = vm.frames.kva(frame);
            src_page.cow = true;
            if !src_page.remap(kva, false) || !self.mapper.install(va, kva, false) {
                return false;
            }
            trace!("fork: share {va:?} on {frame:?}");
        }
        self.mmaps.extend(&src.mmaps);
        true
    }
}

#[cfg(test)]
mod tests {
    use common::config::PAGE_SIZE;

    use super::*;
    use crate::{
        address::VirtAddr,
        page::{FileBacking, PageTarget, PageType, SegmentLoader},
        test_utils::{fork_space, new_space, user_read, user_write, MemFile},
    };

    #[test]
    fn shared_pages_diverge_on_write() {
        let (mut parent, parent_space) = new_space(8, 0);
        let va = VirtAddr(0x3000);
        assert!(parent.declare(va, true, PageTarget::Anon, None));
        assert!(user_write(&mut parent, &parent_space, va, b"parent"));

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert_eq!(parent.vm.stats().shared_frames, 1);
        assert_eq!(user_read(&mut child, &child_space, va, 6), Some(b"parent".to_vec()));

        assert!(user_write(&mut child, &child_space, va, b"child!"));
        assert_eq!(user_read(&mut parent, &parent_space, va, 6), Some(b"parent".to_vec()));
        assert_eq!(user_read(&mut child, &child_space, va, 6), Some(b"child!".to_vec()));
        assert_eq!(parent.vm.stats().shared_frames, 0);
        assert_eq!(parent.vm.stats().resident_frames, 2);

        // 另一方已经分开，只需恢复写权限，不再复制
        assert!(user_write(&mut parent, &parent_space, va, b"again!"));
        assert_eq!(parent.vm.stats().resident_frames, 2);
        assert_eq!(user_read(&mut child, &child_space, va, 6), Some(b"child!".to_vec()));
    }

    #[test]
    fn writes_in_parent_stay_private() {
        let (mut parent, parent_space) = new_space(8, 0);
        let va = VirtAddr(0x3000);
        assert!(parent.declare(va, true, PageTarget::Anon, None));
        assert!(user_write(&mut parent, &parent_space, va, &[1; PAGE_SIZE]));

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert!(user_write(&mut parent, &parent_space, va, &[2; PAGE_SIZE]));

        let content = user_read(&mut child, &child_space, va, PAGE_SIZE).unwrap();
        assert!(content.iter().all(|&b| b == 1));
    }

    #[test]
    fn teardown_of_one_side_keeps_the_other() {
        let (mut parent, parent_space) = new_space(8, 0);
        let va = VirtAddr(0x3000);
        assert!(parent.declare(va, true, PageTarget::Anon, None));
        assert!(user_write(&mut parent, &parent_space, va, b"kept"));

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        let vm = Arc::clone(&parent.vm);
        drop(parent);
        assert_eq!(vm.stats().resident_frames, 1);
        assert_eq!(user_read(&mut child, &child_space, va, 4), Some(b"kept".to_vec()));
        assert!(user_write(&mut child, &child_space, va, b"mine"));
        assert_eq!(vm.stats().resident_frames, 1);
    }

    #[test]
    fn uninit_pages_get_their_own_handles() {
        let (mut parent, _) = new_space(8, 0);
        let file = MemFile::new(b"text section");
        let va = VirtAddr(0x40_0000);
        let loader = SegmentLoader::new(FileBacking::new(file.handle(), 5, 7));
        assert!(parent.declare(va, false, PageTarget::Anon, Some(Box::new(loader))));

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert_eq!(file.open_handles(), 2);
        assert_eq!(parent.vm.stats().resident_frames, 0);
        assert_eq!(child.page_type(va), Some(PageType::Anon));

        drop(parent);
        assert_eq!(file.open_handles(), 1);
        assert_eq!(user_read(&mut child, &child_space, va, 7), Some(b"section".to_vec()));
    }

    #[test]
    fn swapped_out_pages_are_brought_back() {
        let (mut parent, parent_space) = new_space(2, 4);
        let (a, b, c) = (VirtAddr(0x1000), VirtAddr(0x2000), VirtAddr(0x3000));
        for va in [a, b, c] {
            assert!(parent.declare(va, true, PageTarget::Anon, None));
        }
        assert!(user_write(&mut parent, &parent_space, a, b"first"));
        assert!(user_write(&mut parent, &parent_space, b, b"second"));
        assert!(user_write(&mut parent, &parent_space, c, b"third"));
        assert!(!parent.find(a).unwrap().lock().is_resident());
        // 腾出一帧给 a
        assert!(parent.remove(c));

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert_eq!(parent.vm.stats().shared_frames, 2);
        assert_eq!(parent.vm.stats().swap_used, 0);
        assert_eq!(user_read(&mut child, &child_space, a, 5), Some(b"first".to_vec()));
        assert_eq!(user_read(&mut child, &child_space, b, 6), Some(b"second".to_vec()));
    }

    #[test]
    fn mapped_file_is_shared_until_written() {
        let (mut parent, parent_space) = new_space(8, 0);
        let file = MemFile::new(&[b'.'; PAGE_SIZE]);
        let handle = file.handle();
        let base = VirtAddr(0x1000_0000);
        assert_eq!(parent.map(base, PAGE_SIZE, true, handle.as_ref(), 0), Ok(base));
        assert_eq!(user_read(&mut parent, &parent_space, base, 1), Some(vec![b'.']));
        assert_eq!(file.open_handles(), 2);

        let (mut child, child_space) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert_eq!(file.open_handles(), 3);
        assert_eq!(child.page_type(base), Some(PageType::File));
        assert_eq!(parent.vm.stats().shared_frames, 1);

        assert!(user_write(&mut child, &child_space, base, b"child"));
        assert_eq!(user_read(&mut parent, &parent_space, base, 5), Some(b".....".to_vec()));

        // 子进程继承的映射可以单独撤销，写过的内容写回文件
        assert_eq!(child.unmap(base), Ok(()));
        assert!(child.is_empty());
        assert_eq!(file.open_handles(), 2);
        assert_eq!(&file.contents()[..6], b"child.");

        // 父进程的页没有写过，不会覆盖文件
        drop(parent);
        assert_eq!(file.open_handles(), 1);
        assert_eq!(&file.contents()[..6], b"child.");
    }

    #[test]
    fn child_can_unmap_an_inherited_region() {
        let (mut parent, _) = new_space(8, 0);
        let file = MemFile::new(&[1; 2 * PAGE_SIZE]);
        let handle = file.handle();
        let base = VirtAddr(0x1000_0000);
        assert_eq!(parent.map(base, 2 * PAGE_SIZE, false, handle.as_ref(), 0), Ok(base));

        let (mut child, _) = fork_space(&parent);
        assert!(child.copy_from(&parent));
        assert_eq!(child.len(), 2);
        assert_eq!(child.unmap(base), Ok(()));
        assert!(child.is_empty());
        assert_eq!(parent.len(), 2);
        assert_eq!(parent.unmap(base), Ok(()));
    }
}
