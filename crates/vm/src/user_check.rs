use common::config::USER_SPACE_END;
use defines::error::{errno, KResult};

use crate::{address::VirtAddr, spt::SupplementalPageTable};

impl SupplementalPageTable {
    /// 检查系统调用传进来的用户缓冲区 `[addr, addr + len)`
    ///
    /// 每一页都要已在 SPT 中登记，`write` 为真时还要求可写。页不必驻留，访问时会按需载入。
    pub fn check_user_range(&self, addr: VirtAddr, len: usize, write: bool) -> KResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.0.checked_add(len).ok_or(errno::EFAULT)?;
        if !addr.is_user() || end > USER_SPACE_END {
            return Err(errno::EFAULT);
        }
        for vpn in addr.vpn_floor().range_to(VirtAddr(end).vpn_ceil()) {
            let Some(page) = self.pages.get(&vpn) else {
                debug!("user buffer {addr:?}+{len:#x} touches unmapped {vpn:?}");
                return Err(errno::EFAULT);
            };
            if write && !page.lock().writable() {
                debug!("user buffer {addr:?}+{len:#x} is not writable");
                return Err(errno::EFAULT);
            }
        }
        Ok(())
    }
}
