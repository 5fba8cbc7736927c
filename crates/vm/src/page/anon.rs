use common::config::PAGE_SIZE;

use crate::swap::{SwapArea, SwapSlot};

/// 匿名页。换出过才会持有交换槽
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self { slot: None }
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub(super) fn swap_in(&mut self, page: &mut [u8; PAGE_SIZE], swap: &mut SwapArea) -> bool {
        match self.slot.take() {
            None => page.fill(0),
            Some(slot) => {
                swap.read_slot(slot, page);
                swap.free_slot(slot);
            }
        }
        true
    }

    pub(super) fn swap_out(&mut self, page: &[u8; PAGE_SIZE], swap: &mut SwapArea) -> bool {
        debug_assert!(self.slot.is_none());
        let Some(slot) = swap.alloc_slot() else {
            warn!("swap area exhausted");
            return false;
        };
        swap.write_slot(slot, page);
        self.slot = Some(slot);
        true
    }

    pub(super) fn destroy(&mut self, swap: &mut SwapArea) {
        if let Some(slot) = self.slot.take() {
            swap.free_slot(slot);
        }
    }
}
