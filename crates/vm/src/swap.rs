//! 交换区。磁盘按页切成槽，每槽 [`SECTORS_PER_PAGE`] 个扇区，用位图记录占用情况
//!
//! 只在全局 VM 锁下访问。

use alloc::{sync::Arc, vec, vec::Vec};

use common::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

use crate::hal::BlockDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

pub struct SwapArea {
    disk: Option<Arc<dyn BlockDevice>>,
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapArea {
    /// 没有交换盘时交换区容量为 0，匿名页将无法换出
    pub fn new(disk: Option<Arc<dyn BlockDevice>>) -> Self {
        let slots = disk
            .as_ref()
            .map_or(0, |disk| disk.sector_count() / SECTORS_PER_PAGE);
        Self {
            disk,
            bitmap: vec![0; slots.div_ceil(64)],
            slots,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// 取第一个空闲槽
    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        let (word_index, word) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)?;
        let bit = word.trailing_ones() as usize;
        let index = word_index * 64 + bit;
        if index >= self.slots {
            return None;
        }
        *word |= 1 << bit;
        self.used += 1;
        trace!("swap: alloc slot {index}");
        Some(SwapSlot(index))
    }

    pub fn free_slot(&mut self, slot: SwapSlot) {
        let (word, bit) = (slot.0 / 64, slot.0 % 64);
        debug_assert!(self.bitmap[word] & (1 << bit) != 0, "double free of {slot:?}");
        self.bitmap[word] &= !(1 << bit);
        self.used -= 1;
        trace!("swap: free slot {}", slot.0);
    }

    pub fn read_slot(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) {
        let Some(disk) = &self.disk else {
            return;
        };
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            disk.read_sector(slot.first_sector() + i, sector);
        }
    }

    pub fn write_slot(&self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) {
        let Some(disk) = &self.disk else {
            return;
        };
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            disk.write_sector(slot.first_sector() + i, sector);
        }
    }
}
