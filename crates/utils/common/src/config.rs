//! 虚拟内存子系统的编译期配置

use crate::constant::MiB;

pub const PAGE_SIZE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 磁盘扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一个交换槽（即一页）占用的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户栈顶（不含）
pub const USER_STACK_TOP: usize = 0x4748_0000;
/// 用户栈最多能增长到多大
pub const MAX_STACK_SIZE: usize = MiB;
/// `push` 之类的指令会先访问栈指针之下的地址再修改栈指针，所以要容忍这段距离
pub const STACK_PUSH_SLACK: usize = 8;

/// 用户地址空间的末端（不含），其上属于内核
pub const USER_SPACE_END: usize = 0x80_0400_0000;

const _: () = assert!(USER_STACK_TOP <= USER_SPACE_END);
const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
