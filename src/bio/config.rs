//! 每次运行的配置, 以及 read_buf / write_buf 的标志位.

use std::ops::BitOr;

use super::BLOCK_CACHE_SIZE;

/// 缓冲区在仍为脏时被 relse_buf 的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyReleasePolicy {
    /// 记一条 warn 日志, 缓冲区保持脏状态留在缓存中, 之后写回
    Warn,
    /// 释放引用后返回 [`super::Error::DirtyRelease`]
    Strict,
}

impl Default for DirtyReleasePolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            DirtyReleasePolicy::Strict
        } else {
            DirtyReleasePolicy::Warn
        }
    }
}

#[derive(Debug, Clone)]
pub struct BioConfig {
    /// 引用计数为 0 的缓冲区按 LRU 淘汰, 驻留总数超过该值时触发; 0 表示永不淘汰
    pub cache_capacity: usize,
    pub dirty_release: DirtyReleasePolicy,
    /// fsck -n: 不允许任何写回
    pub read_only: bool,
}

impl Default for BioConfig {
    fn default() -> Self {
        Self {
            cache_capacity: BLOCK_CACHE_SIZE,
            dirty_release: DirtyReleasePolicy::default(),
            read_only: false,
        }
    }
}

/// read_buf / write_buf flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufFlags {
    /// write_buf: 等待写入落盘后才返回
    pub wait: bool,
    /// read_buf: 忽略 valid 标志, 强制从设备重读
    pub force: bool,
}

impl BufFlags {
    pub const NONE: BufFlags = BufFlags {
        wait: false,
        force: false,
    };
    pub const WAIT: BufFlags = BufFlags {
        wait: true,
        force: false,
    };
    pub const FORCE: BufFlags = BufFlags {
        wait: false,
        force: true,
    };

    pub fn contains(self, other: BufFlags) -> bool {
        (!other.wait || self.wait) && (!other.force || self.force)
    }
}

impl BitOr for BufFlags {
    type Output = BufFlags;

    fn bitor(self, rhs: BufFlags) -> BufFlags {
        BufFlags {
            wait: self.wait || rhs.wait,
            force: self.force || rhs.force,
        }
    }
}
