mod block_cache;
mod block_dev;
mod config;
mod error;
mod sb;

extern crate log;

/// Use a block size of 4096 bytes unless the device says otherwise
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// 内存中同时驻留的空闲块缓冲区数量上限, 0 表示不限制
pub const BLOCK_CACHE_SIZE: usize = 1024;

pub use block_cache::{BioStats, Buffer, BufferHandle, BufferPool, BufferState};
pub use block_dev::BlockDevice;
pub use config::{BioConfig, BufFlags, DirtyReleasePolicy};
pub use error::{Error, FailedRead, IoError, Op, Result};
pub use sb::FsckSb;
