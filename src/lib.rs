//! fsck 块缓冲层: 检查器的各个 pass 通过这里读写磁盘上的元数据块.
//!
//! 分层 (自底向上):
//!
//! - [`bio::BlockDevice`]: 块设备接口, 以块为单位读写
//! - [`bio::BufferPool`]: 块号 -> 缓冲区 的唯一映射, 负责引用计数与缓存替换
//! - [`bio::FsckSb`]: 一次检查运行的会话上下文, 对外提供 get_buf / read_buf / write_buf / relse_buf

pub mod bio;
pub mod device;
pub mod logger;
