//! 块设备仅支持以块为单位进行随机读写, 需要由具体的块设备驱动来实现这些方法.
//! 块缓冲层会调用这些方法来填充和写回缓冲区.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的任意后端 (镜像文件, 设备节点, 内存).

use std::any::Any;

use super::IoError;

// 块设备接口层
// 偏移量 = block_id * block_size, 不支持部分块读写

pub trait BlockDevice: Send + Sync + Any {
    /// 块大小 (字节), 在一次运行内保持不变
    fn block_size(&self) -> usize;

    /// 设备上的块总数, 块号 >= block_count 的访问返回 [`IoError::OutOfRange`]
    fn block_count(&self) -> u64;

    // read_block 将编号为 block_id 的块从磁盘读入内存中的缓冲区 buf;
    // 读到的字节数不足一个块时返回 ShortRead.
    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<(), IoError>;

    /// write_block 将 buf 写入编号为 block_id 的块.
    ///
    /// `wait` 为 true 时, 返回前数据必须已经落到稳定存储上;
    /// 否则写入可能只是进入了队列, 直到之后的 [`BlockDevice::flush`] 或进程退出才保证持久.
    fn write_block(&self, block_id: u64, buf: &[u8], wait: bool) -> Result<(), IoError>;

    /// 把之前所有未等待的写入刷到稳定存储
    fn flush(&self) -> Result<(), IoError>;
}
