//! 具体的块设备: 镜像文件 / 设备节点 [`BlockFile`], 以及测试用的内存设备 [`MemDevice`].

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;
use spin::Mutex;

use crate::bio::{BlockDevice, IoError};

fn check_len(block_size: usize, len: usize) -> Result<(), IoError> {
    if len != block_size {
        return Err(IoError::DeviceFailure(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {} bytes, block size is {}", len, block_size),
        )));
    }
    Ok(())
}

// 块设备节点的 metadata().len() 总是 0, 只能 seek 到末尾取得长度
fn device_len(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(len)
}

// std::fs::File 由 Rust 标准库 std 提供, 可以访问 Linux 上的一个文件或块设备节点.
// 我们将它包装成 BlockFile 类型来表示一块磁盘, 为它实现 BlockDevice 接口.
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的,
// 在访问一个特定的块的时候, 我们必须先 seek 到这个块的开头位置
pub struct BlockFile {
    file: Mutex<File>,
    block_size: usize,
    block_count: u64,
}

impl BlockFile {
    /// 打开已有的镜像或块设备节点. 文件末尾不足一个块的部分也算作一个块, 读它会得到 ShortRead
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, writable: bool) -> io::Result<Self> {
        if block_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block size must be non-zero",
            ));
        }
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = device_len(&mut file)?;
        let size = block_size as u64;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count: (len + size - 1) / size,
        })
    }

    /// 创建 (或截断) 一个 block_count 个块大小的镜像文件
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        block_count: u64,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * block_size as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            block_size,
            block_count,
        })
    }

    fn seek_to(&self, file: &mut File, block_id: u64) -> Result<(), IoError> {
        if block_id >= self.block_count {
            return Err(IoError::OutOfRange {
                count: self.block_count,
            });
        }
        file.seek(SeekFrom::Start(block_id * self.block_size as u64))?;
        Ok(())
    }
}

impl BlockDevice for BlockFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    /// 读取一个块从文件
    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<(), IoError> {
        check_len(self.block_size, buf.len())?;
        let mut file = self.file.lock();
        self.seek_to(&mut file, block_id)?;
        let mut got = 0;
        while got < buf.len() {
            match file.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if got < buf.len() {
            return Err(IoError::ShortRead {
                expected: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// 写一个块到文件, wait 时用 sync_data 等待落盘
    fn write_block(&self, block_id: u64, buf: &[u8], wait: bool) -> Result<(), IoError> {
        check_len(self.block_size, buf.len())?;
        let mut file = self.file.lock();
        self.seek_to(&mut file, block_id)?;
        file.write_all(buf)?;
        if wait {
            file.sync_data()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), IoError> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}

/// 内存中的块设备, 记录每种操作的调用次数
pub struct MemDevice {
    block_size: usize,
    block_count: u64,
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    waited_writes: AtomicUsize,
    flushes: AtomicUsize,
}

impl MemDevice {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            data: Mutex::new(vec![0; block_size * block_count as usize]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            waited_writes: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    fn range(&self, block_id: u64) -> Result<std::ops::Range<usize>, IoError> {
        if block_id >= self.block_count {
            return Err(IoError::OutOfRange {
                count: self.block_count,
            });
        }
        let start = block_id as usize * self.block_size;
        Ok(start..start + self.block_size)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn waited_writes(&self) -> usize {
        self.waited_writes.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// 设备上块的当前内容 (绕过缓冲层)
    pub fn block(&self, block_id: u64) -> Vec<u8> {
        match self.range(block_id) {
            Ok(range) => self.data.lock()[range].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    /// 绕过缓冲层直接修改设备内容, 模拟外部修改
    pub fn set_block(&self, block_id: u64, content: &[u8]) {
        if let Ok(range) = self.range(block_id) {
            self.data.lock()[range].copy_from_slice(content);
        }
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block_id: u64, buf: &mut [u8]) -> Result<(), IoError> {
        check_len(self.block_size, buf.len())?;
        let range = self.range(block_id)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        buf.copy_from_slice(&self.data.lock()[range]);
        trace!("mem device: read block {}", block_id);
        Ok(())
    }

    fn write_block(&self, block_id: u64, buf: &[u8], wait: bool) -> Result<(), IoError> {
        check_len(self.block_size, buf.len())?;
        let range = self.range(block_id)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        if wait {
            self.waited_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.data.lock()[range].copy_from_slice(buf);
        trace!("mem device: wrote block {}", block_id);
        Ok(())
    }

    fn flush(&self) -> Result<(), IoError> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn block_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.img");
        let device = BlockFile::create(&path, 512, 8).unwrap();
        assert_eq!(device.block_count(), 8);

        let pattern: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        device.write_block(3, &pattern, true).unwrap();
        device.flush().unwrap();
        drop(device);

        let device = BlockFile::open(&path, 512, false).unwrap();
        let mut buf = vec![0u8; 512];
        device.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, pattern);
        device.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn block_file_trailing_partial_block_is_short() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.img");
        std::fs::write(&path, vec![7u8; 512 + 100]).unwrap();
        let device = BlockFile::open(&path, 512, false).unwrap();
        assert_eq!(device.block_count(), 2);

        let mut buf = vec![0u8; 512];
        match device.read_block(1, &mut buf) {
            Err(IoError::ShortRead { expected, got }) => {
                assert_eq!(expected, 512);
                assert_eq!(got, 100);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            device.read_block(2, &mut buf),
            Err(IoError::OutOfRange { count: 2 })
        ));
    }

    #[test]
    fn open_measures_length_by_seeking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grown.img");
        // 只靠写入增长的文件, 从未 set_len
        {
            let mut file = File::create(&path).unwrap();
            for i in 0..5u8 {
                file.write_all(&[i; 512]).unwrap();
            }
        }
        let mut file = File::open(&path).unwrap();
        file.seek(SeekFrom::Start(700)).unwrap();
        assert_eq!(device_len(&mut file).unwrap(), 5 * 512);
        // 量完长度后回到开头
        assert_eq!(file.stream_position().unwrap(), 0);

        let device = BlockFile::open(&path, 512, true).unwrap();
        assert_eq!(device.block_count(), 5);
        let mut buf = vec![0u8; 512];
        device.read_block(4, &mut buf).unwrap();
        assert_eq!(buf, vec![4u8; 512]);
        device.write_block(4, &[9u8; 512], true).unwrap();
        device.read_block(4, &mut buf).unwrap();
        assert_eq!(buf, vec![9u8; 512]);
    }

    #[test]
    fn block_file_rejects_partial_buffers() {
        let dir = tempdir().unwrap();
        let device = BlockFile::create(dir.path().join("fs.img"), 512, 2).unwrap();
        let mut small = vec![0u8; 100];
        assert!(matches!(
            device.read_block(0, &mut small),
            Err(IoError::DeviceFailure(_))
        ));
        assert!(matches!(
            device.write_block(0, &small, false),
            Err(IoError::DeviceFailure(_))
        ));
    }

    #[test]
    fn mem_device_counts_calls() {
        let device = MemDevice::new(64, 4);
        let mut buf = vec![0u8; 64];
        device.write_block(1, &[1u8; 64], false).unwrap();
        device.write_block(2, &[2u8; 64], true).unwrap();
        device.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![1u8; 64]);
        assert_eq!(device.reads(), 1);
        assert_eq!(device.writes(), 2);
        assert_eq!(device.waited_writes(), 1);
        assert!(matches!(
            device.write_block(4, &buf, false),
            Err(IoError::OutOfRange { count: 4 })
        ));
        assert_eq!(device.writes(), 2);
    }
}
