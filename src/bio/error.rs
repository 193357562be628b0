//! 块缓冲层的错误类型.
//!
//! 设备层错误 [`IoError`] 原样向上传播, 由 [`Error::Io`] 附带块号和操作类型;
//! 本层从不自行重试, 是否重试/跳过/中止由调用的 pass 决定.

use std::fmt;

use thiserror::Error;

use super::BufferHandle;

/// 出错时正在进行的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Acquire,
    Read,
    Write,
    Release,
    Invalidate,
    Flush,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Acquire => "acquire",
            Op::Read => "read",
            Op::Write => "write",
            Op::Release => "release",
            Op::Invalidate => "invalidate",
            Op::Flush => "flush",
        };
        f.write_str(name)
    }
}

/// Device adapter errors
#[derive(Error, Debug)]
pub enum IoError {
    #[error("short read: got {got} of {expected} bytes")]
    ShortRead { expected: usize, got: usize },
    #[error("device failure: {0}")]
    DeviceFailure(#[from] std::io::Error),
    #[error("block out of range: device has {count} blocks")]
    OutOfRange { count: u64 },
}

/// Buffer layer errors, every variant names the offending block and operation
#[derive(Error, Debug)]
pub enum Error {
    #[error("block {block}: {op} failed: {source}")]
    Io {
        block: u64,
        op: Op,
        #[source]
        source: IoError,
    },
    #[error("block {block}: acquire failed: out of memory allocating buffer")]
    OutOfMemory { block: u64 },
    #[error("block {block}: release failed: released more times than acquired")]
    DoubleRelease { block: u64 },
    #[error("block {block}: invalidate refused, buffer busy ({refs} outstanding handles)")]
    BufferBusy { block: u64, refs: usize },
    #[error("block {block}: {op} refused, buffer holds unwritten changes")]
    BufferDirty { block: u64, op: Op },
    #[error("block {block}: release refused, buffer still holds unwritten changes")]
    DirtyRelease { block: u64 },
    #[error("block {block}: write refused, session is read-only")]
    ReadOnly { block: u64 },
    /// 设备级别的刷新失败, 不对应具体的块
    #[error("device: flush failed: {0}")]
    Flush(#[source] IoError),
}

impl Error {
    pub(crate) fn io(block: u64, op: Op, source: IoError) -> Self {
        Error::Io { block, op, source }
    }

    /// 出错的块号, 设备级别的 flush 错误没有块号
    pub fn block(&self) -> Option<u64> {
        match self {
            Error::Io { block, .. }
            | Error::OutOfMemory { block }
            | Error::DoubleRelease { block }
            | Error::BufferBusy { block, .. }
            | Error::BufferDirty { block, .. }
            | Error::DirtyRelease { block }
            | Error::ReadOnly { block } => Some(*block),
            Error::Flush(_) => None,
        }
    }

    /// 出错时正在进行的操作
    pub fn op(&self) -> Op {
        match self {
            Error::Io { op, .. } | Error::BufferDirty { op, .. } => *op,
            Error::OutOfMemory { .. } => Op::Acquire,
            Error::DoubleRelease { .. } | Error::DirtyRelease { .. } => Op::Release,
            Error::BufferBusy { .. } => Op::Invalidate,
            Error::ReadOnly { .. } => Op::Write,
            Error::Flush(_) => Op::Flush,
        }
    }

    /// 设备层的原始错误, 非 I/O 错误时为 None
    pub fn io_kind(&self) -> Option<&IoError> {
        match self {
            Error::Io { source, .. } | Error::Flush(source) => Some(source),
            _ => None,
        }
    }

    /// 是否应当中止本次检查
    ///
    /// 内存耗尽和写失败总是致命的; 读失败交给调用者按块的重要性决定.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::OutOfMemory { .. } | Error::DoubleRelease { .. } | Error::Flush(_) => true,
            Error::Io { op, source, .. } => {
                *op != Op::Read || matches!(source, IoError::DeviceFailure(_))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// get_and_read_buf 失败.
///
/// 读失败时句柄仍然交还给调用者 (调用者负责 relse_buf), 但缓冲区内容无效;
/// 只有分配缓冲区本身失败时 `handle` 才为 None.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct FailedRead {
    pub handle: Option<BufferHandle>,
    #[source]
    pub error: Error,
}

impl FailedRead {
    pub fn into_parts(self) -> (Option<BufferHandle>, Error) {
        (self.handle, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_names_its_operation() {
        let errors = [
            Error::io(4, Op::Read, IoError::ShortRead { expected: 512, got: 0 }),
            Error::OutOfMemory { block: 4 },
            Error::DoubleRelease { block: 4 },
            Error::BufferBusy { block: 4, refs: 2 },
            Error::BufferDirty {
                block: 4,
                op: Op::Invalidate,
            },
            Error::DirtyRelease { block: 4 },
            Error::ReadOnly { block: 4 },
        ];
        let expected = [
            Op::Read,
            Op::Acquire,
            Op::Release,
            Op::Invalidate,
            Op::Invalidate,
            Op::Release,
            Op::Write,
        ];
        for (err, op) in errors.iter().zip(expected) {
            assert_eq!(err.op(), op);
            assert_eq!(err.block(), Some(4));
            let text = err.to_string();
            assert!(text.starts_with("block 4: "), "{}", text);
            assert!(text.contains(&op.to_string()), "{}", text);
        }

        let flush = Error::Flush(IoError::OutOfRange { count: 0 });
        assert_eq!(flush.op(), Op::Flush);
        assert_eq!(flush.block(), None);
        assert!(flush.to_string().contains("flush"));
    }
}
