//! 一次检查运行的会话上下文 [`FsckSb`].
//!
//! 它独占块设备和缓冲池, 检查器的各个 pass 只通过这里的 get_buf / read_buf / write_buf /
//! relse_buf / get_and_read_buf 访问磁盘块. 会话在 [`FsckSb::close`] (或 drop) 时结束,
//! 此时仍未释放的句柄会被强制释放, 所有脏缓冲区会被写回.

use std::sync::Arc;

use log::{debug, error, info, trace, warn};

use super::{
    BioConfig, BioStats, BlockDevice, BufFlags, BufferHandle, BufferPool, DirtyReleasePolicy,
    Error, FailedRead, Op, Result,
};

pub struct FsckSb {
    config: BioConfig,
    pool: BufferPool,
    closed: bool,
}

impl FsckSb {
    pub fn new(device: Arc<dyn BlockDevice>, config: BioConfig) -> Self {
        info!(
            "bio session: block size {}, {} blocks, cache {}, read-only {}",
            device.block_size(),
            device.block_count(),
            config.cache_capacity,
            config.read_only
        );
        let pool = BufferPool::new(device, &config);
        Self {
            config,
            pool,
            closed: false,
        }
    }

    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    pub fn block_count(&self) -> u64 {
        self.pool.device().block_count()
    }

    pub fn config(&self) -> &BioConfig {
        &self.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> BioStats {
        self.pool.stats()
    }

    /// 获取块 block_id 的句柄, 不保证内容有效.
    ///
    /// 新分配的缓冲区内容未定义, 调用者要么完全覆盖它, 要么先 read_buf.
    pub fn get_buf(&mut self, block_id: u64) -> Result<BufferHandle> {
        self.pool.acquire(block_id)
    }

    /// 保证句柄对应缓冲区的内容与设备一致.
    ///
    /// 已经 valid 且没有要求 FORCE 时直接命中, 不访问设备.
    /// 缓冲区有未写回的修改时拒绝从设备重读, 返回 [`Error::BufferDirty`].
    pub fn read_buf(&mut self, handle: &BufferHandle, flags: BufFlags) -> Result<()> {
        let state = handle.state();
        if state.valid && !flags.force {
            self.pool.record_read_hit();
            trace!("block {}: read hit", handle.block_id());
            return Ok(());
        }
        if state.dirty {
            return Err(Error::BufferDirty {
                block: handle.block_id(),
                op: Op::Read,
            });
        }
        self.pool.fill(handle)
    }

    /// get_buf + read_buf.
    ///
    /// 读失败时句柄随错误一起返回 ([`FailedRead::handle`]), 调用者仍需 relse_buf.
    pub fn get_and_read_buf(
        &mut self,
        block_id: u64,
        flags: BufFlags,
    ) -> std::result::Result<BufferHandle, FailedRead> {
        let handle = self
            .get_buf(block_id)
            .map_err(|error| FailedRead {
                handle: None,
                error,
            })?;
        match self.read_buf(&handle, flags) {
            Ok(()) => Ok(handle),
            Err(error) => Err(FailedRead {
                handle: Some(handle),
                error,
            }),
        }
    }

    /// 把脏缓冲区写回设备, flags 含 WAIT 时等到数据落盘才返回.
    ///
    /// 干净的缓冲区不产生任何设备写入. 写失败时保持 dirty, 由调用者决定重试还是中止.
    pub fn write_buf(&mut self, handle: &BufferHandle, flags: BufFlags) -> Result<()> {
        if !handle.is_dirty() {
            trace!("block {}: clean, nothing to write", handle.block_id());
            return Ok(());
        }
        self.pool.flush(handle, flags.contains(BufFlags::WAIT))
    }

    /// 释放句柄.
    ///
    /// 最后一个句柄释放时缓冲区仍为脏, 说明有修复没有写回:
    /// [`DirtyReleasePolicy::Warn`] 记日志后继续, 修改留在缓存中等待之后写回;
    /// [`DirtyReleasePolicy::Strict`] 同样完成释放, 但返回 [`Error::DirtyRelease`].
    pub fn relse_buf(&mut self, handle: BufferHandle) -> Result<()> {
        let block_id = handle.block_id();
        let state = self.pool.release(handle)?;
        if state.dirty && !state.in_use {
            match self.config.dirty_release {
                DirtyReleasePolicy::Warn => {
                    warn!("block {}: released while dirty, write deferred", block_id);
                }
                DirtyReleasePolicy::Strict => {
                    error!("block {}: released while dirty", block_id);
                    return Err(Error::DirtyRelease { block: block_id });
                }
            }
        }
        Ok(())
    }

    /// 显式丢弃未写回的修改, 缓冲区变为 invalid
    pub fn discard_buf(&mut self, handle: &BufferHandle) {
        if handle.is_dirty() {
            warn!("block {}: discarding unwritten changes", handle.block_id());
            self.pool.discard(handle);
        }
    }

    /// 丢弃块的缓存内容, 见 [`BufferPool::invalidate`]
    pub fn invalidate(&mut self, block_id: u64) -> Result<()> {
        self.pool.invalidate(block_id)
    }

    /// 写回所有未被引用的脏缓冲区并刷新设备, 仍持有句柄的块留到释放后
    pub fn sync_all(&mut self) -> Result<()> {
        self.pool.sync_all(false)
    }

    /// 结束会话, 返回本次运行的统计
    pub fn close(mut self) -> Result<BioStats> {
        self.closed = true;
        self.shutdown()?;
        Ok(self.pool.stats())
    }

    fn shutdown(&mut self) -> Result<()> {
        for (block_id, refs) in self.pool.force_release() {
            warn!(
                "block {}: {} handle(s) not released before teardown",
                block_id, refs
            );
        }
        if self.config.read_only {
            for block_id in self.pool.discard_all_dirty() {
                warn!("block {}: read-only session, changes discarded", block_id);
            }
            return Ok(());
        }
        self.pool.sync_all(true)?;
        let stats = self.pool.stats();
        debug!("bio session closed: {:?}", stats);
        Ok(())
    }
}

impl Drop for FsckSb {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.shutdown() {
            error!("bio teardown failed: {}", e);
        }
    }
}
