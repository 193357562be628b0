//! 块缓冲池: 在内存中缓存磁盘块的数据, 并保证同一个块在内存中只有一份缓冲区.
//!
//! fsck 的各个 pass 会反复地, 乱序地读写超级块, 位图, inode 和目录块.
//! 如果每个 pass 都把块读到自己临时创建的缓冲区里, 同一个块就可能同时存在多份互不可见的副本,
//! 一份上的修复会被另一份的写回覆盖. 因此所有缓冲区统一由 [`BufferPool`] 管理:
//! 要访问一个块时先查池中是否已有该块的缓冲区, 有则增加引用计数直接复用, 没有才新建.
//!
//! 引用计数归零的缓冲区不会立即回收, 而是按 LRU 顺序留在池中, 之后再次访问可以直接命中.
//! 驻留数量达到上限时, 从最久未使用的空闲缓冲区开始淘汰; 脏缓冲区在淘汰前先写回磁盘.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use log::{debug, error, trace, warn};
use spin::Mutex;

use super::{BioConfig, BlockDevice, Error, Op, Result};

/// 缓冲区状态, 替代 BH_STATE 位掩码
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferState {
    /// 内容与设备上的块一致
    pub valid: bool,
    /// 自上次写回以来被修改过
    pub dirty: bool,
    /// 至少有一个未释放的句柄
    pub in_use: bool,
}

/// Cached block inside memory
pub struct Buffer {
    /// 缓冲区对应的块号, 创建后不再改变
    block_id: u64,
    /// 恰好一个块大小的内存区域
    data: Vec<u8>,
    state: BufferState,
    /// 未释放的句柄数量, 为 0 时才可以被淘汰
    refs: usize,
}

impl Buffer {
    /// 分配一个尚未读入内容 (invalid) 的缓冲区
    ///
    /// 内存不足时返回 [`Error::OutOfMemory`] 而不是直接 abort.
    fn new(block_id: u64, block_size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(block_size)
            .map_err(|_| Error::OutOfMemory { block: block_id })?;
        data.resize(block_size, 0);
        Ok(Self {
            block_id,
            data,
            state: BufferState::default(),
            refs: 0,
        })
    }

    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn refs(&self) -> usize {
        self.refs
    }
}

/// 调用者持有的缓冲区句柄.
///
/// 句柄不能 Clone: 每个句柄对应一次 get_buf, 只能被 relse_buf 消耗一次.
/// 同一块号的所有句柄指向同一个 [`Buffer`].
///
/// 注意不要在 [`BufferHandle::read`] / [`BufferHandle::modify`] 的闭包中再访问同一个块, 否则会死锁.
pub struct BufferHandle {
    block_id: u64,
    buffer: Arc<Mutex<Buffer>>,
}

impl BufferHandle {
    pub fn block_id(&self) -> u64 {
        self.block_id
    }

    pub fn size(&self) -> usize {
        self.buffer.lock().data.len()
    }

    pub fn state(&self) -> BufferState {
        self.buffer.lock().state
    }

    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    /// 以只读方式访问缓冲区内容, 返回闭包的返回值
    pub fn read<V>(&self, f: impl FnOnce(&[u8]) -> V) -> V {
        let buffer = self.buffer.lock();
        f(&buffer.data)
    }

    /// 修改缓冲区内容, 并将其标记为脏.
    /// 之后需要 write_buf 才能真正把修改同步到磁盘.
    pub fn modify<V>(&self, f: impl FnOnce(&mut [u8]) -> V) -> V {
        let mut buffer = self.buffer.lock();
        buffer.state.dirty = true;
        f(&mut buffer.data)
    }

    pub fn mark_dirty(&self) {
        self.buffer.lock().state.dirty = true;
    }

    /// 两个句柄是否指向同一个缓冲区
    pub fn same_buffer(&self, other: &BufferHandle) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buffer = self.buffer.lock();
        f.debug_struct("BufferHandle")
            .field("block_id", &self.block_id)
            .field("state", &buffer.state)
            .field("refs", &buffer.refs)
            .finish()
    }
}

/// 缓冲池运行统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BioStats {
    /// acquire 时池中已有该块
    pub acquire_hits: u64,
    /// acquire 时新建了缓冲区
    pub acquire_misses: u64,
    /// read_buf 直接由内存中的有效内容满足
    pub read_hits: u64,
    pub device_reads: u64,
    pub device_writes: u64,
    pub evictions: u64,
}

/// 块号 -> 缓冲区 的唯一映射.
///
/// 单线程使用; 如果将来需要并行检查, 应在这一层加锁或按块号区间分片.
pub struct BufferPool {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    /// 驻留缓冲区数量上限, 0 表示不限
    capacity: usize,
    read_only: bool,
    buffers: HashMap<u64, Arc<Mutex<Buffer>>>,
    /// 引用计数为 0 的缓冲区, 队头是最久未使用的
    idle: VecDeque<u64>,
    /// 只读会话里脏缓冲区无法淘汰, 只警告一次
    pinned_warned: bool,
    stats: BioStats,
}

impl BufferPool {
    pub fn new(device: Arc<dyn BlockDevice>, config: &BioConfig) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            block_size,
            capacity: config.cache_capacity,
            read_only: config.read_only,
            buffers: HashMap::new(),
            idle: VecDeque::new(),
            pinned_warned: false,
            stats: BioStats::default(),
        }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// 当前驻留的缓冲区数量 (包括空闲的)
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, block_id: u64) -> bool {
        self.buffers.contains_key(&block_id)
    }

    /// 块的当前引用计数, 不在池中时为 0
    pub fn refs(&self, block_id: u64) -> usize {
        self.buffers
            .get(&block_id)
            .map_or(0, |buffer| buffer.lock().refs)
    }

    pub fn stats(&self) -> BioStats {
        self.stats
    }

    pub(crate) fn record_read_hit(&mut self) {
        self.stats.read_hits += 1;
    }

    /// 获取块 block_id 的句柄.
    ///
    /// 如果池中已有该块的缓冲区, 增加引用计数并返回指向它的句柄;
    /// 否则新建一个 invalid 的缓冲区, 引用计数为 1. 只会因内存不足而失败.
    pub fn acquire(&mut self, block_id: u64) -> Result<BufferHandle> {
        if let Some(buffer) = self.buffers.get(&block_id).cloned() {
            let refs = {
                let mut inner = buffer.lock();
                inner.refs += 1;
                inner.state.in_use = true;
                inner.refs
            };
            if refs == 1 {
                self.idle.retain(|&id| id != block_id);
            }
            self.stats.acquire_hits += 1;
            trace!("block {}: acquire hit, refs={}", block_id, refs);
            return Ok(BufferHandle { block_id, buffer });
        }

        self.make_room();
        let mut inner = Buffer::new(block_id, self.block_size)?;
        inner.refs = 1;
        inner.state.in_use = true;
        let buffer = Arc::new(Mutex::new(inner));
        self.buffers.insert(block_id, Arc::clone(&buffer));
        self.stats.acquire_misses += 1;
        trace!("block {}: acquire miss, new buffer", block_id);
        Ok(BufferHandle { block_id, buffer })
    }

    /// 消耗一个句柄, 返回释放后缓冲区的状态.
    ///
    /// 句柄不属于本池 (例如已被强制释放) 时返回 [`Error::DoubleRelease`].
    pub fn release(&mut self, handle: BufferHandle) -> Result<BufferState> {
        let owned = self
            .buffers
            .get(&handle.block_id)
            .map_or(false, |buffer| Arc::ptr_eq(buffer, &handle.buffer));
        if !owned {
            error!("block {}: release of a stale handle", handle.block_id);
            return Err(Error::DoubleRelease {
                block: handle.block_id,
            });
        }
        self.release_block(handle.block_id)
    }

    /// 按块号减少一次引用计数. 计数已经为 0 或块不在池中时返回 [`Error::DoubleRelease`],
    /// 计数本身保持不变.
    pub fn release_block(&mut self, block_id: u64) -> Result<BufferState> {
        let buffer = self
            .buffers
            .get(&block_id)
            .ok_or(Error::DoubleRelease { block: block_id })?;
        let state = {
            let mut inner = buffer.lock();
            if inner.refs == 0 {
                error!("block {}: released more times than acquired", block_id);
                return Err(Error::DoubleRelease { block: block_id });
            }
            inner.refs -= 1;
            if inner.refs == 0 {
                inner.state.in_use = false;
            }
            inner.state
        };
        if !state.in_use {
            self.idle.push_back(block_id);
        }
        trace!("block {}: released, in_use={}", block_id, state.in_use);
        Ok(state)
    }

    /// 丢弃一个块的缓存内容 (设备上的内容已被外部修改时使用).
    ///
    /// 仍有句柄时返回 [`Error::BufferBusy`]; 缓冲区为脏时返回 [`Error::BufferDirty`],
    /// 未写回的修改必须先写回或显式 discard.
    pub fn invalidate(&mut self, block_id: u64) -> Result<()> {
        let Some(buffer) = self.buffers.get(&block_id) else {
            return Ok(());
        };
        {
            let inner = buffer.lock();
            if inner.refs > 0 {
                return Err(Error::BufferBusy {
                    block: block_id,
                    refs: inner.refs,
                });
            }
            if inner.state.dirty {
                return Err(Error::BufferDirty {
                    block: block_id,
                    op: Op::Invalidate,
                });
            }
        }
        self.buffers.remove(&block_id);
        self.idle.retain(|&id| id != block_id);
        debug!("block {}: invalidated", block_id);
        Ok(())
    }

    /// 从设备读入句柄对应的块. 成功则标记 valid, 失败则标记 invalid 并返回错误.
    pub fn fill(&mut self, handle: &BufferHandle) -> Result<()> {
        let block_id = handle.block_id;
        let mut inner = handle.buffer.lock();
        self.stats.device_reads += 1;
        match self.device.read_block(block_id, &mut inner.data) {
            Ok(()) => {
                inner.state.valid = true;
                debug!("block {}: read from device", block_id);
                Ok(())
            }
            Err(e) => {
                inner.state.valid = false;
                warn!("block {}: device read failed: {}", block_id, e);
                Err(Error::io(block_id, Op::Read, e))
            }
        }
    }

    /// 将句柄对应的脏缓冲区写回设备, 干净的缓冲区什么也不做
    pub fn flush(&mut self, handle: &BufferHandle, wait: bool) -> Result<()> {
        let buffer = Arc::clone(&handle.buffer);
        self.write_back(handle.block_id, &buffer, wait)
    }

    /// 清除 dirty, 内容不再与设备一致, 标记 invalid
    pub fn discard(&mut self, handle: &BufferHandle) {
        let mut inner = handle.buffer.lock();
        inner.state.dirty = false;
        inner.state.valid = false;
    }

    /// 写回一个缓冲区: 成功后清除 dirty 并标记 valid; 失败时保持 dirty
    fn write_back(&mut self, block_id: u64, buffer: &Mutex<Buffer>, wait: bool) -> Result<()> {
        let mut inner = buffer.lock();
        if !inner.state.dirty {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::ReadOnly { block: block_id });
        }
        self.stats.device_writes += 1;
        self.device
            .write_block(block_id, &inner.data, wait)
            .map_err(|e| Error::io(block_id, Op::Write, e))?;
        inner.state.dirty = false;
        inner.state.valid = true;
        debug!("block {}: written back, wait={}", block_id, wait);
        Ok(())
    }

    /// 驻留数量达到上限时, 按 LRU 淘汰空闲缓冲区, 为新缓冲区腾出位置.
    ///
    /// 只读会话中的脏缓冲区不尝试写回, 写回失败的缓冲区也保留在池中,
    /// 二者都按原来的顺序放回空闲队列头部; 所有缓冲区都在使用时允许超出上限.
    fn make_room(&mut self) {
        if self.capacity == 0 {
            return;
        }
        let mut kept = Vec::new();
        while self.buffers.len() >= self.capacity {
            let Some(victim) = self.idle.pop_front() else {
                break;
            };
            let Some(buffer) = self.buffers.get(&victim).cloned() else {
                continue;
            };
            if self.read_only && buffer.lock().state.dirty {
                if !self.pinned_warned {
                    warn!(
                        "block {}: read-only session, dirty buffers stay resident",
                        victim
                    );
                    self.pinned_warned = true;
                }
                kept.push(victim);
                continue;
            }
            match self.write_back(victim, &buffer, false) {
                Ok(()) => {
                    self.buffers.remove(&victim);
                    self.stats.evictions += 1;
                    trace!("block {}: evicted", victim);
                }
                Err(e) => {
                    error!("block {}: kept in cache, write-back failed: {}", victim, e);
                    kept.push(victim);
                }
            }
        }
        if self.buffers.len() >= self.capacity {
            debug!(
                "buffer pool over capacity: {} resident, limit {}",
                self.buffers.len(),
                self.capacity
            );
        }
        for victim in kept.into_iter().rev() {
            self.idle.push_front(victim);
        }
    }

    /// 按块号顺序写回所有未被引用的脏缓冲区, 然后刷新设备.
    ///
    /// 仍有句柄的缓冲区可能正被修改到一半, 跳过不写.
    /// 某个块写回失败不会中断其余块的写回, 返回遇到的第一个错误.
    pub fn sync_all(&mut self, wait: bool) -> Result<()> {
        let mut dirty: Vec<(u64, Arc<Mutex<Buffer>>)> = Vec::new();
        for (&id, buffer) in self.buffers.iter() {
            let inner = buffer.lock();
            if !inner.state.dirty {
                continue;
            }
            if inner.refs > 0 {
                debug!("block {}: sync skipped, {} handle(s) held", id, inner.refs);
                continue;
            }
            dirty.push((id, Arc::clone(buffer)));
        }
        dirty.sort_unstable_by_key(|(id, _)| *id);

        let mut first_err = None;
        for (block_id, buffer) in dirty {
            if let Err(e) = self.write_back(block_id, &buffer, wait) {
                error!("block {}: sync failed: {}", block_id, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        if !self.read_only {
            self.device.flush().map_err(Error::Flush)?;
        }
        Ok(())
    }

    /// 会话结束时调用: 把所有未释放的引用清零, 返回被强制释放的 (块号, 引用数)
    pub(crate) fn force_release(&mut self) -> Vec<(u64, usize)> {
        let mut released = Vec::new();
        for (&block_id, buffer) in self.buffers.iter() {
            let mut inner = buffer.lock();
            if inner.refs > 0 {
                released.push((block_id, inner.refs));
                inner.refs = 0;
                inner.state.in_use = false;
            }
        }
        released.sort_unstable();
        self.idle.extend(released.iter().map(|(id, _)| *id));
        released
    }

    /// 清除所有缓冲区的 dirty 标记并返回这些块号, 只读会话结束时使用
    pub(crate) fn discard_all_dirty(&mut self) -> Vec<u64> {
        let mut discarded = Vec::new();
        for (&block_id, buffer) in self.buffers.iter() {
            let mut inner = buffer.lock();
            if inner.state.dirty {
                inner.state.dirty = false;
                inner.state.valid = false;
                discarded.push(block_id);
            }
        }
        discarded.sort_unstable();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn pool_with(blocks: u64, capacity: usize) -> (Arc<MemDevice>, BufferPool) {
        let device = Arc::new(MemDevice::new(512, blocks));
        let config = BioConfig {
            cache_capacity: capacity,
            ..BioConfig::default()
        };
        let pool = BufferPool::new(device.clone(), &config);
        (device, pool)
    }

    #[test]
    fn acquire_same_block_shares_buffer() {
        let (_, mut pool) = pool_with(16, 0);
        let a = pool.acquire(3).unwrap();
        let b = pool.acquire(3).unwrap();
        let c = pool.acquire(4).unwrap();
        assert!(a.same_buffer(&b));
        assert!(!a.same_buffer(&c));
        assert_eq!(pool.refs(3), 2);
        assert_eq!(pool.len(), 2);
        assert!(a.state().in_use);
        assert!(!a.is_valid());

        a.modify(|data| data[0] = 9);
        assert_eq!(b.read(|data| data[0]), 9);
    }

    #[test]
    fn release_balances_acquire() {
        let (_, mut pool) = pool_with(16, 0);
        let a = pool.acquire(5).unwrap();
        let b = pool.acquire(5).unwrap();
        assert!(pool.release(a).unwrap().in_use);
        assert!(!pool.release(b).unwrap().in_use);
        assert_eq!(pool.refs(5), 0);
        // 引用计数归零后仍留在池中
        assert!(pool.contains(5));

        match pool.release_block(5) {
            Err(Error::DoubleRelease { block }) => assert_eq!(block, 5),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.refs(5), 0);
        assert!(matches!(
            pool.release_block(99),
            Err(Error::DoubleRelease { block: 99 })
        ));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let (_, mut pool) = pool_with(16, 0);
        let a = pool.acquire(1).unwrap();
        pool.force_release();
        pool.invalidate(1).unwrap();
        let _b = pool.acquire(1).unwrap();
        assert!(matches!(
            pool.release(a),
            Err(Error::DoubleRelease { block: 1 })
        ));
        assert_eq!(pool.refs(1), 1);
    }

    #[test]
    fn invalidate_requires_idle_clean_buffer() {
        let (_, mut pool) = pool_with(16, 0);
        let h = pool.acquire(2).unwrap();
        assert!(matches!(
            pool.invalidate(2),
            Err(Error::BufferBusy { block: 2, refs: 1 })
        ));
        h.mark_dirty();
        pool.release(h).unwrap();
        assert!(matches!(
            pool.invalidate(2),
            Err(Error::BufferDirty {
                block: 2,
                op: Op::Invalidate
            })
        ));
        let h = pool.acquire(2).unwrap();
        pool.flush(&h, true).unwrap();
        pool.release(h).unwrap();
        pool.invalidate(2).unwrap();
        assert!(!pool.contains(2));
        // 不在池中的块
        pool.invalidate(7).unwrap();
    }

    #[test]
    fn lru_evicts_least_recently_released() {
        let (_, mut pool) = pool_with(16, 3);
        for id in [0, 1, 2] {
            let h = pool.acquire(id).unwrap();
            pool.release(h).unwrap();
        }
        // 重新访问 0, 使 1 成为最久未使用的
        let h = pool.acquire(0).unwrap();
        pool.release(h).unwrap();

        let h = pool.acquire(3).unwrap();
        assert!(!pool.contains(1));
        assert!(pool.contains(0));
        assert!(pool.contains(2));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stats().evictions, 1);
        pool.release(h).unwrap();
    }

    #[test]
    fn eviction_writes_back_dirty_buffer() {
        let (device, mut pool) = pool_with(16, 1);
        let h = pool.acquire(4).unwrap();
        h.modify(|data| data.fill(0x5a));
        pool.release(h).unwrap();

        let other = pool.acquire(5).unwrap();
        assert!(!pool.contains(4));
        assert_eq!(device.writes(), 1);
        assert!(device.block(4).iter().all(|&b| b == 0x5a));
        pool.release(other).unwrap();
    }

    #[test]
    fn busy_buffers_are_never_evicted() {
        let (_, mut pool) = pool_with(16, 2);
        let a = pool.acquire(0).unwrap();
        let b = pool.acquire(1).unwrap();
        let c = pool.acquire(2).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stats().evictions, 0);
        for h in [a, b, c] {
            pool.release(h).unwrap();
        }
    }

    #[test]
    fn read_only_pool_keeps_dirty_buffer_resident() {
        let device = Arc::new(MemDevice::new(512, 8));
        let config = BioConfig {
            cache_capacity: 1,
            read_only: true,
            ..BioConfig::default()
        };
        let mut pool = BufferPool::new(device.clone(), &config);
        let h = pool.acquire(0).unwrap();
        h.mark_dirty();
        pool.release(h).unwrap();

        let other = pool.acquire(1).unwrap();
        assert!(pool.contains(0));
        assert_eq!(device.writes(), 0);
        pool.release(other).unwrap();
        assert_eq!(pool.discard_all_dirty(), vec![0]);
    }

    #[test]
    fn read_only_pool_skips_dirty_buffers_without_reordering() {
        let device = Arc::new(MemDevice::new(512, 16));
        let config = BioConfig {
            cache_capacity: 3,
            read_only: true,
            ..BioConfig::default()
        };
        let mut pool = BufferPool::new(device.clone(), &config);
        for id in [0, 1] {
            let h = pool.acquire(id).unwrap();
            h.mark_dirty();
            pool.release(h).unwrap();
        }
        let clean = pool.acquire(2).unwrap();
        pool.release(clean).unwrap();
        assert_eq!(pool.idle, [0, 1, 2]);

        // 每次未命中都跳过两个脏缓冲区, 淘汰其后最久未用的干净缓冲区
        for id in 3..8 {
            let h = pool.acquire(id).unwrap();
            pool.release(h).unwrap();
            assert_eq!(pool.idle, [0, 1, id]);
            assert_eq!(pool.len(), 3);
        }
        assert_eq!(device.writes(), 0);
        assert_eq!(pool.stats().evictions, 5);
        assert!(pool.pinned_warned);
    }

    #[test]
    fn failed_write_back_keeps_lru_position() {
        let (device, mut pool) = pool_with(4, 2);
        // 块 9 超出设备范围, 写回必然失败
        for id in [9, 1] {
            let h = pool.acquire(id).unwrap();
            h.mark_dirty();
            pool.release(h).unwrap();
        }
        assert_eq!(pool.idle, [9, 1]);

        let h = pool.acquire(2).unwrap();
        assert!(pool.contains(9));
        assert!(!pool.contains(1));
        assert_eq!(device.writes(), 1);
        pool.release(h).unwrap();
        assert_eq!(pool.idle, [9, 2]);
    }
}
