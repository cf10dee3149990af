// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock collaborators for unit-testing the mailbox function.

use crate::capabilities::EpcCapabilities;
use crate::capabilities::NUM_BARS;
use crate::lifecycle::FunctionHeader;
use crate::platform::EndpointController;
use crate::platform::RegisterIo;
use crate::platform::ScheduledWork;
use crate::platform::WorkerPool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// A register access observed by [`TestRegisters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegOp {
    /// 32-bit read at the byte offset.
    Read(usize),
    /// 32-bit write of the value at the byte offset.
    Write(usize, u32),
}

/// Atomic-backed BAR memory that records every [`RegisterIo`] access in
/// order, so tests can assert on access sequencing as well as contents.
pub struct TestRegisters {
    words: Vec<AtomicU32>,
    ops: Mutex<Vec<RegOp>>,
}

impl TestRegisters {
    /// Creates zeroed backing of `len` bytes.
    pub fn new(len: u64) -> Self {
        Self {
            words: (0..len.div_ceil(4)).map(|_| AtomicU32::new(0)).collect(),
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Drains the recorded access log.
    pub fn take_ops(&self) -> Vec<RegOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Reads the backing directly, the way the remote host would: without
    /// recording an access.
    pub fn peek(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::SeqCst)
    }

    /// Writes the backing directly, the way the remote host would: without
    /// recording an access.
    pub fn poke(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::SeqCst)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        &self.words[offset / 4]
    }
}

impl RegisterIo for TestRegisters {
    fn read_u32(&self, offset: usize) -> u32 {
        self.ops.lock().push(RegOp::Read(offset));
        self.peek(offset)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.ops.lock().push(RegOp::Write(offset, value));
        self.poke(offset, value)
    }
}

/// A scriptable endpoint controller.
///
/// Cloning yields another handle to the same controller state, so a test
/// can keep one clone for inspection while the function under test owns
/// the other.
#[derive(Clone)]
pub struct TestController {
    inner: Arc<Mutex<TestControllerInner>>,
}

struct TestControllerInner {
    caps: Option<EpcCapabilities>,
    bars: [Option<Arc<TestRegisters>>; NUM_BARS],
    configured: [bool; NUM_BARS],
    fail_alloc: [bool; NUM_BARS],
    fail_set: [bool; NUM_BARS],
    fail_header: bool,
    released: [u32; NUM_BARS],
    header: Option<FunctionHeader>,
    notifications_requested: bool,
}

impl TestController {
    /// A controller advertising `caps`.
    pub fn new(caps: EpcCapabilities) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestControllerInner {
                caps: Some(caps),
                bars: std::array::from_fn(|_| None),
                configured: [false; NUM_BARS],
                fail_alloc: [false; NUM_BARS],
                fail_set: [false; NUM_BARS],
                fail_header: false,
                released: [0; NUM_BARS],
                header: None,
                notifications_requested: false,
            })),
        }
    }

    /// A controller that cannot describe its capabilities.
    pub fn unsupported() -> Self {
        let controller = Self::new(EpcCapabilities::default());
        controller.inner.lock().caps = None;
        controller
    }

    /// Rigs allocation of `bar` to fail.
    pub fn fail_alloc(&self, bar: usize) {
        self.inner.lock().fail_alloc[bar] = true;
    }

    /// Rigs configuration of `bar` to fail.
    pub fn fail_set(&self, bar: usize) {
        self.inner.lock().fail_set[bar] = true;
    }

    /// Rigs the header write to fail.
    pub fn fail_header(&self) {
        self.inner.lock().fail_header = true;
    }

    /// Backing registers of `bar`, if currently allocated.
    pub fn bar_regs(&self, bar: usize) -> Option<Arc<TestRegisters>> {
        self.inner.lock().bars[bar].clone()
    }

    /// Whether `bar` is currently committed to the link.
    pub fn is_configured(&self, bar: usize) -> bool {
        self.inner.lock().configured[bar]
    }

    /// Number of BARs currently holding an allocation.
    pub fn allocated_count(&self) -> usize {
        self.inner.lock().bars.iter().filter(|b| b.is_some()).count()
    }

    /// How many times `release_bar` ran for `bar`.
    pub fn release_count(&self, bar: usize) -> u32 {
        self.inner.lock().released[bar]
    }

    /// The header written by the function, if any.
    pub fn header(&self) -> Option<FunctionHeader> {
        self.inner.lock().header.clone()
    }

    /// Whether the function asked for event delivery.
    pub fn notifications_requested(&self) -> bool {
        self.inner.lock().notifications_requested
    }
}

impl EndpointController for TestController {
    type Registers = TestRegisters;

    fn capabilities(&self) -> Option<EpcCapabilities> {
        self.inner.lock().caps.clone()
    }

    fn alloc_bar(
        &mut self,
        bar: usize,
        len: u64,
        _align: u64,
    ) -> anyhow::Result<Arc<TestRegisters>> {
        let mut inner = self.inner.lock();
        if inner.fail_alloc[bar] {
            anyhow::bail!("allocation rigged to fail for BAR {bar}");
        }
        let regs = Arc::new(TestRegisters::new(len));
        inner.bars[bar] = Some(regs.clone());
        Ok(regs)
    }

    fn set_bar(&mut self, bar: usize) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_set[bar] {
            anyhow::bail!("configuration rigged to fail for BAR {bar}");
        }
        if inner.bars[bar].is_none() {
            anyhow::bail!("BAR {bar} is not allocated");
        }
        inner.configured[bar] = true;
        Ok(())
    }

    fn release_bar(&mut self, bar: usize) {
        let mut inner = self.inner.lock();
        inner.released[bar] += 1;
        inner.configured[bar] = false;
        inner.bars[bar] = None;
    }

    fn write_header(&mut self, header: &FunctionHeader) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_header {
            anyhow::bail!("header write rigged to fail");
        }
        inner.header = Some(header.clone());
        Ok(())
    }

    fn request_notifications(&mut self) {
        self.inner.lock().notifications_requested = true;
    }
}

/// A worker pool pumped manually by the test.
#[derive(Clone)]
pub struct TestWorkerPool {
    inner: Arc<Mutex<TestPoolInner>>,
}

struct TestPoolInner {
    next_id: u64,
    queue: VecDeque<PoolEntry>,
    cancelled: Vec<u64>,
}

struct PoolEntry {
    id: u64,
    delay: Duration,
    work: Box<dyn FnOnce() + Send>,
}

impl TestWorkerPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestPoolInner {
                next_id: 0,
                queue: VecDeque::new(),
                cancelled: Vec::new(),
            })),
        }
    }

    /// Number of pending, non-cancelled units of work.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .queue
            .iter()
            .filter(|entry| !inner.cancelled.contains(&entry.id))
            .count()
    }

    /// Delay of the next pending unit of work.
    pub fn next_delay(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .queue
            .iter()
            .find(|entry| !inner.cancelled.contains(&entry.id))
            .map(|entry| entry.delay)
    }

    /// Runs the next pending unit of work. Returns whether one ran.
    pub fn run_next(&self) -> bool {
        let work = {
            let mut inner = self.inner.lock();
            loop {
                match inner.queue.pop_front() {
                    Some(entry) if inner.cancelled.contains(&entry.id) => continue,
                    Some(entry) => break Some(entry.work),
                    None => break None,
                }
            }
        };
        match work {
            Some(work) => {
                work();
                true
            }
            None => false,
        }
    }

    /// Runs pending work until the queue drains or `limit` units have run.
    /// Returns how many ran.
    pub fn run_until_idle(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit && self.run_next() {
            ran += 1;
        }
        ran
    }
}

impl Default for TestWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool for TestWorkerPool {
    fn schedule(&self, delay: Duration, work: Box<dyn FnOnce() + Send>) -> Box<dyn ScheduledWork> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.queue.push_back(PoolEntry { id, delay, work });
        Box::new(TestScheduledWork {
            id,
            pool: self.inner.clone(),
        })
    }
}

struct TestScheduledWork {
    id: u64,
    pool: Arc<Mutex<TestPoolInner>>,
}

impl ScheduledWork for TestScheduledWork {
    fn cancel(&mut self) {
        self.pool.lock().cancelled.push(self.id);
    }
}
