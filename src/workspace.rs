//! Process-local scratch buffers keyed by name
//!
//! Exchange buffers are reused across steps: a lookup returns the existing
//! buffer resized in place, or allocates one on first use. Buffers are leased
//! out by value and handed back with [`Workspace::release`], so two scratch
//! buffers can be held at the same time without aliasing.

use std::collections::HashMap;
use std::fmt::Debug;

/// Synchronization point for outstanding device work
///
/// Called before a buffer written by device kernels is handed to the network
/// and before a workspace buffer is resized.
pub trait DeviceSync: Debug + Send + Sync {
    fn synchronize(&self);
}

/// Host memory: every operation has already completed when it returns
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSync;

impl DeviceSync for HostSync {
    fn synchronize(&self) {}
}

/// Rectangular column-major scratch buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceBuffer {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl WorkspaceBuffer {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        self.cols = cols;
        self.data.resize(rows * cols, 0.0);
    }
}

/// Named scratch buffers owned by one K-FAC instance
#[derive(Debug)]
pub struct Workspace {
    entries: HashMap<String, WorkspaceBuffer>,
    device: Box<dyn DeviceSync>,
    rank: usize,
    allocations: usize,
    resizes: usize,
}

impl Workspace {
    pub fn new(rank: usize) -> Self {
        Self::with_device(rank, Box::new(HostSync))
    }

    pub fn with_device(rank: usize, device: Box<dyn DeviceSync>) -> Self {
        Self {
            entries: HashMap::new(),
            device,
            rank,
            allocations: 0,
            resizes: 0,
        }
    }

    /// Lease the buffer stored under `key`, shaped `rows x cols`
    ///
    /// A missing key allocates a zeroed buffer. An existing buffer of a
    /// different shape is resized in place after outstanding device work has
    /// been synchronized; its contents are not cleared.
    pub fn acquire(&mut self, key: &str, rows: usize, cols: usize) -> WorkspaceBuffer {
        match self.entries.remove(key) {
            Some(mut buffer) => {
                if buffer.rows != rows || buffer.cols != cols {
                    self.device.synchronize();
                    buffer.resize(rows, cols);
                    self.resizes += 1;
                }
                buffer
            }
            None => {
                log::debug!(
                    "K-FAC workspace allocation (rank={}): {} ({}x{})",
                    self.rank,
                    key,
                    rows,
                    cols
                );
                self.allocations += 1;
                WorkspaceBuffer::new(rows, cols)
            }
        }
    }

    /// Hand a leased buffer back for reuse in later steps
    pub fn release(&mut self, key: &str, buffer: WorkspaceBuffer) {
        self.entries.insert(key.to_string(), buffer);
    }

    /// Synchronize the device before buffers leave the process
    pub fn synchronize(&self) {
        self.device.synchronize();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of first-time allocations
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Number of in-place reshapes
    pub fn resizes(&self) -> usize {
        self.resizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct CountingSync(Arc<AtomicUsize>);

    impl DeviceSync for CountingSync {
        fn synchronize(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_allocate_then_reuse() {
        let mut ws = Workspace::new(0);
        let mut buf = ws.acquire("send", 4, 1);
        assert_eq!(buf.len(), 4);
        buf.as_mut_slice()[2] = 7.0;
        ws.release("send", buf);

        let buf = ws.acquire("send", 4, 1);
        assert_eq!(buf.as_slice()[2], 7.0);
        assert_eq!(ws.allocations(), 1);
        assert_eq!(ws.resizes(), 0);
        ws.release("send", buf);
        assert!(ws.contains("send"));
    }

    #[test]
    fn test_resize_synchronizes_first() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut ws = Workspace::with_device(1, Box::new(CountingSync(counter.clone())));

        let buf = ws.acquire("recv", 2, 3);
        assert_eq!((buf.rows(), buf.cols()), (2, 3));
        ws.release("recv", buf);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let buf = ws.acquire("recv", 10, 1);
        assert_eq!(buf.len(), 10);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(ws.resizes(), 1);
        ws.release("recv", buf);

        let buf = ws.acquire("recv", 0, 1);
        assert!(buf.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_independent_keys() {
        let mut ws = Workspace::new(0);
        let a = ws.acquire("a", 3, 1);
        let b = ws.acquire("b", 5, 1);
        assert_eq!(a.len() + b.len(), 8);
        assert_eq!(ws.allocations(), 2);
    }
}
