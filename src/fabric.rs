//! In-process communication fabric
//!
//! Every rank is a thread; collectives rendezvous on a shared slot table and
//! point-to-point messages go through a tagged mailbox. Sums are accumulated
//! in rank order on every rank, so all ranks observe bit-identical results.

use crate::comm::{Communicator, GridId, GridLayout};
use crate::error::KfacError;
use crate::KfacResult;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::time::Duration;

/// How long a receive waits before reporting a stalled peer
const RECV_TIMEOUT: Duration = Duration::from_secs(120);

fn poisoned<T>(_: T) -> KfacError {
    KfacError::Communication("fabric lock poisoned by a failed rank".to_string())
}

/// Rendezvous state shared by one trainer group
#[derive(Debug)]
struct Group {
    size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Vec<f64>>>,
}

impl Group {
    fn new(size: usize) -> Self {
        Self {
            size,
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![Vec::new(); size]),
        }
    }
}

type MessageKey = (usize, usize, usize);

/// Tagged point-to-point queues keyed by (source, destination, tag)
#[derive(Debug, Default)]
struct Mailbox {
    queues: Mutex<HashMap<MessageKey, VecDeque<Vec<f64>>>>,
    arrived: Condvar,
}

/// Factory for connected in-process communicators
pub struct LocalFabric;

impl LocalFabric {
    /// One trainer group of `size` ranks
    pub fn single(size: usize) -> Vec<LocalCommunicator> {
        let group = Arc::new(Group::new(size));
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                combined_rank: rank,
                grid: None,
                layout: None,
                group: group.clone(),
                mailbox: mailbox.clone(),
            })
            .collect()
    }

    /// Primary grid on combined ranks `0..primary`, secondary grid after it
    pub fn dual(primary: usize, secondary: usize) -> Vec<LocalCommunicator> {
        let layout = GridLayout::contiguous(primary, secondary);
        let primary_group = Arc::new(Group::new(primary));
        let secondary_group = Arc::new(Group::new(secondary));
        let mailbox = Arc::new(Mailbox::default());

        let primary_ranks = (0..primary).map(|rank| LocalCommunicator {
            rank,
            combined_rank: layout.primary[rank],
            grid: Some(GridId::Primary),
            layout: Some(layout.clone()),
            group: primary_group.clone(),
            mailbox: mailbox.clone(),
        });
        let secondary_ranks = (0..secondary).map(|rank| LocalCommunicator {
            rank,
            combined_rank: layout.secondary[rank],
            grid: Some(GridId::Secondary),
            layout: Some(layout.clone()),
            group: secondary_group.clone(),
            mailbox: mailbox.clone(),
        });
        primary_ranks.chain(secondary_ranks).collect()
    }

    /// Run `f` once per communicator on its own thread, results in input order
    pub fn run<T, F>(comms: Vec<LocalCommunicator>, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalCommunicator) -> T + Sync,
    {
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

/// One rank's endpoint on a [`LocalFabric`]
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    rank: usize,
    combined_rank: usize,
    grid: Option<GridId>,
    layout: Option<GridLayout>,
    group: Arc<Group>,
    mailbox: Arc<Mailbox>,
}

impl LocalCommunicator {
    /// Deposit a contribution and collect everybody's, in rank order
    fn exchange(&self, contribution: Vec<f64>) -> KfacResult<Vec<Vec<f64>>> {
        {
            let mut slots = self.group.slots.lock().map_err(poisoned)?;
            slots[self.rank] = contribution;
        }
        self.group.barrier.wait();
        let all = self.group.slots.lock().map_err(poisoned)?.clone();
        self.group.barrier.wait();
        Ok(all)
    }

    fn sum_all(&self, all: &[Vec<f64>], len: usize) -> KfacResult<Vec<f64>> {
        let mut acc = vec![0.0; len];
        for contribution in all {
            if contribution.len() != len {
                return Err(KfacError::Communication(format!(
                    "collective size mismatch: expected {}, got {}",
                    len,
                    contribution.len()
                )));
            }
            for (a, v) in acc.iter_mut().zip(contribution) {
                *a += v;
            }
        }
        Ok(acc)
    }

    fn check_counts(&self, counts: &[usize]) -> KfacResult<()> {
        if counts.len() != self.group.size {
            return Err(KfacError::DimensionMismatch {
                expected: self.group.size,
                got: counts.len(),
            });
        }
        Ok(())
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn grid(&self) -> Option<GridId> {
        self.grid
    }

    fn grid_layout(&self) -> Option<&GridLayout> {
        self.layout.as_ref()
    }

    fn combined_rank(&self) -> usize {
        self.combined_rank
    }

    fn allreduce_sum(&self, buf: &mut [f64]) -> KfacResult<()> {
        let all = self.exchange(buf.to_vec())?;
        let sum = self.sum_all(&all, buf.len())?;
        buf.copy_from_slice(&sum);
        Ok(())
    }

    fn reduce_scatter_sum(&self, send: &[f64], counts: &[usize]) -> KfacResult<Vec<f64>> {
        self.check_counts(counts)?;
        let total: usize = counts.iter().sum();
        if total != send.len() {
            return Err(KfacError::DimensionMismatch {
                expected: total,
                got: send.len(),
            });
        }
        let all = self.exchange(send.to_vec())?;
        let sum = self.sum_all(&all, send.len())?;
        let offset: usize = counts[..self.rank].iter().sum();
        Ok(sum[offset..offset + counts[self.rank]].to_vec())
    }

    fn allgather_v(&self, local: &[f64], counts: &[usize]) -> KfacResult<Vec<f64>> {
        self.check_counts(counts)?;
        if local.len() != counts[self.rank] {
            return Err(KfacError::DimensionMismatch {
                expected: counts[self.rank],
                got: local.len(),
            });
        }
        let all = self.exchange(local.to_vec())?;
        let mut gathered = Vec::with_capacity(counts.iter().sum());
        for (rank, contribution) in all.iter().enumerate() {
            if contribution.len() != counts[rank] {
                return Err(KfacError::Communication(format!(
                    "allgather: rank {} sent {} values, expected {}",
                    rank,
                    contribution.len(),
                    counts[rank]
                )));
            }
            gathered.extend_from_slice(contribution);
        }
        Ok(gathered)
    }

    fn reduce_sum(&self, buf: &mut [f64], root: usize) -> KfacResult<()> {
        let all = self.exchange(buf.to_vec())?;
        if self.rank == root {
            let sum = self.sum_all(&all, buf.len())?;
            buf.copy_from_slice(&sum);
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [f64], root: usize) -> KfacResult<()> {
        let contribution = if self.rank == root { buf.to_vec() } else { Vec::new() };
        let all = self.exchange(contribution)?;
        let source = all.get(root).ok_or_else(|| {
            KfacError::Communication(format!("broadcast root {} outside group", root))
        })?;
        if source.len() != buf.len() {
            return Err(KfacError::DimensionMismatch {
                expected: buf.len(),
                got: source.len(),
            });
        }
        buf.copy_from_slice(source);
        Ok(())
    }

    fn barrier(&self) -> KfacResult<()> {
        self.group.barrier.wait();
        Ok(())
    }

    fn send(&self, buf: &[f64], dest: usize, tag: usize) -> KfacResult<()> {
        let mut queues = self.mailbox.queues.lock().map_err(poisoned)?;
        queues
            .entry((self.combined_rank, dest, tag))
            .or_default()
            .push_back(buf.to_vec());
        self.mailbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, buf: &mut [f64], source: usize, tag: usize) -> KfacResult<()> {
        let key = (source, self.combined_rank, tag);
        let mut queues = self.mailbox.queues.lock().map_err(poisoned)?;
        loop {
            if let Some(message) = queues.get_mut(&key).and_then(|q| q.pop_front()) {
                if message.len() != buf.len() {
                    return Err(KfacError::DimensionMismatch {
                        expected: buf.len(),
                        got: message.len(),
                    });
                }
                buf.copy_from_slice(&message);
                return Ok(());
            }
            let (guard, timeout) = self
                .mailbox
                .arrived
                .wait_timeout(queues, RECV_TIMEOUT)
                .map_err(poisoned)?;
            queues = guard;
            if timeout.timed_out() {
                return Err(KfacError::Communication(format!(
                    "rank {} timed out waiting for rank {} (tag {})",
                    self.combined_rank, source, tag
                )));
            }
        }
    }
}
