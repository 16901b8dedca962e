// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use typed_builder::TypedBuilder;

use crate::chain::VersionChain;
use crate::logger::{debug, info, trace};
use crate::record::{VirtualKey, VirtualValue};

#[derive(Debug)]
enum PipelineCmd {
    /// A version changed state, look for work.
    Wake,
    Terminate,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct FlushConfig {
    /// Every version whose number is a multiple of this is flushed, the
    /// others are merged into the version after them.
    #[builder(default = 1)]
    flush_interval: u64,
    /// Unflushed versions tolerated before `copy()` starts slowing down.
    #[builder(default = 2)]
    preferred_flush_queue_size: usize,
    #[builder(default = Duration::from_millis(200))]
    flush_throttle_step: Duration,
    #[builder(default = Duration::from_secs(5))]
    max_flush_throttle: Duration,
}

impl FlushConfig {
    pub(crate) fn selects(&self, version: u64) -> bool {
        self.flush_interval <= 1 || version % self.flush_interval == 0
    }

    /// Delay imposed on `copy()` with `backlog` versions waiting for the
    /// pipeline. Grows with the square of the excess over the preferred size.
    pub(crate) fn throttle_delay(&self, backlog: usize) -> Option<Duration> {
        let excess = backlog.checked_sub(self.preferred_flush_queue_size)?;
        if excess == 0 {
            return None
        }
        let excess = u32::try_from(excess).unwrap_or(u32::MAX);
        Some(
            self.flush_throttle_step
                .saturating_mul(excess.saturating_mul(excess))
                .min(self.max_flush_throttle),
        )
    }
}

/// Snapshot of the pipeline's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushStatistics {
    pub flushes: u64,
    pub merges: u64,
    pub flushed_leaves: u64,
    pub last_flush_latency: Duration,
    /// Frozen versions not yet flushed or merged.
    pub backlog: usize,
}

#[derive(Default)]
pub(crate) struct FlushCounters {
    flushes: AtomicU64,
    merges: AtomicU64,
    flushed_leaves: AtomicU64,
    last_flush_micros: AtomicU64,
}

impl FlushCounters {
    pub fn record_flush(&self, leaves: usize, latency: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.flushed_leaves.fetch_add(leaves as u64, Ordering::Relaxed);
        self.last_flush_micros
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.merges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, backlog: usize) -> FlushStatistics {
        FlushStatistics {
            flushes: self.flushes.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            flushed_leaves: self.flushed_leaves.load(Ordering::Relaxed),
            last_flush_latency: Duration::from_micros(self.last_flush_micros.load(Ordering::Relaxed)),
            backlog,
        }
    }
}

/// Background worker hashing, flushing, merging and reclaiming the versions of
/// one lineage, oldest first.
pub(crate) struct FlushPipeline<K, V> {
    chain: Arc<VersionChain<K, V>>,
    inbound: mpsc::UnboundedReceiver<PipelineCmd>,
}

impl<K: VirtualKey, V: VirtualValue> FlushPipeline<K, V> {
    pub fn new(chain: Arc<VersionChain<K, V>>, inbound: PipelineInbound) -> Self {
        Self {
            chain,
            inbound: inbound.0,
        }
    }

    #[tokio::main(flavor = "current_thread")]
    pub async fn run(mut self) {
        info!("[{}] flush pipeline started", self.chain.label());
        loop {
            if let Err(e) = self.chain.advance() {
                self.chain.fail(&e);
                break
            }
            if self.chain.is_drained() {
                debug!("[{}] every version is gone", self.chain.label());
                break
            }
            match self.inbound.recv().await {
                Some(PipelineCmd::Wake) => {
                    trace!("[{}] woken up", self.chain.label());
                }
                Some(PipelineCmd::Terminate) | None => break,
            }
        }
        self.chain.finish();
        info!("[{}] flush pipeline stopped", self.chain.label());
    }
}

pub(crate) struct PipelineInbound(mpsc::UnboundedReceiver<PipelineCmd>);

pub(crate) fn channel() -> (PipelineRequester, PipelineInbound) {
    let (sender, inbound) = mpsc::unbounded_channel();
    (PipelineRequester { sender }, PipelineInbound(inbound))
}

#[derive(Clone)]
pub(crate) struct PipelineRequester {
    sender: mpsc::UnboundedSender<PipelineCmd>,
}

impl PipelineRequester {
    pub fn wake(&self) {
        // a stopped pipeline has nothing left to do
        self.sender.send(PipelineCmd::Wake).ok();
    }

    pub fn terminate(&self) {
        self.sender.send(PipelineCmd::Terminate).ok();
    }
}
