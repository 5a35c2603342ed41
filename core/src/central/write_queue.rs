//! Acknowledged-write queue and paced unacknowledged writes
//!
//! Keeps at most one acknowledged write in flight per peripheral and completes
//! writes in submission order. A task may be split into chunks; the chunks of
//! one task go out back to back, each waiting for its own confirmation.
//!
//! Unacknowledged writes have no confirmation to wait for. When an interval is
//! configured their chunks are spaced out by manager timers instead, so the
//! peripheral's receive buffer gets time to drain.

use super::pending::Reply;
use super::platform::BlePlatform;
use super::timer::{TimerEvent, TimerGuard, Timers};
use crate::gatt::{CharacteristicRef, WriteType};
use crate::BleError;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Split `data` into `chunk_size` pieces (a single piece when unset or when
/// the payload already fits). An empty payload is one empty chunk.
pub(crate) fn chunk_payload(data: Vec<u8>, chunk_size: Option<usize>) -> VecDeque<Vec<u8>> {
    match chunk_size {
        Some(size) if size > 0 && data.len() > size => {
            data.chunks(size).map(|c| c.to_vec()).collect()
        }
        _ => VecDeque::from(vec![data]),
    }
}

/// One enqueued acknowledged write
pub(crate) struct WriteTask {
    pub characteristic: CharacteristicRef,
    chunks: VecDeque<Vec<u8>>,
    reply: Reply<()>,
}

impl WriteTask {
    pub(crate) fn new(
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        chunk_size: Option<usize>,
        reply: Reply<()>,
    ) -> Self {
        Self {
            characteristic,
            chunks: chunk_payload(data, chunk_size),
            reply,
        }
    }

    fn complete(self, result: Result<(), BleError>) {
        let _ = self.reply.send(result);
    }
}

/// What the queue needs to talk to the platform
pub(crate) struct DispatchContext<'a> {
    pub platform: &'a dyn BlePlatform,
    pub timers: &'a Timers,
    pub timeout: Duration,
}

/// FIFO of acknowledged writes for one peripheral
pub(crate) struct WriteQueue {
    queue: VecDeque<WriteTask>,
    in_flight: bool,
    /// A write timed out; the next confirmation belongs to it, not to the head
    draining: bool,
    dispatch_seq: u64,
    deadline: Option<TimerGuard>,
    max_outstanding: usize,
}

impl WriteQueue {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: false,
            draining: false,
            dispatch_seq: 0,
            deadline: None,
            max_outstanding,
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queue.len() >= self.max_outstanding
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Send the head chunk to the platform. A head the platform refuses
    /// outright is failed and the next task is tried.
    fn dispatch_head(&mut self, peripheral: &str, ctx: &DispatchContext<'_>) {
        self.in_flight = false;
        self.deadline = None;

        while let Some(head) = self.queue.front() {
            let chunk = head.chunks.front().map(Vec::as_slice).unwrap_or_default();
            match ctx
                .platform
                .write(peripheral, &head.characteristic, chunk, WriteType::WithResponse)
            {
                Ok(()) => {
                    self.dispatch_seq += 1;
                    self.in_flight = true;
                    self.deadline = Some(ctx.timers.schedule(
                        ctx.timeout,
                        TimerEvent::WriteExpired {
                            peripheral: peripheral.to_string(),
                            dispatch: self.dispatch_seq,
                        },
                    ));
                    debug!(peripheral = %peripheral,
                        "Write dispatched to {} ({} bytes, {} queued)",
                        head.characteristic,
                        chunk.len(),
                        self.queue.len()
                    );
                    return;
                }
                Err(e) => {
                    warn!(peripheral = %peripheral, "Platform refused write to {}: {}", head.characteristic, e);
                    if let Some(task) = self.queue.pop_front() {
                        task.complete(Err(e));
                    }
                }
            }
        }
    }

    /// Append a task; dispatch immediately when nothing is in flight
    pub(crate) fn enqueue(&mut self, peripheral: &str, task: WriteTask, ctx: &DispatchContext<'_>) {
        if self.is_full() {
            task.complete(Err(BleError::Busy(format!(
                "write queue for {} is full ({} tasks)",
                peripheral, self.max_outstanding
            ))));
            return;
        }

        self.queue.push_back(task);
        if !self.in_flight && !self.draining {
            self.dispatch_head(peripheral, ctx);
        }
    }

    /// Platform reported the outcome of the in-flight write
    pub(crate) fn on_write_result(
        &mut self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        result: Result<(), String>,
        ctx: &DispatchContext<'_>,
    ) {
        if self.draining {
            debug!(peripheral = %peripheral, "Late result for timed-out write to {} absorbed", characteristic);
            self.draining = false;
            self.dispatch_head(peripheral, ctx);
            return;
        }
        if !self.in_flight {
            debug!(peripheral = %peripheral, "Write result for {} with nothing in flight; dropped", characteristic);
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        if &head.characteristic != characteristic {
            warn!(peripheral = %peripheral,
                "Write result for {} but {} is in flight; dropped", characteristic, head.characteristic
            );
            return;
        }

        match result {
            Ok(()) => {
                head.chunks.pop_front();
                if head.chunks.is_empty() {
                    if let Some(task) = self.queue.pop_front() {
                        task.complete(Ok(()));
                    }
                }
            }
            Err(reason) => {
                if let Some(task) = self.queue.pop_front() {
                    task.complete(Err(BleError::Platform(reason)));
                }
            }
        }
        self.dispatch_head(peripheral, ctx);
    }

    /// Deadline of the in-flight write passed. The queue then holds until the
    /// late confirmation shows up or a second deadline passes, so that
    /// confirmation is not credited to the next write. Returns true only for
    /// the first deadline.
    pub(crate) fn on_timeout(&mut self, peripheral: &str, dispatch: u64, ctx: &DispatchContext<'_>) -> bool {
        if dispatch != self.dispatch_seq {
            return false;
        }
        if self.draining {
            debug!(peripheral = %peripheral, "No late write result arrived; resuming queue");
            self.draining = false;
            self.dispatch_head(peripheral, ctx);
            return false;
        }
        if !self.in_flight {
            return false;
        }

        if let Some(task) = self.queue.pop_front() {
            let characteristic = task.characteristic;
            task.complete(Err(BleError::Timeout(format!(
                "write to {} on {} got no response",
                characteristic, peripheral
            ))));
        }
        self.in_flight = false;
        self.draining = true;
        self.dispatch_seq += 1;
        self.deadline = Some(ctx.timers.schedule(
            ctx.timeout,
            TimerEvent::WriteExpired {
                peripheral: peripheral.to_string(),
                dispatch: self.dispatch_seq,
            },
        ));
        true
    }

    /// Fail every task, in-flight one included; returns how many were failed
    pub(crate) fn fail_all(&mut self, error: &BleError) -> usize {
        self.in_flight = false;
        self.draining = false;
        self.deadline = None;
        let count = self.queue.len();
        for task in self.queue.drain(..) {
            task.complete(Err(error.clone()));
        }
        count
    }
}

/// Write queues of every peripheral
pub(crate) struct WriteQueues {
    queues: HashMap<String, WriteQueue>,
    max_outstanding: usize,
}

impl WriteQueues {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_outstanding,
        }
    }

    pub(crate) fn enqueue(&mut self, peripheral: &str, task: WriteTask, ctx: &DispatchContext<'_>) {
        let max = self.max_outstanding;
        self.queues
            .entry(peripheral.to_string())
            .or_insert_with(|| WriteQueue::new(max))
            .enqueue(peripheral, task, ctx);
    }

    pub(crate) fn on_write_result(
        &mut self,
        peripheral: &str,
        characteristic: &CharacteristicRef,
        result: Result<(), String>,
        ctx: &DispatchContext<'_>,
    ) {
        match self.queues.get_mut(peripheral) {
            Some(queue) => queue.on_write_result(peripheral, characteristic, result, ctx),
            None => debug!(peripheral = %peripheral, "Write result with no write queue; dropped"),
        }
    }

    pub(crate) fn on_timeout(&mut self, peripheral: &str, dispatch: u64, ctx: &DispatchContext<'_>) -> bool {
        self.queues
            .get_mut(peripheral)
            .map_or(false, |queue| queue.on_timeout(peripheral, dispatch, ctx))
    }

    pub(crate) fn queued(&self, peripheral: &str) -> usize {
        self.queues.get(peripheral).map_or(0, WriteQueue::len)
    }

    pub(crate) fn fail_peripheral(&mut self, peripheral: &str, error: &BleError) -> usize {
        self.queues
            .remove(peripheral)
            .map_or(0, |mut queue| queue.fail_all(error))
    }

    pub(crate) fn fail_all(&mut self, error: &BleError) -> usize {
        self.queues
            .drain()
            .map(|(_, mut queue)| queue.fail_all(error))
            .sum()
    }
}

/// Unacknowledged write whose chunks go out one per interval
pub(crate) struct PacedWrite {
    characteristic: CharacteristicRef,
    chunks: VecDeque<Vec<u8>>,
    reply: Reply<()>,
}

impl PacedWrite {
    pub(crate) fn new(
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        chunk_size: Option<usize>,
        reply: Reply<()>,
    ) -> Self {
        Self {
            characteristic,
            chunks: chunk_payload(data, chunk_size),
            reply,
        }
    }
}

struct PacedLane {
    writes: VecDeque<PacedWrite>,
    tick: u64,
    next_chunk: Option<TimerGuard>,
}

/// Paced unacknowledged writes of every peripheral. A lane exists only while
/// chunks are still waiting for their slot.
pub(crate) struct PacedWrites {
    interval: Duration,
    lanes: HashMap<String, PacedLane>,
    next_tick: u64,
}

impl PacedWrites {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            lanes: HashMap::new(),
            next_tick: 0,
        }
    }

    /// Send the first chunk now, or line up behind writes still being paced
    pub(crate) fn submit(&mut self, peripheral: &str, write: PacedWrite, ctx: &DispatchContext<'_>) {
        match self.lanes.get_mut(peripheral) {
            Some(lane) => lane.writes.push_back(write),
            None => {
                self.lanes.insert(
                    peripheral.to_string(),
                    PacedLane {
                        writes: VecDeque::from(vec![write]),
                        tick: 0,
                        next_chunk: None,
                    },
                );
                self.send_next(peripheral, ctx);
            }
        }
    }

    /// Hand one chunk to the platform and arm the timer for the next one.
    /// A write resolves after its last chunk, or at the first refusal.
    fn send_next(&mut self, peripheral: &str, ctx: &DispatchContext<'_>) {
        let Some(lane) = self.lanes.get_mut(peripheral) else {
            return;
        };
        lane.next_chunk = None;

        if let Some(head) = lane.writes.front_mut() {
            let chunk = head.chunks.pop_front().unwrap_or_default();
            let result = ctx.platform.write(
                peripheral,
                &head.characteristic,
                &chunk,
                WriteType::WithoutResponse,
            );
            if let Err(e) = &result {
                warn!(peripheral = %peripheral, "Platform refused write to {}: {}", head.characteristic, e);
            }
            if result.is_err() || head.chunks.is_empty() {
                if let Some(write) = lane.writes.pop_front() {
                    let _ = write.reply.send(result);
                }
            }
        }

        if lane.writes.is_empty() {
            self.lanes.remove(peripheral);
            return;
        }
        self.next_tick += 1;
        lane.tick = self.next_tick;
        lane.next_chunk = Some(ctx.timers.schedule(
            self.interval,
            TimerEvent::PacedWriteDue {
                peripheral: peripheral.to_string(),
                tick: self.next_tick,
            },
        ));
    }

    /// Pacing timer fired; stale ticks are ignored
    pub(crate) fn on_due(&mut self, peripheral: &str, tick: u64, ctx: &DispatchContext<'_>) {
        match self.lanes.get(peripheral) {
            Some(lane) if lane.tick == tick => self.send_next(peripheral, ctx),
            _ => debug!(peripheral = %peripheral, "Stale pacing tick {} ignored", tick),
        }
    }

    pub(crate) fn fail_peripheral(&mut self, peripheral: &str, error: &BleError) -> usize {
        self.lanes
            .remove(peripheral)
            .map_or(0, |lane| Self::fail_lane(lane, error))
    }

    pub(crate) fn fail_all(&mut self, error: &BleError) -> usize {
        self.lanes
            .drain()
            .map(|(_, lane)| Self::fail_lane(lane, error))
            .sum()
    }

    fn fail_lane(lane: PacedLane, error: &BleError) -> usize {
        let count = lane.writes.len();
        for write in lane.writes {
            let _ = write.reply.send(Err(error.clone()));
        }
        count
    }
}
