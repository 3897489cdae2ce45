// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hand-off of reference buffers between a producer and a consumer
//! controller that must see the same reference data.
//!
//! Each side keeps a queue of buffers tagged with the frame sequence they
//! were last written for. Before running frame `n` the oldest buffer is
//! popped as the output and the newest one serves as the input:
//!
//! ```text
//! queued:             S6  S7  S8  S9
//! acquire for S10:   out  S7  S8  S9(in)
//! release S10:            S7  S8  S9  S10
//! ```

use crate::{
    buffer::Buffer,
    error::{Error, Result},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Identifies one side of a sharing relationship.
pub type ReferId = u64;

/// Buffers a consumer keeps for itself.
pub const CONSUMER_BUFFER_COUNT: usize = 2;

/// How long a consumer waits for the producer per attempt.
pub const WAIT_PERIOD: Duration = Duration::from_millis(33);

/// Number of periods a consumer waits before giving up.
pub const WAIT_PERIODS: u32 = 3;

/// Builds the id of terminal `terminal_index` of program group `pg_id` in
/// stream `stream_id`. Port numbers start at one so that no id is zero.
pub fn refer_id(stream_id: u32, pg_id: u32, terminal_index: u32) -> ReferId {
    (u64::from(stream_id) << 32) + (u64::from(pg_id) << 16) + u64::from(terminal_index) + 1
}

#[derive(Debug, Clone)]
struct ReferBuffer {
    /// Frame the buffer was written for; negative when it holds no frame.
    sequence: i64,
    buffer: Arc<Buffer>,
}

#[derive(Debug, Default)]
struct PairState {
    busy: bool,
    /// Sharing is dropped when the two sides register buffers of different
    /// sizes.
    inactive: bool,
    producer: VecDeque<ReferBuffer>,
    consumer: VecDeque<ReferBuffer>,
}

#[derive(Debug)]
struct UserPair {
    producer_name: String,
    producer_id: ReferId,
    consumer_name: String,
    consumer_id: ReferId,
    state: Mutex<PairState>,
    signal: Condvar,
}

impl UserPair {
    fn lock(&self) -> MutexGuard<'_, PairState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_producer(&self, id: ReferId) -> bool {
        self.producer_id == id
    }
}

impl PairState {
    fn queue(&mut self, producer: bool) -> &mut VecDeque<ReferBuffer> {
        if producer {
            &mut self.producer
        } else {
            &mut self.consumer
        }
    }
}

/// Reference buffers handed out for one frame.
#[derive(Debug, Clone)]
pub struct ReferPair {
    /// Reference written by the previous frame.
    pub input: Arc<Buffer>,
    /// Reference the current frame writes.
    pub output: Arc<Buffer>,
}

/// Shared between the controllers of one camera.
#[derive(Debug)]
pub struct SharedReferencePool {
    producer_depth: usize,
    pairs: Mutex<Vec<Arc<UserPair>>>,
}

impl SharedReferencePool {
    /// `producer_depth` is the number of reference buffers a producer keeps
    /// so that consumers can still find older frames.
    pub fn new(producer_depth: usize) -> Self {
        SharedReferencePool {
            producer_depth,
            pairs: Mutex::new(Vec::new()),
        }
    }

    fn pairs(&self) -> MutexGuard<'_, Vec<Arc<UserPair>>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find(&self, id: ReferId) -> Result<Arc<UserPair>> {
        self.pairs()
            .iter()
            .find(|p| p.producer_id == id || p.consumer_id == id)
            .cloned()
            .ok_or_else(|| Error::NoEntry(format!("no refer pair for {:#x}", id)))
    }

    pub fn set_refer_pair(
        &self,
        producer_name: &str,
        producer_id: ReferId,
        consumer_name: &str,
        consumer_id: ReferId,
    ) -> Result<()> {
        if producer_id == consumer_id {
            return Err(Error::InvalidArg(format!(
                "same id {:#x} for producer and consumer",
                producer_id
            )));
        }

        info!(
            "refer pair {}:{:#x} -> {}:{:#x}",
            producer_name, producer_id, consumer_name, consumer_id
        );
        self.pairs().push(Arc::new(UserPair {
            producer_name: producer_name.to_owned(),
            producer_id,
            consumer_name: consumer_name.to_owned(),
            consumer_id,
            state: Mutex::new(PairState::default()),
            signal: Condvar::new(),
        }));
        Ok(())
    }

    /// Removes the pair `id` belongs to. Fails while a consumer waits on it.
    pub fn clear_refer_pair(&self, id: ReferId) -> Result<()> {
        let mut pairs = self.pairs();
        let pos = pairs
            .iter()
            .position(|p| p.producer_id == id || p.consumer_id == id)
            .ok_or_else(|| Error::NoEntry(format!("no refer pair for {:#x}", id)))?;

        if pairs[pos].lock().busy {
            return Err(Error::Device(format!("refer pair {:#x} is busy", id)));
        }
        pairs.remove(pos);
        Ok(())
    }

    /// Buffers the caller must allocate for `id`; zero when `id` does not
    /// share its references.
    pub fn min_buffer_count(&self, id: ReferId) -> usize {
        match self.find(id) {
            Ok(pair) if pair.is_producer(id) => self.producer_depth,
            Ok(_) => CONSUMER_BUFFER_COUNT,
            Err(_) => 0,
        }
    }

    pub fn register_refer_buffer(&self, id: ReferId, buffer: Arc<Buffer>) -> Result<()> {
        let pair = self.find(id)?;
        let producer = pair.is_producer(id);
        let mut state = pair.lock();

        let size = buffer.size();
        let other = if producer {
            state.consumer.front()
        } else {
            state.producer.front()
        };
        if let Some(other) = other {
            if other.buffer.size() != size && !state.inactive {
                warn!(
                    "refer buffers of {} and {} differ in size, sharing disabled",
                    pair.producer_name, pair.consumer_name
                );
                state.inactive = true;
            }
        }

        state.queue(producer).push_back(ReferBuffer {
            sequence: -1,
            buffer,
        });
        Ok(())
    }

    /// Hands out the reference pair for frame `out_sequence`.
    ///
    /// A consumer without its own copy of the previous frame waits for the
    /// producer and copies the producer's reference into its input buffer.
    pub fn acquire(&self, id: ReferId, out_sequence: i64) -> Result<ReferPair> {
        let in_sequence = out_sequence - 1;
        let pair = self.find(id)?;
        let producer = pair.is_producer(id);

        let mut state = pair.lock();
        let inactive = state.inactive;
        let queue = state.queue(producer);
        let out = queue
            .pop_front()
            .ok_or_else(|| Error::InvalidArg(format!("no refer buffer for {:#x}", id)))?;
        let newest = queue.back().cloned().unwrap_or_else(|| out.clone());

        if newest.sequence == in_sequence || in_sequence < 0 || (inactive && !producer) {
            trace!(
                "{:#x} acquire in seq {}, got {}, out seq {}",
                id,
                in_sequence,
                newest.sequence,
                out_sequence
            );
            return Ok(ReferPair {
                input: newest.buffer,
                output: out.buffer,
            });
        }

        if producer {
            // reprocessing an older frame
            if let Some(found) = queue.iter().find(|b| b.sequence == in_sequence) {
                let input = found.buffer.clone();
                return Ok(ReferPair {
                    input,
                    output: out.buffer,
                });
            }
            queue.push_front(out);
            return Err(Error::NoEntry(format!(
                "{:#x} has no reference for seq {}",
                id, in_sequence
            )));
        }

        debug!(
            "{} waits for seq {} from {}",
            pair.consumer_name, in_sequence, pair.producer_name
        );
        state.busy = true;
        let deadline = Instant::now() + WAIT_PERIOD * WAIT_PERIODS;
        let source = loop {
            match find_reference(&state.producer, in_sequence) {
                Lookup::Found(buffer) => break Ok(buffer),
                Lookup::Missing => {
                    break Err(Error::NoEntry(format!(
                        "producer has no reference at or before seq {}",
                        in_sequence
                    )))
                }
                Lookup::NotYet => {}
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Error::Timeout(
                    (WAIT_PERIOD * WAIT_PERIODS).as_millis() as u64,
                ));
            }
            state = pair
                .signal
                .wait_timeout(state, WAIT_PERIOD.min(deadline - now))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };
        state.busy = false;

        match source {
            Ok(src) => {
                drop(state);
                copy_reference(&src, &newest.buffer)?;
                debug!(
                    "{} acquired seq {} from {}",
                    pair.consumer_name, in_sequence, pair.producer_name
                );
                Ok(ReferPair {
                    input: newest.buffer,
                    output: out.buffer,
                })
            }
            Err(e) => {
                state.consumer.push_front(out);
                Err(e)
            }
        }
    }

    /// Returns the buffer written for frame `out_sequence` to the pool.
    pub fn release(&self, id: ReferId, output: Arc<Buffer>, out_sequence: i64) -> Result<()> {
        let pair = self.find(id)?;
        let producer = pair.is_producer(id);
        {
            let mut state = pair.lock();
            let queue = state.queue(producer);
            let newest = queue.back().map(|b| b.sequence).unwrap_or(-1);
            if out_sequence < newest {
                // an older frame was reprocessed, its data is stale
                queue.push_front(ReferBuffer {
                    sequence: -1,
                    buffer: output,
                });
            } else {
                queue.push_back(ReferBuffer {
                    sequence: out_sequence,
                    buffer: output,
                });
            }
        }
        pair.signal.notify_all();
        Ok(())
    }
}

enum Lookup {
    Found(Arc<Buffer>),
    NotYet,
    Missing,
}

fn find_reference(queue: &VecDeque<ReferBuffer>, sequence: i64) -> Lookup {
    match queue.back() {
        None => return Lookup::NotYet,
        Some(newest) if newest.sequence < sequence => return Lookup::NotYet,
        _ => {}
    }
    queue
        .iter()
        .rev()
        .find(|b| b.sequence <= sequence)
        .map(|b| Lookup::Found(b.buffer.clone()))
        .unwrap_or(Lookup::Missing)
}

fn copy_reference(src: &Buffer, dst: &Buffer) -> Result<()> {
    let (Ok(src_map), Ok(mut dst_map)) = (src.map(), dst.map()) else {
        debug!("reference is not cpu visible, nothing copied");
        return Ok(());
    };
    let len = src_map.len().min(dst_map.len());
    dst_map.as_mut_slice()[..len].copy_from_slice(&src_map.as_slice()[..len]);
    Ok(())
}
