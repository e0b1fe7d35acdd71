//! Rank synchronization.
//!
//! Partitions run independently between sync horizons spaced by the
//! smallest cut-link latency `L`. Any event sent across a cut at time `t`
//! is delivered no earlier than `t + L`, which is never before the next
//! horizon, so it can wait in an outbound buffer until then. At a horizon
//! every rank:
//!
//! 1. frames its per-peer outbound buffers ([`crate::wire`]),
//! 2. exchanges sizes, then contents, with every other rank,
//! 3. decodes what it received in source-rank order and hands the events
//!    back to the driver for insertion into its vortex,
//! 4. all-gathers a [`SyncSummary`] so every rank takes the same decision
//!    about ending the run.
//!
//! [`SyncMode::Serial`] does all of this on the calling thread.
//! [`SyncMode::Parallel`] frames on the rayon pool (with the `parallel`
//! feature) and decodes each source rank on its own thread behind a
//! bounded channel. Both produce the same events in the same order.

use serde::{Deserialize, Serialize};
use std::thread;

use crossbeam::channel::bounded;

use crate::comm::Communicator;
use crate::config::SyncMode;
use crate::error::{SimError, SimResult};
use crate::event::{Event, EventTypeRegistry};
use crate::types::{RankInfo, SimTime};
use crate::wire::{decode_frames, encode_frames, OutboundEvent};

/// What one rank contributes to the end-of-run decision at a horizon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Components holding the run open
    pub exit_holders: u64,
    /// Whether any component ever held the run open
    pub ever_held: bool,
    /// No pending work besides sync and heartbeat
    pub idle: bool,
}

impl SyncSummary {
    /// Combines the summaries of every rank.
    pub fn reduce(all: &[SyncSummary]) -> SyncSummary {
        all.iter().fold(
            SyncSummary {
                exit_holders: 0,
                ever_held: false,
                idle: true,
            },
            |acc, s| SyncSummary {
                exit_holders: acc.exit_holders + s.exit_holders,
                ever_held: acc.ever_held || s.ever_held,
                idle: acc.idle && s.idle,
            },
        )
    }

    /// Returns true if the primary components of the whole run have all
    /// released it.
    pub fn exit_ready(&self) -> bool {
        self.ever_held && self.exit_holders == 0
    }
}

/// Exchanges cross-rank events and end-of-run state with the other ranks.
pub struct RankSync {
    comm: Box<dyn Communicator>,
    mode: SyncMode,
    period: Option<SimTime>,
    queue_depth: usize,
    rounds: u64,
    imported: u64,
}

impl RankSync {
    /// Creates the sync layer. `period` is the smallest cut-link latency, or
    /// `None` if no link is cut.
    pub fn new(comm: Box<dyn Communicator>, mode: SyncMode, period: Option<SimTime>, queue_depth: usize) -> Self {
        Self {
            comm,
            mode,
            period,
            queue_depth: queue_depth.max(1),
            rounds: 0,
            imported: 0,
        }
    }

    pub fn rank_info(&self) -> RankInfo {
        self.comm.rank_info()
    }

    /// Distance between sync horizons.
    pub fn period(&self) -> Option<SimTime> {
        self.period
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Timed horizons processed.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Events received from other ranks, timed and untimed.
    pub fn imported(&self) -> u64 {
        self.imported
    }

    pub fn bytes_sent(&self) -> u64 {
        self.comm.bytes_sent()
    }

    /// Runs the exchange of one timed horizon and returns the received
    /// events, stamped with their delivery time and receiving link.
    pub fn exchange_events(
        &mut self,
        outbound: &mut [Vec<OutboundEvent>],
        types: &EventTypeRegistry,
    ) -> SimResult<Vec<Event>> {
        let events = self.exchange(outbound, types)?;
        self.rounds += 1;
        Ok(events)
    }

    /// Exchanges the untimed messages of one phase. Returns the received
    /// messages and the number of messages sent by all ranks in the phase.
    pub fn exchange_untimed(
        &mut self,
        outbound: &mut [Vec<OutboundEvent>],
        types: &EventTypeRegistry,
        sent_here: u64,
    ) -> SimResult<(Vec<Event>, u64)> {
        let events = self.exchange(outbound, types)?;
        let counts = self.comm.all_gather(sent_here.to_le_bytes().to_vec())?;
        let mut total = 0u64;
        for bytes in counts {
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| SimError::serialization(format!("untimed count of {} bytes", bytes.len())))?;
            total += u64::from_le_bytes(raw);
        }
        Ok((events, total))
    }

    /// All-gathers the local summary and returns the reduction over ranks.
    pub fn reduce(&mut self, local: SyncSummary) -> SimResult<SyncSummary> {
        let gathered = self.comm.all_gather(bincode::serialize(&local)?)?;
        let all = gathered
            .iter()
            .map(|bytes| bincode::deserialize::<SyncSummary>(bytes).map_err(SimError::from))
            .collect::<SimResult<Vec<_>>>()?;
        Ok(SyncSummary::reduce(&all))
    }

    pub fn barrier(&mut self) -> SimResult<()> {
        self.comm.barrier()
    }

    fn exchange(&mut self, outbound: &mut [Vec<OutboundEvent>], types: &EventTypeRegistry) -> SimResult<Vec<Event>> {
        let me = self.comm.rank_info().rank as usize;
        if let Some(own) = outbound.get(me) {
            if !own.is_empty() {
                return Err(SimError::fatal(format!("rank {} has events addressed to itself", me)));
            }
        }
        let events = match self.mode {
            SyncMode::Serial => {
                let received = self.comm.exchange(frame_serial(outbound)?)?;
                decode_serial(&received, types)?
            }
            SyncMode::Parallel => {
                let received = self.comm.exchange(frame_buffers(outbound)?)?;
                decode_pipelined(&received, types, self.queue_depth)?
            }
        };
        self.imported += events.len() as u64;
        tracing::trace!(rank = me, events = events.len(), "sync exchange");
        Ok(events)
    }
}

impl std::fmt::Debug for RankSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankSync")
            .field("rank", &self.comm.rank_info())
            .field("mode", &self.mode)
            .field("period", &self.period)
            .field("rounds", &self.rounds)
            .finish()
    }
}

fn frame_serial(outbound: &mut [Vec<OutboundEvent>]) -> SimResult<Vec<Vec<u8>>> {
    outbound
        .iter_mut()
        .map(|events| {
            let buf = encode_frames(events)?;
            events.clear();
            Ok(buf)
        })
        .collect()
}

#[cfg(feature = "parallel")]
fn frame_buffers(outbound: &mut [Vec<OutboundEvent>]) -> SimResult<Vec<Vec<u8>>> {
    use rayon::prelude::*;

    outbound
        .par_iter_mut()
        .map(|events| {
            let buf = encode_frames(events)?;
            events.clear();
            Ok(buf)
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
fn frame_buffers(outbound: &mut [Vec<OutboundEvent>]) -> SimResult<Vec<Vec<u8>>> {
    frame_serial(outbound)
}

fn decode_buffer(buf: &[u8], types: &EventTypeRegistry, out: &mut Vec<Event>) -> SimResult<()> {
    for frame in decode_frames(buf)? {
        let mut event = types.decode(frame.bytes)?;
        event.set_delivery(frame.delivery_time, frame.link);
        out.push(event);
    }
    Ok(())
}

fn decode_serial(received: &[Vec<u8>], types: &EventTypeRegistry) -> SimResult<Vec<Event>> {
    let mut events = Vec::new();
    for buf in received {
        decode_buffer(buf, types, &mut events)?;
    }
    Ok(events)
}

/// Decodes every source rank on its own thread; the caller drains the
/// lanes in rank order so the result matches [`decode_serial`].
fn decode_pipelined(received: &[Vec<u8>], types: &EventTypeRegistry, depth: usize) -> SimResult<Vec<Event>> {
    thread::scope(|s| {
        let mut lanes = Vec::new();
        for buf in received.iter().filter(|b| !b.is_empty()) {
            let (tx, rx) = bounded::<SimResult<Event>>(depth);
            s.spawn(move || {
                let frames = match decode_frames(buf) {
                    Ok(frames) => frames,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                for frame in frames {
                    let item = types.decode(frame.bytes).map(|mut event| {
                        event.set_delivery(frame.delivery_time, frame.link);
                        event
                    });
                    let failed = item.is_err();
                    // A closed lane means the consumer already failed.
                    if tx.send(item).is_err() || failed {
                        return;
                    }
                }
            });
            lanes.push(rx);
        }

        let mut events = Vec::new();
        for lane in lanes {
            for item in lane {
                events.push(item?);
            }
        }
        Ok(events)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ThreadCommunicator;
    use crate::event::{EventData, NullEvent};
    use crate::types::LinkId;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Token(u32);

    impl EventData for Token {
        const TYPE_TAG: u16 = 7;
    }

    fn types() -> EventTypeRegistry {
        let mut types = EventTypeRegistry::new();
        types.register::<Token>().unwrap();
        types
    }

    fn outbound(event: Event, link: u32, time: SimTime) -> OutboundEvent {
        OutboundEvent {
            link: LinkId(link),
            delivery_time: time,
            bytes: event.encode().unwrap(),
        }
    }

    fn run_exchange(mode: SyncMode) -> Vec<Vec<(u32, SimTime, u32)>> {
        let comms = ThreadCommunicator::create(3);
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let me = comm.rank_info().rank;
                        let mut sync = RankSync::new(Box::new(comm), mode, Some(10), 2);
                        let mut out: Vec<Vec<OutboundEvent>> = vec![Vec::new(); 3];
                        for to in (0..3u32).filter(|r| *r != me) {
                            for i in 0..5 {
                                out[to as usize].push(outbound(Event::new(Token(me * 100 + i)), to, 10 + i as u64));
                            }
                        }
                        let events = sync.exchange_events(&mut out, &types()).unwrap();
                        assert!(out.iter().all(Vec::is_empty));
                        events
                            .into_iter()
                            .map(|e| {
                                let link = e.delivery_link().unwrap().0;
                                let time = e.delivery_time();
                                (link, time, e.into_data::<Token>().unwrap().0)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_serial_exchange_in_rank_order() {
        let results = run_exchange(SyncMode::Serial);
        let tokens: Vec<u32> = results[1].iter().map(|r| r.2).collect();
        assert_eq!(tokens, vec![0, 1, 2, 3, 4, 200, 201, 202, 203, 204]);
        assert!(results[1].iter().all(|r| r.0 == 1));
        assert_eq!(results[1][3].1, 13);
    }

    #[test]
    fn test_parallel_matches_serial() {
        assert_eq!(run_exchange(SyncMode::Serial), run_exchange(SyncMode::Parallel));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        let mut comms = ThreadCommunicator::create(2);
        let b = comms.pop().unwrap();
        let a = comms.pop().unwrap();
        thread::scope(|s| {
            let ha = s.spawn(move || {
                let mut sync = RankSync::new(Box::new(a), SyncMode::Parallel, Some(5), 1);
                let mut out = vec![Vec::new(), vec![outbound(Event::new(Token(1)), 1, 5)]];
                sync.exchange_events(&mut out, &types())
            });
            let hb = s.spawn(move || {
                let mut sync = RankSync::new(Box::new(b), SyncMode::Parallel, Some(5), 1);
                let mut out: Vec<Vec<OutboundEvent>> = vec![Vec::new(), Vec::new()];
                sync.exchange_events(&mut out, &EventTypeRegistry::new())
            });
            assert!(ha.join().unwrap().is_ok());
            assert!(hb.join().unwrap().unwrap_err().is_serialization());
        });
    }

    #[test]
    fn test_summary_reduction() {
        let comms = ThreadCommunicator::create(2);
        let results: Vec<SyncSummary> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let me = comm.rank_info().rank;
                        let mut sync = RankSync::new(Box::new(comm), SyncMode::Serial, None, 4);
                        let local = SyncSummary {
                            exit_holders: me as u64,
                            ever_held: me == 1,
                            idle: me == 0,
                        };
                        sync.reduce(local).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].exit_holders, 1);
        assert!(results[0].ever_held);
        assert!(!results[0].idle);
        assert!(!results[0].exit_ready());
    }

    #[test]
    fn test_untimed_counts_are_summed() {
        let comms = ThreadCommunicator::create(2);
        let totals: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let me = comm.rank_info().rank as u64;
                        let mut sync = RankSync::new(Box::new(comm), SyncMode::Serial, None, 4);
                        let mut out: Vec<Vec<OutboundEvent>> = vec![Vec::new(), Vec::new()];
                        if me == 0 {
                            out[1].push(outbound(Event::new(NullEvent), 3, 0));
                        }
                        let (events, total) = sync.exchange_untimed(&mut out, &EventTypeRegistry::new(), 1 - me).unwrap();
                        assert_eq!(events.len(), me as usize);
                        total
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(totals, vec![1, 1]);
    }
}
