//! Rank transport.
//!
//! A [`Communicator`] is the only path between partitions. It offers the
//! two collective operations the sync layer needs: a personalized
//! all-to-all exchange of byte buffers, and an all-gather. Every rank must
//! call the same collectives in the same order.
//!
//! [`ThreadCommunicator`] connects ranks running as threads of one process
//! through crossbeam channels.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{SimError, SimResult};
use crate::types::{Rank, RankInfo};

/// Collective transport between ranks.
pub trait Communicator: Send {
    fn rank_info(&self) -> RankInfo;

    /// Sends `sends[r]` to every rank `r` and returns what each rank sent
    /// here, indexed by source rank. The entry for this rank is ignored on
    /// send and empty on receive.
    ///
    /// Sizes are exchanged before contents; a size mismatch is a resource
    /// error.
    fn exchange(&mut self, sends: Vec<Vec<u8>>) -> SimResult<Vec<Vec<u8>>>;

    /// Contributes `data` and returns every rank's contribution in rank order.
    fn all_gather(&mut self, data: Vec<u8>) -> SimResult<Vec<Vec<u8>>>;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&mut self) -> SimResult<()> {
        self.all_gather(Vec::new()).map(|_| ())
    }

    /// Bytes sent by this rank so far.
    fn bytes_sent(&self) -> u64;
}

#[derive(Debug)]
enum Message {
    Size(u64),
    Data(Vec<u8>),
    Gather(Vec<u8>),
}

impl Message {
    fn name(&self) -> &'static str {
        match self {
            Message::Size(_) => "size",
            Message::Data(_) => "data",
            Message::Gather(_) => "gather",
        }
    }
}

/// In-process communicator for one rank.
#[derive(Debug)]
pub struct ThreadCommunicator {
    info: RankInfo,
    senders: Vec<Option<Sender<Message>>>,
    receivers: Vec<Option<Receiver<Message>>>,
    bytes_sent: u64,
}

impl ThreadCommunicator {
    /// Creates a fully connected set of `num_ranks` communicators, one per
    /// rank, in rank order.
    pub fn create(num_ranks: Rank) -> Vec<ThreadCommunicator> {
        let n = num_ranks as usize;
        let mut senders: Vec<Vec<Option<Sender<Message>>>> = (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Message>>>> =
            (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
        for from in 0..n {
            for to in 0..n {
                if from != to {
                    let (tx, rx) = unbounded();
                    senders[from][to] = Some(tx);
                    receivers[to][from] = Some(rx);
                }
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| ThreadCommunicator {
                info: RankInfo::new(rank as Rank, num_ranks),
                senders,
                receivers,
                bytes_sent: 0,
            })
            .collect()
    }

    fn send(&mut self, to: usize, message: Message) -> SimResult<()> {
        let tx = self.senders[to]
            .as_ref()
            .ok_or_else(|| SimError::resource(format!("rank {} has no channel to itself", to)))?;
        if let Message::Data(bytes) | Message::Gather(bytes) = &message {
            self.bytes_sent += bytes.len() as u64;
        }
        tx.send(message).map_err(|_| {
            SimError::resource(format!("rank {} disconnected while rank {} was sending", to, self.info.rank))
        })
    }

    fn recv(&self, from: usize) -> SimResult<Message> {
        let rx = self.receivers[from]
            .as_ref()
            .ok_or_else(|| SimError::resource(format!("rank {} has no channel to itself", from)))?;
        rx.recv().map_err(|_| {
            SimError::resource(format!(
                "rank {} disconnected while rank {} was waiting",
                from, self.info.rank
            ))
        })
    }

    fn peers(&self) -> impl Iterator<Item = usize> {
        let me = self.info.rank as usize;
        (0..self.info.num_ranks as usize).filter(move |r| *r != me)
    }

    fn mismatch(&self, from: usize, expected: &str, got: &Message) -> SimError {
        SimError::resource(format!(
            "rank {} expected a {} message from rank {}, got {}",
            self.info.rank,
            expected,
            from,
            got.name()
        ))
    }
}

impl Communicator for ThreadCommunicator {
    fn rank_info(&self) -> RankInfo {
        self.info
    }

    fn exchange(&mut self, mut sends: Vec<Vec<u8>>) -> SimResult<Vec<Vec<u8>>> {
        let n = self.info.num_ranks as usize;
        sends.resize_with(n, Vec::new);
        let peers: Vec<usize> = self.peers().collect();

        for &peer in &peers {
            self.send(peer, Message::Size(sends[peer].len() as u64))?;
        }
        let mut sizes = vec![0u64; n];
        for &peer in &peers {
            match self.recv(peer)? {
                Message::Size(size) => sizes[peer] = size,
                other => return Err(self.mismatch(peer, "size", &other)),
            }
        }

        for &peer in &peers {
            let bytes = std::mem::take(&mut sends[peer]);
            self.send(peer, Message::Data(bytes))?;
        }
        let mut received = vec![Vec::new(); n];
        for &peer in &peers {
            match self.recv(peer)? {
                Message::Data(bytes) => {
                    if bytes.len() as u64 != sizes[peer] {
                        return Err(SimError::resource(format!(
                            "rank {} announced {} bytes but sent {}",
                            peer,
                            sizes[peer],
                            bytes.len()
                        )));
                    }
                    received[peer] = bytes;
                }
                other => return Err(self.mismatch(peer, "data", &other)),
            }
        }
        Ok(received)
    }

    fn all_gather(&mut self, data: Vec<u8>) -> SimResult<Vec<Vec<u8>>> {
        let n = self.info.num_ranks as usize;
        let me = self.info.rank as usize;
        let peers: Vec<usize> = self.peers().collect();
        for &peer in &peers {
            self.send(peer, Message::Gather(data.clone()))?;
        }
        let mut gathered = vec![Vec::new(); n];
        for &peer in &peers {
            match self.recv(peer)? {
                Message::Gather(bytes) => gathered[peer] = bytes,
                other => return Err(self.mismatch(peer, "gather", &other)),
            }
        }
        gathered[me] = data;
        Ok(gathered)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_exchange_is_personalized() {
        let comms = ThreadCommunicator::create(3);
        let results: Vec<Vec<Vec<u8>>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|mut comm| {
                    s.spawn(move || {
                        let me = comm.rank_info().rank as u8;
                        let sends = (0..3u8).map(|to| vec![me * 10 + to]).collect();
                        comm.exchange(sends).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], vec![vec![], vec![10], vec![20]]);
        assert_eq!(results[2], vec![vec![2], vec![12], vec![]]);
    }

    #[test]
    fn test_all_gather_in_rank_order() {
        let comms = ThreadCommunicator::create(2);
        let results: Vec<Vec<Vec<u8>>> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|mut comm| {
                    s.spawn(move || {
                        let me = comm.rank_info().rank as u8;
                        comm.barrier().unwrap();
                        comm.all_gather(vec![me; 2]).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], vec![vec![0, 0], vec![1, 1]]);
    }

    #[test]
    fn test_disconnect_is_a_resource_error() {
        let mut comms = ThreadCommunicator::create(2);
        let other = comms.pop().unwrap();
        drop(other);
        let err = comms[0].all_gather(vec![1]).unwrap_err();
        assert!(matches!(err, SimError::Resource { .. }));
    }
}
