//! Slab decomposition along X and the collective exchange between partitions.
//!
//! Every partition owns a contiguous range of global X cells and the full
//! Y/Z extent. Partitions talk to their two X neighbours through an
//! [`Exchange`]; all operations are blocking collectives that every
//! partition calls in the same order.

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::trace;

use crate::error::{PicError, Result};
use crate::particle::Particle;

/// One of the two X neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Low,
    High,
}

/// Slab owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decomposition {
    pub rank: usize,
    pub size: usize,
    /// First global X cell owned.
    pub x_offset: usize,
    /// Number of X cells owned.
    pub nx_local: usize,
}

impl Decomposition {
    /// The whole domain in one partition.
    pub fn single(cells: [usize; 3]) -> Self {
        Self {
            rank: 0,
            size: 1,
            x_offset: 0,
            nx_local: cells[0],
        }
    }

    /// Split `cells[0]` into `size` slabs; the first `Nx % size` slabs get
    /// one extra cell. Each slab needs at least two cells.
    pub fn slab(cells: [usize; 3], rank: usize, size: usize) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(PicError::InvalidConfig(format!(
                "rank {rank} is not part of a decomposition of size {size}"
            )));
        }
        let nx = cells[0];
        let base = nx / size;
        let extra = nx % size;
        let nx_local = base + usize::from(rank < extra);
        if nx_local < 2 {
            return Err(PicError::InvalidConfig(format!(
                "{nx} x cells over {size} partitions leaves rank {rank} with {nx_local}"
            )));
        }
        let x_offset = rank * base + rank.min(extra);
        Ok(Self {
            rank,
            size,
            x_offset,
            nx_local,
        })
    }

    pub fn neighbor(&self, side: Side) -> usize {
        match side {
            Side::Low => (self.rank + self.size - 1) % self.size,
            Side::High => (self.rank + 1) % self.size,
        }
    }
}

/// Collective communication between X-neighbouring partitions.
pub trait Exchange: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Send planes to both neighbours and return `(from_low, from_high)`:
    /// what the low neighbour sent upwards and what the high neighbour
    /// sent downwards.
    fn exchange_planes(&self, to_low: Vec<f64>, to_high: Vec<f64>) -> Result<(Vec<f64>, Vec<f64>)>;

    /// Hand particles to both neighbours; returns everything received.
    fn exchange_particles(&self, to_low: Vec<Particle>, to_high: Vec<Particle>) -> Result<Vec<Particle>>;

    /// Elementwise sum over all partitions, identical on every partition.
    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>>;

    fn barrier(&self) -> Result<()> {
        self.all_reduce_sum(&[]).map(|_| ())
    }
}

/// A single partition that wraps around onto itself along X.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExchange;

impl Exchange for LocalExchange {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange_planes(&self, to_low: Vec<f64>, to_high: Vec<f64>) -> Result<(Vec<f64>, Vec<f64>)> {
        Ok((to_high, to_low))
    }

    fn exchange_particles(&self, mut to_low: Vec<Particle>, to_high: Vec<Particle>) -> Result<Vec<Particle>> {
        to_low.extend(to_high);
        Ok(to_low)
    }

    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    ToLow = 0,
    ToHigh = 1,
    Reduce = 2,
}

#[derive(Debug)]
enum Message {
    Planes(Vec<f64>),
    Particles(Vec<Particle>),
    Values(Vec<f64>),
}

/// In-process partitions connected by crossbeam channels.
pub struct ChannelExchange {
    rank: usize,
    size: usize,
    /// `senders[dst][tag]`
    senders: Vec<[Sender<Message>; 3]>,
    /// `receivers[src][tag]`
    receivers: Vec<[Receiver<Message>; 3]>,
}

impl ChannelExchange {
    /// Build `size` connected endpoints, one per rank, in rank order.
    pub fn ring(size: usize) -> Vec<ChannelExchange> {
        // channels[src][dst][tag]
        let channels: Vec<Vec<[(Sender<Message>, Receiver<Message>); 3]>> = (0..size)
            .map(|_| {
                (0..size)
                    .map(|_| [unbounded(), unbounded(), unbounded()])
                    .collect()
            })
            .collect();

        (0..size)
            .map(|rank| {
                let senders = (0..size)
                    .map(|dst| {
                        let c = &channels[rank][dst];
                        [c[0].0.clone(), c[1].0.clone(), c[2].0.clone()]
                    })
                    .collect();
                let receivers = (0..size)
                    .map(|src| {
                        let c = &channels[src][rank];
                        [c[0].1.clone(), c[1].1.clone(), c[2].1.clone()]
                    })
                    .collect();
                ChannelExchange {
                    rank,
                    size,
                    senders,
                    receivers,
                }
            })
            .collect()
    }

    fn low(&self) -> usize {
        (self.rank + self.size - 1) % self.size
    }

    fn high(&self) -> usize {
        (self.rank + 1) % self.size
    }

    fn send(&self, dst: usize, tag: Tag, message: Message) -> Result<()> {
        self.senders[dst][tag as usize]
            .send(message)
            .map_err(|_| PicError::Exchange(format!("rank {dst} hung up ({tag:?})")))
    }

    fn recv(&self, src: usize, tag: Tag) -> Result<Message> {
        self.receivers[src][tag as usize]
            .recv()
            .map_err(|_| PicError::Exchange(format!("rank {src} hung up ({tag:?})")))
    }
}

impl Exchange for ChannelExchange {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn exchange_planes(&self, to_low: Vec<f64>, to_high: Vec<f64>) -> Result<(Vec<f64>, Vec<f64>)> {
        self.send(self.low(), Tag::ToLow, Message::Planes(to_low))?;
        self.send(self.high(), Tag::ToHigh, Message::Planes(to_high))?;
        let from_low = match self.recv(self.low(), Tag::ToHigh)? {
            Message::Planes(p) => p,
            other => return Err(unexpected(&other)),
        };
        let from_high = match self.recv(self.high(), Tag::ToLow)? {
            Message::Planes(p) => p,
            other => return Err(unexpected(&other)),
        };
        trace!(rank = self.rank, low = from_low.len(), high = from_high.len(), "planes exchanged");
        Ok((from_low, from_high))
    }

    fn exchange_particles(&self, to_low: Vec<Particle>, to_high: Vec<Particle>) -> Result<Vec<Particle>> {
        self.send(self.low(), Tag::ToLow, Message::Particles(to_low))?;
        self.send(self.high(), Tag::ToHigh, Message::Particles(to_high))?;
        let mut received = match self.recv(self.low(), Tag::ToHigh)? {
            Message::Particles(p) => p,
            other => return Err(unexpected(&other)),
        };
        match self.recv(self.high(), Tag::ToLow)? {
            Message::Particles(p) => received.extend(p),
            other => return Err(unexpected(&other)),
        }
        Ok(received)
    }

    fn all_reduce_sum(&self, values: &[f64]) -> Result<Vec<f64>> {
        for dst in 0..self.size {
            self.send(dst, Tag::Reduce, Message::Values(values.to_vec()))?;
        }
        let mut total = vec![0.0; values.len()];
        // rank order keeps the sum bitwise identical everywhere
        for src in 0..self.size {
            match self.recv(src, Tag::Reduce)? {
                Message::Values(v) if v.len() == total.len() => {
                    for (t, x) in total.iter_mut().zip(v) {
                        *t += x;
                    }
                }
                Message::Values(v) => {
                    return Err(PicError::Exchange(format!(
                        "reduction length {} from rank {src}, expected {}",
                        v.len(),
                        total.len()
                    )));
                }
                other => return Err(unexpected(&other)),
            }
        }
        Ok(total)
    }
}

fn unexpected(message: &Message) -> PicError {
    let kind = match message {
        Message::Planes(_) => "planes",
        Message::Particles(_) => "particles",
        Message::Values(_) => "values",
    };
    PicError::Exchange(format!("unexpected {kind} message"))
}
