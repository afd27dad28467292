//! TCP process group with star-topology collectives.
//!
//! Rank 0 listens on the rendezvous address and every other rank connects to
//! it. Reductions are computed at rank 0 by summing contributions in rank
//! order and sending the result back, so every rank ends a collective with
//! bit-identical values.

use crate::error::{TrainingError, TrainingResult};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const MAGIC: u32 = 0x4E55_434C;
const CONNECT_RETRY: Duration = Duration::from_millis(50);

/// Where and how long ranks wait for each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    pub master_addr: String,
    pub master_port: u16,
    /// Upper bound on group formation.
    pub rendezvous_timeout: Duration,
    /// Socket read/write timeout during collectives; `None` waits forever.
    pub collective_timeout: Option<Duration>,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1".to_string(),
            master_port: 29_500,
            rendezvous_timeout: Duration::from_secs(60),
            collective_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl Rendezvous {
    #[must_use]
    pub fn local(master_port: u16) -> Self {
        Self { master_port, ..Self::default() }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

/// Asks the OS for a currently unused loopback port.
pub fn free_port() -> TrainingResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Collective operations a distributed trainer needs.
pub trait Communicator: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum across ranks, written back into `values` on every rank.
    fn all_reduce_sum_f32(&mut self, values: &mut [f32]) -> TrainingResult<()>;

    fn all_reduce_sum_f64(&mut self, values: &mut [f64]) -> TrainingResult<()>;

    /// Overwrites `values` on every rank with rank 0's contents.
    fn broadcast_f32(&mut self, values: &mut [f32]) -> TrainingResult<()>;

    fn barrier(&mut self) -> TrainingResult<()> {
        self.all_reduce_sum_f64(&mut [0.0])
    }

    /// Releases connections. Calling it again is a no-op.
    fn teardown(&mut self) -> TrainingResult<()>;
}

trait WireScalar: Copy + std::ops::AddAssign {
    const SIZE: usize;
    fn put(self, out: &mut Vec<u8>);
    fn take(bytes: &[u8]) -> Self;
}

impl WireScalar for f32 {
    const SIZE: usize = 4;
    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn take(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Self::from_le_bytes(raw)
    }
}

impl WireScalar for f64 {
    const SIZE: usize = 8;
    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn take(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Self::from_le_bytes(raw)
    }
}

fn send_values<T: WireScalar>(stream: &mut TcpStream, values: &[T]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(8 + values.len() * T::SIZE);
    buf.extend_from_slice(&(values.len() as u64).to_le_bytes());
    for &v in values {
        v.put(&mut buf);
    }
    stream.write_all(&buf)?;
    stream.flush()
}

fn recv_values<T: WireScalar>(stream: &mut TcpStream, expected: usize) -> std::io::Result<Vec<T>> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len)?;
    let len = u64::from_le_bytes(len) as usize;
    if len != expected {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("expected {expected} values, peer sent {len}"),
        ));
    }
    let mut bytes = vec![0u8; len * T::SIZE];
    stream.read_exact(&mut bytes)?;
    Ok(bytes.chunks_exact(T::SIZE).map(T::take).collect())
}

fn write_words(stream: &mut TcpStream, words: &[u32]) -> std::io::Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    stream.write_all(&bytes)?;
    stream.flush()
}

fn read_words<const N: usize>(stream: &mut TcpStream) -> std::io::Result<[u32; N]> {
    let mut words = [0u32; N];
    for word in &mut words {
        let mut raw = [0u8; 4];
        stream.read_exact(&mut raw)?;
        *word = u32::from_le_bytes(raw);
    }
    Ok(words)
}

fn configure(stream: &TcpStream, timeout: Option<Duration>) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}

/// A formed process group over TCP.
#[derive(Debug)]
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    /// At rank 0, one stream per peer ordered by rank (index `i` is rank `i + 1`).
    /// Elsewhere, the single stream to rank 0.
    streams: Vec<TcpStream>,
    closed: bool,
}

impl TcpProcessGroup {
    /// Joins the group as `rank` of `world_size`, blocking until it is formed.
    pub fn connect(
        rank: usize,
        world_size: usize,
        rendezvous: &Rendezvous,
    ) -> TrainingResult<Self> {
        if world_size == 0 {
            return Err(TrainingError::distributed("world_size must be >= 1"));
        }
        if rank >= world_size {
            return Err(TrainingError::distributed(format!(
                "rank {rank} is out of range for world_size {world_size}"
            )));
        }

        let streams = if rank == 0 {
            Self::accept_peers(world_size, rendezvous)?
        } else {
            vec![Self::join_master(rank, world_size, rendezvous)?]
        };

        info!(rank, world_size, address = %rendezvous.address(), "Process group formed");
        Ok(Self { rank, world_size, streams, closed: false })
    }

    fn accept_peers(world_size: usize, rendezvous: &Rendezvous) -> TrainingResult<Vec<TcpStream>> {
        if world_size == 1 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + rendezvous.rendezvous_timeout;
        let listener = Self::listen(&rendezvous.address(), deadline)?;
        listener.set_nonblocking(true)?;

        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;

        while joined < slots.len() {
            let mut stream = match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    stream
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TrainingError::distributed(format!(
                            "rendezvous timed out with {joined} of {} peers joined",
                            slots.len()
                        )));
                    }
                    std::thread::sleep(CONNECT_RETRY);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            configure(&stream, Some(rendezvous.rendezvous_timeout))?;
            let [magic, peer_rank, peer_world] = read_words::<3>(&mut stream)
                .map_err(|e| TrainingError::distributed(format!("bad handshake: {e}")))?;
            let (peer_rank, peer_world) = (peer_rank as usize, peer_world as usize);

            if magic != MAGIC {
                return Err(TrainingError::distributed("handshake magic mismatch"));
            }
            if peer_world != world_size {
                return Err(TrainingError::distributed(format!(
                    "rank {peer_rank} expects world_size {peer_world}, rank 0 has {world_size}"
                )));
            }
            if peer_rank == 0 || peer_rank >= world_size {
                return Err(TrainingError::distributed(format!(
                    "peer announced invalid rank {peer_rank}"
                )));
            }
            let slot = &mut slots[peer_rank - 1];
            if slot.is_some() {
                return Err(TrainingError::distributed(format!("duplicate rank {peer_rank}")));
            }

            write_words(&mut stream, &[MAGIC, world_size as u32])?;
            configure(&stream, rendezvous.collective_timeout)?;
            *slot = Some(stream);
            joined += 1;
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Binds the rendezvous address, waiting out another process that still
    /// holds the port until `deadline`.
    fn listen(address: &str, deadline: Instant) -> TrainingResult<TcpListener> {
        loop {
            match TcpListener::bind(address) {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == ErrorKind::AddrInUse && Instant::now() < deadline => {
                    debug!(%address, "Rendezvous port busy; retrying");
                    std::thread::sleep(CONNECT_RETRY);
                }
                Err(e) => {
                    return Err(TrainingError::distributed(format!(
                        "rank 0 failed to listen on {address}: {e}"
                    )));
                }
            }
        }
    }

    fn join_master(
        rank: usize,
        world_size: usize,
        rendezvous: &Rendezvous,
    ) -> TrainingResult<TcpStream> {
        let address = rendezvous.address();
        let deadline = Instant::now() + rendezvous.rendezvous_timeout;

        let mut stream = loop {
            match TcpStream::connect(&address) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(TrainingError::distributed(format!(
                            "rank {rank} could not reach {address}: {e}"
                        )));
                    }
                    std::thread::sleep(CONNECT_RETRY);
                }
            }
        };

        configure(&stream, Some(rendezvous.rendezvous_timeout))?;
        write_words(&mut stream, &[MAGIC, rank as u32, world_size as u32])?;
        let [magic, world] = read_words::<2>(&mut stream).map_err(|e| {
            TrainingError::distributed(format!("rank {rank} handshake rejected: {e}"))
        })?;
        if magic != MAGIC || world as usize != world_size {
            return Err(TrainingError::distributed(format!(
                "rank {rank} handshake mismatch with rank 0"
            )));
        }
        configure(&stream, rendezvous.collective_timeout)?;
        Ok(stream)
    }

    fn ensure_open(&self) -> TrainingResult<()> {
        if self.closed {
            return Err(TrainingError::distributed(format!(
                "rank {} used the process group after teardown",
                self.rank
            )));
        }
        Ok(())
    }

    fn peer_error(&self, peer: usize, e: &std::io::Error) -> TrainingError {
        TrainingError::distributed(format!("rank {} <-> rank {peer}: {e}", self.rank))
    }

    fn all_reduce<T: WireScalar>(&mut self, values: &mut [T]) -> TrainingResult<()> {
        self.ensure_open()?;
        if self.rank == 0 {
            for i in 0..self.streams.len() {
                let incoming = recv_values::<T>(&mut self.streams[i], values.len())
                    .map_err(|e| self.peer_error(i + 1, &e))?;
                for (acc, v) in values.iter_mut().zip(incoming) {
                    *acc += v;
                }
            }
            for i in 0..self.streams.len() {
                send_values(&mut self.streams[i], values).map_err(|e| self.peer_error(i + 1, &e))?;
            }
        } else {
            send_values(&mut self.streams[0], values).map_err(|e| self.peer_error(0, &e))?;
            let reduced = recv_values::<T>(&mut self.streams[0], values.len())
                .map_err(|e| self.peer_error(0, &e))?;
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }
}

impl Communicator for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum_f32(&mut self, values: &mut [f32]) -> TrainingResult<()> {
        self.all_reduce(values)
    }

    fn all_reduce_sum_f64(&mut self, values: &mut [f64]) -> TrainingResult<()> {
        self.all_reduce(values)
    }

    fn broadcast_f32(&mut self, values: &mut [f32]) -> TrainingResult<()> {
        self.ensure_open()?;
        if self.rank == 0 {
            for i in 0..self.streams.len() {
                send_values(&mut self.streams[i], values).map_err(|e| self.peer_error(i + 1, &e))?;
            }
        } else {
            let received = recv_values::<f32>(&mut self.streams[0], values.len())
                .map_err(|e| self.peer_error(0, &e))?;
            values.copy_from_slice(&received);
        }
        Ok(())
    }

    fn teardown(&mut self) -> TrainingResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for stream in self.streams.drain(..) {
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(rank = self.rank, "Process group torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn rendezvous() -> Rendezvous {
        Rendezvous {
            rendezvous_timeout: Duration::from_secs(10),
            collective_timeout: Some(Duration::from_secs(10)),
            ..Rendezvous::local(free_port().unwrap())
        }
    }

    fn spawn_ranks<T, F>(world: usize, rdv: &Rendezvous, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(TcpProcessGroup) -> T + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let rdv = rdv.clone();
                let f = f.clone();
                thread::spawn(move || f(TcpProcessGroup::connect(rank, world, &rdv).unwrap()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_all_reduce_sums_on_every_rank() {
        let results = spawn_ranks(3, &rendezvous(), |mut group| {
            let r = group.rank() as f32;
            let mut values = [r, 10.0 * r];
            group.all_reduce_sum_f32(&mut values).unwrap();
            group.barrier().unwrap();
            group.teardown().unwrap();
            values
        });
        for values in results {
            assert_eq!(values, [3.0, 30.0]);
        }
    }

    #[test]
    fn test_broadcast_copies_rank_zero() {
        let results = spawn_ranks(2, &rendezvous(), |mut group| {
            let mut values = if group.rank() == 0 { vec![1.5, -2.0] } else { vec![0.0, 0.0] };
            group.broadcast_f32(&mut values).unwrap();
            values
        });
        assert_eq!(results, vec![vec![1.5, -2.0], vec![1.5, -2.0]]);
    }

    #[test]
    fn test_single_rank_group_needs_no_peers() {
        let mut group = TcpProcessGroup::connect(0, 1, &rendezvous()).unwrap();
        let mut values = [2.0f64];
        group.all_reduce_sum_f64(&mut values).unwrap();
        assert_eq!(values, [2.0]);
        group.teardown().unwrap();
        group.teardown().unwrap();
        assert!(group.barrier().is_err());
    }

    #[test]
    fn test_invalid_rank_is_rejected() {
        let err = TcpProcessGroup::connect(2, 2, &rendezvous()).unwrap_err();
        assert!(matches!(err, TrainingError::Distributed(_)));
        assert!(TcpProcessGroup::connect(0, 0, &rendezvous()).is_err());
    }

    #[test]
    fn test_unreachable_master_times_out() {
        let rdv = Rendezvous { rendezvous_timeout: Duration::from_millis(200), ..rendezvous() };
        let err = TcpProcessGroup::connect(1, 2, &rdv).unwrap_err();
        assert!(matches!(err, TrainingError::Distributed(msg) if msg.contains("could not reach")));
    }

    #[test]
    fn test_rank_zero_waits_for_busy_port() {
        let rdv = rendezvous();
        let squatter = TcpListener::bind(rdv.address()).unwrap();
        let master = {
            let rdv = rdv.clone();
            thread::spawn(move || TcpProcessGroup::connect(0, 2, &rdv).map(|g| g.world_size()))
        };
        thread::sleep(Duration::from_millis(300));
        drop(squatter);

        let peer = TcpProcessGroup::connect(1, 2, &rdv).unwrap();
        assert_eq!(peer.world_size(), 2);
        assert_eq!(master.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn test_port_held_past_deadline_fails() {
        let rdv = Rendezvous { rendezvous_timeout: Duration::from_millis(200), ..rendezvous() };
        let _squatter = TcpListener::bind(rdv.address()).unwrap();
        let err = TcpProcessGroup::connect(0, 2, &rdv).unwrap_err();
        assert!(matches!(err, TrainingError::Distributed(msg) if msg.contains("failed to listen")));
    }

    #[test]
    fn test_world_size_mismatch_fails_rendezvous() {
        let rdv = rendezvous();
        let master = {
            let rdv = rdv.clone();
            thread::spawn(move || TcpProcessGroup::connect(0, 2, &rdv).map(|_| ()))
        };
        let peer = TcpProcessGroup::connect(1, 3, &rdv);
        assert!(peer.is_err());
        assert!(master.join().unwrap().is_err());
    }
}
