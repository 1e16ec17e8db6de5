//! Star-topology process group over TCP
//!
//! Rank 0 accepts one connection per subordinate on each of two channels:
//! the host channel carries CBOR objects (configs, step metadata) and the
//! device channel carries raw tensor payloads. Every collective is rooted at
//! rank 0, so the role of each rank follows from its rank alone.

use super::rendezvous::Rendezvous;
use super::wire::{read_object, read_payload_into, write_encoded, write_object, write_payload};
use crate::errors::{AgentError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RETRY_INTERVAL: Duration = Duration::from_millis(20);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Object channel (CBOR frames)
    Host,
    /// Payload channel (raw byte frames)
    Device,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    group_id: Uuid,
    rank: usize,
    world_size: usize,
    channel: ChannelKind,
}

#[derive(Debug, Serialize, Deserialize)]
enum HelloReply {
    Accepted,
    Rejected(String),
}

fn group_io(op: &str, kind: ChannelKind, peer: usize, e: io::Error) -> AgentError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
            AgentError::Group(format!("{} on {:?} channel: rank {} hung up", op, kind, peer))
        }
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            AgentError::Group(format!("{} on {:?} channel: rank {} timed out", op, kind, peer))
        }
        _ => AgentError::Group(format!("{} on {:?} channel with rank {}: {}", op, kind, peer, e)),
    }
}

/// Deadline for `timeout` from now, `None` when it is too far out to represent.
pub(crate) fn deadline(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// One side of a channel.
#[derive(Debug)]
pub enum Channel {
    /// Rank 0: streams to ranks 1..world_size, in rank order
    Leader(Vec<TcpStream>),
    /// Subordinate: the stream to rank 0
    Follower(TcpStream),
}

impl Channel {
    /// Send `value` from rank 0 to every rank; every rank returns the value.
    pub fn broadcast_object<T>(&mut self, kind: ChannelKind, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match self {
            Channel::Leader(streams) => {
                let value = value.ok_or_else(|| {
                    AgentError::InvalidState("rank 0 must supply the broadcast value".into())
                })?;
                for (i, stream) in streams.iter_mut().enumerate() {
                    write_object(stream, &value).map_err(|e| group_io("broadcast", kind, i + 1, e))?;
                }
                Ok(value)
            }
            Channel::Follower(stream) => {
                read_object(stream).map_err(|e| group_io("broadcast", kind, 0, e))
            }
        }
    }

    /// Send an already encoded object frame from rank 0 to every subordinate.
    pub fn broadcast_encoded(&mut self, kind: ChannelKind, body: &[u8]) -> Result<()> {
        match self {
            Channel::Leader(streams) => {
                for (i, stream) in streams.iter_mut().enumerate() {
                    write_encoded(stream, body).map_err(|e| group_io("broadcast", kind, i + 1, e))?;
                }
                Ok(())
            }
            Channel::Follower(_) => Err(AgentError::InvalidState(
                "only rank 0 can send an encoded broadcast".into(),
            )),
        }
    }

    /// Collect every rank's `value` on rank 0, ordered by rank.
    ///
    /// Returns `Some` on rank 0 and `None` elsewhere.
    pub fn gather_object<T>(&mut self, kind: ChannelKind, value: T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        match self {
            Channel::Leader(streams) => {
                let mut gathered = Vec::with_capacity(streams.len() + 1);
                gathered.push(value);
                for (i, stream) in streams.iter_mut().enumerate() {
                    let item = read_object(stream).map_err(|e| group_io("gather", kind, i + 1, e))?;
                    gathered.push(item);
                }
                Ok(Some(gathered))
            }
            Channel::Follower(stream) => {
                write_object(stream, &value).map_err(|e| group_io("gather", kind, 0, e))?;
                Ok(None)
            }
        }
    }

    /// Rank 0 sends `buf`; every other rank fills its pre-sized `buf`.
    pub fn broadcast_payload(&mut self, kind: ChannelKind, buf: &mut [u8]) -> Result<()> {
        match self {
            Channel::Leader(streams) => {
                for (i, stream) in streams.iter_mut().enumerate() {
                    write_payload(stream, buf).map_err(|e| group_io("payload", kind, i + 1, e))?;
                }
                Ok(())
            }
            Channel::Follower(stream) => {
                read_payload_into(stream, buf).map_err(|e| group_io("payload", kind, 0, e))
            }
        }
    }

    fn shutdown(&self) {
        match self {
            Channel::Leader(streams) => {
                for stream in streams {
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
            Channel::Follower(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

/// Communication group joined by every rank of one fleet.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    host: Option<Channel>,
    device: Option<Channel>,
}

impl ProcessGroup {
    /// Group of one; every collective is local.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            host: Some(Channel::Leader(Vec::new())),
            device: Some(Channel::Leader(Vec::new())),
        }
    }

    /// Join the group at `rdzv`: rank 0 binds and accepts, others connect.
    pub fn init(rdzv: &Rendezvous, rank: usize, world_size: usize, timeout: Duration) -> Result<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(rdzv.socket_addr()?)?;
            Self::init_leader(listener, rdzv.group_id, world_size, timeout)
        } else {
            Self::connect(rdzv, rank, world_size, timeout)
        }
    }

    /// Rank 0: accept both channels of every subordinate on a bound listener.
    pub fn init_leader(
        listener: TcpListener,
        group_id: Uuid,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Self::init_leader_until(listener, group_id, world_size, timeout, &|| false)
    }

    /// Like [`ProcessGroup::init_leader`], giving up early once `cancelled` returns true.
    pub fn init_leader_until(
        listener: TcpListener,
        group_id: Uuid,
        world_size: usize,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Self> {
        if world_size <= 1 {
            return Ok(Self::solo());
        }

        let peers = world_size - 1;
        let mut host: Vec<Option<TcpStream>> = (0..peers).map(|_| None).collect();
        let mut device: Vec<Option<TcpStream>> = (0..peers).map(|_| None).collect();
        let mut joined = 0usize;
        let deadline = deadline(timeout);

        listener.set_nonblocking(true)?;
        while joined < 2 * peers {
            match listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
                    let hello: Hello = match read_object(&mut stream) {
                        Ok(hello) => hello,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "Dropping connection without handshake");
                            continue;
                        }
                    };

                    let slots = match hello.channel {
                        ChannelKind::Host => &mut host,
                        ChannelKind::Device => &mut device,
                    };
                    let rejection = if hello.group_id != group_id {
                        Some("group id mismatch".to_string())
                    } else if hello.world_size != world_size {
                        Some(format!(
                            "world size {} does not match {}",
                            hello.world_size, world_size
                        ))
                    } else if hello.rank == 0 || hello.rank >= world_size {
                        Some(format!("rank {} out of range", hello.rank))
                    } else if slots[hello.rank - 1].is_some() {
                        Some(format!("rank {} already joined {:?}", hello.rank, hello.channel))
                    } else {
                        None
                    };

                    if let Some(reason) = rejection {
                        warn!(peer = %peer_addr, rank = hello.rank, %reason, "Rejecting group member");
                        let _ = write_object(&mut stream, &HelloReply::Rejected(reason));
                        continue;
                    }

                    write_object(&mut stream, &HelloReply::Accepted)?;
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_nodelay(true)?;
                    debug!(rank = hello.rank, channel = ?hello.channel, "Group member joined");
                    slots[hello.rank - 1] = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if cancelled() {
                        return Err(AgentError::Group(
                            "Group formation cancelled: a subordinate exited".into(),
                        ));
                    }
                    if expired(deadline) {
                        return Err(AgentError::Group(format!(
                            "Timed out waiting for {} of {} group connections",
                            2 * peers - joined,
                            2 * peers
                        )));
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(world_size, "Process group formed");
        Ok(Self {
            rank: 0,
            world_size,
            host: Some(Channel::Leader(host.into_iter().flatten().collect())),
            device: Some(Channel::Leader(device.into_iter().flatten().collect())),
        })
    }

    /// Subordinate: open both channels to rank 0, retrying until the deadline.
    pub fn connect(rdzv: &Rendezvous, rank: usize, world_size: usize, timeout: Duration) -> Result<Self> {
        if rank == 0 || rank >= world_size {
            return Err(AgentError::Group(format!(
                "rank {} cannot join a group of {} as a subordinate",
                rank, world_size
            )));
        }
        let addr = rdzv.socket_addr()?;
        let deadline = deadline(timeout);

        let open = |channel: ChannelKind| -> Result<TcpStream> {
            let mut stream = loop {
                match TcpStream::connect(addr) {
                    Ok(stream) => break stream,
                    Err(e) => {
                        if expired(deadline) {
                            return Err(AgentError::Group(format!(
                                "rank {} could not reach {}: {}",
                                rank, addr, e
                            )));
                        }
                        std::thread::sleep(RETRY_INTERVAL);
                    }
                }
            };
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
            write_object(
                &mut stream,
                &Hello {
                    group_id: rdzv.group_id,
                    rank,
                    world_size,
                    channel,
                },
            )?;
            match read_object(&mut stream).map_err(|e| group_io("handshake", channel, 0, e))? {
                HelloReply::Accepted => {}
                HelloReply::Rejected(reason) => {
                    return Err(AgentError::Group(format!(
                        "rank {} rejected by rank 0: {}",
                        rank, reason
                    )))
                }
            }
            stream.set_read_timeout(Some(timeout))?;
            Ok(stream)
        };

        let host = open(ChannelKind::Host)?;
        let device = open(ChannelKind::Device)?;
        debug!(rank, world_size, "Joined process group");

        Ok(Self {
            rank,
            world_size,
            host: Some(Channel::Follower(host)),
            device: Some(Channel::Follower(device)),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    pub fn is_destroyed(&self) -> bool {
        self.host.is_none()
    }

    fn channel(&mut self, kind: ChannelKind) -> Result<&mut Channel> {
        let slot = match kind {
            ChannelKind::Host => &mut self.host,
            ChannelKind::Device => &mut self.device,
        };
        slot.as_mut()
            .ok_or_else(|| AgentError::Group("process group destroyed".into()))
    }

    /// Broadcast a CBOR object from rank 0 over the host channel.
    pub fn broadcast_object<T>(&mut self, value: Option<T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.channel(ChannelKind::Host)?
            .broadcast_object(ChannelKind::Host, value)
    }

    /// Send a frame body from [`encode_object`](super::wire::encode_object)
    /// over the host channel. Receivers use [`ProcessGroup::broadcast_object`].
    pub fn broadcast_encoded(&mut self, body: &[u8]) -> Result<()> {
        self.channel(ChannelKind::Host)?
            .broadcast_encoded(ChannelKind::Host, body)
    }

    /// Gather a CBOR object from every rank onto rank 0 over the host channel.
    pub fn gather_object<T>(&mut self, value: T) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.channel(ChannelKind::Host)?
            .gather_object(ChannelKind::Host, value)
    }

    /// Broadcast raw bytes from rank 0 over the device channel.
    pub fn broadcast_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.channel(ChannelKind::Device)?
            .broadcast_payload(ChannelKind::Device, buf)
    }

    /// Shut every stream down. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let host = self.host.take();
        let device = self.device.take();
        if host.is_none() && device.is_none() {
            return;
        }
        for channel in host.iter().chain(device.iter()) {
            channel.shutdown();
        }
        debug!(rank = self.rank, "Process group destroyed");
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.destroy();
    }
}
