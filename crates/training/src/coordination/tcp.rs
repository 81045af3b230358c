use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};

use super::ProcessGroup;
use crate::TrainingError;

const MSG_HELLO: u32 = 1;
const MSG_BARRIER: u32 = 2;
const MSG_RELEASE: u32 = 3;
const MSG_REDUCE: u32 = 4;
const MSG_RESULT: u32 = 5;
const MSG_SHUTDOWN: u32 = 6;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Star-topology group over TCP: rank 0 accepts one stream per follower and
/// drives every collective.
pub struct TcpGroup {
    rank: usize,
    world_size: usize,
    role: Role,
    torn_down: bool,
}

enum Role {
    /// Follower streams indexed by `rank - 1`.
    Leader(Vec<TcpStream>),
    Follower(TcpStream),
}

impl TcpGroup {
    pub fn connect(rank: usize, world_size: usize, addr: &str) -> Result<Self, TrainingError> {
        if rank >= world_size {
            return Err(TrainingError::coordination(format!(
                "rank {rank} is outside world size {world_size}"
            )));
        }
        let role = if rank == 0 {
            Role::Leader(accept_followers(addr, world_size)?)
        } else {
            Role::Follower(connect_to_leader(addr, rank)?)
        };
        info!("rank {rank} of {world_size} joined worker group at {addr}");
        Ok(Self {
            rank,
            world_size,
            role,
            torn_down: false,
        })
    }

    fn ensure_live(&self) -> Result<(), TrainingError> {
        if self.torn_down {
            return Err(TrainingError::coordination("collective called after teardown"));
        }
        Ok(())
    }
}

fn accept_followers(addr: &str, world_size: usize) -> Result<Vec<TcpStream>, TrainingError> {
    let listener = TcpListener::bind(addr)
        .map_err(|err| TrainingError::coordination(format!("bind {addr}: {err}")))?;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    for _ in 1..world_size {
        let (mut stream, peer) = listener
            .accept()
            .map_err(|err| TrainingError::coordination(format!("accept on {addr}: {err}")))?;
        stream.set_nodelay(true)?;
        let (kind, payload) = recv_frame(&mut stream)?;
        if kind != MSG_HELLO || payload.len() != 1 {
            return Err(TrainingError::coordination(format!(
                "unexpected handshake from {peer}"
            )));
        }
        let rank = payload[0] as usize;
        let slot = rank
            .checked_sub(1)
            .and_then(|index| slots.get_mut(index))
            .ok_or_else(|| {
                TrainingError::coordination(format!("peer {peer} announced invalid rank {rank}"))
            })?;
        if slot.is_some() {
            return Err(TrainingError::coordination(format!(
                "rank {rank} joined the group twice"
            )));
        }
        debug!("rank {rank} connected from {peer}");
        *slot = Some(stream);
    }
    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_leader(addr: &str, rank: usize) -> Result<TcpStream, TrainingError> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(err) if Instant::now() < deadline => {
                debug!("rank {rank} waiting for leader at {addr}: {err}");
                thread::sleep(CONNECT_RETRY);
            }
            Err(err) => {
                return Err(TrainingError::coordination(format!(
                    "rank {rank} could not reach leader at {addr}: {err}"
                )))
            }
        }
    };
    stream.set_nodelay(true)?;
    send_frame(&mut stream, MSG_HELLO, &[rank as f32])?;
    Ok(stream)
}

/// `kind: u32 LE`, `len: u64 LE`, then `len` floats in host byte order.
const HEADER_LEN: usize = 12;

fn send_frame<W: Write>(stream: &mut W, kind: u32, data: &[f32]) -> Result<(), TrainingError> {
    let payload: &[u8] = bytemuck::cast_slice(data);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(kind);
    buf.put_u64_le(data.len() as u64);
    buf.put_slice(payload);
    stream
        .write_all(&buf)
        .and_then(|_| stream.flush())
        .map_err(|err| TrainingError::coordination(format!("send to peer: {err}")))
}

fn recv_frame<R: Read>(stream: &mut R) -> Result<(u32, Vec<f32>), TrainingError> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .map_err(|err| TrainingError::coordination(format!("receive from peer: {err}")))?;
    let mut header = &header[..];
    let kind = header.get_u32_le();
    let len = usize::try_from(header.get_u64_le())
        .ok()
        .and_then(|len| len.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| TrainingError::coordination("peer sent an oversized frame"))?;

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .map_err(|err| TrainingError::coordination(format!("receive from peer: {err}")))?;
    Ok((kind, bytemuck::pod_collect_to_vec::<u8, f32>(&payload)))
}

fn expect_frame(stream: &mut TcpStream, expected: u32) -> Result<Vec<f32>, TrainingError> {
    let (kind, data) = recv_frame(stream)?;
    if kind != expected {
        return Err(TrainingError::coordination(format!(
            "expected message {expected}, received {kind}; workers disagree on collective order"
        )));
    }
    Ok(data)
}

impl ProcessGroup for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&mut self) -> Result<(), TrainingError> {
        self.ensure_live()?;
        match &mut self.role {
            Role::Leader(followers) => {
                for stream in followers.iter_mut() {
                    expect_frame(stream, MSG_BARRIER)?;
                }
                for stream in followers.iter_mut() {
                    send_frame(stream, MSG_RELEASE, &[])?;
                }
            }
            Role::Follower(stream) => {
                send_frame(stream, MSG_BARRIER, &[])?;
                expect_frame(stream, MSG_RELEASE)?;
            }
        }
        Ok(())
    }

    fn all_reduce_mean(&mut self, data: &mut [f32]) -> Result<(), TrainingError> {
        self.ensure_live()?;
        let world_size = self.world_size;
        match &mut self.role {
            Role::Leader(followers) => {
                let mut total = data.to_vec();
                for stream in followers.iter_mut() {
                    let part = expect_frame(stream, MSG_REDUCE)?;
                    if part.len() != total.len() {
                        return Err(TrainingError::coordination(format!(
                            "collective length mismatch ({} vs {})",
                            total.len(),
                            part.len()
                        )));
                    }
                    for (acc, value) in total.iter_mut().zip(part) {
                        *acc += value;
                    }
                }
                let scale = 1.0 / world_size as f32;
                for value in &mut total {
                    *value *= scale;
                }
                for stream in followers.iter_mut() {
                    send_frame(stream, MSG_RESULT, &total)?;
                }
                data.copy_from_slice(&total);
            }
            Role::Follower(stream) => {
                send_frame(stream, MSG_REDUCE, data)?;
                let result = expect_frame(stream, MSG_RESULT)?;
                if result.len() != data.len() {
                    return Err(TrainingError::coordination(
                        "collective returned a buffer of unexpected length",
                    ));
                }
                data.copy_from_slice(&result);
            }
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TrainingError> {
        if self.torn_down {
            return Ok(());
        }
        match &mut self.role {
            Role::Leader(followers) => {
                for stream in followers.iter_mut() {
                    expect_frame(stream, MSG_SHUTDOWN)?;
                }
                for stream in followers.iter_mut() {
                    send_frame(stream, MSG_SHUTDOWN, &[])?;
                }
            }
            Role::Follower(stream) => {
                send_frame(stream, MSG_SHUTDOWN, &[])?;
                expect_frame(stream, MSG_SHUTDOWN)?;
            }
        }
        self.torn_down = true;
        debug!("rank {} left the worker group", self.rank);
        Ok(())
    }
}
