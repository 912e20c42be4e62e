//! Wire protocol
//!
//! Every frame on the command channel is `{u32 length, u8 op, payload}` with
//! `length = 1 + payload.len()`, all integers little-endian. Requests carry
//! the fixed layouts below; ACK frames carry a `u32` status followed by a
//! bincode-encoded [`AckData`] describing transfer targets or query results.
//!
//! | op | payload |
//! |----|---------|
//! | WRITE  | `block_size:u32, n:u32, n x {key_len:u16, key, tensor_off:u64}, mode:u8` |
//! | READ   | same shape as WRITE |
//! | CHECK  | `key_len:u16, key` |
//! | MATCH  | `n:u32, n x {key_len:u16, key}` |
//! | ACK    | `status:u32, data` |
//! | COMMIT | empty |
//! | STAGE  | empty |

use crate::error::{Error, Result};
use crate::gpu::IpcHandle;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Keys are opaque UTF-8, at most this many bytes.
pub const MAX_KEY_BYTES: usize = 128;

/// Upper bound on a frame's length field; anything larger is malformed.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Write = 1,
    Read = 2,
    Check = 3,
    Match = 4,
    Ack = 5,
    Commit = 6,
    Stage = 7,
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => OpCode::Write,
            2 => OpCode::Read,
            3 => OpCode::Check,
            4 => OpCode::Match,
            5 => OpCode::Ack,
            6 => OpCode::Commit,
            7 => OpCode::Stage,
            other => return Err(Error::Protocol(format!("unknown op {other}"))),
        })
    }
}

/// How a batch's bytes move.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferMode {
    /// Client copies through the slab's IPC mapping.
    LocalGpu = 0,
    /// Client posts one-sided verbs against the slabs.
    Rdma = 1,
    /// BAR1-limited: verbs target the pinned staging ring.
    RdmaStaged = 2,
}

impl TryFrom<u8> for TransferMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => TransferMode::LocalGpu,
            1 => TransferMode::Rdma,
            2 => TransferMode::RdmaStaged,
            other => return Err(Error::Protocol(format!("unknown transfer mode {other}"))),
        })
    }
}

/// One `(key, tensor offset)` pair of a batch. The offset indexes into the
/// client tensor, not any server-side layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub key: String,
    pub tensor_off: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRequest {
    pub block_size: u32,
    pub blocks: Vec<BlockRef>,
    pub mode: TransferMode,
}

/// A decoded client request frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Write(BatchRequest),
    Read(BatchRequest),
    Check(String),
    Match(Vec<String>),
    /// Request the next window grant of the in-flight staged op.
    Stage,
    /// Client-side transfer of the in-flight op finished.
    Commit,
}

impl Command {
    pub fn op(&self) -> OpCode {
        match self {
            Command::Write(_) => OpCode::Write,
            Command::Read(_) => OpCode::Read,
            Command::Check(_) => OpCode::Check,
            Command::Match(_) => OpCode::Match,
            Command::Stage => OpCode::Stage,
            Command::Commit => OpCode::Commit,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Command::Write(batch) | Command::Read(batch) => {
                buf.put_u32_le(batch.block_size);
                buf.put_u32_le(batch.blocks.len() as u32);
                for block in &batch.blocks {
                    put_key(&mut buf, &block.key);
                    buf.put_u64_le(block.tensor_off);
                }
                buf.put_u8(batch.mode as u8);
            }
            Command::Check(key) => put_key(&mut buf, key),
            Command::Match(keys) => {
                buf.put_u32_le(keys.len() as u32);
                for key in keys {
                    put_key(&mut buf, key);
                }
            }
            Command::Stage | Command::Commit => {}
        }
        buf
    }

    pub fn decode(op: OpCode, mut payload: Bytes) -> Result<Command> {
        let cmd = match op {
            OpCode::Write => Command::Write(decode_batch(&mut payload)?),
            OpCode::Read => Command::Read(decode_batch(&mut payload)?),
            OpCode::Check => Command::Check(take_key(&mut payload)?),
            OpCode::Match => {
                let n = take_u32(&mut payload)? as usize;
                let mut keys = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    keys.push(take_key(&mut payload)?);
                }
                Command::Match(keys)
            }
            OpCode::Stage => Command::Stage,
            OpCode::Commit => Command::Commit,
            OpCode::Ack => return Err(Error::Protocol("unexpected ACK from client".into())),
        };
        if payload.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {op:?} payload",
                payload.remaining()
            )));
        }
        Ok(cmd)
    }
}

fn decode_batch(payload: &mut Bytes) -> Result<BatchRequest> {
    let block_size = take_u32(payload)?;
    let n = take_u32(payload)? as usize;
    let mut blocks = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        let key = take_key(payload)?;
        let tensor_off = take_u64(payload)?;
        blocks.push(BlockRef { key, tensor_off });
    }
    let mode = TransferMode::try_from(take_u8(payload)?)?;
    Ok(BatchRequest { block_size, blocks, mode })
}

/// A LOCAL_GPU transfer target: the client maps the slab through the handle
/// and copies at `offset`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IpcTarget {
    pub handle: IpcHandle,
    pub offset: u64,
    pub len: u32,
}

/// An RDMA transfer target for one-sided verbs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RdmaTarget {
    pub raddr: u64,
    pub rkey: u32,
    pub len: u32,
}

/// The variable part of an ACK frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AckData {
    None,
    /// Per-extent IPC targets, in extent-list order.
    LocalGpu(Vec<IpcTarget>),
    /// Per-extent verb targets, in extent-list order.
    Rdma(Vec<RdmaTarget>),
    /// The op runs staged; drive it with STAGE/COMMIT per chunk.
    Staged { window_bytes: u32 },
    /// Grant of one staging window for the next chunk.
    WindowReady { raddr: u64, rkey: u32, len: u32 },
    Exists(bool),
    MatchIndex(i32),
}

#[derive(Clone, Debug)]
pub struct Ack {
    pub status: u32,
    pub data: AckData,
}

impl Ack {
    pub fn ok(data: AckData) -> Self {
        Self { status: crate::error::status::OK, data }
    }

    pub fn failure(err: &Error) -> Self {
        Self { status: err.status(), data: AckData::None }
    }

    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.status);
        let data = bincode::serialize(&self.data)
            .map_err(|e| Error::Protocol(format!("ack encode: {e}")))?;
        buf.put_slice(&data);
        Ok(buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Ack> {
        let status = take_u32(&mut payload)?;
        let data = bincode::deserialize(&payload)
            .map_err(|e| Error::Protocol(format!("ack decode: {e}")))?;
        Ok(Ack { status, data })
    }
}

fn put_key(buf: &mut BytesMut, key: &str) {
    buf.put_u16_le(key.len() as u16);
    buf.put_slice(key.as_bytes());
}

fn take_u8(payload: &mut Bytes) -> Result<u8> {
    ensure(payload, 1)?;
    Ok(payload.get_u8())
}

fn take_u32(payload: &mut Bytes) -> Result<u32> {
    ensure(payload, 4)?;
    Ok(payload.get_u32_le())
}

fn take_u64(payload: &mut Bytes) -> Result<u64> {
    ensure(payload, 8)?;
    Ok(payload.get_u64_le())
}

fn take_key(payload: &mut Bytes) -> Result<String> {
    ensure(payload, 2)?;
    let len = payload.get_u16_le() as usize;
    ensure(payload, len)?;
    let raw = payload.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("key is not UTF-8".into()))
}

fn ensure(payload: &Bytes, need: usize) -> Result<()> {
    if payload.remaining() < need {
        return Err(Error::Protocol(format!(
            "truncated payload: need {need}, have {}",
            payload.remaining()
        )));
    }
    Ok(())
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    op: OpCode,
    payload: &[u8],
) -> Result<()> {
    let len = 1 + payload.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut head = [0u8; 5];
    head[..4].copy_from_slice(&len.to_le_bytes());
    head[4] = op as u8;
    writer.write_all(&head).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` is a clean close at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(OpCode, Bytes)>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!("bad frame length {len}")));
    }
    let op = OpCode::try_from(reader.read_u8().await?)?;
    let mut payload = vec![0u8; len as usize - 1];
    reader.read_exact(&mut payload).await?;
    Ok(Some((op, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_request_layout_is_stable() {
        let cmd = Command::Write(BatchRequest {
            block_size: 4096,
            blocks: vec![BlockRef { key: "k1".into(), tensor_off: 512 }],
            mode: TransferMode::Rdma,
        });
        let bytes = cmd.encode();
        // block_size, n, key_len, key, tensor_off, mode
        let mut expect = Vec::new();
        expect.extend_from_slice(&4096u32.to_le_bytes());
        expect.extend_from_slice(&1u32.to_le_bytes());
        expect.extend_from_slice(&2u16.to_le_bytes());
        expect.extend_from_slice(b"k1");
        expect.extend_from_slice(&512u64.to_le_bytes());
        expect.push(1);
        assert_eq!(&bytes[..], &expect[..]);

        let decoded = Command::decode(OpCode::Write, bytes.freeze()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn malformed_payloads_are_protocol_errors() {
        let truncated = Bytes::from_static(&[0x01, 0x00]);
        assert!(matches!(
            Command::decode(OpCode::Match, truncated),
            Err(Error::Protocol(_))
        ));

        let mut trailing = Command::Check("k".into()).encode();
        trailing.put_u8(0xff);
        assert!(matches!(
            Command::decode(OpCode::Check, trailing.freeze()),
            Err(Error::Protocol(_))
        ));

        assert!(OpCode::try_from(0x2a).is_err());
    }

    #[tokio::test]
    async fn frame_round_trip_and_clean_eof() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let cmd = Command::Match(vec!["k1".into(), "k2".into()]);
        write_frame(&mut a, cmd.op(), &cmd.encode()).await.unwrap();
        drop(a);

        let (op, payload) = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(op, OpCode::Match);
        assert_eq!(Command::decode(op, payload).unwrap(), cmd);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}
