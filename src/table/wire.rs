use std::fmt;

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use chrono::Utc;

use crate::{error::WireError, group::GroupDigest};

/// Largest frame a stream transport will accept. A row of 64k columns fits.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + 12 + 8 * 65_536;

// kind | round | digest | from | sent_at
const HEADER_LEN: usize = 1 + 8 + 32 + 4 + 8;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A member's row for the round
    Row = 1,
    /// The sender abandoned the round
    Abort = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Row),
            2 => Ok(FrameKind::Abort),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Why a member gave up on a round.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    PublishFailed = 1,
    Cancelled = 2,
    TimedOut = 3,
}

impl TryFrom<u8> for AbortReason {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AbortReason::PublishFailed),
            2 => Ok(AbortReason::Cancelled),
            3 => Ok(AbortReason::TimedOut),
            other => Err(WireError::UnknownAbortReason(other)),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::PublishFailed => write!(f, "publish failed"),
            AbortReason::Cancelled => write!(f, "cancelled"),
            AbortReason::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    Row { generation: u64, values: Vec<f64> },
    Abort(AbortReason),
}

/// One message between the replicas of a round's table.
///
/// Layout, all little endian:
///
/// - header: `kind u8 | round u64 | digest [u8; 32] | from u32 | sent_at i64`
/// - row: `generation u64 | count u32 | count * f64`
/// - abort: `reason u8`
///
/// `from` is the sender's member id and `sent_at` is microseconds since the
/// unix epoch, used only for tracing publish latency.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub round: u64,
    pub digest: GroupDigest,
    pub from: u32,
    pub sent_at: i64,
    pub body: FrameBody,
}

impl Frame {
    pub fn row(
        round: u64,
        digest: GroupDigest,
        from: u32,
        generation: u64,
        values: Vec<f64>,
    ) -> Self {
        Self {
            round,
            digest,
            from,
            sent_at: Utc::now().timestamp_micros(),
            body: FrameBody::Row { generation, values },
        }
    }

    pub fn abort(
        round: u64,
        digest: GroupDigest,
        from: u32,
        reason: AbortReason,
    ) -> Self {
        Self {
            round,
            digest,
            from,
            sent_at: Utc::now().timestamp_micros(),
            body: FrameBody::Abort(reason),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::Row { .. } => FrameKind::Row,
            FrameBody::Abort(_) => FrameKind::Abort,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match &self.body {
                FrameBody::Row { values, .. } => 8 + 4 + 8 * values.len(),
                FrameBody::Abort(_) => 1,
            }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0] = self.kind() as u8;
        LittleEndian::write_u64(&mut buf[1..9], self.round);
        buf[9..41].copy_from_slice(self.digest.as_bytes());
        LittleEndian::write_u32(&mut buf[41..45], self.from);
        LittleEndian::write_i64(&mut buf[45..53], self.sent_at);
        match &self.body {
            FrameBody::Row { generation, values } => {
                LittleEndian::write_u64(&mut buf[53..61], *generation);
                LittleEndian::write_u32(&mut buf[61..65], values.len() as u32);
                LittleEndian::write_f64_into(values, &mut buf[65..]);
            }
            FrameBody::Abort(reason) => buf[53] = *reason as u8,
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need(buf, HEADER_LEN)?;
        let kind = FrameKind::try_from(buf[0])?;
        let round = LittleEndian::read_u64(&buf[1..9]);
        let digest = GroupDigest(*array_ref![buf, 9, 32]);
        let from = LittleEndian::read_u32(&buf[41..45]);
        let sent_at = LittleEndian::read_i64(&buf[45..53]);
        let rest = &buf[HEADER_LEN..];

        let (body, used) = match kind {
            FrameKind::Row => {
                need(rest, 12)?;
                let generation = LittleEndian::read_u64(&rest[0..8]);
                let count = LittleEndian::read_u32(&rest[8..12]) as usize;
                let end = count
                    .checked_mul(8)
                    .and_then(|n| n.checked_add(12))
                    .ok_or(WireError::FrameTooLarge(usize::MAX))?;
                need(rest, end)?;
                let mut values = vec![0f64; count];
                LittleEndian::read_f64_into(&rest[12..end], &mut values);
                (FrameBody::Row { generation, values }, end)
            }
            FrameKind::Abort => {
                need(rest, 1)?;
                (FrameBody::Abort(AbortReason::try_from(rest[0])?), 1)
            }
        };

        if rest.len() > used {
            Err(WireError::TrailingBytes(rest.len() - used))?
        }

        Ok(Self {
            round,
            digest,
            from,
            sent_at,
            body,
        })
    }

    /// Encodes the frame behind a `u32` length prefix for stream transports.
    pub fn encode_prefixed(&self) -> Vec<u8> {
        let msg = self.encode();
        let mut buf = Vec::with_capacity(4 + msg.len());
        buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        buf.extend_from_slice(&msg);
        buf
    }
}

fn need(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        Err(WireError::Truncated {
            needed,
            had: buf.len(),
        })
    } else {
        Ok(())
    }
}
