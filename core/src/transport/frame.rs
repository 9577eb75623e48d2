// Multi-part wire framing
//
// kind: u8 | parts: u32 | (len: u32 | bytes)*   (big endian)
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::{KernelError, Result};

/// Largest accepted part.
pub const MAX_PART_LEN: usize = 16 * 1024 * 1024;
/// Largest accepted part count.
pub const MAX_PARTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Topic-tagged data message.
    Message = 1,
    /// Subscriber asks for a topic prefix.
    Subscribe = 2,
    Unsubscribe = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = KernelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Message),
            2 => Ok(FrameKind::Subscribe),
            3 => Ok(FrameKind::Unsubscribe),
            other => Err(KernelError::MalformedEnvelope(format!(
                "unknown frame kind {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub parts: Vec<Vec<u8>>,
}

impl Frame {
    pub fn message(parts: Vec<Vec<u8>>) -> Self {
        Self {
            kind: FrameKind::Message,
            parts,
        }
    }

    pub fn subscribe(topic: &[u8]) -> Self {
        Self {
            kind: FrameKind::Subscribe,
            parts: vec![topic.to_vec()],
        }
    }

    pub fn unsubscribe(topic: &[u8]) -> Self {
        Self {
            kind: FrameKind::Unsubscribe,
            parts: vec![topic.to_vec()],
        }
    }

    /// First part of a message, or the topic of a (un)subscription.
    pub fn topic(&self) -> &[u8] {
        self.parts.first().map(Vec::as_slice).unwrap_or_default()
    }

    /// Fails when a reader would refuse the frame.
    pub fn check(&self) -> Result<()> {
        if self.parts.len() > MAX_PARTS {
            return Err(KernelError::MalformedEnvelope(format!(
                "{} parts exceed the limit of {MAX_PARTS}",
                self.parts.len()
            )));
        }
        match self.parts.iter().map(Vec::len).max() {
            Some(size) if size > MAX_PART_LEN => Err(KernelError::FrameTooLarge {
                size,
                limit: MAX_PART_LEN,
            }),
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = 5 + self.parts.iter().map(|p| 4 + p.len()).sum::<usize>();
        let mut buf = Vec::with_capacity(size);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.parts.len() as u32).to_be_bytes());
        for part in &self.parts {
            buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
            buf.extend_from_slice(part);
        }
        buf
    }
}

/// Reads and drops `len` bytes.
async fn discard<R>(reader: &mut R, len: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(len as u64);
    let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if skipped < len as u64 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream.
///
/// A frame with an oversized part is consumed whole and reported as
/// [`KernelError::FrameTooLarge`]; the stream stays usable after it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let kind = match reader.read_u8().await {
        Ok(byte) => FrameKind::try_from(byte)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let count = reader.read_u32().await? as usize;
    if count > MAX_PARTS {
        return Err(KernelError::MalformedEnvelope(format!(
            "{count} parts exceed the limit of {MAX_PARTS}"
        )));
    }

    let mut parts = Vec::with_capacity(count);
    let mut oversized = None;
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if oversized.is_some() || len > MAX_PART_LEN {
            oversized = oversized.max(Some(len));
            discard(reader, len).await?;
            continue;
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }

    match oversized {
        Some(size) => {
            debug!(target: "transport", size, "Skipped frame with oversized part");
            Err(KernelError::FrameTooLarge {
                size,
                limit: MAX_PART_LEN,
            })
        }
        None => Ok(Some(Frame { kind, parts })),
    }
}
