//! Wire codec for the fixed message envelope.
//!
//! Every connection carries exactly one envelope: sender id, the sender's
//! listening port, a sequence number, then a header and payload string. A
//! synchronous header gets exactly one reply written back over the same
//! connection before it closes. Integers are big-endian; strings are a u32
//! byte-length prefix followed by UTF-8.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Upper bound on any string field, to keep a garbage length prefix from
/// forcing a huge allocation.
const MAX_STRING_LEN: usize = 1 << 20;

/// The envelope every outbound message travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Wire id of the sender (`-2` marks the tracker).
    pub sender_id: i32,
    /// Port the sender's own listener is bound to.
    pub listen_port: u16,
    /// Sender-local monotonically increasing counter, logging identity only.
    pub seq: i32,
    pub header: String,
    pub payload: String,
}

/// The single synchronous reply to a `sync-`-prefixed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReply {
    pub replier_id: i32,
    pub header: String,
    pub payload: String,
}

/// Codec for the accepting side: decodes envelopes, encodes replies.
#[derive(Debug, Default)]
pub struct ListenerCodec;

/// Codec for the connecting side: encodes envelopes, decodes replies.
#[derive(Debug, Default)]
pub struct CallerCodec;

impl Decoder for ListenerCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let mut view = &src[..];
        if view.remaining() < 12 {
            return Ok(None);
        }
        let sender_id = view.get_i32();
        let listen_port = view.get_i32();
        let seq = view.get_i32();
        let Some(header) = get_string(&mut view)? else {
            return Ok(None);
        };
        let Some(payload) = get_string(&mut view)? else {
            return Ok(None);
        };
        let consumed = src.len() - view.remaining();
        src.advance(consumed);

        let listen_port = u16::try_from(listen_port)
            .map_err(|_| Error::MalformedMessage(format!("bad listen port: {listen_port}")))?;
        Ok(Some(Envelope {
            sender_id,
            listen_port,
            seq,
            header,
            payload,
        }))
    }
}

impl Encoder<SyncReply> for ListenerCodec {
    type Error = Error;

    fn encode(&mut self, reply: SyncReply, dst: &mut BytesMut) -> Result<()> {
        dst.put_i32(reply.replier_id);
        put_string(dst, &reply.header);
        put_string(dst, &reply.payload);
        Ok(())
    }
}

impl Encoder<Envelope> for CallerCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        dst.put_i32(envelope.sender_id);
        dst.put_i32(i32::from(envelope.listen_port));
        dst.put_i32(envelope.seq);
        put_string(dst, &envelope.header);
        put_string(dst, &envelope.payload);
        Ok(())
    }
}

impl Decoder for CallerCodec {
    type Item = SyncReply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SyncReply>> {
        let mut view = &src[..];
        if view.remaining() < 4 {
            return Ok(None);
        }
        let replier_id = view.get_i32();
        let Some(header) = get_string(&mut view)? else {
            return Ok(None);
        };
        let Some(payload) = get_string(&mut view)? else {
            return Ok(None);
        };
        let consumed = src.len() - view.remaining();
        src.advance(consumed);
        Ok(Some(SyncReply {
            replier_id,
            header,
            payload,
        }))
    }
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_u32(s.len() as u32);
    dst.put_slice(s.as_bytes());
}

fn get_string(view: &mut &[u8]) -> Result<Option<String>> {
    if view.remaining() < 4 {
        return Ok(None);
    }
    let len = view.get_u32() as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::MalformedMessage(format!(
            "string field of {len} bytes exceeds limit"
        )));
    }
    if view.remaining() < len {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len];
    view.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::MalformedMessage("invalid utf-8 in string field".into()))
}

/// Writes one length-prefixed string, registration-handshake side.
pub async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, s: &str) -> Result<()> {
    writer.write_u32(s.len() as u32).await?;
    writer.write_all(s.as_bytes()).await?;
    Ok(())
}

/// Reads one length-prefixed string, registration-handshake side.
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::MalformedMessage(format!(
            "string field of {len} bytes exceeds limit"
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    String::from_utf8(bytes)
        .map_err(|_| Error::MalformedMessage("invalid utf-8 in string field".into()))
}
