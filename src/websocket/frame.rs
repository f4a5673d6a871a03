//! RFC 6455 frame codec
use crate::errors::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read};

/// Longest possible frame head: 2 bytes, 8 bytes of length, 4 bytes of mask.
pub const MAX_HEAD_SIZE: usize = 14;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
  /// 0x0
  Continuation,
  /// 0x1
  Text,
  /// 0x2
  Binary,
  /// 0x8
  Close,
  /// 0x9
  Ping,
  /// 0xA
  Pong,
}

impl OpCode {
  /// Close, ping and pong.
  pub fn is_control(&self) -> bool {
    matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
  }
  /// The 4-bit wire value.
  pub fn as_u8(&self) -> u8 {
    match self {
      OpCode::Continuation => 0x0,
      OpCode::Text => 0x1,
      OpCode::Binary => 0x2,
      OpCode::Close => 0x8,
      OpCode::Ping => 0x9,
      OpCode::Pong => 0xA,
    }
  }
}

impl TryFrom<u8> for OpCode {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      0x0 => Ok(OpCode::Continuation),
      0x1 => Ok(OpCode::Text),
      0x2 => Ok(OpCode::Binary),
      0x8 => Ok(OpCode::Close),
      0x9 => Ok(OpCode::Ping),
      0xA => Ok(OpCode::Pong),
      other => Err(Error::protocol(format!("reserved opcode {:#x}", other))),
    }
  }
}

/// One decoded frame.
///
/// `payload` is always unmasked. `raw` holds the frame exactly as it was
/// read (or as [`Frame::new`] encoded it), which is what the relay forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  /// final fragment of a message
  pub fin: bool,
  /// RSV1..RSV3, kept as the high nibble bits they occupied on the wire
  pub rsv: u8,
  /// opcode
  pub opcode: OpCode,
  /// masking key, if the frame was masked
  pub mask: Option<[u8; 4]>,
  /// unmasked payload
  pub payload: Bytes,
  raw: Bytes,
}

impl Frame {
  /// Build a frame and its wire form.
  pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
    let mut frame = Frame {
      fin,
      rsv: 0,
      opcode,
      mask,
      payload: payload.into(),
      raw: Bytes::new(),
    };
    let mut dst = BytesMut::with_capacity(MAX_HEAD_SIZE + frame.payload.len());
    frame.encode(&mut dst);
    frame.raw = dst.freeze();
    frame
  }
  /// Bytes of this frame as they travel on the wire.
  pub fn raw(&self) -> &Bytes {
    &self.raw
  }
  /// Format the head into `head`, returning how many bytes were used.
  pub fn fmt_head(&self, head: &mut [u8]) -> usize {
    head[0] = (self.fin as u8) << 7 | (self.rsv & 0x70) | self.opcode.as_u8();
    let len = self.payload.len();
    let size = if len < 126 {
      head[1] = len as u8;
      2
    } else if len < 65536 {
      head[1] = 126;
      head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
      4
    } else {
      head[1] = 127;
      head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
      10
    };
    if let Some(mask) = self.mask {
      head[1] |= 0x80;
      head[size..size + 4].copy_from_slice(&mask);
      size + 4
    } else {
      size
    }
  }
  /// Append the wire form to `dst`, masking the payload if a key is set.
  pub fn encode(&self, dst: &mut BytesMut) {
    let mut head = [0; MAX_HEAD_SIZE];
    let size = self.fmt_head(&mut head);
    dst.put_slice(&head[..size]);
    let start = dst.len();
    dst.put_slice(&self.payload);
    if let Some(mask) = self.mask {
      apply_mask(&mut dst[start..], mask);
    }
  }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` without consuming anything while the frame is still
/// incomplete. A payload longer than `max_payload` is a protocol violation,
/// reported as soon as the length is known.
pub fn decode(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
  if src.len() < 2 {
    return Ok(None);
  }
  let fin = src[0] & 0x80 != 0;
  let rsv = src[0] & 0x70;
  let opcode = OpCode::try_from(src[0] & 0x0F)?;
  let masked = src[1] & 0x80 != 0;
  let length_code = src[1] & 0x7F;
  let extra = match length_code {
    126 => 2,
    127 => 8,
    _ => 0,
  };
  let head_size = 2 + extra + masked as usize * 4;
  if src.len() < head_size {
    return Ok(None);
  }
  let payload_len = payload_length(&src[..head_size], max_payload)?;
  if opcode.is_control() && (!fin || payload_len > 125) {
    return Err(Error::protocol(format!(
      "{:?} frame fragmented or longer than 125 bytes",
      opcode
    )));
  }
  let total = head_size.saturating_add(payload_len);
  if src.len() < total {
    return Ok(None);
  }
  let mask = if masked {
    let at = 2 + extra;
    Some([src[at], src[at + 1], src[at + 2], src[at + 3]])
  } else {
    None
  };
  let raw = src.split_to(total).freeze();
  let payload = match mask {
    Some(mask) => {
      let mut payload = raw[head_size..].to_vec();
      apply_mask(&mut payload, mask);
      Bytes::from(payload)
    }
    None => raw.slice(head_size..),
  };
  Ok(Some(Frame {
    fin,
    rsv,
    opcode,
    mask,
    payload,
    raw,
  }))
}

/// Payload length from a complete frame head, checked against `max_payload`.
fn payload_length(head: &[u8], max_payload: usize) -> Result<usize> {
  let len = match head[1] & 0x7F {
    126 => u64::from(u16::from_be_bytes([head[2], head[3]])),
    127 => {
      let mut be = [0; 8];
      be.copy_from_slice(&head[2..10]);
      u64::from_be_bytes(be)
    }
    code => u64::from(code),
  };
  if len & (1 << 63) != 0 {
    return Err(Error::protocol(format!(
      "most significant bit of the frame length {:#x} is set",
      len
    )));
  }
  match usize::try_from(len) {
    Ok(len) if len <= max_payload => Ok(len),
    _ => Err(Error::protocol(format!(
      "frame payload of {} bytes exceeds the {} byte limit",
      len, max_payload
    ))),
  }
}

/// Read exactly one frame from a blocking reader.
///
/// A stream that ends part way through a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R, max_payload: usize) -> Result<Frame> {
  let mut buf = BytesMut::with_capacity(MAX_HEAD_SIZE);
  buf.resize(2, 0);
  reader.read_exact(&mut buf[..2])?;
  let extra = match buf[1] & 0x7F {
    126 => 2,
    127 => 8,
    _ => 0,
  };
  OpCode::try_from(buf[0] & 0x0F)?;
  let rest = extra + (buf[1] & 0x80 != 0) as usize * 4;
  read_more(reader, &mut buf, rest)?;
  let len = payload_length(&buf, max_payload)?;
  read_more(reader, &mut buf, len)?;
  decode(&mut buf, max_payload)?.ok_or_else(|| Error::malformed("incomplete websocket frame"))
}

/// Append exactly `n` more bytes, growing `buf` only as they arrive.
fn read_more<R: Read>(reader: &mut R, buf: &mut BytesMut, n: usize) -> Result<()> {
  let wanted = n as u64;
  let copied = std::io::copy(&mut reader.by_ref().take(wanted), &mut buf.writer())?;
  if copied < wanted {
    return Err(Error::IO(std::io::Error::new(
      ErrorKind::UnexpectedEof,
      "stream ended inside a websocket frame",
    )));
  }
  Ok(())
}

/// XOR `buf` with `mask`, restarting the key at index 0.
///
/// Applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
  for (i, byte) in buf.iter_mut().enumerate() {
    *byte ^= mask[i & 3];
  }
}
