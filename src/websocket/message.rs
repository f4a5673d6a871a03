//! Frames to logical messages, per direction
use super::frame::{Frame, OpCode};
use crate::errors::{Error, Result};
use bytes::{Bytes, BytesMut};

/// Which way a frame travels through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Client to server, read from the local socket
  Outgoing,
  /// Server to client, read from the remote socket
  Incoming,
}

impl Direction {
  /// The other direction.
  pub fn reverse(self) -> Self {
    match self {
      Direction::Outgoing => Direction::Incoming,
      Direction::Incoming => Direction::Outgoing,
    }
  }
}

/// One logical message: a single control frame, or a text/binary frame
/// followed by its continuations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  opcode: OpCode,
  frames: Vec<Bytes>,
  payload: BytesMut,
  finished: bool,
}

impl Message {
  fn start(frame: Frame) -> Self {
    let mut message = Message {
      opcode: frame.opcode,
      frames: Vec::with_capacity(1),
      payload: BytesMut::new(),
      finished: false,
    };
    message.push(frame);
    message
  }
  fn push(&mut self, frame: Frame) {
    self.payload.extend_from_slice(&frame.payload);
    self.finished = frame.fin;
    self.frames.push(frame.raw().clone());
  }
  /// Opcode of the first frame.
  pub fn opcode(&self) -> OpCode {
    self.opcode
  }
  /// Close, ping or pong.
  pub fn is_control(&self) -> bool {
    self.opcode.is_control()
  }
  /// Whether the final fragment has arrived.
  pub fn is_finished(&self) -> bool {
    self.finished
  }
  /// Wire bytes of every frame, in arrival order.
  pub fn frames(&self) -> &[Bytes] {
    &self.frames
  }
  /// Unmasked payload of all fragments.
  pub fn payload(&self) -> &[u8] {
    &self.payload
  }
  /// The payload as UTF-8, for text messages.
  pub fn text(&self) -> Option<&str> {
    match self.opcode {
      OpCode::Text => std::str::from_utf8(&self.payload).ok(),
      _ => None,
    }
  }
}

/// Continuation state for both directions of one channel.
#[derive(Debug)]
pub struct MessageAssembler {
  outgoing: Option<Message>,
  incoming: Option<Message>,
  max_message_size: usize,
}

impl Default for MessageAssembler {
  fn default() -> Self {
    Self::with_limit(usize::MAX)
  }
}

impl MessageAssembler {
  /// Create an assembler with nothing in progress
  pub fn new() -> Self {
    Self::default()
  }
  /// Like [`new`](Self::new), failing any message whose fragments add up
  /// to more than `max_message_size` payload bytes.
  pub fn with_limit(max_message_size: usize) -> Self {
    MessageAssembler {
      outgoing: None,
      incoming: None,
      max_message_size,
    }
  }
  /// Whether a fragmented message is waiting for more frames in `direction`.
  pub fn in_progress(&self, direction: Direction) -> bool {
    match direction {
      Direction::Outgoing => self.outgoing.is_some(),
      Direction::Incoming => self.incoming.is_some(),
    }
  }
  /// Feed one frame read in `direction`.
  ///
  /// Returns the message once it is complete, `Ok(None)` while more
  /// fragments are expected. Control frames are complete on arrival and
  /// leave any message in progress untouched. A new data message while one
  /// is in progress, or a continuation with none in progress, discards the
  /// state for that direction and fails.
  pub fn feed(&mut self, direction: Direction, frame: Frame) -> Result<Option<Message>> {
    if frame.opcode.is_control() {
      return Ok(Some(Message::start(frame)));
    }
    let slot = match direction {
      Direction::Outgoing => &mut self.outgoing,
      Direction::Incoming => &mut self.incoming,
    };
    match (frame.opcode, slot.take()) {
      (OpCode::Continuation, None) => Err(Error::protocol(format!(
        "{:?} continuation frame without a message in progress",
        direction
      ))),
      (OpCode::Continuation, Some(mut message)) => {
        let size = message.payload.len().saturating_add(frame.payload.len());
        if size > self.max_message_size {
          return Err(Error::protocol(format!(
            "{:?} {:?} message exceeds {} bytes after {} fragments",
            direction,
            message.opcode,
            self.max_message_size,
            message.frames.len()
          )));
        }
        message.push(frame);
        Ok(complete(slot, message))
      }
      (opcode, Some(discarded)) => Err(Error::protocol(format!(
        "{:?} {:?} frame while a {:?} message of {} fragments is unfinished",
        direction,
        opcode,
        discarded.opcode,
        discarded.frames.len()
      ))),
      (opcode, None) if frame.payload.len() > self.max_message_size => Err(Error::protocol(
        format!("{:?} {:?} message exceeds {} bytes", direction, opcode, self.max_message_size),
      )),
      (_, None) => Ok(complete(slot, Message::start(frame))),
    }
  }
}

fn complete(slot: &mut Option<Message>, message: Message) -> Option<Message> {
  if message.finished {
    Some(message)
  } else {
    *slot = Some(message);
    None
  }
}
