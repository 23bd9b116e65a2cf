//! Message fragmentation and reassembly
//!
//! Outbound message bodies are split into fixed-capacity fragments; inbound
//! fragments of one message id are accumulated, strictly in part order, until
//! the message is complete.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{FrameHeader, MessageMeta, PacketType, HEADER_SIZE, META_SIZE};

/// Reassembly errors. Any of these is fatal to the peer that caused it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("Unexpected fragment {message_id}/{part}: expected part {expected_part} of {}", fmt_expected(.expected_id))]
    UnexpectedFragment {
        message_id: u32,
        part: u16,
        expected_id: Option<u32>,
        expected_part: u32,
    },

    #[error("Fragment carries {size} bytes, capacity is {capacity}")]
    FragmentTooLarge { size: u16, capacity: u16 },

    #[error("Fragment {part} is short ({size} of {capacity} bytes) but is not the last part")]
    TruncatedFragment { part: u16, size: u16, capacity: u16 },

    #[error("Message {message_id} changed type from {expected} to {found}")]
    MixedTypes {
        message_id: u32,
        expected: PacketType,
        found: PacketType,
    },

    #[error("Message body is {received} bytes, metadata declared {declared}")]
    LengthMismatch { declared: usize, received: usize },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message ended after {received} bytes, before its metadata was complete")]
    MissingMeta { received: usize },
}

fn fmt_expected(expected_id: &Option<u32>) -> String {
    match expected_id {
        Some(id) => format!("message {}", id),
        None => "a new message".to_string(),
    }
}

/// Number of fragments needed for `len` bytes and the size of the final
/// partial fragment (0 when `len` is an exact multiple).
///
/// A zero-length body still takes one (empty) fragment.
pub fn fragment_count(len: usize, capacity: usize) -> (usize, usize) {
    debug_assert!(capacity > 0);
    if len == 0 {
        return (1, 0);
    }
    (len.div_ceil(capacity), len % capacity)
}

/// Scratch bytes to reserve for the framed form of a `len` byte body.
///
/// Exact multiples of the capacity take `count` full frames. Any other
/// length, zero included, reserves one more header plus the remainder on
/// top of that, so the result is an upper bound, not a tight fit.
pub fn required_buffer_size(len: usize, capacity: usize) -> usize {
    let (count, remainder) = fragment_count(len, capacity);
    let mut size = count * (HEADER_SIZE + capacity);
    if remainder != 0 || len == 0 {
        size += HEADER_SIZE + remainder;
    }
    size
}

/// One outbound fragment borrowing its payload from the message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

/// Split a message body into ordered fragments.
///
/// Every fragment but the last carries exactly `capacity` bytes. No trailing
/// empty fragment is produced for exact multiples; an empty body produces a
/// single empty fragment.
///
/// # Panics
///
/// Panics if `capacity` is zero, or if the body needs more than
/// `u16::MAX + 1` fragments and part indices would wrap. Node-built bodies
/// stay within both limits once `NodeConfig::validate` has passed.
pub fn split(message_id: u32, kind: PacketType, body: &[u8], capacity: u16) -> Vec<Fragment<'_>> {
    let cap = capacity as usize;
    assert!(cap > 0, "fragment capacity must be non-zero");
    let (count, _) = fragment_count(body.len(), cap);
    assert!(
        count <= u16::MAX as usize + 1,
        "{} byte body needs {} fragments of {} bytes",
        body.len(),
        count,
        cap
    );

    if body.is_empty() {
        return vec![Fragment {
            header: FrameHeader::new(message_id, kind, 0, 0),
            payload: body,
        }];
    }

    body.chunks(cap)
        .enumerate()
        .map(|(part, payload)| Fragment {
            header: FrameHeader::new(message_id, kind, part as u16, payload.len() as u16),
            payload,
        })
        .collect()
}

/// Build a message body: metadata followed by the application payload
pub fn build_body(channel: u32, payload: &[u8]) -> Result<BytesMut, FragmentError> {
    let len = u16::try_from(payload.len()).map_err(|_| FragmentError::MessageTooLarge {
        size: payload.len(),
        max: u16::MAX as usize,
    })?;

    let mut body = BytesMut::with_capacity(META_SIZE + payload.len());
    MessageMeta::new(channel, len).write(&mut body);
    body.extend_from_slice(payload);
    Ok(body)
}

/// Encode a whole message into wire frames, one `Bytes` per fragment
pub fn encode_message(message_id: u32, kind: PacketType, body: &[u8], capacity: u16) -> Vec<Bytes> {
    let mut buf = BytesMut::with_capacity(required_buffer_size(body.len(), capacity as usize));
    split(message_id, kind, body, capacity)
        .into_iter()
        .map(|fragment| {
            fragment.header.write(&mut buf);
            buf.extend_from_slice(fragment.payload);
            buf.split_to(fragment.header.frame_len()).freeze()
        })
        .collect()
}

/// A fully reassembled inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub message_id: u32,
    pub kind: PacketType,
    pub channel: u32,
    pub payload: Bytes,
}

#[derive(Debug)]
struct PendingMessage {
    message_id: u32,
    kind: PacketType,
    next_part: u32,
    /// Known once the metadata has arrived: (frame count, body length)
    target: Option<(usize, usize)>,
    body: BytesMut,
}

/// Per-peer reassembly workspace
///
/// Holds at most one in-progress message; fragments of a second message id
/// cannot interleave with it.
#[derive(Debug)]
pub struct Reassembler {
    capacity: u16,
    max_message_size: usize,
    pending: Option<PendingMessage>,
}

impl Reassembler {
    pub fn new(capacity: u16, max_message_size: usize) -> Self {
        Self {
            capacity,
            max_message_size,
            pending: None,
        }
    }

    /// Whether no message is partially assembled
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Fragments consumed for the in-progress message
    pub fn pending_parts(&self) -> u32 {
        self.pending.as_ref().map_or(0, |p| p.next_part)
    }

    /// Drop any partial message
    pub fn discard(&mut self) {
        self.pending = None;
    }

    /// Feed one fragment. Returns the message once its last fragment is in.
    ///
    /// On error the partial message is discarded.
    pub fn reassemble(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<Option<Assembled>, FragmentError> {
        debug_assert_eq!(header.payload_size as usize, payload.len());

        if header.payload_size > self.capacity {
            self.pending = None;
            return Err(FragmentError::FragmentTooLarge {
                size: header.payload_size,
                capacity: self.capacity,
            });
        }

        let mut pending = match self.pending.take() {
            Some(pending) => {
                if header.message_id != pending.message_id || header.part as u32 != pending.next_part {
                    return Err(FragmentError::UnexpectedFragment {
                        message_id: header.message_id,
                        part: header.part,
                        expected_id: Some(pending.message_id),
                        expected_part: pending.next_part,
                    });
                }
                if header.kind != pending.kind {
                    return Err(FragmentError::MixedTypes {
                        message_id: pending.message_id,
                        expected: pending.kind,
                        found: header.kind,
                    });
                }
                pending
            }
            None => {
                if header.part != 0 {
                    return Err(FragmentError::UnexpectedFragment {
                        message_id: header.message_id,
                        part: header.part,
                        expected_id: None,
                        expected_part: 0,
                    });
                }
                PendingMessage {
                    message_id: header.message_id,
                    kind: header.kind,
                    next_part: 0,
                    target: None,
                    body: BytesMut::new(),
                }
            }
        };

        pending.body.extend_from_slice(payload);
        pending.next_part += 1;

        if pending.target.is_none() {
            if let Some(meta) = MessageMeta::read(&pending.body) {
                if meta.len as usize > self.max_message_size {
                    return Err(FragmentError::MessageTooLarge {
                        size: meta.len as usize,
                        max: self.max_message_size,
                    });
                }
                let (count, _) = fragment_count(meta.body_len(), self.capacity as usize);
                pending.target = Some((count, meta.body_len()));
            }
        }

        let short = header.payload_size < self.capacity;
        match pending.target {
            Some((count, body_len)) if pending.next_part as usize == count => {
                if pending.body.len() != body_len {
                    return Err(FragmentError::LengthMismatch {
                        declared: body_len,
                        received: pending.body.len(),
                    });
                }
                let body = pending.body.freeze();
                let channel = MessageMeta::read(&body).map_or(0, |meta| meta.channel);
                tracing::trace!(
                    "Reassembled message {} ({} parts, {} bytes)",
                    pending.message_id,
                    count,
                    body_len
                );
                Ok(Some(Assembled {
                    message_id: pending.message_id,
                    kind: pending.kind,
                    channel,
                    payload: body.slice(META_SIZE..),
                }))
            }
            Some((count, body_len)) if short || pending.next_part as usize > count => {
                if short {
                    Err(FragmentError::TruncatedFragment {
                        part: header.part,
                        size: header.payload_size,
                        capacity: self.capacity,
                    })
                } else {
                    Err(FragmentError::LengthMismatch {
                        declared: body_len,
                        received: pending.body.len(),
                    })
                }
            }
            None if short => Err(FragmentError::MissingMeta {
                received: pending.body.len(),
            }),
            _ => {
                self.pending = Some(pending);
                Ok(None)
            }
        }
    }
}
