//! Frame encoding and the streaming response parser.
//!
//! Encoding has two modes. Batches whose total size stays under
//! [`SINGLE_ALLOCATION_LIMIT`] are written into one contiguous buffer;
//! larger batches produce one small header buffer per request and append the
//! key/value `Bytes` by reference so bulk payloads are never copied.
//!
//! Parsing is a suspendable state machine driven by the connection's read
//! loop. All parser state survives a suspension on insufficient bytes. The
//! input position is marked at the start of every header so that a response
//! attributable to a skipped quiet command can rewind and re-attempt against
//! the next queued request.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::inflight::{InflightQueue, InflightRequest, ResponsePayload};
use crate::protocol::{Opcode, ResponseHeader, Status, HEADER_LEN, RESPONSE_MAGIC};

/// Batches up to this total size are encoded with a single allocation.
pub(crate) const SINGLE_ALLOCATION_LIMIT: usize = 1024 * 1024;

/// Encode a batch of requests into write-ready chunks.
pub(crate) fn encode_batch(batch: &[Arc<InflightRequest>]) -> Vec<Bytes> {
    let total: usize = batch.iter().map(|item| item.request.packet_len()).sum();
    if total <= SINGLE_ALLOCATION_LIMIT {
        vec![encode_contiguous(batch, total)]
    } else {
        encode_composite(batch)
    }
}

fn encode_contiguous(batch: &[Arc<InflightRequest>], total: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(total);
    for item in batch {
        item.request.write_header_and_extras(&mut buf);
        if let Some(key) = &item.request.key {
            buf.extend_from_slice(key);
        }
        if let Some(value) = &item.request.value {
            buf.extend_from_slice(value);
        }
    }
    buf.freeze()
}

fn encode_composite(batch: &[Arc<InflightRequest>]) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(batch.len() * 3);
    for item in batch {
        let mut head = BytesMut::with_capacity(HEADER_LEN + item.request.extras.len());
        item.request.write_header_and_extras(&mut head);
        chunks.push(head.freeze());
        if let Some(key) = &item.request.key {
            chunks.push(key.clone());
        }
        if let Some(value) = &item.request.value {
            chunks.push(value.clone());
        }
    }
    chunks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    None,
    ReadHeader,
    ReadExtras,
    ReadKey,
    ReadValue,
    Done,
    NoReply,
}

/// Suspendable response parser for one connection.
///
/// The parser never consumes bytes from the input until a whole frame has
/// been dispatched; `pos` is a cursor into the unconsumed region and `mark`
/// remembers the current header start for the quiet-command rewind.
pub(crate) struct ResponseParser {
    state: ParseState,
    pos: usize,
    mark: usize,
    header: ResponseHeader,
    flags: u32,
    key: Option<Bytes>,
    value: Option<Bytes>,
}

impl ResponseParser {
    pub(crate) fn new() -> Self {
        Self {
            state: ParseState::None,
            pos: 0,
            mark: 0,
            header: ResponseHeader::default(),
            flags: 0,
            key: None,
            value: None,
        }
    }

    fn clear_frame(&mut self) {
        self.header = ResponseHeader::default();
        self.flags = 0;
        self.key = None;
        self.value = None;
    }

    /// Consume as many complete frames from `buf` as possible, delivering
    /// results to the waiters queued in `inflight`.
    ///
    /// Returns `Ok(())` when more bytes are needed; any `Err` is fatal for
    /// the connection.
    pub(crate) fn feed(&mut self, buf: &mut BytesMut, inflight: &InflightQueue) -> Result<()> {
        loop {
            match self.state {
                ParseState::None => {
                    if buf.len() - self.pos < HEADER_LEN {
                        return Ok(());
                    }
                    self.state = ParseState::ReadHeader;
                }
                ParseState::ReadHeader => {
                    if buf.len() - self.pos < HEADER_LEN {
                        return Ok(());
                    }
                    self.mark = self.pos;
                    let mut header = &buf[self.pos..self.pos + HEADER_LEN];
                    let magic = header.get_u8();
                    if magic != RESPONSE_MAGIC {
                        return Err(Error::Framing(format!("invalid magic {magic:#04x}")));
                    }
                    let opcode = header.get_u8();
                    let head = inflight
                        .peek()
                        .ok_or_else(|| Error::Framing("response without a pending request".into()))?;
                    let expected = head.request.op.wire_value();
                    if opcode != expected {
                        if head.quiet {
                            self.state = ParseState::NoReply;
                            continue;
                        }
                        return Err(Error::ProtocolMismatch { expected, actual: opcode });
                    }
                    self.header.opcode = opcode;
                    self.header.key_len = header.get_u16();
                    self.header.extras_len = header.get_u8();
                    let _data_type = header.get_u8();
                    self.header.status = Status::from_u16(header.get_u16());
                    self.header.total_body_len = header.get_u32();
                    self.header.opaque = header.get_u32();
                    self.header.cas = header.get_u64();
                    // A quiet head whose echoed opaque differs was skipped by
                    // the server; the frame belongs to a later request.
                    if head.quiet && self.header.opaque != head.request.opaque {
                        self.state = ParseState::NoReply;
                        continue;
                    }
                    self.pos += HEADER_LEN;
                    self.state = ParseState::ReadExtras;
                }
                ParseState::ReadExtras => {
                    let extras_len = self.header.extras_len as usize;
                    if buf.len() - self.pos < extras_len {
                        return Ok(());
                    }
                    if extras_len == 4 {
                        self.flags = (&buf[self.pos..self.pos + 4]).get_u32();
                    }
                    self.pos += extras_len;
                    self.state = ParseState::ReadKey;
                }
                ParseState::ReadKey => {
                    let key_len = self.header.key_len as usize;
                    if buf.len() - self.pos < key_len {
                        return Ok(());
                    }
                    self.key = if key_len > 0 {
                        Some(Bytes::copy_from_slice(&buf[self.pos..self.pos + key_len]))
                    } else {
                        None
                    };
                    self.pos += key_len;
                    self.state = ParseState::ReadValue;
                }
                ParseState::ReadValue => {
                    let total = self.header.total_body_len as usize;
                    let key_len = self.header.key_len as usize;
                    let extras_len = self.header.extras_len as usize;
                    let value_len = total
                        .checked_sub(key_len + extras_len)
                        .ok_or_else(|| {
                            Error::Framing(format!(
                                "total body {total} shorter than key {key_len} + extras {extras_len}"
                            ))
                        })?;
                    if buf.len() - self.pos < value_len {
                        return Ok(());
                    }
                    self.value = if !self.header.status.is_error() && value_len > 0 {
                        Some(Bytes::copy_from_slice(&buf[self.pos..self.pos + value_len]))
                    } else {
                        None
                    };
                    self.pos += value_len;
                    self.state = ParseState::Done;
                }
                ParseState::Done => {
                    let head = inflight
                        .peek()
                        .ok_or_else(|| Error::Framing("completed frame without a pending request".into()))?;
                    if head.request.op == Opcode::Stat && !self.header.status.is_error() {
                        match self.key.take() {
                            Some(key) => {
                                // One statistic per frame until the empty-key
                                // terminator. The head stays queued, but each
                                // frame writes the sequence gathered so far
                                // and signals; the disposed guard means only
                                // the first signal wakes the waiter.
                                head.push_stat(key, self.value.take().unwrap_or_default());
                                head.progress(ResponsePayload::Stats(head.stats_snapshot()), false);
                            }
                            None => {
                                inflight.pop();
                                head.complete(ResponsePayload::Stats(head.take_stats()), false);
                            }
                        }
                    } else {
                        inflight.pop();
                        let is_error = self.header.status.is_error();
                        let payload = ResponsePayload::Frame {
                            status: self.header.status,
                            flags: self.flags,
                            cas: self.header.cas,
                            key: self.key.take(),
                            value: self.value.take(),
                        };
                        head.complete(payload, is_error);
                    }

                    buf.advance(self.pos);
                    self.pos = 0;
                    self.mark = 0;
                    self.clear_frame();
                    self.state = ParseState::None;
                }
                ParseState::NoReply => {
                    // The server sent no response for the quiet head; its
                    // success is inferred from this later frame. Complete it
                    // and re-parse the same bytes against the next request.
                    let skipped = inflight
                        .pop()
                        .ok_or_else(|| Error::Framing("no-reply skip without a pending request".into()))?;
                    skipped.complete(ResponsePayload::Empty, false);
                    self.pos = self.mark;
                    self.clear_frame();
                    self.state = ParseState::ReadHeader;
                }
            }
        }
    }
}
