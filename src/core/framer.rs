use crate::core::record::{Payload, Record};
use crate::domain::config::{EndpointConfig, FramingMode, OutputEncoding};
use crate::domain::error::{PortLinkError, PortLinkResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Scanner state carried between pushes in json mode
#[derive(Debug, Default, Clone)]
struct JsonScan {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Turns a byte stream into discrete records.
///
/// `push` accumulates bytes and cuts complete records into an internal
/// queue; `drain` hands them out in input order. Anything not yet forming a
/// complete record stays buffered for the next push. The framer holds no
/// reference to a transport.
#[derive(Debug)]
pub struct Framer {
    mode: FramingMode,
    split_char: u8,
    limit: usize,
    encoding: OutputEncoding,
    topic: String,
    buf: BytesMut,
    ready: VecDeque<Record>,
    json: JsonScan,
    /// Dropping the tail of an oversized segment until the next delimiter
    discarding: bool,
    sequence: u64,
}

impl Framer {
    pub fn new(
        mode: FramingMode,
        split_char: u8,
        buffer_size: usize,
        encoding: OutputEncoding,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            split_char,
            limit: buffer_size.max(1),
            encoding,
            topic: topic.into(),
            buf: BytesMut::new(),
            ready: VecDeque::new(),
            json: JsonScan::default(),
            discarding: false,
            sequence: 0,
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(
            config.framing,
            config.split_char,
            config.buffer_size,
            config.output,
            config.topic.clone(),
        )
    }

    /// Continue record numbering after `sequence`
    pub fn starting_after(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Bytes held back as an incomplete record
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed newly read bytes.
    ///
    /// All of `data` is consumed even when an error is returned: records
    /// completed before and after an overflow are still queued.
    pub fn push(&mut self, data: &[u8]) -> PortLinkResult<()> {
        match self.mode {
            FramingMode::Raw => {
                if !data.is_empty() {
                    self.emit(Payload::Binary(Bytes::copy_from_slice(data)));
                }
                Ok(())
            }
            FramingMode::SplitChar => self.push_split(data),
            FramingMode::Base64 => self.push_base64(data),
            FramingMode::FixedSize => {
                self.push_fixed(data);
                Ok(())
            }
            FramingMode::Json => self.push_json(data),
        }
    }

    /// Take every complete record in input order
    pub fn drain(&mut self) -> Vec<Record> {
        self.ready.drain(..).collect()
    }

    /// Queue the buffered remainder as a record, if there is one.
    ///
    /// Base64 remainders are shorter than one quantum and cannot be
    /// decoded, so they stay buffered.
    pub fn flush_pending(&mut self) -> bool {
        if self.buf.is_empty() || self.discarding {
            return false;
        }
        match self.mode {
            FramingMode::Raw | FramingMode::Base64 => false,
            FramingMode::FixedSize => {
                let chunk = self.buf.split().freeze();
                self.emit(Payload::Binary(chunk));
                true
            }
            FramingMode::SplitChar | FramingMode::Json => {
                self.json = JsonScan::default();
                let chunk = self.buf.split().freeze();
                self.emit_delimited(chunk);
                true
            }
        }
    }

    /// Forget buffered bytes, e.g. after the connection was re-established
    pub fn reset(&mut self) {
        self.buf.clear();
        self.json = JsonScan::default();
        self.discarding = false;
    }

    fn emit(&mut self, payload: Payload) {
        self.sequence += 1;
        self.ready
            .push_back(Record::new(payload, self.topic.clone(), self.sequence));
    }

    fn emit_delimited(&mut self, chunk: Bytes) {
        let payload = match self.encoding {
            OutputEncoding::Buffer => Payload::Binary(chunk),
            OutputEncoding::Utf8 => Payload::Text(String::from_utf8_lossy(&chunk).into_owned()),
        };
        self.emit(payload);
    }

    fn push_split(&mut self, data: &[u8]) -> PortLinkResult<()> {
        let delimiter = self.split_char;
        let mut overflow = None;

        for piece in data.split_inclusive(|b| *b == delimiter) {
            let terminated = piece.last() == Some(&delimiter);
            let body = if terminated {
                &piece[..piece.len() - 1]
            } else {
                piece
            };

            if self.discarding {
                self.discarding = !terminated;
                continue;
            }

            let segment_len = self.buf.len() + body.len();
            if segment_len > self.limit {
                self.buf.clear();
                self.discarding = !terminated;
                overflow.get_or_insert(PortLinkError::FramingOverflow {
                    limit: self.limit,
                    dropped: segment_len,
                });
                continue;
            }

            self.buf.extend_from_slice(body);
            if terminated {
                let segment = self.buf.split().freeze();
                self.emit_delimited(segment);
            }
        }

        overflow.map_or(Ok(()), Err)
    }

    fn push_fixed(&mut self, data: &[u8]) {
        let mut rest = data;
        while !rest.is_empty() {
            let take = (self.limit - self.buf.len()).min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.buf.len() == self.limit {
                let chunk = self.buf.split().freeze();
                self.emit(Payload::Binary(chunk));
            }
        }
    }

    fn push_base64(&mut self, data: &[u8]) -> PortLinkResult<()> {
        self.buf
            .extend(data.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let aligned = self.buf.len() / 4 * 4;
        let mut decoded = Vec::new();
        let mut start = 0;
        let mut offset = 0;

        // A padded quantum closes one encoded message.
        while offset < aligned {
            offset += 4;
            if self.buf[offset - 4..offset].contains(&b'=') {
                decoded.push(STANDARD.decode(&self.buf[start..offset]));
                start = offset;
            }
        }
        if start < aligned {
            decoded.push(STANDARD.decode(&self.buf[start..aligned]));
        }

        self.buf.advance(aligned);

        for result in decoded {
            match result {
                Ok(bytes) => self.emit(Payload::Binary(Bytes::from(bytes))),
                Err(e) => {
                    self.buf.clear();
                    return Err(PortLinkError::InvalidData(format!(
                        "base64 decode failed: {}",
                        e
                    )));
                }
            }
        }

        Ok(())
    }

    fn push_json(&mut self, data: &[u8]) -> PortLinkResult<()> {
        let mut overflow = None;

        for &byte in data {
            if self.json.depth == 0 {
                // Bytes between objects are skipped.
                if byte == b'{' {
                    self.json.depth = 1;
                    self.buf.extend_from_slice(&[byte]);
                }
                continue;
            }

            if !self.discarding && self.buf.len() >= self.limit {
                let dropped = self.buf.len() + 1;
                self.buf.clear();
                self.discarding = true;
                overflow.get_or_insert(PortLinkError::FramingOverflow {
                    limit: self.limit,
                    dropped,
                });
            }

            // An oversized object is still scanned to find where it ends.
            if !self.discarding {
                self.buf.extend_from_slice(&[byte]);
            }
            let scan = &mut self.json;
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' => scan.depth += 1,
                b'}' => {
                    scan.depth -= 1;
                    if scan.depth == 0 {
                        if self.discarding {
                            self.discarding = false;
                        } else {
                            let object = self.buf.split().freeze();
                            self.emit_delimited(object);
                        }
                    }
                }
                _ => {}
            }
        }

        overflow.map_or(Ok(()), Err)
    }
}
