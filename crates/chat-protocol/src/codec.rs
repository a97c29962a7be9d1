//! Frame codec: text frames to [`ProtocolMessage`] values and back.
//!
//! A frame is `TAG len field len field ...` with single-space separators.
//! Field lengths are decimal byte counts, so a field may itself contain
//! spaces. An absent optional field travels as the literal `--`.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{Direction, FieldShape, MessageKind, ProtocolMessage};

/// Wire marker for an absent field.
const ABSENT: &str = "--";

/// Ceiling on a single field's declared length. A length above this is
/// treated as corruption rather than an enormous pending read.
const MAX_FIELD_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unrecognized message tag {0:?}")]
    UnknownTag(String),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("frame is missing a mandatory field")]
    MissingField,
}

/// Serializes a message into one wire frame.
pub fn encode(msg: &ProtocolMessage) -> Bytes {
    let mut out = String::with_capacity(32);
    out.push_str(msg.kind().tag());
    match msg.kind().shape() {
        FieldShape::SenderText => {
            push_field(&mut out, msg.sender());
            push_field(&mut out, msg.text());
        }
        FieldShape::SenderRecipientText => {
            push_field(&mut out, msg.sender());
            push_field(&mut out, msg.recipient());
            push_field(&mut out, msg.text());
        }
        FieldShape::Search => {
            push_field(&mut out, msg.sender());
            push_field(&mut out, msg.direction().map(Direction::as_wire));
            push_field(&mut out, msg.recipient());
            push_field(&mut out, msg.start_time());
            push_field(&mut out, msg.end_time());
        }
    }
    Bytes::from(out)
}

fn push_field(out: &mut String, field: Option<&str>) {
    let value = field.unwrap_or(ABSENT);
    out.push(' ');
    out.push_str(&value.len().to_string());
    out.push(' ');
    out.push_str(value);
}

/// Attempts to parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a frame; in
/// that case nothing is consumed and the caller should read more bytes.
/// On success the frame's bytes are consumed from `buf`. A malformed
/// frame leaves the buffer untouched and the connection unusable.
pub fn decode(buf: &mut BytesMut) -> Result<Option<ProtocolMessage>, CodecError> {
    let mut parser = Parser::new(buf.as_ref());

    let tag = match parser.tag() {
        Some(t) => t,
        None => return Ok(None),
    };
    let kind = MessageKind::from_tag(tag).ok_or_else(|| CodecError::UnknownTag(tag.to_owned()))?;

    let field_count = match kind.shape() {
        FieldShape::SenderText => 2,
        FieldShape::SenderRecipientText => 3,
        FieldShape::Search => 5,
    };
    let mut fields: Vec<Option<String>> = Vec::with_capacity(field_count);
    for _ in 0..field_count {
        match parser.field()? {
            Some(f) => fields.push(f),
            None => return Ok(None),
        }
    }

    let mut fields = fields.into_iter();
    let msg = match kind.shape() {
        FieldShape::SenderText => {
            let sender = fields.next().flatten();
            let text = fields.next().flatten();
            ProtocolMessage::from_wire(kind, sender, None, text, None, None, None)
        }
        FieldShape::SenderRecipientText => {
            let sender = fields.next().flatten();
            let recipient = fields.next().flatten();
            let text = fields.next().flatten();
            ProtocolMessage::from_wire(kind, sender, recipient, text, None, None, None)
        }
        FieldShape::Search => {
            let sender = fields.next().flatten();
            let direction = fields.next().flatten().map(|raw| Direction::from_wire(&raw));
            let recipient = fields.next().flatten();
            let start = fields.next().flatten();
            let end = fields.next().flatten();
            ProtocolMessage::from_wire(kind, sender, recipient, None, direction, start, end)
        }
    }
    .ok_or(CodecError::MissingField)?;

    let consumed = parser.pos;
    buf.advance(consumed);
    Ok(Some(msg))
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Parser { data, pos: 0 }
    }

    /// The 3-byte tag, or `None` when fewer than 3 bytes are buffered.
    fn tag(&mut self) -> Option<&'a str> {
        let raw = self.data.get(self.pos..self.pos + 3)?;
        self.pos += 3;
        std::str::from_utf8(raw).ok()
    }

    /// One ` len value` unit. Outer `None` means incomplete; inner `None`
    /// means the field carried the absent marker.
    #[allow(clippy::type_complexity)]
    fn field(&mut self) -> Result<Option<Option<String>>, CodecError> {
        match self.data.get(self.pos) {
            None => return Ok(None),
            Some(b' ') => self.pos += 1,
            Some(_) => return Err(CodecError::Malformed("expected field separator")),
        }
        let len = match self.length()? {
            Some(len) => len,
            None => return Ok(None),
        };
        let end = self.pos.checked_add(len).ok_or(CodecError::Malformed("field length out of range"))?;
        let raw = match self.data.get(self.pos..end) {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let value =
            std::str::from_utf8(raw).map_err(|_| CodecError::Malformed("field is not valid UTF-8"))?;
        self.pos = end;
        if value == ABSENT {
            Ok(Some(None))
        } else {
            Ok(Some(Some(value.to_owned())))
        }
    }

    /// Decimal field length followed by a single space. `None` when the
    /// buffer ends mid-number (more digits may still arrive).
    fn length(&mut self) -> Result<Option<usize>, CodecError> {
        let start = self.pos;
        loop {
            match self.data.get(self.pos) {
                None => return Ok(None),
                Some(b) if b.is_ascii_digit() => self.pos += 1,
                Some(b' ') if self.pos > start => break,
                Some(_) => return Err(CodecError::Malformed("field length is not a number")),
            }
        }
        let digits = self
            .data
            .get(start..self.pos)
            .and_then(|d| std::str::from_utf8(d).ok())
            .ok_or(CodecError::Malformed("field length is not a number"))?;
        let len: usize = digits
            .parse()
            .map_err(|_| CodecError::Malformed("field length out of range"))?;
        if len > MAX_FIELD_LEN {
            return Err(CodecError::Malformed("field length exceeds limit"));
        }
        self.pos += 1;
        Ok(Some(len))
    }
}
