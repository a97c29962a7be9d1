//! Message kinds and the immutable parsed message value.
//!
//! A [`ProtocolMessage`] can only be built through the typed factory
//! functions here or by [`crate::decode`]. Each factory enforces the
//! mandatory fields for its kind, so a message is never half-populated.

use std::fmt;

/// Closed set of message kinds, each with a fixed 3-character wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Acknowledge,
    NoAcknowledge,
    Quit,
    Broadcast,
    Register,
    Update,
    Delete,
    Private,
    History,
    HistoryResponse,
    GroupAdd,
    GroupAck,
    GroupNak,
    GroupDelete,
    GroupUpdate,
    Group,
    Recall,
    Duping,
    Search,
    ParentalControl,
}

/// How many length-prefixed fields follow a given tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FieldShape {
    /// sender, text
    SenderText,
    /// sender, recipient, text
    SenderRecipientText,
    /// sender, direction, recipient, start, end
    Search,
}

impl MessageKind {
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Hello => "HLO",
            MessageKind::Acknowledge => "ACK",
            MessageKind::NoAcknowledge => "NAK",
            MessageKind::Quit => "BYE",
            MessageKind::Broadcast => "BCT",
            MessageKind::Register => "REG",
            MessageKind::Update => "UPD",
            MessageKind::Delete => "DEL",
            MessageKind::Private => "PVT",
            MessageKind::History => "HST",
            MessageKind::HistoryResponse => "HSR",
            MessageKind::GroupAdd => "GAD",
            MessageKind::GroupAck => "GAK",
            MessageKind::GroupNak => "GNK",
            MessageKind::GroupDelete => "GDL",
            MessageKind::GroupUpdate => "GUP",
            MessageKind::Group => "GRP",
            MessageKind::Recall => "RCL",
            MessageKind::Duping => "DUP",
            MessageKind::Search => "SRC",
            MessageKind::ParentalControl => "PRC",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "HLO" => MessageKind::Hello,
            "ACK" => MessageKind::Acknowledge,
            "NAK" => MessageKind::NoAcknowledge,
            "BYE" => MessageKind::Quit,
            "BCT" => MessageKind::Broadcast,
            "REG" => MessageKind::Register,
            "UPD" => MessageKind::Update,
            "DEL" => MessageKind::Delete,
            "PVT" => MessageKind::Private,
            "HST" => MessageKind::History,
            "HSR" => MessageKind::HistoryResponse,
            "GAD" => MessageKind::GroupAdd,
            "GAK" => MessageKind::GroupAck,
            "GNK" => MessageKind::GroupNak,
            "GDL" => MessageKind::GroupDelete,
            "GUP" => MessageKind::GroupUpdate,
            "GRP" => MessageKind::Group,
            "RCL" => MessageKind::Recall,
            "DUP" => MessageKind::Duping,
            "SRC" => MessageKind::Search,
            "PRC" => MessageKind::ParentalControl,
            _ => return None,
        })
    }

    pub(crate) fn shape(self) -> FieldShape {
        match self {
            MessageKind::Private
            | MessageKind::History
            | MessageKind::Group
            | MessageKind::GroupAdd
            | MessageKind::GroupUpdate => FieldShape::SenderRecipientText,
            MessageKind::Search => FieldShape::Search,
            _ => FieldShape::SenderText,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Directionality of an archive search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
    Both,
}

impl Direction {
    pub fn as_wire(self) -> &'static str {
        match self {
            Direction::Sent => "sentTo",
            Direction::Received => "receivedFrom",
            Direction::Both => "both",
        }
    }

    /// `"both"` and `"receivedFrom"` are recognized (case-insensitive);
    /// anything else falls back to [`Direction::Sent`].
    pub fn from_wire(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("both") {
            Direction::Both
        } else if raw.eq_ignore_ascii_case("receivedFrom") {
            Direction::Received
        } else {
            Direction::Sent
        }
    }
}

/// Default number of entries returned by a history request when the
/// client does not supply a parseable count.
pub const DEFAULT_HISTORY_COUNT: u32 = 10;

/// One parsed protocol message. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    kind: MessageKind,
    sender: Option<String>,
    recipient: Option<String>,
    text: Option<String>,
    direction: Option<Direction>,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl ProtocolMessage {
    fn two_field(kind: MessageKind, sender: Option<String>, text: Option<String>) -> Self {
        ProtocolMessage {
            kind,
            sender,
            recipient: None,
            text,
            direction: None,
            start_time: None,
            end_time: None,
        }
    }

    fn three_field(kind: MessageKind, sender: String, recipient: String, text: Option<String>) -> Self {
        ProtocolMessage {
            kind,
            sender: Some(sender),
            recipient: Some(recipient),
            text,
            direction: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Login request. Requires a sender name.
    pub fn hello(sender: impl Into<String>, password: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Hello, Some(sender.into()), Some(password.into()))
    }

    pub fn acknowledge(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(
            MessageKind::Acknowledge,
            Some(sender.into()),
            Some(text.into()),
        )
    }

    pub fn no_acknowledge(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(
            MessageKind::NoAcknowledge,
            Some(sender.into()),
            Some(text.into()),
        )
    }

    pub fn quit(sender: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Quit, Some(sender.into()), None)
    }

    pub fn broadcast(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Broadcast, Some(sender.into()), Some(text.into()))
    }

    pub fn register(sender: impl Into<String>, password: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Register, Some(sender.into()), Some(password.into()))
    }

    pub fn update(sender: impl Into<String>, password: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Update, Some(sender.into()), Some(password.into()))
    }

    pub fn delete(sender: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Delete, Some(sender.into()), None)
    }

    pub fn private(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        ProtocolMessage::three_field(
            MessageKind::Private,
            sender.into(),
            recipient.into(),
            Some(text.into()),
        )
    }

    /// History request. A non-numeric or absent count normalizes to
    /// [`DEFAULT_HISTORY_COUNT`].
    pub fn history(
        sender: impl Into<String>,
        with: impl Into<String>,
        count: Option<&str>,
    ) -> Self {
        let count = count
            .and_then(|c| c.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_HISTORY_COUNT);
        ProtocolMessage::three_field(
            MessageKind::History,
            sender.into(),
            with.into(),
            Some(count.to_string()),
        )
    }

    pub fn history_response(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(
            MessageKind::HistoryResponse,
            Some(sender.into()),
            Some(text.into()),
        )
    }

    pub fn group(
        sender: impl Into<String>,
        group: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        ProtocolMessage::three_field(MessageKind::Group, sender.into(), group.into(), Some(text.into()))
    }

    /// Group creation request. The comma-separated member list travels
    /// in the recipient slot and the group name in the text slot.
    pub fn group_add(
        sender: impl Into<String>,
        group: impl Into<String>,
        members: impl Into<String>,
    ) -> Self {
        ProtocolMessage::three_field(
            MessageKind::GroupAdd,
            sender.into(),
            members.into(),
            Some(group.into()),
        )
    }

    /// Membership replacement request, laid out like [`Self::group_add`].
    pub fn group_update(
        sender: impl Into<String>,
        group: impl Into<String>,
        members: impl Into<String>,
    ) -> Self {
        ProtocolMessage::three_field(
            MessageKind::GroupUpdate,
            sender.into(),
            members.into(),
            Some(group.into()),
        )
    }

    pub fn group_ack(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::GroupAck, Some(sender.into()), Some(text.into()))
    }

    pub fn group_nak(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::GroupNak, Some(sender.into()), Some(text.into()))
    }

    pub fn group_delete(sender: impl Into<String>, group: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::GroupDelete, Some(sender.into()), Some(group.into()))
    }

    pub fn recall(sender: impl Into<String>, text: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Recall, Some(sender.into()), Some(text.into()))
    }

    pub fn duping(sender: impl Into<String>, targets: impl Into<String>) -> Self {
        ProtocolMessage::two_field(MessageKind::Duping, Some(sender.into()), Some(targets.into()))
    }

    pub fn search(
        sender: impl Into<String>,
        direction: Direction,
        target: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        ProtocolMessage {
            kind: MessageKind::Search,
            sender: Some(sender.into()),
            recipient: Some(target.into()),
            text: None,
            direction: Some(direction),
            start_time: Some(start.into()),
            end_time: Some(end.into()),
        }
    }

    pub fn parental_control(sender: impl Into<String>, setting: impl Into<String>) -> Self {
        ProtocolMessage::two_field(
            MessageKind::ParentalControl,
            Some(sender.into()),
            Some(setting.into()),
        )
    }

    /// Assembles a message from decoded wire fields. Returns `None` when a
    /// field a kind treats as mandatory came over as absent.
    pub(crate) fn from_wire(
        kind: MessageKind,
        sender: Option<String>,
        recipient: Option<String>,
        text: Option<String>,
        direction: Option<Direction>,
        start_time: Option<String>,
        end_time: Option<String>,
    ) -> Option<Self> {
        match kind.shape() {
            FieldShape::SenderText => {
                match kind {
                    // A rejection carries only its reason.
                    MessageKind::NoAcknowledge => {}
                    MessageKind::Broadcast
                    | MessageKind::Register
                    | MessageKind::Update
                    | MessageKind::Recall
                    | MessageKind::Duping
                    | MessageKind::GroupDelete
                    | MessageKind::ParentalControl
                    | MessageKind::HistoryResponse
                    | MessageKind::GroupAck
                    | MessageKind::GroupNak
                    | MessageKind::Hello => {
                        sender.as_ref()?;
                        text.as_ref()?;
                    }
                    _ => {
                        sender.as_ref()?;
                    }
                }
                Some(ProtocolMessage::two_field(kind, sender, text))
            }
            FieldShape::SenderRecipientText => {
                let sender = sender?;
                let recipient = recipient?;
                if kind == MessageKind::History {
                    return Some(ProtocolMessage::history(sender, recipient, text.as_deref()));
                }
                let text = text?;
                Some(ProtocolMessage::three_field(kind, sender, recipient, Some(text)))
            }
            FieldShape::Search => Some(ProtocolMessage::search(
                sender?,
                direction?,
                recipient?,
                start_time?,
                end_time?,
            )),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.direction
    }

    pub fn start_time(&self) -> Option<&str> {
        self.start_time.as_deref()
    }

    pub fn end_time(&self) -> Option<&str> {
        self.end_time.as_deref()
    }

    /// Copy of this message with the text replaced, everything else kept.
    /// Used when a delivery path has to redact the payload.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.text = Some(text.into());
        out
    }

    /// Kinds whose payload is shown to a human and therefore subject to
    /// profanity redaction at delivery time.
    pub fn is_displayable(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::Private
                | MessageKind::Group
                | MessageKind::HistoryResponse
                | MessageKind::Broadcast
        )
    }
}
