//! Message archival and retrieval.
//!
//! Every direct and group message is recorded here with its delivery
//! status. The archive answers history requests, searches, offline-queue
//! flushes, and recalls. [`InMemoryArchive`] keeps records in a
//! mutex-guarded vector in insertion (chronological) order; retrieval
//! walks it newest-first.

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chat_protocol::{Direction, MessageKind, ProtocolMessage};
use chrono::{DateTime, Utc};

/// Timestamp format used in formatted archive entries.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One archived message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub sent_time: DateTime<Utc>,
    pub kind: MessageKind,
    pub sender: String,
    /// Socket address the sender was connected from, for the audit trail.
    pub sender_address: Option<SocketAddr>,
    pub to_user: Option<String>,
    pub to_group: Option<String>,
    /// Socket address the message was delivered to, set at delivery time.
    pub recipient_address: Option<SocketAddr>,
    pub text: String,
    /// False while the recipient has not yet been online to receive it.
    pub delivered: bool,
    /// True when the text tripped the profanity filter for a watched pair.
    pub flagged: bool,
}

/// An undelivered message waiting for its recipient to log in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub sender: String,
    pub text: String,
}

/// What a search runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTarget {
    /// Wildcard `*`: everything involving the requester.
    Everyone,
    User(String),
    Group(String),
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub requester: String,
    pub direction: Direction,
    pub target: SearchTarget,
    /// Exclusive lower bound; `None` is unbounded.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive upper bound; `None` is unbounded.
    pub end: Option<DateTime<Utc>>,
}

/// Message storage and retrieval.
pub trait Archive: Send + Sync {
    /// Records a message with its delivery and flagged status, plus the
    /// parties' last-known socket addresses for the audit trail.
    fn record(
        &self,
        msg: &ProtocolMessage,
        delivered: bool,
        flagged: bool,
        sender_address: Option<SocketAddr>,
        recipient_address: Option<SocketAddr>,
    );

    /// Undelivered messages addressed to `user`, oldest first.
    fn queued_for(&self, user: &str) -> Vec<QueuedMessage>;

    /// Marks everything addressed to `user` as delivered, recording the
    /// address the flush went to.
    fn mark_delivered(&self, user: &str, address: Option<SocketAddr>);

    /// Marks undelivered messages from `sender` with matching text as
    /// recalled, so they are never flushed to the recipient.
    fn recall(&self, sender: &str, text: &str);

    /// Formatted history entries, newest first, at most `limit`. A group
    /// target returns everything sent to that group; a user target
    /// returns the traffic between requester and target in both
    /// directions, recalls excluded.
    fn history(&self, requester: &str, target: &str, target_is_group: bool, limit: usize)
        -> Vec<String>;

    /// Formatted search results, newest first. Group-membership
    /// authorization is the caller's responsibility.
    fn search(&self, query: &SearchQuery) -> Vec<String>;
}

/// Mutex-guarded in-memory archive.
#[derive(Default)]
pub struct InMemoryArchive {
    inner: Mutex<Vec<StoredMessage>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn records(&self) -> MutexGuard<'_, Vec<StoredMessage>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn push(&self, record: StoredMessage) {
        self.records().push(record);
    }
}

impl Archive for InMemoryArchive {
    fn record(
        &self,
        msg: &ProtocolMessage,
        delivered: bool,
        flagged: bool,
        sender_address: Option<SocketAddr>,
        recipient_address: Option<SocketAddr>,
    ) {
        let (to_user, to_group) = match msg.kind() {
            MessageKind::Group => (None, msg.recipient().map(str::to_string)),
            _ => (msg.recipient().map(str::to_string), None),
        };
        self.records().push(StoredMessage {
            sent_time: Utc::now(),
            kind: msg.kind(),
            sender: msg.sender().unwrap_or_default().to_string(),
            sender_address,
            to_user,
            to_group,
            recipient_address,
            text: msg.text().unwrap_or_default().to_string(),
            delivered,
            flagged,
        });
    }

    fn queued_for(&self, user: &str) -> Vec<QueuedMessage> {
        self.records()
            .iter()
            .filter(|r| !r.delivered && r.to_user.as_deref() == Some(user))
            .map(|r| QueuedMessage {
                sender: r.sender.clone(),
                text: r.text.clone(),
            })
            .collect()
    }

    fn mark_delivered(&self, user: &str, address: Option<SocketAddr>) {
        let now = Utc::now();
        for record in self.records().iter_mut() {
            if !record.delivered && record.to_user.as_deref() == Some(user) {
                record.delivered = true;
                record.sent_time = now;
                if address.is_some() {
                    record.recipient_address = address;
                }
            }
        }
    }

    fn recall(&self, sender: &str, text: &str) {
        let now = Utc::now();
        for record in self.records().iter_mut() {
            if !record.delivered && record.sender == sender && record.text == text {
                record.delivered = true;
                record.kind = MessageKind::Recall;
                record.sent_time = now;
            }
        }
    }

    fn history(
        &self,
        requester: &str,
        target: &str,
        target_is_group: bool,
        limit: usize,
    ) -> Vec<String> {
        let records = self.records();
        let matches: Box<dyn Fn(&StoredMessage) -> bool> = if target_is_group {
            Box::new(|r: &StoredMessage| r.to_group.as_deref() == Some(target))
        } else {
            Box::new(|r: &StoredMessage| {
                r.kind != MessageKind::Recall
                    && ((r.sender == requester && r.to_user.as_deref() == Some(target))
                        || (r.sender == target && r.to_user.as_deref() == Some(requester)))
            })
        };
        records
            .iter()
            .rev()
            .filter(|r| matches(r))
            .take(limit)
            .map(|r| format_entry(r, false))
            .collect()
    }

    fn search(&self, query: &SearchQuery) -> Vec<String> {
        let records = self.records();
        records
            .iter()
            .rev()
            .filter(|r| in_window(r, query))
            .filter(|r| matches_target(r, query))
            .map(|r| format_entry(r, true))
            .collect()
    }
}

fn in_window(record: &StoredMessage, query: &SearchQuery) -> bool {
    if let Some(start) = query.start {
        if record.sent_time <= start {
            return false;
        }
    }
    if let Some(end) = query.end {
        if record.sent_time >= end {
            return false;
        }
    }
    true
}

fn matches_target(record: &StoredMessage, query: &SearchQuery) -> bool {
    let me = query.requester.as_str();
    let sent = record.sender == me;
    let received = record.to_user.as_deref() == Some(me);
    match &query.target {
        SearchTarget::Everyone => match query.direction {
            Direction::Both => sent || received,
            Direction::Received => received,
            Direction::Sent => sent,
        },
        SearchTarget::Group(group) => {
            if record.to_group.as_deref() != Some(group.as_str()) {
                return false;
            }
            match query.direction {
                Direction::Both => true,
                Direction::Received => !sent,
                Direction::Sent => sent,
            }
        }
        SearchTarget::User(user) => {
            if record.kind == MessageKind::Recall {
                return false;
            }
            let from_them = record.sender == *user && received;
            let to_them = sent && record.to_user.as_deref() == Some(user.as_str());
            match query.direction {
                Direction::Both => from_them || to_them,
                Direction::Received => from_them,
                Direction::Sent => to_them,
            }
        }
    }
}

fn format_entry(record: &StoredMessage, include_target: bool) -> String {
    let time = record.sent_time.format(TIME_FORMAT);
    let mut out = format!(
        "time: {} type: {} from: {}",
        time,
        record.kind.tag(),
        record.sender
    );
    if include_target {
        let target = record
            .to_group
            .as_deref()
            .or(record.to_user.as_deref())
            .unwrap_or_default();
        out.push_str(&format!(" to: {target}"));
    }
    out.push_str(&format!(" text: {}", record.text));
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, minute, 0).unwrap()
    }

    fn stored(
        minute: u32,
        kind: MessageKind,
        sender: &str,
        to_user: Option<&str>,
        to_group: Option<&str>,
        text: &str,
        delivered: bool,
    ) -> StoredMessage {
        StoredMessage {
            sent_time: at(minute),
            kind,
            sender: sender.to_string(),
            sender_address: None,
            to_user: to_user.map(str::to_string),
            to_group: to_group.map(str::to_string),
            recipient_address: None,
            text: text.to_string(),
            delivered,
            flagged: false,
        }
    }

    fn pair_archive() -> InMemoryArchive {
        let archive = InMemoryArchive::new();
        archive.push(stored(1, MessageKind::Private, "alice", Some("bob"), None, "first", true));
        archive.push(stored(2, MessageKind::Private, "bob", Some("alice"), None, "second", true));
        archive.push(stored(3, MessageKind::Private, "alice", Some("bob"), None, "third", true));
        archive.push(stored(4, MessageKind::Private, "alice", Some("carol"), None, "other", true));
        archive
    }

    #[test]
    fn record_splits_user_and_group_targets() {
        let archive = InMemoryArchive::new();
        archive.record(&ProtocolMessage::private("alice", "bob", "hi"), true, false, None, None);
        archive.record(&ProtocolMessage::group("alice", "team", "yo"), true, false, None, None);

        let records = archive.records();
        assert_eq!(records[0].to_user.as_deref(), Some("bob"));
        assert_eq!(records[0].to_group, None);
        assert_eq!(records[1].to_group.as_deref(), Some("team"));
        assert_eq!(records[1].to_user, None);
    }

    #[test]
    fn record_keeps_party_addresses() {
        let archive = InMemoryArchive::new();
        let from: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let to: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        archive.record(
            &ProtocolMessage::private("alice", "bob", "hi"),
            true,
            false,
            Some(from),
            Some(to),
        );

        let records = archive.records();
        assert_eq!(records[0].sender_address, Some(from));
        assert_eq!(records[0].recipient_address, Some(to));
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let archive = pair_archive();

        let lines = archive.history("alice", "bob", false, 10);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("text: third"));
        assert!(lines[1].ends_with("text: second"));
        assert!(lines[2].ends_with("text: first"));

        let lines = archive.history("alice", "bob", false, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("text: third"));
    }

    #[test]
    fn history_skips_recalled_messages() {
        let archive = pair_archive();
        archive.push(stored(5, MessageKind::Recall, "alice", Some("bob"), None, "oops", true));

        let lines = archive.history("alice", "bob", false, 10);
        assert!(!lines.iter().any(|l| l.contains("oops")));
    }

    #[test]
    fn group_history_collects_group_traffic() {
        let archive = InMemoryArchive::new();
        archive.push(stored(1, MessageKind::Group, "alice", None, Some("team"), "one", true));
        archive.push(stored(2, MessageKind::Group, "bob", None, Some("team"), "two", true));
        archive.push(stored(3, MessageKind::Group, "bob", None, Some("band"), "off", true));

        let lines = archive.history("carol", "team", true, 10);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("text: two"));
        assert!(lines[1].ends_with("text: one"));
    }

    #[test]
    fn queued_flow_flushes_once() {
        let archive = InMemoryArchive::new();
        archive.record(&ProtocolMessage::private("alice", "bob", "while away"), false, false, None, None);
        archive.record(&ProtocolMessage::private("alice", "bob", "seen live"), true, false, None, None);

        let queued = archive.queued_for("bob");
        assert_eq!(
            queued,
            vec![QueuedMessage {
                sender: "alice".to_string(),
                text: "while away".to_string(),
            }]
        );

        archive.mark_delivered("bob", None);
        assert!(archive.queued_for("bob").is_empty());
    }

    #[test]
    fn mark_delivered_records_the_flush_address() {
        let archive = InMemoryArchive::new();
        let from: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        archive.record(
            &ProtocolMessage::private("alice", "bob", "later"),
            false,
            false,
            Some(from),
            None,
        );

        let to: SocketAddr = "10.0.0.2:6000".parse().unwrap();
        archive.mark_delivered("bob", Some(to));

        let records = archive.records();
        assert!(records[0].delivered);
        assert_eq!(records[0].sender_address, Some(from));
        assert_eq!(records[0].recipient_address, Some(to));
    }

    #[test]
    fn recall_pulls_undelivered_matching_text() {
        let archive = InMemoryArchive::new();
        archive.record(&ProtocolMessage::private("alice", "bob", "take it back"), false, false, None, None);
        archive.record(&ProtocolMessage::private("alice", "bob", "keep this"), false, false, None, None);

        archive.recall("alice", "take it back");

        let queued = archive.queued_for("bob");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].text, "keep this");
    }

    #[test]
    fn search_directions_for_a_user_target() {
        let archive = pair_archive();
        let query = |direction| SearchQuery {
            requester: "alice".to_string(),
            direction,
            target: SearchTarget::User("bob".to_string()),
            start: None,
            end: None,
        };

        assert_eq!(archive.search(&query(Direction::Both)).len(), 3);
        assert_eq!(archive.search(&query(Direction::Sent)).len(), 2);
        assert_eq!(archive.search(&query(Direction::Received)).len(), 1);
    }

    #[test]
    fn search_wildcard_covers_all_traffic() {
        let archive = pair_archive();
        let results = archive.search(&SearchQuery {
            requester: "alice".to_string(),
            direction: Direction::Both,
            target: SearchTarget::Everyone,
            start: None,
            end: None,
        });
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn search_results_are_newest_first() {
        let archive = pair_archive();
        let results = archive.search(&SearchQuery {
            requester: "alice".to_string(),
            direction: Direction::Both,
            target: SearchTarget::User("bob".to_string()),
            start: None,
            end: None,
        });

        assert_eq!(results.len(), 3);
        assert!(results[0].ends_with("text: third"));
        assert!(results[1].ends_with("text: second"));
        assert!(results[2].ends_with("text: first"));
    }

    #[test]
    fn search_window_bounds_are_exclusive() {
        let archive = pair_archive();
        let results = archive.search(&SearchQuery {
            requester: "alice".to_string(),
            direction: Direction::Both,
            target: SearchTarget::User("bob".to_string()),
            start: Some(at(1)),
            end: Some(at(3)),
        });
        assert_eq!(results.len(), 1);
        assert!(results[0].ends_with("text: second"));
    }

    #[test]
    fn search_entries_name_their_target() {
        let archive = InMemoryArchive::new();
        archive.push(stored(1, MessageKind::Group, "alice", None, Some("team"), "yo", true));

        let results = archive.search(&SearchQuery {
            requester: "alice".to_string(),
            direction: Direction::Sent,
            target: SearchTarget::Group("team".to_string()),
            start: None,
            end: None,
        });
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("type: GRP"));
        assert!(results[0].contains("to: team"));
    }
}
