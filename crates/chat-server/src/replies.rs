//! Canned server replies and distinguished message texts.

use chat_protocol::ProtocolMessage;
use chrono::{DateTime, Datelike, Local, Timelike};

/// Name the server signs its own traffic with.
pub const SERVER_ID: &str = "Relay";

/// Sender name for clock replies.
pub const NIST_ID: &str = "NIST";

/// Sender name for the impatient clock reply.
pub const BBC_ID: &str = "BBC";

/// Sender name for the diagnostic sent when a message carries a sender
/// that does not match the session's login name.
pub const BOUNCER_ID: &str = "Bouncer";

/// Text of the bouncer diagnostic.
pub const BOUNCER_TEXT: &str =
    "Last message was rejected because it specified an incorrect user name.";

/// Broadcast text that tells every connected client to log off.
pub const BOMB_TEXT: &str = "Relay says everyone log off";

/// Terminator appended to every run of archive-retrieval replies.
pub const ARCHIVE_SENTINEL: &str = "end archive retrieval";

/// Reply sent when a group search is refused for a non-member.
pub const NOT_A_MEMBER: &str = "Cannot access because you are not member of that group";

// Commands answered with canned replies. The first three are matched
// ignoring case; the last two must match exactly.
const DATE_COMMAND: &str = "What is the date?";
const TIME_COMMAND: &str = "What time is it?";
const IMPATIENT_COMMAND: &str = "What time is it Mr. Fox?";
const COOL_COMMAND: &str = "WTF";
const QUERY_COMMAND: &str = "How are you?";

/// Returns the canned replies for a broadcast text, or `None` when the
/// text is not a recognized command.
pub fn canned_responses(text: &str, now: DateTime<Local>) -> Option<Vec<ProtocolMessage>> {
    if text.eq_ignore_ascii_case(DATE_COMMAND) {
        let date = format!("{}/{}/{}", now.month(), now.day(), now.year());
        Some(vec![ProtocolMessage::broadcast(NIST_ID, date)])
    } else if text.eq_ignore_ascii_case(TIME_COMMAND) {
        Some(vec![ProtocolMessage::broadcast(NIST_ID, clock_text(now))])
    } else if text.eq_ignore_ascii_case(IMPATIENT_COMMAND) {
        Some(vec![
            ProtocolMessage::broadcast(BBC_ID, format!("The time is now {}", clock_text(now))),
            ProtocolMessage::broadcast(NIST_ID, clock_text(now)),
        ])
    } else if text == COOL_COMMAND {
        Some(vec![ProtocolMessage::broadcast(SERVER_ID, "OMG ROFL TTYL")])
    } else if text == QUERY_COMMAND {
        Some(vec![
            ProtocolMessage::broadcast(SERVER_ID, "Why are you asking me this?"),
            ProtocolMessage::broadcast(SERVER_ID, "I am a computer program. I run."),
        ])
    } else {
        None
    }
}

fn clock_text(now: DateTime<Local>) -> String {
    format!("{}:{:02}", now.hour(), now.minute())
}
