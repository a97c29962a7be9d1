//! Message routing between sessions.
//!
//! The dispatcher owns the session registry and the surveillance set,
//! both behind one mutex, and borrows the directory, archive, and
//! profanity filter it was constructed with. Sessions talk to each other
//! only through it: a session hands the dispatcher a parsed message and
//! the dispatcher fans it out, archives it, and mirrors watched traffic
//! to the surveillance identity.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chat_protocol::ProtocolMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::archive::Archive;
use crate::directory::Directory;
use crate::filter::ProfanityFilter;

pub type SessionId = Uuid;

/// Cheap clonable handle to a running session task. Delivered messages
/// land on the session's general outbound queue.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::UnboundedSender<ProtocolMessage>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        tx: mpsc::UnboundedSender<ProtocolMessage>,
        cancel: CancellationToken,
    ) -> Self {
        SessionHandle { id, tx, cancel }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queues a message. A send to a session that already exited is
    /// silently dropped; the registry catches up on its next deregister.
    pub fn deliver(&self, msg: ProtocolMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct Entry {
    handle: SessionHandle,
    /// Login name, set once the session authenticates.
    name: Option<String>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, Entry>,
    /// Last-known socket address per authenticated user (lowercased
    /// name), kept for the archive's audit trail.
    addresses: HashMap<String, SocketAddr>,
    /// Lowercased user names whose traffic is mirrored.
    watched_users: HashSet<String>,
    /// Lowercased group names whose traffic is mirrored.
    watched_groups: HashSet<String>,
}

pub struct Dispatcher {
    directory: Arc<dyn Directory>,
    archive: Arc<dyn Archive>,
    filter: ProfanityFilter,
    /// Account whose sessions receive mirrored watched traffic.
    surveillance_identity: String,
    inner: Mutex<Registry>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn Directory>,
        archive: Arc<dyn Archive>,
        filter: ProfanityFilter,
        surveillance_identity: String,
    ) -> Self {
        Dispatcher {
            directory,
            archive,
            filter,
            surveillance_identity,
            inner: Mutex::new(Registry::default()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    pub fn filter(&self) -> &ProfanityFilter {
        &self.filter
    }

    pub fn surveillance_identity(&self) -> &str {
        &self.surveillance_identity
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a freshly accepted, not yet authenticated session.
    pub fn register(&self, handle: SessionHandle) {
        let mut reg = self.registry();
        reg.sessions.insert(handle.id(), Entry { handle, name: None });
    }

    /// Records the login name of an authenticated session, and its peer
    /// address for the audit trail.
    pub fn bind_name(&self, id: SessionId, name: &str, address: Option<SocketAddr>) {
        let mut reg = self.registry();
        if let Some(entry) = reg.sessions.get_mut(&id) {
            entry.name = Some(name.to_string());
        }
        if let Some(address) = address {
            reg.addresses.insert(name.to_ascii_lowercase(), address);
        }
    }

    /// The last-known socket address of an authenticated user.
    pub fn address_of(&self, name: &str) -> Option<SocketAddr> {
        self.registry().address_of(name)
    }

    /// Removes a session, dropping its audit address. When the last
    /// surveillance session leaves, the watch lists go with it.
    pub fn deregister(&self, id: SessionId) {
        let mut reg = self.registry();
        let Some(entry) = reg.sessions.remove(&id) else {
            return;
        };
        if let Some(name) = entry.name.as_deref() {
            reg.addresses.remove(&name.to_ascii_lowercase());
        }
        let was_watcher = entry
            .name
            .as_deref()
            .is_some_and(|n| n.eq_ignore_ascii_case(&self.surveillance_identity));
        let watchers_remain = reg.sessions.values().any(|e| {
            e.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(&self.surveillance_identity))
        });
        if was_watcher && !watchers_remain {
            info!(session_id = %id, "surveillance session gone, clearing watch lists");
            reg.watched_users.clear();
            reg.watched_groups.clear();
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry().sessions.len()
    }

    /// Cancels every session. Used on server shutdown.
    pub fn cancel_all(&self) {
        for entry in self.registry().sessions.values() {
            entry.handle.cancel();
        }
    }

    /// Sends a message to every authenticated session, the sender
    /// included.
    pub fn broadcast(&self, msg: &ProtocolMessage) {
        for entry in self.registry().sessions.values() {
            if entry.name.is_some() {
                entry.handle.deliver(msg.clone());
            }
        }
    }

    /// Delivers a private message. Online recipients get it now; an
    /// offline but registered recipient gets it archived as undelivered,
    /// to be flushed on their next login. Watched traffic is mirrored to
    /// the surveillance identity.
    pub fn direct_message(&self, msg: &ProtocolMessage) {
        let Some(recipient) = msg.recipient() else {
            return;
        };
        let mut delivered = false;
        let sender_address;
        let recipient_address;
        {
            let reg = self.registry();
            sender_address = msg.sender().and_then(|s| reg.address_of(s));
            recipient_address = reg.address_of(recipient);
            let watched = reg.is_watched_user(msg.sender()) || reg.is_watched_user(Some(recipient));
            for entry in reg.sessions.values() {
                let Some(name) = entry.name.as_deref() else {
                    continue;
                };
                if name.eq_ignore_ascii_case(recipient) {
                    entry.handle.deliver(msg.clone());
                    delivered = true;
                } else if watched && name.eq_ignore_ascii_case(&self.surveillance_identity) {
                    entry.handle.deliver(msg.clone());
                }
            }
        }
        if delivered {
            self.archive
                .record(msg, true, self.is_flagged(msg), sender_address, recipient_address);
        } else if self.directory.user_exists(recipient) {
            debug!(recipient, "recipient offline, archiving as undelivered");
            self.archive
                .record(msg, false, self.is_flagged(msg), sender_address, None);
        }
    }

    /// Delivers a group message to every online member (the sender is a
    /// member too), archives it once, and forwards it as a private
    /// message to each offline member so they receive it on login.
    /// Returns false when the group does not exist.
    pub fn group_message(&self, msg: &ProtocolMessage) -> bool {
        let Some(group) = msg.recipient() else {
            return false;
        };
        let Some(sender) = msg.sender() else {
            return false;
        };
        let Some(members) = self.directory.group_members(group) else {
            return false;
        };

        let mut offline: Vec<&String> = Vec::new();
        let sender_address;
        {
            let reg = self.registry();
            sender_address = reg.address_of(sender);
            let watched = reg.watched_groups.contains(&group.to_ascii_lowercase())
                || members.iter().any(|m| reg.is_watched_user(Some(m)));
            for member in &members {
                let mut online = false;
                for entry in reg.sessions.values() {
                    if entry
                        .name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(member))
                    {
                        entry.handle.deliver(msg.clone());
                        online = true;
                    }
                }
                if !online {
                    offline.push(member);
                }
            }
            if watched {
                for entry in reg.sessions.values() {
                    if entry
                        .name
                        .as_deref()
                        .is_some_and(|n| n.eq_ignore_ascii_case(&self.surveillance_identity))
                    {
                        entry.handle.deliver(msg.clone());
                    }
                }
            }
        }

        self.archive
            .record(msg, true, self.is_flagged(msg), sender_address, None);

        // Offline members get the group message replayed as a private
        // message on their next login.
        let text = msg.text().unwrap_or_default();
        for member in offline {
            let replay = ProtocolMessage::private(sender, member.as_str(), text);
            self.direct_message(&replay);
        }
        true
    }

    /// Drains the undelivered messages archived for `user`, marking them
    /// delivered. The caller queues them on the freshly logged-in
    /// session.
    pub fn queued_messages(&self, user: &str) -> Vec<ProtocolMessage> {
        let queued = self.archive.queued_for(user);
        if queued.is_empty() {
            return Vec::new();
        }
        self.archive.mark_delivered(user, self.address_of(user));
        queued
            .into_iter()
            .map(|q| ProtocolMessage::private(q.sender, user, q.text))
            .collect()
    }

    /// Merges a watch request into the surveillance set. A payload
    /// naming an existing group watches that group and all its members;
    /// anything else is taken as a comma-separated user list.
    pub fn merge_watch(&self, payload: &str) {
        let mut reg = self.registry();
        if let Some(members) = self.directory.group_members(payload) {
            reg.watched_groups.insert(payload.to_ascii_lowercase());
            for member in members {
                reg.watched_users.insert(member.to_ascii_lowercase());
            }
        } else {
            for name in payload.split(',') {
                let name = name.trim();
                if !name.is_empty() {
                    reg.watched_users.insert(name.to_ascii_lowercase());
                }
            }
        }
        info!(
            watched_users = reg.watched_users.len(),
            watched_groups = reg.watched_groups.len(),
            "surveillance set updated"
        );
    }

    /// True when the message text trips the profanity filter for a pair
    /// with parental control active. Such messages are archived flagged.
    pub fn is_flagged(&self, msg: &ProtocolMessage) -> bool {
        let Some(text) = msg.text() else {
            return false;
        };
        self.directory
            .parental_control_involved(msg.sender(), msg.recipient())
            && self.filter.contains_profanity(text)
    }

    /// Send-time redaction: displayable messages between a pair with
    /// parental control active get their text replaced by asterisks.
    pub fn redact_for_delivery(&self, msg: &ProtocolMessage) -> ProtocolMessage {
        let Some(text) = msg.text() else {
            return msg.clone();
        };
        if !msg.is_displayable() {
            return msg.clone();
        }
        if self
            .directory
            .parental_control_involved(msg.sender(), msg.recipient())
        {
            msg.with_text(self.filter.redact(text))
        } else {
            msg.clone()
        }
    }
}

impl Registry {
    fn is_watched_user(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| self.watched_users.contains(&n.to_ascii_lowercase()))
    }

    fn address_of(&self, name: &str) -> Option<SocketAddr> {
        self.addresses.get(&name.to_ascii_lowercase()).copied()
    }
}
