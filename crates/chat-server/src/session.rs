//! Per-connection session task.
//!
//! Each accepted socket gets one task running [`Session::run`]. The task
//! multiplexes three inputs (socket frames, deliveries from other
//! sessions, a fixed-interval tick) and does all real work on the tick:
//! at most one inbound frame is processed per tick, then the outbound
//! queues are drained in order (immediate, then held-back delayed
//! replies, then general), then termination conditions are checked.
//!
//! A session is unauthenticated until a successful HELLO or REGISTER.
//! A rejected login gets exactly one NAK and the session closes once
//! that NAK has been flushed; there is no second attempt on the same
//! connection.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{Direction, MessageKind, ProtocolMessage};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{SearchQuery, SearchTarget};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, SessionHandle, SessionId};
use crate::errors::SessionError;
use crate::net::{FrameReader, FrameWriter};
use crate::replies;

/// Format accepted for search time bounds. Anything else makes the
/// bound unbounded.
const BOUND_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const LANGUAGE_WARNING_BROADCAST: &str =
    "Watch your language! The last message you sent has been marked as inappropriate.";

const LANGUAGE_WARNING_DIRECT: &str = "Watch your language! The last message you sent was sent \
     from or sent to a user that has parental controls on and has been marked as inappropriate.";

pub struct Session<W> {
    id: SessionId,
    dispatcher: Arc<Dispatcher>,
    writer: FrameWriter<W>,
    cancel: CancellationToken,
    /// Peer socket address, kept for the delivery audit trail.
    peer: Option<SocketAddr>,

    /// Login name, set once on successful authentication.
    name: Option<String>,
    authenticated: bool,
    /// Set when the single allowed login attempt failed; the session
    /// closes as soon as its queues drain.
    login_rejected: bool,
    terminate: bool,

    inbound: VecDeque<ProtocolMessage>,
    immediate: VecDeque<ProtocolMessage>,
    delayed: VecDeque<ProtocolMessage>,
    /// When the held-back delayed replies become eligible to flush.
    delayed_ready_at: Option<Instant>,
    general: VecDeque<ProtocolMessage>,

    last_activity: Instant,
    tick_interval: Duration,
    delayed_hold: Duration,
    preauth_idle: Duration,
    authed_idle: Duration,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Session<W> {
    /// Spawns the session task and returns its handle. The handle is
    /// also registered with the dispatcher.
    pub fn spawn<R>(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        peer: Option<SocketAddr>,
        dispatcher: Arc<Dispatcher>,
        config: &Config,
        parent: &CancellationToken,
    ) -> SessionHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let handle = SessionHandle::new(id, tx, cancel.clone());
        dispatcher.register(handle.clone());

        let session = Session {
            id,
            dispatcher,
            writer,
            cancel,
            peer,
            name: None,
            authenticated: false,
            login_rejected: false,
            terminate: false,
            inbound: VecDeque::new(),
            immediate: VecDeque::new(),
            delayed: VecDeque::new(),
            delayed_ready_at: None,
            general: VecDeque::new(),
            last_activity: Instant::now(),
            tick_interval: config.tick_interval,
            delayed_hold: config.delayed_response_hold,
            preauth_idle: config.preauth_idle_timeout,
            authed_idle: config.authed_idle_timeout,
        };
        tokio::spawn(session.run(reader, rx));
        handle
    }

    async fn run<R>(
        mut self,
        mut reader: FrameReader<R>,
        mut rx: mpsc::UnboundedReceiver<ProtocolMessage>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reader_open = true;
        let cancel = self.cancel.clone();

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(err) => break Err(err),
                    }
                }
                frame = reader.next_frame(), if reader_open => match frame {
                    Ok(Some(msg)) => self.inbound.push_back(msg),
                    Ok(None) => {
                        reader_open = false;
                        self.terminate = true;
                    }
                    Err(err) => break Err(err),
                },
                Some(msg) = rx.recv() => self.general.push_back(msg),
            }
        };

        match outcome {
            Ok(()) => info!(
                session_id = %self.id,
                user = self.name.as_deref().unwrap_or("-"),
                "session closed"
            ),
            Err(err) => warn!(
                session_id = %self.id,
                user = self.name.as_deref().unwrap_or("-"),
                error = %err,
                "session failed"
            ),
        }
        self.dispatcher.deregister(self.id);
        self.cancel.cancel();
    }

    /// One scheduled unit of work. Returns true when the session should
    /// end.
    async fn tick(&mut self) -> Result<bool, SessionError> {
        if let Some(msg) = self.inbound.pop_front() {
            if self.authenticated {
                self.last_activity = Instant::now();
                self.handle_message(msg);
            } else {
                self.handle_preauth(msg);
            }
        }

        while let Some(msg) = self.immediate.pop_front() {
            self.send(&msg).await?;
        }

        // Delayed replies are flushed after the hold-back, or early when
        // other traffic is about to go out anyway.
        let flush_delayed = !self.delayed.is_empty()
            && (!self.authenticated
                || !self.general.is_empty()
                || self.delayed_ready_at.is_some_and(|at| at <= Instant::now()));
        if flush_delayed {
            while let Some(msg) = self.delayed.pop_front() {
                self.send(&msg).await?;
            }
            self.delayed_ready_at = None;
        }

        while let Some(msg) = self.general.pop_front() {
            self.send(&msg).await?;
        }

        if self.terminate {
            return Ok(true);
        }
        if self.login_rejected && self.queues_empty() {
            info!(session_id = %self.id, "closing session after rejected login");
            return Ok(true);
        }
        let idle_limit = if self.authenticated {
            self.authed_idle
        } else {
            self.preauth_idle
        };
        if self.last_activity.elapsed() >= idle_limit {
            info!(
                session_id = %self.id,
                user = self.name.as_deref().unwrap_or("-"),
                "timing out an inactive session"
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn queues_empty(&self) -> bool {
        self.immediate.is_empty() && self.delayed.is_empty() && self.general.is_empty()
    }

    async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), SessionError> {
        let out = self.dispatcher.redact_for_delivery(msg);
        self.writer.send(&out).await
    }

    fn session_name(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    fn sender_matches(&self, msg: &ProtocolMessage) -> bool {
        match (&self.name, msg.sender()) {
            (Some(name), Some(sender)) => sender.eq_ignore_ascii_case(name),
            _ => false,
        }
    }

    fn is_bomb(msg: &ProtocolMessage) -> bool {
        msg.text()
            .is_some_and(|t| t.eq_ignore_ascii_case(replies::BOMB_TEXT))
    }

    /// The log-off broadcast: every client is told to quit and this
    /// session drops back to the unauthenticated state.
    fn trigger_bomb(&mut self) {
        let name = self.session_name();
        info!(session_id = %self.id, user = %name, "log-off broadcast triggered");
        self.dispatcher.broadcast(&ProtocolMessage::quit(name));
        self.authenticated = false;
    }

    fn push_delayed(&mut self, responses: Vec<ProtocolMessage>) {
        if self.delayed.is_empty() {
            self.delayed_ready_at = Some(Instant::now() + self.delayed_hold);
        }
        self.delayed.extend(responses);
    }

    // Messages before authentication: only HELLO and REGISTER count.

    fn handle_preauth(&mut self, msg: ProtocolMessage) {
        match msg.kind() {
            MessageKind::Hello => self.handle_login(&msg),
            MessageKind::Register => self.handle_register(&msg),
            kind => debug!(session_id = %self.id, %kind, "ignoring pre-login message"),
        }
    }

    fn handle_login(&mut self, msg: &ProtocolMessage) {
        let name = msg.sender().unwrap_or_default().to_string();
        let password = msg.text().unwrap_or_default();
        if self.dispatcher.directory().check_credentials(&name, password) {
            self.authenticate(name.clone());
            self.general
                .push_back(ProtocolMessage::acknowledge(&name, "Login Successful"));
            for queued in self.dispatcher.queued_messages(&name) {
                self.general.push_back(queued);
            }
        } else {
            info!(session_id = %self.id, user = %name, "login rejected");
            self.login_rejected = true;
            self.general.push_back(ProtocolMessage::no_acknowledge(
                name,
                "Login unsuccessful, please enter valid credentials or register",
            ));
        }
    }

    fn handle_register(&mut self, msg: &ProtocolMessage) {
        let name = msg.sender().unwrap_or_default().to_string();
        let password = msg.text().unwrap_or_default();
        if self.dispatcher.filter().contains_profanity(&name) {
            self.login_rejected = true;
            self.general.push_back(ProtocolMessage::no_acknowledge(
                name,
                "Username cannot contain profanity, please connect again with a different username",
            ));
        } else if !self.dispatcher.directory().add_user(&name, password) {
            self.login_rejected = true;
            self.general.push_back(ProtocolMessage::no_acknowledge(
                name,
                "Username exists, please connect again with a different username",
            ));
        } else {
            self.authenticate(name.clone());
            self.general.push_back(ProtocolMessage::acknowledge(
                &name,
                "Registration successful, start sending messages",
            ));
        }
    }

    fn authenticate(&mut self, name: String) {
        info!(session_id = %self.id, user = %name, "session authenticated");
        self.dispatcher.bind_name(self.id, &name, self.peer);
        self.name = Some(name);
        self.authenticated = true;
        self.last_activity = Instant::now();
    }

    // Messages after authentication.

    fn handle_message(&mut self, msg: ProtocolMessage) {
        match msg.kind() {
            MessageKind::Broadcast => self.handle_broadcast(&msg),
            MessageKind::Private => self.handle_private(&msg),
            MessageKind::Group => self.handle_group(&msg),
            MessageKind::Recall => self.handle_recall(&msg),
            MessageKind::Update => self.handle_update(&msg),
            MessageKind::Delete => self.handle_delete(),
            MessageKind::GroupAdd | MessageKind::GroupUpdate | MessageKind::GroupDelete => {
                self.handle_group_admin(&msg);
            }
            MessageKind::History => self.handle_history(&msg),
            MessageKind::Search => self.handle_search(&msg),
            MessageKind::Duping => self.handle_duping(&msg),
            MessageKind::ParentalControl => self.handle_parental_control(&msg),
            MessageKind::Quit => {
                self.terminate = true;
                self.general
                    .push_back(ProtocolMessage::quit(self.session_name()));
            }
            kind => debug!(session_id = %self.id, %kind, "ignoring message kind"),
        }
    }

    fn handle_broadcast(&mut self, msg: &ProtocolMessage) {
        if !self.sender_matches(msg) {
            self.general.push_back(ProtocolMessage::broadcast(
                replies::BOUNCER_ID,
                replies::BOUNCER_TEXT,
            ));
            return;
        }
        let text = msg.text().unwrap_or_default().to_string();
        if let Some(responses) = replies::canned_responses(&text, Local::now()) {
            self.push_delayed(responses);
            return;
        }
        if self
            .dispatcher
            .directory()
            .parental_control_involved(msg.sender(), None)
            && self.dispatcher.filter().contains_profanity(&text)
        {
            let name = self.session_name();
            self.general.push_back(ProtocolMessage::history_response(
                name,
                LANGUAGE_WARNING_BROADCAST,
            ));
        }
        if Self::is_bomb(msg) {
            self.trigger_bomb();
        } else {
            self.dispatcher.broadcast(msg);
        }
    }

    fn handle_private(&mut self, msg: &ProtocolMessage) {
        if !self.sender_matches(msg) {
            return;
        }
        if self.dispatcher.is_flagged(msg) {
            let name = self.session_name();
            self.general
                .push_back(ProtocolMessage::history_response(name, LANGUAGE_WARNING_DIRECT));
        }
        if Self::is_bomb(msg) {
            self.trigger_bomb();
            return;
        }
        self.dispatcher.direct_message(msg);
    }

    fn handle_group(&mut self, msg: &ProtocolMessage) {
        if !self.sender_matches(msg) {
            return;
        }
        if self.dispatcher.is_flagged(msg) {
            let name = self.session_name();
            self.general
                .push_back(ProtocolMessage::history_response(name, LANGUAGE_WARNING_DIRECT));
        }
        if Self::is_bomb(msg) {
            self.trigger_bomb();
            return;
        }
        if !self.dispatcher.group_message(msg) {
            let name = self.session_name();
            self.general.push_back(ProtocolMessage::group_nak(
                name,
                "Group message undeliverable, no such group",
            ));
        }
    }

    fn handle_recall(&mut self, msg: &ProtocolMessage) {
        if !self.sender_matches(msg) {
            return;
        }
        if Self::is_bomb(msg) {
            self.trigger_bomb();
            return;
        }
        let name = self.session_name();
        let text = msg.text().unwrap_or_default();
        self.dispatcher.archive().recall(&name, text);
    }

    fn handle_update(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        self.dispatcher
            .directory()
            .update_password(&name, msg.text().unwrap_or_default());
        self.general.push_back(ProtocolMessage::acknowledge(
            name,
            "Password update successful, start sending messages",
        ));
    }

    fn handle_delete(&mut self) {
        let name = self.session_name();
        self.dispatcher.directory().delete_user(&name);
        self.general.push_back(ProtocolMessage::no_acknowledge(
            name,
            "Your user has been deleted",
        ));
    }

    /// Group administration. These kinds carry the group name in the
    /// text slot and the member list in the recipient slot.
    fn handle_group_admin(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        let group = msg.text().unwrap_or_default().to_string();
        let directory = self.dispatcher.directory();
        let reply = match msg.kind() {
            MessageKind::GroupAdd => {
                let members = split_members(msg.recipient());
                if msg.recipient().is_none_or(str::is_empty)
                    || !directory.create_group(&group, &members)
                {
                    ProtocolMessage::group_nak(name, "Group creation unsuccessful")
                } else {
                    ProtocolMessage::group_ack(name, "Group creation successful")
                }
            }
            MessageKind::GroupUpdate => {
                if directory.update_group(&group, &split_members(msg.recipient())) {
                    ProtocolMessage::group_ack(name, "Group update successful")
                } else {
                    ProtocolMessage::group_nak(name, "Group update unsuccessful")
                }
            }
            MessageKind::GroupDelete => {
                if directory.delete_group(&group) {
                    ProtocolMessage::group_ack(name, "Group deletion successful")
                } else {
                    ProtocolMessage::group_nak(name, "Group deletion unsuccessful")
                }
            }
            _ => return,
        };
        self.general.push_back(reply);
    }

    fn handle_history(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        let target = msg.recipient().unwrap_or_default();
        let limit = msg
            .text()
            .and_then(|t| t.parse().ok())
            .unwrap_or(chat_protocol::message::DEFAULT_HISTORY_COUNT as usize);
        let is_group = self.dispatcher.directory().group_exists(target);
        let lines = self
            .dispatcher
            .archive()
            .history(&name, target, is_group, limit);
        self.push_retrieval(&name, lines);
    }

    fn handle_search(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        let target_raw = msg.recipient().unwrap_or_default();
        let direction = msg.direction().unwrap_or(Direction::Sent);

        let target = if target_raw == "*" {
            SearchTarget::Everyone
        } else if self.dispatcher.directory().group_exists(target_raw) {
            let members = self
                .dispatcher
                .directory()
                .group_members(target_raw)
                .unwrap_or_default();
            if !members.iter().any(|m| m.eq_ignore_ascii_case(&name)) {
                self.push_retrieval(&name, vec![replies::NOT_A_MEMBER.to_string()]);
                return;
            }
            SearchTarget::Group(target_raw.to_string())
        } else {
            SearchTarget::User(target_raw.to_string())
        };

        let query = SearchQuery {
            requester: name.clone(),
            direction,
            target,
            start: parse_bound(msg.start_time()),
            end: parse_bound(msg.end_time()),
        };
        let lines = self.dispatcher.archive().search(&query);
        self.push_retrieval(&name, lines);
    }

    /// Queues retrieval results on the immediate queue, terminated by
    /// the sentinel frame.
    fn push_retrieval(&mut self, name: &str, lines: Vec<String>) {
        for line in lines {
            self.immediate
                .push_back(ProtocolMessage::history_response(name, line));
        }
        self.immediate.push_back(ProtocolMessage::history_response(
            name,
            replies::ARCHIVE_SENTINEL,
        ));
    }

    fn handle_duping(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        if !name.eq_ignore_ascii_case(self.dispatcher.surveillance_identity()) {
            debug!(session_id = %self.id, user = %name, "ignoring watch request from non-surveillance user");
            return;
        }
        self.dispatcher.merge_watch(msg.text().unwrap_or_default());
    }

    fn handle_parental_control(&mut self, msg: &ProtocolMessage) {
        let name = self.session_name();
        let setting = msg.text().unwrap_or_default();
        let reply = if self.dispatcher.directory().set_parental_control(&name, setting) {
            ProtocolMessage::history_response(
                &name,
                format!("Parental controls have been changed to: {setting}"),
            )
        } else {
            ProtocolMessage::history_response(
                &name,
                "Parental controls could not be changed. Enter \"PRC <on or off>\" again",
            )
        };
        self.general.push_back(reply);
    }
}

fn split_members(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bound(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    NaiveDateTime::parse_from_str(raw, BOUND_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::archive::InMemoryArchive;
    use crate::directory::{Directory, InMemoryDirectory};
    use crate::filter::ProfanityFilter;
    use std::collections::HashMap;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct TestClient {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl TestClient {
        async fn send(&mut self, msg: &ProtocolMessage) {
            self.writer
                .write_all(&chat_protocol::encode(msg))
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> ProtocolMessage {
            self.reader
                .next_frame()
                .await
                .unwrap()
                .expect("expected a frame, got end of stream")
        }

        async fn expect_eof(&mut self) {
            assert!(self.reader.next_frame().await.unwrap().is_none());
        }

        async fn login(&mut self, name: &str, password: &str) {
            self.send(&ProtocolMessage::hello(name, password)).await;
            let ack = self.recv().await;
            assert_eq!(ack.kind(), MessageKind::Acknowledge);
        }
    }

    fn test_dispatcher(users: &[&str]) -> Arc<Dispatcher> {
        let directory = Arc::new(InMemoryDirectory::new());
        for user in users {
            directory.add_user(user, "pw");
        }
        Arc::new(Dispatcher::new(
            directory,
            Arc::new(InMemoryArchive::new()),
            ProfanityFilter::from_words(["badword".to_string()]),
            "agency".to_string(),
        ))
    }

    fn connect(dispatcher: &Arc<Dispatcher>) -> TestClient {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        Session::spawn(
            FrameReader::new(server_read),
            FrameWriter::new(server_write, config.write_retry_limit),
            None,
            Arc::clone(dispatcher),
            &config,
            &CancellationToken::new(),
        );
        let (client_read, client_write) = tokio::io::split(client);
        TestClient {
            reader: FrameReader::new(client_read),
            writer: client_write,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_login_is_acknowledged() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);

        client.send(&ProtocolMessage::hello("alice", "pw")).await;
        let ack = client.recv().await;
        assert_eq!(ack.kind(), MessageKind::Acknowledge);
        assert_eq!(ack.sender(), Some("alice"));
        assert_eq!(ack.text(), Some("Login Successful"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_gets_one_nak_then_the_session_closes() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);

        client.send(&ProtocolMessage::hello("alice", "wrong")).await;
        let nak = client.recv().await;
        assert_eq!(nak.kind(), MessageKind::NoAcknowledge);
        client.expect_eof().await;
    }

    #[tokio::test(start_paused = true)]
    async fn registration_creates_the_account_and_logs_in() {
        let dispatcher = test_dispatcher(&[]);
        let mut client = connect(&dispatcher);

        client.send(&ProtocolMessage::register("dana", "pw")).await;
        let ack = client.recv().await;
        assert_eq!(ack.kind(), MessageKind::Acknowledge);
        assert!(dispatcher.directory().user_exists("dana"));

        // The account outlives the session, and the name is now taken.
        let mut second = connect(&dispatcher);
        second.send(&ProtocolMessage::register("dana", "pw")).await;
        let nak = second.recv().await;
        assert_eq!(nak.kind(), MessageKind::NoAcknowledge);
        second.expect_eof().await;
    }

    #[tokio::test(start_paused = true)]
    async fn profane_username_is_rejected() {
        let dispatcher = test_dispatcher(&[]);
        let mut client = connect(&dispatcher);

        client
            .send(&ProtocolMessage::register("badword99", "pw"))
            .await;
        let nak = client.recv().await;
        assert_eq!(nak.kind(), MessageKind::NoAcknowledge);
        assert!(!dispatcher.directory().user_exists("badword99"));
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_sender_is_bounced() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);
        client.login("alice", "pw").await;

        client
            .send(&ProtocolMessage::broadcast("mallory", "spoofed"))
            .await;
        let bounce = client.recv().await;
        assert_eq!(bounce.sender(), Some(replies::BOUNCER_ID));
        assert_eq!(bounce.text(), Some(replies::BOUNCER_TEXT));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_reaches_another_session() {
        let dispatcher = test_dispatcher(&["alice", "bob"]);
        let mut alice = connect(&dispatcher);
        let mut bob = connect(&dispatcher);
        alice.login("alice", "pw").await;
        bob.login("bob", "pw").await;

        alice
            .send(&ProtocolMessage::broadcast("alice", "hello everyone"))
            .await;
        let received = bob.recv().await;
        assert_eq!(received.kind(), MessageKind::Broadcast);
        assert_eq!(received.text(), Some("hello everyone"));
    }

    #[tokio::test(start_paused = true)]
    async fn canned_command_replies_arrive_after_the_hold_back() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);
        client.login("alice", "pw").await;

        client
            .send(&ProtocolMessage::broadcast("alice", "How are you?"))
            .await;
        let first = client.recv().await;
        assert_eq!(first.sender(), Some(replies::SERVER_ID));
        assert_eq!(first.text(), Some("Why are you asking me this?"));
        let second = client.recv().await;
        assert_eq!(second.text(), Some("I am a computer program. I run."));
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_input_does_not_end_the_session() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);
        client.login("alice", "pw").await;

        client.writer.write_all(b"ZZZ 2 ab 2 cd").await.unwrap();
        // Let the garbage be consumed and discarded before sending more.
        tokio::time::sleep(Duration::from_millis(500)).await;

        client
            .send(&ProtocolMessage::broadcast("alice", "still here"))
            .await;
        let echoed = client.recv().await;
        assert_eq!(echoed.kind(), MessageKind::Broadcast);
        assert_eq!(echoed.text(), Some("still here"));
    }

    #[tokio::test(start_paused = true)]
    async fn spoofed_private_message_is_dropped_without_a_warning() {
        let dispatcher = test_dispatcher(&["alice", "bob"]);
        dispatcher.directory().set_parental_control("bob", "on");
        let mut alice = connect(&dispatcher);
        let mut bob = connect(&dispatcher);
        alice.login("alice", "pw").await;
        bob.login("bob", "pw").await;

        // Profane message with a forged sender: dropped outright, no
        // language warning for the session that sent it.
        alice
            .send(&ProtocolMessage::private("mallory", "bob", "you badword you"))
            .await;
        alice
            .send(&ProtocolMessage::broadcast("alice", "all clear"))
            .await;

        let next = alice.recv().await;
        assert_eq!(next.kind(), MessageKind::Broadcast);
        assert_eq!(next.text(), Some("all clear"));
        let bob_next = bob.recv().await;
        assert_eq!(bob_next.kind(), MessageKind::Broadcast);
        assert_eq!(bob_next.text(), Some("all clear"));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_is_echoed_and_the_session_ends() {
        let dispatcher = test_dispatcher(&["alice"]);
        let mut client = connect(&dispatcher);
        client.login("alice", "pw").await;

        client.send(&ProtocolMessage::quit("alice")).await;
        let bye = client.recv().await;
        assert_eq!(bye.kind(), MessageKind::Quit);
        client.expect_eof().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_unauthenticated_session_times_out() {
        let dispatcher = test_dispatcher(&[]);
        let mut client = connect(&dispatcher);
        // No login. Auto-advancing time runs through the pre-auth
        // inactivity deadline and the server hangs up.
        client.expect_eof().await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_private_message_is_flushed_on_login() {
        let dispatcher = test_dispatcher(&["alice", "bob"]);
        let mut alice = connect(&dispatcher);
        alice.login("alice", "pw").await;

        alice
            .send(&ProtocolMessage::private("alice", "bob", "while you were out"))
            .await;
        // Give the message a tick to be archived before bob connects.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut bob = connect(&dispatcher);
        bob.send(&ProtocolMessage::hello("bob", "pw")).await;
        let ack = bob.recv().await;
        assert_eq!(ack.kind(), MessageKind::Acknowledge);
        let queued = bob.recv().await;
        assert_eq!(queued.kind(), MessageKind::Private);
        assert_eq!(queued.sender(), Some("alice"));
        assert_eq!(queued.text(), Some("while you were out"));
    }

    #[tokio::test(start_paused = true)]
    async fn history_retrieval_ends_with_the_sentinel() {
        let dispatcher = test_dispatcher(&["alice", "bob"]);
        let mut alice = connect(&dispatcher);
        let mut bob = connect(&dispatcher);
        alice.login("alice", "pw").await;
        bob.login("bob", "pw").await;

        alice
            .send(&ProtocolMessage::private("alice", "bob", "for the record"))
            .await;
        let delivered = bob.recv().await;
        assert_eq!(delivered.text(), Some("for the record"));

        alice
            .send(&ProtocolMessage::history("alice", "bob", Some("10")))
            .await;
        let entry = alice.recv().await;
        assert_eq!(entry.kind(), MessageKind::HistoryResponse);
        assert!(entry.text().unwrap().contains("for the record"));
        let sentinel = alice.recv().await;
        assert_eq!(sentinel.text(), Some(replies::ARCHIVE_SENTINEL));
    }

    #[tokio::test(start_paused = true)]
    async fn parental_control_redacts_delivery() {
        let dispatcher = test_dispatcher(&["alice", "bob"]);
        dispatcher.directory().set_parental_control("bob", "on");
        let mut alice = connect(&dispatcher);
        let mut bob = connect(&dispatcher);
        alice.login("alice", "pw").await;
        bob.login("bob", "pw").await;

        alice
            .send(&ProtocolMessage::private("alice", "bob", "you badword you"))
            .await;

        // The sender is warned about the flagged message.
        let warning = alice.recv().await;
        assert_eq!(warning.kind(), MessageKind::HistoryResponse);
        assert!(warning.text().unwrap().starts_with("Watch your language!"));

        // The recipient sees asterisks.
        let delivered = bob.recv().await;
        assert_eq!(delivered.text(), Some("you ******* you"));
    }
}
