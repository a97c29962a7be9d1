//! Relay instant-messaging server.
//!
//! One task per client connection ([`session`]), a shared [`dispatcher`]
//! that routes traffic between sessions, and pluggable [`directory`] and
//! [`archive`] collaborators for accounts and message storage.

pub mod archive;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod errors;
pub mod filter;
pub mod net;
pub mod replies;
pub mod session;
