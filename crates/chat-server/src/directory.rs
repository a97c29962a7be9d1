//! Account and group storage.
//!
//! The [`Directory`] trait is the seam between session logic and user
//! storage. [`InMemoryDirectory`] is the bundled implementation; a
//! database-backed one would slot in behind the same trait.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Parental-control setting value meaning "filtering active".
const CONTROL_ON: &str = "on";
const CONTROL_OFF: &str = "off";

/// User accounts and named groups.
pub trait Directory: Send + Sync {
    /// Creates an account. Returns false when the name is already taken
    /// or empty.
    fn add_user(&self, name: &str, password: &str) -> bool;

    /// True when the name/password pair matches a stored account.
    fn check_credentials(&self, name: &str, password: &str) -> bool;

    fn user_exists(&self, name: &str) -> bool;

    /// Replaces the account's password. Unknown names are ignored.
    fn update_password(&self, name: &str, password: &str);

    /// Removes the account. Unknown names are ignored.
    fn delete_user(&self, name: &str);

    /// Sets parental control to `"on"` or `"off"` (case-insensitive).
    /// Returns false for any other value or an unknown user.
    fn set_parental_control(&self, name: &str, setting: &str) -> bool;

    /// True when either named user has parental control switched on.
    /// `None` names are simply not consulted.
    fn parental_control_involved(&self, sender: Option<&str>, recipient: Option<&str>) -> bool;

    /// Creates a group with the given members. Returns false when the
    /// group already exists.
    fn create_group(&self, group: &str, members: &[String]) -> bool;

    /// Replaces a group's membership. Returns false when the group does
    /// not exist.
    fn update_group(&self, group: &str, members: &[String]) -> bool;

    /// Removes a group. Returns false when the group does not exist.
    fn delete_group(&self, group: &str) -> bool;

    fn group_exists(&self, group: &str) -> bool;

    /// The group's member names, or `None` for an unknown group.
    fn group_members(&self, group: &str) -> Option<Vec<String>>;
}

struct UserRecord {
    password: String,
    parental_control: bool,
}

#[derive(Default)]
struct State {
    users: HashMap<String, UserRecord>,
    groups: HashMap<String, Vec<String>>,
}

/// Mutex-guarded in-memory directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    inner: Mutex<State>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Directory for InMemoryDirectory {
    fn add_user(&self, name: &str, password: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut state = self.state();
        if state.users.contains_key(name) {
            return false;
        }
        state.users.insert(
            name.to_string(),
            UserRecord {
                password: password.to_string(),
                parental_control: false,
            },
        );
        true
    }

    fn check_credentials(&self, name: &str, password: &str) -> bool {
        self.state()
            .users
            .get(name)
            .is_some_and(|u| u.password == password)
    }

    fn user_exists(&self, name: &str) -> bool {
        self.state().users.contains_key(name)
    }

    fn update_password(&self, name: &str, password: &str) {
        if let Some(user) = self.state().users.get_mut(name) {
            user.password = password.to_string();
        }
    }

    fn delete_user(&self, name: &str) {
        self.state().users.remove(name);
    }

    fn set_parental_control(&self, name: &str, setting: &str) -> bool {
        let active = if setting.eq_ignore_ascii_case(CONTROL_ON) {
            true
        } else if setting.eq_ignore_ascii_case(CONTROL_OFF) {
            false
        } else {
            return false;
        };
        match self.state().users.get_mut(name) {
            Some(user) => {
                user.parental_control = active;
                true
            }
            None => false,
        }
    }

    fn parental_control_involved(&self, sender: Option<&str>, recipient: Option<&str>) -> bool {
        let state = self.state();
        let active = |name: Option<&str>| {
            name.and_then(|n| state.users.get(n))
                .is_some_and(|u| u.parental_control)
        };
        active(sender) || active(recipient)
    }

    fn create_group(&self, group: &str, members: &[String]) -> bool {
        let mut state = self.state();
        if state.groups.contains_key(group) {
            return false;
        }
        state.groups.insert(group.to_string(), members.to_vec());
        true
    }

    fn update_group(&self, group: &str, members: &[String]) -> bool {
        match self.state().groups.get_mut(group) {
            Some(existing) => {
                *existing = members.to_vec();
                true
            }
            None => false,
        }
    }

    fn delete_group(&self, group: &str) -> bool {
        self.state().groups.remove(group).is_some()
    }

    fn group_exists(&self, group: &str) -> bool {
        self.state().groups.contains_key(group)
    }

    fn group_members(&self, group: &str) -> Option<Vec<String>> {
        self.state().groups.get(group).cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn add_and_authenticate() {
        let dir = InMemoryDirectory::new();
        assert!(dir.add_user("alice", "secret"));
        assert!(dir.check_credentials("alice", "secret"));
        assert!(!dir.check_credentials("alice", "wrong"));
        assert!(!dir.check_credentials("nobody", "secret"));
    }

    #[test]
    fn duplicate_and_empty_names_rejected() {
        let dir = InMemoryDirectory::new();
        assert!(dir.add_user("alice", "secret"));
        assert!(!dir.add_user("alice", "other"));
        assert!(!dir.add_user("", "pw"));
    }

    #[test]
    fn update_and_delete() {
        let dir = InMemoryDirectory::new();
        dir.add_user("alice", "secret");
        dir.update_password("alice", "newpw");
        assert!(dir.check_credentials("alice", "newpw"));

        dir.delete_user("alice");
        assert!(!dir.user_exists("alice"));
    }

    #[test]
    fn parental_control_toggles() {
        let dir = InMemoryDirectory::new();
        dir.add_user("alice", "pw");
        dir.add_user("bob", "pw");

        assert!(!dir.parental_control_involved(Some("alice"), Some("bob")));

        assert!(dir.set_parental_control("alice", "ON"));
        assert!(dir.parental_control_involved(Some("alice"), Some("bob")));
        assert!(dir.parental_control_involved(Some("bob"), Some("alice")));
        assert!(!dir.parental_control_involved(Some("bob"), None));

        assert!(dir.set_parental_control("alice", "off"));
        assert!(!dir.parental_control_involved(Some("alice"), Some("bob")));

        assert!(!dir.set_parental_control("alice", "maybe"));
        assert!(!dir.set_parental_control("nobody", "on"));
    }

    #[test]
    fn group_lifecycle() {
        let dir = InMemoryDirectory::new();
        let members = vec!["alice".to_string(), "bob".to_string()];

        assert!(dir.create_group("team", &members));
        assert!(!dir.create_group("team", &members));
        assert_eq!(dir.group_members("team"), Some(members));

        let smaller = vec!["alice".to_string()];
        assert!(dir.update_group("team", &smaller));
        assert_eq!(dir.group_members("team"), Some(smaller));
        assert!(!dir.update_group("ghosts", &[]));

        assert!(dir.delete_group("team"));
        assert!(!dir.delete_group("team"));
        assert!(dir.group_members("team").is_none());
    }
}
