//! Who is currently typing in a conversation.

use std::time::Duration;

use bidroom_shared::TypingEntry;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub name: String,
}

#[derive(Debug)]
struct RosterEntry {
    user: TypingUser,
    expires_at: Instant,
}

/// Remote typers with client-side expiry. The local user is never listed.
#[derive(Debug)]
pub struct TypingRoster {
    local_user_id: String,
    expiry: Duration,
    entries: Vec<RosterEntry>,
}

impl TypingRoster {
    pub fn new(local_user_id: impl Into<String>, expiry: Duration) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            expiry,
            entries: Vec::new(),
        }
    }

    /// Apply a typing broadcast. Returns true if the visible set changed.
    pub fn apply(&mut self, entry: &TypingEntry, now: Instant) -> bool {
        if entry.user_id == self.local_user_id {
            return false;
        }
        let existing = self.entries.iter().position(|e| e.user.user_id == entry.user_id);
        match (entry.typing, existing) {
            (true, Some(pos)) => {
                let slot = &mut self.entries[pos];
                slot.expires_at = now + self.expiry;
                if slot.user.name != entry.name {
                    slot.user.name = entry.name.clone();
                    return true;
                }
                false
            }
            (true, None) => {
                self.entries.push(RosterEntry {
                    user: TypingUser {
                        user_id: entry.user_id.clone(),
                        name: entry.name.clone(),
                    },
                    expires_at: now + self.expiry,
                });
                true
            }
            (false, Some(pos)) => {
                self.entries.remove(pos);
                true
            }
            (false, None) => false,
        }
    }

    /// Drop typers no longer present on the channel.
    pub fn sync(&mut self, present: &[String]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| present.contains(&e.user.user_id));
        self.entries.len() != before
    }

    /// Drop typers whose silence window has elapsed.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.expires_at > now);
        self.entries.len() != before
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.expires_at).min()
    }

    pub fn users(&self) -> Vec<TypingUser> {
        self.entries.iter().map(|e| e.user.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, typing: bool) -> TypingEntry {
        TypingEntry {
            user_id: user.into(),
            name: format!("{user} name"),
            typing,
        }
    }

    #[test]
    fn excludes_local_user() {
        let mut roster = TypingRoster::new("me", Duration::from_secs(5));
        assert!(!roster.apply(&entry("me", true), Instant::now()));
        assert!(roster.users().is_empty());
    }

    #[test]
    fn start_stop_and_sync() {
        let now = Instant::now();
        let mut roster = TypingRoster::new("me", Duration::from_secs(5));
        assert!(roster.apply(&entry("a", true), now));
        assert!(roster.apply(&entry("b", true), now));
        assert!(!roster.apply(&entry("a", true), now));
        assert!(roster.apply(&entry("a", false), now));
        assert_eq!(roster.users()[0].user_id, "b");

        assert!(roster.sync(&["me".into()]));
        assert!(roster.users().is_empty());
    }

    #[test]
    fn entries_expire_after_silence() {
        let now = Instant::now();
        let mut roster = TypingRoster::new("me", Duration::from_secs(5));
        roster.apply(&entry("a", true), now);
        roster.apply(&entry("b", true), now + Duration::from_secs(3));

        assert_eq!(roster.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(!roster.expire(now + Duration::from_secs(4)));
        assert!(roster.expire(now + Duration::from_secs(5)));
        assert_eq!(roster.users().len(), 1);
        assert!(roster.expire(now + Duration::from_secs(8)));
        assert_eq!(roster.next_deadline(), None);
    }
}
