use std::collections::HashMap;

use shared::{
    domain::{Contact, Presence, UserId},
    protocol::{PresenceEntry, UserSummary},
};
use tracing::debug;

/// Online/offline roster. Every known contact lives in exactly one of the two
/// maps and the local user is in neither.
pub struct PresenceTracker {
    local_user: UserId,
    online: HashMap<UserId, String>,
    offline: HashMap<UserId, String>,
}

impl PresenceTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            online: HashMap::new(),
            offline: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Replaces the online set wholesale. Contacts missing from the snapshot
    /// move to offline. Returns whether the online set changed.
    pub fn apply_snapshot(&mut self, entries: Vec<PresenceEntry>) -> bool {
        let mut next = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.user_id == self.local_user {
                continue;
            }
            next.insert(entry.user_id, entry.username);
        }

        let changed = next != self.online;
        let previous = std::mem::replace(&mut self.online, next);
        for (user_id, name) in previous {
            if !self.online.contains_key(&user_id) {
                self.offline.insert(user_id, name);
            }
        }
        let online = &self.online;
        self.offline.retain(|user_id, _| !online.contains_key(user_id));

        debug!(
            online = self.online.len(),
            offline = self.offline.len(),
            "presence: snapshot applied"
        );
        changed
    }

    /// Moves a contact from online to offline. Contacts only known offline
    /// are left alone.
    pub fn apply_departure(&mut self, user_id: &UserId) -> bool {
        match self.online.remove(user_id) {
            Some(name) => {
                self.offline.insert(user_id.clone(), name);
                debug!(contact_id = %user_id, "presence: contact went offline");
                true
            }
            None => false,
        }
    }

    /// Merges the people directory. Anyone not online becomes offline-known;
    /// known display names are refreshed.
    pub fn seed_known(&mut self, people: Vec<UserSummary>) -> bool {
        let mut changed = false;
        for person in people {
            if person.id == self.local_user {
                continue;
            }
            let target = if self.online.contains_key(&person.id) {
                &mut self.online
            } else {
                &mut self.offline
            };
            if target.get(&person.id) != Some(&person.username) {
                target.insert(person.id, person.username);
                changed = true;
            }
        }
        changed
    }

    pub fn remove(&mut self, user_id: &UserId) -> Option<Contact> {
        if let Some(name) = self.online.remove(user_id) {
            return Some(contact(user_id, name, Presence::Online));
        }
        self.offline
            .remove(user_id)
            .map(|name| contact(user_id, name, Presence::Offline))
    }

    pub fn contact(&self, user_id: &UserId) -> Option<Contact> {
        if let Some(name) = self.online.get(user_id) {
            return Some(contact(user_id, name.clone(), Presence::Online));
        }
        self.offline
            .get(user_id)
            .map(|name| contact(user_id, name.clone(), Presence::Offline))
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains_key(user_id)
    }

    pub fn online(&self) -> Vec<Contact> {
        sorted_contacts(&self.online, Presence::Online)
    }

    pub fn offline(&self) -> Vec<Contact> {
        sorted_contacts(&self.offline, Presence::Offline)
    }
}

fn contact(user_id: &UserId, display_name: String, presence: Presence) -> Contact {
    Contact {
        id: user_id.clone(),
        display_name,
        presence,
    }
}

fn sorted_contacts(map: &HashMap<UserId, String>, presence: Presence) -> Vec<Contact> {
    let mut contacts: Vec<Contact> = map
        .iter()
        .map(|(user_id, name)| contact(user_id, name.clone(), presence))
        .collect();
    contacts.sort_by(|a, b| {
        a.display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase())
            .then_with(|| a.id.cmp(&b.id))
    });
    contacts
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
