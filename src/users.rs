//! User/group identity lookups.
//!
//! `.u` stat entries and `Tattach`/`Tauth` carry both a name and a numeric id; servers
//! need to go back and forth between the two. The lookup mechanism itself is
//! system-specific (NIS, LDAP, `/etc/passwd`, a static table for tests), so it's a
//! trait here; [`OsUsers`] is the only implementation this crate ships, backed by the
//! host's passwd/group database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A resolved user identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub uid: u32,
    pub name: String,
}

/// A resolved group identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub gid: u32,
    pub name: String,
}

/// Resolves users and groups by id or by name.
///
/// Implementations are free to return `None` for directions they don't support — the
/// stock NIS/LDAP-backed lookups this contract originally described only went from id
/// to name, never the reverse, and that's a legitimate implementation choice, not an
/// error.
pub trait Users: Send + Sync {
    fn uid2user(&self, uid: u32) -> Option<Arc<User>>;
    fn gid2group(&self, gid: u32) -> Option<Arc<Group>>;
    fn uname2user(&self, name: &str) -> Option<Arc<User>>;
    fn gname2group(&self, name: &str) -> Option<Arc<Group>>;
}

/// [`Users`] backed by the operating system's passwd/group database, via `nix`.
///
/// Resolved entries are cached by id: repeated lookups of the same uid return the same
/// `Arc`, so backends that key other state off user identity can use pointer equality
/// as a cheap same-user check.
#[derive(Default)]
pub struct OsUsers {
    users: Mutex<HashMap<u32, Arc<User>>>,
    groups: Mutex<HashMap<u32, Arc<Group>>>,
}

impl OsUsers {
    pub fn new() -> OsUsers {
        OsUsers::default()
    }
}

impl Users for OsUsers {
    fn uid2user(&self, uid: u32) -> Option<Arc<User>> {
        let mut cache = self.users.lock().expect("users cache mutex poisoned");
        if let Some(u) = cache.get(&uid) {
            return Some(u.clone());
        }
        let entry = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)).ok().flatten()?;
        let user = Arc::new(User { uid, name: entry.name });
        cache.insert(uid, user.clone());
        Some(user)
    }

    fn gid2group(&self, gid: u32) -> Option<Arc<Group>> {
        let mut cache = self.groups.lock().expect("groups cache mutex poisoned");
        if let Some(g) = cache.get(&gid) {
            return Some(g.clone());
        }
        let entry = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)).ok().flatten()?;
        let group = Arc::new(Group { gid, name: entry.name });
        cache.insert(gid, group.clone());
        Some(group)
    }

    fn uname2user(&self, name: &str) -> Option<Arc<User>> {
        let entry = nix::unistd::User::from_name(name).ok().flatten()?;
        self.uid2user(entry.uid.as_raw())
    }

    fn gname2group(&self, name: &str) -> Option<Arc<Group>> {
        let entry = nix::unistd::Group::from_name(name).ok().flatten()?;
        self.gid2group(entry.gid.as_raw())
    }
}
