//! Users and the session user table.
//!
//! User rows are long-lived: a disconnect clears the CONNECTED flag but the
//! row (id, name, color, password) stays for the lifetime of the session, so
//! a returning user rebinds to the same id and keeps document attribution
//! intact. Documents refer to users by id only; this table is the single
//! owner of user state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// User id reserved for the server itself (documents without a user owner,
/// messages without a writer).
pub const SERVER_USER_ID: u32 = 0;

/// An RGB display color. Colors must be unique among connected users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl UserColor {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }
}

/// Presence flags for a user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserFlags(u8);

impl UserFlags {
    pub const NONE: UserFlags = UserFlags(0);
    pub const CONNECTED: UserFlags = UserFlags(1);

    pub fn contains(self, other: UserFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: UserFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: UserFlags) {
        self.0 &= !other.0;
    }
}

/// One row of the session user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    id: u32,
    name: String,
    color: UserColor,
    /// Login token for the current connection, empty when offline.
    token: String,
    /// Plaintext user password as set over the encrypted channel; empty
    /// means no password required.
    password: String,
    flags: UserFlags,
}

impl User {
    pub fn new(id: u32, name: impl Into<String>, color: UserColor, flags: UserFlags) -> Self {
        Self {
            id,
            name: name.into(),
            color,
            token: String::new(),
            password: String::new(),
            flags,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn color(&self) -> UserColor {
        self.color
    }

    pub fn set_color(&mut self, color: UserColor) {
        self.color = color;
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn flags(&self) -> UserFlags {
        self.flags
    }

    pub fn is_connected(&self) -> bool {
        self.flags.contains(UserFlags::CONNECTED)
    }
}

/// The session user table, keyed by stable id with a by-name rebinding path
/// for reconnects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTable {
    users: BTreeMap<u32, User>,
    next_id: u32,
}

impl UserTable {
    pub fn new() -> Self {
        Self { users: BTreeMap::new(), next_id: 1 }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&User> {
        self.users.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut User> {
        self.users.get_mut(&id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&User> {
        self.users.values().find(|u| u.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn connected(&self) -> impl Iterator<Item = &User> {
        self.users.values().filter(|u| u.is_connected())
    }

    pub fn non_connected(&self) -> impl Iterator<Item = &User> {
        self.users.values().filter(|u| !u.is_connected())
    }

    /// Whether `color` is taken by a connected user other than `except`.
    pub fn color_in_use(&self, color: UserColor, except: Option<u32>) -> bool {
        self.connected()
            .any(|u| u.color() == color && Some(u.id()) != except)
    }

    /// Connects a user by name: rebinds an existing offline row (keeping its
    /// id and password, taking the new color) or allocates a fresh row.
    ///
    /// Returns the id. A connected row with the same name is never reused;
    /// name-uniqueness among connected users is the caller's login check.
    pub fn connect(&mut self, name: &str, color: UserColor) -> u32 {
        let existing = self
            .users
            .values()
            .find(|u| u.name() == name && !u.is_connected())
            .map(|u| u.id());

        match existing {
            Some(id) => {
                let user = self.users.get_mut(&id).expect("row looked up above");
                user.set_color(color);
                user.flags.insert(UserFlags::CONNECTED);
                id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                let mut flags = UserFlags::NONE;
                flags.insert(UserFlags::CONNECTED);
                self.users.insert(id, User::new(id, name, color, flags));
                id
            }
        }
    }

    /// Marks a user offline, clearing its token but keeping the row.
    pub fn disconnect(&mut self, id: u32) {
        if let Some(user) = self.users.get_mut(&id) {
            user.flags.remove(UserFlags::CONNECTED);
            user.token.clear();
        }
    }

    /// Inserts a row with a known id, e.g. while consuming a session sync or
    /// restoring a persisted session. Bumps the id allocator past `id`.
    pub fn insert_row(&mut self, user: User) {
        self.next_id = self.next_id.max(user.id() + 1);
        self.users.insert(user.id(), user);
    }

    /// Drops every row; used when a client resynchronizes from scratch.
    pub fn clear(&mut self) {
        self.users.clear();
        self.next_id = 1;
    }
}
