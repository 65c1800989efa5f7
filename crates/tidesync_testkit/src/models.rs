//! A small sample domain.
//!
//! - [`Address`] is shared by everyone and matched by natural key
//! - [`Person`] belongs to an account
//! - [`LogEvent`] is an audit trail that only administrators may rewrite
//! - [`Account`] is how the server stores accounts; clients see them as
//!   [`AccountDto`]

use serde::{Deserialize, Serialize};
use tidesync_protocol::{SyncEntity, SyncMeta};
use uuid::Uuid;

/// Separator of [`Account::roles`].
pub const ROLE_SEPARATOR: char = ';';

/// Role name that grants administrator rights.
pub const ADMIN_ROLE: &str = "admin";

/// A postal address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    /// Sync columns.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Street line.
    pub line1: String,
    /// City.
    pub city: String,
    /// Postal code.
    pub postal_code: String,
}

impl Address {
    /// Creates an unsaved address.
    pub fn new(line1: impl Into<String>, city: impl Into<String>, postal_code: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::default(),
            line1: line1.into(),
            city: city.into(),
            postal_code: postal_code.into(),
        }
    }

    /// Returns true if both name the same place.
    pub fn same_place(&self, other: &Address) -> bool {
        self.line1.eq_ignore_ascii_case(&other.line1) && self.postal_code == other.postal_code
    }
}

impl SyncEntity for Address {
    const TYPE_NAME: &'static str = "Address";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.line1 = other.line1.clone();
        self.city = other.city.clone();
        self.postal_code = other.postal_code.clone();
    }
}

/// A contact owned by an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    /// Sync columns.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Owning account.
    pub account_id: Uuid,
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Home address, if any.
    #[serde(default)]
    pub address_id: Option<Uuid>,
}

impl Person {
    /// Creates an unsaved person.
    pub fn new(account_id: Uuid, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::default(),
            account_id,
            name: name.into(),
            email: email.into(),
            address_id: None,
        }
    }

    /// Sets the home address.
    pub fn with_address(mut self, address_id: Uuid) -> Self {
        self.address_id = Some(address_id);
        self
    }
}

impl SyncEntity for Person {
    const TYPE_NAME: &'static str = "Person";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.account_id = other.account_id;
        self.name = other.name.clone();
        self.email = other.email.clone();
        self.address_id = other.address_id;
    }
}

/// One audit log entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Sync columns.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Account that wrote the entry.
    pub account_id: Uuid,
    /// Severity, e.g. `info`.
    pub level: String,
    /// Message text.
    pub message: String,
}

impl LogEvent {
    /// Creates an unsaved entry.
    pub fn new(account_id: Uuid, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            meta: SyncMeta::default(),
            account_id,
            level: level.into(),
            message: message.into(),
        }
    }
}

impl SyncEntity for LogEvent {
    const TYPE_NAME: &'static str = "LogEvent";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.account_id = other.account_id;
        self.level = other.level.clone();
        self.message = other.message.clone();
    }
}

/// Server-side account row. The sync id is the account id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Sync columns.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Display name.
    pub name: String,
    /// Login email; unique.
    pub email: String,
    /// Role names joined by [`ROLE_SEPARATOR`].
    pub roles: String,
}

impl Account {
    /// Role names, in stored order.
    pub fn role_list(&self) -> Vec<String> {
        split_roles(&self.roles)
    }

    /// Returns true if the account holds [`ADMIN_ROLE`].
    pub fn is_administrator(&self) -> bool {
        self.role_list().iter().any(|role| role == ADMIN_ROLE)
    }
}

impl SyncEntity for Account {
    const TYPE_NAME: &'static str = "Account";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.name = other.name.clone();
        self.email = other.email.clone();
        self.roles = other.roles.clone();
    }
}

/// The account as clients see it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDto {
    /// Sync columns.
    #[serde(flatten)]
    pub meta: SyncMeta,
    /// Display name.
    pub name: String,
    /// Login email.
    pub email: String,
    /// Role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl AccountDto {
    /// Roles in stored form.
    pub fn joined_roles(&self) -> String {
        join_roles(&self.roles)
    }
}

impl SyncEntity for AccountDto {
    const TYPE_NAME: &'static str = "AccountDto";

    fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut SyncMeta {
        &mut self.meta
    }

    fn update_from(&mut self, other: &Self) {
        self.name = other.name.clone();
        self.email = other.email.clone();
        self.roles = other.roles.clone();
    }
}

impl From<&Account> for AccountDto {
    fn from(account: &Account) -> Self {
        Self {
            meta: account.meta,
            name: account.name.clone(),
            email: account.email.clone(),
            roles: account.role_list(),
        }
    }
}

/// Splits stored roles, skipping empty names.
pub fn split_roles(roles: &str) -> Vec<String> {
    roles
        .split(ROLE_SEPARATOR)
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

/// Joins role names for storage.
pub fn join_roles(roles: &[String]) -> String {
    let names: Vec<&str> = roles
        .iter()
        .map(|role| role.trim())
        .filter(|role| !role.is_empty())
        .collect();
    names.join(&ROLE_SEPARATOR.to_string())
}
