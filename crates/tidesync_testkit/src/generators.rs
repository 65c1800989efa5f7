//! Property-based test generators using proptest.
//!
//! Strategies produce people and edit scripts; [`apply_script`] replays a
//! script against a peer so two peers can diverge in arbitrary ways before
//! they sync.

use crate::fixtures::TestPeer;
use crate::models::Person;
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for display names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,9}").expect("Invalid regex")
}

/// Strategy for email addresses.
pub fn email_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{3,8}@(example|test)\\.(com|org)").expect("Invalid regex")
}

/// Strategy for unsaved people owned by `account_id`.
pub fn person_strategy(account_id: Uuid) -> impl Strategy<Value = Person> {
    (name_strategy(), email_strategy())
        .prop_map(move |(name, email)| Person::new(account_id, name, email))
}

/// One local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    /// Add a person.
    Add {
        /// Name.
        name: String,
        /// Email.
        email: String,
    },
    /// Rename the n-th live person (modulo the live count).
    Rename {
        /// Position among live people.
        index: usize,
        /// New name.
        name: String,
    },
    /// Delete the n-th live person; permanently if `permanent`.
    Delete {
        /// Position among live people.
        index: usize,
        /// Leave a tombstone instead of a soft-deleted row.
        permanent: bool,
    },
}

/// Strategy for a single edit, weighted towards additions.
pub fn edit_op_strategy() -> impl Strategy<Value = EditOp> {
    prop_oneof![
        3 => (name_strategy(), email_strategy())
            .prop_map(|(name, email)| EditOp::Add { name, email }),
        2 => (any::<usize>(), name_strategy())
            .prop_map(|(index, name)| EditOp::Rename { index, name }),
        1 => (any::<usize>(), any::<bool>())
            .prop_map(|(index, permanent)| EditOp::Delete { index, permanent }),
    ]
}

/// Strategy for scripts of up to `max_len` edits.
pub fn edit_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<EditOp>> {
    prop::collection::vec(edit_op_strategy(), 0..=max_len)
}

/// Replays `script` on `peer`, adding people under `account_id`.
///
/// Renames and deletes on a peer with no live people are skipped. Returns
/// the number of edits applied.
pub fn apply_script(peer: &TestPeer, account_id: Uuid, script: &[EditOp]) -> usize {
    let mut applied = 0;
    for op in script {
        let live = peer.all::<Person>();
        match op {
            EditOp::Add { name, email } => {
                peer.add(Person::new(account_id, name.clone(), email.clone()));
            }
            EditOp::Rename { index, name } => {
                let Some(target) = pick(&live, *index) else {
                    continue;
                };
                let name = name.clone();
                peer.edit::<Person>(target, move |person| person.name = name);
            }
            EditOp::Delete { index, permanent } => {
                let Some(target) = pick(&live, *index) else {
                    continue;
                };
                if *permanent {
                    peer.remove::<Person>(target);
                } else {
                    peer.soft_delete::<Person>(target);
                }
            }
        }
        applied += 1;
    }
    applied
}

fn pick(live: &[Person], index: usize) -> Option<Uuid> {
    if live.is_empty() {
        return None;
    }
    Some(live[index % live.len()].meta.sync_id)
}
