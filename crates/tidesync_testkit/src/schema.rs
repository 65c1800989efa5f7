//! Sync schema of the sample domain, for the server and for clients.

use crate::models::{Account, AccountDto, Address, LogEvent, Person};
use tidesync_engine::{
    ConverterSet, FilterSet, IncomingConverter, IncomingUpdate, OutgoingConverter,
    RepositoryFilter, SyncRegistry, SyncResult, SyncUpdateError,
};
use tidesync_protocol::{SyncEntity, SyncScope, SyncValues, ACCOUNT_CHANGED};
use tidesync_server::{Caller, ServerSchema};
use tidesync_store::UniqueIndex;

/// Unique index the server keeps on account emails.
pub fn account_email_index() -> UniqueIndex {
    UniqueIndex::new(Account::TYPE_NAME, &["email"])
}

fn address_filter() -> RepositoryFilter<Address> {
    RepositoryFilter::<Address>::new()
        .with_lookup(|local: &Address, incoming: &Address| local.same_place(incoming))
}

/// What each caller may sync on the server.
///
/// | Type       | Administrator | User                                        |
/// |------------|---------------|---------------------------------------------|
/// | `Account`  | all           | own account, when `accountChanged` is set   |
/// | `Address`  | all           | all                                         |
/// | `Person`   | all           | own                                         |
/// | `LogEvent` | all           | own, append-only                            |
///
/// Clients see `Account` rows as [`AccountDto`]. Users may rename their
/// account but not change its roles, create it or delete it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemoSchema;

impl ServerSchema for DemoSchema {
    fn filters(
        &self,
        caller: &Caller,
        _scope: &SyncScope,
        values: &SyncValues,
    ) -> SyncResult<FilterSet> {
        if caller.is_administrator() {
            return Ok(FilterSet::new()
                .with(RepositoryFilter::<Account>::new())
                .with(address_filter())
                .with(RepositoryFilter::<Person>::new())
                .with(RepositoryFilter::<LogEvent>::new()));
        }

        let account_id = caller.account_id;
        let mut filters = FilterSet::new();
        if values.get(ACCOUNT_CHANGED).unwrap_or(false) {
            filters = filters.with(
                RepositoryFilter::<Account>::new()
                    .with_predicate(move |account| account.meta.sync_id == account_id),
            );
        }
        Ok(filters
            .with(address_filter())
            .with(
                RepositoryFilter::<Person>::new()
                    .with_predicate(move |person| person.account_id == account_id),
            )
            .with(
                RepositoryFilter::<LogEvent>::new()
                    .with_predicate(move |event| event.account_id == account_id),
            ))
    }

    fn converters(&self, caller: &Caller) -> ConverterSet {
        let outgoing =
            OutgoingConverter::<Account, AccountDto>::new(|account: &Account| AccountDto::from(account));
        if caller.is_administrator() {
            let incoming = IncomingConverter::<AccountDto, Account>::new(|dto, account| {
                account.name = dto.name.clone();
                account.email = dto.email.clone();
                account.roles = dto.joined_roles();
            });
            return ConverterSet::new()
                .with_incoming(incoming)
                .with_outgoing(outgoing);
        }

        let incoming = IncomingConverter::<AccountDto, Account>::new(|dto, account| {
            account.name = dto.name.clone();
            account.email = dto.email.clone();
        })
        .with_policy(user_account_policy);

        ConverterSet::new()
            .with_incoming(incoming)
            .with_outgoing(outgoing)
            .with_incoming(
                IncomingConverter::<LogEvent, LogEvent>::identity().with_policy(append_only),
            )
    }
}

/// Users keep their roles: a change that tries to alter them is applied
/// without the roles and the stored value is sent back.
fn user_account_policy(
    update: &mut IncomingUpdate<'_, AccountDto, Account>,
) -> Result<bool, SyncUpdateError> {
    if update.status().is_deleted() || update.is_new() {
        return Err(SyncUpdateError::unauthorized("accounts are managed by administrators"));
    }
    let roles_changed = update
        .incoming()
        .is_some_and(|dto| dto.joined_roles() != update.local().roles);
    update.process_update();
    if roles_changed {
        update.force_refresh();
    }
    Ok(true)
}

fn append_only(
    update: &mut IncomingUpdate<'_, LogEvent, LogEvent>,
) -> Result<bool, SyncUpdateError> {
    if update.is_new() {
        update.process_update();
        return Ok(true);
    }
    update.force_refresh();
    Err(SyncUpdateError::unauthorized("log events are append-only"))
}

/// Registry for client repositories: every type, no converters.
pub fn local_registry() -> SyncRegistry {
    SyncRegistry::new()
        .register(RepositoryFilter::<AccountDto>::new())
        .register(address_filter())
        .register(RepositoryFilter::<Person>::new())
        .register(RepositoryFilter::<LogEvent>::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn users_only_see_accounts_when_asked() {
        let user = Caller::user(Uuid::new_v4());
        let quiet = DemoSchema
            .filters(&user, &SyncScope::All, &SyncValues::new())
            .unwrap();
        assert_eq!(quiet.type_names(), vec!["Address", "Person", "LogEvent"]);

        let values = SyncValues::new().with(ACCOUNT_CHANGED, true);
        let asked = DemoSchema.filters(&user, &SyncScope::All, &values).unwrap();
        assert_eq!(asked.type_names(), vec!["Account", "Address", "Person", "LogEvent"]);
    }

    #[test]
    fn administrators_see_every_type() {
        let admin = Caller::administrator(Uuid::new_v4());
        let filters = DemoSchema
            .filters(&admin, &SyncScope::All, &SyncValues::new())
            .unwrap();
        assert_eq!(filters.len(), 4);
    }

    #[test]
    fn accounts_travel_as_dtos() {
        let converters = DemoSchema.converters(&Caller::user(Uuid::new_v4()));
        assert_eq!(converters.local_type_for("AccountDto"), "Account");
        assert_eq!(converters.local_type_for("Person"), "Person");
        assert_eq!(
            converters.outgoing("Account").map(|c| c.wire_type()),
            Some("AccountDto")
        );
        assert!(converters.incoming("LogEvent").is_some());

        let admin = DemoSchema.converters(&Caller::administrator(Uuid::nil()));
        assert!(admin.incoming("LogEvent").is_none());
    }

    #[test]
    fn client_registry_matches_addresses_by_place() {
        let registry = local_registry();
        assert_eq!(
            registry.filters().type_names(),
            vec!["AccountDto", "Address", "Person", "LogEvent"]
        );
        assert!(registry.filters().get("Address").unwrap().has_lookup());
        assert!(registry.converters().is_empty());
    }
}
