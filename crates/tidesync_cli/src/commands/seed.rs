//! Seed command implementation.

use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use tidesync_store::{MemoryRepository, Transaction};
use tidesync_testkit::{Account, Address, LogEvent, Person};
use tracing::info;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Edsger", "Frances", "Grace", "John", "Ken", "Margaret", "Niklaus",
];

const LAST_NAMES: &[&str] = &[
    "Hopper", "Knuth", "Liskov", "Lovelace", "Ritchie", "Thompson", "Turing", "Wirth",
];

const CITIES: &[&str] = &["Arusha", "Dodoma", "Mwanza", "Tanga"];

/// What one seed run added.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedStats {
    /// Accounts created (0 when the snapshot already had one).
    pub accounts: usize,
    /// Addresses created.
    pub addresses: usize,
    /// People created.
    pub people: usize,
}

/// Runs the seed command.
pub fn run(path: &Path, people: usize) -> Result<(), Box<dyn std::error::Error>> {
    let repo = MemoryRepository::open(path)?;
    let (account, stats) = seed(&repo, people, &mut rand::thread_rng())?;
    repo.save(path)?;

    println!("Seeded {:?}", path);
    println!("  Account:   {} ({})", account.meta.sync_id, account.email);
    println!("  Accounts:  {}", stats.accounts);
    println!("  Addresses: {}", stats.addresses);
    println!("  People:    {}", stats.people);
    Ok(())
}

/// Adds `people` people, sharing a few addresses, under the snapshot's
/// first account. Creates an administrator account if there is none.
pub fn seed<R: Rng>(
    repo: &MemoryRepository,
    people: usize,
    rng: &mut R,
) -> Result<(Account, SeedStats), Box<dyn std::error::Error>> {
    let mut stats = SeedStats::default();
    let mut txn = Transaction::new(repo);

    let existing = txn.all::<Account>()?.into_iter().next();
    let account = match existing {
        Some(account) => account,
        None => {
            let mut account = Account {
                name: "Administrator".into(),
                email: "admin@tidesync.local".into(),
                roles: "admin".into(),
                ..Account::default()
            };
            txn.add(&mut account)?;
            stats.accounts += 1;
            account
        }
    };

    let mut addresses = Vec::new();
    for n in 0..people.div_ceil(3) {
        let city = CITIES.choose(rng).copied().unwrap_or("Arusha");
        let mut address = Address::new(
            format!("{} Bahari Road", rng.gen_range(1..500)),
            city,
            format!("{:05}", 10_000 + n),
        );
        txn.add(&mut address)?;
        addresses.push(address.meta.sync_id);
    }
    stats.addresses = addresses.len();

    for n in 0..people {
        let first = FIRST_NAMES.choose(rng).copied().unwrap_or("Ada");
        let last = LAST_NAMES.choose(rng).copied().unwrap_or("Lovelace");
        let email = format!(
            "{}.{}.{}@example.com",
            first.to_lowercase(),
            last.to_lowercase(),
            n
        );
        let mut person = Person::new(account.meta.sync_id, format!("{first} {last}"), email);
        if let Some(address_id) = addresses.get(n / 3) {
            person = person.with_address(*address_id);
        }
        txn.add(&mut person)?;
        stats.people += 1;
    }

    let mut event = LogEvent::new(
        account.meta.sync_id,
        "info",
        format!("seeded {} people", stats.people),
    );
    txn.add(&mut event)?;

    txn.save_changes()?;
    info!(
        account = %account.meta.sync_id,
        people = stats.people,
        addresses = stats.addresses,
        "seeded snapshot"
    );
    Ok((account, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn seeding_creates_one_account_and_reuses_it() {
        let repo = MemoryRepository::new();
        let mut rng = StdRng::seed_from_u64(7);

        let (first, stats) = seed(&repo, 7, &mut rng).unwrap();
        assert_eq!(
            stats,
            SeedStats {
                accounts: 1,
                addresses: 3,
                people: 7
            }
        );
        assert!(first.is_administrator());

        let (second, stats) = seed(&repo, 2, &mut rng).unwrap();
        assert_eq!(second.meta.sync_id, first.meta.sync_id);
        assert_eq!(stats.accounts, 0);
        assert_eq!(repo.row_counts("Person"), (9, 0));
        assert_eq!(repo.row_counts("LogEvent"), (2, 0));
    }

    #[test]
    fn seeded_people_point_at_seeded_addresses() {
        let repo = MemoryRepository::new();
        seed(&repo, 4, &mut StdRng::seed_from_u64(1)).unwrap();

        let txn = Transaction::new(&repo);
        let addresses: Vec<_> = txn
            .all::<Address>()
            .unwrap()
            .into_iter()
            .map(|a| a.meta.sync_id)
            .collect();
        for person in txn.all::<Person>().unwrap() {
            assert!(addresses.contains(&person.address_id.unwrap()));
        }
    }
}
