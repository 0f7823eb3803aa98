use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use prh_core::{AuthorRef, IdentityRecord, PullRequestKey, PullRequestRecord, Window};
use tracing::{info, warn};

use super::{
    ContactUpdate, KeySchema, MigrationOutcome, Page, Store, StoreError, StoreResult,
    UpsertOutcome, WindowQuery,
};

#[derive(Debug)]
struct Inner {
    schema: KeySchema,
    next_row_id: u64,
    /// `(row id, record)` in insertion order.
    pull_requests: Vec<(u64, PullRequestRecord)>,
    next_identity_id: i64,
    identities: BTreeMap<i64, IdentityRecord>,
}

/// In-process [`Store`] with the same key and uniqueness rules as [`super::PgStore`].
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    /// Composite key creation fails during migration, leaving the table unindexed.
    index_failure: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_schema(KeySchema::NumberAndRepository, Vec::new())
    }

    /// A store still keyed by number alone, seeded as-is with `records`.
    pub fn with_legacy_records(records: Vec<PullRequestRecord>) -> Self {
        Self::with_schema(KeySchema::NumberOnly, records)
    }

    /// Makes the composite key fail to build on the next migration.
    pub fn with_index_failure(mut self) -> Self {
        self.index_failure = true;
        self
    }

    fn with_schema(schema: KeySchema, records: Vec<PullRequestRecord>) -> Self {
        let pull_requests: Vec<_> = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| (idx as u64 + 1, record))
            .collect();
        Self {
            inner: RwLock::new(Inner {
                schema,
                next_row_id: pull_requests.len() as u64 + 1,
                pull_requests,
                next_identity_id: 1,
                identities: BTreeMap::new(),
            }),
            index_failure: false,
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

fn newest_first(rows: &mut [(u64, PullRequestRecord)]) {
    rows.sort_by(|(a_id, a), (b_id, b)| {
        b.updated_at.cmp(&a.updated_at).then_with(|| b_id.cmp(a_id))
    });
}

fn normalize(inner: &mut Inner, matching: &str, default_repository: &str) -> u64 {
    let mut normalized = 0;
    for idx in 0..inner.pull_requests.len() {
        let (_, record) = &inner.pull_requests[idx];
        if record.repository != matching {
            continue;
        }
        let number = record.number;
        let taken = inner
            .pull_requests
            .iter()
            .any(|(_, r)| r.number == number && r.repository == default_repository);
        if !taken {
            inner.pull_requests[idx].1.repository = default_repository.to_string();
            normalized += 1;
        }
    }
    normalized
}

fn check_identity_conflicts(
    inner: &Inner,
    identity: &IdentityRecord,
    except: Option<i64>,
) -> StoreResult<()> {
    for (id, existing) in &inner.identities {
        if Some(*id) == except {
            continue;
        }
        if identity.github_id.is_some() && existing.github_id == identity.github_id {
            return Err(StoreError::DuplicateIdentity(
                identity.github_id.unwrap_or_default(),
            ));
        }
        if identity.email.is_some() && existing.email == identity.email {
            return Err(StoreError::EmailTaken(identity.email.clone().unwrap_or_default()));
        }
    }
    Ok(())
}

#[async_trait]
impl Store for MemoryStore {
    async fn ensure_schema(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn key_schema(&self) -> StoreResult<KeySchema> {
        Ok(self.read(|inner| inner.schema))
    }

    async fn migrate_key_schema(&self, default_repository: &str) -> StoreResult<MigrationOutcome> {
        let index_failure = self.index_failure;
        let outcome = self.write(|inner| {
            let previous = inner.schema;
            if previous == KeySchema::NumberAndRepository {
                return None;
            }

            let before = inner.pull_requests.len();
            let mut seen = HashSet::new();
            inner
                .pull_requests
                .retain(|(_, r)| seen.insert((r.number, r.repository.clone())));
            let duplicates_removed = (before - inner.pull_requests.len()) as u64;

            inner.schema = if index_failure {
                KeySchema::Unindexed
            } else {
                KeySchema::NumberAndRepository
            };

            let mut normalized = normalize(inner, "", default_repository);
            let bare = default_repository
                .rsplit('/')
                .next()
                .unwrap_or(default_repository);
            if bare != default_repository {
                normalized += normalize(inner, bare, default_repository);
            }

            Some(MigrationOutcome {
                previous,
                duplicates_removed,
                normalized,
                composite_index: !index_failure,
            })
        });
        let Some(outcome) = outcome else {
            info!("pull request key schema already migrated");
            return Ok(MigrationOutcome::already_migrated());
        };
        if outcome.composite_index {
            info!(?outcome, "pull request key schema migrated");
        } else {
            warn!(?outcome, "composite key could not be created; continuing unindexed");
        }
        Ok(outcome)
    }

    async fn upsert_pull_request(&self, record: &PullRequestRecord) -> StoreResult<UpsertOutcome> {
        self.write(|inner| {
            if let Some((_, existing)) = inner
                .pull_requests
                .iter_mut()
                .find(|(_, r)| r.number == record.number && r.repository == record.repository)
            {
                *existing = record.clone();
                return Ok(UpsertOutcome::Updated);
            }
            if inner.schema == KeySchema::NumberOnly
                && inner.pull_requests.iter().any(|(_, r)| r.number == record.number)
            {
                return Err(StoreError::DuplicateKey {
                    number: record.number,
                    repository: record.repository.clone(),
                });
            }
            let id = inner.next_row_id;
            inner.next_row_id += 1;
            inner.pull_requests.push((id, record.clone()));
            Ok(UpsertOutcome::Inserted)
        })
    }

    async fn get_pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> StoreResult<Option<PullRequestRecord>> {
        Ok(self.read(|inner| {
            inner
                .pull_requests
                .iter()
                .find(|(_, r)| r.number == number && r.repository == repository)
                .map(|(_, r)| r.clone())
        }))
    }

    async fn query_pull_requests(&self, query: &WindowQuery) -> StoreResult<Page<PullRequestRecord>> {
        let mut rows: Vec<_> = self.read(|inner| {
            inner
                .pull_requests
                .iter()
                .filter(|(_, r)| query.window.as_ref().map_or(true, |w| r.touches(w)))
                .cloned()
                .collect()
        });
        newest_first(&mut rows);
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.limit as usize)
            .map(|(_, r)| r)
            .collect();
        Ok(Page::new(items, total, query.page.max(1), query.limit))
    }

    async fn pull_requests_in(&self, window: &Window) -> StoreResult<Vec<PullRequestRecord>> {
        let mut rows: Vec<_> = self.read(|inner| {
            inner
                .pull_requests
                .iter()
                .filter(|(_, r)| r.touches(window))
                .cloned()
                .collect()
        });
        newest_first(&mut rows);
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    async fn all_pull_requests(&self) -> StoreResult<Vec<PullRequestRecord>> {
        let mut rows = self.read(|inner| {
            inner
                .pull_requests
                .iter()
                .map(|(_, r)| r.clone())
                .collect::<Vec<_>>()
        });
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(rows)
    }

    async fn set_author(&self, key: &PullRequestKey, author: &AuthorRef) -> StoreResult<bool> {
        Ok(self.write(|inner| {
            match inner
                .pull_requests
                .iter_mut()
                .find(|(_, r)| r.number == key.number && r.repository == key.repository)
            {
                Some((_, record)) => {
                    record.author = author.clone();
                    true
                }
                None => false,
            }
        }))
    }

    async fn find_identity_by_github_id(&self, github_id: u64) -> StoreResult<Option<IdentityRecord>> {
        Ok(self.read(|inner| {
            inner
                .identities
                .values()
                .find(|i| i.github_id == Some(github_id))
                .cloned()
        }))
    }

    async fn find_identity_by_login(&self, login: &str) -> StoreResult<Option<IdentityRecord>> {
        Ok(self.read(|inner| {
            inner
                .identities
                .values()
                .find(|i| {
                    i.login
                        .as_deref()
                        .is_some_and(|l| l.eq_ignore_ascii_case(login))
                })
                .cloned()
        }))
    }

    async fn insert_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord> {
        self.write(|inner| {
            check_identity_conflicts(inner, identity, None)?;
            let id = inner.next_identity_id;
            inner.next_identity_id += 1;
            let stored = IdentityRecord {
                id: Some(id),
                ..identity.clone()
            };
            inner.identities.insert(id, stored.clone());
            Ok(stored)
        })
    }

    async fn update_identity(&self, identity: &IdentityRecord) -> StoreResult<IdentityRecord> {
        let id = identity.id.ok_or(StoreError::IdentityNotFound(0))?;
        self.write(|inner| {
            if !inner.identities.contains_key(&id) {
                return Err(StoreError::IdentityNotFound(id));
            }
            check_identity_conflicts(inner, identity, Some(id))?;
            inner.identities.insert(id, identity.clone());
            Ok(identity.clone())
        })
    }

    async fn all_identities(&self) -> StoreResult<Vec<IdentityRecord>> {
        Ok(self.read(|inner| inner.identities.values().cloned().collect()))
    }

    async fn list_identities(&self, page: u32, limit: u32) -> StoreResult<Page<IdentityRecord>> {
        let offset = WindowQuery {
            window: None,
            page,
            limit,
        }
        .offset();
        Ok(self.read(|inner| {
            let items = inner
                .identities
                .values()
                .skip(usize::try_from(offset).unwrap_or(usize::MAX))
                .take(limit as usize)
                .cloned()
                .collect();
            Page::new(items, inner.identities.len() as u64, page.max(1), limit)
        }))
    }

    async fn get_identity(&self, id: i64) -> StoreResult<Option<IdentityRecord>> {
        Ok(self.read(|inner| inner.identities.get(&id).cloned()))
    }

    async fn update_contact(&self, id: i64, update: &ContactUpdate) -> StoreResult<IdentityRecord> {
        self.write(|inner| {
            let mut updated = inner
                .identities
                .get(&id)
                .cloned()
                .ok_or(StoreError::IdentityNotFound(id))?;
            if let Some(name) = &update.name {
                updated.name = Some(name.clone());
            }
            if let Some(email) = &update.email {
                updated.email = Some(email.clone());
            }
            if let Some(phone) = &update.phone {
                updated.phone = Some(phone.clone());
            }
            check_identity_conflicts(inner, &updated, Some(id))?;
            inner.identities.insert(id, updated.clone());
            Ok(updated)
        })
    }

    async fn delete_identity(&self, id: i64) -> StoreResult<bool> {
        Ok(self.write(|inner| inner.identities.remove(&id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use prh_core::ExternalProfile;

    fn record(number: u64, repository: &str, hours: i64) -> PullRequestRecord {
        let ts = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap() + Duration::hours(hours);
        PullRequestRecord {
            github_id: Some(number * 100),
            number,
            repository: repository.to_string(),
            title: format!("PR {number}"),
            state: "open".into(),
            html_url: None,
            created_at: ts,
            updated_at: ts,
            author: AuthorRef::default(),
            files: vec![],
            recorded_at: ts,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = MemoryStore::new();
        let pr = record(1, "acme/widgets", 1);
        assert_eq!(store.upsert_pull_request(&pr).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert_pull_request(&pr).await.unwrap(), UpsertOutcome::Updated);

        let mut retitled = pr.clone();
        retitled.title = "Renamed".into();
        store.upsert_pull_request(&retitled).await.unwrap();

        let all = store.all_pull_requests().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "Renamed");
    }

    #[tokio::test]
    async fn legacy_key_rejects_same_number_in_another_repository() {
        let store = MemoryStore::with_legacy_records(vec![record(7, "acme/widgets", 0)]);
        let err = store
            .upsert_pull_request(&record(7, "acme/gadgets", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { number: 7, .. }));

        store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(
            store
                .upsert_pull_request(&record(7, "acme/gadgets", 0))
                .await
                .unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(store.all_pull_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn migration_normalizes_legacy_rows_and_is_idempotent() {
        let store = MemoryStore::with_legacy_records(vec![
            record(1, "", 0),
            record(2, "widgets", 0),
            record(3, "acme/widgets", 0),
            record(3, "acme/widgets", 1),
        ]);
        let outcome = store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(outcome.previous, KeySchema::NumberOnly);
        assert_eq!(outcome.duplicates_removed, 1);
        assert_eq!(outcome.normalized, 2);
        assert!(outcome.composite_index);

        let all = store.all_pull_requests().await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|r| r.repository == "acme/widgets"));

        let again = store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(again.previous, KeySchema::NumberAndRepository);
        assert_eq!(again.duplicates_removed, 0);
        assert_eq!(again.normalized, 0);
        assert_eq!(store.all_pull_requests().await.unwrap(), all);
    }

    #[tokio::test]
    async fn migration_keeps_same_number_across_repositories() {
        let store = MemoryStore::with_legacy_records(vec![
            record(7, "acme/a", 0),
            record(7, "acme/b", 1),
            record(7, "acme/c", 2),
        ]);
        let outcome = store.migrate_key_schema("acme/a").await.unwrap();
        assert_eq!(outcome.duplicates_removed, 0);
        assert!(outcome.composite_index);

        let all = store.all_pull_requests().await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.repository.as_str()).collect::<Vec<_>>(),
            vec!["acme/a", "acme/b", "acme/c"]
        );
        assert_eq!(
            store
                .upsert_pull_request(&record(7, "acme/a", 3))
                .await
                .unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.all_pull_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn migrated_store_is_left_untouched() {
        let store = MemoryStore::new();
        store.migrate_key_schema("acme/widgets").await.unwrap();
        store
            .upsert_pull_request(&record(5, "widgets", 0))
            .await
            .unwrap();

        let outcome = store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(outcome, MigrationOutcome::already_migrated());
        assert_eq!(outcome.normalized, 0);
        assert!(store.get_pull_request("widgets", 5).await.unwrap().is_some());
        assert!(store
            .get_pull_request("acme/widgets", 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failed_index_leaves_store_unindexed_but_writable() {
        let store = MemoryStore::with_legacy_records(vec![record(7, "acme/widgets", 0)])
            .with_index_failure();
        let outcome = store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(outcome.previous, KeySchema::NumberOnly);
        assert!(!outcome.composite_index);
        assert_eq!(store.key_schema().await.unwrap(), KeySchema::Unindexed);

        assert_eq!(
            store
                .upsert_pull_request(&record(7, "acme/gadgets", 0))
                .await
                .unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store
                .upsert_pull_request(&record(7, "acme/widgets", 1))
                .await
                .unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.all_pull_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn normalization_skips_rows_whose_target_key_exists() {
        let store = MemoryStore::with_legacy_records(vec![
            record(4, "acme/widgets", 0),
            record(4, "", 0),
        ]);
        let outcome = store.migrate_key_schema("acme/widgets").await.unwrap();
        assert_eq!(outcome.normalized, 0);
        assert!(store.get_pull_request("", 4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn window_query_sorts_newest_update_first_and_paginates() {
        let store = MemoryStore::new();
        for hour in 0..5 {
            store
                .upsert_pull_request(&record(hour as u64 + 1, "acme/widgets", hour))
                .await
                .unwrap();
        }
        store
            .upsert_pull_request(&record(99, "acme/widgets", 48))
            .await
            .unwrap();

        let day = Window::day(
            chrono::NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            chrono::FixedOffset::east_opt(0).unwrap(),
        );
        let first = store
            .query_pull_requests(&WindowQuery {
                window: Some(day),
                page: 1,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.total_pages, 3);
        assert_eq!(
            first.items.iter().map(|r| r.number).collect::<Vec<_>>(),
            vec![5, 4]
        );

        let last = store
            .query_pull_requests(&WindowQuery {
                window: Some(day),
                page: 3,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].number, 1);

        let everything = store
            .query_pull_requests(&WindowQuery {
                window: None,
                page: 1,
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(everything.total, 6);
        assert_eq!(everything.items[0].number, 99);
    }

    #[tokio::test]
    async fn identities_enforce_unique_email_and_external_id() {
        let store = MemoryStore::new();
        let ada = store
            .insert_identity(&IdentityRecord::local(
                "Ada".into(),
                "ada@example.com".into(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(ada.id, Some(1));

        let err = store
            .insert_identity(&IdentityRecord::local(
                "Other".into(),
                "ada@example.com".into(),
                None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmailTaken(_)));

        let profile = ExternalProfile {
            github_id: 42,
            login: "Octo".into(),
            html_url: "https://github.com/Octo".into(),
            avatar_url: None,
            account_type: "User".into(),
            site_admin: false,
        };
        store
            .insert_identity(&IdentityRecord::from_profile(profile.clone()))
            .await
            .unwrap();
        let err = store
            .insert_identity(&IdentityRecord::from_profile(profile))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(42)));

        let found = store.find_identity_by_login("octo").await.unwrap();
        assert_eq!(found.and_then(|i| i.github_id), Some(42));
    }

    #[tokio::test]
    async fn contact_update_keeps_unset_fields() {
        let store = MemoryStore::new();
        let stored = store
            .insert_identity(&IdentityRecord::local(
                "Ada".into(),
                "ada@example.com".into(),
                Some("555".into()),
            ))
            .await
            .unwrap();
        let id = stored.id.unwrap();
        let updated = store
            .update_contact(
                id,
                &ContactUpdate {
                    phone: Some("777".into()),
                    ..ContactUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.email.as_deref(), Some("ada@example.com"));
        assert_eq!(updated.phone.as_deref(), Some("777"));

        assert!(matches!(
            store.update_contact(99, &ContactUpdate::default()).await,
            Err(StoreError::IdentityNotFound(99))
        ));
        assert!(store.delete_identity(id).await.unwrap());
        assert!(!store.delete_identity(id).await.unwrap());
    }
}
