use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{CredentialStore, RefreshTokenStore, StoreError};
use crate::models::{normalize_email, NewIdentity, RefreshRecord, RotateOutcome, UserIdentity};

#[derive(Debug, Default)]
struct Users {
    by_id: HashMap<Uuid, UserIdentity>,
    by_email: HashMap<String, Uuid>,
}

/// Identity store backed by process memory. Used when no `DATABASE_URL` is configured
/// and throughout the test suite.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCredentialStore {
    users: Arc<RwLock<Users>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn create_identity(
        &self,
        identity: NewIdentity,
        now: DateTime<Utc>,
    ) -> Result<UserIdentity, StoreError> {
        let mut users = self.users.write().await;
        let identity = identity.into_identity(now);
        if users.by_email.contains_key(&identity.email) {
            return Err(StoreError::DuplicateEmail);
        }
        users.by_email.insert(identity.email.clone(), identity.id);
        users.by_id.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<UserIdentity>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .by_email
            .get(&normalize_email(email))
            .and_then(|id| users.by_id.get(id))
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserIdentity>, StoreError> {
        Ok(self.users.read().await.by_id.get(&id).cloned())
    }

    async fn mark_verified(&self, id: Uuid) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let user = users.by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.verified = true;
        Ok(())
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        new_hash: String,
        changed_at: DateTime<Utc>,
        expected_changed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        let Some(user) = users
            .by_id
            .get_mut(&id)
            .filter(|user| user.is_active() && user.password_changed_at == expected_changed_at)
        else {
            return Ok(false);
        };
        user.password_hash = new_hash;
        user.password_changed_at = changed_at;
        Ok(true)
    }

    async fn deactivate(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        let user = users.by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.deactivated_at.get_or_insert(now);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Refresh token records held in memory. A single mutex section covers the whole
/// check-and-invalidate, which is what makes rotation atomic.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRefreshTokenStore {
    records: Arc<Mutex<HashMap<Uuid, RefreshRecord>>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, jti: Uuid) -> Option<RefreshRecord> {
        self.records.lock().await.get(&jti).cloned()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(&self, record: RefreshRecord) -> Result<(), StoreError> {
        self.records.lock().await.insert(record.jti, record);
        Ok(())
    }

    async fn rotate(
        &self,
        presented: Uuid,
        replacement: RefreshRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let Some(current) = records.get_mut(&presented) else {
            return Ok(RotateOutcome::Unknown);
        };

        let outcome = current.rotation_status(now);
        if let RotateOutcome::Rotated { .. } = outcome {
            current.used_at = Some(now);
            current.replaced_by = Some(replacement.jti);
            records.insert(replacement.jti, replacement);
        }
        Ok(outcome)
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        for record in records.values_mut().filter(|r| r.session_id == session_id) {
            record.revoked_at.get_or_insert(now);
        }
        Ok(())
    }

    async fn session_active(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .any(|r| r.session_id == session_id && r.is_live(now)))
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let mut revoked = 0;
        for record in records.values_mut().filter(|r| r.user_id == user_id) {
            if record.revoked_at.is_none() && record.used_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let count = records.len();
        records.retain(|_, record| record.expires_at > before);
        Ok((count - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn new_identity(email: &str) -> NewIdentity {
        NewIdentity {
            username: "bob".to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
        }
    }

    fn record(user_id: Uuid, now: DateTime<Utc>) -> RefreshRecord {
        in_session(Uuid::new_v4(), user_id, now)
    }

    fn in_session(session_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> RefreshRecord {
        RefreshRecord {
            jti: Uuid::new_v4(),
            session_id,
            user_id,
            issued_at: now,
            expires_at: now + Duration::days(7),
            used_at: None,
            revoked_at: None,
            replaced_by: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_email_is_rejected_after_normalization() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        store
            .create_identity(new_identity("bob@example.com"), now)
            .await
            .unwrap();

        let err = store
            .create_identity(new_identity(" BOB@example.com"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
    }

    #[tokio::test]
    async fn test_find_and_mutate_identity() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let user = store
            .create_identity(new_identity("bob@example.com"), now)
            .await
            .unwrap();

        let found = store.find_by_email("Bob@Example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);

        store.mark_verified(user.id).await.unwrap();
        let later = now + Duration::minutes(1);
        assert!(store
            .update_password_hash(user.id, "new-hash".to_string(), later, now)
            .await
            .unwrap());
        store.deactivate(user.id, later).await.unwrap();
        store.deactivate(user.id, later + Duration::minutes(1)).await.unwrap();

        let found = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(found.verified);
        assert_eq!(found.password_hash, "new-hash");
        assert_eq!(found.password_changed_at, later);
        assert_eq!(found.deactivated_at, Some(later));

        assert!(matches!(
            store.mark_verified(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_password_update_is_compare_and_set() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let user = store
            .create_identity(new_identity("cas@example.com"), now)
            .await
            .unwrap();
        let later = now + Duration::seconds(1);

        assert!(store
            .update_password_hash(user.id, "first".to_string(), later, now)
            .await
            .unwrap());
        // A writer that read the identity before the first write loses.
        assert!(!store
            .update_password_hash(user.id, "second".to_string(), later, now)
            .await
            .unwrap());
        assert!(!store
            .update_password_hash(Uuid::new_v4(), "third".to_string(), later, now)
            .await
            .unwrap());

        let found = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(found.password_hash, "first");
        assert_eq!(found.password_changed_at, later);

        store.deactivate(user.id, later).await.unwrap();
        assert!(!store
            .update_password_hash(user.id, "fourth".to_string(), later, later)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rotate_is_single_use() {
        let store = InMemoryRefreshTokenStore::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let original = record(user_id, now);
        store.insert(original.clone()).await.unwrap();

        let first = record(user_id, now);
        let outcome = store.rotate(original.jti, first.clone(), now).await.unwrap();
        assert_eq!(outcome, RotateOutcome::Rotated { user_id });

        let second = record(user_id, now);
        let outcome = store.rotate(original.jti, second.clone(), now).await.unwrap();
        assert_eq!(outcome, RotateOutcome::AlreadyUsed { user_id });
        assert!(store.get(second.jti).await.is_none());

        let stored = store.get(original.jti).await.unwrap();
        assert_eq!(stored.replaced_by, Some(first.jti));
    }

    #[tokio::test]
    async fn test_revoke_session_is_idempotent_and_blocks_rotation() {
        let store = InMemoryRefreshTokenStore::new();
        let now = Utc::now();
        let original = record(Uuid::new_v4(), now);
        store.insert(original.clone()).await.unwrap();
        assert!(store.session_active(original.session_id, now).await.unwrap());

        store.revoke_session(original.session_id, now).await.unwrap();
        store.revoke_session(original.session_id, now).await.unwrap();
        store.revoke_session(Uuid::new_v4(), now).await.unwrap();
        assert!(!store.session_active(original.session_id, now).await.unwrap());

        let outcome = store
            .rotate(original.jti, record(original.user_id, now), now)
            .await
            .unwrap();
        assert_eq!(outcome, RotateOutcome::Revoked);
    }

    #[tokio::test]
    async fn test_session_survives_rotation() {
        let store = InMemoryRefreshTokenStore::new();
        let now = Utc::now();
        let (session, user_id) = (Uuid::new_v4(), Uuid::new_v4());
        let first = in_session(session, user_id, now);
        store.insert(first.clone()).await.unwrap();

        let second = in_session(session, user_id, now);
        store.rotate(first.jti, second.clone(), now).await.unwrap();
        assert!(store.session_active(session, now).await.unwrap());
        assert!(!store.session_active(session, now + Duration::days(7)).await.unwrap());

        // Revoking the session also covers the record that was already rotated away.
        store.revoke_session(session, now).await.unwrap();
        assert!(!store.session_active(session, now).await.unwrap());
        assert!(store.get(first.jti).await.unwrap().revoked_at.is_some());
        assert!(store.get(second.jti).await.unwrap().revoked_at.is_some());
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let store = InMemoryRefreshTokenStore::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let live = record(user_id, now);
        let mut stale = record(user_id, now - Duration::days(8));
        stale.used_at = Some(now - Duration::days(8));
        let mut edge = record(user_id, now);
        edge.expires_at = now;
        for r in [&live, &stale, &edge] {
            store.insert(r.clone()).await.unwrap();
        }

        assert_eq!(store.purge_expired(now).await.unwrap(), 2);
        assert!(store.get(live.jti).await.is_some());
        assert!(store.get(stale.jti).await.is_none());
        assert!(store.get(edge.jti).await.is_none());
        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_all_for_user_only_touches_live_tokens() {
        let store = InMemoryRefreshTokenStore::new();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let a = record(user_id, now);
        let b = record(user_id, now);
        let other = record(Uuid::new_v4(), now);
        for r in [&a, &b, &other] {
            store.insert(r.clone()).await.unwrap();
        }
        store.rotate(a.jti, record(user_id, now), now).await.unwrap();

        // b and a's replacement are live; a itself is used.
        assert_eq!(store.revoke_all_for_user(user_id, now).await.unwrap(), 2);
        assert!(store.get(other.jti).await.unwrap().revoked_at.is_none());
    }
}
