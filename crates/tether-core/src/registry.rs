//! Session creation, exclusivity, and teardown.
//!
//! The registry owns every mutation of session rows and of the device's
//! current-holder field. Exclusivity is enforced by the claim operation:
//! a compare-and-swap on the holder plus a kick published to whatever
//! session the previous holder still had open. Clients never
//! read-modify-write the holder themselves.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use tether_proto::{
    ClaimOutcome, DeviceRecord, MsgType, SessionRecord, SessionStatus, Side, SignalPayload,
};

use crate::error::RegistryError;
use crate::relay;
use crate::store::{DeviceStore, RelayStore, SessionStore};

/// Hash a PIN or bearer token for storage.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    hash_secret(secret) == hash
}

/// Generate a 6-digit one-time access code.
pub fn generate_pin() -> String {
    rand::thread_rng().gen_range(100_000..1_000_000).to_string()
}

pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Fixed TTL from creation for device sessions.
    pub session_ttl: Duration,
    /// TTL for ad-hoc support sessions.
    pub support_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::minutes(15),
            support_ttl: Duration::minutes(30),
        }
    }
}

/// Plaintext credentials for a freshly created session. Returned once;
/// only hashes are stored.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub pin: String,
    pub token: String,
}

pub struct SessionRegistry {
    store: Arc<dyn RelayStore>,
    config: RegistryConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self::with_config(store, RegistryConfig::default())
    }

    pub fn with_config(store: Arc<dyn RelayStore>, config: RegistryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Upsert a device on registration, preserving holder state across
    /// re-registrations of a known device.
    pub async fn register_device(
        &self,
        id: &str,
        name: &str,
        owner: Option<&str>,
    ) -> Result<DeviceRecord, RegistryError> {
        let existing = self.store.device(id).await?;
        let device = DeviceRecord {
            id: id.to_string(),
            name: name.to_string(),
            owner: owner
                .map(str::to_string)
                .or_else(|| existing.as_ref().and_then(|d| d.owner.clone())),
            is_online: true,
            last_seen: Utc::now(),
            holder: existing.as_ref().and_then(|d| d.holder.clone()),
            holder_type: existing.as_ref().and_then(|d| d.holder_type.clone()),
        };
        self.store.upsert_device(&device).await?;
        tracing::info!(device = %id, "device registered");
        Ok(device)
    }

    pub async fn heartbeat(&self, device_id: &str) -> Result<(), RegistryError> {
        if self.store.record_heartbeat(device_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(RegistryError::UnknownDevice(device_id.to_string()))
        }
    }

    /// Atomically take exclusive control of a device, displacing the
    /// previous holder. Exactly one of two racing claims wins; the
    /// loser observes `claimed: false`. The winner expires whatever
    /// pending/active session the device still had and publishes a
    /// `kick` to it first, so the displaced party learns why its
    /// channel died.
    pub async fn claim_device(
        &self,
        device_id: &str,
        controller_id: &str,
        controller_type: &str,
    ) -> Result<ClaimOutcome, RegistryError> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        if !device.is_online {
            return Err(RegistryError::DeviceOffline);
        }

        let won = self
            .store
            .swap_holder(
                device_id,
                device.holder.as_deref(),
                Some((controller_id, controller_type)),
            )
            .await?;
        if !won {
            tracing::info!(device = %device_id, controller = %controller_id, "claim lost race");
            return Ok(ClaimOutcome {
                claimed: false,
                kicked_sessions: 0,
            });
        }

        let mut kicked = 0u32;
        for mut session in self.store.open_sessions_for_device(device_id).await? {
            let kick = relay::publish(
                self.store.as_ref(),
                session.id,
                Side::System,
                MsgType::Kick,
                SignalPayload::Teardown {
                    reason: "displaced by another controller".to_string(),
                    new_controller_type: Some(controller_type.to_string()),
                },
            )
            .await;
            if let Err(err) = kick {
                tracing::warn!(session = %session.id, error = %err, "kick publish failed");
            }
            session.status = SessionStatus::Expired;
            session.ended_at = Some(Utc::now());
            self.store.update_session(&session).await?;
            kicked += 1;
        }

        tracing::info!(
            device = %device_id,
            controller = %controller_id,
            kicked,
            "device claimed"
        );
        Ok(ClaimOutcome {
            claimed: true,
            kicked_sessions: kicked,
        })
    }

    /// Create a session for a claimed device. The caller must be the
    /// device's current holder (claim first); together with the
    /// claim's kick that keeps at most one pending/active session per
    /// device.
    pub async fn create_session(
        &self,
        device_id: &str,
        creator: &str,
    ) -> Result<(SessionRecord, IssuedCredentials), RegistryError> {
        let device = self
            .store
            .device(device_id)
            .await?
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        if !device.is_online {
            return Err(RegistryError::DeviceOffline);
        }
        if let Some(owner) = &device.owner {
            if owner != creator {
                return Err(RegistryError::Unauthorized(format!(
                    "{creator} does not own device {device_id}"
                )));
            }
        }
        if device.holder.as_deref() != Some(creator) {
            return Err(RegistryError::Unauthorized(format!(
                "{creator} has not claimed device {device_id}"
            )));
        }

        let credentials = IssuedCredentials {
            pin: generate_pin(),
            token: generate_token(),
        };
        let now = Utc::now();
        let session = SessionRecord {
            id: Uuid::new_v4(),
            device_id: Some(device_id.to_string()),
            created_by: creator.to_string(),
            status: SessionStatus::Pending,
            pin_hash: hash_secret(&credentials.pin),
            token_hash: hash_secret(&credentials.token),
            created_at: now,
            expires_at: now + self.config.session_ttl,
            ended_at: None,
        };
        self.store.insert_session(&session).await?;
        tracing::info!(session = %session.id, device = %device_id, "session created");
        Ok((session, credentials))
    }

    /// Ad-hoc support flow: no persistent device, addressed by PIN and
    /// bearer token instead.
    pub async fn create_support_session(
        &self,
        creator: &str,
    ) -> Result<(SessionRecord, IssuedCredentials), RegistryError> {
        let credentials = IssuedCredentials {
            pin: generate_pin(),
            token: generate_token(),
        };
        let now = Utc::now();
        let session = SessionRecord {
            id: Uuid::new_v4(),
            device_id: None,
            created_by: creator.to_string(),
            status: SessionStatus::Pending,
            pin_hash: hash_secret(&credentials.pin),
            token_hash: hash_secret(&credentials.token),
            created_at: now,
            expires_at: now + self.config.support_ttl,
            ended_at: None,
        };
        self.store.insert_session(&session).await?;
        tracing::info!(session = %session.id, "support session created");
        Ok((session, credentials))
    }

    /// Redeem a support PIN. One-shot: the first claim flips the
    /// session to active, any later attempt is rejected.
    pub async fn claim_support_session(&self, pin: &str) -> Result<SessionRecord, RegistryError> {
        let mut session = self
            .store
            .session_by_pin_hash(&hash_secret(pin))
            .await?
            .ok_or_else(|| RegistryError::Unauthorized("unknown support code".to_string()))?;
        if session.expires_at < Utc::now() || session.status != SessionStatus::Pending {
            return Err(RegistryError::SessionExpired);
        }
        session.status = SessionStatus::Active;
        self.store.update_session(&session).await?;
        Ok(session)
    }

    /// Explicitly remove a device. Any open session is ended first so
    /// a connected peer is not left on a dead channel.
    pub async fn remove_device(&self, device_id: &str, caller: &str) -> Result<(), RegistryError> {
        let Some(device) = self.store.device(device_id).await? else {
            return Ok(());
        };
        if let Some(owner) = &device.owner {
            if owner != caller {
                return Err(RegistryError::Unauthorized(format!(
                    "{caller} does not own device {device_id}"
                )));
            }
        }
        for session in self.store.open_sessions_for_device(device_id).await? {
            if let Err(err) = relay::publish(
                self.store.as_ref(),
                session.id,
                Side::System,
                MsgType::Bye,
                SignalPayload::teardown("device_removed"),
            )
            .await
            {
                tracing::warn!(session = %session.id, error = %err, "bye publish failed");
            }
            self.end_session(session.id).await?;
        }
        self.store.delete_device(device_id).await?;
        tracing::info!(device = %device_id, "device removed");
        Ok(())
    }

    /// Idempotent: ending an already-ended (or already hard-deleted)
    /// session is a no-op.
    pub async fn end_session(&self, session_id: Uuid) -> Result<(), RegistryError> {
        let Some(mut session) = self.store.session(session_id).await? else {
            return Ok(());
        };
        if !session.is_open() {
            return Ok(());
        }
        session.status = SessionStatus::Ended;
        session.ended_at = Some(Utc::now());
        self.store.update_session(&session).await?;
        self.release_holder(&session).await?;
        tracing::info!(session = %session_id, "session ended");
        Ok(())
    }

    /// Drop the device's holder if it still belongs to this session's
    /// creator. Losing the swap just means someone else claimed since.
    pub(crate) async fn release_holder(
        &self,
        session: &SessionRecord,
    ) -> Result<(), RegistryError> {
        if let Some(device_id) = &session.device_id {
            let _ = self
                .store
                .swap_holder(device_id, Some(session.created_by.as_str()), None)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeviceStore, MemoryStore, SessionStore, SignalStore};

    fn registry() -> (Arc<MemoryStore>, SessionRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(Arc::clone(&store) as Arc<dyn RelayStore>);
        (store, registry)
    }

    async fn online_device(registry: &SessionRegistry, id: &str, owner: Option<&str>) {
        registry.register_device(id, "test device", owner).await.unwrap();
    }

    #[tokio::test]
    async fn claim_then_create_session() {
        let (_store, registry) = registry();
        online_device(&registry, "d1", Some("alice")).await;

        let outcome = registry.claim_device("d1", "alice", "controller").await.unwrap();
        assert!(outcome.claimed);
        assert_eq!(outcome.kicked_sessions, 0);

        let (session, creds) = registry.create_session("d1", "alice").await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(creds.pin.len(), 6);
        assert!(verify_secret(&creds.token, &session.token_hash));
        assert!(verify_secret(&creds.pin, &session.pin_hash));
    }

    #[tokio::test]
    async fn create_without_claim_is_unauthorized() {
        let (_store, registry) = registry();
        online_device(&registry, "d1", Some("alice")).await;
        let err = registry.create_session("d1", "alice").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn claim_offline_device_fails() {
        let (store, registry) = registry();
        online_device(&registry, "d1", None).await;
        let mut device = store.device("d1").await.unwrap().unwrap();
        device.is_online = false;
        store.upsert_device(&device).await.unwrap();

        let err = registry.claim_device("d1", "alice", "controller").await.unwrap_err();
        assert!(matches!(err, RegistryError::DeviceOffline));
    }

    #[tokio::test]
    async fn takeover_kicks_previous_session() {
        let (store, registry) = registry();
        online_device(&registry, "d1", None).await;

        registry.claim_device("d1", "alice", "controller").await.unwrap();
        let (first, _) = registry.create_session("d1", "alice").await.unwrap();

        let outcome = registry.claim_device("d1", "bob", "controller").await.unwrap();
        assert!(outcome.claimed);
        assert_eq!(outcome.kicked_sessions, 1);

        let displaced = store.session(first.id).await.unwrap().unwrap();
        assert_eq!(displaced.status, SessionStatus::Expired);

        let kicks = store
            .signals_for_session(first.id, &[Side::System], 0)
            .await
            .unwrap();
        assert_eq!(kicks.len(), 1);
        assert_eq!(kicks[0].msg_type, MsgType::Kick);

        let device = store.device("d1").await.unwrap().unwrap();
        assert_eq!(device.holder.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn end_session_is_idempotent_and_releases_holder() {
        let (store, registry) = registry();
        online_device(&registry, "d1", None).await;
        registry.claim_device("d1", "alice", "controller").await.unwrap();
        let (session, _) = registry.create_session("d1", "alice").await.unwrap();

        registry.end_session(session.id).await.unwrap();
        registry.end_session(session.id).await.unwrap();
        registry.end_session(Uuid::new_v4()).await.unwrap();

        let ended = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);
        assert!(ended.ended_at.is_some());
        let device = store.device("d1").await.unwrap().unwrap();
        assert!(device.holder.is_none());
    }

    #[tokio::test]
    async fn remove_device_ends_open_sessions() {
        let (store, registry) = registry();
        online_device(&registry, "d1", Some("alice")).await;
        registry.claim_device("d1", "alice", "controller").await.unwrap();
        let (session, _) = registry.create_session("d1", "alice").await.unwrap();

        let err = registry.remove_device("d1", "mallory").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));

        registry.remove_device("d1", "alice").await.unwrap();
        assert!(store.device("d1").await.unwrap().is_none());
        let ended = store.session(session.id).await.unwrap().unwrap();
        assert_eq!(ended.status, SessionStatus::Ended);

        // Unknown device: removal is a no-op.
        registry.remove_device("d1", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn support_pin_is_one_shot() {
        let (_store, registry) = registry();
        let (session, creds) = registry.create_support_session("helper").await.unwrap();
        assert!(session.device_id.is_none());

        let claimed = registry.claim_support_session(&creds.pin).await.unwrap();
        assert_eq!(claimed.status, SessionStatus::Active);

        let err = registry.claim_support_session(&creds.pin).await.unwrap_err();
        assert!(matches!(err, RegistryError::SessionExpired));

        let err = registry.claim_support_session("000000").await.unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized(_)));
    }
}
