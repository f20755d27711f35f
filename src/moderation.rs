//! Fleet-wide moderation actions: a thin broadcast + listener fan-out.
//!
//! Moderation actions (bans, kicks, mutes, warnings) are broadcast to every
//! node as a message variant; each node fans incoming actions out to its
//! registered listeners and keeps active ban/mute records in the broker's
//! key/value store so any node can answer "is this player banned" without a
//! round trip to the issuer. Enforcement (actually kicking the player) is
//! the host's job.

use crate::error::LinkError;
use crate::messages::{MessageKind, MessageMeta, MessageVariant};
use crate::messaging::MessagingService;
use crate::transport::Transport;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A network-wide ban, permanent unless `expires_at` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBan {
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    pub reason: String,
    #[serde(rename = "moderatorId")]
    pub moderator_id: Uuid,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NetworkBan {
    pub fn permanent(player_id: Uuid, reason: impl Into<String>, moderator_id: Uuid) -> Self {
        Self {
            player_id,
            reason: reason.into(),
            moderator_id,
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn temporary(
        player_id: Uuid,
        reason: impl Into<String>,
        moderator_id: Uuid,
        duration: Duration,
    ) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            expires_at: Some(expires_at),
            ..Self::permanent(player_id, reason, moderator_id)
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_active(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => Utc::now() < expires_at,
        }
    }
}

/// A network-wide mute; same shape and expiry rules as a ban.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMute {
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    pub reason: String,
    #[serde(rename = "moderatorId")]
    pub moderator_id: Uuid,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
    #[serde(rename = "expiresAt", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NetworkMute {
    pub fn permanent(player_id: Uuid, reason: impl Into<String>, moderator_id: Uuid) -> Self {
        Self {
            player_id,
            reason: reason.into(),
            moderator_id,
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn temporary(
        player_id: Uuid,
        reason: impl Into<String>,
        moderator_id: Uuid,
        duration: Duration,
    ) -> Self {
        let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            expires_at: Some(expires_at),
            ..Self::permanent(player_id, reason, moderator_id)
        }
    }

    pub fn is_active(&self) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => Utc::now() < expires_at,
        }
    }
}

/// A network-wide kick; momentary, no stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkKick {
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    pub reason: String,
    #[serde(rename = "moderatorId")]
    pub moderator_id: Uuid,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

impl NetworkKick {
    pub fn new(player_id: Uuid, reason: impl Into<String>, moderator_id: Uuid) -> Self {
        Self {
            player_id,
            reason: reason.into(),
            moderator_id,
            issued_at: Utc::now(),
        }
    }
}

/// A warning issued to a player, fanned out but not stored by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkWarning {
    #[serde(rename = "playerId")]
    pub player_id: Uuid,
    pub reason: String,
    #[serde(rename = "moderatorId")]
    pub moderator_id: Uuid,
    #[serde(rename = "issuedAt")]
    pub issued_at: DateTime<Utc>,
}

impl NetworkWarning {
    pub fn new(player_id: Uuid, reason: impl Into<String>, moderator_id: Uuid) -> Self {
        Self {
            player_id,
            reason: reason.into(),
            moderator_id,
            issued_at: Utc::now(),
        }
    }
}

/// The moderation actions carried across the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationAction {
    Ban(NetworkBan),
    Unban {
        #[serde(rename = "playerId")]
        player_id: Uuid,
        #[serde(rename = "moderatorId")]
        moderator_id: Uuid,
        reason: String,
    },
    Kick(NetworkKick),
    Mute(NetworkMute),
    Unmute {
        #[serde(rename = "playerId")]
        player_id: Uuid,
        #[serde(rename = "moderatorId")]
        moderator_id: Uuid,
        reason: String,
    },
    Warning(NetworkWarning),
}

/// Message variant carrying one moderation action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationActionMessage {
    #[serde(flatten)]
    pub meta: MessageMeta,
    pub action: ModerationAction,
}

impl ModerationActionMessage {
    pub fn new(source: crate::types::NodeId, action: ModerationAction) -> Self {
        Self {
            meta: MessageMeta::new(source),
            action,
        }
    }
}

type ModerationListener = Arc<dyn Fn(&ModerationAction) + Send + Sync>;

fn ban_key(player_id: &Uuid) -> String {
    format!("moderation:ban:{player_id}")
}

fn mute_key(player_id: &Uuid) -> String {
    format!("moderation:mute:{player_id}")
}

/// Broadcasts moderation actions and fans incoming ones out to listeners.
pub struct ModerationService {
    messaging: Arc<MessagingService>,
    listeners: DashMap<u64, ModerationListener>,
    next_listener_id: AtomicU64,
    initialized: AtomicBool,
    weak_self: Weak<ModerationService>,
}

impl ModerationService {
    pub fn new(messaging: Arc<MessagingService>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            messaging,
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Installs the action handler on messaging. Idempotent.
    pub async fn initialize(&self) -> Result<(), LinkError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let weak = self.weak_self.clone();
        self.messaging
            .register_handler::<ModerationActionMessage, _, _>(move |message| {
                let weak = weak.clone();
                async move {
                    if let Some(service) = weak.upgrade() {
                        if let Err(e) = service.apply_record(&message.action).await {
                            error!("failed to record moderation action: {e}");
                        }
                        service.fan_out(&message.action);
                    }
                    Ok(())
                }
            });
        info!("moderation service initialized for {}", self.messaging.node_id());
        Ok(())
    }

    /// Removes the action handler and all listeners. Idempotent.
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.messaging.unregister_handler(MessageKind::ModerationAction);
        self.listeners.clear();
        Ok(())
    }

    /// Bans a player network-wide.
    pub async fn execute_ban(&self, ban: NetworkBan) -> Result<(), LinkError> {
        let action = ModerationAction::Ban(ban);
        self.apply_record(&action).await?;
        self.broadcast(action).await
    }

    /// Lifts a network-wide ban.
    pub async fn execute_unban(
        &self,
        player_id: Uuid,
        moderator_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), LinkError> {
        let action = ModerationAction::Unban {
            player_id,
            moderator_id,
            reason: reason.into(),
        };
        self.apply_record(&action).await?;
        self.broadcast(action).await
    }

    /// Kicks a player from every node they are on.
    pub async fn execute_kick(&self, kick: NetworkKick) -> Result<(), LinkError> {
        self.broadcast(ModerationAction::Kick(kick)).await
    }

    /// Mutes a player network-wide.
    pub async fn execute_mute(&self, mute: NetworkMute) -> Result<(), LinkError> {
        let action = ModerationAction::Mute(mute);
        self.apply_record(&action).await?;
        self.broadcast(action).await
    }

    /// Lifts a network-wide mute.
    pub async fn execute_unmute(
        &self,
        player_id: Uuid,
        moderator_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<(), LinkError> {
        let action = ModerationAction::Unmute {
            player_id,
            moderator_id,
            reason: reason.into(),
        };
        self.apply_record(&action).await?;
        self.broadcast(action).await
    }

    /// Issues a warning to a player.
    pub async fn execute_warning(&self, warning: NetworkWarning) -> Result<(), LinkError> {
        self.broadcast(ModerationAction::Warning(warning)).await
    }

    /// The active ban for `player_id`, if any.
    pub async fn active_ban(&self, player_id: Uuid) -> Result<Option<NetworkBan>, LinkError> {
        let Some(bytes) = self.transport().retrieve(&ban_key(&player_id)).await? else {
            return Ok(None);
        };
        let ban: NetworkBan = serde_json::from_slice(&bytes)
            .map_err(|e| LinkError::Deserialization(e.to_string()))?;
        Ok(ban.is_active().then_some(ban))
    }

    /// The active mute for `player_id`, if any.
    pub async fn active_mute(&self, player_id: Uuid) -> Result<Option<NetworkMute>, LinkError> {
        let Some(bytes) = self.transport().retrieve(&mute_key(&player_id)).await? else {
            return Ok(None);
        };
        let mute: NetworkMute = serde_json::from_slice(&bytes)
            .map_err(|e| LinkError::Deserialization(e.to_string()))?;
        Ok(mute.is_active().then_some(mute))
    }

    /// Registers a listener notified of every moderation action observed on
    /// this node (local or remote). Returns a token for unregistration.
    pub fn register_moderation_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&ModerationAction) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Removes a previously registered listener.
    pub fn unregister_moderation_listener(&self, id: u64) {
        self.listeners.remove(&id);
    }

    fn transport(&self) -> &Arc<dyn Transport> {
        self.messaging.transport()
    }

    async fn broadcast(&self, action: ModerationAction) -> Result<(), LinkError> {
        let message =
            ModerationActionMessage::new(self.messaging.node_id().clone(), action.clone());
        self.messaging.broadcast(message.into_message()).await?;
        // Broadcast loopback means this node never sees its own action
        // through messaging, so fan out locally as well.
        self.fan_out(&action);
        Ok(())
    }

    async fn apply_record(&self, action: &ModerationAction) -> Result<(), LinkError> {
        match action {
            ModerationAction::Ban(ban) => {
                let bytes = serde_json::to_vec(ban)?;
                match ban.expires_at {
                    Some(expires_at) => {
                        let Ok(ttl) = (expires_at - Utc::now()).to_std() else {
                            debug!("skipping record of already-expired ban");
                            return Ok(());
                        };
                        self.transport()
                            .store_with_ttl(&ban_key(&ban.player_id), &bytes, ttl)
                            .await
                    }
                    None => self.transport().store(&ban_key(&ban.player_id), &bytes).await,
                }
            }
            ModerationAction::Unban { player_id, .. } => {
                self.transport().delete(&ban_key(player_id)).await
            }
            ModerationAction::Mute(mute) => {
                let bytes = serde_json::to_vec(mute)?;
                match mute.expires_at {
                    Some(expires_at) => {
                        let Ok(ttl) = (expires_at - Utc::now()).to_std() else {
                            debug!("skipping record of already-expired mute");
                            return Ok(());
                        };
                        self.transport()
                            .store_with_ttl(&mute_key(&mute.player_id), &bytes, ttl)
                            .await
                    }
                    None => self
                        .transport()
                        .store(&mute_key(&mute.player_id), &bytes)
                        .await,
                }
            }
            ModerationAction::Unmute { player_id, .. } => {
                self.transport().delete(&mute_key(player_id)).await
            }
            ModerationAction::Kick(_) | ModerationAction::Warning(_) => Ok(()),
        }
    }

    fn fan_out(&self, action: &ModerationAction) {
        let listeners: Vec<ModerationListener> =
            self.listeners.iter().map(|e| Arc::clone(e.value())).collect();
        debug!("fanning moderation action out to {} listener(s)", listeners.len());
        for listener in listeners {
            listener(action);
        }
    }
}
