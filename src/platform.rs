//! src/platform.rs
//! Narrow boundary between the safety engines and the chat platform.
//!
//! The engines never touch SDK types directly: inbound events are distilled
//! into the small carrier structs below by the gateway glue, and every
//! outbound side effect goes through the [`Platform`] trait. This keeps the
//! engines testable with an in-memory platform and decouples them from the
//! serenity object graph.

use chrono::{DateTime, Utc};
use serenity::async_trait;
use thiserror::Error;

/// Failure taxonomy for platform calls.
///
/// `Transient` never blocks a pipeline (callers degrade and move on);
/// `PermissionDenied` is reported per target and the batch continues.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("missing permission for target {target}")]
    PermissionDenied { target: u64 },
    #[error("no longer exists: {0}")]
    NotFound(String),
}

/// One invite as reported by the platform. `max_uses`/`max_age_secs` of 0
/// mean unlimited, matching the wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRecord {
    pub code: String,
    pub uses: u64,
    pub max_uses: u64,
    pub max_age_secs: u64,
    pub created_at: DateTime<Utc>,
    pub inviter_id: Option<u64>,
}

/// A member-join event, already reduced to what attribution needs.
#[derive(Debug, Clone)]
pub struct JoinEvent {
    pub guild_id: u64,
    pub member_id: u64,
    pub joined_at: DateTime<Utc>,
    /// Joined while connected to a voice/stage surface; no text invite applies.
    pub arrived_via_voice: bool,
}

/// A guild message reduced to the fields the detectors consume.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub author_id: u64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub role_mention_count: u32,
    pub mentioned_user_ids: Vec<u64>,
    pub attachment_names: Vec<String>,
    /// No language role yet, or joined within the last day. Resolved by the
    /// gateway glue at delivery time; the detectors treat it as ground truth.
    pub author_is_newcomer: bool,
    /// Staff/booster/long-standing member; exempt from history scoring.
    pub author_is_trusted: bool,
    pub author_joined_at: Option<DateTime<Utc>>,
}

impl MessageEvent {
    pub fn user_mention_count(&self) -> u32 {
        self.mentioned_user_ids.len() as u32
    }
}

/// Everything the engines may ask the platform to do. Implemented by the
/// serenity glue in production and by in-memory fakes in tests.
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    async fn fetch_invites(&self, guild_id: u64) -> Result<Vec<InviteRecord>, PlatformError>;

    /// The guild's vanity invite, if the platform exposes one (with usage).
    async fn fetch_vanity_invite(
        &self,
        guild_id: u64,
    ) -> Result<Option<InviteRecord>, PlatformError>;

    /// Post a plain notice in a channel (rendering stays in the glue).
    async fn send_notice(&self, channel_id: u64, text: &str) -> Result<(), PlatformError>;

    async fn delete_message(&self, channel_id: u64, message_id: u64)
    -> Result<(), PlatformError>;

    /// Strip the interactive controls from a resolved prompt and annotate it.
    async fn retire_prompt(
        &self,
        channel_id: u64,
        message_id: u64,
        note: &str,
    ) -> Result<(), PlatformError>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        purge_days: u8,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn fetch_recent_history(
        &self,
        guild_id: u64,
        channel_id: u64,
        limit: u8,
    ) -> Result<Vec<MessageEvent>, PlatformError>;

    /// Append a line to the moderation audit log. Best effort by contract;
    /// implementations must not fail the caller.
    async fn post_audit_line(&self, guild_id: u64, text: &str);
}

/* =========================================
   In-memory platform for unit tests
   ========================================= */

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every side effect and serves canned invite lists.
    #[derive(Default)]
    pub struct MemoryPlatform {
        pub invites: Mutex<Vec<InviteRecord>>,
        pub vanity: Mutex<Option<InviteRecord>>,
        pub fail_invite_fetch: Mutex<bool>,
        /// Simulated latency of the invite endpoint (drives burst overlap
        /// under a paused test clock).
        pub fetch_delay: Mutex<Option<std::time::Duration>>,
        pub fetch_count: Mutex<u32>,
        pub banned: Mutex<Vec<(u64, String)>>,
        pub ban_denied: Mutex<HashSet<u64>>,
        pub roles_added: Mutex<Vec<(u64, u64)>>,
        pub roles_removed: Mutex<Vec<(u64, u64)>>,
        pub notices: Mutex<Vec<(u64, String)>>,
        pub audit: Mutex<Vec<String>>,
        pub retired: Mutex<Vec<(u64, u64, String)>>,
        pub deleted: Mutex<Vec<(u64, u64)>>,
        pub history: Mutex<Vec<MessageEvent>>,
    }

    impl MemoryPlatform {
        pub fn with_invites(invites: Vec<InviteRecord>) -> Self {
            let p = Self::default();
            *p.invites.lock().unwrap() = invites;
            p
        }

        pub fn set_invites(&self, invites: Vec<InviteRecord>) {
            *self.invites.lock().unwrap() = invites;
        }
    }

    #[async_trait]
    impl Platform for MemoryPlatform {
        async fn fetch_invites(&self, _guild_id: u64) -> Result<Vec<InviteRecord>, PlatformError> {
            *self.fetch_count.lock().unwrap() += 1;
            let delay = *self.fetch_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if *self.fail_invite_fetch.lock().unwrap() {
                return Err(PlatformError::Transient("fetch refused".into()));
            }
            Ok(self.invites.lock().unwrap().clone())
        }

        async fn fetch_vanity_invite(
            &self,
            _guild_id: u64,
        ) -> Result<Option<InviteRecord>, PlatformError> {
            if *self.fail_invite_fetch.lock().unwrap() {
                return Err(PlatformError::Transient("fetch refused".into()));
            }
            Ok(self.vanity.lock().unwrap().clone())
        }

        async fn send_notice(&self, channel_id: u64, text: &str) -> Result<(), PlatformError> {
            self.notices.lock().unwrap().push((channel_id, text.to_string()));
            Ok(())
        }

        async fn delete_message(
            &self,
            channel_id: u64,
            message_id: u64,
        ) -> Result<(), PlatformError> {
            self.deleted.lock().unwrap().push((channel_id, message_id));
            Ok(())
        }

        async fn retire_prompt(
            &self,
            channel_id: u64,
            message_id: u64,
            note: &str,
        ) -> Result<(), PlatformError> {
            self.retired
                .lock()
                .unwrap()
                .push((channel_id, message_id, note.to_string()));
            Ok(())
        }

        async fn add_role(
            &self,
            _guild_id: u64,
            user_id: u64,
            role_id: u64,
            _reason: &str,
        ) -> Result<(), PlatformError> {
            self.roles_added.lock().unwrap().push((user_id, role_id));
            Ok(())
        }

        async fn remove_role(
            &self,
            _guild_id: u64,
            user_id: u64,
            role_id: u64,
            _reason: &str,
        ) -> Result<(), PlatformError> {
            self.roles_removed.lock().unwrap().push((user_id, role_id));
            Ok(())
        }

        async fn ban(
            &self,
            _guild_id: u64,
            user_id: u64,
            _purge_days: u8,
            reason: &str,
        ) -> Result<(), PlatformError> {
            if self.ban_denied.lock().unwrap().contains(&user_id) {
                return Err(PlatformError::PermissionDenied { target: user_id });
            }
            self.banned.lock().unwrap().push((user_id, reason.to_string()));
            Ok(())
        }

        async fn fetch_recent_history(
            &self,
            _guild_id: u64,
            _channel_id: u64,
            limit: u8,
        ) -> Result<Vec<MessageEvent>, PlatformError> {
            let h = self.history.lock().unwrap();
            Ok(h.iter().take(limit as usize).cloned().collect())
        }

        async fn post_audit_line(&self, _guild_id: u64, text: &str) {
            self.audit.lock().unwrap().push(text.to_string());
        }
    }
}
