//! src/enforcer.rs
//! Confirmation-gated enforcement: a race between authorized moderators and
//! a timeout.
//!
//! Every prompt is a tiny state machine, `Open → {Banned, Dismissed,
//! TimedOut}`, all three terminal. Confirmation gestures re-validate the
//! actor's role tier at the moment of the gesture, then attempt one atomic
//! claim under the prompt mutex; exactly one transition out of `Open` ever
//! succeeds, the loser's gesture has no effect. Side effects run after the
//! claim: per-target failures are reported inline and never abort the rest
//! of the batch.
//!
//! The bulk variant gives up to ten targets their own confirmation control
//! next to one fan-out control. Targets resolve independently while the
//! fan-out stays live; once every target is resolved the fan-out control is
//! retired early, ahead of its own timeout.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::config::{EnforcerConfig, Roles};
use crate::permissions::{RoleTier, tier_allows};
use crate::platform::Platform;

/* =========================================
   Requests, outcomes, gestures
   ========================================= */

#[derive(Debug, Clone)]
pub struct EnforcementRequest {
    pub guild_id: u64,
    pub channel_id: u64,
    pub targets: Vec<u64>,
    pub reason: String,
    pub tier: RoleTier,
    /// Prompt was opened as mute-until-confirmed: lift the mute on
    /// dismissal or timeout.
    pub unmute_on_dismiss: bool,
    /// Delete the prompt message on dismissal instead of annotating it.
    pub delete_on_dismiss: bool,
    pub ttl: Duration,
}

/// Exactly one terminal resolution per prompt, ever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    BannedBy(u64),
    DismissedBy(u64),
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    /// Ban every (remaining) target.
    Ban,
    /// Dismiss the prompt as a false alarm.
    Dismiss,
    /// Bulk prompts only: ban one specific target.
    BanTarget(u64),
}

/// The confirming member as seen at gesture time. Roles are resolved fresh
/// by the caller; nothing here is cached from prompt creation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: u64,
    pub roles: Vec<u64>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmResult {
    NotAuthorized,
    /// The prompt (or this specific target) already reached a terminal
    /// state; the gesture has no effect.
    AlreadyResolved,
    /// Bulk variant: one target resolved, the prompt stays live.
    TargetBanned(u64),
    Resolved(Resolution),
}

/* =========================================
   Prompt state
   ========================================= */

#[derive(Debug)]
enum Phase {
    Open,
    Terminal(Resolution),
}

struct PromptInner {
    phase: Phase,
    /// Bulk variant: targets already banned through their own control.
    resolved_targets: HashSet<u64>,
}

struct Prompt {
    id: u64,
    req: EnforcementRequest,
    inner: Mutex<PromptInner>,
    /// The posted prompt message, set when the prompt is armed.
    message: std::sync::Mutex<Option<(u64, u64)>>,
    /// Fired on terminal resolution; cancels the timeout wait.
    done: Notify,
}

/* =========================================
   Coordinator
   ========================================= */

pub struct Enforcer {
    platform: Arc<dyn Platform>,
    cfg: EnforcerConfig,
    roles: Roles,
    prompts: DashMap<u64, Arc<Prompt>>,
    next_id: AtomicU64,
}

impl Enforcer {
    pub fn new(platform: Arc<dyn Platform>, cfg: EnforcerConfig, roles: Roles) -> Arc<Self> {
        Arc::new(Self {
            platform,
            cfg,
            roles,
            prompts: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_secs)
    }

    /// Register a prompt and hand back its id for the message controls.
    /// The timeout clock starts at [`Enforcer::arm`].
    pub fn create(&self, mut req: EnforcementRequest) -> u64 {
        req.targets.truncate(self.cfg.max_bulk_targets);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.prompts.insert(
            id,
            Arc::new(Prompt {
                id,
                req,
                inner: Mutex::new(PromptInner {
                    phase: Phase::Open,
                    resolved_targets: HashSet::new(),
                }),
                message: std::sync::Mutex::new(None),
                done: Notify::new(),
            }),
        );
        id
    }

    /// Attach the posted prompt message and start the timeout race.
    pub fn arm(self: &Arc<Self>, id: u64, channel_id: u64, message_id: u64) {
        let Some(prompt) = self.prompts.get(&id).map(|p| Arc::clone(p.value())) else {
            return;
        };
        *prompt.message.lock().unwrap() = Some((channel_id, message_id));
        let this = self.clone();
        tokio::spawn(async move {
            let ttl = prompt.req.ttl;
            tokio::select! {
                _ = tokio::time::sleep(ttl) => {
                    if this.claim(&prompt, Resolution::TimedOut).await {
                        this.unmute_unresolved(&prompt, false).await;
                        this.finalize(&prompt, Resolution::TimedOut).await;
                    }
                }
                _ = prompt.done.notified() => {}
            }
        });
    }

    /// Drop a prompt whose message could not be posted.
    pub fn abort(&self, id: u64) {
        if let Some((_, prompt)) = self.prompts.remove(&id) {
            prompt.done.notify_waiters();
        }
    }

    /// The live prompt attached to a message, for reaction gestures.
    pub fn prompt_for_message(&self, channel_id: u64, message_id: u64) -> Option<u64> {
        self.prompts.iter().find_map(|entry| {
            let message = *entry.value().message.lock().unwrap();
            (message == Some((channel_id, message_id))).then(|| *entry.key())
        })
    }

    /// Apply one confirmation gesture. The tier check runs here, against
    /// the roles the actor holds right now.
    pub async fn confirm(&self, id: u64, actor: &Actor, gesture: Gesture) -> ConfirmResult {
        let Some(prompt) = self.prompts.get(&id).map(|p| Arc::clone(p.value())) else {
            return ConfirmResult::AlreadyResolved;
        };
        if !tier_allows(&self.roles, prompt.req.tier, &actor.roles, actor.is_admin) {
            return ConfirmResult::NotAuthorized;
        }

        match gesture {
            Gesture::BanTarget(target) => self.ban_one(&prompt, actor, target).await,
            Gesture::Ban => {
                let resolution = Resolution::BannedBy(actor.user_id);
                if !self.claim(&prompt, resolution.clone()).await {
                    return ConfirmResult::AlreadyResolved;
                }
                let remaining = {
                    let inner = prompt.inner.lock().await;
                    prompt
                        .req
                        .targets
                        .iter()
                        .filter(|t| !inner.resolved_targets.contains(t))
                        .copied()
                        .collect::<Vec<_>>()
                };
                // Each target independently; one failure never aborts the
                // rest.
                join_all(
                    remaining
                        .into_iter()
                        .map(|target| self.ban_target(&prompt, actor.user_id, target)),
                )
                .await;
                self.finalize(&prompt, resolution.clone()).await;
                ConfirmResult::Resolved(resolution)
            }
            Gesture::Dismiss => {
                let resolution = Resolution::DismissedBy(actor.user_id);
                if !self.claim(&prompt, resolution.clone()).await {
                    return ConfirmResult::AlreadyResolved;
                }
                self.unmute_unresolved(&prompt, true).await;
                self.finalize(&prompt, resolution.clone()).await;
                ConfirmResult::Resolved(resolution)
            }
        }
    }

    /* ===================== internals ===================== */

    /// The single atomic claim: check-then-set under the prompt mutex.
    async fn claim(&self, prompt: &Prompt, to: Resolution) -> bool {
        let mut inner = prompt.inner.lock().await;
        if matches!(inner.phase, Phase::Open) {
            inner.phase = Phase::Terminal(to);
            true
        } else {
            false
        }
    }

    async fn ban_one(&self, prompt: &Arc<Prompt>, actor: &Actor, target: u64) -> ConfirmResult {
        if !prompt.req.targets.contains(&target) {
            return ConfirmResult::AlreadyResolved;
        }
        let all_resolved = {
            let mut inner = prompt.inner.lock().await;
            if !matches!(inner.phase, Phase::Open) {
                return ConfirmResult::AlreadyResolved;
            }
            if !inner.resolved_targets.insert(target) {
                return ConfirmResult::AlreadyResolved;
            }
            inner.resolved_targets.len() == prompt.req.targets.len()
        };
        self.ban_target(prompt, actor.user_id, target).await;
        if all_resolved {
            // Every target went through its own control: retire the
            // fan-out early, ahead of its timeout.
            let resolution = Resolution::BannedBy(actor.user_id);
            if self.claim(prompt, resolution.clone()).await {
                self.finalize(prompt, resolution).await;
            }
        }
        ConfirmResult::TargetBanned(target)
    }

    async fn ban_target(&self, prompt: &Prompt, actor_id: u64, target: u64) {
        let reason = format!("Issued by: {actor_id}. Reason: {}", prompt.req.reason);
        match self
            .platform
            .ban(prompt.req.guild_id, target, self.cfg.purge_days, &reason)
            .await
        {
            Ok(()) => {
                let _ = self
                    .platform
                    .send_notice(
                        prompt.req.channel_id,
                        &format!("✅ <@{target}> has been banned by <@{actor_id}>"),
                    )
                    .await;
            }
            Err(e) => {
                warn!(prompt = prompt.id, target, error = ?e, "ban failed");
                let _ = self
                    .platform
                    .send_notice(
                        prompt.req.channel_id,
                        &format!("❌ <@{target}> could not be banned."),
                    )
                    .await;
            }
        }
    }

    /// Lift the auto-mute from every target that was not banned through its
    /// own control. Dismissals announce it; timeouts stay quiet.
    async fn unmute_unresolved(&self, prompt: &Prompt, announce: bool) {
        if !prompt.req.unmute_on_dismiss || self.roles.mute == 0 {
            return;
        }
        let remaining = {
            let inner = prompt.inner.lock().await;
            prompt
                .req
                .targets
                .iter()
                .filter(|t| !inner.resolved_targets.contains(t))
                .copied()
                .collect::<Vec<_>>()
        };
        join_all(remaining.into_iter().map(|target| async move {
            match self
                .platform
                .remove_role(
                    prompt.req.guild_id,
                    target,
                    self.roles.mute,
                    "Auto mute dismissed",
                )
                .await
            {
                Ok(()) if announce => {
                    let _ = self
                        .platform
                        .send_notice(prompt.req.channel_id, &format!("✅ Unmuted <@{target}>"))
                        .await;
                }
                Ok(()) => {}
                Err(e) => warn!(prompt = prompt.id, target, error = ?e, "unmute failed"),
            }
        }))
        .await;
    }

    /// Archive a terminal prompt: annotate or delete its message, write the
    /// audit line, cancel the timeout wait and drop the state.
    async fn finalize(&self, prompt: &Prompt, resolution: Resolution) {
        let message = *prompt.message.lock().unwrap();
        if let Some((channel_id, message_id)) = message {
            match &resolution {
                Resolution::BannedBy(actor) => {
                    let _ = self
                        .platform
                        .retire_prompt(channel_id, message_id, &format!("Banned by <@{actor}>"))
                        .await;
                }
                Resolution::DismissedBy(actor) => {
                    if prompt.req.delete_on_dismiss {
                        let _ = self.platform.delete_message(channel_id, message_id).await;
                    } else {
                        let note = if prompt.req.unmute_on_dismiss {
                            format!(
                                "False alarm. They have been unmuted. Dismissed by <@{actor}>"
                            )
                        } else {
                            format!("False alarm. Dismissed by <@{actor}>")
                        };
                        let _ = self.platform.retire_prompt(channel_id, message_id, &note).await;
                    }
                }
                Resolution::TimedOut => {
                    let mins = prompt.req.ttl.as_secs() / 60;
                    let _ = self
                        .platform
                        .retire_prompt(
                            channel_id,
                            message_id,
                            &format!("Timed out after {mins} minutes"),
                        )
                        .await;
                }
            }
        }

        let line = match &resolution {
            Resolution::BannedBy(actor) => format!(
                "Enforcement #{}: banned {:?} by {} ({})",
                prompt.id, prompt.req.targets, actor, prompt.req.reason
            ),
            Resolution::DismissedBy(actor) => format!(
                "Enforcement #{}: dismissed by {} ({})",
                prompt.id, actor, prompt.req.reason
            ),
            // Timeouts are audit-only by design; the channel stays quiet.
            Resolution::TimedOut => format!(
                "Enforcement #{}: timed out ({})",
                prompt.id, prompt.req.reason
            ),
        };
        self.platform.post_audit_line(prompt.req.guild_id, &line).await;
        info!(prompt = prompt.id, resolution = ?resolution, "prompt resolved");

        prompt.done.notify_waiters();
        self.prompts.remove(&prompt.id);
    }
}

/* =========================================
   Tests
   ========================================= */
