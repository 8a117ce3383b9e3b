//! src/joinguard.rs
//! JoinGuard – attributes member joins to the invite that was used.
//!
//! The platform never reports which invite a member joined with, and the
//! invite list endpoint is slow and rate limited. The engine keeps a
//! baseline usage snapshot per guild, diffs a fresh fetch against it on
//! every join, and resolves concurrent joins as one burst:
//! - adaptive freshness: a fetch that took `d` to complete is reused for
//!   `d` after it lands (the remote counters are no fresher than that),
//! - a unique `uses` increase attributes the join and is committed into the
//!   baseline at once so a second join in the same burst cannot claim it,
//! - several increases push the member into a multi-join buffer that is
//!   resolved as one joint ambiguous report when the burst drains.
//!
//! Attribution is best effort. A failed fetch degrades to a discovery
//! classification with an annotation; the join pipeline never blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::JoinGuardConfig;
use crate::platform::{InviteRecord, JoinEvent, Platform};

/* ==============================
   Public classification types
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinKind {
    /// No invite evidence: server discovery, a vanished one-use invite, or a
    /// degraded lookup. The annotation says which.
    Discovery { annotation: Option<String> },
    /// Exactly one invite's usage moved. `inferred` marks the low-confidence
    /// "hit max uses, then deleted" case.
    AttributedInvite {
        code: String,
        inviter_id: Option<u64>,
        inferred: bool,
    },
    /// Several candidates moved at once; resolved jointly at burst drain.
    Ambiguous { candidates: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClassification {
    pub member_id: u64,
    pub kind: JoinKind,
    pub batch_id: u64,
}

/* ==============================
   Per-guild state
   ============================== */

#[derive(Debug, Clone)]
struct Candidate {
    record: InviteRecord,
    vanity: bool,
    inferred: bool,
}

#[derive(Debug, Default)]
struct InviteBaseline {
    baseline: HashMap<String, InviteRecord>,
    vanity_uses: u64,
    /// Latest fetch, kept until a burst drains and commits it.
    fresh: HashMap<String, InviteRecord>,
    fresh_vanity: Option<InviteRecord>,
    fetched_at: Option<Instant>,
    fetch_elapsed: Duration,
}

impl InviteBaseline {
    fn fresh_enough(&self) -> bool {
        matches!(self.fetched_at, Some(t) if t.elapsed() < self.fetch_elapsed)
    }

    fn candidates(&self, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut out = Vec::new();
        for (code, fresh) in &self.fresh {
            let old_uses = self.baseline.get(code).map(|i| i.uses).unwrap_or(0);
            if fresh.uses != old_uses {
                out.push(Candidate {
                    record: fresh.clone(),
                    vanity: false,
                    inferred: false,
                });
            }
        }
        // An invite one use away from exhaustion that vanished from the
        // fresh fetch was most likely used up and auto-deleted. Kept as a
        // low-confidence candidate, never a certainty.
        for (code, old) in &self.baseline {
            if old.max_uses == 0 || old.max_uses - old.uses != 1 {
                continue;
            }
            if self.fresh.contains_key(code) {
                continue;
            }
            if old.max_age_secs > 0 {
                let expires = old.created_at + chrono::Duration::seconds(old.max_age_secs as i64);
                if now > expires {
                    continue;
                }
            }
            out.push(Candidate {
                record: old.clone(),
                vanity: false,
                inferred: true,
            });
        }
        if let Some(v) = &self.fresh_vanity {
            if v.uses != self.vanity_uses {
                out.push(Candidate {
                    record: v.clone(),
                    vanity: true,
                    inferred: false,
                });
            }
        }
        out
    }

    /// Book a unique attribution into the baseline so a concurrent join in
    /// the same burst cannot claim the same increment.
    fn commit_unique(&mut self, cand: &Candidate) {
        if cand.vanity {
            self.vanity_uses += 1;
        } else if let Some(inv) = self.baseline.get_mut(&cand.record.code) {
            inv.uses += 1;
        } else {
            self.baseline
                .insert(cand.record.code.clone(), cand.record.clone());
        }
    }

    /// Replace the baseline wholesale with the latest fetch.
    fn commit_fresh(&mut self) {
        self.baseline = self.fresh.clone();
        self.vanity_uses = self.fresh_vanity.as_ref().map(|v| v.uses).unwrap_or(0);
    }
}

#[derive(Debug, Default)]
struct BurstQueue {
    in_flight: Vec<u64>,
    pending_multi: Vec<u64>,
    batch_seq: u64,
}

struct GuildJoinState {
    invites: Mutex<InviteBaseline>,
    queue: Mutex<BurstQueue>,
    recent: Mutex<VecDeque<JoinClassification>>,
}

impl GuildJoinState {
    fn new() -> Self {
        Self {
            invites: Mutex::new(InviteBaseline::default()),
            queue: Mutex::new(BurstQueue::default()),
            recent: Mutex::new(VecDeque::new()),
        }
    }
}

/* ==============================
   Engine
   ============================== */

pub struct JoinGuard {
    platform: Arc<dyn Platform>,
    cfg: JoinGuardConfig,
    visitor_role: u64,
    guilds: DashMap<u64, Arc<GuildJoinState>>,
}

impl JoinGuard {
    pub fn new(platform: Arc<dyn Platform>, cfg: JoinGuardConfig, visitor_role: u64) -> Arc<Self> {
        Arc::new(Self {
            platform,
            cfg,
            visitor_role,
            guilds: DashMap::new(),
        })
    }

    fn guild(&self, guild_id: u64) -> Arc<GuildJoinState> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildJoinState::new()))
            .clone()
    }

    /// Prime the invite baseline at startup / guild availability.
    pub async fn warmup(&self, guild_id: u64) {
        let st = self.guild(guild_id);
        let mut inv = st.invites.lock().await;
        let started = Instant::now();
        match self.fetch_all(guild_id).await {
            Ok((list, vanity)) => {
                let elapsed = started.elapsed();
                inv.baseline = list;
                inv.vanity_uses = vanity.as_ref().map(|v| v.uses).unwrap_or(0);
                inv.fresh = inv.baseline.clone();
                inv.fresh_vanity = vanity;
                inv.fetch_elapsed = elapsed;
                inv.fetched_at = Some(Instant::now());
                info!(gid = guild_id, invites = inv.baseline.len(), "invite baseline warmed");
            }
            Err(e) => warn!(gid = guild_id, error = ?e, "invite warmup failed"),
        }
    }

    /// Fold a freshly created limited invite into the baseline so its usage
    /// is diffable before the next refresh.
    pub async fn record_invite_created(&self, guild_id: u64, invite: InviteRecord) {
        if invite.max_uses == 0 {
            return;
        }
        let st = self.guild(guild_id);
        let mut inv = st.invites.lock().await;
        inv.baseline.insert(invite.code.clone(), invite);
    }

    /// The recent-join log kept for moderator inspection.
    pub async fn recent_joins(&self, guild_id: u64) -> Vec<JoinClassification> {
        let st = self.guild(guild_id);
        let log = st.recent.lock().await;
        log.iter().cloned().collect()
    }

    /// Classify one join. Returns `None` when the classification is deferred
    /// to the burst drain (multi-join) or the event is a duplicate.
    pub async fn handle_join(&self, ev: &JoinEvent) -> Option<JoinClassification> {
        let st = self.guild(ev.guild_id);

        if ev.arrived_via_voice {
            // Stage/voice arrival: no text invite applies.
            if self.visitor_role != 0 {
                let _ = self
                    .platform
                    .add_role(ev.guild_id, ev.member_id, self.visitor_role, "stage visitor")
                    .await;
            }
            let c = JoinClassification {
                member_id: ev.member_id,
                kind: JoinKind::Discovery {
                    annotation: Some("stage visitor".into()),
                },
                batch_id: 0,
            };
            self.push_recent(&st, c.clone()).await;
            self.platform
                .post_audit_line(
                    ev.guild_id,
                    &format!("Detected voice state upon joining {}", ev.member_id),
                )
                .await;
            return Some(c);
        }

        // Enqueue into the in-flight burst.
        let batch_id = {
            let mut q = st.queue.lock().await;
            if q.in_flight.contains(&ev.member_id) {
                warn!(gid = ev.guild_id, uid = ev.member_id, "duplicate join event");
                return None;
            }
            if q.in_flight.is_empty() {
                q.batch_seq += 1;
            }
            q.in_flight.push(ev.member_id);
            q.batch_seq
        };

        let now = Utc::now();
        let mut inv = st.invites.lock().await;

        let mut lookup_failed = false;
        if inv.fresh_enough() {
            info!(gid = ev.guild_id, uid = ev.member_id, "using invite caches");
        } else {
            let started = Instant::now();
            match self.fetch_all(ev.guild_id).await {
                Ok((list, vanity)) => {
                    inv.fetch_elapsed = started.elapsed();
                    inv.fetched_at = Some(Instant::now());
                    inv.fresh = list;
                    inv.fresh_vanity = vanity;
                }
                Err(e) => {
                    warn!(gid = ev.guild_id, uid = ev.member_id, error = ?e, "invite lookup failed");
                    lookup_failed = true;
                }
            }
        }

        let candidates = if lookup_failed {
            Vec::new()
        } else {
            inv.candidates(now)
        };

        let classification = if lookup_failed {
            Some(JoinClassification {
                member_id: ev.member_id,
                kind: JoinKind::Discovery {
                    annotation: Some("invite lookup failed".into()),
                },
                batch_id,
            })
        } else {
            match candidates.len() {
                0 => Some(JoinClassification {
                    member_id: ev.member_id,
                    kind: JoinKind::Discovery { annotation: None },
                    batch_id,
                }),
                1 => {
                    let cand = &candidates[0];
                    inv.commit_unique(cand);
                    Some(JoinClassification {
                        member_id: ev.member_id,
                        kind: JoinKind::AttributedInvite {
                            code: cand.record.code.clone(),
                            inviter_id: cand.record.inviter_id,
                            inferred: cand.inferred,
                        },
                        batch_id,
                    })
                }
                _ => None, // resolved jointly at burst drain
            }
        };

        // Dequeue; on an empty queue the burst is complete.
        let mut q = st.queue.lock().await;
        q.in_flight.retain(|id| *id != ev.member_id);
        if classification.is_none() && !lookup_failed {
            q.pending_multi.push(ev.member_id);
        }
        let drained = if q.in_flight.is_empty() {
            Some(std::mem::take(&mut q.pending_multi))
        } else {
            info!(gid = ev.guild_id, in_flight = q.in_flight.len(), "burst still in flight");
            None
        };
        drop(q);

        if let Some(multi) = drained {
            // Joint resolution first (post unique-commit view), then commit
            // the fetched snapshot as the new baseline. A unique attribution
            // already booked its increment, so the baseline is kept as-is in
            // that case.
            let joint: Vec<String> = inv
                .candidates(now)
                .iter()
                .map(|c| c.record.code.clone())
                .collect();
            let attributed_unique = matches!(
                classification.as_ref().map(|c| &c.kind),
                Some(JoinKind::AttributedInvite { .. })
            );
            if !attributed_unique && !lookup_failed {
                inv.commit_fresh();
            }
            drop(inv);

            if !multi.is_empty() {
                for member_id in &multi {
                    let c = JoinClassification {
                        member_id: *member_id,
                        kind: JoinKind::Ambiguous {
                            candidates: joint.clone(),
                        },
                        batch_id,
                    };
                    self.push_recent(&st, c).await;
                }
                let members = multi
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.platform
                    .post_audit_line(
                        ev.guild_id,
                        &format!(
                            "{} joined with {} (multi, batch {})",
                            members,
                            joint.join(", "),
                            batch_id
                        ),
                    )
                    .await;
            }
        } else {
            drop(inv);
        }

        if let Some(c) = &classification {
            self.push_recent(&st, c.clone()).await;
            self.audit_single(ev.guild_id, c).await;
        }
        classification
    }

    async fn audit_single(&self, guild_id: u64, c: &JoinClassification) {
        let line = match &c.kind {
            JoinKind::Discovery { annotation } => match annotation {
                Some(note) => format!("Discovery join {} ({note})", c.member_id),
                None => format!("Discovery join {}", c.member_id),
            },
            JoinKind::AttributedInvite {
                code,
                inviter_id,
                inferred,
            } => {
                let from = inviter_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "vanity".into());
                if *inferred {
                    format!("{} joined with {code} from {from} (inferred, low confidence)", c.member_id)
                } else {
                    format!("{} joined with {code} from {from}", c.member_id)
                }
            }
            // Joint ambiguous reports are audited at drain time.
            JoinKind::Ambiguous { .. } => return,
        };
        self.platform.post_audit_line(guild_id, &line).await;
    }

    async fn push_recent(&self, st: &GuildJoinState, c: JoinClassification) {
        let mut log = st.recent.lock().await;
        log.push_back(c);
        while log.len() > self.cfg.recent_log_cap {
            log.pop_front();
        }
    }

    async fn fetch_all(
        &self,
        guild_id: u64,
    ) -> Result<(HashMap<String, InviteRecord>, Option<InviteRecord>), crate::platform::PlatformError>
    {
        let list = self.platform.fetch_invites(guild_id).await?;
        let vanity = self.platform.fetch_vanity_invite(guild_id).await?;
        Ok((
            list.into_iter().map(|i| (i.code.clone(), i)).collect(),
            vanity,
        ))
    }

    #[cfg(test)]
    async fn force_fetch_interval(&self, guild_id: u64, interval: Duration) {
        let st = self.guild(guild_id);
        let mut inv = st.invites.lock().await;
        inv.fetched_at = Some(Instant::now());
        inv.fetch_elapsed = interval;
    }
}

/* ==============================
   Tests
   ============================== */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MemoryPlatform;

    const GUILD: u64 = 10;

    fn invite(code: &str, uses: u64, max_uses: u64) -> InviteRecord {
        InviteRecord {
            code: code.into(),
            uses,
            max_uses,
            max_age_secs: 0,
            created_at: Utc::now(),
            inviter_id: Some(777),
        }
    }

    fn join(member_id: u64) -> JoinEvent {
        JoinEvent {
            guild_id: GUILD,
            member_id,
            joined_at: Utc::now(),
            arrived_via_voice: false,
        }
    }

    fn guard(platform: Arc<MemoryPlatform>) -> Arc<JoinGuard> {
        JoinGuard::new(platform, JoinGuardConfig::default(), 0)
    }

    #[tokio::test(start_paused = true)]
    async fn unique_increase_attributes_the_join() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![
            invite("abc", 3, 0),
            invite("def", 1, 0),
        ]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        p.set_invites(vec![invite("abc", 4, 0), invite("def", 1, 0)]);
        let c = g.handle_join(&join(1)).await.unwrap();
        assert_eq!(
            c.kind,
            JoinKind::AttributedInvite {
                code: "abc".into(),
                inviter_id: Some(777),
                inferred: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_change_classifies_discovery_never_ambiguous() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("abc", 3, 0)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        let c = g.handle_join(&join(1)).await.unwrap();
        assert_eq!(c.kind, JoinKind::Discovery { annotation: None });
    }

    #[tokio::test(start_paused = true)]
    async fn replaying_unchanged_snapshot_is_idempotent() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("abc", 3, 0)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        p.set_invites(vec![invite("abc", 4, 0)]);
        let c = g.handle_join(&join(1)).await.unwrap();
        assert!(matches!(c.kind, JoinKind::AttributedInvite { .. }));

        // Same snapshot, next join: the increment was committed, so nothing
        // new is attributed.
        let c = g.handle_join(&join(2)).await.unwrap();
        assert_eq!(c.kind, JoinKind::Discovery { annotation: None });
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_k_joins_on_one_invite_attributes_all_k() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("abc", 0, 0)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        // Three joins land while the invite shows +3; the committed
        // increments keep each join claiming exactly one use.
        p.set_invites(vec![invite("abc", 3, 0)]);
        for member in 1..=3u64 {
            let c = g.handle_join(&join(member)).await.unwrap();
            assert!(
                matches!(&c.kind, JoinKind::AttributedInvite { code, .. } if code == "abc"),
                "member {member} got {:?}",
                c.kind
            );
        }
        // All three uses are claimed now.
        let c = g.handle_join(&join(4)).await.unwrap();
        assert_eq!(c.kind, JoinKind::Discovery { annotation: None });
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_multi_join_yields_one_joint_ambiguous_report() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![
            invite("abc", 0, 0),
            invite("def", 0, 0),
        ]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        // Five members join within one burst while two invites each moved
        // +1: nobody can be attributed alone. The slow fetch keeps the burst
        // open until every member has enqueued.
        p.set_invites(vec![invite("abc", 1, 0), invite("def", 1, 0)]);
        *p.fetch_delay.lock().unwrap() = Some(Duration::from_secs(5));

        let mut handles = Vec::new();
        for member in 1..=5u64 {
            let g = g.clone();
            handles.push(tokio::spawn(async move { g.handle_join(&join(member)).await }));
        }
        for h in handles {
            // Deferred: every member is resolved at burst drain.
            assert!(h.await.unwrap().is_none());
        }

        let recent = g.recent_joins(GUILD).await;
        let ambiguous: Vec<_> = recent
            .iter()
            .filter(|c| matches!(c.kind, JoinKind::Ambiguous { .. }))
            .collect();
        assert_eq!(ambiguous.len(), 5);
        for c in &ambiguous {
            let JoinKind::Ambiguous { candidates } = &c.kind else {
                unreachable!()
            };
            let mut sorted = candidates.clone();
            sorted.sort();
            assert_eq!(sorted, vec!["abc".to_string(), "def".to_string()]);
        }
        // One joint report, same batch for everyone.
        let batch = ambiguous[0].batch_id;
        assert!(ambiguous.iter().all(|c| c.batch_id == batch));
        let joint_lines: Vec<_> = p
            .audit
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("(multi"))
            .cloned()
            .collect();
        assert_eq!(joint_lines.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_then_deleted_invite_is_inferred() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("last1", 4, 5)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        // The invite had one use left and vanished from the fresh fetch.
        p.set_invites(vec![]);
        let c = g.handle_join(&join(1)).await.unwrap();
        assert_eq!(
            c.kind,
            JoinKind::AttributedInvite {
                code: "last1".into(),
                inviter_id: Some(777),
                inferred: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn vanity_usage_moves_attribute_to_vanity() {
        let p = Arc::new(MemoryPlatform::default());
        *p.vanity.lock().unwrap() = Some(InviteRecord {
            code: "japanese".into(),
            uses: 100,
            max_uses: 0,
            max_age_secs: 0,
            created_at: Utc::now(),
            inviter_id: None,
        });
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        p.vanity.lock().unwrap().as_mut().unwrap().uses = 101;
        let c = g.handle_join(&join(1)).await.unwrap();
        assert!(
            matches!(&c.kind, JoinKind::AttributedInvite { code, inviter_id: None, .. } if code == "japanese")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_degrades_to_discovery() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("abc", 0, 0)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;

        *p.fail_invite_fetch.lock().unwrap() = true;
        let c = g.handle_join(&join(1)).await.unwrap();
        assert_eq!(
            c.kind,
            JoinKind::Discovery {
                annotation: Some("invite lookup failed".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cached_snapshot_is_reused_within_the_adaptive_window() {
        let p = Arc::new(MemoryPlatform::with_invites(vec![invite("abc", 0, 0)]));
        let g = guard(p.clone());
        g.warmup(GUILD).await;
        let after_warmup = *p.fetch_count.lock().unwrap();

        g.force_fetch_interval(GUILD, Duration::from_secs(3600)).await;
        let _ = g.handle_join(&join(1)).await;
        assert_eq!(*p.fetch_count.lock().unwrap(), after_warmup);
    }

    #[tokio::test(start_paused = true)]
    async fn voice_arrival_is_a_visitor_discovery() {
        let p = Arc::new(MemoryPlatform::default());
        let g = JoinGuard::new(p.clone(), JoinGuardConfig::default(), 555);
        let mut ev = join(1);
        ev.arrived_via_voice = true;
        let c = g.handle_join(&ev).await.unwrap();
        assert_eq!(
            c.kind,
            JoinKind::Discovery {
                annotation: Some("stage visitor".into())
            }
        );
        assert_eq!(p.roles_added.lock().unwrap().as_slice(), &[(1, 555)]);
        // No invite traffic at all for voice arrivals.
        assert_eq!(*p.fetch_count.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_log_is_bounded() {
        let p = Arc::new(MemoryPlatform::default());
        let g = guard(p.clone());
        g.warmup(GUILD).await;
        for member in 0..40u64 {
            let _ = g.handle_join(&join(member)).await;
        }
        assert_eq!(g.recent_joins(GUILD).await.len(), 20);
    }
}
