//! src/spamguard.rs
//! SpamGuard – repeated-content and mention-spam detection.
//!
//! Two sliding-window detectors share one algorithm shape: a bounded ring
//! buffer of per-author history entries with FIFO eviction, at most one live
//! entry per author. The newcomer variant is stricter (repeat 3, minimum
//! length 7) than the established one (repeat 5, minimum length 12); both
//! judge "in a row" with a 30 second rolling window.
//!
//! Stateless rules run alongside: mass role/user mentions flag for
//! confirmation, a normalized hard-slur or repeated `@everyone` from a
//! newcomer bans outright. The detector itself performs no side effects;
//! it returns a verdict for the caller to execute.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

use crate::config::{Channels, DetectorParams, SpamGuardConfig};
use crate::permissions::RoleTier;
use crate::platform::MessageEvent;

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static RE_INVITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(https?://)?(www\.)?(discord\.(gg|io|me|li)|discord(app)?\.com/invite)/\S+")
        .unwrap()
});
static RE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]+""#).unwrap());
// Mentions, channel links and custom emoji carry no abusive content of
// their own; length checks run on what remains.
static RE_PLATFORM_OBJ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<a?:\w+:\d+>|<[@#][!&]?\d+>").unwrap());
static RE_SHOUT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9 ?!']+$").unwrap());

// Single-script floods used by raid trolls; matched against the
// whitespace-stripped message.
static RE_SCRIPT_FLOOD: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^[\u{0600}-\u{06FF}\u{200f}\u{200e}0-9]+$").unwrap(),
        Regex::new(r"^[\u{0590}-\u{05FF}\u{200f}\u{200e}]+$").unwrap(),
        Regex::new(r"^[\u{3131}-\u{D79D}]+$").unwrap(),
        Regex::new(r"^[\u{0400}-\u{04FF}]+$").unwrap(),
    ]
});

/* =========================================
   Verdicts
   ========================================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hard policy violation: executed immediately, no confirmation.
    Ban { reason: String },
    /// Routed to human confirmation (mute-until-confirmed).
    Flag(Flag),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub reason: String,
    pub tier: RoleTier,
}

fn flag(reason: impl Into<String>, tier: RoleTier) -> Option<Verdict> {
    Some(Verdict::Flag(Flag {
        reason: reason.into(),
        tier,
    }))
}

/* =========================================
   Per-author repeat history
   ========================================= */

/// One live entry per author; a different qualifying message replaces the
/// entry wholesale rather than accumulating.
#[derive(Debug, Clone)]
pub struct AuthorHistoryEntry {
    author_id: u64,
    content: String,
    repeat_count: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug)]
struct RepeatBuffer {
    entries: VecDeque<AuthorHistoryEntry>,
    params: DetectorParams,
}

impl RepeatBuffer {
    fn new(params: DetectorParams) -> Self {
        Self {
            entries: VecDeque::new(),
            params,
        }
    }

    /// Record one qualifying message; true when the repeat threshold was
    /// crossed inside the rolling window.
    fn observe(
        &mut self,
        author_id: u64,
        content: &str,
        stripped_len: usize,
        at: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        if let Some(e) = self.entries.iter_mut().find(|e| e.author_id == author_id) {
            let doubled = format!("{}{}", e.content, e.content);
            if e.content == content || doubled == content {
                e.repeat_count += 1;
                let within = at - e.last_seen <= window;
                e.last_seen = at;
                if e.repeat_count >= self.params.repeat_threshold && within {
                    e.repeat_count = 1;
                    return true;
                }
            } else if stripped_len >= self.params.min_content_len {
                e.content = content.to_string();
                e.repeat_count = 1;
                e.last_seen = at;
            }
            return false;
        }
        if stripped_len >= self.params.min_content_len {
            self.entries.push_back(AuthorHistoryEntry {
                author_id,
                content: content.to_string(),
                repeat_count: 1,
                last_seen: at,
            });
            while self.entries.len() > self.params.capacity {
                self.entries.pop_front();
            }
        }
        false
    }
}

struct GuildSpamState {
    newcomer: Mutex<RepeatBuffer>,
    general: Mutex<RepeatBuffer>,
}

/* =========================================
   Engine
   ========================================= */

pub struct SpamGuard {
    cfg: SpamGuardConfig,
    channels: Channels,
    hard_slurs: Vec<Regex>,
    soft_words: Vec<Regex>,
    guilds: DashMap<u64, Arc<GuildSpamState>>,
}

impl SpamGuard {
    pub fn new(cfg: SpamGuardConfig, channels: Channels) -> Arc<Self> {
        let compile = |patterns: &[String], what: &str| {
            patterns
                .iter()
                .filter_map(|p| match Regex::new(&format!("(?i){p}")) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "invalid {what} pattern skipped");
                        None
                    }
                })
                .collect::<Vec<_>>()
        };
        let hard_slurs = compile(&cfg.hard_slurs, "hard-slur");
        let soft_words = compile(&cfg.soft_words, "soft-word");
        Arc::new(Self {
            cfg,
            channels,
            hard_slurs,
            soft_words,
            guilds: DashMap::new(),
        })
    }

    fn guild(&self, guild_id: u64) -> Arc<GuildSpamState> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| {
                Arc::new(GuildSpamState {
                    newcomer: Mutex::new(RepeatBuffer::new(self.cfg.newcomer.clone())),
                    general: Mutex::new(RepeatBuffer::new(self.cfg.general.clone())),
                })
            })
            .clone()
    }

    /// Inspect one message. The first rule that fires wins; hard rules are
    /// checked before anything that would merely flag.
    pub async fn inspect(&self, ev: &MessageEvent) -> Option<Verdict> {
        let in_bot_channel = self.channels.bot.contains(&ev.channel_id);

        if !in_bot_channel {
            let verdict = if ev.author_is_newcomer {
                self.inspect_newcomer(ev).await
            } else {
                self.inspect_established(ev).await
            };
            if verdict.is_some() {
                return verdict;
            }
        }

        self.inspect_mentions(ev)
    }

    async fn inspect_newcomer(&self, ev: &MessageEvent) -> Option<Verdict> {
        // Quoted text is somebody else's words; ignore it for the lexicons.
        let unquoted = RE_QUOTED.replace_all(&ev.content, "").to_lowercase();
        let folded = normalize_hard(&unquoted);

        if let Some(re) = self.hard_slurs.iter().find(|re| re.is_match(&folded)) {
            let hit = re.find(&folded).map(|m| m.as_str().to_string()).unwrap_or_default();
            return Some(Verdict::Ban {
                reason: format!("New user using a hard slur ({hit})"),
            });
        }

        let everyone = ev.content.matches("@everyone").count() as u32;
        if everyone > self.cfg.everyone_ban_count {
            return Some(Verdict::Ban {
                reason: "New user @everyone spam".into(),
            });
        }
        if everyone > 0 {
            return flag("New user trying to ping everyone", RoleTier::WelcomingParty);
        }

        if let Some(re) = self.soft_words.iter().find(|re| re.is_match(&unquoted)) {
            let hit = re.find(&unquoted).map(|m| m.as_str().to_string()).unwrap_or_default();
            return flag(format!("New user saying {hit}"), RoleTier::WelcomingParty);
        }

        let st = self.guild(ev.guild_id);
        let mut buf = st.newcomer.lock().await;
        if self.observe_in(&mut buf, ev) {
            return flag(
                format!(
                    "New user spamming the same message {} times in a row",
                    self.cfg.newcomer.repeat_threshold
                ),
                RoleTier::WelcomingParty,
            );
        }
        None
    }

    async fn inspect_established(&self, ev: &MessageEvent) -> Option<Verdict> {
        if ev.content.contains("@everyone") && RE_URL.is_match(&ev.content) {
            return flag("Trying to ping everyone with a link", RoleTier::Minimo);
        }

        let st = self.guild(ev.guild_id);
        let mut buf = st.general.lock().await;
        if self.observe_in(&mut buf, ev) {
            return flag(
                format!(
                    "Spamming the same message {} times in a row",
                    self.cfg.general.repeat_threshold
                ),
                RoleTier::Minimo,
            );
        }
        None
    }

    fn inspect_mentions(&self, ev: &MessageEvent) -> Option<Verdict> {
        if ev.role_mention_count > self.cfg.role_mention_limit {
            return flag("Role mention spam", RoleTier::Minimo);
        }
        if ev.user_mention_count() > self.cfg.user_mention_limit
            && ev.channel_id != self.channels.high_traffic
        {
            return flag(
                format!("User mention spam ({} people pinged)", ev.user_mention_count()),
                RoleTier::Minimo,
            );
        }
        None
    }

    fn observe_in(&self, buf: &mut RepeatBuffer, ev: &MessageEvent) -> bool {
        let content = ev.content.to_lowercase();
        let stripped_len = RE_PLATFORM_OBJ.replace_all(&ev.content, "").chars().count();
        buf.observe(
            ev.author_id,
            &content,
            stripped_len,
            ev.created_at,
            Duration::seconds(self.cfg.window_secs),
        )
    }

    /* =========================================
       History scoring for the bulk ban menu
       ========================================= */

    /// Score recent channel history for likely raid trolls. Pure scoring
    /// over already-fetched messages; the caller decides what to do with
    /// the candidates.
    pub fn scan_history(&self, messages: &[MessageEvent], now: DateTime<Utc>) -> Vec<TrollCandidate> {
        let mut scored: Vec<TrollCandidate> = Vec::new();

        for m in messages {
            if m.author_is_trusted {
                continue;
            }
            let idx = match scored.iter().position(|c| c.author_id == m.author_id) {
                Some(i) => i,
                None => {
                    let base = match m.author_joined_at {
                        Some(j) if now - j < Duration::hours(1) => 5,
                        Some(j) if now - j < Duration::hours(24) => 3,
                        Some(j) if now - j < Duration::days(7) => 1,
                        _ => 0,
                    };
                    scored.push(TrollCandidate {
                        author_id: m.author_id,
                        points: base,
                        reasons: Vec::new(),
                    });
                    scored.len() - 1
                }
            };
            let cand = &mut scored[idx];

            let clean = RE_PLATFORM_OBJ.replace_all(&m.content, "").to_string();
            let squashed = normalize_hard(&clean.to_lowercase());

            if self.hard_slurs.iter().any(|re| re.is_match(&squashed)) {
                cand.points += 100;
                cand.reasons.push("hard slur".into());
            }
            if !squashed.is_empty() && RE_SCRIPT_FLOOD.iter().any(|re| re.is_match(&squashed)) {
                cand.points += 10;
                cand.reasons.push(clean_and_truncate(&m.content));
            }
            if RE_URL.is_match(&m.content) {
                if RE_INVITE.is_match(&m.content) {
                    cand.points += 5;
                } else {
                    cand.points += 3;
                }
                cand.reasons.push(clean_and_truncate(&m.content));
            }
            if let Some(re) = self.soft_words.iter().find(|re| re.is_match(&clean.to_lowercase())) {
                cand.points += 4;
                let hit = re
                    .find(&clean.to_lowercase())
                    .map(|h| h.as_str().to_string())
                    .unwrap_or_default();
                cand.reasons.push(hit);
            }
            if !m.attachment_names.is_empty() {
                cand.points += 2;
                cand.reasons.push("file upload".into());
            }
            if !clean.trim().is_empty() && RE_SHOUT.is_match(clean.trim()) {
                cand.points += 2;
                cand.reasons.push(clean_and_truncate(&clean));
            } else if m.author_is_newcomer {
                cand.points += 1;
                cand.reasons.push(clean_and_truncate(&clean));
            }
        }

        scored.retain(|c| c.points > 5);
        scored.sort_by(|a, b| b.points.cmp(&a.points));
        scored.truncate(10);
        scored
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrollCandidate {
    pub author_id: u64,
    pub points: u32,
    pub reasons: Vec<String>,
}

/* =========================================
   Normalization helpers
   ========================================= */

/// Case-folded, NFKC-normalized, whitespace-stripped view used for slur
/// matching; defeats spacing and width tricks.
fn normalize_hard(s: &str) -> String {
    s.nfkc()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn clean_and_truncate(content: &str) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    if flat.is_empty() {
        return String::new();
    }
    let truncated: String = flat.chars().take(25).collect();
    if truncated.chars().count() < flat.chars().count() {
        format!("`{truncated}...`")
    } else {
        format!("`{truncated}`")
    }
}

/* =========================================
   Tests
   ========================================= */

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn guard() -> Arc<SpamGuard> {
        SpamGuard::new(
            SpamGuardConfig::default(),
            Channels {
                audit_log: 0,
                bot: vec![900],
                high_traffic: 901,
            },
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(author_id: u64, content: &str, secs: i64) -> MessageEvent {
        MessageEvent {
            guild_id: 1,
            channel_id: 100,
            message_id: 1,
            author_id,
            content: content.to_string(),
            created_at: at(secs),
            role_mention_count: 0,
            mentioned_user_ids: vec![],
            attachment_names: vec![],
            author_is_newcomer: false,
            author_is_trusted: false,
            author_joined_at: None,
        }
    }

    fn newcomer_msg(author_id: u64, content: &str, secs: i64) -> MessageEvent {
        let mut m = msg(author_id, content, secs);
        m.author_is_newcomer = true;
        m
    }

    #[tokio::test]
    async fn one_flag_per_threshold_crossing() {
        let g = guard();
        // Established detector: threshold 5 within 30s.
        let text = "identical spam line here";
        for i in 0..4 {
            assert_eq!(g.inspect(&msg(7, text, i)).await, None, "message {i}");
        }
        let v = g.inspect(&msg(7, text, 4)).await;
        assert!(matches!(v, Some(Verdict::Flag(_))), "fifth repeat flags");
        // The counter reset: the very next repeat does not flag again.
        assert_eq!(g.inspect(&msg(7, text, 5)).await, None);
    }

    #[tokio::test]
    async fn repeats_outside_the_window_do_not_flag() {
        let g = guard();
        let text = "identical spam line here";
        for i in 0..4 {
            assert_eq!(g.inspect(&msg(7, text, i)).await, None);
        }
        // Gap of 40s since the previous bump: crossing is ignored.
        assert_eq!(g.inspect(&msg(7, text, 44)).await, None);
    }

    #[tokio::test]
    async fn different_content_replaces_the_entry() {
        let g = guard();
        for i in 0..4 {
            assert_eq!(g.inspect(&msg(7, "first long spam content", i)).await, None);
        }
        // Entry replaced wholesale; the old count is gone.
        assert_eq!(g.inspect(&msg(7, "other long spam content", 4)).await, None);
        for i in 5..8 {
            assert_eq!(g.inspect(&msg(7, "other long spam content", i)).await, None);
        }
        let v = g.inspect(&msg(7, "other long spam content", 8)).await;
        assert!(matches!(v, Some(Verdict::Flag(_))));
    }

    #[tokio::test]
    async fn self_concatenation_counts_as_a_repeat() {
        let g = guard();
        let text = "buy cheap nitro now";
        assert_eq!(g.inspect(&msg(7, text, 0)).await, None);
        let doubled = format!("{text}{text}");
        for i in 1..4 {
            assert_eq!(g.inspect(&msg(7, &doubled, i)).await, None);
        }
        let v = g.inspect(&msg(7, &doubled, 4)).await;
        assert!(matches!(v, Some(Verdict::Flag(_))));
    }

    #[tokio::test]
    async fn newcomer_threshold_is_three() {
        let g = guard();
        let text = "spam line";
        assert_eq!(g.inspect(&newcomer_msg(7, text, 0)).await, None);
        assert_eq!(g.inspect(&newcomer_msg(7, text, 1)).await, None);
        let v = g.inspect(&newcomer_msg(7, text, 2)).await;
        assert!(matches!(
            v,
            Some(Verdict::Flag(Flag {
                tier: RoleTier::WelcomingParty,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn short_content_never_enters_history() {
        let g = guard();
        for i in 0..10 {
            assert_eq!(g.inspect(&newcomer_msg(7, "hi", i)).await, None);
        }
    }

    #[tokio::test]
    async fn eviction_is_fifo_at_capacity() {
        let g = guard();
        // Fill the newcomer buffer (capacity 20) with 20 other authors.
        for a in 100..120u64 {
            let _ = g.inspect(&newcomer_msg(a, "some qualifying message", 0)).await;
        }
        // Author 100 is the oldest entry; a new author evicts it.
        let _ = g.inspect(&newcomer_msg(200, "another qualifying msg", 1)).await;
        // Author 100 starts from scratch: two repeats do not flag.
        assert_eq!(
            g.inspect(&newcomer_msg(100, "some qualifying message", 2)).await,
            None
        );
        assert_eq!(
            g.inspect(&newcomer_msg(100, "some qualifying message", 3)).await,
            None
        );
    }

    #[tokio::test]
    async fn newcomer_hard_slur_bans_without_confirmation() {
        let g = guard();
        let v = g.inspect(&newcomer_msg(7, "you are a n i g g e r", 0)).await;
        assert!(matches!(v, Some(Verdict::Ban { .. })), "got {v:?}");
    }

    #[tokio::test]
    async fn quoted_slurs_are_ignored_for_newcomers() {
        let g = guard();
        let v = g
            .inspect(&newcomer_msg(7, r#"he said "chink" and got banned"#, 0))
            .await;
        assert!(!matches!(v, Some(Verdict::Ban { .. })));
    }

    #[tokio::test]
    async fn repeated_everyone_ping_bans_a_newcomer() {
        let g = guard();
        let v = g
            .inspect(&newcomer_msg(
                7,
                "@everyone @everyone @everyone @everyone",
                0,
            ))
            .await;
        assert_eq!(
            v,
            Some(Verdict::Ban {
                reason: "New user @everyone spam".into()
            })
        );
    }

    #[tokio::test]
    async fn single_everyone_ping_from_newcomer_flags() {
        let g = guard();
        let v = g.inspect(&newcomer_msg(7, "hello @everyone", 0)).await;
        assert!(matches!(
            v,
            Some(Verdict::Flag(Flag {
                tier: RoleTier::WelcomingParty,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn established_everyone_with_link_flags_for_minimo() {
        let g = guard();
        let v = g
            .inspect(&msg(7, "@everyone check https://evil.example/x", 0))
            .await;
        assert!(matches!(
            v,
            Some(Verdict::Flag(Flag {
                tier: RoleTier::Minimo,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn mass_role_mentions_flag() {
        let g = guard();
        let mut m = msg(7, "join my club everyone", 0);
        m.role_mention_count = 4;
        let v = g.inspect(&m).await;
        assert_eq!(
            v,
            Some(Verdict::Flag(Flag {
                reason: "Role mention spam".into(),
                tier: RoleTier::Minimo,
            }))
        );
    }

    #[tokio::test]
    async fn mass_user_mentions_flag_except_in_high_traffic_channel() {
        let g = guard();
        let mut m = msg(7, "hey", 0);
        m.mentioned_user_ids = (1..=11).collect();
        assert!(matches!(g.inspect(&m).await, Some(Verdict::Flag(_))));

        let mut m = msg(7, "hey", 1);
        m.mentioned_user_ids = (1..=11).collect();
        m.channel_id = 901;
        assert_eq!(g.inspect(&m).await, None);
    }

    #[tokio::test]
    async fn bot_channels_skip_content_rules_but_not_mentions() {
        let g = guard();
        let mut m = newcomer_msg(7, "hello @everyone", 0);
        m.channel_id = 900;
        assert_eq!(g.inspect(&m).await, None);

        let mut m = msg(7, "hey", 1);
        m.channel_id = 900;
        m.role_mention_count = 4;
        assert!(matches!(g.inspect(&m).await, Some(Verdict::Flag(_))));
    }

    #[test]
    fn history_scan_scores_fresh_joiners_with_signals() {
        let g = guard();
        let now = at(0);
        let mut troll = msg(50, "free nitro https://grab.example/now", 0);
        troll.author_is_newcomer = true;
        troll.author_joined_at = Some(now - Duration::minutes(10));
        let mut innocent = msg(51, "welcome to the server, enjoy", 0);
        innocent.author_joined_at = Some(now - Duration::days(300));
        let mut staff = msg(52, "https://obvious.example/spam", 0);
        staff.author_is_trusted = true;

        let out = g.scan_history(&[troll, innocent, staff], now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].author_id, 50);
        assert!(out[0].points > 5);
    }

    #[test]
    fn history_scan_caps_at_ten_candidates() {
        let g = guard();
        let now = at(0);
        let messages: Vec<_> = (0..15u64)
            .map(|i| {
                let mut m = msg(1000 + i, "https://spam.example/payload", 0);
                m.author_is_newcomer = true;
                m.author_joined_at = Some(now - Duration::minutes(5));
                m
            })
            .collect();
        let out = g.scan_history(&messages, now);
        assert_eq!(out.len(), 10);
    }
}
