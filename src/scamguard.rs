//! src/scamguard.rs
//! ScamGuard – classifies links against allow/deny lists and ordered
//! heuristics.
//!
//! Runs only on messages containing a URL. The rules are deliberately
//! ordered, not scored: a narrow high-confidence rule is never shadowed by
//! a broad catch-all. The classifier is pure; the caller executes the
//! resulting signal.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::ScamGuardConfig;

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
static RE_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://([^/\s]+)").unwrap());
// Zero-width and BOM characters scammers use to split keywords.
static RE_ZERO_WIDTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{200B}-\u{200F}\u{FEFF}]").unwrap());
// The platform's own domains, including the official shapes a look-alike
// imitates. Matching here means the link itself is legitimate.
static RE_SELF_DOMAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*\.)?discord(app|status)?\.(com|gg|gifts?|media|net)$").unwrap());
// Misspelled brand shapes: nltro, dlscord, discqrd and friends.
static RE_BRAND_LOOKALIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(n[1l]tro|d[l1]sc[oq0]r(d|cl|l)|d[il1]sc[q0]r(d|cl|l))").unwrap());
static RE_BAIT_NITRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(n[i1l]tro|airdrop)").unwrap());
static RE_BAIT_CSGO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(cs:? ?go|steam)").unwrap());
static RE_LURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(free|gift|offer|give|giving|hack|promotion|take it|is first)").unwrap()
});
static RE_GREETING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(hi|hey|hello|bro)\b").unwrap());
static RE_GIFT_TLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^gifts?$").unwrap());

/* =========================================
   Signal types
   ========================================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTier {
    AutoBan,
    EscalateToMute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScamReason {
    KnownScamDomain,
    FakePlatformLink,
    RussianLinkScam,
    NitroScam,
    CsgoScam,
    SuspiciousFile(String),
    EveryonePingWithInvite,
    EveryonePingWithLink,
}

impl ScamReason {
    pub fn describe(&self) -> String {
        match self {
            ScamReason::KnownScamDomain => "Known Scam Link".into(),
            ScamReason::FakePlatformLink => "Fake Discord Link Scam".into(),
            ScamReason::RussianLinkScam => "Russian Link Scam".into(),
            ScamReason::NitroScam => "Nitro Scam".into(),
            ScamReason::CsgoScam => "CS:GO Scam".into(),
            ScamReason::SuspiciousFile(name) => format!("Suspicious file: {name}"),
            ScamReason::EveryonePingWithInvite => "Everyone ping + invite".into(),
            ScamReason::EveryonePingWithLink => "Everyone ping with a link".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScamSignal {
    pub domain: String,
    pub reason: ScamReason,
    pub tier: SignalTier,
}

/* =========================================
   Classifier
   ========================================= */

pub struct ScamGuard {
    cfg: ScamGuardConfig,
}

impl ScamGuard {
    pub fn new(cfg: ScamGuardConfig) -> Self {
        Self { cfg }
    }

    /// Classify a message that contains at least one URL. `None` means the
    /// link is clean.
    pub fn classify(&self, raw_content: &str) -> Option<ScamSignal> {
        let content = RE_ZERO_WIDTH.replace_all(raw_content, "").to_lowercase();
        let url = RE_URL.find(&content)?.as_str().to_string();
        let host = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .or_else(|| {
                RE_HOST
                    .captures(&content)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())
            })?;

        // Registrable domain: last two DNS labels.
        let labels: Vec<&str> = host.split('.').collect();
        let domain = if labels.len() >= 2 {
            labels[labels.len() - 2..].join(".")
        } else {
            host.to_string()
        };
        let tld = labels.last().copied().unwrap_or_default();
        let has_everyone = content.contains("@everyone");

        // Allow-list short-circuit.
        if RE_SELF_DOMAIN.is_match(&domain) || self.cfg.allow_domains.iter().any(|d| d == &domain)
        {
            if domain == "discord.gg" && has_everyone {
                return Some(ScamSignal {
                    domain,
                    reason: ScamReason::EveryonePingWithInvite,
                    tier: SignalTier::EscalateToMute,
                });
            }
            return None;
        }

        // Deny-list short-circuit.
        if self.cfg.deny_domains.iter().any(|d| d == &domain) {
            return Some(ScamSignal {
                domain,
                reason: ScamReason::KnownScamDomain,
                tier: SignalTier::AutoBan,
            });
        }

        // Ordered heuristics, first match wins.
        let lure = RE_LURE.is_match(&content);
        let lead_in = has_everyone || RE_GREETING.is_match(&content) || RE_GIFT_TLD.is_match(tld);
        let bait_nitro = RE_BAIT_NITRO.is_match(&content);
        let bait_csgo = RE_BAIT_CSGO.is_match(&content);
        let russian = tld == "ru" || domain.ends_with("ru.com");

        if RE_BRAND_LOOKALIKE.is_match(&url) && lure {
            return Some(ScamSignal {
                domain,
                reason: ScamReason::FakePlatformLink,
                tier: SignalTier::AutoBan,
            });
        }
        if russian && (bait_nitro || bait_csgo) && (lure || lead_in) {
            return Some(ScamSignal {
                domain,
                reason: ScamReason::RussianLinkScam,
                tier: SignalTier::AutoBan,
            });
        }
        if (bait_nitro || bait_csgo) && (lure || lead_in) {
            let reason = if bait_nitro {
                ScamReason::NitroScam
            } else {
                ScamReason::CsgoScam
            };
            return Some(ScamSignal {
                domain,
                reason,
                tier: SignalTier::AutoBan,
            });
        }
        if let Some(suffix) = self
            .cfg
            .banned_suffixes
            .iter()
            .find(|s| url.ends_with(s.as_str()))
        {
            let file = url
                .rsplit('/')
                .next()
                .unwrap_or(suffix.as_str())
                .to_string();
            return Some(ScamSignal {
                domain,
                reason: ScamReason::SuspiciousFile(file),
                tier: SignalTier::AutoBan,
            });
        }
        if has_everyone {
            return Some(ScamSignal {
                domain,
                reason: ScamReason::EveryonePingWithLink,
                tier: SignalTier::EscalateToMute,
            });
        }
        None
    }
}

/// Cheap pre-filter so callers only invoke the classifier on link messages.
pub fn contains_url(content: &str) -> bool {
    RE_URL.is_match(content)
}

/* =========================================
   Tests
   ========================================= */
