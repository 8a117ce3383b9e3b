use anyhow::Result;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub env: String,
    pub app: App,
    pub discord: Discord,
    pub logging: Logging,
    pub roles: Roles,
    pub channels: Channels,
    pub joinguard: JoinGuardConfig,
    pub spamguard: SpamGuardConfig,
    pub scamguard: ScamGuardConfig,
    pub enforcer: EnforcerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct App {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Discord {
    pub token: String,
    pub app_id: Option<String>,
    pub intents: Vec<String>,
    /// When set, events from other guilds are ignored.
    pub home_guild: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    pub json: Option<bool>,
    pub level: Option<String>,
}

/// Role-tier id lists, injected read-only by the settings collaborator.
/// The tiers nest: moderator ⊂ minimo ⊂ welcoming-party, i.e. a prompt
/// gated on `welcoming_party` accepts the widest set of confirmers.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Roles {
    #[serde(default)]
    pub moderator: Vec<u64>,
    #[serde(default)]
    pub minimo: Vec<u64>,
    #[serde(default)]
    pub welcoming_party: Vec<u64>,
    /// Language roles; members without one are treated as newcomers.
    #[serde(default)]
    pub language: Vec<u64>,
    /// Role pinged to summon staff; a mention of it opens the ban menu.
    #[serde(default)]
    pub active_staff: u64,
    #[serde(default)]
    pub mute: u64,
    /// Granted to voice/stage arrivals classified as visitors.
    #[serde(default)]
    pub visitor: u64,
    #[serde(default)]
    pub trusted: Vec<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Channels {
    /// Moderation audit log. 0 disables channel output (tracing remains).
    #[serde(default)]
    pub audit_log: u64,
    /// Bot-command channels skipped by the message detectors.
    #[serde(default)]
    pub bot: Vec<u64>,
    /// High-traffic channel excluded from the user-mention spam rule.
    #[serde(default)]
    pub high_traffic: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinGuardConfig {
    /// Capacity of the recent-join log kept for moderator inspection.
    pub recent_log_cap: usize,
}

impl Default for JoinGuardConfig {
    fn default() -> Self {
        Self { recent_log_cap: 20 }
    }
}

/// Thresholds for one sliding-window repeat detector.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DetectorParams {
    pub capacity: usize,
    pub repeat_threshold: u32,
    pub min_content_len: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpamGuardConfig {
    pub newcomer: DetectorParams,
    pub general: DetectorParams,
    /// Rolling window for "in a row", seconds.
    pub window_secs: i64,
    pub role_mention_limit: u32,
    pub user_mention_limit: u32,
    /// Hard-slur patterns; a normalized match bans a newcomer outright.
    pub hard_slurs: Vec<String>,
    /// Softer lexicon; a match flags a newcomer for confirmation.
    pub soft_words: Vec<String>,
    /// `@everyone` occurrences beyond this ban a newcomer outright.
    pub everyone_ban_count: u32,
}

impl Default for SpamGuardConfig {
    fn default() -> Self {
        Self {
            newcomer: DetectorParams {
                capacity: 20,
                repeat_threshold: 3,
                min_content_len: 7,
            },
            general: DetectorParams {
                capacity: 30,
                repeat_threshold: 5,
                min_content_len: 12,
            },
            window_secs: 30,
            role_mention_limit: 3,
            user_mention_limit: 10,
            hard_slurs: vec![
                r"n[i1]gg[ae3]r?s?".into(),
                r"ching\s?ch[oa]ng".into(),
                r"ニガー".into(),
            ],
            soft_words: vec![
                r"\bfag(got)?s?\b".into(),
                r"\bchinks?\b".into(),
                r"nanking".into(),
                r"niggas?".into(),
                r"セックス".into(),
                r"ちんちん".into(),
                r"死ね".into(),
            ],
            everyone_ban_count: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScamGuardConfig {
    /// Known legitimate domains; registrable-domain exact match.
    pub allow_domains: Vec<String>,
    /// Maintained known-scam domains; exact match bans.
    pub deny_domains: Vec<String>,
    /// File suffixes treated as a malicious payload link.
    pub banned_suffixes: Vec<String>,
}

impl Default for ScamGuardConfig {
    fn default() -> Self {
        Self {
            allow_domains: vec![
                "discord.me".into(),
                "steamcommunity.com".into(),
                "steampowered.com".into(),
                "dis.gd".into(),
                "youtube.com".into(),
                "youtu.be".into(),
                "discordmerch.com".into(),
                "github.com".into(),
                "google.com".into(),
                "co.jp".into(),
            ],
            deny_domains: vec![
                "discordgift.ru.com".into(),
                "discord-airdrop.com".into(),
                "discord-nltro.com".into(),
                "cs-skins.lin".into(),
                "discorb.ru".into(),
                "steamcomminuty.com".into(),
                "steamcomminytu.ru".into(),
                "steancomunnity.ru".into(),
                "steamcommunitlu.com".into(),
                "discorclapp.com".into(),
                "discord-me.com".into(),
                "discqrde.com".into(),
                "disczrd.com".into(),
                "dlscrod-app.com".into(),
            ],
            banned_suffixes: vec![".exe".into(), ".rar".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcerConfig {
    /// Confirmation prompt lifetime, seconds.
    pub timeout_secs: u64,
    /// Message-history purge window passed to ban calls, days.
    pub purge_days: u8,
    /// Cap on independent targets in one bulk prompt.
    pub max_bulk_targets: usize,
    /// Name of the custom emoji accepted as a ban gesture on prompts.
    pub ban_emoji: String,
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            purge_days: 1,
            max_bulk_targets: 10,
            ban_emoji: "ban".into(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Which environment?
        let env = std::env::var("AEGIS_ENV").unwrap_or_else(|_| "development".to_string());

        // Load .env.<env> and .env when present
        let _ = dotenvy::from_filename(format!(".env.{}", env));
        let _ = dotenvy::dotenv();

        #[derive(Deserialize, Serialize)]
        struct Defaults {
            env: String,
            app: App,
            discord: Discord,
            logging: Logging,
            roles: Roles,
            channels: Channels,
            joinguard: JoinGuardConfig,
            spamguard: SpamGuardConfig,
            scamguard: ScamGuardConfig,
            enforcer: EnforcerConfig,
        }

        let defaults = Defaults {
            env: env.clone(),
            app: App {
                name: "Aegis Security".into(),
            },
            discord: Discord {
                token: "".into(),
                app_id: None,
                intents: vec![
                    "GUILDS".into(),
                    "GUILD_MEMBERS".into(),
                    "GUILD_MESSAGES".into(),
                    "MESSAGE_CONTENT".into(),
                    "GUILD_MESSAGE_REACTIONS".into(),
                    "GUILD_INVITES".into(),
                    "GUILD_VOICE_STATES".into(),
                ],
                home_guild: None,
            },
            logging: Logging {
                json: Some(false),
                level: Some("info".into()),
            },
            roles: Roles::default(),
            channels: Channels::default(),
            joinguard: JoinGuardConfig::default(),
            spamguard: SpamGuardConfig::default(),
            scamguard: ScamGuardConfig::default(),
            enforcer: EnforcerConfig::default(),
        };

        // Layers: defaults -> TOML file -> AEGIS_* env vars
        let figment = Figment::from(Serialized::defaults(defaults))
            .merge(Toml::file(format!("config/{}.toml", env)))
            // AEGIS_DISCORD_TOKEN => discord.token etc.
            .merge(Env::prefixed("AEGIS_").split("_"));

        let mut s: Settings = figment.extract()?;
        s.env = env;
        Ok(s)
    }
}
