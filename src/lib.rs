// src/lib.rs

pub mod config;
pub mod discord;
pub mod enforcer;
pub mod joinguard;
pub mod logging;
pub mod permissions;
pub mod platform;
pub mod scamguard;
pub mod spamguard;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;

use config::Settings;
use enforcer::Enforcer;
use joinguard::JoinGuard;
use platform::Platform;
use scamguard::ScamGuard;
use spamguard::SpamGuard;

use serenity::all::GatewayIntents;

/// Global application context: configuration plus the four safety engines.
pub struct AppContext {
    pub settings: Settings,
    joinguard: OnceCell<Arc<JoinGuard>>,
    spamguard: OnceCell<Arc<SpamGuard>>,
    scamguard: OnceCell<Arc<ScamGuard>>,
    enforcer: OnceCell<Arc<Enforcer>>,
}

impl AppContext {
    /// Bootstrap the whole application:
    /// - logging
    /// - a REST-backed platform boundary
    /// - the engines, injected into their OnceCells
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let ctx = Arc::new(Self {
            settings,
            joinguard: OnceCell::new(),
            spamguard: OnceCell::new(),
            scamguard: OnceCell::new(),
            enforcer: OnceCell::new(),
        });

        let platform: Arc<dyn Platform> = Arc::new(discord::SerenityPlatform::from_token(
            &ctx.settings.discord.token,
            ctx.settings.channels.audit_log,
            ctx.settings.roles.clone(),
        ));
        ctx.init_engines(platform);

        Ok(ctx)
    }

    /// Wire the engines to a platform implementation. Split out of
    /// [`AppContext::bootstrap`] so tests can inject an in-memory platform.
    pub fn init_engines(&self, platform: Arc<dyn Platform>) {
        let _ = self.joinguard.set(JoinGuard::new(
            platform.clone(),
            self.settings.joinguard.clone(),
            self.settings.roles.visitor,
        ));
        let _ = self.spamguard.set(SpamGuard::new(
            self.settings.spamguard.clone(),
            self.settings.channels.clone(),
        ));
        let _ = self
            .scamguard
            .set(Arc::new(ScamGuard::new(self.settings.scamguard.clone())));
        let _ = self.enforcer.set(Enforcer::new(
            platform,
            self.settings.enforcer.clone(),
            self.settings.roles.clone(),
        ));
    }

    pub fn joinguard(&self) -> Arc<JoinGuard> {
        self.joinguard
            .get()
            .expect("JoinGuard not initialized")
            .clone()
    }

    pub fn spamguard(&self) -> Arc<SpamGuard> {
        self.spamguard
            .get()
            .expect("SpamGuard not initialized")
            .clone()
    }

    pub fn scamguard(&self) -> Arc<ScamGuard> {
        self.scamguard
            .get()
            .expect("ScamGuard not initialized")
            .clone()
    }

    pub fn enforcer(&self) -> Arc<Enforcer> {
        self.enforcer
            .get()
            .expect("Enforcer not initialized")
            .clone()
    }
}

/// Ready-made intent set for the Discord client:
/// - GUILDS, GUILD_MESSAGES, MESSAGE_CONTENT (content filtering),
/// - GUILD_MEMBERS (joins, role checks), GUILD_INVITES (invite tracking),
/// - GUILD_MESSAGE_REACTIONS (reaction gestures), GUILD_VOICE_STATES
///   (stage-visitor detection).
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::GUILD_INVITES
        | GatewayIntents::GUILD_VOICE_STATES
}

/// Start the Discord client (gateway + event handlers).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
