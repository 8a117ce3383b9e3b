// src/discord/mod.rs
//
// Gateway glue: distills serenity events into the narrow carriers the
// engines consume, renders enforcement prompts, and implements the
// Platform trait on top of the REST client. No policy lives here.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use serenity::all::*;
use serenity::async_trait;
use serenity::http::Http;

use crate::config::Roles;
use crate::enforcer::{Actor, ConfirmResult, EnforcementRequest, Gesture};
use crate::permissions::RoleTier;
use crate::platform::{InviteRecord, JoinEvent, MessageEvent, Platform, PlatformError};
use crate::scamguard::{self, SignalTier};
use crate::spamguard::Verdict;
use crate::{AppContext, default_gateway_intents};

/* ============================================================
   Event handler
   ============================================================ */

pub struct Handler {
    pub app: Arc<AppContext>,
}

impl Handler {
    fn in_scope(&self, guild_id: GuildId) -> bool {
        match self.app.settings.discord.home_guild {
            Some(home) => guild_id.get() == home,
            None => true,
        }
    }

    fn member_roles(roles: &[RoleId]) -> Vec<u64> {
        roles.iter().map(|r| r.get()).collect()
    }

    fn is_staff(&self, roles: &[u64]) -> bool {
        let r = &self.app.settings.roles;
        roles
            .iter()
            .any(|id| r.moderator.contains(id) || r.minimo.contains(id) || r.welcoming_party.contains(id))
    }

    fn to_message_event(&self, msg: &Message, guild_id: GuildId) -> MessageEvent {
        let roles = msg
            .member
            .as_deref()
            .map(|m| Self::member_roles(&m.roles))
            .unwrap_or_default();
        let joined_at = msg
            .member
            .as_deref()
            .and_then(|m| m.joined_at)
            .map(ts_to_utc);
        let cfg = &self.app.settings.roles;
        let has_language_role = roles.iter().any(|id| cfg.language.contains(id));
        let joined_today = joined_at
            .map(|j| Utc::now() - j < chrono::Duration::days(1))
            .unwrap_or(true);
        MessageEvent {
            guild_id: guild_id.get(),
            channel_id: msg.channel_id.get(),
            message_id: msg.id.get(),
            author_id: msg.author.id.get(),
            content: msg.content.clone(),
            created_at: ts_to_utc(msg.timestamp),
            role_mention_count: msg.mention_roles.len() as u32,
            mentioned_user_ids: msg.mentions.iter().map(|u| u.id.get()).collect(),
            attachment_names: msg.attachments.iter().map(|a| a.filename.clone()).collect(),
            author_is_newcomer: !has_language_role || joined_today,
            author_is_trusted: self.is_staff(&roles)
                || roles.iter().any(|id| cfg.trusted.contains(id)),
            author_joined_at: joined_at,
        }
    }

    async fn execute_hard_ban(&self, ctx: &Context, ev: &MessageEvent, reason: &str) {
        let enforcer_cfg = &self.app.settings.enforcer;
        let platform = SerenityPlatform::new(
            ctx.http.clone(),
            self.app.settings.channels.audit_log,
            self.app.settings.roles.clone(),
        );
        match platform
            .ban(
                ev.guild_id,
                ev.author_id,
                enforcer_cfg.purge_days,
                &format!("Auto-banned: {reason}"),
            )
            .await
        {
            Ok(()) => {
                let _ = ChannelId::new(ev.channel_id)
                    .say(
                        &ctx.http,
                        format!(
                            "<@{}> has been banned automatically for: {reason}",
                            ev.author_id
                        ),
                    )
                    .await;
                platform
                    .post_audit_line(
                        ev.guild_id,
                        &format!("Auto-banned {}: {reason}", ev.author_id),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(uid = ev.author_id, error = ?e, "hard auto-ban failed");
            }
        }
    }

    /// Mute the targets and post a confirmation prompt racing moderators
    /// against the timeout.
    async fn open_flag_prompt(
        &self,
        ctx: &Context,
        guild_id: u64,
        channel_id: u64,
        targets: Vec<u64>,
        description: String,
        reason: String,
        tier: RoleTier,
        mute_first: bool,
        delete_on_dismiss: bool,
    ) {
        let cfg = &self.app.settings;
        if mute_first && cfg.roles.mute != 0 {
            for target in &targets {
                let _ = ctx
                    .http
                    .add_member_role(
                        GuildId::new(guild_id),
                        UserId::new(*target),
                        RoleId::new(cfg.roles.mute),
                        Some(&reason),
                    )
                    .await;
            }
        }

        let enforcer = self.app.enforcer();
        let id = enforcer.create(EnforcementRequest {
            guild_id,
            channel_id,
            targets: targets.clone(),
            reason,
            tier,
            unmute_on_dismiss: mute_first,
            delete_on_dismiss,
            ttl: enforcer.default_ttl(),
        });

        let footer = match tier {
            RoleTier::Moderator => "Mods can ban or dismiss this message",
            RoleTier::Minimo => "Minimos can ban or dismiss this message",
            RoleTier::WelcomingParty => "WPs can ban or dismiss this message and unmute them",
        };
        let embed = CreateEmbed::new()
            .colour(Colour::new(0xFF0000))
            .description(description)
            .footer(CreateEmbedFooter::new(footer));

        let mut rows = Vec::new();
        if targets.len() > 1 {
            for (chunk_idx, chunk) in targets.chunks(5).enumerate() {
                let buttons = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, target)| {
                        CreateButton::new(format!("enf:{id}:tgt:{target}"))
                            .label(format!("{}", chunk_idx * 5 + i + 1))
                            .style(ButtonStyle::Danger)
                    })
                    .collect();
                rows.push(CreateActionRow::Buttons(buttons));
            }
        }
        rows.push(CreateActionRow::Buttons(vec![
            CreateButton::new(format!("enf:{id}:ban"))
                .label(if targets.len() > 1 { "BAN ALL" } else { "BAN" })
                .style(ButtonStyle::Danger),
            CreateButton::new(format!("enf:{id}:dismiss"))
                .label("Dismiss")
                .style(ButtonStyle::Secondary),
        ]));

        let mut message = CreateMessage::new().embed(embed).components(rows);
        if cfg.roles.active_staff != 0 {
            message = message.content(format!("<@&{}>", cfg.roles.active_staff));
        }

        match ChannelId::new(channel_id).send_message(&ctx.http, message).await {
            Ok(sent) => enforcer.arm(id, channel_id, sent.id.get()),
            Err(e) => {
                tracing::warn!(error = ?e, "prompt post failed; dropping flag");
                enforcer.abort(id);
            }
        }
    }

    /// Staff ping: score the recent channel history and open the bulk ban
    /// menu over the likely trolls.
    async fn open_raid_menu(&self, ctx: &Context, ev: &MessageEvent) {
        let platform = SerenityPlatform::new(
            ctx.http.clone(),
            self.app.settings.channels.audit_log,
            self.app.settings.roles.clone(),
        );
        let history = match platform
            .fetch_recent_history(ev.guild_id, ev.channel_id, 50)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = ?e, "history fetch failed; skipping ban menu");
                return;
            }
        };
        let candidates = self.app.spamguard().scan_history(&history, Utc::now());
        if candidates.is_empty() {
            return;
        }

        let description = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "{}: <@{}> — {}",
                    i + 1,
                    c.author_id,
                    c.reasons.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let targets: Vec<u64> = candidates.iter().map(|c| c.author_id).collect();
        self.open_flag_prompt(
            ctx,
            ev.guild_id,
            ev.channel_id,
            targets,
            description,
            "Active Staff ping auto detection".into(),
            RoleTier::Minimo,
            false,
            true,
        )
        .await;
    }

    async fn respond_ephemeral(&self, ctx: &Context, comp: &ComponentInteraction, text: &str) {
        let _ = comp
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Message(
                    CreateInteractionResponseMessage::new()
                        .content(text)
                        .ephemeral(true),
                ),
            )
            .await;
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        if !self.in_scope(guild.id) {
            return;
        }
        let gid = guild.id.get();
        self.app.joinguard().warmup(gid).await;
        tracing::info!(guild = %guild.name, gid, "invite baseline warmed");
    }

    async fn invite_create(&self, _ctx: Context, data: InviteCreateEvent) {
        let Some(gid) = data.guild_id else { return };
        if !self.in_scope(gid) {
            return;
        }
        self.app
            .joinguard()
            .record_invite_created(
                gid.get(),
                InviteRecord {
                    code: data.code.clone(),
                    uses: 0,
                    max_uses: data.max_uses as u64,
                    max_age_secs: data.max_age as u64,
                    created_at: Utc::now(),
                    inviter_id: data.inviter.as_ref().map(|u| u.id.get()),
                },
            )
            .await;
    }

    async fn guild_member_addition(&self, ctx: Context, member: Member) {
        if !self.in_scope(member.guild_id) || member.user.bot {
            return;
        }
        let gid = member.guild_id;
        let arrived_via_voice = ctx
            .cache
            .guild(gid)
            .map(|g| g.voice_states.contains_key(&member.user.id))
            .unwrap_or(false);
        let ev = JoinEvent {
            guild_id: gid.get(),
            member_id: member.user.id.get(),
            joined_at: member.joined_at.map(ts_to_utc).unwrap_or_else(Utc::now),
            arrived_via_voice,
        };
        self.app.joinguard().handle_join(&ev).await;
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(gid) = msg.guild_id else {
            return;
        };
        if !self.in_scope(gid) || msg.author.bot {
            return;
        }

        let ev = self.to_message_event(&msg, gid);
        let roles = msg
            .member
            .as_deref()
            .map(|m| Self::member_roles(&m.roles))
            .unwrap_or_default();
        let staff = self.is_staff(&roles);

        if !staff && scamguard::contains_url(&ev.content) {
            if let Some(signal) = self.app.scamguard().classify(&ev.content) {
                match signal.tier {
                    SignalTier::AutoBan => {
                        let reason =
                            format!("{}. Domain: {}", signal.reason.describe(), signal.domain);
                        self.execute_hard_ban(&ctx, &ev, &reason).await;
                        return;
                    }
                    SignalTier::EscalateToMute => {
                        let description = format!(
                            "<@{}> has been **muted automatically** due to potential scam.\nSuspicious link domain: **{}**",
                            ev.author_id, signal.domain
                        );
                        self.open_flag_prompt(
                            &ctx,
                            ev.guild_id,
                            ev.channel_id,
                            vec![ev.author_id],
                            description,
                            format!("Possible scam: {}", signal.reason.describe()),
                            RoleTier::WelcomingParty,
                            true,
                            false,
                        )
                        .await;
                        return;
                    }
                }
            }
        }

        if !staff {
            if let Some(verdict) = self.app.spamguard().inspect(&ev).await {
                match verdict {
                    Verdict::Ban { reason } => {
                        self.execute_hard_ban(&ctx, &ev, &reason).await;
                    }
                    Verdict::Flag(flag) => {
                        let excerpt: String = ev.content.chars().take(100).collect();
                        let description = format!(
                            "<@{}> has been **muted automatically**: {}\n> {}",
                            ev.author_id, flag.reason, excerpt
                        );
                        self.open_flag_prompt(
                            &ctx,
                            ev.guild_id,
                            ev.channel_id,
                            vec![ev.author_id],
                            description,
                            flag.reason,
                            flag.tier,
                            true,
                            false,
                        )
                        .await;
                    }
                }
                return;
            }
        }

        // A ping of the active-staff role from an established member opens
        // the bulk ban menu over recent channel history.
        let active_staff = self.app.settings.roles.active_staff;
        if active_staff != 0
            && !ev.author_is_newcomer
            && msg.mention_roles.iter().any(|r| r.get() == active_staff)
        {
            self.open_raid_menu(&ctx, &ev).await;
        }
    }

    /// Confirmation gestures: prompt buttons.
    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Some(comp) = interaction.message_component() else {
            return;
        };
        let cid = comp.data.custom_id.clone();
        if !cid.starts_with("enf:") {
            return;
        }
        let parts: Vec<&str> = cid.split(':').collect();
        if parts.len() < 3 {
            return;
        }
        let Ok(prompt_id) = parts[1].parse::<u64>() else {
            return;
        };
        let gesture = match (parts[2], parts.get(3)) {
            ("ban", _) => Gesture::Ban,
            ("dismiss", _) => Gesture::Dismiss,
            ("tgt", Some(target)) => match target.parse::<u64>() {
                Ok(t) => Gesture::BanTarget(t),
                Err(_) => return,
            },
            _ => return,
        };

        // Tier re-validation happens against the roles the member holds at
        // this very moment, taken from the interaction payload.
        let Some(member) = comp.member.as_ref() else {
            return;
        };
        let actor = Actor {
            user_id: comp.user.id.get(),
            roles: Self::member_roles(&member.roles),
            is_admin: member
                .permissions
                .map(|p| p.administrator())
                .unwrap_or(false),
        };

        match self.app.enforcer().confirm(prompt_id, &actor, gesture).await {
            ConfirmResult::NotAuthorized => {
                self.respond_ephemeral(&ctx, &comp, "You do not have permission").await;
            }
            ConfirmResult::AlreadyResolved => {
                self.respond_ephemeral(&ctx, &comp, "⚠️ Already handled by someone else.")
                    .await;
            }
            ConfirmResult::TargetBanned(target) => {
                self.respond_ephemeral(&ctx, &comp, &format!("✅ Banned <@{target}>.")).await;
            }
            ConfirmResult::Resolved(_) => {
                let _ = comp
                    .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
                    .await;
            }
        }
    }

    /// Confirmation gestures: the ban emoji on a live prompt.
    async fn reaction_add(&self, ctx: Context, reaction: Reaction) {
        let Some(gid) = reaction.guild_id else { return };
        if !self.in_scope(gid) {
            return;
        }
        let ban_emoji = &self.app.settings.enforcer.ban_emoji;
        let is_ban = matches!(
            &reaction.emoji,
            ReactionType::Custom { name: Some(name), .. } if name == ban_emoji
        );
        if !is_ban {
            return;
        }
        let enforcer = self.app.enforcer();
        let Some(prompt_id) =
            enforcer.prompt_for_message(reaction.channel_id.get(), reaction.message_id.get())
        else {
            return;
        };
        let Some(user_id) = reaction.user_id else { return };

        // Fresh member fetch: the tier check must see the roles held now.
        let Ok(member) = gid.member(&ctx.http, user_id).await else {
            return;
        };
        #[allow(deprecated)]
        let is_admin = member
            .permissions(&ctx.cache)
            .map(|p| p.administrator())
            .unwrap_or(false);
        let actor = Actor {
            user_id: user_id.get(),
            roles: Self::member_roles(&member.roles),
            is_admin,
        };
        let _ = enforcer.confirm(prompt_id, &actor, Gesture::Ban).await;
    }
}

/* ============================================================
   Platform implementation over the REST client
   ============================================================ */

pub struct SerenityPlatform {
    http: Arc<Http>,
    audit_channel: u64,
    roles: Roles,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, audit_channel: u64, roles: Roles) -> Self {
        Self {
            http,
            audit_channel,
            roles,
        }
    }

    pub fn from_token(token: &str, audit_channel: u64, roles: Roles) -> Self {
        Self::new(Arc::new(Http::new(token)), audit_channel, roles)
    }

    fn platform_err(e: serenity::Error, target: u64) -> PlatformError {
        match e {
            serenity::Error::Http(inner) => {
                let text = inner.to_string();
                if text.contains("Missing Permissions") || text.contains("Missing Access") {
                    PlatformError::PermissionDenied { target }
                } else if text.contains("Unknown") {
                    PlatformError::NotFound(text)
                } else {
                    PlatformError::Transient(text)
                }
            }
            other => PlatformError::Transient(other.to_string()),
        }
    }
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn fetch_invites(&self, guild_id: u64) -> Result<Vec<InviteRecord>, PlatformError> {
        let invites = GuildId::new(guild_id)
            .invites(&self.http)
            .await
            .map_err(|e| Self::platform_err(e, guild_id))?;
        Ok(invites
            .into_iter()
            .map(|i| InviteRecord {
                code: i.code,
                uses: i.uses as u64,
                max_uses: i.max_uses as u64,
                max_age_secs: i.max_age as u64,
                created_at: ts_to_utc(i.created_at),
                inviter_id: i.inviter.map(|u| u.id.get()),
            })
            .collect())
    }

    async fn fetch_vanity_invite(
        &self,
        _guild_id: u64,
    ) -> Result<Option<InviteRecord>, PlatformError> {
        // The REST surface does not expose vanity usage counters; vanity
        // joins degrade to discovery. The engine handles a future source
        // transparently.
        Ok(None)
    }

    async fn send_notice(&self, channel_id: u64, text: &str) -> Result<(), PlatformError> {
        ChannelId::new(channel_id)
            .say(&self.http, text)
            .await
            .map(|_| ())
            .map_err(|e| Self::platform_err(e, channel_id))
    }

    async fn delete_message(
        &self,
        channel_id: u64,
        message_id: u64,
    ) -> Result<(), PlatformError> {
        ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await
            .map_err(|e| Self::platform_err(e, message_id))
    }

    async fn retire_prompt(
        &self,
        channel_id: u64,
        message_id: u64,
        note: &str,
    ) -> Result<(), PlatformError> {
        let edit = EditMessage::new()
            .components(Vec::new())
            .embed(
                CreateEmbed::new()
                    .colour(Colour::new(0x95A5A6))
                    .description(note.to_string()),
            );
        ChannelId::new(channel_id)
            .edit_message(&self.http, MessageId::new(message_id), edit)
            .await
            .map(|_| ())
            .map_err(|e| Self::platform_err(e, message_id))
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(|e| Self::platform_err(e, user_id))
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await
            .map_err(|e| Self::platform_err(e, user_id))
    }

    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        purge_days: u8,
        reason: &str,
    ) -> Result<(), PlatformError> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), purge_days, reason)
            .await
            .map_err(|e| Self::platform_err(e, user_id))
    }

    async fn fetch_recent_history(
        &self,
        guild_id: u64,
        channel_id: u64,
        limit: u8,
    ) -> Result<Vec<MessageEvent>, PlatformError> {
        let messages = ChannelId::new(channel_id)
            .messages(&self.http, GetMessages::new().limit(limit))
            .await
            .map_err(|e| Self::platform_err(e, channel_id))?;

        // REST history carries bare users; member lookups are memoized per
        // author for the role-derived fields.
        let mut members: HashMap<u64, (Vec<u64>, Option<DateTime<Utc>>)> = HashMap::new();
        let mut out = Vec::with_capacity(messages.len());
        for msg in &messages {
            if msg.author.bot {
                continue;
            }
            let author_id = msg.author.id.get();
            if !members.contains_key(&author_id) {
                let looked_up = self
                    .http
                    .get_member(GuildId::new(guild_id), msg.author.id)
                    .await
                    .map(|m| {
                        (
                            m.roles.iter().map(|r| r.get()).collect::<Vec<u64>>(),
                            m.joined_at.map(ts_to_utc),
                        )
                    })
                    .unwrap_or((Vec::new(), None));
                members.insert(author_id, looked_up);
            }
            let (roles, joined_at) = members.get(&author_id).cloned().unwrap_or_default();
            let has_language_role = roles.iter().any(|id| self.roles.language.contains(id));
            let staff = roles.iter().any(|id| {
                self.roles.moderator.contains(id)
                    || self.roles.minimo.contains(id)
                    || self.roles.welcoming_party.contains(id)
            });
            out.push(MessageEvent {
                guild_id,
                channel_id,
                message_id: msg.id.get(),
                author_id,
                content: msg.content.clone(),
                created_at: ts_to_utc(msg.timestamp),
                role_mention_count: msg.mention_roles.len() as u32,
                mentioned_user_ids: msg.mentions.iter().map(|u| u.id.get()).collect(),
                attachment_names: msg.attachments.iter().map(|a| a.filename.clone()).collect(),
                author_is_newcomer: !has_language_role,
                author_is_trusted: staff
                    || roles.iter().any(|id| self.roles.trusted.contains(id)),
                author_joined_at: joined_at,
            });
        }
        Ok(out)
    }

    async fn post_audit_line(&self, guild_id: u64, text: &str) {
        tracing::info!(gid = guild_id, "{text}");
        if self.audit_channel == 0 {
            return;
        }
        let _ = ChannelId::new(self.audit_channel).say(&self.http, text).await;
    }
}

/* ============================================================
   Client bootstrap
   ============================================================ */

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "GUILD_MESSAGE_REACTIONS" => i |= GatewayIntents::GUILD_MESSAGE_REACTIONS,
            "GUILD_INVITES" => i |= GatewayIntents::GUILD_INVITES,
            "MESSAGE_CONTENT" => i |= GatewayIntents::MESSAGE_CONTENT,
            "GUILD_VOICE_STATES" => i |= GatewayIntents::GUILD_VOICE_STATES,
            _ => {}
        }
    }
    if i.is_empty() { default_gateway_intents() } else { i }
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Missing Discord token (AEGIS_DISCORD_TOKEN). Fill in .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);

    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}

fn ts_to_utc(t: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_opt(t.unix_timestamp(), 0)
        .single()
        .unwrap_or_else(Utc::now)
}
