//! Authoritative in-memory model of clients, channels, and self-identity.
//! Pure and synchronous: every method here runs to completion without
//! awaiting anything, so the caller decides what I/O (mute commands,
//! config persistence) follows a mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use voicebridge_config::PersistedConfig;
use voicebridge_wire::Record;

use crate::assets::AssetResolver;

/// A command the caller must issue back through the session as a result of
/// a registry mutation. Registry methods never perform I/O themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Fire-and-forget `clientmute clid=<clid>`.
    Mute(String),
}

#[derive(Debug, Clone, Default)]
pub struct Participant {
    pub clid: String,
    pub uid: String,
    pub nickname: String,
    pub channel_id: Option<i64>,
    pub talking: bool,
    pub approved: bool,
    pub ignored: bool,
    pub muted_by_us: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelfIdentity {
    pub clid: Option<String>,
    pub uid: Option<String>,
    pub nickname: Option<String>,
    pub channel_id: Option<i64>,
    pub schandlerid: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelView {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserView {
    pub uid: String,
    pub nickname: String,
    pub talking: bool,
    pub approved: bool,
    pub ignored: bool,
    pub assets: crate::assets::AssetUrlsJson,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnknownUserView {
    pub uid: String,
    pub nickname: String,
    pub channel_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counts {
    pub approved_total: usize,
    pub present_approved: usize,
    pub present_unknown: usize,
    pub present_ignored: usize,
}

pub struct Registry {
    pub clients: BTreeMap<String, Participant>,
    pub channels: BTreeMap<i64, String>,
    pub self_identity: SelfIdentity,
    pub config: PersistedConfig,
    config_path: PathBuf,
}

impl Registry {
    pub fn new(config: PersistedConfig, config_path: PathBuf) -> Self {
        Self {
            clients: BTreeMap::new(),
            channels: BTreeMap::new(),
            self_identity: SelfIdentity::default(),
            config,
            config_path,
        }
    }

    fn persist(&self) {
        if let Err(e) = self.config.save(&self.config_path) {
            tracing::warn!(error = %e, "failed to persist config");
        }
    }

    /// Session loss: the entire registry is cleared so `muted_by_us` cannot
    /// outlive its upstream session (invariant 3).
    pub fn clear_session(&mut self) {
        self.clients.clear();
        self.channels.clear();
        self.self_identity = SelfIdentity::default();
    }

    // ---- resync ingress -------------------------------------------------

    pub fn set_self_from_whoami(&mut self, record: &Record) {
        let clid = record.get("clid").or_else(|| record.get("client_id"));
        if let Some(clid) = clid {
            self.self_identity.clid = Some(clid.to_string());
        }
        if let Some(sch) = record.get("schandlerid").and_then(|v| v.parse().ok()) {
            self.self_identity.schandlerid = Some(sch);
        }
        if let Some(cid) = record.get("cid").and_then(|v| v.parse().ok()) {
            self.self_identity.channel_id = Some(cid);
        }
    }

    pub fn replace_channels(&mut self, records: &[Record]) {
        self.channels.clear();
        for r in records {
            if let (Some(id), Some(name)) = (
                r.get("cid").and_then(|v| v.parse::<i64>().ok()),
                r.get("channel_name"),
            ) {
                self.channels.insert(id, name.to_string());
            }
        }
    }

    /// Resolves `target_channel_name` case-insensitively against the known
    /// channel names. Called after every `channellist` refresh (§4.3.4).
    pub fn resolve_channel_name(&self, name: &str) -> Option<i64> {
        let needle = name.to_lowercase();
        self.channels
            .iter()
            .find(|(_, n)| n.to_lowercase() == needle)
            .map(|(id, _)| *id)
    }

    /// Replaces `clients` wholesale from a `clientlist` response, splitting
    /// out the self entry (invariant 4: self is never in the registry) and
    /// re-evaluating policy for every participant.
    pub fn replace_clientlist(&mut self, records: &[Record]) -> Vec<Intent> {
        self.clients.clear();
        for r in records {
            let Some(clid) = r.get("clid") else { continue };
            if Some(clid) == self.self_identity.clid.as_deref() {
                if let Some(uid) = r.get("client_unique_identifier") {
                    self.self_identity.uid = Some(uid.to_string());
                }
                if let Some(nick) = r.get("client_nickname") {
                    self.self_identity.nickname = Some(nick.to_string());
                }
                if let Some(cid) = r.get("cid").and_then(|v| v.parse().ok()) {
                    self.self_identity.channel_id = Some(cid);
                }
                continue;
            }
            let participant = Participant {
                clid: clid.to_string(),
                uid: r.get("client_unique_identifier").unwrap_or("").to_string(),
                nickname: r.get("client_nickname").unwrap_or("").to_string(),
                channel_id: r.get("cid").and_then(|v| v.parse().ok()),
                talking: false,
                approved: false,
                ignored: false,
                muted_by_us: false,
            };
            self.clients.insert(participant.clid.clone(), participant);
        }
        self.apply_policies_all()
    }

    // ---- async notification ingress --------------------------------------

    /// The only ingress from async notifications (§4.4). Returns any mute
    /// intents the caller must dispatch fire-and-forget.
    pub fn handle_notification(&mut self, record: &Record) -> Vec<Intent> {
        match record.event.as_deref() {
            Some("notifycliententerview") => self.on_enter(record),
            Some("notifyclientleftview") => self.on_leave(record),
            Some("notifyclientmoved") => self.on_moved(record),
            Some("notifytalkstatuschange") => self.on_talk_status(record),
            Some("notifyclientupdated") => self.on_updated(record),
            _ => Vec::new(),
        }
    }

    fn on_enter(&mut self, record: &Record) -> Vec<Intent> {
        let Some(clid) = record.get("clid") else {
            return Vec::new();
        };
        if Some(clid) == self.self_identity.clid.as_deref() {
            return Vec::new();
        }
        let participant = Participant {
            clid: clid.to_string(),
            uid: record.get("client_unique_identifier").unwrap_or("").to_string(),
            nickname: record.get("client_nickname").unwrap_or("").to_string(),
            channel_id: record.get("ctid").and_then(|v| v.parse().ok()),
            talking: false,
            approved: false,
            ignored: false,
            muted_by_us: false,
        };
        self.clients.insert(participant.clid.clone(), participant);
        self.apply_policies_all()
    }

    fn on_leave(&mut self, record: &Record) -> Vec<Intent> {
        let Some(clid) = record.get("clid") else {
            return Vec::new();
        };
        if Some(clid) == self.self_identity.clid.as_deref() {
            // Open question (preserved): clears only the current channel,
            // not the configured target — a reconnect re-monitors the same room.
            self.self_identity.channel_id = None;
            return self.apply_policies_all();
        }
        self.clients.remove(clid);
        Vec::new()
    }

    fn on_moved(&mut self, record: &Record) -> Vec<Intent> {
        let Some(clid) = record.get("clid") else {
            return Vec::new();
        };
        let new_channel = record.get("ctid").and_then(|v| v.parse().ok());
        if Some(clid) == self.self_identity.clid.as_deref() {
            self.self_identity.channel_id = new_channel;
        } else if let Some(p) = self.clients.get_mut(clid) {
            p.channel_id = new_channel;
        }
        self.apply_policies_all()
    }

    fn on_talk_status(&mut self, record: &Record) -> Vec<Intent> {
        let Some(clid) = record.get("clid") else {
            return Vec::new();
        };
        let talking = record.get("status") == Some("1");
        if let Some(p) = self.clients.get_mut(clid) {
            p.talking = talking;
        }
        Vec::new()
    }

    fn on_updated(&mut self, record: &Record) -> Vec<Intent> {
        let Some(clid) = record.get("clid") else {
            return Vec::new();
        };
        if let Some(nick) = record.get("client_nickname") {
            if Some(clid) == self.self_identity.clid.as_deref() {
                self.self_identity.nickname = Some(nick.to_string());
            } else if let Some(p) = self.clients.get_mut(clid) {
                p.nickname = nick.to_string();
            }
        }
        Vec::new()
    }

    // ---- operator intents -------------------------------------------------

    pub fn approve_uid(&mut self, uid: &str) -> Vec<Intent> {
        self.config.approved.insert(uid.to_string());
        for p in self.clients.values_mut() {
            if p.uid == uid {
                p.muted_by_us = false;
            }
        }
        self.persist();
        self.apply_policies_all()
    }

    pub fn unapprove_uid(&mut self, uid: &str) -> Vec<Intent> {
        self.config.approved.remove(uid);
        self.persist();
        self.apply_policies_all()
    }

    pub fn ignore_uid(&mut self, uid: &str) -> Vec<Intent> {
        self.config.ignored.insert(uid.to_string());
        self.persist();
        self.apply_policies_all()
    }

    pub fn unignore_uid(&mut self, uid: &str) -> Vec<Intent> {
        self.config.ignored.remove(uid);
        self.persist();
        self.apply_policies_all()
    }

    /// Sets the monitored room and re-runs policy across the whole registry
    /// (§9: must be re-invoked on any `apply_target_channel` call).
    pub fn apply_target_channel(&mut self, id: Option<i64>, name: Option<String>) -> Vec<Intent> {
        self.config.policies.target_channel = id;
        self.config.policies.target_channel_name = name;
        self.persist();
        self.apply_policies_all()
    }

    /// Persists `config` and re-derives policy across the registry; the
    /// control socket calls this after mutating a boolean policy flag
    /// directly (`config` is public so the caller can just set the field).
    pub fn reapply_policy(&mut self) -> Vec<Intent> {
        self.persist();
        self.apply_policies_all()
    }

    pub fn clid_for_uid(&self, uid: &str) -> Option<String> {
        self.clients
            .values()
            .find(|p| p.uid == uid)
            .map(|p| p.clid.clone())
    }

    pub fn uid_for_clid(&self, clid: &str) -> Option<String> {
        self.clients.get(clid).map(|p| p.uid.clone())
    }

    pub fn uid_for_nickname(&self, nickname: &str) -> Option<String> {
        self.clients
            .values()
            .find(|p| p.nickname == nickname)
            .map(|p| p.uid.clone())
    }

    /// Marks `clid` as muted after the upstream acknowledges the command.
    pub fn mark_muted(&mut self, clid: &str) {
        if let Some(p) = self.clients.get_mut(clid) {
            p.muted_by_us = true;
        }
    }

    // ---- policy engine ------------------------------------------------

    fn own_uid(&self) -> Option<&str> {
        self.self_identity.uid.as_deref().filter(|u| !u.is_empty())
    }

    fn scope_active(&self) -> bool {
        match self.config.policies.target_channel {
            Some(target) => self.self_identity.channel_id == Some(target),
            None => self.self_identity.channel_id.is_some(),
        }
    }

    fn monitored_channel(&self) -> Option<i64> {
        if !self.scope_active() {
            return None;
        }
        self.config
            .policies
            .target_channel
            .or(self.self_identity.channel_id)
    }

    fn in_scope(&self, p: &Participant) -> bool {
        let scope = self.monitored_channel();
        scope.is_some() && p.channel_id == scope
    }

    /// Matches on `own_uid` when non-empty, falling back to `own_clid`
    /// (§4.4 tie-breaks). Structurally redundant with the ingestion-time
    /// exclusion in [`Self::on_enter`]/[`Self::replace_clientlist`], kept as
    /// a defensive second line in the read projections.
    fn is_self(&self, p: &Participant) -> bool {
        if let Some(uid) = self.own_uid() {
            return p.uid == uid;
        }
        if let Some(clid) = self.self_identity.clid.as_deref() {
            return p.clid == clid;
        }
        false
    }

    /// Re-derives `approved`/`ignored` on every participant and re-runs the
    /// auto-mute check, returning any fresh mute intents.
    pub fn apply_policies_all(&mut self) -> Vec<Intent> {
        let approved = self.config.approved.clone();
        let ignored = self.config.ignored.clone();
        let scope = self.monitored_channel();
        let auto_mute = self.config.policies.auto_mute_unknown;
        let mut intents = Vec::new();
        for p in self.clients.values_mut() {
            p.approved = !p.uid.is_empty() && approved.contains(&p.uid);
            p.ignored = !p.uid.is_empty() && ignored.contains(&p.uid);
            let in_scope = scope.is_some() && p.channel_id == scope;
            if in_scope && auto_mute && !p.approved && !p.ignored && !p.muted_by_us {
                intents.push(Intent::Mute(p.clid.clone()));
            }
        }
        intents
    }

    // ---- read projections ------------------------------------------------

    pub fn build_users(&self, assets: &AssetResolver) -> Vec<UserView> {
        let show_ignored = self.config.policies.show_ignored;
        let require_approved = self.config.policies.require_approved;

        let mut users: Vec<&Participant> = self
            .clients
            .values()
            .filter(|p| self.in_scope(p))
            .filter(|p| !self.is_self(p))
            .filter(|p| {
                if p.ignored {
                    show_ignored
                } else {
                    !require_approved || p.approved
                }
            })
            .collect();

        users.sort_by(|a, b| {
            let an = a.nickname.to_lowercase();
            let bn = b.nickname.to_lowercase();
            match (an.is_empty(), bn.is_empty()) {
                (true, true) => a.uid.cmp(&b.uid),
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => an.cmp(&bn).then_with(|| a.uid.cmp(&b.uid)),
            }
        });

        users
            .into_iter()
            .map(|p| {
                assets.ensure_user_dir(&p.uid);
                let urls = assets.urls_for(&p.uid);
                UserView {
                    uid: p.uid.clone(),
                    nickname: p.nickname.clone(),
                    talking: p.talking,
                    approved: p.approved,
                    ignored: p.ignored,
                    assets: crate::assets::AssetUrlsJson::from(urls),
                }
            })
            .collect()
    }

    pub fn build_unknown_users(&self) -> Vec<UnknownUserView> {
        let mut unknown: Vec<&Participant> = self
            .clients
            .values()
            .filter(|p| self.in_scope(p))
            .filter(|p| !self.is_self(p))
            .filter(|p| !p.approved && !p.ignored)
            .collect();
        unknown.sort_by(|a, b| {
            a.nickname
                .to_lowercase()
                .cmp(&b.nickname.to_lowercase())
                .then_with(|| a.uid.cmp(&b.uid))
        });
        unknown
            .into_iter()
            .map(|p| UnknownUserView {
                uid: p.uid.clone(),
                nickname: p.nickname.clone(),
                channel_id: p.channel_id,
            })
            .collect()
    }

    pub fn counts(&self) -> Counts {
        let mut counts = Counts {
            approved_total: self.config.approved.len(),
            ..Counts::default()
        };
        for p in self.clients.values().filter(|p| self.in_scope(p)) {
            if p.approved {
                counts.present_approved += 1;
            }
            if p.ignored {
                counts.present_ignored += 1;
            }
            if !p.approved && !p.ignored {
                counts.present_unknown += 1;
            }
        }
        counts
    }

    pub fn channels(&self) -> Vec<ChannelView> {
        let mut out: Vec<ChannelView> = self
            .channels
            .iter()
            .map(|(&id, name)| ChannelView {
                id,
                name: name.clone(),
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn current_channel_name(&self) -> Option<String> {
        self.self_identity
            .channel_id
            .and_then(|id| self.channels.get(&id).cloned())
    }

    pub fn target_channel_active(&self) -> bool {
        self.scope_active()
    }
}
