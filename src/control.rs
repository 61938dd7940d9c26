//! The operator control socket (§4.5.2, §6): a Unix domain socket, mode
//! 0700, in the runtime directory, speaking a newline-delimited
//! request/response protocol.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::assets::AssetResolver;
use crate::http::build_state_json;
use crate::paths::Paths;
use crate::registry::Registry;
use crate::session::{self, Session};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("binding control socket: {0}")]
    Bind(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tries each boolean-token spelling case-insensitively; falls through to
/// `None` so the caller can try an integer or a raw string next (§10's
/// coercion order).
fn parse_bool_token(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

async fn set_policy(
    registry: &Arc<Mutex<Registry>>,
    session: &Arc<Session>,
    name: &str,
    value: &str,
) -> String {
    match name {
        "auto-mute-unknown" | "auto_mute_unknown" => match parse_bool_token(value) {
            Some(b) => {
                let intents = {
                    let mut r = registry.lock().await;
                    r.config.policies.auto_mute_unknown = b;
                    r.reapply_policy()
                };
                session::dispatch_mutes(session, registry, intents);
                "ok".to_string()
            }
            None => "error invalid value".to_string(),
        },
        "require-approved" | "require_approved" => match parse_bool_token(value) {
            Some(b) => {
                let intents = {
                    let mut r = registry.lock().await;
                    r.config.policies.require_approved = b;
                    r.reapply_policy()
                };
                session::dispatch_mutes(session, registry, intents);
                "ok".to_string()
            }
            None => "error invalid value".to_string(),
        },
        "show-ignored" | "show_ignored" => match parse_bool_token(value) {
            Some(b) => {
                let mut r = registry.lock().await;
                r.config.policies.show_ignored = b;
                r.reapply_policy();
                "ok".to_string()
            }
            None => "error invalid value".to_string(),
        },
        "target-channel" | "target_channel" => {
            if value.is_empty() {
                let intents = registry.lock().await.apply_target_channel(None, None);
                session::dispatch_mutes(session, registry, intents);
                return "ok".to_string();
            }
            if let Ok(id) = value.parse::<i64>() {
                let name = registry.lock().await.channels.get(&id).cloned();
                let intents = registry.lock().await.apply_target_channel(Some(id), name);
                session::dispatch_mutes(session, registry, intents);
                return "ok".to_string();
            }
            let resolved = registry.lock().await.resolve_channel_name(value);
            match resolved {
                Some(id) => {
                    let intents = registry
                        .lock()
                        .await
                        .apply_target_channel(Some(id), Some(value.to_string()));
                    session::dispatch_mutes(session, registry, intents);
                    "ok".to_string()
                }
                None => "error unknown channel".to_string(),
            }
        }
        _ => "error unknown policy".to_string(),
    }
}

async fn handle_command(
    line: &str,
    registry: &Arc<Mutex<Registry>>,
    session: &Arc<Session>,
    assets: &AssetResolver,
    paths: &Paths,
    http_addr: &str,
) -> String {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "status" => {
            let r = registry.lock().await;
            let link_ok = session.link_ok().await as u8;
            let auth = session.auth_ok().await as u8;
            let counts = r.counts();
            format!(
                "ok link_ok={} auth={} schandlerid={} channel_id={} channel_name={} counts={{approved_total={},present_approved={},present_unknown={},present_ignored={}}} url=http://{}",
                link_ok,
                auth,
                r.self_identity.schandlerid.map(|v| v.to_string()).unwrap_or_default(),
                r.self_identity.channel_id.map(|v| v.to_string()).unwrap_or_default(),
                r.current_channel_name().unwrap_or_default(),
                counts.approved_total,
                counts.present_approved,
                counts.present_unknown,
                counts.present_ignored,
                http_addr,
            )
        }
        "key-status" => {
            let present = paths.api_key_path.is_file();
            format!("ok key_present={}", present as u8)
        }
        "setkey" => {
            if rest.is_empty() {
                return "error empty".to_string();
            }
            match session::trigger_setkey(session.clone(), registry.clone(), paths.clone(), rest.to_string()) {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error io {e}"),
            }
        }
        "dump-state" => {
            let r = registry.lock().await;
            build_state_json(&r, assets).to_string()
        }
        "approve-uid" => {
            if rest.is_empty() {
                return "error empty".to_string();
            }
            let intents = registry.lock().await.approve_uid(rest);
            session::dispatch_mutes(session, registry, intents);
            "ok".to_string()
        }
        "approve-clid" => match registry.lock().await.uid_for_clid(rest) {
            Some(uid) => {
                let intents = registry.lock().await.approve_uid(&uid);
                session::dispatch_mutes(session, registry, intents);
                "ok".to_string()
            }
            None => "error unknown clid".to_string(),
        },
        "approve-nick" => match registry.lock().await.uid_for_nickname(rest) {
            Some(uid) => {
                let intents = registry.lock().await.approve_uid(&uid);
                session::dispatch_mutes(session, registry, intents);
                "ok".to_string()
            }
            None => "error unknown nick".to_string(),
        },
        "unapprove-uid" => {
            let intents = registry.lock().await.unapprove_uid(rest);
            session::dispatch_mutes(session, registry, intents);
            "ok".to_string()
        }
        "ignore-uid" => {
            let intents = registry.lock().await.ignore_uid(rest);
            session::dispatch_mutes(session, registry, intents);
            "ok".to_string()
        }
        "unignore-uid" => {
            let intents = registry.lock().await.unignore_uid(rest);
            session::dispatch_mutes(session, registry, intents);
            "ok".to_string()
        }
        "approved-list" => {
            let r = registry.lock().await;
            r.config.approved.iter().cloned().collect::<Vec<_>>().join("\n")
        }
        "ignore-list" => {
            let r = registry.lock().await;
            r.config.ignored.iter().cloned().collect::<Vec<_>>().join("\n")
        }
        "channels" => {
            let r = registry.lock().await;
            r.channels()
                .into_iter()
                .map(|c| format!("{}\t{}", c.id, c.name))
                .collect::<Vec<_>>()
                .join("\n")
        }
        "policy" => {
            let mut args = rest.splitn(2, ' ');
            let name = args.next().unwrap_or("");
            let value = args.next().unwrap_or("").trim();
            if name.is_empty() {
                return "error empty".to_string();
            }
            set_policy(registry, session, name, value).await
        }
        "" => "error empty".to_string(),
        _ => "error unknown".to_string(),
    }
}

async fn serve_connection(
    stream: UnixStream,
    registry: Arc<Mutex<Registry>>,
    session: Arc<Session>,
    assets: AssetResolver,
    paths: Paths,
    http_addr: String,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let reply = handle_command(line.trim(), &registry, &session, &assets, &paths, &http_addr).await;
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

pub async fn serve(
    registry: Arc<Mutex<Registry>>,
    session: Arc<Session>,
    assets: AssetResolver,
    paths: Paths,
    http_addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControlError> {
    let socket_path = paths.control_socket_path.clone();
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).map_err(ControlError::Bind)?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o700))?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let registry = registry.clone();
                        let session = session.clone();
                        let assets = assets.clone();
                        let paths = paths.clone();
                        let http_addr = http_addr.clone();
                        tokio::spawn(serve_connection(stream, registry, session, assets, paths, http_addr));
                    }
                    Err(e) => warn!(error = %e, "control socket accept failed"),
                }
            }
        }
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use voicebridge_config::PersistedConfig;

    fn test_registry() -> Arc<Mutex<Registry>> {
        Arc::new(Mutex::new(Registry::new(
            PersistedConfig::default(),
            PathBuf::from("/tmp/does-not-exist-control-test.json"),
        )))
    }

    fn test_paths() -> Paths {
        Paths {
            config_path: PathBuf::from("/tmp/c"),
            api_key_path: PathBuf::from("/tmp/does-not-exist-key"),
            user_assets_dir: PathBuf::from("/tmp/a"),
            default_assets_dir: PathBuf::from("/tmp/da"),
            user_overlay_dir: PathBuf::from("/tmp/o"),
            default_overlay_dir: PathBuf::from("/tmp/do"),
            control_socket_path: PathBuf::from("/tmp/voicebridge-test.sock"),
        }
    }

    #[tokio::test]
    async fn unknown_command_is_error_unknown() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("bogus", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "error unknown");
    }

    #[tokio::test]
    async fn empty_line_is_error_empty() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "error empty");
    }

    #[tokio::test]
    async fn key_status_reflects_missing_file() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("key-status", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "ok key_present=0");
    }

    #[tokio::test]
    async fn approve_uid_then_approved_list_round_trips() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("approve-uid ABC", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "ok");
        let list = handle_command("approved-list", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(list, "ABC");
    }

    #[tokio::test]
    async fn approve_clid_unknown_is_error() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("approve-clid 999", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "error unknown clid");
    }

    #[tokio::test]
    async fn policy_unknown_name_is_error() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("policy bogus 1", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "error unknown policy");
    }

    #[tokio::test]
    async fn policy_boolean_accepts_word_tokens() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command(
            "policy auto-mute-unknown off",
            &registry,
            &session,
            &assets,
            &paths,
            "http://x",
        )
        .await;
        assert_eq!(reply, "ok");
        assert!(!registry.lock().await.config.policies.auto_mute_unknown);
    }

    #[tokio::test]
    async fn policy_target_channel_unknown_name_is_error() {
        let registry = test_registry();
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command(
            "policy target-channel Lounge",
            &registry,
            &session,
            &assets,
            &paths,
            "http://x",
        )
        .await;
        assert_eq!(reply, "error unknown channel");
    }

    #[tokio::test]
    async fn channels_lists_tab_separated() {
        let registry = test_registry();
        registry.lock().await.channels.insert(5, "Lobby".to_string());
        let session = Session::new();
        let assets = AssetResolver::new(PathBuf::from("/tmp/a"), PathBuf::from("/tmp/da"));
        let paths = test_paths();
        let reply = handle_command("channels", &registry, &session, &assets, &paths, "http://x").await;
        assert_eq!(reply, "5\tLobby");
    }
}
