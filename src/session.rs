//! The upstream session: a reconnecting request/response multiplexer over
//! the voice client's ClientQuery-style line protocol, plus the notification
//! reader that drives the participant registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use voicebridge_wire::{classify_line, parse_line, split_records, LineKind, Record};

use crate::paths::Paths;
use crate::registry::{Intent, Registry};

const UPSTREAM_ADDR: &str = "127.0.0.1:25639";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECTED_ERROR_ID: i64 = 2569;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("upstream connection lost")]
    Disconnected,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Unauthenticated,
    Authenticated,
    Synced,
}

/// The collected response to one `send_command` call: the buffered payload
/// lines plus the terminating `error id=<n>` line, and that id pulled out
/// for convenience.
#[derive(Debug, Clone)]
pub struct Response {
    pub lines: Vec<String>,
    pub error_id: i64,
}

impl Response {
    fn disconnected() -> Self {
        Self {
            lines: vec!["error id=2569 msg=not\\sconnected".to_string()],
            error_id: DISCONNECTED_ERROR_ID,
        }
    }

    pub fn ok(&self) -> bool {
        self.error_id == 0
    }
}

/// Owns the upstream write half and the single-in-flight request state.
/// Shared via `Arc` across the session's own reader task and any
/// fire-and-forget mute/resync tasks it spawns.
pub struct Session {
    write_half: Mutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    pending: Mutex<Option<oneshot::Sender<Response>>>,
    send_lock: Mutex<()>,
    state: Mutex<ConnectionState>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            write_half: Mutex::new(None),
            pending: Mutex::new(None),
            send_lock: Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    async fn set_state(&self, s: ConnectionState) {
        *self.state.lock().await = s;
    }

    pub async fn link_ok(&self) -> bool {
        !matches!(
            self.state().await,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }

    pub async fn auth_ok(&self) -> bool {
        matches!(
            self.state().await,
            ConnectionState::Authenticated | ConnectionState::Synced
        )
    }

    /// Serializes the send + await cycle behind `send_lock` (§4.3.1, §9):
    /// this is the only thing preventing a fire-and-forget mute from
    /// interleaving with a resync on the same socket.
    pub async fn send_command(&self, cmd: &str) -> Response {
        let _guard = self.send_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().await = Some(tx);
        if self.write_line(cmd).await.is_err() {
            self.pending.lock().await.take();
            return Response::disconnected();
        }
        rx.await.unwrap_or_else(|_| Response::disconnected())
    }

    async fn write_line(&self, cmd: &str) -> std::io::Result<()> {
        let mut guard = self.write_half.lock().await;
        match guard.as_mut() {
            Some(w) => {
                w.write_all(cmd.as_bytes()).await?;
                w.write_all(b"\n").await?;
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no upstream connection",
            )),
        }
    }

    /// Answers a keepalive (`error id=1796`) with a bare newline; not a
    /// request, so it bypasses `send_lock` entirely.
    async fn write_raw(&self, raw: &str) {
        let mut guard = self.write_half.lock().await;
        if let Some(w) = guard.as_mut() {
            let _ = w.write_all(raw.as_bytes()).await;
        }
    }

    async fn complete_pending_with_disconnect(&self) {
        if let Some(tx) = self.pending.lock().await.take() {
            let _ = tx.send(Response::disconnected());
        }
    }
}

fn load_api_key(path: &std::path::Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let key = text.trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

fn check_disconnected(resp: &Response) -> Result<(), SessionError> {
    if resp.error_id == DISCONNECTED_ERROR_ID {
        Err(SessionError::Disconnected)
    } else {
        Ok(())
    }
}

fn first_record(resp: &Response) -> Record {
    resp.lines
        .iter()
        .find(|l| !l.starts_with("error "))
        .map(|l| parse_line(l))
        .unwrap_or_default()
}

fn collect_records(resp: &Response) -> Vec<Record> {
    resp.lines
        .iter()
        .filter(|l| !l.starts_with("error "))
        .flat_map(|l| split_records(l))
        .collect()
}

pub(crate) fn dispatch_mutes(session: &Arc<Session>, registry: &Arc<Mutex<Registry>>, intents: Vec<Intent>) {
    for Intent::Mute(clid) in intents {
        let session = session.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let resp = session
                .send_command(&format!("clientmute clid={clid}"))
                .await;
            if resp.ok() {
                registry.lock().await.mark_muted(&clid);
            } else {
                warn!(clid, error_id = resp.error_id, "mute command failed; next resync will retry");
            }
        });
    }
}

async fn subscribe(session: &Arc<Session>, registry: &Arc<Mutex<Registry>>) -> Result<(), SessionError> {
    let schandlerid = registry.lock().await.self_identity.schandlerid;
    if let Some(sch) = schandlerid {
        let resp = session.send_command(&format!("use schandlerid={sch}")).await;
        check_disconnected(&resp)?;
        let resp = session
            .send_command(&format!("clientnotifyregister schandlerid={sch} event=any"))
            .await;
        check_disconnected(&resp)?;
    }
    let resp = session.send_command("servernotifyregister event=any").await;
    check_disconnected(&resp)?;
    Ok(())
}

/// §4.3.2: the full resync sequence. Replaces `channels` and `clients`
/// wholesale and re-derives policy for every participant.
async fn resync(session: &Arc<Session>, registry: &Arc<Mutex<Registry>>) -> Result<(), SessionError> {
    let resp = session.send_command("whoami").await;
    check_disconnected(&resp)?;
    registry.lock().await.set_self_from_whoami(&first_record(&resp));

    let resp = session.send_command("channellist").await;
    check_disconnected(&resp)?;
    let channels = collect_records(&resp);
    registry.lock().await.replace_channels(&channels);
    resolve_target_channel_name(session, registry).await?;

    let target_or_self = {
        let r = registry.lock().await;
        r.config.policies.target_channel.or(r.self_identity.channel_id)
    };
    if let Some(cid) = target_or_self {
        let resp = session.send_command(&format!("channelinfo cid={cid}")).await;
        check_disconnected(&resp)?;
        if let Some(name) = first_record(&resp).get("channel_name") {
            registry.lock().await.channels.insert(cid, name.to_string());
        }
    }

    let resp = session.send_command("clientlist -voice -uid").await;
    check_disconnected(&resp)?;
    let clients = collect_records(&resp);
    let intents = registry.lock().await.replace_clientlist(&clients);
    dispatch_mutes(session, registry, intents);
    Ok(())
}

/// §4.3.4: re-resolve `target_channel_name` after every `channellist`
/// refresh, persisting the newly resolved id if it changed.
async fn resolve_target_channel_name(
    session: &Arc<Session>,
    registry: &Arc<Mutex<Registry>>,
) -> Result<(), SessionError> {
    let (name, current) = {
        let r = registry.lock().await;
        (r.config.policies.target_channel_name.clone(), r.config.policies.target_channel)
    };
    let Some(name) = name else { return Ok(()) };
    let resolved = registry.lock().await.resolve_channel_name(&name);
    if let Some(id) = resolved {
        if Some(id) != current {
            let intents = registry.lock().await.apply_target_channel(Some(id), Some(name));
            dispatch_mutes(session, registry, intents);
        }
    }
    Ok(())
}

/// Full post-connect handshake, steps 3-6 (§4.3).
async fn run_post_auth_handshake(
    session: &Arc<Session>,
    registry: &Arc<Mutex<Registry>>,
) -> Result<(), SessionError> {
    let resp = session.send_command("whoami").await;
    check_disconnected(&resp)?;
    registry.lock().await.set_self_from_whoami(&first_record(&resp));
    subscribe(session, registry).await?;
    resync(session, registry).await?;
    session.set_state(ConnectionState::Synced).await;
    Ok(())
}

/// Server hop (§4.3.3): `schandlerid` has already been updated by the
/// caller from the notification itself, so only steps 4-6 re-run.
async fn run_server_hop(session: &Arc<Session>, registry: &Arc<Mutex<Registry>>) -> Result<(), SessionError> {
    subscribe(session, registry).await?;
    resync(session, registry).await?;
    session.set_state(ConnectionState::Synced).await;
    Ok(())
}

async fn authenticate_and_sync(
    session: &Arc<Session>,
    registry: &Arc<Mutex<Registry>>,
    paths: &Paths,
) -> Result<(), SessionError> {
    let Some(key) = load_api_key(&paths.api_key_path) else {
        return Ok(());
    };
    let resp = session
        .send_command(&format!("auth apikey={}", voicebridge_wire::encode_value(&key)))
        .await;
    check_disconnected(&resp)?;
    if !resp.ok() {
        warn!(error_id = resp.error_id, "upstream rejected api key");
        session.set_state(ConnectionState::Unauthenticated).await;
        return Ok(());
    }
    session.set_state(ConnectionState::Authenticated).await;
    run_post_auth_handshake(session, registry).await
}

async fn handle_notify(session: &Arc<Session>, registry: &Arc<Mutex<Registry>>, record: &Record) {
    match record.event.as_deref() {
        Some("notifyconnectstatuschange") | Some("notifycurrentserverconnectionchanged") => {
            if let Some(sch) = record.get("schandlerid").and_then(|v| v.parse().ok()) {
                registry.lock().await.self_identity.schandlerid = Some(sch);
            }
            info!("server hop detected, re-syncing");
            let session = session.clone();
            let registry = registry.clone();
            tokio::spawn(async move {
                if let Err(e) = run_server_hop(&session, &registry).await {
                    warn!(error = %e, "server-hop resync failed");
                }
            });
        }
        _ => {
            let intents = registry.lock().await.handle_notification(record);
            dispatch_mutes(session, registry, intents);
        }
    }
}

/// Drives the reader loop for one connected socket until EOF, an I/O error,
/// or shutdown. Any pending request is resolved with the synthetic
/// disconnect response before returning (§4.3.1).
async fn run_reader_loop(
    session: &Arc<Session>,
    registry: &Arc<Mutex<Registry>>,
    read_half: tokio::net::tcp::OwnedReadHalf,
    shutdown: &mut watch::Receiver<bool>,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut buffer: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = lines.next_line() => {
                match next {
                    Ok(Some(raw)) => match classify_line(&raw) {
                        LineKind::Notify => {
                            let record = parse_line(&raw);
                            handle_notify(session, registry, &record).await;
                        }
                        LineKind::Keepalive => {
                            session.write_raw("\n").await;
                        }
                        LineKind::Terminator { id } => {
                            buffer.push(raw);
                            let collected = std::mem::take(&mut buffer);
                            if let Some(tx) = session.pending.lock().await.take() {
                                let _ = tx.send(Response { lines: collected, error_id: id });
                            }
                        }
                        LineKind::Payload => buffer.push(raw),
                    },
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
    session.complete_pending_with_disconnect().await;
}

/// The reconnect loop (§4.3). Runs until the shutdown signal fires.
pub async fn run(
    session: Arc<Session>,
    registry: Arc<Mutex<Registry>>,
    paths: Paths,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        session.set_state(ConnectionState::Connecting).await;
        match TcpStream::connect(UPSTREAM_ADDR).await {
            Ok(stream) => {
                info!("connected to upstream");
                let (read_half, write_half) = stream.into_split();
                *session.write_half.lock().await = Some(write_half);
                session.set_state(ConnectionState::Unauthenticated).await;

                if let Err(e) = authenticate_and_sync(&session, &registry, &paths).await {
                    debug!(error = %e, "handshake did not complete");
                } else {
                    run_reader_loop(&session, &registry, read_half, &mut shutdown).await;
                }
            }
            Err(e) => {
                debug!(error = %e, "upstream connect failed");
            }
        }

        registry.lock().await.clear_session();
        session.set_state(ConnectionState::Disconnected).await;
        *session.write_half.lock().await = None;

        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Writes a fresh API key to disk and, if currently connected, triggers a
/// fire-and-forget reauth (control socket `setkey`).
pub fn trigger_setkey(
    session: Arc<Session>,
    registry: Arc<Mutex<Registry>>,
    paths: Paths,
    key: String,
) -> std::io::Result<()> {
    if let Some(parent) = paths.api_key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&paths.api_key_path, &key)?;
    tokio::spawn(async move {
        if let Err(e) = authenticate_and_sync(&session, &registry, &paths).await {
            warn!(error = %e, "reauth after setkey failed");
        }
    });
    Ok(())
}
