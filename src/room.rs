//! The Room State Machine: a single-writer actor owning one room's peer
//! registry, alias bindings, pending deliveries and resume ledger.
//!
//! Each room runs as its own `tokio::spawn`ed task consuming a command
//! channel; all of a room's state is only ever touched from inside that
//! task, so there is no locking within a room. Multiple rooms run
//! concurrently, each serialized internally — the single-writer discipline
//! the rest of this service leans on.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{ErrorCode, PeerSummary, ServerMessage};
use crate::store::{
    normalize_alias, AliasTable, DeliveryStore, Peer, PeerId, PendingDelivery, ResumeRecord,
    ResumeStore, UserId,
};
use crate::token::Claims;

pub const RESUME_TTL_MS: i64 = 30_000;
pub const RETRY_INTERVAL_MS: i64 = 1_500;
pub const MAX_ATTEMPTS: u32 = 12;
pub const MAX_DELIVERY_AGE_MS: i64 = 90_000;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_peer_id() -> PeerId {
    Uuid::new_v4().to_string()
}

fn new_resume_token() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// A frame headed for one peer's socket, transport-agnostic so the room
/// actor never needs to know it's talking to an axum `WebSocket`.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

pub type SocketSender = mpsc::UnboundedSender<OutboundFrame>;

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum RoomError {
    #[error("room actor is no longer available")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct AttachedInfo {
    pub peer_id: PeerId,
    pub generation: u64,
}

/// Point-in-time counts for `/internal/rooms` introspection.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub peer_count: usize,
    pub connected_count: usize,
    pub pending_count: usize,
    pub resume_count: usize,
}

enum Command {
    AttachSocket {
        claims: Claims,
        requested_resume_token: Option<String>,
        socket_tx: SocketSender,
        reply: oneshot::Sender<AttachedInfo>,
    },
    HandleMessage {
        peer_id: PeerId,
        msg: crate::protocol::ClientMessage,
    },
    HandleDepart {
        peer_id: PeerId,
        generation: u64,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// A cheaply-cloneable handle to a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::Sender<Command>,
}

impl RoomHandle {
    pub fn spawn(room_id: String) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let actor = Room::new(room_id, rx);
        tokio::spawn(actor.run());
        RoomHandle { tx }
    }

    pub async fn attach_socket(
        &self,
        claims: Claims,
        requested_resume_token: Option<String>,
        socket_tx: SocketSender,
    ) -> Result<AttachedInfo, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AttachSocket {
                claims,
                requested_resume_token,
                socket_tx,
                reply,
            })
            .await
            .map_err(|_| RoomError::Unavailable)?;
        rx.await.map_err(|_| RoomError::Unavailable)
    }

    pub async fn handle_message(&self, peer_id: PeerId, msg: crate::protocol::ClientMessage) {
        let _ = self.tx.send(Command::HandleMessage { peer_id, msg }).await;
    }

    pub async fn handle_depart(&self, peer_id: PeerId, generation: u64) {
        let _ = self
            .tx
            .send(Command::HandleDepart { peer_id, generation })
            .await;
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| RoomError::Unavailable)?;
        rx.await.map_err(|_| RoomError::Unavailable)
    }
}

struct Room {
    room_id: String,
    rx: mpsc::Receiver<Command>,
    peers: HashMap<PeerId, Peer>,
    aliases: AliasTable,
    pending: DeliveryStore,
    resumes: ResumeStore,
    sockets: HashMap<PeerId, SocketSender>,
    next_wake_ms: Option<i64>,
}

impl Room {
    fn new(room_id: String, rx: mpsc::Receiver<Command>) -> Self {
        Room {
            room_id,
            rx,
            peers: HashMap::new(),
            aliases: AliasTable::default(),
            pending: DeliveryStore::default(),
            resumes: ResumeStore::default(),
            sockets: HashMap::new(),
            next_wake_ms: None,
        }
    }

    async fn run(mut self) {
        loop {
            let now = now_ms();
            let sleep_dur = self
                .next_wake_ms
                .map(|target| Duration::from_millis((target - now).max(0) as u64));

            let tick_fut = async {
                match sleep_dur {
                    Some(d) => tokio::time::sleep(d).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::debug!(room = %self.room_id, "room actor channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = tick_fut => {
                    self.tick(now_ms());
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AttachSocket {
                claims,
                requested_resume_token,
                socket_tx,
                reply,
            } => {
                let info = self.attach_socket(claims, requested_resume_token, socket_tx);
                let _ = reply.send(info);
            }
            Command::HandleMessage { peer_id, msg } => self.handle_message(peer_id, msg),
            Command::HandleDepart { peer_id, generation } => {
                self.handle_depart(peer_id, generation)
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            peer_count: self.peers.len(),
            connected_count: self.peers.values().filter(|p| p.connected).count(),
            pending_count: self.pending.len(),
            resume_count: self.resumes.len(),
        }
    }

    fn arm(&mut self, target_ms: i64) {
        self.next_wake_ms = Some(match self.next_wake_ms {
            Some(cur) => cur.min(target_ms),
            None => target_ms,
        });
    }

    fn send_to(&self, peer_id: &str, msg: &ServerMessage) {
        if let Some(tx) = self.sockets.get(peer_id) {
            let _ = tx.send(OutboundFrame::Text(msg.to_json()));
        }
    }

    fn peer_summary(&self, peer: &Peer) -> PeerSummary {
        PeerSummary {
            peer_id: peer.peer_id.clone(),
            user_id: peer.user_id.clone(),
            room_id: peer.room_id.clone(),
            name: peer.alias.clone(),
        }
    }

    fn broadcast_except(&self, except: &str, msg: &ServerMessage) {
        for peer in self.peers.values() {
            if peer.connected && peer.peer_id != except {
                self.send_to(&peer.peer_id, msg);
            }
        }
    }

    // ---- 4.D.1 attachSocket ------------------------------------------------

    fn attach_socket(
        &mut self,
        claims: Claims,
        requested_resume_token: Option<String>,
        socket_tx: SocketSender,
    ) -> AttachedInfo {
        let now = now_ms();

        // A resume token is matched two ways: against a peer that is still
        // live in memory (covers reconnecting before the old socket's
        // departure has been processed — a half-closed previous socket),
        // and against the durable resume ledger (the detached-peer case).
        // Either way the token is the capability, not the peer's reported
        // connected state.
        let resumed_peer_id = requested_resume_token.as_deref().and_then(|token| {
            if let Some(peer) = self
                .peers
                .values()
                .find(|p| p.resume_token == token && p.user_id == claims.sub && p.room_id == claims.room)
            {
                let id = peer.peer_id.clone();
                self.resumes.remove(token);
                return Some(id);
            }

            let record = self.resumes.take(token)?;
            if record.user_id == claims.sub && record.room_id == claims.room {
                Some(record.peer_id)
            } else {
                // token didn't match this caller's identity: put it back,
                // it may still be legitimately consumable by its rightful owner.
                self.resumes.put(record).ok();
                None
            }
        });

        let (peer_id, was_already_connected) = match resumed_peer_id {
            Some(id) => {
                let was_connected = self.peers.get(&id).map(|p| p.connected).unwrap_or(false);
                (id, was_connected)
            }
            None => (new_peer_id(), false),
        };

        // Socket supersession: if a live socket for this peerId already exists,
        // close it with 1012 before accepting the new one.
        if let Some(old) = self.sockets.remove(&peer_id) {
            let _ = old.send(OutboundFrame::Close {
                code: 1012,
                reason: "superseded".to_string(),
            });
        }

        let resume_token = new_resume_token();
        let resume_expires_at = now + RESUME_TTL_MS;

        let peer = self.peers.entry(peer_id.clone()).or_insert_with(|| Peer {
            peer_id: peer_id.clone(),
            user_id: claims.sub.clone(),
            room_id: claims.room.clone(),
            alias: None,
            resume_token: resume_token.clone(),
            resume_expires_at,
            connected: true,
            last_seen_at: now,
            generation: 0,
        });

        peer.resume_token = resume_token.clone();
        peer.resume_expires_at = resume_expires_at;
        peer.connected = true;
        peer.last_seen_at = now;
        peer.generation += 1;
        let generation = peer.generation;
        let peer_alias_before = peer.alias.clone();

        self.sockets.insert(peer_id.clone(), socket_tx);

        // A conflicting alias claim on attach is kept advisory: it does not
        // evict the existing holder, just reports the conflict back to the
        // attaching socket.
        let mut alias_conflict: Option<String> = None;
        if let Some(name) = claims.name.as_ref() {
            match normalize_alias(name) {
                Some(normalized) => match self.aliases.holder(&normalized).cloned() {
                    Some(holder) if holder != peer_id => {
                        alias_conflict = Some(normalized);
                    }
                    _ => {
                        if let Some(prev) = peer_alias_before.as_ref() {
                            if prev != &normalized {
                                self.aliases.release(prev);
                            }
                        }
                        self.aliases.bind(normalized.clone(), peer_id.clone());
                        if let Some(peer) = self.peers.get_mut(&peer_id) {
                            peer.alias = Some(normalized);
                        }
                    }
                },
                None => alias_conflict = Some("ALIAS_INVALID".to_string()),
            }
        }

        let peers_snapshot: Vec<PeerSummary> = self
            .peers
            .values()
            .filter(|p| p.connected && p.peer_id != peer_id)
            .map(|p| self.peer_summary(p))
            .collect();

        let welcome = ServerMessage::SessionWelcome {
            peer_id: peer_id.clone(),
            user_id: claims.sub.clone(),
            room_id: claims.room.clone(),
            resume_token: resume_token.clone(),
            resume_expires_at,
            peers: peers_snapshot,
        };
        self.send_to(&peer_id, &welcome);

        if let Some(conflict) = alias_conflict {
            let code = if conflict == "ALIAS_INVALID" {
                ErrorCode::AliasInvalid
            } else {
                ErrorCode::AliasTaken
            };
            self.send_to(
                &peer_id,
                &ServerMessage::error(code, "alias unavailable", None),
            );
        }

        if !was_already_connected {
            if let Some(peer) = self.peers.get(&peer_id) {
                let summary = self.peer_summary(peer);
                self.broadcast_except(&peer_id, &ServerMessage::PresenceJoined { peer: summary });
            }
        }

        // Replay undelivered messages addressed to this peer.
        let replay: Vec<ServerMessage> = self
            .pending
            .for_recipient(&peer_id)
            .into_iter()
            .filter(|d| d.expires_at > now)
            .map(|d| ServerMessage::SignalMessage {
                delivery_id: d.delivery_id.clone(),
                from_peer_id: d.from_peer_id.clone(),
                from_user_id: d.from_user_id.clone(),
                to_peer_id: d.to_peer_id.clone(),
                payload: d.payload.clone(),
                sent_at: d.sent_at,
            })
            .collect();
        for msg in &replay {
            self.send_to(&peer_id, msg);
        }

        AttachedInfo { peer_id, generation }
    }

    // ---- 4.D.2 handleMessage ------------------------------------------------

    fn handle_message(&mut self, peer_id: PeerId, msg: crate::protocol::ClientMessage) {
        use crate::protocol::ClientMessage as C;

        let now = now_ms();
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.last_seen_at = now;

        match msg {
            C::HeartbeatPing { ts } => {
                self.send_to(&peer_id, &ServerMessage::HeartbeatPong { ts });
            }
            C::DiscoveryClaim { name, request_id } => {
                self.handle_discovery_claim(&peer_id, &name, request_id, now);
            }
            C::DiscoveryResolve { name, request_id } => {
                self.handle_discovery_resolve(&peer_id, &name, request_id);
            }
            C::SignalSend {
                to_peer_id,
                payload,
                delivery_id,
                request_id: _,
            } => {
                self.handle_signal_send(&peer_id, to_peer_id, payload, delivery_id, now);
            }
            C::SignalAck {
                delivery_id,
                to_peer_id,
                request_id: _,
            } => {
                self.handle_signal_ack(&peer_id, delivery_id, to_peer_id, now);
            }
        }
    }

    fn handle_discovery_claim(
        &mut self,
        peer_id: &str,
        name: &str,
        request_id: Option<String>,
        now: i64,
    ) {
        let Some(normalized) = normalize_alias(name) else {
            self.send_to(
                peer_id,
                &ServerMessage::error(ErrorCode::AliasInvalid, "invalid alias", request_id),
            );
            return;
        };

        if let Some(holder) = self.aliases.holder(&normalized) {
            if holder != peer_id {
                self.send_to(
                    peer_id,
                    &ServerMessage::error(ErrorCode::AliasTaken, "alias already claimed", request_id),
                );
                return;
            }
        }

        let prev_alias = self.peers.get(peer_id).and_then(|p| p.alias.clone());
        if let Some(prev) = prev_alias.as_ref() {
            if prev != &normalized {
                self.aliases.release(prev);
            }
        }
        self.aliases.bind(normalized.clone(), peer_id.to_string());
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.alias = Some(normalized.clone());
        }

        let user_id = self
            .peers
            .get(peer_id)
            .map(|p| p.user_id.clone())
            .unwrap_or_default();

        self.send_to(
            peer_id,
            &ServerMessage::DiscoveryClaimed {
                name: normalized,
                user_id,
                request_id,
            },
        );

        let _ = now;
        if let Some(peer) = self.peers.get(peer_id) {
            let summary = self.peer_summary(peer);
            self.broadcast_except(peer_id, &ServerMessage::PresenceJoined { peer: summary });
        }
    }

    fn handle_discovery_resolve(&mut self, peer_id: &str, name: &str, request_id: Option<String>) {
        let normalized = normalize_alias(name).unwrap_or_else(|| name.to_lowercase());
        let resolved = self
            .aliases
            .holder(&normalized)
            .and_then(|pid| self.peers.get(pid))
            .filter(|p| p.connected);

        let (user_id, peers) = match resolved {
            Some(p) => (Some(p.user_id.clone()), vec![self.peer_summary(p)]),
            None => (None, vec![]),
        };

        self.send_to(
            peer_id,
            &ServerMessage::DiscoveryResolved {
                request_id,
                name: normalized,
                user_id,
                peers,
            },
        );
    }

    fn handle_signal_send(
        &mut self,
        peer_id: &str,
        to_peer_id: PeerId,
        payload: Value,
        delivery_id: Option<String>,
        now: i64,
    ) {
        if !self.peers.contains_key(&to_peer_id) {
            self.send_to(
                peer_id,
                &ServerMessage::error(ErrorCode::TargetNotFound, "unknown recipient", None),
            );
            return;
        }

        let delivery_id = delivery_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let from_user_id: UserId = self
            .peers
            .get(peer_id)
            .map(|p| p.user_id.clone())
            .unwrap_or_default();

        let delivery = PendingDelivery {
            delivery_id: delivery_id.clone(),
            from_peer_id: peer_id.to_string(),
            from_user_id: from_user_id.clone(),
            to_peer_id: to_peer_id.clone(),
            payload: payload.clone(),
            sent_at: now,
            attempts: 0,
            next_retry_at: now + RETRY_INTERVAL_MS,
            expires_at: now + MAX_DELIVERY_AGE_MS,
        };

        if self.pending.put(delivery).is_err() {
            self.send_to(
                peer_id,
                &ServerMessage::error(ErrorCode::Storage, "failed to persist delivery", None),
            );
            return;
        }

        self.send_to(
            &to_peer_id,
            &ServerMessage::SignalMessage {
                delivery_id: delivery_id.clone(),
                from_peer_id: peer_id.to_string(),
                from_user_id,
                to_peer_id: to_peer_id.clone(),
                payload,
                sent_at: now,
            },
        );

        self.send_to(
            peer_id,
            &ServerMessage::SignalAcked {
                delivery_id,
                by_peer_id: peer_id.to_string(),
                at: now,
            },
        );

        self.arm(now + RETRY_INTERVAL_MS);
    }

    fn handle_signal_ack(&mut self, peer_id: &str, delivery_id: String, to_peer_id: PeerId, now: i64) {
        let Some(_delivery) = self.pending.remove(peer_id, &delivery_id) else {
            return;
        };

        if self.peers.get(&to_peer_id).map(|p| p.connected).unwrap_or(false) {
            self.send_to(
                &to_peer_id,
                &ServerMessage::SignalAcked {
                    delivery_id,
                    by_peer_id: peer_id.to_string(),
                    at: now,
                },
            );
        }
    }

    // ---- 4.D.3 handleDepart --------------------------------------------------

    fn handle_depart(&mut self, peer_id: PeerId, generation: u64) {
        let now = now_ms();

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if peer.generation != generation {
            // stale depart from a socket that was already superseded
            return;
        }

        self.sockets.remove(&peer_id);

        if peer.connected {
            peer.connected = false;
            peer.last_seen_at = now;
            let record = ResumeRecord {
                token: peer.resume_token.clone(),
                peer_id: peer.peer_id.clone(),
                user_id: peer.user_id.clone(),
                room_id: peer.room_id.clone(),
                alias: peer.alias.clone(),
                expires_at: peer.resume_expires_at,
            };
            let resume_expires_at = peer.resume_expires_at;
            let user_id = peer.user_id.clone();
            let _ = self.resumes.put(record);
            self.arm(resume_expires_at);
            self.broadcast_except(&peer_id, &ServerMessage::PresenceLeft { peer_id: peer_id.clone(), user_id });
        }
    }

    // ---- 4.D.4 tick -----------------------------------------------------------

    fn tick(&mut self, now: i64) {
        let mut min_wake: Option<i64> = None;

        self.pending.retain(|d| d.expires_at > now);
        let mut to_redeliver: Vec<(PeerId, PendingDelivery)> = Vec::new();
        for delivery in self.pending.iter_mut() {
            if delivery.next_retry_at <= now {
                if delivery.attempts >= MAX_ATTEMPTS {
                    continue;
                }
                delivery.attempts += 1;
                delivery.next_retry_at = now + RETRY_INTERVAL_MS;
                to_redeliver.push((delivery.to_peer_id.clone(), delivery.clone()));
            }
            let item_min = delivery.next_retry_at.min(delivery.expires_at);
            min_wake = Some(min_wake.map_or(item_min, |m| m.min(item_min)));
        }
        self.pending.retain(|d| d.attempts < MAX_ATTEMPTS);

        for (to_peer_id, delivery) in to_redeliver {
            self.send_to(
                &to_peer_id,
                &ServerMessage::SignalMessage {
                    delivery_id: delivery.delivery_id,
                    from_peer_id: delivery.from_peer_id,
                    from_user_id: delivery.from_user_id,
                    to_peer_id: delivery.to_peer_id.clone(),
                    payload: delivery.payload,
                    sent_at: delivery.sent_at,
                },
            );
        }

        let expired_tokens: Vec<String> = self
            .resumes
            .iter()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.token.clone())
            .collect();
        for token in expired_tokens {
            if let Some(record) = self.resumes.remove(&token) {
                let should_gc = self
                    .peers
                    .get(&record.peer_id)
                    .map(|peer| !peer.connected && peer.resume_token == token)
                    .unwrap_or(false);
                if should_gc {
                    let alias = self.peers.get(&record.peer_id).and_then(|p| p.alias.clone());
                    if let Some(alias) = alias {
                        self.aliases.release(&alias);
                    }
                    self.pending.remove_all_for_recipient(&record.peer_id);
                    self.peers.remove(&record.peer_id);
                }
            }
        }
        for record in self.resumes.iter() {
            min_wake = Some(min_wake.map_or(record.expires_at, |m| m.min(record.expires_at)));
        }

        self.next_wake_ms = min_wake;
    }
}
