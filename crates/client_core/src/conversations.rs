//! The conversation list view model.
//!
//! Aggregates conversations, friends, unread counters, and presence into one
//! sorted, de-duplicated collection, then keeps it live by folding pushes in
//! place instead of re-fetching everything.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Local, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, UserId},
    protocol::{ConversationRecord, MessagePayload, ServerPush, UserSummary},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    error::ClientError, presence::PresenceTracker, rest::RestClient, router::PushRouter,
    transport::Transport, RealtimeContext,
};

/// Optimistic unread increments drift under duplicate delivery; an
/// authoritative re-fetch this long after a push corrects them.
pub(crate) const UNREAD_RECONCILE_DELAY: std::time::Duration =
    std::time::Duration::from_millis(1500);
const CONVERSATION_PAGE_LIMIT: u32 = 50;
const UPDATE_CHANNEL_CAPACITY: usize = 64;
const AVATAR_GRADIENT_COUNT: usize = 6;

pub const NO_MESSAGE_PLACEHOLDER: &str = "No messages yet";
pub const DELETED_USER_NAME: &str = "Deleted user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvatarDescriptor {
    Image { url: String },
    GroupIcon,
    Initials { initials: String, gradient: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListUpdate {
    Loaded,
    Failed(String),
    Updated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    /// None for a friend who has no conversation yet.
    pub conversation_id: Option<ConversationId>,
    pub kind: ConversationKind,
    pub peer_id: Option<UserId>,
    pub participant_ids: Vec<UserId>,
    pub display_name: String,
    pub avatar: AvatarDescriptor,
    pub last_message_preview: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub time_label: Option<String>,
    pub unread_count: u32,
    pub peer_is_online: bool,
    pub(crate) sort_name: String,
}

enum Deferred {
    Message(MessagePayload),
    ReadReceipt(ConversationId),
    Presence(UserId, bool),
}

enum MessageOutcome {
    Applied,
    UnknownConversation,
}

#[derive(Clone, Copy)]
enum Source {
    Realtime,
    Rest,
}

struct ListInner {
    state: LoadState,
    entries: Vec<ConversationEntry>,
    load_epoch: u64,
    // Pushes that arrive while a load is in flight are replayed onto the
    // fresh entries instead of being clobbered by the load's result.
    deferred: Vec<Deferred>,
}

pub struct ConversationList {
    self_id: UserId,
    transport: Arc<Transport>,
    rest: Arc<RestClient>,
    presence: Arc<PresenceTracker>,
    inner: Mutex<ListInner>,
    changed: broadcast::Sender<ListUpdate>,
}

impl ConversationList {
    pub fn new(context: &RealtimeContext, self_id: UserId) -> Arc<Self> {
        let (changed, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            self_id,
            transport: Arc::clone(&context.transport),
            rest: Arc::clone(&context.rest),
            presence: Arc::clone(&context.presence),
            inner: Mutex::new(ListInner {
                state: LoadState::Empty,
                entries: Vec::new(),
                load_epoch: 0,
                deferred: Vec::new(),
            }),
            changed,
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ListUpdate> {
        self.changed.subscribe()
    }

    pub async fn state(&self) -> LoadState {
        self.inner.lock().await.state.clone()
    }

    pub async fn entries(&self) -> Vec<ConversationEntry> {
        self.inner.lock().await.entries.clone()
    }

    /// Run the full load pipeline. Also serves as the retry affordance after
    /// a failed load. Completions of superseded loads are discarded.
    pub async fn load(self: &Arc<Self>) {
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.state = LoadState::Loading;
            inner.load_epoch += 1;
            inner.load_epoch
        };

        let result = self.load_entries().await;

        let mut needs_reload = false;
        let mut needs_reconcile = false;
        let update = {
            let mut inner = self.inner.lock().await;
            if inner.load_epoch != epoch {
                info!("conversations: discarding stale load completion");
                return;
            }

            let update = match result {
                Ok(entries) => {
                    inner.entries = entries;
                    inner.state = LoadState::Ready;
                    ListUpdate::Loaded
                }
                Err(err) => {
                    let message = err.to_string();
                    error!("conversations: load failed: {message}");
                    inner.state = LoadState::Error(message.clone());
                    ListUpdate::Failed(message)
                }
            };

            let deferred = std::mem::take(&mut inner.deferred);
            for delta in deferred {
                match delta {
                    Deferred::Message(message) => {
                        if message.sender_id != self.self_id {
                            needs_reconcile = true;
                        }
                        if matches!(
                            apply_message_locked(&mut inner, self.self_id, &message),
                            MessageOutcome::UnknownConversation
                        ) {
                            needs_reload = true;
                        }
                    }
                    Deferred::ReadReceipt(conversation_id) => {
                        apply_read_locked(&mut inner, conversation_id);
                    }
                    Deferred::Presence(user_id, is_online) => {
                        apply_presence_locked(&mut inner, user_id, is_online);
                    }
                }
            }
            sort_entries(&mut inner.entries);
            update
        };

        let loaded = matches!(update, ListUpdate::Loaded);
        let _ = self.changed.send(update);
        if needs_reconcile {
            self.spawn_unread_reconcile();
        }
        if needs_reload && loaded {
            self.spawn_reload();
        }
    }

    /// Fold a `new_message` push in place: refresh the preview, bump the
    /// unread counter for foreign senders, move the entry to the front, and
    /// schedule the authoritative unread re-fetch. A push for a conversation
    /// we do not know yet triggers a full reload.
    pub async fn apply_new_message(self: &Arc<Self>, message: MessagePayload) {
        let foreign_sender = message.sender_id != self.self_id;
        let conversation_id = message.conversation_id;
        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.state == LoadState::Loading {
                inner.deferred.push(Deferred::Message(message));
                return;
            }
            apply_message_locked(&mut inner, self.self_id, &message)
        };

        match outcome {
            MessageOutcome::Applied => {
                if foreign_sender {
                    self.spawn_unread_reconcile();
                }
                let _ = self.changed.send(ListUpdate::Updated);
            }
            MessageOutcome::UnknownConversation => {
                info!(
                    conversation_id = conversation_id.0,
                    "conversations: push for unknown conversation, reloading"
                );
                self.spawn_reload();
            }
        }
    }

    /// Zero the unread counter of a conversation named by a read receipt.
    /// Idempotent: replayed receipts leave the state unchanged.
    pub async fn apply_read_receipt(&self, conversation_id: ConversationId) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.state == LoadState::Loading {
                inner.deferred.push(Deferred::ReadReceipt(conversation_id));
                return;
            }
            apply_read_locked(&mut inner, conversation_id)
        };
        if changed {
            let _ = self.changed.send(ListUpdate::Updated);
        }
    }

    /// Update the online flag of every entry whose peer matches. Presence
    /// does not participate in the sort order, so no resort.
    pub async fn apply_presence(&self, user_id: UserId, is_online: bool) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.state == LoadState::Loading {
                inner.deferred.push(Deferred::Presence(user_id, is_online));
                return;
            }
            apply_presence_locked(&mut inner, user_id, is_online)
        };
        if changed {
            let _ = self.changed.send(ListUpdate::Updated);
        }
    }

    pub fn spawn_push_listener(self: &Arc<Self>, router: &PushRouter) -> JoinHandle<()> {
        let mut events = router.subscribe();
        let list = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerPush::NewMessage { message }) => {
                        list.apply_new_message(message).await;
                    }
                    Ok(ServerPush::MessagesRead {
                        conversation_id, ..
                    }) => {
                        list.apply_read_receipt(conversation_id).await;
                    }
                    Ok(ServerPush::UserStatusChanged { user_id, is_online }) => {
                        list.apply_presence(user_id, is_online).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "conversations: push stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        let message = self.transport.send_message(conversation_id, content).await?;
        self.apply_new_message(message.clone()).await;
        Ok(message)
    }

    /// First message to a friend who has no conversation yet: create (or
    /// get) the private conversation, bind the placeholder entry to it, then
    /// send.
    pub async fn send_message_to_friend(
        self: &Arc<Self>,
        peer_id: UserId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        let conversation = self.transport.create_private_conversation(peer_id).await?;
        {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner
                .entries
                .iter_mut()
                .find(|entry| entry.conversation_id.is_none() && entry.peer_id == Some(peer_id))
            {
                entry.conversation_id = Some(conversation.conversation_id);
            }
        }
        self.send_message(conversation.conversation_id, content).await
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        if self.transport.is_connected() {
            self.transport.mark_conversation_read(conversation_id).await?;
        } else {
            self.rest.mark_conversation_read(conversation_id).await?;
        }
        self.apply_read_receipt(conversation_id).await;
        Ok(())
    }

    pub async fn messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        self.rest
            .conversation_messages(conversation_id, page, limit)
            .await
    }

    fn spawn_reload(self: &Arc<Self>) {
        let list = Arc::clone(self);
        tokio::spawn(async move { list.load().await });
    }

    fn spawn_unread_reconcile(self: &Arc<Self>) {
        let list = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(UNREAD_RECONCILE_DELAY).await;
            list.reconcile_unread().await;
        });
    }

    pub(crate) async fn reconcile_unread(&self) {
        if !self.transport.is_connected() {
            return;
        }
        let counts = match self.transport.unread_counts().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!("conversations: authoritative unread re-fetch failed: {err}");
                return;
            }
        };

        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.state == LoadState::Loading {
                return;
            }
            let mut changed = false;
            for count in counts {
                let entry = inner
                    .entries
                    .iter_mut()
                    .find(|entry| entry.conversation_id == Some(count.conversation_id));
                if let Some(entry) = entry {
                    if entry.unread_count != count.count {
                        entry.unread_count = count.count;
                        changed = true;
                    }
                }
            }
            if changed {
                sort_entries(&mut inner.entries);
            }
            changed
        };
        if changed {
            let _ = self.changed.send(ListUpdate::Updated);
        }
    }

    async fn load_entries(&self) -> Result<Vec<ConversationEntry>, ClientError> {
        if self.transport.is_connected() {
            match self.load_entries_from(Source::Realtime).await {
                Ok(entries) => return Ok(entries),
                Err(err) => {
                    warn!("conversations: realtime load failed, retrying over rest: {err}");
                }
            }
        }
        self.load_entries_from(Source::Rest).await
    }

    /// One load, one source: realtime and REST results are never mixed
    /// within a single load.
    async fn load_entries_from(
        &self,
        source: Source,
    ) -> Result<Vec<ConversationEntry>, ClientError> {
        let conversations = match source {
            Source::Realtime => self.transport.list_conversations().await?,
            Source::Rest => {
                self.rest
                    .list_conversations(1, CONVERSATION_PAGE_LIMIT)
                    .await?
            }
        };
        let unread_counts = match source {
            Source::Realtime => self.transport.unread_counts().await?,
            Source::Rest => self.rest.unread_counts().await?,
        };
        let unread: HashMap<ConversationId, u32> = unread_counts
            .into_iter()
            .map(|count| (count.conversation_id, count.count))
            .collect();

        let friends = self.rest.list_friends().await?;
        let mut directory: HashMap<UserId, UserSummary> = friends
            .iter()
            .map(|friend| (friend.user_id, friend.clone()))
            .collect();

        let unknown: Vec<UserId> = conversations
            .iter()
            .flat_map(|record| record.participant_ids.iter().copied())
            .filter(|id| *id != self.self_id && !directory.contains_key(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for user_id in unknown {
            match self.rest.user(user_id).await {
                Ok(user) => {
                    directory.insert(user_id, user);
                }
                Err(ClientError::NotFound(_)) => {
                    info!(
                        user_id = user_id.0,
                        "conversations: participant deleted, using sentinel"
                    );
                    directory.insert(user_id, deleted_user(user_id));
                }
                Err(err) => {
                    warn!(
                        user_id = user_id.0,
                        "conversations: participant lookup failed: {err}"
                    );
                    directory.insert(user_id, deleted_user(user_id));
                }
            }
        }

        let all_peers: Vec<UserId> = directory.keys().copied().collect();
        let presence = if self.transport.is_connected() {
            self.presence.refresh(&all_peers).await
        } else {
            HashMap::new()
        };

        let now = Utc::now();
        let mut entries = Vec::with_capacity(conversations.len() + friends.len());
        let mut seen_peers = HashSet::new();
        for record in &conversations {
            let entry = project_conversation(
                record,
                self.self_id,
                &directory,
                &presence,
                unread
                    .get(&record.conversation_id)
                    .copied()
                    .unwrap_or_default(),
                now,
            );
            if let Some(peer_id) = entry.peer_id {
                seen_peers.insert(peer_id);
            }
            entries.push(entry);
        }
        for friend in &friends {
            if seen_peers.contains(&friend.user_id) {
                continue;
            }
            entries.push(placeholder_entry(friend, &presence));
        }
        Ok(entries)
    }
}

fn apply_message_locked(
    inner: &mut ListInner,
    self_id: UserId,
    message: &MessagePayload,
) -> MessageOutcome {
    let Some(entry) = inner
        .entries
        .iter_mut()
        .find(|entry| entry.conversation_id == Some(message.conversation_id))
    else {
        return MessageOutcome::UnknownConversation;
    };

    entry.last_message_preview = message.content.clone();
    entry.last_message_at = Some(message.sent_at);
    entry.time_label = Some(relative_time_label(message.sent_at, Utc::now()));
    if message.sender_id != self_id {
        entry.unread_count += 1;
    }
    sort_entries(&mut inner.entries);
    MessageOutcome::Applied
}

fn apply_read_locked(inner: &mut ListInner, conversation_id: ConversationId) -> bool {
    let Some(entry) = inner
        .entries
        .iter_mut()
        .find(|entry| entry.conversation_id == Some(conversation_id))
    else {
        return false;
    };
    if entry.unread_count == 0 {
        return false;
    }
    entry.unread_count = 0;
    sort_entries(&mut inner.entries);
    true
}

fn apply_presence_locked(inner: &mut ListInner, user_id: UserId, is_online: bool) -> bool {
    let mut changed = false;
    for entry in inner
        .entries
        .iter_mut()
        .filter(|entry| entry.peer_id == Some(user_id))
    {
        if entry.peer_is_online != is_online {
            entry.peer_is_online = is_online;
            changed = true;
        }
    }
    changed
}

/// Unread-first, then recency, then last-name fallback for entries that
/// never had a message. Stable, so equal keys keep their arrival order.
pub(crate) fn sort_entries(entries: &mut [ConversationEntry]) {
    entries.sort_by(|a, b| {
        b.unread_count
            .cmp(&a.unread_count)
            .then_with(|| b.last_message_at.cmp(&a.last_message_at))
            .then_with(|| a.sort_name.cmp(&b.sort_name))
    });
}

pub(crate) fn relative_time_label(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(at);
    if age < Duration::hours(1) {
        "Now".to_string()
    } else if age < Duration::hours(24) {
        at.with_timezone(&Local).format("%H:%M").to_string()
    } else if age < Duration::days(7) {
        at.with_timezone(&Local).format("%A").to_string()
    } else {
        at.with_timezone(&Local).format("%-d %B").to_string()
    }
}

pub(crate) fn gradient_index(id: i64) -> usize {
    (id.unsigned_abs() % AVATAR_GRADIENT_COUNT as u64) as usize
}

fn initials_of(first_name: &str, last_name: &str) -> String {
    let mut initials: String = first_name.chars().take(1).collect();
    initials.extend(last_name.chars().take(1));
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials.to_uppercase()
    }
}

fn display_name_of(user: &UserSummary) -> String {
    format!("{} {}", user.first_name, user.last_name)
        .trim()
        .to_string()
}

fn deleted_user(user_id: UserId) -> UserSummary {
    UserSummary {
        user_id,
        first_name: DELETED_USER_NAME.to_string(),
        last_name: String::new(),
        avatar_url: None,
    }
}

fn project_conversation(
    record: &ConversationRecord,
    self_id: UserId,
    directory: &HashMap<UserId, UserSummary>,
    presence: &HashMap<UserId, bool>,
    unread_count: u32,
    now: DateTime<Utc>,
) -> ConversationEntry {
    let peer_id = match record.kind {
        ConversationKind::Private => record
            .participant_ids
            .iter()
            .copied()
            .find(|id| *id != self_id),
        ConversationKind::Group => None,
    };
    let peer = peer_id.and_then(|id| directory.get(&id));

    let display_name = match record.kind {
        ConversationKind::Private => peer
            .map(display_name_of)
            .unwrap_or_else(|| DELETED_USER_NAME.to_string()),
        ConversationKind::Group => record
            .title
            .clone()
            .unwrap_or_else(|| "Group conversation".to_string()),
    };

    let avatar = if let Some(url) = &record.image_url {
        AvatarDescriptor::Image { url: url.clone() }
    } else if record.kind == ConversationKind::Group {
        AvatarDescriptor::GroupIcon
    } else if let Some(url) = peer.and_then(|user| user.avatar_url.clone()) {
        AvatarDescriptor::Image { url }
    } else {
        let (first, last) = peer
            .map(|user| (user.first_name.as_str(), user.last_name.as_str()))
            .unwrap_or((DELETED_USER_NAME, ""));
        AvatarDescriptor::Initials {
            initials: initials_of(first, last),
            gradient: gradient_index(record.conversation_id.0),
        }
    };

    let last_message_preview = record
        .last_message
        .as_ref()
        .map(|message| message.content.clone())
        .unwrap_or_else(|| NO_MESSAGE_PLACEHOLDER.to_string());
    let last_message_at = record.last_message.as_ref().map(|message| message.sent_at);
    let time_label = last_message_at.map(|at| relative_time_label(at, now));

    let sort_name = match (record.kind, peer) {
        (ConversationKind::Private, Some(peer)) => {
            format!("{} {}", peer.last_name, peer.first_name)
                .trim()
                .to_lowercase()
        }
        _ => display_name.to_lowercase(),
    };

    let peer_is_online = peer_id
        .map(|id| presence.get(&id).copied().unwrap_or(false))
        .unwrap_or(false);

    ConversationEntry {
        conversation_id: Some(record.conversation_id),
        kind: record.kind,
        peer_id,
        participant_ids: record.participant_ids.clone(),
        display_name,
        avatar,
        last_message_preview,
        last_message_at,
        time_label,
        unread_count,
        peer_is_online,
        sort_name,
    }
}

fn placeholder_entry(friend: &UserSummary, presence: &HashMap<UserId, bool>) -> ConversationEntry {
    let avatar = match &friend.avatar_url {
        Some(url) => AvatarDescriptor::Image { url: url.clone() },
        None => AvatarDescriptor::Initials {
            initials: initials_of(&friend.first_name, &friend.last_name),
            gradient: gradient_index(friend.user_id.0),
        },
    };
    ConversationEntry {
        conversation_id: None,
        kind: ConversationKind::Private,
        peer_id: Some(friend.user_id),
        participant_ids: vec![friend.user_id],
        display_name: display_name_of(friend),
        avatar,
        last_message_preview: NO_MESSAGE_PLACEHOLDER.to_string(),
        last_message_at: None,
        time_label: None,
        unread_count: 0,
        peer_is_online: presence.get(&friend.user_id).copied().unwrap_or(false),
        sort_name: format!("{} {}", friend.last_name, friend.first_name)
            .trim()
            .to_lowercase(),
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
