//! In-process mock of the realtime server: the REST read routes plus a
//! `/ws` route speaking the duplex protocol, with per-test failure switches
//! and push injection.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CallFrame, CallResult, ClientCall, ConversationRecord, MessagePayload, ServerFrame,
        ServerPush, UnreadCount, UserStatus, UserSummary,
    },
};
use tokio::sync::{broadcast, RwLock};

use crate::{
    auth::{SessionTokenStore, TokenStore},
    ClientConfig, RealtimeContext,
};

pub(crate) const SELF_USER: UserId = UserId(1);

pub(crate) struct MockState {
    pub conversations: RwLock<Vec<ConversationRecord>>,
    pub unread: RwLock<Vec<UnreadCount>>,
    pub friends: RwLock<Vec<UserSummary>>,
    pub users: RwLock<HashMap<i64, UserSummary>>,
    pub statuses: RwLock<HashMap<i64, bool>>,
    pub messages: RwLock<HashMap<i64, Vec<MessagePayload>>>,
    /// Duplex calls that get a failure ack.
    pub fail_calls: RwLock<HashSet<&'static str>>,
    /// Duplex calls that never get an ack.
    pub drop_calls: RwLock<HashSet<&'static str>>,
    /// REST routes ("friends", "conversations", "unread") that return 500.
    pub fail_rest: RwLock<HashSet<&'static str>>,
    pub join_count: AtomicU32,
    pub rest_conversation_hits: AtomicU32,
    pub last_authorization: RwLock<Option<String>>,
    next_message_id: AtomicI64,
    next_conversation_id: AtomicI64,
    pushes: broadcast::Sender<ServerPush>,
    raw_frames: broadcast::Sender<String>,
}

impl MockState {
    fn new() -> Self {
        let (pushes, _) = broadcast::channel(64);
        let (raw_frames, _) = broadcast::channel(64);
        Self {
            conversations: RwLock::new(Vec::new()),
            unread: RwLock::new(Vec::new()),
            friends: RwLock::new(Vec::new()),
            users: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            fail_calls: RwLock::new(HashSet::new()),
            drop_calls: RwLock::new(HashSet::new()),
            fail_rest: RwLock::new(HashSet::new()),
            join_count: AtomicU32::new(0),
            rest_conversation_hits: AtomicU32::new(0),
            last_authorization: RwLock::new(None),
            next_message_id: AtomicI64::new(1000),
            next_conversation_id: AtomicI64::new(500),
            pushes,
            raw_frames,
        }
    }
}

pub(crate) struct MockServer {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub(crate) async fn spawn() -> Self {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let state = Arc::new(MockState::new());
        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/users/me/friends", get(list_friends))
            .route("/users/:id", get(get_user))
            .route("/conversations", get(list_conversations))
            .route("/conversations/unread-counts", get(unread_counts))
            .route("/conversations/:id/messages", get(conversation_messages))
            .route("/conversations/:id/read", post(mark_read))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub(crate) fn push(&self, event: ServerPush) {
        let _ = self.state.pushes.send(event);
    }

    pub(crate) fn push_raw(&self, frame: impl Into<String>) {
        let _ = self.state.raw_frames.send(frame.into());
    }
}

pub(crate) fn context_for(server: &MockServer) -> Arc<RealtimeContext> {
    let tokens: Arc<dyn TokenStore> = Arc::new(SessionTokenStore::default());
    tokens.store("test-token");
    RealtimeContext::new(
        ClientConfig {
            server_url: server.url.clone(),
        },
        tokens,
    )
}

/// Poll an async condition until it holds, panicking after `deadline`.
pub(crate) async fn wait_until<F, Fut>(deadline: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if condition().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("condition not met within {deadline:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub(crate) fn friend(id: i64, first_name: &str, last_name: &str) -> UserSummary {
    UserSummary {
        user_id: UserId(id),
        first_name: first_name.to_string(),
        last_name: last_name.to_string(),
        avatar_url: None,
    }
}

pub(crate) fn message(
    id: i64,
    conversation_id: i64,
    sender_id: i64,
    content: &str,
    minutes_ago: i64,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        content: content.to_string(),
        sent_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
        is_read: false,
    }
}

pub(crate) fn private_conversation(
    id: i64,
    peer_id: i64,
    last_message: Option<MessagePayload>,
) -> ConversationRecord {
    ConversationRecord {
        conversation_id: ConversationId(id),
        kind: ConversationKind::Private,
        participant_ids: vec![SELF_USER, UserId(peer_id)],
        title: None,
        image_url: None,
        event_id: None,
        last_message,
    }
}

fn call_name(call: &ClientCall) -> &'static str {
    match call {
        ClientCall::JoinUserRoom { .. } => "join_user_room",
        ClientCall::CreatePrivateConversation { .. } => "create_private_conversation",
        ClientCall::CreateEventConversation { .. } => "create_event_conversation",
        ClientCall::SendMessage { .. } => "send_message",
        ClientCall::GetConversation { .. } => "get_conversation",
        ClientCall::ListConversations => "list_conversations",
        ClientCall::MarkConversationRead { .. } => "mark_conversation_read",
        ClientCall::GetUnreadCounts => "get_unread_counts",
        ClientCall::GetTotalUnreadCount => "get_total_unread_count",
        ClientCall::GetUsersStatus { .. } => "get_users_status",
    }
}

async fn ws_handler(
    State(state): State<Arc<MockState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<MockState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<String>(64);

    let write_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let push_tx = outbound_tx.clone();
    let mut pushes = state.pushes.subscribe();
    let push_task = tokio::spawn(async move {
        while let Ok(push) = pushes.recv().await {
            let frame =
                serde_json::to_string(&ServerFrame::Event(push)).expect("serialize push");
            if push_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let raw_tx = outbound_tx.clone();
    let mut raw_frames = state.raw_frames.subscribe();
    let raw_task = tokio::spawn(async move {
        while let Ok(raw) = raw_frames.recv().await {
            if raw_tx.send(raw).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        if let WsMessage::Text(text) = message {
            let Ok(frame) = serde_json::from_str::<CallFrame>(&text) else {
                continue;
            };
            let Some(result) = answer_call(&state, frame).await else {
                continue;
            };
            let reply = serde_json::to_string(&ServerFrame::CallResult(result))
                .expect("serialize call result");
            if outbound_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    write_task.abort();
    push_task.abort();
    raw_task.abort();
}

async fn answer_call(state: &MockState, frame: CallFrame) -> Option<CallResult> {
    let name = call_name(&frame.call);
    if state.drop_calls.read().await.contains(name) {
        return None;
    }
    if state.fail_calls.read().await.contains(name) {
        return Some(CallResult::rejected(frame.id, format!("{name} failed")));
    }

    let result = match frame.call {
        ClientCall::JoinUserRoom { .. } => {
            state.join_count.fetch_add(1, Ordering::SeqCst);
            CallResult::ok(frame.id, serde_json::Value::Null)
        }
        ClientCall::ListConversations => {
            CallResult::ok(frame.id, &*state.conversations.read().await)
        }
        ClientCall::GetUnreadCounts => CallResult::ok(frame.id, &*state.unread.read().await),
        ClientCall::GetTotalUnreadCount => {
            let total: u32 = state.unread.read().await.iter().map(|count| count.count).sum();
            CallResult::ok(frame.id, total)
        }
        ClientCall::GetUsersStatus { user_ids } => {
            let statuses = state.statuses.read().await;
            let result: Vec<UserStatus> = user_ids
                .iter()
                .map(|id| UserStatus {
                    user_id: *id,
                    is_online: statuses.get(&id.0).copied().unwrap_or(false),
                })
                .collect();
            CallResult::ok(frame.id, result)
        }
        ClientCall::SendMessage {
            conversation_id,
            content,
        } => {
            let message = MessagePayload {
                message_id: MessageId(state.next_message_id.fetch_add(1, Ordering::SeqCst)),
                conversation_id,
                sender_id: SELF_USER,
                content,
                sent_at: Utc::now(),
                is_read: false,
            };
            state
                .messages
                .write()
                .await
                .entry(conversation_id.0)
                .or_default()
                .push(message.clone());
            CallResult::ok(frame.id, message)
        }
        ClientCall::CreatePrivateConversation { peer_id } => {
            let mut conversations = state.conversations.write().await;
            let existing = conversations
                .iter()
                .find(|record| {
                    record.kind == ConversationKind::Private
                        && record.participant_ids.contains(&peer_id)
                })
                .cloned();
            let record = match existing {
                Some(record) => record,
                None => {
                    let record = ConversationRecord {
                        conversation_id: ConversationId(
                            state.next_conversation_id.fetch_add(1, Ordering::SeqCst),
                        ),
                        kind: ConversationKind::Private,
                        participant_ids: vec![SELF_USER, peer_id],
                        title: None,
                        image_url: None,
                        event_id: None,
                        last_message: None,
                    };
                    conversations.push(record.clone());
                    record
                }
            };
            CallResult::ok(frame.id, record)
        }
        ClientCall::CreateEventConversation { event_id } => {
            let record = ConversationRecord {
                conversation_id: ConversationId(
                    state.next_conversation_id.fetch_add(1, Ordering::SeqCst),
                ),
                kind: ConversationKind::Group,
                participant_ids: vec![SELF_USER],
                title: Some(format!("Event {}", event_id.0)),
                image_url: None,
                event_id: Some(event_id),
                last_message: None,
            };
            state.conversations.write().await.push(record.clone());
            CallResult::ok(frame.id, record)
        }
        ClientCall::GetConversation { conversation_id } => {
            let conversations = state.conversations.read().await;
            match conversations
                .iter()
                .find(|record| record.conversation_id == conversation_id)
            {
                Some(record) => CallResult::ok(frame.id, record),
                None => CallResult::rejected(frame.id, "conversation not found"),
            }
        }
        ClientCall::MarkConversationRead { conversation_id } => {
            let mut unread = state.unread.write().await;
            for count in unread.iter_mut() {
                if count.conversation_id == conversation_id {
                    count.count = 0;
                }
            }
            CallResult::ok(frame.id, serde_json::Value::Null)
        }
    };
    Some(result)
}

fn rest_failure(what: &str) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(
            ErrorCode::Internal,
            format!("{what} backend unavailable"),
        )),
    )
        .into_response()
}

async fn record_auth(state: &MockState, headers: &HeaderMap) {
    let value = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    *state.last_authorization.write().await = value;
}

async fn list_friends(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    record_auth(&state, &headers).await;
    if state.fail_rest.read().await.contains("friends") {
        return rest_failure("friends");
    }
    Json(state.friends.read().await.clone()).into_response()
}

async fn get_user(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    record_auth(&state, &headers).await;
    match state.users.read().await.get(&id) {
        Some(user) => Json(user.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_conversations(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    record_auth(&state, &headers).await;
    state.rest_conversation_hits.fetch_add(1, Ordering::SeqCst);
    if state.fail_rest.read().await.contains("conversations") {
        return rest_failure("conversations");
    }
    Json(state.conversations.read().await.clone()).into_response()
}

async fn unread_counts(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if state.fail_rest.read().await.contains("unread") {
        return rest_failure("unread");
    }
    Json(state.unread.read().await.clone()).into_response()
}

async fn conversation_messages(
    State(state): State<Arc<MockState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let known = state
        .conversations
        .read()
        .await
        .iter()
        .any(|record| record.conversation_id.0 == id);
    if !known {
        return StatusCode::NOT_FOUND.into_response();
    }
    let messages = state.messages.read().await.get(&id).cloned().unwrap_or_default();
    Json(messages).into_response()
}

async fn mark_read(State(state): State<Arc<MockState>>, Path(id): Path<i64>) -> StatusCode {
    let mut unread = state.unread.write().await;
    for count in unread.iter_mut() {
        if count.conversation_id.0 == id {
            count.count = 0;
        }
    }
    StatusCode::NO_CONTENT
}
