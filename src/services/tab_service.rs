use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::CoordConfig;
use crate::models::{InstanceId, TabMessage, TabMessageKind, TabPayload};
use crate::utils::PeriodicTask;

/// Callback invoked for every received message of a registered kind
pub type MessageHandler = Arc<dyn Fn(&TabMessage) + Send + Sync>;

/// Registration handle returned by `add_message_handler`, used to remove
/// the handler again (closures have no identity of their own in Rust).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Create the shared local broadcast handle for one browser/process.
/// Every tab coordinator of the same origin clones this sender.
pub fn local_channel(capacity: usize) -> broadcast::Sender<TabMessage> {
    broadcast::channel(capacity).0
}

struct TabState {
    visible: bool,
    focused: bool,
    current_document_id: Option<String>,
}

impl TabState {
    fn foreground(&self) -> bool {
        self.visible && self.focused
    }
}

struct CoordinatorInner {
    instance_id: InstanceId,
    channel: broadcast::Sender<TabMessage>,
    config: CoordConfig,
    handlers: RwLock<HashMap<TabMessageKind, HashMap<HandlerId, MessageHandler>>>,
    state: RwLock<TabState>,
    next_handler_id: AtomicU64,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    announce: Mutex<Option<PeriodicTask>>,
}

/// Same-device, cross-tab coordinator.
///
/// Lets the tabs of one browser stay aware of each other without a server
/// round trip: announces which document a tab is editing, rebroadcasts
/// optimistic local edits, and answers "give me your in-memory state" sync
/// requests from newly opened siblings. Deliberately local and ephemeral:
/// cross-device exclusion is the lease manager's job, not this one's.
///
/// Lifecycle is owned by the embedder: `start` opens the channel
/// subscription, `cleanup` announces departure and stops all tasks.
#[derive(Clone)]
pub struct TabBroadcastCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TabBroadcastCoordinator {
    /// Create a coordinator for one tab.
    ///
    /// A fresh tab counts as foregrounded until visibility/focus events say
    /// otherwise. No messages are received until `start` is called.
    pub fn new(
        channel: broadcast::Sender<TabMessage>,
        instance_id: InstanceId,
        config: CoordConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                instance_id,
                channel,
                config,
                handlers: RwLock::new(HashMap::new()),
                state: RwLock::new(TabState {
                    visible: true,
                    focused: true,
                    current_document_id: None,
                }),
                next_handler_id: AtomicU64::new(0),
                dispatch: Mutex::new(None),
                announce: Mutex::new(None),
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.inner.instance_id
    }

    pub async fn is_foreground(&self) -> bool {
        self.inner.state.read().await.foreground()
    }

    pub async fn current_document(&self) -> Option<String> {
        self.inner.state.read().await.current_document_id.clone()
    }

    /// Subscribe to the local channel and begin dispatching messages to
    /// registered handlers. Idempotent.
    pub async fn start(&self) {
        let mut slot = self.inner.dispatch.lock().await;
        if slot.is_some() {
            return;
        }
        let rx = self.inner.channel.subscribe();
        *slot = Some(tokio::spawn(dispatch_loop(Arc::downgrade(&self.inner), rx)));
        drop(slot);

        if self.inner.state.read().await.foreground() {
            self.start_announce().await;
        }
        info!("Tab coordinator {} started", self.inner.instance_id);
    }

    /// Record the locally active document and announce it to siblings.
    /// Local state always updates, whether or not anyone is listening.
    pub async fn set_active_document(&self, document_id: Option<String>) {
        {
            let mut state = self.inner.state.write().await;
            state.current_document_id = document_id.clone();
        }
        self.publish(TabPayload::TabActive, document_id);
    }

    /// Fire-and-forget announcement of an optimistic document change
    pub async fn broadcast_form_update(&self, document_id: &str, form: serde_json::Value) {
        self.publish(
            TabPayload::FormUpdate { form },
            Some(document_id.to_string()),
        );
    }

    /// Fire-and-forget announcement of an optimistic single-field change
    pub async fn broadcast_field_update(
        &self,
        document_id: &str,
        field_id: &str,
        field: serde_json::Value,
    ) {
        self.publish(
            TabPayload::FieldUpdate {
                field_id: field_id.to_string(),
                field,
            },
            Some(document_id.to_string()),
        );
    }

    /// Ask sibling tabs for their in-memory state of a document.
    ///
    /// Resolves with the first matching `FORM_SYNC_RESPONSE` payload, or
    /// `None` once the timeout passes. Concurrent calls for different
    /// documents are independent; calls for the same document are not
    /// deduplicated.
    pub async fn request_sync(&self, document_id: &str) -> Option<serde_json::Value> {
        // Subscribe before publishing so a fast responder cannot slip past.
        let mut rx = self.inner.channel.subscribe();
        self.publish(TabPayload::FormSyncRequest, Some(document_id.to_string()));

        let wait_for_response = async {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if msg.sender_instance_id == self.inner.instance_id {
                            continue;
                        }
                        if msg.document_id.as_deref() != Some(document_id) {
                            continue;
                        }
                        if let TabPayload::FormSyncResponse { state } = msg.payload {
                            return Some(state);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Sync wait lagged; {} message(s) dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match timeout(self.inner.config.sync_timeout(), wait_for_response).await {
            Ok(state) => state,
            Err(_) => {
                debug!("Sync request for document {} timed out", document_id);
                None
            }
        }
    }

    /// Answer a sibling's sync request with this tab's in-memory state.
    /// The embedder wires this to its `FORM_SYNC_REQUEST` handler.
    pub async fn respond_sync(&self, document_id: &str, state: serde_json::Value) {
        self.publish(
            TabPayload::FormSyncResponse { state },
            Some(document_id.to_string()),
        );
    }

    /// Register a handler for one message kind. Handlers never see messages
    /// sent by this same instance. Multiple handlers per kind coexist.
    pub async fn add_message_handler<F>(&self, kind: TabMessageKind, handler: F) -> HandlerId
    where
        F: Fn(&TabMessage) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(id, Arc::new(handler));
        id
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub async fn remove_message_handler(&self, kind: TabMessageKind, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.write().await;
        handlers
            .get_mut(&kind)
            .map(|set| set.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Page visibility change from the embedding layer
    pub async fn set_visibility(&self, visible: bool) {
        self.update_presence(|state| state.visible = visible).await;
    }

    /// Window focus change from the embedding layer
    pub async fn set_focus(&self, focused: bool) {
        self.update_presence(|state| state.focused = focused).await;
    }

    /// Announce departure and stop all background tasks. Called on tab
    /// unload; best-effort, as unload-time delivery is not guaranteed.
    pub async fn cleanup(&self) {
        let document_id = self.inner.state.read().await.current_document_id.clone();
        self.publish(TabPayload::TabInactive, document_id);

        if let Some(task) = self.inner.announce.lock().await.take() {
            task.stop();
        }
        if let Some(handle) = self.inner.dispatch.lock().await.take() {
            handle.abort();
        }
        info!("Tab coordinator {} cleaned up", self.inner.instance_id);
    }

    fn publish(&self, payload: TabPayload, document_id: Option<String>) {
        let msg = TabMessage::new(payload, document_id, self.inner.instance_id);
        // A send error just means no other tab is subscribed right now.
        if self.inner.channel.send(msg).is_err() {
            debug!("No sibling tabs listening on the local channel");
        }
    }

    async fn update_presence(&self, apply: impl FnOnce(&mut TabState)) {
        let (was_foreground, is_foreground, document_id) = {
            let mut state = self.inner.state.write().await;
            let was = state.foreground();
            apply(&mut state);
            (was, state.foreground(), state.current_document_id.clone())
        };

        if was_foreground == is_foreground {
            return;
        }
        if is_foreground {
            debug!("Tab {} moved to the foreground", self.inner.instance_id);
            self.publish(TabPayload::TabActive, document_id);
            self.start_announce().await;
        } else {
            debug!("Tab {} moved to the background", self.inner.instance_id);
            self.publish(TabPayload::TabInactive, document_id);
            if let Some(task) = self.inner.announce.lock().await.take() {
                task.stop();
            }
        }
    }

    /// Periodic "still alive" announcement while foregrounded, so siblings
    /// can detect a tab that silently stopped responding. Staleness policy
    /// is the consumer's call, based on message timestamps.
    async fn start_announce(&self) {
        let mut slot = self.inner.announce.lock().await;
        if slot.is_some() {
            return;
        }
        // Weak reference, so the announce loop cannot outlive the tab.
        let inner = Arc::downgrade(&self.inner);
        *slot = Some(PeriodicTask::spawn(
            self.inner.config.presence_announce(),
            move || {
                let inner = Weak::clone(&inner);
                async move {
                    let Some(inner) = inner.upgrade() else { return };
                    let document_id = inner.state.read().await.current_document_id.clone();
                    let msg =
                        TabMessage::new(TabPayload::TabActive, document_id, inner.instance_id);
                    let _ = inner.channel.send(msg);
                }
            },
        ));
    }
}

/// Receive loop: drop own echoes, fan each message out to the handlers
/// registered for its kind. Holds only a weak reference to the tab and
/// exits once it is gone.
async fn dispatch_loop(inner: Weak<CoordinatorInner>, mut rx: broadcast::Receiver<TabMessage>) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                let Some(inner) = inner.upgrade() else { break };
                if msg.sender_instance_id == inner.instance_id {
                    continue;
                }
                let handlers: Vec<MessageHandler> = {
                    let registry = inner.handlers.read().await;
                    registry
                        .get(&msg.kind())
                        .map(|set| set.values().cloned().collect())
                        .unwrap_or_default()
                };
                for handler in handlers {
                    handler(&msg);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Tab channel lagged; {} message(s) dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
