use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::protocol::ServerMessage;
use crate::registry::ConversationRegistry;
use crate::supervisor::ServerSupervisor;
use crate::workspace::Workspace;

/// Unique client identifier
pub type ClientId = u64;

/// Channel for sending events to a client
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Daemon-wide shared state
pub struct DaemonState {
    /// Client event senders (ClientId → sender)
    pub clients: RwLock<HashMap<ClientId, ClientSender>>,

    /// Next client ID counter
    next_client_id: Mutex<ClientId>,

    /// Live executions and conversation transcripts
    pub registry: ConversationRegistry,

    /// Preview servers (port → process)
    pub frontends: ServerSupervisor,

    /// Files under the work root
    pub workspace: Workspace,

    /// Upper bound on cleanup at shutdown
    pub shutdown_grace: Duration,
}

impl DaemonState {
    pub fn new(
        registry: ConversationRegistry,
        frontends: ServerSupervisor,
        workspace: Workspace,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client_id: Mutex::new(1),
            registry,
            frontends,
            workspace,
            shutdown_grace,
        }
    }

    /// Register a new client, returning its ID and event receiver
    pub async fn register_client(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let mut id = self.next_client_id.lock().await;
        let client_id = *id;
        *id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().await.insert(client_id, tx);

        (client_id, rx)
    }

    /// Unregister a client. Executions it started keep running so their
    /// transcripts are still recorded.
    pub async fn unregister_client(&self, client_id: ClientId) {
        self.clients.write().await.remove(&client_id);
    }

    /// Event sender for a connected client
    pub async fn client_sender(&self, client_id: ClientId) -> Option<ClientSender> {
        self.clients.read().await.get(&client_id).cloned()
    }

    /// Stop every execution and preview server, each bounded by the grace period
    pub async fn shutdown(&self) {
        tokio::join!(
            self.registry.shutdown(self.shutdown_grace),
            self.frontends.shutdown(self.shutdown_grace),
        );
    }
}
