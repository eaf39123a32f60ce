//! The data surface the UI talks to.
//!
//! Every mutation follows one shape: snapshot the affected cache slice,
//! apply the change to the cache right away, call the server, then either
//! swap in the server's row or put the snapshot back. Reads serve the cache
//! first and refresh it from the server in the background.
//!
//! Concurrency policy: nothing is locked across the remote call. A
//! background refresh or a realtime event can land between the optimistic
//! write and its confirmation or rollback, and whichever write reaches the
//! cache last wins. There are no version checks.

mod groups;
mod outcome;
mod todos;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;

use crate::auth::{AuthProvider, RestoreState, SessionGate};
use crate::cache::{LocalStore, OperationKind, PendingOperation};
use crate::core::Todo;
use crate::error::GatewayError;
use crate::realtime::Reconciler;
use crate::remote::{ChangeEvent, ChangeFeed, RemoteTables};
pub use outcome::Outcome;

pub struct DataGateway {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteTables>,
    auth: Arc<dyn AuthProvider>,
    gate: Option<Arc<SessionGate>>,
    realtime: Option<Reconciler>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl DataGateway {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteTables>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            store,
            remote,
            auth,
            gate: None,
            realtime: None,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Hold cache-vs-server decisions until startup session restore settles.
    pub fn with_session_gate(mut self, gate: Arc<SessionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_change_feed(mut self, feed: Arc<dyn ChangeFeed>) -> Self {
        self.realtime = Some(Reconciler::new(self.store.clone(), feed));
        self
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// False when session restore failed; loads then stay cache-only.
    async fn session_usable(&self) -> bool {
        match &self.gate {
            None => true,
            Some(gate) => !matches!(gate.wait().await, RestoreState::Failed(_)),
        }
    }

    async fn signed_in(&self) -> bool {
        if !self.session_usable().await {
            return false;
        }
        match self.auth.current_user().await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                log::warn!("Auth check failed: {}", e);
                false
            }
        }
    }

    /// Journal a mutation that is about to hit the server.
    fn begin(&self, kind: OperationKind, entity_id: &str) -> String {
        let op = PendingOperation::new(kind, entity_id);
        let id = op.id.clone();
        self.store.add_pending_operation(op);
        id
    }

    fn settle(&self, operation_id: &str) {
        self.store.remove_pending_operation(operation_id);
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Wait for every background refresh started so far.
    pub async fn settle_background(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                log::warn!("Background refresh task ended abnormally: {}", e);
            }
        }
    }

    /// Find which cached group holds todo `id`.
    ///
    /// Linear over every cached group's todos. Fine at desktop scale; an
    /// index would have to be kept in step with realtime folding.
    fn locate_todo(&self, id: &str) -> Result<(String, usize, Todo), GatewayError> {
        for group in self.store.groups() {
            let todos = self.store.todos(&group.id);
            if let Some(pos) = todos.iter().position(|t| t.id == id) {
                return Ok((group.id, pos, todos[pos].clone()));
            }
        }
        Err(GatewayError::NotFound {
            kind: "Todo",
            id: id.to_string(),
        })
    }

    // ---- realtime ----

    fn reconciler(&self) -> Result<&Reconciler, GatewayError> {
        self.realtime
            .as_ref()
            .ok_or(GatewayError::RealtimeUnavailable)
    }

    /// Listen to every group change. Returns the channel name.
    pub async fn subscribe_to_groups<F>(&self, listener: F) -> Outcome<String>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let result = match self.reconciler() {
            Ok(r) => r.subscribe_to_groups(listener).await.map_err(Into::into),
            Err(e) => Err(e),
        };
        report("subscribe to groups", result)
    }

    /// Listen to todo changes of one group, replacing any earlier
    /// subscription for the same group.
    pub async fn subscribe_to_todos<F>(&self, group_id: &str, listener: F) -> Outcome<String>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let result = match self.reconciler() {
            Ok(r) => r
                .subscribe_to_todos(group_id, listener)
                .await
                .map_err(Into::into),
            Err(e) => Err(e),
        };
        report("subscribe to todos", result)
    }

    pub async fn unsubscribe(&self, name: &str) -> Outcome<bool> {
        match &self.realtime {
            Some(r) => Outcome::ok(r.unsubscribe(name).await),
            None => Outcome::ok(false),
        }
    }

    pub async fn unsubscribe_all(&self) -> Outcome<()> {
        if let Some(r) = &self.realtime {
            r.unsubscribe_all().await;
        }
        Outcome::ok(())
    }

    /// Logout / window teardown: drop every channel, then the cache.
    pub async fn teardown(&self) -> Outcome<()> {
        self.unsubscribe_all().await;
        let pending: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in pending {
            handle.abort();
        }
        if !self.store.clear_all() {
            log::warn!("Cache could not be fully cleared on teardown");
        }
        Outcome::ok(())
    }
}

/// Log a failed operation and wrap the result.
fn report<T>(what: &str, result: Result<T, GatewayError>) -> Outcome<T> {
    if let Err(e) = &result {
        log::error!("Failed to {}: {}", what, e);
    }
    result.into()
}
