//! Signed-in session: owns the sync worker and the realtime connection.

use std::sync::Arc;

use crate::models::Table;
use crate::services::{Mutations, ReplicaService};
use crate::sync::{
    ChangeSource, PullService, RealtimeConnection, SyncEngine, SyncEngineConfig, SyncTransport,
    SyncWorker,
};
use crate::Result;

/// Everything that lives exactly as long as one authenticated identity.
///
/// Created by [`Session::sign_in`], torn down by [`Session::sign_out`]; no
/// subscription outlives the session that opened it.
pub struct Session {
    user_id: String,
    replica: ReplicaService,
    engine: Arc<SyncEngine>,
    pull: Arc<PullService>,
    worker: SyncWorker,
    realtime: Option<RealtimeConnection>,
    mutations: Mutations,
}

impl Session {
    /// Start a session for `user_id` on `replica`.
    ///
    /// If the replica was last populated for another user, its rows and
    /// outbox are cleared and every table is pulled from epoch; otherwise an
    /// incremental catch-up runs. Pull failures caused by the network are
    /// logged and leave the session usable offline.
    pub async fn sign_in(
        replica: ReplicaService,
        user_id: &str,
        transport: Arc<dyn SyncTransport>,
        changes: Option<Arc<dyn ChangeSource>>,
        config: SyncEngineConfig,
    ) -> Result<Self> {
        let pull = Arc::new(PullService::new(replica.clone(), transport.clone()));

        let previous = replica.user_id().await?;
        if previous.as_deref() == Some(user_id) {
            Self::pull_or_stay_offline(pull.catch_up(&Table::ALL).await)?;
        } else {
            let dropped = replica.pending_count().await?;
            if dropped > 0 {
                tracing::warn!(dropped, "Discarding previous identity's unsynced outbox");
            }
            replica.reset().await?;
            replica.set_user_id(user_id).await?;
            tracing::info!(user = %fingerprint(user_id), "Identity changed; rebuilding replica");
            Self::pull_or_stay_offline(pull.catch_up(&Table::ALL).await)?;
        }

        let engine = Arc::new(SyncEngine::new(replica.clone(), transport, config));
        let worker = engine.spawn();
        // Flush anything left over from an earlier run
        engine.trigger().notify_one();

        let realtime = changes.map(|source| {
            RealtimeConnection::start(
                replica.clone(),
                source,
                Table::ALL.to_vec(),
                Some(pull.clone()),
            )
        });

        let mutations = Mutations::new(replica.clone(), user_id).with_sync_trigger(engine.trigger());

        Ok(Self {
            user_id: user_id.to_string(),
            replica,
            engine,
            pull,
            worker,
            realtime,
            mutations,
        })
    }

    fn pull_or_stay_offline(result: Result<crate::sync::PullReport>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(error) if error.is_transport() => {
                tracing::warn!(error = %error, "Initial pull failed; continuing offline");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub const fn replica(&self) -> &ReplicaService {
        &self.replica
    }

    pub const fn mutations(&self) -> &Mutations {
        &self.mutations
    }

    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn pull(&self) -> &PullService {
        &self.pull
    }

    pub const fn realtime(&self) -> Option<&RealtimeConnection> {
        self.realtime.as_ref()
    }

    /// Stop realtime and the sync worker. The replica and outbox stay on disk.
    pub async fn sign_out(self) {
        if let Some(realtime) = &self.realtime {
            realtime.shutdown().await;
        }
        self.worker.shutdown().await;
        tracing::info!(user = %fingerprint(&self.user_id), "Signed out");
    }
}

/// Short stable hash of a user id for log lines
pub fn fingerprint(user_id: &str) -> String {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{MacroChain, MacroChainId, OrganizationId, Ticket};
    use crate::protocol::{PullRequest, PullResponse, SyncRequest, SyncResponse, TableRows};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Serves one macro chain on pull and accepts pushes without echoing rows
    struct FakeBackend {
        offline: AtomicBool,
        chain: MacroChain,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                offline: AtomicBool::new(false),
                chain: MacroChain {
                    id: MacroChainId::new(),
                    organization_id: OrganizationId::new(),
                    name: "Reset password".to_string(),
                    actions: vec!["send_reset_link".to_string()],
                    created_at: 5,
                    updated_at: 5,
                    deleted_at: None,
                },
            })
        }
    }

    #[async_trait]
    impl SyncTransport for FakeBackend {
        async fn push(&self, _request: &SyncRequest) -> Result<SyncResponse> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Transport("offline".to_string()));
            }
            Ok(SyncResponse::new())
        }

        async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Transport("offline".to_string()));
            }
            let mut rows = TableRows::new();
            if request.watermark(Table::MacroChains) < self.chain.updated_at {
                rows.insert(&self.chain.clone().into()).unwrap();
            }
            Ok(PullResponse {
                rows,
                ..PullResponse::default()
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sign_in_pulls_and_sign_out_stops_background_work() {
        let replica = ReplicaService::open_in_memory().await.unwrap();
        let backend = FakeBackend::new();

        let session = Session::sign_in(
            replica.clone(),
            "agent-1",
            backend.clone(),
            None,
            SyncEngineConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(session.user_id(), "agent-1");
        assert!(session.realtime().is_none());
        let chains: Vec<MacroChain> = replica.list(false).await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(replica.user_id().await.unwrap().as_deref(), Some("agent-1"));

        session.sign_out().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identity_switch_clears_replica_and_outbox() {
        let replica = ReplicaService::open_in_memory().await.unwrap();
        let backend = FakeBackend::new();
        backend.offline.store(true, Ordering::SeqCst);

        let first = Session::sign_in(
            replica.clone(),
            "agent-1",
            backend.clone(),
            None,
            SyncEngineConfig::default(),
        )
        .await
        .unwrap();
        first
            .mutations()
            .create_ticket(OrganizationId::new(), "Left behind", "")
            .await
            .unwrap();
        first.sign_out().await;
        assert_eq!(replica.pending_count().await.unwrap(), 1);

        backend.offline.store(false, Ordering::SeqCst);
        let second = Session::sign_in(
            replica.clone(),
            "agent-2",
            backend.clone(),
            None,
            SyncEngineConfig::default(),
        )
        .await
        .unwrap();

        assert!(replica.list::<Ticket>(true).await.unwrap().is_empty());
        assert_eq!(replica.pending_count().await.unwrap(), 0);
        assert_eq!(replica.list::<MacroChain>(false).await.unwrap().len(), 1);
        second.sign_out().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn same_identity_keeps_pending_outbox() {
        let replica = ReplicaService::open_in_memory().await.unwrap();
        let backend = FakeBackend::new();
        backend.offline.store(true, Ordering::SeqCst);

        let first = Session::sign_in(
            replica.clone(),
            "agent-1",
            backend.clone(),
            None,
            SyncEngineConfig::default(),
        )
        .await
        .unwrap();
        first
            .mutations()
            .create_ticket(OrganizationId::new(), "Queued offline", "")
            .await
            .unwrap();
        first.sign_out().await;

        let second = Session::sign_in(
            replica.clone(),
            "agent-1",
            backend,
            None,
            SyncEngineConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(replica.list::<Ticket>(false).await.unwrap().len(), 1);
        second.sign_out().await;
    }

    #[test]
    fn fingerprint_is_stable_and_hides_input() {
        assert_eq!(fingerprint("agent-1"), fingerprint("agent-1"));
        assert_ne!(fingerprint("agent-1"), fingerprint("agent-2"));
        assert!(!fingerprint("agent-1").contains("agent"));
    }
}
