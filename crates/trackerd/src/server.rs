//! trackerd server - main service loop

use crate::collaborators::{LedgerError, LocalWallet, MemoryLedger};
use crate::config::{Config, NodeState};
use crate::delta::DeltaValue;
use crate::protocol::{MessageOutcome, Tracker, TrackerError};
use crate::storage::{Storage, StorageError, TableStorage};
use host_tracker_core::crypto::{derive_node_id, now_millis};
use host_tracker_core::types::*;
use host_tracker_core::{KeyPair, StdCrypto};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, interval_at, Instant};
use tracing::{debug, error, info, warn};

const CHANNEL_CAPACITY: usize = 1024;
const LAST_SAVE_KEY: &str = "last_save";

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Server already running")]
    AlreadyRunning,
    #[error("Own join rejected: {0}")]
    JoinRejected(String),
}

/// One gossip round handed to the transport
#[derive(Debug, Clone)]
pub struct GossipBatch {
    /// Peers to fan out to
    pub neighbors: Vec<NodeId>,
    /// Signed envelopes to forward verbatim
    pub messages: Vec<HostMessage>,
    /// Flattened form of every buffered update
    pub deltas: Vec<Vec<DeltaValue>>,
}

/// Server state
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    tracker: Arc<Tracker>,
    inbound_tx: mpsc::Sender<HostMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<HostMessage>>>,
    outbound_tx: mpsc::Sender<GossipBatch>,
    outbound_rx: Mutex<Option<mpsc::Receiver<GossipBatch>>>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.data_dir)?);
        let keypair = load_or_create_keypair(&storage, &config.identity_seed)?;

        let ledger = match &config.ledger_snapshot {
            Some(path) => MemoryLedger::from_json_file(path)?,
            None => MemoryLedger::new(),
        };

        let pledge_ref = config
            .pledge_ref()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let pledge = pledge_ref.and_then(|reference| match ledger.get(&reference) {
            Some(record) => Some(Pledge {
                tx: record.key,
                size: record.space_pledged,
                proof: record.pledge_proof,
                interval: record.pledge_interval,
            }),
            None => {
                warn!("Pledge tx {} not found in ledger snapshot", reference);
                None
            }
        });

        let wallet = LocalWallet::new(keypair, config.identity_seed.as_bytes(), pledge);
        let ledger = Arc::new(ledger);
        let tracker = Arc::new(Tracker::new(
            Arc::new(StdCrypto),
            Arc::new(wallet),
            ledger.clone(),
            config.tracker_settings(),
        ));

        if let Some(bytes) = storage.load()? {
            let count = tracker.load_table(&bytes)?;
            info!("Loaded {} entries from storage", count);
        }
        for record in ledger.pledges() {
            if let Some(node_id) = tracker.admit_pledge(&record)? {
                debug!("Admitted {} from ledger snapshot", node_id);
            }
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            tracker,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            shutdown_tx,
        })
    }

    pub fn tracker(&self) -> Arc<Tracker> {
        self.tracker.clone()
    }

    /// Where the transport delivers inbound messages
    pub fn inbound_sender(&self) -> mpsc::Sender<HostMessage> {
        self.inbound_tx.clone()
    }

    /// Gossip batches for the transport (can be taken once)
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<GossipBatch>> {
        self.outbound_rx.lock().take()
    }

    /// Sender that stops [`Server::run`] when signalled
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the server until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let inbound_rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(ServerError::AlreadyRunning)?;

        let local_id = self.tracker.local_id()?;
        info!(
            "Starting trackerd as {} ({} entries in table)",
            local_id,
            self.tracker.len()
        );

        let handles = vec![
            self.spawn_inbound_task(inbound_rx),
            self.spawn_gossip_task(),
            self.spawn_persist_task(),
        ];

        let result = match self.announce_join().await {
            Ok(()) => {
                let _ = shutdown_rx.recv().await;
                info!("Shutting down...");
                self.announce_leave().await
            }
            Err(e) => {
                error!("Join announcement failed: {}", e);
                Err(e)
            }
        };
        for handle in handles {
            handle.abort();
        }

        let count = save_table(&self.tracker, &self.storage)?;
        info!("Saved {} entries", count);
        self.storage.flush()?;

        result
    }

    async fn announce_join(&self) -> Result<(), ServerError> {
        let Some(public_ip) = self.config.public_ip else {
            info!("No public address configured, not announcing a join");
            return Ok(());
        };

        let message = match self.tracker.create_join_message(
            public_ip,
            self.config.tcp_port,
            self.config.ws_port,
            self.config.gateway,
            vec![],
        ) {
            Ok(message) => message,
            Err(TrackerError::Wallet(e)) => {
                warn!("Cannot announce join: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.tracker.handle_message(message).await? {
            MessageOutcome::Rejected { reason } => Err(ServerError::JoinRejected(reason)),
            outcome => {
                info!("Announced join: {:?}", outcome);
                Ok(())
            }
        }
    }

    async fn announce_leave(&self) -> Result<(), ServerError> {
        let local_id = self.tracker.local_id()?;
        let active = self
            .tracker
            .get_entry(&local_id)
            .map(|entry| entry.status.is_active())
            .unwrap_or(false);
        if !active {
            return Ok(());
        }

        let message = self.tracker.create_leave_message()?;
        let outcome = self.tracker.handle_message(message).await?;
        info!("Announced leave: {:?}", outcome);
        Ok(())
    }

    /// Spawn inbound message task
    fn spawn_inbound_task(
        &self,
        mut inbound_rx: mpsc::Receiver<HostMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let tracker = self.tracker.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound_rx.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        match tracker.handle_message(message).await {
                            Ok(MessageOutcome::Rejected { reason }) => {
                                debug!("Dropped inbound message: {}", reason);
                            }
                            Ok(outcome) => debug!("Inbound message: {:?}", outcome),
                            Err(e) => {
                                error!("Tracker fault, shutting down: {}", e);
                                let _ = shutdown_tx.send(());
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn background gossip task
    fn spawn_gossip_task(&self) -> tokio::task::JoinHandle<()> {
        let tracker = self.tracker.clone();
        let outbound_tx = self.outbound_tx.clone();
        let period = Duration::from_secs(self.config.gossip_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(count) = gossip_round(&tracker, &outbound_tx) {
                            debug!("Gossiped {} deltas", count);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Spawn background persistence task
    fn spawn_persist_task(&self) -> tokio::task::JoinHandle<()> {
        let tracker = self.tracker.clone();
        let storage = self.storage.clone();
        let period = Duration::from_secs(self.config.save_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match save_table(&tracker, &storage) {
                            Ok(count) => debug!("Saved {} entries", count),
                            Err(e) => error!("Periodic save failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            entry_count: self.tracker.len(),
            active_count: self.tracker.active_ids().len(),
            pending_deltas: self.tracker.with_delta(|delta| delta.len()),
            deferred_updates: self.tracker.deferred_len(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub entry_count: usize,
    pub active_count: usize,
    pub pending_deltas: usize,
    pub deferred_updates: usize,
}

/// Reuse the stored keypair when it belongs to the configured identity
fn load_or_create_keypair(storage: &Storage, identity_seed: &str) -> Result<KeyPair, StorageError> {
    let node_id = derive_node_id(identity_seed.as_bytes());
    if let Some(state) = storage.node_state()? {
        if state.node_id() == node_id {
            return Ok(KeyPair::from_seed(&state.keypair_seed));
        }
        warn!(
            "Stored keypair belongs to {}, generating a new one for {}",
            state.node_id(),
            node_id
        );
    }

    let keypair = KeyPair::generate();
    storage.put_node_state(&NodeState {
        keypair_seed: keypair.seed(),
        node_id: node_id.0,
    })?;
    info!(
        "Generated keypair for {} (public key {})",
        node_id,
        hex::encode(keypair.public_key())
    );
    Ok(keypair)
}

/// Hand the buffered deltas to the transport. The buffer is cleared only
/// when the batch was accepted; with no neighbors it is kept for a later
/// round. Returns the number of deltas sent.
pub fn gossip_round(tracker: &Tracker, outbound: &mpsc::Sender<GossipBatch>) -> Option<usize> {
    let neighbors = match tracker.neighbors() {
        Ok(neighbors) => neighbors.into_vec(),
        Err(e) => {
            warn!("Cannot select neighbors: {}", e);
            return None;
        }
    };

    tracker.with_delta(|delta| {
        if delta.is_empty() {
            return None;
        }
        if neighbors.is_empty() {
            debug!("No neighbors, keeping {} deltas", delta.len());
            return None;
        }
        let batch = GossipBatch {
            neighbors,
            messages: delta.envelopes(),
            deltas: delta.drain(),
        };
        let count = batch.deltas.len();

        match outbound.try_send(batch) {
            Ok(()) => {
                delta.clear();
                Some(count)
            }
            Err(e) => {
                warn!("Gossip batch not sent, keeping {} deltas: {}", count, e);
                None
            }
        }
    })
}

/// Persist the table and record when it happened
fn save_table(tracker: &Tracker, storage: &Storage) -> Result<usize, ServerError> {
    let bytes = tracker.table_bytes()?;
    storage.save(&bytes)?;
    storage.put_metadata(LAST_SAVE_KEY, &now_millis().to_le_bytes())?;
    Ok(tracker.len())
}
