//! Membership protocol: message construction, validation and application
//!
//! Every table mutation funnels through [`Tracker::handle_message`] or the
//! administrative [`Tracker::admit_pledge`] / [`Tracker::remove_entry`].
//! Ledger lookups are the only suspension points and never run under a lock;
//! the table is re-locked only once validation has completed.

use crate::collaborators::{Ledger, Profile, Wallet, WalletError};
use crate::delta::DeltaBuffer;
use crate::entry_store::{EntryStore, StoreError};
use crate::failure::{
    await_failure_quorum, FailureError, FailureRound, DEFAULT_FAILURE_QUORUM,
    DEFAULT_FAILURE_TIMEOUT,
};
use host_tracker_core::canonical::{normalize_neighbor_proofs, validate_neighbor_proofs_sorted};
use host_tracker_core::crypto::*;
use host_tracker_core::neighbors::{
    select_host_neighbors, select_neighbors, NeighborSet, DEFAULT_MIN_HOST_NEIGHBORS,
};
use host_tracker_core::types::*;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Acceptance window for message and update timestamps
pub const MESSAGE_WINDOW_MS: u64 = 600_000;

/// Updates parked per unknown node before new ones are refused
pub const DEFAULT_MAX_DEFERRED: usize = 16;

/// Updates parked across all unknown nodes before new ones are refused
pub const DEFAULT_MAX_DEFERRED_TOTAL: usize = 1024;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Tracker errors. Validation failures are not errors; they come back as
/// [`MessageOutcome::Rejected`] or an invalid [`Validation`].
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Core error: {0}")]
    Core(#[from] host_tracker_core::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Failure collection error: {0}")]
    Failure(#[from] FailureError),
}

/// Protocol tunables
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub message_window_ms: u64,
    pub failure_quorum: usize,
    pub failure_timeout: Duration,
    pub max_deferred_per_node: usize,
    pub max_deferred_total: usize,
    pub min_host_neighbors: usize,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            message_window_ms: MESSAGE_WINDOW_MS,
            failure_quorum: DEFAULT_FAILURE_QUORUM,
            failure_timeout: DEFAULT_FAILURE_TIMEOUT,
            max_deferred_per_node: DEFAULT_MAX_DEFERRED,
            max_deferred_total: DEFAULT_MAX_DEFERRED_TOTAL,
            min_host_neighbors: DEFAULT_MIN_HOST_NEIGHBORS,
        }
    }
}

/// Structured validation verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<Result<(), String>> for Validation {
    fn from(result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(reason) => Self::reject(reason),
        }
    }
}

/// Table change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    EntryAdded(NodeId),
    EntryUpdated {
        node_id: NodeId,
        kind: UpdateKind,
        active: bool,
    },
    EntryRemoved(NodeId),
}

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Update applied to the table and buffered for gossip
    Applied { node_id: NodeId, kind: UpdateKind },
    /// Already applied or already buffered
    Duplicate,
    /// Refers to a host not yet in the table; replayed once it joins
    Deferred(NodeId),
    /// Valid failure proposal; the caller decides whether to co-sign
    FailureProposal(FailureUpdate),
    NeighborRequestAccepted(NodeId),
    Rejected { reason: String },
}

/// The membership tracker: owns the host table and delta buffer of one peer
pub struct Tracker {
    crypto: Arc<dyn Crypto>,
    wallet: Arc<dyn Wallet>,
    ledger: Arc<dyn Ledger>,
    settings: TrackerSettings,
    store: RwLock<EntryStore>,
    delta: Mutex<DeltaBuffer>,
    deferred: Mutex<HashMap<NodeId, Vec<HostMessage>>>,
    events: broadcast::Sender<TrackerEvent>,
}

impl Tracker {
    pub fn new(
        crypto: Arc<dyn Crypto>,
        wallet: Arc<dyn Wallet>,
        ledger: Arc<dyn Ledger>,
        settings: TrackerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            crypto,
            wallet,
            ledger,
            settings,
            store: RwLock::new(EntryStore::new()),
            delta: Mutex::new(DeltaBuffer::new()),
            deferred: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Subscribe to table change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    fn profile(&self) -> Result<Profile, TrackerError> {
        Ok(self.wallet.profile()?)
    }

    /// This host's node id
    pub fn local_id(&self) -> Result<NodeId, TrackerError> {
        Ok(self.profile()?.id)
    }

    fn emit(&self, event: TrackerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // =========================================================================
    // CONSTRUCTION
    // =========================================================================

    fn seal(
        &self,
        profile: &Profile,
        message_type: MessageType,
        data: MessageData,
    ) -> Result<HostMessage, TrackerError> {
        let mut message = HostMessage {
            version: PROTOCOL_VERSION,
            message_type,
            timestamp: self.crypto.now_millis(),
            sender: profile.id,
            public_key: profile.public_key,
            data,
            signature: None,
        };
        let bytes = message_sign_bytes(&message)?;
        message.signature = Some(self.crypto.sign(&bytes, &profile.keypair));
        Ok(message)
    }

    /// Announce this host as active with fresh endpoints
    pub fn create_join_message(
        &self,
        public_ip: IpAddr,
        tcp_port: u16,
        ws_port: u16,
        is_gateway: bool,
        mut neighbor_proofs: Vec<NeighborProof>,
    ) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let pledge = profile.pledge()?.clone();
        normalize_neighbor_proofs(&mut neighbor_proofs);

        let mut join = JoinUpdate {
            node_id: profile.id,
            public_key: profile.public_key,
            pledge_tx: pledge.tx,
            pledge: pledge.size,
            proof_hash: pledge.proof,
            public_ip,
            tcp_port,
            ws_port,
            is_gateway,
            timestamp: self.crypto.now_millis(),
            signature: None,
            neighbor_proofs,
        };
        join.signature = Some(self.crypto.sign(&join_sign_bytes(&join)?, &profile.keypair));

        self.seal(&profile, MessageType::HostJoin, MessageData::Update(Update::Join(join)))
    }

    /// Announce a graceful departure
    pub fn create_leave_message(&self) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let mut leave = LeaveUpdate {
            node_id: profile.id,
            previous: None,
            timestamp: self.crypto.now_millis(),
            signature: None,
        };
        leave.signature = Some(self.crypto.sign(&leave_sign_bytes(&leave)?, &profile.keypair));

        self.seal(&profile, MessageType::HostLeave, MessageData::Update(Update::Leave(leave)))
    }

    /// Reactivate without refreshing endpoints (legacy; travels as host-join)
    pub fn create_rejoin_message(&self) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let mut rejoin = RejoinUpdate {
            node_id: profile.id,
            previous: None,
            timestamp: self.crypto.now_millis(),
            signature: None,
        };
        rejoin.signature = Some(self.crypto.sign(&rejoin_sign_bytes(&rejoin)?, &profile.keypair));

        self.seal(&profile, MessageType::HostJoin, MessageData::Update(Update::Rejoin(rejoin)))
    }

    fn signature_object(
        &self,
        profile: &Profile,
        target: NodeId,
        nonce: Bytes32,
    ) -> Result<SignatureObject, TrackerError> {
        let mut object = SignatureObject {
            node_id: target,
            public_key: profile.public_key,
            nonce,
            timestamp: self.crypto.now_millis(),
            signature: None,
        };
        object.signature = Some(
            self.crypto
                .sign(&signature_object_sign_bytes(&object)?, &profile.keypair),
        );
        Ok(object)
    }

    /// Propose `target` as failed. The result is a `pending-failure-request`
    /// carrying this host's own signature as the first signer.
    pub fn create_failure_message(&self, target: &NodeId) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let timestamp = self.crypto.now_millis();
        let nonce = derive_failure_nonce(target, &profile.id, timestamp);
        let first = self.signature_object(&profile, *target, nonce)?;

        let failure = FailureUpdate {
            node_id: *target,
            nonce,
            previous: None,
            timestamp,
            signatures: vec![first],
        };
        self.seal(
            &profile,
            MessageType::PendingFailureRequest,
            MessageData::Update(Update::Failure(failure)),
        )
    }

    /// Corroborate a failure proposal with this host's signature
    pub fn sign_failure_message(
        &self,
        failure: &FailureUpdate,
    ) -> Result<SignatureObject, TrackerError> {
        let profile = self.profile()?;
        self.signature_object(&profile, failure.node_id, failure.nonce)
    }

    /// Assemble the final `host-failure` once a quorum has been collected
    pub fn compile_failure_message(
        &self,
        node_id: NodeId,
        timestamp: u64,
        nonce: Bytes32,
        signatures: Vec<SignatureObject>,
    ) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let failure = FailureUpdate {
            node_id,
            nonce,
            previous: None,
            timestamp,
            signatures,
        };
        self.seal(
            &profile,
            MessageType::HostFailure,
            MessageData::Update(Update::Failure(failure)),
        )
    }

    /// Pre-join admission request referencing this host's pledge
    pub fn create_neighbor_request(&self) -> Result<HostMessage, TrackerError> {
        let profile = self.profile()?;
        let reference = profile.pledge()?.tx;
        self.seal(
            &profile,
            MessageType::NeighborRequest,
            MessageData::NeighborRequest(reference),
        )
    }

    /// Attest that `host` is one of this host's neighbors
    pub fn create_neighbor_proof(&self, host: NodeId) -> Result<NeighborProof, TrackerError> {
        let profile = self.profile()?;
        let mut proof = NeighborProof {
            host,
            neighbor: profile.id,
            timestamp: self.crypto.now_millis(),
            signature: None,
        };
        proof.signature = Some(
            self.crypto
                .sign(&neighbor_proof_sign_bytes(&proof)?, &profile.keypair),
        );
        Ok(proof)
    }

    /// Collect co-signatures for `proposal` from `answers` and compile the
    /// final failure message once the quorum is met.
    pub async fn collect_failure(
        &self,
        proposal: FailureUpdate,
        answers: &mut mpsc::Receiver<SignatureObject>,
    ) -> Result<HostMessage, TrackerError> {
        let round = FailureRound::new(
            proposal.clone(),
            self.settings.failure_quorum,
            self.settings.failure_timeout,
        );
        let round = await_failure_quorum(round, answers, |object| {
            self.verify_failure_signature(&proposal, object)
        })
        .await?;

        info!(
            "Failure quorum reached for {} ({} signatures)",
            round.target(),
            round.signatures().len()
        );
        let (node_id, timestamp, nonce) = (round.target(), round.timestamp(), round.nonce());
        self.compile_failure_message(node_id, timestamp, nonce, round.into_signatures())
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Verify the envelope signature over the message with its signature cleared
    pub fn is_valid_host_message(&self, message: &HostMessage) -> bool {
        self.verify_signed(message_sign_bytes(message), &message.signature, &message.public_key)
    }

    fn verify_signed(
        &self,
        bytes: host_tracker_core::Result<Vec<u8>>,
        signature: &Option<Signature>,
        public_key: &Bytes32,
    ) -> bool {
        match (bytes, signature) {
            (Ok(bytes), Some(signature)) => self.crypto.verify(&bytes, signature, public_key),
            _ => false,
        }
    }

    fn check_fresh(&self, timestamp: u64, what: &str) -> Result<(), String> {
        if self
            .crypto
            .is_within_time_window(timestamp, self.settings.message_window_ms)
        {
            Ok(())
        } else {
            Err(format!("Invalid {what}, timestamp out of range"))
        }
    }

    /// Envelope signature and envelope timestamp, shared by every validator
    fn check_envelope(&self, message: &HostMessage, what: &str) -> Result<(), String> {
        if !self.is_valid_host_message(message) {
            return Err(format!("Invalid {what}, envelope signature does not verify"));
        }
        self.check_fresh(message.timestamp, what)
    }

    async fn resolve_pledge(
        &self,
        reference: &PledgeRef,
        what: &str,
    ) -> Result<TransactionRecord, String> {
        match self.ledger.resolve_pledge(reference).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(format!("Invalid {what}, pledge tx not found")),
            Err(e) => Err(format!("Invalid {what}, ledger unavailable: {e}")),
        }
    }

    /// Pre-join admission check
    pub async fn is_valid_neighbor_request(&self, message: &HostMessage) -> Validation {
        self.check_neighbor_request(message).await.map(|_| ()).into()
    }

    async fn check_neighbor_request(&self, message: &HostMessage) -> Result<NodeId, String> {
        const WHAT: &str = "neighbor request";
        self.check_envelope(message, WHAT)?;
        let MessageData::NeighborRequest(reference) = &message.data else {
            return Err(format!("Invalid {WHAT}, missing pledge reference"));
        };

        let record = self.resolve_pledge(reference, WHAT).await?;
        if record.tx_type != TxType::Pledge {
            return Err(format!("Invalid {WHAT}, host is not referencing a pledge tx"));
        }
        if record.public_key != message.public_key {
            return Err(format!("Invalid {WHAT}, host does not match pledge"));
        }
        if derive_node_id(&record.seed) != message.sender {
            return Err(format!("Invalid {WHAT}, sender does not match pledge seed"));
        }
        Ok(message.sender)
    }

    pub async fn is_valid_join_message(&self, message: &HostMessage) -> Validation {
        match message.update() {
            Some(Update::Join(join)) => self.check_join(message, join).await.map(|_| ()).into(),
            _ => Validation::reject("Invalid join, message does not carry a join update"),
        }
    }

    /// Full join check; returns the pledge record backing the host
    async fn check_join(
        &self,
        message: &HostMessage,
        join: &JoinUpdate,
    ) -> Result<TransactionRecord, String> {
        const WHAT: &str = "join";
        if message.message_type != MessageType::HostJoin {
            return Err(format!("Invalid {WHAT}, wrong message type"));
        }
        self.check_envelope(message, WHAT)?;
        self.check_fresh(join.timestamp, WHAT)?;
        if message.sender != join.node_id || message.public_key != join.public_key {
            return Err(format!("Invalid {WHAT}, sender does not match update"));
        }
        if !self.verify_signed(join_sign_bytes(join), &join.signature, &join.public_key) {
            return Err(format!("Invalid {WHAT}, invalid update signature"));
        }
        validate_neighbor_proofs_sorted(&join.neighbor_proofs)
            .map_err(|e| format!("Invalid {WHAT}, {e}"))?;

        let record = self.resolve_pledge(&join.pledge_tx, WHAT).await?;
        if record.tx_type != TxType::Pledge {
            return Err(format!("Invalid {WHAT}, host is not referencing a pledge tx"));
        }
        if record.public_key != join.public_key {
            return Err(format!("Invalid {WHAT}, host does not match pledge"));
        }
        if derive_node_id(&record.seed) != join.node_id {
            return Err(format!("Invalid {WHAT}, node id does not match pledge seed"));
        }
        if record.space_pledged != join.pledge || record.pledge_proof != join.proof_hash {
            return Err(format!("Invalid {WHAT}, pledge does not match"));
        }

        self.check_neighbor_proofs(join)?;
        Ok(record)
    }

    fn check_neighbor_proofs(&self, join: &JoinUpdate) -> Result<(), String> {
        let store = self.store.read();
        for proof in &join.neighbor_proofs {
            if proof.host != join.node_id {
                return Err("Invalid join, neighbor proof names another host".into());
            }
            let Some(neighbor) = store.get(&proof.neighbor) else {
                return Err(format!("Invalid join, unknown neighbor {}", proof.neighbor));
            };
            if !self.verify_signed(
                neighbor_proof_sign_bytes(proof),
                &proof.signature,
                &neighbor.public_key,
            ) {
                return Err(format!(
                    "Invalid join, invalid neighbor proof from {}",
                    proof.neighbor
                ));
            }
        }
        Ok(())
    }

    pub fn is_valid_leave_message(&self, message: &HostMessage) -> Validation {
        match (message.message_type, message.update()) {
            (MessageType::HostLeave, Some(Update::Leave(leave))) => self
                .check_host_update(
                    message,
                    leave.node_id,
                    leave.timestamp,
                    leave_sign_bytes(leave),
                    &leave.signature,
                    "leave",
                )
                .into(),
            _ => Validation::reject("Invalid leave, message does not carry a leave update"),
        }
    }

    pub fn is_valid_rejoin_message(&self, message: &HostMessage) -> Validation {
        match (message.message_type, message.update()) {
            (MessageType::HostJoin, Some(Update::Rejoin(rejoin))) => self
                .check_host_update(
                    message,
                    rejoin.node_id,
                    rejoin.timestamp,
                    rejoin_sign_bytes(rejoin),
                    &rejoin.signature,
                    "rejoin",
                )
                .into(),
            _ => Validation::reject("Invalid rejoin, message does not carry a rejoin update"),
        }
    }

    /// Leave and rejoin: self-signed by a host already in the table
    fn check_host_update(
        &self,
        message: &HostMessage,
        node_id: NodeId,
        timestamp: u64,
        bytes: host_tracker_core::Result<Vec<u8>>,
        signature: &Option<Signature>,
        what: &str,
    ) -> Result<(), String> {
        self.check_envelope(message, what)?;
        self.check_fresh(timestamp, what)?;
        if message.sender != node_id {
            return Err(format!("Invalid {what}, sender does not match update"));
        }
        let public_key = self
            .store
            .read()
            .get(&node_id)
            .map(|entry| entry.public_key)
            .ok_or_else(|| format!("Invalid {what}, unknown host"))?;
        if message.public_key != public_key {
            return Err(format!("Invalid {what}, envelope key does not match host"));
        }
        if !self.verify_signed(bytes, signature, &public_key) {
            return Err(format!("Invalid {what}, invalid update signature"));
        }
        Ok(())
    }

    pub fn is_valid_failure_message(&self, message: &HostMessage) -> Validation {
        match (message.message_type, message.update()) {
            (MessageType::HostFailure, Some(Update::Failure(failure))) => {
                self.check_failure(message, failure).into()
            }
            _ => Validation::reject("Invalid failure, message does not carry a failure update"),
        }
    }

    pub fn is_valid_failure_request(&self, message: &HostMessage) -> Validation {
        match (message.message_type, message.update()) {
            (MessageType::PendingFailureRequest, Some(Update::Failure(failure))) => {
                self.check_failure_request(message, failure).into()
            }
            _ => Validation::reject(
                "Invalid failure request, message does not carry a failure update",
            ),
        }
    }

    fn check_failure_sender(
        &self,
        store: &EntryStore,
        message: &HostMessage,
        failure: &FailureUpdate,
        what: &str,
    ) -> Result<(), String> {
        if !store.contains(&failure.node_id) {
            return Err(format!("Invalid {what}, unknown host"));
        }
        match store.get(&message.sender) {
            Some(entry) if entry.public_key == message.public_key => Ok(()),
            _ => Err(format!("Invalid {what}, sender is not a known host")),
        }
    }

    fn check_failure(&self, message: &HostMessage, failure: &FailureUpdate) -> Result<(), String> {
        const WHAT: &str = "failure";
        self.check_envelope(message, WHAT)?;
        self.check_fresh(failure.timestamp, WHAT)?;

        let store = self.store.read();
        self.check_failure_sender(&store, message, failure, WHAT)?;

        let quorum = self.settings.failure_quorum;
        if failure.signatures.len() < quorum {
            return Err(format!(
                "Invalid {WHAT}, {} of {} required signatures",
                failure.signatures.len(),
                quorum
            ));
        }

        let mut signers = HashSet::new();
        for object in &failure.signatures {
            self.check_signature_object(&store, failure, object)?;
            if !signers.insert(object.public_key) {
                return Err(format!("Invalid {WHAT}, duplicate signer"));
            }
        }
        Ok(())
    }

    fn check_failure_request(
        &self,
        message: &HostMessage,
        failure: &FailureUpdate,
    ) -> Result<(), String> {
        const WHAT: &str = "failure request";
        self.check_envelope(message, WHAT)?;
        self.check_fresh(failure.timestamp, WHAT)?;

        let store = self.store.read();
        self.check_failure_sender(&store, message, failure, WHAT)?;

        if failure.nonce != derive_failure_nonce(&failure.node_id, &message.sender, failure.timestamp)
        {
            return Err(format!("Invalid {WHAT}, nonce does not bind proposer"));
        }
        let Some(first) = failure.signatures.first() else {
            return Err(format!("Invalid {WHAT}, missing proposer signature"));
        };
        if first.public_key != message.public_key {
            return Err(format!("Invalid {WHAT}, first signer is not the proposer"));
        }
        self.check_signature_object(&store, failure, first)
    }

    fn check_signature_object(
        &self,
        store: &EntryStore,
        failure: &FailureUpdate,
        object: &SignatureObject,
    ) -> Result<(), String> {
        if object.node_id != failure.node_id || object.nonce != failure.nonce {
            return Err("Invalid failure, signature for another proposal".into());
        }
        match store.find_by_public_key(&object.public_key) {
            None => return Err("Invalid failure, signer is not a known host".into()),
            Some(signer) if signer == failure.node_id => {
                return Err("Invalid failure, target cannot sign its own failure".into())
            }
            Some(_) => {}
        }
        if !self.verify_signed(
            signature_object_sign_bytes(object),
            &object.signature,
            &object.public_key,
        ) {
            return Err("Invalid failure, invalid signature from signer".into());
        }
        Ok(())
    }

    /// Signature check used while collecting co-signatures
    pub fn verify_failure_signature(&self, failure: &FailureUpdate, object: &SignatureObject) -> bool {
        let store = self.store.read();
        self.check_signature_object(&store, failure, object).is_ok()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Validate one inbound message and, when it carries an actionable update,
    /// apply it and buffer it for gossip. `Err` is reserved for local faults
    /// (missing identity, table corruption).
    pub async fn handle_message(&self, message: HostMessage) -> Result<MessageOutcome, TrackerError> {
        if !self.is_valid_host_message(&message) {
            return Ok(self.reject(&message, "Invalid message, envelope signature does not verify"));
        }
        if let Err(reason) = self.check_fresh(message.timestamp, "message") {
            return Ok(self.reject(&message, reason));
        }

        match (message.message_type, &message.data) {
            (MessageType::NeighborRequest, _) => {
                Ok(match self.check_neighbor_request(&message).await {
                    Ok(node_id) => MessageOutcome::NeighborRequestAccepted(node_id),
                    Err(reason) => self.reject(&message, reason),
                })
            }
            (MessageType::PendingFailureRequest, MessageData::Update(Update::Failure(failure))) => {
                Ok(match self.check_failure_request(&message, failure) {
                    Ok(()) => MessageOutcome::FailureProposal(failure.clone()),
                    Err(reason) => self.reject(&message, reason),
                })
            }
            (MessageType::HostJoin, MessageData::Update(Update::Join(join))) => {
                self.handle_join(&message, join).await
            }
            (MessageType::HostJoin, MessageData::Update(update @ Update::Rejoin(_)))
            | (MessageType::HostLeave, MessageData::Update(update @ Update::Leave(_)))
            | (MessageType::HostFailure, MessageData::Update(update @ Update::Failure(_))) => {
                self.handle_host_update(&message, update)
            }
            (message_type, _) => Ok(self.reject(
                &message,
                format!("Invalid message, {message_type} does not match its payload"),
            )),
        }
    }

    fn reject(&self, message: &HostMessage, reason: impl Into<String>) -> MessageOutcome {
        let reason = reason.into();
        debug!(
            "Rejected {} from {}: {}",
            message.message_type, message.sender, reason
        );
        MessageOutcome::Rejected { reason }
    }

    fn is_duplicate(&self, update: &Update) -> bool {
        if self.delta.lock().contains(update) {
            return true;
        }
        self.store
            .read()
            .get(&update.node_id())
            .map(|entry| entry.log.contains(update))
            .unwrap_or(false)
    }

    async fn handle_join(
        &self,
        message: &HostMessage,
        join: &JoinUpdate,
    ) -> Result<MessageOutcome, TrackerError> {
        let update = Update::Join(join.clone());
        if self.is_duplicate(&update) {
            return Ok(MessageOutcome::Duplicate);
        }

        let record = match self.check_join(message, join).await {
            Ok(record) => record,
            Err(reason) => return Ok(self.reject(message, reason)),
        };
        self.commit(message, &update, Some(&record))
    }

    /// Leave, rejoin and failure: the host must already be in the table
    fn handle_host_update(
        &self,
        message: &HostMessage,
        update: &Update,
    ) -> Result<MessageOutcome, TrackerError> {
        if self.is_duplicate(update) {
            return Ok(MessageOutcome::Duplicate);
        }
        let node_id = update.node_id();
        if !self.store.read().contains(&node_id) {
            return Ok(self.defer(node_id, message));
        }

        let checked = match update {
            Update::Leave(leave) => self.check_host_update(
                message,
                leave.node_id,
                leave.timestamp,
                leave_sign_bytes(leave),
                &leave.signature,
                "leave",
            ),
            Update::Rejoin(rejoin) => self.check_host_update(
                message,
                rejoin.node_id,
                rejoin.timestamp,
                rejoin_sign_bytes(rejoin),
                &rejoin.signature,
                "rejoin",
            ),
            Update::Failure(failure) => self.check_failure(message, failure),
            Update::Join(_) => Err("Invalid join, missing pledge admission".into()),
        };
        if let Err(reason) = checked {
            return Ok(self.reject(message, reason));
        }

        self.commit(message, update, None)
    }

    /// Apply a validated update under the write lock, then notify and buffer.
    fn commit(
        &self,
        message: &HostMessage,
        update: &Update,
        record: Option<&TransactionRecord>,
    ) -> Result<MessageOutcome, TrackerError> {
        let node_id = update.node_id();
        let kind = update.kind();

        let (added, active) = {
            let mut store = self.store.write();
            // A concurrent copy may have been applied while the ledger was consulted
            if store
                .get(&node_id)
                .is_some_and(|entry| entry.log.contains(update))
            {
                return Ok(MessageOutcome::Duplicate);
            }
            let added = match record {
                Some(record) => match store.add(record) {
                    Ok(_) => true,
                    Err(StoreError::DuplicateEntry(_)) => false,
                    Err(e) => return Err(e.into()),
                },
                None => false,
            };

            match store.apply(update.clone()) {
                Ok(entry) => (added, entry.status.is_active()),
                Err(StoreError::StaleUpdate {
                    timestamp,
                    updated_at,
                    ..
                }) => {
                    return Ok(self.reject(
                        message,
                        format!(
                            "Invalid {}, stale update ({timestamp} < {updated_at})",
                            kind.as_str()
                        ),
                    ));
                }
                Err(StoreError::UnknownEntry(_)) => return Ok(self.defer(node_id, message)),
                Err(e) => return Err(e.into()),
            }
        };

        if added {
            self.emit(TrackerEvent::EntryAdded(node_id));
        }
        self.emit(TrackerEvent::EntryUpdated {
            node_id,
            kind,
            active,
        });
        self.delta.lock().add_message(message);
        info!("Applied {} for {}", kind.as_str(), node_id);

        if kind == UpdateKind::Join {
            self.replay_deferred(&node_id)?;
        }
        Ok(MessageOutcome::Applied { node_id, kind })
    }

    /// Park an update for an unknown host. Parked messages that fell out of the
    /// acceptance window are dropped first; replay would reject them anyway.
    fn defer(&self, node_id: NodeId, message: &HostMessage) -> MessageOutcome {
        let window = self.settings.message_window_ms;
        let mut deferred = self.deferred.lock();
        deferred.retain(|_, queue| {
            queue.retain(|parked| self.crypto.is_within_time_window(parked.timestamp, window));
            !queue.is_empty()
        });

        if deferred
            .get(&node_id)
            .is_some_and(|queue| queue.contains(message))
        {
            return MessageOutcome::Deferred(node_id);
        }

        let total: usize = deferred.values().map(Vec::len).sum();
        if total >= self.settings.max_deferred_total {
            warn!("Deferred updates at capacity ({}), dropping update for {}", total, node_id);
            return MessageOutcome::Rejected {
                reason: format!("Deferred updates at capacity ({total})"),
            };
        }

        let queue = deferred.entry(node_id).or_default();
        if queue.len() >= self.settings.max_deferred_per_node {
            warn!("Deferred queue full for {}, dropping update", node_id);
            return MessageOutcome::Rejected {
                reason: format!("Deferred queue full for {node_id}"),
            };
        }
        queue.push(message.clone());
        debug!("Deferred {} for unknown host {}", message.message_type, node_id);
        MessageOutcome::Deferred(node_id)
    }

    fn replay_deferred(&self, node_id: &NodeId) -> Result<(), TrackerError> {
        let Some(queue) = self.deferred.lock().remove(node_id) else {
            return Ok(());
        };

        for message in queue {
            if let Some(update) = message.update() {
                let outcome = self.handle_host_update(&message, update)?;
                debug!("Replayed deferred update for {}: {:?}", node_id, outcome);
            }
        }
        Ok(())
    }

    /// Number of parked updates across all unknown hosts
    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().values().map(Vec::len).sum()
    }

    // =========================================================================
    // ADMINISTRATION
    // =========================================================================

    /// Ledger-driven admission. `Ok(None)` when the host is already present
    /// or the record is not a pledge.
    pub fn admit_pledge(&self, record: &TransactionRecord) -> Result<Option<NodeId>, TrackerError> {
        if record.tx_type != TxType::Pledge {
            warn!("Ignoring non-pledge transaction {}", record.key);
            return Ok(None);
        }

        let added = self.store.write().add(record);
        match added {
            Ok(node_id) => {
                self.emit(TrackerEvent::EntryAdded(node_id));
                self.replay_deferred(&node_id)?;
                Ok(Some(node_id))
            }
            Err(StoreError::DuplicateEntry(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a host outright (e.g. pledge expiry)
    pub fn remove_entry(&self, node_id: &NodeId) -> Option<Entry> {
        let removed = self.store.write().remove(node_id);
        if removed.is_some() {
            self.deferred.lock().remove(node_id);
            self.emit(TrackerEvent::EntryRemoved(*node_id));
            info!("Removed entry {}", node_id);
        }
        removed
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub fn get_entry(&self, node_id: &NodeId) -> Option<Entry> {
        self.store.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.store.read().contains(node_id)
    }

    pub fn all_ids(&self) -> Vec<NodeId> {
        self.store.read().all_ids()
    }

    pub fn active_ids(&self) -> Vec<NodeId> {
        self.store.read().active_ids()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Overlay neighbors of this host over a snapshot of active hosts
    pub fn neighbors(&self) -> Result<NeighborSet, TrackerError> {
        let id = self.local_id()?;
        let (candidates, table_len) = {
            let store = self.store.read();
            (store.active_ids(), store.len())
        };
        Ok(select_neighbors(&id, &candidates, table_len, None))
    }

    /// Direct-connect neighbors of this host over a snapshot of active hosts
    pub fn host_neighbors(&self) -> Result<Vec<NodeId>, TrackerError> {
        let id = self.local_id()?;
        let active = self.active_ids();
        Ok(select_host_neighbors(
            &id,
            &active,
            self.settings.min_host_neighbors,
        ))
    }

    /// Run `f` with exclusive access to the delta buffer
    pub fn with_delta<R>(&self, f: impl FnOnce(&mut DeltaBuffer) -> R) -> R {
        f(&mut self.delta.lock())
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Serialized table for the storage collaborator
    pub fn table_bytes(&self) -> Result<Vec<u8>, TrackerError> {
        Ok(self.store.read().to_bytes()?)
    }

    /// Replace the table with a persisted one after checking every entry hash
    pub fn load_table(&self, bytes: &[u8]) -> Result<usize, TrackerError> {
        let store = EntryStore::from_bytes(bytes)?;
        let count = store.len();
        *self.store.write() = store;
        Ok(count)
    }

    pub fn verify_integrity(&self) -> Result<(), TrackerError> {
        Ok(self.store.read().verify_integrity()?)
    }
}
