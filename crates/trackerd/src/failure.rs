//! Failure signature collection
//!
//! A proposer broadcasts a `pending-failure-request`; neighbors answer with
//! their own [`SignatureObject`]. A [`FailureRound`] accumulates those answers
//! until the quorum is met or the deadline passes.

use host_tracker_core::types::*;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Default number of signatures a failure needs
pub const DEFAULT_FAILURE_QUORUM: usize = 3;

/// Default collection deadline
pub const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure collection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FailureError {
    #[error("Signature targets a different failure proposal")]
    Mismatch,
    #[error("Signer already counted")]
    DuplicateSigner,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Collection timed out with {collected}/{quorum} signatures")]
    Timeout { collected: usize, quorum: usize },
    #[error("Signature channel closed with {collected}/{quorum} signatures")]
    ChannelClosed { collected: usize, quorum: usize },
}

/// One in-flight failure proposal
#[derive(Debug, Clone)]
pub struct FailureRound {
    proposal: FailureUpdate,
    quorum: usize,
    deadline: Instant,
    signers: HashSet<Bytes32>,
}

impl FailureRound {
    /// Start a round from a proposal; signatures already on it are counted
    pub fn new(proposal: FailureUpdate, quorum: usize, timeout: Duration) -> Self {
        let mut signers = HashSet::new();
        let mut proposal = proposal;
        proposal.signatures.retain(|s| signers.insert(s.public_key));

        Self {
            proposal,
            quorum: quorum.max(1),
            deadline: Instant::now() + timeout,
            signers,
        }
    }

    pub fn target(&self) -> NodeId {
        self.proposal.node_id
    }

    pub fn nonce(&self) -> Bytes32 {
        self.proposal.nonce
    }

    pub fn timestamp(&self) -> u64 {
        self.proposal.timestamp
    }

    pub fn signatures(&self) -> &[SignatureObject] {
        &self.proposal.signatures
    }

    pub fn has_quorum(&self) -> bool {
        self.proposal.signatures.len() >= self.quorum
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Count one answer. `verify` checks the signature itself.
    pub fn add(
        &mut self,
        signature: SignatureObject,
        verify: impl Fn(&SignatureObject) -> bool,
    ) -> Result<usize, FailureError> {
        if self.is_expired() {
            return Err(self.timeout());
        }
        if signature.node_id != self.proposal.node_id || signature.nonce != self.proposal.nonce {
            return Err(FailureError::Mismatch);
        }
        if self.signers.contains(&signature.public_key) {
            return Err(FailureError::DuplicateSigner);
        }
        if !verify(&signature) {
            return Err(FailureError::InvalidSignature);
        }

        self.signers.insert(signature.public_key);
        self.proposal.signatures.push(signature);
        Ok(self.proposal.signatures.len())
    }

    pub fn into_signatures(self) -> Vec<SignatureObject> {
        self.proposal.signatures
    }

    fn timeout(&self) -> FailureError {
        FailureError::Timeout {
            collected: self.proposal.signatures.len(),
            quorum: self.quorum,
        }
    }
}

/// Accumulate answers from `answers` until the round reaches quorum or its
/// deadline passes. Rejected answers are logged and skipped.
pub async fn await_failure_quorum(
    mut round: FailureRound,
    answers: &mut mpsc::Receiver<SignatureObject>,
    verify: impl Fn(&SignatureObject) -> bool,
) -> Result<FailureRound, FailureError> {
    let remaining = round.deadline.saturating_duration_since(Instant::now());

    let collect = async {
        while !round.has_quorum() {
            let Some(answer) = answers.recv().await else {
                return Err(FailureError::ChannelClosed {
                    collected: round.proposal.signatures.len(),
                    quorum: round.quorum,
                });
            };
            if let Err(e) = round.add(answer, &verify) {
                debug!("Dropped failure signature for {}: {}", round.target(), e);
            }
        }
        Ok(())
    };
    let result = tokio::time::timeout(remaining, collect).await;

    match result {
        Ok(Ok(())) => Ok(round),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(round.timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal() -> FailureUpdate {
        FailureUpdate {
            node_id: NodeId([1; 32]),
            nonce: [2; 32],
            previous: None,
            timestamp: 10,
            signatures: vec![answer(10)],
        }
    }

    fn answer(signer: u8) -> SignatureObject {
        SignatureObject {
            node_id: NodeId([1; 32]),
            public_key: [signer; 32],
            nonce: [2; 32],
            timestamp: 11,
            signature: Some(vec![signer]),
        }
    }

    fn accept_all(_: &SignatureObject) -> bool {
        true
    }

    #[test]
    fn test_round_reaches_quorum() {
        let mut round = FailureRound::new(proposal(), 3, DEFAULT_FAILURE_TIMEOUT);
        assert!(!round.has_quorum());

        assert_eq!(round.add(answer(11), accept_all), Ok(2));
        assert_eq!(round.add(answer(12), accept_all), Ok(3));
        assert!(round.has_quorum());
        assert_eq!(round.into_signatures().len(), 3);
    }

    #[test]
    fn test_round_rejects_bad_answers() {
        let mut round = FailureRound::new(proposal(), 3, DEFAULT_FAILURE_TIMEOUT);

        assert_eq!(
            round.add(answer(10), accept_all),
            Err(FailureError::DuplicateSigner)
        );

        let mut other_nonce = answer(11);
        other_nonce.nonce = [3; 32];
        assert_eq!(round.add(other_nonce, accept_all), Err(FailureError::Mismatch));

        let mut other_target = answer(11);
        other_target.node_id = NodeId([4; 32]);
        assert_eq!(round.add(other_target, accept_all), Err(FailureError::Mismatch));

        assert_eq!(
            round.add(answer(11), |_| false),
            Err(FailureError::InvalidSignature)
        );
        assert_eq!(round.signatures().len(), 1);
    }

    #[test]
    fn test_expired_round_times_out() {
        let mut round = FailureRound::new(proposal(), 3, Duration::ZERO);
        assert!(round.is_expired());
        assert_eq!(
            round.add(answer(11), accept_all),
            Err(FailureError::Timeout {
                collected: 1,
                quorum: 3
            })
        );
    }

    #[tokio::test]
    async fn test_await_quorum_collects_from_channel() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(answer(10)).await.unwrap();
        tx.send(answer(11)).await.unwrap();
        tx.send(answer(12)).await.unwrap();

        let round = FailureRound::new(proposal(), 3, DEFAULT_FAILURE_TIMEOUT);
        let round = await_failure_quorum(round, &mut rx, accept_all).await.unwrap();
        assert!(round.has_quorum());
        assert_eq!(round.signatures().len(), 3);
    }

    #[tokio::test]
    async fn test_await_quorum_times_out() {
        let (_tx, mut rx) = mpsc::channel(8);
        let round = FailureRound::new(proposal(), 3, Duration::from_millis(20));

        let err = await_failure_quorum(round, &mut rx, accept_all)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FailureError::Timeout {
                collected: 1,
                quorum: 3
            }
        );
    }

    #[tokio::test]
    async fn test_await_quorum_channel_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(answer(11)).await.unwrap();
        drop(tx);

        let round = FailureRound::new(proposal(), 3, DEFAULT_FAILURE_TIMEOUT);
        let err = await_failure_quorum(round, &mut rx, accept_all)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FailureError::ChannelClosed {
                collected: 2,
                quorum: 3
            }
        );
    }
}
