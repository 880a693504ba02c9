//! Transaction verification state machine
//!
//! Coordinates the expiry deadline, the per-method attempt budget, external
//! verification calls and the version-checked persist. All transaction
//! mutations go through here; concurrent submissions for the same
//! transaction are serialized by the store's optimistic versioning, with one
//! internal retry on conflict.

use crate::models::{
    AttemptOutcome, BiometricMethod, Transaction, TransactionStatus, TransactionType,
    VerificationMethod,
};
use crate::providers::{FaceMatcher, ReferenceVault, SpeechTranscriber};
use crate::storage::TransactionStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use veriflow_common::{Error, Result};

/// Tunable verification behavior
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    /// Minimum face similarity accepted as a match
    pub similarity_threshold: f64,

    /// Per-method attempt budget
    pub max_attempts: u32,

    /// How long a transaction stays verifiable after creation
    pub transaction_ttl: chrono::Duration,

    /// Amounts above this lose risk points
    pub large_amount_threshold: f64,

    /// Pause before the single retry of a failed provider call
    pub provider_retry_backoff: std::time::Duration,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            max_attempts: 3,
            transaction_ttl: chrono::Duration::minutes(15),
            large_amount_threshold: 10_000.0,
            provider_retry_backoff: std::time::Duration::from_millis(250),
        }
    }
}

/// The transaction state machine
pub struct VerificationOrchestrator {
    store: Arc<dyn TransactionStore>,
    faces: Arc<dyn FaceMatcher>,
    speech: Arc<dyn SpeechTranscriber>,
    vault: Arc<dyn ReferenceVault>,
    policy: VerificationPolicy,
}

impl VerificationOrchestrator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        faces: Arc<dyn FaceMatcher>,
        speech: Arc<dyn SpeechTranscriber>,
        vault: Arc<dyn ReferenceVault>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            store,
            faces,
            speech,
            vault,
            policy,
        }
    }

    /// Create a pending transaction
    pub async fn create(
        &self,
        owner_id: &str,
        transaction_type: TransactionType,
        amount: f64,
        currency: &str,
        verification_method: VerificationMethod,
    ) -> Result<Transaction> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }
        let currency = currency.trim();
        if currency.is_empty() || currency.len() > 8 {
            return Err(Error::Validation("invalid currency code".to_string()));
        }

        let txn = Transaction::new(
            owner_id.to_string(),
            transaction_type,
            amount,
            currency.to_uppercase(),
            verification_method,
            self.policy.transaction_ttl,
        );
        self.store.insert(&txn).await?;

        info!(
            "Created transaction {} for {} ({} {})",
            txn.id, txn.owner_id, txn.amount, txn.currency
        );

        Ok(txn)
    }

    /// Load a transaction, applying lazy expiry on read.
    ///
    /// If the deadline has passed and the transaction is still Pending, this
    /// read transitions it to Expired and persists before returning; only
    /// the first reader writes.
    pub async fn get(&self, id: &str) -> Result<Transaction> {
        let mut txn = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if txn.status == TransactionStatus::Pending && txn.is_expired_at(Utc::now()) {
            let expected = txn.version;
            txn.mark_expired();
            txn.version += 1;

            match self.store.save(&txn, expected).await {
                Ok(()) => {
                    info!("Transaction {} expired lazily on read", txn.id);
                }
                Err(Error::ConcurrencyConflict(_)) => {
                    // Another request got there first; the stored state wins
                    return self
                        .store
                        .load(id)
                        .await?
                        .ok_or_else(|| Error::NotFound(id.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(txn)
    }

    /// Verify face evidence against the owner's enrolled reference image
    pub async fn verify_face(
        &self,
        id: &str,
        probe: &[u8],
        evidence_ref: Option<String>,
    ) -> Result<Transaction> {
        match self.try_verify_face(id, probe, evidence_ref.clone()).await {
            Err(Error::ConcurrencyConflict(_)) => {
                debug!("Version conflict on {}, retrying face verification", id);
                self.try_verify_face(id, probe, evidence_ref).await
            }
            result => result,
        }
    }

    async fn try_verify_face(
        &self,
        id: &str,
        probe: &[u8],
        evidence_ref: Option<String>,
    ) -> Result<Transaction> {
        let mut txn = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if let Some(current) = self.preflight(&mut txn, BiometricMethod::Face).await? {
            return Ok(current);
        }

        let reference = self
            .call_with_retry("reference vault", || {
                self.vault.face_reference(&txn.owner_id)
            })
            .await?;

        let similarity = self
            .call_with_retry("face matcher", || self.faces.compare(probe, &reference))
            .await?;

        let matched = similarity >= self.policy.similarity_threshold;
        self.commit_attempt(txn, BiometricMethod::Face, matched, similarity, evidence_ref, None)
            .await
    }

    /// Verify voice evidence: the transcribed audio must equal the expected
    /// phrase after case/punctuation/whitespace normalization.
    pub async fn verify_voice(
        &self,
        id: &str,
        audio: &[u8],
        expected_text: &str,
        evidence_ref: Option<String>,
    ) -> Result<Transaction> {
        if expected_text.trim().is_empty() {
            return Err(Error::Validation("expected text must not be empty".to_string()));
        }

        match self
            .try_verify_voice(id, audio, expected_text, evidence_ref.clone())
            .await
        {
            Err(Error::ConcurrencyConflict(_)) => {
                debug!("Version conflict on {}, retrying voice verification", id);
                self.try_verify_voice(id, audio, expected_text, evidence_ref)
                    .await
            }
            result => result,
        }
    }

    async fn try_verify_voice(
        &self,
        id: &str,
        audio: &[u8],
        expected_text: &str,
        evidence_ref: Option<String>,
    ) -> Result<Transaction> {
        let mut txn = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if let Some(current) = self.preflight(&mut txn, BiometricMethod::Voice).await? {
            return Ok(current);
        }

        let transcription = self
            .call_with_retry("speech transcriber", || self.speech.transcribe(audio))
            .await?;

        let matched = normalize_phrase(&transcription.text) == normalize_phrase(expected_text);
        let note = Some(format!("transcript: {:?}", transcription.text));

        self.commit_attempt(
            txn,
            BiometricMethod::Voice,
            matched,
            transcription.confidence,
            evidence_ref,
            note,
        )
        .await
    }

    /// Shared entry checks. Returns `Ok(Some(_))` for the idempotent
    /// terminal no-op, `Ok(None)` when verification should proceed.
    async fn preflight(
        &self,
        txn: &mut Transaction,
        method: BiometricMethod,
    ) -> Result<Option<Transaction>> {
        if txn.status == TransactionStatus::Pending && txn.is_expired_at(Utc::now()) {
            self.persist_expiry(txn).await?;
            return Err(Error::Expired);
        }

        match txn.status {
            TransactionStatus::Expired => return Err(Error::Expired),
            TransactionStatus::Approved | TransactionStatus::Rejected => {
                debug!(
                    "Transaction {} already {:?}; verification is a no-op",
                    txn.id, txn.status
                );
                return Ok(Some(txn.clone()));
            }
            TransactionStatus::Pending => {}
        }

        if txn.attempts_for(method) >= self.policy.max_attempts {
            return Err(Error::AttemptsExhausted);
        }

        Ok(None)
    }

    /// Record the attempt and persist under the version check.
    ///
    /// Re-validates expiry first: the deadline may have passed while the
    /// provider call was in flight, in which case the transaction expires
    /// and the result is discarded.
    async fn commit_attempt(
        &self,
        mut txn: Transaction,
        method: BiometricMethod,
        matched: bool,
        confidence: f64,
        evidence_ref: Option<String>,
        note: Option<String>,
    ) -> Result<Transaction> {
        let now = Utc::now();
        if txn.is_expired_at(now) {
            self.persist_expiry(&mut txn).await?;
            return Err(Error::Expired);
        }

        let outcome = if matched {
            AttemptOutcome::Match
        } else {
            AttemptOutcome::Mismatch
        };
        txn.record_attempt(method, outcome, confidence, note);

        if matched {
            txn.apply_verified(
                method,
                confidence,
                evidence_ref,
                now,
                self.policy.large_amount_threshold,
            );
        }

        let expected = txn.version;
        txn.version += 1;
        self.store.save(&txn, expected).await?;

        if matched {
            info!(
                "Transaction {} {:?} verification matched (confidence {:.2}, status {:?})",
                txn.id, method, confidence, txn.status
            );
            Ok(txn)
        } else {
            let remaining = self.policy.max_attempts - txn.attempts_for(method);
            warn!(
                "Transaction {} {:?} verification mismatch ({} attempt(s) remaining)",
                txn.id, method, remaining
            );
            Err(Error::VerificationMismatch {
                remaining_attempts: remaining,
            })
        }
    }

    async fn persist_expiry(&self, txn: &mut Transaction) -> Result<()> {
        let expected = txn.version;
        txn.mark_expired();
        txn.version += 1;
        // A conflict here means a concurrent writer advanced the
        // transaction; it propagates so the caller re-reads fresh state.
        self.store.save(txn, expected).await?;
        info!("Transaction {} expired", txn.id);
        Ok(())
    }

    /// Run a provider call, retrying once with backoff on provider failure.
    /// Provider failures never consume an attempt from the budget: no
    /// definitive evidence was produced.
    async fn call_with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(Error::ExternalService(first)) => {
                warn!("{} call failed, retrying once: {}", what, first);
                tokio::time::sleep(self.policy.provider_retry_backoff).await;
                op().await
            }
            result => result,
        }
    }
}

/// Lowercase, strip punctuation, collapse whitespace
fn normalize_phrase(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
