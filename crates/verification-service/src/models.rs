//! Transaction entity and verification state

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk score at or above which a transaction is approved
pub const APPROVE_THRESHOLD: u8 = 70;

/// Risk score below which a transaction is rejected
pub const REJECT_FLOOR: u8 = 40;

/// Confidence above which a verified method earns the bonus points
const HIGH_CONFIDENCE: f64 = 0.8;

/// Transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Awaiting verification evidence
    Pending,
    /// Enough evidence accumulated; terminal
    Approved,
    /// Evidence ruled the transaction out; terminal
    Rejected,
    /// Deadline passed before a decision; terminal
    Expired,
}

impl TransactionStatus {
    /// Whether no further transition is permitted
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

/// Kind of transaction being verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Transfer,
    Withdrawal,
    Purchase,
}

/// Which biometric evidence the transaction requires, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Face,
    Voice,
    Both,
    None,
}

/// A single biometric modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiometricMethod {
    Face,
    Voice,
}

/// Outcome of one verification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Match,
    Mismatch,
}

/// Verification state of one method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodVerification {
    pub verified: bool,
    pub confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

/// Per-method verification records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face: Option<MethodVerification>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<MethodVerification>,
}

/// One entry in the append-only verification history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub timestamp: DateTime<Utc>,
    pub method: BiometricMethod,
    pub outcome: AttemptOutcome,
    pub confidence: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A payment-style transaction awaiting biometric verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub owner_id: String,

    #[serde(rename = "type")]
    pub transaction_type: TransactionType,

    pub amount: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub verification_method: VerificationMethod,
    pub verification_data: VerificationData,

    /// Derived evidence score in [0, 100]
    pub risk_score: u8,

    /// Append-only, never truncated
    pub verification_history: Vec<VerificationAttempt>,

    pub created_at: DateTime<Utc>,

    /// Fixed at creation; never moves
    pub expiry_time: DateTime<Utc>,

    /// Optimistic concurrency counter
    pub version: u64,
}

impl Transaction {
    /// Create a pending transaction expiring `ttl` from now
    pub fn new(
        owner_id: String,
        transaction_type: TransactionType,
        amount: f64,
        currency: String,
        verification_method: VerificationMethod,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            transaction_type,
            amount,
            currency,
            status: TransactionStatus::Pending,
            verification_method,
            verification_data: VerificationData::default(),
            risk_score: 0,
            verification_history: Vec::new(),
            created_at: now,
            expiry_time: now + ttl,
            version: 1,
        }
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry_time
    }

    /// Transition to the Expired terminal state
    pub fn mark_expired(&mut self) {
        self.status = TransactionStatus::Expired;
    }

    /// Number of recorded attempts for one method
    pub fn attempts_for(&self, method: BiometricMethod) -> u32 {
        self.verification_history
            .iter()
            .filter(|attempt| attempt.method == method)
            .count() as u32
    }

    /// Append a history entry
    pub fn record_attempt(
        &mut self,
        method: BiometricMethod,
        outcome: AttemptOutcome,
        confidence: f64,
        note: Option<String>,
    ) {
        self.verification_history.push(VerificationAttempt {
            timestamp: Utc::now(),
            method,
            outcome,
            confidence,
            note,
        });
    }

    /// Record a successful verification for one method, then recompute the
    /// risk score and derive the status from it.
    pub fn apply_verified(
        &mut self,
        method: BiometricMethod,
        confidence: f64,
        evidence_ref: Option<String>,
        verified_at: DateTime<Utc>,
        large_amount_threshold: f64,
    ) {
        let record = MethodVerification {
            verified: true,
            confidence,
            evidence_ref,
            verified_at: Some(verified_at),
        };
        match method {
            BiometricMethod::Face => self.verification_data.face = Some(record),
            BiometricMethod::Voice => self.verification_data.voice = Some(record),
        }

        self.recompute_risk(large_amount_threshold);
        self.derive_status();
    }

    /// Recompute the risk score from the current verification data.
    ///
    /// +40 when the required method set is fully satisfied, +20 per verified
    /// method, +20 per method with confidence above the bonus bound, -10 for
    /// large amounts, clamped to [0, 100].
    pub fn recompute_risk(&mut self, large_amount_threshold: f64) {
        let face = self.verification_data.face.as_ref();
        let voice = self.verification_data.voice.as_ref();

        let face_verified = face.is_some_and(|v| v.verified);
        let voice_verified = voice.is_some_and(|v| v.verified);

        let satisfied = match self.verification_method {
            VerificationMethod::Face => face_verified,
            VerificationMethod::Voice => voice_verified,
            VerificationMethod::Both => face_verified && voice_verified,
            VerificationMethod::None => false,
        };

        let mut score: i32 = 0;
        if satisfied {
            score += 40;
        }
        if face_verified {
            score += 20;
            if face.is_some_and(|v| v.confidence > HIGH_CONFIDENCE) {
                score += 20;
            }
        }
        if voice_verified {
            score += 20;
            if voice.is_some_and(|v| v.confidence > HIGH_CONFIDENCE) {
                score += 20;
            }
        }
        if self.amount > large_amount_threshold {
            score -= 10;
        }

        self.risk_score = score.clamp(0, 100) as u8;
    }

    fn derive_status(&mut self) {
        if self.status != TransactionStatus::Pending {
            return;
        }
        if self.risk_score >= APPROVE_THRESHOLD {
            self.status = TransactionStatus::Approved;
        } else if self.risk_score < REJECT_FLOOR {
            self.status = TransactionStatus::Rejected;
        }
        // Scores in [REJECT_FLOOR, APPROVE_THRESHOLD) stay Pending: more
        // verification steps may still be submitted up to the attempt budget
        // and before expiry.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(method: VerificationMethod, amount: f64) -> Transaction {
        Transaction::new(
            "user-1".to_string(),
            TransactionType::Payment,
            amount,
            "USD".to_string(),
            method,
            Duration::minutes(15),
        )
    }

    #[test]
    fn test_new_transaction_is_pending() {
        let txn = transaction(VerificationMethod::Face, 100.0);

        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(txn.risk_score, 0);
        assert_eq!(txn.version, 1);
        assert!(txn.expiry_time > txn.created_at);
    }

    #[test]
    fn test_single_method_high_confidence_approves() {
        let mut txn = transaction(VerificationMethod::Face, 100.0);

        txn.apply_verified(BiometricMethod::Face, 0.95, None, Utc::now(), 10_000.0);

        // 40 satisfied + 20 verified + 20 high confidence
        assert_eq!(txn.risk_score, 80);
        assert_eq!(txn.status, TransactionStatus::Approved);
    }

    #[test]
    fn test_exact_threshold_confidence_earns_no_bonus() {
        let mut txn = transaction(VerificationMethod::Face, 100.0);

        txn.apply_verified(BiometricMethod::Face, 0.8, None, Utc::now(), 10_000.0);

        // 40 satisfied + 20 verified, no bonus at exactly 0.8
        assert_eq!(txn.risk_score, 60);
        assert_eq!(txn.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_both_methods_clamp_to_100() {
        let mut txn = transaction(VerificationMethod::Both, 100.0);

        txn.apply_verified(BiometricMethod::Face, 0.95, None, Utc::now(), 10_000.0);
        txn.apply_verified(BiometricMethod::Voice, 0.9, None, Utc::now(), 10_000.0);

        // 40 + 20 + 20 + 20 + 20 = 120, clamped
        assert_eq!(txn.risk_score, 100);
        assert_eq!(txn.status, TransactionStatus::Approved);
    }

    #[test]
    fn test_partial_both_stays_pending() {
        let mut txn = transaction(VerificationMethod::Both, 100.0);

        txn.apply_verified(BiometricMethod::Face, 0.95, None, Utc::now(), 10_000.0);

        // 20 verified + 20 bonus, no satisfaction points yet
        assert_eq!(txn.risk_score, 40);
        assert_eq!(txn.status, TransactionStatus::Pending);
    }

    #[test]
    fn test_large_amount_penalty() {
        let mut txn = transaction(VerificationMethod::Face, 50_000.0);

        txn.apply_verified(BiometricMethod::Face, 0.95, None, Utc::now(), 10_000.0);

        assert_eq!(txn.risk_score, 70);
        assert_eq!(txn.status, TransactionStatus::Approved);
    }

    #[test]
    fn test_risk_score_never_negative() {
        let mut txn = transaction(VerificationMethod::Both, 50_000.0);

        txn.recompute_risk(10_000.0);

        assert_eq!(txn.risk_score, 0);
    }

    #[test]
    fn test_attempts_counted_per_method() {
        let mut txn = transaction(VerificationMethod::Both, 100.0);

        txn.record_attempt(BiometricMethod::Face, AttemptOutcome::Mismatch, 0.4, None);
        txn.record_attempt(BiometricMethod::Face, AttemptOutcome::Match, 0.9, None);
        txn.record_attempt(BiometricMethod::Voice, AttemptOutcome::Mismatch, 0.2, None);

        assert_eq!(txn.attempts_for(BiometricMethod::Face), 2);
        assert_eq!(txn.attempts_for(BiometricMethod::Voice), 1);
        assert_eq!(txn.verification_history.len(), 3);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Approved.is_terminal());
        assert!(TransactionStatus::Rejected.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
    }

    #[test]
    fn test_expiry_check() {
        let txn = transaction(VerificationMethod::Face, 100.0);

        assert!(!txn.is_expired_at(Utc::now()));
        assert!(txn.is_expired_at(Utc::now() + Duration::minutes(16)));
    }
}
