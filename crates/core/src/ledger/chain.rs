use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::decision::{ApprovalDecision, StatusOverride};
use crate::domain::expense::ExpenseId;
use crate::domain::user::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerRecord {
    Decision(ApprovalDecision),
    Override(StatusOverride),
}

impl LedgerRecord {
    pub fn expense_id(&self) -> &ExpenseId {
        match self {
            Self::Decision(decision) => &decision.expense_id,
            Self::Override(record) => &record.expense_id,
        }
    }

    pub fn actor_id(&self) -> &UserId {
        match self {
            Self::Decision(decision) => &decision.approver_id,
            Self::Override(record) => &record.admin_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Decision(decision) => decision.timestamp,
            Self::Override(record) => record.timestamp,
        }
    }

    pub fn action_key(&self) -> String {
        match self {
            Self::Decision(decision) => {
                format!("decision:{}:{}", decision.step_order, decision.decision.as_str())
            }
            Self::Override(record) => format!("override:{}", record.status.as_str()),
        }
    }

    pub fn as_decision(&self) -> Option<&ApprovalDecision> {
        match self {
            Self::Decision(decision) => Some(decision),
            Self::Override(_) => None,
        }
    }
}

/// One sealed link of an expense's ledger chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub expense_id: ExpenseId,
    pub sequence: u64,
    pub record: LedgerRecord,
    pub content_hash: String,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
    pub signature: String,
}

impl LedgerEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.record.timestamp()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub expense_id: ExpenseId,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

impl VerificationResult {
    fn broken(
        expense_id: &ExpenseId,
        verified_entries: usize,
        latest_hash: Option<String>,
        reason: String,
    ) -> Self {
        Self {
            expense_id: expense_id.clone(),
            valid: false,
            verified_entries,
            latest_hash,
            failure_reason: Some(reason),
        }
    }
}

/// Seals and verifies ledger entries with an HMAC-SHA256 key.
#[derive(Clone, Debug)]
pub struct ChainSigner {
    key: SecretString,
}

impl ChainSigner {
    pub fn new(key: SecretString) -> Self {
        Self { key }
    }

    pub fn seal(&self, previous: Option<&LedgerEntry>, record: LedgerRecord) -> LedgerEntry {
        let expense_id = record.expense_id().clone();
        let sequence = previous.map_or(1, |entry| entry.sequence.saturating_add(1));
        let prev_hash = previous.map(|entry| entry.entry_hash.clone());
        let content_hash = content_hash(&record);
        let entry_hash =
            hash_entry_material(&expense_id, sequence, &content_hash, prev_hash.as_deref(), &record);
        let signature = self.sign(&entry_hash);

        LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            expense_id,
            sequence,
            record,
            content_hash,
            prev_hash,
            entry_hash,
            signature,
        }
    }

    /// Entries must be given in sequence order. An empty chain is valid.
    pub fn verify(&self, expense_id: &ExpenseId, entries: &[LedgerEntry]) -> VerificationResult {
        let mut previous_hash: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            let expected_sequence = u64::try_from(index).unwrap_or(u64::MAX).saturating_add(1);
            if entry.sequence != expected_sequence {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!(
                        "sequence mismatch at entry {}: expected {}, found {}",
                        entry.entry_id, expected_sequence, entry.sequence
                    ),
                );
            }

            if &entry.expense_id != expense_id || entry.record.expense_id() != expense_id {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!("entry {} belongs to another expense", entry.entry_id),
                );
            }

            if entry.prev_hash != previous_hash {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!("previous hash mismatch at entry {}", entry.entry_id),
                );
            }

            if content_hash(&entry.record) != entry.content_hash {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!("content hash mismatch at entry {}", entry.entry_id),
                );
            }

            let computed_entry_hash = hash_entry_material(
                &entry.expense_id,
                entry.sequence,
                &entry.content_hash,
                entry.prev_hash.as_deref(),
                &entry.record,
            );
            if computed_entry_hash != entry.entry_hash {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!("entry hash mismatch at entry {}", entry.entry_id),
                );
            }

            if self.sign(&entry.entry_hash) != entry.signature {
                return VerificationResult::broken(
                    expense_id,
                    index,
                    previous_hash,
                    format!("signature mismatch at entry {}", entry.entry_id),
                );
            }

            previous_hash = Some(entry.entry_hash.clone());
        }

        VerificationResult {
            expense_id: expense_id.clone(),
            valid: true,
            verified_entries: entries.len(),
            latest_hash: previous_hash,
            failure_reason: None,
        }
    }

    fn sign(&self, entry_hash: &str) -> String {
        hmac_hex(self.key.expose_secret().as_bytes(), entry_hash.as_bytes())
    }
}

fn content_hash(record: &LedgerRecord) -> String {
    let canonical_payload = match serde_json::to_vec(record) {
        Ok(payload) => payload,
        Err(_) => record.action_key().into_bytes(),
    };
    sha256_hex(&canonical_payload)
}

fn hash_entry_material(
    expense_id: &ExpenseId,
    sequence: u64,
    content_hash: &str,
    prev_hash: Option<&str>,
    record: &LedgerRecord,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        expense_id.0,
        sequence,
        content_hash,
        prev_hash.unwrap_or(""),
        record.timestamp().to_rfc3339(),
        record.actor_id().0,
        record.action_key(),
    );
    sha256_hex(material.as_bytes())
}

fn hmac_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return sha256_hex(payload),
    };
    mac.update(payload);
    encode_hex(mac.finalize().into_bytes().as_slice())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use secrecy::SecretString;

    use super::{ChainSigner, LedgerEntry, LedgerRecord};
    use crate::domain::decision::{ApprovalDecision, Decision, DecisionId, StatusOverride};
    use crate::domain::expense::{ExpenseId, ExpenseStatus};
    use crate::domain::user::UserId;

    fn signer(key: &str) -> ChainSigner {
        ChainSigner::new(SecretString::from(key.to_string()))
    }

    fn vote(expense: &str, approver: &str, step: u32, offset_secs: i64) -> LedgerRecord {
        LedgerRecord::Decision(ApprovalDecision {
            id: DecisionId(format!("{approver}-{step}")),
            expense_id: ExpenseId(expense.to_string()),
            approver_id: UserId(approver.to_string()),
            step_order: step,
            decision: Decision::Approved,
            comment: None,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
        })
    }

    fn chain(signer: &ChainSigner, expense: &str) -> Vec<LedgerEntry> {
        let first = signer.seal(None, vote(expense, "mgr-1", 1, 0));
        let second = signer.seal(Some(&first), vote(expense, "fin-1", 2, 1));
        let third = signer.seal(
            Some(&second),
            LedgerRecord::Override(StatusOverride {
                expense_id: ExpenseId(expense.to_string()),
                admin_id: UserId("admin-1".to_string()),
                status: ExpenseStatus::Approved,
                reason: "audited manually".to_string(),
                timestamp: Utc::now() + Duration::seconds(2),
            }),
        );
        vec![first, second, third]
    }

    #[test]
    fn seal_links_previous_hash_and_sequence() {
        let signer = signer("secret-key");
        let entries = chain(&signer, "EXP-1");

        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[0].prev_hash, None);
        assert_eq!(entries[1].sequence, 2);
        assert_eq!(entries[1].prev_hash.as_ref(), Some(&entries[0].entry_hash));
        assert_eq!(entries[2].record.action_key(), "override:approved");
    }

    #[test]
    fn verify_accepts_untampered_and_empty_chains() {
        let signer = signer("secret-key");
        let expense_id = ExpenseId("EXP-2".to_string());
        let entries = chain(&signer, "EXP-2");

        let result = signer.verify(&expense_id, &entries);
        assert!(result.valid, "{:?}", result.failure_reason);
        assert_eq!(result.verified_entries, 3);
        assert_eq!(result.latest_hash.as_ref(), Some(&entries[2].entry_hash));

        assert!(signer.verify(&expense_id, &[]).valid);
    }

    #[test]
    fn verify_detects_edited_decision() {
        let signer = signer("secret-key");
        let mut entries = chain(&signer, "EXP-3");
        if let LedgerRecord::Decision(decision) = &mut entries[1].record {
            decision.decision = Decision::Rejected;
        }

        let result = signer.verify(&ExpenseId("EXP-3".to_string()), &entries);
        assert!(!result.valid);
        assert_eq!(result.verified_entries, 1);
        assert!(result.failure_reason.unwrap_or_default().contains("content hash mismatch"));
    }

    #[test]
    fn verify_detects_foreign_key_and_removed_entries() {
        let entries = chain(&signer("secret-key"), "EXP-4");
        let expense_id = ExpenseId("EXP-4".to_string());

        let wrong_key = signer("other-key").verify(&expense_id, &entries);
        assert!(wrong_key.failure_reason.unwrap_or_default().contains("signature mismatch"));

        let gapped = vec![entries[0].clone(), entries[2].clone()];
        let result = signer("secret-key").verify(&expense_id, &gapped);
        assert!(result.failure_reason.unwrap_or_default().contains("sequence mismatch"));
    }
}
