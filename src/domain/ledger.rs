use std::collections::HashMap;

use super::{Credits, TransactionKind, TransactionRecord, UserBalance, UserId, format_credits};

/// Balance of a user as implied by the transaction records alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayedBalance {
    pub available: Credits,
    pub reserved: Credits,
}

impl ReplayedBalance {
    pub fn total(&self) -> Credits {
        self.available + self.reserved
    }
}

/// Rebuild every user's balance by replaying records in sequence order.
pub fn replay_balances(records: &[TransactionRecord]) -> HashMap<UserId, ReplayedBalance> {
    let mut balances: HashMap<UserId, ReplayedBalance> = HashMap::new();

    for record in records {
        match record.kind {
            TransactionKind::Grant => {
                balances.entry(record.to_user).or_default().available += record.amount;
            }
            TransactionKind::Reserve => {
                let balance = balances.entry(record.to_user).or_default();
                balance.available -= record.amount;
                balance.reserved += record.amount;
            }
            TransactionKind::Release | TransactionKind::Refund => {
                let balance = balances.entry(record.to_user).or_default();
                balance.reserved -= record.amount;
                balance.available += record.amount;
            }
            TransactionKind::Transfer => {
                if let Some(from) = record.from_user {
                    balances.entry(from).or_default().reserved -= record.amount;
                }
                balances.entry(record.to_user).or_default().available += record.amount;
            }
        }
    }

    balances
}

/// Total credits ever minted. Credits only enter the system through grants,
/// so the sum of all balances must always equal this.
pub fn total_granted(records: &[TransactionRecord]) -> Credits {
    records
        .iter()
        .filter(|r| r.kind == TransactionKind::Grant)
        .map(|r| r.amount)
        .sum()
}

/// Result of a full ledger consistency check.
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    pub balance_count: usize,
    pub transaction_count: usize,
    pub total_granted: Credits,
    pub total_held: Credits,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Compare stored balances against the records and the open requests.
///
/// `expected_reserved` maps each requester to the sum of amounts of their
/// requests that currently hold a reservation.
pub fn build_integrity_report(
    balances: &[UserBalance],
    records: &[TransactionRecord],
    expected_reserved: &HashMap<UserId, Credits>,
) -> IntegrityReport {
    let mut issues = Vec::new();

    for (index, record) in records.iter().enumerate() {
        if record.sequence != index as i64 + 1 {
            issues.push(format!(
                "Transaction sequence gap: expected {}, found {}",
                index + 1,
                record.sequence
            ));
            break;
        }
    }

    let replayed = replay_balances(records);
    let stored: HashMap<UserId, &UserBalance> = balances.iter().map(|b| (b.user_id, b)).collect();

    for balance in balances {
        if balance.available < 0 || balance.reserved < 0 {
            issues.push(format!("User {} has a negative balance", balance.user_id));
        }

        let expected = replayed.get(&balance.user_id).copied().unwrap_or_default();
        if expected.available != balance.available || expected.reserved != balance.reserved {
            issues.push(format!(
                "User {} stores {}/{} (available/reserved) but records imply {}/{}",
                balance.user_id,
                format_credits(balance.available),
                format_credits(balance.reserved),
                format_credits(expected.available),
                format_credits(expected.reserved)
            ));
        }

        let held = expected_reserved.get(&balance.user_id).copied().unwrap_or(0);
        if held != balance.reserved {
            issues.push(format!(
                "User {} has {} reserved but open requests hold {}",
                balance.user_id,
                format_credits(balance.reserved),
                format_credits(held)
            ));
        }
    }

    for (user_id, expected) in &replayed {
        if !stored.contains_key(user_id) && *expected != ReplayedBalance::default() {
            issues.push(format!("User {} has records but no stored balance", user_id));
        }
    }

    for (user_id, held) in expected_reserved {
        if !stored.contains_key(user_id) && *held != 0 {
            issues.push(format!("User {} has open requests but no stored balance", user_id));
        }
    }

    let granted = total_granted(records);
    let total: Credits = balances.iter().map(UserBalance::total).sum();
    if total != granted {
        issues.push(format!(
            "Balances sum to {} but {} credits were granted",
            format_credits(total),
            format_credits(granted)
        ));
    }

    IntegrityReport {
        balance_count: balances.len(),
        transaction_count: records.len(),
        total_granted: granted,
        total_held: balances.iter().map(|b| b.reserved).sum(),
        issues,
    }
}
