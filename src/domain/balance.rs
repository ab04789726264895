use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Credits;

pub type UserId = Uuid;

/// Credit balance of a single user.
///
/// Balances are never created explicitly: a user that was never referenced
/// has a zero balance with version 0. The version is bumped on every write
/// and used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: UserId,
    /// Credits the user can spend on new requests
    pub available: Credits,
    /// Credits held for in-flight requests
    pub reserved: Credits,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            available: 0,
            reserved: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Credits {
        self.available + self.reserved
    }

    /// True if this balance has never been written.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Add freshly granted credits to the available balance.
    pub fn grant(&mut self, amount: Credits) -> Result<(), LedgerError> {
        self.available = self.add(self.available, amount)?;
        Ok(())
    }

    /// Move credits from available to reserved.
    pub fn reserve(&mut self, amount: Credits) -> Result<(), LedgerError> {
        if self.available < amount {
            return Err(LedgerError::InsufficientCredits {
                user_id: self.user_id,
                available: self.available,
                required: amount,
            });
        }
        let reserved = self.add(self.reserved, amount)?;
        self.available -= amount;
        self.reserved = reserved;
        Ok(())
    }

    /// Move credits from reserved back to available.
    pub fn release(&mut self, amount: Credits) -> Result<(), LedgerError> {
        let available = self.add(self.available, amount)?;
        self.take_reserved(amount)?;
        self.available = available;
        Ok(())
    }

    /// Remove reserved credits that are leaving this user (transfer source).
    pub fn take_reserved(&mut self, amount: Credits) -> Result<(), LedgerError> {
        if self.reserved < amount {
            return Err(LedgerError::InvalidReservation {
                user_id: self.user_id,
                reserved: self.reserved,
                required: amount,
            });
        }
        self.reserved -= amount;
        Ok(())
    }

    /// Credit incoming funds to the available balance (transfer destination).
    pub fn receive(&mut self, amount: Credits) -> Result<(), LedgerError> {
        self.available = self.add(self.available, amount)?;
        Ok(())
    }

    fn add(&self, current: Credits, amount: Credits) -> Result<Credits, LedgerError> {
        current.checked_add(amount).ok_or(LedgerError::Overflow {
            user_id: self.user_id,
            amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    InsufficientCredits {
        user_id: UserId,
        available: Credits,
        required: Credits,
    },
    InvalidReservation {
        user_id: UserId,
        reserved: Credits,
        required: Credits,
    },
    /// The amount does not fit in the balance
    Overflow { user_id: UserId, amount: Credits },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::InsufficientCredits {
                user_id,
                available,
                required,
            } => write!(
                f,
                "User {} has {} credit units available, {} required",
                user_id, available, required
            ),
            LedgerError::InvalidReservation {
                user_id,
                reserved,
                required,
            } => write!(
                f,
                "User {} has {} credit units reserved, {} required",
                user_id, reserved, required
            ),
            LedgerError::Overflow { user_id, amount } => write!(
                f,
                "Adding {} credit units to user {} overflows the balance",
                amount, user_id
            ),
        }
    }
}

impl std::error::Error for LedgerError {}
