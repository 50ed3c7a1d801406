//! Client transaction type.

use serde::{Deserialize, Serialize};

/// A transfer of `amount` from `sender` to `receiver`. `tx_id` is globally
/// unique within a participant's own namespace; across participants a
/// collision is possible and handled as a duplicate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: u64,
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
}

impl Transaction {
    pub fn new(tx_id: u64, sender: impl Into<String>, receiver: impl Into<String>, amount: u64) -> Self {
        Transaction {
            tx_id,
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
        }
    }
}
