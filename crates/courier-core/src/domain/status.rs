use serde::{Deserialize, Serialize};

use super::message::MessageStatus;

/// Row counts per status, for out-of-band inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub dead: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: MessageStatus, n: u64) {
        match status {
            MessageStatus::Pending => self.pending += n,
            MessageStatus::Processing => self.processing += n,
            MessageStatus::Succeeded => self.succeeded += n,
            MessageStatus::Dead => self.dead += n,
        }
    }

    pub fn get(&self, status: MessageStatus) -> u64 {
        match status {
            MessageStatus::Pending => self.pending,
            MessageStatus::Processing => self.processing,
            MessageStatus::Succeeded => self.succeeded,
            MessageStatus::Dead => self.dead,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.succeeded + self.dead
    }

    /// Nothing left to do: every row is terminal.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
