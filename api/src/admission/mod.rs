//! Per-sender admission counters: velocity, fuzzy duplicates, strikes, daily
//! quota, and ban enforcement. All state lives in the shared keyed store under
//! the key builders below; the mutating checks run inside the matching
//! per-sender lock (`crate::lock::resources`).

pub mod ban;
pub mod duplicate;
pub mod quota;
pub mod strikes;
pub mod velocity;

use gatehouse_core::sender::Sender;

pub(crate) fn velocity_key(sender: &Sender) -> String {
    format!("velocity:{}", sender.key())
}

pub(crate) fn history_key(sender: &Sender) -> String {
    format!("history:{}", sender.key())
}

pub(crate) fn strikes_key(sender: &Sender) -> String {
    format!("strikes:{}", sender.key())
}

pub(crate) fn ban_key(sender: &Sender) -> String {
    format!("ban:{}", sender.key())
}
