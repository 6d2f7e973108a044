use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use forkchat_storage::{MessageRecord, VersionGroupId};
use tokio::sync::OwnedMutexGuard;

/// Where a new message lands among its alternate versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionSlot {
    pub version_group: VersionGroupId,
    pub version_number: u32,
}

/// Members of `version_group`, lowest version first.
pub fn siblings_of(all: &[MessageRecord], version_group: VersionGroupId) -> Vec<&MessageRecord> {
    let mut siblings = all
        .iter()
        .filter(|message| message.version_group == Some(version_group))
        .collect::<Vec<_>>();
    siblings.sort_by_key(|message| message.version_number);
    siblings
}

/// `max + 1` over the group, or `1` for an empty group. Gaps are kept, never filled.
pub fn next_version_number(all: &[MessageRecord], version_group: VersionGroupId) -> u32 {
    all.iter()
        .filter(|message| message.version_group == Some(version_group))
        .map(|message| message.version_number)
        .max()
        .map_or(1, |max| max.saturating_add(1))
}

pub fn new_turn(all: &[MessageRecord], existing_group: Option<VersionGroupId>) -> VersionSlot {
    match existing_group {
        Some(version_group) => VersionSlot {
            version_group,
            version_number: next_version_number(all, version_group),
        },
        None => VersionSlot {
            version_group: VersionGroupId::new_v7(),
            version_number: 1,
        },
    }
}

/// Serializes the read-then-insert of a version slot per group inside this process.
#[derive(Default)]
pub struct VersionLocks {
    groups: Mutex<HashMap<VersionGroupId, Arc<tokio::sync::Mutex<()>>>>,
}

impl VersionLocks {
    pub async fn acquire(&self, version_group: VersionGroupId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on can go.
            groups.retain(|_, lock| Arc::strong_count(lock) > 1);
            groups.entry(version_group).or_default().clone()
        };
        lock.lock_owned().await
    }
}
