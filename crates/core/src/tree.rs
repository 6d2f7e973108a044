//! Transcript reconstruction over the flat message forest.
//!
//! Every function takes the full message set of one conversation and builds whatever index it
//! needs per call. Parent walks carry a visited set so a corrupted parent chain ends the walk
//! instead of looping.

use std::collections::{HashMap, HashSet};

use forkchat_storage::{MessageId, MessageRecord, VersionGroupId};

use super::version::siblings_of;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub version_group: VersionGroupId,
    pub version_number: u32,
    pub total_versions: usize,
    /// Sibling ids ordered by version number, this message included.
    pub sibling_ids: Vec<MessageId>,
}

/// One transcript line plus its position among alternate versions, if it has any.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainEntry {
    pub message: MessageRecord,
    pub version: Option<VersionInfo>,
}

/// Root-to-leaf path ending at `leaf_id`.
///
/// Empty when `leaf_id` is unknown. A dangling parent id ends the walk, so the result is the
/// reachable suffix of the path.
pub fn build_chain(all: &[MessageRecord], leaf_id: MessageId) -> Vec<MessageRecord> {
    let by_id = all
        .iter()
        .map(|message| (message.id, message))
        .collect::<HashMap<_, _>>();

    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = Some(leaf_id);

    while let Some(message_id) = cursor {
        if !visited.insert(message_id) {
            tracing::warn!(message_id = %message_id, "parent chain loops back on itself");
            break;
        }
        let Some(message) = by_id.get(&message_id) else {
            break;
        };
        chain.push((*message).clone());
        cursor = message.parent_message_id;
    }

    chain.reverse();
    chain
}

/// Newest leaf by `created_at`; the earliest one in input order wins a tie.
///
/// Falls back to the last message when every message is somebody's parent, which only happens
/// on corrupted data.
pub fn find_default_leaf(all: &[MessageRecord]) -> Option<&MessageRecord> {
    let parents = all
        .iter()
        .filter_map(|message| message.parent_message_id)
        .collect::<HashSet<_>>();

    let newest_leaf = all
        .iter()
        .filter(|message| !parents.contains(&message.id))
        .fold(None::<&MessageRecord>, |best, candidate| match best {
            Some(best) if best.created_at_unix_ms >= candidate.created_at_unix_ms => Some(best),
            _ => Some(candidate),
        });

    newest_leaf.or_else(|| all.last())
}

/// Follows the newest child down from `subtree_root_id` until a childless message.
pub fn resolve_leaf_of(all: &[MessageRecord], subtree_root_id: MessageId) -> MessageId {
    let mut children = HashMap::<MessageId, Vec<&MessageRecord>>::new();
    for message in all {
        if let Some(parent_message_id) = message.parent_message_id {
            children.entry(parent_message_id).or_default().push(message);
        }
    }

    let mut visited = HashSet::new();
    let mut current = subtree_root_id;
    visited.insert(current);

    loop {
        let newest_child = children.get(&current).and_then(|kids| {
            kids.iter()
                .copied()
                .fold(None::<&MessageRecord>, |best, candidate| match best {
                    Some(best) if best.created_at_unix_ms >= candidate.created_at_unix_ms => {
                        Some(best)
                    }
                    _ => Some(candidate),
                })
        });

        match newest_child {
            Some(child) if visited.insert(child.id) => current = child.id,
            _ => return current,
        }
    }
}

/// Annotates every versioned message in `chain` against the full message set.
pub fn attach_version_info(chain: &[MessageRecord], all: &[MessageRecord]) -> Vec<ChainEntry> {
    chain
        .iter()
        .map(|message| {
            let version = message.version_group.map(|version_group| {
                let siblings = siblings_of(all, version_group);
                VersionInfo {
                    version_group,
                    version_number: message.version_number,
                    total_versions: siblings.len(),
                    sibling_ids: siblings.iter().map(|sibling| sibling.id).collect(),
                }
            });
            ChainEntry {
                message: message.clone(),
                version,
            }
        })
        .collect()
}
