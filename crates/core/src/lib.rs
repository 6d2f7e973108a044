use std::time::{SystemTime, UNIX_EPOCH};

pub mod branch;
pub mod engine;
pub mod error;
pub mod generation;
pub mod reaper;
pub mod tree;
pub mod version;

#[cfg(test)]
mod test_support;

pub use branch::{ActiveLeaf, BranchPointer, LeafSource};
pub use engine::{
    ConversationEngine, ConversationView, EngineSettings, TurnHandle, assemble_prompt,
};
pub use error::{EngineError, EngineResult};
pub use generation::{
    GenerationEvent, GenerationHandle, GenerationLifecycle, GenerationPlan,
    GenerationStatusReport, STREAM_CLOSED_EARLY,
};
pub use reaper::{DEFAULT_GENERATION_TIMEOUT, StuckGenerationReaper};
pub use tree::{
    ChainEntry, VersionInfo, attach_version_info, build_chain, find_default_leaf, resolve_leaf_of,
};
pub use version::{VersionLocks, VersionSlot, new_turn, next_version_number, siblings_of};

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}
