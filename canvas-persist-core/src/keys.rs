//! Persisted key namespace.

/// Timestamp of the snapshot the live canvas points at
pub const CURRENT_VERSION_KEY: &str = "canvas_current_version";

/// JSON array of undo timestamps, oldest first
pub const UNDO_STACK_KEY: &str = "undo_stack";

pub const STATE_PREFIX: &str = "canvas_state_";
pub const UNDO_PREFIX: &str = "undo_state_";

const CHUNK_INFIX: &str = "_chunk";
const COUNT_SUFFIX: &str = "_chunks";

pub fn state_key(timestamp: u64) -> String {
    format!("{STATE_PREFIX}{timestamp}")
}

pub fn undo_key(timestamp: u64) -> String {
    format!("{UNDO_PREFIX}{timestamp}")
}

pub fn chunk_key(namespace: &str, index: usize) -> String {
    format!("{namespace}{CHUNK_INFIX}_{index}")
}

pub fn count_key(namespace: &str) -> String {
    format!("{namespace}{COUNT_SUFFIX}")
}

/// Prefix shared by every chunk entry and the count entry of `namespace`
///
/// `canvas_state_1_chunk` does not prefix `canvas_state_12_chunk_0`, so
/// sibling namespaces never match each other.
pub fn family_prefix(namespace: &str) -> String {
    format!("{namespace}{CHUNK_INFIX}")
}

/// Extract `ts` from a `{prefix}{ts}_chunks` count key
pub fn parse_count_key(key: &str, prefix: &str) -> Option<u64> {
    key.strip_prefix(prefix)?
        .strip_suffix(COUNT_SUFFIX)?
        .parse()
        .ok()
}
