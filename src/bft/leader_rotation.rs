// src/bft/leader_rotation.rs

/// Deterministic proposer selection (round-robin over heights and rounds).
/// `ordered` must be the validator ids in canonical (sorted) order.
/// leader(H, R) = ordered[(H - 1 + R) mod |V|]
pub fn proposer_for(ordered: &[String], height: u64, round: u64) -> Option<&str> {
    proposer_index(ordered.len(), height, round).map(|i| ordered[i].as_str())
}

/// Index form of [`proposer_for`]; `None` for an empty set or height 0.
pub fn proposer_index(n: usize, height: u64, round: u64) -> Option<usize> {
    if n == 0 || height == 0 {
        return None;
    }
    let n = n as u64;
    let idx = ((height - 1) % n + round % n) % n;
    Some(idx as usize)
}
