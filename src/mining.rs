//! Sequential proof-of-work search and difficulty control.

use crate::block::Block;
use crate::crypto::meets_difficulty;
use crate::error::MiningError;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Searches nonces from zero until the block hash has `block.difficulty`
/// leading zeros. `cancel` is checked before every attempt.
///
/// Returns the number of attempts. On success the block carries the winning
/// nonce, its hash and the elapsed mining time.
pub fn mine(block: &mut Block, cancel: &CancellationToken) -> Result<u64, MiningError> {
    let started = Instant::now();
    let mut hasher = block.hasher();
    let mut nonce: u64 = 0;
    let mut attempts: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(MiningError::Aborted { attempts });
        }
        attempts += 1;
        let hash = hasher.hash(nonce);
        if meets_difficulty(&hash, block.difficulty) {
            block.nonce = nonce;
            block.hash = hash;
            block.mining_time_ms = started.elapsed().as_millis() as u64;
            debug!(index = block.index, nonce, attempts, "found proof of work");
            return Ok(attempts);
        }
        nonce = match nonce.checked_add(1) {
            Some(next) => next,
            None => {
                block.restamp();
                hasher = block.hasher();
                0
            }
        };
    }
}

/// Proportional control: one step up when the block came in under half the
/// target interval, one step down (never below `min`) when it took more than
/// twice the target.
pub fn adjust_difficulty(current: u32, elapsed_ms: i64, target_ms: u64, min: u32) -> u32 {
    let elapsed = elapsed_ms.max(0) as u128;
    let target = target_ms as u128;
    if elapsed * 2 < target {
        current.saturating_add(1)
    } else if elapsed > target * 2 {
        current.saturating_sub(1).max(min.max(1))
    } else {
        current.max(min.max(1))
    }
}
