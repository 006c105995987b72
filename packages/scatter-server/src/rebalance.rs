//! Background rebalancer.
//!
//! Triggered on device registration/claim, cloud attach, and on demand.
//! Equalizes per-device stored bytes for one user by moving chunks from
//! devices above `1.2 × avg` onto devices below `0.8 × avg`. Runs detached;
//! a per-user latch keeps runs from overlapping. Every per-chunk error is
//! logged and swallowed; a failed move leaves the chunk where it was,
//! still retrievable.

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;

use scatter_core::types::Device;
use scatter_core::Result;

use crate::backend::backend_for;
use crate::config;
use crate::state::AppState;

/// One planned transfer of roughly `bytes` from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMove {
    pub source: String,
    pub target: String,
    pub bytes: u64,
}

/// Greedy plan: each device above the high-water mark sheds its excess over
/// the average onto the emptiest device below the low-water mark. Simulated
/// usage is updated between picks so several overloaded sources don't all
/// dogpile one target.
pub fn plan_moves(usage: &[(String, u64)]) -> Vec<PlannedMove> {
    let n = usage.len();
    if n < 2 {
        return Vec::new();
    }
    let total: u64 = usage.iter().map(|(_, bytes)| bytes).sum();
    if total == 0 {
        return Vec::new();
    }

    let avg = total as f64 / n as f64;
    let high = avg * config::REBALANCE_HIGH;
    let low = avg * config::REBALANCE_LOW;

    let mut current: Vec<(String, f64)> = usage
        .iter()
        .map(|(id, bytes)| (id.clone(), *bytes as f64))
        .collect();
    let mut moves = Vec::new();

    for i in 0..n {
        if current[i].1 <= high {
            continue;
        }
        let target = (0..n)
            .filter(|&j| j != i && current[j].1 < low)
            .min_by(|&a, &b| current[a].1.total_cmp(&current[b].1));
        let Some(j) = target else { continue };

        let excess = current[i].1 - avg;
        moves.push(PlannedMove {
            source: current[i].0.clone(),
            target: current[j].0.clone(),
            bytes: excess.round() as u64,
        });
        current[i].1 -= excess;
        current[j].1 += excess;
    }
    moves
}

/// Kick off a detached rebalance for a user unless one is already running.
pub fn trigger(state: AppState, user_id: String) {
    match state.rebalance_running.entry(user_id.clone()) {
        Entry::Occupied(_) => {
            tracing::debug!(user_id = user_id.as_str(), "Rebalance already in flight, skipping");
            return;
        }
        Entry::Vacant(slot) => {
            slot.insert(());
        }
    }

    tokio::spawn(async move {
        tracing::info!(user_id = user_id.as_str(), "Rebalance starting");
        if let Err(err) = run(&state, &user_id).await {
            tracing::warn!(user_id = user_id.as_str(), error = %err, "Rebalance aborted");
        } else {
            tracing::info!(user_id = user_id.as_str(), "Rebalance complete");
        }
        state.rebalance_running.remove(&user_id);
    });
}

async fn run(state: &AppState, user_id: &str) -> Result<()> {
    let window = config::offline_window();
    let online = state.db.list_online_devices(user_id, window)?;
    if online.len() < 2 {
        tracing::info!(user_id = user_id, "Not enough online devices to rebalance");
        return Ok(());
    }

    let online_ids: HashMap<&str, &Device> =
        online.iter().map(|d| (d.id.as_str(), d)).collect();
    let usage: Vec<(String, u64)> = state
        .db
        .device_usage(user_id)?
        .into_iter()
        .filter(|(device, _)| online_ids.contains_key(device.id.as_str()))
        .map(|(device, bytes)| (device.id, bytes))
        .collect();

    for planned in plan_moves(&usage) {
        let (Some(source), Some(target)) = (
            online_ids.get(planned.source.as_str()),
            online_ids.get(planned.target.as_str()),
        ) else {
            continue;
        };
        let moved = move_chunks(state, user_id, source, target, planned.bytes).await;
        tracing::info!(
            source = planned.source.as_str(),
            target = planned.target.as_str(),
            wanted = planned.bytes,
            moved,
            "Rebalance step"
        );
    }
    Ok(())
}

/// Move up to `amount` bytes of chunks from `source` to `target`, batch-
/// capped. Each chunk: retrieve from source, store to target, swap the
/// location rows atomically, then fire-and-forget the source-side delete.
/// Any failure leaves that chunk unmoved and continues with the next.
async fn move_chunks(
    state: &AppState,
    user_id: &str,
    source: &Device,
    target: &Device,
    amount: u64,
) -> u64 {
    let candidates = match state.db.chunks_on_device(&source.id, config::REBALANCE_BATCH) {
        Ok(chunks) => chunks,
        Err(err) => {
            tracing::warn!(device_id = source.id.as_str(), error = %err, "Could not list chunks to move");
            return 0;
        }
    };

    let source_backend = backend_for(state, user_id, source);
    let target_backend = backend_for(state, user_id, target);
    let mut moved: u64 = 0;

    for (chunk_id, size) in candidates {
        if moved >= amount {
            break;
        }

        let data = match source_backend.get(&chunk_id).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(chunk_id = chunk_id.as_str(), error = %err, "Move: retrieve failed");
                continue;
            }
        };
        if let Err(err) = target_backend.put(&chunk_id, data).await {
            tracing::warn!(chunk_id = chunk_id.as_str(), error = %err, "Move: store failed");
            continue;
        }
        if let Err(err) = state.db.move_location(&chunk_id, &source.id, &target.id) {
            tracing::warn!(chunk_id = chunk_id.as_str(), error = %err, "Move: location swap failed");
            continue;
        }

        let cleanup = backend_for(state, user_id, source);
        let cleanup_chunk = chunk_id.clone();
        tokio::spawn(async move {
            let _ = cleanup.remove(&cleanup_chunk).await;
        });

        tracing::debug!(
            chunk_id = chunk_id.as_str(),
            from = source.id.as_str(),
            to = target.id.as_str(),
            "Chunk moved"
        );
        moved += size;
    }
    moved
}
