/// Usage-log reducers.
///
/// Turns the kernel's [`UsageEntry`] records into time series: how long
/// the queue sat at each length, how long each amount of capacity was
/// in use. These consume telemetry only — no scheduling logic.

use crate::resource::UsageEntry;

/// Time spent at each queue length, starting the observation at `from`.
///
/// Index `n` of the result holds the total virtual time during which
/// exactly `n` requests were waiting (arrived but not yet granted or
/// cancelled).
pub fn queue_length_histogram(log: &[UsageEntry], from: f64) -> Vec<f64> {
    let mut moves: Vec<(f64, i64)> = Vec::new();
    for entry in log {
        moves.push((entry.requested_at.value(), 1));
        if let Some(exited) = entry.queue_exited_at {
            moves.push((exited.value(), -1));
        }
    }
    compose_moves(moves, from)
}

/// Time spent at each level of consumed capacity, starting at `from`.
///
/// Index `n` holds the total virtual time during which exactly `n`
/// capacity units were held.
pub fn usage_histogram(log: &[UsageEntry], from: f64) -> Vec<f64> {
    let mut moves: Vec<(f64, i64)> = Vec::new();
    for entry in log {
        if let (Some(exited), Some(_)) = (entry.queue_exited_at, entry.available_before) {
            moves.push((exited.value(), i64::from(entry.capacity)));
        }
        if let Some(released_at) = entry.released_at {
            moves.push((released_at.value(), -i64::from(entry.released.unwrap_or(0))));
        }
    }
    compose_moves(moves, from)
}

/// Fold a list of `(time, level_change)` moves into time-at-level.
///
/// Only time after `from` is counted. The level before a move indexes
/// the bucket that accumulates the elapsed span.
fn compose_moves(mut moves: Vec<(f64, i64)>, from: f64) -> Vec<f64> {
    moves.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut cumul: Vec<f64> = Vec::new();
    let mut current_time: f64 = 0.0;
    let mut level: i64 = 0;
    for (t, v) in moves {
        if t > from {
            let span = t - current_time.max(from);
            let index = level.max(0) as usize;
            while cumul.len() <= index {
                cumul.push(0.0);
            }
            cumul[index] += span;
        }
        current_time = t;
        level += v;
    }
    cumul
}

/// Running sums: `accumulate(&[1, 2, 3]) == [1, 3, 6]`.
pub fn accumulate(xs: &[f64]) -> Vec<f64> {
    let mut sum = 0.0;
    xs.iter()
        .map(|x| {
            sum += x;
            sum
        })
        .collect()
}

/// Scale values so they sum to one. `None` when the sum is zero.
pub fn normalize(xs: &[f64]) -> Option<Vec<f64>> {
    let total: f64 = xs.iter().sum();
    if total == 0.0 {
        return None;
    }
    Some(xs.iter().map(|x| x / total).collect())
}

/// Empirical CDF of a histogram: normalized, then accumulated.
/// `None` when the histogram is empty of mass.
pub fn ecdf(xs: &[f64]) -> Option<Vec<f64>> {
    normalize(xs).map(|n| accumulate(&n))
}
