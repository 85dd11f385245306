//! Line-level screen diffing.
//!
//! Computes a minimal edit script between two captured screens (Myers'
//! O((N+M)D) shortest-edit-script search) and folds it into contiguous
//! replacement records the client can apply to its last acknowledged screen.
//!
//! ```text
//! before: a b c d        ops: = = -c +x +y = d
//! after:  a b x y d      delta: { start: 2, deleteCount: 1, insertLines: [x, y] }
//! ```
//!
//! `start` is always an index into the *original* `before` sequence.

use serde::{Deserialize, Serialize};

/// More delta groups than this and a full repaint is cheaper.
pub const MAX_DELTA_GROUPS: usize = 10;
/// Absolute cap on changed lines before falling back to a full repaint.
pub const MAX_CHANGED_LINES: usize = 200;
/// Fraction of the screen that may change before falling back.
pub const MAX_CHANGED_RATIO: f64 = 0.5;

/// Edit distances above this abandon the search and emit a single
/// replacement. Any script that long already exceeds [`MAX_CHANGED_LINES`].
const MAX_EDIT_DISTANCE: usize = 4 * MAX_CHANGED_LINES;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenDelta {
    pub start: usize,
    pub delete_count: usize,
    pub insert_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditOp {
    Equal,
    Insert,
    Delete,
}

/// Compute the deltas turning `before` into `after`.
pub fn diff<S: AsRef<str>>(before: &[S], after: &[S]) -> Vec<ScreenDelta> {
    let a: Vec<&str> = before.iter().map(|s| s.as_ref()).collect();
    let b: Vec<&str> = after.iter().map(|s| s.as_ref()).collect();

    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    if a_mid.is_empty() && b_mid.is_empty() {
        return Vec::new();
    }

    let ops = match shortest_edit(a_mid, b_mid) {
        Some(ops) => ops,
        None => {
            return vec![ScreenDelta {
                start: prefix,
                delete_count: a_mid.len(),
                insert_lines: b_mid.iter().map(|s| s.to_string()).collect(),
            }]
        }
    };

    coalesce(&ops, b_mid, prefix)
}

/// Decide whether the caller should ship a full repaint instead of `deltas`.
pub fn should_send_full(before_len: usize, after_len: usize, deltas: &[ScreenDelta]) -> bool {
    if deltas.len() > MAX_DELTA_GROUPS {
        return true;
    }
    let changed = changed_line_count(deltas);
    if changed > MAX_CHANGED_LINES {
        return true;
    }
    let total = before_len.max(after_len);
    if total == 0 {
        return false;
    }
    (changed as f64) > (total as f64) * MAX_CHANGED_RATIO
}

pub fn changed_line_count(deltas: &[ScreenDelta]) -> usize {
    deltas
        .iter()
        .map(|d| d.delete_count.max(d.insert_lines.len()))
        .sum()
}

/// Apply deltas produced by [`diff`] to the original lines.
///
/// Deltas are applied from the highest `start` downwards so that every
/// `start` keeps referring to the original index space.
#[cfg(test)]
pub fn apply(lines: &[String], deltas: &[ScreenDelta]) -> Vec<String> {
    let mut out = lines.to_vec();
    for delta in deltas.iter().rev() {
        let start = delta.start.min(out.len());
        let end = (start + delta.delete_count).min(out.len());
        out.splice(start..end, delta.insert_lines.iter().cloned());
    }
    out
}

/// Myers forward search with trace, then backtrack into an op list.
///
/// Returns `None` when the edit distance exceeds [`MAX_EDIT_DISTANCE`].
fn shortest_edit(a: &[&str], b: &[&str]) -> Option<Vec<EditOp>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    // trace[d] holds v[k] for k in -d..=d after step d, indexed k + d.
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut final_d = None;

    'search: for d in 0..=(max as isize) {
        if d as usize > MAX_EDIT_DISTANCE {
            return None;
        }
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
                final_d = Some(d);
                break 'search;
            }
            k += 2;
        }
        trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
    }

    let final_d = final_d?;
    let mut ops = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);

    for d in (1..=final_d).rev() {
        let prev = &trace[(d - 1) as usize];
        let at = |k: isize| prev[(k + d - 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(EditOp::Equal);
            x -= 1;
            y -= 1;
        }
        if x == prev_x {
            ops.push(EditOp::Insert);
        } else {
            ops.push(EditOp::Delete);
        }
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        ops.push(EditOp::Equal);
        x -= 1;
        y -= 1;
    }

    ops.reverse();
    Some(ops)
}

fn coalesce(ops: &[EditOp], b: &[&str], base: usize) -> Vec<ScreenDelta> {
    let mut deltas = Vec::new();
    let mut current: Option<ScreenDelta> = None;
    let (mut i, mut j) = (base, 0usize);

    for op in ops {
        match op {
            EditOp::Equal => {
                if let Some(delta) = current.take() {
                    deltas.push(delta);
                }
                i += 1;
                j += 1;
            }
            EditOp::Delete => {
                current
                    .get_or_insert_with(|| empty_delta(i))
                    .delete_count += 1;
                i += 1;
            }
            EditOp::Insert => {
                current
                    .get_or_insert_with(|| empty_delta(i))
                    .insert_lines
                    .push(b.get(j).copied().unwrap_or_default().to_string());
                j += 1;
            }
        }
    }
    if let Some(delta) = current {
        deltas.push(delta);
    }
    deltas
}

fn empty_delta(start: usize) -> ScreenDelta {
    ScreenDelta {
        start,
        delete_count: 0,
        insert_lines: Vec::new(),
    }
}
