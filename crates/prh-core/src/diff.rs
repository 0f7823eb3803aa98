//! Line-level comparison of two text blobs.
//!
//! Lines keep their trailing newline. Unchanged spans are dropped; each run of
//! changes between two unchanged lines yields at most one removed segment
//! followed by at most one added segment.

use serde::{Deserialize, Serialize};

/// Above this edit distance the changed middle is reported as one removal
/// followed by one addition instead of a minimal script.
pub const MAX_EDIT_DISTANCE: usize = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSegment {
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    /// 1-based line in the new text. Removed lines have no position there.
    pub line: Option<u32>,
    pub content: String,
}

impl DiffSegment {
    pub fn added(line: u32, content: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Added,
            line: Some(line),
            content: content.into(),
        }
    }

    pub fn removed(content: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Removed,
            line: None,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete(usize),
    Insert(usize),
}

pub fn diff_lines(old: &str, new: &str) -> Vec<DiffSegment> {
    let a: Vec<&str> = old.split_inclusive('\n').collect();
    let b: Vec<&str> = new.split_inclusive('\n').collect();
    let ops = edit_script(&a, &b);
    collect_segments(&ops, &a, &b)
}

fn edit_script(a: &[&str], b: &[&str]) -> Vec<Op> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut ops = vec![Op::Equal; prefix];
    let middle = if a_mid.is_empty() && b_mid.is_empty() {
        Vec::new()
    } else {
        myers(a_mid, b_mid).unwrap_or_else(|| {
            (0..a_mid.len())
                .map(Op::Delete)
                .chain((0..b_mid.len()).map(Op::Insert))
                .collect()
        })
    };
    ops.extend(middle.into_iter().map(|op| match op {
        Op::Equal => Op::Equal,
        Op::Delete(i) => Op::Delete(i + prefix),
        Op::Insert(j) => Op::Insert(j + prefix),
    }));
    ops.extend(std::iter::repeat(Op::Equal).take(suffix));
    ops
}

/// Greedy Myers search keeping one frontier snapshot per edit distance.
fn myers(a: &[&str], b: &[&str]) -> Option<Vec<Op>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = a.len() + b.len();
    let limit = max.min(MAX_EDIT_DISTANCE) as isize;
    let offset = max as isize + 1;
    let mut v = vec![0isize; 2 * max + 3];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=limit {
        let lo = (offset - d - 1) as usize;
        let hi = (offset + d + 1) as usize;
        trace.push(v[lo..=hi].to_vec());

        let mut k = -d;
        while k <= d {
            let idx = (offset + k) as usize;
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
                return Some(backtrack(&trace, a.len(), b.len()));
            }
            k += 2;
        }
    }
    None
}

fn backtrack(trace: &[Vec<isize>], n: usize, m: usize) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut x = n as isize;
    let mut y = m as isize;

    for (d, snapshot) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let at = |k: isize| snapshot[(k + d + 1) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = at(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(Op::Equal);
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(Op::Insert((y - 1) as usize));
            } else {
                ops.push(Op::Delete((x - 1) as usize));
            }
        }
        x = prev_x;
        y = prev_y;
    }

    ops.reverse();
    ops
}

fn collect_segments(ops: &[Op], a: &[&str], b: &[&str]) -> Vec<DiffSegment> {
    let mut out = Vec::new();
    let mut removed = String::new();
    let mut added = String::new();
    let mut added_from: Option<usize> = None;

    for op in ops {
        match *op {
            Op::Equal => flush(&mut out, &mut removed, &mut added, &mut added_from),
            Op::Delete(i) => removed.push_str(a[i]),
            Op::Insert(j) => {
                added_from.get_or_insert(j);
                added.push_str(b[j]);
            }
        }
    }
    flush(&mut out, &mut removed, &mut added, &mut added_from);
    out
}

fn flush(
    out: &mut Vec<DiffSegment>,
    removed: &mut String,
    added: &mut String,
    added_from: &mut Option<usize>,
) {
    if !removed.is_empty() {
        out.push(DiffSegment::removed(std::mem::take(removed)));
    }
    if let Some(first) = added_from.take() {
        let line = u32::try_from(first + 1).unwrap_or(u32::MAX);
        out.push(DiffSegment::added(line, std::mem::take(added)));
    }
}
