//! Minimal edit script between two block lists.
//!
//! The script is computed with a longest-common-subsequence table over the
//! [`Block::matches`] predicate, then post-processed twice:
//!
//! 1. an adjacent `delete` + `insert` of the same block type collapses into
//!    an in-place `update`, so pure text edits keep their block id;
//! 2. every `insert` is anchored after the most recent `keep`/`update` block,
//!    or `None` when nothing precedes it.
//!
//! When the table offers two equally long paths the backtrack prefers to
//! treat the current new-side block as an insert.  The result is
//! deterministic but is only one of possibly several minimal scripts.

use crate::block::Block;

#[derive(Debug, Clone, PartialEq)]
pub enum DiffOp {
    Keep { block_id: String },
    Insert { after: Option<String>, block: Block },
    Delete { block_id: String },
    Update { block_id: String, block: Block },
}

impl DiffOp {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep { .. })
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert { .. })
    }
}

/// Index-based step produced by the backtrack, before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Keep(usize, usize),
    Insert(usize),
    Delete(usize),
}

pub fn diff(old: &[Block], new: &[Block]) -> Vec<DiffOp> {
    let steps = lcs_steps(old, new);
    let merged = merge_replacements(&steps, old, new);
    assign_anchors(merged)
}

/// True when some insert precedes every kept or updated block.  Appends
/// land after a sibling or at the end of the page, so such an insert cannot
/// be placed ahead of the surviving content and the page must be rewritten.
pub fn needs_rewrite(ops: &[DiffOp]) -> bool {
    let Some(first_survivor) = ops
        .iter()
        .position(|op| matches!(op, DiffOp::Keep { .. } | DiffOp::Update { .. }))
    else {
        return false;
    };
    ops[..first_survivor].iter().any(DiffOp::is_insert)
}

fn lcs_steps(old: &[Block], new: &[Block]) -> Vec<Step> {
    let old_keys = old
        .iter()
        .map(|b| (b.kind.as_str(), b.plain_text()))
        .collect::<Vec<_>>();
    let new_keys = new
        .iter()
        .map(|b| (b.kind.as_str(), b.plain_text()))
        .collect::<Vec<_>>();

    let (n, m) = (old.len(), new.len());
    // table[i][j] = LCS length of old[..i] and new[..j]
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in 1..=n {
        for j in 1..=m {
            table[i][j] = if old_keys[i - 1] == new_keys[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }

    let mut steps = Vec::with_capacity(n + m);
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old_keys[i - 1] == new_keys[j - 1] {
            steps.push(Step::Keep(i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || table[i][j - 1] >= table[i - 1][j]) {
            steps.push(Step::Insert(j - 1));
            j -= 1;
        } else {
            steps.push(Step::Delete(i - 1));
            i -= 1;
        }
    }
    steps.reverse();
    steps
}

fn block_id(block: &Block) -> String {
    block.id.clone().unwrap_or_default()
}

fn merge_replacements(steps: &[Step], old: &[Block], new: &[Block]) -> Vec<DiffOp> {
    let mut ops = Vec::with_capacity(steps.len());
    let mut idx = 0;
    while idx < steps.len() {
        match (steps[idx], steps.get(idx + 1).copied()) {
            (Step::Delete(o), Some(Step::Insert(n))) if old[o].kind == new[n].kind => {
                ops.push(DiffOp::Update {
                    block_id: block_id(&old[o]),
                    block: new[n].clone(),
                });
                idx += 2;
                continue;
            }
            (Step::Keep(o, _), _) => ops.push(DiffOp::Keep {
                block_id: block_id(&old[o]),
            }),
            (Step::Insert(n), _) => ops.push(DiffOp::Insert {
                after: None,
                block: new[n].clone(),
            }),
            (Step::Delete(o), _) => ops.push(DiffOp::Delete {
                block_id: block_id(&old[o]),
            }),
        }
        idx += 1;
    }
    ops
}

fn assign_anchors(ops: Vec<DiffOp>) -> Vec<DiffOp> {
    let mut anchor: Option<String> = None;
    ops.into_iter()
        .map(|op| match op {
            DiffOp::Keep { block_id } => {
                anchor = Some(block_id.clone());
                DiffOp::Keep { block_id }
            }
            DiffOp::Update { block_id, block } => {
                anchor = Some(block_id.clone());
                DiffOp::Update { block_id, block }
            }
            DiffOp::Insert { block, .. } => DiffOp::Insert {
                after: anchor.clone(),
                block,
            },
            delete @ DiffOp::Delete { .. } => delete,
        })
        .collect()
}
