//! Token alignment between an original and an edited prompt
//!
//! Global (Needleman-Wunsch) alignment with gap score 0, match 1 and
//! mismatch -1. Each position of the edited sequence is mapped to the
//! position of the original token it aligns with, or flagged as inserted.

use crate::text::MAX_PROMPT_LENGTH;

const GAP: i32 = 0;
const MATCH: i32 = 1;
const MISMATCH: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trace {
    Stop,
    Left,
    Up,
    Diagonal,
}

/// Mapping from edited-prompt positions to original-prompt positions
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAlignment {
    /// 1.0 where the edited token aligns with an original token, 0.0 where inserted
    pub mask: Vec<f32>,
    /// Original position each edited position reads from; 0 for inserted tokens
    pub indices: Vec<i64>,
}

impl TokenAlignment {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Align `original` and `edited` over the 77-token axis
///
/// Positions past the end of `edited` map to themselves with mask 1.0.
pub fn align_tokens(original: &[u32], edited: &[u32]) -> TokenAlignment {
    let trace = traceback(original, edited);

    // Walk back from the bottom-right corner, one entry per edited token
    let mut mapped: Vec<Option<usize>> = Vec::with_capacity(edited.len());
    let (mut i, mut j) = (original.len(), edited.len());
    while i > 0 || j > 0 {
        match trace[i][j] {
            Trace::Diagonal => {
                i -= 1;
                j -= 1;
                mapped.push(Some(i));
            }
            Trace::Left => {
                j -= 1;
                mapped.push(None);
            }
            Trace::Up => i -= 1,
            Trace::Stop => break,
        }
    }
    mapped.reverse();

    let len = MAX_PROMPT_LENGTH.max(edited.len());
    let mut mask = vec![1.0f32; len];
    let mut indices: Vec<i64> = (0..len as i64).collect();
    for (j, source) in mapped.into_iter().enumerate() {
        match source {
            Some(i) => indices[j] = i as i64,
            None => {
                indices[j] = 0;
                mask[j] = 0.0;
            }
        }
    }

    TokenAlignment { mask, indices }
}

fn traceback(x: &[u32], y: &[u32]) -> Vec<Vec<Trace>> {
    let mut score = vec![vec![0i32; y.len() + 1]; x.len() + 1];
    let mut trace = vec![vec![Trace::Stop; y.len() + 1]; x.len() + 1];

    for (j, cell) in score[0].iter_mut().enumerate() {
        *cell = GAP * j as i32;
    }
    for i in 1..=x.len() {
        score[i][0] = GAP * i as i32;
        trace[i][0] = Trace::Up;
    }
    for j in 1..=y.len() {
        trace[0][j] = Trace::Left;
    }

    for i in 1..=x.len() {
        for j in 1..=y.len() {
            let left = score[i][j - 1] + GAP;
            let up = score[i - 1][j] + GAP;
            let diag = score[i - 1][j - 1] + if x[i - 1] == y[j - 1] { MATCH } else { MISMATCH };

            let best = left.max(up).max(diag);
            score[i][j] = best;
            // ties prefer left, then up
            trace[i][j] = if best == left {
                Trace::Left
            } else if best == up {
                Trace::Up
            } else {
                Trace::Diagonal
            };
        }
    }

    trace
}
