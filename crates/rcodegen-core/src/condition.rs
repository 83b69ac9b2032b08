//! The condition expression language used by `step.if`.
//!
//! Strict left-to-right, no parentheses, no unary `NOT`. `OR` is lower
//! precedence than `AND`. This is a deliberately small language — no
//! general-purpose (Pratt) parser is warranted; see the design notes in
//! `SPEC_FULL.md` §4.4/§9.

use crate::context::Context;
use crate::resolver::resolve;

const COMPARATORS: &[&str] = &["<=", ">=", "==", "!=", "contains", "<", ">"];

/// Evaluate a condition expression against `ctx`. An empty expression is
/// `true`. Evaluation is deterministic and pure: the same expression and
/// context snapshot always produce the same result.
pub async fn evaluate(expr: &str, ctx: &Context) -> bool {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return true;
    }

    for or_operand in trimmed.split(" OR ") {
        if evaluate_and_chain(or_operand, ctx).await {
            return true; // short-circuit: no need to evaluate remaining OR operands
        }
    }
    false
}

async fn evaluate_and_chain(chain: &str, ctx: &Context) -> bool {
    for and_operand in chain.split(" AND ") {
        if !evaluate_operand(and_operand.trim(), ctx).await {
            return false; // short-circuit: no need to evaluate remaining AND operands
        }
    }
    true
}

async fn evaluate_operand(operand: &str, ctx: &Context) -> bool {
    match operand {
        "true" => return true,
        "false" => return false,
        _ => {}
    }

    let Some((lhs_raw, op, rhs_raw)) = split_comparison(operand) else {
        // Not a recognized literal or comparison — treat as unsatisfied,
        // same as an unresolved/nonsensical operand.
        return false;
    };

    let lhs = strip_quotes(&resolve(lhs_raw.trim(), ctx).await);
    let rhs = strip_quotes(&resolve(rhs_raw.trim(), ctx).await);

    match op {
        "==" => lhs == rhs,
        "!=" => lhs != rhs,
        "contains" => lhs.contains(&rhs),
        "<" | "<=" | ">" | ">=" => match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
            (Ok(l), Ok(r)) => match op {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                ">=" => l >= r,
                _ => unreachable!(),
            },
            _ => false,
        },
        _ => unreachable!(),
    }
}

/// Find the earliest-occurring top-level comparator (surrounded by
/// spaces) and split the operand into `(lhs, op, rhs)`.
fn split_comparison(operand: &str) -> Option<(&str, &str, &str)> {
    let mut best: Option<(usize, &str)> = None;
    for op in COMPARATORS {
        let needle = format!(" {op} ");
        if let Some(pos) = operand.find(&needle) {
            let is_better = match best {
                None => true,
                // Prefer the earliest match; on a tie, prefer the longer
                // operator (so "<=" wins over "<" at the same position).
                Some((best_pos, best_op)) => {
                    pos < best_pos || (pos == best_pos && op.len() > best_op.len())
                }
            };
            if is_better {
                best = Some((pos, op));
            }
        }
    }
    let (pos, op) = best?;
    let lhs = &operand[..pos];
    let rhs = &operand[pos + op.len() + 2..];
    Some((lhs, op, rhs))
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('\'') && s.ends_with('\'') {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
