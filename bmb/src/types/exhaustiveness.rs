//! Match exhaustiveness and reachability analysis
//!
//! A simplified usefulness check: enum scrutinees must cover every
//! variant (or carry an unguarded catch-all), booleans must cover both
//! values, and open domains (integers, floats, strings) require an
//! unguarded catch-all arm.

use std::collections::HashSet;

use crate::ast::{EnumDef, LiteralPattern, MatchArm, Pattern, Type};

/// Result of coverage analysis for one match expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchCoverage {
    Exhaustive,
    /// Human-readable description of what is missing
    Missing(String),
    /// Every remaining case is only covered by guarded arms
    GuardedOnly,
}

/// An arm is a catch-all when its pattern matches anything.
fn is_catch_all(pattern: &Pattern) -> bool {
    match pattern {
        Pattern::Wildcard | Pattern::Var(_) => true,
        Pattern::Tuple(ps) => ps.iter().all(|p| is_catch_all(&p.node)),
        _ => false,
    }
}

/// Check that `arms` cover the scrutinee type.
pub fn check_match(
    arms: &[MatchArm],
    scrut_ty: &Type,
    enum_def: Option<&EnumDef>,
) -> MatchCoverage {
    let unguarded_catch_all = arms
        .iter()
        .any(|a| a.guard.is_none() && is_catch_all(&a.pattern.node));
    if unguarded_catch_all {
        return MatchCoverage::Exhaustive;
    }
    let guarded_catch_all = arms
        .iter()
        .any(|a| a.guard.is_some() && is_catch_all(&a.pattern.node));

    if let Some(def) = enum_def {
        let covered: HashSet<&str> = arms
            .iter()
            .filter(|a| a.guard.is_none())
            .filter_map(|a| match &a.pattern.node {
                Pattern::EnumVariant { variant, bindings, .. }
                    if bindings.iter().all(|b| is_catch_all(&b.node)) =>
                {
                    Some(variant.as_str())
                }
                _ => None,
            })
            .collect();
        let missing: Vec<String> = def
            .variants
            .iter()
            .filter(|v| !covered.contains(v.name.node.as_str()))
            .map(|v| format!("`{}::{}`", def.name.node, v.name.node))
            .collect();
        if missing.is_empty() {
            return MatchCoverage::Exhaustive;
        }
        if guarded_catch_all {
            return MatchCoverage::GuardedOnly;
        }
        return MatchCoverage::Missing(missing.join(", "));
    }

    if scrut_ty.base() == &Type::Bool {
        let mut saw_true = false;
        let mut saw_false = false;
        for arm in arms.iter().filter(|a| a.guard.is_none()) {
            if let Pattern::Literal(LiteralPattern::Bool(b)) = &arm.pattern.node {
                if *b {
                    saw_true = true;
                } else {
                    saw_false = true;
                }
            }
        }
        if saw_true && saw_false {
            return MatchCoverage::Exhaustive;
        }
        if guarded_catch_all {
            return MatchCoverage::GuardedOnly;
        }
        let missing = match (saw_true, saw_false) {
            (false, false) => "`true`, `false`",
            (false, true) => "`true`",
            _ => "`false`",
        };
        return MatchCoverage::Missing(missing.to_string());
    }

    // Open domain: literals can never be exhaustive by themselves.
    if guarded_catch_all {
        MatchCoverage::GuardedOnly
    } else {
        MatchCoverage::Missing("a catch-all arm (`_`)".to_string())
    }
}

/// Indices of arms that can never match because an earlier unguarded arm
/// subsumes them.
pub fn unreachable_arms(arms: &[MatchArm]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut saw_catch_all = false;
    let mut seen_variants: HashSet<String> = HashSet::new();
    let mut seen_ints: HashSet<i64> = HashSet::new();
    let mut seen_bools: HashSet<bool> = HashSet::new();

    for (idx, arm) in arms.iter().enumerate() {
        if saw_catch_all {
            out.push(idx);
            continue;
        }
        // Guarded arms neither shadow later arms nor get shadowed by an
        // earlier guarded arm.
        let duplicate = arm.guard.is_none()
            && match &arm.pattern.node {
                Pattern::EnumVariant { variant, bindings, .. }
                    if bindings.iter().all(|b| is_catch_all(&b.node)) =>
                {
                    !seen_variants.insert(variant.clone())
                }
                Pattern::Literal(LiteralPattern::Int(n)) => !seen_ints.insert(*n),
                Pattern::Literal(LiteralPattern::Bool(b)) => !seen_bools.insert(*b),
                _ => false,
            };
        if duplicate {
            out.push(idx);
            continue;
        }
        if arm.guard.is_none() && is_catch_all(&arm.pattern.node) {
            saw_catch_all = true;
        }
    }
    out
}
