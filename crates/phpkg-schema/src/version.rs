//! Version ordering.
//!
//! Everything that says "latest" (index deduplication, the outdated report,
//! minimum-version dependency checks) goes through [`compare`], so there is
//! exactly one notion of ordering in the system.

use std::cmp::Ordering;

/// Compare two version strings.
///
/// Versions are split on `.` and compared component by component:
/// - components with a leading number compare by that number first
///   (`10 > 9`, `010 == 10`),
/// - on equal numbers a prerelease suffix (one starting with a letter,
///   `0RC1`, `0-beta2`) sorts below the bare number, and any other suffix
///   (`0-2`) above it; two suffixes of the same kind compare lexically
///   ignoring case (`beta1 < RC1`),
/// - anything else compares lexically,
/// - when one version runs out of components first it is the smaller one
///   (`1.2 < 1.2.0`).
///
/// If every component compares equal the raw strings decide, so the
/// ordering is total and only identical strings compare `Equal`.
pub fn compare(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');

    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => match compare_component(l, r) {
                Ordering::Equal => {}
                other => return other,
            },
        }
    }
}

fn compare_component(l: &str, r: &str) -> Ordering {
    let (l_num, l_rest) = split_number(l);
    let (r_num, r_rest) = split_number(r);
    if l_num.is_empty() || r_num.is_empty() {
        return l.cmp(r);
    }

    compare_digits(l_num, r_num)
        .then_with(|| suffix_rank(l_rest).cmp(&suffix_rank(r_rest)))
        .then_with(|| {
            l_rest
                .to_ascii_lowercase()
                .cmp(&r_rest.to_ascii_lowercase())
        })
}

/// Split a component into its leading digits and the rest.
fn split_number(component: &str) -> (&str, &str) {
    let end = component
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(component.len());
    component.split_at(end)
}

/// Compare digit strings by magnitude without parsing, so date-like
/// components (20240115) can never overflow.
fn compare_digits(l: &str, r: &str) -> Ordering {
    let l = l.trim_start_matches('0');
    let r = r.trim_start_matches('0');
    l.len().cmp(&r.len()).then_with(|| l.cmp(r))
}

/// Prereleases sort before the release, revisions after it.
fn suffix_rank(suffix: &str) -> u8 {
    if suffix.is_empty() {
        return 1;
    }
    match suffix.trim_start_matches(['-', '_', '~']).chars().next() {
        Some(c) if c.is_ascii_alphabetic() => 0,
        _ => 2,
    }
}

/// Returns true if `candidate` is strictly newer than `current`.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}

/// Returns true if `version` is at least `minimum`.
pub fn satisfies_minimum(version: &str, minimum: &str) -> bool {
    compare(version, minimum) != Ordering::Less
}
