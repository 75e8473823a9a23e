//! Deterministic post-processing of the language model's raw selection.
//!
//! The model proposes candidate indices; arbitration enforces the things the
//! model cannot be trusted with: bounds, uniqueness, the selection cap, the
//! gain-stage redundancy rule, and popularity backfill when the model
//! under-selects.

use std::cmp::Reverse;
use std::collections::HashSet;

use crate::catalog::{Gear, Tone};

/// Textual indicators that an amp profile already has a boost or overdrive
/// pedal baked into its signal chain.
pub const BOOST_SIGNAL_KEYWORDS: &[&str] = &[
    "boost",
    "boosted",
    "overdrive",
    "od ",
    " od",
    "tubescreamer",
    "tube screamer",
    "ts808",
    "ts-808",
    "ts9",
    "ts-9",
    "sd1",
    "sd-1",
    "klon",
    "treble booster",
    "rangemaster",
];

/// Textual indicators that a pedal profile is a preamp/boost/overdrive type.
pub const BOOST_PEDAL_KEYWORDS: &[&str] = &[
    "preamp",
    "boost",
    "overdrive",
    "tubescreamer",
    "tube screamer",
    "ts808",
    "ts-808",
    "ts9",
    "ts-9",
    "sd-1",
    "sd1",
    "klon",
];

/// A category-conflict rule: when any selected item of `trigger_gear`
/// matches a trigger keyword, selected items of `suppressed_gear` matching a
/// suppressed keyword are dropped (and stay excluded during backfill).
#[derive(Debug, Clone, Copy)]
pub struct ConflictRule {
    pub trigger_gear: Gear,
    pub trigger_keywords: &'static [&'static str],
    pub suppressed_gear: Gear,
    pub suppressed_keywords: &'static [&'static str],
}

/// An amp tone that already embeds pedal-style gain coloration makes a
/// separate boost/preamp pedal redundant.
pub const GAIN_STAGE_RULE: ConflictRule = ConflictRule {
    trigger_gear: Gear::Amp,
    trigger_keywords: BOOST_SIGNAL_KEYWORDS,
    suppressed_gear: Gear::Pedal,
    suppressed_keywords: BOOST_PEDAL_KEYWORDS,
};

fn text_matches_any(text: &str, keywords: &[&str]) -> bool {
    let lowered = text.to_ascii_lowercase();
    keywords.iter().any(|keyword| lowered.contains(keyword))
}

pub fn contains_boost_signal(tone: &Tone) -> bool {
    tone.gear_kind() == GAIN_STAGE_RULE.trigger_gear
        && text_matches_any(&tone.search_text(), GAIN_STAGE_RULE.trigger_keywords)
}

pub fn is_boost_or_preamp_pedal(tone: &Tone) -> bool {
    tone.gear_kind() == GAIN_STAGE_RULE.suppressed_gear
        && text_matches_any(&tone.search_text(), GAIN_STAGE_RULE.suppressed_keywords)
}

/// In-range filter plus order-preserving dedup. Raw values come straight
/// from model JSON, so they may be negative, out of range, or repeated.
fn sanitize_indices(len: usize, raw: &[i64]) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    for &value in raw {
        if value < 0 {
            continue;
        }
        let index = value as usize;
        if index >= len || out.contains(&index) {
            continue;
        }
        out.push(index);
    }
    out
}

/// Sanitized selection truncated to `max`: the model-level decision, where a
/// plain cap applies and no redundancy rule does.
pub fn clamp_indices(len: usize, raw: &[i64], max: usize) -> Vec<usize> {
    let mut indices = sanitize_indices(len, raw);
    indices.truncate(max);
    indices
}

/// Tone-level arbitration.
///
/// Output invariants: unique in-range indices, at most `max_selections` of
/// them, and no suppressed pedal alongside a boost-signal amp unless the
/// pool ran out of eligible alternatives. An under-filled result is returned
/// silently.
pub fn arbitrate(tones: &[Tone], raw: &[i64], max_selections: usize) -> Vec<usize> {
    let mut selected = sanitize_indices(tones.len(), raw);

    let amp_has_boost = selected
        .iter()
        .any(|&index| contains_boost_signal(&tones[index]));
    if amp_has_boost {
        selected.retain(|&index| !is_boost_or_preamp_pedal(&tones[index]));
    }

    if selected.len() >= max_selections {
        selected.truncate(max_selections);
        return selected;
    }

    let chosen: HashSet<usize> = selected.iter().copied().collect();
    let mut remaining: Vec<usize> = (0..tones.len())
        .filter(|index| !chosen.contains(index))
        .filter(|&index| !(amp_has_boost && is_boost_or_preamp_pedal(&tones[index])))
        .collect();
    // Stable sort: ties keep first-seen pool order.
    remaining.sort_by_key(|&index| Reverse(tones[index].downloads_count));

    for index in remaining {
        selected.push(index);
        if selected.len() >= max_selections {
            break;
        }
    }
    selected
}
