//! Folding of the raw facade taxonomy (18 classification codes) into the 8 classes the model is trained on.
//!
//! Mapping happens in two steps: the merge rules rewrite groups of raw codes onto one representative code,
//! then the class table assigns a class index to every representative. Rules run in the order of
//! `MERGE_RULES`. No rule targets a code that a later rule reads, so the order never changes the outcome.

use anyhow::{anyhow, Context, Result};
use std::fmt::Display;

pub const NUM_CLASSES: usize = 8;

pub const CLASS_NAMES: [&str; NUM_CLASSES] = [
    "wall", "window", "door", "molding", "other", "terrain", "column", "arch",
];

/// A classification code exactly as it is stored in a scan file. Only values of this type can be remapped, which
/// keeps already mapped class indices from being mapped a second time
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawClassCode(pub u8);

impl Display for RawClassCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names of the raw taxonomy, indexed by raw code
pub const RAW_CLASS_NAMES: [&str; 18] = [
    "total",
    "wall",
    "window",
    "door",
    "balcony",
    "molding",
    "deco",
    "column",
    "arch",
    "drainpipe",
    "stairs",
    "ground surface",
    "terrain",
    "roof",
    "blinds",
    "outer ceiling surface",
    "interior",
    "other",
];

pub struct MergeRule {
    pub description: &'static str,
    pub sources: &'static [u8],
    pub target: u8,
}

pub const MERGE_RULES: [MergeRule; 5] = [
    MergeRule {
        description: "molding and decoration",
        sources: &[5, 6],
        target: 6,
    },
    MergeRule {
        description: "wall, drainpipe, outer ceiling surface and stairs",
        sources: &[1, 9, 15, 10],
        target: 1,
    },
    MergeRule {
        description: "terrain and ground surface",
        sources: &[12, 11],
        target: 11,
    },
    MergeRule {
        description: "roof, interior and other",
        sources: &[13, 16, 17],
        target: 13,
    },
    MergeRule {
        description: "blinds into window",
        sources: &[14],
        target: 2,
    },
];

/// Representative raw code -> class index
pub const CLASS_TABLE: [(u8, u8); NUM_CLASSES] = [
    (1, 0),
    (2, 1),
    (3, 2),
    (6, 3),
    (13, 4),
    (11, 5),
    (7, 6),
    (8, 7),
];

fn apply_merge_rules(code: u8) -> u8 {
    MERGE_RULES.iter().fold(code, |code, rule| {
        if rule.sources.contains(&code) {
            rule.target
        } else {
            code
        }
    })
}

/// Maps a raw classification code to its class index in `[0, NUM_CLASSES)`. Codes that the taxonomy does not
/// cover are an error, because dropping them would silently change the scene
pub fn remap(code: RawClassCode) -> Result<u8> {
    let merged = apply_merge_rules(code.0);
    CLASS_TABLE
        .iter()
        .find(|(representative, _)| *representative == merged)
        .map(|(_, class)| *class)
        .ok_or_else(|| {
            let name = RAW_CLASS_NAMES
                .get(code.0 as usize)
                .copied()
                .unwrap_or("unknown");
            anyhow!(
                "Unmapped raw classification code {} ({}), the label table is incomplete",
                code,
                name
            )
        })
}

/// Maps the raw classification column of a scan file. Fails on the first unmapped code
pub fn remap_all(raw_codes: &[u8]) -> Result<Vec<u8>> {
    raw_codes
        .iter()
        .enumerate()
        .map(|(point_index, code)| {
            remap(RawClassCode(*code))
                .with_context(|| format!("Invalid label of point {}", point_index))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_covers_taxonomy() -> Result<()> {
        let expected: [(u8, u8); 16] = [
            (1, 0),
            (2, 1),
            (3, 2),
            (5, 3),
            (6, 3),
            (7, 6),
            (8, 7),
            (9, 0),
            (10, 0),
            (11, 5),
            (12, 5),
            (13, 4),
            (14, 1),
            (15, 0),
            (16, 4),
            (17, 4),
        ];
        for (raw, class) in expected {
            let mapped = remap(RawClassCode(raw))?;
            assert_eq!(mapped, class, "Raw code {} mapped to {}", raw, mapped);
            assert!((mapped as usize) < NUM_CLASSES);
        }
        Ok(())
    }

    #[test]
    fn test_unmapped_codes_fail() {
        for raw in [0, 4, 18, 255] {
            assert!(remap(RawClassCode(raw)).is_err(), "Raw code {} was mapped", raw);
        }
    }

    #[test]
    fn test_remap_all_reports_point_index() {
        let err = remap_all(&[1, 2, 4]).unwrap_err();
        assert!(format!("{:#}", err).contains("point 2"));
    }

    #[test]
    fn test_rule_targets_are_not_sources_of_later_rules() {
        for (idx, rule) in MERGE_RULES.iter().enumerate() {
            for later in &MERGE_RULES[idx + 1..] {
                assert!(
                    !later.sources.contains(&rule.target),
                    "Rule '{}' feeds into rule '{}'",
                    rule.description,
                    later.description
                );
            }
        }
    }

    #[test]
    fn test_rule_order_does_not_matter() {
        for raw in 0..=u8::MAX {
            let reversed = MERGE_RULES.iter().rev().fold(raw, |code, rule| {
                if rule.sources.contains(&code) {
                    rule.target
                } else {
                    code
                }
            });
            assert_eq!(apply_merge_rules(raw), reversed);
        }
    }

    #[test]
    fn test_mapping_class_indices_again_is_not_a_noop() {
        // Numeric class indices overlap with raw codes, e.g. window (1) would be read as raw wall (1) -> 0.
        // `RawClassCode` exists so that this cannot happen by accident.
        let window = remap(RawClassCode(2)).unwrap();
        assert_eq!(window, 1);
        assert_ne!(remap(RawClassCode(window)).unwrap(), window);
        // terrain (5) would be read as raw molding and `other` (4) is no raw code at all
        assert!(remap(RawClassCode(remap(RawClassCode(13)).unwrap())).is_err());
    }
}
