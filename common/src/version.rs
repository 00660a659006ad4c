// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The software versions this controller has been qualified against, and the
//! dotted-version comparison used to check them.

use std::cmp::Ordering;

/// One supported software entry: the acceptable `[min, max]` version range
/// and whether the entry must be present on every node.
#[derive(Clone, Copy, Debug)]
pub struct SupportedSoftware {
    pub name: &'static str,
    pub min: &'static str,
    pub max: &'static str,
    pub required: bool,
}

/// Agent plugins the controller talks to.
pub const SUPPORTED_PLUGINS: &[SupportedSoftware] = &[
    SupportedSoftware { name: "Agent", min: "0.19", max: "0.19", required: true },
    SupportedSoftware {
        name: "OpenDNSSEC",
        min: "0.14",
        max: "0.14",
        required: true,
    },
    SupportedSoftware {
        name: "SoftHSM",
        min: "0.14",
        max: "0.14",
        required: false,
    },
    SupportedSoftware { name: "DNS", min: "0.12", max: "0.12", required: false },
];

/// Programs expected on the node itself.
pub const SUPPORTED_PROGRAMS: &[SupportedSoftware] = &[
    SupportedSoftware { name: "ods-control", min: "1", max: "1", required: true },
    SupportedSoftware {
        name: "ods-signerd",
        min: "1.3.14",
        max: "1.3.15",
        required: true,
    },
    SupportedSoftware {
        name: "ods-signer",
        min: "1.3.14",
        max: "1.3.15",
        required: true,
    },
    SupportedSoftware {
        name: "ods-enforcerd",
        min: "1.3.14",
        max: "1.3.15",
        required: true,
    },
    SupportedSoftware {
        name: "ods-ksmutil",
        min: "1.3.14",
        max: "1.3.15",
        required: true,
    },
    SupportedSoftware {
        name: "ods-hsmutil",
        min: "1.3.14",
        max: "1.3.15",
        required: false,
    },
    SupportedSoftware {
        name: "softhsm",
        min: "1.3.3",
        max: "1.3.5",
        required: false,
    },
];

impl SupportedSoftware {
    /// Whether `version` falls inside `[min, max]`.
    pub fn supports(&self, version: &str) -> bool {
        version_cmp(version, self.min) != Ordering::Less
            && version_cmp(version, self.max) != Ordering::Greater
    }
}

/// Compare two dotted version strings component-wise from the left.  Where
/// both components are numeric they compare numerically, otherwise as plain
/// strings.  A missing component sorts before any present one, so "1.3" is
/// less than "1.3.0".
pub fn version_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.cmp(y),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{version_cmp, SupportedSoftware};
    use std::cmp::Ordering;

    #[test]
    fn test_version_cmp() {
        assert_eq!(version_cmp("1.3.14", "1.3.14"), Ordering::Equal);
        assert_eq!(version_cmp("1.3.13", "1.3.14"), Ordering::Less);
        assert_eq!(version_cmp("1.3.15", "1.3.14"), Ordering::Greater);

        // Numeric components compare numerically, not lexicographically.
        assert_eq!(version_cmp("1.3.9", "1.3.10"), Ordering::Less);
        assert_eq!(version_cmp("0.19", "0.19"), Ordering::Equal);

        // Shorter versions sort before their extensions.
        assert_eq!(version_cmp("1.3", "1.3.0"), Ordering::Less);
        assert_eq!(version_cmp("1.3.0", "1.3"), Ordering::Greater);

        // Non-numeric components fall back to string order.
        assert_eq!(version_cmp("1.3.beta", "1.3.beta"), Ordering::Equal);
        assert_eq!(version_cmp("1.3.alpha", "1.3.beta"), Ordering::Less);
    }

    #[test]
    fn test_supports() {
        let entry = SupportedSoftware {
            name: "ods-signerd",
            min: "1.3.14",
            max: "1.3.15",
            required: true,
        };
        assert!(entry.supports("1.3.14"));
        assert!(entry.supports("1.3.15"));
        assert!(!entry.supports("1.3.13"));
        assert!(!entry.supports("1.3.16"));
        assert!(!entry.supports("1.4"));
    }
}
