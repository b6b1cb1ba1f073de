//! Dotted version comparison.
//!
//! Fields compare numerically, left to right. Missing trailing fields count as
//! zero, so "1.2" == "1.2.0". A leading `v` is ignored. A non-numeric field
//! compares by its leading digits and then by the remaining text, which keeps
//! "1.0b2" ordered after "1.0b1" without ever falling back to comparing whole
//! strings. Numbers of any length compare by value; nothing overflows.

use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field<'a> {
    /// Leading digits with leading zeros removed; empty for zero.
    digits: &'a str,
    suffix: &'a str,
}

impl Field<'_> {
    fn cmp_number(&self, other: &Self) -> Ordering {
        self.digits
            .len()
            .cmp(&other.digits.len())
            .then_with(|| self.digits.cmp(other.digits))
    }
}

fn fields(version: &str) -> Vec<Field<'_>> {
    version
        .trim()
        .trim_start_matches(['v', 'V'])
        .split('.')
        .map(|part| {
            let digits = part.find(|c: char| !c.is_ascii_digit()).unwrap_or(part.len());
            Field {
                digits: part[..digits].trim_start_matches('0'),
                suffix: &part[digits..],
            }
        })
        .collect()
}

/// Compare two dotted version strings field by field.
pub fn compare(a: &str, b: &str) -> Ordering {
    let a = fields(a);
    let b = fields(b);
    let zero = Field { digits: "", suffix: "" };

    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).unwrap_or(&zero);
        let right = b.get(i).unwrap_or(&zero);
        let ordering = left.cmp_number(right).then_with(|| {
            // "1.0" sorts after "1.0b1": an empty suffix is the release.
            match (left.suffix.is_empty(), right.suffix.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => left.suffix.cmp(right.suffix),
            }
        });
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Check if version `candidate` is newer than `current`.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    compare(candidate, current) == Ordering::Greater
}
