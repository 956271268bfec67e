//! Kind policy: the curated allow-list plus the open kind ranges, modelled
//! as predicates rather than embedded in a dispatch switch.

use std::collections::HashSet;

/// Curated kinds accepted outside of the open ranges below. A relay running
/// this crate is expected to extend this list via `KindPolicy::allow`.
pub fn default_allowed_kinds() -> HashSet<u32> {
    [
        0, 1, 2, 3, 4, 5, 6, 7, 8, 14, 15, 16, 40, 41, 42, 43, 44, 1063, 1984, 1985, 9734, 9735,
        10000, 10001, 10002, 10003, 13194, 22242, 23194, 23195, 30000, 30001, 30002, 30003, 30008,
        30009, 30017, 30018, 30023, 30024, 30078, 30311, 30315, 1059,
    ]
    .into_iter()
    .collect()
}

/// Open kind ranges that are always acceptable without appearing in the
/// allow-list.
pub fn in_open_range(kind: u32) -> bool {
    (20000..30000).contains(&kind)
        || (5000..7000).contains(&kind)
        || kind == 7000
        || (9000..9031).contains(&kind)
        || kind == 9021
        || kind == 9022
        || (39000..39004).contains(&kind)
}

pub struct KindPolicy {
    allowed: HashSet<u32>,
}

impl Default for KindPolicy {
    fn default() -> Self {
        Self { allowed: default_allowed_kinds() }
    }
}

impl KindPolicy {
    pub fn is_acceptable(&self, kind: u32) -> bool {
        self.allowed.contains(&kind) || in_open_range(kind)
    }

    pub fn allow(&mut self, kind: u32) {
        self.allowed.insert(kind);
    }
}

/// Required tags per kind: (tag name, minimum element count including the name).
pub fn required_tags(kind: u32) -> &'static [(&'static str, usize)] {
    match kind {
        5 => &[("e", 2)],
        6 => &[("e", 2)],
        7 => &[("e", 2)],
        9734 => &[("p", 2)],
        9735 => &[("p", 2), ("bolt11", 2)],
        1984 => &[("p", 2)],
        9000 | 9001 => &[("h", 2)],
        9021 | 9022 => &[("h", 2)],
        39000 | 39001 | 39002 | 39003 => &[("d", 2)],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_range_is_open() {
        assert!(in_open_range(20000));
        assert!(in_open_range(29999));
        assert!(!in_open_range(30000));
    }

    #[test]
    fn moderation_ranges_are_open() {
        assert!(in_open_range(9000));
        assert!(in_open_range(9030));
        assert!(in_open_range(9021));
        assert!(in_open_range(9022));
        assert!(!in_open_range(9031));
    }

    #[test]
    fn default_policy_accepts_kind_1() {
        let p = KindPolicy::default();
        assert!(p.is_acceptable(1));
        assert!(!p.is_acceptable(99999));
    }
}
