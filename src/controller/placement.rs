//! Placement policy: least-loaded-first replica targets and load fallbacks.

/// Pick `want` target nodes for a new file, least-loaded first.
///
/// `load` is (port, held file count) in membership order; ties keep that
/// order, which is stable but carries no other meaning. The caller has
/// already verified that at least `want` nodes are joined.
pub fn choose_targets(load: &[(u16, usize)], want: usize) -> Vec<u16> {
    let mut ranked = load.to_vec();
    ranked.sort_by_key(|(_, count)| *count);
    ranked.into_iter().take(want).map(|(port, _)| port).collect()
}

/// Alternate holders a client may retry after the primary, in table order.
pub fn reload_fallback(holders: &[u16]) -> Vec<u16> {
    holders.iter().skip(1).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_first() {
        let load = vec![(9001, 3), (9002, 0), (9003, 1), (9004, 2)];
        assert_eq!(choose_targets(&load, 2), vec![9002, 9003]);
    }

    #[test]
    fn test_ties_keep_membership_order() {
        let load = vec![(9001, 1), (9002, 1), (9003, 1)];
        assert_eq!(choose_targets(&load, 2), vec![9001, 9002]);
    }

    #[test]
    fn test_takes_all_when_want_covers_fleet() {
        let load = vec![(9001, 2), (9002, 0)];
        assert_eq!(choose_targets(&load, 2), vec![9002, 9001]);
    }

    #[test]
    fn test_reload_fallback_skips_primary() {
        assert_eq!(reload_fallback(&[9001, 9002, 9003]), vec![9002, 9003]);
        assert!(reload_fallback(&[9001]).is_empty());
        assert!(reload_fallback(&[]).is_empty());
    }
}
