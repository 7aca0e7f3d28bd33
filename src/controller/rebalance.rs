//! Rebalance planning: replica repair plus load balancing.
//!
//! The planner is a pure function from a listing snapshot to a transfer
//! plan; no sockets, no clocks, no shared state. Nodes and files are
//! arena-indexed up front (slot numbers instead of ports and names), so the
//! backtracking search flips booleans in flat rows rather than chasing
//! nested maps.
//!
//! Two distributions are tracked side by side:
//! - `physical`: what each node actually reported holding. Only physically
//!   present files may be pushed from a node; a replica assigned to a node
//!   earlier in the same round does not exist there yet.
//! - `working`: the distribution the plan is steering towards, mutated by
//!   repairs and moves and rolled back when the search hits a dead end.

use std::collections::HashMap;

/// Ground truth gathered from one round of LIST probes: each joined node's
/// reported file list, in membership order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub entries: Vec<(u16, Vec<String>)>,
}

/// What one source node must push and delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePlan {
    /// (file, destination ports): push the bytes to every destination.
    pub sends: Vec<(String, Vec<u16>)>,
    /// Files to delete locally once the pushes land.
    pub deletes: Vec<String>,
}

/// Transfer plan for a whole round, keyed by source node.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub per_node: Vec<(u16, NodePlan)>,
    /// False when the backtracking search proved no move sequence can even
    /// out the load; the plan then carries replica repairs only.
    pub balance_found: bool,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.per_node.is_empty()
    }
}

/// Rebuild the allocation table from a snapshot: file → holder ports in
/// first-reported order. Files nobody reported are simply absent (lost).
pub fn rebuild_allocation(snapshot: &Snapshot) -> Vec<(String, Vec<u16>)> {
    let mut order: Vec<String> = Vec::new();
    let mut holders: HashMap<String, Vec<u16>> = HashMap::new();
    for (port, files) in &snapshot.entries {
        for name in files {
            match holders.get_mut(name) {
                Some(h) => h.push(*port),
                None => {
                    order.push(name.clone());
                    holders.insert(name.clone(), vec![*port]);
                }
            }
        }
    }
    order
        .into_iter()
        .filter_map(|name| holders.remove(&name).map(|h| (name, h)))
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Move {
    src: usize,
    dst: usize,
    file: usize,
    /// Balance moves delete at the source; repair copies do not.
    relocate: bool,
}

/// Compute the round's transfer plan.
pub fn plan(snapshot: &Snapshot, replication: usize) -> Plan {
    let node_count = snapshot.entries.len();
    let ports: Vec<u16> = snapshot.entries.iter().map(|(p, _)| *p).collect();

    // intern file names into slot numbers
    let mut names: Vec<&str> = Vec::new();
    let mut ids: HashMap<&str, usize> = HashMap::new();
    for (_, files) in &snapshot.entries {
        for name in files {
            ids.entry(name.as_str()).or_insert_with(|| {
                names.push(name.as_str());
                names.len() - 1
            });
        }
    }
    let file_count = names.len();
    if file_count == 0 || node_count == 0 {
        return Plan {
            per_node: Vec::new(),
            balance_found: true,
        };
    }

    let mut physical = vec![vec![false; file_count]; node_count];
    for (n, (_, files)) in snapshot.entries.iter().enumerate() {
        for name in files {
            physical[n][ids[name.as_str()]] = true;
        }
    }
    let mut working = physical.clone();
    let mut counts: Vec<usize> = working
        .iter()
        .map(|row| row.iter().filter(|held| **held).count())
        .collect();

    let mut moves = repair_replication(&physical, &mut working, &mut counts, replication);

    let expected = expected_counts(file_count, replication, &counts);
    let budget: usize = counts
        .iter()
        .zip(&expected)
        .map(|(count, exp)| count.abs_diff(*exp))
        .sum();
    let mut balance_moves = Vec::new();
    let balance_found = balance(
        &physical,
        &mut working,
        &mut counts,
        &expected,
        budget,
        &mut balance_moves,
    );
    if balance_found {
        moves.extend(balance_moves);
    }

    fold_moves(&moves, &ports, &names, balance_found)
}

/// Phase 3: bring every under-replicated file back to `replication` copies.
/// Targets are picked least-loaded-first against the working distribution,
/// so successive picks spread across the fleet; the source is always a node
/// that physically holds the file.
fn repair_replication(
    physical: &[Vec<bool>],
    working: &mut [Vec<bool>],
    counts: &mut [usize],
    replication: usize,
) -> Vec<Move> {
    let node_count = physical.len();
    let file_count = physical.first().map(Vec::len).unwrap_or(0);
    let mut moves = Vec::new();

    for file in 0..file_count {
        let held = (0..node_count).filter(|n| physical[*n][file]).count();
        for _ in held..replication.min(node_count) {
            let mut ranked: Vec<usize> = (0..node_count).collect();
            ranked.sort_by_key(|n| counts[*n]);
            let Some(target) = ranked.into_iter().find(|n| !working[*n][file]) else {
                break;
            };
            let Some(source) = (0..node_count).find(|n| physical[*n][file]) else {
                break;
            };
            working[target][file] = true;
            counts[target] += 1;
            moves.push(Move {
                src: source,
                dst: target,
                file,
                relocate: false,
            });
        }
    }
    moves
}

/// Phase 4 targets: the ideal per-node file count. The remainder of
/// `files * replication / nodes` goes to the most-loaded nodes first; with
/// fewer replica slots than nodes, the most-loaded nodes get one file each
/// and the rest get none.
fn expected_counts(file_count: usize, replication: usize, counts: &[usize]) -> Vec<usize> {
    let node_count = counts.len();
    let slots = file_count * replication;
    let mut ranked: Vec<usize> = (0..node_count).collect();
    ranked.sort_by_key(|n| std::cmp::Reverse(counts[*n]));

    let mut expected = vec![0usize; node_count];
    if slots >= node_count {
        let base = slots / node_count;
        let remainder = slots % node_count;
        for (i, n) in ranked.into_iter().enumerate() {
            expected[n] = base + usize::from(i < remainder);
        }
    } else {
        for (i, n) in ranked.into_iter().enumerate() {
            expected[n] = usize::from(i < slots);
        }
    }
    expected
}

/// Phase 4 search: repeatedly move a file from the most-overloaded node to
/// the most-underloaded one, backtracking when a branch cannot close the
/// gap. Succeeds once the most-underloaded node has no deficit left; greedy
/// picking without the rollback gets stuck when the underloaded node
/// already holds everything the overloaded ones can offer.
///
/// `budget` bounds the recursion: a load-closing sequence needs at most one
/// move per unit of imbalance, so running out of budget means the branch is
/// a dead end, not that a feasible plan was missed.
fn balance(
    physical: &[Vec<bool>],
    working: &mut [Vec<bool>],
    counts: &mut [usize],
    expected: &[usize],
    budget: usize,
    moves: &mut Vec<Move>,
) -> bool {
    let node_count = counts.len();
    let file_count = physical.first().map(Vec::len).unwrap_or(0);

    let mut ranked: Vec<usize> = (0..node_count).collect();
    ranked.sort_by_key(|n| counts[*n] as i64 - expected[*n] as i64);
    let lowest = ranked[0];
    if counts[lowest] as i64 - expected[lowest] as i64 == 0 {
        return true;
    }
    if budget == 0 {
        return false;
    }

    for &over in ranked.iter().rev() {
        if counts[over] as i64 - expected[over] as i64 <= 0 {
            break;
        }
        for file in 0..file_count {
            // only files the donor physically reported and still carries in
            // the working distribution may move, and never onto a node that
            // already has the file
            if !working[over][file] || !physical[over][file] || working[lowest][file] {
                continue;
            }
            working[over][file] = false;
            counts[over] -= 1;
            working[lowest][file] = true;
            counts[lowest] += 1;
            moves.push(Move {
                src: over,
                dst: lowest,
                file,
                relocate: true,
            });

            if balance(physical, working, counts, expected, budget - 1, moves) {
                return true;
            }

            moves.pop();
            working[over][file] = true;
            counts[over] += 1;
            working[lowest][file] = false;
            counts[lowest] -= 1;
        }
    }
    false
}

/// Group the flat move list into one instruction per source node.
fn fold_moves(moves: &[Move], ports: &[u16], names: &[&str], balance_found: bool) -> Plan {
    let mut per_node: Vec<(u16, NodePlan)> = Vec::new();
    for m in moves {
        let src = ports[m.src];
        let dst = ports[m.dst];
        let name = names[m.file];

        let idx = match per_node.iter().position(|(p, _)| *p == src) {
            Some(idx) => idx,
            None => {
                per_node.push((src, NodePlan::default()));
                per_node.len() - 1
            }
        };
        let entry = &mut per_node[idx].1;
        match entry.sends.iter_mut().find(|(n, _)| n == name) {
            Some((_, targets)) => targets.push(dst),
            None => entry.sends.push((name.to_string(), vec![dst])),
        }
        if m.relocate {
            entry.deletes.push(name.to_string());
        }
    }
    Plan {
        per_node,
        balance_found,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(entries: &[(u16, &[&str])]) -> Snapshot {
        Snapshot {
            entries: entries
                .iter()
                .map(|(p, files)| (*p, files.iter().map(|f| f.to_string()).collect()))
                .collect(),
        }
    }

    /// Apply a plan to a snapshot and return the resulting per-node file
    /// sets, mimicking what the storage nodes would do.
    fn apply(snapshot: &Snapshot, plan: &Plan) -> HashMap<u16, Vec<String>> {
        let mut dist: HashMap<u16, Vec<String>> = snapshot
            .entries
            .iter()
            .map(|(p, files)| (*p, files.clone()))
            .collect();
        for (src, entry) in &plan.per_node {
            for (name, dests) in &entry.sends {
                for d in dests {
                    let row = dist.entry(*d).or_default();
                    if !row.contains(name) {
                        row.push(name.clone());
                    }
                }
            }
            for name in &entry.deletes {
                if let Some(row) = dist.get_mut(src) {
                    row.retain(|f| f != name);
                }
            }
        }
        dist
    }

    #[test]
    fn test_rebuild_allocation_ground_truth() {
        let snap = snapshot(&[
            (9001, &["a.txt", "b.txt"]),
            (9002, &["b.txt"]),
            (9003, &[]),
        ]);
        let alloc = rebuild_allocation(&snap);
        assert_eq!(
            alloc,
            vec![
                ("a.txt".to_string(), vec![9001]),
                ("b.txt".to_string(), vec![9001, 9002]),
            ]
        );
    }

    #[test]
    fn test_empty_snapshot_plans_nothing() {
        let plan = plan(&snapshot(&[(9001, &[]), (9002, &[])]), 2);
        assert!(plan.is_empty());
        assert!(plan.balance_found);
    }

    #[test]
    fn test_balanced_cluster_plans_nothing() {
        let plan = plan(&snapshot(&[(9001, &["a.txt"]), (9002, &["a.txt"])]), 2);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_repairs_under_replicated_file() {
        let snap = snapshot(&[(9001, &["a.txt"]), (9002, &[]), (9003, &[])]);
        let plan = plan(&snap, 2);
        assert!(plan.balance_found);
        assert_eq!(plan.per_node.len(), 1);
        let (src, entry) = &plan.per_node[0];
        assert_eq!(*src, 9001);
        assert!(entry.deletes.is_empty(), "repair copies, never deletes");
        assert_eq!(entry.sends.len(), 1);
        assert_eq!(entry.sends[0].0, "a.txt");
        assert_eq!(entry.sends[0].1.len(), 1);

        let dist = apply(&snap, &plan);
        let holders = dist.values().filter(|row| row.contains(&"a.txt".to_string())).count();
        assert_eq!(holders, 2);
    }

    #[test]
    fn test_repair_spreads_over_least_loaded() {
        // both new replicas must not land on the already-loaded node
        let snap = snapshot(&[
            (9001, &["a.txt", "b.txt"]),
            (9002, &["c.txt"]),
            (9003, &[]),
            (9004, &[]),
        ]);
        let plan = plan(&snap, 2);
        let dist = apply(&snap, &plan);
        for files in dist.values() {
            let mut sorted = files.clone();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), files.len(), "no node holds a duplicate");
        }
        for name in ["a.txt", "b.txt", "c.txt"] {
            let holders = dist
                .values()
                .filter(|row| row.contains(&name.to_string()))
                .count();
            assert_eq!(holders, 2, "{} should end at two replicas", name);
        }
    }

    #[test]
    fn test_balances_a_skewed_node() {
        let snap = snapshot(&[
            (9001, &["a.txt", "b.txt", "c.txt", "d.txt"]),
            (9002, &[]),
        ]);
        let plan = plan(&snap, 1);
        assert!(plan.balance_found);

        let dist = apply(&snap, &plan);
        let spread = dist.values().map(Vec::len).collect::<Vec<_>>();
        assert_eq!(spread.iter().max().unwrap() - spread.iter().min().unwrap(), 0);
        // every file still has exactly one holder
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            let holders = dist
                .values()
                .filter(|row| row.contains(&name.to_string()))
                .count();
            assert_eq!(holders, 1);
        }
        // balance moves delete at the source
        let (_, entry) = &plan.per_node[0];
        assert_eq!(entry.deletes.len(), 2);
    }

    #[test]
    fn test_balance_bound_holds_after_repair_and_moves() {
        let snap = snapshot(&[
            (9001, &["a.txt", "b.txt", "c.txt"]),
            (9002, &["a.txt"]),
            (9003, &[]),
        ]);
        let plan = plan(&snap, 2);
        assert!(plan.balance_found);
        let dist = apply(&snap, &plan);
        let max = dist.values().map(Vec::len).max().unwrap();
        let min = dist.values().map(Vec::len).min().unwrap();
        assert!(max - min <= 1, "spread {}..{} exceeds one file", min, max);
    }

    #[test]
    fn test_fewer_replica_slots_than_nodes() {
        let snap = snapshot(&[(9001, &["a.txt"]), (9002, &[]), (9003, &[]), (9004, &[])]);
        let plan = plan(&snap, 1);
        // one slot, four nodes: nothing to repair, nothing to move
        assert!(plan.is_empty());
        assert!(plan.balance_found);
    }

    #[test]
    fn test_infeasible_balance_keeps_repairs_only() {
        // every donor file already sits on every potential receiver, so no
        // move sequence can even things out
        let snap = snapshot(&[
            (9001, &["a.txt", "b.txt", "c.txt"]),
            (9002, &["a.txt", "b.txt", "c.txt"]),
            (9003, &["a.txt", "b.txt"]),
        ]);
        let plan = plan(&snap, 1);
        assert!(!plan.balance_found);
        assert!(plan.is_empty(), "no repairs needed, no balance applied");
    }

    #[test]
    fn test_deep_deficit_filled_from_distinct_donors() {
        // the underloaded node needs two files; after the first move its
        // copy of that file blocks the second donor's duplicate, forcing a
        // different file over
        let physical = vec![
            vec![true, true],  // node 0: a, b
            vec![true, true],  // node 1: a, b
            vec![false, false], // node 2: -
        ];
        let mut working = physical.clone();
        let mut counts = vec![2, 2, 0];
        let expected = vec![1, 1, 2];
        let mut moves = Vec::new();
        let found = balance(
            &physical,
            &mut working,
            &mut counts,
            &expected,
            4,
            &mut moves,
        );
        assert!(found);
        assert_eq!(counts, expected);
        assert_eq!(moves.len(), 2);
        // the two files landing on node 2 are distinct
        assert_ne!(moves[0].file, moves[1].file);
    }

    #[test]
    fn test_over_replicated_files_are_left_alone() {
        // three holders at replication two: the planner neither trims nor
        // repairs, and with even load it plans nothing at all
        let snap = snapshot(&[
            (9001, &["a.txt"]),
            (9002, &["a.txt"]),
            (9003, &["a.txt"]),
        ]);
        let plan = plan(&snap, 2);
        assert!(plan.is_empty());
    }
}
