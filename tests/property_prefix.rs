//! Property-based tests for prefix carving
//!
//! Random carve and release sequences must keep children disjoint, inside the
//! parent, and the usage figures consistent.

use ipnet::IpNet;
use proptest::prelude::*;
use rusqlite::Connection;
use site_allocator::core::prefix::{PrefixError, PrefixStore, SqlPrefixStore};
use site_allocator::core::store::schema;

const NS: &str = "DatacenterOnly/provider/site";

#[derive(Debug, Clone)]
enum Op {
    Carve(u8),
    Release(usize),
}

fn ops(min_len: u8, max_len: u8) -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => (min_len..=max_len).prop_map(Op::Carve),
            1 => any::<usize>().prop_map(Op::Release),
        ],
        1..60,
    )
}

fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

fn run(parent: IpNet, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let conn = Connection::open_in_memory().unwrap();
    schema::create(&conn).unwrap();
    let store = SqlPrefixStore;
    store.create_prefix(&conn, NS, parent).unwrap();

    let total: u128 = 1u128 << (parent.max_prefix_len() - parent.prefix_len());
    let mut held: Vec<IpNet> = Vec::new();

    for op in ops {
        match op {
            Op::Carve(length) => match store.carve_child(&conn, NS, parent, length) {
                Ok(child) => {
                    prop_assert_eq!(child.prefix_len(), length);
                    prop_assert!(parent.contains(&child), "{} outside {}", child, parent);
                    for other in &held {
                        prop_assert!(!overlaps(&child, other), "{} overlaps {}", child, other);
                    }
                    held.push(child);
                }
                Err(PrefixError::NoSpace { .. }) => {
                    let usage = store.read_usage(&conn, NS, parent).unwrap();
                    for free in &usage.available_prefixes {
                        let free: IpNet = free.parse().unwrap();
                        prop_assert!(
                            free.prefix_len() > length,
                            "/{} refused while {} is free",
                            length,
                            free
                        );
                    }
                }
                Err(e) => return Err(TestCaseError::fail(format!("carve failed: {e}"))),
            },
            Op::Release(index) => {
                if held.is_empty() {
                    continue;
                }
                let child = held.swap_remove(index % held.len());
                store.release_child(&conn, NS, parent, child).unwrap();
                prop_assert!(matches!(
                    store.release_child(&conn, NS, parent, child),
                    Err(PrefixError::NotFound { .. })
                ), "second release of a child must return NotFound");
            }
        }

        let usage = store.read_usage(&conn, NS, parent).unwrap();
        let acquired: u128 = held
            .iter()
            .map(|c| 1u128 << (c.max_prefix_len() - c.prefix_len()))
            .sum();
        prop_assert_eq!(usage.acquired_prefixes, held.len() as u64);
        prop_assert_eq!(usage.acquired_ips, acquired);
        prop_assert_eq!(usage.available_ips + usage.acquired_ips, total);

        let free_sum: u128 = usage
            .available_prefixes
            .iter()
            .map(|p| {
                let p: IpNet = p.parse().unwrap();
                1u128 << (p.max_prefix_len() - p.prefix_len())
            })
            .sum();
        prop_assert_eq!(free_sum, usage.available_ips);

        let mut stored = store.children(&conn, NS, parent).unwrap();
        let mut expected = held.clone();
        stored.sort();
        expected.sort();
        prop_assert_eq!(stored, expected);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_ipv4_children_disjoint(seq in ops(21, 28)) {
        run("10.0.0.0/20".parse().unwrap(), seq)?;
    }

    #[test]
    fn prop_ipv6_children_disjoint(seq in ops(45, 64)) {
        run("2001:db8::/44".parse().unwrap(), seq)?;
    }
}

#[test]
fn test_shorter_than_parent_is_rejected() {
    let conn = Connection::open_in_memory().unwrap();
    schema::create(&conn).unwrap();
    let parent: IpNet = "10.0.0.0/24".parse().unwrap();
    SqlPrefixStore.create_prefix(&conn, NS, parent).unwrap();

    assert!(matches!(
        SqlPrefixStore.carve_child(&conn, NS, parent, 23),
        Err(PrefixError::InvalidChildLength { .. })
    ));
}
