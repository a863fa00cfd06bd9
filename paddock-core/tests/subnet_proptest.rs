//! Property-based tests for subnet allocation and address derivation

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use proptest::prelude::*;

use paddock_core::subnet::{
    AllocateOptions, MacPrefix, PoolSpec, StaticInterfaces, Subnet, SubnetAllocator,
};

// Pool range plus an allocation prefix no shorter than the range
fn pool_spec_strategy() -> impl Strategy<Value = PoolSpec> {
    (any::<u32>(), 16u8..=26, 0u8..=4).prop_map(|(addr, range_prefix, extra)| {
        let range = Ipv4Net::new(Ipv4Addr::from(addr), range_prefix)
            .unwrap()
            .trunc();
        PoolSpec {
            range,
            prefix_len: (range_prefix + extra).min(30),
        }
    })
}

// Several specs carved around one base address, so ranges nest and overlap
fn overlapping_specs_strategy() -> impl Strategy<Value = Vec<PoolSpec>> {
    (any::<u32>(), prop::collection::vec((20u8..=26, 0u8..=4), 1..4)).prop_map(|(base, shapes)| {
        shapes
            .into_iter()
            .map(|(range_prefix, extra)| PoolSpec {
                range: Ipv4Net::new(Ipv4Addr::from(base), range_prefix).unwrap().trunc(),
                prefix_len: (range_prefix + extra).min(30),
            })
            .collect()
    })
}

fn subnet_strategy() -> impl Strategy<Value = Subnet> {
    (any::<u32>(), 20u8..=30, 0u32..8, any::<[u8; 2]>()).prop_map(
        |(addr, prefix, reserved, mac)| {
            let net = Ipv4Net::new(Ipv4Addr::from(addr), prefix).unwrap();
            Subnet::new(net, reserved, MacPrefix(mac))
        },
    )
}

fn allocator(spec: PoolSpec, host: Vec<Ipv4Addr>) -> SubnetAllocator {
    pools(vec![spec], host)
}

fn pools(specs: Vec<PoolSpec>, host: Vec<Ipv4Addr>) -> SubnetAllocator {
    SubnetAllocator::with_interfaces(
        specs,
        2,
        MacPrefix::default(),
        Arc::new(StaticInterfaces(host)),
    )
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

proptest! {
    #[test]
    fn allocations_never_overlap(spec in pool_spec_strategy(), rounds in 1usize..20) {
        let allocator = allocator(spec, Vec::new());
        let mut leased: Vec<Ipv4Net> = Vec::new();

        for _ in 0..rounds {
            match allocator.allocate(&AllocateOptions::default()).unwrap() {
                Some(subnet) => {
                    let net = subnet.net();
                    prop_assert!(spec.range.contains(&net.network()));
                    prop_assert_eq!(net.prefix_len(), spec.prefix_len);
                    for other in &leased {
                        prop_assert!(!overlaps(&net, other), "{} overlaps {}", net, other);
                    }
                    leased.push(net);
                }
                None => {
                    prop_assert_eq!(leased.len() as u64, spec.candidate_count());
                    break;
                }
            }
        }
        prop_assert_eq!(allocator.leased().len(), leased.len());
    }

    #[test]
    fn overlapping_pools_never_lease_overlapping_ranges(specs in overlapping_specs_strategy()) {
        let allocator = pools(specs.clone(), Vec::new());
        let mut leased: Vec<Ipv4Net> = Vec::new();

        while let Some(subnet) = allocator.allocate(&AllocateOptions::default()).unwrap() {
            let net = subnet.net();
            prop_assert!(specs
                .iter()
                .any(|s| s.range.contains(&net.network()) && s.prefix_len == net.prefix_len()));
            for other in &leased {
                prop_assert!(!overlaps(&net, other), "{} overlaps {}", net, other);
            }
            leased.push(net);
        }
        prop_assert!(!leased.is_empty());
        prop_assert_eq!(allocator.leased().len(), leased.len());
    }

    #[test]
    fn released_subnet_can_be_leased_again(spec in pool_spec_strategy()) {
        let allocator = allocator(spec, Vec::new());
        let first = allocator.allocate(&AllocateOptions::default()).unwrap().unwrap();

        prop_assert!(allocator.release(&first));
        prop_assert!(!allocator.release(&first));
        prop_assert!(!allocator.is_leased(&first.net()));

        let again = allocator.allocate(&AllocateOptions::default()).unwrap().unwrap();
        prop_assert_eq!(again.net(), first.net());
    }

    #[test]
    fn host_addresses_are_never_leased(spec in pool_spec_strategy(), offset in any::<u32>()) {
        let size = 1u64 << (32 - spec.range.prefix_len());
        let host_ip = Ipv4Addr::from(
            u32::from(spec.range.network()).wrapping_add((u64::from(offset) % size) as u32),
        );
        let allocator = allocator(spec, vec![host_ip]);

        let mut seen = BTreeSet::new();
        while let Some(subnet) = allocator.allocate(&AllocateOptions::default()).unwrap() {
            prop_assert!(!subnet.contains(&host_ip));
            prop_assert!(seen.insert(subnet.net()));
        }
        prop_assert_eq!(seen.len() as u64, spec.candidate_count() - 1);
    }

    #[test]
    fn tenant_addresses_stay_inside_subnet(subnet in subnet_strategy(), index in -300i64..300) {
        let count = subnet.address_count() as i64;
        match subnet.address_at(index) {
            Some(address) => {
                prop_assert!(subnet.contains(&address.ip));
                prop_assert_ne!(address.ip, subnet.base());
                prop_assert_ne!(address.ip, subnet.broadcast());
                prop_assert!(index < count && index >= -count);
                // Derivation is pure
                prop_assert_eq!(Some(address), subnet.address_at(index));
            }
            None => prop_assert!(index >= count || index < -count),
        }
    }

    #[test]
    fn positive_and_negative_indexes_agree(subnet in subnet_strategy()) {
        let count = subnet.address_count() as i64;
        prop_assume!(count > 0);
        prop_assert_eq!(subnet.address_at(0), subnet.address_at(-count));
        prop_assert_eq!(subnet.address_at(count - 1), subnet.address_at(-1));
        prop_assert_eq!(subnet.first(), subnet.address_at(0));
        prop_assert_eq!(subnet.last(), subnet.address_at(-1));
    }

    #[test]
    fn mac_encodes_ip(subnet in subnet_strategy(), index in 0i64..16) {
        if let Some(address) = subnet.address_at(index) {
            let [p0, p1] = subnet.mac_prefix().0;
            let [a, b, c, d] = address.ip.octets();
            let octets: Vec<u8> = address
                .mac
                .split(':')
                .map(|part| u8::from_str_radix(part, 16).unwrap())
                .collect();
            prop_assert_eq!(octets, vec![p0, p1, a, b, c, d]);
        }
    }

    #[test]
    fn reserved_addresses_precede_tenant_addresses(subnet in subnet_strategy()) {
        let reserved = subnet.reserved_count() as i64;
        if let (Some(last_reserved), Some(first)) =
            (subnet.reserved_address_at(reserved - 1), subnet.first())
        {
            prop_assert_eq!(u32::from(last_reserved.ip) + 1, u32::from(first.ip));
        }
        if let Some(host) = subnet.host() {
            prop_assert_eq!(u32::from(host.ip), u32::from(subnet.base()) + 1);
        }
    }
}
