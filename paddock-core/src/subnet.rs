//! Subnet pool management for network providers
//!
//! A [`SubnetAllocator`] owns an ordered list of pool specs such as
//! `172.16.0.0/12,24`: carve `/24` subnets out of `172.16.0.0/12`. Each
//! allocation walks the candidates in address order and leases the first one
//! that is neither leased already nor overlapping an address configured on a
//! host interface. Host interfaces are re-read on every allocation.
//!
//! Addresses inside a [`Subnet`] are derived, never stored: index `i` maps to
//! `network + 1 + reserved + i`, and the MAC is the IPv4 value under a
//! two-byte prefix, so a node's NIC configuration is reproducible.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::{PaddockError, PaddockResult};

/// Allocation prefixes narrower than this leave no usable addresses
const MAX_ALLOCATION_PREFIX: u8 = 30;

/// Leading two bytes of every derived MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPrefix(pub [u8; 2]);

impl Default for MacPrefix {
    fn default() -> Self {
        MacPrefix([0x80, 0x00])
    }
}

impl FromStr for MacPrefix {
    type Err = PaddockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_end_matches(':').split(':').collect();
        let invalid = || PaddockError::ConfigError(format!("Invalid MAC prefix: '{}'", s));
        if parts.len() != 2 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 2];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacPrefix(bytes))
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}", self.0[0], self.0[1])
    }
}

impl MacPrefix {
    /// MAC whose low four bytes encode `ip`
    pub fn mac_for(&self, ip: Ipv4Addr) -> String {
        let [a, b, c, d] = ip.octets();
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], a, b, c, d
        )
    }
}

/// One pool spec: the range to carve and the size of each carved subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub range: Ipv4Net,
    pub prefix_len: u8,
}

impl FromStr for PoolSpec {
    type Err = PaddockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cidr, bits) = s.split_once(',').ok_or_else(|| {
            PaddockError::ConfigError(format!(
                "Invalid pool spec '{}': expected '<CIDR>,<prefix-length>'",
                s
            ))
        })?;

        let range: Ipv4Net = cidr.trim().parse().map_err(|e| {
            PaddockError::ConfigError(format!("Invalid pool range '{}': {}", cidr, e))
        })?;
        let prefix_len: u8 = bits.trim().parse().map_err(|e| {
            PaddockError::ConfigError(format!("Invalid allocation prefix '{}': {}", bits, e))
        })?;

        if prefix_len < range.prefix_len() || prefix_len > MAX_ALLOCATION_PREFIX {
            return Err(PaddockError::ConfigError(format!(
                "Allocation prefix /{} must be between /{} and /{} for pool {}",
                prefix_len,
                range.prefix_len(),
                MAX_ALLOCATION_PREFIX,
                range
            )));
        }

        Ok(PoolSpec {
            range: range.trunc(),
            prefix_len,
        })
    }
}

impl fmt::Display for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.range, self.prefix_len)
    }
}

impl PoolSpec {
    /// Number of subnets this spec can hand out
    pub fn candidate_count(&self) -> u64 {
        1u64 << (self.prefix_len - self.range.prefix_len())
    }

    /// Candidate subnets in increasing address order
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        let base = u64::from(u32::from(self.range.network()));
        let step = 1u64 << (32 - self.prefix_len);
        (0..self.candidate_count()).filter_map(move |n| {
            let addr = Ipv4Addr::from((base + n * step) as u32);
            Ipv4Net::new(addr, self.prefix_len).ok()
        })
    }
}

/// A derived IP/MAC pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// A leased subnet with deterministic address derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    net: Ipv4Net,
    reserved: u32,
    mac_prefix: MacPrefix,
}

/// Serializable view of a subnet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetDump {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub maskbits: u8,
    pub size: u64,
    pub reserved: u32,
    pub addresses: u64,
    pub macbase: String,
    pub host: Option<Address>,
    pub first: Option<Address>,
    pub last: Option<Address>,
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.net)
    }
}

impl Subnet {
    pub fn new(net: Ipv4Net, reserved: u32, mac_prefix: MacPrefix) -> Self {
        Self {
            net: net.trunc(),
            reserved,
            mac_prefix,
        }
    }

    pub fn net(&self) -> Ipv4Net {
        self.net
    }

    pub fn base(&self) -> Ipv4Addr {
        self.net.network()
    }

    pub fn bitmask(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.net.netmask()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.net.broadcast()
    }

    pub fn mac_prefix(&self) -> MacPrefix {
        self.mac_prefix
    }

    /// Total address count, `2^(32 - bitmask)`
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.net.prefix_len())
    }

    pub fn reserved_count(&self) -> u32 {
        self.reserved
    }

    /// Addresses available to tenants
    pub fn address_count(&self) -> u64 {
        self.size()
            .saturating_sub(2)
            .saturating_sub(u64::from(self.reserved))
    }

    /// Tenant address by index; negative indexes count back from the last
    /// usable address.
    pub fn address_at(&self, index: i64) -> Option<Address> {
        let usable = self.size() as i64 - 2;
        let reserved = i64::from(self.reserved);
        let offset = if index < 0 { index + usable } else { index + reserved };
        if offset < reserved || offset >= usable {
            return None;
        }
        Some(self.address_from_offset(offset))
    }

    /// Infrastructure address by index within the reserved block
    pub fn reserved_address_at(&self, index: i64) -> Option<Address> {
        let reserved = i64::from(self.reserved);
        let offset = if index < 0 { index + reserved } else { index };
        if offset < 0 || offset >= reserved || offset >= self.size() as i64 - 2 {
            return None;
        }
        Some(self.address_from_offset(offset))
    }

    /// First reserved address, conventionally given to the host side
    pub fn host(&self) -> Option<Address> {
        self.reserved_address_at(0)
    }

    pub fn first(&self) -> Option<Address> {
        self.address_at(0)
    }

    pub fn last(&self) -> Option<Address> {
        self.address_at(-1)
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        self.net.contains(ip)
    }

    pub fn dump(&self) -> SubnetDump {
        SubnetDump {
            network: self.base(),
            netmask: self.netmask(),
            broadcast: self.broadcast(),
            maskbits: self.bitmask(),
            size: self.size(),
            reserved: self.reserved,
            addresses: self.address_count(),
            macbase: self.mac_prefix.mac_for(Ipv4Addr::UNSPECIFIED),
            host: self.host(),
            first: self.first(),
            last: self.last(),
        }
    }

    fn address_from_offset(&self, offset: i64) -> Address {
        let value = u32::from(self.base()).wrapping_add(1 + offset as u32);
        let ip = Ipv4Addr::from(value);
        Address {
            ip,
            mac: self.mac_prefix.mac_for(ip),
        }
    }
}

/// Source of the IPv4 addresses currently configured on the host
pub trait HostInterfaces: Send + Sync {
    fn ipv4_addresses(&self) -> PaddockResult<Vec<Ipv4Addr>>;
}

/// Reads interface addresses with `getifaddrs(3)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl HostInterfaces for SystemInterfaces {
    fn ipv4_addresses(&self) -> PaddockResult<Vec<Ipv4Addr>> {
        let addrs = nix::ifaddrs::getifaddrs().map_err(|e| PaddockError::Internal {
            message: format!("Failed to enumerate host interfaces: {}", e),
        })?;

        Ok(addrs
            .filter_map(|ifaddr| {
                ifaddr
                    .address
                    .as_ref()
                    .and_then(|addr| addr.as_sockaddr_in())
                    .map(|sin| *std::net::SocketAddrV4::from(*sin).ip())
            })
            .collect())
    }
}

/// Fixed address list, for hosts whose interfaces are known up front
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaces(pub Vec<Ipv4Addr>);

impl HostInterfaces for StaticInterfaces {
    fn ipv4_addresses(&self) -> PaddockResult<Vec<Ipv4Addr>> {
        Ok(self.0.clone())
    }
}

/// Per-allocation overrides
#[derive(Debug, Clone, Default)]
pub struct AllocateOptions {
    pub mac_prefix: Option<MacPrefix>,
}

/// Hands out non-overlapping subnets from the configured pool specs
pub struct SubnetAllocator {
    specs: Vec<PoolSpec>,
    reserved: u32,
    mac_prefix: MacPrefix,
    leases: Mutex<BTreeSet<Ipv4Net>>,
    interfaces: Arc<dyn HostInterfaces>,
}

impl fmt::Debug for SubnetAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubnetAllocator")
            .field("specs", &self.specs)
            .field("reserved", &self.reserved)
            .field("mac_prefix", &self.mac_prefix)
            .field("leases", &self.leases.lock().len())
            .finish()
    }
}

impl SubnetAllocator {
    pub fn new(specs: Vec<PoolSpec>, reserved: u32, mac_prefix: MacPrefix) -> Self {
        Self::with_interfaces(specs, reserved, mac_prefix, Arc::new(SystemInterfaces))
    }

    pub fn with_interfaces(
        specs: Vec<PoolSpec>,
        reserved: u32,
        mac_prefix: MacPrefix,
        interfaces: Arc<dyn HostInterfaces>,
    ) -> Self {
        Self {
            specs,
            reserved,
            mac_prefix,
            leases: Mutex::new(BTreeSet::new()),
            interfaces,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> PaddockResult<Self> {
        Ok(Self::new(
            config.pool_specs()?,
            config.reserved_ips,
            config.parsed_mac_prefix()?,
        ))
    }

    pub fn specs(&self) -> &[PoolSpec] {
        &self.specs
    }

    pub fn reserved_ips(&self) -> u32 {
        self.reserved
    }

    /// Lease the first free candidate, or `None` when every pool is exhausted
    pub fn allocate(&self, opts: &AllocateOptions) -> PaddockResult<Option<Subnet>> {
        let host_addrs = self.interfaces.ipv4_addresses()?;
        let mac_prefix = opts.mac_prefix.unwrap_or(self.mac_prefix);
        let mut leases = self.leases.lock();

        for spec in &self.specs {
            for candidate in spec.candidates() {
                if let Some(lease) = leases.iter().find(|l| overlaps(l, &candidate)) {
                    debug!("Skipping subnet {}: overlaps lease {}", candidate, lease);
                    continue;
                }
                if let Some(addr) = host_addrs.iter().find(|a| candidate.contains(*a)) {
                    debug!("Skipping subnet {}: host interface has {}", candidate, addr);
                    continue;
                }
                leases.insert(candidate);
                info!("Allocated subnet {} from pool {}", candidate, spec);
                return Ok(Some(Subnet::new(candidate, self.reserved, mac_prefix)));
            }
        }

        warn!("No free subnet left in {} pool spec(s)", self.specs.len());
        Ok(None)
    }

    /// Return a subnet to the pool; `false` if it was not leased
    pub fn release(&self, subnet: &Subnet) -> bool {
        let released = self.leases.lock().remove(&subnet.net());
        if released {
            info!("Released subnet {}", subnet);
        } else {
            warn!("Attempted to release unleased subnet {}", subnet);
        }
        released
    }

    pub fn is_leased(&self, net: &Ipv4Net) -> bool {
        self.leases.lock().contains(net)
    }

    pub fn leased(&self) -> Vec<Ipv4Net> {
        self.leases.lock().iter().copied().collect()
    }
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(specs: &[&str], host: Vec<Ipv4Addr>) -> SubnetAllocator {
        let specs = specs.iter().map(|s| s.parse().unwrap()).collect();
        SubnetAllocator::with_interfaces(
            specs,
            9,
            MacPrefix::default(),
            Arc::new(StaticInterfaces(host)),
        )
    }

    #[test]
    fn test_pool_spec_parsing() {
        let spec: PoolSpec = "172.16.0.0/12,24".parse().unwrap();
        assert_eq!(spec.range.to_string(), "172.16.0.0/12");
        assert_eq!(spec.prefix_len, 24);
        assert_eq!(spec.candidate_count(), 4096);

        assert!("172.16.0.0/12".parse::<PoolSpec>().is_err());
        assert!("172.16.0.0/12,8".parse::<PoolSpec>().is_err());
        assert!("172.16.0.0/12,31".parse::<PoolSpec>().is_err());
        assert!("not-a-net,24".parse::<PoolSpec>().is_err());
    }

    #[test]
    fn test_first_allocation_and_address() {
        let pool = allocator(&["10.0.0.0/8,24"], vec![]);
        let subnet = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();

        assert_eq!(subnet.to_string(), "10.0.0.0/24");
        let addr = subnet.address_at(0).unwrap();
        assert_eq!(addr.ip, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(addr.mac, "80:00:0a:00:00:0a");
    }

    #[test]
    fn test_host_interface_collision_skipped() {
        let pool = allocator(&["10.0.0.0/8,24"], vec![Ipv4Addr::new(10, 0, 0, 77)]);
        let subnet = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();
        assert_eq!(subnet.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn test_release_makes_range_eligible_again() {
        let pool = allocator(&["192.168.0.0/23,24"], vec![]);
        let a = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();
        let b = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();
        assert_ne!(a.net(), b.net());
        assert!(pool.allocate(&AllocateOptions::default()).unwrap().is_none());

        assert!(pool.release(&a));
        assert!(!pool.release(&a));
        let c = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();
        assert_eq!(c.net(), a.net());
    }

    #[test]
    fn test_specs_scanned_in_declaration_order() {
        let pool = allocator(&["192.168.4.0/24,24", "10.0.0.0/24,25"], vec![]);
        let nets: Vec<String> = (0..3)
            .map(|_| {
                pool.allocate(&AllocateOptions::default())
                    .unwrap()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(nets, vec!["192.168.4.0/24", "10.0.0.0/25", "10.0.0.128/25"]);
    }

    #[test]
    fn test_nested_pools_never_overlap_leases() {
        let pool = allocator(&["10.0.0.0/24,25", "10.0.0.0/24,24", "10.0.0.0/23,24"], vec![]);
        let mut nets = Vec::new();
        while let Some(subnet) = pool.allocate(&AllocateOptions::default()).unwrap() {
            nets.push(subnet.to_string());
        }
        assert_eq!(nets, vec!["10.0.0.0/25", "10.0.0.128/25", "10.0.1.0/24"]);

        // Releasing one half reopens only that half
        let half = Subnet::new("10.0.0.0/25".parse().unwrap(), 9, MacPrefix::default());
        assert!(pool.release(&half));
        let again = pool.allocate(&AllocateOptions::default()).unwrap().unwrap();
        assert_eq!(again.to_string(), "10.0.0.0/25");
    }

    #[test]
    fn test_address_derivation_bounds() {
        let subnet = Subnet::new("10.1.2.0/24".parse().unwrap(), 9, MacPrefix::default());

        assert_eq!(subnet.size(), 256);
        assert_eq!(subnet.address_count(), 245);
        assert_eq!(subnet.host().unwrap().ip, Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(subnet.first().unwrap().ip, Ipv4Addr::new(10, 1, 2, 10));
        assert_eq!(subnet.last().unwrap().ip, Ipv4Addr::new(10, 1, 2, 254));
        assert_eq!(subnet.address_at(244).unwrap().ip, Ipv4Addr::new(10, 1, 2, 254));
        assert!(subnet.address_at(245).is_none());
        assert!(subnet.address_at(-246).is_none());
        assert_eq!(
            subnet.reserved_address_at(-1).unwrap().ip,
            Ipv4Addr::new(10, 1, 2, 9)
        );
        assert!(subnet.reserved_address_at(9).is_none());
    }

    #[test]
    fn test_mac_prefix_parsing() {
        assert_eq!("80:00".parse::<MacPrefix>().unwrap(), MacPrefix([0x80, 0]));
        assert_eq!("02:ab:".parse::<MacPrefix>().unwrap(), MacPrefix([0x02, 0xab]));
        assert!("80".parse::<MacPrefix>().is_err());
        assert!("80:00:00".parse::<MacPrefix>().is_err());
        assert!("zz:00".parse::<MacPrefix>().is_err());
    }

    #[test]
    fn test_allocate_option_overrides_mac_prefix() {
        let pool = allocator(&["10.0.0.0/8,24"], vec![]);
        let opts = AllocateOptions {
            mac_prefix: Some(MacPrefix([0x02, 0x42])),
        };
        let subnet = pool.allocate(&opts).unwrap().unwrap();
        assert_eq!(subnet.first().unwrap().mac, "02:42:0a:00:00:0a");
    }
}
