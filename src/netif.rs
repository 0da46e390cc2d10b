//! Local IPv4 interface enumeration and subnet arithmetic.

use std::ffi::CStr;
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// One IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Interface {
	pub name: String,
	pub addr: Ipv4Addr,
	pub netmask: Ipv4Addr,
}

impl Ipv4Interface {
	pub fn subnet(&self) -> Ipv4Subnet {
		let prefix = u32::from(self.netmask).leading_ones() as u8;
		Ipv4Subnet::new(self.addr, prefix)
	}
}

/// Enumerate every IPv4 address on every interface, loopback included.
pub fn ipv4_interfaces() -> io::Result<Vec<Ipv4Interface>> {
	let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
	// SAFETY: getifaddrs writes a list head we free below.
	if unsafe { libc::getifaddrs(&mut head) } != 0 {
		return Err(io::Error::last_os_error());
	}

	let mut out = Vec::new();
	let mut cur = head;
	while !cur.is_null() {
		// SAFETY: `cur` is a live node of the list returned by getifaddrs.
		let ifa = unsafe { &*cur };
		cur = ifa.ifa_next;

		if ifa.ifa_addr.is_null() || ifa.ifa_name.is_null() {
			continue;
		}
		// SAFETY: ifa_addr is non-null and points at a sockaddr.
		let family = unsafe { (*ifa.ifa_addr).sa_family } as libc::c_int;
		if family != libc::AF_INET {
			continue;
		}
		// SAFETY: AF_INET addresses are sockaddr_in.
		let addr = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
		let netmask = if ifa.ifa_netmask.is_null() {
			Ipv4Addr::BROADCAST
		} else {
			// SAFETY: the netmask of an AF_INET entry is a sockaddr_in.
			let mask = unsafe { &*(ifa.ifa_netmask as *const libc::sockaddr_in) };
			Ipv4Addr::from(u32::from_be(mask.sin_addr.s_addr))
		};
		// SAFETY: ifa_name is a NUL-terminated C string owned by the list.
		let name = unsafe { CStr::from_ptr(ifa.ifa_name) }
			.to_string_lossy()
			.into_owned();

		out.push(Ipv4Interface {
			name,
			addr: Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
			netmask,
		});
	}

	// SAFETY: `head` came from a successful getifaddrs call.
	unsafe { libc::freeifaddrs(head) };
	Ok(out)
}

/// Local IPv4 interfaces minus loopback addresses.
pub fn non_loopback_interfaces() -> Vec<Ipv4Interface> {
	match ipv4_interfaces() {
		Ok(list) => list.into_iter().filter(|i| !i.addr.is_loopback()).collect(),
		Err(e) => {
			log::warn!("getifaddrs failed: {}", e);
			Vec::new()
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetParseError {
	#[error("expected IP/prefix")]
	MissingPrefix,
	#[error("invalid IPv4 address")]
	BadAddress,
	#[error("prefix must be between 1 and 32")]
	BadPrefix,
}

/// An IPv4 network in CIDR form. The network address is always masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
	pub network: Ipv4Addr,
	pub prefix: u8,
}

impl Ipv4Subnet {
	pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
		let prefix = prefix.min(32);
		let mask = prefix_mask(prefix);
		Self {
			network: Ipv4Addr::from(u32::from(addr) & mask),
			prefix,
		}
	}

	pub fn mask(&self) -> u32 {
		prefix_mask(self.prefix)
	}

	pub fn broadcast(&self) -> Ipv4Addr {
		Ipv4Addr::from(u32::from(self.network) | !self.mask())
	}

	/// Host addresses strictly between the network and broadcast addresses.
	pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
		let net = u32::from(self.network);
		let bcast = u32::from(self.broadcast());
		let (first, last) = if bcast > net + 1 {
			(net + 1, bcast - 1)
		} else {
			(1, 0)
		};
		(first..=last).map(Ipv4Addr::from)
	}
}

impl FromStr for Ipv4Subnet {
	type Err = SubnetParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (ip, prefix) = s.trim().split_once('/').ok_or(SubnetParseError::MissingPrefix)?;
		let ip: Ipv4Addr = ip.trim().parse().map_err(|_| SubnetParseError::BadAddress)?;
		let prefix: u8 = prefix.trim().parse().map_err(|_| SubnetParseError::BadPrefix)?;
		if prefix == 0 || prefix > 32 {
			return Err(SubnetParseError::BadPrefix);
		}
		Ok(Self::new(ip, prefix))
	}
}

impl std::fmt::Display for Ipv4Subnet {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.network, self.prefix)
	}
}

fn prefix_mask(prefix: u8) -> u32 {
	match prefix {
		0 => 0,
		p if p >= 32 => u32::MAX,
		p => u32::MAX << (32 - p),
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn parse_masks_network_address() {
		let s: Ipv4Subnet = "192.168.7.99/24".parse().unwrap();
		assert_eq!(s.network, Ipv4Addr::new(192, 168, 7, 0));
		assert_eq!(s.broadcast(), Ipv4Addr::new(192, 168, 7, 255));
		assert_eq!(s.hosts().count(), 254);
	}

	#[test]
	fn parse_rejects_zero_and_oversized_prefix() {
		assert_eq!(
			"0.0.0.0/0".parse::<Ipv4Subnet>(),
			Err(SubnetParseError::BadPrefix)
		);
		assert_eq!(
			"10.0.0.0/33".parse::<Ipv4Subnet>(),
			Err(SubnetParseError::BadPrefix)
		);
		assert_eq!(
			"10.0.0.0".parse::<Ipv4Subnet>(),
			Err(SubnetParseError::MissingPrefix)
		);
	}

	#[test]
	fn host_only_and_point_to_point_subnets_are_empty() {
		let s32: Ipv4Subnet = "10.1.1.1/32".parse().unwrap();
		let s31: Ipv4Subnet = "10.1.1.0/31".parse().unwrap();
		assert_eq!(s32.hosts().count(), 0);
		assert_eq!(s31.hosts().count(), 0);
	}

	#[test]
	fn interface_prefix_from_netmask() {
		let iface = Ipv4Interface {
			name: "eth0".into(),
			addr: Ipv4Addr::new(172, 16, 5, 4),
			netmask: Ipv4Addr::new(255, 255, 252, 0),
		};
		let s = iface.subnet();
		assert_eq!(s.prefix, 22);
		assert_eq!(s.network, Ipv4Addr::new(172, 16, 4, 0));
	}
}
