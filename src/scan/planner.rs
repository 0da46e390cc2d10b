//! Scan target planning: directory, ARP cache, then local and configured subnets.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::netif::{Ipv4Interface, Ipv4Subnet};

/// Upper bound on addresses probed by a single scan.
pub const MAX_TARGETS: usize = 2048;

/// Deduplicated, capped list of probe targets in insertion order.
#[derive(Debug, Default)]
pub struct TargetPlan {
	targets: Vec<Ipv4Addr>,
	seen: HashSet<Ipv4Addr>,
}

impl TargetPlan {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_full(&self) -> bool {
		self.targets.len() >= MAX_TARGETS
	}

	/// Add `ip` unless already present. Returns false once the plan is full.
	pub fn push(&mut self, ip: Ipv4Addr) -> bool {
		if self.is_full() {
			return false;
		}
		if self.seen.insert(ip) {
			self.targets.push(ip);
		}
		true
	}

	pub fn into_targets(self) -> Vec<Ipv4Addr> {
		self.targets
	}
}

/// Inputs gathered from the directory and the kernel before planning.
#[derive(Debug, Default)]
pub struct PlanInputs<'a> {
	pub known: &'a [Ipv4Addr],
	pub arp: &'a [Ipv4Addr],
	pub interfaces: &'a [Ipv4Interface],
	pub extra_subnets: &'a [Ipv4Subnet],
}

pub fn plan_targets(inputs: &PlanInputs<'_>) -> Vec<Ipv4Addr> {
	let mut plan = TargetPlan::new();

	for ip in inputs.known {
		if !plan.push(*ip) {
			return plan.into_targets();
		}
	}

	for ip in inputs.arp {
		if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
			continue;
		}
		if !plan.push(*ip) {
			return plan.into_targets();
		}
	}

	let first_self = inputs
		.interfaces
		.iter()
		.map(|i| i.addr)
		.find(|a| !a.is_loopback());

	for iface in inputs.interfaces {
		if iface.addr.is_loopback() || iface.addr.is_link_local() {
			continue;
		}
		walk_subnet(&mut plan, &iface.subnet(), &[Some(iface.addr), first_self]);
		if plan.is_full() {
			return plan.into_targets();
		}
	}

	for net in inputs.extra_subnets {
		if net.prefix == 0 {
			continue;
		}
		walk_subnet(&mut plan, net, &[first_self]);
		if plan.is_full() {
			break;
		}
	}

	plan.into_targets()
}

fn walk_subnet(plan: &mut TargetPlan, net: &Ipv4Subnet, skip: &[Option<Ipv4Addr>]) {
	for host in net.hosts() {
		if skip.iter().any(|s| *s == Some(host)) || host.is_loopback() || host.is_link_local() {
			continue;
		}
		if !plan.push(host) {
			return;
		}
	}
}

/// Addresses from `/proc/net/arp` text (header line skipped).
pub fn parse_arp_table(text: &str) -> Vec<Ipv4Addr> {
	text.lines()
		.skip(1)
		.filter_map(|line| line.split_whitespace().next())
		.filter_map(|ip| ip.parse::<Ipv4Addr>().ok())
		.filter(|ip| !ip.is_loopback() && !ip.is_link_local())
		.collect()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	fn iface(addr: [u8; 4], mask: [u8; 4]) -> Ipv4Interface {
		Ipv4Interface {
			name: "eth0".into(),
			addr: Ipv4Addr::from(addr),
			netmask: Ipv4Addr::from(mask),
		}
	}

	#[test]
	fn arp_table_skips_header_loopback_and_link_local() {
		let text = "IP address       HW type     Flags       HW address            Mask     Device\n\
			192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0\n\
			169.254.3.3      0x1         0x2         aa:bb:cc:dd:ee:01     *        eth0\n\
			127.0.0.1        0x1         0x2         aa:bb:cc:dd:ee:02     *        lo\n";
		assert_eq!(parse_arp_table(text), vec![Ipv4Addr::new(192, 168, 1, 1)]);
	}

	#[test]
	fn phases_are_ordered_and_deduplicated() {
		let known = [Ipv4Addr::new(192, 168, 1, 9)];
		let arp = [Ipv4Addr::new(192, 168, 1, 9), Ipv4Addr::new(10, 9, 9, 9)];
		let ifaces = [iface([192, 168, 1, 5], [255, 255, 255, 248])];
		let targets = plan_targets(&PlanInputs {
			known: &known,
			arp: &arp,
			interfaces: &ifaces,
			extra_subnets: &[],
		});
		// 192.168.1.0/29: hosts .1-.6, minus own .5
		assert_eq!(
			targets,
			vec![
				Ipv4Addr::new(192, 168, 1, 9),
				Ipv4Addr::new(10, 9, 9, 9),
				Ipv4Addr::new(192, 168, 1, 1),
				Ipv4Addr::new(192, 168, 1, 2),
				Ipv4Addr::new(192, 168, 1, 3),
				Ipv4Addr::new(192, 168, 1, 4),
				Ipv4Addr::new(192, 168, 1, 6),
			]
		);
	}

	#[test]
	fn host_route_interface_contributes_nothing() {
		let ifaces = [iface([10, 1, 1, 1], [255, 255, 255, 255])];
		let targets = plan_targets(&PlanInputs {
			interfaces: &ifaces,
			..PlanInputs::default()
		});
		assert!(targets.is_empty());
	}

	#[test]
	fn loopback_and_link_local_interfaces_are_skipped() {
		let ifaces = [
			iface([127, 0, 0, 1], [255, 0, 0, 0]),
			iface([169, 254, 10, 1], [255, 255, 0, 0]),
		];
		let targets = plan_targets(&PlanInputs {
			interfaces: &ifaces,
			..PlanInputs::default()
		});
		assert!(targets.is_empty());
	}

	#[test]
	fn extra_subnets_skip_first_self_address() {
		let ifaces = [iface([10, 2, 0, 2], [255, 255, 255, 255])];
		let extra: [Ipv4Subnet; 1] = ["10.2.0.0/30".parse().unwrap()];
		let targets = plan_targets(&PlanInputs {
			interfaces: &ifaces,
			extra_subnets: &extra,
			..PlanInputs::default()
		});
		assert_eq!(targets, vec![Ipv4Addr::new(10, 2, 0, 1)]);
	}

	#[test]
	fn large_subnet_is_capped() {
		let ifaces = [iface([10, 0, 0, 1], [255, 255, 0, 0])];
		let targets = plan_targets(&PlanInputs {
			interfaces: &ifaces,
			..PlanInputs::default()
		});
		assert_eq!(targets.len(), MAX_TARGETS);
		assert_eq!(targets[0], Ipv4Addr::new(10, 0, 0, 2));
	}
}
