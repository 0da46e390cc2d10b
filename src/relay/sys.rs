//! Thin libc wrappers for the relay dataplane: epoll, UDP socket setup and
//! batched datagram I/O.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::debug;

use super::config::SocketTuning;

pub const READABLE: u32 = libc::EPOLLIN as u32;
pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const HANGUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
	if rc < 0 {
		Err(io::Error::last_os_error())
	} else {
		Ok(rc)
	}
}

pub struct Epoll {
	fd: OwnedFd,
}

impl Epoll {
	pub fn new() -> io::Result<Epoll> {
		// SAFETY: epoll_create1 takes no pointers.
		let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
		Ok(Epoll {
			// SAFETY: `fd` was just returned by the kernel and is owned by nobody else.
			fd: unsafe { OwnedFd::from_raw_fd(fd) },
		})
	}

	fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
		let mut ev = libc::epoll_event {
			events,
			u64: fd as u64,
		};
		// SAFETY: `ev` is a valid epoll_event that outlives the call.
		cvt(unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) })?;
		Ok(())
	}

	/// Register `fd`; its events report `fd` back as the token.
	pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
		self.ctl(libc::EPOLL_CTL_ADD, fd, events)
	}

	pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
		self.ctl(libc::EPOLL_CTL_MOD, fd, events)
	}

	pub fn delete(&self, fd: RawFd) {
		if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
			debug!("epoll del {}: {}", fd, e);
		}
	}

	/// Wait up to `timeout_ms`; returns `(fd, events)` pairs.
	pub fn wait(&self, timeout_ms: i32, out: &mut Vec<(RawFd, u32)>) -> io::Result<()> {
		const BATCH: usize = 64;
		let mut events = [libc::epoll_event { events: 0, u64: 0 }; BATCH];
		out.clear();
		// SAFETY: `events` has room for BATCH entries and the kernel writes at most that many.
		let n = cvt(unsafe {
			libc::epoll_wait(
				self.fd.as_raw_fd(),
				events.as_mut_ptr(),
				BATCH as libc::c_int,
				timeout_ms,
			)
		})?;
		for ev in &events[..n as usize] {
			let (token, flags) = (ev.u64, ev.events);
			out.push((token as RawFd, flags));
		}
		Ok(())
	}
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
	// SAFETY: the option pointer and length describe `value`, which outlives the call.
	cvt(unsafe {
		libc::setsockopt(
			fd,
			level,
			name,
			(&value as *const libc::c_int).cast(),
			mem::size_of::<libc::c_int>() as libc::socklen_t,
		)
	})?;
	Ok(())
}

fn sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
	libc::sockaddr_in {
		sin_family: libc::AF_INET as libc::sa_family_t,
		sin_port: addr.port().to_be(),
		sin_addr: libc::in_addr {
			s_addr: u32::from(*addr.ip()).to_be(),
		},
		sin_zero: [0; 8],
	}
}

/// Non-blocking UDP socket bound to `ip:port` with address reuse, overflow
/// reporting and the given buffer/TOS tuning.
pub fn bind_udp(ip: Ipv4Addr, port: u16, tuning: &SocketTuning) -> io::Result<UdpSocket> {
	// SAFETY: socket takes no pointers.
	let raw = cvt(unsafe {
		libc::socket(
			libc::AF_INET,
			libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
			0,
		)
	})?;
	// SAFETY: `raw` is a fresh descriptor; `fd` closes it on every early return below.
	let fd = unsafe { OwnedFd::from_raw_fd(raw) };
	set_int_opt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
	if let Err(e) = set_int_opt(raw, libc::SOL_SOCKET, libc::SO_RXQ_OVFL, 1) {
		debug!("SO_RXQ_OVFL unavailable on port {}: {}", port, e);
	}
	if tuning.rcvbuf > 0 {
		set_int_opt(raw, libc::SOL_SOCKET, libc::SO_RCVBUF, tuning.rcvbuf as libc::c_int)?;
	}
	if tuning.sndbuf > 0 {
		set_int_opt(raw, libc::SOL_SOCKET, libc::SO_SNDBUF, tuning.sndbuf as libc::c_int)?;
	}
	if tuning.tos > 0 {
		set_int_opt(raw, libc::IPPROTO_IP, libc::IP_TOS, tuning.tos as libc::c_int)?;
	}
	let sa = sockaddr_in(&SocketAddrV4::new(ip, port));
	// SAFETY: `sa` is a valid sockaddr_in and the length matches its type.
	cvt(unsafe {
		libc::bind(
			raw,
			(&sa as *const libc::sockaddr_in).cast(),
			mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
		)
	})?;
	Ok(UdpSocket::from(fd))
}

/// Unbound non-blocking UDP socket for sending only.
pub fn sender_udp() -> io::Result<UdpSocket> {
	let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
	sock.set_nonblocking(true)?;
	Ok(sock)
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
	// SAFETY: F_GETFL/F_SETFL take integer arguments only.
	let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
	cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
	pub len: usize,
	pub truncated: bool,
	/// Kernel's cumulative drop count for the socket, when reported.
	pub overflow: Option<u32>,
}

/// One `recvmsg` into `buf`, reporting truncation and `SO_RXQ_OVFL`.
pub fn recv_datagram(fd: RawFd, buf: &mut [u8]) -> io::Result<Datagram> {
	let mut iov = libc::iovec {
		iov_base: buf.as_mut_ptr().cast(),
		iov_len: buf.len(),
	};
	// u64 keeps the control buffer aligned for cmsghdr.
	let mut control = [0u64; 8];
	// SAFETY: msghdr is plain data; all-zero is a valid empty header.
	let mut msg: libc::msghdr = unsafe { mem::zeroed() };
	msg.msg_iov = &mut iov;
	msg.msg_iovlen = 1;
	msg.msg_control = control.as_mut_ptr().cast();
	msg.msg_controllen = mem::size_of_val(&control) as _;

	// SAFETY: `msg` points at `iov` and `control`, both live and sized by their own lengths.
	let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
	if n < 0 {
		return Err(io::Error::last_os_error());
	}
	let mut overflow = None;
	// SAFETY: the CMSG macros only walk `control` within msg_controllen as set by
	// the kernel; SO_RXQ_OVFL data is a u32 and may be unaligned.
	unsafe {
		let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
		while !cmsg.is_null() {
			if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SO_RXQ_OVFL {
				overflow = Some((libc::CMSG_DATA(cmsg) as *const u32).read_unaligned());
			}
			cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
		}
	}
	Ok(Datagram {
		len: n as usize,
		truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
		overflow,
	})
}

/// Send `payload` once to each address with `sendmmsg`. Returns how many
/// leading entries were accepted by the kernel and the error that stopped
/// the batch, if any.
pub fn send_fanout(fd: RawFd, payload: &[u8], addrs: &[SocketAddrV4]) -> (usize, Option<io::Error>) {
	if addrs.is_empty() {
		return (0, None);
	}
	let mut names: Vec<libc::sockaddr_in> = addrs.iter().map(sockaddr_in).collect();
	let mut iov = libc::iovec {
		iov_base: payload.as_ptr() as *mut libc::c_void,
		iov_len: payload.len(),
	};
	let iov_ptr: *mut libc::iovec = &mut iov;
	let mut msgs: Vec<libc::mmsghdr> = names
		.iter_mut()
		.map(|name| {
			// SAFETY: msghdr is plain data; all-zero is a valid empty header.
			let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
			hdr.msg_name = (name as *mut libc::sockaddr_in).cast();
			hdr.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
			hdr.msg_iov = iov_ptr;
			hdr.msg_iovlen = 1;
			libc::mmsghdr {
				msg_hdr: hdr,
				msg_len: 0,
			}
		})
		.collect();

	let mut sent = 0;
	while sent < msgs.len() {
		// SAFETY: every header points into `names` and `iov`, which outlive the call,
		// and the count never exceeds the remaining slice.
		let rc = unsafe {
			libc::sendmmsg(
				fd,
				msgs[sent..].as_mut_ptr(),
				(msgs.len() - sent) as libc::c_uint,
				0,
			)
		};
		if rc < 0 {
			let err = io::Error::last_os_error();
			if err.kind() == io::ErrorKind::Interrupted {
				continue;
			}
			return (sent, Some(err));
		}
		if rc == 0 {
			return (sent, Some(io::Error::from(io::ErrorKind::WriteZero)));
		}
		sent += rc as usize;
	}
	(sent, None)
}
