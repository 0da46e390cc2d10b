//! Control-API verbs that mutate one relay.

use std::net::Ipv4Addr;

use serde_json::Value;
use thiserror::Error;

use super::config::Source;
use super::dest::{Target, parse_dest_list, parse_dest_token, parse_uart_token, port_range};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
	#[error("unknown verb")]
	UnknownVerb,
	#[error("bad action: {0}")]
	BadAction(String),
}

fn bad(msg: impl Into<String>) -> ActionError {
	ActionError::BadAction(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
	Set(Vec<Target>),
	Append(Vec<Target>),
	Clear,
	ClearTo(Target),
	Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAction {
	pub relay: Source,
	pub action: Action,
}

fn port_value(v: &Value) -> Option<u16> {
	let port = match v {
		Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
		Value::String(s) => s.trim().parse::<u16>().ok(),
		_ => None,
	};
	port.filter(|p| *p > 0)
}

/// `id` wins over `port`; returns whether `port` was consumed as the selector.
fn select_relay(body: &Value) -> Result<(Source, bool), ActionError> {
	match body.get("id") {
		Some(Value::String(s)) => Source::parse(s)
			.map(|src| (src, false))
			.ok_or_else(|| bad(format!("bad relay id {}", s))),
		Some(v @ Value::Number(_)) => port_value(v)
			.map(|p| (Source::Udp(p), false))
			.ok_or_else(|| bad("bad relay id")),
		_ => body
			.get("port")
			.and_then(port_value)
			.map(|p| (Source::Udp(p), true))
			.ok_or_else(|| bad("missing relay id or port")),
	}
}

fn dest_tokens(body: &Value) -> Result<Vec<Target>, ActionError> {
	let parse = |s: &str| parse_dest_list(s).map_err(|e| bad(e.to_string()));
	match body.get("dests") {
		Some(Value::String(s)) => parse(s),
		Some(Value::Array(items)) => {
			let mut out = Vec::new();
			for item in items {
				match item {
					Value::String(s) => out.extend(parse(s)?),
					Value::Number(_) => {
						let port = port_value(item).ok_or_else(|| bad(format!("bad port {}", item)))?;
						out.extend(parse(&port.to_string())?);
					}
					other => return Err(bad(format!("bad destination {}", other))),
				}
			}
			Ok(out)
		}
		_ => Err(bad("missing dests")),
	}
}

fn single_target(body: &Value, port_is_selector: bool) -> Result<Target, ActionError> {
	if let Some(tok) = body.get("dest").and_then(Value::as_str) {
		let mut targets = parse_dest_token(tok).map_err(|e| bad(e.to_string()))?;
		return match (targets.pop(), targets.is_empty()) {
			(Some(t), true) => Ok(t),
			_ => Err(bad("dest must name one destination")),
		};
	}
	if let Some(uart) = body.get("uart") {
		let n = match uart {
			Value::Number(n) => n.as_u64().map(|n| n as usize),
			Value::String(s) => parse_uart_token(s),
			_ => None,
		};
		return n
			.filter(|n| *n < super::dest::MAX_UARTS)
			.map(Target::Uart)
			.ok_or_else(|| bad("bad uart"));
	}
	let ip: Ipv4Addr = body
		.get("ip")
		.and_then(Value::as_str)
		.ok_or_else(|| bad("missing dest"))?
		.parse()
		.map_err(|_| bad("bad ip"))?;
	let port = body
		.get("dest_port")
		.or(if port_is_selector { None } else { body.get("port") })
		.and_then(port_value)
		.ok_or_else(|| bad("missing destination port"))?;
	Ok(Target::Udp(std::net::SocketAddrV4::new(ip, port)))
}

/// Interpret `POST /api/v1/action/<verb>` with a JSON body.
pub fn parse_action(verb: &str, body: &Value) -> Result<RelayAction, ActionError> {
	if !matches!(verb, "set" | "append" | "append_range" | "clear" | "clear_to" | "reset") {
		return Err(ActionError::UnknownVerb);
	}
	let (relay, port_is_selector) = select_relay(body)?;
	let action = match verb {
		"set" => Action::Set(dest_tokens(body)?),
		"append" => Action::Append(dest_tokens(body)?),
		"append_range" => {
			let start = body.get("start").and_then(port_value).ok_or_else(|| bad("bad start"))?;
			let end = body.get("end").and_then(port_value).ok_or_else(|| bad("bad end"))?;
			let ip = match body.get("ip").and_then(Value::as_str) {
				Some(s) => s.trim().parse().map_err(|_| bad("bad ip"))?,
				None => Ipv4Addr::LOCALHOST,
			};
			Action::Append(port_range(ip, start, end).collect())
		}
		"clear" => Action::Clear,
		"clear_to" => Action::ClearTo(single_target(body, port_is_selector)?),
		_ => Action::Reset,
	};
	if matches!(relay, Source::Uart(_)) {
		let targets: &[Target] = match &action {
			Action::Set(t) | Action::Append(t) => t,
			_ => &[],
		};
		if targets.iter().any(|t| matches!(t, Target::Uart(_))) {
			return Err(bad("a uart relay cannot forward to a uart"));
		}
	}
	Ok(RelayAction { relay, action })
}
