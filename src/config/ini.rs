//! Minimal INI tokenizer shared by both daemons.
//!
//! `[section]` headers, `key=value` pairs, `#` and `;` full-line comments.
//! Keys may repeat; entries are returned in file order.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IniEntry {
	pub section: String,
	pub key: String,
	pub value: String,
	pub line: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IniError {
	#[error("line {line}: expected key=value or [section]")]
	Syntax { line: usize },
}

enum Line<'a> {
	Blank,
	Section(&'a str),
	Pair(&'a str, &'a str),
	Bad,
}

fn classify(raw: &str) -> Line<'_> {
	let trimmed = raw.trim_start_matches('\u{feff}').trim();
	if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
		return Line::Blank;
	}
	if let Some(rest) = trimmed.strip_prefix('[') {
		return match rest.strip_suffix(']') {
			Some(name) => Line::Section(name.trim()),
			None => Line::Bad,
		};
	}
	match trimmed.split_once('=') {
		Some((key, value)) if !key.trim().is_empty() => Line::Pair(key.trim(), value.trim()),
		_ => Line::Bad,
	}
}

fn tokenize(text: &str, strict: bool) -> Result<Vec<IniEntry>, IniError> {
	let mut out = Vec::new();
	let mut section = String::new();
	for (idx, raw) in text.lines().enumerate() {
		let line = idx + 1;
		match classify(raw) {
			Line::Blank => {}
			Line::Section(name) => section = name.to_string(),
			Line::Pair(key, value) => out.push(IniEntry {
				section: section.clone(),
				key: key.to_string(),
				value: value.to_string(),
				line,
			}),
			Line::Bad if strict => return Err(IniError::Syntax { line }),
			Line::Bad => log::warn!("config line {}: not a key=value pair, ignored", line),
		}
	}
	Ok(out)
}

/// Tokenize `text`, failing on the first malformed line.
pub fn parse(text: &str) -> Result<Vec<IniEntry>, IniError> {
	tokenize(text, true)
}

/// Tokenize `text`, logging and skipping malformed lines.
pub fn parse_lenient(text: &str) -> Vec<IniEntry> {
	tokenize(text, false).unwrap_or_default()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn sections_comments_and_repeated_keys() {
		let text = "# top\nhttp_bind = 0.0.0.0\n[scan]\n; note\nextra_subnet=10.0.0.0/24\nextra_subnet=10.0.1.0/24\n";
		let entries = parse(text).unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[0].section, "");
		assert_eq!(entries[0].key, "http_bind");
		assert_eq!(entries[0].value, "0.0.0.0");
		assert_eq!(entries[1].section, "scan");
		assert_eq!(entries[2].value, "10.0.1.0/24");
		assert_eq!(entries[2].line, 6);
	}

	#[test]
	fn value_keeps_embedded_equals_and_json() {
		let entries = parse("[startup]\nexec={\"path\":\"/bin/x\",\"args\":[\"a=b\"]}\n").unwrap();
		assert_eq!(entries[0].value, "{\"path\":\"/bin/x\",\"args\":[\"a=b\"]}");
	}

	#[test]
	fn strict_parse_reports_line() {
		assert_eq!(
			parse("a=1\nnot a pair\n"),
			Err(IniError::Syntax { line: 2 })
		);
		assert_eq!(parse("[open\n"), Err(IniError::Syntax { line: 1 }));
	}

	#[test]
	fn lenient_parse_skips_bad_lines_and_keeps_section() {
		let entries = parse_lenient("[server]\nport=81\ngarbage\nbind=1.2.3.4\n");
		assert_eq!(entries.len(), 2);
		assert_eq!(entries[1].section, "server");
		assert_eq!(entries[1].key, "bind");
		assert_eq!(entries[1].line, 4);
	}
}
