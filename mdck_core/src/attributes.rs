use std::collections::BTreeMap;
use std::collections::BTreeSet;

use derive_more::Deref;
use derive_more::DerefMut;
use logos::Logos;
use serde::Deserialize;
use serde::Serialize;
use snailquote::unescape;

/// Raw tokens for the body of a directive attribute block (`{...}`).
#[derive(Logos, Debug, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum RawToken {
	#[token("=")]
	Equals,
	#[regex(r#""([^"\\]|\\.)*""#)]
	DoubleQuotedString,
	#[regex(r"'([^'\\]|\\.)*'")]
	SingleQuotedString,
	#[regex(r#"[^ \t\r\n"'={}]+"#)]
	Word,
}

/// Directive attributes. String-valued attributes are exposed through
/// `Deref` to the underlying map, bare attributes (`{mandatory}`) are kept
/// apart as flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, DerefMut)]
pub struct Attributes {
	#[deref]
	#[deref_mut]
	pub values: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
	pub flags: BTreeSet<String>,
}

impl Attributes {
	pub fn id(&self) -> Option<&str> {
		self.values.get("id").map(String::as_str)
	}

	pub fn src(&self) -> Option<&str> {
		self.values.get("src").map(String::as_str)
	}

	pub fn has_flag(&self, name: &str) -> bool {
		self.flags.contains(name)
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty() && self.flags.is_empty()
	}

	/// Render the attributes back into `{...}` syntax. Empty attributes render
	/// as an empty string.
	pub fn to_source(&self) -> String {
		if self.is_empty() {
			return String::new();
		}

		let mut parts = Vec::with_capacity(self.values.len() + self.flags.len());
		for (key, value) in &self.values {
			parts.push(format!("{key}=\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"")));
		}
		parts.extend(self.flags.iter().cloned());

		format!("{{{}}}", parts.join(" "))
	}
}

/// Parse the inside of a directive attribute block.
///
/// Supported forms: `key="value"`, `key='value'`, `key=value`, `#id`,
/// `.class` and bare `key` flags. Malformed tokens are skipped.
pub fn parse_attributes(source: &str) -> Attributes {
	let tokens: Vec<_> = RawToken::lexer(source).spanned().collect();
	let mut attributes = Attributes::default();
	let mut cursor = 0;

	while cursor < tokens.len() {
		let (token, span) = &tokens[cursor];
		let slice = &source[span.clone()];

		let Ok(RawToken::Word) = token else {
			cursor += 1;
			continue;
		};

		if let Some(id) = slice.strip_prefix('#') {
			if !id.is_empty() {
				attributes.values.insert("id".into(), id.to_string());
			}
			cursor += 1;
			continue;
		}

		if let Some(class) = slice.strip_prefix('.') {
			if !class.is_empty() {
				attributes
					.values
					.entry("class".into())
					.and_modify(|existing| {
						existing.push(' ');
						existing.push_str(class);
					})
					.or_insert_with(|| class.to_string());
			}
			cursor += 1;
			continue;
		}

		let key = slice.to_string();
		let has_value = matches!(tokens.get(cursor + 1), Some((Ok(RawToken::Equals), _)));

		if !has_value {
			attributes.flags.insert(key);
			cursor += 1;
			continue;
		}

		let Some((value_token, value_span)) = tokens.get(cursor + 2) else {
			// `key=` at the end of the block.
			attributes.values.insert(key, String::new());
			break;
		};

		let raw_value = &source[value_span.clone()];
		let value = match value_token {
			Ok(RawToken::DoubleQuotedString | RawToken::SingleQuotedString) => {
				Some(unescape(raw_value).unwrap_or_else(|_| strip_quotes(raw_value).to_string()))
			}
			Ok(RawToken::Word) => Some(raw_value.to_string()),
			_ => None,
		};

		if let Some(value) = value {
			attributes.values.insert(key, value);
			cursor += 3;
		} else {
			cursor += 2;
		}
	}

	attributes
}

fn strip_quotes(value: &str) -> &str {
	value
		.get(1..value.len().saturating_sub(1))
		.unwrap_or(value)
}
