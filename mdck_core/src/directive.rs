use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::Node;
use crate::NodeType;

/// Directive names recognized by the dialect. Every other directive name is
/// ignored by the extractor.
pub const MDCK_DIRECTIVE_NAMES: [&str; 3] = ["template", "tag", "result"];

/// Line reported for directives without position information.
pub const UNKNOWN_LINE: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectiveKind {
	Container,
	Leaf,
	InlineText,
}

impl DirectiveKind {
	fn from_node_type(r#type: NodeType) -> Option<Self> {
		match r#type {
			NodeType::ContainerDirective => Some(Self::Container),
			NodeType::LeafDirective => Some(Self::Leaf),
			NodeType::TextDirective => Some(Self::InlineText),
			_ => None,
		}
	}
}

impl fmt::Display for DirectiveKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Container => write!(f, "container"),
			Self::Leaf => write!(f, "leaf"),
			Self::InlineText => write!(f, "inline-text"),
		}
	}
}

/// A normalized `template`, `tag` or `result` directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveRecord {
	pub name: String,
	pub kind: DirectiveKind,
	/// String attributes only. Bare flag attributes are dropped.
	pub attributes: BTreeMap<String, String>,
	pub children: Vec<Node>,
	/// Flattened, trimmed text of a container's children. Empty for other
	/// kinds.
	pub content: String,
	/// 1-based start line, or [`UNKNOWN_LINE`].
	pub line: i64,
}

/// Returns `true` when `name` is one of the directive names the dialect
/// understands.
pub fn is_mdck_directive_name(name: &str) -> bool {
	MDCK_DIRECTIVE_NAMES.contains(&name)
}

/// Walk `root` in pre-order and collect every recognized directive.
pub fn extract_directives(root: &Node) -> Vec<DirectiveRecord> {
	let mut records = vec![];

	root.walk(&mut |node| {
		let Some(kind) = DirectiveKind::from_node_type(node.r#type) else {
			return;
		};
		let Some(name) = node.name.as_deref() else {
			return;
		};
		if !is_mdck_directive_name(name) {
			return;
		}

		let content = if kind == DirectiveKind::Container {
			node.children
				.iter()
				.map(Node::text_content)
				.collect::<String>()
				.trim()
				.to_string()
		} else {
			String::new()
		};

		records.push(DirectiveRecord {
			name: name.to_string(),
			kind,
			attributes: node
				.attributes
				.as_ref()
				.map(|attributes| attributes.values.clone())
				.unwrap_or_default(),
			children: node.children.clone(),
			content,
			line: node
				.line()
				.and_then(|line| i64::try_from(line).ok())
				.unwrap_or(UNKNOWN_LINE),
		});
	});

	records
}
