use markdown::ParseOptions;
use markdown::mdast;
use markdown::to_mdast;
use serde::Deserialize;
use serde::Serialize;

use crate::Attributes;
use crate::MdckError;
use crate::MdckResult;
use crate::Point;
use crate::Position;
use crate::parse_attributes;

/// The type of a node in the document tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum NodeType {
	Root,
	/// `:::name{...}` ... `:::`
	ContainerDirective,
	/// `::name{...}` on its own line, or inline inside text.
	LeafDirective,
	/// `:name[label]{...}` inside text.
	TextDirective,
	Paragraph,
	Heading,
	Text,
	Emphasis,
	Strong,
	Delete,
	InlineCode,
	Code,
	Html,
	Link,
	Image,
	List,
	ListItem,
	Blockquote,
	ThematicBreak,
	Break,
	Table,
	TableRow,
	TableCell,
	Other,
}

impl NodeType {
	pub const fn is_directive(self) -> bool {
		matches!(
			self,
			Self::ContainerDirective | Self::LeafDirective | Self::TextDirective
		)
	}
}

/// A node of the parsed document. Directive nodes carry a `name` and
/// `attributes`, literal nodes carry a `value`. Block nodes produced from
/// plain markdown keep their exact source text in `raw`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	pub r#type: NodeType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attributes: Option<Attributes>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<String>,
	/// Task list state for list items (`- [x]`).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub checked: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub depth: Option<u8>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub children: Vec<Node>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub position: Option<Position>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub raw: Option<String>,
}

impl Node {
	pub fn new(r#type: NodeType) -> Self {
		Self {
			r#type,
			name: None,
			label: None,
			attributes: None,
			value: None,
			checked: None,
			depth: None,
			children: vec![],
			position: None,
			raw: None,
		}
	}

	pub fn root(children: Vec<Node>) -> Self {
		Self {
			children,
			..Self::new(NodeType::Root)
		}
	}

	pub fn text(value: impl Into<String>) -> Self {
		Self {
			value: Some(value.into()),
			..Self::new(NodeType::Text)
		}
	}

	pub fn directive(r#type: NodeType, name: impl Into<String>, attributes: Attributes) -> Self {
		Self {
			name: Some(name.into()),
			attributes: Some(attributes),
			..Self::new(r#type)
		}
	}

	#[must_use]
	pub fn with_children(mut self, children: Vec<Node>) -> Self {
		self.children = children;
		self
	}

	#[must_use]
	pub fn with_position(mut self, position: Position) -> Self {
		self.position = Some(position);
		self
	}

	pub fn is_directive_named(&self, name: &str) -> bool {
		self.r#type.is_directive() && self.name.as_deref() == Some(name)
	}

	/// A string attribute of a directive node.
	pub fn attribute(&self, key: &str) -> Option<&str> {
		self.attributes
			.as_ref()
			.and_then(|attributes| attributes.get(key))
			.map(String::as_str)
	}

	/// The 1-based start line, when the node carries a position.
	pub fn line(&self) -> Option<usize> {
		self.position.map(|position| position.start.line)
	}

	pub fn column(&self) -> Option<usize> {
		self.position.map(|position| position.start.column)
	}

	/// Visit this node and every descendant in pre-order.
	pub fn walk<'a>(&'a self, visitor: &mut impl FnMut(&'a Node)) {
		visitor(self);
		for child in &self.children {
			child.walk(visitor);
		}
	}

	/// Concatenated literal text of every descendant.
	pub fn text_content(&self) -> String {
		let mut content = String::new();
		self.walk(&mut |node| {
			if matches!(
				node.r#type,
				NodeType::Text | NodeType::InlineCode | NodeType::Code
			) {
				if let Some(value) = &node.value {
					content.push_str(value);
				}
			}
		});
		content
	}
}

/// A diagnostic produced while parsing. These don't prevent parsing from
/// completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ParseDiagnostic {
	/// A container directive was opened but never closed.
	UnclosedDirective {
		name: String,
		line: usize,
		column: usize,
	},
	/// A closing fence appeared with no open container it could close.
	UnexpectedClosingFence { line: usize },
}

impl ParseDiagnostic {
	pub fn line(&self) -> usize {
		match self {
			Self::UnclosedDirective { line, .. } | Self::UnexpectedClosingFence { line } => *line,
		}
	}

	pub fn message(&self) -> String {
		match self {
			Self::UnclosedDirective { name, .. } => {
				format!("container directive `{name}` is never closed")
			}
			Self::UnexpectedClosingFence { .. } => {
				"closing fence without an open container directive".to_string()
			}
		}
	}
}

/// A parsed markdown document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
	pub root: Node,
	pub diagnostics: Vec<ParseDiagnostic>,
}

/// Parse markdown content into a document tree with directive support.
pub fn parse_markdown(content: impl AsRef<str>) -> MdckResult<Document> {
	let content = content.as_ref();
	let mut scanner = BlockScanner::new();
	let mut point = Point::default();

	for line in content.split_inclusive('\n') {
		scanner.scan_line(line, point)?;
		point.advance_str(line);
	}

	scanner.finish(point)
}

/// The head of a directive: everything after the leading colons.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirectiveHead {
	name: String,
	label: Option<String>,
	attributes: Attributes,
	/// Number of bytes consumed from the input.
	len: usize,
}

/// Parse `name[label]{attributes}` from the start of `input`.
fn parse_directive_head(input: &str) -> Option<DirectiveHead> {
	let bytes = input.as_bytes();
	if !bytes.first()?.is_ascii_alphabetic() {
		return None;
	}

	let mut cursor = 1;
	while cursor < bytes.len()
		&& (bytes[cursor].is_ascii_alphanumeric() || bytes[cursor] == b'-' || bytes[cursor] == b'_')
	{
		cursor += 1;
	}
	let name = input[..cursor].to_string();

	let mut label = None;
	if bytes.get(cursor) == Some(&b'[') {
		let close = input[cursor..].find(']')?;
		label = Some(input[cursor + 1..cursor + close].to_string());
		cursor += close + 1;
	}

	let mut attributes = Attributes::default();
	if bytes.get(cursor) == Some(&b'{') {
		let close = find_attribute_close(&input[cursor..])?;
		attributes = parse_attributes(&input[cursor + 1..cursor + close]);
		cursor += close + 1;
	}

	Some(DirectiveHead {
		name,
		label,
		attributes,
		len: cursor,
	})
}

/// Find the `}` that closes an attribute block starting at `{`, skipping
/// over quoted strings.
fn find_attribute_close(input: &str) -> Option<usize> {
	let mut quote: Option<char> = None;
	let mut escaped = false;

	for (index, ch) in input.char_indices().skip(1) {
		if let Some(open) = quote {
			if escaped {
				escaped = false;
			} else if ch == '\\' {
				escaped = true;
			} else if ch == open {
				quote = None;
			}
			continue;
		}

		match ch {
			'"' | '\'' => quote = Some(ch),
			'}' => return Some(index),
			'\n' => return None,
			_ => {}
		}
	}

	None
}

/// Classification of a single source line.
enum LineKind {
	Markdown,
	CodeFence(char, usize),
	ClosingFence(usize),
	Container(usize, DirectiveHead),
	Leaf(DirectiveHead),
}

fn leading_indent(line: &str) -> usize {
	line.len() - line.trim_start_matches(' ').len()
}

fn classify_line(line: &str) -> LineKind {
	let body = line.trim_end_matches(['\n', '\r']);
	if leading_indent(body) > 3 {
		return LineKind::Markdown;
	}
	let trimmed = body.trim_start_matches(' ');

	for fence in ['`', '~'] {
		let count = trimmed.chars().take_while(|ch| *ch == fence).count();
		if count >= 3 {
			return LineKind::CodeFence(fence, count);
		}
	}

	let colons = trimmed.chars().take_while(|ch| *ch == ':').count();
	if colons < 2 {
		return LineKind::Markdown;
	}

	let rest = &trimmed[colons..];
	if rest.trim().is_empty() {
		return if colons >= 3 {
			LineKind::ClosingFence(colons)
		} else {
			LineKind::Markdown
		};
	}

	let Some(head) = parse_directive_head(rest) else {
		return LineKind::Markdown;
	};
	if !rest[head.len..].trim().is_empty() {
		return LineKind::Markdown;
	}

	if colons == 2 {
		LineKind::Leaf(head)
	} else {
		LineKind::Container(colons, head)
	}
}

/// An open container directive (or the document root at the bottom of the
/// stack).
struct Frame {
	head: Option<DirectiveHead>,
	fence_len: usize,
	start: Point,
	children: Vec<Node>,
}

/// Markdown lines waiting to be handed to the markdown parser.
struct Chunk {
	start: Point,
	text: String,
}

/// Line scanner that splits the source into directive structure and plain
/// markdown chunks.
struct BlockScanner {
	stack: Vec<Frame>,
	chunk: Option<Chunk>,
	code_fence: Option<(char, usize)>,
	diagnostics: Vec<ParseDiagnostic>,
}

impl BlockScanner {
	fn new() -> Self {
		Self {
			stack: vec![Frame {
				head: None,
				fence_len: 0,
				start: Point::default(),
				children: vec![],
			}],
			chunk: None,
			code_fence: None,
			diagnostics: vec![],
		}
	}

	fn push_markdown(&mut self, line: &str, point: Point) {
		match &mut self.chunk {
			Some(chunk) => chunk.text.push_str(line),
			None => {
				self.chunk = Some(Chunk {
					start: point,
					text: line.to_string(),
				});
			}
		}
	}

	fn current_children(&mut self) -> &mut Vec<Node> {
		// The root frame is never popped.
		let index = self.stack.len() - 1;
		&mut self.stack[index].children
	}

	fn flush(&mut self) -> MdckResult<()> {
		let Some(chunk) = self.chunk.take() else {
			return Ok(());
		};

		if chunk.text.trim().is_empty() {
			return Ok(());
		}

		let nodes = parse_chunk(&chunk)?;
		self.current_children().extend(nodes);
		Ok(())
	}

	fn scan_line(&mut self, line: &str, point: Point) -> MdckResult<()> {
		if let Some((fence, count)) = self.code_fence {
			if let LineKind::CodeFence(closing, closing_count) = classify_line(line) {
				if closing == fence && closing_count >= count {
					self.code_fence = None;
				}
			}
			self.push_markdown(line, point);
			return Ok(());
		}

		let mut end = point;
		end.advance_str(line.trim_end_matches(['\n', '\r']));

		match classify_line(line) {
			LineKind::Markdown => self.push_markdown(line, point),
			LineKind::CodeFence(fence, count) => {
				self.code_fence = Some((fence, count));
				self.push_markdown(line, point);
			}
			LineKind::ClosingFence(count) => {
				let closes_open = self.stack.len() > 1
					&& self
						.stack
						.last()
						.is_some_and(|frame| count >= frame.fence_len);

				if closes_open {
					self.flush()?;
					self.close_frame(end);
				} else {
					if self.stack.len() == 1 {
						self.diagnostics
							.push(ParseDiagnostic::UnexpectedClosingFence { line: point.line });
					}
					self.push_markdown(line, point);
				}
			}
			LineKind::Container(fence_len, head) => {
				self.flush()?;
				self.stack.push(Frame {
					head: Some(head),
					fence_len,
					start: point,
					children: vec![],
				});
			}
			LineKind::Leaf(head) => {
				self.flush()?;
				let node = Node {
					r#type: NodeType::LeafDirective,
					name: Some(head.name),
					label: head.label,
					attributes: Some(head.attributes),
					position: Some(Position::from_points(point, end)),
					raw: Some(line.trim_end_matches(['\n', '\r']).to_string()),
					..Node::new(NodeType::LeafDirective)
				};
				self.current_children().push(node);
			}
		}

		Ok(())
	}

	fn close_frame(&mut self, end: Point) {
		let Some(frame) = self.stack.pop() else {
			return;
		};
		let Some(head) = frame.head else {
			return;
		};

		let node = Node {
			r#type: NodeType::ContainerDirective,
			name: Some(head.name),
			label: head.label,
			attributes: Some(head.attributes),
			children: frame.children,
			position: Some(Position::from_points(frame.start, end)),
			..Node::new(NodeType::ContainerDirective)
		};

		self.current_children().push(node);
	}

	fn finish(mut self, end: Point) -> MdckResult<Document> {
		self.flush()?;

		while self.stack.len() > 1 {
			if let Some(frame) = self.stack.last() {
				if let Some(head) = &frame.head {
					self.diagnostics.push(ParseDiagnostic::UnclosedDirective {
						name: head.name.clone(),
						line: frame.start.line,
						column: frame.start.column,
					});
				}
			}
			self.close_frame(end);
		}

		let children = self
			.stack
			.pop()
			.map(|frame| frame.children)
			.unwrap_or_default();
		let root = Node::root(children)
			.with_position(Position::from_points(Point::default(), end));

		Ok(Document {
			root,
			diagnostics: self.diagnostics,
		})
	}
}

fn parse_chunk(chunk: &Chunk) -> MdckResult<Vec<Node>> {
	let root = to_mdast(&chunk.text, &ParseOptions::gfm())
		.map_err(|message| MdckError::Markdown(message.to_string()))?;

	let nodes = root
		.children()
		.map(|children| {
			children
				.iter()
				.map(|child| convert_node(child, chunk, true))
				.collect()
		})
		.unwrap_or_default();

	Ok(split_inline_directives(nodes))
}

fn convert_node(node: &mdast::Node, chunk: &Chunk, keep_raw: bool) -> Node {
	let mut converted = match node {
		mdast::Node::Paragraph(_) => Node::new(NodeType::Paragraph),
		mdast::Node::Heading(heading) => {
			Node {
				depth: Some(heading.depth),
				..Node::new(NodeType::Heading)
			}
		}
		mdast::Node::Text(text) => Node::text(text.value.clone()),
		mdast::Node::Emphasis(_) => Node::new(NodeType::Emphasis),
		mdast::Node::Strong(_) => Node::new(NodeType::Strong),
		mdast::Node::Delete(_) => Node::new(NodeType::Delete),
		mdast::Node::InlineCode(code) => {
			Node {
				value: Some(code.value.clone()),
				..Node::new(NodeType::InlineCode)
			}
		}
		mdast::Node::Code(code) => {
			Node {
				value: Some(code.value.clone()),
				..Node::new(NodeType::Code)
			}
		}
		mdast::Node::Html(html) => {
			Node {
				value: Some(html.value.clone()),
				..Node::new(NodeType::Html)
			}
		}
		mdast::Node::Link(_) => Node::new(NodeType::Link),
		mdast::Node::Image(_) => Node::new(NodeType::Image),
		mdast::Node::List(_) => Node::new(NodeType::List),
		mdast::Node::ListItem(item) => {
			Node {
				checked: item.checked,
				..Node::new(NodeType::ListItem)
			}
		}
		mdast::Node::Blockquote(_) => Node::new(NodeType::Blockquote),
		mdast::Node::ThematicBreak(_) => Node::new(NodeType::ThematicBreak),
		mdast::Node::Break(_) => Node::new(NodeType::Break),
		mdast::Node::Table(_) => Node::new(NodeType::Table),
		mdast::Node::TableRow(_) => Node::new(NodeType::TableRow),
		mdast::Node::TableCell(_) => Node::new(NodeType::TableCell),
		_ => Node::new(NodeType::Other),
	};

	if let Some(position) = node.position() {
		let relative = Position::from(position);
		converted.position = Some(relative.shifted(chunk.start));

		if keep_raw {
			converted.raw = chunk
				.text
				.get(relative.start.offset..relative.end.offset)
				.map(ToString::to_string);
		}
	}

	if let Some(children) = node.children() {
		converted.children = children
			.iter()
			.map(|child| convert_node(child, chunk, false))
			.collect();
	}

	converted
}

/// Replace inline directive syntax inside text nodes with directive nodes.
fn split_inline_directives(nodes: Vec<Node>) -> Vec<Node> {
	let mut output = Vec::with_capacity(nodes.len());

	for mut node in nodes {
		if node.r#type == NodeType::Text {
			output.extend(split_text_node(node));
			continue;
		}

		if !matches!(node.r#type, NodeType::Code | NodeType::InlineCode | NodeType::Html) {
			let children = std::mem::take(&mut node.children);
			node.children = split_inline_directives(children);
		}
		output.push(node);
	}

	output
}

fn split_text_node(node: Node) -> Vec<Node> {
	let Some(value) = node.value.as_deref() else {
		return vec![node];
	};

	let matches = find_inline_directives(value);
	if matches.is_empty() {
		return vec![node];
	}

	let base = node.position.map(|position| position.start);
	let point_at = |offset: usize| {
		base.map(|mut point| {
			point.advance_str(&value[..offset]);
			point
		})
	};

	let mut output = vec![];
	let mut last_end = 0;

	for found in matches {
		if found.start > last_end {
			let mut text = Node::text(&value[last_end..found.start]);
			if let (Some(start), Some(end)) = (point_at(last_end), point_at(found.start)) {
				text.position = Some(Position::from_points(start, end));
			}
			output.push(text);
		}

		let mut directive = Node::directive(found.r#type, found.head.name, found.head.attributes);
		directive.label = found.head.label;
		directive.raw = Some(value[found.start..found.end].to_string());
		if let (Some(start), Some(end)) = (point_at(found.start), point_at(found.end)) {
			directive.position = Some(Position::from_points(start, end));
		}
		output.push(directive);
		last_end = found.end;
	}

	if last_end < value.len() {
		let mut text = Node::text(&value[last_end..]);
		if let (Some(start), Some(end)) = (point_at(last_end), node.position.map(|p| p.end)) {
			text.position = Some(Position::from_points(start, end));
		}
		output.push(text);
	}

	output
}

struct InlineMatch {
	r#type: NodeType,
	start: usize,
	end: usize,
	head: DirectiveHead,
}

/// Find `::name{...}` (leaf) and `:name[label]{...}` (text) directives in
/// a run of text.
fn find_inline_directives(text: &str) -> Vec<InlineMatch> {
	let bytes = text.as_bytes();
	let mut matches = vec![];
	let mut cursor = 0;

	while cursor < bytes.len() {
		if bytes[cursor] != b':' {
			cursor += 1;
			continue;
		}

		let previous = cursor.checked_sub(1).map(|index| bytes[index]);
		if previous.is_some_and(|byte| byte == b':' || byte.is_ascii_alphanumeric()) {
			cursor += 1;
			continue;
		}

		let colons = bytes[cursor..].iter().take_while(|byte| **byte == b':').count();
		let head_start = cursor + colons;

		let parsed = match colons {
			1 | 2 => parse_directive_head(&text[head_start..]),
			_ => None,
		};

		let Some(head) = parsed else {
			cursor += colons;
			continue;
		};

		let head_text = &text[head_start..head_start + head.len];
		let r#type = if colons == 2 {
			NodeType::LeafDirective
		} else {
			NodeType::TextDirective
		};
		let valid = match r#type {
			NodeType::LeafDirective => head_text.ends_with('}'),
			_ => head_text.ends_with('}') || head_text.ends_with(']'),
		};

		if !valid {
			cursor += colons;
			continue;
		}

		let end = head_start + head.len;
		matches.push(InlineMatch {
			r#type,
			start: cursor,
			end,
			head,
		});
		cursor = end;
	}

	matches
}

/// Render nodes back into markdown source. Blocks are separated by a blank
/// line.
pub fn to_markdown(nodes: &[Node]) -> String {
	let blocks: Vec<String> = nodes.iter().map(render_node).collect();
	let mut output = blocks.join("\n\n");
	if !output.is_empty() {
		output.push('\n');
	}
	output
}

fn render_node(node: &Node) -> String {
	match node.r#type {
		NodeType::ContainerDirective => {
			let colons = ":".repeat(3 + container_depth(node));
			let head = render_directive_head(node);
			let body = to_markdown(&node.children);
			if body.is_empty() {
				format!("{colons}{head}\n{colons}")
			} else {
				format!("{colons}{head}\n{}\n{colons}", body.trim_end_matches('\n'))
			}
		}
		NodeType::LeafDirective if node.raw.is_none() => format!("::{}", render_directive_head(node)),
		NodeType::TextDirective if node.raw.is_none() => format!(":{}", render_directive_head(node)),
		_ => {
			if let Some(raw) = &node.raw {
				return raw.trim_end_matches('\n').to_string();
			}
			if let Some(value) = &node.value {
				return value.clone();
			}
			node.children.iter().map(render_node).collect()
		}
	}
}

fn container_depth(node: &Node) -> usize {
	node.children
		.iter()
		.filter(|child| child.r#type == NodeType::ContainerDirective)
		.map(|child| 1 + container_depth(child))
		.max()
		.unwrap_or(0)
}

fn render_directive_head(node: &Node) -> String {
	let name = node.name.as_deref().unwrap_or_default();
	let label = node
		.label
		.as_ref()
		.map(|label| format!("[{label}]"))
		.unwrap_or_default();
	let attributes = node
		.attributes
		.as_ref()
		.map(Attributes::to_source)
		.unwrap_or_default();

	format!("{name}{label}{attributes}")
}
