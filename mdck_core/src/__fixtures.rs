use std::path::Path;
use std::path::PathBuf;

use crate::Node;
use crate::NodeType;
use crate::parse_markdown;

pub(crate) const REFERENCING_PAIR: &str =
	":::template{id=\"a\"}\n::template{id=\"b\"}\n:::\n\n:::template{id=\"b\"}\ncontent\n:::";

pub(crate) const DUPLICATE_DEFINITIONS: &str =
	":::template{id=\"dup\"}\nfirst\n:::\n\n:::template{id=\"dup\"}\nsecond\n:::\n";

pub(crate) const THREE_CYCLE: &str = r#":::template{id="a"}
::template{id="b"}
:::

:::template{id="b"}
::template{id="c"}
:::

:::template{id="c"}
::template{id="a"}
:::
"#;

pub(crate) const SHARED_LEAF: &str = r#":::template{id="root"}
::template{id="left"}
::template{id="right"}
:::

:::template{id="left"}
::template{id="leaf"}
:::

:::template{id="right"}
::template{id="leaf"}
:::

:::template{id="leaf"}
shared
:::
"#;

pub(crate) const DEEP_CHAIN: &str = r#":::template{id="t0"}
::template{id="t1"}
:::

:::template{id="t1"}
::template{id="t2"}
:::

:::template{id="t2"}
::template{id="t3"}
:::

:::template{id="t3"}
::template{id="t4"}
:::

:::template{id="t4"}
bottom
:::
"#;

pub(crate) const MIXED_DIRECTIVES: &str = r#":::template{id="a" hidden}
Some *text*
:::

::tag{name="x"}

Value :result{value="1"} here
"#;

pub(crate) const CLEAN_DOCUMENT: &str = r#"# Guide

:::template{id="intro"}
Welcome to the guide.
:::

::template{id="intro"}
"#;

pub(crate) fn parse(content: &str) -> Node {
	parse_markdown(content)
		.unwrap_or_else(|e| panic!("failed to parse fixture: {e}"))
		.root
}

/// Write `content` to `name` below `dir`, creating parent directories.
pub(crate) fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
	let path = dir.join(name);
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)
			.unwrap_or_else(|e| panic!("failed to create {}: {e}", parent.display()));
	}
	std::fs::write(&path, content).unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
	path
}

/// Every directive node below `root` with the given type.
pub(crate) fn directives_of_type(root: &Node, r#type: NodeType) -> Vec<&Node> {
	let mut found = vec![];
	root.walk(&mut |node| {
		if node.r#type == r#type {
			found.push(node);
		}
	});
	found
}

/// Plain text of an expanded node sequence, one entry per node.
pub(crate) fn texts(nodes: &[Node]) -> Vec<String> {
	nodes.iter().map(Node::text_content).collect()
}
