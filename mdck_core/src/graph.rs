use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::TemplateDefinitions;

/// Directed graph of template ids, derived from the definition set.
///
/// Edges point from a definition to the ids it references. The graph is
/// never edited in place: rebuild it from the definitions whenever they
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
	pub nodes: BTreeSet<String>,
	pub edges: BTreeMap<String, BTreeSet<String>>,
	pub reverse_edges: BTreeMap<String, BTreeSet<String>>,
	/// Every detected cycle, each closing back on its first id.
	pub cycles: Vec<Vec<String>>,
}

impl DependencyGraph {
	/// Build the graph for `definitions` and detect its cycles.
	pub fn from_definitions(definitions: &TemplateDefinitions) -> Self {
		Self::from_dependencies(
			definitions
				.values()
				.map(|definition| (definition.id.as_str(), definition.dependencies.as_slice())),
		)
	}

	/// Build the graph from `(id, dependencies)` pairs.
	pub fn from_dependencies<'a, I, D>(entries: I) -> Self
	where
		I: IntoIterator<Item = (&'a str, &'a [D])>,
		D: AsRef<str> + 'a,
	{
		let mut graph = Self::default();

		for (id, dependencies) in entries {
			graph.nodes.insert(id.to_string());
			let targets = graph.edges.entry(id.to_string()).or_default();

			for dependency in dependencies {
				targets.insert(dependency.as_ref().to_string());
			}
		}

		for (source, targets) in &graph.edges {
			for target in targets {
				graph
					.reverse_edges
					.entry(target.clone())
					.or_default()
					.insert(source.clone());
			}
		}

		graph.cycles = graph.detect_cycles();
		graph
	}

	/// Depth first search with an explicit path stack. Every back edge found
	/// yields one cycle.
	pub fn detect_cycles(&self) -> Vec<Vec<String>> {
		let mut visited: BTreeSet<&str> = BTreeSet::new();
		let mut cycles = vec![];

		for start in &self.nodes {
			if !visited.insert(start.as_str()) {
				continue;
			}

			let mut path: Vec<&str> = vec![start.as_str()];
			let mut on_path: HashMap<&str, usize> = HashMap::from([(start.as_str(), 0)]);
			let mut frames = vec![self.dependencies_of(start)];

			while let Some(targets) = frames.last_mut() {
				let Some(target) = targets.next() else {
					frames.pop();
					if let Some(node) = path.pop() {
						on_path.remove(node);
					}
					continue;
				};

				if let Some(&position) = on_path.get(target.as_str()) {
					let mut cycle: Vec<String> = path[position..].iter().map(ToString::to_string).collect();
					cycle.push(target.clone());
					cycles.push(cycle);
				} else if visited.insert(target.as_str()) {
					on_path.insert(target.as_str(), path.len());
					path.push(target.as_str());
					frames.push(self.dependencies_of(target));
				}
			}
		}

		cycles
	}

	pub fn has_cycles(&self) -> bool {
		!self.cycles.is_empty()
	}

	pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &String> {
		self.edges.get(id).into_iter().flatten()
	}

	/// Ids whose definitions reference `id` directly.
	pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &String> {
		self.reverse_edges.get(id).into_iter().flatten()
	}

	/// Every id that directly or indirectly depends on one of `ids`.
	pub fn transitive_dependents<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
		let mut found = BTreeSet::new();
		let mut pending: Vec<String> = ids.into_iter().map(ToString::to_string).collect();

		while let Some(id) = pending.pop() {
			for dependent in self.dependents_of(&id) {
				if found.insert(dependent.clone()) {
					pending.push(dependent.clone());
				}
			}
		}

		found
	}

	pub fn edge_count(&self) -> usize {
		self.edges.values().map(BTreeSet::len).sum()
	}
}

/// Render a cycle as `a → b → c → a`.
pub fn format_cycle(cycle: &[String]) -> String {
	cycle.join(" → ")
}
