use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use rstest::rstest;
use similar_asserts::assert_eq;
use tracing_test::traced_test;

use super::__fixtures::*;
use super::*;

#[rstest]
#[case::quoted(r#"id="a" src='./shared.md'"#, &[("id", "a"), ("src", "./shared.md")], &[])]
#[case::bare_value("id=plain", &[("id", "plain")], &[])]
#[case::shorthand("#main .one .two mandatory", &[("class", "one two"), ("id", "main")], &["mandatory"])]
#[case::escaped(r#"title="say \"hi\"""#, &[("title", "say \"hi\"")], &[])]
#[case::empty("", &[], &[])]
fn parses_attributes(
	#[case] source: &str,
	#[case] values: &[(&str, &str)],
	#[case] flags: &[&str],
) {
	let attributes = parse_attributes(source);
	let expected_values: BTreeMap<String, String> = values
		.iter()
		.map(|(key, value)| ((*key).to_string(), (*value).to_string()))
		.collect();
	let expected_flags: BTreeSet<String> = flags.iter().map(ToString::to_string).collect();

	assert_eq!(attributes.values, expected_values);
	assert_eq!(attributes.flags, expected_flags);
}

#[test]
fn attributes_render_back_to_source() {
	let attributes = parse_attributes(r#"src="./a.md" #intro"#);
	assert_eq!(attributes.to_source(), r#"{id="intro" src="./a.md"}"#);
	assert_eq!(attributes.id(), Some("intro"));
	assert_eq!(attributes.src(), Some("./a.md"));
}

#[test]
fn parses_container_and_leaf_directives() -> MdckResult<()> {
	let document = parse_markdown(REFERENCING_PAIR)?;
	assert!(document.diagnostics.is_empty());

	let containers = directives_of_type(&document.root, NodeType::ContainerDirective);
	assert_eq!(containers.len(), 2);
	assert_eq!(containers[0].attribute("id"), Some("a"));
	assert_eq!(containers[0].line(), Some(1));
	assert_eq!(containers[0].position.map(|position| position.end.line), Some(3));

	let leaves = directives_of_type(&document.root, NodeType::LeafDirective);
	assert_eq!(leaves.len(), 1);
	assert_eq!(leaves[0].name.as_deref(), Some("template"));
	assert_eq!(leaves[0].attribute("id"), Some("b"));
	assert_eq!(leaves[0].line(), Some(2));

	Ok(())
}

#[test]
fn parses_nested_containers() -> MdckResult<()> {
	let content = "::::tag{name=\"outer\"}\n:::template{id=\"inner\"}\nbody\n:::\n::::\n";
	let document = parse_markdown(content)?;
	assert!(document.diagnostics.is_empty());
	assert_eq!(document.root.children.len(), 1);

	let outer = &document.root.children[0];
	assert!(outer.is_directive_named("tag"));
	assert_eq!(outer.children.len(), 1);
	assert!(outer.children[0].is_directive_named("template"));
	assert_eq!(outer.children[0].text_content(), "body");

	Ok(())
}

#[rstest]
#[case::leaf_inside_text("See ::template{id=\"x\"} here\n", NodeType::LeafDirective, "template")]
#[case::text_directive("Status :badge{color=\"red\"} done\n", NodeType::TextDirective, "badge")]
fn splits_inline_directives(
	#[case] content: &str,
	#[case] r#type: NodeType,
	#[case] name: &str,
) -> MdckResult<()> {
	let document = parse_markdown(content)?;
	let found = directives_of_type(&document.root, r#type);

	assert_eq!(found.len(), 1);
	assert_eq!(found[0].name.as_deref(), Some(name));
	assert_eq!(found[0].line(), Some(1));

	Ok(())
}

#[test]
fn ignores_directives_inside_code_fences() -> MdckResult<()> {
	let content = "```md\n:::template{id=\"a\"}\n::template{id=\"b\"}\n:::\n```\n";
	let document = parse_markdown(content)?;

	assert!(directives_of_type(&document.root, NodeType::ContainerDirective).is_empty());
	assert!(directives_of_type(&document.root, NodeType::LeafDirective).is_empty());
	assert_eq!(document.root.children[0].r#type, NodeType::Code);

	Ok(())
}

#[rstest]
#[case::unclosed(
	":::template{id=\"a\"}\ntext\n",
	ParseDiagnostic::UnclosedDirective { name: "template".into(), line: 1, column: 1 }
)]
#[case::stray_fence("text\n\n:::\n", ParseDiagnostic::UnexpectedClosingFence { line: 3 })]
fn reports_parse_diagnostics(
	#[case] content: &str,
	#[case] expected: ParseDiagnostic,
) -> MdckResult<()> {
	let document = parse_markdown(content)?;
	assert_eq!(document.diagnostics, vec![expected]);

	Ok(())
}

#[test]
fn renders_nodes_back_to_markdown() {
	let root = parse(REFERENCING_PAIR);
	assert_eq!(to_markdown(&root.children), format!("{REFERENCING_PAIR}\n"));
}

#[test]
fn extracts_known_directives_in_document_order() {
	let root = parse(MIXED_DIRECTIVES);
	let records = extract_directives(&root);

	let summary: Vec<(&str, DirectiveKind, i64)> = records
		.iter()
		.map(|record| (record.name.as_str(), record.kind, record.line))
		.collect();
	assert_eq!(
		summary,
		vec![
			("template", DirectiveKind::Container, 1),
			("tag", DirectiveKind::Leaf, 5),
			("result", DirectiveKind::InlineText, 7),
		]
	);

	let template = &records[0];
	assert_eq!(template.content, "Some text");
	assert_eq!(
		template.attributes,
		BTreeMap::from([("id".to_string(), "a".to_string())])
	);
	assert!(records[1].content.is_empty());
}

#[test]
fn extractor_uses_unknown_line_without_position() {
	let root = Node::root(vec![
		Node::directive(NodeType::LeafDirective, "tag", Attributes::default()),
		Node::directive(NodeType::LeafDirective, "other", Attributes::default()),
	]);
	let records = extract_directives(&root);

	assert_eq!(records.len(), 1);
	assert_eq!(records[0].line, UNKNOWN_LINE);
}

#[test]
fn collects_definitions_with_dependencies() -> MdckResult<()> {
	let root = parse(REFERENCING_PAIR);
	let definitions = collect_definitions(&root, None)?;

	assert_eq!(definitions.keys().collect::<Vec<_>>(), vec!["a", "b"]);
	assert_eq!(definitions["a"].dependencies, vec!["b".to_string()]);
	assert!(definitions["b"].dependencies.is_empty());
	assert_eq!(definitions["b"].start_line, Some(5));
	assert_eq!(definitions["b"].end_line, Some(7));

	Ok(())
}

#[test]
fn duplicate_definitions_fail_collection() {
	let root = parse(DUPLICATE_DEFINITIONS);
	let error = collect_definitions(&root, None)
		.err()
		.unwrap_or_else(|| panic!("expected a duplicate error"));

	assert_eq!(error.kind, TemplateErrorKind::DuplicateDefinition);
	assert!(error.message.contains("\"dup\""));
	assert!(error.message.contains("line 1"));
	assert_eq!(error.detail("templateId"), Some("dup"));
	assert_eq!(error.detail("line"), Some("5"));
}

#[test]
fn definition_without_id_is_invalid() {
	let root = parse(":::template\nbody\n:::\n");
	let error = collect_definitions(&root, Some(std::path::Path::new("docs/a.md")))
		.err()
		.unwrap_or_else(|| panic!("expected an invalid definition error"));

	assert_eq!(error.kind, TemplateErrorKind::InvalidDefinition);
	assert_eq!(error.detail("filePath"), Some("docs/a.md"));
	assert_eq!(error.detail("line"), Some("1"));
}

#[test]
fn collects_references_with_sources() {
	let root = parse("::template{id=\"a\"}\n\n::template{id=\"b\" src=\"./b.md\"}\n\n::template{src=\"./c.md\"}\n");
	let references = collect_references(&root);

	assert_eq!(references.len(), 2);
	assert!(!references[0].is_external());
	assert_eq!(references[1].src.as_deref(), Some("./b.md"));
	assert_eq!(references[1].line, Some(3));
}

#[tokio::test]
async fn expands_referencing_pair() {
	let root = parse(REFERENCING_PAIR);
	let expander = TemplateExpander::default();
	let result = expander.expand_template("a", &root, None).await;

	let ExpansionResult::Success {
		expanded,
		used_definitions,
	} = result
	else {
		panic!("expected a successful expansion");
	};
	assert_eq!(texts(&expanded), vec!["content".to_string()]);
	assert_eq!(
		used_definitions,
		BTreeSet::from(["a".to_string(), "b".to_string()])
	);
}

#[test]
fn reuses_templates_across_independent_branches() -> MdckResult<()> {
	let definitions = collect_definitions(&parse(SHARED_LEAF), None)?;
	let result = TemplateExpander::default().expand_with_definitions("root", &definitions);

	let ExpansionResult::Success { expanded, .. } = result else {
		panic!("expected a successful expansion");
	};
	assert_eq!(texts(&expanded), vec!["shared".to_string(), "shared".to_string()]);

	Ok(())
}

#[test]
fn expansion_is_idempotent() -> MdckResult<()> {
	let definitions = collect_definitions(&parse(SHARED_LEAF), None)?;
	let expander = TemplateExpander::default();

	let first = expander.expand_with_definitions("root", &definitions);
	let second = expander.expand_with_definitions("root", &definitions);
	assert_eq!(first, second);

	let (ExpansionResult::Success { expanded: first, .. }, ExpansionResult::Success { expanded: second, .. }) =
		(first, second)
	else {
		panic!("expected both expansions to succeed");
	};
	assert_eq!(to_markdown(&first), to_markdown(&second));

	Ok(())
}

#[test]
fn detects_cycles_during_expansion() -> MdckResult<()> {
	let definitions = collect_definitions(&parse(THREE_CYCLE), None)?;
	let result = TemplateExpander::default().expand_with_definitions("a", &definitions);
	let error = result
		.error()
		.unwrap_or_else(|| panic!("expected a circular reference"));

	assert_eq!(error.kind, TemplateErrorKind::CircularReference);
	assert_eq!(error.detail("path"), Some("a → b → c → a"));
	assert!(error.message.contains("Circular reference detected"));
	assert_eq!(error.detail("rootTemplateId"), Some("a"));

	Ok(())
}

#[test]
fn reports_undefined_references_during_expansion() -> MdckResult<()> {
	let definitions = collect_definitions(&parse(":::template{id=\"x\"}\n::template{id=\"missing\"}\n:::\n"), None)?;
	let result = TemplateExpander::default().expand_with_definitions("x", &definitions);
	let error = result
		.error()
		.unwrap_or_else(|| panic!("expected an undefined reference"));

	assert_eq!(error.kind, TemplateErrorKind::UndefinedReference);
	assert_eq!(error.detail("templateId"), Some("missing"));
	assert_eq!(error.detail("referencedFrom"), Some("x"));

	Ok(())
}

#[rstest]
#[case::default_depth(ExpansionOptions::default(), true)]
#[case::shallow(ExpansionOptions { max_depth: 2 }, false)]
fn enforces_maximum_expansion_depth(
	#[case] options: ExpansionOptions,
	#[case] succeeds: bool,
) -> MdckResult<()> {
	let definitions = collect_definitions(&parse(DEEP_CHAIN), None)?;
	let result = TemplateExpander::default()
		.with_options(options)
		.expand_with_definitions("t0", &definitions);

	assert_eq!(result.is_success(), succeeds);
	if !succeeds {
		assert_eq!(
			result.error().map(|error| error.kind),
			Some(TemplateErrorKind::MaxDepthExceeded)
		);
	}

	Ok(())
}

#[tokio::test]
async fn expands_across_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let main = write_file(
		tmp.path(),
		"main.md",
		":::template{id=\"page\"}\n# Title\n::template{id=\"footer\" src=\"./partials/footer.md\"}\n:::\n",
	);
	write_file(
		tmp.path(),
		"partials/footer.md",
		":::template{id=\"footer\"}\nFooter text\n::template{id=\"copyright\" src=\"../legal/copyright.md\"}\n:::\n",
	);
	write_file(
		tmp.path(),
		"legal/copyright.md",
		":::template{id=\"copyright\"}\nCopyright notice\n:::\n",
	);

	let content = std::fs::read_to_string(&main)?;
	let root = parse(&content);
	let expander = TemplateExpander::default();
	let result = expander.expand_template("page", &root, Some(&main)).await;

	let ExpansionResult::Success {
		expanded,
		used_definitions,
	} = result
	else {
		panic!("expected a successful expansion");
	};
	assert_eq!(to_markdown(&expanded), "# Title\n\nFooter text\n\nCopyright notice\n");
	assert_eq!(used_definitions.len(), 3);
	assert_eq!(expander.resolver().cached_paths().await.len(), 2);

	Ok(())
}

#[tokio::test]
async fn cross_file_duplicates_name_both_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let main = write_file(
		tmp.path(),
		"main.md",
		":::template{id=\"dup\"}\nmain\n:::\n\n::template{id=\"dup\" src=\"./other.md\"}\n",
	);
	let other = write_file(tmp.path(), "other.md", ":::template{id=\"dup\"}\nother\n:::\n");

	let root = parse(&std::fs::read_to_string(&main)?);
	let error = TemplateExpander::default()
		.collect_all_definitions(&root, Some(&main))
		.await
		.err()
		.unwrap_or_else(|| panic!("expected a duplicate error"));

	assert_eq!(error.kind, TemplateErrorKind::DuplicateDefinition);
	assert!(error.message.contains(&main.display().to_string()));
	assert!(error.message.contains(&other.display().to_string()));
	assert_eq!(error.detail("secondFile"), Some(other.display().to_string().as_str()));

	Ok(())
}

#[tokio::test]
async fn missing_source_fails_collection() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let main = write_file(tmp.path(), "main.md", "::template{id=\"x\" src=\"./missing.md\"}\n");

	let root = parse(&std::fs::read_to_string(&main)?);
	let result = TemplateExpander::default()
		.expand_template("x", &root, Some(&main))
		.await;
	let error = result
		.error()
		.unwrap_or_else(|| panic!("expected a file error"));

	assert_eq!(error.kind, TemplateErrorKind::FileNotFound);
	assert!(error.message.contains("missing.md"));
	assert_eq!(error.detail("templateId"), Some("x"));

	Ok(())
}

#[tokio::test]
async fn resolver_reports_missing_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let resolver = FileResolver::new();
	let base = tmp.path().join("main.md");

	let outcome = resolver.resolve_file("missing.md", Some(&base)).await;
	let ResolveOutcome::Error {
		kind,
		message,
		attempted_path,
	} = outcome
	else {
		panic!("expected an error outcome");
	};
	assert_eq!(kind, ResolveErrorKind::NotFound);
	assert!(message.starts_with("File not found:"));
	assert_eq!(attempted_path, normalize_path(&tmp.path().join("missing.md")));

	Ok(())
}

#[tokio::test]
async fn resolver_memoizes_until_invalidated() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let path = write_file(tmp.path(), "shared.md", ":::template{id=\"one\"}\n1\n:::\n");
	let resolver = FileResolver::new();

	let (first, resolved) = resolver.resolve_file(&path, None).await.into_result()?;
	write_file(tmp.path(), "shared.md", ":::template{id=\"two\"}\n2\n:::\n");
	let (second, _) = resolver.resolve_file(&path, None).await.into_result()?;

	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(resolver.cached_paths().await, vec![resolved.clone()]);

	resolver.invalidate_file(&resolved).await;
	let (third, _) = resolver.resolve_file(&path, None).await.into_result()?;
	let ids: Vec<_> = collect_definitions(&third.root, None)?.into_keys().collect();
	assert_eq!(ids, vec!["two".to_string()]);

	resolver.clear_cache().await;
	assert!(resolver.cached_paths().await.is_empty());

	Ok(())
}

#[tokio::test]
async fn resolver_sandbox_rejects_escaping_paths() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "outside.md", "outside\n");
	let docs = tmp.path().join("docs");
	let resolver = FileResolver::with_options(FileResolverOptions {
		restrict_to_base: Some(docs.clone()),
	});

	let outcome = resolver
		.resolve_file("../outside.md", Some(&docs.join("main.md")))
		.await;
	assert!(matches!(
		outcome,
		ResolveOutcome::Error {
			kind: ResolveErrorKind::AccessDenied,
			..
		}
	));

	let open = FileResolver::new()
		.resolve_file("../outside.md", Some(&docs.join("main.md")))
		.await;
	assert!(open.is_success());

	Ok(())
}

#[tokio::test]
async fn resolver_sandbox_anchors_relative_base_at_working_directory() -> MdckResult<()> {
	let resolver = FileResolver::with_options(FileResolverOptions {
		restrict_to_base: Some(PathBuf::from(".")),
	});

	let inside = resolver.resolve_file("Cargo.toml", None).await;
	assert!(inside.is_success());

	let outside = resolver.resolve_file("../Cargo.toml", None).await;
	assert!(matches!(
		outside,
		ResolveOutcome::Error {
			kind: ResolveErrorKind::AccessDenied,
			..
		}
	));

	Ok(())
}

#[test]
fn normalizes_paths_lexically() {
	assert_eq!(
		normalize_path(std::path::Path::new("/a/b/./c/../d.md")),
		PathBuf::from("/a/b/d.md")
	);
}

#[rstest]
#[case::current_dir(".")]
#[case::collapsed("docs/..")]
fn empty_normalized_path_is_current_dir(#[case] path: &str) {
	assert_eq!(normalize_path(std::path::Path::new(path)), PathBuf::from("."));
}

#[test]
fn relative_cache_root_is_made_absolute() -> MdckResult<()> {
	let manager = CacheManager::new(".");

	assert!(manager.root().is_absolute());
	assert_eq!(manager.root(), absolute_path(&std::env::current_dir()?));

	Ok(())
}

#[test]
fn dependency_graph_finds_cycles_and_dependents() {
	let entries: Vec<(&str, Vec<&str>)> = vec![
		("a", vec!["b"]),
		("b", vec!["c"]),
		("c", vec!["a"]),
		("d", vec!["a"]),
		("e", vec![]),
	];
	let graph = DependencyGraph::from_dependencies(
		entries
			.iter()
			.map(|(id, dependencies)| (*id, dependencies.as_slice())),
	);

	assert_eq!(
		graph.cycles,
		vec![vec![
			"a".to_string(),
			"b".to_string(),
			"c".to_string(),
			"a".to_string()
		]]
	);
	assert_eq!(format_cycle(&graph.cycles[0]), "a → b → c → a");
	assert_eq!(
		graph.dependents_of("a").cloned().collect::<Vec<_>>(),
		vec!["c".to_string(), "d".to_string()]
	);
	assert_eq!(
		graph.transitive_dependents(["c"]),
		BTreeSet::from(["a", "b", "c", "d"].map(ToString::to_string))
	);
	assert_eq!(graph.edge_count(), 4);
	assert!(graph.dependencies_of("e").next().is_none());
}

#[test]
fn long_dependency_chain_does_not_overflow_the_stack() {
	let size = 50_000;
	let entries: Vec<(String, Vec<String>)> = (0..size)
		.map(|index| (format!("t{index}"), vec![format!("t{}", (index + 1) % size)]))
		.collect();
	let graph = DependencyGraph::from_dependencies(
		entries
			.iter()
			.map(|(id, dependencies)| (id.as_str(), dependencies.as_slice())),
	);

	assert_eq!(graph.cycles.len(), 1);
	let cycle = &graph.cycles[0];
	assert_eq!(cycle.len(), size + 1);
	assert_eq!(cycle.first().map(String::as_str), Some("t0"));
	assert_eq!(cycle.last().map(String::as_str), Some("t0"));
}

#[test]
fn acyclic_graph_has_no_cycles() -> MdckResult<()> {
	let definitions = collect_definitions(&parse(SHARED_LEAF), None)?;
	let graph = DependencyGraph::from_definitions(&definitions);

	assert!(!graph.has_cycles());
	assert_eq!(graph.nodes.len(), 4);

	Ok(())
}

#[test]
fn extracts_file_metadata_with_errors() {
	let metadata = extract_from_content("docs/dup.md", DUPLICATE_DEFINITIONS, 42, 7);

	assert_eq!(metadata.template_ids, vec!["dup".to_string(), "dup".to_string()]);
	assert_eq!(metadata.definitions.len(), 1);
	assert_eq!(metadata.errors.len(), 1);
	assert_eq!(metadata.errors[0].kind, TemplateErrorKind::DuplicateDefinition);
	assert_eq!(metadata.content_hash.len(), 64);
	assert!(metadata.matches_fingerprint(42, 7));
}

#[test]
fn cache_data_round_trips_through_json() -> MdckResult<()> {
	let mut data = CacheData::empty("/project");
	assert_eq!(CacheData::from_json(&data.to_json()?)?, data);

	let file = extract_from_content("cycle.md", THREE_CYCLE, 10, 20);
	for definition in &file.definitions {
		data.templates.insert(definition.id.clone(), definition.clone());
	}
	data.dependencies = DependencyGraph::from_dependencies(
		file.definitions
			.iter()
			.map(|definition| (definition.id.as_str(), definition.dependencies.as_slice())),
	);
	data.files.insert(file.path.clone(), file);
	data.files
		.insert("dup.md".into(), extract_from_content("dup.md", DUPLICATE_DEFINITIONS, 1, 2));

	assert!(data.dependencies.has_cycles());
	assert_eq!(CacheData::from_json(&data.to_json()?)?, data);

	Ok(())
}

#[tokio::test]
async fn rebuild_scans_markdown_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "docs/a.md", ":::template{id=\"a\"}\n::template{id=\"b\"}\n:::\n");
	write_file(tmp.path(), "docs/b.markdown", ":::template{id=\"b\"}\nbody\n:::\n");
	write_file(tmp.path(), "node_modules/pkg/readme.md", ":::template{id=\"n\"}\nn\n:::\n");
	write_file(tmp.path(), ".hidden/notes.md", ":::template{id=\"h\"}\nh\n:::\n");
	write_file(tmp.path(), "notes.txt", ":::template{id=\"t\"}\nt\n:::\n");
	write_file(tmp.path(), ".gitignore", "ignored.md\n");
	write_file(tmp.path(), "ignored.md", ":::template{id=\"i\"}\ni\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	let data = manager.rebuild_cache().await?;

	assert_eq!(
		data.files.keys().cloned().collect::<Vec<_>>(),
		vec!["docs/a.md".to_string(), "docs/b.markdown".to_string()]
	);
	assert_eq!(
		data.templates.keys().cloned().collect::<Vec<_>>(),
		vec!["a".to_string(), "b".to_string()]
	);
	assert_eq!(data.templates["a"].file_path, "docs/a.md");
	assert_eq!(
		data.dependencies.dependencies_of("a").cloned().collect::<Vec<_>>(),
		vec!["b".to_string()]
	);
	assert!(manager.cache_path().is_file());
	assert!(manager.cache_path().ends_with(".mdck/.cache/metadata.json"));

	Ok(())
}

#[tokio::test]
async fn rebuild_keeps_first_of_cross_file_duplicates() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"dup\"}\nfrom a\n:::\n");
	write_file(tmp.path(), "b.md", ":::template{id=\"dup\"}\nfrom b\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	let data = manager.rebuild_cache().await?;

	assert_eq!(data.templates["dup"].file_path, "a.md");
	assert!(data.files["a.md"].errors.is_empty());
	let errors = &data.files["b.md"].errors;
	assert_eq!(errors.len(), 1);
	assert_eq!(errors[0].kind, TemplateErrorKind::DuplicateDefinition);
	assert_eq!(errors[0].detail("firstFile"), Some("a.md"));

	Ok(())
}

#[tokio::test]
async fn rebuild_detects_global_cycles() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\n::template{id=\"b\"}\n:::\n");
	write_file(tmp.path(), "b.md", ":::template{id=\"b\"}\n::template{id=\"c\"}\n:::\n");
	write_file(tmp.path(), "c.md", ":::template{id=\"c\"}\n::template{id=\"a\"}\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	let info = {
		manager.rebuild_cache().await?;
		manager.cache_info().await?
	};

	assert_eq!(info.file_count, 3);
	assert_eq!(info.template_count, 3);
	assert_eq!(info.edge_count, 3);
	assert_eq!(info.cycles.len(), 1);
	for id in ["a", "b", "c"] {
		assert!(info.cycles[0].iter().any(|entry| entry == id));
	}

	Ok(())
}

#[tokio::test]
async fn refresh_replaces_changed_definitions() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "f.md", ":::template{id=\"T\"}\nbody\n:::\n");
	write_file(tmp.path(), "other.md", "# Other\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	write_file(tmp.path(), "f.md", ":::template{id=\"T2\"}\nnew body\n:::\n");
	let result = manager.refresh_cache(None).await?;

	assert_eq!(result.updated_files, vec!["f.md".to_string()]);
	assert!(result.added_files.is_empty());
	assert!(result.removed_files.is_empty());

	let data = manager.get_cache_data().await?;
	assert!(!data.templates.contains_key("T"));
	assert!(data.templates.contains_key("T2"));

	Ok(())
}

#[tokio::test]
async fn refresh_from_persisted_snapshot() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "f.md", ":::template{id=\"T\"}\nbody\n:::\n");
	CacheManager::new(tmp.path()).rebuild_cache().await?;

	write_file(tmp.path(), "f.md", ":::template{id=\"T2\"}\nchanged body\n:::\n");
	let mut manager = CacheManager::new(tmp.path());
	let result = manager.refresh_cache(None).await?;

	assert_eq!(result.updated_files, vec!["f.md".to_string()]);
	assert!(manager.get_cache_data().await?.templates.contains_key("T2"));

	Ok(())
}

#[tokio::test]
async fn refresh_tracks_added_and_removed_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let gone = write_file(tmp.path(), "gone.md", ":::template{id=\"gone\"}\nx\n:::\n");
	write_file(tmp.path(), "kept.md", "# Kept\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	std::fs::remove_file(&gone)?;
	write_file(tmp.path(), "new.md", ":::template{id=\"new\"}\ny\n:::\n");
	let result = manager.refresh_cache(None).await?;

	assert_eq!(result.added_files, vec!["new.md".to_string()]);
	assert_eq!(result.removed_files, vec!["gone.md".to_string()]);
	assert!(result.updated_files.is_empty());
	assert!(result.has_changes());

	let data = manager.get_cache_data().await?;
	assert!(!data.templates.contains_key("gone"));
	assert!(data.templates.contains_key("new"));

	let unchanged = manager.refresh_cache(None).await?;
	assert!(!unchanged.has_changes());

	Ok(())
}

#[tokio::test]
async fn refresh_reports_dependents_of_changed_templates() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"root\"}\n::template{id=\"leaf\"}\n:::\n");
	write_file(tmp.path(), "b.md", ":::template{id=\"leaf\"}\nold\n:::\n");
	write_file(tmp.path(), "c.md", ":::template{id=\"other\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	write_file(tmp.path(), "b.md", ":::template{id=\"leaf\"}\nnew leaf text\n:::\n");
	let result = manager.refresh_cache(None).await?;

	assert_eq!(result.updated_files, vec!["b.md".to_string()]);
	assert_eq!(
		result.affected_templates,
		BTreeSet::from(["leaf", "root"].map(ToString::to_string))
	);

	Ok(())
}

#[tokio::test]
async fn refresh_keeps_content_when_only_mtime_changes() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let path = write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	let touched = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
	std::fs::File::options()
		.write(true)
		.open(&path)?
		.set_modified(touched)?;

	let mut fresh = CacheManager::new(tmp.path());
	let result = fresh.refresh_cache(None).await?;
	assert!(result.updated_files.is_empty());
	assert!(result.affected_templates.is_empty());
	assert!(!result.has_changes());

	let persisted = fresh
		.read_persisted()
		.await?
		.unwrap_or_else(|| panic!("snapshot should be persisted"));
	assert_eq!(persisted.files["a.md"].modified_unix_ms, 1_000_000_000);

	let mut reloaded = CacheManager::new(tmp.path());
	let loaded = reloaded.get_cache_data().await?;
	assert_eq!(loaded.last_updated_unix_ms, persisted.last_updated_unix_ms);

	Ok(())
}

#[tokio::test]
async fn refresh_limited_to_target_files() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");
	write_file(tmp.path(), "b.md", ":::template{id=\"b\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	write_file(tmp.path(), "a.md", ":::template{id=\"a2\"}\nx\n:::\n");
	write_file(tmp.path(), "b.md", ":::template{id=\"b2\"}\nx\n:::\n");
	let targets = [PathBuf::from("a.md")];
	let result = manager.refresh_cache(Some(targets.as_slice())).await?;

	assert_eq!(result.updated_files, vec!["a.md".to_string()]);
	let data = manager.get_cache_data().await?;
	assert!(data.templates.contains_key("a2"));
	assert!(data.templates.contains_key("b"));

	Ok(())
}

#[rstest]
#[case::version_mismatch(false)]
#[case::corrupt(true)]
#[tokio::test]
async fn invalid_snapshots_are_rebuilt(#[case] corrupt: bool) -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	let cache_path = manager.cache_path();
	if corrupt {
		std::fs::write(&cache_path, "{ not json")?;
	} else {
		let json = std::fs::read_to_string(&cache_path)?;
		std::fs::write(&cache_path, json.replace("\"1.0.0\"", "\"0.0.1\""))?;
	}

	let mut fresh = CacheManager::new(tmp.path());
	let data = fresh.get_cache_data().await?;
	assert_eq!(data.version, CACHE_VERSION);
	assert!(data.templates.contains_key("a"));

	let persisted = fresh
		.read_persisted()
		.await?
		.unwrap_or_else(|| panic!("snapshot should be persisted"));
	assert_eq!(persisted.version, CACHE_VERSION);

	Ok(())
}

#[tokio::test]
async fn valid_snapshot_is_loaded_without_rebuild() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	let built = manager.rebuild_cache().await?.clone();

	let mut fresh = CacheManager::new(tmp.path());
	let loaded = fresh.get_cache_data().await?;
	assert_eq!(loaded.last_updated_unix_ms, built.last_updated_unix_ms);
	assert_eq!(loaded, &built);

	Ok(())
}

#[tokio::test]
async fn snapshot_with_added_file_is_rebuilt() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	write_file(tmp.path(), "b.md", "::template{id=\"missing\"}\n");

	let mut fresh = CacheManager::new(tmp.path());
	let data = fresh.get_cache_data().await?;
	assert_eq!(
		data.files.keys().cloned().collect::<Vec<_>>(),
		vec!["a.md".to_string(), "b.md".to_string()]
	);

	Ok(())
}

#[tokio::test]
async fn snapshot_with_modified_file_is_rebuilt() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	write_file(tmp.path(), "a.md", ":::template{id=\"renamed\"}\nlonger body\n:::\n");

	let mut fresh = CacheManager::new(tmp.path());
	let data = fresh.get_cache_data().await?;
	assert!(data.templates.contains_key("renamed"));
	assert!(!data.templates.contains_key("a"));

	Ok(())
}

#[tokio::test]
async fn snapshot_with_deleted_file_is_rebuilt() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");
	let gone = write_file(tmp.path(), "gone.md", ":::template{id=\"gone\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	std::fs::remove_file(&gone)?;

	let mut fresh = CacheManager::new(tmp.path());
	let data = fresh.get_cache_data().await?;
	assert!(!data.files.contains_key("gone.md"));
	assert!(!data.templates.contains_key("gone"));
	assert!(data.templates.contains_key("a"));

	Ok(())
}

#[tokio::test]
async fn expired_snapshot_is_rebuilt() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", ":::template{id=\"a\"}\nx\n:::\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;

	let mut expired = manager
		.read_persisted()
		.await?
		.unwrap_or_else(|| panic!("snapshot should be persisted"));
	expired.last_updated_unix_ms = 0;
	std::fs::write(manager.cache_path(), expired.to_json()?)?;

	let mut fresh = CacheManager::new(tmp.path());
	let data = fresh.get_cache_data().await?;
	assert!(data.last_updated_unix_ms > 0);
	assert!(data.templates.contains_key("a"));

	Ok(())
}

#[tokio::test]
async fn clear_removes_persisted_snapshot() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "a.md", "# A\n");

	let mut manager = CacheManager::new(tmp.path());
	manager.rebuild_cache().await?;
	assert!(manager.cache_path().is_file());

	manager.clear_cache().await?;
	assert!(!manager.cache_path().exists());
	assert!(manager.read_persisted().await?.is_none());
	manager.clear_cache().await?;

	Ok(())
}

#[tokio::test]
async fn discovery_applies_exclude_patterns() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(tmp.path(), "docs/a.md", "# A\n");
	write_file(tmp.path(), "vendor/b.md", "# B\n");
	write_file(tmp.path(), "c.generated.md", "# C\n");

	let options = CacheOptions {
		exclude: vec!["vendor/".into(), "*.generated.md".into()],
		..CacheOptions::default()
	};
	let manager = CacheManager::with_options(tmp.path(), options);
	let files = manager.discover_files().await?;

	assert_eq!(files, vec![normalize_path(&tmp.path().join("docs/a.md"))]);

	Ok(())
}

async fn lint_content(engine: &RuleEngine, content: &str) -> LintReport {
	engine.lint(LintContext::new(parse(content))).await
}

fn default_engine(config: LintConfig) -> RuleEngine {
	RuleEngine::with_default_rules(Arc::new(FileResolver::new()), config)
}

#[tokio::test]
async fn clean_document_has_no_findings() {
	let report = lint_content(&default_engine(LintConfig::default()), CLEAN_DOCUMENT).await;

	assert!(report.results.is_empty());
	assert_eq!(report.error_count, 0);
	assert!(!report.has_errors());
}

#[tokio::test]
async fn circular_reference_reported_once() {
	let report = lint_content(&default_engine(LintConfig::default()), THREE_CYCLE).await;

	assert_eq!(report.results.len(), 1);
	let result = &report.results[0];
	assert_eq!(result.rule_id, "M004");
	assert_eq!(result.severity, Severity::Error);
	assert!(result.message.contains("Circular reference detected"));
	for id in ["a", "b", "c"] {
		assert!(result.message.contains(id));
	}
	assert_eq!(result.line, 1);
	assert_eq!(report.error_count, 1);
}

#[tokio::test]
async fn duplicates_and_undefined_references_are_reported() {
	let content = format!("{DUPLICATE_DEFINITIONS}\n::template{{id=\"missing\"}}\n\n::template{{id=\"missing\"}}\n");
	let report = lint_content(&default_engine(LintConfig::default()), &content).await;

	let ids: Vec<&str> = report.results.iter().map(|result| result.rule_id.as_str()).collect();
	assert_eq!(ids, vec!["M002", "M003", "M003"]);

	let duplicate = &report.results[0];
	assert_eq!(
		duplicate.message,
		"Duplicate template definition: \"dup\" (first defined at line 1)"
	);
	assert_eq!(duplicate.line, 5);

	let undefined = &report.results[1];
	assert_eq!(undefined.message, "Undefined template reference: \"missing\"");
	assert_eq!(
		undefined.details.get("referenceType"),
		Some(&serde_json::json!("local"))
	);
	assert_eq!(report.error_count, 3);
}

#[tokio::test]
async fn severity_overrides_apply_after_checks() {
	let mut config = LintConfig::default();
	config.set_severity("M003", Severity::Warn);
	let report = lint_content(&default_engine(config), "::template{id=\"missing\"}\n").await;

	assert_eq!(report.results.len(), 1);
	assert_eq!(report.results[0].severity, Severity::Warn);
	assert_eq!(report.error_count, 0);
	assert_eq!(report.warning_count, 1);
}

#[tokio::test]
async fn disabled_rules_do_not_run() {
	let mut config = LintConfig::default();
	config.set_enabled("M004", false);
	let report = lint_content(&default_engine(config), THREE_CYCLE).await;

	assert!(report.results.is_empty());
}

#[derive(Debug)]
struct PanickingRule;

impl Rule for PanickingRule {
	fn id(&self) -> &'static str {
		"X999"
	}

	fn description(&self) -> &'static str {
		"always panics"
	}

	fn default_severity(&self) -> Severity {
		Severity::Error
	}

	fn check(&self, _context: &RuleContext) -> Vec<LintResult> {
		panic!("rule exploded");
	}
}

#[tokio::test]
#[traced_test]
async fn panicking_rule_contributes_nothing() {
	let mut engine = RuleEngine::new(Arc::new(FileResolver::new()), LintConfig::default());
	engine.register_rule(Arc::new(PanickingRule));
	engine.register_rule(Arc::new(DuplicateTemplateIdRule));

	let report = lint_content(&engine, DUPLICATE_DEFINITIONS).await;

	assert_eq!(report.results.len(), 1);
	assert_eq!(report.results[0].rule_id, "M002");
	assert!(logs_contain("lint rule failed"));
}

#[test]
fn default_engine_registers_builtin_rules() {
	let engine = default_engine(LintConfig::default());
	assert_eq!(engine.rule_ids().collect::<Vec<_>>(), BUILTIN_RULE_IDS.to_vec());
	assert!(engine.rule("M003").is_some());
}

#[tokio::test]
async fn lint_follows_external_sources() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let main = write_file(
		tmp.path(),
		"main.md",
		"::template{id=\"footer\" src=\"./shared/footer.md\"}\n\n::template{id=\"gone\" src=\"./missing.md\"}\n",
	);
	write_file(tmp.path(), "shared/footer.md", ":::template{id=\"footer\"}\nFooter\n:::\n");

	let engine = default_engine(LintConfig::default());
	let report = engine.lint_file(&main, Some(tmp.path())).await?;

	assert_eq!(report.results.len(), 1);
	let result = &report.results[0];
	assert_eq!(result.rule_id, "M003");
	assert_eq!(result.line, 3);
	assert_eq!(result.details.get("referenceType"), Some(&serde_json::json!("external")));
	assert_eq!(result.details.get("reason"), Some(&serde_json::json!("file-not-found")));
	assert_eq!(report.file_path.as_deref(), Some(main.as_path()));

	Ok(())
}

#[tokio::test]
async fn lint_reports_duplicates_across_sources() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	let main = write_file(
		tmp.path(),
		"main.md",
		":::template{id=\"dup\"}\nmain\n:::\n\n::template{id=\"other\" src=\"./other.md\"}\n",
	);
	write_file(
		tmp.path(),
		"other.md",
		":::template{id=\"other\"}\nx\n:::\n\n:::template{id=\"dup\"}\ny\n:::\n",
	);

	let report = default_engine(LintConfig::default())
		.lint_file(&main, None)
		.await?;

	assert_eq!(report.results.len(), 1);
	assert_eq!(report.results[0].rule_id, "M002");
	assert_eq!(report.results[0].line, 5);

	Ok(())
}

#[tokio::test]
async fn preprocess_shares_a_single_analysis() {
	let preprocessor = Preprocessor::default();
	let content = format!("{DUPLICATE_DEFINITIONS}\n{THREE_CYCLE}\n::template{{id=\"nowhere\"}}\n");
	let result = preprocessor.analyze(&LintContext::new(parse(&content))).await;

	assert_eq!(result.duplicates.len(), 1);
	assert_eq!(result.duplicates[0].locations.len(), 2);
	assert_eq!(result.undefined_references.len(), 1);
	assert_eq!(result.circular_references.len(), 1);
	assert_eq!(result.definitions.len(), 4);
	assert!(!result.is_success());
}

#[test]
fn lint_report_serializes_to_json() {
	let report = LintReport {
		file_path: Some(PathBuf::from("docs/a.md")),
		results: vec![],
		error_count: 0,
		warning_count: 0,
		info_count: 0,
		duration: std::time::Duration::from_secs(2),
		preprocess_duration: std::time::Duration::ZERO,
	};
	let value = serde_json::to_value(&report).unwrap_or_else(|e| panic!("serialize: {e}"));

	assert_eq!(value["filePath"], serde_json::json!("docs/a.md"));
	assert_eq!(value["duration"], serde_json::json!(2000.0));
	assert_eq!(value["preprocessDuration"], serde_json::json!(0.0));
	assert_eq!(value["errorCount"], serde_json::json!(0));
}

#[rstest]
#[case::error("error", Severity::Error)]
#[case::warn("warn", Severity::Warn)]
#[case::warning("warning", Severity::Warn)]
#[case::info("info", Severity::Info)]
fn parses_severity(#[case] input: &str, #[case] expected: Severity) -> MdckResult<()> {
	assert_eq!(input.parse::<Severity>()?, expected);
	Ok(())
}

#[test]
fn missing_config_returns_none() -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	assert!(MdckConfig::load(tmp.path())?.is_none());
	Ok(())
}

#[rstest]
#[case::root("mdck.toml")]
#[case::hidden(".mdck.toml")]
#[case::config_dir(".config/mdck.toml")]
fn loads_config_from_candidates(#[case] name: &str) -> MdckResult<()> {
	let tmp = tempfile::tempdir()?;
	write_file(
		tmp.path(),
		name,
		r#"exclude = ["vendor/"]

[lint.rules]
M002 = "warn"
M003 = "off"
M004 = { enabled = true, severity = "info" }

[cache]
max_age_secs = 60
max_concurrency = 4

[resolver]
restrict_to_root = true

[expansion]
max_depth = 8
"#,
	);

	let config = MdckConfig::load(tmp.path())?.unwrap_or_else(|| panic!("config should load"));
	let lint = config.lint_config()?;
	assert_eq!(lint.rule("M002").severity, Some(Severity::Warn));
	assert!(!lint.rule("M003").enabled);
	assert_eq!(lint.rule("M004").severity, Some(Severity::Info));
	assert_eq!(lint.rule("M005"), RuleConfig::default());

	let cache = config.cache_options();
	assert_eq!(cache.max_age, std::time::Duration::from_secs(60));
	assert_eq!(cache.max_concurrency, 4);
	assert_eq!(cache.cache_dir, PathBuf::from(DEFAULT_CACHE_DIR));
	assert_eq!(cache.exclude, vec!["vendor/".to_string()]);

	assert_eq!(
		config.resolver_options(tmp.path()).restrict_to_base,
		Some(tmp.path().to_path_buf())
	);
	assert_eq!(config.expansion_options().max_depth, 8);

	Ok(())
}

#[rstest]
#[case::bad_severity("[lint.rules]\nM002 = \"loud\"\n")]
#[case::bad_toml("[lint\n")]
#[case::unknown_section("[unknown]\nkey = 1\n")]
fn rejects_invalid_config(#[case] content: &str) {
	let result = MdckConfig::parse(content);
	assert!(matches!(
		result,
		Err(MdckError::ConfigParse(_) | MdckError::InvalidSeverity(_))
	));
}
