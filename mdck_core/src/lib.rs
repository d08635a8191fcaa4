//! `mdck_core` is the core library for `mdck`, a checker and expander for
//! template directives embedded in Markdown. Reusable fragments are defined
//! once in `:::template{id="..."}` blocks and referenced anywhere with
//! `::template{id="..."}`, optionally from another file through a `src`
//! attribute.
//!
//! ## Processing Pipeline
//!
//! ```text
//! Markdown file
//!   -> AST provider (markdown + directive syntax into a generic Node tree)
//!   -> Directive extractor (flat records of template / tag / result directives)
//!   -> Template graph builder (definitions, references, dependencies, expansion)
//!   -> File resolver (follows `src` references, memoizing parsed files)
//!   -> Metadata cache (project-wide snapshot with a global dependency graph)
//!   -> Lint preprocessor + rule engine (M002, M003, M004)
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Configuration loading from `mdck.toml`.
//! - [`cache`] - The persisted project metadata snapshot and file discovery.
//! - [`rules`] - The built-in lint rules.
//!
//! ## Key Types
//!
//! - [`Node`] - A node of the parsed Markdown tree.
//! - [`TemplateDefinition`] - A named, content-bearing template block.
//! - [`TemplateExpander`] - Expands a template id into its fully substituted
//!   node sequence.
//! - [`FileResolver`] - Resolves and memoizes `src` files.
//! - [`CacheManager`] - Loads, validates, rebuilds and refreshes the
//!   metadata snapshot.
//! - [`RuleEngine`] - Runs lint rules against one shared
//!   [`PreprocessResult`].
//!
//! ## Syntax
//!
//! ```markdown
//! :::template{id="greeting"}
//! Hello from a reusable block.
//! ::template{id="signature"}
//! :::
//!
//! ::template{id="greeting"}
//! ::template{id="footer" src="./shared/footer.md"}
//! ```

pub use ast::*;
pub use attributes::*;
pub use cache::*;
pub use config::*;
pub use directive::*;
pub use error::*;
pub use graph::*;
pub use lint::*;
pub use metadata::*;
pub use position::*;
pub use preprocess::*;
pub use resolver::*;
pub use rules::*;
pub use template::*;

mod ast;
mod attributes;
pub mod cache;
pub mod config;
mod directive;
#[allow(unused_assignments)]
mod error;
mod graph;
mod lint;
mod metadata;
mod position;
mod preprocess;
mod resolver;
pub mod rules;
mod template;

#[cfg(test)]
mod __fixtures;
#[cfg(test)]
mod __tests;
