// SPDX-License-Identifier: GPL-3.0

//! The module collector.
//!
//! Resolves user code into the runtime's module manifest: either an explicit
//! module list, or an entrypoint whose static imports are walked
//! transitively. Rules map glob patterns to module kinds; reserved scheme
//! prefixes pass through untouched; anything dynamic fails fast with the
//! location of the offending specifier.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::{
	collections::{HashSet, VecDeque},
	path::{Component, Path, PathBuf},
};
use strum_macros::{Display, EnumString};
use thiserror::Error;

/// Specifier prefixes the runtime resolves itself.
const RESERVED_PREFIXES: [&str; 3] = ["node:", "cloudflare:", "workerd:"];

/// Node built-ins users habitually import bare.
const NODE_BUILTINS: [&str; 18] = [
	"assert", "buffer", "child_process", "crypto", "dns", "events", "fs", "http", "https",
	"net", "os", "path", "querystring", "stream", "tls", "url", "util", "zlib",
];

/// How a module's body is interpreted by the runtime.
#[derive(
	Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum ModuleKind {
	ESModule,
	CommonJS,
	NodeJsCompat,
	Text,
	Data,
	CompiledWasm,
	Json,
}

impl ModuleKind {
	fn is_javascript(&self) -> bool {
		matches!(self, ModuleKind::ESModule | ModuleKind::CommonJS | ModuleKind::NodeJsCompat)
	}

	fn scans_require(&self) -> bool {
		matches!(self, ModuleKind::CommonJS | ModuleKind::NodeJsCompat)
	}
}

/// A rule mapping glob patterns to a module kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleRule {
	pub kind: ModuleKind,
	pub include: Vec<String>,
}

/// The default rules: `.mjs` is ESM, `.js`/`.cjs` are CommonJS.
pub fn default_rules() -> Vec<ModuleRule> {
	vec![
		ModuleRule {
			kind: ModuleKind::ESModule,
			include: vec!["**/*.mjs".into(), "*.mjs".into()],
		},
		ModuleRule {
			kind: ModuleKind::CommonJS,
			include: vec![
				"**/*.js".into(),
				"*.js".into(),
				"**/*.cjs".into(),
				"*.cjs".into(),
			],
		},
	]
}

/// One entry of the runtime's module manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDef {
	/// Forward-slash logical name; what stack traces will show.
	pub name: String,
	pub kind: ModuleKind,
	pub data: Vec<u8>,
	pub source_map_id: Option<String>,
}

/// Errors raised while collecting modules.
#[derive(Debug, Error)]
pub enum ModuleError {
	/// A specifier was not a static string literal.
	#[error(
		"{path}:{line}:{column}: dynamic module specifiers are unsupported, specifiers must be string literals"
	)]
	DynamicSpec { path: String, line: u32, column: u32 },
	/// A resolved path matched no rule.
	#[error("no module rule matches `{path}` (imported from {referenced_by}){hint}")]
	NoRule {
		path: String,
		referenced_by: String,
		hint: String,
	},
	/// A rule's glob pattern failed to compile.
	#[error("invalid module rule pattern `{pattern}`: {message}")]
	Rule { pattern: String, message: String },
	/// A module body could not be read.
	#[error("failed to read module `{path}`: {source}")]
	Io {
		path: String,
		#[source]
		source: std::io::Error,
	},
	/// A text module was not valid UTF-8.
	#[error("module `{0}` is not valid UTF-8")]
	NotUtf8(String),
}

struct CompiledRule {
	kind: ModuleKind,
	patterns: Vec<Pattern>,
}

fn compile_rules(rules: &[ModuleRule]) -> Result<Vec<CompiledRule>, ModuleError> {
	rules
		.iter()
		.map(|rule| {
			let patterns = rule
				.include
				.iter()
				.map(|pattern| {
					Pattern::new(pattern).map_err(|e| ModuleError::Rule {
						pattern: pattern.clone(),
						message: e.to_string(),
					})
				})
				.collect::<Result<Vec<_>, _>>()?;
			Ok(CompiledRule { kind: rule.kind, patterns })
		})
		.collect()
}

fn match_rule(rules: &[CompiledRule], logical: &str) -> Option<ModuleKind> {
	// First matching rule wins.
	rules
		.iter()
		.find(|rule| rule.patterns.iter().any(|pattern| pattern.matches(logical)))
		.map(|rule| rule.kind)
}

/// Collapses `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for component in path.components() {
		match component {
			Component::CurDir => {},
			Component::ParentDir => {
				out.pop();
			},
			other => out.push(other.as_os_str()),
		}
	}
	out
}

/// The forward-slash logical name of `path` relative to `root`.
fn logical_name(path: &Path, root: &Path) -> String {
	let rel = path.strip_prefix(root).unwrap_or(path);
	rel.components()
		.map(|component| component.as_os_str().to_string_lossy())
		.collect::<Vec<_>>()
		.join("/")
}

fn builtin_hint(specifier: &str) -> String {
	let bare = Path::new(specifier)
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default();
	if NODE_BUILTINS.contains(&bare.as_str()) {
		format!("; `{bare}` looks like a Node built-in, import it as `node:{bare}`")
	} else {
		String::new()
	}
}

/// Collects the module manifest rooted at `entry_path`.
///
/// # Arguments
/// * `entry_path` - The entrypoint; relative specifiers resolve from here.
/// * `entry_source` - Inline source overriding the file's contents.
/// * `rules` - Rules tried in order before [`default_rules`].
/// * `modules_root` - Root directory for logical names.
pub fn collect_modules(
	entry_path: &Path,
	entry_source: Option<&str>,
	rules: &[ModuleRule],
	modules_root: &Path,
) -> Result<Vec<ModuleDef>, ModuleError> {
	let mut all_rules = rules.to_vec();
	all_rules.extend(default_rules());
	let compiled = compile_rules(&all_rules)?;

	let mut manifest = Vec::new();
	let mut visited: HashSet<PathBuf> = HashSet::new();
	let mut queue: VecDeque<(PathBuf, Option<String>, String)> = VecDeque::new();
	queue.push_back((
		normalize(entry_path),
		entry_source.map(str::to_string),
		"<entry>".to_string(),
	));

	while let Some((path, inline, referenced_by)) = queue.pop_front() {
		if !visited.insert(path.clone()) {
			continue;
		}
		let logical = logical_name(&path, modules_root);
		let Some(kind) = match_rule(&compiled, &logical) else {
			return Err(ModuleError::NoRule {
				path: logical,
				referenced_by,
				hint: builtin_hint(&path.to_string_lossy()),
			});
		};

		let data = match &inline {
			Some(source) => source.clone().into_bytes(),
			None => std::fs::read(&path).map_err(|source| ModuleError::Io {
				path: logical.clone(),
				source,
			})?,
		};

		if kind.is_javascript() {
			let source = std::str::from_utf8(&data)
				.map_err(|_| ModuleError::NotUtf8(logical.clone()))?;
			let specifiers =
				scan_specifiers(source, kind.scans_require()).map_err(|at| {
					ModuleError::DynamicSpec {
						path: logical.clone(),
						line: at.line,
						column: at.column,
					}
				})?;
			let parent = path.parent().unwrap_or(Path::new("")).to_path_buf();
			for specifier in specifiers {
				if RESERVED_PREFIXES
					.iter()
					.any(|prefix| specifier.value.starts_with(prefix))
				{
					continue;
				}
				let resolved = if Path::new(&specifier.value).is_absolute() {
					normalize(Path::new(&specifier.value))
				} else {
					normalize(&parent.join(&specifier.value))
				};
				if !visited.contains(&resolved) {
					queue.push_back((resolved, None, logical.clone()));
				}
			}
		} else if kind == ModuleKind::Text && std::str::from_utf8(&data).is_err() {
			return Err(ModuleError::NotUtf8(logical.clone()));
		}

		manifest.push(ModuleDef { name: logical, kind, data, source_map_id: None });
	}
	Ok(manifest)
}

/// Position of a dynamic (non-literal) specifier.
#[derive(Debug)]
pub(crate) struct DynamicAt {
	pub line: u32,
	pub column: u32,
}

#[derive(Debug)]
pub(crate) struct Specifier {
	pub value: String,
	#[allow(dead_code)]
	pub line: u32,
	#[allow(dead_code)]
	pub column: u32,
}

struct Scanner {
	chars: Vec<char>,
	pos: usize,
	line: u32,
	column: u32,
}

impl Scanner {
	fn new(source: &str) -> Self {
		Self { chars: source.chars().collect(), pos: 0, line: 1, column: 1 }
	}

	fn peek(&self) -> Option<char> {
		self.chars.get(self.pos).copied()
	}

	fn peek_at(&self, offset: usize) -> Option<char> {
		self.chars.get(self.pos + offset).copied()
	}

	fn bump(&mut self) -> Option<char> {
		let c = self.peek()?;
		self.pos += 1;
		if c == '\n' {
			self.line += 1;
			self.column = 1;
		} else {
			self.column += 1;
		}
		Some(c)
	}

	/// Consumes a quoted string, returning its contents.
	fn string_literal(&mut self, quote: char) -> String {
		let mut value = String::new();
		while let Some(c) = self.bump() {
			if c == '\\' {
				if let Some(escaped) = self.bump() {
					value.push(escaped);
				}
				continue;
			}
			if c == quote {
				break;
			}
			value.push(c);
		}
		value
	}

	/// Consumes a template literal wholesale.
	fn template_literal(&mut self) {
		while let Some(c) = self.bump() {
			match c {
				'\\' => {
					self.bump();
				},
				'`' => break,
				_ => {},
			}
		}
	}

	/// Skips whitespace and comments.
	fn skip_trivia(&mut self) {
		loop {
			match self.peek() {
				Some(c) if c.is_whitespace() => {
					self.bump();
				},
				Some('/') if self.peek_at(1) == Some('/') => {
					while let Some(c) = self.bump() {
						if c == '\n' {
							break;
						}
					}
				},
				Some('/') if self.peek_at(1) == Some('*') => {
					self.bump();
					self.bump();
					while let Some(c) = self.bump() {
						if c == '*' && self.peek() == Some('/') {
							self.bump();
							break;
						}
					}
				},
				_ => break,
			}
		}
	}

	fn identifier(&mut self, first: char) -> String {
		let mut word = String::new();
		word.push(first);
		while let Some(c) = self.peek() {
			if c.is_alphanumeric() || c == '_' || c == '$' {
				word.push(c);
				self.bump();
			} else {
				break;
			}
		}
		word
	}
}

/// Scans static `import`/`export ... from` declarations and (optionally)
/// literal `require(...)` calls. Non-literal specifiers fail with their
/// position.
pub(crate) fn scan_specifiers(
	source: &str,
	allow_require: bool,
) -> Result<Vec<Specifier>, DynamicAt> {
	let mut scanner = Scanner::new(source);
	let mut specifiers = Vec::new();

	while let Some(c) = scanner.peek() {
		match c {
			'\'' | '"' => {
				scanner.bump();
				scanner.string_literal(c);
			},
			'`' => {
				scanner.bump();
				scanner.template_literal();
			},
			'/' if scanner.peek_at(1) == Some('/') || scanner.peek_at(1) == Some('*') => {
				scanner.skip_trivia();
			},
			c if c.is_alphabetic() || c == '_' || c == '$' => {
				let line = scanner.line;
				let column = scanner.column;
				scanner.bump();
				let word = scanner.identifier(c);
				match word.as_str() {
					"import" => {
						if let Some(specifier) =
							scan_import(&mut scanner, line, column)?
						{
							specifiers.push(specifier);
						}
					},
					"export" => {
						if let Some(specifier) = scan_export(&mut scanner) {
							specifiers.push(specifier);
						}
					},
					"require" if allow_require => {
						if let Some(specifier) =
							scan_require(&mut scanner, line, column)?
						{
							specifiers.push(specifier);
						}
					},
					_ => {},
				}
			},
			_ => {
				scanner.bump();
			},
		}
	}
	Ok(specifiers)
}

fn scan_import(
	scanner: &mut Scanner,
	line: u32,
	column: u32,
) -> Result<Option<Specifier>, DynamicAt> {
	scanner.skip_trivia();
	match scanner.peek() {
		// `import.meta`.
		Some('.') => Ok(None),
		// Dynamic import: only literal arguments are supported.
		Some('(') => {
			scanner.bump();
			scanner.skip_trivia();
			match scanner.peek() {
				Some(quote @ ('\'' | '"')) => {
					scanner.bump();
					let value = scanner.string_literal(quote);
					Ok(Some(Specifier { value, line, column }))
				},
				_ => Err(DynamicAt { line: scanner.line, column: scanner.column }),
			}
		},
		// Side-effect import: `import "x"`.
		Some(quote @ ('\'' | '"')) => {
			scanner.bump();
			let value = scanner.string_literal(quote);
			Ok(Some(Specifier { value, line, column }))
		},
		// `import defaultExport, { named } from "x"`.
		_ => Ok(scan_from_clause(scanner)),
	}
}

fn scan_export(scanner: &mut Scanner) -> Option<Specifier> {
	scan_from_clause(scanner)
}

/// Walks tokens until a `from "specifier"` clause or a statement boundary.
fn scan_from_clause(scanner: &mut Scanner) -> Option<Specifier> {
	loop {
		scanner.skip_trivia();
		match scanner.peek()? {
			';' | '=' | '(' => return None,
			quote @ ('\'' | '"') => {
				// A bare string here cannot be a specifier (no `from`); skip.
				scanner.bump();
				scanner.string_literal(quote);
			},
			c if c.is_alphabetic() || c == '_' || c == '$' => {
				let line = scanner.line;
				let column = scanner.column;
				scanner.bump();
				let word = scanner.identifier(c);
				if word == "from" {
					scanner.skip_trivia();
					if let Some(quote @ ('\'' | '"')) = scanner.peek() {
						scanner.bump();
						let value = scanner.string_literal(quote);
						return Some(Specifier { value, line, column });
					}
					return None;
				}
				// `export function f() {}` and friends end the clause.
				if matches!(word.as_str(), "function" | "class" | "const" | "let" | "var" | "async" | "default") {
					return None;
				}
			},
			_ => {
				scanner.bump();
			},
		}
	}
}

fn scan_require(
	scanner: &mut Scanner,
	line: u32,
	column: u32,
) -> Result<Option<Specifier>, DynamicAt> {
	scanner.skip_trivia();
	if scanner.peek() != Some('(') {
		// `require` used as a plain identifier.
		return Ok(None);
	}
	scanner.bump();
	scanner.skip_trivia();
	match scanner.peek() {
		Some(quote @ ('\'' | '"')) => {
			scanner.bump();
			let value = scanner.string_literal(quote);
			Ok(Some(Specifier { value, line, column }))
		},
		_ => Err(DynamicAt { line: scanner.line, column: scanner.column }),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn values(source: &str, allow_require: bool) -> Vec<String> {
		scan_specifiers(source, allow_require)
			.unwrap()
			.into_iter()
			.map(|specifier| specifier.value)
			.collect()
	}

	#[test]
	fn static_imports_are_found() {
		let source = r#"
			import defaultExport from "./a.mjs";
			import { named, other } from './b.mjs';
			import * as ns from "./c.mjs";
			import "./side-effect.mjs";
			export { thing } from "./d.mjs";
			export * from "./e.mjs";
		"#;
		assert_eq!(
			values(source, false),
			vec!["./a.mjs", "./b.mjs", "./c.mjs", "./side-effect.mjs", "./d.mjs", "./e.mjs"]
		);
	}

	#[test]
	fn dynamic_import_with_literal_passes() {
		assert_eq!(values(r#"const m = await import("./lazy.mjs");"#, false), vec![
			"./lazy.mjs"
		]);
	}

	#[test]
	fn dynamic_import_with_expression_fails_with_position() {
		let error = scan_specifiers("\nconst m = await import(name);", false).unwrap_err();
		assert_eq!(error.line, 2);
	}

	#[test]
	fn require_literals_are_found_in_commonjs() {
		let source = r#"const a = require("./a.cjs"); const b = require('./b.cjs');"#;
		assert_eq!(values(source, true), vec!["./a.cjs", "./b.cjs"]);
		// ESM scanning ignores require entirely.
		assert!(values(source, false).is_empty());
	}

	#[test]
	fn non_literal_require_fails() {
		assert!(scan_specifiers("require(path)", true).is_err());
	}

	#[test]
	fn strings_and_comments_hide_keywords() {
		let source = r#"
			// import "./commented.mjs";
			/* import "./blocked.mjs"; */
			const s = "import './quoted.mjs'";
			const t = `import "./templated.mjs"`;
			import "./real.mjs";
		"#;
		assert_eq!(values(source, false), vec!["./real.mjs"]);
	}

	#[test]
	fn import_meta_is_ignored() {
		assert!(values("const u = import.meta.url;", false).is_empty());
	}

	#[test]
	fn plain_exports_produce_nothing() {
		let source = r#"
			export const x = 1;
			export function f() { return 2; }
			export default class {}
		"#;
		assert!(values(source, false).is_empty());
	}

	fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
		let path = dir.join(rel);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(&path, contents).unwrap();
		path
	}

	#[test]
	fn entrypoint_graph_is_walked() {
		let dir = tempfile::tempdir().unwrap();
		let entry = write(
			dir.path(),
			"index.mjs",
			r#"import "./lib/util.mjs"; import "node:buffer";"#,
		);
		write(dir.path(), "lib/util.mjs", r#"import "../index.mjs";"#);

		let manifest = collect_modules(&entry, None, &[], dir.path()).unwrap();
		let names: Vec<&str> = manifest.iter().map(|m| m.name.as_str()).collect();
		// The cycle terminates and logical names use forward slashes.
		assert_eq!(names, vec!["index.mjs", "lib/util.mjs"]);
		assert!(manifest.iter().all(|m| m.kind == ModuleKind::ESModule));
	}

	#[test]
	fn rules_assign_kinds_in_order() {
		let dir = tempfile::tempdir().unwrap();
		let entry = write(
			dir.path(),
			"index.mjs",
			r#"import "./data.bin"; import "./doc.txt";"#,
		);
		write(dir.path(), "data.bin", "binary");
		write(dir.path(), "doc.txt", "text");

		let rules = vec![
			ModuleRule { kind: ModuleKind::Data, include: vec!["**/*.bin".into(), "*.bin".into()] },
			ModuleRule { kind: ModuleKind::Text, include: vec!["**/*.txt".into(), "*.txt".into()] },
		];
		let manifest = collect_modules(&entry, None, &rules, dir.path()).unwrap();
		let kinds: Vec<ModuleKind> = manifest.iter().map(|m| m.kind).collect();
		assert_eq!(kinds, vec![ModuleKind::ESModule, ModuleKind::Data, ModuleKind::Text]);
	}

	#[test]
	fn unmatched_paths_fail_with_the_referencing_module() {
		let dir = tempfile::tempdir().unwrap();
		let entry = write(dir.path(), "index.mjs", r#"import "./styles.css";"#);

		let error = collect_modules(&entry, None, &[], dir.path()).unwrap_err();
		assert!(matches!(
			error,
			ModuleError::NoRule { path, referenced_by, .. }
				if path == "styles.css" && referenced_by == "index.mjs"
		));
	}

	#[test]
	fn bare_builtins_get_a_hint() {
		let dir = tempfile::tempdir().unwrap();
		let entry = write(dir.path(), "index.mjs", r#"import fs from "fs";"#);

		let error = collect_modules(&entry, None, &[], dir.path()).unwrap_err();
		assert!(matches!(
			error,
			ModuleError::NoRule { hint, .. } if hint.contains("node:fs")
		));
	}

	#[test]
	fn dynamic_specifiers_cite_the_module() {
		let dir = tempfile::tempdir().unwrap();
		let entry = write(dir.path(), "index.mjs", "\nawait import(target);\n");

		let error = collect_modules(&entry, None, &[], dir.path()).unwrap_err();
		assert!(matches!(
			error,
			ModuleError::DynamicSpec { path, line: 2, .. } if path == "index.mjs"
		));
	}

	#[test]
	fn inline_entry_source_overrides_the_file() {
		let dir = tempfile::tempdir().unwrap();
		let entry = dir.path().join("index.mjs");

		let manifest =
			collect_modules(&entry, Some("export default {}"), &[], dir.path()).unwrap();
		assert_eq!(manifest.len(), 1);
		assert_eq!(manifest[0].data, b"export default {}");
	}
}
