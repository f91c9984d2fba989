//! Marker attribute names, derived once per page from a configurable prefix.

use std::rc::Rc;
use tracing::{debug, instrument, warn};

/// Used when neither the page configuration nor an injected tag names a prefix.
pub const DEFAULT_PREFIX: &str = "data-dm";

/// Name of the `<meta>` tag the instrumentation may inject to announce its prefix.
pub const PREFIX_META_NAME: &str = "design-mode-prefix";

/// Where a page announces its marker prefix.
pub trait PrefixSource {
	/// A prefix set in the page's global configuration object.
	fn configured_prefix(&self) -> Option<String>;
	/// A prefix announced by an injected tag.
	fn injected_prefix(&self) -> Option<String>;
}

/// A fixed prefix, for hosts that know it up front.
impl PrefixSource for Option<String> {
	fn configured_prefix(&self) -> Option<String> {
		self.clone()
	}

	fn injected_prefix(&self) -> Option<String> {
		None
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NamespaceError {
	#[error("marker prefix is empty")]
	Empty,
	#[error("marker prefix {0:?} contains characters outside `[a-z0-9-]`")]
	InvalidCharacter(String),
}

/// The resolved marker vocabulary of one page.
///
/// Resolve it once and pass it by reference; attribute names are precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
	prefix: String,
	file: String,
	line: String,
	column: String,
	source: String,
	element_id: String,
	file_type: String,
	static_content: String,
	static_class: String,
	children_source: String,
	ignore_mutation: String,
}

impl Namespace {
	/// Builds the vocabulary for `prefix`, adding a `data-` head if it is missing.
	///
	/// # Errors
	///
	/// Iff the prefix is empty or not a valid attribute-name fragment.
	pub fn new(prefix: &str) -> Result<Self, NamespaceError> {
		let prefix = prefix.trim().trim_end_matches('-').to_ascii_lowercase();
		if prefix.is_empty() || prefix == "data" {
			return Err(NamespaceError::Empty);
		}
		if !prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
			return Err(NamespaceError::InvalidCharacter(prefix));
		}
		let prefix = if prefix.starts_with("data-") { prefix } else { format!("data-{}", prefix) };
		let name = |suffix: &str| format!("{}-{}", prefix, suffix);
		Ok(Self {
			file: name("file"),
			line: name("line"),
			column: name("column"),
			source: name("source"),
			element_id: name("id"),
			file_type: name("file-type"),
			static_content: name("static-content"),
			static_class: name("static-class"),
			children_source: name("children-source"),
			ignore_mutation: name("ignore-mutation"),
			prefix,
		})
	}

	/// Picks the first valid prefix from `source`, in order: configured, injected, [`DEFAULT_PREFIX`].
	#[instrument(skip(source))]
	pub fn resolve(source: &dyn PrefixSource) -> Self {
		for (origin, candidate) in [("configuration", source.configured_prefix()), ("injected tag", source.injected_prefix())] {
			if let Some(candidate) = candidate {
				match Self::new(&candidate) {
					Ok(namespace) => {
						debug!("Using marker prefix {:?} from {}.", namespace.prefix, origin);
						return namespace;
					}
					Err(error) => warn!("Ignoring marker prefix from {}: {}", origin, error),
				}
			}
		}
		Self::default()
	}

	#[must_use]
	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	#[must_use]
	pub fn file(&self) -> &str {
		&self.file
	}

	#[must_use]
	pub fn line(&self) -> &str {
		&self.line
	}

	#[must_use]
	pub fn column(&self) -> &str {
		&self.column
	}

	/// The structured marker: a JSON [`SourceLocation`](crate::source::SourceLocation).
	#[must_use]
	pub fn source(&self) -> &str {
		&self.source
	}

	#[must_use]
	pub fn element_id(&self) -> &str {
		&self.element_id
	}

	#[must_use]
	pub fn file_type(&self) -> &str {
		&self.file_type
	}

	#[must_use]
	pub fn static_content(&self) -> &str {
		&self.static_content
	}

	#[must_use]
	pub fn static_class(&self) -> &str {
		&self.static_class
	}

	#[must_use]
	pub fn children_source(&self) -> &str {
		&self.children_source
	}

	/// Present on a node while the update pipeline itself writes to it.
	#[must_use]
	pub fn ignore_mutation(&self) -> &str {
		&self.ignore_mutation
	}
}

impl Default for Namespace {
	fn default() -> Self {
		match Self::new(DEFAULT_PREFIX) {
			Ok(namespace) => namespace,
			Err(error) => unreachable!("default marker prefix rejected: {}", error),
		}
	}
}

/// Holds the page's namespace after first resolution.
#[derive(Debug, Default)]
pub struct NamespaceCache(Option<Rc<Namespace>>);

impl NamespaceCache {
	#[must_use]
	pub fn new() -> Self {
		Self(None)
	}

	pub fn get_or_resolve(&mut self, source: &dyn PrefixSource) -> Rc<Namespace> {
		self.0.get_or_insert_with(|| Rc::new(Namespace::resolve(source))).clone()
	}

	/// Forgets the resolved namespace so the next access resolves again.
	pub fn reset(&mut self) {
		self.0 = None;
	}

	#[must_use]
	pub fn is_resolved(&self) -> bool {
		self.0.is_some()
	}
}
