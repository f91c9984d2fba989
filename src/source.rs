//! Source positions as recorded by the build-time instrumentation.

use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};

/// A syntactic position in a source file.
///
/// Many rendered nodes can share one location, for example every item rendered from a list template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
	pub file_name: String,
	pub line_number: u32,
	pub column_number: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub component_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function_name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub element_type: Option<String>,
}

impl SourceLocation {
	#[must_use]
	pub fn new(file_name: impl Into<String>, line_number: u32, column_number: u32) -> Self {
		Self {
			file_name: file_name.into(),
			line_number,
			column_number,
			component_name: None,
			function_name: None,
			element_type: None,
		}
	}

	#[must_use]
	pub fn with_component(mut self, component_name: impl Into<String>) -> Self {
		self.component_name = Some(component_name.into());
		self
	}

	#[must_use]
	pub fn with_function(mut self, function_name: impl Into<String>) -> Self {
		self.function_name = Some(function_name.into());
		self
	}

	#[must_use]
	pub fn with_element_type(mut self, element_type: impl Into<String>) -> Self {
		self.element_type = Some(element_type.into());
		self
	}

	/// Whether file, line and column are all usable for a source write.
	///
	/// Line and column are 1-based, so `0` marks a missing value.
	#[must_use]
	pub fn is_complete(&self) -> bool {
		!self.file_name.trim().is_empty() && self.line_number > 0 && self.column_number > 0
	}

	/// Compares only file, line and column.
	#[must_use]
	pub fn same_position(&self, other: &Self) -> bool {
		self.file_name == other.file_name && self.line_number == other.line_number && self.column_number == other.column_number
	}

	/// Whether `self` is at `query`'s position and agrees with the component and function names `query` specifies.
	#[must_use]
	pub fn matches(&self, query: &Self) -> bool {
		self.same_position(query)
			&& query.component_name.as_ref().map_or(true, |name| self.component_name.as_ref() == Some(name))
			&& query.function_name.as_ref().map_or(true, |name| self.function_name.as_ref() == Some(name))
	}
}

impl fmt::Display for SourceLocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}:{}", self.file_name, self.line_number, self.column_number)
	}
}

/// Where a node sits relative to component boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
	/// Inside a component's own template.
	ComponentDefinition,
	/// The element that invokes a component with specific content.
	ComponentUsage,
	/// Page-level markup outside any reusable component.
	PageContent,
}

impl FileType {
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			FileType::ComponentDefinition => "component-definition",
			FileType::ComponentUsage => "component-usage",
			FileType::PageContent => "page-content",
		}
	}
}

impl FromStr for FileType {
	type Err = UnknownFileType;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"component-definition" => Ok(FileType::ComponentDefinition),
			"component-usage" => Ok(FileType::ComponentUsage),
			"page-content" => Ok(FileType::PageContent),
			other => Err(UnknownFileType(other.to_owned())),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown file-type tag {0:?}")]
pub struct UnknownFileType(pub String);

/// Parses a `fileName:line:column` children-source reference.
///
/// The file name may itself contain `:` (drive letters, URL schemes), so the string is split from the right.
#[must_use]
pub fn parse_children_source(encoded: &str) -> Option<SourceLocation> {
	let mut parts = encoded.trim().rsplitn(3, ':');
	let column = parts.next()?.parse().ok()?;
	let line = parts.next()?.parse().ok()?;
	let file = parts.next()?;
	let location = SourceLocation::new(file, line, column);
	if location.is_complete() {
		Some(location)
	} else {
		None
	}
}
