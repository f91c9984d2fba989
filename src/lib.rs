#![doc(html_root_url = "https://docs.rs/design-mode/0.0.3")]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Runtime core of an in-page design mode.
//!
//! Rendered nodes carry source markers ([`namespace`]). [`resolver`] turns a node into the [`SourceLocation`] an edit of
//! it should target, [`matcher`] finds every other rendering of that position, [`update`] captures, applies and
//! persists edits with history, and [`bridge`] carries [`protocol`] messages between the page and its host document.
//! [`DesignMode`] ties them together; [`web`] wires it to a browser window.
//!
//! Everything is single-threaded and sans-IO: the render tree, transport, clock and persistence are injected, and
//! time only moves in `tick` calls.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod design_mode;
pub mod matcher;
pub mod namespace;
pub mod protocol;
pub mod resolver;
pub mod source;
pub mod tree;
pub mod update;
pub mod web;

pub use crate::{
	bridge::{Bridge, BridgeRole},
	config::Config,
	design_mode::DesignMode,
	namespace::Namespace,
	source::SourceLocation,
	tree::{NodeId, RenderTree},
	update::UpdateManager,
};

#[cfg(doctest)]
pub mod readme {
	doc_comment::doctest!("../README.md");
}
