//! Formula and cask resolution for Homebrew-style package trees.
//!
//! The library turns a user-supplied reference into a compiled package
//! definition. It looks in taps on disk, installed kegs, bottles, URLs and a
//! signature-checked local copy of the Homebrew JSON API.
//!
//! The pieces are wired together by the caller:
//!
//! - [`EnvConfig`] describes the host (prefix, cache, API domain, flags)
//! - [`MetadataCache`] deduplicates work for one run and is shared by everything
//! - [`Api`] downloads, verifies and indexes API data through a [`fetch::FetchClient`]
//! - [`Formulary`] resolves formula references; [`CaskLoader`] does the same for casks

pub mod api;
pub mod bottle;
pub mod cache;
pub mod cask;
pub mod config;
pub mod dsl;
pub mod error;
pub mod fetch;
pub mod formula;
pub mod formulary;
pub mod keg;
pub mod platform;
pub mod tap;

pub use api::Api;
pub use cache::MetadataCache;
pub use cask::{Cask, CaskLoader};
pub use config::EnvConfig;
pub use error::{BruError, Result};
pub use formula::{Formula, FormulaClass, ResolvedSource, SpecKind};
pub use formulary::{Formulary, LoadOrigin, Loader};
pub use platform::Platform;
