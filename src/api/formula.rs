//! Formula views over the signed `formula.jws.json` index.

use super::{Api, ApiIndex};
use crate::cache::PackageKind;
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;

pub const FORMULA_ENDPOINT: &str = "formula.jws.json";

impl Api {
    /// Every formula in the index, downloading or refreshing it as needed.
    pub async fn formula_index(&self) -> Result<Arc<ApiIndex>> {
        self.load_index(PackageKind::Formula, FORMULA_ENDPOINT, "name")
            .await
    }

    pub async fn has_formula(&self, name: &str) -> Result<bool> {
        Ok(self.formula_index().await?.contains(name))
    }

    /// Canonical name an alias points at.
    pub async fn formula_alias(&self, alias: &str) -> Result<Option<String>> {
        Ok(self
            .formula_index()
            .await?
            .alias_target(alias)
            .map(str::to_string))
    }

    /// Raw (unmerged) index record for `name`.
    pub async fn formula_record(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.formula_index().await?.record(name).cloned())
    }

    /// Single-formula JSON from `formula/<name>.json`, memoized.
    pub async fn fetch_formula_json(&self, name: &str) -> Result<Arc<Value>> {
        self.fetch(&format!("formula/{}.json", name)).await
    }
}
