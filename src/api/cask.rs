//! Cask views over the signed `cask.jws.json` index.

use super::{Api, ApiIndex};
use crate::cache::PackageKind;
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;

pub const CASK_ENDPOINT: &str = "cask.jws.json";

impl Api {
    pub async fn cask_index(&self) -> Result<Arc<ApiIndex>> {
        self.load_index(PackageKind::Cask, CASK_ENDPOINT, "token").await
    }

    pub async fn has_cask(&self, token: &str) -> Result<bool> {
        Ok(self.cask_index().await?.contains(token))
    }

    pub async fn cask_record(&self, token: &str) -> Result<Option<Value>> {
        Ok(self.cask_index().await?.record(token).cloned())
    }

    /// Single-cask JSON from `cask/<token>.json`, memoized.
    pub async fn fetch_cask_json(&self, token: &str) -> Result<Arc<Value>> {
        self.fetch(&format!("cask/{}.json", token)).await
    }
}
