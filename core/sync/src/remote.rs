//! Remote table service client trait.

use async_trait::async_trait;
use std::fmt;

use tablesync_common::{Query, Record, Result};

/// Header carrying the feature tags of a request.
pub const FEATURES_HEADER: &str = "X-ZUMO-FEATURES";

/// Query parameter asking the server to return soft-deleted records.
pub const INCLUDE_DELETED_PARAMETER: &str = "__includeDeleted";

/// Feature tag reported to the server for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Request issued by the offline sync engine.
    OfflineSync,
    /// Pull that persists a watermark between runs.
    IncrementalPull,
}

impl Feature {
    /// Wire code of the feature.
    pub fn code(&self) -> &'static str {
        match self {
            Feature::OfflineSync => "OL",
            Feature::IncrementalPull => "IP",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Per-request options passed to the remote client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Feature tags of the request.
    pub features: Vec<Feature>,
    /// Whether soft-deleted records should be returned.
    pub include_deleted: bool,
}

impl RequestOptions {
    /// Options for a request tagged with the given features.
    pub fn with_features(features: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            features: features.into_iter().collect(),
            include_deleted: false,
        }
    }

    /// Also return soft-deleted records.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Value of the features header, or `None` when no feature is set.
    pub fn features_header(&self) -> Option<String> {
        if self.features.is_empty() {
            return None;
        }
        let codes: Vec<&str> = self.features.iter().map(Feature::code).collect();
        Some(codes.join(","))
    }

    /// HTTP headers a client adds to the request.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.features_header()
            .map(|value| (FEATURES_HEADER, value))
            .into_iter()
            .collect()
    }

    /// Query parameters a client appends to the request URL.
    pub fn query_parameters(&self) -> Vec<(&'static str, String)> {
        if self.include_deleted {
            vec![(INCLUDE_DELETED_PARAMETER, "true".to_string())]
        } else {
            Vec::new()
        }
    }
}

/// Client for the remote table service.
///
/// Implementations own transport, authentication and serialization. Failed
/// requests are reported as `Error::Remote` so the engine can inspect the HTTP
/// status and the server's copy of the record.
#[async_trait]
pub trait RemoteTableClient: Send + Sync {
    /// Fetch the records matching `query`.
    ///
    /// Implementations render the query with [`Query::to_odata`] and send
    /// `options.headers()` and `options.query_parameters()` with it.
    async fn read(&self, query: &Query, options: &RequestOptions) -> Result<Vec<Record>>;

    /// Insert a record and return the server's copy.
    ///
    /// # Errors
    /// - 409 when a record with the same id exists
    async fn insert(&self, table: &str, record: Record, options: &RequestOptions)
        -> Result<Record>;

    /// Update a record and return the server's copy.
    ///
    /// # Errors
    /// - 412 when the record's `version` is stale
    async fn update(&self, table: &str, record: Record, options: &RequestOptions)
        -> Result<Record>;

    /// Delete a record, guarded by `version` when one is given.
    ///
    /// # Errors
    /// - 412 when `version` is stale
    async fn del(
        &self,
        table: &str,
        id: &str,
        version: Option<&str>,
        options: &RequestOptions,
    ) -> Result<()>;
}
