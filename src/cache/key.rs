use std::fmt;

use serde::Serialize;

use crate::config::AnalysisConfig;

/// Live status of the latest chain per tracked entry.
pub const CURRENT_SUMMARY: &str = "currentTestFailuresSummary";

/// Status merged over the most recent chains per tracked entry.
pub const MERGED_SUMMARY: &str = "AllTestFailuresSummary";

/// Query parameters after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParams {
    pub branch: String,
    pub count: usize,
    pub check_all_logs: bool,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            branch: "master".to_string(),
            count: 10,
            check_all_logs: false,
        }
    }
}

impl QueryParams {
    /// Fills unset parameters from the analysis defaults.
    ///
    /// A zero count is treated as unset.
    pub fn normalize(
        branch: Option<&str>,
        count: Option<usize>,
        check_all_logs: Option<bool>,
        defaults: &AnalysisConfig,
    ) -> Self {
        Self {
            branch: branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or(&defaults.default_branch)
                .to_string(),
            count: count
                .filter(|c| *c > 0)
                .unwrap_or(defaults.default_merge_count),
            check_all_logs: check_all_logs.unwrap_or(false),
        }
    }

    /// Same parameters for the single-latest view.
    #[must_use]
    pub fn latest_only(mut self) -> Self {
        self.count = 1;
        self
    }
}

/// Identity of one cached computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub operation: &'static str,
    pub credentials_scope: String,
    pub params: QueryParams,
}

impl CacheKey {
    pub fn new(operation: &'static str, credentials_scope: impl Into<String>, params: QueryParams) -> Self {
        Self {
            operation,
            credentials_scope: credentials_scope.into(),
            params,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}, branch={}, count={}, checkAllLogs={})",
            self.operation,
            self.credentials_scope,
            self.params.branch,
            self.params.count,
            self.params.check_all_logs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_params_take_defaults() {
        let params = QueryParams::normalize(None, None, None, &AnalysisConfig::default());
        assert_eq!(params, QueryParams::default());
    }

    #[test]
    fn blank_branch_and_zero_count_are_unset() {
        let params = QueryParams::normalize(Some("  "), Some(0), Some(true), &AnalysisConfig::default());
        assert_eq!(params.branch, "master");
        assert_eq!(params.count, 10);
        assert!(params.check_all_logs);
    }

    #[test]
    fn keys_differ_by_scope_and_operation() {
        let params = QueryParams::default();
        let a = CacheKey::new(CURRENT_SUMMARY, "alice", params.clone());
        let b = CacheKey::new(CURRENT_SUMMARY, "bob", params.clone());
        let c = CacheKey::new(MERGED_SUMMARY, "alice", params.clone());

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, CacheKey::new(CURRENT_SUMMARY, "alice", params));
    }

    #[test]
    fn display_names_every_component() {
        let key = CacheKey::new(
            MERGED_SUMMARY,
            "alice",
            QueryParams::normalize(Some("ignite-2.7"), Some(3), None, &AnalysisConfig::default()),
        );
        assert_eq!(
            key.to_string(),
            "AllTestFailuresSummary(alice, branch=ignite-2.7, count=3, checkAllLogs=false)"
        );
    }
}
