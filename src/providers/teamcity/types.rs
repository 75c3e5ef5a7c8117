use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use crate::chain::context::Build;
use crate::chain::keys::{BuildRef, BuildState};

/// Timestamp layout used by the REST API, e.g. `20180219T120000+0300`.
const REST_DATE_FORMAT: &str = "%Y%m%dT%H%M%S%z";

/// Build list returned by `app/rest/builds?locator=...`.
#[derive(Debug, Deserialize, Default)]
pub(super) struct BuildList {
    #[serde(default)]
    pub build: Vec<BuildRefDto>,
}

/// Short build entry as it appears in lists and snapshot dependencies.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BuildRefDto {
    pub id: Option<u64>,
    pub build_type_id: Option<String>,
    pub branch_name: Option<String>,
    pub href: Option<String>,
    pub state: Option<String>,
    /// Set on placeholder entries the server returns for branches without builds.
    #[serde(default)]
    pub fake_stub: bool,
}

impl BuildRefDto {
    pub fn into_ref(self, default_branch: &str) -> BuildRef {
        let suite_id = self.build_type_id.unwrap_or_default();
        let branch = self.branch_name.unwrap_or_else(|| default_branch.to_string());

        match self.id {
            Some(id) if !self.fake_stub => {
                let mut build = BuildRef::new(id, suite_id, branch).with_state(parse_state(self.state.as_deref()));
                if let Some(href) = self.href {
                    build.href = href;
                }
                build
            }
            _ => BuildRef::fake_stub(suite_id, branch),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BuildDto {
    pub id: u64,
    pub build_type_id: String,
    pub branch_name: Option<String>,
    pub state: Option<String>,
    pub status: Option<String>,
    pub finish_date: Option<String>,
    pub web_url: Option<String>,
    pub build_type: Option<BuildTypeDto>,
    #[serde(rename = "snapshot-dependencies")]
    pub snapshot_dependencies: Option<BuildList>,
    pub test_occurrences: Option<TestOccurrencesDto>,
}

impl BuildDto {
    pub fn suite_name(&self) -> String {
        self.build_type
            .as_ref()
            .and_then(|t| t.name.clone())
            .unwrap_or_else(|| self.build_type_id.clone())
    }

    pub fn into_build(self) -> Build {
        let branch = self.branch_name.unwrap_or_default();
        let snapshot_dependencies = self
            .snapshot_dependencies
            .unwrap_or_default()
            .build
            .into_iter()
            .map(|dep| dep.into_ref(&branch))
            .collect();

        Build {
            id: self.id,
            suite_id: self.build_type_id,
            state: parse_state(self.state.as_deref()),
            status: self.status,
            finish_date: self.finish_date.as_deref().and_then(parse_rest_date),
            snapshot_dependencies,
            web_url: self.web_url,
            branch_name: branch,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct BuildTypeDto {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct TestOccurrencesDto {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub muted: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ProblemOccurrences {
    #[serde(default)]
    pub problem_occurrence: Vec<ProblemOccurrenceDto>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ProblemOccurrenceDto {
    #[serde(rename = "type")]
    pub type_: Option<String>,
}

fn parse_state(state: Option<&str>) -> BuildState {
    match state {
        Some("queued") => BuildState::Queued,
        Some("running") => BuildState::Running,
        _ => BuildState::Finished,
    }
}

pub(super) fn parse_rest_date(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, REST_DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rest_dates_with_offset() {
        let date = parse_rest_date("20180219T120000+0300").unwrap();
        assert_eq!(date.offset().local_minus_utc(), 3 * 3600);
        assert_eq!(date.format("%Y%m%d").to_string(), "20180219");
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!(parse_rest_date("2018-02-19").is_none());
    }

    #[test]
    fn entries_without_id_become_stubs() {
        let dto: BuildRefDto =
            serde_json::from_str(r#"{"buildTypeId":"RunAll","branchName":"master"}"#).unwrap();
        let build = dto.into_ref("ignored");

        assert!(build.is_fake_stub());
        assert_eq!(build.branch_name, "master");
    }

    #[test]
    fn queued_entries_keep_their_state() {
        let dto: BuildRefDto = serde_json::from_str(
            r#"{"id":5,"buildTypeId":"RunAll","state":"queued","href":"/app/rest/builds/id:5"}"#,
        )
        .unwrap();
        let build = dto.into_ref("master");

        assert_eq!(build.state, BuildState::Queued);
        assert_eq!(build.branch_name, "master");
        assert_eq!(build.href, "/app/rest/builds/id:5");
    }
}
