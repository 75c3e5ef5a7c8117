mod client;
mod types;

use async_trait::async_trait;
use log::debug;

use crate::auth::Token;
use crate::chain::context::{Build, BuildRunContext, LogCheckResult, ProblemKind};
use crate::chain::keys::BuildRef;
use crate::config::ServerConfig;
use crate::error::{ChainLensError, Result};

use super::CiServer;
use client::RestClient;
use types::{BuildDto, BuildList, ProblemOccurrences};

const OOM_MARKER: &str = "java.lang.OutOfMemoryError";
const JVM_CRASH_MARKER: &str = "A fatal error has been detected by the Java Runtime Environment";
const TEST_STARTED_PREFIX: &str = "##teamcity[testStarted name='";

/// CI server handle for a TeamCity-compatible REST API.
pub struct TeamcityServer {
    client: RestClient,
}

impl TeamcityServer {
    /// # Errors
    ///
    /// Returns an error if the configured URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &ServerConfig, token: Option<Token>) -> Result<Self> {
        Ok(Self {
            client: RestClient::new(config, token)?,
        })
    }

    fn build_path(build: &BuildRef) -> Result<String> {
        build
            .id
            .map(|id| format!("app/rest/builds/id:{id}"))
            .ok_or_else(|| ChainLensError::not_found("build", build.describe()))
    }

    async fn list_builds(&self, locator: String, branch: &str) -> Result<Vec<BuildRef>> {
        let list: Option<BuildList> = self
            .client
            .get_json("app/rest/builds", &[("locator", locator)])
            .await?;

        Ok(list
            .unwrap_or_default()
            .build
            .into_iter()
            .map(|dto| dto.into_ref(branch))
            .collect())
    }

    async fn fetch_build_dto(&self, build: &BuildRef) -> Result<Option<BuildDto>> {
        self.client.get_json(&Self::build_path(build)?, &[]).await
    }

    fn web_url(&self, build_id: u64) -> String {
        format!(
            "{}viewLog.html?buildId={build_id}",
            self.client.base_url().as_str()
        )
    }
}

fn suite_locator(suite_id: &str, branch: &str) -> String {
    format!("buildType:(id:{suite_id}),branch:(name:{branch}),defaultFilter:false")
}

/// Scans a build log for the last started test and crash markers.
fn scan_build_log(build_id: u64, log: &str) -> LogCheckResult {
    let mut result = LogCheckResult {
        build_id,
        ..LogCheckResult::default()
    };

    for line in log.lines() {
        if let Some(rest) = line
            .find(TEST_STARTED_PREFIX)
            .map(|pos| &line[pos + TEST_STARTED_PREFIX.len()..])
        {
            if let Some(end) = rest.find('\'') {
                result.last_started_test = Some(rest[..end].to_string());
            }
        }
        if line.contains(OOM_MARKER) {
            result.out_of_memory_lines += 1;
        }
        if line.contains(JVM_CRASH_MARKER) {
            result.jvm_crash_lines += 1;
        }
    }

    result
}

#[async_trait]
impl CiServer for TeamcityServer {
    fn server_id(&self) -> &str {
        self.client.server_id()
    }

    fn build_web_url(&self, build_id: u64) -> Option<String> {
        Some(self.web_url(build_id))
    }

    async fn list_finished_builds(&self, suite_id: &str, branch: &str) -> Result<Vec<BuildRef>> {
        let locator = format!(
            "{},state:finished,snapshotDependencyProblem:any,failedToStart:any",
            suite_locator(suite_id, branch)
        );
        self.list_builds(locator, branch).await
    }

    async fn list_scheduled_builds(&self, suite_id: &str, branch: &str) -> Result<Vec<BuildRef>> {
        let mut builds = self
            .list_builds(
                format!("{},state:running", suite_locator(suite_id, branch)),
                branch,
            )
            .await?;
        builds.extend(
            self.list_builds(
                format!("{},state:queued", suite_locator(suite_id, branch)),
                branch,
            )
            .await?,
        );
        Ok(builds)
    }

    async fn fetch_build(&self, build: &BuildRef) -> Result<Option<Build>> {
        Ok(self.fetch_build_dto(build).await?.map(BuildDto::into_build))
    }

    async fn fetch_chain_dependencies(&self, root: &BuildRef) -> Result<Vec<BuildRef>> {
        let build = self
            .fetch_build(root)
            .await?
            .ok_or_else(|| ChainLensError::not_found("chain root", root.describe()))?;

        Ok(build.snapshot_dependencies)
    }

    async fn load_suite_result(&self, build: &BuildRef) -> Result<Option<BuildRunContext>> {
        let Some(dto) = self.fetch_build_dto(build).await? else {
            return Ok(None);
        };

        let problems: Option<ProblemOccurrences> = self
            .client
            .get_json(
                "app/rest/problemOccurrences",
                &[("locator", format!("build:(id:{})", dto.id))],
            )
            .await?;

        let problems = problems
            .unwrap_or_default()
            .problem_occurrence
            .into_iter()
            .filter_map(|p| p.type_)
            .map(|t| ProblemKind::from_type(&t))
            .collect();

        let suite_name = dto.suite_name();
        let tests = dto.test_occurrences.unwrap_or_default();
        let web_url = dto.web_url.unwrap_or_else(|| self.web_url(dto.id));

        Ok(Some(BuildRunContext {
            build_id: dto.id,
            suite_id: dto.build_type_id,
            suite_name,
            branch_name: dto.branch_name.unwrap_or_else(|| build.branch_name.clone()),
            state: build.state,
            failed_tests: tests.failed,
            muted_tests: tests.muted,
            total_tests: tests.count,
            problems,
            contact_person: None,
            web_url: Some(web_url),
        }))
    }

    async fn find_latest_rebuild(&self, build: &BuildRef) -> Result<BuildRef> {
        let locator = format!(
            "{},count:1",
            suite_locator(&build.suite_id, &build.branch_name)
        );
        let latest = self
            .list_builds(locator, &build.branch_name)
            .await?
            .into_iter()
            .find(|b| !b.is_fake_stub());

        match latest {
            Some(recent) if recent.id > build.id => {
                debug!(
                    "Replacing {} by more recent rebuild #{:?}",
                    build.describe(),
                    recent.id
                );
                Ok(recent)
            }
            _ => Ok(build.clone()),
        }
    }

    async fn analyze_build_log(&self, ctx: &BuildRunContext) -> Result<LogCheckResult> {
        let log = self
            .client
            .get_text(
                "downloadBuildLog.html",
                &[("buildId", ctx.build_id.to_string())],
            )
            .await?
            .ok_or_else(|| ChainLensError::not_found("build log", ctx.build_id.to_string()))?;

        Ok(scan_build_log(ctx.build_id, &log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::keys::BuildState;
    use mockito::{Matcher, Server};

    fn config(url: &str) -> ServerConfig {
        ServerConfig {
            id: "apache".to_string(),
            url: url.to_string(),
            max_retries: 1,
            retry_delay_secs: 0,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn scan_finds_last_started_test_and_markers() {
        let log = "\
[10:00:01] ##teamcity[testStarted name='CacheTest.testPut' captureStandardOutput='true']
[10:00:02] ##teamcity[testFinished name='CacheTest.testPut']
[10:00:03] ##teamcity[testStarted name='CacheTest.testGet' captureStandardOutput='true']
[10:05:00] java.lang.OutOfMemoryError: Java heap space
";
        let result = scan_build_log(7, log);

        assert_eq!(result.build_id, 7);
        assert_eq!(result.last_started_test.as_deref(), Some("CacheTest.testGet"));
        assert_eq!(result.out_of_memory_lines, 1);
        assert_eq!(result.jvm_crash_lines, 0);
    }

    #[tokio::test]
    async fn lists_finished_builds_with_stubs() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/app/rest/builds")
            .match_query(Matcher::UrlEncoded(
                "locator".to_string(),
                "buildType:(id:RunAll),branch:(name:master),defaultFilter:false,\
                 state:finished,snapshotDependencyProblem:any,failedToStart:any"
                    .to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"count":3,"build":[
                    {"buildTypeId":"RunAll","branchName":"master","fakeStub":true},
                    {"id":101,"buildTypeId":"RunAll","branchName":"master","state":"finished"},
                    {"id":100,"buildTypeId":"RunAll","branchName":"master","state":"finished"}
                ]}"#,
            )
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();
        let builds = tc.list_finished_builds("RunAll", "master").await.unwrap();

        mock.assert_async().await;
        assert_eq!(builds.len(), 3);
        assert!(builds[0].is_fake_stub());
        assert_eq!(builds[1].id, Some(101));
    }

    #[tokio::test]
    async fn missing_build_is_none() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app/rest/builds/id:42")
            .with_status(404)
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();
        let build = tc
            .fetch_build(&BuildRef::new(42, "RunAll", "master"))
            .await
            .unwrap();

        assert!(build.is_none());
    }

    #[tokio::test]
    async fn missing_chain_root_is_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app/rest/builds/id:42")
            .with_status(404)
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();
        let err = tc
            .fetch_chain_dependencies(&BuildRef::new(42, "RunAll", "master"))
            .await
            .unwrap_err();

        assert!(matches!(err, ChainLensError::NotFound { entity: "chain root", .. }));
        assert!(err.to_string().contains("RunAll #42"));
    }

    #[tokio::test]
    async fn forbidden_is_unauthorized() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app/rest/builds")
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), Some(Token::from("bad"))).unwrap();
        let err = tc.list_finished_builds("RunAll", "master").await.unwrap_err();

        assert!(matches!(err, ChainLensError::Unauthorized(ref s) if s == "apache"));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_reported_unavailable() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/app/rest/builds/id:1")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();
        let err = tc
            .fetch_build(&BuildRef::new(1, "RunAll", "master"))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, ChainLensError::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn loads_suite_result_with_problems() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app/rest/builds/id:7")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":7,"buildTypeId":"Cache1","branchName":"master","state":"finished",
                    "status":"FAILURE","finishDate":"20180219T120000+0300",
                    "buildType":{"name":"Cache 1"},
                    "testOccurrences":{"count":120,"failed":2,"muted":3,"passed":115}}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/app/rest/problemOccurrences")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"problemOccurrence":[{"type":"TC_FAILED_TESTS"},{"type":"TC_JVM_CRASH"}]}"#,
            )
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();
        let ctx = tc
            .load_suite_result(&BuildRef::new(7, "Cache1", "master"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ctx.suite_name, "Cache 1");
        assert_eq!(ctx.failed_tests, 2);
        assert_eq!(ctx.muted_tests, 3);
        assert_eq!(ctx.total_tests, 120);
        assert_eq!(ctx.state, BuildState::Finished);
        assert!(ctx.problems.contains(&ProblemKind::JvmCrash));
        assert!(ctx.has_nontest_build_problem());
        assert!(ctx.web_url.unwrap().ends_with("viewLog.html?buildId=7"));
    }

    #[tokio::test]
    async fn latest_rebuild_replaces_older_reference() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/app/rest/builds")
            .match_query(Matcher::UrlEncoded(
                "locator".to_string(),
                "buildType:(id:Cache1),branch:(name:master),defaultFilter:false,count:1".to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"build":[{"id":15,"buildTypeId":"Cache1","branchName":"master"}]}"#)
            .create_async()
            .await;

        let tc = TeamcityServer::new(&config(&server.url()), None).unwrap();

        let newer = tc
            .find_latest_rebuild(&BuildRef::new(10, "Cache1", "master"))
            .await
            .unwrap();
        assert_eq!(newer.id, Some(15));

        let same = tc
            .find_latest_rebuild(&BuildRef::new(20, "Cache1", "master"))
            .await
            .unwrap();
        assert_eq!(same.id, Some(20));
    }
}
