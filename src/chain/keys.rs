use serde::{Deserialize, Serialize};

/// A test suite on a particular branch.
///
/// Ordering is by suite id then branch, so it can key sorted maps. The server
/// is deliberately not part of the identity; callers that track the same
/// suite on several servers must prefix the server id into their own keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SuiteInBranch {
    pub suite_id: String,
    pub branch: String,
}

impl SuiteInBranch {
    pub fn new(suite_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            suite_id: suite_id.into(),
            branch: branch.into(),
        }
    }
}

impl std::fmt::Display for SuiteInBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.suite_id, self.branch)
    }
}

/// Key for history maps: a suite on a branch, as seen by one server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerSuiteKey {
    pub server_id: String,
    pub suite: SuiteInBranch,
}

impl ServerSuiteKey {
    pub fn new(server_id: impl Into<String>, suite: SuiteInBranch) -> Self {
        Self {
            server_id: server_id.into(),
            suite,
        }
    }
}

impl std::fmt::Display for ServerSuiteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\t{}", self.server_id, self.suite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Queued,
    Running,
    #[default]
    Finished,
}

impl BuildState {
    pub fn is_finished(self) -> bool {
        self == Self::Finished
    }
}

/// Reference to one CI build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    /// Absent for placeholders.
    pub id: Option<u64>,
    pub suite_id: String,
    pub href: String,
    pub branch_name: String,
    #[serde(default)]
    pub state: BuildState,
    /// Placeholder meaning "no real build exists yet for this branch".
    #[serde(default)]
    pub fake_stub: bool,
}

impl BuildRef {
    pub fn new(id: u64, suite_id: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            suite_id: suite_id.into(),
            href: format!("/app/rest/builds/id:{id}"),
            branch_name: branch_name.into(),
            state: BuildState::Finished,
            fake_stub: false,
        }
    }

    pub fn fake_stub(suite_id: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: None,
            suite_id: suite_id.into(),
            href: String::new(),
            branch_name: branch_name.into(),
            state: BuildState::Finished,
            fake_stub: true,
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: BuildState) -> Self {
        self.state = state;
        self
    }

    pub fn is_fake_stub(&self) -> bool {
        self.fake_stub
    }

    pub fn is_scheduled(&self) -> bool {
        !self.state.is_finished()
    }

    /// Human-readable identifier for logs and warnings.
    pub fn describe(&self) -> String {
        match self.id {
            Some(id) => format!("{} #{id}", self.suite_id),
            None => format!("{} (stub)", self.suite_id),
        }
    }
}

/// Selects the chain roots to merge from a server's build list.
///
/// Placeholders and id-less refs are dropped, scheduled builds are dropped
/// unless `include_scheduled`, and the `merge_count` newest builds by id are
/// returned newest first.
pub fn select_chain_roots(
    builds: &[BuildRef],
    merge_count: usize,
    include_scheduled: bool,
) -> Vec<BuildRef> {
    let mut candidates: Vec<BuildRef> = builds
        .iter()
        .filter(|b| !b.is_fake_stub() && b.id.is_some())
        .filter(|b| include_scheduled || !b.is_scheduled())
        .cloned()
        .collect();

    candidates.sort_by(|a, b| b.id.cmp(&a.id));
    candidates.truncate(merge_count);
    candidates
}
