use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;

use crate::auth::Credentials;
use crate::chain::context::{Build, BuildRunContext, LogCheckResult};
use crate::chain::keys::BuildRef;
use crate::config::ServerConfig;
use crate::error::{ChainLensError, Result};

#[cfg(test)]
pub mod mock;
pub mod teamcity;

pub use teamcity::TeamcityServer;

/// Connection to one CI server on behalf of one set of credentials.
///
/// Resources held by an implementation are released when the last handle is
/// dropped.
#[async_trait]
pub trait CiServer: Send + Sync {
    fn server_id(&self) -> &str;

    /// Browser link to a build, when the server has one.
    fn build_web_url(&self, _build_id: u64) -> Option<String> {
        None
    }

    /// Finished builds of a suite on a branch, including those whose snapshot
    /// dependencies failed.
    async fn list_finished_builds(&self, suite_id: &str, branch: &str) -> Result<Vec<BuildRef>>;

    /// Queued or running builds of a suite on a branch.
    async fn list_scheduled_builds(&self, _suite_id: &str, _branch: &str) -> Result<Vec<BuildRef>> {
        Ok(vec![])
    }

    /// `None` when the build no longer exists on the server.
    async fn fetch_build(&self, build: &BuildRef) -> Result<Option<Build>>;

    async fn fetch_chain_dependencies(&self, root: &BuildRef) -> Result<Vec<BuildRef>>;

    /// `None` when the build no longer exists on the server.
    async fn load_suite_result(&self, build: &BuildRef) -> Result<Option<BuildRunContext>>;

    /// The most recent run of the same suite on the same branch, or `build` itself.
    async fn find_latest_rebuild(&self, build: &BuildRef) -> Result<BuildRef>;

    async fn analyze_build_log(&self, ctx: &BuildRunContext) -> Result<LogCheckResult>;
}

/// Resolves server ids to connections and answers access questions.
#[async_trait]
pub trait ServerProvider: Send + Sync {
    fn has_access(&self, server_id: &str, creds: &Credentials) -> bool;

    async fn server(&self, server_id: &str, creds: &Credentials) -> Result<Arc<dyn CiServer>>;

    fn check_access(&self, server_id: &str, creds: &Credentials) -> Result<()> {
        if self.has_access(server_id, creds) {
            Ok(())
        } else {
            Err(ChainLensError::Unauthorized(server_id.to_string()))
        }
    }
}

type ConnectionKey = (String, String, Option<String>);

/// Provider backed by configured TeamCity-compatible servers.
///
/// Keeps one connection per (server id, credentials scope, token) and hands
/// out shared handles to it. A rotated token opens a new connection.
pub struct ConfiguredServers {
    servers: HashMap<String, ServerConfig>,
    connections: Mutex<HashMap<ConnectionKey, Arc<TeamcityServer>>>,
}

impl ConfiguredServers {
    pub fn new(servers: &[ServerConfig]) -> Self {
        Self {
            servers: servers.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            connections: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ServerProvider for ConfiguredServers {
    fn has_access(&self, server_id: &str, creds: &Credentials) -> bool {
        self.servers.contains_key(server_id) && creds.has_server(server_id)
    }

    async fn server(&self, server_id: &str, creds: &Credentials) -> Result<Arc<dyn CiServer>> {
        self.check_access(server_id, creds)?;

        let config = self
            .servers
            .get(server_id)
            .ok_or_else(|| ChainLensError::not_found("CI server", server_id))?;

        let token = creds.token(server_id).cloned();
        let key = (
            server_id.to_string(),
            creds.scope().to_string(),
            token.as_ref().map(|t| t.as_str().to_string()),
        );
        let mut connections = self
            .connections
            .lock()
            .map_err(|_| ChainLensError::Task("server connection registry poisoned".into()))?;

        if let Some(existing) = connections.get(&key) {
            let handle: Arc<dyn CiServer> = existing.clone();
            return Ok(handle);
        }

        debug!("Opening connection to {server_id} for {}", creds.scope());
        let server = Arc::new(TeamcityServer::new(config, token)?);
        connections.retain(|(id, scope, _), _| !(id == server_id && scope == creds.scope()));
        connections.insert(key, server.clone());

        let handle: Arc<dyn CiServer> = server;
        Ok(handle)
    }
}
