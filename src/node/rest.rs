//! Session-bound REST view of a node.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{LoadResponse, LoadResult, NodeInfo, RemotePlayer, SessionUpdate, Track, UpdatePlayer};
use crate::node::driver::RestRequest;
use crate::node::Node;

/// One REST call, relative to the node's `/v<N>` base.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: String,
    pub method: Method,
    pub body: Option<Value>,
    pub query: Vec<(String, String)>,
    pub requires_session: bool,
}

impl FetchRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
            query: Vec::new(),
            requires_session: false,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn session(mut self) -> Self {
        self.requires_session = true;
        self
    }
}

/// Typed REST operations against one node.
///
/// The session id is read from the node on every call, so a view taken
/// before the ready handshake becomes usable once the node is ready.
pub struct Rest<'a> {
    node: &'a Node,
}

impl<'a> Rest<'a> {
    pub(crate) fn new(node: &'a Node) -> Self {
        Self { node }
    }

    fn session_id(&self) -> Result<String> {
        self.node
            .session_id()
            .ok_or_else(|| Error::SessionNotReady(self.node.name().to_string()))
    }

    fn player_path(&self, guild_id: &str) -> Result<String> {
        Ok(format!(
            "/sessions/{}/players/{}",
            self.session_id()?,
            urlencoding::encode(guild_id)
        ))
    }

    /// Raw request. `Ok(None)` means the node answered with an empty body.
    pub async fn fetch<T: DeserializeOwned>(&self, request: FetchRequest) -> Result<Option<T>> {
        if request.requires_session && self.node.session_id().is_none() {
            return Err(Error::SessionNotReady(self.node.name().to_string()));
        }

        debug!(node = %self.node.name(), "{} {}", request.method, request.endpoint);

        let response = self
            .node
            .driver()
            .fetch(RestRequest {
                method: request.method.clone(),
                path: request.endpoint.clone(),
                query: request.query,
                headers: vec![("Authorization".to_string(), self.node.options().auth.clone())],
                body: request.body,
            })
            .await?;

        if response.status == 204 {
            return Ok(None);
        }

        if !(200..300).contains(&response.status) {
            warn!(
                node = %self.node.name(),
                status = response.status,
                "{} {} failed",
                request.method,
                request.endpoint
            );
            return Err(Error::Http {
                status: response.status,
                body: response.body,
            });
        }

        if response.body.trim().is_empty() {
            return Ok(None);
        }

        let value = serde_json::from_str::<Value>(&response.body).unwrap_or(Value::String(response.body));
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn get_players(&self) -> Result<Vec<RemotePlayer>> {
        let path = format!("/sessions/{}/players", self.session_id()?);
        let players = self.fetch(FetchRequest::get(path).session()).await?;
        Ok(players.unwrap_or_default())
    }

    pub async fn get_player(&self, guild_id: &str) -> Result<Option<RemotePlayer>> {
        let path = self.player_path(guild_id)?;
        self.fetch(FetchRequest::get(path).session()).await
    }

    pub async fn update_player(
        &self,
        guild_id: &str,
        update: &UpdatePlayer,
        no_replace: bool,
    ) -> Result<Option<RemotePlayer>> {
        let path = self.player_path(guild_id)?;
        let request = FetchRequest::new(Method::PATCH, path)
            .body(serde_json::to_value(update)?)
            .query("noReplace", no_replace)
            .session();
        self.fetch(request).await
    }

    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = self.player_path(guild_id)?;
        self.fetch::<Value>(FetchRequest::new(Method::DELETE, path).session())
            .await?;
        Ok(())
    }

    /// Toggles resuming for the current session.
    pub async fn update_session(&self, resuming: bool, timeout: u64) -> Result<()> {
        let path = format!("/sessions/{}", self.session_id()?);
        let body = serde_json::to_value(SessionUpdate { resuming, timeout })?;
        self.fetch::<Value>(FetchRequest::new(Method::PATCH, path).body(body).session())
            .await?;
        Ok(())
    }

    /// Resolves a URL or a prefixed search query. Nothing found, or a
    /// node answering with an error status, is [`LoadResult::Empty`].
    pub async fn resolve(&self, identifier: &str) -> Result<LoadResult> {
        let request = FetchRequest::get("/loadtracks").query("identifier", identifier);
        match self.fetch::<LoadResponse>(request).await {
            Ok(Some(response)) => LoadResult::try_from(response),
            Ok(None) => Ok(LoadResult::Empty),
            Err(Error::Http { status, body }) => {
                warn!(node = %self.node.name(), status, body = %body, "loadtracks failed, treating as empty");
                Ok(LoadResult::Empty)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Option<Track>> {
        self.fetch(FetchRequest::get("/decodetrack").query("encodedTrack", encoded))
            .await
    }

    pub async fn info(&self) -> Result<Option<NodeInfo>> {
        self.fetch(FetchRequest::get("/info")).await
    }
}
