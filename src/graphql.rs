//! Query/mutation collaborator: comments over GraphQL-on-HTTP.
//!
//! Every request is a `POST` of `{query, variables}` with
//! `Authorization: Bearer <token>`. The response envelope is `{data, errors}`;
//! when `errors` is non-empty its first message becomes the failure reason.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::comment::Comment;
use crate::config::SyncConfig;
use crate::connection::Credential;
use crate::error::{Result, SyncError};

pub const COMMENTS_QUERY: &str = "query Comments($leadId: ID!) { comments(leadId: $leadId) { id leadId userId content createdAt } }";

pub const ADD_COMMENT_MUTATION: &str = "mutation AddComment($input: CommentInput!) { addComment(input: $input) { comment { id leadId userId content createdAt } } }";

/// The logical comment operations the engine needs.
pub trait CommentApi: Send + Sync + 'static {
    fn fetch_comments(
        &self,
        credential: &Credential,
        lead_id: &str,
    ) -> impl Future<Output = Result<Vec<Comment>>> + Send;

    fn add_comment(
        &self,
        credential: &Credential,
        lead_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<Comment>> + Send;
}

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CommentsData {
    comments: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddCommentData {
    add_comment: AddCommentPayload,
}

#[derive(Debug, Deserialize)]
struct AddCommentPayload {
    comment: Comment,
}

/// reqwest-backed [`CommentApi`]. Use [`GraphqlClient::builder`] to construct.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    url: String,
    client: reqwest::Client,
}

impl GraphqlClient {
    pub fn builder(url: impl Into<String>) -> GraphqlClientBuilder {
        GraphqlClientBuilder::new(url)
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::builder(config.api_url.clone())
            .connect_timeout(config.connect_timeout())
            .request_timeout(config.request_timeout())
            .build()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Run one operation and decode `data` into `T`.
    ///
    /// # Returns
    /// - `Err(SyncError::Connect)` when the request cannot be sent.
    /// - `Err(SyncError::Mutation)` when the envelope carries `errors`.
    /// - `Err(SyncError::Http)` on a non-2xx status without a GraphQL error.
    /// - `Err(SyncError::Json)` when the body or `data` cannot be decoded.
    pub async fn execute<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, credential.bearer())
            .json(&GraphqlRequest { query, variables })
            .send()
            .await
            .map_err(|e| SyncError::Connect {
                url: self.url.clone(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| SyncError::Json {
            field: "body".into(),
            detail: e.to_string(),
        })?;

        let envelope = match serde_json::from_slice::<GraphqlResponse<serde_json::Value>>(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(SyncError::Http {
                    status: status.as_u16(),
                    url: self.url.clone(),
                })
            }
            Err(e) => {
                return Err(SyncError::Json {
                    field: "body".into(),
                    detail: e.to_string(),
                })
            }
        };

        if let Some(first) = envelope.errors.into_iter().flatten().next() {
            return Err(SyncError::Mutation {
                message: first.message,
            });
        }
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        let data = envelope.data.ok_or_else(|| SyncError::Json {
            field: "data".into(),
            detail: "response has neither data nor errors".into(),
        })?;
        serde_json::from_value(data).map_err(|e| SyncError::Json {
            field: "data".into(),
            detail: e.to_string(),
        })
    }
}

impl CommentApi for GraphqlClient {
    async fn fetch_comments(&self, credential: &Credential, lead_id: &str) -> Result<Vec<Comment>> {
        let data: CommentsData = self
            .execute(credential, COMMENTS_QUERY, serde_json::json!({ "leadId": lead_id }))
            .await?;
        debug!(lead_id = %lead_id, count = data.comments.len(), "comments fetched");
        Ok(data.comments)
    }

    async fn add_comment(&self, credential: &Credential, lead_id: &str, content: &str) -> Result<Comment> {
        let data: AddCommentData = self
            .execute(
                credential,
                ADD_COMMENT_MUTATION,
                serde_json::json!({ "input": { "leadId": lead_id, "content": content } }),
            )
            .await?;
        Ok(data.add_comment.comment)
    }
}

/// Builder for [`GraphqlClient`].
#[derive(Debug, Clone)]
pub struct GraphqlClientBuilder {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl GraphqlClientBuilder {
    /// Defaults: connect timeout 3 s, request timeout 10 s.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<GraphqlClient> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(GraphqlClient {
            url: self.url,
            client,
        })
    }
}
