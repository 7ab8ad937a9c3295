use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::Config;
use crate::query::ServiceResponse;

use super::types::{
  AiReview, BranchList, Comment, CommentList, Member, NewComment, Project, ProjectList,
  PullRequestDetailsResponse, PullRequestFilter, PullRequestList,
};

/// Review API client.
///
/// Every call returns a [`ServiceResponse`]; transport and HTTP errors are
/// folded into `success: false` with the server's `detail` message, or a
/// per-call default when the server gave none.
#[derive(Clone)]
pub struct ReviewClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

/// Error body returned by the API
#[derive(Deserialize)]
struct ErrorBody {
  detail: Option<serde_json::Value>,
}

impl ReviewClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(
      &config.api.url,
      Config::get_api_token(),
      config.request_timeout(),
    )
  }

  pub fn with_base_url(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(url).map_err(|e| eyre!("Invalid API url {}: {}", url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Invalid API url {}: not a base url", url));
    }

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("prq/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  /// Get the first `per_page` projects of the current user
  pub async fn projects(&self, per_page: u32) -> ServiceResponse<ProjectList> {
    let url = self.url(&["projects"]).map(|mut url| {
      url
        .query_pairs_mut()
        .append_pair("per_page", &per_page.to_string());
      url
    });
    self.call(Method::GET, url, "Failed to get user projects").await
  }

  /// Get a project with its stats
  pub async fn project(&self, project_id: i64) -> ServiceResponse<Project> {
    let url = self.url(&["projects", &project_id.to_string()]);
    self.call(Method::GET, url, "Failed to get project").await
  }

  /// Get the branches of a project
  pub async fn branches(&self, project_id: i64) -> ServiceResponse<BranchList> {
    let url = self.url(&["projects", &project_id.to_string(), "branches"]);
    self.call(Method::GET, url, "Failed to fetch branches").await
  }

  /// Get the members of a project
  pub async fn members(&self, project_id: i64) -> ServiceResponse<Vec<Member>> {
    let url = self.url(&["projects", &project_id.to_string(), "members"]);
    self.call(Method::GET, url, "Failed to fetch team members").await
  }

  /// Get one page of pull requests
  pub async fn pull_requests(
    &self,
    project_id: i64,
    filter: &PullRequestFilter,
  ) -> ServiceResponse<PullRequestList> {
    let url = self
      .url(&["projects", &project_id.to_string(), "pull-requests"])
      .map(|mut url| {
        url
          .query_pairs_mut()
          .append_pair("state", &filter.state)
          .append_pair("page", &filter.page.to_string())
          .append_pair("per_page", &filter.per_page.to_string());
        url
      });
    self.call(Method::GET, url, "Failed to fetch pull requests").await
  }

  /// Get a single pull request with commits and changed files
  pub async fn pr_details(
    &self,
    project_id: i64,
    pr_number: u64,
  ) -> ServiceResponse<PullRequestDetailsResponse> {
    let url = self.url(&[
      "projects",
      &project_id.to_string(),
      "pull-requests",
      &pr_number.to_string(),
    ]);
    self
      .call(Method::GET, url, "Failed to fetch pull request details")
      .await
  }

  /// Get the comments of a pull request
  pub async fn pr_comments(&self, project_id: i64, pr_number: u64) -> ServiceResponse<CommentList> {
    let url = self.comments_url(project_id, pr_number);
    self.call(Method::GET, url, "Failed to fetch comments").await
  }

  /// Get the automated reviews of a pull request, newest first
  pub async fn ai_reviews(
    &self,
    project_id: i64,
    pr_number: u64,
  ) -> ServiceResponse<Vec<AiReview>> {
    let url = self.url(&[
      "ai-reviews",
      "projects",
      &project_id.to_string(),
      "pull-requests",
      &pr_number.to_string(),
    ]);
    self.call(Method::GET, url, "Failed to fetch AI reviews").await
  }

  /// Add a comment to a pull request
  pub async fn create_comment(
    &self,
    project_id: i64,
    pr_number: u64,
    text: &str,
  ) -> ServiceResponse<Comment> {
    let url = self.comments_url(project_id, pr_number);
    let body = NewComment { comment_text: text };
    self
      .call_with_body(Method::POST, url, &body, "Failed to create comment")
      .await
  }

  /// Replace the text of a comment
  pub async fn update_comment(&self, comment_id: i64, text: &str) -> ServiceResponse<Comment> {
    let url = self.url(&["comments", &comment_id.to_string()]);
    let body = NewComment { comment_text: text };
    self
      .call_with_body(Method::PUT, url, &body, "Failed to update comment")
      .await
  }

  /// Delete a comment
  pub async fn delete_comment(&self, comment_id: i64) -> ServiceResponse<()> {
    let url = match self.url(&["comments", &comment_id.to_string()]) {
      Ok(url) => url,
      Err(e) => return invalid_url(e, "Failed to delete comment"),
    };

    match self.send(self.http.delete(url)).await {
      Ok(_) => ServiceResponse::ok(()),
      Err(detail) => {
        ServiceResponse::err(detail.unwrap_or_else(|| "Failed to delete comment".to_string()))
      }
    }
  }

  fn comments_url(&self, project_id: i64, pr_number: u64) -> Result<Url> {
    self.url(&[
      "comments",
      "projects",
      &project_id.to_string(),
      "pull-requests",
      &pr_number.to_string(),
    ])
  }

  /// Append path segments to the base url, keeping any base path.
  fn url(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.base_url.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("API url cannot be a base: {}", self.base_url))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  async fn call<T: DeserializeOwned>(
    &self,
    method: Method,
    url: Result<Url>,
    fallback: &str,
  ) -> ServiceResponse<T> {
    match url {
      Ok(url) => {
        let request = self.http.request(method, url);
        self.decode(self.send(request).await, fallback)
      }
      Err(e) => invalid_url(e, fallback),
    }
  }

  async fn call_with_body<T: DeserializeOwned, B: Serialize>(
    &self,
    method: Method,
    url: Result<Url>,
    body: &B,
    fallback: &str,
  ) -> ServiceResponse<T> {
    let url = match url {
      Ok(url) => url,
      Err(e) => return invalid_url(e, fallback),
    };
    let body = match serde_json::to_vec(body) {
      Ok(body) => body,
      Err(e) => {
        warn!("Failed to encode request body: {}", e);
        return ServiceResponse::err(fallback);
      }
    };

    let request = self
      .http
      .request(method, url)
      .header(CONTENT_TYPE, "application/json")
      .body(body);
    self.decode(self.send(request).await, fallback)
  }

  fn decode<T: DeserializeOwned>(
    &self,
    body: std::result::Result<Vec<u8>, Option<String>>,
    fallback: &str,
  ) -> ServiceResponse<T> {
    match body {
      Ok(bytes) => match serde_json::from_slice(&bytes) {
        Ok(data) => ServiceResponse::ok(data),
        Err(e) => {
          warn!("Failed to parse response: {}", e);
          ServiceResponse::err(fallback)
        }
      },
      Err(detail) => ServiceResponse::err(detail.unwrap_or_else(|| fallback.to_string())),
    }
  }

  /// Send a request and return the body of a successful response.
  /// On failure, returns the server's `detail` message if it sent one.
  async fn send(&self, request: RequestBuilder) -> std::result::Result<Vec<u8>, Option<String>> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    let response = request.send().await.map_err(|e| {
      warn!("Request failed: {}", e);
      None
    })?;

    let status = response.status();
    let url = response.url().clone();
    let body = response.bytes().await.map_err(|e| {
      warn!(%url, %status, "Failed to read response body: {}", e);
      None
    })?;

    if status.is_success() {
      debug!(%url, %status, bytes = body.len(), "request succeeded");
      Ok(body.to_vec())
    } else {
      let detail = error_detail(&body);
      debug!(%url, %status, ?detail, "request rejected");
      Err(detail)
    }
  }
}

/// Extract a readable message from an error body. Validation errors carry a
/// list of details; those keep only the first message.
fn error_detail(body: &[u8]) -> Option<String> {
  let body: ErrorBody = serde_json::from_slice(body).ok()?;
  match body.detail? {
    serde_json::Value::String(message) => Some(message),
    serde_json::Value::Array(items) => items
      .first()
      .and_then(|item| item.get("msg"))
      .and_then(|msg| msg.as_str())
      .map(String::from),
    _ => None,
  }
}

fn invalid_url<T>(error: color_eyre::Report, fallback: &str) -> ServiceResponse<T> {
  warn!("{}", error);
  ServiceResponse::err(fallback)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::review::fixtures;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client_for(server: &MockServer) -> ReviewClient {
    ReviewClient::with_base_url(
      &server.uri(),
      Some("valid-token".to_string()),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn test_pr_details() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/42/pull-requests/7"))
      .and(header("authorization", "Bearer valid-token"))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::pr_details(42, 7)))
      .expect(1)
      .mount(&server)
      .await;

    let response = client_for(&server).pr_details(42, 7).await;

    assert!(response.success);
    let details = response.data.unwrap();
    assert_eq!(details.platform, "github");
    assert_eq!(details.pull_request.number, 7);
    assert_eq!(details.pull_request.files.len(), 1);
  }

  #[tokio::test]
  async fn test_error_detail_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/42/pull-requests/8"))
      .respond_with(
        ResponseTemplate::new(404).set_body_json(serde_json::json!({ "detail": "not found" })),
      )
      .mount(&server)
      .await;

    let response = client_for(&server).pr_details(42, 8).await;
    assert_eq!(response, ServiceResponse::err("not found"));
  }

  #[tokio::test]
  async fn test_error_without_detail_uses_default_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/42/branches"))
      .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
      .mount(&server)
      .await;

    let response = client_for(&server).branches(42).await;
    assert_eq!(response.error.as_deref(), Some("Failed to fetch branches"));
  }

  #[tokio::test]
  async fn test_validation_error_keeps_first_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/42/members"))
      .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
        "detail": [{ "loc": ["path", "project_id"], "msg": "value is not a valid integer" }]
      })))
      .mount(&server)
      .await;

    let response = client_for(&server).members(42).await;
    assert_eq!(response.error.as_deref(), Some("value is not a valid integer"));
  }

  #[tokio::test]
  async fn test_unparseable_body_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/3"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": 3 })))
      .mount(&server)
      .await;

    let response = client_for(&server).project(3).await;
    assert_eq!(response, ServiceResponse::err("Failed to get project"));
  }

  #[tokio::test]
  async fn test_pull_requests_sends_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects/42/pull-requests"))
      .and(query_param("state", "closed"))
      .and(query_param("page", "2"))
      .and(query_param("per_page", "20"))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::pull_requests(42, 2)))
      .expect(1)
      .mount(&server)
      .await;

    let filter = PullRequestFilter {
      state: "closed".to_string(),
      page: 2,
      per_page: 20,
    };
    let response = client_for(&server).pull_requests(42, &filter).await;

    let list = response.data.unwrap();
    assert_eq!(list.page, 2);
    assert_eq!(list.pull_requests[0].number, 7);
  }

  #[tokio::test]
  async fn test_create_comment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/comments/projects/42/pull-requests/7"))
      .and(body_json(serde_json::json!({ "comment_text": "Looks good" })))
      .respond_with(ResponseTemplate::new(201).set_body_json(fixtures::comment(9, "Looks good")))
      .expect(1)
      .mount(&server)
      .await;

    let response = client_for(&server).create_comment(42, 7, "Looks good").await;
    assert_eq!(response.data.map(|c| c.id), Some(9));
  }

  #[tokio::test]
  async fn test_update_comment() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/comments/9"))
      .and(body_json(serde_json::json!({ "comment_text": "Looks better" })))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::comment(9, "Looks better")))
      .expect(1)
      .mount(&server)
      .await;

    let response = client_for(&server).update_comment(9, "Looks better").await;
    assert_eq!(
      response.data.map(|c| c.comment_text).as_deref(),
      Some("Looks better")
    );
  }

  #[tokio::test]
  async fn test_projects_asks_for_one_large_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/projects"))
      .and(query_param("per_page", "100"))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::projects(&[1, 2])))
      .expect(1)
      .mount(&server)
      .await;

    let response = client_for(&server).projects(100).await;
    let list = response.data.unwrap();
    assert_eq!(list.total, 2);
    assert_eq!(list.projects[1].id, 2);
  }

  #[tokio::test]
  async fn test_ai_reviews() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/ai-reviews/projects/42/pull-requests/7"))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::ai_reviews(42, 7)))
      .expect(1)
      .mount(&server)
      .await;

    let reviews = client_for(&server).ai_reviews(42, 7).await.data.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].status, "completed");
    assert_eq!(reviews[0].issues_found, 3);
  }

  #[tokio::test]
  async fn test_delete_comment_without_body() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .and(path("/comments/9"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let response = client_for(&server).delete_comment(9).await;
    assert_eq!(response, ServiceResponse::ok(()));
  }

  #[tokio::test]
  async fn test_base_path_is_kept() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/v1/projects/5"))
      .respond_with(ResponseTemplate::new(200).set_body_json(fixtures::project(5)))
      .mount(&server)
      .await;

    let client = ReviewClient::with_base_url(
      &format!("{}/api/v1/", server.uri()),
      None,
      Duration::from_secs(5),
    )
    .unwrap();

    let response = client.project(5).await;
    assert_eq!(response.data.map(|p| p.id), Some(5));
  }

  #[tokio::test]
  async fn test_unreachable_server_uses_default_message() {
    let client =
      ReviewClient::with_base_url("http://127.0.0.1:1", None, Duration::from_secs(1)).unwrap();
    let response = client.pr_comments(42, 7).await;
    assert_eq!(response, ServiceResponse::err("Failed to fetch comments"));
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(ReviewClient::with_base_url("not a url", None, Duration::from_secs(1)).is_err());
    assert!(ReviewClient::with_base_url("mailto:a@b.c", None, Duration::from_secs(1)).is_err());
  }
}
