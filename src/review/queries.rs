//! Review API calls bound to the query cache.
//!
//! Each query has a fixed key shape, an enablement rule and a stale time:
//!
//! | query         | key                                               | stale |
//! |---------------|---------------------------------------------------|-------|
//! | PR details    | `["project", p, "pr", n, "details"]`              | 3 min |
//! | PR comments   | `["project", p, "pr", n, "comments"]`             | 2 min |
//! | AI reviews    | `["project", p, "pr", n, "ai-reviews"]`           | 2 min |
//! | pull requests | `["project", p, "pull-requests", {state, page, per_page}]` | 2 min |
//! | project       | `["project", p]`                                  | configured |
//! | branches      | `["project", p, "branches"]`                      | configured |
//! | members       | `["project", p, "members"]`                       | configured |
//! | dashboard     | `["projects"]`                                    | none  |
//!
//! Every per-project key starts with `["project", p]`, so invalidating that
//! prefix refreshes everything known about a project.

use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::config::Config;
use crate::query::{
  with_retry, with_timeout, FetchResult, QueryClient, QueryOptions, QueryResult, RetryPolicy,
  ServiceResponse,
};

use super::client::ReviewClient;
use super::types::{
  AiReview, BranchList, Comment, CommentList, Dashboard, DashboardStats, Member, Project,
  ProjectList, ProjectOverview, PullRequestDetailsResponse, PullRequestFilter, PullRequestList,
};

const PR_DETAILS_STALE_TIME: Duration = Duration::from_secs(3 * 60);
const PR_COMMENTS_STALE_TIME: Duration = Duration::from_secs(2 * 60);
const AI_REVIEWS_STALE_TIME: Duration = Duration::from_secs(2 * 60);
// PRs change more often than projects
const PULL_REQUESTS_STALE_TIME: Duration = Duration::from_secs(2 * 60);
const DASHBOARD_PAGE_SIZE: u32 = 100;

/// Key builders.
pub mod keys {
  use super::PullRequestFilter;
  use crate::query::QueryKey;
  use crate::query_key;

  pub fn projects() -> QueryKey {
    query_key!["projects"]
  }

  pub fn project(project_id: i64) -> QueryKey {
    query_key!["project", project_id]
  }

  pub fn branches(project_id: i64) -> QueryKey {
    project(project_id).push("branches")
  }

  pub fn members(project_id: i64) -> QueryKey {
    project(project_id).push("members")
  }

  pub fn pull_requests(project_id: i64, filter: &PullRequestFilter) -> QueryKey {
    project(project_id).push("pull-requests").object([
      ("state", crate::query::KeySegment::from(filter.state.as_str())),
      ("page", filter.page.into()),
      ("per_page", filter.per_page.into()),
    ])
  }

  pub fn pr(project_id: i64, pr_number: u64) -> QueryKey {
    // PR numbers are far below i64::MAX; saturate rather than wrap
    let number = i64::try_from(pr_number).unwrap_or(i64::MAX);
    project(project_id).push("pr").push(number)
  }

  pub fn pr_details(project_id: i64, pr_number: u64) -> QueryKey {
    pr(project_id, pr_number).push("details")
  }

  pub fn pr_comments(project_id: i64, pr_number: u64) -> QueryKey {
    pr(project_id, pr_number).push("comments")
  }

  pub fn pr_ai_reviews(project_id: i64, pr_number: u64) -> QueryKey {
    pr(project_id, pr_number).push("ai-reviews")
  }
}

/// Cached review queries and the mutations that invalidate them.
#[derive(Clone)]
pub struct ReviewQueries {
  api: ReviewClient,
  cache: QueryClient,
  retry: RetryPolicy,
  timeout: Duration,
  project_stale_time: Duration,
}

impl ReviewQueries {
  pub fn new(api: ReviewClient, cache: QueryClient, config: &Config) -> Self {
    Self {
      api,
      cache,
      retry: config.retry_policy(),
      timeout: config.request_timeout(),
      project_stale_time: config.default_stale_time(),
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn cache(&self) -> &QueryClient {
    &self.cache
  }

  /// Pull request details. Disabled unless both ids are positive.
  pub async fn pr_details(
    &self,
    project_id: i64,
    pr_number: u64,
  ) -> QueryResult<PullRequestDetailsResponse> {
    let options = QueryOptions::new()
      .enabled(project_id > 0 && pr_number > 0)
      .stale_time(PR_DETAILS_STALE_TIME);
    let fetch = self.fetcher(move |api| async move { api.pr_details(project_id, pr_number).await });

    self
      .cache
      .fetch_query(&keys::pr_details(project_id, pr_number), fetch, options)
      .await
  }

  /// Comments on a pull request. Disabled unless both ids are positive.
  pub async fn pr_comments(&self, project_id: i64, pr_number: u64) -> QueryResult<CommentList> {
    let options = QueryOptions::new()
      .enabled(project_id > 0 && pr_number > 0)
      .stale_time(PR_COMMENTS_STALE_TIME);
    let fetch =
      self.fetcher(move |api| async move { api.pr_comments(project_id, pr_number).await });

    self
      .cache
      .fetch_query(&keys::pr_comments(project_id, pr_number), fetch, options)
      .await
  }

  /// Automated reviews of a pull request. Disabled unless both ids are positive.
  pub async fn ai_reviews(&self, project_id: i64, pr_number: u64) -> QueryResult<Vec<AiReview>> {
    let options = QueryOptions::new()
      .enabled(project_id > 0 && pr_number > 0)
      .stale_time(AI_REVIEWS_STALE_TIME);
    let fetch = self.fetcher(move |api| async move { api.ai_reviews(project_id, pr_number).await });

    self
      .cache
      .fetch_query(&keys::pr_ai_reviews(project_id, pr_number), fetch, options)
      .await
  }

  /// The user's projects with counters derived from them. Always refetched.
  pub async fn dashboard(&self) -> QueryResult<Dashboard> {
    let fetch = self.fetcher(|api| async move { api.projects(DASHBOARD_PAGE_SIZE).await });
    let list: QueryResult<ProjectList> = self
      .cache
      .fetch_query(&keys::projects(), fetch, QueryOptions::new())
      .await;

    list.map(|list| Dashboard {
      stats: DashboardStats::from_projects(&list.projects),
      projects: list.projects.clone(),
    })
  }

  /// One page of pull requests. Each filter combination is its own entry.
  pub async fn pull_requests(
    &self,
    project_id: i64,
    filter: &PullRequestFilter,
  ) -> QueryResult<PullRequestList> {
    let options = QueryOptions::new()
      .enabled(project_id > 0)
      .stale_time(PULL_REQUESTS_STALE_TIME);
    let key = keys::pull_requests(project_id, filter);
    let filter = filter.clone();
    let fetch = self.fetcher(move |api| {
      let filter = filter.clone();
      async move { api.pull_requests(project_id, &filter).await }
    });

    self.cache.fetch_query(&key, fetch, options).await
  }

  pub async fn project(&self, project_id: i64) -> QueryResult<Project> {
    let options = QueryOptions::new()
      .enabled(project_id > 0)
      .stale_time(self.project_stale_time);
    let fetch = self.fetcher(move |api| async move { api.project(project_id).await });

    self
      .cache
      .fetch_query(&keys::project(project_id), fetch, options)
      .await
  }

  /// Branches of a project; `enabled` is whether the project itself loaded.
  pub async fn branches(&self, project_id: i64, enabled: bool) -> QueryResult<BranchList> {
    let options = QueryOptions::new()
      .enabled(enabled && project_id > 0)
      .stale_time(self.project_stale_time);
    let fetch = self.fetcher(move |api| async move { api.branches(project_id).await });

    self
      .cache
      .fetch_query(&keys::branches(project_id), fetch, options)
      .await
  }

  /// Members of a project; `enabled` is whether the project itself loaded.
  pub async fn members(&self, project_id: i64, enabled: bool) -> QueryResult<Vec<Member>> {
    let options = QueryOptions::new()
      .enabled(enabled && project_id > 0)
      .stale_time(self.project_stale_time);
    let fetch = self.fetcher(move |api| async move { api.members(project_id).await });

    self
      .cache
      .fetch_query(&keys::members(project_id), fetch, options)
      .await
  }

  /// The project, then its branches and members side by side.
  ///
  /// Branches and members only run once the project loaded. A failure in
  /// either is reported through `error` next to the project data.
  pub async fn project_overview(&self, project_id: i64) -> QueryResult<ProjectOverview> {
    let project = self.project(project_id).await;
    let loaded = project.data.is_some();

    let (branches, members) = futures::join!(
      self.branches(project_id, loaded),
      self.members(project_id, loaded)
    );

    let mut overview = project.map(|project| ProjectOverview {
      project: project.clone(),
      branches: branches.data().cloned(),
      members: members.data().cloned(),
    });
    if overview.error.is_none() {
      overview.error = branches.error.or(members.error);
    }
    overview
  }

  /// Add a comment, then refresh the PR's comments.
  pub async fn create_comment(
    &self,
    project_id: i64,
    pr_number: u64,
    text: &str,
  ) -> ServiceResponse<Comment> {
    let response = self.api.create_comment(project_id, pr_number, text).await;
    if response.success {
      self.comments_changed(project_id, pr_number);
    }
    response
  }

  /// Edit a comment, then refresh the PR's comments.
  pub async fn update_comment(
    &self,
    project_id: i64,
    pr_number: u64,
    comment_id: i64,
    text: &str,
  ) -> ServiceResponse<Comment> {
    let response = self.api.update_comment(comment_id, text).await;
    if response.success {
      self.comments_changed(project_id, pr_number);
    }
    response
  }

  /// Delete a comment, then refresh the PR's comments.
  pub async fn delete_comment(
    &self,
    project_id: i64,
    pr_number: u64,
    comment_id: i64,
  ) -> ServiceResponse<()> {
    let response = self.api.delete_comment(comment_id).await;
    if response.success {
      self.comments_changed(project_id, pr_number);
    }
    response
  }

  fn comments_changed(&self, project_id: i64, pr_number: u64) {
    let key = keys::pr_comments(project_id, pr_number);
    let count = self.cache.invalidate_queries(&key);
    debug!(%key, count, "comments changed");
  }

  /// Wrap an API call as a cache fetcher, with retry and timeout applied.
  fn fetcher<T, F, Fut>(
    &self,
    call: F,
  ) -> impl FnOnce() -> BoxFuture<'static, FetchResult<T>> + Send + 'static
  where
    T: Send + 'static,
    F: Fn(ReviewClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServiceResponse<T>> + Send + 'static,
  {
    let api = self.api.clone();
    let retry = self.retry;
    let timeout = self.timeout;

    move || {
      async move {
        with_retry(retry, || {
          with_timeout(timeout, call(api.clone()).map(ServiceResponse::into_fetch_result))
        })
        .await
      }
      .boxed()
    }
  }
}

impl std::fmt::Debug for ReviewQueries {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ReviewQueries")
      .field("cache", &self.cache)
      .field("retry", &self.retry)
      .field("timeout", &self.timeout)
      .finish_non_exhaustive()
  }
}
