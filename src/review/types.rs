use serde::{Deserialize, Serialize};

/// Project with activity counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: i64,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  pub platform: String, // "GITHUB" or "GITLAB"
  pub repository_url: String,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub updated_at: Option<String>,
  #[serde(default)]
  pub stats: Option<ProjectStats>,
}

/// One page of the user's projects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectList {
  pub total: u64,
  pub page: u32,
  pub per_page: u32,
  #[serde(default)]
  pub total_pages: u32,
  pub projects: Vec<Project>,
}

/// Counters derived from the project list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
  pub total_projects: usize,
  pub active_projects: usize,
  pub github_projects: usize,
  pub gitlab_projects: usize,
  pub last_activity: Option<String>,
}

impl DashboardStats {
  pub fn from_projects(projects: &[Project]) -> Self {
    let on = |platform: &str| projects.iter().filter(|p| p.platform == platform).count();
    Self {
      total_projects: projects.len(),
      active_projects: projects.iter().filter(|p| p.is_active).count(),
      github_projects: on("GITHUB"),
      gitlab_projects: on("GITLAB"),
      // ISO-8601 timestamps order lexically
      last_activity: projects.iter().filter_map(|p| p.updated_at.clone()).max(),
    }
  }
}

/// The user's projects with their counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
  pub projects: Vec<Project>,
  pub stats: DashboardStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
  pub branches_count: u64,
  pub open_prs_count: u64,
  pub closed_prs_count: u64,
  pub total_prs_count: u64,
  #[serde(default)]
  pub last_activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCommit {
  pub sha: String,
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
  pub name: String,
  pub commit: BranchCommit,
  #[serde(default)]
  pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchList {
  pub project_id: i64,
  pub platform: String,
  pub branches: Vec<Branch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberUser {
  pub id: i64,
  pub email: String,
  pub username: String,
  #[serde(default)]
  pub full_name: Option<String>,
}

/// Project membership
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
  pub id: i64,
  pub user_id: i64,
  pub project_id: i64,
  pub role: String, // "OWNER", "ADMIN" or "REVIEWER"
  pub joined_at: String,
  pub user: MemberUser,
}

/// Pull request summary for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
  pub number: u64,
  pub title: String,
  pub state: String,
  pub author: String,
  pub source_branch: String,
  pub target_branch: String,
  pub created_at: String,
  pub updated_at: String,
  #[serde(default)]
  pub comments_count: u64,
}

/// One page of pull requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestList {
  pub project_id: i64,
  pub platform: String,
  pub total: u64,
  pub page: u32,
  pub per_page: u32,
  pub pull_requests: Vec<PullRequestSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestAuthor {
  pub username: String,
  #[serde(default)]
  pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
  pub sha: String,
  pub message: String,
  pub author: String,
  pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
  pub filename: String,
  pub status: String, // "added", "removed", "modified", "renamed" or "copied"
  pub additions: u64,
  pub deletions: u64,
  pub changes: u64,
  #[serde(default)]
  pub patch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullRequestStats {
  pub total_commits: u64,
  pub total_additions: u64,
  pub total_deletions: u64,
  pub total_changes: u64,
  pub changed_files: u64,
}

/// Full pull request details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestDetails {
  pub number: u64,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub state: String,
  pub author: PullRequestAuthor,
  pub source_branch: String,
  pub target_branch: String,
  pub created_at: String,
  pub updated_at: String,
  #[serde(default)]
  pub merged_at: Option<String>,
  #[serde(default)]
  pub commits: Vec<CommitInfo>,
  #[serde(default)]
  pub files: Vec<FileChange>,
  #[serde(default)]
  pub stats: PullRequestStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestDetailsResponse {
  pub project_id: i64,
  pub platform: String,
  pub pull_request: PullRequestDetails,
}

/// A review comment on a pull request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
  pub id: i64,
  pub project_id: i64,
  pub pr_number: u64,
  pub user_id: i64,
  pub comment_text: String,
  #[serde(default)]
  pub is_deleted: bool,
  #[serde(default)]
  pub file_path: Option<String>,
  #[serde(default)]
  pub line_number: Option<u64>,
  pub created_at: String,
  #[serde(default)]
  pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentList {
  pub comments: Vec<Comment>,
  pub total: u64,
  pub page: u32,
  pub per_page: u32,
}

/// Automated review of a pull request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiReview {
  pub id: i64,
  pub project_id: i64,
  pub pr_number: u64,
  pub status: String, // "pending", "processing", "completed" or "failed"
  #[serde(default)]
  pub overall_rating: Option<String>,
  #[serde(default)]
  pub summary: Option<String>,
  #[serde(default)]
  pub files_analyzed: u64,
  #[serde(default)]
  pub issues_found: u64,
  pub ai_model: String,
  #[serde(default)]
  pub tokens_used: u64,
  #[serde(default)]
  pub processing_time_seconds: Option<f64>,
  pub requested_by: i64,
  pub created_at: String,
  #[serde(default)]
  pub completed_at: Option<String>,
  #[serde(default)]
  pub error_message: Option<String>,
}

/// Request body for a new or edited comment
#[derive(Debug, Clone, Serialize)]
pub struct NewComment<'a> {
  pub comment_text: &'a str,
}

/// Filters for the pull request list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestFilter {
  pub state: String, // "open", "closed" or "all"
  pub page: u32,
  pub per_page: u32,
}

impl Default for PullRequestFilter {
  fn default() -> Self {
    Self {
      state: "open".to_string(),
      page: 1,
      per_page: 20,
    }
  }
}

/// Project with its dependent queries resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectOverview {
  pub project: Project,
  pub branches: Option<BranchList>,
  pub members: Option<Vec<Member>>,
}
