//! JSON bodies shared by the review tests.

use serde_json::{json, Value};

pub fn project(id: i64) -> Value {
  json!({
    "id": id,
    "name": "prq",
    "description": "Review client",
    "platform": "GITHUB",
    "repository_url": "https://github.com/example/prq",
    "is_active": true,
    "stats": {
      "branches_count": 2,
      "open_prs_count": 1,
      "closed_prs_count": 4,
      "total_prs_count": 5
    }
  })
}

pub fn pr_details(project_id: i64, number: u64) -> Value {
  json!({
    "project_id": project_id,
    "platform": "github",
    "pull_request": {
      "number": number,
      "title": "Add query cache",
      "description": "",
      "state": "open",
      "author": { "username": "octocat" },
      "source_branch": "feature/cache",
      "target_branch": "main",
      "created_at": "2024-05-01T10:00:00Z",
      "updated_at": "2024-05-02T10:00:00Z",
      "commits": [
        {
          "sha": "abc123",
          "message": "Add cache",
          "author": "octocat",
          "date": "2024-05-01T10:00:00Z"
        }
      ],
      "files": [
        {
          "filename": "src/cache.rs",
          "status": "added",
          "additions": 10,
          "deletions": 0,
          "changes": 10
        }
      ],
      "stats": {
        "total_commits": 1,
        "total_additions": 10,
        "total_deletions": 0,
        "total_changes": 10,
        "changed_files": 1
      }
    }
  })
}

pub fn comment(id: i64, text: &str) -> Value {
  json!({
    "id": id,
    "project_id": 42,
    "pr_number": 7,
    "user_id": 1,
    "comment_text": text,
    "is_deleted": false,
    "created_at": "2024-05-01T10:00:00Z"
  })
}

pub fn comments(texts: &[&str]) -> Value {
  let comments: Vec<Value> = texts
    .iter()
    .enumerate()
    .map(|(i, text)| comment(i as i64 + 1, text))
    .collect();
  json!({
    "comments": comments,
    "total": texts.len(),
    "page": 1,
    "per_page": 50
  })
}

pub fn branches(project_id: i64) -> Value {
  json!({
    "project_id": project_id,
    "platform": "GITHUB",
    "branches": [
      { "name": "main", "commit": { "sha": "abc123" }, "protected": true }
    ]
  })
}

pub fn members(project_id: i64) -> Value {
  json!([
    {
      "id": 1,
      "user_id": 1,
      "project_id": project_id,
      "role": "OWNER",
      "joined_at": "2024-01-01T00:00:00Z",
      "user": { "id": 1, "email": "owner@example.com", "username": "owner" }
    }
  ])
}

pub fn pull_requests(project_id: i64, page: u32) -> Value {
  json!({
    "project_id": project_id,
    "platform": "GITHUB",
    "total": 1,
    "page": page,
    "per_page": 20,
    "pull_requests": [
      {
        "number": 7,
        "title": "Add query cache",
        "state": "open",
        "author": "octocat",
        "source_branch": "feature/cache",
        "target_branch": "main",
        "created_at": "2024-05-01T10:00:00Z",
        "updated_at": "2024-05-02T10:00:00Z",
        "comments_count": 2
      }
    ]
  })
}

pub fn projects(ids: &[i64]) -> Value {
  let projects: Vec<Value> = ids
    .iter()
    .map(|&id| {
      let mut project = project(id);
      project["updated_at"] = json!(format!("2024-05-0{}T10:00:00Z", id));
      project
    })
    .collect();
  json!({
    "total": ids.len(),
    "page": 1,
    "per_page": 100,
    "total_pages": 1,
    "projects": projects
  })
}

pub fn ai_reviews(project_id: i64, pr_number: u64) -> Value {
  json!([
    {
      "id": 11,
      "project_id": project_id,
      "pr_number": pr_number,
      "status": "completed",
      "overall_rating": "good",
      "summary": "Two naming issues and one missing test",
      "files_analyzed": 4,
      "issues_found": 3,
      "ai_model": "review-model",
      "tokens_used": 1200,
      "processing_time_seconds": 8.5,
      "requested_by": 1,
      "created_at": "2024-05-02T10:00:00Z",
      "completed_at": "2024-05-02T10:00:09Z"
    }
  ])
}
