use crate::agent::contract::CommentReview;
use crate::hosting::{ChangeRequest, ReviewComment};
use crate::remediation::context::AnalysisContext;

const ANALYSIS_CONTRACT: &str = r#"**Output Format (JSON only, no markdown):**
{
  "rootCause": "Brief explanation of what's causing the error",
  "canFix": true/false,
  "confidence": "high/low (high = 90%+ confident fix will work)",
  "fixType": "simple/complex (simple = single method, obvious fix)",
  "fix": "High-level explanation of the fix",
  "fixFiles": [
    {
      "path": "relative/path/to/file",
      "changes": [
        {
          "type": "replace",
          "lines": "111-111",
          "old": "exact code to find and replace (including whitespace)",
          "new": "exact replacement code (including whitespace)"
        }
      ]
    }
  ],
  "reason": "Explanation if canFix=false or confidence=low"
}

**Rules for fixFiles:**
- Each change must have type "replace" with exact "old" and "new" code snippets
- Include enough context in "old" to make it unique in the file
- Preserve exact indentation and whitespace in both "old" and "new"
- Paths are relative to the repository root
- The "lines" field is for reference only; replacement matches "old" verbatim

Your final message MUST be valid JSON only."#;

/// Prompt for root-cause analysis and a structured patch proposal.
pub fn analysis_prompt(ctx: &AnalysisContext) -> String {
    let issue = &ctx.issue;
    let error_message = issue
        .metadata
        .value
        .clone()
        .unwrap_or_else(|| issue.title.clone());
    let stack = ctx
        .exception
        .as_ref()
        .and_then(|e| serde_json::to_string_pretty(e).ok())
        .unwrap_or_else(|| "(no captured event)".to_string());

    let mut sources = String::new();
    for snippet in &ctx.source_files {
        sources.push_str(&format!(
            "\n--- {}{} ---\n{}\n",
            snippet.path,
            if snippet.truncated { " (truncated)" } else { "" },
            snippet.content
        ));
    }
    if sources.is_empty() {
        sources.push_str("(no source files could be read)\n");
    }

    format!(
        r#"Diagnose this production error in the repository at {repo}. Explore the code as needed.

**Your task:**
1. Find the code related to this error
2. Analyze the root cause
3. Decide whether this is a SIMPLE fix (missing parameter, typo, null check within a single method)
4. If simple, propose a fix. If complex, skip.

**Module:** {module}
**Issue:** {title}
**Event Count (24h):** {count}
**Level:** {level}
**Culprit:** {culprit}

**Error Message:**
{error_message}

**Stack Trace:**
{stack}

**Source Context:**
{sources}
**ONLY PROCEED WITH FIX IF:**
- The error is caused by something obvious: missing parameter, typo, missing null check
- The fix is within a SINGLE METHOD (no multi-file refactoring)
- You are 90%+ confident the fix will work

**SKIP IF:**
- The error requires understanding complex business logic
- The fix needs changes across multiple methods or files
- The root cause is unclear or requires deep investigation

{contract}"#,
        repo = ctx.repo_path.display(),
        module = ctx.module,
        title = issue.title,
        count = issue.count,
        level = issue.level.as_deref().unwrap_or("unknown"),
        culprit = issue.culprit.as_deref().unwrap_or("unknown"),
        error_message = error_message,
        stack = stack,
        sources = sources,
        contract = ANALYSIS_CONTRACT,
    )
}

/// Prompt asking whether a reviewer comment requests a code change.
pub fn comment_review_prompt(change_request: &ChangeRequest, comment: &ReviewComment) -> String {
    format!(
        r#"A reviewer left a comment on an automatically generated pull request.
Decide whether the comment asks for a change to the code.

**Pull request:** #{number} {title}
**Description:**
{body}

**Comment by {author}:**
{comment}

Respond with JSON only:
{{
  "needsRevision": true/false,
  "summary": "One sentence describing what the reviewer wants",
  "requestedChanges": ["each concrete change requested"]
}}"#,
        number = change_request.number,
        title = change_request.title,
        body = change_request.body,
        author = comment.author,
        comment = comment.body,
    )
}

/// Prompt for the open-ended revision mode: the agent edits the checked-out
/// branch directly.
pub fn revision_prompt(
    change_request: &ChangeRequest,
    comment: &ReviewComment,
    review: &CommentReview,
) -> String {
    let requested = if review.requested_changes.is_empty() {
        "- (see comment)".to_string()
    } else {
        review
            .requested_changes
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        r#"You are revising pull request #{number} ("{title}") on branch {branch}, which is checked out in the current directory.

A reviewer asked for changes:
{comment}

**Summary:** {summary}
**Requested changes:**
{requested}

Edit the files in the working copy directly to address the review. Keep the change minimal and do not commit; the changes are committed for you."#,
        number = change_request.number,
        title = change_request.title,
        branch = change_request.branch,
        comment = comment.body,
        summary = review.summary,
        requested = requested,
    )
}
