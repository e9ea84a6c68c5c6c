use crate::types::Bump;

/// Conventional Commit types that carry release intent.
///
/// Unknown types parse as `Other` and contribute no bump unless marked
/// breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommitType {
    Feat,
    Fix,
    Perf,
    Revert,
    Chore,
    Docs,
    Refactor,
    Test,
    Build,
    Ci,
    Style,
    Other,
}

impl CommitType {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "feat" => Self::Feat,
            "fix" => Self::Fix,
            "perf" => Self::Perf,
            "revert" => Self::Revert,
            "chore" => Self::Chore,
            "docs" => Self::Docs,
            "refactor" => Self::Refactor,
            "test" => Self::Test,
            "build" => Self::Build,
            "ci" => Self::Ci,
            "style" => Self::Style,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feat => "feat",
            Self::Fix => "fix",
            Self::Perf => "perf",
            Self::Revert => "revert",
            Self::Chore => "chore",
            Self::Docs => "docs",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Build => "build",
            Self::Ci => "ci",
            Self::Style => "style",
            Self::Other => "other",
        }
    }
}

/// A parsed commit from the release window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    /// First line of the message, verbatim.
    pub subject: String,
    /// Full message body below the subject.
    pub body: String,
    pub commit_type: CommitType,
    pub scope: Option<String>,
    /// The description after "type(scope)!: ".
    pub description: String,
    pub breaking: bool,
    pub is_revert: bool,
    /// Sha named in the body of a revert commit ("This reverts commit <sha>.").
    pub reverts_sha: Option<String>,
    /// PR number parsed from a trailing "(#123)" in the subject.
    pub pr_number: Option<u64>,
}

impl Commit {
    /// Parse a raw commit into its Conventional Commit parts.
    ///
    /// Unparseable subjects still yield a `Commit` (type `Other`, no bump
    /// contribution) so the changelog can list them under "Other".
    pub fn parse(sha: &str, author: &str, message: &str) -> Self {
        let mut lines = message.lines();
        let subject = lines.next().unwrap_or("").trim().to_string();
        let body: String = lines.collect::<Vec<_>>().join("\n");

        let (commit_type, scope, bang, description) = parse_subject(&subject);
        let breaking = bang || has_breaking_footer(&body);
        let is_revert =
            commit_type == CommitType::Revert || subject.starts_with("Revert \"");
        let reverts_sha = if is_revert {
            parse_reverted_sha(&body)
        } else {
            None
        };

        Commit {
            sha: sha.to_string(),
            author: author.to_string(),
            description: description.unwrap_or_else(|| subject.clone()),
            subject,
            body,
            commit_type,
            scope,
            breaking,
            is_revert,
            reverts_sha,
            pr_number: parse_pr_number(message),
        }
    }

    /// Bump contribution of this commit, ignoring revert cancellation.
    ///
    /// Breaking always wins; `feat` is minor; `fix` and `perf` are patch;
    /// everything else (including reverts themselves) contributes nothing.
    pub fn bump(&self) -> Bump {
        if self.is_revert {
            return Bump::None;
        }
        if self.breaking {
            return Bump::Major;
        }
        match self.commit_type {
            CommitType::Feat => Bump::Minor,
            CommitType::Fix | CommitType::Perf => Bump::Patch,
            _ => Bump::None,
        }
    }

    /// Abbreviated sha for display (first 7 characters).
    pub fn short_sha(&self) -> &str {
        let end = self.sha.len().min(7);
        &self.sha[..end]
    }

    /// Subject of the commit a GitHub-style revert undoes, when recoverable.
    ///
    /// `Revert "feat: add X"` yields `feat: add X`; `revert: feat: add X`
    /// yields `feat: add X`.
    pub fn reverted_subject(&self) -> Option<String> {
        if !self.is_revert {
            return None;
        }
        if let Some(rest) = self.subject.strip_prefix("Revert \"") {
            return rest.strip_suffix('"').map(|s| s.to_string());
        }
        self.subject
            .strip_prefix("revert:")
            .map(|s| s.trim().to_string())
    }
}

/// Split `type[(scope)][!]: description`. Returns (type, scope, bang, description).
///
/// A subject that does not match the grammar comes back as
/// `(Other, None, false, None)`.
fn parse_subject(subject: &str) -> (CommitType, Option<String>, bool, Option<String>) {
    let Some(colon) = subject.find(": ") else {
        return (CommitType::Other, None, false, None);
    };
    let head = &subject[..colon];
    let description = subject[colon + 2..].trim().to_string();

    let (head, bang) = match head.strip_suffix('!') {
        Some(stripped) => (stripped, true),
        None => (head, false),
    };

    let (type_str, scope) = match head.find('(') {
        Some(open) => {
            let Some(rest) = head[open..].strip_prefix('(') else {
                return (CommitType::Other, None, false, None);
            };
            let Some(close) = rest.find(')') else {
                return (CommitType::Other, None, false, None);
            };
            if open + 1 + close + 1 != head.len() {
                // Trailing junk after the scope parenthesis.
                return (CommitType::Other, None, false, None);
            }
            let scope = rest[..close].trim();
            (
                &head[..open],
                (!scope.is_empty()).then(|| scope.to_string()),
            )
        }
        None => (head, None),
    };

    if type_str.is_empty() || !type_str.chars().all(|c| c.is_ascii_alphanumeric()) {
        return (CommitType::Other, None, false, None);
    }

    (
        CommitType::parse(type_str),
        scope,
        bang,
        Some(description),
    )
}

fn has_breaking_footer(body: &str) -> bool {
    body.lines().any(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with("BREAKING CHANGE:") || trimmed.starts_with("BREAKING-CHANGE:")
    })
}

/// Extract the sha from "This reverts commit <sha>." in a revert body.
fn parse_reverted_sha(body: &str) -> Option<String> {
    const MARKER: &str = "This reverts commit ";
    let idx = body.find(MARKER)?;
    let rest = &body[idx + MARKER.len()..];
    let sha: String = rest
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    (sha.len() >= 7).then_some(sha)
}

/// Extract a PR reference from a trailing "(#123)" in the subject or a
/// "Refs: #123" footer.
fn parse_pr_number(message: &str) -> Option<u64> {
    let subject = message.lines().next().unwrap_or("");
    if let Some(open) = subject.rfind("(#") {
        let rest = &subject[open + 2..];
        if let Some(close) = rest.find(')') {
            if close == rest.len() - 1 || rest[close + 1..].trim().is_empty() {
                if let Ok(num) = rest[..close].parse::<u64>() {
                    return Some(num);
                }
            }
        }
    }
    for line in message.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("Refs:") {
            let rest = rest.trim();
            if let Some(num) = rest.strip_prefix('#') {
                let digits: String = num.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(parsed) = digits.parse::<u64>() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}
