use crate::commits::{Commit, CommitType};
use crate::errors::Result;
use crate::types::VersionBump;
use std::fs;
use std::path::Path;

/// Canonical section order for rendered changelogs.
const SECTIONS: &[(&str, SectionKind)] = &[
    ("Breaking Changes", SectionKind::Breaking),
    ("Features", SectionKind::Features),
    ("Bug Fixes", SectionKind::Fixes),
    ("Performance", SectionKind::Performance),
    ("Reverts", SectionKind::Reverts),
    ("Other", SectionKind::Other),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Breaking,
    Features,
    Fixes,
    Performance,
    Reverts,
    Other,
}

fn classify(commit: &Commit) -> Option<SectionKind> {
    if commit.is_revert {
        return Some(SectionKind::Reverts);
    }
    if commit.breaking {
        return Some(SectionKind::Breaking);
    }
    match commit.commit_type {
        CommitType::Feat => Some(SectionKind::Features),
        CommitType::Fix => Some(SectionKind::Fixes),
        CommitType::Perf => Some(SectionKind::Performance),
        CommitType::Chore | CommitType::Docs | CommitType::Refactor => Some(SectionKind::Other),
        // Test/build/ci/style noise stays out of release notes.
        CommitType::Test | CommitType::Build | CommitType::Ci | CommitType::Style => None,
        CommitType::Revert => Some(SectionKind::Reverts),
        CommitType::Other => None,
    }
}

fn render_entry(commit: &Commit) -> String {
    let mut line = match &commit.scope {
        Some(scope) => format!("- **{scope}:** {}", commit.description),
        None => format!("- {}", commit.description),
    };
    if let Some(pr) = commit.pr_number {
        line.push_str(&format!(" (#{pr})"));
    }
    line.push_str(&format!(" ({}, {})", commit.short_sha(), commit.author));
    line.push('\n');
    line
}

/// Render one version section for a package from its window commits.
pub fn render_section(version: &str, date: Option<&str>, commits: &[Commit]) -> String {
    let mut section = match date.filter(|d| !d.trim().is_empty()) {
        Some(date) => format!("## {version} — {date}\n\n"),
        None => format!("## {version}\n\n"),
    };

    for (title, kind) in SECTIONS {
        let entries: Vec<&Commit> = commits
            .iter()
            .filter(|c| classify(c) == Some(*kind))
            .collect();
        if entries.is_empty() {
            continue;
        }
        section.push_str(&format!("### {title}\n\n"));
        for commit in entries {
            section.push_str(&render_entry(commit));
        }
        section.push('\n');
    }

    section
}

fn split_intro_and_versions(body: &str) -> (&str, &str) {
    let mut offset = 0;
    let len = body.len();
    while offset < len {
        if body[offset..].starts_with("## ") {
            return body.split_at(offset);
        }
        match body[offset..].find('\n') {
            Some(newline_offset) => offset += newline_offset + 1,
            None => break,
        }
    }
    (body, "")
}

/// Insert a new version section at the top of a package changelog.
///
/// The intro above the first `## ` header is preserved verbatim; historical
/// sections are never rewritten. A section for the same version replaces
/// itself, which keeps `prepare` reruns idempotent.
pub fn update_changelog(
    package_dir: &Path,
    package_name: &str,
    version: &str,
    date: Option<&str>,
    commits: &[Commit],
) -> Result<()> {
    let path = package_dir.join("CHANGELOG.md");
    let existing = if path.exists() {
        fs::read_to_string(&path)?
    } else {
        String::new()
    };
    let cleaned = existing.trim_start_matches('\u{feff}');
    let (intro_part, versions_part) = split_intro_and_versions(cleaned);

    let mut intro = intro_part.to_string();
    if intro.trim().is_empty() {
        intro = format!("# {package_name}\n\n");
    }

    // Replace an existing top section for this same version instead of
    // stacking a duplicate.
    let mut versions_body = versions_part.to_string();
    let top_header = versions_body
        .lines()
        .next()
        .map(|l| l.trim_start_matches("## ").trim().to_string());
    if let Some(header) = top_header {
        let header_version = header.split_whitespace().next().unwrap_or("");
        if header_version == version {
            versions_body = match versions_body.find("\n## ") {
                Some(pos) => versions_body[pos + 1..].to_string(),
                None => String::new(),
            };
        }
    }

    let section = render_section(version, date, commits);

    let mut combined = String::new();
    combined.push_str(&intro);
    if !combined.ends_with("\n\n") {
        if combined.ends_with('\n') {
            combined.push('\n');
        } else {
            combined.push_str("\n\n");
        }
    }
    combined.push_str(&section);
    if !versions_body.trim().is_empty() {
        if !combined.ends_with("\n\n") {
            combined.push('\n');
        }
        combined.push_str(&versions_body);
    }

    fs::write(&path, combined)?;
    Ok(())
}

/// Aggregate per-package sections into the umbrella body used for the
/// Release-PR description and the forge release notes.
pub fn render_umbrella(
    bumps: &[VersionBump],
    commits_by_package: &std::collections::BTreeMap<String, Vec<Commit>>,
) -> String {
    let mut body = String::new();
    for bump in bumps {
        body.push_str(&format!(
            "# {} {} → {}\n\n",
            bump.package, bump.from_version, bump.to_version
        ));
        let commits = commits_by_package
            .get(&bump.package)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let section = render_section(&bump.to_version, None, commits);
        // Drop the redundant version header inside the umbrella body.
        if let Some(pos) = section.find("\n\n") {
            body.push_str(section[pos + 2..].trim_start_matches('\n'));
        }
        if !body.ends_with('\n') {
            body.push('\n');
        }
        body.push('\n');
    }
    body.trim_end().to_string()
}
