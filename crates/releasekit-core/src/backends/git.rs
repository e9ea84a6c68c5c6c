use crate::backends::Vcs;
use crate::commits::Commit;
use crate::errors::{ReleaseKitError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Field and record separators for `git log` parsing. Control characters
/// cannot appear in commit metadata, so splitting stays unambiguous.
const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

/// Git backend shelling out to the `git` binary.
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(ReleaseKitError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_transient_git_failure(&stderr) {
                return Err(ReleaseKitError::VcsTransient(format!(
                    "git {} failed: {stderr}",
                    args.first().unwrap_or(&"")
                )));
            }
            return Err(ReleaseKitError::Vcs(format!(
                "git {} failed: {stderr}",
                args.first().unwrap_or(&"")
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Network-shaped git failures retry; everything else is permanent.
fn is_transient_git_failure(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    [
        "could not resolve host",
        "connection reset",
        "connection timed out",
        "operation timed out",
        "early eof",
        "the remote end hung up",
        "failed to connect",
        "503",
        "502",
    ]
    .iter()
    .any(|marker| lowered.contains(marker))
}

impl Vcs for GitCli {
    fn is_clean(&self) -> Result<bool> {
        let output = self.run(&["status", "--porcelain"])?;
        Ok(output.trim().is_empty())
    }

    fn is_shallow(&self) -> Result<bool> {
        let output = self.run(&["rev-parse", "--is-shallow-repository"])?;
        Ok(output.trim() == "true")
    }

    fn current_sha(&self) -> Result<String> {
        Ok(self.run(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    fn current_branch(&self) -> Result<String> {
        let branch = self
            .run(&["rev-parse", "--abbrev-ref", "HEAD"])?
            .trim()
            .trim_start_matches("refs/heads/")
            .to_string();
        if branch.is_empty() || branch == "HEAD" {
            return Err(ReleaseKitError::Vcs(
                "Unable to determine current git branch (detached HEAD)".into(),
            ));
        }
        Ok(branch)
    }

    fn log(&self, since_tag: Option<&str>, paths: &[PathBuf]) -> Result<Vec<Commit>> {
        let format = format!("%H{FIELD_SEP}%an{FIELD_SEP}%B{RECORD_SEP}");
        let range = match since_tag {
            Some(tag) => format!("{tag}..HEAD"),
            None => "HEAD".to_string(),
        };

        let mut args: Vec<String> = vec![
            "log".into(),
            format!("--format={format}"),
            range,
        ];
        if !paths.is_empty() {
            args.push("--".into());
            for path in paths {
                args.push(path.display().to_string());
            }
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self.run(&arg_refs)?;

        Ok(parse_log_output(&output))
    }

    fn diff(&self, sha: &str) -> Result<Vec<PathBuf>> {
        let output = self.run(&["diff", "--name-only", sha])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    fn commit(&self, paths: &[PathBuf], message: &str) -> Result<String> {
        let mut add_args: Vec<String> = vec!["add".into(), "--".into()];
        for path in paths {
            add_args.push(path.display().to_string());
        }
        let refs: Vec<&str> = add_args.iter().map(|s| s.as_str()).collect();
        self.run(&refs)?;

        self.run(&["commit", "-m", message])?;
        self.current_sha()
    }

    fn tag(&self, name: &str, message: &str) -> Result<()> {
        self.run(&["tag", "-a", name, "-m", message])?;
        Ok(())
    }

    fn tag_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(&["tag", "--list", name])?;
        Ok(output.lines().any(|l| l.trim() == name))
    }

    fn list_tags(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let output = match pattern {
            Some(glob) => self.run(&["tag", "--list", glob])?,
            None => self.run(&["tag", "--list"])?,
        };
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn push(&self, reference: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["push", "--force-with-lease", "origin", reference])?;
        } else {
            self.run(&["push", "origin", reference])?;
        }
        Ok(())
    }

    fn checkout(&self, reference: &str) -> Result<()> {
        self.run(&["checkout", reference])?;
        Ok(())
    }

    fn cherry_pick(&self, sha: &str) -> Result<()> {
        self.run(&["cherry-pick", sha])?;
        Ok(())
    }
}

fn parse_log_output(output: &str) -> Vec<Commit> {
    output
        .split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches(['\n', '\r']);
            if record.trim().is_empty() {
                return None;
            }
            let mut fields = record.splitn(3, FIELD_SEP);
            let sha = fields.next()?.trim();
            let author = fields.next()?.trim();
            let message = fields.next()?.trim_end();
            if sha.is_empty() {
                return None;
            }
            Some(Commit::parse(sha, author, message))
        })
        .collect()
}

/// Find the most recent release tag for a package given its tag format.
///
/// Matches `{version}` as a glob and returns the lexicographically newest
/// by version ordering of the captured suffix. Returns `None` when the
/// package has never been tagged (first release).
pub fn last_release_tag(
    vcs: &dyn Vcs,
    tag_format: &str,
    package_name: &str,
) -> Result<Option<String>> {
    let pattern = tag_format
        .replace("{name}", package_name)
        .replace("{version}", "*");
    let tags = vcs.list_tags(Some(&pattern))?;
    if tags.is_empty() {
        return Ok(None);
    }

    let prefix_len = tag_format
        .replace("{name}", package_name)
        .find("{version}")
        .unwrap_or(0);

    let mut best: Option<(semver::Version, String)> = None;
    for tag in tags {
        let candidate = &tag[prefix_len.min(tag.len())..];
        if let Ok(version) = crate::versioning::parse_version_string(candidate) {
            let better = best.as_ref().map(|(v, _)| version > *v).unwrap_or(true);
            if better {
                best = Some((version, tag));
            }
        }
    }
    Ok(best.map(|(_, tag)| tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .status()
            .expect("git invocation");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo() -> (tempfile::TempDir, GitCli) {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        git(root, &["init", "-q", "-b", "main"]);
        git(root, &["config", "user.email", "test@example.com"]);
        git(root, &["config", "user.name", "Test"]);
        let cli = GitCli::new(root);
        (temp, cli)
    }

    #[test]
    fn clean_and_sha_roundtrip() {
        let (temp, cli) = init_repo();
        fs::write(temp.path().join("a.txt"), "hello").unwrap();
        assert!(!cli.is_clean().unwrap());

        let sha = cli
            .commit(&[PathBuf::from("a.txt")], "feat: initial import")
            .unwrap();
        assert_eq!(sha.len(), 40);
        assert!(cli.is_clean().unwrap());
        assert_eq!(cli.current_branch().unwrap(), "main");
    }

    #[test]
    fn log_parses_conventional_commits() {
        let (temp, cli) = init_repo();
        fs::write(temp.path().join("a.txt"), "one").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "feat(core): add one")
            .unwrap();
        fs::write(temp.path().join("a.txt"), "two").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "fix: repair two\n\nRefs: #9")
            .unwrap();

        let commits = cli.log(None, &[]).unwrap();
        assert_eq!(commits.len(), 2);
        // Newest first.
        assert_eq!(commits[0].subject, "fix: repair two");
        assert_eq!(commits[0].pr_number, Some(9));
        assert_eq!(commits[1].scope.as_deref(), Some("core"));
    }

    #[test]
    fn log_scopes_to_paths() {
        let (temp, cli) = init_repo();
        fs::create_dir_all(temp.path().join("pkg-a")).unwrap();
        fs::create_dir_all(temp.path().join("pkg-b")).unwrap();
        fs::write(temp.path().join("pkg-a/f.txt"), "a").unwrap();
        cli.commit(&[PathBuf::from("pkg-a/f.txt")], "feat: touch a")
            .unwrap();
        fs::write(temp.path().join("pkg-b/f.txt"), "b").unwrap();
        cli.commit(&[PathBuf::from("pkg-b/f.txt")], "feat: touch b")
            .unwrap();

        let commits = cli.log(None, &[PathBuf::from("pkg-a")]).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "feat: touch a");
    }

    #[test]
    fn tags_roundtrip() {
        let (temp, cli) = init_repo();
        fs::write(temp.path().join("a.txt"), "x").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "chore: seed").unwrap();

        cli.tag("core-v1.0.0", "Release core 1.0.0").unwrap();
        cli.tag("core-v1.1.0", "Release core 1.1.0").unwrap();
        assert!(cli.tag_exists("core-v1.0.0").unwrap());
        assert!(!cli.tag_exists("core-v2.0.0").unwrap());

        let tags = cli.list_tags(Some("core-v*")).unwrap();
        assert_eq!(tags.len(), 2);

        let last = last_release_tag(&cli, "{name}-v{version}", "core").unwrap();
        assert_eq!(last.as_deref(), Some("core-v1.1.0"));
    }

    #[test]
    fn last_release_tag_none_for_untagged_package() {
        let (temp, cli) = init_repo();
        fs::write(temp.path().join("a.txt"), "x").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "chore: seed").unwrap();
        let last = last_release_tag(&cli, "{name}-v{version}", "core").unwrap();
        assert_eq!(last, None);
    }

    #[test]
    fn log_since_tag_bounds_the_window() {
        let (temp, cli) = init_repo();
        fs::write(temp.path().join("a.txt"), "1").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "feat: before tag")
            .unwrap();
        cli.tag("v1.0.0", "Release 1.0.0").unwrap();
        fs::write(temp.path().join("a.txt"), "2").unwrap();
        cli.commit(&[PathBuf::from("a.txt")], "fix: after tag")
            .unwrap();

        let commits = cli.log(Some("v1.0.0"), &[]).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].subject, "fix: after tag");
    }

    #[test]
    fn transient_classification_matches_network_failures() {
        assert!(is_transient_git_failure(
            "fatal: unable to access: Could not resolve host: github.com"
        ));
        assert!(!is_transient_git_failure("fatal: not a git repository"));
    }
}
