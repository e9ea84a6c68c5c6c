use crate::errors::ReleaseKitError;
use crate::types::Bump;
use chrono::{Datelike, Utc};
use semver::{BuildMetadata, Prerelease, Version};
use std::cmp::Ordering;

/// Strategy for parsing and advancing version strings.
///
/// Schemes are small and stateless so that new ones (CalVer variants,
/// zero-ver policies) slot in without touching the version engine.
pub trait VersioningScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate that the input is a well-formed version for this scheme.
    fn validate(&self, version: &str) -> Result<(), String>;

    /// Apply a bump kind. Any existing pre-release suffix is stripped
    /// before the base is advanced; a bump of `Bump::Prerelease` advances
    /// the pre-release counter on the existing base instead.
    fn bump(&self, old: &str, kind: Bump) -> Result<String, String>;

    fn compare(&self, a: &str, b: &str) -> Result<Ordering, String>;

    /// Attach or advance a pre-release label. The counter resets to 1 on a
    /// label change and increments on a same-label republish.
    fn with_prerelease(&self, version: &str, label: &str) -> Result<String, String>;

    /// Strip any pre-release suffix, producing the stable version.
    fn strip_prerelease(&self, version: &str) -> Result<String, String>;
}

/// Look up a scheme implementation by its configured name.
pub fn scheme_by_name(name: &str) -> Result<Box<dyn VersioningScheme>, ReleaseKitError> {
    match name.to_ascii_lowercase().as_str() {
        "semver" => Ok(Box::new(Semver)),
        "pep440" => Ok(Box::new(Pep440)),
        "calver" => Ok(Box::new(CalVer)),
        other => Err(ReleaseKitError::Config(format!(
            "unknown versioning scheme '{other}' (expected semver, pep440, or calver)"
        ))),
    }
}

/// Stability ladder for pre-release labels. The order is strictly forward:
/// alpha -> beta -> rc -> stable. Backward moves are rejected by
/// [`check_escalation`].
pub fn stability_rank(label: &str) -> Option<u8> {
    match label {
        "alpha" | "a" => Some(0),
        "beta" | "b" => Some(1),
        "rc" => Some(2),
        _ => None,
    }
}

/// Validate that moving from the current pre-release label (if any) to the
/// requested one is a forward move on the stability ladder.
pub fn check_escalation(current_label: Option<&str>, new_label: &str) -> Result<(), String> {
    let new_rank = stability_rank(new_label)
        .ok_or_else(|| format!("unknown pre-release label '{new_label}' (alpha, beta, rc)"))?;
    if let Some(current) = current_label {
        let current_rank = stability_rank(current)
            .ok_or_else(|| format!("current version carries unknown label '{current}'"))?;
        if new_rank < current_rank {
            return Err(format!(
                "cannot move backward from '{current}' to '{new_label}' on the stability ladder"
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// semver
// ---------------------------------------------------------------------------

pub struct Semver;

fn normalize_version_input(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("Version string cannot be empty".to_string());
    }

    let boundary = trimmed
        .find(|ch: char| ['-', '+'].contains(&ch))
        .unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(boundary);

    let parts: Vec<&str> = if core.is_empty() {
        Vec::new()
    } else {
        core.split('.').collect()
    };

    if parts.is_empty() || parts.len() > 3 {
        return Err(format!(
            "Invalid semantic version '{input}': expected one to three numeric components"
        ));
    }

    let mut normalized_parts = Vec::with_capacity(3);
    for part in &parts {
        if part.is_empty() {
            return Err(format!(
                "Invalid semantic version '{input}': found empty numeric component"
            ));
        }
        normalized_parts.push(*part);
    }
    while normalized_parts.len() < 3 {
        normalized_parts.push("0");
    }

    Ok(format!("{}{rest}", normalized_parts.join(".")))
}

pub(crate) fn parse_version_string(input: &str) -> Result<Version, String> {
    let normalized = normalize_version_input(input)?;
    Version::parse(&normalized).map_err(|err| format!("Invalid semantic version '{input}': {err}"))
}

fn increment_prerelease(pre: &Prerelease) -> Result<Prerelease, String> {
    if pre.is_empty() {
        return Err("Pre-release identifier missing".to_string());
    }

    let mut parts: Vec<String> = pre.as_str().split('.').map(|s| s.to_string()).collect();

    let last_is_numeric = parts
        .last()
        .map(|part| part.chars().all(|ch| ch.is_ascii_digit()))
        .unwrap_or(false);

    if last_is_numeric {
        let value = parts
            .last()
            .and_then(|p| p.parse::<u64>().ok())
            .ok_or_else(|| "Pre-release component is not a valid number".to_string())?;
        let incremented = value
            .checked_add(1)
            .ok_or_else(|| "Pre-release counter overflow".to_string())?;
        if let Some(last) = parts.last_mut() {
            *last = incremented.to_string();
        }
    } else {
        parts.push("1".to_string());
    }

    let candidate = parts.join(".");
    Prerelease::new(&candidate).map_err(|err| format!("Invalid pre-release '{candidate}': {err}"))
}

fn prerelease_label(pre: &Prerelease) -> Option<String> {
    if pre.is_empty() {
        return None;
    }
    pre.as_str()
        .split('.')
        .next()
        .map(|s| s.trim_end_matches(|ch: char| ch.is_ascii_digit()).to_string())
        .filter(|s| !s.is_empty())
}

fn apply_base_bump(version: &mut Version, bump: Bump) -> Result<(), String> {
    match bump {
        Bump::Patch => {
            version.patch = version
                .patch
                .checked_add(1)
                .ok_or_else(|| "Patch component overflow".to_string())?;
        }
        Bump::Minor => {
            version.minor = version
                .minor
                .checked_add(1)
                .ok_or_else(|| "Minor component overflow".to_string())?;
            version.patch = 0;
        }
        Bump::Major => {
            version.major = version
                .major
                .checked_add(1)
                .ok_or_else(|| "Major component overflow".to_string())?;
            version.minor = 0;
            version.patch = 0;
        }
        Bump::None | Bump::Prerelease => {}
    }
    version.pre = Prerelease::EMPTY;
    version.build = BuildMetadata::EMPTY;
    Ok(())
}

impl VersioningScheme for Semver {
    fn name(&self) -> &'static str {
        "semver"
    }

    fn validate(&self, version: &str) -> Result<(), String> {
        parse_version_string(version).map(|_| ())
    }

    fn bump(&self, old: &str, kind: Bump) -> Result<String, String> {
        let mut version = parse_version_string(old)?;
        match kind {
            Bump::None => Ok(version.to_string()),
            Bump::Prerelease => {
                if version.pre.is_empty() {
                    return Err(format!(
                        "'{old}' has no pre-release suffix to advance"
                    ));
                }
                version.pre = increment_prerelease(&version.pre)?;
                version.build = BuildMetadata::EMPTY;
                Ok(version.to_string())
            }
            _ => {
                apply_base_bump(&mut version, kind)?;
                Ok(version.to_string())
            }
        }
    }

    fn compare(&self, a: &str, b: &str) -> Result<Ordering, String> {
        Ok(parse_version_string(a)?.cmp(&parse_version_string(b)?))
    }

    fn with_prerelease(&self, version: &str, label: &str) -> Result<String, String> {
        let mut parsed = parse_version_string(version)?;
        let current_label = prerelease_label(&parsed.pre);
        check_escalation(current_label.as_deref(), label)?;

        if current_label.as_deref() == Some(label) {
            parsed.pre = increment_prerelease(&parsed.pre)?;
        } else {
            parsed.pre = Prerelease::new(&format!("{label}.1"))
                .map_err(|err| format!("Invalid pre-release label '{label}': {err}"))?;
        }
        parsed.build = BuildMetadata::EMPTY;
        Ok(parsed.to_string())
    }

    fn strip_prerelease(&self, version: &str) -> Result<String, String> {
        let mut parsed = parse_version_string(version)?;
        parsed.pre = Prerelease::EMPTY;
        parsed.build = BuildMetadata::EMPTY;
        Ok(parsed.to_string())
    }
}

// ---------------------------------------------------------------------------
// PEP 440
// ---------------------------------------------------------------------------

pub struct Pep440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Pep440PreKind {
    Alpha,
    Beta,
    Rc,
}

impl Pep440PreKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Alpha => "a",
            Self::Beta => "b",
            Self::Rc => "rc",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "a" | "alpha" => Some(Self::Alpha),
            "b" | "beta" => Some(Self::Beta),
            "rc" => Some(Self::Rc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pep440Version {
    release: Vec<u64>,
    pre: Option<(Pep440PreKind, u64)>,
    dev: Option<u64>,
}

impl Pep440Version {
    fn parse(input: &str) -> Result<Self, String> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err("Version string cannot be empty".to_string());
        }

        let mut rest = trimmed;
        let mut dev = None;
        if let Some(idx) = rest.find(".dev") {
            let dev_part = &rest[idx + 4..];
            dev = Some(
                dev_part
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid PEP 440 dev segment in '{input}'"))?,
            );
            rest = &rest[..idx];
        }

        let mut pre = None;
        for (marker, kind) in [
            ("rc", Pep440PreKind::Rc),
            ("a", Pep440PreKind::Alpha),
            ("b", Pep440PreKind::Beta),
        ] {
            if let Some(idx) = rest.find(marker) {
                // Only treat the marker as a pre-segment when it follows a digit.
                if idx > 0 && rest.as_bytes()[idx - 1].is_ascii_digit() {
                    let num = &rest[idx + marker.len()..];
                    let counter = num
                        .parse::<u64>()
                        .map_err(|_| format!("Invalid PEP 440 pre-release in '{input}'"))?;
                    pre = Some((kind, counter));
                    rest = &rest[..idx];
                    break;
                }
            }
        }

        let release: Vec<u64> = rest
            .split('.')
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|_| format!("Invalid PEP 440 release segment '{part}' in '{input}'"))
            })
            .collect::<Result<_, _>>()?;
        if release.is_empty() || release.len() > 3 {
            return Err(format!(
                "Invalid PEP 440 version '{input}': expected one to three release components"
            ));
        }

        Ok(Self { release, pre, dev })
    }

    fn component(&self, idx: usize) -> u64 {
        self.release.get(idx).copied().unwrap_or(0)
    }

    fn render(&self) -> String {
        let mut out = self
            .release
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".");
        if let Some((kind, counter)) = &self.pre {
            out.push_str(kind.as_str());
            out.push_str(&counter.to_string());
        }
        if let Some(dev) = self.dev {
            out.push_str(&format!(".dev{dev}"));
        }
        out
    }

    fn sort_key(&self) -> (u64, u64, u64, u8, u64, u64) {
        // Pre-releases sort before the final release; dev before everything
        // at the same release number.
        let pre_rank = match &self.pre {
            Some((Pep440PreKind::Alpha, _)) => 0,
            Some((Pep440PreKind::Beta, _)) => 1,
            Some((Pep440PreKind::Rc, _)) => 2,
            None => 3,
        };
        let pre_counter = self.pre.as_ref().map(|(_, n)| *n).unwrap_or(0);
        let dev_rank = self.dev.unwrap_or(u64::MAX);
        (
            self.component(0),
            self.component(1),
            self.component(2),
            pre_rank,
            pre_counter,
            dev_rank,
        )
    }
}

impl VersioningScheme for Pep440 {
    fn name(&self) -> &'static str {
        "pep440"
    }

    fn validate(&self, version: &str) -> Result<(), String> {
        Pep440Version::parse(version).map(|_| ())
    }

    fn bump(&self, old: &str, kind: Bump) -> Result<String, String> {
        let mut version = Pep440Version::parse(old)?;
        match kind {
            Bump::None => return Ok(version.render()),
            Bump::Prerelease => {
                let (pre_kind, counter) = version
                    .pre
                    .ok_or_else(|| format!("'{old}' has no pre-release suffix to advance"))?;
                version.pre = Some((pre_kind, counter + 1));
                version.dev = None;
                return Ok(version.render());
            }
            _ => {}
        }

        let mut release = [
            version.component(0),
            version.component(1),
            version.component(2),
        ];
        match kind {
            Bump::Major => {
                release[0] += 1;
                release[1] = 0;
                release[2] = 0;
            }
            Bump::Minor => {
                release[1] += 1;
                release[2] = 0;
            }
            Bump::Patch => release[2] += 1,
            Bump::None | Bump::Prerelease => unreachable!(),
        }
        Ok(Pep440Version {
            release: release.to_vec(),
            pre: None,
            dev: None,
        }
        .render())
    }

    fn compare(&self, a: &str, b: &str) -> Result<Ordering, String> {
        Ok(Pep440Version::parse(a)?
            .sort_key()
            .cmp(&Pep440Version::parse(b)?.sort_key()))
    }

    fn with_prerelease(&self, version: &str, label: &str) -> Result<String, String> {
        let mut parsed = Pep440Version::parse(version)?;
        let kind = Pep440PreKind::from_label(label)
            .ok_or_else(|| format!("unknown pre-release label '{label}' (alpha, beta, rc)"))?;
        let current_label = parsed.pre.map(|(k, _)| match k {
            Pep440PreKind::Alpha => "alpha",
            Pep440PreKind::Beta => "beta",
            Pep440PreKind::Rc => "rc",
        });
        let canonical = match kind {
            Pep440PreKind::Alpha => "alpha",
            Pep440PreKind::Beta => "beta",
            Pep440PreKind::Rc => "rc",
        };
        check_escalation(current_label, canonical)?;

        parsed.pre = match parsed.pre {
            Some((current, counter)) if current == kind => Some((kind, counter + 1)),
            _ => Some((kind, 1)),
        };
        parsed.dev = None;
        Ok(parsed.render())
    }

    fn strip_prerelease(&self, version: &str) -> Result<String, String> {
        let mut parsed = Pep440Version::parse(version)?;
        parsed.pre = None;
        parsed.dev = None;
        Ok(parsed.render())
    }
}

// ---------------------------------------------------------------------------
// CalVer
// ---------------------------------------------------------------------------

/// `YYYY.MM.MICRO` calendar versioning. Every bump kind maps to the same
/// operation: advance to today's year/month, resetting micro, or increment
/// micro when releasing again in the same month.
pub struct CalVer;

fn calver_today() -> (u64, u64) {
    let now = Utc::now();
    (now.year() as u64, now.month() as u64)
}

pub(crate) fn calver_bump_with_date(old: &str, year: u64, month: u64) -> Result<String, String> {
    let parts: Vec<u64> = old
        .trim()
        .split('.')
        .map(|p| {
            p.parse::<u64>()
                .map_err(|_| format!("Invalid CalVer version '{old}'"))
        })
        .collect::<Result<_, _>>()?;
    if parts.len() != 3 {
        return Err(format!(
            "Invalid CalVer version '{old}': expected YYYY.MM.MICRO"
        ));
    }
    if parts[0] == year && parts[1] == month {
        Ok(format!("{year}.{month:02}.{}", parts[2] + 1))
    } else {
        Ok(format!("{year}.{month:02}.0"))
    }
}

impl VersioningScheme for CalVer {
    fn name(&self) -> &'static str {
        "calver"
    }

    fn validate(&self, version: &str) -> Result<(), String> {
        calver_bump_with_date(version, 2000, 1).map(|_| ())
    }

    fn bump(&self, old: &str, kind: Bump) -> Result<String, String> {
        if kind == Bump::None {
            return Ok(old.trim().to_string());
        }
        let (year, month) = calver_today();
        calver_bump_with_date(old, year, month)
    }

    fn compare(&self, a: &str, b: &str) -> Result<Ordering, String> {
        let parse = |v: &str| -> Result<Vec<u64>, String> {
            v.trim()
                .split('.')
                .map(|p| p.parse::<u64>().map_err(|_| format!("Invalid CalVer '{v}'")))
                .collect()
        };
        Ok(parse(a)?.cmp(&parse(b)?))
    }

    fn with_prerelease(&self, _version: &str, label: &str) -> Result<String, String> {
        Err(format!(
            "CalVer does not support pre-release labels (got '{label}')"
        ))
    }

    fn strip_prerelease(&self, version: &str) -> Result<String, String> {
        Ok(version.trim().to_string())
    }
}
