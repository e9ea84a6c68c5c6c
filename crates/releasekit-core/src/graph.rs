use crate::errors::{ReleaseKitError, Result};
use crate::types::{PackageInfo, Workspace};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// The internal dependency graph of a workspace.
///
/// Nodes are package names; edges are internal dependencies only. The graph
/// is validated acyclic at construction (RK-CYCLE is fatal) and carries the
/// deterministic topological level of every node.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// dep -> dependents (reverse edges)
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// package -> internal deps (forward edges)
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// package -> topological level (0 = no internal deps)
    levels: BTreeMap<String, usize>,
}

impl DependencyGraph {
    /// Build and validate the graph from workspace members.
    ///
    /// Internal dependency names that do not resolve to a member are
    /// silently dropped from the graph (the edge was misclassified
    /// upstream and cannot participate in ordering).
    pub fn build(workspace: &Workspace) -> Result<Self> {
        Self::from_members(&workspace.members)
    }

    pub fn from_members(members: &[PackageInfo]) -> Result<Self> {
        let names: BTreeSet<&str> = members.iter().map(|m| m.name.as_str()).collect();

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for member in members {
            let deps: BTreeSet<String> = member
                .internal_deps
                .iter()
                .filter(|dep| names.contains(dep.as_str()))
                .cloned()
                .collect();
            for dep in &deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(member.name.clone());
            }
            dependencies.insert(member.name.clone(), deps);
            dependents.entry(member.name.clone()).or_default();
        }

        let levels = compute_levels(&dependencies)?;

        Ok(Self {
            dependents,
            dependencies,
            levels,
        })
    }

    /// Internal dependencies of a package.
    pub fn dependencies_of(&self, package: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(package)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }

    /// Direct dependents of a package (reverse edges).
    pub fn dependents_of(&self, package: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(package)
            .into_iter()
            .flat_map(|set| set.iter().map(|s| s.as_str()))
    }

    /// Topological level: 0 for leaves, 1 + max(level of deps) otherwise.
    pub fn level(&self, package: &str) -> Option<usize> {
        self.levels.get(package).copied()
    }

    /// All packages in topological order: by level, then by name.
    pub fn topo_order(&self) -> Vec<String> {
        let mut out: Vec<&String> = self.levels.keys().collect();
        out.sort_by_key(|name| (self.levels[*name], (*name).clone()));
        out.into_iter().cloned().collect()
    }

    /// All transitive dependents of the given package, excluding itself.
    pub fn transitive_dependents(&self, package: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(package);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if out.insert(dependent.to_string()) {
                    queue.push_back(dependent);
                }
            }
        }
        out
    }

    /// All transitive internal dependencies of the given package,
    /// excluding itself.
    pub fn transitive_dependencies(&self, package: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(package);
        while let Some(current) = queue.pop_front() {
            for dep in self.dependencies_of(current) {
                if out.insert(dep.to_string()) {
                    queue.push_back(dep);
                }
            }
        }
        out
    }
}

/// Kahn's algorithm with name tie-break for deterministic levels.
///
/// On a cycle, reports the smallest strongly connected component among the
/// unresolved nodes.
fn compute_levels(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<BTreeMap<String, usize>> {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    for (name, deps) in dependencies {
        indegree.insert(name.as_str(), deps.len());
    }

    let mut levels: BTreeMap<String, usize> = BTreeMap::new();
    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter_map(|(name, &d)| (d == 0).then_some(*name))
        .collect();

    while let Some(name) = ready.pop_front() {
        let level = dependencies[name]
            .iter()
            .filter_map(|dep| levels.get(dep.as_str()))
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        levels.insert(name.to_string(), level);

        // BTreeMap iteration keeps the dependent scan deterministic.
        for (candidate, deps) in dependencies {
            if deps.contains(name) {
                if let Some(d) = indegree.get_mut(candidate.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(candidate.as_str());
                    }
                }
            }
        }
    }

    if levels.len() != dependencies.len() {
        let unresolved: BTreeSet<&str> = dependencies
            .keys()
            .map(|s| s.as_str())
            .filter(|name| !levels.contains_key(*name))
            .collect();
        let scc = smallest_cycle(dependencies, &unresolved);
        return Err(ReleaseKitError::Cycle(format!(
            "RK-CYCLE: dependency cycle among packages: {}",
            scc.join(" -> ")
        )));
    }

    Ok(levels)
}

/// Find the smallest strongly connected component among unresolved nodes.
///
/// A self-edge is a cycle of length one.
fn smallest_cycle(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    unresolved: &BTreeSet<&str>,
) -> Vec<String> {
    let mut smallest: Option<Vec<String>> = None;

    for &start in unresolved {
        // BFS over forward edges back to the start node.
        let mut parents: FxHashMap<&str, &str> = FxHashMap::default();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(start);

        'bfs: while let Some(current) = queue.pop_front() {
            if let Some(deps) = dependencies.get(current) {
                for dep in deps {
                    if !unresolved.contains(dep.as_str()) {
                        continue;
                    }
                    if dep == start {
                        // Reconstruct the cycle path.
                        let mut path = vec![start.to_string()];
                        let mut node = current;
                        while node != start {
                            path.insert(1, node.to_string());
                            node = parents[node];
                        }
                        path.push(start.to_string());
                        let better = smallest
                            .as_ref()
                            .map(|s| path.len() < s.len())
                            .unwrap_or(true);
                        if better {
                            smallest = Some(path);
                        }
                        break 'bfs;
                    }
                    if !parents.contains_key(dep.as_str()) {
                        parents.insert(dep.as_str(), current);
                        queue.push_back(dep.as_str());
                    }
                }
            }
        }
    }

    smallest.unwrap_or_else(|| unresolved.iter().map(|s| s.to_string()).collect())
}

/// Selection of packages for a run: `--group`, `--package`, `--exclude`.
#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    pub groups: Vec<String>,
    pub packages: Vec<String>,
    pub excludes: Vec<String>,
}

impl PackageFilter {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.packages.is_empty() && self.excludes.is_empty()
    }

    /// Apply the filter over the workspace, auto-including transitive
    /// internal dependencies of every requested package so builds remain
    /// reproducible. Excludes are applied last and never remove a package
    /// pulled in as a dependency of a kept one.
    pub fn select(&self, workspace: &Workspace, graph: &DependencyGraph) -> Result<BTreeSet<String>> {
        let mut selected: BTreeSet<String> = BTreeSet::new();

        if self.groups.is_empty() && self.packages.is_empty() {
            selected.extend(workspace.members.iter().map(|m| m.name.clone()));
        } else {
            for member in &workspace.members {
                let by_group = member
                    .group
                    .as_deref()
                    .map(|g| self.groups.iter().any(|pat| wildcard_match(pat, g)))
                    .unwrap_or(false);
                let by_name = self
                    .packages
                    .iter()
                    .any(|pat| wildcard_match(pat, &member.name));
                if by_group || by_name {
                    selected.insert(member.name.clone());
                }
            }
            if selected.is_empty() {
                return Err(ReleaseKitError::NotFound(format!(
                    "no workspace package matches filter (groups: {:?}, packages: {:?})",
                    self.groups, self.packages
                )));
            }
        }

        if !self.excludes.is_empty() {
            selected.retain(|name| !self.excludes.iter().any(|pat| wildcard_match(pat, name)));
        }

        // Closure: requested packages cannot build without their internal deps.
        let mut closure = selected.clone();
        for name in &selected {
            closure.extend(graph.transitive_dependencies(name));
        }

        Ok(closure)
    }
}

/// Simple wildcard match supporting '*' as any sequence (case-sensitive, anchored)
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    if pattern == text {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.is_empty() {
        return true;
    }
    let mut idx = 0usize;
    if !parts[0].is_empty() {
        if let Some(pos) = text.find(parts[0]) {
            if pos != 0 {
                return false;
            }
            idx = parts[0].len();
        } else {
            return false;
        }
    }
    for mid in parts.iter().skip(1).take(parts.len().saturating_sub(2)) {
        if mid.is_empty() {
            continue;
        }
        if let Some(pos) = text[idx..].find(mid) {
            idx += pos + mid.len();
        } else {
            return false;
        }
    }
    if let Some(last) = parts.last()
        && !last.is_empty()
    {
        if let Some(pos) = text[idx..].rfind(last) {
            return idx + pos + last.len() == text.len();
        } else {
            return false;
        }
    }
    true
}
