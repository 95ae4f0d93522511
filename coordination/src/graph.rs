//! Work package dependency graph
//!
//! Pure and derived: rebuilt from the current records every time it is
//! needed, never persisted. Construction fails as a whole on the first
//! problem found; there is no partially valid graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoordError, CoordResult};
use crate::work_package::{Lane, WorkPackage};

/// Validated dependency DAG over work package ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    /// id -> ids it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// id -> ids that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl DependencyGraph {
    /// Build from work package records
    pub fn build(work_packages: &[WorkPackage]) -> CoordResult<Self> {
        Self::from_edges(
            work_packages
                .iter()
                .map(|wp| (wp.id.clone(), wp.dependencies.iter().cloned().collect())),
        )
    }

    /// Build from `(id, dependencies)` pairs.
    ///
    /// Checks, in order: duplicate ids, self-dependency, unknown
    /// references, cycles.
    pub fn from_edges<I>(edges: I) -> CoordResult<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, deps) in edges {
            if dependencies.contains_key(&id) {
                return Err(CoordError::DuplicateId { wp_id: id });
            }
            dependencies.insert(id, deps.into_iter().collect());
        }

        for (id, deps) in &dependencies {
            if deps.contains(id) {
                return Err(CoordError::SelfDependency { wp_id: id.clone() });
            }
        }

        for (id, deps) in &dependencies {
            if let Some(missing) = deps.iter().find(|d| !dependencies.contains_key(*d)) {
                return Err(CoordError::InvalidReference {
                    wp_id: id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        if let Some(path) = find_cycle(&dependencies) {
            return Err(CoordError::Cycle { path });
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = dependencies
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, deps) in &dependencies {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(id.clone());
                }
            }
        }

        Ok(Self {
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    /// All ids, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Kahn's algorithm; among ready nodes the smallest id goes first
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();
        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.dependencies.len());

        while let Some(id) = ready.pop_first() {
            order.push(id.to_string());
            for dependent in &self.dependents[id] {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }

        order
    }

    /// Ids `id` depends on directly, sorted; `None` for an unknown id
    pub fn direct_dependencies(&self, id: &str) -> Option<Vec<String>> {
        self.dependencies
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
    }

    /// Ids depending on `id` directly, sorted
    pub fn direct_dependents(&self, id: &str) -> Option<Vec<String>> {
        self.dependents
            .get(id)
            .map(|deps| deps.iter().cloned().collect())
    }

    /// Every id that depends on `id`, directly or through others
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        walk(&self.dependents, id)
    }

    /// Every id `id` depends on, directly or through others
    pub fn transitive_dependencies(&self, id: &str) -> BTreeSet<String> {
        walk(&self.dependencies, id)
    }

    /// Groups of ids by longest dependency chain length (wave 0 has no deps)
    pub fn depth_levels(&self) -> Vec<Vec<String>> {
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for id in self.topological_order() {
            let d = self.dependencies[&id]
                .iter()
                .filter_map(|dep| depth.get(dep.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            let key = self.dependencies.get_key_value(&id).map(|(k, _)| k.as_str());
            if let Some(key) = key {
                depth.insert(key, d);
            }
        }

        let mut levels: Vec<Vec<String>> = Vec::new();
        for (id, d) in depth {
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(id.to_string());
        }
        levels
    }

    /// Planned packages whose dependencies are all done, sorted
    pub fn ready(&self, work_packages: &[WorkPackage]) -> Vec<String> {
        let lanes: BTreeMap<&str, Lane> = work_packages
            .iter()
            .map(|wp| (wp.id.as_str(), wp.lane))
            .collect();
        self.dependencies
            .iter()
            .filter(|(id, _)| lanes.get(id.as_str()) == Some(&Lane::Planned))
            .filter(|(_, deps)| {
                deps.iter()
                    .all(|d| lanes.get(d.as_str()) == Some(&Lane::Done))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn walk(adjacency: &BTreeMap<String, BTreeSet<String>>, start: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = adjacency
        .get(start)
        .map(|s| s.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if seen.insert(id.to_string()) {
            if let Some(next) = adjacency.get(id) {
                stack.extend(next.iter().map(String::as_str));
            }
        }
    }
    seen
}

/// Depth-first search with grey/black marking.
///
/// Returns the first cycle found as a path that starts and ends with the
/// same id. Roots and edges are visited in sorted order, so the reported
/// cycle is stable for a given input.
fn find_cycle(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    fn dfs<'a>(
        node: &'a str,
        dependencies: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::Grey);
        path.push(node);

        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                match marks.get(dep.as_str()).copied().unwrap_or(Mark::White) {
                    Mark::Grey => {
                        let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::White => {
                        if let Some(cycle) = dfs(dep, dependencies, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Black => {}
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Black);
        None
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    for id in dependencies.keys() {
        if marks.get(id.as_str()).copied().unwrap_or(Mark::White) == Mark::White {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(id, dependencies, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
