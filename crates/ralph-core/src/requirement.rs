//! Requirements and the dependency graph that orders them.
//!
//! Requirements are declared in `.ralph/requirements.toml`:
//!
//! ```toml
//! overview = "A CLI that converts CSV to Parquet"
//!
//! [[requirement]]
//! id = "REQ-001"
//! title = "Parse CSV input"
//! body = "Read CSV from stdin or a path argument."
//! acceptance_criteria = ["Handles quoted fields", "Rejects ragged rows"]
//! file_scope = { creates = ["src/csv.rs"], modifies = ["src/main.rs"] }
//!
//! [[requirement]]
//! id = "REQ-002"
//! title = "Write Parquet output"
//! dependencies = ["REQ-001"]
//! ```
//!
//! The graph is validated once at load time. Unknown dependencies and cycles
//! are fatal before any agent is dispatched.

use crate::error::GraphError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

/// Stable requirement identifier, e.g. `REQ-001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(pub String);

impl RequirementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Files a requirement is expected to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileScope {
    #[serde(default)]
    pub creates: BTreeSet<String>,
    #[serde(default)]
    pub modifies: BTreeSet<String>,
}

impl FileScope {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.modifies.is_empty()
    }
}

/// One unit of work. Immutable once loaded into a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: RequirementId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub file_scope: FileScope,
    #[serde(default, alias = "depends_on")]
    pub dependencies: BTreeSet<RequirementId>,
    /// Milestone this requirement rolls up into, if any.
    #[serde(default)]
    pub milestone: Option<String>,
}

impl Requirement {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: RequirementId::new(id),
            title: title.to_string(),
            body: String::new(),
            acceptance_criteria: Vec::new(),
            file_scope: FileScope::default(),
            dependencies: BTreeSet::new(),
            milestone: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.dependencies
            .extend(ids.iter().map(|id| RequirementId::new(*id)));
        self
    }

    /// Markdown section used in agent prompts.
    pub fn to_markdown(&self) -> String {
        let mut md = format!("## {} — {}\n\n", self.id, self.title);
        if !self.body.is_empty() {
            md.push_str(self.body.trim_end());
            md.push_str("\n\n");
        }
        if !self.acceptance_criteria.is_empty() {
            md.push_str("### Acceptance Criteria\n\n");
            for ac in &self.acceptance_criteria {
                md.push_str(&format!("- [ ] {ac}\n"));
            }
            md.push('\n');
        }
        if !self.file_scope.is_empty() {
            md.push_str("### File Scope\n\n");
            for f in &self.file_scope.creates {
                md.push_str(&format!("- create `{f}`\n"));
            }
            for f in &self.file_scope.modifies {
                md.push_str(&format!("- modify `{f}`\n"));
            }
            md.push('\n');
        }
        md
    }
}

/// On-disk shape of `requirements.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequirementsFile {
    /// Project overview shared by every prompt.
    #[serde(default)]
    pub overview: String,
    #[serde(default, rename = "requirement")]
    pub requirements: Vec<Requirement>,
}

impl RequirementsFile {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read requirements: {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse requirements: {}", path.display()))
    }
}

/// Validated, dependency-ordered requirements.
#[derive(Debug, Clone)]
pub struct RequirementGraph {
    overview: String,
    /// Declaration order.
    requirements: Vec<Requirement>,
    index: HashMap<RequirementId, usize>,
    /// Topological order as indices into `requirements`.
    order: Vec<usize>,
}

impl RequirementGraph {
    /// Build and validate a graph. Ties in the topological order are broken
    /// by declaration order, so the same input always yields the same order.
    pub fn new(
        overview: impl Into<String>,
        requirements: Vec<Requirement>,
    ) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(requirements.len());
        for (i, req) in requirements.iter().enumerate() {
            if index.insert(req.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateRequirement(req.id.to_string()));
            }
        }

        for req in &requirements {
            for dep in &req.dependencies {
                if !index.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        requirement: req.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        let order = topological_order(&requirements, &index)?;

        Ok(Self {
            overview: overview.into(),
            requirements,
            index,
            order,
        })
    }

    pub fn from_file(file: RequirementsFile) -> Result<Self, GraphError> {
        Self::new(file.overview, file.requirements)
    }

    pub fn overview(&self) -> &str {
        &self.overview
    }

    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn get(&self, id: &RequirementId) -> Option<&Requirement> {
        self.index.get(id).map(|&i| &self.requirements[i])
    }

    /// Requirements in dependency order: nothing before its dependencies.
    pub fn ordered(&self) -> impl Iterator<Item = &Requirement> {
        self.order.iter().map(|&i| &self.requirements[i])
    }

    /// Requirements that depend on `id`, directly or transitively,
    /// in topological order.
    pub fn transitive_dependents(&self, id: &RequirementId) -> Vec<&Requirement> {
        let mut affected: BTreeSet<&RequirementId> = BTreeSet::new();
        affected.insert(id);
        let mut out = Vec::new();
        // Topological order guarantees every dependency is classified first.
        for req in self.ordered() {
            if req.id != *id && req.dependencies.iter().any(|d| affected.contains(d)) {
                affected.insert(&req.id);
                out.push(req);
            }
        }
        out
    }

    /// Requirements belonging to a milestone.
    pub fn in_milestone<'a>(&'a self, milestone: &'a str) -> impl Iterator<Item = &'a Requirement> {
        self.requirements
            .iter()
            .filter(move |r| r.milestone.as_deref() == Some(milestone))
    }
}

/// Kahn's algorithm with a min-heap on declaration index.
fn topological_order(
    requirements: &[Requirement],
    index: &HashMap<RequirementId, usize>,
) -> Result<Vec<usize>, GraphError> {
    let n = requirements.len();
    let mut remaining_deps: Vec<usize> =
        requirements.iter().map(|r| r.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, req) in requirements.iter().enumerate() {
        for dep in &req.dependencies {
            dependents[index[dep]].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining_deps[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &d in &dependents[next] {
            remaining_deps[d] -= 1;
            if remaining_deps[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(GraphError::DependencyCycle(find_cycle(requirements, index, &remaining_deps)))
    }
}

/// Walk unresolved dependencies from the first stuck node until one repeats.
///
/// Every node left with `remaining_deps > 0` has at least one unresolved
/// dependency, so the walk always closes a loop.
fn find_cycle(
    requirements: &[Requirement],
    index: &HashMap<RequirementId, usize>,
    remaining_deps: &[usize],
) -> Vec<String> {
    let stuck = |i: usize| remaining_deps[i] > 0;
    let Some(start) = (0..requirements.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = vec![start];
    let mut current = start;
    loop {
        let next = requirements[current]
            .dependencies
            .iter()
            .map(|d| index[d])
            .find(|&j| stuck(j));
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<String> = path[pos..]
                .iter()
                .map(|&i| requirements[i].id.to_string())
                .collect();
            cycle.push(requirements[next].id.to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| requirements[i].id.to_string()).collect()
}
