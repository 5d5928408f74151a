//! Commit graph input and ref descriptions.
//!
//! The graph is supplied by the version-control backend as child -> parents
//! adjacency. Commits are kept in a topological order (parents before
//! children) so visibility can be propagated in a single forward pass.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use time::OffsetDateTime;

/// Read-only commit DAG for one repository.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    parents: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl CommitGraph {
    /// Build a graph from `(commit, parents)` pairs.
    ///
    /// Parents that never appear as a commit of their own are added as
    /// parentless nodes, which is how graph fragments end.
    pub fn new<I>(edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut parents: HashMap<String, Vec<String>> = HashMap::new();
        let mut appearance: Vec<String> = Vec::new();

        for (commit, commit_parents) in edges {
            if commit.is_empty() {
                return Err(Error::InvalidCommitGraph("empty commit id".to_string()));
            }
            match parents.get_mut(&commit) {
                Some(existing) => {
                    for parent in commit_parents {
                        if !existing.contains(&parent) {
                            existing.push(parent);
                        }
                    }
                }
                None => {
                    appearance.push(commit.clone());
                    let mut deduped: Vec<String> = Vec::with_capacity(commit_parents.len());
                    for parent in commit_parents {
                        if parent == commit {
                            return Err(Error::InvalidCommitGraph(format!(
                                "commit {commit} lists itself as a parent"
                            )));
                        }
                        if !deduped.contains(&parent) {
                            deduped.push(parent);
                        }
                    }
                    parents.insert(commit, deduped);
                }
            }
        }

        let mut missing: Vec<String> = Vec::new();
        for commit in &appearance {
            for parent in &parents[commit] {
                if !parents.contains_key(parent) && !missing.contains(parent) {
                    missing.push(parent.clone());
                }
            }
        }
        for commit in missing {
            parents.insert(commit.clone(), Vec::new());
            appearance.push(commit);
        }

        let order = topological_order(&appearance, &parents)?;
        Ok(Self { parents, order })
    }

    /// Parse `git log --pretty='%H %P'` output: one commit per line followed
    /// by its parents, separated by whitespace.
    pub fn parse(text: &str) -> Result<Self> {
        let edges = text.lines().filter_map(|line| {
            let mut fields = line.split_whitespace();
            let commit = fields.next()?.to_string();
            Some((commit, fields.map(str::to_string).collect()))
        });
        Self::new(edges)
    }

    /// Commits ordered so that every parent precedes its children.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn parents(&self, commit: &str) -> &[String] {
        self.parents.get(commit).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, commit: &str) -> bool {
        self.parents.contains_key(commit)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// Kahn's algorithm, seeded in first-appearance order so the result is stable.
fn topological_order(
    appearance: &[String],
    parents: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut pending: HashMap<&str, usize> = HashMap::with_capacity(appearance.len());
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

    for commit in appearance {
        let commit_parents = &parents[commit];
        pending.insert(commit.as_str(), commit_parents.len());
        for parent in commit_parents {
            children
                .entry(parent.as_str())
                .or_default()
                .push(commit.as_str());
        }
    }

    let mut queue: VecDeque<&str> = appearance
        .iter()
        .map(String::as_str)
        .filter(|commit| pending[commit] == 0)
        .collect();
    let mut order = Vec::with_capacity(appearance.len());

    while let Some(commit) = queue.pop_front() {
        order.push(commit.to_string());
        for child in children.get(commit).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if order.len() != appearance.len() {
        return Err(Error::InvalidCommitGraph(format!(
            "cycle detected among {} commits",
            appearance.len() - order.len()
        )));
    }
    Ok(order)
}

/// Kind of a named ref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Branch,
    Tag,
}

/// A branch or tag pointing at a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    #[serde(default)]
    pub is_default_branch: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_date: Option<OffsetDateTime>,
}

impl RefDescription {
    pub fn branch(name: impl Into<String>, created_date: Option<OffsetDateTime>) -> Self {
        Self {
            name: name.into(),
            ref_type: RefType::Branch,
            is_default_branch: false,
            created_date,
        }
    }

    pub fn tag(name: impl Into<String>, created_date: Option<OffsetDateTime>) -> Self {
        Self {
            name: name.into(),
            ref_type: RefType::Tag,
            is_default_branch: false,
            created_date,
        }
    }

    pub fn default_branch(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ref_type: RefType::Branch,
            is_default_branch: true,
            created_date: None,
        }
    }
}

/// Ref descriptions keyed by the commit they point at.
pub type RefDescriptions = HashMap<String, Vec<RefDescription>>;
