//! Dependency closure resolution.
//!
//! Resolution is a closure over a directed graph whose nodes are package
//! names and whose edges are "depends-on". [`closure`] walks any such graph
//! breadth-first with a visited set, so cycles terminate. [`Resolver`] plugs
//! the repository set in as the graph.
//!
//! Resolution never downloads anything: the whole closure is computed first
//! so that a missing package aborts the build before any network or
//! filesystem work happens.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use crate::error::{BuildError, Result};
use crate::repo::{Package, RepositorySet};

/// A directed graph that can be explored one node at a time.
pub trait DependencyGraph {
    type Node: Clone + Eq + Hash;
    type Value;
    type Error;

    /// Resolve `node` to its value and the nodes it points to.
    fn visit(
        &mut self,
        node: &Self::Node,
    ) -> std::result::Result<(Self::Value, Vec<Self::Node>), Self::Error>;
}

/// Compute the closure of `seeds` over `graph`.
///
/// Values are returned in discovery order, each node exactly once. With
/// `follow_edges == false` only the seeds themselves are visited. The first
/// error aborts the walk.
pub fn closure<G, I>(
    graph: &mut G,
    seeds: I,
    follow_edges: bool,
) -> std::result::Result<Vec<G::Value>, G::Error>
where
    G: DependencyGraph,
    I: IntoIterator<Item = G::Node>,
{
    let mut visited: HashSet<G::Node> = HashSet::new();
    let mut pending: VecDeque<G::Node> = seeds.into_iter().collect();
    let mut values = Vec::new();

    while let Some(node) = pending.pop_front() {
        if !visited.insert(node.clone()) {
            continue;
        }
        let (value, edges) = graph.visit(&node)?;
        values.push(value);

        if follow_edges {
            pending.extend(edges.into_iter().filter(|n| !visited.contains(n)));
        }
    }

    Ok(values)
}

/// Resolves package names against an ordered repository set.
pub struct Resolver<'a> {
    repos: &'a RepositorySet,
    include_deps: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(repos: &'a RepositorySet, include_deps: bool) -> Self {
        Self { repos, include_deps }
    }

    /// Resolve `requested` into its package closure.
    ///
    /// Fails with [`BuildError::Resolution`] on the first name no repository
    /// knows. Partial results are discarded.
    pub fn resolve<I, S>(&self, requested: I) -> Result<Vec<Package>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seeds: Vec<String> = requested.into_iter().map(Into::into).collect();
        for name in &seeds {
            tracing::info!(package = %name, "requested");
        }

        let mut graph = RepositoryGraph { repos: self.repos };
        let packages = closure(&mut graph, seeds, self.include_deps)?;

        tracing::info!(
            packages = packages.len(),
            with_dependencies = self.include_deps,
            "resolved package set"
        );
        Ok(packages)
    }
}

struct RepositoryGraph<'a> {
    repos: &'a RepositorySet,
}

impl DependencyGraph for RepositoryGraph<'_> {
    type Node = String;
    type Value = Package;
    type Error = BuildError;

    fn visit(&mut self, name: &String) -> Result<(Package, Vec<String>)> {
        let Some(package) = self.repos.find_package(name) else {
            tracing::error!(package = %name, "package not found in any repository");
            return Err(BuildError::Resolution { name: name.clone() });
        };
        let depends = package.get_depends().to_vec();
        Ok((package, depends))
    }
}
