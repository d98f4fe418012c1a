use nalgebra::DMatrix;
use petgraph::algo::{kosaraju_scc, tarjan_scc};
use petgraph::graph::{DiGraph, Graph, NodeIndex, UnGraph};
use petgraph::EdgeType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::count_matrix::{CountError, CountMatrix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    #[default]
    Strong, // Largest strongly connected component of the count graph
    Weak,   // Largest connected component of the symmetrized count graph
}

/// Sorted subset of the original state ids on which a model is estimated.
///
/// Every downstream matrix is indexed by position in this set ("local" index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSet {
    states: Vec<usize>,
    n_total_states: usize,
}

impl ActiveSet {
    pub fn new(mut states: Vec<usize>, n_total_states: usize) -> Result<Self, ConnectivityError> {
        states.sort_unstable();
        states.dedup();
        if let Some(&state) = states.iter().find(|&&state| state >= n_total_states) {
            return Err(ConnectivityError::StateOutOfRange { state, n_states: n_total_states });
        }
        Ok(Self { states, n_total_states })
    }

    // All states 0..n
    pub fn full(n_states: usize) -> Self {
        Self { states: (0..n_states).collect(), n_total_states: n_states }
    }

    pub fn states(&self) -> &[usize] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn n_total_states(&self) -> usize {
        self.n_total_states
    }

    pub fn contains(&self, state: usize) -> bool {
        self.states.binary_search(&state).is_ok()
    }

    // Original state id -> position in the active set
    pub fn local_index(&self, state: usize) -> Option<usize> {
        self.states.binary_search(&state).ok()
    }

    // Position in the active set -> original state id
    pub fn global_index(&self, local: usize) -> Option<usize> {
        self.states.get(local).copied()
    }

    pub fn state_fraction(&self) -> f64 {
        if self.n_total_states == 0 {
            return 0.0;
        }
        self.states.len() as f64 / self.n_total_states as f64
    }

    // Per-state vector over all original states, NaN outside the active set
    pub fn expand(&self, local_values: &[f64]) -> Vec<f64> {
        let mut full = vec![f64::NAN; self.n_total_states];
        for (&state, &value) in self.states.iter().zip(local_values) {
            full[state] = value;
        }
        full
    }
}

/// Outcome of a connectivity analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectivityReport {
    components: Vec<Vec<usize>>, // Largest first
    active_set: ActiveSet,
    active_state_fraction: f64,
    active_count_fraction: f64,
}

impl ConnectivityReport {
    pub fn components(&self) -> &[Vec<usize>] {
        &self.components
    }

    pub fn active_state_fraction(&self) -> f64 {
        self.active_state_fraction
    }

    pub fn active_count_fraction(&self) -> f64 {
        self.active_count_fraction
    }

    pub fn is_fully_connected(&self) -> bool {
        self.components.len() == 1
    }

    // The active set, only if no state has to be dropped
    pub fn active_set(&self) -> Result<&ActiveSet, ConnectivityError> {
        if !self.is_fully_connected() {
            return Err(ConnectivityError::PartialConnectivity {
                active_states: self.active_set.len(),
                total_states: self.active_set.n_total_states(),
                state_fraction: self.active_state_fraction,
                count_fraction: self.active_count_fraction,
            });
        }
        Ok(&self.active_set)
    }

    // Explicitly accept the restricted active set
    pub fn accept_restricted(&self) -> &ActiveSet {
        if !self.is_fully_connected() {
            log::warn!(
                "Proceeding with restricted active set: {} of {} states (state fraction {:.4}, count fraction {:.4})",
                self.active_set.len(),
                self.active_set.n_total_states(),
                self.active_state_fraction,
                self.active_count_fraction
            );
        }
        &self.active_set
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityAnalyzer {
    mode: ConnectivityMode,
}

impl ConnectivityAnalyzer {
    pub fn new(mode: ConnectivityMode) -> Self {
        Self { mode }
    }

    pub fn analyze(&self, counts: &CountMatrix) -> Result<ConnectivityReport, ConnectivityError> {
        let n_states = counts.n_states();
        let graph = transition_graph(counts.as_matrix(), |&count| count > 0);
        let mut components = connected_components(graph, self.mode);

        // Largest first, then the one carrying more counts, then the smallest state id
        let mut ranked: Vec<(Vec<usize>, u64)> = components
            .drain(..)
            .map(|component| {
                let internal = counts.count_within(&component)?;
                Ok((component, internal))
            })
            .collect::<Result<_, ConnectivityError>>()?;
        ranked.sort_by(|(a, a_counts), (b, b_counts)| {
            b.len().cmp(&a.len()).then(b_counts.cmp(a_counts)).then(a[0].cmp(&b[0]))
        });

        let (largest, internal_counts) = match ranked.first() {
            Some((component, internal)) if *internal > 0 => (component.clone(), *internal),
            _ => return Err(ConnectivityError::NoConnectedStates),
        };

        let total_counts = counts.total();
        let active_set = ActiveSet::new(largest, n_states)?;
        let active_state_fraction = active_set.state_fraction();
        let active_count_fraction = if total_counts == 0 { 0.0 } else { internal_counts as f64 / total_counts as f64 };

        let components: Vec<Vec<usize>> = ranked.into_iter().map(|(component, _)| component).collect();

        if components.len() > 1 {
            log::warn!(
                "Count matrix is not fully connected: {} components, active state fraction {:.4}, active count fraction {:.4}",
                components.len(),
                active_state_fraction,
                active_count_fraction
            );
        } else {
            log::info!("Count matrix is fully connected ({} states)", n_states);
        }

        Ok(ConnectivityReport { components, active_set, active_state_fraction, active_count_fraction })
    }
}

/// Directed graph over the states with one edge per off-diagonal entry accepted
/// by `is_edge`. Node `i` carries state id `i` and the entry as edge weight.
pub fn transition_graph<T, F>(matrix: &DMatrix<T>, is_edge: F) -> DiGraph<usize, T>
where
    T: nalgebra::Scalar,
    F: Fn(&T) -> bool,
{
    let n = matrix.nrows();
    let mut graph = DiGraph::with_capacity(n, n);
    let nodes: Vec<NodeIndex> = (0..n).map(|state| graph.add_node(state)).collect();
    for i in 0..n {
        for j in 0..matrix.ncols() {
            if i != j && is_edge(&matrix[(i, j)]) {
                graph.add_edge(nodes[i], nodes[j], matrix[(i, j)].clone());
            }
        }
    }
    graph
}

// True if the graph of positive entries is a single component under `mode`
pub fn is_irreducible(matrix: &DMatrix<f64>, mode: ConnectivityMode) -> bool {
    let graph = transition_graph(matrix, |&value| value > 0.0);
    connected_components(graph, mode).len() == 1
}

/// Components of `graph` as sorted state ids, in no particular order.
pub fn connected_components<E>(graph: DiGraph<usize, E>, mode: ConnectivityMode) -> Vec<Vec<usize>> {
    match mode {
        ConnectivityMode::Strong => {
            let components = tarjan_scc(&graph);
            state_ids(&graph, components)
        }
        ConnectivityMode::Weak => {
            // Strong components of the undirected graph are its connected components
            let undirected: UnGraph<usize, E> = graph.into_edge_type();
            let components = kosaraju_scc(&undirected);
            state_ids(&undirected, components)
        }
    }
}

fn state_ids<E, Ty: EdgeType>(graph: &Graph<usize, E, Ty>, components: Vec<Vec<NodeIndex>>) -> Vec<Vec<usize>> {
    components
        .into_iter()
        .map(|component| {
            let mut states: Vec<usize> = component.into_iter().map(|node| graph[node]).collect();
            states.sort_unstable();
            states
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectivityError {
    #[error(
        "only {active_states} of {total_states} states are connected \
         (state fraction {state_fraction:.4}, count fraction {count_fraction:.4}); accept the restricted active set explicitly"
    )]
    PartialConnectivity { active_states: usize, total_states: usize, state_fraction: f64, count_fraction: f64 },
    #[error("no connected set of states carries any transition counts")]
    NoConnectedStates,
    #[error("state {state} is out of range for {n_states} states")]
    StateOutOfRange { state: usize, n_states: usize },
    #[error(transparent)]
    Count(#[from] CountError),
}
