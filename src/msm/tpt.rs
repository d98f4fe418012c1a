use std::cmp::Ordering;
use std::ops::Add;

use nalgebra::{DMatrix, DVector};
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use thiserror::Error;

use super::cancellation::CancellationToken;
use super::connectivity::transition_graph;
use super::transition_matrix::{StationaryDistribution, TransitionMatrix};

const PATHWAY_FLUX_CUTOFF: f64 = 1e-12; // Relative to the total flux
const COMMITTOR_TOLERANCE: f64 = 1e-10;

/// Reactive flux from a source set A to a sink set B (transition path theory).
///
/// All indices are local to the active set the transition matrix is defined on.
#[derive(Debug, Clone)]
pub struct FluxNetwork {
    source: Vec<usize>,
    sink: Vec<usize>,
    stationary: Vec<f64>,
    forward_committor: DVector<f64>,
    backward_committor: DVector<f64>,
    gross_flux: DMatrix<f64>,
    net_flux: DMatrix<f64>,
    flux_graph: DiGraph<usize, f64>, // Positive net flux, no edges into A or out of B
    total_flux: f64,
    rate: f64,
    lag: usize,
}

/// One reactive pathway from A to B with the flux it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactivePathway {
    pub states: Vec<usize>,
    pub flux: f64,
}

impl FluxNetwork {
    pub fn source(&self) -> &[usize] {
        &self.source
    }

    pub fn sink(&self) -> &[usize] {
        &self.sink
    }

    pub fn n_states(&self) -> usize {
        self.stationary.len()
    }

    pub fn stationary(&self) -> &[f64] {
        &self.stationary
    }

    pub fn forward_committor(&self) -> &DVector<f64> {
        &self.forward_committor
    }

    pub fn backward_committor(&self) -> &DVector<f64> {
        &self.backward_committor
    }

    pub fn gross_flux(&self) -> &DMatrix<f64> {
        &self.gross_flux
    }

    pub fn net_flux(&self) -> &DMatrix<f64> {
        &self.net_flux
    }

    pub fn flux_graph(&self) -> &DiGraph<usize, f64> {
        &self.flux_graph
    }

    pub fn total_flux(&self) -> f64 {
        self.total_flux
    }

    // Reactive events per lag time
    pub fn rate(&self) -> f64 {
        self.rate
    }

    // Mean first passage time A -> B in units of the trajectory time step
    pub fn mfpt(&self) -> f64 {
        if self.rate > 0.0 {
            self.lag as f64 / self.rate
        } else {
            f64::INFINITY
        }
    }

    /// Aggregates the network onto a partition of the states.
    ///
    /// Each set is split into its part in A, the rest and its part in B, so
    /// the coarse network keeps A and B separate. Returns the coarse sets
    /// (in the original local indices) and the coarse network over them.
    pub fn coarse_grain(&self, sets: &[Vec<usize>]) -> Result<(Vec<Vec<usize>>, FluxNetwork), TptError> {
        let n = self.n_states();
        let mut seen = vec![false; n];
        for &state in sets.iter().flatten() {
            if state >= n {
                return Err(TptError::StateOutOfRange { state, n_states: n });
            }
            if seen[state] {
                return Err(TptError::OverlappingSets { state });
            }
            seen[state] = true;
        }
        if let Some(state) = seen.iter().position(|&covered| !covered) {
            return Err(TptError::IncompletePartition { state });
        }

        let mut coarse_sets = Vec::new();
        let mut coarse_source = Vec::new();
        let mut coarse_sink = Vec::new();
        for set in sets {
            let (in_source, rest): (Vec<usize>, Vec<usize>) = set.iter().partition(|&&state| self.source.contains(&state));
            let (in_sink, rest): (Vec<usize>, Vec<usize>) = rest.into_iter().partition(|state| self.sink.contains(state));
            for (part, role) in [(in_source, Some(true)), (rest, None), (in_sink, Some(false))] {
                if part.is_empty() {
                    continue;
                }
                match role {
                    Some(true) => coarse_source.push(coarse_sets.len()),
                    Some(false) => coarse_sink.push(coarse_sets.len()),
                    None => (),
                }
                coarse_sets.push(part);
            }
        }

        let m = coarse_sets.len();
        let stationary: Vec<f64> = coarse_sets.iter().map(|set| set.iter().map(|&i| self.stationary[i]).sum()).collect();

        // Stationary-weighted committor averages
        let average = |committor: &DVector<f64>| {
            DVector::from_fn(m, |s, _| {
                let weight: f64 = coarse_sets[s].iter().map(|&i| self.stationary[i] * committor[i]).sum();
                if stationary[s] > 0.0 {
                    weight / stationary[s]
                } else {
                    0.0
                }
            })
        };
        let forward_committor = average(&self.forward_committor);
        let backward_committor = average(&self.backward_committor);

        let gross_flux = DMatrix::from_fn(m, m, |s, t| {
            if s == t {
                return 0.0;
            }
            coarse_sets[s]
                .iter()
                .map(|&i| coarse_sets[t].iter().map(|&j| self.net_flux[(i, j)]).sum::<f64>())
                .sum()
        });
        let net_flux = net_from_gross(&gross_flux);
        let total_flux = outgoing_flux(&net_flux, &coarse_source);
        let flux_graph = reactive_graph(&net_flux, &coarse_source, &coarse_sink);

        let coarse = FluxNetwork {
            source: coarse_source,
            sink: coarse_sink,
            stationary,
            forward_committor,
            backward_committor,
            gross_flux,
            net_flux,
            flux_graph,
            total_flux,
            rate: self.rate,
            lag: self.lag,
        };

        Ok((coarse_sets, coarse))
    }

    /// Splits the net flux into pathways by repeatedly removing the widest
    /// A -> B path, until the extracted flux reaches `fraction` of the total.
    ///
    /// Pathways are ranked by decreasing flux.
    pub fn pathways(&self, fraction: f64, cancel: &CancellationToken) -> Result<Vec<ReactivePathway>, TptError> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(TptError::InvalidFraction { fraction });
        }

        let target = fraction * self.total_flux;
        let cutoff = PATHWAY_FLUX_CUTOFF * self.total_flux;

        // One entry node feeds every state in A with unbounded flux
        let mut residual = self.flux_graph.clone();
        let entry = residual.add_node(usize::MAX);
        for &a in &self.source {
            residual.add_edge(entry, NodeIndex::new(a), f64::INFINITY);
        }
        let mut pathways: Vec<ReactivePathway> = Vec::new();
        let mut extracted = 0.0;

        while extracted < target - cutoff {
            if cancel.is_cancelled() {
                return Err(TptError::Cancelled);
            }

            let (states, flux) = match widest_path(&residual, entry, &self.source, &self.sink) {
                Some(path) if path.1 > cutoff => path,
                _ => break,
            };

            for step in states.windows(2) {
                if let Some(edge) = residual.find_edge(NodeIndex::new(step[0]), NodeIndex::new(step[1])) {
                    residual[edge] -= flux;
                }
            }
            extracted += flux;
            log::debug!("Pathway {} carries flux {:.6e}: {:?}", pathways.len() + 1, flux, states);
            pathways.push(ReactivePathway { states, flux });
        }

        pathways.sort_by(|a, b| b.flux.total_cmp(&a.flux));
        log::info!(
            "Extracted {} pathways carrying {:.2}% of the total flux {:.6e}",
            pathways.len(),
            if self.total_flux > 0.0 { 100.0 * extracted / self.total_flux } else { 0.0 },
            self.total_flux
        );

        Ok(pathways)
    }
}

/// Width of a path, the smallest flux along it. Wider compares as smaller, so
/// a shortest-path search over `Bottleneck` costs finds the widest path.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bottleneck(f64);

impl Default for Bottleneck {
    fn default() -> Self {
        Bottleneck(f64::INFINITY)
    }
}

impl Add for Bottleneck {
    type Output = Bottleneck;

    fn add(self, other: Bottleneck) -> Bottleneck {
        Bottleneck(self.0.min(other.0))
    }
}

impl PartialOrd for Bottleneck {
    fn partial_cmp(&self, other: &Bottleneck) -> Option<Ordering> {
        other.0.partial_cmp(&self.0)
    }
}

// Widest path from `entry` into B, as state ids starting in A
fn widest_path(
    graph: &DiGraph<usize, f64>,
    entry: NodeIndex,
    source: &[usize],
    sink: &[usize],
) -> Option<(Vec<usize>, f64)> {
    let widths = dijkstra(graph, entry, None, |edge| Bottleneck(edge.weight().max(0.0)));
    let width_of = |node: NodeIndex| widths.get(&node).map(|width| width.0);

    let (end, width) = sink
        .iter()
        .filter_map(|&b| width_of(NodeIndex::new(b)).map(|width| (b, width)))
        .filter(|&(_, width)| width > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))?;

    // Walk back along edges that realize each node's width exactly
    let mut states = vec![end];
    let mut node = NodeIndex::new(end);
    while !source.contains(&graph[node]) {
        let reached = width_of(node)?;
        let previous = graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight().max(0.0)))
            .filter(|&(from, _)| from != entry && !states.contains(&graph[from]))
            .filter(|&(from, flux)| width_of(from).is_some_and(|width| width.min(flux) == reached))
            .map(|(from, _)| from)
            .min_by_key(|from| from.index())?;
        states.push(graph[previous]);
        node = previous;
    }
    states.reverse();

    Some((states, width))
}

/// Transition path theory on a transition matrix.
#[derive(Debug, Clone, Default)]
pub struct TptEngine;

impl TptEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        transition_matrix: &TransitionMatrix,
        stationary: &StationaryDistribution,
        source: &[usize],
        sink: &[usize],
        lag: usize,
    ) -> Result<FluxNetwork, TptError> {
        let n = transition_matrix.n_states();
        let source = validate_set(source, n, "A")?;
        let sink = validate_set(sink, n, "B")?;
        if let Some(&state) = source.iter().find(|state| sink.contains(state)) {
            return Err(TptError::OverlappingSets { state });
        }

        let p = transition_matrix.as_matrix();
        let pi = stationary.as_slice();

        let forward_committor = committor(p, &source, &sink, "forward committor")?;

        // Time-reversed chain: pi_j P_ji / pi_i
        if let Some(state) = pi.iter().position(|&value| value <= 0.0) {
            return Err(TptError::ZeroStationaryProbability { state });
        }
        let reversed = DMatrix::from_fn(n, n, |i, j| pi[j] * p[(j, i)] / pi[i]);
        let backward_committor = committor(&reversed, &sink, &source, "backward committor")?;

        let gross_flux = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                0.0
            } else {
                pi[i] * backward_committor[i] * p[(i, j)] * forward_committor[j]
            }
        });
        let net_flux = net_from_gross(&gross_flux);
        let total_flux = outgoing_flux(&net_flux, &source);
        let flux_graph = reactive_graph(&net_flux, &source, &sink);

        let reactive_mass: f64 = pi.iter().zip(backward_committor.iter()).map(|(pi_i, q_i)| pi_i * q_i).sum();
        let rate = if reactive_mass > 0.0 { total_flux / reactive_mass } else { 0.0 };

        log::info!(
            "TPT from {:?} to {:?}: total flux {:.6e}, rate {:.6e} per lag",
            source,
            sink,
            total_flux,
            rate
        );

        Ok(FluxNetwork {
            source,
            sink,
            stationary: pi.to_vec(),
            forward_committor,
            backward_committor,
            gross_flux,
            net_flux,
            flux_graph,
            total_flux,
            rate,
            lag,
        })
    }
}

fn validate_set(states: &[usize], n_states: usize, name: &'static str) -> Result<Vec<usize>, TptError> {
    if states.is_empty() {
        return Err(TptError::EmptySet { set: name });
    }
    if let Some(&state) = states.iter().find(|&&state| state >= n_states) {
        return Err(TptError::StateOutOfRange { state, n_states });
    }
    let mut states = states.to_vec();
    states.sort_unstable();
    states.dedup();
    Ok(states)
}

// q = 0 on `zero`, 1 on `one`, and (P_II - I) q_I = -P_I,one 1 elsewhere
fn committor(p: &DMatrix<f64>, zero: &[usize], one: &[usize], system: &'static str) -> Result<DVector<f64>, TptError> {
    let n = p.nrows();
    let intermediate: Vec<usize> = (0..n).filter(|state| !zero.contains(state) && !one.contains(state)).collect();

    let mut q = DVector::<f64>::zeros(n);
    for &state in one {
        q[state] = 1.0;
    }
    if intermediate.is_empty() {
        return Ok(q);
    }

    let m = intermediate.len();
    let mut matrix = DMatrix::from_fn(m, m, |a, b| p[(intermediate[a], intermediate[b])]);
    for a in 0..m {
        matrix[(a, a)] -= 1.0;
    }
    let rhs = DVector::from_fn(m, |a, _| -one.iter().map(|&j| p[(intermediate[a], j)]).sum::<f64>());

    let solution = matrix.lu().solve(&rhs).ok_or(TptError::SingularSystem { system })?;
    if solution.iter().any(|value| !value.is_finite()) {
        return Err(TptError::SingularSystem { system });
    }
    for (a, &state) in intermediate.iter().enumerate() {
        let (value, out_of_range) = clamp_committor(solution[a]);
        if out_of_range {
            log::warn!("The {} of state {} is {:.6e} before clamping to [0, 1]", system, state, solution[a]);
        }
        q[state] = value;
    }

    Ok(q)
}

// Clamped value, and whether the raw value was beyond round-off of [0, 1]
fn clamp_committor(value: f64) -> (f64, bool) {
    let out_of_range = !(-COMMITTOR_TOLERANCE..=1.0 + COMMITTOR_TOLERANCE).contains(&value);
    (value.clamp(0.0, 1.0), out_of_range)
}

fn reactive_graph(net_flux: &DMatrix<f64>, source: &[usize], sink: &[usize]) -> DiGraph<usize, f64> {
    let mut graph = transition_graph(net_flux, |&flux| flux > 0.0);
    graph.retain_edges(|graph, edge| match graph.edge_endpoints(edge) {
        Some((from, to)) => !sink.contains(&graph[from]) && !source.contains(&graph[to]),
        None => false,
    });
    graph
}

fn net_from_gross(gross: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(gross.nrows(), gross.ncols(), |i, j| (gross[(i, j)] - gross[(j, i)]).max(0.0))
}

fn outgoing_flux(net_flux: &DMatrix<f64>, source: &[usize]) -> f64 {
    let n = net_flux.nrows();
    source
        .iter()
        .map(|&i| (0..n).filter(|j| !source.contains(j)).map(|j| net_flux[(i, j)]).sum::<f64>())
        .sum()
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TptError {
    #[error("state {state} belongs to more than one set")]
    OverlappingSets { state: usize },
    #[error("set {set} is empty")]
    EmptySet { set: &'static str },
    #[error("state {state} is out of range for {n_states} states")]
    StateOutOfRange { state: usize, n_states: usize },
    #[error("state {state} is not covered by the partition")]
    IncompletePartition { state: usize },
    #[error("state {state} has zero stationary probability")]
    ZeroStationaryProbability { state: usize },
    #[error("linear system for the {system} is singular")]
    SingularSystem { system: &'static str },
    #[error("flux fraction must lie in (0, 1], got {fraction}")]
    InvalidFraction { fraction: f64 },
    #[error("pathway extraction was cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_basin_chain() -> TransitionMatrix {
        TransitionMatrix::from_rows(vec![
            vec![0.9, 0.1, 0.0, 0.0],
            vec![0.1, 0.89, 0.01, 0.0],
            vec![0.0, 0.01, 0.89, 0.1],
            vec![0.0, 0.0, 0.1, 0.9],
        ])
        .unwrap()
    }

    fn uniform(n: usize) -> StationaryDistribution {
        StationaryDistribution::new(vec![1.0 / n as f64; n]).unwrap()
    }

    // Diamond 0 -> {1, 2} -> 3 with a wider upper branch
    fn diamond() -> (TransitionMatrix, StationaryDistribution) {
        let t = TransitionMatrix::from_rows(vec![
            vec![0.7, 0.2, 0.1, 0.0],
            vec![0.2, 0.6, 0.0, 0.2],
            vec![0.1, 0.0, 0.8, 0.1],
            vec![0.0, 0.2, 0.1, 0.7],
        ])
        .unwrap();
        (t, uniform(4))
    }

    fn network() -> FluxNetwork {
        TptEngine::new().compute(&two_basin_chain(), &uniform(4), &[0], &[3], 1).unwrap()
    }

    #[test]
    fn test_committors() {
        let flux = network();
        let expected = [0.0, 1.0 / 12.0, 11.0 / 12.0, 1.0];
        for (value, expected) in flux.forward_committor().iter().zip(expected) {
            assert_abs_diff_eq!(*value, expected, epsilon = 1e-10);
        }
        assert!(flux.forward_committor().as_slice().windows(2).all(|pair| pair[0] <= pair[1]));

        // Reversible chain: q- = 1 - q+ outside A and B
        for state in 1..3 {
            assert_abs_diff_eq!(flux.forward_committor()[state] + flux.backward_committor()[state], 1.0, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_flux_and_rate() {
        let flux = network();
        let expected_flux = 0.25 * 0.1 / 12.0;
        assert_abs_diff_eq!(flux.total_flux(), expected_flux, epsilon = 1e-12);
        assert_abs_diff_eq!(flux.net_flux()[(0, 1)], expected_flux, epsilon = 1e-12);
        assert_abs_diff_eq!(flux.net_flux()[(1, 2)], expected_flux, epsilon = 1e-12);
        assert_abs_diff_eq!(flux.net_flux()[(2, 3)], expected_flux, epsilon = 1e-12);
        assert_eq!(flux.net_flux()[(1, 0)], 0.0);
        assert_abs_diff_eq!(flux.rate(), 2.0 * expected_flux, epsilon = 1e-12);
        assert_abs_diff_eq!(flux.mfpt(), 1.0 / (2.0 * expected_flux), epsilon = 1e-6);
    }

    #[test]
    fn test_net_flux_is_conserved_at_intermediate_states() {
        let (t, pi) = diamond();
        let flux = TptEngine::new().compute(&t, &pi, &[0], &[3], 1).unwrap();
        let net = flux.net_flux();
        for state in 1..3 {
            let incoming: f64 = net.column(state).sum();
            let outgoing: f64 = net.row(state).sum();
            assert_abs_diff_eq!(incoming, outgoing, epsilon = 1e-12);
        }
        let into_sink: f64 = net.column(3).sum();
        assert_abs_diff_eq!(into_sink, flux.total_flux(), epsilon = 1e-12);
    }

    #[test]
    fn test_pathways() {
        let (t, pi) = diamond();
        let flux = TptEngine::new().compute(&t, &pi, &[0], &[3], 1).unwrap();
        let cancel = CancellationToken::new();

        let all = flux.pathways(1.0, &cancel).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].states, vec![0, 1, 3]);
        assert_eq!(all[1].states, vec![0, 2, 3]);
        assert!(all[0].flux >= all[1].flux);

        let total: f64 = all.iter().map(|path| path.flux).sum();
        assert!(total <= flux.total_flux() * (1.0 + 1e-12));
        assert_abs_diff_eq!(total, flux.total_flux(), epsilon = 1e-12);

        let dominant = flux.pathways(0.5, &cancel).unwrap();
        assert_eq!(dominant.len(), 1);
    }

    #[test]
    fn test_flux_graph_edges() {
        let (t, pi) = diamond();
        let flux = TptEngine::new().compute(&t, &pi, &[0], &[3], 1).unwrap();
        let graph = flux.flux_graph();

        assert_eq!(graph.node_count(), 4);
        let mut edges: Vec<(usize, usize)> =
            graph.edge_indices().filter_map(|edge| graph.edge_endpoints(edge)).map(|(a, b)| (graph[a], graph[b])).collect();
        edges.sort();
        assert_eq!(edges, vec![(0, 1), (0, 2), (1, 3), (2, 3)]);
        for edge in graph.edge_references() {
            assert_eq!(*edge.weight(), flux.net_flux()[(graph[edge.source()], graph[edge.target()])]);
        }
    }

    #[test]
    fn test_pathways_with_two_sources() {
        // 0 and 1 both feed 3 through 2, 1 also feeds 3 directly
        let t = TransitionMatrix::from_rows(vec![
            vec![0.6, 0.2, 0.2, 0.0],
            vec![0.2, 0.5, 0.1, 0.2],
            vec![0.2, 0.1, 0.5, 0.2],
            vec![0.0, 0.2, 0.2, 0.6],
        ])
        .unwrap();
        let flux = TptEngine::new().compute(&t, &uniform(4), &[0, 1], &[3], 1).unwrap();
        let paths = flux.pathways(1.0, &CancellationToken::new()).unwrap();

        assert!(paths.iter().all(|path| [0, 1].contains(&path.states[0]) && path.states.last() == Some(&3)));
        let total: f64 = paths.iter().map(|path| path.flux).sum();
        assert_abs_diff_eq!(total, flux.total_flux(), epsilon = 1e-12);
    }

    #[test]
    fn test_committor_clamping_flags_large_excursions() {
        assert_eq!(clamp_committor(0.3), (0.3, false));
        assert_eq!(clamp_committor(1.0 + 1e-12), (1.0, false));
        assert_eq!(clamp_committor(-1e-12), (0.0, false));
        assert_eq!(clamp_committor(-1e-6), (0.0, true));
        assert_eq!(clamp_committor(1.5), (1.0, true));
    }

    #[test]
    fn test_more_flux_never_means_fewer_paths() {
        let (t, pi) = diamond();
        let flux = TptEngine::new().compute(&t, &pi, &[0], &[3], 1).unwrap();
        let cancel = CancellationToken::new();
        let counts: Vec<usize> =
            [0.1, 0.3, 0.5, 0.7, 0.9, 1.0].iter().map(|&f| flux.pathways(f, &cancel).unwrap().len()).collect();
        assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]), "Counts {:?}", counts);
    }

    #[test]
    fn test_pathway_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        match network().pathways(0.99, &cancel) {
            Err(TptError::Cancelled) => (),
            other => panic!("Expected Cancelled error, got {:?}", other),
        }
    }

    #[test]
    fn test_coarse_grain_preserves_total_flux() {
        let flux = network();
        let (sets, coarse) = flux.coarse_grain(&[vec![0, 1], vec![2, 3]]).unwrap();

        assert_eq!(sets, vec![vec![0], vec![1], vec![2], vec![3]]);
        assert_eq!(coarse.source(), &[0]);
        assert_eq!(coarse.sink(), &[3]);
        assert_abs_diff_eq!(coarse.total_flux(), flux.total_flux(), epsilon = 1e-14);

        let (sets, coarse) = flux.coarse_grain(&[vec![0], vec![1, 2], vec![3]]).unwrap();
        assert_eq!(sets.len(), 3);
        assert_abs_diff_eq!(coarse.total_flux(), flux.total_flux(), epsilon = 1e-14);
        assert_abs_diff_eq!(coarse.stationary()[1], 0.5, epsilon = 1e-14);
    }

    #[test]
    fn test_coarse_grain_needs_partition() {
        let flux = network();
        assert_eq!(flux.coarse_grain(&[vec![0, 1], vec![1, 2, 3]]).unwrap_err(), TptError::OverlappingSets { state: 1 });
        assert_eq!(flux.coarse_grain(&[vec![0, 1], vec![3]]).unwrap_err(), TptError::IncompletePartition { state: 2 });
    }

    #[test]
    fn test_invalid_sets() {
        let engine = TptEngine::new();
        let t = two_basin_chain();
        let pi = uniform(4);

        assert_eq!(engine.compute(&t, &pi, &[0, 1], &[1, 3], 1).unwrap_err(), TptError::OverlappingSets { state: 1 });
        assert_eq!(engine.compute(&t, &pi, &[], &[3], 1).unwrap_err(), TptError::EmptySet { set: "A" });
        assert_eq!(
            engine.compute(&t, &pi, &[0], &[7], 1).unwrap_err(),
            TptError::StateOutOfRange { state: 7, n_states: 4 }
        );
    }

    #[test]
    fn test_adjacent_sets_need_no_solve() {
        let t = TransitionMatrix::from_rows(vec![vec![0.8, 0.2], vec![0.3, 0.7]]).unwrap();
        let pi = StationaryDistribution::new(vec![0.6, 0.4]).unwrap();
        let flux = TptEngine::new().compute(&t, &pi, &[0], &[1], 1).unwrap();
        assert_abs_diff_eq!(flux.total_flux(), 0.6 * 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(flux.rate(), 0.2, epsilon = 1e-12);
    }
}
