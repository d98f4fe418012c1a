use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use msm_lib::msm::cancellation::CancellationToken;
use msm_lib::msm::config::MsmConfig;
use msm_lib::msm::dtraj::DiscreteTrajectory;
use msm_lib::msm::errors::MsmError;
use msm_lib::msm::its::implied_timescale_scan;
use msm_lib::msm::model::{BayesianMarkovStateModel, MarkovStateModel};
use msm_lib::msm::pcca::{PccaDecomposition, PccaError};
use msm_lib::msm::persistence::ModelStore;
use msm_lib::msm::transition_matrix::TransitionMatrix;
use msm_lib::msm::MarkovChain;

#[derive(Parser, Debug)]
#[command(name = "msm-lib")]
#[command(about = "Estimate and analyze a Markov state model from discrete trajectories", long_about = None)]
struct Args {
    /// JSON file with an array of integer trajectories; simulates a two-basin chain if absent
    #[arg(short, long, value_name = "JSON")]
    trajectories: Option<PathBuf>,

    /// Pipeline configuration (JSON)
    #[arg(short, long, value_name = "JSON")]
    config: Option<PathBuf>,

    #[arg(long)]
    lag: Option<usize>,

    /// Number of PCCA+ metastable sets
    #[arg(long)]
    n_sets: Option<usize>,

    /// Bayesian samples to draw (0 skips sampling)
    #[arg(long, default_value_t = 0)]
    samples: usize,

    /// Frames per simulated trajectory
    #[arg(long, default_value_t = 100_000)]
    steps: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Lag times for an implied timescale scan, comma separated
    #[arg(long, value_delimiter = ',')]
    its_lags: Vec<usize>,

    /// TPT source states (original ids); defaults to the first metastable set
    #[arg(long, value_delimiter = ',')]
    source: Vec<usize>,

    /// TPT sink states (original ids); defaults to the last metastable set
    #[arg(long, value_delimiter = ',')]
    sink: Vec<usize>,

    /// Model store to save the estimated model into
    #[arg(long, value_name = "JSON")]
    store: Option<PathBuf>,

    #[arg(long, default_value = "msm")]
    model_name: String,

    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => MsmConfig::from_json_file(path).with_context(|| format!("reading config {}", path.display()))?,
        None => MsmConfig::default(),
    };
    if let Some(lag) = args.lag {
        config.counting.lag = lag;
    }
    if let Some(n_sets) = args.n_sets {
        config.pcca.n_sets = n_sets;
    }
    if args.samples > 0 {
        config.bayesian.n_samples = args.samples;
        config.bayesian.seed.get_or_insert(args.seed);
    }
    config.validate()?;

    let dtrajs = match &args.trajectories {
        Some(path) => read_trajectories(path)?,
        None => simulate_two_basin(args.steps, args.seed)?,
    };
    log::info!(
        "{} trajectories, {} frames in total",
        dtrajs.len(),
        dtrajs.iter().map(DiscreteTrajectory::len).sum::<usize>()
    );

    let model = MarkovStateModel::estimate(&dtrajs, &config)?;
    log::info!(
        "Active set: {} states (state fraction {:.4}, count fraction {:.4})",
        model.active_set().len(),
        model.active_state_fraction(),
        model.active_count_fraction()
    );
    log::info!("Eigenvalues: {:?}", model.eigenvalues());
    log::info!("Implied timescales: {:?}", model.timescales(config.pcca.n_sets));

    let pcca = decompose(&model, config.pcca.n_sets)?;
    let sets = model.metastable_sets(&pcca);
    for (index, set) in sets.iter().enumerate() {
        log::info!(
            "Metastable set {}: states {:?}, probability {:.4}, center {:?}",
            index,
            set,
            pcca.set_probabilities()[index],
            model.active_set().global_index(pcca.centers()[index])
        );
    }
    log::info!("Coarse-grained transition matrix: {}", pcca.coarse_grained_transition_matrix());
    log::info!("MFPT between metastable sets: {}", model.metastable_mfpt_matrix(&pcca)?);

    let source = if args.source.is_empty() { sets.first().cloned().unwrap_or_default() } else { args.source.clone() };
    let sink = if args.sink.is_empty() { sets.last().cloned().unwrap_or_default() } else { args.sink.clone() };
    let network = model.tpt(&source, &sink)?;
    log::info!(
        "TPT {:?} -> {:?}: total flux {:.4e}, rate {:.4e}, mfpt {:.2}",
        source,
        sink,
        network.total_flux(),
        network.rate(),
        network.mfpt()
    );
    let cancel = CancellationToken::new();
    for pathway in network.pathways(config.tpt.fraction, &cancel)? {
        log::info!(
            "  pathway {:?}: flux {:.4e} ({:.1}%)",
            model.to_original(&pathway.states),
            pathway.flux,
            100.0 * pathway.flux / network.total_flux()
        );
    }

    if args.samples > 0 {
        let bayesian = BayesianMarkovStateModel::sample(&dtrajs, &config, &cancel)?;
        let timescales = bayesian.timescales_statistics(config.pcca.n_sets)?;
        log::info!(
            "Bayesian timescales ({} samples): mean {:?}, {:.0}% interval {:?} - {:?}",
            timescales.n_samples,
            timescales.mean,
            100.0 * timescales.confidence,
            timescales.lower,
            timescales.upper
        );
    }

    if !args.its_lags.is_empty() {
        let its = implied_timescale_scan(&dtrajs, &args.its_lags, config.pcca.n_sets, &config)?;
        for (lag, timescales) in its.lags.iter().zip(&its.timescales) {
            log::info!("ITS lag {}: {:?}", lag, timescales);
        }
    }

    if let Some(path) = &args.store {
        let store = ModelStore::open(path);
        store.save(&args.model_name, &model.to_record(Some(&pcca)), args.overwrite)?;
    }

    Ok(())
}

// Proceeds with a poorly separated decomposition after the warning
fn decompose(model: &MarkovStateModel, n_sets: usize) -> Result<PccaDecomposition> {
    match model.pcca(n_sets) {
        Ok(decomposition) => Ok(decomposition),
        Err(MsmError::Pcca(error @ PccaError::InsufficientSpectralGap { .. })) => {
            error.into_decomposition().context("spectral gap error without a decomposition")
        }
        Err(error) => Err(error.into()),
    }
}

fn read_trajectories(path: &Path) -> Result<Vec<DiscreteTrajectory>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading trajectories {}", path.display()))?;
    let raw: Vec<Vec<usize>> = serde_json::from_str(&text).context("trajectories must be a JSON array of integer arrays")?;
    Ok(raw.into_iter().map(DiscreteTrajectory::new).collect())
}

fn simulate_two_basin(n_steps: usize, seed: u64) -> Result<Vec<DiscreteTrajectory>> {
    let chain = TransitionMatrix::from_rows(vec![
        vec![0.9, 0.1, 0.0, 0.0],
        vec![0.1, 0.89, 0.01, 0.0],
        vec![0.0, 0.01, 0.89, 0.1],
        vec![0.0, 0.0, 0.1, 0.9],
    ])?;
    let mut rng = StdRng::seed_from_u64(seed);
    let dtrajs = [0, 3]
        .into_iter()
        .map(|start| MarkovChain::simulate(&chain, start, n_steps, &mut rng))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dtrajs)
}
