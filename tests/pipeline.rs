use fret_analysis::config::AnalysisConfig;
use fret_analysis::population::lifetimes::select_lifetimes;
use fret_analysis::population::*;
use fret_analysis::progress::NoProgress;
use fret_analysis::signal_analysis::hmm::hmm_matrices::{StartMatrix, TransitionMatrix};
use fret_analysis::signal_analysis::hmm::HMM;
use fret_analysis::trace_selection::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const LEVELS: [f64; 2] = [0.25, 0.7];
const NUM_FRAMES: usize = 400;

fn simulated_trace(name: &str, bleach: usize, rng: &mut StdRng) -> Trace {
    let start_matrix = StartMatrix::new(vec![0.5, 0.5]);
    let transition_matrix = TransitionMatrix::new(vec![vec![0.97, 0.03], vec![0.03, 0.97]]);
    let path = HMM::gen_state_sequence(&start_matrix, &transition_matrix, NUM_FRAMES, rng);
    let noise = Normal::new(0.0, 25.0).unwrap();

    let mut channels = [Vec::new(), Vec::new(), Vec::new()];
    for (t, state) in path.iter().enumerate() {
        let e = LEVELS[*state];
        let clean = if t < bleach { [1000.0 * (1.0 - e), 1000.0 * e, 1000.0] } else { [0.0; 3] };
        for (channel, value) in channels.iter_mut().zip(clean) {
            channel.push(value + noise.sample(rng));
        }
    }

    let [grn, acc, red] = channels;
    let mut trace = Trace::new(
        name,
        TraceChannel::from_intensity(grn),
        TraceChannel::from_intensity(acc),
        TraceChannel::from_intensity(red),
    )
    .unwrap();
    trace.set_bleach(Channel::Green, Some(bleach)).unwrap();
    trace.is_checked = true;
    trace
}

fn simulated_set() -> TraceSet {
    let mut rng = StdRng::seed_from_u64(21);
    let traces = (0..4).map(|i| simulated_trace(&format!("trace_{}", i), 300 + 20 * i, &mut rng)).collect();
    TraceSet::from_traces(traces)
}

// Test segmentation, pooling and the population fits end to end
#[test]
fn test_two_level_pipeline() {
    let config = AnalysisConfig::default();
    let mut set = simulated_set();

    let num_fitted = set.fit_checked_traces_hmm(&config, &mut NoProgress);
    assert_eq!(num_fitted, 4);

    for trace in set.checked() {
        let (idealized, frame_idx) = trace.get_hmm().unwrap();
        assert_eq!(idealized.len(), trace.first_bleach().unwrap());
        assert_eq!(frame_idx[0], 1);

        // Idealized values sit near one of the two simulated levels
        assert!(idealized.iter().all(|y| LEVELS.iter().any(|level| (y - level).abs() < 0.05)));
    }

    let transitions = set.pooled_lifetimes();
    assert!(!transitions.is_empty());
    assert!(transitions.iter().all(|t| t.lifetime > 0 && (t.y_before - t.y_after).abs() > 0.3));

    let up = select_lifetimes(&transitions, (0.0, 0.5), (0.5, 1.0));
    let fit = fit_exponential_lifetime(&up).unwrap();
    assert!(fit.scale > 0.0);

    let pooled = set.pooled_es(&config, None);
    assert_eq!(pooled.n_samples, 4);
    assert_eq!(pooled.e_un.len(), 300 + 320 + 340 + 360);
    assert_eq!(pooled.median_len, Some(330.0));

    let mixture = TraceSet::fit_pooled_gaussians(&pooled, false, MixtureOrder::auto(config.gaussian_max_states))
        .unwrap()
        .unwrap();
    assert_eq!(mixture.best_k, Some(2));
    assert!((mixture.params[0].0 - LEVELS[0]).abs() < 0.03);
    assert!((mixture.params[1].0 - LEVELS[1]).abs() < 0.03);

    let contour = contour_2d(&pooled.e_un, &pooled.s_un, &config.density).unwrap();
    assert_eq!(contour.z.shape(), (config.density.resolution, config.density.resolution));

    let before: Vec<f64> = transitions.iter().map(|t| t.y_before).collect();
    let after: Vec<f64> = transitions.iter().map(|t| t.y_after).collect();
    let density = contour_2d(&before, &after, &DensitySettings::transition_density()).unwrap();
    assert_eq!(density.z.nrows(), 40);
    assert!(density.levels.windows(2).all(|w| w[0] < w[1]));
}

// Test that selection drives which traces get fitted
#[test]
fn test_selection_limits_fitting() {
    let config = AnalysisConfig::default();
    let mut set = simulated_set();

    let num_checked = set.select_by_condition(&SelectionCondition::Red);
    assert_eq!(num_checked, 0);
    assert_eq!(set.fit_checked_traces_hmm(&config, &mut NoProgress), 0);
    assert!(set.pooled_lifetimes().is_empty());

    let num_checked = set.select_by_condition(&SelectionCondition::Green);
    assert_eq!(num_checked, 4);
}
