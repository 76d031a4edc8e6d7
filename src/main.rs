use std::env;
use std::error::Error;

use fret_analysis::config::AnalysisConfig;
use fret_analysis::signal_analysis::hmm::hmm_matrices::{StartMatrix, TransitionMatrix};
use fret_analysis::signal_analysis::hmm::HMM;
use fret_analysis::trace_selection::{Channel, Trace, TraceChannel};
use plotters::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const NUM_FRAMES: usize = 500;
const BLEACH_FRAME: usize = 420;
const TOTAL_INTENSITY: f64 = 1000.0;
const BACKGROUND: f64 = 80.0;
const FRET_LEVELS: [f64; 2] = [0.25, 0.7];

// Two-level molecule with shot noise, donor and acceptor gone after the bleach
fn simulate_trace(rng: &mut StdRng) -> Result<Trace, Box<dyn Error>> {
    let start_matrix = StartMatrix::new(vec![0.5, 0.5]);
    let transition_matrix = TransitionMatrix::new(vec![vec![0.97, 0.03], vec![0.04, 0.96]]);
    let path = HMM::gen_state_sequence(&start_matrix, &transition_matrix, NUM_FRAMES, rng);

    let noise = Normal::new(0.0, 30.0)?;
    let mut grn = Vec::with_capacity(NUM_FRAMES);
    let mut acc = Vec::with_capacity(NUM_FRAMES);
    let mut red = Vec::with_capacity(NUM_FRAMES);

    for (t, state) in path.iter().enumerate() {
        let (i_dd, i_da, i_aa) = if t < BLEACH_FRAME {
            let e = FRET_LEVELS[*state];
            (TOTAL_INTENSITY * (1.0 - e), TOTAL_INTENSITY * e, TOTAL_INTENSITY)
        } else {
            (0.0, 0.0, 0.0)
        };

        grn.push(i_dd + BACKGROUND + noise.sample(rng));
        acc.push(i_da + BACKGROUND + noise.sample(rng));
        red.push(i_aa + BACKGROUND + noise.sample(rng));
    }

    let background = vec![BACKGROUND; NUM_FRAMES];
    let mut trace = Trace::new(
        "simulated",
        TraceChannel::new(grn, background.clone()),
        TraceChannel::new(acc, background.clone()),
        TraceChannel::new(red, background),
    )?;
    trace.set_bleach(Channel::Green, Some(BLEACH_FRAME))?;

    Ok(trace)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => AnalysisConfig::from_json_file(path)?,
        None => AnalysisConfig::default(),
    };

    let mut rng = StdRng::seed_from_u64(2024);
    let mut trace = simulate_trace(&mut rng)?;
    trace.calculate_es(&config);

    let fit = trace.fit_hmm(&config)?;

    println!("Selected {} states, BIC scores {:?}", fit.num_states, fit.bics);
    for (state, occupancy) in fit.state_occupancy.iter().enumerate() {
        println!("State {} occupies {:.1}% of the frames", state, 100.0 * occupancy);
    }
    println!("Log-likelihood of the selected model: {:.2}", fit.log_likelihood);
    for transition in &fit.transitions {
        println!("{:.3} -> {:.3} after {} frames", transition.y_before, transition.y_after, transition.lifetime);
    }

    plot_fret(trace.get_fret(), &fit.idealized)?;

    Ok(())
}

fn plot_fret(fret: &[f64], idealized: &[f64]) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new("fret_fit.png", (800, 600)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root_area)
        .caption("FRET Trace and Idealized Fit", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0..fret.len(), -0.3..1.3)?;

    chart.configure_mesh().x_desc("Frame").y_desc("E").draw()?;

    chart.draw_series(LineSeries::new(
        fret.iter().enumerate().map(|(i, &v)| (i, v)),
        &RED,
    ))?.label("E")
      .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));

    chart.draw_series(LineSeries::new(
        idealized.iter().enumerate().map(|(i, &v)| (i, v)),
        &BLUE,
    ))?.label("HMM")
      .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    chart.configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;

    Ok(())
}
