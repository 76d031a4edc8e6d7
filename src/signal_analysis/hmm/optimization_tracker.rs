pub struct OptimizationTracker {
    evals: Vec<f64>,
    iters: usize,

    termination_criterium: TerminationCriterium,
}

impl OptimizationTracker {
    pub fn new(termination_criterium: TerminationCriterium) -> Self {
        Self {
            evals: Vec::new(),
            iters: 0,
            termination_criterium,
        }
    }

    pub fn max_iterations(&self) -> bool {
        match self.termination_criterium {
            TerminationCriterium::MaxIterations { max_iterations } |
            TerminationCriterium::OneStepConvergence { max_iterations, .. } |
            TerminationCriterium::OneStepConvergenceAbsolute { max_iterations, .. } => self.iters >= max_iterations,
        }
    }

    pub fn one_step_convergence(&self) -> bool {
        if self.iters < 2 {
            return false;
        }

        let curr = self.evals[self.iters - 1];
        let prev = self.evals[self.iters - 2];

        match self.termination_criterium {
            TerminationCriterium::OneStepConvergence { epsilon, .. } => {
                if prev.abs() < f64::EPSILON {
                    return true;
                }
                (curr - prev).abs() / prev.abs() < epsilon
            }
            // Gain rather than distance, a step that lowers the objective also stops
            TerminationCriterium::OneStepConvergenceAbsolute { epsilon, .. } => curr - prev < epsilon,
            TerminationCriterium::MaxIterations { .. } => false,
        }
    }

    // Record a new objective value. Returns true once the run should stop.
    pub fn step(&mut self, new_eval: f64) -> bool {
        self.evals.push(new_eval);
        self.iters += 1;

        self.max_iterations() || self.one_step_convergence()
    }

    pub fn get_iterations(&self) -> usize {
        self.iters
    }

    pub fn get_evals(&self) -> &[f64] {
        &self.evals
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationCriterium {
    MaxIterations { max_iterations: usize },
    OneStepConvergence { epsilon: f64, max_iterations: usize }, // Relative improvement below epsilon
    OneStepConvergenceAbsolute { epsilon: f64, max_iterations: usize }, // Absolute gain below epsilon
}
