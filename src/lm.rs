//! Levenberg-Marquardt least-squares solver shared by the peak and flux fits

use nalgebra::{DMatrix, DVector};

/// A least-squares problem: minimize the sum of squared residuals.
pub trait LeastSquaresModel {
    /// Number of residuals
    fn residual_count(&self) -> usize;

    /// Number of free parameters
    fn parameter_count(&self) -> usize;

    /// Residual `index` at `params`
    fn residual(&self, index: usize, params: &[f64]) -> f64;

    /// Derivatives of residual `index` with respect to each parameter
    fn gradient(&self, index: usize, params: &[f64], grad: &mut [f64]);

    fn cost(&self, params: &[f64]) -> f64 {
        (0..self.residual_count())
            .map(|i| self.residual(i, params).powi(2))
            .sum()
    }
}

/// Box constraints applied after every step
#[derive(Debug, Clone)]
pub struct Bounds {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl Bounds {
    fn clamp(&self, params: &mut [f64]) {
        for (i, p) in params.iter_mut().enumerate() {
            *p = p.max(self.lower[i]).min(self.upper[i]);
        }
    }
}

/// Result of a least-squares run
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub params: Vec<f64>,
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    /// Relative decrease of the cost below which the fit is converged
    pub tolerance: f64,
    /// Relative step size below which the fit is converged
    pub step_tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
    max_lambda: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-12,
            step_tolerance: 1e-10,
            lambda: 1e-3,
            lambda_factor: 10.0,
            max_lambda: 1e16,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Minimize the model's cost starting at `initial`.
    ///
    /// A run that cannot lower the cost any further under maximal damping is
    /// at a minimum and counts as converged; running out of iterations or
    /// reaching a non-finite cost does not.
    pub fn fit(
        &self,
        model: &dyn LeastSquaresModel,
        initial: &[f64],
        bounds: Option<&Bounds>,
    ) -> FitOutcome {
        let n_params = model.parameter_count();
        let n_points = model.residual_count();

        let mut params = initial.to_vec();
        if let Some(bounds) = bounds {
            bounds.clamp(&mut params);
        }
        let mut cost = model.cost(&params);
        if n_points < n_params || !cost.is_finite() {
            return FitOutcome {
                params,
                cost,
                iterations: 0,
                converged: false,
            };
        }

        let mut lambda = self.lambda;
        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for iteration in 1..=self.max_iterations {
            for i in 0..n_points {
                residuals[i] = model.residual(i, &params);
                model.gradient(i, &params, &mut gradient);
                for (j, &grad) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = grad;
                }
            }

            if cost == 0.0 {
                return FitOutcome {
                    params,
                    cost,
                    iterations: iteration,
                    converged: true,
                };
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                // Marquardt damping scaled by the curvature of each parameter
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
                }

                let step = h.lu().solve(&(-&jtr));
                if let Some(delta) = step.filter(|d| d.iter().all(|v| v.is_finite())) {
                    let mut candidate: Vec<f64> =
                        params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
                    if let Some(bounds) = bounds {
                        bounds.clamp(&mut candidate);
                    }

                    let new_cost = model.cost(&candidate);
                    if new_cost.is_finite() && new_cost < cost {
                        let decrease = cost - new_cost;
                        let step_norm = params
                            .iter()
                            .zip(&candidate)
                            .map(|(a, b)| (a - b).powi(2))
                            .sum::<f64>()
                            .sqrt();
                        let param_norm = params.iter().map(|p| p * p).sum::<f64>().sqrt();

                        params = candidate;
                        cost = new_cost;
                        lambda = (lambda / self.lambda_factor).max(1e-12);

                        if decrease <= self.tolerance * (cost + decrease)
                            || step_norm <= self.step_tolerance * (param_norm + self.step_tolerance)
                        {
                            return FitOutcome {
                                params,
                                cost,
                                iterations: iteration,
                                converged: true,
                            };
                        }
                        break;
                    }
                }

                // Reject update, increase lambda
                lambda *= self.lambda_factor;
                if lambda > self.max_lambda {
                    return FitOutcome {
                        params,
                        cost,
                        iterations: iteration,
                        converged: true,
                    };
                }
            }
        }

        FitOutcome {
            params,
            cost,
            iterations: self.max_iterations,
            converged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// y = a * exp(b * x)
    struct Exponential {
        x: Vec<f64>,
        y: Vec<f64>,
    }

    impl LeastSquaresModel for Exponential {
        fn residual_count(&self) -> usize {
            self.x.len()
        }

        fn parameter_count(&self) -> usize {
            2
        }

        fn residual(&self, index: usize, params: &[f64]) -> f64 {
            self.y[index] - params[0] * (params[1] * self.x[index]).exp()
        }

        fn gradient(&self, index: usize, params: &[f64], grad: &mut [f64]) {
            let e = (params[1] * self.x[index]).exp();
            grad[0] = -e;
            grad[1] = -params[0] * self.x[index] * e;
        }
    }

    fn exponential_data() -> Exponential {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let y = x.iter().map(|x| 3.0 * (-1.5 * x).exp()).collect();
        Exponential { x, y }
    }

    #[test]
    fn test_recovers_exponential() {
        let model = exponential_data();
        let outcome = LevenbergMarquardt::default().fit(&model, &[1.0, -0.5], None);
        assert!(outcome.converged);
        assert!((outcome.params[0] - 3.0).abs() < 1e-6);
        assert!((outcome.params[1] + 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_bounds_are_respected() {
        let model = exponential_data();
        let bounds = Bounds {
            lower: vec![0.0, -1.0],
            upper: vec![10.0, 0.0],
        };
        let outcome = LevenbergMarquardt::default().fit(&model, &[1.0, -0.5], Some(&bounds));
        assert!(outcome.params[1] >= -1.0);
    }

    #[test]
    fn test_iteration_budget_exhaustion_is_not_converged() {
        let model = exponential_data();
        let outcome = LevenbergMarquardt::default()
            .with_max_iterations(1)
            .fit(&model, &[0.1, 2.0], None);
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 1);
    }

    #[test]
    fn test_underdetermined_problem_is_not_converged() {
        let model = Exponential {
            x: vec![1.0],
            y: vec![2.0],
        };
        let outcome = LevenbergMarquardt::default().fit(&model, &[1.0, 0.0], None);
        assert!(!outcome.converged);
    }
}
