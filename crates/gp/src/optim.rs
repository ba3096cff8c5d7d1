//! Adam optimizer over named parameter groups.
//!
//! One training step is
//!
//! ```text
//! optimizer.zero_gradients();
//! optimizer.accumulate_gradients(&objective.gradients)?;
//! optimizer.step(&mut model)?;
//! ```
//!
//! Each group may have its own learning rate, other groups use the default one.

use crate::errors::{GpError, Result};
use crate::models::{Parameters, Trainable};
use linfa::Float;
use ndarray::{Array1, Zip};

/// Learning rate of a named parameter group
#[derive(Clone, Debug, PartialEq)]
pub struct ParamGroup<F: Float> {
    /// Group name
    pub name: String,
    /// Learning rate of the group
    pub learning_rate: F,
}

/// Adam: `theta -= lr * m_hat / (sqrt(v_hat) + eps)` with bias corrected moment estimates
#[derive(Clone, Debug)]
pub struct Adam<F: Float> {
    learning_rate: F,
    groups: Vec<ParamGroup<F>>,
    beta1: F,
    beta2: F,
    eps: F,
    first: Parameters<F>,
    second: Parameters<F>,
    gradients: Parameters<F>,
    steps: i32,
}

fn check_rate<F: Float>(lr: F) -> Result<()> {
    if !(lr > F::zero()) || !lr.is_finite() {
        return Err(GpError::Configuration(format!(
            "learning rate should be positive, got {lr}"
        )));
    }
    Ok(())
}

impl<F: Float> Adam<F> {
    /// Optimizer with default learning rate `learning_rate`, betas (0.9, 0.999) and eps 1e-8
    pub fn new(learning_rate: F) -> Result<Self> {
        check_rate(learning_rate)?;
        Ok(Adam {
            learning_rate,
            groups: Vec::new(),
            beta1: F::cast(0.9),
            beta2: F::cast(0.999),
            eps: F::cast(1e-8),
            first: Parameters::new(),
            second: Parameters::new(),
            gradients: Parameters::new(),
            steps: 0,
        })
    }

    /// Sets the learning rate of the group `name`
    pub fn with_group(mut self, name: &str, learning_rate: F) -> Result<Self> {
        check_rate(learning_rate)?;
        match self.groups.iter_mut().find(|g| g.name == name) {
            Some(g) => g.learning_rate = learning_rate,
            None => self.groups.push(ParamGroup {
                name: name.to_string(),
                learning_rate,
            }),
        }
        Ok(self)
    }

    /// Sets the moment decay rates, both in [0, 1)
    pub fn with_betas(mut self, beta1: F, beta2: F) -> Result<Self> {
        let valid = |b: F| b >= F::zero() && b < F::one();
        if !valid(beta1) || !valid(beta2) {
            return Err(GpError::Configuration(format!(
                "Adam betas should be in [0, 1), got ({beta1}, {beta2})"
            )));
        }
        self.beta1 = beta1;
        self.beta2 = beta2;
        Ok(self)
    }

    /// Learning rate applied to the group `name`
    pub fn learning_rate(&self, name: &str) -> F {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .map_or(self.learning_rate, |g| g.learning_rate)
    }

    /// Groups with a specific learning rate
    pub fn groups(&self) -> &[ParamGroup<F>] {
        &self.groups
    }

    /// Number of steps taken
    pub fn num_steps(&self) -> usize {
        self.steps as usize
    }

    /// Clears accumulated gradients
    pub fn zero_gradients(&mut self) {
        self.gradients = Parameters::new();
    }

    /// Adds `gradients` to the accumulated ones
    pub fn accumulate_gradients(&mut self, gradients: &Parameters<F>) -> Result<()> {
        for (name, grad) in gradients.iter() {
            match self.gradients.get_mut(name) {
                Some(acc) if acc.len() == grad.len() => *acc += grad,
                Some(acc) => {
                    return Err(GpError::dimension_mismatch(
                        "accumulated gradient",
                        acc.len(),
                        grad.len(),
                    ))
                }
                None => self.gradients.register(name, grad.to_owned()),
            }
        }
        Ok(())
    }

    /// Updates the model groups having accumulated gradients
    pub fn step<T: Trainable<F>>(&mut self, model: &mut T) -> Result<()> {
        if self.gradients.is_empty() {
            return Ok(());
        }
        self.steps += 1;
        let current = model.parameters();
        let bias1 = F::one() - self.beta1.powi(self.steps);
        let bias2 = F::one() - self.beta2.powi(self.steps);
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);

        let mut updated = Parameters::new();
        for (name, grad) in self.gradients.iter() {
            let theta = current.get(name).ok_or_else(|| {
                GpError::Configuration(format!("gradient for unknown parameter group {name}"))
            })?;
            if theta.len() != grad.len() {
                return Err(GpError::dimension_mismatch(
                    "parameter group gradient",
                    theta.len(),
                    grad.len(),
                ));
            }
            // moments restart when a group changes size
            for moments in [&mut self.first, &mut self.second] {
                if moments.get(name).map_or(true, |m| m.len() != grad.len()) {
                    moments.register(name, Array1::zeros(grad.len()));
                }
            }
            let (Some(m), Some(v)) = (self.first.get_mut(name), self.second.get_mut(name)) else {
                continue;
            };
            let lr = self
                .groups
                .iter()
                .find(|g| g.name == name)
                .map_or(self.learning_rate, |g| g.learning_rate);
            let mut next = theta.to_owned();
            Zip::from(&mut next)
                .and(m)
                .and(v)
                .and(grad)
                .for_each(|t, m, v, &g| {
                    *m = beta1 * *m + (F::one() - beta1) * g;
                    *v = beta2 * *v + (F::one() - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *t -= lr * m_hat / (v_hat.sqrt() + eps);
                });
            updated.register(name, next);
        }
        model.set_parameters(&updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Generation;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[derive(Clone, Debug)]
    struct Quadratic {
        x: Array1<f64>,
        generation: Generation,
    }

    impl Quadratic {
        fn gradients(&self) -> Parameters<f64> {
            let mut g = Parameters::new();
            g.register("x", &self.x * 2. - 2.);
            g
        }
    }

    impl Trainable<f64> for Quadratic {
        fn parameters(&self) -> Parameters<f64> {
            let mut p = Parameters::new();
            p.register("x", self.x.clone());
            p
        }

        fn set_parameters(&mut self, params: &Parameters<f64>) -> Result<()> {
            if let Some(x) = params.get("x") {
                self.x.assign(x);
            }
            self.generation.bump();
            Ok(())
        }

        fn generation(&self) -> Generation {
            self.generation
        }
    }

    #[test]
    fn test_adam_first_step_is_learning_rate() {
        let mut model = Quadratic {
            x: array![0., 3.],
            generation: Generation::default(),
        };
        let mut adam = Adam::new(0.1).unwrap();
        adam.zero_gradients();
        adam.accumulate_gradients(&model.gradients()).unwrap();
        adam.step(&mut model).unwrap();
        assert_abs_diff_eq!(model.x, array![0.1, 2.9], epsilon = 1e-6);
        assert_eq!(adam.num_steps(), 1);
        assert_eq!(model.generation().value(), 1);
    }

    #[test]
    fn test_adam_converges() {
        let mut model = Quadratic {
            x: array![-4., 5.],
            generation: Generation::default(),
        };
        let mut adam = Adam::new(0.05).unwrap().with_group("x", 0.1).unwrap();
        assert_eq!(adam.learning_rate("x"), 0.1);
        assert_eq!(adam.learning_rate("other"), 0.05);
        for _ in 0..500 {
            adam.zero_gradients();
            adam.accumulate_gradients(&model.gradients()).unwrap();
            adam.step(&mut model).unwrap();
        }
        assert_abs_diff_eq!(model.x, array![1., 1.], epsilon = 1e-2);
    }

    #[test]
    fn test_accumulate_and_errors() {
        let mut adam = Adam::new(0.1).unwrap();
        let mut g = Parameters::new();
        g.register("x", array![1., 2.]);
        adam.accumulate_gradients(&g).unwrap();
        adam.accumulate_gradients(&g).unwrap();
        let mut bad = Parameters::new();
        bad.register("x", array![1.]);
        assert!(adam.accumulate_gradients(&bad).is_err());
        let mut unknown = Parameters::new();
        unknown.register("y", array![1.]);
        adam.zero_gradients();
        adam.accumulate_gradients(&unknown).unwrap();
        let mut model = Quadratic {
            x: array![0., 0.],
            generation: Generation::default(),
        };
        assert!(adam.step(&mut model).is_err());
        assert!(Adam::new(0.).is_err());
        assert!(Adam::new(0.1).unwrap().with_betas(1., 0.5).is_err());
    }
}
