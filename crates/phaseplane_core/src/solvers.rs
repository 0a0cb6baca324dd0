use crate::error::EvaluationError;
use crate::traits::{DynamicalSystem, EmbeddedStep, Scalar, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            k3: vec![z; dim],
            k4: vec![z; dim],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step(
        &mut self,
        system: &impl DynamicalSystem<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> Result<(), EvaluationError> {
        let half = T::from_real(0.5);
        let sixth = T::from_real(1.0 / 6.0);
        let two = T::from_real(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

/// Dormand-Prince 5(4) pair.
///
/// Propagates the 5th order solution; the difference to the embedded 4th
/// order solution is the local error estimate.
pub struct Dopri5 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
}

impl Dopri5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
        }
    }
}

// Butcher tableau
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    // The 7th stage is evaluated at the 5th order solution (FSAL row).
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];
// 5th order minus 4th order weights
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

impl EmbeddedStep for Dopri5 {
    const ORDER: usize = 5;

    fn try_step(
        &mut self,
        system: &impl DynamicalSystem<f64>,
        t: f64,
        state: &[f64],
        dt: f64,
        out: &mut [f64],
        error: &mut [f64],
    ) -> Result<(), EvaluationError> {
        let n = state.len();
        system.apply(t, state, &mut self.k[0])?;

        for stage in 1..7 {
            for i in 0..n {
                let increment: f64 = A[stage][..stage]
                    .iter()
                    .zip(&self.k[..stage])
                    .map(|(a, k)| a * k[i])
                    .sum();
                self.tmp[i] = state[i] + dt * increment;
            }
            system.apply(t + C[stage] * dt, &self.tmp, &mut self.k[stage])?;
        }

        // The last stage input is the 5th order solution.
        out.copy_from_slice(&self.tmp);
        for i in 0..n {
            error[i] = dt * E.iter().zip(&self.k).map(|(e, k)| e * k[i]).sum::<f64>();
        }
        Ok(())
    }
}
