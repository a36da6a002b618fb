//! Analytic M/G/1-with-vacations model of the time-sliced server.
//!
//! The server's residence/vacation rotation is treated as an M/G/1 queue
//! with server vacations: service takes `X = C * t_clk`, one visit cycle
//! takes `TT = Rs*N + S*N/C` clocks, and the vacation share of the cycle
//! drives the extra wait term `V`. Every wait/occupancy output is NaN when
//! the utilization `rho` reaches one.

use serde::{Deserialize, Serialize};

use vqsim_core::error::TypedResult;
use vqsim_core::problem;

/// How the arrival intensity of a model is specified.
///
/// Whichever is given, the others are derived through
/// [QueueingModelMg1::lambd_from_offered_load] and
/// [QueueingModelMg1::lambd_from_rho].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Load {
    /// Per-stream arrival rate
    Lambda(f64),
    /// `lambd * N * t_clk`, offered work per clock normalized to capacity
    OfferedLoad(f64),
    /// Utilization `lambd / muS`
    Rho(f64),
}

/// How the clock of a model is specified: exactly one of the frequency and
/// the period, the other being its reciprocal. [Clock::Unit] is the default
/// when neither is given (`f_clk = t_clk = 1`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum Clock {
    /// Clock frequency `f_clk`
    Frequency(f64),
    /// Clock period `t_clk`
    Period(f64),
    #[default]
    Unit,
}

impl Clock {
    /// Resolves to `(f_clk, t_clk)`.
    fn resolve(self) -> TypedResult<(f64, f64)> {
        match self {
            Clock::Frequency(f_clk) => {
                if !(f_clk > 0.0) {
                    problem!(Parameter, "f_clk must be positive, got {f_clk}");
                }
                Ok((f_clk, 1.0 / f_clk))
            }
            Clock::Period(t_clk) => {
                if !(t_clk > 0.0) {
                    problem!(Parameter, "t_clk must be positive, got {t_clk}");
                }
                Ok((1.0 / t_clk, t_clk))
            }
            Clock::Unit => Ok((1.0, 1.0)),
        }
    }
}

/// Resolved inputs of one model evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelParameters {
    pub n: u64,
    pub c: u64,
    pub s: u64,
    pub rs: u64,
    pub f_clk: f64,
    pub t_clk: f64,
    pub lambd: f64,
}

/// Everything the model computes. Symbol names follow the queueing-theory
/// derivation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelOutputs {
    pub offered_load: f64,
    /// Clocks lost to context switches per cycle
    pub tcs: f64,
    /// Total cycle length in clocks
    pub tt: f64,
    /// Clocks of service a stream sees per cycle
    pub ts: f64,
    /// Clocks of vacation a stream sees per cycle
    pub tv: f64,
    /// Service time and its second and third powers
    pub x: f64,
    pub x2: f64,
    pub x3: f64,
    /// Mean vacation waiting time
    pub v: f64,
    /// Per-stream service rate including vacation amortization
    pub mu_s: f64,
    /// Threshold above which the residence window amortizes the switch cost
    pub rs_gt_f: f64,
    /// Smallest integer residence window above the threshold
    pub rs_min: f64,
    pub rho: f64,
    /// Total achievable throughput
    pub ttot: f64,
    /// Total achievable throughput with free context switches
    pub ttot0: f64,
    /// Empty-queue probability
    pub p0: f64,
    /// Fractions of the cycle in service, vacation and context switch
    pub ps: f64,
    pub pv: f64,
    pub pcs: f64,
    /// Queue / head-of-queue / service / total wait times
    pub wq: f64,
    pub wh: f64,
    pub ws: f64,
    pub wtot: f64,
    /// Mean number in queue / in service / in system
    pub nq: f64,
    pub ns: f64,
    pub ntot: f64,
}

/// The evaluated model: resolved parameters plus all outputs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueingModelMg1 {
    parameters: ModelParameters,
    calculations: ModelOutputs,
}

impl QueueingModelMg1 {
    pub fn new(n: u64, c: u64, s: u64, rs: u64, clock: Clock, load: Load) -> TypedResult<Self> {
        if c < 1 || n < c || n % c != 0 {
            problem!(
                Parameter,
                "n must be >= c and a multiple of c, n is {n} and c is {c}"
            );
        }
        let (f_clk, t_clk) = clock.resolve()?;

        let lambd = match load {
            Load::Lambda(lambd) => lambd,
            Load::OfferedLoad(offered_load) => {
                Self::lambd_from_offered_load(n, t_clk, offered_load)
            }
            Load::Rho(rho) => Self::lambd_from_rho(n, c, s, rs, t_clk, rho),
        };

        let parameters = ModelParameters {
            n,
            c,
            s,
            rs,
            f_clk,
            t_clk,
            lambd,
        };
        let calculations = Self::calculate(&parameters);
        Ok(Self {
            parameters,
            calculations,
        })
    }

    fn calculate(p: &ModelParameters) -> ModelOutputs {
        let (n, c, s, rs) = (p.n as f64, p.c as f64, p.s as f64, p.rs as f64);
        let (t_clk, lambd) = (p.t_clk, p.lambd);

        let tcs = s * n / c;
        let tt = rs * n + tcs;
        let ts = rs * c;
        let tv = tt - ts;
        let x = c * t_clk;
        let x2 = x * x;
        let x3 = x2 * x;
        let mu_s = rs / (tt * t_clk);

        let ps = ts / tt;
        let pv = 1.0 - ps;
        let pcs = tcs / tt;
        let ws = x;

        let offered_load = Self::offered_load_from_lambd(p.n, t_clk, lambd);
        let rs_gt_f = (s * n * lambd * t_clk) / (c * (1.0 - n * lambd * t_clk));
        let rs_min = 1.0 + rs_gt_f.floor();
        let rho = lambd / mu_s;
        let ttot = n * mu_s;
        let ttot0 = 1.0 / t_clk;

        // NaN once unstable; every wait and occupancy term inherits it.
        let p0 = if rho < 1.0 { 1.0 - rho } else { f64::NAN };

        let v = 0.5 * p0 * (1.0 - ps) * tv * t_clk
            + 0.5 * p0 * ps * c * t_clk
            + (1.0 - p0) * (tv * t_clk) / rs;

        let wh = v / (1.0 - rho);
        let wq = wh + lambd * x2 / (2.0 * (1.0 - rho));
        let wtot = wq + ws;

        let nq = lambd * wq;
        let ns = lambd * ws;
        let ntot = lambd * wtot;

        ModelOutputs {
            offered_load,
            tcs,
            tt,
            ts,
            tv,
            x,
            x2,
            x3,
            v,
            mu_s,
            rs_gt_f,
            rs_min,
            rho,
            ttot,
            ttot0,
            p0,
            ps,
            pv,
            pcs,
            wq,
            wh,
            ws,
            wtot,
            nq,
            ns,
            ntot,
        }
    }

    pub fn parameters(&self) -> &ModelParameters {
        &self.parameters
    }

    pub fn calculations(&self) -> &ModelOutputs {
        &self.calculations
    }

    pub fn is_stable(&self) -> bool {
        self.calculations.rho < 1.0
    }

    pub fn offered_load_from_lambd(n: u64, t_clk: f64, lambd: f64) -> f64 {
        lambd * n as f64 * t_clk
    }

    pub fn lambd_from_offered_load(n: u64, t_clk: f64, offered_load: f64) -> f64 {
        offered_load / (n as f64 * t_clk)
    }

    pub fn lambd_from_rho(n: u64, c: u64, s: u64, rs: u64, t_clk: f64, rho: f64) -> f64 {
        let (n, c, s, rs) = (n as f64, c as f64, s as f64, rs as f64);
        let mu_s = rs / ((rs * n + s * n / c) * t_clk);
        rho * mu_s
    }

    pub fn offered_load_from_rho(n: u64, c: u64, s: u64, rs: u64, t_clk: f64, rho: f64) -> f64 {
        let lambd = Self::lambd_from_rho(n, c, s, rs, t_clk, rho);
        Self::offered_load_from_lambd(n, t_clk, lambd)
    }
}
