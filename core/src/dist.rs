//! Parametric inter-arrival distributions.
//!
//! Every distribution is normalized so that its mean is `1/lambd`, where
//! `lambd` is the arrival rate handed to the constructor. Samplers take the
//! generator as an explicit argument; no distribution owns RNG state.

use std::str::FromStr;

use anyhow::anyhow;
use rand::Rng;
use rand_distr::{Distribution as _, Exp};
use serde::{Deserialize, Serialize};

use crate::error::{ResultExt, SystemError, TypedError, TypedResult};
use crate::problem;

fn factorial(n: u32) -> f64 {
    (1..=n).map(|i| i as f64).product()
}

fn parse_floats(s: &str) -> Option<Vec<f64>> {
    s.split(',').map(|w| f64::from_str(w.trim()).ok()).collect()
}

/// Chooses an index from a set of relative weights.
///
/// The first `k-1` weights are normalized by the total sum; a uniform draw is
/// walked through them and the last index is the fall-through case. This is
/// the branch chooser for [Hyperexponential].
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedChoice {
    norm_weights: Vec<f64>,
}

impl WeightedChoice {
    pub fn new(weights: &[f64]) -> TypedResult<Self> {
        if weights.is_empty() {
            problem!(Parameter, "weighted choice requires at least one weight");
        }
        let divisor: f64 = weights.iter().sum();
        let norm_weights = weights[..weights.len() - 1]
            .iter()
            .map(|wi| wi / divisor)
            .collect();
        Ok(Self { norm_weights })
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let mut sample: f64 = rng.gen();

        // Test the sample against the normalized weights; the last choice is
        // the default case.
        for (i, wi_prime) in self.norm_weights.iter().enumerate() {
            if sample < *wi_prime {
                return i;
            }
            sample -= wi_prime;
        }
        self.norm_weights.len()
    }
}

/// Constant inter-arrival times of `1/lambd`
#[derive(Debug, Clone, PartialEq)]
pub struct Deterministic {
    lambd: f64,
}

impl Deterministic {
    pub fn new(lambd: f64) -> TypedResult<Self> {
        if lambd <= 0.0 {
            problem!(Parameter, "rate must be positive, got {lambd}");
        }
        Ok(Self { lambd })
    }

    pub fn mean(&self) -> f64 {
        1.0 / self.lambd
    }

    pub fn variance(&self) -> f64 {
        0.0
    }

    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        Ok(1.0 / self.lambd.powi(n as i32))
    }

    pub fn sample<R: Rng + ?Sized>(&self, _rng: &mut R) -> f64 {
        1.0 / self.lambd
    }
}

/// Memoryless inter-arrival times with rate `lambd`
#[derive(Debug, Clone)]
pub struct Exponential {
    lambd: f64,
    expo: Exp<f64>,
}

impl Exponential {
    pub fn new(lambd: f64) -> TypedResult<Self> {
        let expo = Exp::new(lambd)
            .map_err(|e| anyhow!("rate must be positive, got {lambd}: {e}"))
            .typ(SystemError::Parameter)?;
        Ok(Self { lambd, expo })
    }

    pub fn mean(&self) -> f64 {
        1.0 / self.lambd
    }

    pub fn variance(&self) -> f64 {
        1.0 / self.lambd.powi(2)
    }

    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        Ok(factorial(n) / self.lambd.powi(n as i32))
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.expo.sample(rng)
    }
}

/// Sum of `k` identical exponential stages, scaled to mean `1/lambd`
#[derive(Debug, Clone)]
pub struct Erlang {
    lambd: f64,
    k: u32,
    stage: Exp<f64>,
}

impl Erlang {
    pub fn new(lambd: f64, k: u32) -> TypedResult<Self> {
        if k < 1 {
            problem!(Parameter, "Erlang requires k >= 1, got {k}");
        }
        let stage = Exp::new(lambd * k as f64)
            .map_err(|e| anyhow!("rate must be positive, got {lambd}: {e}"))
            .typ(SystemError::Parameter)?;
        Ok(Self { lambd, k, stage })
    }

    pub fn mean(&self) -> f64 {
        1.0 / self.lambd
    }

    pub fn variance(&self) -> f64 {
        1.0 / (self.k as f64 * self.lambd.powi(2))
    }

    /// Closed forms exist for the first three moments only.
    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        let k = self.k as f64;
        let lambd = self.lambd;
        match n {
            1 => Ok(1.0 / lambd),
            2 => Ok((1.0 + k) / (k * lambd.powi(2))),
            3 => Ok(((1.0 + k) * (2.0 + k)) / (k.powi(2) * lambd.powi(3))),
            _ => Err(TypedError::new(
                SystemError::Moment,
                anyhow!("Erlang moment {n} has no closed form"),
            )),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        (0..self.k).map(|_| self.stage.sample(rng)).sum()
    }
}

/// Sum of independent exponential stages with distinct rates.
///
/// The stage rates are `lambd_i = w_i * (sum 1/w_j) * lambd`, which pins the
/// overall mean to exactly `1/lambd` for any weight vector.
#[derive(Debug, Clone)]
pub struct Hypoexponential {
    lambd: f64,
    lambdas: Vec<f64>,
    stages: Vec<Exp<f64>>,
}

impl Hypoexponential {
    pub fn new(lambd: f64, weights: &[f64]) -> TypedResult<Self> {
        if lambd <= 0.0 {
            problem!(Parameter, "rate must be positive, got {lambd}");
        }
        if weights.is_empty() {
            problem!(Parameter, "Hypoexponential requires at least one weight");
        }
        let multiplier: f64 = weights.iter().map(|w| 1.0 / w).sum();
        let lambdas: Vec<f64> = weights.iter().map(|wi| wi * multiplier * lambd).collect();
        let stages = lambdas
            .iter()
            .map(|&li| {
                Exp::new(li)
                    .map_err(|e| anyhow!("stage rate {li} is not positive: {e}"))
                    .typ(SystemError::Parameter)
            })
            .collect::<TypedResult<_>>()?;
        Ok(Self {
            lambd,
            lambdas,
            stages,
        })
    }

    /// Per-stage rates after normalization
    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    pub fn mean(&self) -> f64 {
        1.0 / self.lambd
    }

    pub fn variance(&self) -> f64 {
        self.lambdas.iter().map(|li| 1.0 / li.powi(2)).sum()
    }

    /// Closed forms exist for the first three moments only.
    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        match n {
            1 => Ok(self.mean()),
            2 => Ok(self.variance() + self.mean().powi(2)),
            3 => {
                let l = &self.lambdas;
                let k = l.len();
                let mut result: f64 = l.iter().map(|li| 6.0 / li.powi(3)).sum();
                for i in 0..k {
                    for j in 0..k {
                        if i != j {
                            result += 3.0 * 2.0 / (l[i].powi(2) * l[j]);
                        }
                    }
                }
                for i in 0..k {
                    for j in 0..k {
                        for h in 0..k {
                            if i != j && j != h && i != h {
                                result += 1.0 / (l[i] * l[j] * l[h]);
                            }
                        }
                    }
                }
                Ok(result)
            }
            _ => Err(TypedError::new(
                SystemError::Moment,
                anyhow!("Hypoexponential moment {n} has no closed form"),
            )),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.stages.iter().map(|stage| stage.sample(rng)).sum()
    }
}

/// Probabilistic mixture of parallel exponential branches.
///
/// Branch `i` is picked with probability `wp_i / sum(wp)`; the branch rates
/// are `lambd_i = wl_i * (sum p_j/wl_j) * lambd` so the mixture mean is
/// exactly `1/lambd`.
#[derive(Debug, Clone)]
pub struct Hyperexponential {
    lambd: f64,
    probabilities: Vec<f64>,
    lambdas: Vec<f64>,
    branches: Vec<Exp<f64>>,
    choice: WeightedChoice,
}

impl Hyperexponential {
    pub fn new(lambd: f64, lambd_weights: &[f64], prob_weights: &[f64]) -> TypedResult<Self> {
        if lambd <= 0.0 {
            problem!(Parameter, "rate must be positive, got {lambd}");
        }
        if lambd_weights.len() != prob_weights.len() {
            problem!(
                Parameter,
                "WL and WP must have the same length, got {} and {}",
                lambd_weights.len(),
                prob_weights.len()
            );
        }
        let choice = WeightedChoice::new(prob_weights)?;
        let divisor: f64 = prob_weights.iter().sum();
        let probabilities: Vec<f64> = prob_weights.iter().map(|pi| pi / divisor).collect();
        let multiplier: f64 = probabilities
            .iter()
            .zip(lambd_weights)
            .map(|(pi, wi)| pi / wi)
            .sum();
        let lambdas: Vec<f64> = lambd_weights
            .iter()
            .map(|wi| wi * multiplier * lambd)
            .collect();
        let branches = lambdas
            .iter()
            .map(|&li| {
                Exp::new(li)
                    .map_err(|e| anyhow!("branch rate {li} is not positive: {e}"))
                    .typ(SystemError::Parameter)
            })
            .collect::<TypedResult<_>>()?;
        Ok(Self {
            lambd,
            probabilities,
            lambdas,
            branches,
            choice,
        })
    }

    /// Branch probabilities after normalization
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    /// Per-branch rates after normalization
    pub fn lambdas(&self) -> &[f64] {
        &self.lambdas
    }

    pub fn mean(&self) -> f64 {
        1.0 / self.lambd
    }

    pub fn variance(&self) -> f64 {
        self.moment_closed(2) - self.mean().powi(2)
    }

    fn moment_closed(&self, n: u32) -> f64 {
        self.probabilities
            .iter()
            .zip(&self.lambdas)
            .map(|(pi, li)| factorial(n) / li.powi(n as i32) * pi)
            .sum()
    }

    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        Ok(self.moment_closed(n))
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let choice = self.choice.choose(rng);
        self.branches[choice].sample(rng)
    }
}

/// An inter-arrival distribution of one of the five supported families
#[derive(Debug, Clone)]
pub enum Distribution {
    Deterministic(Deterministic),
    Exponential(Exponential),
    Erlang(Erlang),
    Hypoexponential(Hypoexponential),
    Hyperexponential(Hyperexponential),
}

impl Distribution {
    pub fn mean(&self) -> f64 {
        match self {
            Distribution::Deterministic(d) => d.mean(),
            Distribution::Exponential(d) => d.mean(),
            Distribution::Erlang(d) => d.mean(),
            Distribution::Hypoexponential(d) => d.mean(),
            Distribution::Hyperexponential(d) => d.mean(),
        }
    }

    pub fn variance(&self) -> f64 {
        match self {
            Distribution::Deterministic(d) => d.variance(),
            Distribution::Exponential(d) => d.variance(),
            Distribution::Erlang(d) => d.variance(),
            Distribution::Hypoexponential(d) => d.variance(),
            Distribution::Hyperexponential(d) => d.variance(),
        }
    }

    pub fn stdev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Coefficient of variation.
    pub fn coeff_of_variation(&self) -> f64 {
        self.stdev() / self.mean()
    }

    /// The n-th raw moment, where a closed form exists (see the variants).
    pub fn moment(&self, n: u32) -> TypedResult<f64> {
        match self {
            Distribution::Deterministic(d) => d.moment(n),
            Distribution::Exponential(d) => d.moment(n),
            Distribution::Erlang(d) => d.moment(n),
            Distribution::Hypoexponential(d) => d.moment(n),
            Distribution::Hyperexponential(d) => d.moment(n),
        }
    }

    /// Draws one inter-arrival time.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Distribution::Deterministic(d) => d.sample(rng),
            Distribution::Exponential(d) => d.sample(rng),
            Distribution::Erlang(d) => d.sample(rng),
            Distribution::Hypoexponential(d) => d.sample(rng),
            Distribution::Hyperexponential(d) => d.sample(rng),
        }
    }
}

/// A parsed distribution type code, not yet bound to a rate.
///
/// The textual surface is `D`, `M`, `E<k>`, `Hypo(w1,...,wk)` and
/// `Hyper(WL=[...], WP=[...])`. Parsing and instantiation are split so a
/// batch driver can validate the code once and build per-replication
/// instances later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DistributionKind {
    Deterministic,
    Exponential,
    Erlang {
        k: u32,
    },
    Hypoexponential {
        weights: Vec<f64>,
    },
    Hyperexponential {
        lambd_weights: Vec<f64>,
        prob_weights: Vec<f64>,
    },
}

impl DistributionKind {
    /// Binds the kind to an arrival rate.
    pub fn build(&self, lambd: f64) -> TypedResult<Distribution> {
        Ok(match self {
            DistributionKind::Deterministic => {
                Distribution::Deterministic(Deterministic::new(lambd)?)
            }
            DistributionKind::Exponential => Distribution::Exponential(Exponential::new(lambd)?),
            DistributionKind::Erlang { k } => Distribution::Erlang(Erlang::new(lambd, *k)?),
            DistributionKind::Hypoexponential { weights } => {
                Distribution::Hypoexponential(Hypoexponential::new(lambd, weights)?)
            }
            DistributionKind::Hyperexponential {
                lambd_weights,
                prob_weights,
            } => Distribution::Hyperexponential(Hyperexponential::new(
                lambd,
                lambd_weights,
                prob_weights,
            )?),
        })
    }

    fn parse_hyper(args: &str) -> Option<(Vec<f64>, Vec<f64>)> {
        fn bracket_list<'a>(s: &'a str, key: &str) -> Option<(Vec<f64>, &'a str)> {
            let s = s.trim_start().strip_prefix(key)?;
            let s = s.trim_start().strip_prefix('=')?;
            let s = s.trim_start().strip_prefix('[')?;
            let end = s.find(']')?;
            Some((parse_floats(&s[..end])?, &s[end + 1..]))
        }

        let inner = args.trim().strip_prefix('(')?.strip_suffix(')')?;
        let (lambd_weights, rest) = bracket_list(inner, "WL")?;
        let rest = rest.trim_start().strip_prefix(',')?;
        let (prob_weights, rest) = bracket_list(rest, "WP")?;
        rest.trim().is_empty().then_some((lambd_weights, prob_weights))
    }
}

impl FromStr for DistributionKind {
    type Err = TypedError;

    fn from_str(code: &str) -> TypedResult<Self> {
        let malformed = || TypedError::new(
            SystemError::DistributionSpec,
            anyhow!("type code {code:?} is malformed"),
        );

        match code {
            "D" => Ok(DistributionKind::Deterministic),
            "M" => Ok(DistributionKind::Exponential),
            _ if code.starts_with("Hypo") => {
                let inner = code[4..]
                    .trim()
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(malformed)?;
                let weights = parse_floats(inner).ok_or_else(malformed)?;
                Ok(DistributionKind::Hypoexponential { weights })
            }
            _ if code.starts_with("Hyper") => {
                let (lambd_weights, prob_weights) =
                    Self::parse_hyper(&code[5..]).ok_or_else(malformed)?;
                Ok(DistributionKind::Hyperexponential {
                    lambd_weights,
                    prob_weights,
                })
            }
            _ if code.starts_with('E') => {
                let k = code[1..].parse::<u32>().ok().filter(|k| *k >= 1);
                Ok(DistributionKind::Erlang {
                    k: k.ok_or_else(malformed)?,
                })
            }
            _ => Err(malformed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Mt19937;

    const RELTOL: f64 = 1e-6;

    fn assert_float_eq(first: f64, second: f64) {
        if first == 0.0 && second == 0.0 {
            return;
        }
        let rel = (first - second).abs() / first.abs().max(second.abs());
        assert!(rel < RELTOL, "{first} != {second} (rel {rel})");
    }

    fn all_test_distributions() -> Vec<Distribution> {
        let lambd = 0.37;
        vec![
            Distribution::Deterministic(Deterministic::new(lambd).unwrap()),
            Distribution::Exponential(Exponential::new(lambd).unwrap()),
            Distribution::Erlang(Erlang::new(lambd, 4).unwrap()),
            Distribution::Hypoexponential(Hypoexponential::new(lambd, &[1.0, 2.0, 5.0]).unwrap()),
            Distribution::Hyperexponential(
                Hyperexponential::new(lambd, &[1.0, 10.0], &[1.0, 3.26]).unwrap(),
            ),
        ]
    }

    #[test]
    fn first_moment_is_mean() {
        for dist in all_test_distributions() {
            assert_float_eq(dist.moment(1).unwrap(), dist.mean());
        }
    }

    #[test]
    fn variance_matches_moments() {
        for dist in all_test_distributions() {
            let m1 = dist.moment(1).unwrap();
            let m2 = dist.moment(2).unwrap();
            assert_float_eq(dist.variance(), m2 - m1 * m1);
        }
    }

    #[test]
    fn normalized_means_are_exact() {
        let lambd = 0.37;
        let hypo = Hypoexponential::new(lambd, &[3.0, 0.5, 7.0]).unwrap();
        assert_eq!(hypo.mean(), 1.0 / lambd);
        let hyper = Hyperexponential::new(lambd, &[1.0, 10.0], &[1.0, 3.26]).unwrap();
        assert_eq!(hyper.mean(), 1.0 / lambd);
    }

    #[test]
    fn third_moments_against_sampling() {
        // 10^6 variates give a loose but meaningful check of the closed
        // forms for the stage-built distributions.
        let mut rng = Mt19937::new(12345);
        let lambd = 1.0;
        let dists = [
            Distribution::Erlang(Erlang::new(lambd, 3).unwrap()),
            Distribution::Hypoexponential(Hypoexponential::new(lambd, &[1.0, 4.0]).unwrap()),
            Distribution::Hyperexponential(
                Hyperexponential::new(lambd, &[1.0, 10.0], &[1.0, 3.26]).unwrap(),
            ),
        ];
        for dist in dists {
            let n = 1_000_000;
            let mut acc = [0.0f64; 3];
            for _ in 0..n {
                let x = dist.sample(&mut rng);
                acc[0] += x;
                acc[1] += x * x;
                acc[2] += x * x * x;
            }
            for (i, sum) in acc.iter().enumerate() {
                let empirical = sum / n as f64;
                let closed = dist.moment(i as u32 + 1).unwrap();
                let rel = (empirical - closed).abs() / closed;
                assert!(
                    rel < 0.1,
                    "moment {} of {dist:?}: empirical {empirical}, closed {closed}",
                    i + 1
                );
            }
        }
    }

    #[test]
    fn high_moments_are_unimplemented() {
        let erlang = Erlang::new(0.5, 2).unwrap();
        assert_eq!(erlang.moment(4).unwrap_err().err(), SystemError::Moment);
        let hypo = Hypoexponential::new(0.5, &[1.0, 2.0]).unwrap();
        assert_eq!(hypo.moment(4).unwrap_err().err(), SystemError::Moment);
        // Deterministic and exponential have closed forms at any order.
        assert!(Deterministic::new(0.5).unwrap().moment(7).is_ok());
        assert!(Exponential::new(0.5).unwrap().moment(7).is_ok());
    }

    #[test]
    fn weighted_choice_frequencies() {
        let weights = [1.0, 5.0, 9.0, 0.1];
        let total: f64 = weights.iter().sum();
        let choice = WeightedChoice::new(&weights).unwrap();
        let mut rng = Mt19937::new(7);

        let n = 1_000_000usize;
        let mut counts = [0usize; 4];
        for _ in 0..n {
            counts[choice.choose(&mut rng)] += 1;
        }

        for (i, wi) in weights.iter().enumerate() {
            let p = wi / total;
            let sigma = (n as f64 * p * (1.0 - p)).sqrt();
            let delta = (counts[i] as f64 - n as f64 * p).abs();
            assert!(
                delta < 4.0 * sigma,
                "outcome {i}: count {} expected {} (4 sigma = {})",
                counts[i],
                n as f64 * p,
                4.0 * sigma
            );
        }
    }

    #[test]
    fn parse_simple_codes() {
        assert_eq!(
            "D".parse::<DistributionKind>().unwrap(),
            DistributionKind::Deterministic
        );
        assert_eq!(
            "M".parse::<DistributionKind>().unwrap(),
            DistributionKind::Exponential
        );
        assert_eq!(
            "E4".parse::<DistributionKind>().unwrap(),
            DistributionKind::Erlang { k: 4 }
        );
        assert_eq!(
            "Hypo(1, 2.5,3)".parse::<DistributionKind>().unwrap(),
            DistributionKind::Hypoexponential {
                weights: vec![1.0, 2.5, 3.0]
            }
        );
    }

    #[test]
    fn parse_hyper_round_trip() {
        let kind = "Hyper(WL=[1, 10], WP=[1, 3.26])"
            .parse::<DistributionKind>()
            .unwrap();
        assert_eq!(
            kind,
            DistributionKind::Hyperexponential {
                lambd_weights: vec![1.0, 10.0],
                prob_weights: vec![1.0, 3.26],
            }
        );
        let lambd = 2.5;
        let dist = kind.build(lambd).unwrap();
        assert_eq!(dist.mean(), 1.0 / lambd);
    }

    #[test]
    fn parse_tolerates_whitespace() {
        let kind = "Hyper( WL = [ 1 , 10 ] , WP = [ 1 , 3.26 ] )"
            .parse::<DistributionKind>()
            .unwrap();
        assert!(matches!(kind, DistributionKind::Hyperexponential { .. }));
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        for code in [
            "",
            "X",
            "E",
            "E0",
            "E-1",
            "Ehello",
            "Hypo",
            "Hypo()",
            "Hypo(1,x)",
            "Hyper(WL=[1,2])",
            "Hyper(WP=[1,2], WL=[1,2])",
            "Hyper(WL=[1,2], WP=[1,2]) extra",
        ] {
            let err = code.parse::<DistributionKind>().unwrap_err();
            assert_eq!(err.err(), SystemError::DistributionSpec, "code {code:?}");
        }
    }

    #[test]
    fn mismatched_hyper_weights_fail_at_build() {
        let kind = "Hyper(WL=[1,2,3], WP=[1,2])"
            .parse::<DistributionKind>()
            .unwrap();
        assert_eq!(
            kind.build(1.0).unwrap_err().err(),
            SystemError::Parameter
        );
    }
}
