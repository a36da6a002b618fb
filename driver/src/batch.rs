//! Replicated simulation runs over batch parameter points.
//!
//! One point is a parameter tuple; each of its replications is a wholly
//! self-contained simulation seeded from its own substream table row. All
//! streams of a replication share that row's generator (state
//! de-duplication: they draw one sequence interleaved), so replications stay
//! independent while a replication stays cheap. Replications that fail the
//! empirical stability test are reported once and dropped from aggregation.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use vqsim::system::{QueueingSimulation, ServiceDiscipline, SystemConfig};
use vqsim_core::dist::DistributionKind;
use vqsim_core::error::TypedResult;
use vqsim_core::problem;
use vqsim_core::rng::{share, SubstreamIndices, SubstreamTable};
use vqsim_core::stats::{mean_histogram, norm_histogram, QueueStats, SampleArray};

use crate::model::{Clock, Load, ModelOutputs, QueueingModelMg1};

/// Simulation clocks excluded from statistics at the start of each run
pub const WARMUP_CLOCKS: f64 = 100.0;

/// One batch parameter point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParameters {
    pub num_replications: usize,
    pub n: usize,
    pub c: usize,
    pub s: u64,
    pub rs: u64,
    pub f_clk: f64,
    /// Distribution type code, e.g. `"M"` or `"Hyper(WL=[1,10], WP=[1,3])"`
    pub a_dist: String,
    pub lambd: f64,
    pub sim_clocks: u64,
}

impl SimulationParameters {
    pub fn t_clk(&self) -> f64 {
        1.0 / self.f_clk
    }

    pub fn sim_time(&self) -> f64 {
        self.sim_clocks as f64 * self.t_clk()
    }

    pub fn warmup(&self) -> f64 {
        WARMUP_CLOCKS * self.t_clk()
    }
}

/// Post-run result of one stream in one replication.
#[derive(Debug, Clone, Serialize)]
pub struct StreamResult {
    pub replication: usize,
    pub stream: usize,
    pub total_arrivals: u64,
    pub total_departures: u64,
    pub total_time: f64,
    pub mean_jobs_waiting: f64,
    pub std_jobs_waiting: f64,
    pub mean_jobs_receiving_service: f64,
    pub std_jobs_receiving_service: f64,
    pub mean_jobs_in_system: f64,
    pub std_jobs_in_system: f64,
    pub cov_jobs_waiting_and_receiving: f64,
    pub mean_jobs_in_busy_period: f64,
    pub std_jobs_in_busy_period: f64,
    pub mean_busy_period: f64,
    pub std_busy_period: f64,
    pub mean_idle_period: f64,
    pub std_idle_period: f64,
    pub mean_job_wait_time: f64,
    pub std_job_wait_time: f64,
    pub mean_job_service_time: f64,
    pub std_job_service_time: f64,
    pub mean_job_response_time: f64,
    pub std_job_response_time: f64,
    pub cov_wait_and_service: f64,
    pub histogram_jobs_waiting: Vec<f64>,
}

impl StreamResult {
    fn from_stats(replication: usize, stream: usize, stats: &QueueStats) -> Self {
        Self {
            replication,
            stream,
            total_arrivals: stats.total_arrivals,
            total_departures: stats.total_departures,
            total_time: stats.total_time,
            mean_jobs_waiting: stats.jobs_waiting.mean(),
            std_jobs_waiting: stats.jobs_waiting.std(),
            mean_jobs_receiving_service: stats.jobs_receiving_service.mean(),
            std_jobs_receiving_service: stats.jobs_receiving_service.std(),
            mean_jobs_in_system: stats.jobs_in_system.mean(),
            std_jobs_in_system: stats.jobs_in_system.std(),
            cov_jobs_waiting_and_receiving: stats.cov_jobs_waiting_and_receiving(),
            mean_jobs_in_busy_period: stats.busy_period.num_jobs.mean(),
            std_jobs_in_busy_period: stats.busy_period.num_jobs.std(),
            mean_busy_period: stats.busy_period.duration.mean(),
            std_busy_period: stats.busy_period.duration.std(),
            mean_idle_period: stats.idle_period.duration.mean(),
            std_idle_period: stats.idle_period.duration.std(),
            mean_job_wait_time: stats.job_wait_time.mean(),
            std_job_wait_time: stats.job_wait_time.std(),
            mean_job_service_time: stats.job_service_time.mean(),
            std_job_service_time: stats.job_service_time.std(),
            mean_job_response_time: stats.job_response_time.mean(),
            std_job_response_time: stats.job_response_time.std(),
            cov_wait_and_service: stats.cov_wait_and_service(),
            histogram_jobs_waiting: stats.histogram_jobs_waiting(),
        }
    }
}

/// One surviving replication of a point.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationResult {
    pub replication: usize,
    /// Substream table row the replication was seeded from
    pub substream_index: usize,
    pub streams: Vec<StreamResult>,
}

/// Mean across records, its standard deviation of the mean, and the mean of
/// the per-record standard deviations.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Aggregate {
    pub mean_of_means: f64,
    pub sdom_of_means: f64,
    pub mean_of_stds: f64,
}

fn aggregate(
    records: &[StreamResult],
    mean_of: impl Fn(&StreamResult) -> f64,
    std_of: impl Fn(&StreamResult) -> f64,
) -> Aggregate {
    let means: SampleArray = records.iter().map(mean_of).collect();
    let stds: SampleArray = records.iter().map(std_of).collect();
    Aggregate {
        mean_of_means: means.mean(),
        sdom_of_means: means.sdom(),
        mean_of_stds: stds.mean(),
    }
}

/// Mean and standard deviation of the mean of one scalar per record.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScalarAggregate {
    pub mean: f64,
    pub sdom: f64,
}

fn scalar_aggregate(
    records: &[StreamResult],
    value_of: impl Fn(&StreamResult) -> f64,
) -> ScalarAggregate {
    let values: SampleArray = records.iter().map(value_of).collect();
    ScalarAggregate {
        mean: values.mean(),
        sdom: values.sdom(),
    }
}

/// Aggregated summary of one parameter point.
#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    pub parameters: SimulationParameters,
    /// Replications that survived the stability test
    pub num_replications_used: usize,
    /// Records aggregated over (`replications * streams`)
    pub num_records: usize,
    pub jobs_waiting: Aggregate,
    pub jobs_receiving_service: Aggregate,
    pub jobs_in_system: Aggregate,
    pub cov_jobs_waiting_and_receiving: ScalarAggregate,
    pub job_wait_time: Aggregate,
    pub job_service_time: Aggregate,
    pub job_response_time: Aggregate,
    /// Normalized mean histogram of jobs waiting
    pub mean_histogram_jobs_waiting: Vec<f64>,
    pub model: ModelOutputs,
}

/// Everything one point produced: the surviving replications and their
/// summary.
#[derive(Debug, Clone, Serialize)]
pub struct PointResult {
    pub replications: Vec<ReplicationResult>,
    pub summary: PointSummary,
}

/// The empirical post-run stability test.
fn is_unstable(stats: &QueueStats) -> bool {
    stats.total_arrivals as f64 >= 1.1 * stats.total_departures as f64
}

/// Runs all replications of one parameter point and aggregates them.
///
/// `indices` is the sole source of substream assignments; one row is
/// consumed per replication. Fails with the unstable-system kind when no
/// replication survives the stability test.
pub fn run_point(
    parameters: &SimulationParameters,
    table: &SubstreamTable,
    indices: &mut SubstreamIndices,
) -> TypedResult<PointResult> {
    let model = QueueingModelMg1::new(
        parameters.n as u64,
        parameters.c as u64,
        parameters.s,
        parameters.rs,
        Clock::Frequency(parameters.f_clk),
        Load::Lambda(parameters.lambd),
    )?;
    let kind: DistributionKind = parameters.a_dist.parse()?;

    info!(
        "point: N={} C={} S={} Rs={} A={} lambd={} over {} clocks, {} replications (model rho {:.4})",
        parameters.n,
        parameters.c,
        parameters.s,
        parameters.rs,
        parameters.a_dist,
        parameters.lambd,
        parameters.sim_clocks,
        parameters.num_replications,
        model.calculations().rho,
    );

    let mut replications = Vec::new();
    for replication in 0..parameters.num_replications {
        let Some(substream_index) = indices.next() else {
            problem!(SubstreamTable, "substream indices exhausted");
        };
        let rng = share(table.rng(substream_index)?);

        // All streams of the replication share the substream's generator.
        let arrivals = (0..parameters.n)
            .map(|_| Ok((kind.build(parameters.lambd)?, Rc::clone(&rng))))
            .collect::<TypedResult<Vec<_>>>()?;

        let config = SystemConfig {
            n: parameters.n,
            c: parameters.c,
            s: parameters.s,
            rs: parameters.rs,
            f_clk: parameters.f_clk,
            discipline: ServiceDiscipline::default(),
            warmup: parameters.warmup(),
        };
        let mut sim = QueueingSimulation::new(config, arrivals, Rc::clone(&rng))?;
        sim.run(parameters.sim_time());

        let system = sim.system();
        if let Some((stream_index, stats)) = system
            .streams()
            .iter()
            .enumerate()
            .map(|(i, stream)| (i, stream.stats()))
            .find(|&(_, stats)| is_unstable(stats))
        {
            warn!(
                "replication {replication} unstable at stream {stream_index} \
                 ({} arrivals vs {} departures), dropping it: N={} C={} S={} Rs={} A={} lambd={}",
                stats.total_arrivals,
                stats.total_departures,
                parameters.n,
                parameters.c,
                parameters.s,
                parameters.rs,
                parameters.a_dist,
                parameters.lambd,
            );
            continue;
        }

        let streams = system
            .streams()
            .iter()
            .enumerate()
            .map(|(i, stream)| StreamResult::from_stats(replication, i, stream.stats()))
            .collect();
        replications.push(ReplicationResult {
            replication,
            substream_index,
            streams,
        });
    }

    if replications.is_empty() {
        problem!(
            Unstable,
            "no replication of N={} C={} S={} Rs={} A={} lambd={} survived the stability test",
            parameters.n,
            parameters.c,
            parameters.s,
            parameters.rs,
            parameters.a_dist,
            parameters.lambd,
        );
    }

    let summary = summarize(parameters, &replications, *model.calculations());
    Ok(PointResult {
        replications,
        summary,
    })
}

fn summarize(
    parameters: &SimulationParameters,
    replications: &[ReplicationResult],
    model: ModelOutputs,
) -> PointSummary {
    let records: Vec<StreamResult> = replications
        .iter()
        .flat_map(|replication| replication.streams.iter().cloned())
        .collect();

    let histograms: Vec<&[f64]> = records
        .iter()
        .map(|record| record.histogram_jobs_waiting.as_slice())
        .collect();
    let mean_histogram_jobs_waiting = norm_histogram(&mean_histogram(histograms));

    PointSummary {
        parameters: parameters.clone(),
        num_replications_used: replications.len(),
        num_records: records.len(),
        jobs_waiting: aggregate(
            &records,
            |r| r.mean_jobs_waiting,
            |r| r.std_jobs_waiting,
        ),
        jobs_receiving_service: aggregate(
            &records,
            |r| r.mean_jobs_receiving_service,
            |r| r.std_jobs_receiving_service,
        ),
        jobs_in_system: aggregate(
            &records,
            |r| r.mean_jobs_in_system,
            |r| r.std_jobs_in_system,
        ),
        cov_jobs_waiting_and_receiving: scalar_aggregate(&records, |r| {
            r.cov_jobs_waiting_and_receiving
        }),
        job_wait_time: aggregate(
            &records,
            |r| r.mean_job_wait_time,
            |r| r.std_job_wait_time,
        ),
        job_service_time: aggregate(
            &records,
            |r| r.mean_job_service_time,
            |r| r.std_job_service_time,
        ),
        job_response_time: aggregate(
            &records,
            |r| r.mean_job_response_time,
            |r| r.std_job_response_time,
        ),
        mean_histogram_jobs_waiting,
        model,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use vqsim_core::error::SystemError;
    use vqsim_core::rng::Mt19937;
    use rand::RngCore;

    use super::*;

    fn write_table(rows: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut filler = Mt19937::new(424242);
        for _ in 0..rows {
            for _ in 0..vqsim_core::rng::STATE_WORDS {
                file.write_all(&filler.next_u32().to_le_bytes()).unwrap();
            }
        }
        file.flush().unwrap();
        file
    }

    fn stable_parameters() -> SimulationParameters {
        SimulationParameters {
            num_replications: 2,
            n: 4,
            c: 2,
            s: 0,
            rs: 1,
            f_clk: 1.0,
            a_dist: "D".into(),
            lambd: 0.1,
            sim_clocks: 2_000,
        }
    }

    #[test]
    fn stable_point_aggregates_all_replications() {
        let file = write_table(4);
        let table = SubstreamTable::open(file.path()).unwrap();
        let mut indices = SubstreamIndices::sequential(table.rows(), 0);

        let parameters = stable_parameters();
        let result = run_point(&parameters, &table, &mut indices).unwrap();

        assert_eq!(result.replications.len(), 2);
        assert_eq!(result.summary.num_replications_used, 2);
        assert_eq!(result.summary.num_records, 8);
        for replication in &result.replications {
            assert_eq!(replication.streams.len(), 4);
        }
        // Replications consumed distinct substreams.
        assert_ne!(
            result.replications[0].substream_index,
            result.replications[1].substream_index
        );
        // Deterministic service: the pipeline residence is exactly C clocks.
        assert_eq!(result.summary.job_service_time.mean_of_means, 2.0);
        assert_eq!(result.summary.job_service_time.mean_of_stds, 0.0);
        // The normalized mean histogram is a probability vector.
        let total: f64 = result.summary.mean_histogram_jobs_waiting.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(result.summary.model.rho < 1.0);
    }

    #[test]
    fn overloaded_point_is_reported_unstable() {
        let file = write_table(4);
        let table = SubstreamTable::open(file.path()).unwrap();
        let mut indices = SubstreamIndices::sequential(table.rows(), 0);

        // Each stream is visited once per 4 clocks; deterministic arrivals
        // every 1/0.6 clocks swamp it.
        let parameters = SimulationParameters {
            lambd: 0.6,
            ..stable_parameters()
        };
        let err = run_point(&parameters, &table, &mut indices).unwrap_err();
        assert_eq!(err.err(), SystemError::Unstable);
    }

    #[test]
    fn exhausted_indices_are_an_error() {
        let file = write_table(1);
        let table = SubstreamTable::open(file.path()).unwrap();
        let mut indices = SubstreamIndices::sequential(table.rows(), 0);

        let err = run_point(&stable_parameters(), &table, &mut indices).unwrap_err();
        assert_eq!(err.err(), SystemError::SubstreamTable);
    }

    #[test]
    fn malformed_distribution_code_fails_up_front() {
        let file = write_table(2);
        let table = SubstreamTable::open(file.path()).unwrap();
        let mut indices = SubstreamIndices::sequential(table.rows(), 0);

        let parameters = SimulationParameters {
            a_dist: "E0".into(),
            ..stable_parameters()
        };
        let err = run_point(&parameters, &table, &mut indices).unwrap_err();
        assert_eq!(err.err(), SystemError::DistributionSpec);
    }
}
