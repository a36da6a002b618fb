#[macro_use]
extern crate log;

use anyhow::anyhow;
use itertools::iproduct;

use vqsim_core::error::{ResultExt, SystemError, TypedResult};
use vqsim_core::rng::{SubstreamIndices, SubstreamTable};
use vqsim_driver::batch::{run_point, SimulationParameters};
use vqsim_driver::model::QueueingModelMg1;

/// Environment variable naming the substream state table file
const SUBSTREAMS_ENV: &str = "VQSIM_SUBSTREAMS";

/// Helper to print top-level errors through [log::error]
#[quit::main]
fn main() {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    std::env::set_var("RUST_LOG", level.clone());

    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .format_timestamp_secs()
        .init();

    match run_demo_batch() {
        Ok(_) => {}
        Err(e) => {
            error!("{e}");
            quit::with_code(1);
        }
    }
}

/// Runs a small built-in parameter sweep against the substream table named
/// by `VQSIM_SUBSTREAMS` and logs each point's summary.
fn run_demo_batch() -> TypedResult<()> {
    let table_path = std::env::var(SUBSTREAMS_ENV)
        .map_err(|_| anyhow!("set {SUBSTREAMS_ENV} to the substream state table file"))
        .typ(SystemError::SubstreamTable)?;
    let table = SubstreamTable::open(&table_path)?;
    let mut indices = SubstreamIndices::sequential(table.rows(), 0);

    let sweep: Vec<SimulationParameters> = iproduct!([(4u64, 10u64, 2u64), (2, 8, 2)], [0.3, 0.5])
        .map(|((c, s, rs), offered_load)| {
            let (n, f_clk) = (8u64, 1.0);
            SimulationParameters {
                num_replications: 2,
                n: n as usize,
                c: c as usize,
                s,
                rs,
                f_clk,
                a_dist: "M".into(),
                lambd: QueueingModelMg1::lambd_from_offered_load(n, 1.0 / f_clk, offered_load),
                sim_clocks: 10_000,
            }
        })
        .collect();

    for parameters in &sweep {
        match run_point(parameters, &table, &mut indices) {
            Ok(result) => {
                let summary = &result.summary;
                info!(
                    "N={} C={} S={} Rs={} A={} lambd={:.5}: jobs in system {:.4} +- {:.4} \
                     (model {:.4}), wait {:.3} +- {:.3} (model {:.3}), p0 model {:.4}",
                    parameters.n,
                    parameters.c,
                    parameters.s,
                    parameters.rs,
                    parameters.a_dist,
                    parameters.lambd,
                    summary.jobs_in_system.mean_of_means,
                    summary.jobs_in_system.sdom_of_means,
                    summary.model.ntot,
                    summary.job_wait_time.mean_of_means,
                    summary.job_wait_time.sdom_of_means,
                    summary.model.wq,
                    summary.model.p0,
                );
            }
            Err(e) if e.err() == SystemError::Unstable => {
                warn!("skipping unstable point: {e}");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
