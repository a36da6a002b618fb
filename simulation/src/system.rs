//! The virtualized time-sliced queueing system.
//!
//! One physical server rotates over `n/c` groups of `c` streams. Inside a
//! group it runs `rs` rounds, serving one slot per clock, then pays `s`
//! clocks of context switch before moving on. Arrivals queue per stream;
//! a dispatched job occupies its slot's pipeline for `c` clocks.

use std::collections::VecDeque;
use std::str::FromStr;

use anyhow::anyhow;
use rand::Rng;
use serde::{Deserialize, Serialize};

use vqsim_core::dist::Distribution;
use vqsim_core::error::{SystemError, TypedError, TypedResult};
use vqsim_core::problem;
use vqsim_core::rng::SharedRng;
use vqsim_core::stats::QueueStats;

use crate::kernel::{Context, Process, Simulation};

/// Order in which a stream's queue is drained.
///
/// Queues are pushed at the front, so FCFS pops the back (oldest job), LCFS
/// pops the front (newest), and SIRO removes a uniformly random position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceDiscipline {
    #[default]
    Fcfs,
    Lcfs,
    Siro,
}

impl FromStr for ServiceDiscipline {
    type Err = TypedError;

    fn from_str(s: &str) -> TypedResult<Self> {
        match s {
            "FCFS" => Ok(ServiceDiscipline::Fcfs),
            "LCFS" => Ok(ServiceDiscipline::Lcfs),
            "SIRO" => Ok(ServiceDiscipline::Siro),
            _ => Err(TypedError::new(
                SystemError::Parameter,
                anyhow!("unknown service discipline {s:?}"),
            )),
        }
    }
}

/// Static parameters of one queueing system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Number of streams
    pub n: usize,
    /// Pipeline slots per group
    pub c: usize,
    /// Context switch cost in clocks
    pub s: u64,
    /// Rounds spent inside a group per visit
    pub rs: u64,
    /// Clock frequency
    pub f_clk: f64,
    pub discipline: ServiceDiscipline,
    /// Simulation time before which nothing is recorded into stats
    pub warmup: f64,
}

impl SystemConfig {
    fn validate(&self) -> TypedResult<()> {
        if self.c < 1 || self.n < self.c || self.n % self.c != 0 {
            problem!(
                Parameter,
                "n must be >= c and a multiple of c, n is {} and c is {}",
                self.n,
                self.c
            );
        }
        if self.rs < 1 {
            problem!(Parameter, "rs must be at least one round, got {}", self.rs);
        }
        if !(self.f_clk > 0.0) {
            problem!(Parameter, "f_clk must be positive, got {}", self.f_clk);
        }
        if !(self.warmup >= 0.0) {
            problem!(Parameter, "warmup must be non-negative, got {}", self.warmup);
        }
        Ok(())
    }
}

/// One arrival stream: its inter-arrival sampler, queue and statistics.
#[derive(Debug)]
pub struct Stream {
    dist: Distribution,
    rng: SharedRng,
    queue: VecDeque<(u64, f64)>,
    total_arrivals: u64,
    total_departures: u64,
    in_service: u32,
    stats: QueueStats,
    busy_period_start: f64,
    busy_period_num_jobs: u64,
    idle_period_start: f64,
}

impl Stream {
    fn new(dist: Distribution, rng: SharedRng) -> Self {
        Self {
            dist,
            rng,
            queue: VecDeque::new(),
            total_arrivals: 0,
            total_departures: 0,
            in_service: 0,
            stats: QueueStats::new(),
            busy_period_start: 0.0,
            busy_period_num_jobs: 0,
            idle_period_start: 0.0,
        }
    }

    /// Raw arrival count, warmup included
    pub fn total_arrivals(&self) -> u64 {
        self.total_arrivals
    }

    /// Raw departure count, warmup included
    pub fn total_departures(&self) -> u64 {
        self.total_departures
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn jobs_waiting(&self) -> usize {
        self.queue.len()
    }

    fn jobs_in_system(&self) -> usize {
        self.queue.len() + self.in_service as usize
    }
}

/// The queueing system: all streams plus the server's shared counters.
///
/// Mutated only by the arrival, server and service processes of its own
/// simulation, strictly single-threaded.
#[derive(Debug)]
pub struct QueueingSystem {
    config: SystemConfig,
    t_clk: f64,
    streams: Vec<Stream>,
    dispatch_rng: SharedRng,
    total_in_service: u32,
    peak_in_service: u32,
}

impl QueueingSystem {
    /// Builds the system. `arrivals` hands each stream its distribution and
    /// generator handle; handles may be clones of one shared generator (the
    /// streams then draw one sequence interleaved). `dispatch_rng` feeds the
    /// SIRO discipline.
    pub fn new(
        config: SystemConfig,
        arrivals: Vec<(Distribution, SharedRng)>,
        dispatch_rng: SharedRng,
    ) -> TypedResult<Self> {
        config.validate()?;
        if arrivals.len() != config.n {
            problem!(
                Parameter,
                "expected {} arrival distributions, got {}",
                config.n,
                arrivals.len()
            );
        }
        let t_clk = 1.0 / config.f_clk;
        let streams = arrivals
            .into_iter()
            .map(|(dist, rng)| Stream::new(dist, rng))
            .collect();
        Ok(Self {
            config,
            t_clk,
            streams,
            dispatch_rng,
            total_in_service: 0,
            peak_in_service: 0,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn t_clk(&self) -> f64 {
        self.t_clk
    }

    pub fn num_groups(&self) -> usize {
        self.config.n / self.config.c
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Jobs of all streams occupying pipeline slots right now
    pub fn total_in_service(&self) -> u32 {
        self.total_in_service
    }

    /// High-water mark of [QueueingSystem::total_in_service]; never exceeds `c`
    pub fn peak_in_service(&self) -> u32 {
        self.peak_in_service
    }

    fn sample_interarrival(&self, index: usize) -> f64 {
        let stream = &self.streams[index];
        let mut rng = stream.rng.borrow_mut();
        stream.dist.sample(&mut *rng)
    }

    /// Bookends every trajectory at the start of the observation window.
    fn record_window_open(&mut self, now: f64) {
        if now < self.config.warmup {
            return;
        }
        for stream in &mut self.streams {
            let waiting = stream.jobs_waiting() as f64;
            let in_system = stream.jobs_in_system() as f64;
            stream.stats.jobs_waiting.append(now, waiting);
            stream
                .stats
                .jobs_receiving_service
                .append(now, stream.in_service as f64);
            stream.stats.jobs_in_system.append(now, in_system);
        }
    }

    /// Bookends every trajectory at the end of the window and fixes the
    /// window length.
    fn record_window_close(&mut self, now: f64) {
        if now < self.config.warmup {
            return;
        }
        for stream in &mut self.streams {
            let waiting = stream.jobs_waiting() as f64;
            let in_system = stream.jobs_in_system() as f64;
            stream.stats.jobs_waiting.append(now, waiting);
            stream
                .stats
                .jobs_receiving_service
                .append(now, stream.in_service as f64);
            stream.stats.jobs_in_system.append(now, in_system);
            stream.stats.total_time = now - self.config.warmup;
        }
    }

    fn arrive(&mut self, index: usize, now: f64) {
        let warmup = self.config.warmup;
        let stream = &mut self.streams[index];
        stream.total_arrivals += 1;
        let job_id = stream.total_arrivals;
        if now >= warmup {
            stream.stats.total_arrivals += 1;
        }
        stream.queue.push_front((job_id, now));
        self.event_arrival(index, job_id, now);
    }

    fn pick_next_job(&mut self, index: usize) -> (u64, f64) {
        let queue = &mut self.streams[index].queue;
        match self.config.discipline {
            ServiceDiscipline::Fcfs => queue.pop_back().expect("dispatch checked non-empty"),
            ServiceDiscipline::Lcfs => queue.pop_front().expect("dispatch checked non-empty"),
            ServiceDiscipline::Siro => {
                let position = self.dispatch_rng.borrow_mut().gen_range(0..queue.len());
                queue.remove(position).expect("position is in range")
            }
        }
    }

    /// One slot of the server loop: dispatch the stream serving this clock.
    fn dispatch(&mut self, index: usize, ctx: &mut Context<'_, Self>) {
        let now = ctx.now();
        if self.streams[index].queue.is_empty() {
            return;
        }

        if self.streams[index].in_service == 0 {
            // The stream leaves idle: close the idle period, open a busy one.
            let warmup = self.config.warmup;
            let stream = &mut self.streams[index];
            if now >= warmup {
                let duration = now - stream.idle_period_start;
                stream.stats.idle_period.record(stream.idle_period_start, duration);
            }
            stream.busy_period_start = now;
            stream.busy_period_num_jobs = 0;
        }

        let (job_id, arrival_time) = self.pick_next_job(index);
        let stream = &mut self.streams[index];
        stream.in_service += 1;
        stream.busy_period_num_jobs += 1;
        self.total_in_service += 1;
        self.peak_in_service = self.peak_in_service.max(self.total_in_service);
        self.event_enter_service(index, job_id, now);

        ctx.spawn(Box::new(ServiceProcess {
            index,
            job_id,
            arrival_time,
            entered_service_time: now,
            started: false,
        }));
    }

    /// Completion of one job's service.
    fn complete(
        &mut self,
        index: usize,
        job_id: u64,
        arrival_time: f64,
        entered_service_time: f64,
        now: f64,
    ) {
        let warmup = self.config.warmup;
        let job_wait_time = entered_service_time - arrival_time;
        let job_service_time = now - entered_service_time;
        let job_response_time = now - arrival_time;

        let stream = &mut self.streams[index];
        if now >= warmup {
            stream.stats.job_wait_time.push(job_wait_time);
            stream.stats.job_service_time.push(job_service_time);
            stream.stats.job_response_time.push(job_response_time);
        }
        stream.in_service -= 1;
        self.total_in_service -= 1;
        let stream = &mut self.streams[index];
        stream.total_departures += 1;
        if now >= warmup {
            stream.stats.total_departures += 1;
        }
        self.event_complete_service(index, job_id, now);
        trace!(
            "stream {index}: job {job_id} wait {job_wait_time:.3}, service {job_service_time:.3}, response {job_response_time:.3}"
        );

        let stream = &mut self.streams[index];
        if stream.queue.is_empty() && stream.in_service == 0 {
            // The stream drained: close the busy period, open an idle one.
            if now >= warmup {
                let duration = now - stream.busy_period_start;
                stream.stats.busy_period.record(
                    stream.busy_period_start,
                    duration,
                    stream.busy_period_num_jobs,
                );
            }
            stream.idle_period_start = now;
        }
    }

    fn event_arrival(&mut self, index: usize, job_id: u64, now: f64) {
        trace!(
            "stream {index}: job {job_id} arrived, {} waiting",
            self.streams[index].jobs_waiting()
        );
        if now >= self.config.warmup {
            let stream = &mut self.streams[index];
            let waiting = stream.jobs_waiting() as f64;
            let in_system = stream.jobs_in_system() as f64;
            stream.stats.jobs_waiting.append(now, waiting);
            stream.stats.jobs_in_system.append(now, in_system);
        }
    }

    fn event_enter_service(&mut self, index: usize, job_id: u64, now: f64) {
        trace!("stream {index}: job {job_id} entered service");
        if now >= self.config.warmup {
            let stream = &mut self.streams[index];
            let waiting = stream.jobs_waiting() as f64;
            stream.stats.jobs_waiting.append(now, waiting);
            stream
                .stats
                .jobs_receiving_service
                .append(now, stream.in_service as f64);
        }
    }

    fn event_complete_service(&mut self, index: usize, job_id: u64, now: f64) {
        trace!("stream {index}: job {job_id} completed service");
        if now >= self.config.warmup {
            let stream = &mut self.streams[index];
            let in_system = stream.jobs_in_system() as f64;
            stream
                .stats
                .jobs_receiving_service
                .append(now, stream.in_service as f64);
            stream.stats.jobs_in_system.append(now, in_system);
        }
    }
}

/// Generates one stream's arrivals, spaced by its inter-arrival samples.
struct ArrivalProcess {
    index: usize,
    started: bool,
}

impl Process<QueueingSystem> for ArrivalProcess {
    fn resume(
        &mut self,
        system: &mut QueueingSystem,
        ctx: &mut Context<'_, QueueingSystem>,
    ) -> Option<f64> {
        if self.started {
            system.arrive(self.index, ctx.now());
        } else {
            self.started = true;
        }
        Some(system.sample_interarrival(self.index))
    }
}

/// The server loop: one clock per slot, `rs` rounds per group, `s` clocks of
/// context switch between groups.
struct ServerProcess {
    started: bool,
    group: usize,
    round: u64,
    slot: usize,
    switching: bool,
}

impl ServerProcess {
    fn new() -> Self {
        Self {
            started: false,
            group: 0,
            round: 0,
            slot: 0,
            switching: false,
        }
    }
}

impl Process<QueueingSystem> for ServerProcess {
    fn resume(
        &mut self,
        system: &mut QueueingSystem,
        ctx: &mut Context<'_, QueueingSystem>,
    ) -> Option<f64> {
        let t_clk = system.t_clk();
        let c = system.config().c;

        if !self.started {
            self.started = true;
            trace!("server: starting");
            trace!(
                "server: now processing queues {}-{}",
                self.group * c,
                (self.group + 1) * c - 1
            );
            return Some(t_clk);
        }

        if self.switching {
            // Waking from the vacation; the first clock of the new group is
            // next.
            self.switching = false;
            trace!(
                "server: now processing queues {}-{}",
                self.group * c,
                (self.group + 1) * c - 1
            );
            return Some(t_clk);
        }

        // A clock just elapsed: dispatch the slot it belongs to.
        let index = self.group * c + self.slot;
        system.dispatch(index, ctx);

        self.slot += 1;
        if self.slot == c {
            self.slot = 0;
            self.round += 1;
            trace!("server: completed a schedule round");
            if self.round == system.config().rs {
                self.round = 0;
                self.group = (self.group + 1) % system.num_groups();
                self.switching = true;
                trace!("server: context-switching");
                return Some(system.config().s as f64 * t_clk);
            }
        }
        Some(t_clk)
    }
}

/// One job's residence in the pipeline: `c` clocks, then completion.
struct ServiceProcess {
    index: usize,
    job_id: u64,
    arrival_time: f64,
    entered_service_time: f64,
    started: bool,
}

impl Process<QueueingSystem> for ServiceProcess {
    fn resume(
        &mut self,
        system: &mut QueueingSystem,
        ctx: &mut Context<'_, QueueingSystem>,
    ) -> Option<f64> {
        if !self.started {
            self.started = true;
            return Some(system.config().c as f64 * system.t_clk());
        }
        system.complete(
            self.index,
            self.job_id,
            self.arrival_time,
            self.entered_service_time,
            ctx.now(),
        );
        None
    }
}

/// A fully wired simulation of one queueing system.
pub struct QueueingSimulation {
    sim: Simulation<QueueingSystem>,
}

impl QueueingSimulation {
    pub fn new(
        config: SystemConfig,
        arrivals: Vec<(Distribution, SharedRng)>,
        dispatch_rng: SharedRng,
    ) -> TypedResult<Self> {
        let n = config.n;
        let system = QueueingSystem::new(config, arrivals, dispatch_rng)?;
        let mut sim = Simulation::new(system);

        // Arrival processes first, then the server: at coinciding instants
        // an arrival is visible to the same clock's dispatch decision.
        for index in 0..n {
            sim.spawn(Box::new(ArrivalProcess {
                index,
                started: false,
            }));
        }
        sim.spawn(Box::new(ServerProcess::new()));

        sim.before_run(|system: &mut QueueingSystem, now| system.record_window_open(now));
        sim.after_run(|system: &mut QueueingSystem, now| system.record_window_close(now));

        Ok(Self { sim })
    }

    /// Runs the simulation through `sim_time` time units.
    pub fn run(&mut self, sim_time: f64) {
        debug!("running queueing simulation until t = {sim_time}");
        self.sim.run_until(sim_time);
    }

    pub fn now(&self) -> f64 {
        self.sim.now()
    }

    pub fn system(&self) -> &QueueingSystem {
        self.sim.state()
    }

    pub fn into_system(self) -> QueueingSystem {
        self.sim.into_state()
    }
}
