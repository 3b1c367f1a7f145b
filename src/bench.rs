//! Throughput benchmark driver. Each member drives a workload for a while,
//! measures its own throughput and the group sums the measurements with one
//! reduction round. The member at row 0 reports the total.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{fs, time::Instant};
use tracing::{debug, debug_span, info, Instrument};
use typed_builder::TypedBuilder;

use crate::{
    aggregate::{Aggregator, RoundOptions},
    error::Error,
    group::MemberList,
    sync::CountingBarrier,
    table::TableProvider,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const RESULT_FILE: &str = "result.txt";

/// One benchmarked operation, such as a replicated call that resolves once
/// the group delivered it. Every delivery the workload observes, whichever
/// member issued it, is reported with `delivered.arrive()`.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn issue(
        &self,
        delivered: &Arc<CountingBarrier>,
    ) -> Result<(), BoxError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopCondition {
    /// Issue operations for a fixed window.
    Elapsed(Duration),
    /// Issue operations until this many were delivered.
    Deliveries(u64),
}

impl Default for StopCondition {
    fn default() -> Self {
        StopCondition::Elapsed(Duration::from_secs(10))
    }
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct BenchConfig {
    #[builder(default)]
    pub stop: StopCondition,
    /// Where the leader writes `result.txt`.
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
    /// Also write each member's own throughput to `bw_<rank>.txt`.
    #[builder(default)]
    pub per_member_files: bool,
    #[builder(default)]
    pub round: RoundOptions,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub operations: u64,
    pub elapsed: Duration,
    /// Operations per second.
    pub throughput: f64,
}

impl Measurement {
    pub fn new(operations: u64, elapsed: Duration) -> Self {
        let nanos = elapsed.as_nanos();
        let throughput = if nanos == 0 {
            0.0
        } else {
            operations as f64 / nanos as f64 * 1e9
        };
        Self {
            operations,
            elapsed,
            throughput,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Report {
    pub local: Measurement,
    /// Sum of every member's throughput.
    pub total: f64,
}

/// Drives `workload` until `stop` says so. `operations` counts the issues
/// this member completed; a delivery target counts deliveries group-wide.
pub async fn measure<W>(
    workload: &W,
    stop: StopCondition,
) -> Result<Measurement, Error>
where
    W: Workload + ?Sized,
{
    let mut operations = 0;
    let start = Instant::now();
    match stop {
        StopCondition::Elapsed(window) => {
            // never released, deliveries are only counted
            let delivered = Arc::new(CountingBarrier::new(u64::MAX));
            tokio::select! {
                biased;
                _ = tokio::time::sleep(window) => {}
                e = keep_issuing(workload, &delivered, &mut operations) => {
                    Err(e)?
                }
            }
        }
        StopCondition::Deliveries(target) => {
            let delivered = Arc::new(CountingBarrier::new(target));
            tokio::select! {
                biased;
                _ = delivered.wait() => {}
                e = keep_issuing(workload, &delivered, &mut operations) => {
                    Err(e)?
                }
            }
        }
    }
    let measurement = Measurement::new(operations, start.elapsed());
    debug!(
        "{} operations in {:?}",
        measurement.operations, measurement.elapsed
    );
    Ok(measurement)
}

/// Issues until the workload fails.
async fn keep_issuing<W>(
    workload: &W,
    delivered: &Arc<CountingBarrier>,
    operations: &mut u64,
) -> Error
where
    W: Workload + ?Sized,
{
    loop {
        if let Err(e) = workload.issue(delivered).await {
            return Error::Workload(e);
        }
        *operations += 1;
    }
}

/// Measures this member and sums the throughput across the group. The member
/// at row 0 writes the total to `result.txt` in the output directory.
pub async fn run<P, W>(
    aggregator: &Aggregator<P>,
    members: &MemberList,
    local_index: usize,
    workload: &W,
    config: &BenchConfig,
) -> Result<Report, Error>
where
    P: TableProvider,
    W: Workload + ?Sized,
{
    members.check_index(local_index)?;
    async move {
        fs::create_dir_all(&config.output_dir).await?;
        // start every member's window together
        aggregator
            .reduce_sum(members, local_index, 0.0, &config.round)
            .await?;
        debug!("every member is ready");

        let local = measure(workload, config.stop).await?;
        if config.per_member_files {
            let path =
                config.output_dir.join(format!("bw_{}.txt", local_index));
            fs::write(&path, format!("{:.6}\n", local.throughput)).await?;
        }

        let total = aggregator
            .reduce_sum(members, local_index, local.throughput, &config.round)
            .await?;
        if local_index == 0 {
            let path = config.output_dir.join(RESULT_FILE);
            fs::write(&path, format!("total throughput: {:.6}\n", total))
                .await?;
            info!("total throughput {:.6} written to {:?}", total, path);
        }
        Ok(Report { local, total })
    }
    .instrument(debug_span!("bench", local_index))
    .await
}

/// Adds up every `bw_*.txt` in `dir`, one value per line.
pub async fn sum_result_files(dir: &Path) -> Result<f64, Error> {
    let mut paths = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("bw_") && name.ends_with(".txt") {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut sum = 0.0;
    for path in paths {
        let contents = fs::read_to_string(&path).await?;
        for (line, value) in contents.lines().enumerate() {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            sum += value.parse::<f64>().map_err(|_| {
                Error::MalformedResultFile {
                    path: path.clone(),
                    line: line + 1,
                }
            })?;
        }
    }
    Ok(sum)
}

/// A trivial replicated state machine: every call sets the state to the
/// caller's rank and is acknowledged at once. Stands in for a real group
/// when only the measurement and reduction are being exercised.
#[derive(Debug)]
pub struct CounterMachine {
    rank: u64,
    state: AtomicU64,
    applied: AtomicU64,
}

impl CounterMachine {
    pub fn new(rank: u64) -> Self {
        Self {
            rank,
            state: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    /// Number of calls applied so far.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Workload for CounterMachine {
    async fn issue(
        &self,
        delivered: &Arc<CountingBarrier>,
    ) -> Result<(), BoxError> {
        tokio::task::yield_now().await;
        self.state.store(self.rank, Ordering::Release);
        self.applied.fetch_add(1, Ordering::AcqRel);
        delivered.arrive();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::table::memory::MemoryNetwork;

    struct Failing;

    #[async_trait]
    impl Workload for Failing {
        async fn issue(
            &self,
            _: &Arc<CountingBarrier>,
        ) -> Result<(), BoxError> {
            Err("replica unreachable".into())
        }
    }

    #[test]
    fn throughput_is_per_second() {
        let m = Measurement::new(500, Duration::from_millis(250));
        assert!((m.throughput - 2000.0).abs() < 1e-9);
        assert_eq!(Measurement::new(7, Duration::ZERO).throughput, 0.0);
    }

    #[tokio::test]
    async fn stops_after_deliveries() {
        let machine = CounterMachine::new(3);
        let m = measure(&machine, StopCondition::Deliveries(25))
            .await
            .unwrap();
        assert_eq!(m.operations, 25);
        assert_eq!(machine.applied(), 25);
        assert_eq!(machine.state(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_the_window() {
        struct Ticking;

        #[async_trait]
        impl Workload for Ticking {
            async fn issue(
                &self,
                _: &Arc<CountingBarrier>,
            ) -> Result<(), BoxError> {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            }
        }

        let window = StopCondition::Elapsed(Duration::from_secs(1));
        let m = measure(&Ticking, window).await.unwrap();
        // timer ticks may stretch each sleep by up to a millisecond
        assert!((90..=100).contains(&m.operations), "{:?}", m);
        assert!(m.elapsed >= Duration::from_secs(1));
        let expected = m.operations as f64 / m.elapsed.as_secs_f64();
        assert!((m.throughput - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn counts_deliveries_from_every_issuer() {
        // each issue is delivered by two other replicas and then locally
        struct Fanout;

        #[async_trait]
        impl Workload for Fanout {
            async fn issue(
                &self,
                delivered: &Arc<CountingBarrier>,
            ) -> Result<(), BoxError> {
                let replicas: Vec<_> = (0..2)
                    .map(|_| {
                        let delivered = delivered.clone();
                        tokio::spawn(async move {
                            delivered.arrive();
                        })
                    })
                    .collect();
                for replica in replicas {
                    replica.await?;
                }
                delivered.arrive();
                Ok(())
            }
        }

        let m = measure(&Fanout, StopCondition::Deliveries(30))
            .await
            .unwrap();
        assert_eq!(m.operations, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn late_member_holds_back_the_window() {
        #[derive(Default)]
        struct Stamped {
            first: std::sync::Mutex<Option<Instant>>,
        }

        #[async_trait]
        impl Workload for Stamped {
            async fn issue(
                &self,
                delivered: &Arc<CountingBarrier>,
            ) -> Result<(), BoxError> {
                self.first.lock().unwrap().get_or_insert_with(Instant::now);
                tokio::time::sleep(Duration::from_millis(10)).await;
                delivered.arrive();
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::new();
        let members = MemberList::new(vec![0, 1]).unwrap();
        let early = Aggregator::new(network.join(0).await);
        let late = Aggregator::new(network.join(1).await);
        let config = BenchConfig::builder()
            .stop(StopCondition::Deliveries(5))
            .output_dir(dir.path())
            .build();
        let workloads = [Stamped::default(), Stamped::default()];
        let delay = Duration::from_secs(3);

        let begin = Instant::now();
        let (a, b) = tokio::join!(
            run(&early, &members, 0, &workloads[0], &config),
            async {
                tokio::time::sleep(delay).await;
                run(&late, &members, 1, &workloads[1], &config).await
            },
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let first = workloads[0].first.lock().unwrap().unwrap();
        assert!(first >= begin + delay, "{:?}", first - begin);
        assert!(a.local.elapsed < delay);
        assert_eq!(a.total, b.total);
    }

    #[tokio::test]
    async fn workload_errors_surface() {
        assert!(matches!(
            measure(&Failing, StopCondition::Deliveries(1)).await,
            Err(Error::Workload(_))
        ));
    }

    #[tokio::test]
    async fn leader_writes_the_total() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("results");
        let network = MemoryNetwork::new();
        let members = MemberList::new(vec![0, 1, 2]).unwrap();
        let mut aggregators = Vec::new();
        for id in members.iter() {
            aggregators.push(Aggregator::new(network.join(id).await));
        }
        let config = BenchConfig::builder()
            .stop(StopCondition::Deliveries(40))
            .output_dir(&dir)
            .per_member_files(true)
            .build();
        let machines: Vec<_> = (0..3).map(CounterMachine::new).collect();

        let reports = join_all(aggregators.iter().enumerate().map(
            |(index, aggregator)| {
                run(aggregator, &members, index, &machines[index], &config)
            },
        ))
        .await;
        let reports: Vec<Report> =
            reports.into_iter().map(|r| r.unwrap()).collect();

        let expected: f64 = reports
            .iter()
            .map(|r| r.local.throughput)
            .reduce(|a, b| a + b)
            .unwrap();
        for report in &reports {
            assert_eq!(report.local.operations, 40);
            assert_eq!(report.total, expected);
        }

        let written =
            std::fs::read_to_string(dir.join(RESULT_FILE)).unwrap();
        assert_eq!(written, format!("total throughput: {:.6}\n", expected));

        let from_files = sum_result_files(&dir).await.unwrap();
        let rounded: f64 = reports
            .iter()
            .map(|r| {
                format!("{:.6}", r.local.throughput).parse::<f64>().unwrap()
            })
            .sum();
        assert!((from_files - rounded).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sums_result_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bw_0.txt"), "1.5\n").unwrap();
        std::fs::write(dir.path().join("bw_1.txt"), "2.25\n\n0.25\n")
            .unwrap();
        std::fs::write(dir.path().join("result.txt"), "ignored\n").unwrap();
        assert_eq!(sum_result_files(dir.path()).await.unwrap(), 4.0);

        std::fs::write(dir.path().join("bw_2.txt"), "fast\n").unwrap();
        assert!(matches!(
            sum_result_files(dir.path()).await,
            Err(Error::MalformedResultFile { line: 1, .. })
        ));
    }
}
