use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use groupreduce::{
    bench::{self, BenchConfig, CounterMachine, StopCondition},
    table::{memory::MemoryNetwork, tcp::TcpEndpoint},
    Aggregator, MemberId, MemberList, RoundOptions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Sum benchmark throughput across a group")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one member, talking to its peers over TCP
    Member(MemberArgs),
    /// Run a whole group inside this process
    Local(LocalArgs),
    /// Add up the bw_*.txt files in a directory
    Sum(SumArgs),
}

#[derive(clap::Args, Debug)]
struct BenchArgs {
    /// Length of the measurement window in seconds
    #[arg(long, env = "GROUPREDUCE_DURATION", default_value_t = 10)]
    duration: u64,
    /// Stop after this many deliveries instead of after the window
    #[arg(long, env = "GROUPREDUCE_DELIVERIES")]
    deliveries: Option<u64>,
    /// Give up on the reduction round after this many seconds
    #[arg(long, env = "GROUPREDUCE_TIMEOUT")]
    timeout: Option<u64>,
    #[arg(long, env = "GROUPREDUCE_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,
    /// Also write each member's throughput to bw_<rank>.txt
    #[arg(long, env = "GROUPREDUCE_PER_MEMBER_FILES")]
    per_member_files: bool,
}

impl BenchArgs {
    fn config(&self) -> BenchConfig {
        let stop = match self.deliveries {
            Some(n) => StopCondition::Deliveries(n),
            None => StopCondition::Elapsed(Duration::from_secs(self.duration)),
        };
        let round = match self.timeout {
            Some(secs) => RoundOptions::builder()
                .timeout(Duration::from_secs(secs))
                .build(),
            None => RoundOptions::default(),
        };
        BenchConfig::builder()
            .stop(stop)
            .output_dir(self.output_dir.clone())
            .per_member_files(self.per_member_files)
            .round(round)
            .build()
    }
}

#[derive(clap::Args, Debug)]
struct MemberArgs {
    #[arg(long, env = "GROUPREDUCE_ID")]
    id: MemberId,
    /// Every member id in row order; all members must pass the same list
    #[arg(
        long,
        env = "GROUPREDUCE_MEMBERS",
        value_delimiter = ',',
        required = true
    )]
    members: Vec<MemberId>,
    #[arg(long, env = "GROUPREDUCE_LISTEN")]
    listen: SocketAddr,
    /// A peer's listening address, as id=host:port
    #[arg(
        long = "peer",
        env = "GROUPREDUCE_PEERS",
        value_delimiter = ',',
        value_parser = parse_peer
    )]
    peers: Vec<(MemberId, SocketAddr)>,
    /// Seconds to keep dialing peers that are not up yet
    #[arg(long, env = "GROUPREDUCE_CONNECT_TIMEOUT", default_value_t = 30)]
    connect_timeout: u64,
    #[command(flatten)]
    bench: BenchArgs,
}

#[derive(clap::Args, Debug)]
struct LocalArgs {
    /// Number of members to run
    #[arg(short = 'n', long, env = "GROUPREDUCE_SIZE", default_value_t = 3)]
    size: u32,
    #[command(flatten)]
    bench: BenchArgs,
}

#[derive(clap::Args, Debug)]
struct SumArgs {
    #[arg(default_value = "results")]
    dir: PathBuf,
}

fn parse_peer(s: &str) -> Result<(MemberId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", s))?;
    let id = id.parse().map_err(|e| format!("bad member id {:?}: {}", id, e))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("bad address {:?}: {}", addr, e))?;
    Ok((id, addr))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Member(args) => member(args).await,
        Command::Local(args) => local(args).await,
        Command::Sum(args) => {
            let sum = bench::sum_result_files(&args.dir)
                .await
                .with_context(|| format!("summing files in {:?}", args.dir))?;
            println!("sum = {}", sum);
            Ok(())
        }
    }
}

async fn member(args: MemberArgs) -> anyhow::Result<()> {
    let members = MemberList::new(args.members)?;
    let local_index = members
        .index_of(args.id)
        .ok_or_else(|| anyhow!("member {} is not in --members", args.id))?;

    let endpoint = TcpEndpoint::bind(args.id, args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?
        .with_connect_timeout(Duration::from_secs(args.connect_timeout));
    for (id, addr) in args.peers {
        endpoint.add_peer(id, addr).await;
    }
    info!(
        "member {} at row {} of {}",
        args.id,
        local_index,
        members.len()
    );

    let aggregator = Aggregator::new(endpoint);
    let machine = CounterMachine::new(args.id.into());
    let report = bench::run(
        &aggregator,
        &members,
        local_index,
        &machine,
        &args.bench.config(),
    )
    .await?;
    println!("local throughput: {:.6}", report.local.throughput);
    println!("total throughput: {:.6}", report.total);
    Ok(())
}

async fn local(args: LocalArgs) -> anyhow::Result<()> {
    let network = MemoryNetwork::new();
    let members = MemberList::new((0..args.size).collect())?;
    let config = args.bench.config();

    let mut handles = Vec::with_capacity(members.len());
    for (index, id) in members.iter().enumerate() {
        let aggregator = Aggregator::new(network.join(id).await);
        let members = members.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let machine = CounterMachine::new(id.into());
            bench::run(&aggregator, &members, index, &machine, &config).await
        }));
    }

    let mut total = None;
    for (index, handle) in join_all(handles).await.into_iter().enumerate() {
        let report = handle??;
        println!(
            "member {} throughput: {:.6}",
            index, report.local.throughput
        );
        total = Some(report.total);
    }
    if let Some(total) = total {
        println!("total throughput: {:.6}", total);
    }
    Ok(())
}
