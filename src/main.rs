//! Netcheck CLI - run network-policy test cases against a cluster

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netcheck::config::{InterpreterConfig, InventoryConfig};
use netcheck::interpreter::Interpreter;
use netcheck::inventory::{Inventory, Protocol};
use netcheck::mock::{InMemoryCluster, StaticProbeExecutor};
use netcheck::probe::{KubeProbeExecutor, ProbeExecutor};
use netcheck::provisioner::{KubeProvisioner, ResourceProvisioner};
use netcheck::report::LogReporter;
use netcheck::testcase::{count_by_tag, load_test_cases};
use netcheck::{DEFAULT_CONNECT_TIMEOUT_SECONDS, DEFAULT_POD_CREATION_TIMEOUT_SECONDS};

/// Netcheck - validates network-policy enforcement against expected reachability
#[derive(Parser, Debug)]
#[command(name = "netcheck", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute test cases against already-provisioned pods
    ///
    /// For every step: mutate policies or labels, wait for enforcement to
    /// converge, probe every pod pair on every port/protocol, and compare
    /// against the expected reachability.
    Run(RunArgs),
}

/// Run mode arguments
#[derive(Parser, Debug)]
struct RunArgs {
    /// YAML file holding the test cases
    #[arg(long, env = "NETCHECK_TEST_CASES")]
    test_cases: PathBuf,

    /// YAML interpreter config; flags below override it
    #[arg(long, env = "NETCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Extra attempts per probe after an execution failure
    #[arg(long, env = "NETCHECK_RETRIES")]
    retries: Option<u32>,

    /// Seconds to wait after each perturbation before probing
    #[arg(long, env = "NETCHECK_PERTURBATION_WAIT_SECONDS")]
    perturbation_wait_seconds: Option<u64>,

    /// Probe in concurrent batches instead of one at a time
    #[arg(long)]
    batch_jobs: bool,

    /// Exclude pod-to-itself cells from comparison
    #[arg(long)]
    ignore_loopback: bool,

    /// Do not clear policies and restore labels before each test case
    #[arg(long)]
    no_reset: bool,

    /// Do not read cluster state back after each perturbation
    #[arg(long)]
    no_verify: bool,

    /// Log every truth table, not just those with mismatches
    #[arg(long)]
    noisy: bool,

    /// Use the in-memory backend instead of a cluster
    #[arg(long)]
    mock: bool,

    /// List test cases and tag counts without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Kubeconfig context to use
    #[arg(long, env = "NETCHECK_CONTEXT")]
    context: Option<String>,

    /// Namespaces holding test pods
    #[arg(long = "namespace", value_delimiter = ',', default_values_t = ["x".to_string(), "y".to_string(), "z".to_string()])]
    namespaces: Vec<String>,

    /// Pod names, present in every namespace
    #[arg(long = "pod", value_delimiter = ',', default_values_t = ["a".to_string(), "b".to_string(), "c".to_string()])]
    pods: Vec<String>,

    /// Server ports
    #[arg(long = "server-port", value_delimiter = ',', default_values_t = [80u16, 81])]
    server_ports: Vec<u16>,

    /// Server protocols
    #[arg(long = "server-protocol", value_delimiter = ',', default_values_t = Protocol::ALL)]
    server_protocols: Vec<Protocol>,

    /// Seconds to wait for every pod to get an IP
    #[arg(long, default_value_t = DEFAULT_POD_CREATION_TIMEOUT_SECONDS)]
    pod_creation_timeout_seconds: u64,

    /// In-pod timeout for each connection attempt
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECONDS)]
    connect_timeout_seconds: u32,
}

impl RunArgs {
    fn interpreter_config(&self) -> anyhow::Result<InterpreterConfig> {
        let mut config = match &self.config {
            Some(path) => InterpreterConfig::from_yaml_file(path)?,
            None => InterpreterConfig::default(),
        };
        if let Some(retries) = self.retries {
            config.probe_retries = retries;
        }
        if let Some(wait) = self.perturbation_wait_seconds {
            config.perturbation_wait_seconds = wait;
        }
        config.batch_jobs |= self.batch_jobs;
        config.ignore_loopback |= self.ignore_loopback;
        if self.no_reset {
            config.reset_cluster_before_test_case = false;
        }
        if self.no_verify {
            config.verify_cluster_state_before_test_case = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn inventory_config(&self) -> anyhow::Result<InventoryConfig> {
        let config = InventoryConfig {
            namespaces: self.namespaces.clone(),
            pods: self.pods.clone(),
            ports: self.server_ports.clone(),
            protocols: self.server_protocols.clone(),
            pod_creation_timeout_seconds: self.pod_creation_timeout_seconds,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("failed to install TLS crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let code = run(args).await?;
            std::process::exit(code);
        }
    }
}

async fn kube_client(context: Option<&str>) -> anyhow::Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load kubeconfig: {}", e))?;
    Ok(Client::try_from(config)?)
}

/// Execute the run; returns the process exit status
async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let config = args.interpreter_config()?;
    let inventory_config = args.inventory_config()?;

    let (provisioner, executor): (Arc<dyn ResourceProvisioner>, Arc<dyn ProbeExecutor>) =
        if args.mock || args.dry_run {
            info!("using in-memory backend");
            let cluster: Arc<dyn ResourceProvisioner> = Arc::new(InMemoryCluster::with_pods(
                &inventory_config.namespaces,
                &inventory_config.pods,
            ));
            let executor: Arc<dyn ProbeExecutor> = Arc::new(StaticProbeExecutor::allow_all());
            (cluster, executor)
        } else {
            let client = kube_client(args.context.as_deref()).await?;
            let provisioner: Arc<dyn ResourceProvisioner> = Arc::new(KubeProvisioner::new(
                client.clone(),
                inventory_config.namespaces.clone(),
                inventory_config.pods.clone(),
                inventory_config.pod_creation_timeout(),
            ));
            let executor: Arc<dyn ProbeExecutor> =
                Arc::new(KubeProbeExecutor::new(client, args.connect_timeout_seconds));
            (provisioner, executor)
        };

    let inventory = Inventory::snapshot(provisioner.as_ref(), inventory_config.tuples()).await?;
    info!(
        pods = inventory.identities().len(),
        tuples = inventory.tuples().len(),
        "inventory ready"
    );

    let cases = load_test_cases(&args.test_cases, &inventory)?;
    for (tag, count) in count_by_tag(&cases) {
        info!(tag = %tag, count, "test cases by tag");
    }

    if args.dry_run {
        for (index, case) in cases.iter().enumerate() {
            println!("{:>4}  {} ({} steps)", index, case.description, case.steps.len());
        }
        println!("{} test cases", cases.len());
        return Ok(0);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let interpreter =
        Interpreter::new(provisioner, executor, inventory, config)?.with_cancellation(cancel);
    let mut reporter = LogReporter::new(args.noisy);
    let summary = interpreter.run(cases, &mut reporter).await?;

    println!("{}", summary);
    Ok(summary.exit_code())
}
