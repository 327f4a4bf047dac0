use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crowdex::broker::{self, publisher::Publisher};
use crowdex::config::Settings;
use crowdex::consumer;
use crowdex::producer::{self, Producer};
use crowdex::store;
use crowdex::telemetry;

#[derive(Parser)]
#[command(name = "crowdex", version, about = "Crowdfunding platform chain-event indexer")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chain polling and message publishing
    #[command(subcommand)]
    Producer(ProducerCommand),

    /// Message consumption and state updates
    #[command(subcommand)]
    Consumer(ConsumerCommand),

    /// Broker topology management
    #[command(subcommand)]
    Broker(BrokerCommand),
}

#[derive(Subcommand)]
enum ProducerCommand {
    /// Start the polling loop; stops cleanly on SIGINT/SIGTERM
    Run,
    /// Publish a bounded historical range, then exit
    Backfill {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Print cursor position and lag
    Status,
}

#[derive(Subcommand)]
enum ConsumerCommand {
    /// Spawn and supervise the worker pool
    Run {
        /// Override consumer.workers from the config
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print queue depths
    Status,
}

#[derive(Subcommand)]
enum BrokerCommand {
    /// Declare exchange, queues and bindings (idempotent)
    Setup,
    /// Print per-queue message counts
    Status,
    /// Empty one queue
    Purge { queue: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings =
        Settings::load(&cli.config).with_context(|| format!("loading {}", cli.config))?;
    telemetry::init_tracing(&settings.log)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    match cli.command {
        Command::Producer(ProducerCommand::Run) => {
            let pool = store::connect(&settings.db).await?;
            store::assert_schema(&pool).await?;
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            broker::declare_topology(&channel, &settings.broker.exchange_name).await?;
            let publisher = Publisher::new(&connection, &settings.broker.exchange_name).await?;

            let shutdown = shutdown_token();
            let mut producer = Producer::new(settings, pool, publisher)?;
            producer.run(shutdown).await?;
        }

        Command::Producer(ProducerCommand::Backfill { from, to }) => {
            let pool = store::connect(&settings.db).await?;
            store::assert_schema(&pool).await?;
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            broker::declare_topology(&channel, &settings.broker.exchange_name).await?;
            let publisher = Publisher::new(&connection, &settings.broker.exchange_name).await?;

            let mut producer = Producer::new(settings, pool, publisher)?;
            let published = producer.backfill(from, to).await?;
            info!(from, to, published, "backfill complete");
        }

        Command::Producer(ProducerCommand::Status) => {
            let pool = store::connect(&settings.db).await?;
            store::assert_schema(&pool).await?;
            producer::print_status(&settings, &pool).await?;
        }

        Command::Consumer(ConsumerCommand::Run { workers }) => {
            if let Some(workers) = workers {
                settings.consumer.workers = workers;
            }
            let pool = store::connect(&settings.db).await?;
            store::assert_schema(&pool).await?;
            // fail fast if the broker is unreachable before spawning workers
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            broker::declare_topology(&channel, &settings.broker.exchange_name).await?;
            drop(connection);

            let shutdown = shutdown_token();
            consumer::run_pool(settings, pool, shutdown).await?;
        }

        Command::Consumer(ConsumerCommand::Status) => {
            consumer::print_status(&settings).await?;
        }

        Command::Broker(BrokerCommand::Setup) => {
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            broker::declare_topology(&channel, &settings.broker.exchange_name).await?;
            println!(
                "declared exchange {} with {} queues",
                settings.broker.exchange_name,
                broker::ALL_QUEUES.len() + 1
            );
        }

        Command::Broker(BrokerCommand::Status) => {
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            let stats = broker::queue_stats(&channel).await?;
            println!("{:<24} {:>10} {:>10}", "queue", "messages", "consumers");
            for stat in stats {
                println!("{:<24} {:>10} {:>10}", stat.name, stat.messages, stat.consumers);
            }
        }

        Command::Broker(BrokerCommand::Purge { queue }) => {
            anyhow::ensure!(
                broker::is_known_queue(&queue),
                "unknown queue {:?}; expected one of {:?} or {:?}",
                queue,
                broker::ALL_QUEUES,
                broker::DLQ_EVENTS
            );
            let connection = broker::connect(&settings.broker).await?;
            let channel = connection.create_channel().await?;
            let purged = broker::purge_queue(&channel, &queue).await?;
            println!("purged {} message(s) from {}", purged, queue);
        }
    }

    Ok(())
}

/// Cancelled on SIGINT or SIGTERM; both roles drain in-flight work and
/// exit 0.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                eprintln!("failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received, draining");
        trigger.cancel();
    });
    token
}
