use std::{
    backtrace::{Backtrace, BacktraceStatus},
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Result, anyhow};
use clap::Parser;
use icm_relayer::{
    cfg::{Config, read_config},
    constants::{DEFAULT_RPC_TIMEOUT, QUORUM_DENOMINATOR},
    crypto::Id,
    destination::{self, DestinationClient, DestinationSettings},
    epoch::{EpochResolver, ProposerVmClient},
    health::HealthTracker,
    listener::Listener,
    message::WarpBlockInfo,
    network::AppRequestNetwork,
    retry::with_retries,
    source::{self, SourceClient},
    validators::{
        PChainHeight,
        client::{InfoApiClient, PeerNetwork, PlatformApiClient},
        manager::ValidatorManager,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    // Set a panic hook that records the panic as a `tracing` event at the `ERROR` verbosity level.
    std::panic::set_hook(Box::new(|panic| {
        let message = match panic.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("<unnamed>");

        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

        match (panic.location(), backtrace) {
            (None, None) => {
                error!(thread_name, message);
            }
            (None, Some(backtrace)) => {
                error!(thread_name, message, %backtrace);
            }
            (Some(location), None) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                );
            }
            (Some(location), Some(backtrace)) => {
                error!(
                    thread_name,
                    message,
                    panic.file = location.file(),
                    panic.line = location.line(),
                    panic.column = location.column(),
                    %backtrace,
                );
            }
        }
    }));

    let config = read_config(args.config_file.as_slice())?;
    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let health = Arc::new(HealthTracker::new());

    let p_chain = Arc::new(PlatformApiClient::new(
        &config.p_chain_api.base_url,
        config.p_chain_api.timeout,
    )?);
    let info = Arc::new(InfoApiClient::new(
        &config.info_api.base_url,
        config.info_api.timeout,
    )?);
    match info.node_id().await {
        Ok(node_id) => info!(%node_id, "connected to info API"),
        Err(e) => warn!("failed to fetch node ID from info API: {e:#}"),
    }
    let validators = Arc::new(ValidatorManager::new(p_chain));
    let network = Arc::new(AppRequestNetwork::new(
        info,
        validators.clone(),
        config.quorum_numerator,
        QUORUM_DENOMINATOR,
    ));
    let _validator_refresh = validators
        .clone()
        .spawn_refresh(config.validator_refresh_interval);
    let _network_refresh = network
        .clone()
        .spawn_refresh(config.validator_refresh_interval);

    let mut destinations = HashMap::new();
    for chain in &config.destination_blockchains {
        let rpc = destination::rpc::connect(&chain.rpc_url, DEFAULT_RPC_TIMEOUT)?;
        let epochs = chain
            .epoch_api_url
            .as_deref()
            .map(|url| -> Result<_> {
                Ok(EpochResolver::new(
                    Arc::new(ProposerVmClient::new(url, DEFAULT_RPC_TIMEOUT)?),
                    chain.epoch_duration,
                ))
            })
            .transpose()?;
        let client = DestinationClient::new(
            chain.blockchain_id,
            rpc,
            chain.signers()?,
            DestinationSettings {
                fees: chain.fee_config(),
                tx_inclusion_timeout: config.tx_inclusion_timeout,
            },
            epochs,
            health.clone(),
        )
        .await?;
        let height = client.p_chain_height_for_signing().await?;
        info!(
            blockchain_id = %chain.blockchain_id,
            subnet = %chain.subnet_id,
            %height,
            signers = ?client.signer_addresses(),
            "destination ready"
        );
        destinations.insert(chain.blockchain_id, client);
    }

    let (shutdown_sender, shutdown) = watch::channel(false);
    let mut listeners = JoinSet::new();
    for chain in &config.source_blockchains {
        let client = with_retries(
            "connect to source chain",
            config.initial_connection_timeout,
            || source::connect(&chain.ws_url, DEFAULT_RPC_TIMEOUT),
        )
        .await?;
        match client.latest_height().await {
            Ok(head) => {
                info!(blockchain_id = %chain.blockchain_id, head, "connected to source chain");
                if let Some(start_height) = chain.start_height.filter(|start| *start > head) {
                    warn!(
                        blockchain_id = %chain.blockchain_id,
                        start_height,
                        head,
                        "start height is above the chain head"
                    );
                }
            }
            Err(e) => warn!(blockchain_id = %chain.blockchain_id, "failed to fetch chain head: {e:#}"),
        }
        let (sink, blocks) = mpsc::channel(1024);
        let listener = Listener::new(
            chain.blockchain_id,
            client,
            chain.warp_address,
            chain.start_height,
            config.initial_connection_timeout,
            sink,
            health.clone(),
        );
        listeners.spawn(listener.run(shutdown.clone()));
        tokio::spawn(report_blocks(
            chain.blockchain_id,
            chain.subnet_id,
            blocks,
            network.clone(),
        ));
    }
    info!(
        sources = config.source_blockchains.len(),
        destinations = destinations.len(),
        "relayer started"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = shutdown_sender.send(true);
                break;
            }
            Some(result) = listeners.join_next() => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("listener stopped: {e:#}"),
                    Err(e) => error!("listener panicked: {e}"),
                }
                if listeners.is_empty() {
                    return Err(anyhow!(
                        "every listener has stopped, unhealthy chains: {:?}",
                        health.unhealthy()
                    ));
                }
            }
        }
    }

    while let Some(result) = listeners.join_next().await {
        if let Ok(Err(e)) = result {
            warn!("listener stopped with error during shutdown: {e:#}");
        }
    }
    Ok(())
}

/// Log every relayed block along with the connectivity of its subnet's validators.
async fn report_blocks(
    blockchain_id: Id,
    subnet: Id,
    mut blocks: mpsc::Receiver<WarpBlockInfo>,
    network: Arc<AppRequestNetwork>,
) {
    while let Some(block) = blocks.recv().await {
        if block.messages.is_empty() {
            trace!(%blockchain_id, height = block.block_number, catchup = block.is_catchup, "empty block");
            continue;
        }
        for message in &block.messages {
            info!(
                %blockchain_id,
                height = block.block_number,
                message_id = %message.unsigned_message_id,
                source_address = %message.source_address,
                catchup = block.is_catchup,
                "warp message"
            );
        }
        match network
            .get_canonical_validators(subnet, PChainHeight::Current)
            .await
        {
            Ok(validators) => {
                if let Err(e) = network.check_quorum(subnet, &validators) {
                    warn!(%blockchain_id, "{e}");
                }
            }
            Err(e) => warn!(%blockchain_id, %subnet, "failed to read validators: {e}"),
        }
    }
}
