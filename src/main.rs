use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memberlink::cli;
use memberlink::codec::GossipMessage;
use memberlink::dispatch::LocalDelivery;
use memberlink::Member;

fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let args = cli::Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "memberlink=debug".into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let settings = args.into_settings()?;
    debug!("Effective settings: {}", serde_json::to_string(&settings)?);

    // Envelopes arriving on the data channel are delivered locally
    let (registry, mut envelopes) = LocalDelivery::new();
    let mut member = Member::new(settings, Arc::new(registry));
    info!("Starting member {}", member.identity());
    if let Err(e) = member.initialize() {
        error!("Member started with errors: {}", e);
    }
    if member.status() == memberlink::MemberStatus::Failed {
        member.shutdown()?;
        anyhow::bail!("no channel could be started");
    }

    member.subscribe_gossip(|message: &GossipMessage| -> anyhow::Result<()> {
        info!(
            "Gossip from {} ({} members known)",
            message.sender_key(),
            message.members.len()
        );
        Ok(())
    })?;

    // Signal handling runs on its own small runtime so the member's
    // blocking lifecycle calls stay outside any async context.
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
                Some(envelope) = envelopes.recv() => {
                    info!(
                        "Envelope from {} on topic {} ({} bytes)",
                        envelope.sender_key,
                        envelope.topic,
                        envelope.payload.len()
                    );
                }
            }
        }
    });
    drop(signals);

    member.shutdown()?;
    Ok(())
}
