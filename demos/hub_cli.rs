//! Connect to a hub, pair (or reuse a saved credential), list its devices and
//! print every change until Ctrl-C.
//!
//! ```text
//! cargo run --example hub_cli -- 192.168.1.50 [credential.json]
//! ```
//!
//! Set `RUST_LOG=nymea_hub=debug` to watch the protocol traffic.

use nymea_hub::{Credential, HubAddress, HubClient, HubConfig, HubError, HubEvent, SubscriptionKey, TlsMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nymea_hub=info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(host) = args.next() else {
        eprintln!("usage: hub_cli <host> [credential.json]");
        std::process::exit(2);
    };
    let credential_path = args.next().map(PathBuf::from);

    let config = HubConfig::new(HubAddress::new(host)).with_tls(TlsMode::Auto);
    let client = HubClient::connect(config).await?;

    let saved: Option<Credential> = match &credential_path {
        Some(path) if path.exists() => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        _ => None,
    };

    match saved {
        Some(credential) => {
            client.authenticate(&credential).await?;
            println!("Authenticated with saved credential for hub {}", credential.hub_id);
        }
        None => {
            let credential = client
                .pair(|prompt| {
                    let hub = prompt.hub_name.as_deref().unwrap_or("the hub");
                    println!("Press the button on {hub} within {}s", prompt.window.as_secs());
                })
                .await?;
            match (credential, &credential_path) {
                (Some(credential), Some(path)) => {
                    std::fs::write(path, serde_json::to_string_pretty(&credential)?)?;
                    println!("Paired; credential saved to {}", path.display());
                }
                (Some(_), None) => println!("Paired; pass a file path to keep the credential"),
                (None, _) => println!("Hub does not require authentication"),
            }
        }
    }

    client.refresh().await?;
    for device in client.registry().devices() {
        let class = client.registry().thing_class(&device.thing_class_id);
        let cover = class.as_ref().and_then(|c| device.cover_state(c));
        println!(
            "{:<38} {:<24} firmware={} cover={:?}",
            device.id,
            device.name,
            device.firmware_version.as_deref().unwrap_or("-"),
            cover
        );
    }

    client.subscribe(SubscriptionKey::All, |change| {
        println!("{:?} {} {:?}", change.kind, change.device.name, change.device.states);
    });
    client.start_notifications().await?;

    let mut events = client.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(HubEvent::Device(_)) => {}
                Ok(HubEvent::HubConnectivity { connected }) => println!("Hub reports connected={connected}"),
                Ok(HubEvent::NotificationChannel { connected }) => {
                    println!("Notification channel {}", if connected { "up" } else { "down" })
                }
                Ok(HubEvent::Resynchronized { missed }) => println!("Resynchronized after {missed} missed notifications"),
                Err(HubError::Lagged(n)) => eprintln!("Missed {n} events"),
                Err(e) => {
                    eprintln!("Event stream ended: {e}");
                    break;
                }
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
