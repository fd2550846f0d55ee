//! Refresh trigger utility
//!
//! Publishes one refresh command to a running bridge and exits.
//!
//! ## Usage
//!
//! ```bash
//! # JSON form on water/refresh
//! suez-refresh --mode daily
//!
//! # Plain-text form under another prefix
//! suez-refresh --mode history --plain --prefix home/water
//! ```

use clap::Parser;
use rumqttc::v5::mqttbytes::QoS;
use serde_json::json;
use suez_mqtt::config::MqttSection;
use suez_mqtt::protocol::{RefreshCommand, TopicSet};
use suez_mqtt::transport::mqtt::MqttClient;
use tokio::time::{sleep, Duration};

#[derive(Parser)]
#[command(
    name = "suez-refresh",
    about = "Ask a running suez-mqtt bridge to refresh its data"
)]
struct Args {
    /// Data window to fetch: daily, monthly or history
    #[arg(long, default_value = "daily")]
    mode: RefreshCommand,

    /// Send the bare mode literal instead of a JSON object
    #[arg(long)]
    plain: bool,

    /// Topic prefix of the bridge
    #[arg(long, env = "MQTT_TOPIC", default_value = "water")]
    prefix: String,

    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker_url: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value = "1883")]
    broker_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

fn refresh_payload(mode: RefreshCommand, plain: bool) -> Vec<u8> {
    if plain {
        mode.as_str().as_bytes().to_vec()
    } else {
        json!({ "mode": mode }).to_string().into_bytes()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let section = MqttSection {
        host: args.broker_url.clone(),
        port: args.broker_port,
        username: args.username,
        password: args.password,
        topic_prefix: args.prefix.clone(),
        ..MqttSection::default()
    };

    println!(
        "Connecting to MQTT broker {}:{}...",
        args.broker_url, args.broker_port
    );
    let mut client = MqttClient::new("suez-refresh", section);
    if let Err(e) = client.connect().await {
        eprintln!("✗ Could not connect: {e}");
        std::process::exit(1);
    }

    let topic = TopicSet::new(&args.prefix).refresh();
    let payload = refresh_payload(args.mode, args.plain);

    println!("\n📤 Requesting {} refresh on {topic}", args.mode);
    client
        .publish(&topic, payload, QoS::AtLeastOnce, false)
        .await?;
    println!("✓ Refresh requested");

    // Brief pause to allow message delivery
    sleep(Duration::from_millis(500)).await;
    client.disconnect().await?;

    println!("\n💡 Results appear on:");
    for suffix in ["data", "status", "error"] {
        println!("   {}/{suffix}", TopicSet::new(&args.prefix).prefix());
    }

    Ok(())
}
