//! Frame feed simulator - synthetic CCTV traffic for the frames channel
//!
//! Stands in for a camera source: publishes synthetic encoded frames at a
//! fixed FPS, with the share of bright bytes following a slow wave so the
//! detector downstream reports a rising and falling crowd. Loops until
//! interrupted unless a frame count is given.
//!
//! Usage:
//!   cargo run --bin feed-sim -- --fps 25 --frames 500

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Period of the synthetic crowd wave, in frames
const CROWD_WAVE_FRAMES: f64 = 600.0;

#[derive(Parser, Debug)]
#[command(name = "feed-sim")]
#[command(about = "Synthetic CCTV frame publisher for local testing")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    /// Frames channel to publish on
    #[arg(long, default_value = "cctv/frames")]
    channel: String,

    /// Frames per second
    #[arg(long, default_value = "25.0")]
    fps: f64,

    /// Number of frames to publish (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    frames: u64,

    /// Synthetic frame payload size in bytes
    #[arg(long, default_value = "4096")]
    frame_bytes: usize,
}

/// Build one synthetic frame: a JPEG-like header followed by luminance
/// bytes whose bright share tracks the crowd wave.
fn synth_frame(seq: u64, len: usize) -> Vec<u8> {
    let crowd = 0.5 + 0.5 * (seq as f64 / CROWD_WAVE_FRAMES * std::f64::consts::TAU).sin();
    let mut rng = rand::rng();

    let mut frame = Vec::with_capacity(len + 4);
    frame.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
    for _ in 0..len {
        if rng.random_bool(crowd) {
            frame.push(rng.random_range(0xC8..=0xFF));
        } else {
            frame.push(rng.random_range(0x00..=0x78));
        }
    }
    frame
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();

    let client_id = format!("feed-sim-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, &args.mqtt_host, args.mqtt_port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("feed_connected");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "feed_mqtt_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let frame_interval = Duration::from_secs_f64(1.0 / args.fps.max(0.1));
    info!(
        channel = %args.channel,
        fps = %args.fps,
        frame_bytes = %args.frame_bytes,
        "feed_started"
    );

    let mut published = 0u64;
    loop {
        let frame = synth_frame(published, args.frame_bytes);
        client.publish(args.channel.as_str(), QoS::AtMostOnce, false, frame).await?;
        published += 1;

        if args.frames > 0 && published >= args.frames {
            break;
        }
        tokio::time::sleep(frame_interval).await;
    }

    info!(published = %published, "feed_complete");
    Ok(())
}
