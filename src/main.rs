use clap::Parser;
use log::{error, info};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use violin_drive::config::Profile;
use violin_drive::device_sim::SimDevice;
use violin_drive::link::{DeviceEvent, DeviceLink};
use violin_drive::performer::{PerformOptions, Performer, Phrase};

#[derive(Parser)]
#[command(name = "violin-drive")]
#[command(about = "Motion planner and streamer for a robotic violin")]
struct Cli {
    /// Phrase file: JSON with "pitches" and "envelope" arrays
    phrase: PathBuf,

    /// Instrument profile JSON (defaults to the built-in lab violin)
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Drive the real device instead of the in-process simulator
    #[arg(long)]
    hardware: bool,

    /// Device IP address (hardware mode)
    #[arg(long, default_value = "192.168.4.1")]
    device: String,

    /// Tonic the phrase was recorded in (MIDI note number)
    #[arg(long)]
    phrase_tonic: Option<f64>,

    /// Envelope compression factor, 0..1
    #[arg(long, default_value_t = 0.0)]
    compression: f64,

    /// Blend in from the robot's current position
    #[arg(long)]
    transition: bool,

    /// Lift the finger on open-string notes
    #[arg(long)]
    open_strings: bool,
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let profile = match &cli.profile {
        Some(path) => Profile::from_json_file(path)?,
        None => Profile::default(),
    };
    let phrase: Phrase = serde_json::from_str(&fs::read_to_string(&cli.phrase)?)?;
    info!(
        "phrase: {} ticks ({:.2} s)",
        phrase.pitches.len(),
        phrase.pitches.len() as f64 * profile.tick_duration()
    );

    // Without --hardware the firmware emulator runs in-process and the
    // whole protocol goes over loopback.
    let listener = std::net::TcpListener::bind(("0.0.0.0", profile.device_port))?;
    let (sim, device_addr) = if cli.hardware {
        (None, format!("{}:{}", cli.device, profile.device_port).parse()?)
    } else {
        let ctrl = SocketAddr::from(([127, 0, 0, 1], profile.device_port));
        let sim = SimDevice::spawn(ctrl)?;
        let addr = sim.data_addr();
        (Some(sim), addr)
    };

    let link = DeviceLink::connect(listener, device_addr, profile.chunk_frames)?;
    let events = link.events().clone();
    let mut performer = Performer::with_link(profile, Box::new(link));

    performer.home()?;
    match events.recv() {
        Ok(DeviceEvent::Ready) => info!("robot ready"),
        Ok(DeviceEvent::Restart) => return Err("device restarted during homing".into()),
        Err(_) => return Err("device link closed".into()),
    }

    let options = PerformOptions {
        phrase_tonic: cli.phrase_tonic,
        add_transition: cli.transition,
        release_open_strings: cli.open_strings,
        amplitude_compression: cli.compression,
        ..Default::default()
    };
    let command = performer.perform(&phrase, &options)?;
    info!("queued {} frames", command.len());

    performer.terminate()?;
    if let Some(sim) = sim {
        sim.join();
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_simulator() {
        let cli = Cli::try_parse_from(["violin-drive", "phrase.json"]).unwrap();
        assert!(!cli.hardware);
    }

    #[test]
    fn test_cli_hardware_flag_selects_device() {
        let cli =
            Cli::try_parse_from(["violin-drive", "phrase.json", "--hardware", "--device", "10.0.0.2"])
                .unwrap();
        assert!(cli.hardware);
        assert_eq!(cli.device, "10.0.0.2");
    }
}
