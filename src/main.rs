mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use inputhub::device::{enumerate_event_nodes, EvdevDevice, EvdevProvider, RawDeviceHandle};
use inputhub::{DeviceAdapter, DeviceId, DeviceRegistry, InputConfig, LogicalDevice, Reactor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::List { dir } => list_devices(&dir),
        Commands::Run {
            config,
            frames,
            rate,
        } => run(config, frames, rate),
    }
}

fn list_devices(dir: &Path) -> Result<()> {
    let nodes = enumerate_event_nodes(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    for path in nodes {
        let device = match EvdevDevice::open(&path) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("{}: {}", path.display(), e);
                continue;
            }
        };
        let handle = RawDeviceHandle::from_device(Box::new(device));
        let identity = handle.identity();
        let caps = handle.capabilities();
        println!(
            "{}  {:04x}:{:04x} v{:04x}  \"{}\"{}",
            path.display(),
            identity.vendor,
            identity.product,
            identity.version,
            identity.name,
            identity
                .serial
                .as_deref()
                .map(|s| format!(" serial={}", s))
                .unwrap_or_default()
        );
        println!(
            "    keys={} abs={} rel={} sync={} ff={}",
            caps.keys.count(),
            caps.abs_axes.count(),
            caps.rel_axes.count(),
            caps.has_sync(),
            caps.force_feedback.count()
        );
    }
    Ok(())
}

fn run(config_path: Option<PathBuf>, max_frames: Option<u64>, rate: u32) -> Result<()> {
    if rate == 0 {
        bail!("--rate must be at least 1");
    }
    let path = config_path.unwrap_or_else(InputConfig::default_path);
    let config = InputConfig::load(&path)?;

    let reactor = Reactor::start().context("Failed to start input reactor")?;
    let provider = EvdevProvider::default();
    let mut registry = DeviceRegistry::new();

    for adapter_config in &config.adapters {
        match DeviceAdapter::open(adapter_config, &provider, &reactor) {
            Ok(mut adapter) => {
                adapter.set_change_listener(|device, change| {
                    log::trace!("{:?}: {:?}", device, change)
                });
                registry.attach_adapter(adapter);
            }
            Err(e) => log::error!("Adapter '{}' not available: {}", adapter_config.name, e),
        }
    }
    if registry.num_input_devices() == 0 {
        bail!("No configured device could be opened");
    }

    let period = Duration::from_secs_f64(1.0 / rate as f64);
    let mut last: HashMap<DeviceId, LogicalDevice> = HashMap::new();
    let mut pass = 0u64;

    while max_frames.map_or(true, |max| pass < max) {
        let started = Instant::now();
        if registry.update_input_devices() > 0 {
            for (id, device) in registry.input_devices() {
                if last.get(&id) != Some(device) {
                    log::info!(
                        "{}: buttons={:?} valuators={:?}",
                        device.name(),
                        device.buttons(),
                        device
                            .valuators()
                            .iter()
                            .map(|v| format!("{:.3}", v))
                            .collect::<Vec<_>>()
                    );
                    last.insert(id, device.clone());
                }
            }
        }
        pass += 1;
        if let Some(remaining) = period.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    registry.shutdown();
    Ok(())
}
