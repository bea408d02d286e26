use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use phcsync::{
    clock::ClockRegistry,
    reference::Reference,
    servo::PiServo,
    sync::ratio::{RatioOutcome, RatioSync},
    time::Duration,
    SyncOrchestrator,
};
use phcsync_linux::{
    bus::{Sja1105, Spidev},
    clock::{LinuxOpener, LinuxPhc, SystemRealtime},
    config::{BusConfig, Config, ReferenceConfig, DEFAULT_CONFIG_PATH},
    observer,
    poller::LinuxPoller,
    ports::{self, PortStateUpdate},
    setup_logger,
};
use tokio::sync::{mpsc, watch};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Configuration file to use
    #[clap(long = "config", short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the log level of the configuration file
    #[clap(long = "log-level", short = 'l')]
    log_level: Option<log::LevelFilter>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::from_file(&args.config).await?;
    let level = args
        .log_level
        .or_else(|| config.log_level())
        .unwrap_or(log::LevelFilter::Info);
    setup_logger(level)?;

    if !config.check() {
        return Err(format!("invalid configuration in {}", args.config.display()).into());
    }

    log::info!("Starting phcsync with {} source(s)", config.sources.len());

    let pi = config.servo.pi();
    let lock = config.servo.lock();
    let make_servo = move |device: &mut LinuxPhc| PiServo::for_device(pi, lock, device);

    let mut opener = LinuxOpener::default();
    let mut registry = ClockRegistry::new();

    let reference = match &config.reference {
        ReferenceConfig::Generic { utc_offset } => Reference::Generic {
            clock: SystemRealtime,
            utc_offset: Duration::from_secs(*utc_offset),
        },
        ReferenceConfig::Phc { device } => {
            let clock = registry.get_or_create(&mut opener, device, make_servo)?;
            log::info!("Using {device} as the reference clock");
            Reference::Phc { clock }
        }
    };

    let mut orchestrator = SyncOrchestrator::new(config.sync, registry, reference, make_servo);

    for source in &config.sources {
        orchestrator.add_source(&mut opener, source.clone())?;
    }

    for port in &config.ports {
        orchestrator.add_port(&mut opener, port.number, &port.device, port.state)?;
    }

    orchestrator.arm()?;
    let mut poller = LinuxPoller::new(orchestrator.source_devices())?;

    let (clocks_sender, clocks_receiver) = watch::channel(observer::observe_clocks(&orchestrator));
    observer::spawn(&config.observability(), clocks_receiver);

    let (port_sender, mut port_updates) = mpsc::channel(16);
    if let Some(path) = config.port_state_path.clone() {
        ports::spawn(path, port_sender);
    }

    if let Some(bus) = &config.bus {
        spawn_bus_sync(bus, &opener)?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    while !shutdown.load(Ordering::Relaxed) {
        while let Ok(PortStateUpdate { port, state }) = port_updates.try_recv() {
            if !orchestrator.port_state_changed(port, state) {
                log::warn!("Ignoring state {state:?} of unknown port {port}");
            }
        }

        if let Err(error) = orchestrator.run_cycle(&mut poller).await {
            log::error!("Synchronization cycle failed: {error}");
            tokio::time::sleep(config.sync.poll_timeout()).await;
        }

        clocks_sender.send_replace(observer::observe_clocks(&orchestrator));
    }

    orchestrator.shutdown();
    log::info!("Stopped");

    Ok(())
}

/// Steer the switch clock behind the management bus to its reference clock,
/// once every sync period
fn spawn_bus_sync(
    config: &BusConfig,
    opener: &LinuxOpener,
) -> Result<(), Box<dyn std::error::Error>> {
    let (path, _) = opener.resolve(&config.reference)?;
    let reference = LinuxPhc::open(&path)?;
    let spi = Spidev::open(&config.spi_device, config.spi_speed_hz)?;
    let sync = RatioSync::new(Sja1105::new(spi), config.ratio);

    log::info!(
        "Steering the switch on {} to {}",
        config.spi_device.display(),
        path.display()
    );

    tokio::spawn(bus_sync(sync, reference, config.ratio.sync_period()));
    Ok(())
}

async fn bus_sync(
    mut sync: RatioSync<Sja1105<Spidev>>,
    mut reference: LinuxPhc,
    period: std::time::Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        // bus transactions block, keep them off the event loop
        let task = tokio::task::spawn_blocking(move || {
            let result = sync.sync(&reference);
            (sync, reference, result)
        });

        let result;
        (sync, reference, result) = match task.await {
            Ok(done) => done,
            Err(error) => {
                log::error!("Switch clock task failed: {error}");
                return;
            }
        };

        match result {
            Ok(RatioOutcome::Adjusted { offset, ratio, .. }) => {
                log::debug!("switch clock offset {offset}, ratio {:#010x}", ratio.bits());
            }
            Ok(RatioOutcome::Skipped {
                reset_requested, ..
            }) => {
                if reset_requested {
                    log::warn!("Switch clock is far off, resetting it");
                }
            }
            Err(error) => log::error!("Switch clock sync failed: {error}"),
        }
    }
}

async fn wait_for_shutdown(shutdown: Arc<AtomicBool>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate.recv() => {},
    }

    log::info!("Shutting down after the current cycle");
    shutdown.store(true, Ordering::Relaxed);

    Ok(())
}
