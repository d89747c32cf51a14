//! `beamline-ctl`: headless operator tool for the ion-source beamline.
//!
//! ```bash
//! # Ramp the ionizer to 10 A at the configured rate, Ctrl-C forces it to zero
//! beamline-ctl ramp --target 10
//!
//! # Visit two stepper positions, 30 s at the first, 5 new files at the second
//! beamline-ctl sequence --positions wheel.txt --step "Target A:0:30s" --step "Blank:250:5files"
//!
//! # Sweep the magnet 1 A -> 5 A in 0.1 A steps, one step per second, at most 40 V
//! beamline-ctl scan --start 1 --stop 5 --increment 0.1 --voltage 40
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use beamline_ctl::config::{Backend, LogFormat, Settings, SocketEndpoint};
use beamline_ctl::counter::{ArtifactCounter, EventCounter, ManualCounter};
use beamline_ctl::failsafe::{restore_failsafe, FailsafeStore, FileFailsafeStore, MemoryFailsafeStore};
use beamline_ctl::hardware::{
    nodes, AsciiDialect, AsciiSocketChannel, ChannelArbiter, Command, HardwareChannel, MockChannel,
};
use beamline_ctl::ramp::per_minute;
use beamline_ctl::safety::AlwaysConfirm;
use beamline_ctl::scan::ScanPlan;
use beamline_ctl::sequencer::positions::{build_steps, load_positions, Selection};
use beamline_ctl::sequencer::{Axis, Motion, SequencerTiming};
use beamline_ctl::{
    logging, BoundedRamp, Confirmer, ControlActor, ControlHandle, GuardedAction,
    Indicator, RampOutcome, SafetyPolicy, SequenceHandle, SequenceOutcome, SequenceStep, StepSequencer,
    TriggerGate, TriggerSpec,
};
use clap::{Parser, Subcommand};
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Ionizer ramping, stepper sequencing and magnet control
#[derive(Parser, Debug)]
#[command(name = "beamline-ctl", version)]
#[command(about = "Safety-bounded ramps and trigger-gated step sequences for the beamline")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "config/beamline.toml")]
    config: PathBuf,

    /// Log output format, overrides the configuration
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Simulate every controller regardless of `hardware.backend`
    #[arg(long)]
    mock: bool,

    /// Answer yes to every confirmation prompt
    #[arg(long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ramp the ionizer current from its present value to a target
    Ramp {
        /// Target current in A
        #[arg(long)]
        target: f64,
        /// Rate in A per minute, defaults to `ramp.max_rate_per_minute`
        #[arg(long)]
        rate_per_min: Option<f64>,
    },
    /// Force the ionizer current to zero
    Estop,
    /// Re-apply the saved ionizer failsafe value
    Restore,
    /// Move the stepper through named positions
    Sequence {
        /// Positions file, one `name value` per line
        #[arg(long)]
        positions: PathBuf,
        /// `name:offset:trigger`, trigger as `30s` or `5files`; repeat per step
        #[arg(long = "step", required = true)]
        steps: Vec<Selection>,
        /// Repeat until Ctrl-C
        #[arg(long)]
        cyclic: bool,
    },
    /// Cycle the magnet between currents, switching on new analysis files
    Switch {
        /// Magnet current in A; repeat for each level
        #[arg(long = "current", required = true, num_args = 1..)]
        currents: Vec<f64>,
        /// Dwell per level
        #[arg(long, default_value = "5files")]
        trigger: TriggerSpec,
        /// Supply voltage limit in V, defaults to `supply.voltage_limit`
        #[arg(long)]
        voltage: Option<f64>,
    },
    /// Sweep the magnet current
    Scan {
        /// Start current in A
        #[arg(long)]
        start: f64,
        /// Stop current in A
        #[arg(long)]
        stop: f64,
        /// Signed step in A
        #[arg(long)]
        increment: f64,
        /// Time per step
        #[arg(long, default_value = "1s", value_parser = humantime_serde::re::humantime::parse_duration)]
        interval: Duration,
        /// Supply voltage limit in V, defaults to `supply.voltage_limit`
        #[arg(long)]
        voltage: Option<f64>,
    },
    /// Open the vent valve on the source chamber
    Vent,
    /// Open the valve between pump and source
    PumpValveOpen,
    /// Print the effective configuration
    ShowConfig,
}

/// Asks on the terminal. Anything but `y`/`yes` declines.
struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, action: GuardedAction, detail: &str) -> bool {
        let prompt = format!("{} ({detail}) [y/N] ", action.prompt());
        tokio::task::spawn_blocking(move || {
            print!("{prompt}");
            let _ = io::stdout().flush();
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
                Err(_) => false,
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// The three controllers.
struct Rig {
    plc: ChannelArbiter,
    stepper: ChannelArbiter,
    magnet: ChannelArbiter,
    simulated: bool,
}

async fn socket_channel(
    endpoint: &SocketEndpoint,
    dialect: AsciiDialect,
) -> Result<Arc<dyn HardwareChannel>> {
    let channel = AsciiSocketChannel::new(endpoint.address(), endpoint.timeout, dialect);
    channel
        .connect()
        .await
        .with_context(|| format!("connecting to {}", endpoint.address()))?;
    Ok(Arc::new(channel))
}

async fn build_rig(settings: &Settings, force_mock: bool) -> Result<Rig> {
    // The PLC speaks OPC UA, for which there is no client here; it is always simulated.
    let plc = Arc::new(MockChannel::new().with_actuator(
        nodes::IONIZER_CURRENT_WRITE,
        nodes::IONIZER_CURRENT_READ,
        f64::INFINITY,
    ));

    let simulated = force_mock || settings.hardware.backend == Backend::Mock;
    let (stepper, magnet): (Arc<dyn HardwareChannel>, Arc<dyn HardwareChannel>) = if simulated {
        info!("Using simulated stepper and magnet");
        (
            Arc::new(MockChannel::new().with_commanded_actuator(
                "r0xca",
                "r0x30",
                5_000.0,
                ("t", 1.0),
                ("t", 0.0),
            )),
            Arc::new(MockChannel::new().with_actuator("sour:curr", "meas:curr", 10.0)),
        )
    } else {
        warn!("PLC channel is simulated; only the stepper and magnet are live");
        (
            socket_channel(&settings.stepper, AsciiDialect::CopleyStepper).await?,
            socket_channel(&settings.magnet, AsciiDialect::ScpiSupply).await?,
        )
    };

    Ok(Rig {
        plc: ChannelArbiter::new(plc),
        stepper: ChannelArbiter::new(stepper),
        magnet: ChannelArbiter::new(magnet),
        simulated,
    })
}

fn event_counter(settings: &Settings, simulated: bool) -> Result<Arc<dyn EventCounter>> {
    if simulated {
        // One new artifact every two seconds.
        let counter = ManualCounter::new(0);
        let ticker = counter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            interval.tick().await;
            loop {
                interval.tick().await;
                ticker.advance(1);
            }
        });
        return Ok(Arc::new(counter));
    }
    Ok(Arc::new(ArtifactCounter::from_pattern(
        &settings.trigger.artifact_pattern,
    )?))
}

fn ionizer_actor(
    settings: &Settings,
    rig: &Rig,
    store: Arc<dyn FailsafeStore>,
    confirmer: Arc<dyn Confirmer>,
) -> Result<ControlHandle> {
    let limits = settings.setpoint("ionizer_current")?.clone();
    let ramp = BoundedRamp::new(nodes::IONIZER_CURRENT_WRITE, limits, store.clone());
    let actor = ControlActor::new(
        rig.plc.clone(),
        ramp,
        nodes::IONIZER_CURRENT_READ,
        store,
        confirmer,
    )
    .with_ramp_timing(
        settings.ramp.tick_interval,
        per_minute(settings.ramp.max_rate_per_minute),
    );
    let (handle, _status, _task) = actor.spawn();
    Ok(handle)
}

async fn ramp(handle: &ControlHandle, target: f64, rate_per_min: Option<f64>) -> Result<()> {
    handle
        .start_ramp(target, rate_per_min.map(per_minute))
        .await
        .context("ramp rejected")?;

    let mut snapshots = handle.watch();
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(value) = snapshot.setpoint {
                    print!("\r{value:>8.3} A -> {target} A");
                    let _ = io::stdout().flush();
                }
                if snapshot.indicator != Indicator::Ramping {
                    println!();
                    info!(indicator = ?snapshot.indicator, value = ?snapshot.setpoint, "Ramp ended");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                match handle.emergency_stop().await {
                    Ok(value) => {
                        println!("Emergency stop: forced to {value} A");
                        break;
                    }
                    Err(e) if e.is_operational() => println!("Emergency stop not applied, ramp continues"),
                    Err(e) => return Err(e).context("emergency stop failed"),
                }
            }
        }
    }
    Ok(())
}

async fn follow_sequence(mut handle: SequenceHandle) -> Result<SequenceOutcome> {
    let mut status = handle
        .take_status_stream()
        .context("sequence status already taken")?;
    let stopper = handle.stopper();
    let printer = tokio::spawn(async move {
        while let Some(s) = status.recv().await {
            match s.step_index {
                Some(i) => println!("[{}] step {i}: {}", s.state, s.detail),
                None => println!("[{}] {}", s.state, s.detail),
            }
        }
    });
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let outcome = handle.wait().await?;
    ctrl_c.abort();
    let _ = printer.await;
    Ok(outcome)
}

/// Supply voltage limit from the CLI or the configuration, bounded by the
/// `magnet_voltage` setpoint.
fn voltage_limit(settings: &Settings, requested: Option<f64>) -> Result<f64> {
    let voltage = requested.unwrap_or(settings.supply.voltage_limit);
    let limits = settings.setpoint("magnet_voltage")?;
    SafetyPolicy::new()
        .validate(limits, voltage)
        .context("voltage limit rejected")
}

fn sequencer_timing(settings: &Settings) -> SequencerTiming {
    SequencerTiming {
        poll_interval: settings.sequencer.poll_interval,
        move_timeout: settings.sequencer.move_timeout,
        tick_interval: settings.ramp.tick_interval,
    }
}

fn report(outcome: &SequenceOutcome) {
    match outcome {
        SequenceOutcome::Complete => println!("Sequence complete"),
        SequenceOutcome::Aborted { step, label, error } => {
            println!("Sequence ended at step {step} ('{label}'): {error}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&settings.application, cli.log_format);
    info!(app = %settings.application.name, config = %cli.config.display(), "Starting");

    let confirmer: Arc<dyn Confirmer> = if cli.yes {
        Arc::new(AlwaysConfirm)
    } else {
        Arc::new(StdinConfirmer)
    };
    let store: Arc<dyn FailsafeStore> = Arc::new(FileFailsafeStore::new(&settings.failsafe.path));

    if let Commands::ShowConfig = cli.command {
        print!("{}", toml::to_string_pretty(&settings)?);
        return Ok(());
    }

    let rig = build_rig(&settings, cli.mock).await?;

    match cli.command {
        Commands::Ramp {
            target,
            rate_per_min,
        } => {
            let handle = ionizer_actor(&settings, &rig, store, confirmer)?;
            let result = ramp(&handle, target, rate_per_min).await;
            handle.shutdown().await?;
            result?;
        }

        Commands::Estop => {
            let handle = ionizer_actor(&settings, &rig, store, confirmer)?;
            let result = handle.emergency_stop().await;
            handle.shutdown().await?;
            match result {
                Ok(value) => println!("Ionizer current forced to {value} A"),
                Err(e) if e.is_operational() => println!("Not applied: {e}"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Restore => {
            let limits = settings.setpoint("ionizer_current")?;
            match restore_failsafe(
                store.as_ref(),
                &SafetyPolicy::new(),
                limits,
                confirmer.as_ref(),
                &rig.plc,
                nodes::IONIZER_CURRENT_WRITE,
            )
            .await
            {
                Ok(value) => println!("Restored ionizer current to {value} A"),
                Err(e) if e.is_operational() => println!("Not applied: {e}"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Sequence {
            positions,
            steps,
            cyclic,
        } => {
            let named = load_positions(&positions)?;
            let steps = build_steps(&named, &steps)?;
            let mut axis = Axis::copley_stepper(settings.setpoint("stepper_position")?.clone());
            axis.tolerance = settings.sequencer.position_tolerance;
            let gate = TriggerGate::new(settings.trigger.poll_interval)
                .with_counter(event_counter(&settings, rig.simulated)?);
            let sequencer = StepSequencer::new(rig.stepper.clone(), axis, gate)
                .with_timing(sequencer_timing(&settings));
            let handle = if cyclic {
                sequencer.run_cyclic(&steps)?
            } else {
                sequencer.run(&steps)?
            };
            info!(run_id = %handle.id(), "Sequence running, Ctrl-C stops");
            report(&follow_sequence(handle).await?);
        }

        Commands::Switch {
            currents,
            trigger,
            voltage,
        } => {
            let axis = Axis::magnet_current(
                settings.setpoint("magnet_current")?.clone(),
                voltage_limit(&settings, voltage)?,
            );
            let steps: Vec<SequenceStep> = currents
                .iter()
                .map(|&current| SequenceStep {
                    label: format!("{current} A"),
                    target: current,
                    motion: Motion::Direct,
                    trigger,
                })
                .collect();
            let gate = TriggerGate::new(settings.trigger.poll_interval)
                .with_counter(event_counter(&settings, rig.simulated)?);
            let sequencer = StepSequencer::new(rig.magnet.clone(), axis, gate)
                .with_timing(sequencer_timing(&settings));
            let handle = sequencer.run_cyclic(&steps)?;
            info!(run_id = %handle.id(), "Current switcher running, Ctrl-C stops");
            report(&follow_sequence(handle).await?);
        }

        Commands::Scan {
            start,
            stop,
            increment,
            interval,
            voltage,
        } => {
            let plan = ScanPlan::new(start, stop, increment, interval)?;
            let ramp = BoundedRamp::new(
                "sour:curr",
                settings.setpoint("magnet_current")?.clone(),
                Arc::new(MemoryFailsafeStore::new()),
            )
            .with_follow_up(vec![Command::new("sour:volt", voltage_limit(&settings, voltage)?)]);
            let lease = rig.magnet.lease("scan")?;
            let handle = plan.begin(&ramp, lease).await?;
            let ctrl_c = {
                let handle = handle.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        handle.cancel();
                    }
                })
            };
            let outcome = handle
                .run(|tick| {
                    let percent = plan.progress_percent(tick.applied_value);
                    print!("\r{:>8.4} A  {percent:>5.1} %", tick.applied_value);
                    let _ = io::stdout().flush();
                })
                .await;
            ctrl_c.abort();
            println!();
            match outcome {
                RampOutcome::Completed { value, .. } => println!("Scan complete at {value} A"),
                RampOutcome::Cancelled { value } | RampOutcome::Forced { value } => {
                    println!("Scan stopped at {value} A")
                }
                RampOutcome::Failed(e) => return Err(e).context("scan failed"),
            }
        }

        Commands::Vent => {
            let handle = ionizer_actor(&settings, &rig, store, confirmer)?;
            let result = handle
                .guarded_write(GuardedAction::StartVenting, nodes::VENT, true)
                .await;
            handle.shutdown().await?;
            match result {
                Ok(()) => println!("Venting started"),
                Err(e) if e.is_operational() => println!("Not applied: {e}"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::PumpValveOpen => {
            let handle = ionizer_actor(&settings, &rig, store, confirmer)?;
            let result = handle
                .guarded_write(GuardedAction::OpenPumpValve, nodes::PUMP_VALVE, true)
                .await;
            handle.shutdown().await?;
            match result {
                Ok(()) => println!("Pump valve open"),
                Err(e) if e.is_operational() => println!("Not applied: {e}"),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::ShowConfig => {}
    }

    Ok(())
}
