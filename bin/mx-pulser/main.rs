use chrono::Utc;
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use mx_pulser::config::{load_config_or_default, AppConfig, PulserConfig};
use mx_pulser::{
    plot_waveform, CallbackLoop, Clock, EventLogger, EventRecorder, Job, MonotonicClock,
    PulseCount, PulseTrainJob, SoftBench, TrainSummary, TransitionEvent,
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Software pulse generator bench
#[derive(Parser, Debug)]
#[command(name = "mx-pulser")]
#[command(about = "Run an emulated pulse generator against soft hardware", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Pulser to run (default: the first configured)
    #[arg(short, long, value_name = "NAME")]
    pulser: Option<String>,

    /// Advance the train from busy polls instead of timer callbacks
    #[arg(long)]
    poll: bool,

    /// Number of pulses, -1 runs until Ctrl+C
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    num_pulses: Option<i64>,

    /// Pulse width in seconds
    #[arg(short, long)]
    width: Option<f64>,

    /// Pulse period in seconds
    #[arg(long)]
    period: Option<f64>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,

    /// Skip the waveform plot at the end
    #[arg(long)]
    no_plot: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or(config.logging.log_level.clone());
    initialize_logging(&log_level)?;

    if args.poll {
        config.callback.enabled = false;
    }
    if config.pulsers.is_empty() {
        warn!("No pulsers configured, using the demo pulser");
        config.pulsers.push(PulserConfig::demo());
    }
    log_startup_info(&config, args.config.as_deref());

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    let (sender, receiver) = unbounded::<TransitionEvent>();
    let recorder = if config.logging.transition_log {
        Some(start_transition_log(&config, receiver)?)
    } else {
        None
    };
    let sink = recorder.is_some().then_some(sender);
    let mut bench = SoftBench::build(&config, clock.clone(), sink)?;

    let callbacks = config
        .callback
        .enabled
        .then(|| CallbackLoop::new(clock.clone()));
    bench.registry.open_all(callbacks.as_ref())?;
    let master_timer = callbacks
        .as_ref()
        .map(|loop_| loop_.spawn_master_timer(config.callback.tick()));

    let name = match &args.pulser {
        Some(name) => name.clone(),
        None => config.pulsers[0].name().to_string(),
    };
    apply_overrides(&mut bench, &name, &args)?;

    let shutdown_flag = setup_shutdown_handler()?;

    let result = {
        let mut job = PulseTrainJob::new(&mut bench.registry, &name)?
            .with_shutdown(shutdown_flag.clone());
        if let Some(loop_) = &callbacks {
            job = job.with_callbacks(loop_);
        }
        job.run(Duration::from_secs(args.timeout_secs))
    };

    drop(master_timer);
    if let Err(e) = bench.registry.stop_all() {
        error!("Failed to stop all pulsers: {}", e);
    }

    if let Some(recorder) = recorder {
        let count = recorder.finish()?;
        info!("Recorded {} transitions", count);
    }

    if !args.no_plot {
        plot_pulser_output(&bench, &config, &name, clock.now().as_secs_f64());
    }

    report(result)
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== MX Pulser ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults"),
    }
    info!(
        "Update mode: {}",
        if config.callback.enabled {
            format!("callback every {} ms", config.callback.interval_ms)
        } else {
            "poll".to_string()
        }
    );
    for pulser in &config.pulsers {
        let settings = pulser.settings();
        info!(
            "Pulser '{}': width {} s, period {} s, pulses {:?}",
            settings.name, settings.pulse_width, settings.pulse_period, settings.num_pulses
        );
    }
}

/// Push command line timing overrides into the selected pulser
fn apply_overrides(
    bench: &mut SoftBench,
    name: &str,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    let pulser = bench.registry.by_name_mut(name)?;
    if let Some(period) = args.period {
        pulser.set_pulse_period(period)?;
    }
    if let Some(width) = args.width {
        pulser.set_pulse_width(width)?;
    }
    if let Some(count) = args.num_pulses {
        pulser.set_num_pulses(PulseCount::try_from(count)?)?;
    }
    Ok(())
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping pulse train...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Write transitions to a JSONL file in the background while the train runs
fn start_transition_log(
    config: &AppConfig,
    receiver: Receiver<TransitionEvent>,
) -> Result<EventRecorder, Box<dyn std::error::Error>> {
    let path = create_log_file_path(&config.logging.log_path)?;
    let logger = EventLogger::new(path, config.logging.buffer_size, false);
    info!("Transition log: {}", logger.path().display());
    Ok(EventRecorder::spawn(receiver, logger))
}

fn plot_pulser_output(bench: &SoftBench, config: &AppConfig, name: &str, end: f64) {
    let output = config.pulsers.iter().find_map(|pulser| match pulser {
        PulserConfig::Doutput { settings, output, .. } if settings.name == name => Some(output),
        _ => None,
    });
    let Some(output) = output else {
        info!("Pulser '{}' has no digital output to plot", name);
        return;
    };
    let Some(edges) = bench.output_waveform(output) else {
        return;
    };
    let title = format!("'{}' on output '{}'", name, output);
    if let Err(e) = plot_waveform(&edges, end, Some(&title), None, None) {
        warn!("Could not plot waveform: {}", e);
    }
}

fn report(
    result: Result<TrainSummary, mx_pulser::MxError>,
) -> Result<(), Box<dyn std::error::Error>> {
    match result {
        Ok(summary) if summary.interrupted => {
            info!(
                "✓ '{}' stopped by user after {:.3} s",
                summary.pulser, summary.elapsed_s
            );
            Ok(())
        }
        Ok(summary) => {
            info!(
                "✓ '{}' finished its pulse train in {:.3} s",
                summary.pulser, summary.elapsed_s
            );
            Ok(())
        }
        Err(e) => {
            error!("✗ Pulse train failed: {}", e);
            Err(e.into())
        }
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);

    fs::create_dir_all(&history_dir)?;

    let filename = format!("transitions_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}
