use anyhow::{Context, Result};
use clap::Parser;
use humansize::{format_size, DECIMAL};
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use supervisor::{
    args::build as build_args,
    config::load_file,
    status::{ProgressSnapshot, StateTag, StatusEvent},
    DependencyPaths, EncodeOptions, JobEvent, JobRegistry, SupervisorConfig,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Run one av1an encode under supervision.
///
/// Ctrl-C cancels the encode. On unix SIGUSR1 pauses it and SIGUSR2 resumes it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Encode options (JSON or TOML)
    #[arg(short, long)]
    options: PathBuf,

    /// Dependency locations (JSON or TOML)
    #[arg(short, long)]
    deps: Option<PathBuf>,

    /// Supervisor configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the av1an command line and exit
    #[arg(long)]
    print_args: bool,

    /// Print status events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pause,
    Resume,
}

#[cfg(unix)]
struct Controls {
    pause: tokio::signal::unix::Signal,
    resume: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Controls {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            pause: signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?,
            resume: signal(SignalKind::user_defined2()).context("Failed to listen for SIGUSR2")?,
        })
    }

    async fn next(&mut self) -> Control {
        tokio::select! {
            _ = self.pause.recv() => Control::Pause,
            _ = self.resume.recv() => Control::Resume,
        }
    }
}

#[cfg(not(unix))]
struct Controls;

#[cfg(not(unix))]
impl Controls {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Control {
        std::future::pending().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins, otherwise info (debug with --verbose)
    let mut logger = env_logger::Builder::from_default_env();
    if args.verbose {
        logger.filter_level(LevelFilter::Debug);
    } else if std::env::var_os("RUST_LOG").is_none() {
        logger.filter_level(LevelFilter::Info);
    }
    logger.format_timestamp_secs().init();

    let cfg = SupervisorConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    let options: EncodeOptions = load_file(&args.options)
        .with_context(|| format!("Failed to load encode options: {}", args.options.display()))?;
    let deps: DependencyPaths = match &args.deps {
        Some(path) => load_file(path)
            .with_context(|| format!("Failed to load dependency paths: {}", path.display()))?,
        None => DependencyPaths::default(),
    };

    if args.print_args {
        println!("{} {}", cfg.av1an_bin.display(), build_args(&options).display_line());
        return Ok(());
    }

    info!("Supervisor starting");
    info!("  av1an: {}", cfg.av1an_bin.display());
    info!("  Input: {}", options.input.display());
    info!("  Output: {}", options.output.display());
    if let Some(temp) = options.temp_dir() {
        info!("  Temp: {}", temp.display());
    }

    let registry = JobRegistry::new(cfg);
    let job = registry.create(options, deps);
    let mut events = job.subscribe();
    let mut controls = Controls::new()?;

    let mut runner = {
        let job = job.clone();
        tokio::spawn(async move { job.start().await })
    };

    let outcome = loop {
        tokio::select! {
            result = &mut runner => break result,
            event = events.recv() => match event {
                Ok(event) => report(&event, args.json),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} status event(s)", skipped),
                Err(RecvError::Closed) => {}
            },
            interrupt = tokio::signal::ctrl_c() => {
                if let Err(e) = interrupt {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                warn!("Interrupted, cancelling job {}", job.id());
                job.cancel().await;
            }
            control = controls.next() => match control {
                Control::Pause => job.pause().await,
                Control::Resume => {
                    if let Err(e) = job.resume().await {
                        error!("Resume failed: {}", e);
                    }
                }
            },
        }
    };

    loop {
        match events.try_recv() {
            Ok(event) => report(&event, args.json),
            Err(TryRecvError::Lagged(skipped)) => warn!("Skipped {} status event(s)", skipped),
            Err(_) => break,
        }
    }

    outcome
        .context("Supervisor task failed")?
        .with_context(|| format!("Encode of {} failed", job.options().input.display()))?;

    match job.latest_state() {
        Some(StateTag::Done) => {
            let written = std::fs::metadata(&job.options().output)
                .map(|m| format_size(m.len(), DECIMAL))
                .unwrap_or_else(|_| "unknown size".to_string());
            info!("✅ Encode finished: {} ({})", job.options().output.display(), written);
        }
        Some(StateTag::Cancelled) => info!("Encode cancelled"),
        other => warn!("Encode ended in state {:?}", other),
    }
    Ok(())
}

fn report(event: &JobEvent, json: bool) {
    let JobEvent::Status(event) = event else {
        return;
    };
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize status event: {}", e),
        }
        return;
    }
    describe(event);
}

fn describe(event: &StatusEvent) {
    if let Some(failure) = &event.error {
        error!("❌ {:?}: {}", event.state, failure.message);
        return;
    }
    match &event.progress {
        Some(progress) => info!("📊 {:?}: {}", event.state, progress_line(progress)),
        None => info!("➡️  {:?}", event.state),
    }
}

fn progress_line(progress: &ProgressSnapshot) -> String {
    let mut line = format!(
        "{}/{} frames, {} written",
        progress.frames_completed,
        progress.total_frames,
        format_size(progress.bytes_completed, DECIMAL)
    );
    if let Some(fps) = progress.frames_per_second {
        line.push_str(&format!(", {:.2} fps", fps));
    }
    if let Some(bitrate) = progress.bitrate {
        line.push_str(&format!(", {:.0} kbps", bitrate / 1000.0));
    }
    if let Some(seconds) = progress.estimated_seconds {
        line.push_str(&format!(", ETA {}", clock(seconds)));
    }
    if let Some(size) = progress.estimated_size_in_bytes {
        line.push_str(&format!(", ~{} total", format_size(size as u64, DECIMAL)));
    }
    line
}

fn clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, total % 3600 / 60, total % 60)
}
