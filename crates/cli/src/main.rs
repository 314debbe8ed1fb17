use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use loadgen::{
    BackendKind, ControlPlane, FailurePolicy, Generator, LoadgenConfig, LoopbackControlPlane, MediaCache,
    MediaKind, MediaLibrary, SessionReport, SessionSpec,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "media-loadgen",
    version,
    about = "Synthetic RTP audio/video traffic generator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Show more log messages.
    #[arg(long, short, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Show less log messages.
    #[arg(long, short, action = ArgAction::Count, global = true)]
    quiet: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run sessions against the built-in loopback media server.
    Session(SessionArgs),
    /// Stream media straight to an RTP receiver, without signaling.
    Send(SendArgs),
}

#[derive(Args)]
struct StreamArgs {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raw A-law audio file.
    #[arg(long)]
    audio_file: Option<PathBuf>,

    /// H.264 Annex B elementary stream.
    #[arg(long)]
    video_file: Option<PathBuf>,

    /// Stream audio instead of video.
    #[arg(long)]
    audio: bool,

    /// Seconds to stream per session.
    #[arg(long, default_value_t = 10)]
    run_time: u64,

    /// Replay the media file once it runs out.
    #[arg(long = "loop")]
    looping: bool,

    /// RTP transport: udp or tcp.
    #[arg(long, default_value = "udp")]
    backend: BackendKind,

    /// First port of the local RTP port range.
    #[arg(long)]
    port_start: Option<u16>,

    /// End of the local RTP port range (exclusive).
    #[arg(long)]
    port_end: Option<u16>,
}

#[derive(Args)]
struct SessionArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// Number of concurrent sessions.
    #[arg(long, default_value_t = 1)]
    sessions: usize,

    /// Media graph description sent with each session.
    #[arg(long, default_value = "")]
    graph: String,

    /// Start and stop the server-side recorder around each session.
    #[arg(long)]
    record: bool,

    /// Stop every session as soon as one fails.
    #[arg(long)]
    abort_on_failure: bool,
}

#[derive(Args)]
struct SendArgs {
    #[command(flatten)]
    stream: StreamArgs,

    /// Receiver address (ip:port).
    #[arg(long)]
    remote: SocketAddr,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let outcome = match cli.command {
        Command::Session(args) => run_sessions(args),
        Command::Send(args) => run_direct(args),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!(error = %e, "media-loadgen failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8, quiet: u8) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        ..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        2.. => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("loadgen={level},media_loadgen={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Load configuration and media, apply flag overrides.
fn build_generator(args: &StreamArgs) -> loadgen::Result<(Generator, MediaKind)> {
    let mut config = match &args.config {
        Some(path) => LoadgenConfig::from_file(path)?,
        None => LoadgenConfig::default(),
    };
    if let Some(port) = args.port_start {
        config.port_start = port;
    }
    if let Some(port) = args.port_end {
        config.port_end = port;
    }
    config.validate()?;
    tracing::debug!(?config, "using configuration");

    let mut media = MediaLibrary::default();
    if let Some(path) = &args.audio_file {
        media = media.with_audio(MediaCache::load(path)?);
    }
    if let Some(path) = &args.video_file {
        media = media.with_video(MediaCache::load(path)?);
    }

    let kind = if args.audio { MediaKind::Audio } else { MediaKind::Video };
    media.get(kind)?;
    Ok((Generator::new(config, media), kind))
}

fn spec_for(args: &StreamArgs, instance_id: String, kind: MediaKind) -> SessionSpec {
    SessionSpec::new(instance_id, kind)
        .run_time(Duration::from_secs(args.run_time))
        .looping(args.looping)
        .backend(args.backend)
}

fn run_sessions(args: SessionArgs) -> loadgen::Result<bool> {
    let (generator, kind) = build_generator(&args.stream)?;
    let loopback = Arc::new(LoopbackControlPlane::new(generator.config().local_ip));
    let control: Arc<dyn ControlPlane> = loopback.clone();

    let specs: Vec<SessionSpec> = (0..args.sessions)
        .map(|i| {
            spec_for(&args.stream, format!("loadgen-{i}"), kind)
                .graph(args.graph.clone())
                .record(args.record)
        })
        .collect();
    let policy = if args.abort_on_failure {
        FailurePolicy::AbortAll
    } else {
        FailurePolicy::Continue
    };

    let results = generator.run_fleet(&control, &specs, policy);
    let mut all_ok = true;
    for (spec, result) in specs.iter().zip(results) {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => {
                all_ok = false;
                println!("{:<12} FAILED  {e}", spec.instance_id);
            }
        }
    }
    println!("control events received: {}", loopback.events_received());
    Ok(all_ok)
}

fn run_direct(args: SendArgs) -> loadgen::Result<bool> {
    let (generator, kind) = build_generator(&args.stream)?;
    let spec = spec_for(&args.stream, "loadgen-direct".to_string(), kind);
    let report = generator.send_direct(&spec, args.remote)?;
    print_report(&report);
    Ok(true)
}

fn print_report(report: &SessionReport) {
    println!(
        "{:<12} session {}  units {}  packets {}  bytes {}  write failures {}",
        report.instance_id, report.session_id, report.units_sent, report.packets, report.bytes, report.write_failures
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_session_flags() {
        let cli = Cli::try_parse_from([
            "media-loadgen",
            "session",
            "--audio",
            "--audio-file",
            "a.alaw",
            "--sessions",
            "4",
            "--loop",
            "--backend",
            "tcp",
            "--abort-on-failure",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Session(args) = cli.command else {
            panic!("expected session command");
        };
        assert_eq!(args.sessions, 4);
        assert!(args.stream.audio && args.stream.looping && args.abort_on_failure);
        assert_eq!(args.stream.backend, BackendKind::Tcp);
        assert_eq!(args.stream.run_time, 10);
    }

    #[test]
    fn zero_port_start_is_rejected() {
        let cli = Cli::try_parse_from(["media-loadgen", "session", "--port-start", "0"]).unwrap();
        let Command::Session(args) = cli.command else {
            panic!("expected session command");
        };
        assert!(matches!(
            build_generator(&args.stream),
            Err(loadgen::LoadgenError::Config(_))
        ));
    }

    #[test]
    fn send_requires_remote() {
        assert!(Cli::try_parse_from(["media-loadgen", "send"]).is_err());
        let cli = Cli::try_parse_from(["media-loadgen", "send", "--remote", "127.0.0.1:5004"]).unwrap();
        let Command::Send(args) = cli.command else {
            panic!("expected send command");
        };
        assert_eq!(args.remote.port(), 5004);
    }
}
