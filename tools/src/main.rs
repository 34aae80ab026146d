use std::{error::Error, process::ExitCode};

use clap::{Arg, ArgAction, ArgMatches, Command, error::ErrorKind};
use live_capture::{
    CaptureConfig, LiveCapture, LiveError, OutputTarget, Shutdown, config::DEFAULT_API_URL,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod progress;
#[cfg(unix)]
mod stdout_watch;

use progress::ProgressLine;

fn usage() -> String {
    [
        format!("Live Capture {}", env!("CARGO_PKG_VERSION")),
        "Intercept all data between a device and the network, seen from the network's perspective.".into(),
        "Output to a PCAP file, or pipe to another tool that can read PCAP files (like Wireshark).".into(),
        String::new(),
        "Write to file:".into(),
        "live-capture --token=a1b2c3 --sim=012345678 --filename=output.pcap".into(),
        String::new(),
        "Write to standard output:".into(),
        "live-capture --token=a1b2c3 --sim=012345678 -".into(),
        String::new(),
        "Pipe to Wireshark example:".into(),
        "live-capture --token=a1b2c3 --sim=012345678 - | wireshark -k -i -".into(),
        String::new(),
        "You need to use the ID of one or more of your SIMs, and an API token.".into(),
        String::new(),
        "If you want to listen to multiple SIMs you can supply multiple --sim params, like this: --sim=111111111 --sim=222222222".into(),
    ]
    .join("\n")
}

fn command() -> Command {
    Command::new("live-capture")
        .about("Capture live SIM traffic into a PCAP file or pipe")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .env("LIVE_CAPTURE_TOKEN")
                .hide_env_values(true)
                .help("API token used to authenticate"),
        )
        .arg(
            Arg::new("sim")
                .long("sim")
                .value_name("SIM_ID")
                .action(ArgAction::Append)
                .help("SIM id to capture, may be given more than once"),
        )
        .arg(
            Arg::new("filename")
                .long("filename")
                .value_name("PCAP")
                .help("Write the capture to this file"),
        )
        .arg(
            Arg::new("stdout")
                .value_name("-")
                .value_parser(["-"])
                .index(1)
                .help("Pass - to write the capture to standard output"),
        )
        .arg(
            Arg::new("api")
                .long("api")
                .value_name("URL")
                .env("LIVE_CAPTURE_API")
                .default_value(DEFAULT_API_URL)
                .help("Base URL of the monitoring service"),
        )
        .arg(
            Arg::new("transport")
                .long("transport")
                .value_parser(["socketio", "envelope"])
                .default_value("socketio")
                .help("Control channel transport"),
        )
        .arg(
            Arg::new("protocol")
                .long("protocol")
                .value_parser(["multi", "single"])
                .default_value("multi")
                .help("Subscription dialect spoken by the service"),
        )
        .arg(
            Arg::new("cookie")
                .long("cookie")
                .value_name("NAME")
                .help("Also send the token as this cookie (envelope transport)"),
        )
}

/// Turns parsed flags into a capture configuration, printing the reason on failure
fn build_config(matches: &ArgMatches) -> Option<CaptureConfig> {
    let token = matches.get_one::<String>("token");
    let sims: Vec<String> = matches
        .get_many::<String>("sim")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        eprintln!("{}", usage());
        return None;
    };
    if sims.iter().all(String::is_empty) {
        eprintln!("{}", usage());
        return None;
    }

    let output = match (
        matches.get_one::<String>("filename"),
        matches.contains_id("stdout"),
    ) {
        (Some(_), true) => {
            eprintln!("You need to either write to file, or to standard output. Not both.");
            return None;
        }
        (None, false) => {
            eprintln!("You need to either write to file, or to standard output.");
            return None;
        }
        (Some(path), false) => OutputTarget::File(path.into()),
        (None, true) => OutputTarget::Stdout,
    };

    match CaptureConfig::new(token, sims, output).and_then(|c| with_options(c, matches)) {
        Ok(c) => Some(c),
        Err(e) => {
            report(&e);
            None
        }
    }
}

fn with_options(
    mut config: CaptureConfig,
    matches: &ArgMatches,
) -> Result<CaptureConfig, LiveError> {
    if let Some(api) = matches.get_one::<String>("api") {
        config = config.with_api_url(api);
    }
    if let Some(transport) = matches.get_one::<String>("transport") {
        config = config.with_transport(transport.parse()?);
    }
    if let Some(protocol) = matches.get_one::<String>("protocol") {
        config = config.with_protocol(protocol.parse()?);
    }
    if let Some(cookie) = matches.get_one::<String>("cookie") {
        config = config.with_session_cookie(cookie);
    }
    Ok(config)
}

fn report(e: &LiveError) {
    if let LiveError::Authentication(_) = e {
        eprintln!("Authenticated failed. Token is incorrect");
        return;
    }
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    eprintln!("{msg}");
}

#[tokio::main]
async fn main() -> ExitCode {
    let progress = ProgressLine::new();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(progress.clone())
        .with_target(false)
        .without_time()
        .init();

    let matches = match command().try_get_matches() {
        Ok(m) => m,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
            // Nothing useful can be done if stderr itself is gone
            let _ = e.print();
            return code;
        }
    };

    let Some(config) = build_config(&matches) else {
        return ExitCode::FAILURE;
    };
    let to_stdout = config.output == OutputTarget::Stdout;

    let mut capture = match LiveCapture::from_config(config).await {
        Ok(c) => c.with_reporter(progress.clone()),
        Err(e) => {
            report(&e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupted");
                cancel.cancel();
            }
        });
    }
    #[cfg(unix)]
    if to_stdout {
        stdout_watch::spawn(cancel.clone());
    }
    #[cfg(not(unix))]
    let _ = to_stdout;

    let res = capture.run(cancel).await;
    progress.finish();

    match res {
        Ok(Shutdown::Cancelled) => {
            info!("Stopped");
            ExitCode::SUCCESS
        }
        Ok(Shutdown::OutputClosed) => {
            debug!("Output consumer closed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
