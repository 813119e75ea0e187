// Interactive check that the beam profiler can be reached and measured.

extern crate tlbp2_control;
use log::{info, warn};

use std::io::{self, BufRead, Write};
use tlbp2_control::{ProcessError, Session, SessionConfig, SessionError, TransportError};

const BANNER_WIDTH: usize = 50;
const DOTNET_DOWNLOAD_URL: &str = "https://dotnet.microsoft.com/download/dotnet/3.1";
const VENDOR_SOFTWARE_URL: &str =
    "https://www.thorlabs.com/software_pages/ViewSoftwarePage.cfm?Code=Beam";

fn main() {
    // Load or ignore .env file
    let _ = dotenvy::dotenv();

    tlbp2_control::logging::init_logger();
    tlbp2_control::logging::init_crash_logger();

    if let Ok(dsn) = std::env::var("TLBP2_SENTRY_DSN") {
        let environment = std::env::var("SENTRY_ENVIRONMENT").ok();
        if tlbp2_control::logging::init_sentry(Some(&dsn), environment.as_deref()) {
            info!("[INIT] Sentry monitoring initialized - Environment: {:?}", environment);
        }
    } else {
        info!("[INIT] Sentry monitoring disabled (no TLBP2_SENTRY_DSN configured)");
    }

    let mut config = match SessionConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!("[INIT] Could not load config, using defaults: {}", e);
            SessionConfig::default()
        }
    };
    if std::env::var_os("TLBP2_DEBUG").is_some() {
        config.debug_mode = true;
    }

    full_initialization(&config);

    tlbp2_control::logging::shutdown_sentry();
}

fn full_initialization(config: &SessionConfig) {
    println!("{}", "=".repeat(BANNER_WIDTH));
    println!("{}TLBP2 INITIALIZATION", " ".repeat(15));
    println!("{}", "=".repeat(BANNER_WIDTH));

    println!("Howdy!\n");
    println!(
        "This procedure will ensure that the Thorlabs Beam Profiler is ready to be used with this library."
    );
    println!(
        "\nThe library requires .NET Core, as it runs a C# server in the\n\
         background to control the beam profiler:"
    );
    println!("     {}", DOTNET_DOWNLOAD_URL);

    let stdin = io::stdin();
    let mut input = stdin.lock();

    loop {
        print!("Attempting to connect to the beam profiler...");
        let _ = io::stdout().flush();

        match check_device(config) {
            Ok(()) => {
                println!("connection successful!");
                break;
            }
            Err(e) => {
                println!("connection failed!");
                println!("{}", failure_reason(&e));
                report_unexpected(&e);
            }
        }

        println!("\nSince the beam profiler could not be reached, please follow these diagnostic steps:");
        println!("     1. Make sure that the beam profiler is plugged into the computer");
        println!("     2. Make sure that the beam profiler is detected by the manufacturer software:");
        println!("          {}", VENDOR_SOFTWARE_URL);
        println!(
            "\nOnce you have gone through these steps, you may type 'retry' to attempt connection again\n\
             or 'exit' to exit the initialization procedure."
        );

        print!(">>> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) if line.trim() == "exit" => return,
            Ok(_) => continue,
        }
    }

    println!("Initialization complete!");
}

/// Connect, take one measurement and disconnect again.
fn check_device(config: &SessionConfig) -> Result<(), SessionError> {
    let mut session = Session::new(config.clone())?;

    session.connect().into_result()?;

    match session.measurement()? {
        Some(record) => info!("[INIT] Test measurement: {} fields", record.len()),
        None => warn!("[INIT] Test measurement returned no data"),
    }

    session.disconnect()?;
    Ok(())
}

fn failure_reason(error: &SessionError) -> String {
    match error {
        SessionError::ConnectTimeout(timeout) => format!(
            "The background server did not open the pipe within {} seconds.",
            timeout.as_secs()
        ),
        SessionError::NotReady { profiler_state } => format!(
            "The beam profiler drum is not spinning stably yet (state {}).",
            profiler_state
        ),
        SessionError::Process(ProcessError::Spawn { path, .. }) => format!(
            "The background server could not be launched from {}.",
            path.display()
        ),
        SessionError::Transport(TransportError::ChannelCreation { name, .. }) => format!(
            "The pipe '{}' is already in use; is another instance running?",
            name
        ),
        other => format!("Unexpected error: {}", other),
    }
}

/// Errors outside the usual device-not-ready cases go to the crash log.
fn report_unexpected(error: &SessionError) {
    match error {
        SessionError::ConnectTimeout(_)
        | SessionError::NotReady { .. }
        | SessionError::Process(ProcessError::Spawn { .. })
        | SessionError::Transport(TransportError::ChannelCreation { .. }) => {}
        other => {
            tlbp2_control::logging::capture_critical_error("Initialization", &other.to_string())
        }
    }
}
