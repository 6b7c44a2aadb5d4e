//! Provisioning tool for smart-LED controllers
//!
//! Sends WiFi credentials and backend IDs over BLE, then claims the device
//! on the backend.

use clap::{Args, Parser, Subcommand};
use smartled_provision::backend::{resolve_location, BackendApi, ClaimRequest, LocationChoice, RestBackend};
use smartled_provision::gatt::DeviceCommand;
use smartled_provision::identity::{MacAddress, ProofOfPossession};
use smartled_provision::scan::ScanMode;
use smartled_provision::session::{
    NetworkCredentials, ProvisionRequest, ProvisioningSession, RetryPoint, SessionState,
};
use smartled_provision::settings::{self, ProvisionSettings};
use smartled_provision::{logging, tlog, BtleplugTransport};
use std::error::Error;
use std::path::PathBuf;

type CliResult<T> = Result<T, Box<dyn Error>>;
type Session = ProvisioningSession<BtleplugTransport, RestBackend>;

#[derive(Parser)]
#[command(name = "smartled_cli")]
#[command(about = "BLE provisioning tool for smart-LED controllers")]
struct Cli {
    /// Settings file (default: <config dir>/smartled/provision.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Also write logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Login {
    /// Account email, used when SMARTLED_API_TOKEN is not set
    #[arg(long, requires = "password_login")]
    email: Option<String>,
    /// Account password
    #[arg(long, requires = "email")]
    password_login: Option<String>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Room {
    /// Existing room id
    #[arg(long)]
    room_id: Option<i64>,
    /// Room name; created if it does not exist
    #[arg(long)]
    room: Option<String>,
}

impl Room {
    fn choice(&self) -> Option<LocationChoice> {
        match (&self.room_id, &self.room) {
            (Some(id), _) => Some(LocationChoice::Id(*id)),
            (None, Some(name)) => Some(LocationChoice::Name(name.clone())),
            (None, None) => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby LED controllers
    Scan,
    /// Configure a device over BLE and claim it
    Provision {
        /// WiFi network name; omit to keep the device's current network
        #[arg(long, requires = "password")]
        ssid: Option<String>,
        /// WiFi password
        #[arg(long, requires = "ssid")]
        password: Option<String>,
        #[command(flatten)]
        room: Room,
        /// Device name (default: "Smart LED XXXX")
        #[arg(long)]
        name: Option<String>,
        /// Peripheral id or name to connect to (default: first match)
        #[arg(long)]
        device: Option<String>,
        #[command(flatten)]
        login: Login,
    },
    /// Claim an already configured device
    Claim {
        #[arg(long)]
        mac: String,
        /// Proof of possession, hex
        #[arg(long)]
        pop: String,
        #[command(flatten)]
        room: Room,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        login: Login,
    },
    /// Manage rooms
    Locations {
        #[command(subcommand)]
        action: LocationsAction,
        #[command(flatten)]
        login: Login,
    },
    /// Clear the device's stored WiFi network
    ResetWifi {
        #[arg(long)]
        device: Option<String>,
    },
    /// Erase all device settings and reboot
    FactoryReset {
        #[arg(long)]
        device: Option<String>,
    },
}

#[derive(Subcommand)]
enum LocationsAction {
    List,
    Create { name: String },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(settings::default_settings_path);
    let settings = settings::load_settings(&path)?;

    if let Some(dir) = cli.log_dir.or_else(|| settings.log_dir.as_ref().map(PathBuf::from)) {
        let log_path = logging::init_file_logging(&dir)?;
        println!("Logging to {}", log_path.display());
    }

    let result = match cli.command {
        Commands::Scan => scan(&settings).await,
        Commands::Provision {
            ssid,
            password,
            room,
            name,
            device,
            login,
        } => {
            let network = match (ssid, password) {
                (Some(ssid), Some(password)) => Some(NetworkCredentials { ssid, password }),
                _ => None,
            };
            let request = ProvisionRequest {
                network,
                location: room.choice(),
                device_name: name,
            };
            provision(&settings, &login, request, device.as_deref()).await
        }
        Commands::Claim {
            mac,
            pop,
            room,
            name,
            login,
        } => claim(&settings, &login, &mac, &pop, &room, name).await,
        Commands::Locations { action, login } => locations(&settings, &login, action).await,
        Commands::ResetWifi { device } => {
            maintenance(&settings, DeviceCommand::ClearWifi, device.as_deref()).await
        }
        Commands::FactoryReset { device } => {
            maintenance(&settings, DeviceCommand::FactoryReset, device.as_deref()).await
        }
    };

    logging::stop_file_logging();
    result
}

async fn backend(settings: &ProvisionSettings, login: &Login) -> CliResult<RestBackend> {
    let mut backend = RestBackend::new(&settings.backend_url)?.with_token(settings.api_token.clone());
    if let (Some(email), Some(password)) = (&login.email, &login.password_login) {
        backend.login(email, password).await?;
    }
    if !backend.has_token() {
        return Err(format!(
            "Not logged in: set {} or pass --email and --password-login",
            settings::ENV_API_TOKEN
        )
        .into());
    }
    Ok(backend)
}

async fn session(settings: &ProvisionSettings, backend: RestBackend, device: Option<&str>) -> CliResult<Session> {
    // A named target needs the full match list
    let mode = if device.is_some() {
        ScanMode::Collect
    } else {
        ScanMode::FirstMatch
    };
    let transport = BtleplugTransport::new().await?;
    let session = ProvisioningSession::new(transport, backend, settings.session_config(mode));

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tlog!("[cli] Ctrl-C, cancelling");
            cancel.cancel();
        }
    });
    Ok(session)
}

/// Scan and leave the session `Ready` on the requested (or first) device.
async fn connect(session: &mut Session, device: Option<&str>) -> CliResult<()> {
    println!("Scanning for devices...");
    let found = session.start_scan().await?.to_vec();

    if let Some(wanted) = device {
        let target = found
            .iter()
            .find(|p| p.id == wanted || p.name.as_deref() == Some(wanted))
            .ok_or_else(|| format!("Device '{wanted}' not found ({} other match(es))", found.len()))?;
        session.connect(&target.id).await?;
    } else if *session.state() != SessionState::Ready {
        return Err(session.status_text().into());
    }

    println!("{}", session.status_text());
    Ok(())
}

async fn scan(settings: &ProvisionSettings) -> CliResult<()> {
    let backend = RestBackend::new(&settings.backend_url)?;
    let transport = BtleplugTransport::new().await?;
    let mut session = ProvisioningSession::new(transport, backend, settings.session_config(ScanMode::Collect));

    println!("Scanning for {} seconds...", settings.scan_window_secs);
    let found = session.start_scan().await?;
    println!("\nFound {} device(s):", found.len());
    for p in found {
        let rssi = p.rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", p.display_name(), p.id, rssi);
    }
    Ok(())
}

async fn provision(
    settings: &ProvisionSettings,
    login: &Login,
    request: ProvisionRequest,
    device: Option<&str>,
) -> CliResult<()> {
    let backend = backend(settings, login).await?;
    let mut session = session(settings, backend, device).await?;
    connect(&mut session, device).await?;

    match session.read_identity().await {
        Ok(identity) => {
            if let Some(mac) = &identity.mac {
                println!("Device MAC: {mac}");
            }
        }
        Err(e) => println!("Warning: {e}"),
    }

    println!("Sending configuration...");
    match session.submit(request).await {
        Ok(record) => {
            println!("Device registered: id {}", record.id);
            Ok(())
        }
        Err(e) => {
            println!("{}", session.status_text());
            if let SessionState::Failed(failure) = session.state() {
                if failure.retry_point() == RetryPoint::Claiming {
                    print_claim_hint(&session);
                }
            }
            Err(e.into())
        }
    }
}

fn print_claim_hint(session: &Session) {
    let identity = session.identity();
    if let (Some(mac), Some(pop), Some(linkage)) = (&identity.mac, &identity.pop, session.linkage()) {
        println!("The device is configured. To retry the claim:");
        println!(
            "  smartled_cli claim --mac {mac} --pop {} --room-id {}",
            pop.to_hex(),
            linkage.location_id
        );
    }
}

async fn claim(
    settings: &ProvisionSettings,
    login: &Login,
    mac: &str,
    pop: &str,
    room: &Room,
    name: Option<String>,
) -> CliResult<()> {
    let mac: MacAddress = mac.parse()?;
    let pop = ProofOfPossession::from_hex(pop)?;
    let choice = room.choice().ok_or("Pass --room-id or --room")?;

    let backend = backend(settings, login).await?;
    let location_id = resolve_location(&backend, &choice).await?;
    let request = ClaimRequest {
        mac_address: mac.to_string(),
        proof_of_possession: pop.to_hex(),
        location_id,
        name: name.unwrap_or_else(|| mac.default_device_name()),
    };
    let record = backend.claim_device(&request).await?;
    println!("Device registered: id {}", record.id);
    Ok(())
}

async fn locations(settings: &ProvisionSettings, login: &Login, action: LocationsAction) -> CliResult<()> {
    let backend = backend(settings, login).await?;
    match action {
        LocationsAction::List => {
            let rooms = backend.list_locations().await?;
            if rooms.is_empty() {
                println!("No rooms yet. Create one with `locations create <name>`.");
            }
            for room in rooms {
                println!("{:>6}  {}", room.id, room.name);
            }
        }
        LocationsAction::Create { name } => {
            let room = backend.create_location(name.trim()).await?;
            println!("Created room {} ({})", room.name, room.id);
        }
    }
    Ok(())
}

async fn maintenance(settings: &ProvisionSettings, command: DeviceCommand, device: Option<&str>) -> CliResult<()> {
    // BLE-only; the backend is never contacted
    let backend = RestBackend::new(&settings.backend_url)?;
    let mut session = session(settings, backend, device).await?;
    connect(&mut session, device).await?;
    session.send_command(command).await?;
    println!("Sent {command:?}");
    session.reset().await;
    Ok(())
}
