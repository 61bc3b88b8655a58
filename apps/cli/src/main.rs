mod observer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use gatebind_core::protocol::{PRODUCT_GATEWAY_SPARROW, PRODUCT_PHEASANT_S9118};
use gatebind_core::radio::MockRadio;
use gatebind_core::{
    CommandSet, ConnectOptions, MacAddress, MqttConfig, ProvisionSession, Radio, ScanCoordinator,
    SessionConfig, SessionToken,
};
use tracing::{error, info};

use crate::observer::CliObserver;

#[derive(Parser, Debug)]
#[command(author, version, about = "BLE gateway provisioning tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Radio backend
    #[arg(long, value_enum, default_value_t = Backend::Sim, global = true)]
    backend: Backend,

    /// Session configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Command numbering preset, overrides the configuration (current, legacy)
    #[arg(long, global = true)]
    commands: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List gateways in range
    Scan {
        /// Listening time in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Connect to a gateway and push its configuration
    Provision {
        #[command(flatten)]
        target: TargetArgs,

        /// Wi-Fi network name
        #[arg(long)]
        ssid: Option<String>,

        /// Wi-Fi password, empty for an open network
        #[arg(long, default_value = "", requires = "ssid")]
        password: String,

        /// MQTT broker configuration (TOML)
        #[arg(long)]
        mqtt: Option<PathBuf>,

        /// List visible networks before configuring
        #[arg(long)]
        list_wifi: bool,
    },
    /// Connect to a gateway and list the Wi-Fi networks it sees
    WifiList {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a configuration file with default values
    Init {
        #[arg(default_value = "gatebind.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Gateway MAC address; without it the first unbound gateway is used
    #[arg(long)]
    mac: Option<MacAddress>,

    /// Product: sparrow, pheasant or a numeric id (0x0D)
    #[arg(long, default_value = "sparrow", value_parser = parse_product)]
    product: u8,

    /// Token of an earlier session (32 hex digits)
    #[arg(long)]
    token: Option<SessionToken>,

    /// Connect timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl TargetArgs {
    fn connect_options(&self) -> ConnectOptions {
        let mut options = ConnectOptions::product(self.product);
        if let Some(mac) = self.mac {
            options = options.with_mac(mac);
        }
        if let Some(token) = self.token {
            options = options.with_token(token);
        }
        if let Some(secs) = self.timeout {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        options
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    /// Built-in simulated gateway
    Sim,
    /// Host Bluetooth adapter (needs the `ble` feature)
    Ble,
}

fn parse_product(s: &str) -> Result<u8, String> {
    match s.to_ascii_lowercase().as_str() {
        "sparrow" | "gateway" => Ok(PRODUCT_GATEWAY_SPARROW),
        "pheasant" | "s9118" => Ok(PRODUCT_PHEASANT_S9118),
        other => {
            let parsed = match other.strip_prefix("0x") {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => other.parse(),
            };
            parsed.map_err(|_| format!("unknown product `{s}`"))
        }
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init { path, force },
    } = &args.command
    {
        return init_config(path, *force, args.commands.as_deref());
    }

    let config = load_config(&args)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async {
        match args.backend {
            Backend::Sim => {
                info!("Using simulated gateway");
                let radio = Arc::new(MockRadio::simulated_gateway(config.commands));
                execute(radio, config, &args.command).await
            }
            Backend::Ble => open_ble(config, &args.command).await,
        }
    })
}

#[cfg(feature = "ble")]
async fn open_ble(config: SessionConfig, command: &Command) -> Result<()> {
    let radio = gatebind_core::BtleRadio::open()
        .await
        .context("failed to open Bluetooth adapter")?;
    execute(Arc::new(radio), config, command).await
}

#[cfg(not(feature = "ble"))]
async fn open_ble(_config: SessionConfig, _command: &Command) -> Result<()> {
    bail!("this build has no Bluetooth backend; rebuild with `--features ble`")
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(name) = &args.commands {
        config.commands = preset(name)?;
    }
    config.validate()?;
    Ok(config)
}

fn preset(name: &str) -> Result<CommandSet> {
    CommandSet::preset(name).with_context(|| format!("unknown command preset `{name}`"))
}

fn init_config(path: &Path, force: bool, commands: Option<&str>) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let mut config = SessionConfig::default();
    if let Some(name) = commands {
        config.commands = preset(name)?;
    }
    config.save_to_file(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

async fn execute<R: Radio + 'static>(radio: Arc<R>, config: SessionConfig, command: &Command) -> Result<()> {
    match command {
        Command::Scan { seconds } => scan(radio, &config, Duration::from_secs(*seconds)).await,
        Command::Provision {
            target,
            ssid,
            password,
            mqtt,
            list_wifi,
        } => {
            // Read the broker file before touching the radio.
            let mqtt = match mqtt {
                Some(path) => Some(
                    MqttConfig::load_from_file(path)
                        .with_context(|| format!("failed to load {}", path.display()))?,
                ),
                None => None,
            };
            let mut session = ProvisionSession::with_observer(radio, config, Arc::new(CliObserver));
            let outcome = provision(&mut session, target, ssid.as_deref(), password, mqtt.as_ref(), *list_wifi).await;
            session.disconnect().await;
            outcome
        }
        Command::WifiList { target } => {
            let mut session = ProvisionSession::with_observer(radio, config, Arc::new(CliObserver));
            let outcome = wifi_list(&mut session, target).await;
            session.disconnect().await;
            outcome
        }
        Command::Config { .. } => Ok(()),
    }
}

async fn scan<R: Radio + 'static>(radio: Arc<R>, config: &SessionConfig, duration: Duration) -> Result<()> {
    let mut scanner = ScanCoordinator::new(
        radio,
        config.profile.advertisement_service,
        config.discovery_options(),
    );
    let devices = scanner.survey(duration).await?;
    if devices.is_empty() {
        println!("No gateways found");
        return Ok(());
    }
    println!("{:<18} {:>7} {:>5} {:>5} {:>8}  NAME", "MAC", "PRODUCT", "RSSI", "BATT", "BOUND");
    for d in devices {
        println!(
            "{:<18} {:>#7x} {:>5} {:>4}% {:>8}  {}",
            d.mac.to_string(),
            d.product_id,
            d.rssi,
            d.battery_percent,
            if d.is_bound { "yes" } else { "no" },
            d.name
        );
    }
    Ok(())
}

async fn provision<R: Radio + 'static>(
    session: &mut ProvisionSession<R, CliObserver>,
    target: &TargetArgs,
    ssid: Option<&str>,
    password: &str,
    mqtt: Option<&MqttConfig>,
    list_wifi: bool,
) -> Result<()> {
    let device = session.start_connect(target.connect_options()).await?;
    println!("Connected to {} ({})", device.name, device.mac);
    if let Some(token) = session.token() {
        println!("Session token: {token}");
    }

    if list_wifi {
        print_networks(&session.list_wifi_networks().await);
    }
    if let Some(ssid) = ssid {
        if !session.set_wifi(ssid, password).await? {
            bail!("gateway rejected the Wi-Fi settings");
        }
        println!("Wi-Fi set to `{ssid}`");
    }
    if let Some(mqtt) = mqtt {
        if !session.set_mqtt(mqtt).await? {
            bail!("gateway rejected the MQTT settings");
        }
        println!("MQTT broker set to {}:{}", mqtt.host, mqtt.port);
    }
    Ok(())
}

async fn wifi_list<R: Radio + 'static>(
    session: &mut ProvisionSession<R, CliObserver>,
    target: &TargetArgs,
) -> Result<()> {
    session.start_connect(target.connect_options()).await?;
    print_networks(&session.list_wifi_networks().await);
    Ok(())
}

fn print_networks(networks: &[gatebind_core::WiFiItem]) {
    if networks.is_empty() {
        println!("No Wi-Fi networks reported");
        return;
    }
    println!("{:<32} {:>5}  SECURED", "SSID", "RSSI");
    for n in networks {
        println!(
            "{:<32} {:>5}  {}",
            n.ssid,
            n.rssi,
            if n.auth_required { "yes" } else { "no" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_product() {
        assert_eq!(parse_product("sparrow"), Ok(0x0D));
        assert_eq!(parse_product("0x5c"), Ok(0x5C));
        assert_eq!(parse_product("13"), Ok(0x0D));
        assert!(parse_product("0xZZ").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "gatebind",
            "provision",
            "--mac",
            "50:EC:50:87:96:A2",
            "--ssid",
            "HomeNet",
            "--backend",
            "sim",
        ])
        .unwrap();
        match args.command {
            Command::Provision { target, ssid, password, .. } => {
                assert_eq!(target.mac.unwrap().to_string(), "50:EC:50:87:96:A2");
                assert_eq!(target.product, PRODUCT_GATEWAY_SPARROW);
                assert_eq!(ssid.as_deref(), Some("HomeNet"));
                assert!(password.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_provision_flow() {
        let radio = Arc::new(MockRadio::simulated_gateway(CommandSet::default()));
        let mut session = ProvisionSession::with_observer(radio, SessionConfig::default(), Arc::new(CliObserver));
        let target = TargetArgs {
            mac: None,
            product: PRODUCT_GATEWAY_SPARROW,
            token: None,
            timeout: None,
        };
        provision(&mut session, &target, Some("HomeNet"), "pw", None, true)
            .await
            .unwrap();
    }
}
