use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build {
        /// Include the btleplug radio backend
        #[arg(long)]
        ble: bool,
    },
    /// Run the test suite
    Test,
    /// Provision the simulated gateway end to end
    Sim,
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { ble } => {
            println!("Building project...");
            if *ble {
                cargo(&["build", "--workspace", "--features", "gatebind-cli/ble"], "Build")?;
            } else {
                cargo(&["build", "--workspace"], "Build")?;
            }
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Sim => {
            println!("Running simulated provisioning...");
            cargo(
                &[
                    "run", "-p", "gatebind-cli", "--", "provision", "--backend", "sim", "--list-wifi",
                    "--ssid", "HomeNet", "--password", "hunter22",
                ],
                "Simulation",
            )?;
        }
    }

    Ok(())
}
