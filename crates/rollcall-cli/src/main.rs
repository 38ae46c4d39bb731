use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates the async `RollcallProxy` used below.
#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn run(&self) -> zbus::Result<()>;
    async fn stop(&self) -> zbus::Result<String>;
    async fn verify_admin(&self) -> zbus::Result<String>;
    async fn drop_admin(&self) -> zbus::Result<bool>;
    async fn list_admins(&self) -> zbus::Result<String>;
    async fn add_admin(&self, person_id: &str) -> zbus::Result<bool>;
    async fn remove_admin(&self, person_id: &str) -> zbus::Result<bool>;
    async fn report(&self) -> zbus::Result<String>;
    async fn enroll(&self, person_id: &str) -> zbus::Result<String>;
    async fn revoke(&self, person_id: &str) -> zbus::Result<u32>;
    async fn persons(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start taking attendance from the camera
    Run,
    /// Stop the attendance run (or cancel an admin check) and print the summary
    Stop,
    /// Verify an administrator's face, unlocking admin commands for a while
    Admin {
        /// Give up the current admin grant instead
        #[arg(long)]
        drop: bool,
    },
    /// Manage the admin roster
    Roster {
        #[command(subcommand)]
        action: RosterAction,
    },
    /// Print all attendance records (admin)
    Report,
    /// Re-read one person's enrollment images (admin)
    Enroll {
        /// Person id (dataset directory name)
        person: String,
    },
    /// Remove a person from the in-memory gallery (admin)
    Revoke { person: String },
    /// List enrolled persons
    Persons,
    /// Reload the whole gallery from the dataset directory
    Reload,
    /// Show daemon status
    Status,
    /// List capture devices (bypasses the daemon)
    Devices {
        /// Grab one frame from this device and save it as PNG
        #[arg(long, value_name = "DEVICE")]
        capture: Option<String>,
        /// Output path for --capture
        #[arg(long, default_value = "rollcall-frame.png")]
        output: PathBuf,
    },
}

#[derive(Subcommand)]
enum RosterAction {
    /// List administrators
    List,
    /// Grant admin rights to an enrolled person
    Add { person: String },
    /// Revoke admin rights
    Remove { person: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { capture, output } => devices(capture.as_deref(), &output),
        command => daemon_command(command).await,
    }
}

async fn daemon_command(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match command {
        Commands::Run => {
            proxy.run().await?;
            println!("Attendance run started. Use `rollcall stop` to end it.");
        }
        Commands::Stop => {
            let summary = proxy.stop().await?;
            print_json(&summary)?;
        }
        Commands::Admin { drop: true } => {
            if proxy.drop_admin().await? {
                println!("Admin grant dropped");
            } else {
                println!("No admin grant was held");
            }
        }
        Commands::Admin { drop: false } => {
            println!("Look at the camera...");
            let outcome = tokio::select! {
                outcome = proxy.verify_admin() => outcome?,
                _ = tokio::signal::ctrl_c() => {
                    proxy.stop().await?;
                    bail!("verification cancelled");
                }
            };
            print_outcome(&outcome)?;
        }
        Commands::Roster { action } => match action {
            RosterAction::List => {
                let admins: Vec<String> = serde_json::from_str(&proxy.list_admins().await?)?;
                if admins.is_empty() {
                    println!("No administrators configured");
                }
                for admin in admins {
                    println!("{admin}");
                }
            }
            RosterAction::Add { person } => {
                if proxy.add_admin(&person).await? {
                    println!("{person} is now an administrator");
                } else {
                    println!("{person} is already an administrator");
                }
            }
            RosterAction::Remove { person } => {
                if proxy.remove_admin(&person).await? {
                    println!("{person} removed from the roster");
                } else {
                    println!("{person} was not on the roster");
                }
            }
        },
        Commands::Report => {
            let records: Vec<serde_json::Value> = serde_json::from_str(&proxy.report().await?)?;
            println!("Name,Time,Date");
            for r in &records {
                println!(
                    "{},{},{}",
                    r["person_id"].as_str().unwrap_or_default(),
                    r["time"].as_str().unwrap_or_default(),
                    r["date"].as_str().unwrap_or_default()
                );
            }
        }
        Commands::Enroll { person } => {
            let report: serde_json::Value = serde_json::from_str(&proxy.enroll(&person).await?)?;
            println!(
                "{person}: {} embeddings from {} images",
                report["embeddings"], report["images"]
            );
            if report["embeddings"] == 0 {
                println!("warning: no face found; {person} cannot be recognized");
            }
        }
        Commands::Revoke { person } => {
            let removed = proxy.revoke(&person).await?;
            println!("{person}: {removed} embeddings removed");
        }
        Commands::Persons => print_json(&proxy.persons().await?)?,
        Commands::Reload => print_json(&proxy.reload().await?)?,
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Devices { .. } => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_outcome(raw: &str) -> Result<()> {
    let outcome: serde_json::Value = serde_json::from_str(raw)?;
    match outcome["outcome"].as_str() {
        Some("verified") => println!(
            "Verified as {}",
            outcome["person_id"].as_str().unwrap_or("?")
        ),
        Some("timed_out") => bail!("verification timed out"),
        Some("cancelled") => bail!("verification cancelled"),
        _ => print_json(raw)?,
    }
    Ok(())
}

fn devices(capture: Option<&str>, output: &Path) -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for d in &devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    if let Some(device) = capture {
        tracing::debug!(device, "capturing diagnostic frame");
        let mut camera = rollcall_hw::Camera::open(device)?;
        camera.warm_up(4);
        let frame = camera.capture_frame()?;
        println!(
            "Captured {}x{} frame, average brightness {:.1}",
            frame.width,
            frame.height,
            frame.avg_brightness()
        );
        let image = frame
            .into_image()
            .context("frame buffer does not match its dimensions")?;
        image
            .save(output)
            .with_context(|| format!("saving {}", output.display()))?;
        println!("Saved {}", output.display());
    }
    Ok(())
}
