use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use facetrack_hw::Camera;
use serde_json::Value;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.facetrack.Tracker1",
    default_service = "org.facetrack.Tracker1",
    default_path = "/org/facetrack/Tracker1"
)]
trait Tracker {
    fn list_identities(&self) -> zbus::Result<String>;
    fn identity(&self, name: &str) -> zbus::Result<String>;
    fn list_tracks(&self) -> zbus::Result<String>;
    fn current_faces(&self) -> zbus::Result<String>;
    fn promote(&self, track_id: u32, name: &str, description: &str, photo_path: &str) -> zbus::Result<String>;
    fn edit_identity(
        &self,
        name: &str,
        new_name: &str,
        set_description: bool,
        new_description: &str,
        photo_path: &str,
    ) -> zbus::Result<String>;
    fn delete_identity(&self, name: &str) -> zbus::Result<()>;
    fn set_track_description(&self, track_id: u32, description: &str) -> zbus::Result<()>;
    fn set_draw_landmarks(&self, enabled: bool) -> zbus::Result<()>;
    fn rescan(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facetrack", about = "Manage the facetrack face gallery and inspect live tracks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// List confirmed identities
    List,
    /// Show one identity
    Show { name: String },
    /// Faces in the most recent frame
    Current,
    /// Provisional tracks (Unknown_N)
    Tracks,
    /// Promote a track to a named identity
    Promote {
        /// Track id (the N of Unknown_N)
        track_id: u32,
        /// Name for the identity (default: Unknown_N)
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Photo to store instead of the track's last crop
        #[arg(short, long)]
        photo: Option<PathBuf>,
    },
    /// Rename an identity or change its description or photo
    Edit {
        name: String,
        #[arg(long)]
        rename: Option<String>,
        /// New description; an empty string clears it
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        photo: Option<PathBuf>,
    },
    /// Delete an identity and its stored photo and embedding
    Delete { name: String },
    /// Set a track's description before promotion
    Describe { track_id: u32, description: String },
    /// Toggle landmark points in render output
    Landmarks { state: Toggle },
    /// Re-scan the data directory for added photos
    Rescan,
    /// Show daemon status
    Status,
    /// List V4L2 capture devices (no daemon needed)
    Cameras,
    /// Capture one frame from a camera (no daemon needed)
    Test {
        #[arg(default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn print_identities(raw: &str) -> Result<()> {
    let identities: Vec<Value> = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    if identities.is_empty() {
        println!("No identities stored");
        return Ok(());
    }
    for identity in &identities {
        let id = identity.get("id").and_then(Value::as_u64).unwrap_or(0);
        let description = str_field(identity, "description").replace('\n', " / ");
        println!("{id:>4}  {:<24} {description}", str_field(identity, "name"));
    }
    Ok(())
}

fn print_faces(raw: &str) -> Result<()> {
    let faces: Vec<Value> = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    if faces.is_empty() {
        println!("No faces in view");
        return Ok(());
    }
    for face in &faces {
        let known = face.get("known").and_then(Value::as_bool).unwrap_or(false);
        let marker = if known { "known" } else { "track" };
        println!("{marker:<6} {:<24} {}", str_field(face, "label"), str_field(face, "description"));
    }
    Ok(())
}

fn print_tracks(raw: &str) -> Result<()> {
    let tracks: Vec<Value> = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    if tracks.is_empty() {
        println!("No provisional tracks");
        return Ok(());
    }
    for track in &tracks {
        let id = track.get("id").and_then(Value::as_u64).unwrap_or(0);
        println!("{id:>4}  {:<16} {}", str_field(track, "name"), str_field(track, "description"));
    }
    Ok(())
}

fn path_arg(path: Option<PathBuf>) -> Result<String> {
    match path {
        Some(p) => {
            // The daemon resolves paths in its own working directory.
            let absolute = std::fs::canonicalize(&p).with_context(|| format!("cannot access {}", p.display()))?;
            Ok(absolute.to_string_lossy().into_owned())
        }
        None => Ok(String::new()),
    }
}

async fn connect() -> Result<TrackerProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    TrackerProxy::new(&connection)
        .await
        .context("facetrackd is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cameras => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for device in devices {
                println!("{:<14} {} ({}, {})", device.path, device.name, device.driver, device.bus);
            }
            return Ok(());
        }
        Commands::Test { device, width, height } => {
            let camera = Camera::open(&device, width, height)?;
            let frame = camera.capture_frame()?;
            println!(
                "{device}: {}x{} {:?}, frame #{} brightness {:.1}{}",
                frame.width,
                frame.height,
                camera.pixel_format(),
                frame.sequence,
                frame.avg_brightness(),
                if frame.is_dark { " (dark)" } else { "" }
            );
            return Ok(());
        }
        _ => {}
    }

    let tracker = connect().await?;
    match cli.command {
        Commands::List => print_identities(&tracker.list_identities().await?)?,
        Commands::Show { name } => print_json(&tracker.identity(&name).await?)?,
        Commands::Current => print_faces(&tracker.current_faces().await?)?,
        Commands::Tracks => print_tracks(&tracker.list_tracks().await?)?,
        Commands::Promote {
            track_id,
            name,
            description,
            photo,
        } => {
            let photo = path_arg(photo)?;
            let raw = tracker
                .promote(
                    track_id,
                    name.as_deref().unwrap_or(""),
                    description.as_deref().unwrap_or(""),
                    &photo,
                )
                .await?;
            print_json(&raw)?;
        }
        Commands::Edit {
            name,
            rename,
            description,
            photo,
        } => {
            let photo = path_arg(photo)?;
            let raw = tracker
                .edit_identity(
                    &name,
                    rename.as_deref().unwrap_or(""),
                    description.is_some(),
                    description.as_deref().unwrap_or(""),
                    &photo,
                )
                .await?;
            print_json(&raw)?;
        }
        Commands::Delete { name } => {
            tracker.delete_identity(&name).await?;
            println!("Deleted {name}");
        }
        Commands::Describe { track_id, description } => {
            tracker.set_track_description(track_id, &description).await?;
        }
        Commands::Landmarks { state } => {
            tracker.set_draw_landmarks(matches!(state, Toggle::On)).await?;
        }
        Commands::Rescan => print_json(&tracker.rescan().await?)?,
        Commands::Status => print_json(&tracker.status().await?)?,
        Commands::Cameras | Commands::Test { .. } => unreachable!("handled without the daemon"),
    }

    Ok(())
}
