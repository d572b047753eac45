use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetag_core::links::photo_key;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "facetag", about = "facetag CLI — upload photos, name faces, find people")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a photo and scan it for faces
    Upload {
        path: PathBuf,
        /// Object key in the photos bucket (defaults to the file name)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Scan a photo that is already in a bucket
    Notify { bucket: String, key: String },
    /// Fetch a face that has no name yet
    Next {
        /// Where to save the face image (defaults to <face_id>.jpg)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Name a face
    Name { face_id: String, name: String },
    /// List photos containing a person
    Find {
        name: String,
        /// Download the photos into this directory
        #[arg(long)]
        save_to: Option<PathBuf>,
    },
    /// Send a raw chat message and print the JSON reply
    Chat {
        text: String,
        /// Reply context token of the message being replied to
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// List the faces found in a photo
    Faces { key: String },
    /// Show daemon status
    Status,
    /// List crop tasks that were given up on
    DeadLetters,
    /// Requeue dead-lettered crop tasks
    Redrive,
}

#[zbus::proxy(
    interface = "org.freedesktop.FaceTag1",
    default_service = "org.freedesktop.FaceTag1",
    default_path = "/org/freedesktop/FaceTag1"
)]
trait FaceTag {
    async fn upload(&self, key: &str, data: Vec<u8>) -> zbus::Result<String>;
    async fn notify_upload(&self, bucket: &str, key: &str) -> zbus::Result<String>;
    async fn handle_chat(&self, message: &str) -> zbus::Result<String>;
    async fn get_face_image(&self, face_id: &str) -> zbus::Result<Vec<u8>>;
    async fn get_photo(&self, key: &str) -> zbus::Result<Vec<u8>>;
    async fn list_faces(&self, key: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_dead_letters(&self) -> zbus::Result<String>;
    async fn redrive_dead_letters(&self) -> zbus::Result<u32>;
}

/// Chat reply as sent by the daemon.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Text {
        text: String,
    },
    Photo {
        url: String,
        caption: String,
        context: String,
    },
    MediaGroup {
        caption: String,
        urls: Vec<String>,
    },
}

fn chat_message(text: &str, reply_to: Option<&str>) -> String {
    let mut message = serde_json::json!({ "text": text });
    if let Some(context) = reply_to {
        message["reply_to"] = serde_json::json!({ "context": context });
    }
    message.to_string()
}

async fn chat(proxy: &FaceTagProxy<'_>, text: &str, reply_to: Option<&str>) -> Result<Reply> {
    let raw = proxy.handle_chat(&chat_message(text, reply_to)).await?;
    serde_json::from_str(&raw).context("daemon sent an unreadable reply")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let conn = conn.context("failed to connect to D-Bus")?;
    let proxy = FaceTagProxy::new(&conn).await?;

    match cli.command {
        Commands::Upload { path, key } => {
            let key = match key {
                Some(key) => key,
                None => path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .context("cannot derive a key from the path; pass --key")?,
            };
            let data = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            tracing::debug!(key, bytes = data.len(), "uploading");
            let report: serde_json::Value =
                serde_json::from_str(&proxy.upload(&key, data).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Notify { bucket, key } => {
            let report: serde_json::Value =
                serde_json::from_str(&proxy.notify_upload(&bucket, &key).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Next { out } => match chat(&proxy, "/getface", None).await? {
            Reply::Photo {
                context,
                url,
                caption,
            } => {
                let Some(face_id) = context.strip_prefix("face:") else {
                    bail!("daemon offered a face with an unexpected context: {context}");
                };
                let bytes = proxy.get_face_image(face_id).await?;
                let out = out.unwrap_or_else(|| PathBuf::from(format!("{face_id}.jpg")));
                std::fs::write(&out, bytes)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("{caption}");
                println!("face:   {face_id}");
                println!("image:  {}", out.display());
                println!("url:    {url}");
                println!("name it with: facetag name {face_id} <name>");
            }
            Reply::Text { text } => println!("{text}"),
            Reply::MediaGroup { caption, .. } => println!("{caption}"),
        },
        Commands::Name { face_id, name } => {
            let context = format!("face:{face_id}");
            match chat(&proxy, &name, Some(&context)).await? {
                Reply::Text { text } => println!("{text}"),
                other => bail!("unexpected reply: {other:?}"),
            }
        }
        Commands::Find { name, save_to } => {
            match chat(&proxy, &format!("/find {name}"), None).await? {
                Reply::MediaGroup { caption, urls } => {
                    println!("{caption}:");
                    for url in &urls {
                        println!("  {url}");
                    }
                    if let Some(dir) = save_to {
                        std::fs::create_dir_all(&dir)?;
                        for key in urls.iter().filter_map(|u| photo_key(u)) {
                            let bytes = proxy.get_photo(&key).await?;
                            let file = dir.join(key.replace('/', "_"));
                            std::fs::write(&file, bytes)?;
                            println!("saved {}", file.display());
                        }
                    }
                }
                Reply::Text { text } => println!("{text}"),
                other => bail!("unexpected reply: {other:?}"),
            }
        }
        Commands::Chat { text, reply_to } => {
            let raw = proxy
                .handle_chat(&chat_message(&text, reply_to.as_deref()))
                .await?;
            println!("{raw}");
        }
        Commands::Faces { key } => {
            let faces: serde_json::Value = serde_json::from_str(&proxy.list_faces(&key).await?)?;
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::DeadLetters => {
            let dead: serde_json::Value =
                serde_json::from_str(&proxy.list_dead_letters().await?)?;
            println!("{}", serde_json::to_string_pretty(&dead)?);
        }
        Commands::Redrive => {
            let moved = proxy.redrive_dead_letters().await?;
            println!("requeued {moved} crop task(s)");
        }
    }

    Ok(())
}
