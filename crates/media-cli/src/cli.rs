use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use media_attachments::AttachmentType;

#[derive(Parser)]
#[command(name = "media", about = "Attach, read and remove stored media files", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for records and reports
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file or URL and print its attachment record
    Attach(AttachArgs),
    /// Write the content of an attachment record to stdout or a file
    Open(OpenArgs),
    /// Print the public URL of an attachment record
    Locate(RecordArgs),
    /// Delete the content of an attachment record
    Delete(RecordArgs),
}

#[derive(Args)]
pub struct AttachArgs {
    /// Local path or http(s) URL
    pub source: String,
    #[arg(long)]
    pub content_type: Option<String>,
    #[arg(long, value_enum, default_value = "attachment")]
    pub kind: KindArg,
    /// Name recorded as the original filename
    #[arg(long)]
    pub filename: Option<String>,
    /// Registered store name instead of the default
    #[arg(long)]
    pub store: Option<String>,
}

#[derive(Args)]
pub struct OpenArgs {
    /// Attachment record as JSON
    pub record: PathBuf,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct RecordArgs {
    /// Attachment record as JSON
    pub record: PathBuf,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum KindArg {
    Attachment,
    File,
    Image,
    Thumbnail,
}

impl KindArg {
    pub fn attachment_type(self) -> AttachmentType {
        match self {
            Self::Attachment => AttachmentType::attachment(),
            Self::File => AttachmentType::file(),
            Self::Image => AttachmentType::image(),
            Self::Thumbnail => AttachmentType::thumbnail(),
        }
    }
}
