use std::io::Write;
use std::path::Path;

use anyhow::Context;
use media_attachments::{
    on_record_deleted, AttachOptions, Attachable, Attachment, AttachmentValue, CommitReport, NoopUnitOfWork,
    StoreManager, TransactionScope,
};
use media_core::{human_size, MediaConfig};
use serde_json::json;

use crate::cli::*;

pub async fn run_command(cli: Cli, config: &MediaConfig) -> anyhow::Result<()> {
    let manager = StoreManager::from_config(&config.attachments);
    match cli.command {
        Command::Attach(args) => cmd_attach(manager, args, &cli.format).await,
        Command::Open(args) => cmd_open(manager, args, &cli.format).await,
        Command::Locate(args) => cmd_locate(manager, args, &cli.format),
        Command::Delete(args) => cmd_delete(manager, args, &cli.format).await,
    }
}

fn read_record(path: &Path) -> anyhow::Result<Attachment> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing attachment record {}", path.display()))
}

async fn cmd_attach(manager: StoreManager, args: AttachArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let attachment_type = args.kind.attachment_type();
    let options = AttachOptions {
        content_type: args.content_type,
        original_filename: args.filename,
        store_id: args.store,
        ..AttachOptions::new()
    };
    let source = Attachable::from(args.source);

    let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork)?;
    let attachment = manager
        .scope(async {
            StoreManager::current()?
                .attach(&attachment_type, source, options)
                .await
        })
        .await??;
    tx.commit().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&attachment)?),
        OutputFormat::Text => {
            println!("key:          {}", attachment.key);
            println!("path:         {}", attachment.path());
            println!("content type: {}", attachment.content_type.as_deref().unwrap_or("-"));
            println!("length:       {}", human_size(attachment.length));
            println!("url:          {}", manager.locate(&attachment)?);
        }
    }
    Ok(())
}

/// Raw content goes to stdout; with `--output` a short summary is printed instead
async fn cmd_open(manager: StoreManager, args: OpenArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let attachment = read_record(&args.record)?;
    let data = manager.open(&attachment).await?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &data).with_context(|| format!("writing {}", path.display()))?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    json!({ "path": path.display().to_string(), "length": data.len() })
                ),
                OutputFormat::Text => {
                    eprintln!("wrote {} to {}", human_size(data.len() as u64), path.display())
                }
            }
        }
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

fn cmd_locate(manager: StoreManager, args: RecordArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let attachment = read_record(&args.record)?;
    let url = manager.locate(&attachment)?;
    println!("{}", render_locate(format, &attachment, &url));
    Ok(())
}

async fn cmd_delete(manager: StoreManager, args: RecordArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let attachment = read_record(&args.record)?;

    let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork)?;
    on_record_deleted(&manager, &AttachmentValue::Single(attachment))?;
    let report = tx.commit().await?;

    println!("{}", render_delete(format, &report));
    Ok(())
}

fn render_locate(format: &OutputFormat, attachment: &Attachment, url: &str) -> String {
    match format {
        OutputFormat::Json => json!({ "key": attachment.key, "url": url }).to_string(),
        OutputFormat::Text => url.to_string(),
    }
}

fn render_delete(format: &OutputFormat, report: &CommitReport) -> String {
    match format {
        OutputFormat::Json => json!({ "deleted": report.deleted }).to_string(),
        OutputFormat::Text => report
            .deleted
            .iter()
            .map(|path| format!("deleted {}", path))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
