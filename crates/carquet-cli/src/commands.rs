use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context};
use carquet_car::CarWriter;
use carquet_columnar::{BucketEntry, BucketStatus, BundleReader};
use carquet_ingest::{IngestConfig, Ingestor};
use carquet_types::Cid;
use colored::Colorize;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Convert(args) => cmd_convert(args, format),
        Command::Get(args) => cmd_get(args, format),
        Command::List(args) => cmd_list(args, format),
        Command::Schemas(args) => cmd_schemas(args, format),
        Command::Verify(args) => cmd_verify(args, format),
        Command::Extract(args) => cmd_extract(args, format),
    }
}

fn open_bundle(path: &Path) -> anyhow::Result<BundleReader> {
    BundleReader::open(path).with_context(|| format!("opening bundle {}", path.display()))
}

fn parse_cid(s: &str) -> anyhow::Result<Cid> {
    carquet_types::parse_cid(s).with_context(|| format!("invalid CID {s:?}"))
}

fn cmd_convert(args: ConvertArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => IngestConfig::default(),
    };
    args.apply(&mut config);
    tracing::debug!(?config, "ingest configuration");

    let report = Ingestor::new(config)
        .convert(&args.archive, &args.out)
        .with_context(|| format!("converting {}", args.archive.display()))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{} Converted {} blocks into {}",
        "✓".green().bold(),
        report.blocks.to_string().bold(),
        args.out.display()
    );
    println!("  Typed: {}", report.typed);
    println!("  Escaped: {}", report.overflowed);
    println!("  Opaque: {}", report.opaque);
    if report.unverified > 0 {
        println!("  Unverified: {}", report.unverified.to_string().yellow());
    }
    println!("  Indexed: {}", report.indexed);
    println!(
        "  Buckets: {} sealed, {} failed",
        report.succeeded.len().to_string().green(),
        report.failed.len().to_string().red()
    );
    for failure in &report.failed {
        println!("  {} bucket {}: {}", "✗".red(), failure.bucket, failure.reason);
    }
    Ok(())
}

fn cmd_get(args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reader = open_bundle(&args.bundle)?;
    let cid = parse_cid(&args.cid)?;
    let bytes = reader.get(&cid).with_context(|| format!("reading block {cid}"))?;

    if let Some(path) = &args.output {
        std::fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
        return Ok(());
    }
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "cid": cid.to_string(), "data": hex::encode(&bytes) })
        ),
        OutputFormat::Text => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_list(args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reader = open_bundle(&args.bundle)?;
    let limit = args.limit.unwrap_or(usize::MAX);
    let cids = reader.list().take(limit).map(|cid| cid.to_string());
    match format {
        OutputFormat::Json => {
            let all: Vec<String> = cids.collect();
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        OutputFormat::Text => {
            let mut stdout = std::io::stdout().lock();
            for cid in cids {
                writeln!(stdout, "{cid}")?;
            }
        }
    }
    Ok(())
}

fn status_label(bucket: &BucketEntry) -> colored::ColoredString {
    match &bucket.status {
        BucketStatus::Sealed => "sealed".green(),
        BucketStatus::Failed { .. } => "failed".red(),
        BucketStatus::Empty => "empty".dimmed(),
    }
}

fn cmd_schemas(args: SchemasArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reader = open_bundle(&args.bundle)?;
    let buckets = reader.manifest().by_population();
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
        return Ok(());
    }
    if !reader.manifest().complete {
        println!("{} bundle is incomplete", "!".yellow().bold());
    }
    for bucket in buckets {
        println!(
            "{} {}  {} rows  [{}]",
            "bucket".bold(),
            format!("{:04}", bucket.id).yellow(),
            bucket.rows,
            status_label(bucket)
        );
        println!("  Signature: {} ({})", bucket.label, bucket.signature_id.dimmed());
        for column in &bucket.columns {
            println!("    {}: {}", column.name, column.ty.to_string().cyan());
        }
        if bucket.escaped > 0 {
            println!("  Escaped: {}", bucket.escaped);
        }
        if let Some(example) = &bucket.example {
            println!("  Example: {}", example.to_string().dimmed());
        }
        if let BucketStatus::Failed { reason } = &bucket.status {
            println!("  Reason: {}", reason.red());
        }
    }
    Ok(())
}

fn cmd_verify(args: VerifyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reader = open_bundle(&args.bundle)?;
    let report = reader.verify_all();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            if report.is_ok() {
                println!(
                    "{} Verified {} blocks",
                    "✓".green().bold(),
                    report.checked.to_string().bold()
                );
            }
            for failure in &report.failures {
                let cid = failure
                    .cid
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "  {} bucket {} {}: {}",
                    "✗".red(),
                    failure.bucket,
                    cid,
                    failure.reason
                );
            }
        }
    }
    if !report.is_ok() {
        bail!("{} verification failures", report.failures.len());
    }
    Ok(())
}

/// CIDs from a list file: one per line, blank lines and `#` comments
/// skipped.
fn read_cid_list(path: &Path) -> anyhow::Result<Vec<Cid>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_cid)
        .collect()
}

fn cmd_extract(args: ExtractArgs, format: OutputFormat) -> anyhow::Result<()> {
    let reader = open_bundle(&args.bundle)?;
    let cids = read_cid_list(&args.cids)?;
    if cids.is_empty() {
        bail!("{} lists no CIDs", args.cids.display());
    }

    // Build the archive beside its destination and move it into place only
    // once every block has been read back.
    let parent = match args.out.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("creating temporary file in {}", parent.display()))?;
    let file = tokio::fs::File::from_std(tmp.as_file().try_clone()?);
    let mut writer = CarWriter::new(tokio::io::BufWriter::new(file), &cids)?;
    for cid in &cids {
        let bytes = reader.get(cid).with_context(|| format!("reading block {cid}"))?;
        writer.write_block(cid, &bytes)?;
    }
    drop(writer.finish()?);
    tmp.as_file().sync_all()?;
    tmp.persist(&args.out)
        .with_context(|| format!("writing {}", args.out.display()))?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "out": args.out.display().to_string(), "blocks": cids.len() })
        ),
        OutputFormat::Text => println!(
            "{} Extracted {} blocks into {}",
            "✓".green().bold(),
            cids.len().to_string().bold(),
            args.out.display()
        ),
    }
    Ok(())
}
