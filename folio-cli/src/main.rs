use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use folio_core::{
    DocumentSession, JsonSettingsStore, RenderedPage, SettingsStore, Theme, ViewStatus,
};
use folio_render::PdfiumProvider;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "headless driver for the folio document viewer core"
)]
struct Args {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Render a page (or every page) of a document to PNG
    Render(RenderArgs),
    /// Print page count, metadata, and outline of a document
    Info(InfoArgs),
    /// List or clear the recently opened files
    Recent(RecentArgs),
}

#[derive(Debug, clap::Args)]
struct RenderArgs {
    /// Path to the PDF file
    file: PathBuf,

    /// Page to render (0-based)
    #[arg(short = 'p', long = "page", default_value_t = 0)]
    page: usize,

    /// Zoom factor applied to the page
    #[arg(short = 'z', long = "zoom")]
    zoom: Option<f32>,

    /// Fit the page width into this many pixels
    #[arg(long = "fit-width", value_name = "PX", conflicts_with = "zoom")]
    fit_width: Option<u32>,

    /// Fit the whole page into a viewport
    #[arg(
        long = "fit-page",
        value_name = "WIDTHxHEIGHT",
        value_parser = parse_viewport,
        conflicts_with_all = ["zoom", "fit_width"]
    )]
    fit_page: Option<Viewport>,

    /// Brightness between 0.1 and 2.0 (1.0 is neutral)
    #[arg(short = 'b', long = "brightness")]
    brightness: Option<f32>,

    /// Render with the dark theme
    #[arg(long = "dark", conflicts_with = "light")]
    dark: bool,

    /// Render with the light theme
    #[arg(long = "light")]
    light: bool,

    /// Render every page, numbering the output files
    #[arg(long = "all", conflicts_with = "page")]
    all: bool,

    /// Output PNG path, or output directory when --all is given
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct InfoArgs {
    /// Path to the PDF file
    file: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long = "json")]
    json: bool,
}

#[derive(Debug, clap::Args)]
struct RecentArgs {
    /// Forget all recently opened files
    #[arg(long = "clear")]
    clear: bool,
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    width: u32,
    height: u32,
}

fn parse_viewport(raw: &str) -> Result<Viewport, String> {
    let (width, height) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {raw:?}"))?;
    let width = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid viewport width {width:?}"))?;
    let height = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid viewport height {height:?}"))?;
    Ok(Viewport { width, height })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let store = JsonSettingsStore::at_default_location()
        .ok_or_else(|| anyhow!("unable to resolve platform config directory"))?;

    match args.command {
        CliCommand::Render(render) => run_render(render, &store).await,
        CliCommand::Info(info) => run_info(info).await,
        CliCommand::Recent(recent) => run_recent(recent, &store),
    }
}

async fn run_render(args: RenderArgs, store: &JsonSettingsStore) -> Result<()> {
    let mut settings = store.load_or_default();
    let mut session = DocumentSession::new();
    session.apply_settings(&settings);

    let provider = PdfiumProvider::new()?;
    let info = session
        .load(&provider, &args.file)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;

    if let Some(value) = args.brightness {
        session.set_brightness(value);
    }
    if args.dark {
        session.set_theme(Theme::Dark);
    } else if args.light {
        session.set_theme(Theme::Light);
    }

    if let Some(zoom) = args.zoom {
        session.set_zoom(zoom, false)?;
    } else if let Some(width) = args.fit_width {
        session.fit_width(width)?;
    } else if let Some(viewport) = args.fit_page {
        session.fit_page(viewport.width, viewport.height)?;
    }

    let stem = file_stem(&args.file);
    if args.all {
        let dir = args.output.unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {dir:?}"))?;
        loop {
            let image = session.render_current_page()?;
            let path = dir.join(format!("{stem}-{:03}.png", session.current_page() + 1));
            write_png(&image, &path)?;
            println!("{}", path.display());
            if !session.next_page()? {
                break;
            }
        }
    } else {
        session.go_to_page(args.page)?;
        let image = session.render_current_page()?;
        let path = args
            .output
            .unwrap_or_else(|| PathBuf::from(format!("{stem}-{:03}.png", args.page + 1)));
        write_png(&image, &path)?;
        println!("{}", path.display());
    }

    println!("{}", format_view_status(&session.status()));

    settings.theme = session.appearance().theme;
    settings.brightness = session.appearance().brightness;
    settings.add_recent_file(&info.path);
    if let Err(err) = store.save(&settings) {
        warn!(%err, "failed to save settings");
    }
    Ok(())
}

async fn run_info(args: InfoArgs) -> Result<()> {
    let provider = PdfiumProvider::new()?;
    let mut session = DocumentSession::new();
    let info = session
        .load(&provider, &args.file)
        .await
        .with_context(|| format!("failed to open {:?}", args.file))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("{}", info.path.display());
    println!("pages: {}", info.page_count);
    for (key, value) in &info.metadata {
        println!("{key}: {value}");
    }
    if !info.outline.is_empty() {
        println!("outline:");
        for item in &info.outline {
            println!(
                "{}{} (page {})",
                "  ".repeat(item.depth + 1),
                item.title,
                item.page_index + 1
            );
        }
    }
    Ok(())
}

fn run_recent(args: RecentArgs, store: &JsonSettingsStore) -> Result<()> {
    let mut settings = store.load_or_default();
    if args.clear {
        settings.clear_recent_files();
        store.save(&settings)?;
        println!("recent files cleared");
        return Ok(());
    }
    if settings.recent_files.is_empty() {
        println!("no recent files");
        return Ok(());
    }
    for path in &settings.recent_files {
        println!("{}", path.display());
    }
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("page")
        .to_string()
}

fn write_png(image: &RenderedPage, path: &Path) -> Result<()> {
    let buffer: image::RgbImage =
        image::ImageBuffer::from_raw(image.width, image.height, image.pixels.clone())
            .ok_or_else(|| anyhow!("rendered buffer does not match its dimensions"))?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

fn format_view_status(status: &ViewStatus) -> String {
    let pixel_size = match status.pixel_size {
        Some((width, height)) => format!("{width} × {height} px"),
        None => "—".to_string(),
    };
    format!(
        "page {} — {}% — {} — {}",
        status.page_label, status.zoom_percent, pixel_size, status.message
    )
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_parsing_accepts_both_separators() {
        let viewport = parse_viewport("800x600").unwrap();
        assert_eq!((viewport.width, viewport.height), (800, 600));
        let viewport = parse_viewport("1024X768").unwrap();
        assert_eq!((viewport.width, viewport.height), (1024, 768));

        assert!(parse_viewport("800").is_err());
        assert!(parse_viewport("800xtall").is_err());
    }

    #[test]
    fn status_line_shows_placeholder_before_first_render() {
        let status = ViewStatus {
            page_label: "0/0".to_string(),
            zoom_percent: 100,
            pixel_size: None,
            message: "Ready".to_string(),
        };
        assert_eq!(format_view_status(&status), "page 0/0 — 100% — — — Ready");

        let status = ViewStatus {
            page_label: "2/5".to_string(),
            zoom_percent: 150,
            pixel_size: Some((827, 1170)),
            message: "Opened: sample.pdf".to_string(),
        };
        assert_eq!(
            format_view_status(&status),
            "page 2/5 — 150% — 827 × 1170 px — Opened: sample.pdf"
        );
    }
}
