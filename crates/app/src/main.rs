use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use waveview_core::{
    AppConfig, CacheManager, CompletionEvent, ErrorEvent, FileAudioSource, Palette, Peak, Rgb,
    Spectrogram, TaskId, TaskKind, TaskRequest, TaskScheduler, Waveform, WaveviewError,
};

#[tokio::main]
async fn main() -> waveview_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate(args) => run_generate(args).await,
    }
}

async fn run_generate(args: GenerateArgs) -> waveview_core::Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(max_concurrent) = args.max_concurrent {
        config.scheduler.max_concurrent = max_concurrent;
    }
    let width = args.width.unwrap_or(config.analysis.default_width);
    let height = args.height.unwrap_or(config.analysis.default_height);
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let cache = Arc::new(CacheManager::new(&config.cache));
    let scheduler = TaskScheduler::new(&config, cache, Arc::new(FileAudioSource::new()))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let completed = tx.clone();
    scheduler.on_complete(move |event| {
        let _ = completed.send(Outcome::Completed(event.clone()));
    });
    scheduler.on_error(move |event| {
        let _ = tx.send(Outcome::Failed(event.clone()));
    });
    scheduler.on_progress(|event| {
        tracing::debug!(resource_key = %event.resource_key, progress = event.progress, "progress");
    });

    let mut outstanding: HashMap<TaskId, OutputPaths> = HashMap::new();
    for file in &args.files {
        let paths = OutputPaths::for_source(file, args.output_dir.as_deref());
        if !args.force && paths.up_to_date(args.kind) {
            tracing::info!(file = %file.display(), "outputs exist, skipping");
            continue;
        }
        let source = file.to_string_lossy().into_owned();
        let id = scheduler.add_request(
            TaskRequest::new(source.clone(), source)
                .kind(args.kind)
                .dimensions(width, height),
        );
        outstanding.insert(id, paths);
    }

    let total = outstanding.len();
    tracing::info!(total, width, height, kind = ?args.kind, "generating");

    let mut failed = 0;
    while !outstanding.is_empty() {
        let outcome = tokio::select! {
            outcome = rx.recv() => outcome,
            _ = tokio::signal::ctrl_c() => {
                let cancelled = scheduler.cancel_all();
                tracing::warn!(cancelled, "interrupted");
                return Err(WaveviewError::msg("interrupted"));
            }
        };
        let Some(outcome) = outcome else {
            break;
        };

        match outcome {
            Outcome::Completed(event) => {
                let Some(paths) = outstanding.remove(&event.task_id) else {
                    continue;
                };
                match write_outputs(&event, &paths, args.palette) {
                    Ok(()) => tracing::info!(resource_key = %event.resource_key, "generated"),
                    Err(error) => {
                        failed += 1;
                        tracing::error!(resource_key = %event.resource_key, %error, "failed to write output");
                    }
                }
            }
            Outcome::Failed(event) => {
                if outstanding.remove(&event.task_id).is_some() {
                    failed += 1;
                    tracing::error!(resource_key = %event.resource_key, error = %event.error, "generation failed");
                }
            }
        }
    }

    if failed > 0 {
        return Err(WaveviewError::msg(format!("{failed} of {total} files failed")));
    }
    Ok(())
}

enum Outcome {
    Completed(CompletionEvent),
    Failed(ErrorEvent),
}

/// Where the artifacts of one source file are written.
#[derive(Debug, PartialEq)]
struct OutputPaths {
    waveform: PathBuf,
    spectrogram: PathBuf,
}

impl OutputPaths {
    fn for_source(source: &Path, output_dir: Option<&Path>) -> Self {
        let dir = output_dir
            .or_else(|| source.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());
        Self {
            waveform: dir.join(format!("{stem}.waveform.json")),
            spectrogram: dir.join(format!("{stem}.spectrogram.json")),
        }
    }

    fn up_to_date(&self, kind: TaskKind) -> bool {
        (!kind.wants_waveform() || self.waveform.exists())
            && (!kind.wants_spectrogram() || self.spectrogram.exists())
    }
}

#[derive(Serialize)]
struct WaveformFile<'a> {
    source: &'a str,
    width: usize,
    rms: &'a [f32],
    peaks: &'a [Peak],
}

impl<'a> WaveformFile<'a> {
    fn new(source: &'a str, waveform: &'a Waveform) -> Self {
        Self {
            source,
            width: waveform.width(),
            rms: &waveform.rms,
            peaks: &waveform.peaks,
        }
    }
}

#[derive(Serialize)]
struct SpectrogramFile<'a> {
    source: &'a str,
    width: usize,
    height: usize,
    palette: &'static str,
    /// Column-major magnitudes, row 0 is the lowest frequency.
    magnitudes: &'a [Vec<f32>],
    colors: Vec<Vec<Rgb>>,
}

impl<'a> SpectrogramFile<'a> {
    fn new(source: &'a str, spectrogram: &'a Spectrogram, palette: Palette) -> Self {
        let colors = spectrogram
            .columns
            .iter()
            .map(|column| column.iter().map(|&value| palette.color(value)).collect())
            .collect();
        Self {
            source,
            width: spectrogram.width,
            height: spectrogram.height,
            palette: palette.name(),
            magnitudes: &spectrogram.columns,
            colors,
        }
    }
}

fn write_outputs(
    event: &CompletionEvent,
    paths: &OutputPaths,
    palette: Palette,
) -> waveview_core::Result<()> {
    if let Some(waveform) = &event.artifacts.waveform {
        write_json(&paths.waveform, &WaveformFile::new(&event.resource_key, waveform))?;
    }
    if let Some(spectrogram) = &event.artifacts.spectrogram {
        write_json(
            &paths.spectrogram,
            &SpectrogramFile::new(&event.resource_key, spectrogram, palette),
        )?;
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> waveview_core::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Waveform and spectrogram generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse audio files and write waveform and spectrogram data as JSON.
    Generate(GenerateArgs),
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// WAV files to analyse.
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Artifacts to produce: waveform, spectrogram or both.
    #[arg(long = "type", default_value = "both")]
    kind: TaskKind,
    /// Output width in columns. Defaults to the configured width.
    #[arg(long)]
    width: Option<usize>,
    /// Spectrogram height in frequency rows.
    #[arg(long)]
    height: Option<usize>,
    /// Directory for the JSON files. Defaults to the directory of each input.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    /// Regenerate even when the output files already exist.
    #[arg(short, long)]
    force: bool,
    /// Colour palette for spectrogram colours: hot, grayscale or magma.
    #[arg(long, default_value = "hot")]
    palette: Palette,
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Maximum number of files processed at once.
    #[arg(long)]
    max_concurrent: Option<usize>,
}
