use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use folio_core::config::{CacheBackend, FolioConfig};
use folio_core::core::project::AnnotationStatus;
use folio_core::core::queue::QueueProgress;
use folio_core::models::{ImagePreparation, NormalizedRect, ProjectSnapshot};
use folio_core::services::{GroupingRun, IngestInput, InputSource, Warning, Workspace};
use folio_core::{ProjectState, ProposalSet, WorkflowStage};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

#[derive(Parser, Debug)]
#[command(name = "folio", version, about = "Prepare, group and track manuscript images")]
struct Cli {
    /// JSON config file (defaults apply to anything it leaves out)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Artefact cache directory (default: the user cache dir)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Hash and derive every image under a directory
    Ingest {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Project file (created if missing)
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
    },

    /// Confirm rotation and crop for one or more images
    Prepare {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
        /// Image id (repeatable)
        #[arg(long = "image", value_name = "ID", required = true)]
        images: Vec<String>,
        /// Rotation in degrees
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        rotation: f64,
        /// Crop as fractions of the rotated image: x,y,width,height
        #[arg(long, value_parser = parse_rect, default_value = "0,0,1,1")]
        rect: NormalizedRect,
    },

    /// Propose groups with a strategy, optionally confirming them
    Group {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
        #[arg(long, value_enum)]
        strategy: Strategy,
        /// Similarity threshold for phash/profile (0..1)
        #[arg(long)]
        threshold: Option<f64>,
        /// Confirm every proposal as a group
        #[arg(long)]
        apply: bool,
    },

    /// Split a group into one group per image
    Split {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
        #[arg(long, value_name = "ID")]
        group: String,
    },

    /// Move an image to a workflow stage, dropping downstream work
    Stage {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
        #[arg(long, value_name = "ID")]
        image: String,
        /// ingested, prepared, grouped, aligned or annotated
        #[arg(long)]
        stage: WorkflowStage,
    },

    /// Summarise a project
    Status {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
    },

    /// Write an image's thumbnail to a file
    Thumbnail {
        #[arg(long, value_name = "FILE")]
        project: PathBuf,
        #[arg(long, value_name = "ID")]
        image: String,
        #[arg(long, value_name = "PATH")]
        out: PathBuf,
    },

    /// Drop every cached artefact
    ClearCache,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    Filename,
    Folder,
    Phash,
    Profile,
    Individual,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = resolve_config(cli.config.as_deref(), cli.cache_dir)?;

    match cli.command {
        Commands::Ingest { path, project } => {
            println!("▶ Scanning for images in: {}", path.display());
            let files = scan_directory(&path)?;
            if files.is_empty() {
                println!("No images found.");
                return Ok(());
            }

            let (snapshot, state) = load_project(&project)?;
            let workspace = Workspace::open(config, state)?;

            // Originals are read inside their ingest jobs, so only the
            // queue's in-flight files are held in memory at once.
            let inputs: Vec<IngestInput> = files.iter().map(|file| file_input(&path, file)).collect();

            let bar = ProgressBar::new(inputs.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let progress_bar = bar.clone();
            let progress = Arc::new(move |progress: QueueProgress| {
                progress_bar.set_position(progress.completed as u64);
                progress_bar.set_message(format!("{}%", progress.percent()));
            });

            let start = Instant::now();
            let report = workspace.ingest().ingest(inputs, Some(progress)).await?;
            bar.finish_with_message("done");

            println!(
                "✅ Ingested {} image(s) in {:.2?}: {} new, {} updated",
                report.image_ids.len(),
                start.elapsed(),
                report.added,
                report.updated
            );
            print_warnings(&report.warnings);
            save_project(&project, snapshot, &workspace).await?;
        }

        Commands::Prepare {
            project,
            images,
            rotation,
            rect,
        } => {
            let (snapshot, state) = load_project(&project)?;
            let workspace = Workspace::open(config, state)?;
            let preparation = ImagePreparation { rotation, rect };

            let report = workspace
                .prepare()
                .confirm_preparation(&images, preparation)
                .await?;

            for id in &report.prepared {
                println!("✂️  Prepared {}", id);
            }
            for id in &report.superseded {
                println!("⏭️  Superseded {}", id);
            }
            print_warnings(&report.warnings);
            save_project(&project, snapshot, &workspace).await?;
        }

        Commands::Group {
            project,
            strategy,
            threshold,
            apply,
        } => {
            let (snapshot, state) = load_project(&project)?;
            let workspace = Workspace::open(config, state)?;
            let service = workspace.grouping();

            let run: GroupingRun = match strategy {
                Strategy::Filename => service.run_filename().await,
                Strategy::Folder => service.run_leaf_folder().await,
                Strategy::Phash => service.run_phash(threshold).await?,
                Strategy::Profile => service.run_visual_profile(threshold).await,
                Strategy::Individual => service.run_individual().await,
            };

            if run.proposals.is_empty() {
                println!("No proposals.");
            }
            for (i, proposal) in run.proposals.iter().enumerate() {
                println!(
                    "\n✨ Proposal {} ({}):",
                    i + 1,
                    proposal.reason.as_deref().unwrap_or("no reason")
                );
                for id in &proposal.image_ids {
                    println!("   ▶ {}", describe_image(&workspace, id).await);
                }
            }
            print_warnings(&run.warnings);

            if apply && !run.proposals.is_empty() {
                let mut proposals = ProposalSet::new();
                let ids: Vec<String> = run.proposals.iter().map(|p| p.id.clone()).collect();
                proposals.replace(run.proposals);

                let mut confirmed = 0;
                {
                    let mut state = workspace.project().write().await;
                    for id in ids {
                        if let Some(group) = proposals.confirm(&id, &mut state) {
                            println!("🔗 Confirmed {} ({} images)", group.id, group.image_ids.len());
                            confirmed += 1;
                        }
                    }
                }
                println!("\n✅ Confirmed {} group(s)", confirmed);
                save_project(&project, snapshot, &workspace).await?;
            }
        }

        Commands::Split { project, group } => {
            let (snapshot, state) = load_project(&project)?;
            let workspace = Workspace::open(config, state)?;
            let groups = workspace.grouping().split_group(&group).await?;
            println!("✂️  Split {} into {} group(s)", group, groups.len());
            save_project(&project, snapshot, &workspace).await?;
        }

        Commands::Stage {
            project,
            image,
            stage,
        } => {
            let (snapshot, mut state) = load_project(&project)?;
            let report = state.set_stage(&image, stage)?;
            println!("🔄 {} → {}", image, stage);
            println!(
                "   groups touched: {}, deleted: {}, alignments removed: {}, annotations removed: {}",
                report.groups_touched,
                report.groups_deleted,
                report.alignments_removed,
                report.annotations_removed
            );
            write_snapshot(&project, &state.to_snapshot(snapshot))?;
        }

        Commands::Status { project } => {
            let (snapshot, state) = load_project(&project)?;
            let workspace = Workspace::open(config, state)?;
            let missing = workspace.ingest().missing_working().await;
            let state = workspace.project().read().await;

            let created = chrono::DateTime::parse_from_rfc3339(&snapshot.created_at)
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|_| snapshot.created_at.clone());
            println!("🗂️  {} (created {})", snapshot.name, created);
            println!("   images: {}", state.images().len());
            for stage in WorkflowStage::ALL {
                let count = state.images().iter().filter(|i| i.stage() == stage).count();
                if count > 0 {
                    println!("     {:<10} {}", stage.as_str(), count);
                }
            }
            println!(
                "   groups: {} ({} ungrouped images)",
                state.groups().len(),
                state.ungrouped_image_ids().len()
            );
            println!("   alignments: {}", state.alignments().len());
            let annotations = match state.annotation_status() {
                AnnotationStatus::None => "none",
                AnnotationStatus::Valid => "valid",
                AnnotationStatus::Mismatch => "mismatch",
            };
            println!("   annotations: {} ({})", state.annotations().len(), annotations);
            if !missing.is_empty() {
                println!("⚠️  {} image(s) need re-ingesting (working copy not cached)", missing.len());
            }
        }

        Commands::Thumbnail {
            project,
            image,
            out,
        } => {
            let (_, state) = load_project(&project)?;
            let hash = state
                .image(&image)
                .with_context(|| format!("Image not found: {}", image))?
                .content_hash()
                .to_string();
            let workspace = Workspace::open(config, state)?;

            let bytes = workspace
                .pipeline()
                .ensure_thumbnail(&hash)
                .await
                .with_context(|| format!("No thumbnail for {}; re-ingest its original", image))?;
            fs::write(&out, bytes).with_context(|| format!("Failed to write {}", out.display()))?;
            println!("🖼️  Wrote {}", out.display());
        }

        Commands::ClearCache => {
            let workspace = Workspace::open(config, ProjectState::new())?;
            workspace
                .pipeline()
                .cache()
                .clear()
                .context("Failed to clear artefact cache")?;
            println!("🧹 Cleared artefact cache");
        }
    }

    Ok(())
}

/// Each invocation is a fresh process, so the CLI keeps artefacts on disk
/// unless a config explicitly points somewhere else.
fn resolve_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<FolioConfig> {
    let mut config = FolioConfig::load_or_default(path)
        .with_context(|| format!("Failed to load config {:?}", path))?;

    if let Some(dir) = cache_dir {
        config.cache.backend = CacheBackend::Disk;
        config.cache.path = Some(dir);
    } else if config.cache.backend == CacheBackend::Memory || config.cache.path.is_none() {
        let dir = dirs::cache_dir()
            .map(|dir| dir.join("folio").join("artefacts"))
            .unwrap_or_else(|| PathBuf::from(".folio-cache"));
        config.cache.backend = CacheBackend::Disk;
        config.cache.path = Some(dir);
    }

    if let Some(dir) = &config.cache.path {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;
        log::debug!("Artefact cache at {}", dir.display());
    }
    Ok(config)
}

fn load_project(path: &Path) -> Result<(ProjectSnapshot, ProjectState)> {
    if !path.exists() {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        return Ok((ProjectSnapshot::new(name), ProjectState::new()));
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Could not open project file {}", path.display()))?;
    let snapshot: ProjectSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("Malformed project file {}", path.display()))?;
    let state = ProjectState::from_snapshot(snapshot.clone());
    Ok((snapshot, state))
}

async fn save_project(path: &Path, snapshot: ProjectSnapshot, workspace: &Workspace) -> Result<()> {
    let state = workspace.project().read().await;
    write_snapshot(path, &state.to_snapshot(snapshot))
}

fn write_snapshot(path: &Path, snapshot: &ProjectSnapshot) -> Result<()> {
    let serialized = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, serialized)
        .with_context(|| format!("Failed to write project file {}", path.display()))?;
    println!("💾 Saved {}", path.display());
    Ok(())
}

/// Recursively walk `dir`, returning image file paths in a stable order.
fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message("Scanning for images…");

    let mut images = Vec::new();
    for entry in WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.is_file() {
            if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                if IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
                    images.push(path.to_path_buf());
                }
            }
        }
        spinner.tick();
    }
    spinner.finish_with_message(format!("Found {} image(s)", images.len()));
    Ok(images)
}

fn file_input(root: &Path, file: &Path) -> IngestInput {
    let label = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let structural_path = file.strip_prefix(root).ok().map(|relative| {
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    });

    IngestInput {
        source: InputSource::File(file.to_path_buf()),
        label,
        structural_path,
    }
}

fn parse_rect(value: &str) -> std::result::Result<NormalizedRect, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid number in rect: {}", e))?;

    match parts.as_slice() {
        &[x, y, width, height] => Ok(NormalizedRect {
            x,
            y,
            width,
            height,
        }),
        _ => Err(format!("expected x,y,width,height, got {:?}", value)),
    }
}

async fn describe_image(workspace: &Workspace, image_id: &str) -> String {
    let state = workspace.project().read().await;
    match state.image(image_id).and_then(|image| image.label.clone()) {
        Some(label) => format!("{} ({})", image_id, label),
        None => image_id.to_string(),
    }
}

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("⚠️  {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_rect() {
        let rect = parse_rect("0.1, 0.2,0.5,0.6").unwrap();
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (0.1, 0.2, 0.5, 0.6));
        assert!(parse_rect("0,0,1").is_err());
        assert!(parse_rect("a,b,c,d").is_err());
    }

    #[test]
    fn test_file_input_uses_relative_path() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("box1").join("ms12");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("f1r.jpg");
        fs::write(&file, b"bytes").unwrap();

        let input = file_input(dir.path(), &file);
        assert_eq!(input.label.as_deref(), Some("f1r.jpg"));
        assert_eq!(input.structural_path.as_deref(), Some("box1/ms12/f1r.jpg"));
        assert!(matches!(input.source, InputSource::File(ref path) if path == &file));
    }

    #[test]
    fn test_scan_filters_extensions() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.JPG"), b"x").unwrap();
        fs::write(dir.path().join("b.txt"), b"x").unwrap();
        fs::write(dir.path().join("c.tiff"), b"x").unwrap();

        let files = scan_directory(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_missing_project_starts_empty() {
        let dir = TempDir::new().unwrap();
        let (snapshot, state) = load_project(&dir.path().join("psalter.json")).unwrap();
        assert_eq!(snapshot.name, "psalter");
        assert!(state.images().is_empty());
    }

    #[test]
    fn test_cache_dir_flag_forces_disk() {
        let dir = TempDir::new().unwrap();
        let config = resolve_config(None, Some(dir.path().join("cache"))).unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Disk);
        assert!(dir.path().join("cache").exists());
    }
}
