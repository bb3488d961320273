use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use selfcal::config::PipelineSettings;
use selfcal::controller::RUN_STAGE;
use selfcal::telemetry::{self, LOG_FILE_NAME};
use selfcal::{signals, ClusterResourceProbe, ExternalToolRunner, SelfCalController, WorkspaceManager};
use selfcal_types::{
    CalibrationParameters, CycleImageRetention, ImagingParameters, RetentionPolicy,
    RunConfiguration, DEFAULT_FINAL_CLEAN_ITERATIONS,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Direction-independent self-calibration of radio interferometric data
#[derive(Parser, Debug)]
#[command(name = "selfcal")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Alternate imaging and gain calibration over one working dataset", long_about = None)]
struct Cli {
    /// Input measurement sets; several are merged into one working dataset
    #[arg(value_name = "MS", required = true)]
    inputs: Vec<PathBuf>,

    /// Directory under which the run directory is created
    #[arg(long = "base-outdir", default_value = ".")]
    base_outdir: PathBuf,

    /// Comma-separated clean iterations, one per major cycle. Empty means
    /// no self-calibration, only the final image.
    #[arg(long = "clean-iters", default_value = "20,100,500", allow_hyphen_values = true)]
    clean_iters: String,

    /// Comma-separated zero-based cycle indices that calibrate phase only
    #[arg(long = "phase-only-cycles", default_value = "0")]
    phase_only_cycles: String,

    /// Sky model for a gain calibration before the first cycle
    #[arg(long = "initial-sky-model")]
    initial_sky_model: Option<PathBuf>,

    /// Image size in pixels
    #[arg(long = "size", num_args = 2, value_names = ["WIDTH", "HEIGHT"], default_values_t = [4096, 4096])]
    size: Vec<u32>,

    /// Pixel scale, e.g. 1asec
    #[arg(long = "scale", default_value = "1asec")]
    scale: String,

    /// Weighting: natural, uniform or "briggs <robustness>"
    #[arg(long = "weight", default_value = "uniform", allow_hyphen_values = true)]
    weight: String,

    /// Time slots per gain solution; 0 means all
    #[arg(long = "gaincal-solint", default_value_t = 1)]
    gaincal_solint: u32,

    /// Channels per gain solution; 0 means all
    #[arg(long = "gaincal-nchan", default_value_t = 0)]
    gaincal_nchan: u32,

    /// Clean iterations of the final image
    #[arg(long = "final-clean-iters", default_value_t = DEFAULT_FINAL_CLEAN_ITERATIONS)]
    final_clean_iters: u64,

    /// Keep major cycle images: always, on-failure or never
    #[arg(long = "cycle-image-retention", default_value = "always")]
    cycle_image_retention: String,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<RunConfiguration> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;

        let (width, height) = match self.size.as_slice() {
            [w, h] => (*w, *h),
            other => anyhow::bail!("--size expects WIDTH HEIGHT, got {other:?}"),
        };

        let mut config = RunConfiguration::new(
            self.inputs.iter().map(|p| absolute(&cwd, p)).collect(),
            absolute(&cwd, &self.base_outdir),
        );
        config.clean_iterations = parse_list(&self.clean_iters).context("Invalid --clean-iters")?;
        config.phase_only_cycles = parse_list::<usize>(&self.phase_only_cycles)
            .context("Invalid --phase-only-cycles")?
            .into_iter()
            .collect();
        config.initial_sky_model = self.initial_sky_model.as_deref().map(|p| absolute(&cwd, p));
        config.imaging = ImagingParameters {
            size: (width, height),
            scale: self.scale,
            weight: self.weight,
        };
        config.calibration = CalibrationParameters {
            solint: self.gaincal_solint,
            nchan: self.gaincal_nchan,
        };
        config.final_clean_iterations = self.final_clean_iters;
        config.cycle_image_retention = self.cycle_image_retention.parse::<CycleImageRetention>()?;
        Ok(config)
    }
}

/// Parse `"1,2,3"`; an empty string is an empty list.
fn parse_list<T>(raw: &str) -> anyhow::Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| anyhow::anyhow!("'{s}' is not a valid value: {e}"))
        })
        .collect()
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = PipelineSettings::from_env()?;
    let config = cli.into_config()?;
    config.validate()?;

    let mut workspace = WorkspaceManager::create_run_directory(&config.output_base)?;
    let log_path = workspace.path(LOG_FILE_NAME);
    telemetry::init(Some(&log_path))?;
    workspace.register(&log_path, RUN_STAGE, RetentionPolicy::KeepAlways);

    info!(
        run_dir = %workspace.run_dir().display(),
        inputs = config.inputs.len(),
        cycles = config.num_cycles(),
        "selfcal starting"
    );

    let cancel = CancellationToken::new();
    signals::install_shutdown_handler(cancel.clone());

    let resources = ClusterResourceProbe::from_env().probe();
    let runner = ExternalToolRunner::new(settings.termination_grace);
    let mut controller = SelfCalController::new(config, settings.tools.clone(), resources, runner);
    if let Some(image) = &settings.container_image {
        info!(image = %image.display(), "Running tools inside container");
        controller = controller.with_container_image(image.clone());
    }

    let report = controller.run(&mut workspace, &cancel).await;
    drop(workspace);

    std::process::exit(report.outcome.exit_code());
}
