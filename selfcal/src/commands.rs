//! Structured command lines for the imager and the calibrator.
//!
//! Commands are kept as data until launch so that launch-form changes
//! (multi-node `mpirun`, container execution) can be layered on as
//! [`CommandModifier`]s instead of string surgery.
//!
//! Rendering order is `<executable> <flags> <options> <positional>`, with
//! flags and options sorted by name.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use selfcal_types::{CalibrationParameters, ImagingParameters};

use crate::config::ToolSettings;

/// Mount point of host paths inside the container.
pub const CONTAINER_MOUNT_ROOT: &str = "/mnt";

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
    List(Vec<ArgValue>),
}

impl ArgValue {
    fn render_scalar(&self) -> String {
        match self {
            ArgValue::Text(s) => s.clone(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(f) => f.to_string(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Path(p) => p.to_string_lossy().into_owned(),
            ArgValue::List(items) => items
                .iter()
                .map(ArgValue::render_scalar)
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    fn map_paths<F>(self, f: &mut F) -> Self
    where
        F: FnMut(PathBuf) -> PathBuf,
    {
        match self {
            ArgValue::Path(p) => ArgValue::Path(f(p)),
            ArgValue::List(items) => {
                ArgValue::List(items.into_iter().map(|item| item.map_paths(f)).collect())
            }
            other => other,
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<u64> for ArgValue {
    fn from(value: u64) -> Self {
        ArgValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<&Path> for ArgValue {
    fn from(value: &Path) -> Self {
        ArgValue::Path(value.to_path_buf())
    }
}

impl From<PathBuf> for ArgValue {
    fn from(value: PathBuf) -> Self {
        ArgValue::Path(value)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(values: Vec<T>) -> Self {
        ArgValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// How options are spelled on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStyle {
    /// `-key value [value…]`
    Imager,
    /// `key=value`, lists as `key=[a,b]`
    Calibrator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub executable: String,
    pub style: CommandStyle,
    pub flags: BTreeSet<String>,
    pub options: BTreeMap<String, ArgValue>,
    pub positional: Vec<ArgValue>,
}

impl ToolCommand {
    pub fn new(executable: impl Into<String>, style: CommandStyle) -> Self {
        Self {
            executable: executable.into(),
            style,
            flags: BTreeSet::new(),
            options: BTreeMap::new(),
            positional: Vec::new(),
        }
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.insert(flag.into());
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn render(&self) -> Vec<String> {
        let mut argv = vec![self.executable.clone()];
        argv.extend(self.flags.iter().cloned());
        for (key, value) in &self.options {
            self.render_option(key, value, &mut argv);
        }
        argv.extend(self.positional.iter().map(ArgValue::render_scalar));
        argv
    }

    fn render_option(&self, key: &str, value: &ArgValue, argv: &mut Vec<String>) {
        match (self.style, value) {
            (CommandStyle::Imager, ArgValue::List(items)) => {
                argv.push(key.to_string());
                argv.extend(items.iter().map(ArgValue::render_scalar));
            }
            (CommandStyle::Imager, scalar) => {
                argv.push(key.to_string());
                argv.push(scalar.render_scalar());
            }
            (CommandStyle::Calibrator, ArgValue::List(_)) => {
                argv.push(format!("{key}=[{}]", value.render_scalar()));
            }
            (CommandStyle::Calibrator, scalar) => {
                argv.push(format!("{key}={}", scalar.render_scalar()));
            }
        }
    }

    /// Rewrite every path argument with `f`.
    pub fn map_paths<F>(mut self, mut f: F) -> Self
    where
        F: FnMut(PathBuf) -> PathBuf,
    {
        self.positional = self
            .positional
            .into_iter()
            .map(|v| v.map_paths(&mut f))
            .collect();
        self.options = self
            .options
            .into_iter()
            .map(|(k, v)| (k, v.map_paths(&mut f)))
            .collect();
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render().join(" "))
    }
}

/// Changes how a command is launched: edits the command and returns the
/// arguments to put in front of it.
pub trait CommandModifier: Send + Sync + fmt::Debug {
    /// Lower values are applied first.
    fn order(&self) -> u8;

    fn apply(&self, command: ToolCommand) -> (Vec<String>, ToolCommand);
}

/// Distribute an imager run over `nodes` nodes, one frequency band per node.
#[derive(Debug, Clone)]
pub struct Mpirun {
    pub nodes: u32,
    pub launcher: String,
    pub imager_mp: String,
}

impl Mpirun {
    pub fn new(nodes: u32, tools: &ToolSettings) -> Self {
        Self {
            nodes,
            launcher: tools.mpirun.clone(),
            imager_mp: tools.imager_mp.clone(),
        }
    }
}

impl CommandModifier for Mpirun {
    fn order(&self) -> u8 {
        0
    }

    fn apply(&self, command: ToolCommand) -> (Vec<String>, ToolCommand) {
        if command.style != CommandStyle::Imager || self.nodes <= 1 {
            return (Vec::new(), command);
        }

        let mut command = command
            .option("-channels-out", self.nodes)
            .option("-fit-spectral-pol", 1_i64)
            .option("-deconvolution-channels", 1_i64)
            .flag("-join-channels");
        command.executable = self.imager_mp.clone();

        let prefix = vec![
            self.launcher.clone(),
            "-np".to_string(),
            self.nodes.to_string(),
            "-npernode".to_string(),
            "1".to_string(),
        ];
        (prefix, command)
    }
}

/// Run a command inside a container image, bind-mounting the directories of
/// every path argument under [`CONTAINER_MOUNT_ROOT`].
#[derive(Debug, Clone)]
pub struct ContainerExec {
    pub runtime: String,
    pub image: PathBuf,
}

impl ContainerExec {
    pub fn new(runtime: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
        }
    }
}

impl CommandModifier for ContainerExec {
    fn order(&self) -> u8 {
        1
    }

    fn apply(&self, command: ToolCommand) -> (Vec<String>, ToolCommand) {
        let mut binds: BTreeSet<(String, String)> = BTreeSet::new();
        let command = command.map_paths(|path| {
            let path = absolute(path);
            let dir = path.parent().unwrap_or(&path).to_string_lossy().into_owned();
            binds.insert((dir.clone(), format!("{CONTAINER_MOUNT_ROOT}{dir}")));
            PathBuf::from(format!("{CONTAINER_MOUNT_ROOT}{}", path.to_string_lossy()))
        });

        let mut prefix = vec![self.runtime.clone(), "exec".to_string()];
        for (host, target) in binds {
            prefix.push("--bind".to_string());
            prefix.push(format!("{host}:{target}"));
        }
        prefix.push(self.image.to_string_lossy().into_owned());
        (prefix, command)
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

/// A command ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    /// Executable of the wrapped tool, after modifiers (e.g. `wsclean-mp`)
    pub tool: String,
    /// Full argument vector; `argv[0]` is the program actually spawned
    pub argv: Vec<String>,
}

/// Apply `modifiers` in ascending order and render the result.
pub fn render_with_modifiers(
    command: ToolCommand,
    modifiers: &[Box<dyn CommandModifier>],
) -> RenderedCommand {
    let mut ordered: Vec<&dyn CommandModifier> = modifiers.iter().map(|m| m.as_ref()).collect();
    ordered.sort_by_key(|m| m.order());

    let mut prefix = Vec::new();
    let mut command = command;
    for modifier in ordered {
        let (extra, modified) = modifier.apply(command);
        prefix.extend(extra);
        command = modified;
    }

    let tool = command.executable.clone();
    prefix.extend(command.render());
    RenderedCommand { tool, argv: prefix }
}

// ============================================================================
// Builders
// ============================================================================

/// Imaging run writing `<name>-*.fits` next to the run's temporary files.
pub fn imaging_command(
    tools: &ToolSettings,
    dataset: &Path,
    temp_dir: &Path,
    name: &Path,
    niter: u64,
    params: &ImagingParameters,
) -> ToolCommand {
    let weight: Vec<&str> = params.weight.split_whitespace().collect();
    let weight = match weight.as_slice() {
        [single] => ArgValue::from(*single),
        many => ArgValue::from(many.to_vec()),
    };

    ToolCommand::new(&tools.imager, CommandStyle::Imager)
        .option("-temp-dir", temp_dir)
        .option("-name", name)
        .option("-niter", niter)
        .option("-size", vec![params.size.0, params.size.1])
        .option("-scale", params.scale.as_str())
        .option("-weight", weight)
        .option("-gridder", "wgridder")
        .option("-auto-threshold", 3_i64)
        .option("-mgain", 0.8)
        .option("-parallel-deconvolution", 2048_i64)
        .arg(dataset)
}

fn gaincal_base(
    tools: &ToolSettings,
    dataset: &Path,
    caltype: &str,
    params: &CalibrationParameters,
    threads: u32,
) -> ToolCommand {
    ToolCommand::new(&tools.calibrator, CommandStyle::Calibrator)
        .option("numthreads", threads)
        .option("msin", dataset)
        .option("msout", dataset)
        .option("msout.overwrite", true)
        .option("steps", vec!["gaincal"])
        .option("gaincal.caltype", caltype)
        .option("gaincal.maxiter", 50_i64)
        .option("gaincal.solint", params.solint)
        .option("gaincal.nchan", params.nchan)
        .option("gaincal.tolerance", 1e-3)
        .option("gaincal.applysolution", true)
}

/// Self-calibration against the model column the imager just wrote. The
/// working dataset is overwritten in place.
pub fn gaincal_command(
    tools: &ToolSettings,
    dataset: &Path,
    caltype: &str,
    params: &CalibrationParameters,
    threads: u32,
) -> ToolCommand {
    gaincal_base(tools, dataset, caltype, params, threads).option("gaincal.usemodelcolumn", true)
}

/// Calibration against an external sky model, before the first cycle.
pub fn initial_gaincal_command(
    tools: &ToolSettings,
    dataset: &Path,
    sky_model: &Path,
    params: &CalibrationParameters,
    threads: u32,
) -> ToolCommand {
    gaincal_base(tools, dataset, "diagonal", params, threads)
        .option("gaincal.sourcedb", sky_model)
        .option("gaincal.propagatesolutions", false)
        .option("gaincal.usebeammodel", true)
        .option("gaincal.usechannelfreq", true)
}

/// Concatenate several sub-band datasets into `output`.
pub fn merge_command(tools: &ToolSettings, inputs: &[PathBuf], output: &Path) -> ToolCommand {
    ToolCommand::new(&tools.calibrator, CommandStyle::Calibrator)
        .option("msin", inputs.to_vec())
        .option("msout", output)
        .option("steps", ArgValue::List(Vec::new()))
}
