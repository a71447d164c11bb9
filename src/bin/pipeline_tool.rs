//! pipeline_tool - inspect and edit stored pipeline definitions
//!
//! Works directly on the pipeline directory used by visiond. Edits made here
//! are picked up by tasks started afterwards; running tasks keep their live
//! instance.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use provider_vision::{
    DetectionResult, DeviceConfig, DeviceHandle, DeviceKind, MoveDirection, ParamValue, Pipeline,
    PipelineStore, StageFactory, SyntheticDevice,
};

#[derive(Parser, Debug)]
#[command(name = "pipeline_tool", version, about = "Manage vision pipeline definitions")]
struct Args {
    /// Directory holding `<name>.json` pipeline definitions.
    #[arg(long, env = "VISION_PIPELINE_DIR", default_value = "pipelines")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored pipelines
    List,

    /// List available stage types and their parameters
    Stages,

    /// Print a pipeline definition as JSON
    Show { name: String },

    /// Create an empty pipeline (no-op if it exists)
    Create { name: String },

    /// Delete a pipeline
    Erase { name: String },

    /// Copy a pipeline under a new name
    Copy { from: String, to: String },

    /// Insert a stage (appends when --position is omitted)
    AddStage {
        name: String,
        stage_type: String,
        #[arg(long)]
        position: Option<usize>,
    },

    /// Remove the stage at INDEX
    RemoveStage { name: String, index: usize },

    /// Move the stage at INDEX one step up or down
    MoveStage {
        name: String,
        index: usize,
        /// `up` or `down`
        direction: String,
    },

    /// Set a stage parameter
    SetParam {
        name: String,
        index: usize,
        param: String,
        value: String,
    },

    /// Enable the stage at INDEX
    Enable { name: String, index: usize },

    /// Disable the stage at INDEX
    Disable { name: String, index: usize },

    /// Run the pipeline once on a synthetic frame and print the results
    Run {
        name: String,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 48)]
        height: u32,
        /// Stage index whose output to describe instead of the final frame
        #[arg(long)]
        observer: Option<usize>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = PipelineStore::open(&args.dir)?;
    let factory = Arc::new(StageFactory::with_builtin_stages());

    match args.command {
        Command::List => {
            for name in store.list()? {
                let def = store.load(&name)?;
                println!("{} ({} stages)", name, def.stages.len());
            }
        }
        Command::Stages => {
            for type_name in factory.list() {
                let stage = factory.create(&type_name)?;
                let params: Vec<String> = stage
                    .schema()
                    .iter()
                    .map(|spec| match (spec.min, spec.max) {
                        (Some(min), Some(max)) => {
                            format!("{}={} [{}..{}]", spec.name, spec.default, min, max)
                        }
                        _ => format!("{}={}", spec.name, spec.default),
                    })
                    .collect();
                println!("{} {}", type_name, params.join(" "));
            }
        }
        Command::Show { name } => {
            let def = store.load(&name)?;
            println!("{}", serde_json::to_string_pretty(&def)?);
        }
        Command::Create { name } => {
            if store.create(&name)? {
                println!("created {}", name);
            } else {
                println!("{} already exists", name);
            }
        }
        Command::Erase { name } => {
            store.erase(&name)?;
            println!("erased {}", name);
        }
        Command::Copy { from, to } => {
            store.copy(&from, &to)?;
            println!("copied {} to {}", from, to);
        }
        Command::AddStage {
            name,
            stage_type,
            position,
        } => {
            let index = edit(&store, &factory, &name, |p| {
                Ok(p.add_stage(&stage_type, position)?)
            })?;
            println!("{}: {} at {}", name, stage_type, index);
        }
        Command::RemoveStage { name, index } => {
            edit(&store, &factory, &name, |p| Ok(p.remove_stage(index)?))?;
            println!("{}: removed stage {}", name, index);
        }
        Command::MoveStage {
            name,
            index,
            direction,
        } => {
            let direction = MoveDirection::from_name(&direction)
                .ok_or_else(|| anyhow!("direction must be 'up' or 'down'"))?;
            let to = edit(&store, &factory, &name, |p| Ok(p.move_stage(index, direction)?))?;
            println!("{}: stage {} moved to {}", name, index, to);
        }
        Command::SetParam {
            name,
            index,
            param,
            value,
        } => {
            edit(&store, &factory, &name, |p| {
                let spec = p
                    .schema(index)?
                    .into_iter()
                    .find(|spec| spec.name == param)
                    .ok_or_else(|| anyhow!("stage {} has no parameter '{}'", index, param))?;
                let parsed = ParamValue::parse_as(&value, &spec.default).ok_or_else(|| {
                    anyhow!("'{}' is not a valid {}", value, spec.default.type_name())
                })?;
                Ok(p.set_parameter(index, &param, parsed)?)
            })?;
            println!("{}: stage {} {}={}", name, index, param, value);
        }
        Command::Enable { name, index } => {
            edit(&store, &factory, &name, |p| Ok(p.set_stage_enabled(index, true)?))?;
        }
        Command::Disable { name, index } => {
            edit(&store, &factory, &name, |p| Ok(p.set_stage_enabled(index, false)?))?;
        }
        Command::Run {
            name,
            width,
            height,
            observer,
        } => run_once(&store, &factory, &name, width, height, observer)?,
    }
    Ok(())
}

/// Load, apply one edit, save.
fn edit<T, F>(store: &PipelineStore, factory: &Arc<StageFactory>, name: &str, f: F) -> Result<T>
where
    F: FnOnce(&Pipeline) -> Result<T>,
{
    let pipeline = Pipeline::from_definition(&store.load(name)?, factory.clone())?;
    let out = f(&pipeline)?;
    store.save(&pipeline.to_definition()?)?;
    Ok(out)
}

fn run_once(
    store: &PipelineStore,
    factory: &Arc<StageFactory>,
    name: &str,
    width: u32,
    height: u32,
    observer: Option<usize>,
) -> Result<()> {
    let pipeline = Pipeline::from_definition(&store.load(name)?, factory.clone())?;
    pipeline.set_observer(observer)?;

    let config = DeviceConfig::new("synthetic", DeviceKind::Still).with_size(width, height);
    let device = DeviceHandle::new(config, Box::new(SyntheticDevice::new()));
    device.open()?;
    device.set_streaming(true)?;
    let frame = device.next_frame()?;
    device.close()?;

    let out = pipeline.run(&frame)?;
    let shown = if observer.is_some() { &out.observed } else { &out.output };
    println!(
        "{}: {}x{} {:?}, failed stages {:?}",
        name,
        shown.width(),
        shown.height(),
        shown.format(),
        out.failed_stages
    );
    println!("{}", DetectionResult::encode_list(&out.detections));
    Ok(())
}
