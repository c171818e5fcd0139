//! Offline WAV renderer
//!
//! Runs a WAV file through one plugin without a controller. Native plugins
//! are probed and hosted in worker subprocesses exactly as the host does.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cuehost_core::{AudioConfig, Sample};
use cuehost_engine::{builtin, render_offline};
use cuehost_isolation::{PROBE_EXE, ProbeRunner, WORKER_EXE, sibling_executable};
use cuehost_plugin::{Plugin, PluginDescriptor, PluginFormat};
use cuehost_session::{HostFactory, IsolationMode, PluginFactory};

#[derive(Parser, Debug)]
#[command(name = "cuehost-render")]
#[command(about = "Render WAV files through an audio plugin", long_about = None)]
struct Args {
    /// Builtin id (`builtin:gain`) or plugin path
    #[arg(short, long)]
    plugin: String,

    /// Input WAV file
    #[arg(short, long, required_unless_present_any = ["inspect", "seconds"])]
    input: Option<PathBuf>,

    /// Output WAV file (32-bit float)
    #[arg(short, long, required_unless_present = "inspect")]
    output: Option<PathBuf>,

    /// Render length for instruments when there is no input file
    #[arg(long, conflicts_with = "input")]
    seconds: Option<f64>,

    /// Sample rate when there is no input file
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    #[arg(short, long, default_value_t = 512)]
    block_size: usize,

    /// Parameter value applied before rendering, as `id=value`
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(u32, f32)>,

    /// Print the descriptor and parameters instead of rendering
    #[arg(long, conflicts_with_all = ["input", "output"])]
    inspect: bool,
}

fn parse_param(s: &str) -> Result<(u32, f32), String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=value, got '{s}'"))?;
    let id = id.trim().parse().map_err(|e| format!("bad parameter id '{id}': {e}"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad parameter value '{value}': {e}"))?;
    Ok((id, value))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cuehost=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let descriptor = resolve(&args.plugin)?;
    let factory = HostFactory::new(
        IsolationMode::Subprocess,
        helper(WORKER_EXE),
        Duration::from_secs(30),
    );
    let mut plugin = factory
        .create(&descriptor)
        .with_context(|| format!("Failed to load {}", descriptor.id))?;

    if args.inspect {
        return inspect(plugin.as_mut(), &args);
    }
    render(plugin.as_mut(), &args)
}

fn helper(name: &str) -> PathBuf {
    sibling_executable(name).unwrap_or_else(|| PathBuf::from(name))
}

/// Builtin descriptor by id, or the probe's view of a plugin binary.
fn resolve(plugin: &str) -> Result<PluginDescriptor> {
    if let Some(descriptor) = builtin::descriptors()
        .into_iter()
        .find(|d| d.id == plugin || d.id.strip_prefix("builtin:") == Some(plugin))
    {
        return Ok(descriptor);
    }

    let path = Path::new(plugin);
    let format = PluginFormat::from_path(path)
        .with_context(|| format!("Not a builtin id or plugin binary: {plugin}"))?;
    ProbeRunner::new(helper(PROBE_EXE), Duration::from_secs(30))
        .probe(path, format)
        .with_context(|| format!("Failed to probe {}", path.display()))
}

fn inspect(plugin: &mut dyn Plugin, args: &Args) -> Result<()> {
    let config = AudioConfig::new(
        args.sample_rate,
        args.block_size,
        plugin.descriptor().input_channels,
        plugin.descriptor().output_channels,
    );
    // Some plugins only report parameters once initialized.
    plugin
        .initialize(&config)
        .context("Failed to initialize plugin")?;

    let d = plugin.descriptor().clone();
    println!("Plugin Information:");
    println!("  Id:        {}", d.id);
    println!("  Name:      {}", d.name);
    println!("  Vendor:    {}", d.vendor);
    println!("  Version:   {}", d.version);
    println!("  Channels:  {} in, {} out", d.input_channels, d.output_channels);
    println!("  Editor:    {}", if d.has_editor { "yes" } else { "no" });
    println!();

    let parameters = plugin.parameters();
    if parameters.is_empty() {
        println!("No parameters available.");
    }
    for param in &parameters {
        println!("  [{:3}] {}", param.id, param.name);
        println!("        Range:   {:.3} to {:.3}", param.min_value, param.max_value);
        println!("        Default: {:.3}", param.default_value);
        match plugin.get_parameter(param.id) {
            Ok(value) => println!("        Current: {value:.3}"),
            Err(e) => println!("        Current: <unavailable> ({e})"),
        }
    }
    plugin.shutdown();
    Ok(())
}

fn render(plugin: &mut dyn Plugin, args: &Args) -> Result<()> {
    let d = plugin.descriptor().clone();
    let (sample_rate, source) = match &args.input {
        Some(path) => read_wav(path)?,
        None => {
            let seconds = args.seconds.unwrap_or(1.0).max(0.0);
            let frames = (seconds * f64::from(args.sample_rate)) as usize;
            (args.sample_rate, vec![vec![0.0; frames]])
        }
    };
    let frame_count = source.first().map_or(0, Vec::len);

    // File channels are reused round-robin when the plugin wants more.
    let inputs: Vec<Vec<Sample>> = (0..d.input_channels)
        .map(|ch| source[ch % source.len()].clone())
        .collect();

    let config = AudioConfig::new(
        sample_rate,
        args.block_size,
        d.input_channels,
        d.output_channels,
    );
    config.validate()?;
    plugin
        .initialize(&config)
        .context("Failed to initialize plugin")?;
    for &(id, value) in &args.params {
        let applied = plugin
            .set_parameter(id, value)
            .with_context(|| format!("Failed to set parameter {id}"))?;
        tracing::info!("Parameter {id} = {applied}");
    }
    plugin.activate().context("Failed to activate plugin")?;

    tracing::info!(
        "Rendering {frame_count} frames through {} ({} in, {} out)",
        d.name,
        d.input_channels,
        d.output_channels
    );
    let outputs = render_offline(plugin, &config, &inputs, frame_count)?;
    plugin.suspend().ok();
    plugin.shutdown();

    let output = args.output.as_ref().context("No output file given")?;
    write_wav(output, sample_rate, &outputs)?;
    tracing::info!("Wrote {}", output.display());
    Ok(())
}

/// Read a WAV file into per-channel float buffers.
fn read_wav(path: &Path) -> Result<(u32, Vec<Vec<Sample>>)> {
    let mut reader = WavReader::open(path)
        .with_context(|| format!("Failed to open input file: {}", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("Failed to read float samples")?,
        SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|sample| sample as f32 / scale))
                .collect::<Result<_, _>>()
                .context("Failed to read integer samples")?
        }
    };

    let channels = usize::from(spec.channels.max(1));
    let mut split = vec![Vec::with_capacity(interleaved.len() / channels); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (buffer, &sample) in split.iter_mut().zip(frame) {
            buffer.push(sample);
        }
    }
    Ok((spec.sample_rate, split))
}

fn write_wav(path: &Path, sample_rate: u32, channels: &[Vec<Sample>]) -> Result<()> {
    let spec = WavSpec {
        channels: u16::try_from(channels.len().max(1)).context("Too many output channels")?,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create output file: {}", path.display()))?;

    let frames = channels.first().map_or(0, Vec::len);
    for frame in 0..frames {
        for channel in channels {
            writer
                .write_sample(channel[frame])
                .context("Failed to write sample")?;
        }
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}
