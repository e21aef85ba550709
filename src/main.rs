use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use log::{error, warn};

use truthlens::clip::ClipEncoder;
use truthlens::config::PipelineConfig;
use truthlens::explain::{ExplanationProvider, LocalProvider, RemoteProvider};
use truthlens::logging;
use truthlens::pipeline::Analyzer;

const USAGE: &str = "\
Usage: truthlens [OPTIONS] <IMAGE>...

Classify images as real or AI-generated, render saliency overlays and
write plain-text forensic reports.

Options:
  --config <PATH>   Load settings from PATH instead of the default locations
  --color <NAME>    Overlay highlight color: red, green or blue
  --output <DIR>    Root directory for overlays and reports
  --offline         Skip the remote narrator, keep the local one
  --no-explain      Skip narration entirely
  -h, --help        Print this message";

#[derive(Debug)]
struct CliArgs {
    config_path: Option<PathBuf>,
    color: Option<String>,
    output: Option<PathBuf>,
    offline: bool,
    no_explain: bool,
    help: bool,
    images: Vec<PathBuf>,
}

impl CliArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut parsed = CliArgs {
            config_path: None,
            color: None,
            output: None,
            offline: false,
            no_explain: false,
            help: false,
            images: Vec::new(),
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    parsed.config_path = Some(PathBuf::from(expect_value(&mut args, "--config")?));
                }
                "--color" => parsed.color = Some(expect_value(&mut args, "--color")?),
                "--output" => {
                    parsed.output = Some(PathBuf::from(expect_value(&mut args, "--output")?));
                }
                "--offline" => parsed.offline = true,
                "--no-explain" => parsed.no_explain = true,
                "-h" | "--help" => {
                    parsed.help = true;
                    return Ok(parsed);
                }
                other if other.starts_with('-') => {
                    return Err(format!("unknown option `{other}`"));
                }
                other => parsed.images.push(PathBuf::from(other)),
            }
        }

        if parsed.images.is_empty() {
            return Err("no input images given".to_string());
        }
        Ok(parsed)
    }
}

fn expect_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let args = CliArgs::parse(env::args().skip(1)).unwrap_or_else(|msg| {
        eprintln!("{msg}\n\n{USAGE}");
        process::exit(2);
    });
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    run(args)
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    let mut config =
        PipelineConfig::load(args.config_path.as_deref()).context("loading configuration")?;
    if let Some(color) = args.color {
        config.overlay.color = color;
    }
    if let Some(output) = args.output {
        config.output.root = output;
    }

    let providers = build_providers(&config, args.offline, args.no_explain);

    let encoder = ClipEncoder::load(&config.model).context("loading the CLIP model")?;
    let analyzer =
        Analyzer::new(Box::new(encoder), config).context("preparing the analyzer")?;

    let mut failures = 0usize;
    for image in &args.images {
        match analyzer.run(image, &providers) {
            Ok((analysis, report_path)) => {
                let verdict = &analysis.evidence.classification;
                println!(
                    "{}: {} ({:.1}% confidence)",
                    image.display(),
                    verdict.label,
                    verdict.probability * 100.0
                );
                if let Some(path) = &analysis.evidence.overlay_path {
                    println!("  overlay: {}", path.display());
                }
                println!("  report:  {}", report_path.display());
            }
            Err(err) => {
                error!("{}: {err}", image.display());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} image(s) failed", args.images.len());
    }
    Ok(())
}

fn build_providers(
    config: &PipelineConfig,
    offline: bool,
    no_explain: bool,
) -> Vec<Box<dyn ExplanationProvider>> {
    if no_explain {
        return Vec::new();
    }
    let mut providers: Vec<Box<dyn ExplanationProvider>> = Vec::new();
    if !offline {
        match RemoteProvider::new(&config.explain) {
            Ok(provider) => providers.push(Box::new(provider)),
            Err(err) => warn!("remote narrator unavailable: {err}"),
        }
    }
    match LocalProvider::new(&config.explain) {
        Ok(provider) => providers.push(Box::new(provider)),
        Err(err) => warn!("local narrator unavailable: {err}"),
    }
    providers
}
