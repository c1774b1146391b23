//! # Dyna CLI
//!
//! Command-line interface for delay buffers and step-function compilation.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dyna_core::Variable;
use dyna_delay::{BeforeT0, DelayBuffer, DelayStep, SharedContext, UpdateMethod};
use dyna_jit::{Interpreter, Jit, Member, ModelSpec, Runner};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dyna")]
#[command(version)]
#[command(about = "Delay buffers and compiled step functions for dynamical systems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a ramp through a delay and print the delayed reads
    Delay {
        /// Initial target values, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "0")]
        values: Vec<f64>,
        /// Number of stored past steps
        #[arg(short, long, default_value_t = 3)]
        length: usize,
        /// Lag of the printed entry, in steps
        #[arg(long, default_value_t = 1)]
        lag: i64,
        /// rotate or concat
        #[arg(short, long, default_value = "rotate", value_parser = parse_method)]
        method: UpdateMethod,
        /// Value reported for steps before the start
        #[arg(long, default_value_t = 0.0)]
        before_t0: f64,
        /// Number of steps to simulate
        #[arg(short, long, default_value_t = 5)]
        steps: usize,
    },

    /// Analyze step methods of a model and print the rewritten functions
    Jit {
        /// Model description (JSON)
        model: PathBuf,
        /// Only this node; every node reachable from the root otherwise
        #[arg(short, long)]
        node: Option<String>,
        /// Log generated source at info level
        #[arg(long)]
        show_code: bool,
    },

    /// Run a model for a number of steps and print the final states
    Run {
        /// Model description (JSON)
        model: PathBuf,
        #[arg(short, long, default_value_t = 100)]
        steps: usize,
        /// Evaluate the original step methods without compiling them
        #[arg(long)]
        no_jit: bool,
    },
}

fn parse_method(s: &str) -> Result<UpdateMethod, String> {
    s.parse().map_err(|e: dyna_delay::DelayError| e.to_string())
}

fn load(path: &Path) -> anyhow::Result<ModelSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    ModelSpec::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Delay {
            values,
            length,
            lag,
            method,
            before_t0,
            steps,
        } => delay(values, length, lag, method, before_t0, steps)?,
        Commands::Jit {
            model,
            node,
            show_code,
        } => jit(&model, node.as_deref(), show_code)?,
        Commands::Run {
            model,
            steps,
            no_jit,
        } => run(&model, steps, no_jit)?,
    }

    Ok(())
}

fn delay(
    values: Vec<f64>,
    length: usize,
    lag: i64,
    method: UpdateMethod,
    before_t0: f64,
    steps: usize,
) -> anyhow::Result<()> {
    let initial = ArrayD::from_shape_vec(vec![values.len()], values)?;
    let target = Variable::new("x", initial.clone());
    let buffer = DelayBuffer::new(&target, length, BeforeT0::Scalar(before_t0), method)?;

    let mut ctx = SharedContext::new();
    ctx.save("x_delay", buffer)?;
    ctx.register_entry("x_delay", "lagged", None, Some(DelayStep::Scalar(lag)))?;

    println!(
        "{} length={} method={} lag={}",
        "Delay:".green().bold(),
        length,
        method.to_string().cyan(),
        lag
    );
    println!("{:>6}  {:<28}  {}", "step", "current", "delayed");
    for k in 0..steps {
        ctx.advance();
        target.assign(&initial.mapv(|x| x + k as f64))?;
        ctx.update()?;
        let delayed = ctx.at("x_delay", "lagged", None)?;
        println!(
            "{:>6}  {:<28}  {}",
            k + 1,
            format!("{}", target.snapshot()),
            format!("{delayed}").yellow()
        );
    }
    Ok(())
}

fn jit(path: &Path, node: Option<&str>, show_code: bool) -> anyhow::Result<()> {
    let mut spec = load(path)?;
    spec.settings.show_code |= show_code;
    let model = spec.build()?;
    let mut jit = Jit::new(Interpreter, model.settings)?;

    let nodes = match node {
        Some(name) => vec![model
            .graph
            .find(name)
            .with_context(|| format!("no node named {name}"))?],
        None => model.graph.reachable(model.root)?,
    };

    for id in nodes {
        let name = model.graph.name(id)?.to_string();
        let methods: Vec<String> = model
            .graph
            .node(id)?
            .members
            .iter()
            .filter(|(_, m)| matches!(m, Member::Method(_) | Member::Integrator(_)))
            .map(|(k, _)| k.clone())
            .collect();
        for method in methods {
            let result = jit.analyze(&model.graph, id, &method)?;
            println!("{} {}.{}", "Function:".green().bold(), name, method.cyan());
            if result.hoisted_arguments.is_empty() {
                println!("  no hoisted arguments");
            }
            for (arg, expr) in &result.argument_to_source_expression {
                println!("  {} <- {}", arg.yellow(), expr);
            }
            match &result.source {
                Some(source) => println!("{source}"),
                None => println!("  {}", "unchanged".dimmed()),
            }
            println!();
        }
    }
    Ok(())
}

fn run(path: &Path, steps: usize, no_jit: bool) -> anyhow::Result<()> {
    let mut model = load(path)?.build()?;
    let mut runner = if no_jit {
        Runner::uncompiled(&model.graph, model.root)?
    } else {
        let mut jit = Jit::new(Interpreter, model.settings)?;
        Runner::new(&mut jit, &model.graph, model.root)?
    };
    info!(steps, methods = runner.len(), compiled = !no_jit, "running");

    let bar = ProgressBar::new(steps as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})")?
            .progress_chars("=>-"),
    );
    runner.run(&model.graph, &mut model.context, steps, |k| bar.set_position(k as u64))?;
    bar.finish_and_clear();

    println!("{} {} steps", "Finished:".green().bold(), runner.executed());
    for id in model.graph.reachable(model.root)? {
        let name = model.graph.name(id)?;
        for (member, value) in &model.graph.node(id)?.members {
            if let Member::State(variable) = value {
                println!("  {}.{} = {}", name, member.cyan(), variable.snapshot());
            }
        }
    }
    Ok(())
}
