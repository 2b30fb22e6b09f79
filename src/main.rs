use anyhow::{Context as _, Result};
use clap::Parser;
use log::info;
use std::{fs, io::Read, path};

use affine_compose::config::ComposeConfig;
use affine_compose::context::Context;
use affine_compose::program::{Pass, Program};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Levels of producers inlined by a single composition step
    #[arg(long, default_value_t = ComposeConfig::default().max_apply_depth)]
    max_apply_depth: usize,

    /// Composition steps attempted before giving up on an apply
    #[arg(long, default_value_t = ComposeConfig::default().max_compose_iterations)]
    max_iterations: usize,

    #[command(subcommand)]
    pass: PassArg,
}

#[derive(clap::Subcommand)]
enum PassArg {
    #[command(about = "Fully compose every apply with its producers, then canonicalize")]
    Compose { input: Option<path::PathBuf> },
    #[command(about = "Canonicalize every apply without composing producers")]
    Canonicalize { input: Option<path::PathBuf> },
    #[command(about = "Fold every apply to an operand or a constant where possible")]
    Fold { input: Option<path::PathBuf> },
}

fn read_input(input: Option<&path::Path>) -> Result<String> {
    match input {
        Some(p) => fs::read_to_string(p).with_context(|| format!("reading {}", p.display())),
        None => {
            let mut src = String::new();
            std::io::stdin()
                .read_to_string(&mut src)
                .context("reading standard input")?;
            Ok(src)
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = ComposeConfig {
        max_apply_depth: args.max_apply_depth,
        max_compose_iterations: args.max_iterations,
    };
    let (pass, input) = match &args.pass {
        PassArg::Compose { input } => (Pass::Compose, input),
        PassArg::Canonicalize { input } => (Pass::Canonicalize, input),
        PassArg::Fold { input } => (Pass::Fold, input),
    };

    let src = read_input(input.as_deref())?;
    let ctx = Context::new();
    let program = Program::parse(&ctx, &src)?;
    info!(
        "parsed {} values, {} applies",
        program.values().len(),
        program.applies().len()
    );

    let start_time = std::time::Instant::now();
    let lines = program.run(pass, &config)?;
    info!("{pass:?} took {:?}", start_time.elapsed());
    info!(
        "context holds {} expressions and {} maps",
        ctx.num_uniqued_exprs(),
        ctx.num_uniqued_maps()
    );
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
