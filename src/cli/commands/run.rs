//! Run command - compute one transformation from files

use crate::checksum::Checksum;
use crate::cli::args::RunArgs;
use crate::config::Config;
use crate::error::{CommuneError, CommuneResult};
use crate::instance::Instance;
use crate::job::bash::CODE_PIN;
use crate::transformation::{OutputPin, Pin, Transformation};
use serde_json::json;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Celltype of input pins read from files
const INPUT_CELLTYPE: &str = "text";

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> CommuneResult<()> {
    let mut config = config.clone();
    args.node.apply(&mut config);

    let instance = Instance::start(&config).await?;
    let outcome = compute(&instance, &args).await;
    instance.shutdown();
    let (result, buffer) = outcome?;

    if let Some(path) = &args.output {
        fs::write(path, &buffer)
            .await
            .map_err(|e| CommuneError::io(format!("writing result to {}", path.display()), e))?;
        info!("Wrote {} bytes to {}", buffer.len(), path.display());
    }
    println!("{}", result);
    Ok(())
}

async fn compute(instance: &Instance, args: &RunArgs) -> CommuneResult<(Checksum, Vec<u8>)> {
    let tf = build_transformation(instance, args).await?;
    let cache = instance.cache();

    let (checksum, consumer) = cache.register_transformation(tf, None).await?;
    debug!("Transformation checksum {}", checksum);
    let result = cache.run_transformation(checksum).await;
    if result.is_err() {
        if let Some(log) = cache.execution_log(&checksum) {
            eprintln!("{}", log);
        }
    }
    cache.release_transformation(checksum, &consumer);
    let result = result?;

    let buffer = instance
        .buffer(result)
        .await?
        .ok_or_else(|| CommuneError::User(format!("Result buffer {} is not available", result)))?;
    Ok((result, buffer))
}

async fn build_transformation(instance: &Instance, args: &RunArgs) -> CommuneResult<Transformation> {
    let code = instance.put_buffer(read(&args.code).await?).await?;
    let mut tf = Transformation::new(OutputPin::new("result", "text"))
        .with_language(args.language.as_str())
        .with_pin(CODE_PIN, Pin::new(args.language.as_str(), code));

    for (name, path) in &args.input {
        if name == CODE_PIN || tf.pins.contains_key(name) {
            return Err(CommuneError::User(format!("Duplicate input pin '{}'", name)));
        }
        let checksum = instance.put_buffer(read(path).await?).await?;
        tf = tf.with_pin(name.as_str(), Pin::new(INPUT_CELLTYPE, checksum));
    }

    if args.local {
        tf = tf.with_meta(json!({ "local": true }));
    } else if args.remote_only {
        tf = tf.with_meta(json!({ "local": false }));
    }
    Ok(tf)
}

async fn read(path: &Path) -> CommuneResult<Vec<u8>> {
    fs::read(path)
        .await
        .map_err(|e| CommuneError::io(format!("reading {}", path.display()), e))
}
