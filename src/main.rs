// Example runner for the `crack_vision` library: compares two photos of the
// same wall and writes the change overlay as a PNG.

use anyhow::{Context, Result, bail};
use crack_vision::ingest::{self, IngestOptions};
use crack_vision::{
    AlignmentControl, CapabilityLoader, ControllerConfig, ImageLocator, PriorityMode, SessionController,
    SessionOutput,
};
use std::env;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    let positional: Vec<&String> = args.iter().skip(1).filter(|a| !a.starts_with("--")).collect();
    if positional.len() < 3 {
        println!("Usage: crack_vision <reference_image> <current_image> <output_png> [--background]");
        return Ok(());
    }
    let reference = ImageLocator::from(positional[0].as_str());
    let current = ImageLocator::from(positional[1].as_str());
    let output_path = positional[2].clone();
    let background = args.iter().any(|a| a == "--background");

    crack_vision::logging::init_logging().context("installing log subscriber")?;

    // --- 2. Controller Initialization ---
    let config = ControllerConfig::default();
    let options = config.pipeline.ingest_options();
    let (tx, mut results) = mpsc::unbounded_channel();
    let controller = SessionController::new(Handle::current(), CapabilityLoader::global(), config, move |out| {
        let _ = tx.send(out);
    });
    if background {
        controller.set_priority_mode(PriorityMode::Background);
    }

    // --- 3. Run One Session ---
    controller.set_inputs(reference, current);
    let outcome = results.recv().await.context("controller closed without an answer")?;
    info!(status = %controller.status(), "session ended");

    // --- 4. Write The Result ---
    let frame = match outcome {
        Some(SessionOutput::Overlay(overlay)) => {
            println!("{} changed pixels", overlay.changed_pixels);
            overlay.frame
        }
        Some(SessionOutput::Reference(locator)) => {
            println!("inputs are identical, writing the reference unchanged");
            ingest::prepare(&locator, IngestOptions { reencode_quality: None, ..options })
                .await
                .with_context(|| format!("loading {locator}"))?
        }
        None => bail!("comparison failed: {}", controller.status()),
    };
    ingest::save_png(&frame, &output_path).with_context(|| format!("writing {output_path}"))?;
    println!("wrote {output_path}");
    Ok(())
}
