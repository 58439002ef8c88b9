mod cli;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Error, Result};
use clap::Parser;
use log::debug;

use cli::{Cli, Command};
use mnist_export::{
    export_images_of, export_images_with_labels, export_labels, ExportError, Summary,
};

const SUCCESS: u8 = 0;
const FAILURE: u8 = 1;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let stdout = io::stdout();
    ExitCode::from(execute(&cli, &mut stdout.lock()))
}

/// Run the selected export, print its report to `out` and return the
/// process exit status.
fn execute<W: Write>(cli: &Cli, out: &mut W) -> u8 {
    let summary = match run(cli) {
        Ok(summary) => summary,
        Err(err) => return fail(cli, out, &err),
    };
    // Report lines on a closed stdout are lost either way.
    let _ = writeln!(out, "{summary}");

    if let Some(path) = &cli.summary_json {
        if let Err(err) = write_summary_json(&summary, path)
            .with_context(|| format!("writing summary to {}", path.display()))
        {
            return fail(cli, out, &err);
        }
    }
    SUCCESS
}

fn fail<W: Write>(cli: &Cli, out: &mut W, err: &Error) -> u8 {
    debug!("{err:?}");
    let message = match err.downcast_ref::<ExportError>() {
        Some(export) => export.report_line(),
        None => format!("An error occurred: {err:#}"),
    };
    let _ = writeln!(out, "{message}");
    if cli.exit_zero {
        SUCCESS
    } else {
        FAILURE
    }
}

fn run(cli: &Cli) -> Result<Summary> {
    let summary = match &cli.command {
        Command::Labels { output } => export_labels(&cli.input, output)?.into(),
        Command::Images { output, subset } => {
            export_images_of(&cli.input, output, subset.into_selection())?.into()
        }
        Command::Pairs { output } => export_images_with_labels(&cli.input, output)?.into(),
    };
    Ok(summary)
}

fn write_summary_json(summary: &Summary, path: &Path) -> Result<()> {
    let file = File::create(path).context("creating file")?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary).context("serializing JSON")?;
    writer.flush().context("flushing file")?;
    Ok(())
}
