//! Clock commands.

use {
    crate::{Cli, config::Config, session::Session},
    anyhow::{Context, Result},
    console::style,
    ctlink::ClockSample,
};

/// Read the controller clock and print it on stdout.
pub(crate) fn cmd_clock_get(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session = Session::open(cli, config)?;
    let sample = session.connector.get_clock()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&sample).context("Failed to encode clock sample")?
        );
        return Ok(());
    }

    println!("{}", sample.clock_ms);
    if let Some(context) = sample.context {
        if !cli.quiet {
            eprintln!(
                "  {} origin {:#x}, timeline {} ms, tngl {} ms",
                style("ℹ").blue(),
                context.origin_handle,
                context.timeline_clock,
                context.tngl_clock
            );
        }
    }
    Ok(())
}

/// Write `clock_ms` to the controller clock.
pub(crate) fn cmd_clock_set(cli: &Cli, config: &mut Config, clock_ms: u64) -> Result<()> {
    let session = Session::open(cli, config)?;
    session.connector.set_clock(&ClockSample::new(clock_ms))?;

    if !cli.quiet {
        eprintln!(
            "{} Clock of {} set to {clock_ms} ms",
            style("✓").green(),
            session.controller
        );
    }
    Ok(())
}
