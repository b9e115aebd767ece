//! `update` command: OTA firmware update with a progress bar.

use {
    crate::{Cli, CliError, config::Config, session::Session, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    ctlink::{ConnectorEvent, OtaStatus},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::debug,
    std::{
        fs,
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc::{Receiver, RecvTimeoutError},
        },
        thread,
        time::Duration,
    },
};

fn progress_bar(cli: &Cli, size: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb.set_message(format!("{size} bytes"));
    pb
}

/// Follow OTA events until the session ends or `done` is raised.
fn track_progress(events: &Receiver<ConnectorEvent>, pb: &ProgressBar, done: &AtomicBool) {
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(ConnectorEvent::OtaProgress(percent)) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                pb.set_position(percent.clamp(0.0, 100.0) as u64);
            },
            Ok(ConnectorEvent::OtaStatus(status)) => {
                debug!("{status}");
                if status != OtaStatus::Begin {
                    return;
                }
            },
            Ok(_) => {},
            Err(RecvTimeoutError::Timeout) => {
                if done.load(Ordering::SeqCst) {
                    return;
                }
            },
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Push `firmware` to the connected controller.
pub(crate) fn cmd_update(cli: &Cli, config: &mut Config, firmware: &Path) -> Result<()> {
    let image = fs::read(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;
    if image.is_empty() {
        return Err(CliError::Usage(format!("firmware {} is empty", firmware.display())).into());
    }

    let session = Session::open(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Updating {} with {} ({} bytes)",
            style("📦").cyan(),
            session.controller,
            firmware.display(),
            image.len()
        );
    }

    let pb = progress_bar(cli, image.len());
    let events = session.connector.events();
    let done = AtomicBool::new(false);

    let result = thread::scope(|scope| {
        let (pb_ref, done_ref) = (&pb, &done);
        scope.spawn(move || track_progress(&events, pb_ref, done_ref));
        let result = session.connector.update_firmware(&image);
        done.store(true, Ordering::SeqCst);
        result
    });

    match result {
        Ok(()) => {
            pb.finish_with_message("done");
            if !cli.quiet {
                eprintln!("\n{} Firmware update completed", style("🎉").green().bold());
            }
            Ok(())
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(e).context("Firmware update failed")
        },
    }
}
