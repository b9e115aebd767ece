//! Controller monitor command implementation.
//!
//! Prints controller log lines on stdout and link events on stderr until
//! Ctrl+C or the link drops.

use {
    crate::{Cli, clear_interrupted_flag, config::Config, session::Session, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    ctlink::{ConnectorEvent, format_log_line, monitor::timestamp_now},
    std::{
        fs::{File, OpenOptions},
        io::{self, Write as _},
        path::Path,
        sync::mpsc::RecvTimeoutError,
        time::Duration,
    },
};

/// How one event is shown.
#[derive(Debug, PartialEq)]
enum Rendered {
    /// Controller output for stdout.
    Log(String),
    /// Link status for stderr.
    Status(String),
}

fn render(event: &ConnectorEvent, timestamp: bool) -> Rendered {
    match event {
        ConnectorEvent::ControllerLog(line) => Rendered::Log(format_log_line(line, timestamp)),
        ConnectorEvent::Connected => Rendered::Status("link up".to_string()),
        ConnectorEvent::Disconnected => Rendered::Status("link down".to_string()),
        ConnectorEvent::PeerConnected(mac) => Rendered::Status(format!("peer {mac} joined")),
        ConnectorEvent::PeerDisconnected(mac) => Rendered::Status(format!("peer {mac} left")),
        ConnectorEvent::OtaStatus(status) => Rendered::Status(status.to_string()),
        ConnectorEvent::OtaProgress(percent) => {
            Rendered::Status(format!("ota_progress: {percent:.2}%"))
        },
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Run the monitor.
pub(crate) fn cmd_monitor(
    cli: &Cli,
    config: &mut Config,
    timestamp: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    let mut log_writer = log_file.map(open_log_file).transpose()?;

    clear_interrupted_flag();
    let session = Session::open(cli, config)?;

    eprintln!(
        "{} Monitoring {}",
        style("📡").cyan(),
        style(&session.controller).green()
    );
    eprintln!("{}", style("Press Ctrl+C to exit").dim());

    let mut stdout = io::stdout();
    while !was_interrupted() {
        let event = match session.events.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let (Some(writer), ConnectorEvent::ControllerLog(line)) = (log_writer.as_mut(), &event) {
            writeln!(writer, "[{}] {}", timestamp_now(), line.trim_end())
                .context("Failed to write log file")?;
        }

        match render(&event, timestamp) {
            Rendered::Log(line) => {
                writeln!(stdout, "{line}").ok();
                stdout.flush().ok();
            },
            Rendered::Status(text) => eprintln!("{} {}", style("•").dim(), style(text).dim()),
        }

        if event == ConnectorEvent::Disconnected {
            break;
        }
    }

    if !cli.quiet {
        eprintln!("\n{}", style("Monitor closed").dim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, ctlink::OtaStatus, ctlink::MacAddress};

    #[test]
    fn test_render_log_line_plain() {
        let event = ConnectorEvent::ControllerLog("booted\r\n".to_string());
        assert_eq!(render(&event, false), Rendered::Log("booted".to_string()));
    }

    #[test]
    fn test_render_log_line_timestamped() {
        let event = ConnectorEvent::ControllerLog("tick".to_string());
        match render(&event, true) {
            Rendered::Log(line) => assert!(line.ends_with("tick") && line.contains('[')),
            Rendered::Status(_) => panic!("log line rendered as status"),
        }
    }

    #[test]
    fn test_render_status_events() {
        let mac = MacAddress([1, 2, 3, 4, 5, 6]);
        assert_eq!(
            render(&ConnectorEvent::PeerConnected(mac), false),
            Rendered::Status("peer 01:02:03:04:05:06 joined".to_string())
        );
        assert_eq!(
            render(&ConnectorEvent::OtaStatus(OtaStatus::Success), false),
            Rendered::Status("ota_status: success".to_string())
        );
        assert_eq!(
            render(&ConnectorEvent::OtaProgress(12.5), false),
            Rendered::Status("ota_progress: 12.50%".to_string())
        );
    }
}
