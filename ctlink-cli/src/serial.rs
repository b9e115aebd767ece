//! Choosing the gateway port for the serial connector.
//!
//! An explicit `--port` (or `connection.serial` in the config file) is used
//! as given. Otherwise detected ports are filtered down to recognised USB
//! bridges, plus any the user asked to remember, and the user picks one
//! when more than one remains.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    ctlink::{DetectedPort, device},
    dialoguer::{Confirm, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::{self, IsTerminal},
};

/// Flags that shape port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    pub port: Option<String>,
    /// Offer unrecognised ports too.
    pub list_all_ports: bool,
    /// Never prompt; fail when the choice is ambiguous.
    pub non_interactive: bool,
    /// Prompt even when a single recognised port was found.
    pub confirm_port: bool,
}

/// A port and whether it was recognised, either by its bridge chip or by
/// a remembered USB id.
#[derive(Debug, Clone)]
pub struct PortChoice {
    pub port: DetectedPort,
    pub is_known: bool,
}

impl PortChoice {
    fn new(port: DetectedPort, config: &Config) -> Self {
        Self {
            is_known: is_known_device(&port, config),
            port,
        }
    }
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

/// Pick the port to open.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<PortChoice> {
    choose(device::detect_ports(), options, config)
}

fn choose(ports: Vec<DetectedPort>, options: &SerialOptions, config: &Config) -> Result<PortChoice> {
    if let Some(name) = &options.port {
        return Ok(named_port(ports, name, config));
    }
    if let Some(name) = &config.connection.serial {
        debug!("Port {name} from configuration");
        return Ok(named_port(ports, name, config));
    }
    if ports.is_empty() {
        return Err(CliError::DeviceNotFound("no serial ports found".to_string()).into());
    }

    let mut candidates: Vec<PortChoice> = ports
        .into_iter()
        .map(|port| PortChoice::new(port, config))
        .collect();
    if !options.list_all_ports && candidates.iter().any(|c| c.is_known) {
        candidates.retain(|c| c.is_known);
    }
    candidates.sort_by_key(|c| !c.is_known);

    if candidates.len() > 1 {
        if options.non_interactive {
            return Err(CliError::Usage(
                "multiple serial ports found; pass --port in non-interactive mode".to_string(),
            )
            .into());
        }
        require_terminal()?;
        return prompt_for_port(candidates);
    }

    let Some(only) = candidates.pop() else {
        return Err(CliError::DeviceNotFound("no serial ports found".to_string()).into());
    };
    if options.non_interactive || (only.is_known && !options.confirm_port) {
        info!("Using {}", only.port.describe());
        return Ok(only);
    }
    require_terminal()?;
    confirm_port(only)
}

/// The detected port called `name`, matched exactly and then ignoring
/// case. A name nothing reports is still opened as given.
fn named_port(ports: Vec<DetectedPort>, name: &str, config: &Config) -> PortChoice {
    let index = ports
        .iter()
        .position(|p| p.name == name)
        .or_else(|| ports.iter().position(|p| p.name.eq_ignore_ascii_case(name)));
    match index.and_then(|i| ports.into_iter().nth(i)) {
        Some(port) => PortChoice::new(port, config),
        None => PortChoice {
            port: DetectedPort::plain(name),
            is_known: false,
        },
    }
}

fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    port.bridge.is_known()
        || matches!(
            (port.vid, port.pid),
            (Some(vid), Some(pid)) if config.is_remembered(vid, pid)
        )
}

fn require_terminal() -> Result<()> {
    if io::stdin().is_terminal() && io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage("port selection needs an interactive terminal; pass --port".to_string()).into())
    }
}

fn prompt_failed(err: dialoguer::Error) -> anyhow::Error {
    match err {
        dialoguer::Error::IO(e) if e.kind() == io::ErrorKind::Interrupted => cancelled(),
        dialoguer::Error::IO(e) => CliError::Usage(format!("port prompt failed: {e}")).into(),
    }
}

fn port_label(choice: &PortChoice) -> String {
    let line = choice.port.describe();
    if choice.is_known {
        style(line).bold().to_string()
    } else {
        line
    }
}

fn prompt_for_port(candidates: Vec<PortChoice>) -> Result<PortChoice> {
    eprintln!(
        "{} {} serial ports, recognised gateways first",
        style("ℹ").blue(),
        candidates.len()
    );

    // One line per item even in narrow terminals
    let width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = candidates
        .iter()
        .map(|c| console::truncate_str(&port_label(c), width, "\u{2026}").into_owned())
        .collect();

    let picked = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Which port is the gateway?")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(prompt_failed)?;

    picked
        .and_then(|i| candidates.into_iter().nth(i))
        .ok_or_else(cancelled)
}

fn confirm_port(choice: PortChoice) -> Result<PortChoice> {
    let accepted = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", choice.port.describe()))
        .default(true)
        .interact_opt()
        .map_err(prompt_failed)?;
    if accepted == Some(true) {
        Ok(choice)
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognised port's USB id so later runs pick it
/// without asking.
pub fn offer_to_remember(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.is_remembered(vid, pid) {
        return Ok(());
    }

    let accepted = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} as a gateway?"))
        .default(false)
        .interact_opt()
        .map_err(prompt_failed)?;
    if accepted == Some(true) {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Could not save the USB id: {e:#}");
        }
    }
    Ok(())
}
