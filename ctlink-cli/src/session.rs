//! Connector session wiring.
//!
//! Builds the link context, resolves the connector through the registry,
//! selects a controller and connects. Dropping the session disconnects and
//! tears the context down.

use {
    crate::{
        Cli, CliError, ConnectorArg,
        config::Config,
        serial::{SerialOptions, offer_to_remember, select_serial_port},
        was_interrupted,
    },
    anyhow::{Context as _, Result},
    ctlink::{
        ClockSample, Connection, Connector, ConnectorEvent, ConnectorKind, ConnectorRegistry,
        ControllerInfo, DetectedPort, Engine, LinkContext, NetworkDefinition, SelectionCriteria,
        SerialConnector, SimulatedConnector,
        connector::serial::{PortLister, native_opener},
    },
    log::{debug, info},
    std::{
        fs,
        path::Path,
        sync::{Arc, mpsc::Receiver},
        time::Duration,
    },
};

/// Default selection/connect timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Host-side engine for a command-line session.
///
/// Inbound bytecode and clock pushes are logged; device requests are
/// answered with an empty response.
#[derive(Debug, Default)]
pub struct LoggingEngine;

impl Engine for LoggingEngine {
    fn execute(&self, bytes: &[u8], source: &Connection) -> ctlink::Result<()> {
        info!("execute from {source}: {}", hex::encode(bytes));
        Ok(())
    }

    fn request(&self, bytes: &[u8], source: &Connection) -> ctlink::Result<Vec<u8>> {
        info!("request from {source}: {}", hex::encode(bytes));
        Ok(Vec::new())
    }

    fn synchronize(&self, sample: &ClockSample, source: &Connection) -> ctlink::Result<()> {
        info!("clock from {source}: {} ms", sample.clock_ms);
        Ok(())
    }
}

/// A connected controller.
pub struct Session {
    ctx: Arc<LinkContext>,
    /// The connector in use.
    pub connector: Box<dyn Connector>,
    /// Events subscribed before connecting.
    pub events: Receiver<ConnectorEvent>,
    /// The connected controller.
    pub controller: ControllerInfo,
    /// Selection, connect and exchange timeout.
    pub timeout: Duration,
}

impl Session {
    /// Select and connect according to the CLI flags and configuration.
    pub fn open(cli: &Cli, config: &mut Config) -> Result<Self> {
        let kind = resolve_kind(cli, config)?;
        let timeout = Duration::from_millis(
            cli.timeout
                .or(config.connection.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        );

        let link = config.link_config(cli.baud);
        debug!("link configuration: {link:?}");
        let ctx = Arc::new(
            LinkContext::new(Arc::new(LoggingEngine), link).with_interrupt_checker(was_interrupted),
        );
        ctx.init();

        let mut registry = ConnectorRegistry::with_defaults();
        let mut criteria = Vec::new();
        match kind {
            ConnectorKind::Serial => {
                let port = choose_port(cli, config)?;
                criteria.push(SelectionCriteria::by_address(port.name.clone()));
                let lister: PortLister = Arc::new(move || vec![port.clone()]);
                registry.register(ConnectorKind::Serial, move |ctx| {
                    Ok(Box::new(SerialConnector::with_backend(
                        ctx,
                        native_opener(),
                        Arc::clone(&lister),
                    )))
                });
            },
            ConnectorKind::Simulated => {
                let network = cli
                    .network
                    .as_deref()
                    .or(config.connection.network.as_deref())
                    .map(load_network)
                    .transpose()?;
                if let Some(network) = network {
                    registry.register(ConnectorKind::Simulated, move |ctx| {
                        Ok(Box::new(SimulatedConnector::with_network(
                            ctx,
                            network.clone(),
                        )?))
                    });
                }
                if let Some(name) = &cli.port {
                    criteria.push(SelectionCriteria::by_name(name.clone()));
                }
            },
            ConnectorKind::Wireless => {},
        }

        let connector = registry.create(kind, Arc::clone(&ctx))?;
        let events = connector.events();

        connector
            .auto_select(&criteria, timeout)
            .context("Failed to select a controller")?;
        let controller = connector
            .connect(timeout)
            .context("Failed to connect")?;
        info!("Connected to {controller}");

        Ok(Self {
            ctx,
            connector,
            events,
            controller,
            timeout,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connector.disconnect();
        self.connector.destroy();
        self.ctx.teardown();
    }
}

/// Connector kind from `--connector`, then the config file, then serial.
pub fn resolve_kind(cli: &Cli, config: &Config) -> Result<ConnectorKind> {
    if let Some(arg) = cli.connector {
        return Ok(match arg {
            ConnectorArg::Serial => ConnectorKind::Serial,
            ConnectorArg::Simulated => ConnectorKind::Simulated,
        });
    }
    match &config.connection.connector {
        Some(name) => name
            .parse()
            .map_err(|e: ctlink::Error| CliError::Config(e.to_string()).into()),
        None => Ok(ConnectorKind::Serial),
    }
}

/// Read and validate a simulated network definition.
pub fn load_network(path: &Path) -> Result<NetworkDefinition> {
    let text = fs::read_to_string(path).map_err(|e| {
        CliError::Config(format!(
            "cannot read network definition {}: {e}",
            path.display()
        ))
    })?;
    let network: NetworkDefinition = serde_json::from_str(&text).map_err(|e| {
        CliError::Config(format!(
            "invalid network definition {}: {e}",
            path.display()
        ))
    })?;
    network
        .validate()
        .map_err(|e| CliError::Config(e.to_string()))?;
    Ok(network)
}

fn choose_port(cli: &Cli, config: &mut Config) -> Result<DetectedPort> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let choice = select_serial_port(&options, config)?;

    if !choice.is_known && !cli.non_interactive {
        offer_to_remember(&choice.port, config)?;
    }

    Ok(choice.port)
}
