//! Raw bytecode commands: `execute` and `request`.

use {
    crate::{Cli, config::Config, session::Session},
    anyhow::Result,
    console::style,
    log::debug,
    std::str::FromStr,
};

/// Parse a hex operand: whitespace, `:` separators and a `0x` prefix are
/// accepted.
pub fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();

    if digits.is_empty() {
        return Err("empty hex payload".to_string());
    }
    hex::decode(&digits).map_err(|e| format!("invalid hex payload '{s}': {e}"))
}

/// A hex command-line operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl FromStr for Payload {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        parse_hex(s).map(Self)
    }
}

/// Deliver network bytecode to the connected controller.
pub(crate) fn cmd_execute(cli: &Cli, config: &mut Config, payload: &[u8]) -> Result<()> {
    let session = Session::open(cli, config)?;
    debug!("delivering {} byte(s)", payload.len());
    session.connector.deliver(payload, session.timeout)?;

    if !cli.quiet {
        eprintln!(
            "{} Delivered {} byte(s) to {}",
            style("✓").green(),
            payload.len(),
            session.controller
        );
    }
    Ok(())
}

/// Send a device request and print the response as hex on stdout.
pub(crate) fn cmd_request(
    cli: &Cli,
    config: &mut Config,
    payload: &[u8],
    no_response: bool,
) -> Result<()> {
    let session = Session::open(cli, config)?;
    let response = session
        .connector
        .request(payload, !no_response, session.timeout)?;

    match response {
        Some(bytes) => println!("{}", hex::encode(bytes)),
        None if !cli.quiet => eprintln!("{} Request sent", style("✓").green()),
        None => {},
    }
    Ok(())
}
