//! Device transport abstraction
//!
//! Wraps the native MIDI API behind [`GridTransport`] so the controller can
//! be exercised against a mock in tests. The midir implementation matches
//! ports by case-insensitive substring, which survives the numbered port
//! names Windows drivers produce.

use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{format_hex, DeviceDescriptor};

/// Raw inbound frame callback. Must not block or panic; the midir thread
/// invokes it directly.
pub type RawCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A matched input/output channel pair.
///
/// `output_name` is `None` when only an input channel matched; button
/// events still work but LED writes degrade to no-ops.
#[derive(Debug, Clone)]
pub struct PortPair {
    pub input_name: String,
    pub output_name: Option<String>,
}

/// Transport seam between the controller and the device API.
pub trait GridTransport: Send {
    /// Enumerate channel pairs whose names match the descriptor patterns.
    fn enumerate(&self, descriptor: &DeviceDescriptor) -> Result<Vec<PortPair>>;

    /// Open both directions and register the raw-message callback.
    fn open(&mut self, pair: &PortPair, on_message: RawCallback) -> Result<()>;

    /// Write one raw frame. A transport without an output channel returns
    /// success without writing.
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Unregister the callback and release both channels. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// midir-backed transport.
pub struct MidiTransport {
    client_name: String,
    input_conn: Option<MidiInputConnection<()>>,
    output_conn: Option<Arc<Mutex<MidiOutputConnection>>>,
}

impl MidiTransport {
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            input_conn: None,
            output_conn: None,
        }
    }
}

impl GridTransport for MidiTransport {
    fn enumerate(&self, descriptor: &DeviceDescriptor) -> Result<Vec<PortPair>> {
        let midi_in = MidiInput::new(&format!("{}-scan", self.client_name))
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
        let midi_out = MidiOutput::new(&format!("{}-scan", self.client_name))
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

        let inputs: Vec<String> = midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .filter(|name| descriptor.matches(name))
            .collect();
        let outputs: Vec<String> = midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .filter(|name| descriptor.matches(name))
            .collect();

        let mut pairs = Vec::new();
        for input_name in inputs {
            // Prefer the output whose name matches the input exactly,
            // falling back to any matching output
            let output_name = outputs
                .iter()
                .find(|o| **o == input_name)
                .or_else(|| outputs.first())
                .cloned();
            debug!(
                "Matched device pair: in='{}' out={:?}",
                input_name, output_name
            );
            pairs.push(PortPair {
                input_name,
                output_name,
            });
        }

        if pairs.is_empty() {
            return Err(BridgeError::DeviceNotFound {
                patterns: descriptor.name_patterns.clone(),
            });
        }
        Ok(pairs)
    }

    fn open(&mut self, pair: &PortPair, on_message: RawCallback) -> Result<()> {
        self.close();

        let midi_in = MidiInput::new(&self.client_name)
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

        let in_port = midi_in
            .ports()
            .into_iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n == pair.input_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                BridgeError::ConnectionFailed(format!(
                    "input port '{}' disappeared",
                    pair.input_name
                ))
            })?;

        info!("Opening input port: {}", pair.input_name);
        let input_conn = midi_in
            .connect(
                &in_port,
                &self.client_name,
                move |_timestamp, data, _| {
                    on_message(data);
                },
                (),
            )
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
        self.input_conn = Some(input_conn);

        match &pair.output_name {
            Some(output_name) => {
                let midi_out = MidiOutput::new(&self.client_name)
                    .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
                let out_port = midi_out
                    .ports()
                    .into_iter()
                    .find(|p| {
                        midi_out
                            .port_name(p)
                            .map(|n| &n == output_name)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        BridgeError::ConnectionFailed(format!(
                            "output port '{}' disappeared",
                            output_name
                        ))
                    })?;

                info!("Opening output port: {}", output_name);
                let output_conn = midi_out
                    .connect(&out_port, &self.client_name)
                    .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
                self.output_conn = Some(Arc::new(Mutex::new(output_conn)));
            }
            None => {
                warn!(
                    "No output channel for '{}'; LED feedback disabled, buttons still work",
                    pair.input_name
                );
            }
        }

        Ok(())
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let Some(output) = &self.output_conn else {
            // Input-only device; drop LED writes silently
            return Ok(());
        };
        output
            .lock()
            .send(bytes)
            .map_err(|e| BridgeError::ProtocolWriteFailed(e.to_string()))?;
        debug!("Sent: {}", format_hex(bytes));
        Ok(())
    }

    fn close(&mut self) {
        if self.input_conn.take().is_some() {
            debug!("Input channel released");
        }
        self.output_conn = None;
    }

    fn is_open(&self) -> bool {
        self.input_conn.is_some()
    }
}

/// Port discovery utilities for the CLI.
pub mod discovery {
    use super::*;

    pub fn list_input_ports(client_name: &str) -> Result<Vec<String>> {
        let midi_in = MidiInput::new(client_name)
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
        Ok(midi_in
            .ports()
            .iter()
            .filter_map(|p| midi_in.port_name(p).ok())
            .collect())
    }

    pub fn list_output_ports(client_name: &str) -> Result<Vec<String>> {
        let midi_out = MidiOutput::new(client_name)
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;
        Ok(midi_out
            .ports()
            .iter()
            .filter_map(|p| midi_out.port_name(p).ok())
            .collect())
    }

    /// First input/output names matching the descriptor, if any.
    pub fn find_grid_ports(descriptor: &DeviceDescriptor) -> Option<(String, Option<String>)> {
        let transport = MidiTransport::new("padbridge-discovery");
        transport
            .enumerate(descriptor)
            .ok()
            .and_then(|pairs| pairs.into_iter().next())
            .map(|p| (p.input_name, p.output_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_does_not_panic() {
        // Environment-dependent; only checks the calls are well-formed
        let _ = discovery::list_input_ports("padbridge-test");
        let _ = discovery::list_output_ports("padbridge-test");
    }

    #[test]
    fn test_send_without_output_is_noop_success() {
        let transport = MidiTransport::new("padbridge-test");
        assert!(transport.send(&[0x90, 0, 21]).is_ok());
        assert!(!transport.is_open());
    }
}
