//! The I/O port layer.
//!
//! Handlers are keyed by the exact 16-bit port address the executing
//! instruction computes (no masking). Ports without a registered
//! handler read as 0xFF and silently swallow writes, which is how an
//! undriven Z80 data bus behaves.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;

pub type InputHandler = Box<dyn FnMut() -> Result<u8>>;
pub type OutputHandler = Box<dyn FnMut(u8) -> Result<()>>;

/// Byte read from a port nobody drives.
pub const OPEN_BUS: u8 = 0xFF;

#[derive(Default)]
pub struct Ports {
    inputs: HashMap<u16, InputHandler>,
    outputs: HashMap<u16, OutputHandler>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input(&mut self, port: u16, handler: impl FnMut() -> Result<u8> + 'static) {
        self.inputs.insert(port, Box::new(handler));
    }

    pub fn register_output(
        &mut self,
        port: u16,
        handler: impl FnMut(u8) -> Result<()> + 'static,
    ) {
        self.outputs.insert(port, Box::new(handler));
    }

    /// IN: invoke the handler registered at `port`, or float the bus.
    pub fn input(&mut self, port: u16) -> Result<u8> {
        match self.inputs.get_mut(&port) {
            Some(handler) => handler(),
            None => Ok(OPEN_BUS),
        }
    }

    /// OUT: invoke the handler registered at `port`, or discard.
    pub fn output(&mut self, port: u16, value: u8) -> Result<()> {
        match self.outputs.get_mut(&port) {
            Some(handler) => handler(value),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
