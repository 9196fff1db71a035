//! 16550-flavored UART, transmit and line-status only. Output accumulates
//! in a buffer the host can drain; optionally echoed to stdout as it
//! arrives.

use std::collections::VecDeque;
use std::io::Write;

pub const UART0_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;
pub const UART0_IRQ: u32 = 10;

// Register offsets
const RBR: u64 = 0x00; // receiver buffer (read)
const THR: u64 = 0x00; // transmitter holding (write)
const LSR: u64 = 0x05; // line status

const LSR_DR: u8 = 1 << 0;
const LSR_THRE: u8 = 1 << 5;

pub struct Uart {
    input: VecDeque<u8>,
    output: Vec<u8>,
    pub echo: bool,
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

impl Uart {
    pub fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: Vec::new(),
            echo: false,
        }
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    /// Everything transmitted since the last drain.
    pub fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn read(&mut self, offset: u64) -> u8 {
        match offset {
            RBR => self.input.pop_front().unwrap_or(0),
            LSR => {
                let dr = if self.input.is_empty() { 0 } else { LSR_DR };
                dr | LSR_THRE
            }
            _ => 0,
        }
    }

    pub fn write(&mut self, offset: u64, value: u8) {
        if offset == THR {
            self.output.push(value);
            if self.echo {
                let _ = std::io::stdout().write_all(&[value]);
                let _ = std::io::stdout().flush();
            }
        }
    }
}
